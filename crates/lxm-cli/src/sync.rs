use lxm_core::{EngineResult, ReconciliationReport, ResourceClass};
use lxm_dhcp::LeaseReconciler;
use lxm_fw::DnatReconciler;
use std::sync::Arc;

/// Runs the full resync that makes the rule store, not the kernel,
/// the source of truth after a restart, crash, or manual tampering.
pub struct Synchronizer {
    fw: Arc<DnatReconciler>,
    dhcp: Arc<LeaseReconciler>,
}

impl Synchronizer {
    pub fn new(fw: Arc<DnatReconciler>, dhcp: Arc<LeaseReconciler>) -> Self {
        Self { fw, dhcp }
    }

    /// Full resync of both resource classes. They touch disjoint OS
    /// resources, so they run concurrently; each is serialized
    /// internally against other passes of its own class.
    pub async fn startup_resync(
        &self,
    ) -> EngineResult<(ReconciliationReport, ReconciliationReport)> {
        tracing::info!("startup resync: converging live state to the rule store");
        let (fw, dhcp) = tokio::join!(self.fw.resync(), self.dhcp.resync());
        Ok((fw?, dhcp?))
    }

    pub async fn reconcile_now(&self, class: ResourceClass) -> EngineResult<ReconciliationReport> {
        match class {
            ResourceClass::Firewall => self.fw.reconcile().await,
            ResourceClass::Dhcp => self.dhcp.reconcile().await,
        }
    }
}
