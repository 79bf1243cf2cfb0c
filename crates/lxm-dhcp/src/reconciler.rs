use crate::dnsmasq::{DhcpService, extract_block, parse_block, render_block, splice_block};
use anyhow::{Context, Result};
use lxm_core::{
    EngineResult, ReconciliationReport, RecordState, ResourceClass, RuleStore, Snapshotter,
    StaticLease, atomic_write,
};
use similar::TextDiff;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps the managed static-lease block of the dnsmasq config in
/// agreement with the rule store, then reloads the DHCP service. Every
/// pass is a full rewrite of the managed block; a rejected reload
/// rolls the file back to the snapshot taken in the same pass, so the
/// live config is never left in a partially-desired state.
pub struct LeaseReconciler {
    store: Arc<dyn RuleStore>,
    service: DhcpService,
    conf_path: PathBuf,
    snapshotter: Snapshotter,
    lock: Mutex<()>,
}

impl LeaseReconciler {
    pub fn new(
        store: Arc<dyn RuleStore>,
        service: DhcpService,
        conf_path: impl Into<PathBuf>,
        snapshotter: Snapshotter,
    ) -> Self {
        Self {
            store,
            service,
            conf_path: conf_path.into(),
            snapshotter,
            lock: Mutex::new(()),
        }
    }

    pub async fn reconcile(&self) -> EngineResult<ReconciliationReport> {
        self.run().await
    }

    /// The managed block is rewritten wholesale on every pass, so a
    /// full resync is the same operation as an incremental one.
    pub async fn resync(&self) -> EngineResult<ReconciliationReport> {
        self.run().await
    }

    /// Leases currently present in the managed block, for diagnostics.
    pub async fn current_leases(&self) -> Result<Vec<(String, String, Ipv4Addr)>> {
        parse_block(&self.read_conf()?)
    }

    fn read_conf(&self) -> Result<String> {
        match std::fs::read_to_string(&self.conf_path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {:?}", self.conf_path))
            }
        }
    }

    async fn run(&self) -> EngineResult<ReconciliationReport> {
        let _guard = self.lock.lock().await;
        let mut report = ReconciliationReport::new(ResourceClass::Dhcp);

        let leases = self.store.list_active_leases().await?;
        let desired = self.partition_address_claims(leases, &mut report).await?;
        let desired_block = render_block(&desired);

        let current = self.read_conf()?;
        let current_block = extract_block(&current)
            .with_context(|| format!("refusing to rewrite {:?}", self.conf_path))?;

        if current_block == desired_block {
            // Converged: no write, no reload.
            self.mark_applied(&desired).await?;
            self.store.purge_lease_tombstones().await?;
            tracing::debug!(conf = ?self.conf_path, "dhcp config already converged");
            return Ok(report);
        }

        let new_content = splice_block(&current, &desired_block)?;

        let snapshot = self.snapshotter.snapshot_before(&self.conf_path)?;
        atomic_write(&self.conf_path, new_content.as_bytes())?;

        let old_lines: HashSet<&String> = current_block.iter().collect();
        let new_lines: HashSet<&String> = desired_block.iter().collect();
        report.added = desired_block.iter().filter(|l| !old_lines.contains(l)).count();
        report.removed = current_block.iter().filter(|l| !new_lines.contains(l)).count();

        tracing::info!(
            conf = ?self.conf_path,
            "rewrote managed lease block:\n{}",
            render_diff(&current_block, &desired_block)
        );

        match self.service.reload().await {
            Ok(()) => {
                self.mark_applied(&desired).await?;
                self.store.purge_lease_tombstones().await?;
            }
            Err(reload_err) => {
                tracing::error!(
                    conf = ?self.conf_path,
                    error = %reload_err,
                    "dhcp service rejected the new config; rolling back"
                );
                // Restore failure is fatal: propagate ConfigCorruption.
                self.snapshotter.restore(&snapshot, &self.conf_path)?;

                report.added = 0;
                report.removed = 0;
                let msg = format!("reload rejected, config rolled back: {}", reload_err);
                for lease in &desired {
                    self.store
                        .mark_lease_state(
                            &lease.container_name,
                            RecordState::Failed,
                            Some(msg.clone()),
                        )
                        .await?;
                    report.record_failure(lease.container_name.clone(), msg.clone());
                }
            }
        }

        tracing::info!(%report, "dhcp reconciliation pass finished");
        Ok(report)
    }

    async fn mark_applied(&self, leases: &[StaticLease]) -> Result<()> {
        for lease in leases {
            if lease.state != RecordState::Applied {
                self.store
                    .mark_lease_state(&lease.container_name, RecordState::Applied, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Exclude leases that claim an address another active lease also
    /// claims, marking all claimants failed. The store's validation
    /// prevents this; seeing it means the store was edited by hand.
    async fn partition_address_claims(
        &self,
        leases: Vec<StaticLease>,
        report: &mut ReconciliationReport,
    ) -> EngineResult<Vec<StaticLease>> {
        let mut by_ip: HashMap<Ipv4Addr, Vec<StaticLease>> = HashMap::new();
        for lease in leases {
            by_ip.entry(lease.ip_address).or_default().push(lease);
        }

        let mut desired = vec![];
        for (ip, mut claimants) in by_ip {
            if claimants.len() == 1 {
                if let Some(lease) = claimants.pop() {
                    desired.push(lease);
                }
                continue;
            }
            let names: Vec<String> = claimants
                .iter()
                .map(|l| l.container_name.clone())
                .collect();
            let msg = format!(
                "integrity violation: leases [{}] all claim address {}",
                names.join(", "),
                ip
            );
            tracing::error!(%ip, "{}", msg);
            for lease in &claimants {
                self.store
                    .mark_lease_state(&lease.container_name, RecordState::Failed, Some(msg.clone()))
                    .await?;
                report.record_failure(lease.container_name.clone(), msg.clone());
            }
        }
        Ok(desired)
    }
}

fn render_diff(current: &[String], desired: &[String]) -> String {
    let current = current.join("\n");
    let desired = desired.join("\n");
    let diff = TextDiff::from_lines(&current, &desired);

    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => '-',
            similar::ChangeTag::Insert => '+',
            similar::ChangeTag::Equal => ' ',
        };
        out.push(sign);
        out.push_str(change.value());
    }
    out
}
