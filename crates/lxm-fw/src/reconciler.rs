use crate::chain::ChainManager;
use anyhow::Result;
use lxm_core::{
    EngineResult, PortForwardRule, ReconciliationReport, RecordState, ResourceClass, RuleSpec,
    RuleStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Brings the managed chain's live DNAT rules into agreement with the
/// rule store. Passes are serialized by an internal mutex; once a pass
/// starts mutating the kernel it runs to completion, recording
/// per-rule failures rather than aborting.
pub struct DnatReconciler {
    store: Arc<dyn RuleStore>,
    chain: ChainManager,
    lock: Mutex<()>,
}

impl DnatReconciler {
    pub fn new(store: Arc<dyn RuleStore>, chain: ChainManager) -> Self {
        Self {
            store,
            chain,
            lock: Mutex::new(()),
        }
    }

    /// Incremental pass: apply only the desired/live delta.
    pub async fn reconcile(&self) -> EngineResult<ReconciliationReport> {
        self.run(false).await
    }

    /// Full resync: flush the managed chain first (unless already
    /// converged), so the final state depends only on the store.
    pub async fn resync(&self) -> EngineResult<ReconciliationReport> {
        self.run(true).await
    }

    /// Normalized live rules, for diagnostics.
    pub async fn managed_chain_state(&self) -> Result<Vec<RuleSpec>> {
        self.chain.list_managed_rules().await
    }

    async fn run(&self, full: bool) -> EngineResult<ReconciliationReport> {
        let _guard = self.lock.lock().await;
        let mut report = ReconciliationReport::new(ResourceClass::Firewall);

        self.chain.ensure_chain().await?;

        let rules = self.store.list_active_rules().await?;
        let tombstones = self.store.list_rule_tombstones().await?;
        let desired = self.partition_claims(rules, &mut report).await?;
        let desired_set: HashSet<RuleSpec> = desired.keys().cloned().collect();

        let state = self.chain.read_chain().await?;
        let mut live: HashSet<RuleSpec> = state.rules.iter().cloned().collect();

        // Already converged: no duplicates in the chain, nothing
        // foreign, live set equals desired set. A resync then makes
        // zero kernel mutations.
        let converged = state.foreign_lines == 0
            && state.rules.len() == live.len()
            && live == desired_set;

        if full && !converged {
            self.chain.flush_managed_chain().await?;
            report.removed += state.rules.len() + state.foreign_lines;
            live.clear();
        }

        // Removals first, so an external port being reassigned never
        // transiently collides with its new target.
        let mut failed_removals: HashSet<RuleSpec> = HashSet::new();
        let to_remove: Vec<RuleSpec> = live.difference(&desired_set).cloned().collect();
        for spec in to_remove {
            match self.chain.delete_rule(&spec).await {
                Ok(()) => {
                    live.remove(&spec);
                    report.removed += 1;
                }
                Err(e) => {
                    tracing::warn!(rule = %spec, error = %e, "failed to remove stale rule");
                    // The tombstoned record keeps the error so the
                    // stuck deletion stays visible and is retried.
                    if let Some(record) = tombstones.iter().find(|r| r.spec() == spec) {
                        self.store
                            .mark_rule_state(record.id, RecordState::Failed, Some(e.to_string()))
                            .await?;
                        report.record_failure(record.id.to_string(), e.to_string());
                    } else {
                        report.record_failure(spec.to_string(), e.to_string());
                    }
                    failed_removals.insert(spec);
                }
            }
        }

        for (spec, rule) in &desired {
            if live.contains(spec) {
                if rule.state != RecordState::Applied {
                    self.store
                        .mark_rule_state(rule.id, RecordState::Applied, None)
                        .await?;
                }
                continue;
            }
            match self.chain.append_rule(spec).await {
                Ok(()) => {
                    live.insert(spec.clone());
                    report.added += 1;
                    self.store
                        .mark_rule_state(rule.id, RecordState::Applied, None)
                        .await?;
                }
                Err(e) => {
                    // One bad rule never aborts the rest of the pass.
                    tracing::warn!(rule = %spec, error = %e, "failed to apply rule");
                    self.store
                        .mark_rule_state(rule.id, RecordState::Failed, Some(e.to_string()))
                        .await?;
                    report.record_failure(rule.id.to_string(), e.to_string());
                }
            }
        }

        // Every tombstone except those whose removal just failed has
        // had its kernel rule confirmed gone (or handed over to an
        // identical active rule) and can be dropped.
        self.store.purge_rule_tombstones(&failed_removals).await?;

        tracing::info!(%report, full, "firewall reconciliation pass finished");
        Ok(report)
    }

    /// Split active rules into an unambiguous desired map, marking
    /// every rule involved in a duplicate claim failed. Duplicates
    /// should be impossible through the store's validation; seeing one
    /// means the declarative model has diverged and no arbitrary
    /// winner may be picked.
    async fn partition_claims(
        &self,
        rules: Vec<PortForwardRule>,
        report: &mut ReconciliationReport,
    ) -> EngineResult<HashMap<RuleSpec, PortForwardRule>> {
        let mut by_claim: HashMap<_, Vec<PortForwardRule>> = HashMap::new();
        for rule in rules {
            by_claim.entry(rule.claim()).or_default().push(rule);
        }

        let mut desired = HashMap::new();
        for ((port, proto, iface), mut claimants) in by_claim {
            if claimants.len() == 1 {
                if let Some(rule) = claimants.pop() {
                    desired.insert(rule.spec(), rule);
                }
                continue;
            }

            let ids: Vec<String> = claimants.iter().map(|r| r.id.to_string()).collect();
            let msg = format!(
                "integrity violation: rules [{}] all claim {}/{} on {}",
                ids.join(", "),
                port,
                proto,
                iface
            );
            tracing::error!(port, %proto, %iface, "{}", msg);
            for rule in &claimants {
                self.store
                    .mark_rule_state(rule.id, RecordState::Failed, Some(msg.clone()))
                    .await?;
                report.record_failure(rule.id.to_string(), msg.clone());
            }
        }
        Ok(desired)
    }
}
