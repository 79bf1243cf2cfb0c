use crate::error::{EngineError, EngineResult};
use crate::rule::{PortForwardRule, RecordState, RuleSpec, StaticLease, validate_mac};
use crate::snapshot::atomic_write;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::rule::{BindInterface, Protocol};

/// What the reconcilers consume from the store. They only ever read
/// desired state and report outcomes back; they never persist records
/// themselves.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Non-deleted forward rules, whatever their reconciliation state.
    async fn list_active_rules(&self) -> Result<Vec<PortForwardRule>>;

    /// Non-deleted static leases.
    async fn list_active_leases(&self) -> Result<Vec<StaticLease>>;

    /// Tombstoned rules awaiting removal of their live kernel rule.
    async fn list_rule_tombstones(&self) -> Result<Vec<PortForwardRule>>;

    async fn mark_rule_state(
        &self,
        id: u64,
        state: RecordState,
        error: Option<String>,
    ) -> Result<()>;

    async fn mark_lease_state(
        &self,
        name: &str,
        state: RecordState,
        error: Option<String>,
    ) -> Result<()>;

    /// Drop tombstoned rules after a reconciliation pass, keeping only
    /// those whose removal failed and still has a live kernel rule to
    /// clean up. A tombstone whose spec was taken over by an identical
    /// re-added rule is confirmed done and dropped too.
    async fn purge_rule_tombstones(&self, failed_removals: &HashSet<RuleSpec>) -> Result<()>;

    /// Drop tombstoned leases after a successful managed-block rewrite
    /// (the rewrite removed every non-desired line).
    async fn purge_lease_tombstones(&self) -> Result<()>;
}

/// Request to create a forward rule; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub external_port: u16,
    pub protocol: Protocol,
    pub target_address: Ipv4Addr,
    pub target_port: u16,
    pub bind_interface: BindInterface,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewLease {
    pub container_name: String,
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreData {
    next_rule_id: u64,
    rules: Vec<PortForwardRule>,
    leases: Vec<StaticLease>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            next_rule_id: 1,
            rules: vec![],
            leases: vec![],
        }
    }
}

/// Durable rule store backed by one JSON file, rewritten atomically on
/// every mutation. Deleting an applied record tombstones it so the
/// next reconciliation pass can remove the live counterpart before the
/// record disappears.
pub struct JsonStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read rule store {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse rule store {:?}", path))?
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let content = serde_json::to_vec_pretty(data).context("failed to serialize rule store")?;
        atomic_write(&self.path, &content)
    }

    /// Validate and admit a new forward rule as `pending`. Claim
    /// uniqueness (external port + protocol + interface) is enforced
    /// here; subnet membership of the target is the caller's registry
    /// check.
    pub async fn add_rule(&self, req: NewRule) -> EngineResult<PortForwardRule> {
        if req.external_port == 0 || req.target_port == 0 {
            return Err(EngineError::Validation("port 0 is not allowed".into()));
        }

        let mut data = self.data.lock().await;

        let claim = (
            req.external_port,
            req.protocol,
            req.bind_interface.clone(),
        );
        if let Some(existing) = data
            .rules
            .iter()
            .find(|r| !r.deleted && r.claim() == claim)
        {
            return Err(EngineError::Validation(format!(
                "external port {}/{} on {} is already claimed by rule {}",
                req.external_port, req.protocol, req.bind_interface, existing.id
            )));
        }

        let rule = PortForwardRule {
            id: data.next_rule_id,
            external_port: req.external_port,
            protocol: req.protocol,
            target_address: req.target_address,
            target_port: req.target_port,
            bind_interface: req.bind_interface,
            comment: req.comment,
            state: RecordState::Pending,
            last_error: None,
            deleted: false,
        };
        data.next_rule_id += 1;
        data.rules.push(rule.clone());
        self.persist(&data)?;
        Ok(rule)
    }

    /// Delete a rule. A rule that never reached the kernel is dropped
    /// outright; anything else is tombstoned until a reconciliation
    /// pass confirms its live rule is gone.
    pub async fn remove_rule(&self, id: u64) -> EngineResult<()> {
        let mut data = self.data.lock().await;
        let state = match data.rules.iter().find(|r| r.id == id && !r.deleted) {
            Some(rule) => rule.state,
            None => {
                return Err(EngineError::Validation(format!("no rule with id {}", id)));
            }
        };
        if state == RecordState::Pending {
            data.rules.retain(|r| r.id != id);
        } else if let Some(rule) = data.rules.iter_mut().find(|r| r.id == id) {
            rule.deleted = true;
        }
        self.persist(&data)?;
        Ok(())
    }

    /// Create or update a static lease for a container. Updating an
    /// existing lease resets it to `pending` so the next pass rewrites
    /// the managed block.
    pub async fn add_lease(&self, req: NewLease) -> EngineResult<StaticLease> {
        validate_mac(&req.mac_address).map_err(|e| EngineError::Validation(e.to_string()))?;
        if req.container_name.trim().is_empty() || req.container_name.contains(',') {
            return Err(EngineError::Validation(format!(
                "invalid container name '{}'",
                req.container_name
            )));
        }

        let mut data = self.data.lock().await;

        if let Some(other) = data
            .leases
            .iter()
            .find(|l| !l.deleted && l.ip_address == req.ip_address && l.container_name != req.container_name)
        {
            return Err(EngineError::Validation(format!(
                "address {} is already leased to '{}'",
                req.ip_address, other.container_name
            )));
        }

        let lease = StaticLease {
            container_name: req.container_name.clone(),
            mac_address: req.mac_address.to_ascii_lowercase(),
            ip_address: req.ip_address,
            state: RecordState::Pending,
            last_error: None,
            deleted: false,
        };

        data.leases
            .retain(|l| l.container_name != req.container_name || l.deleted);
        data.leases.push(lease.clone());
        self.persist(&data)?;
        Ok(lease)
    }

    pub async fn remove_lease(&self, name: &str) -> EngineResult<()> {
        let mut data = self.data.lock().await;
        let state = match data
            .leases
            .iter()
            .find(|l| l.container_name == name && !l.deleted)
        {
            Some(lease) => lease.state,
            None => {
                return Err(EngineError::Validation(format!("no lease for '{}'", name)));
            }
        };
        if state == RecordState::Pending {
            data.leases
                .retain(|l| l.container_name != name || l.deleted);
        } else if let Some(lease) = data
            .leases
            .iter_mut()
            .find(|l| l.container_name == name && !l.deleted)
        {
            lease.deleted = true;
        }
        self.persist(&data)?;
        Ok(())
    }

    /// Every rule record including failed and tombstoned ones, for
    /// diagnostics.
    pub async fn list_all_rules(&self) -> Vec<PortForwardRule> {
        self.data.lock().await.rules.clone()
    }

    pub async fn list_all_leases(&self) -> Vec<StaticLease> {
        self.data.lock().await.leases.clone()
    }
}

#[async_trait]
impl RuleStore for JsonStore {
    async fn list_active_rules(&self) -> Result<Vec<PortForwardRule>> {
        let data = self.data.lock().await;
        Ok(data.rules.iter().filter(|r| !r.deleted).cloned().collect())
    }

    async fn list_active_leases(&self) -> Result<Vec<StaticLease>> {
        let data = self.data.lock().await;
        Ok(data.leases.iter().filter(|l| !l.deleted).cloned().collect())
    }

    async fn list_rule_tombstones(&self) -> Result<Vec<PortForwardRule>> {
        let data = self.data.lock().await;
        Ok(data.rules.iter().filter(|r| r.deleted).cloned().collect())
    }

    async fn mark_rule_state(
        &self,
        id: u64,
        state: RecordState,
        error: Option<String>,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(rule) = data.rules.iter_mut().find(|r| r.id == id) {
            rule.state = state;
            rule.last_error = error;
            self.persist(&data)?;
        }
        Ok(())
    }

    async fn mark_lease_state(
        &self,
        name: &str,
        state: RecordState,
        error: Option<String>,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(lease) = data
            .leases
            .iter_mut()
            .find(|l| l.container_name == name && !l.deleted)
        {
            lease.state = state;
            lease.last_error = error;
            self.persist(&data)?;
        }
        Ok(())
    }

    async fn purge_rule_tombstones(&self, failed_removals: &HashSet<RuleSpec>) -> Result<()> {
        let mut data = self.data.lock().await;
        let before = data.rules.len();
        data.rules
            .retain(|r| !r.deleted || failed_removals.contains(&r.spec()));
        if data.rules.len() != before {
            self.persist(&data)?;
        }
        Ok(())
    }

    async fn purge_lease_tombstones(&self) -> Result<()> {
        let mut data = self.data.lock().await;
        let before = data.leases.len();
        data.leases.retain(|l| !l.deleted);
        if data.leases.len() != before {
            self.persist(&data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_rule(port: u16) -> NewRule {
        NewRule {
            external_port: port,
            protocol: Protocol::Tcp,
            target_address: "10.0.3.5".parse().unwrap(),
            target_port: 80,
            bind_interface: BindInterface::All,
            comment: None,
        }
    }

    fn new_lease(name: &str, ip: &str) -> NewLease {
        NewLease {
            container_name: name.to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            ip_address: ip.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn rules_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        {
            let store = JsonStore::open(&path).unwrap();
            store.add_rule(new_rule(8080)).await.unwrap();
        }

        let store = JsonStore::open(&path).unwrap();
        let rules = store.list_active_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].external_port, 8080);
        assert_eq!(rules[0].state, RecordState::Pending);
    }

    #[tokio::test]
    async fn duplicate_claim_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        store.add_rule(new_rule(22)).await.unwrap();
        let err = store.add_rule(new_rule(22)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn same_port_different_protocol_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        store.add_rule(new_rule(53)).await.unwrap();
        let mut udp = new_rule(53);
        udp.protocol = Protocol::Udp;
        store.add_rule(udp).await.unwrap();
        assert_eq!(store.list_active_rules().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn applied_rule_is_tombstoned_then_purged() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        let rule = store.add_rule(new_rule(8080)).await.unwrap();
        store
            .mark_rule_state(rule.id, RecordState::Applied, None)
            .await
            .unwrap();
        store.remove_rule(rule.id).await.unwrap();

        // Tombstoned: no longer active, still in the store
        assert!(store.list_active_rules().await.unwrap().is_empty());
        assert_eq!(store.list_all_rules().await.len(), 1);

        // Kernel rule confirmed gone
        store.purge_rule_tombstones(&HashSet::new()).await.unwrap();
        assert!(store.list_all_rules().await.is_empty());
    }

    #[tokio::test]
    async fn tombstone_survives_while_removal_unconfirmed() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        let rule = store.add_rule(new_rule(8080)).await.unwrap();
        store
            .mark_rule_state(rule.id, RecordState::Applied, None)
            .await
            .unwrap();
        store.remove_rule(rule.id).await.unwrap();
        assert_eq!(store.list_rule_tombstones().await.unwrap().len(), 1);

        let mut failed_removals = HashSet::new();
        failed_removals.insert(rule.spec());
        store.purge_rule_tombstones(&failed_removals).await.unwrap();
        assert_eq!(store.list_all_rules().await.len(), 1);
    }

    #[tokio::test]
    async fn pending_rule_is_removed_outright() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        let rule = store.add_rule(new_rule(8080)).await.unwrap();
        store.remove_rule(rule.id).await.unwrap();
        assert!(store.list_all_rules().await.is_empty());
    }

    #[tokio::test]
    async fn lease_upsert_replaces_and_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        store.add_lease(new_lease("web", "10.0.3.50")).await.unwrap();
        store
            .mark_lease_state("web", RecordState::Applied, None)
            .await
            .unwrap();
        store.add_lease(new_lease("web", "10.0.3.51")).await.unwrap();

        let leases = store.list_active_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].ip_address, "10.0.3.51".parse::<Ipv4Addr>().unwrap());
        assert_eq!(leases[0].state, RecordState::Pending);
    }

    #[tokio::test]
    async fn lease_address_collision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        store.add_lease(new_lease("web", "10.0.3.50")).await.unwrap();
        let err = store
            .add_lease(new_lease("db", "10.0.3.50"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn bad_mac_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("rules.json")).unwrap();

        let mut lease = new_lease("web", "10.0.3.50");
        lease.mac_address = "not-a-mac".into();
        assert!(store.add_lease(lease).await.is_err());
    }
}
