use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Firewall,
    Dhcp,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firewall => f.write_str("firewall"),
            Self::Dhcp => f.write_str("dhcp"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    /// Rule id or container name, depending on the class.
    pub record: String,
    pub error: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub class: ResourceClass,
    pub added: usize,
    pub removed: usize,
    pub failed: Vec<FailedRecord>,
}

impl ReconciliationReport {
    pub fn new(class: ResourceClass) -> Self {
        Self {
            class,
            added: 0,
            removed: 0,
            failed: vec![],
        }
    }

    pub fn record_failure(&mut self, record: impl Into<String>, error: impl Into<String>) {
        self.failed.push(FailedRecord {
            record: record.into(),
            error: error.into(),
        });
    }

    /// True when the pass changed nothing and nothing failed.
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.failed.is_empty()
    }
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} added, {} removed, {} failed",
            self.class,
            self.added,
            self.removed,
            self.failed.len()
        )
    }
}
