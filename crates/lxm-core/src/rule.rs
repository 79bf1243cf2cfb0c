use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(anyhow!("unsupported protocol '{}'", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host interface a forward binds to. "all" means no interface match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindInterface {
    All,
    Iface(String),
}

impl BindInterface {
    pub fn parse(s: &str) -> Self {
        if s.trim().is_empty() || s.eq_ignore_ascii_case("all") {
            Self::All
        } else {
            Self::Iface(s.trim().to_string())
        }
    }
}

impl fmt::Display for BindInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Iface(name) => f.write_str(name),
        }
    }
}

/// Reconciliation lifecycle of a record, not of its intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Pending,
    Applied,
    Failed,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Normalized form of a DNAT rule, the unit of set-diffing between the
/// store and the kernel. Two rules are the same live rule iff their
/// specs are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSpec {
    pub protocol: Protocol,
    pub external_port: u16,
    pub bind_interface: BindInterface,
    pub target_address: Ipv4Addr,
    pub target_port: u16,
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} on {} -> {}:{}",
            self.protocol,
            self.external_port,
            self.bind_interface,
            self.target_address,
            self.target_port
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub id: u64,
    pub external_port: u16,
    pub protocol: Protocol,
    pub target_address: Ipv4Addr,
    pub target_port: u16,
    pub bind_interface: BindInterface,
    #[serde(default)]
    pub comment: Option<String>,
    pub state: RecordState,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl PortForwardRule {
    pub fn spec(&self) -> RuleSpec {
        RuleSpec {
            protocol: self.protocol,
            external_port: self.external_port,
            bind_interface: self.bind_interface.clone(),
            target_address: self.target_address,
            target_port: self.target_port,
        }
    }

    /// The resource a rule claims exclusively. Two active rules with
    /// the same claim are an integrity violation even if their targets
    /// differ.
    pub fn claim(&self) -> (u16, Protocol, BindInterface) {
        (
            self.external_port,
            self.protocol,
            self.bind_interface.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticLease {
    pub container_name: String,
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
    pub state: RecordState,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl StaticLease {
    /// dnsmasq static host line for the managed block.
    pub fn config_line(&self) -> String {
        format!(
            "dhcp-host={},{},{}",
            self.mac_address, self.container_name, self.ip_address
        )
    }
}

/// Validate a colon-separated 6-octet hardware address.
pub fn validate_mac(mac: &str) -> Result<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6 {
        return Err(anyhow!("MAC '{}' must have 6 colon-separated octets", mac));
    }
    for octet in octets {
        if octet.len() != 2 || u8::from_str_radix(octet, 16).is_err() {
            return Err(anyhow!("MAC '{}' has invalid octet '{}'", mac, octet));
        }
    }
    Ok(())
}
