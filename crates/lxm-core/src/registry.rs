use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Answers whether an address can belong to a managed container. Used
/// only to validate forward targets before a rule may enter `pending`.
pub trait ContainerRegistry: Send + Sync {
    fn contains_address(&self, addr: Ipv4Addr) -> bool;

    fn describe(&self) -> String;
}

/// Registry backed by the managed bridge's subnet: any address inside
/// the bridge CIDR is considered a plausible container target.
pub struct SubnetRegistry {
    subnet: Ipv4Net,
}

impl SubnetRegistry {
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let subnet: Ipv4Net = cidr
            .parse()
            .with_context(|| format!("invalid bridge CIDR '{}'", cidr))?;
        Ok(Self { subnet })
    }
}

impl ContainerRegistry for SubnetRegistry {
    fn contains_address(&self, addr: Ipv4Addr) -> bool {
        self.subnet.contains(&addr)
    }

    fn describe(&self) -> String {
        self.subnet.to_string()
    }
}

/// Reject a forward target outside the managed bridge subnet.
pub fn validate_target(registry: &dyn ContainerRegistry, addr: Ipv4Addr) -> EngineResult<()> {
    if !registry.contains_address(addr) {
        return Err(EngineError::Validation(format!(
            "target address {} is outside the managed bridge subnet {}",
            addr,
            registry.describe()
        )));
    }
    Ok(())
}

/// Reject a lease address outside the DHCP pool range (inclusive).
pub fn validate_pool_membership(
    pool_start: Ipv4Addr,
    pool_end: Ipv4Addr,
    addr: Ipv4Addr,
) -> EngineResult<()> {
    if u32::from(addr) < u32::from(pool_start) || u32::from(addr) > u32::from(pool_end) {
        return Err(EngineError::Validation(format!(
            "lease address {} is outside the DHCP pool {}-{}",
            addr, pool_start, pool_end
        )));
    }
    Ok(())
}
