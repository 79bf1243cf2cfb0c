pub mod chain;
pub mod reconciler;

pub use chain::*;
pub use reconciler::*;

#[cfg(test)]
pub(crate) mod testing;

// Managed iptables NAT chain and the DNAT reconciler
