pub mod dnsmasq;
pub mod reconciler;

pub use dnsmasq::*;
pub use reconciler::*;

#[cfg(test)]
pub(crate) mod testing;

// dnsmasq managed-block writer and the DHCP lease reconciler
