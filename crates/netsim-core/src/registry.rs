//! The global address registry: a flat map address -> (device, interface).
//!
//! Kept as an explicit, named state holder owned by the Topology Manager and
//! passed to the Namespace Manager by reference, rather than an ambient
//! singleton (`lazy_static`/`OnceCell`) — see SPEC_FULL.md Design Notes.

use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Default)]
pub struct AddressRegistry {
    owners: HashMap<Ipv4Addr, (String, String)>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `addr` for `(device, iface)`. Idempotent if the identical
    /// assignment is repeated; returns the existing owner on conflict.
    pub fn reserve(
        &mut self,
        addr: Ipv4Addr,
        device: &str,
        iface: &str,
    ) -> Result<(), (String, String)> {
        match self.owners.get(&addr) {
            Some((d, i)) if d == device && i == iface => Ok(()),
            Some(owner) => Err(owner.clone()),
            None => {
                self.owners
                    .insert(addr, (device.to_string(), iface.to_string()));
                Ok(())
            }
        }
    }

    pub fn release(&mut self, addr: Ipv4Addr) {
        self.owners.remove(&addr);
    }

    pub fn release_device(&mut self, device: &str) {
        self.owners.retain(|_, (d, _)| d != device);
    }

    pub fn owner(&self, addr: &Ipv4Addr) -> Option<&(String, String)> {
        self.owners.get(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_conflict() {
        let mut reg = AddressRegistry::new();
        let addr: Ipv4Addr = "10.0.1.1".parse().unwrap();
        reg.reserve(addr, "h1", "eth0").unwrap();
        let err = reg.reserve(addr, "h2", "eth0").unwrap_err();
        assert_eq!(err, ("h1".to_string(), "eth0".to_string()));
    }

    #[test]
    fn reserve_same_assignment_is_idempotent() {
        let mut reg = AddressRegistry::new();
        let addr: Ipv4Addr = "10.0.1.1".parse().unwrap();
        reg.reserve(addr, "h1", "eth0").unwrap();
        reg.reserve(addr, "h1", "eth0").unwrap();
    }

    #[test]
    fn release_device_frees_all_its_addresses() {
        let mut reg = AddressRegistry::new();
        let a: Ipv4Addr = "10.0.1.1".parse().unwrap();
        let b: Ipv4Addr = "10.0.1.2".parse().unwrap();
        reg.reserve(a, "h1", "eth0").unwrap();
        reg.reserve(b, "h1", "eth1").unwrap();
        reg.release_device("h1");
        assert!(reg.owner(&a).is_none());
        assert!(reg.owner(&b).is_none());
    }
}
