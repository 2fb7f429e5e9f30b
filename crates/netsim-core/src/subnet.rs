//! Subnet allocator: hands out `10.0.<n>.0/24` blocks for point-to-point
//! links, `.1`/`.2` to the two endpoints. Switch-bridged groups share one
//! subnet across all endpoints (tracked separately by the Topology Manager).
//!
//! Grounded on `netns-testbench/src/addr.rs::generate_p2p_subnet`'s
//! bump-counter shape; the `/30`-per-link scheme there is widened to
//! `/24`-per-link to match this design's two-address-per-subnet contract.

use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::EmulatorError;

pub struct SubnetAllocator {
    next: u16,
    /// Subnets given back by `release`, reused (smallest first) before
    /// `next` is advanced again — satisfies the round-trip law that a
    /// remove_link; add_link pair lands back on the same subnet.
    freed: BTreeSet<u16>,
}

impl Default for SubnetAllocator {
    fn default() -> Self {
        Self {
            next: 1,
            freed: BTreeSet::new(),
        }
    }
}

impl SubnetAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next `/24` and the two endpoint addresses within it,
    /// preferring a previously `release`d subnet over advancing the
    /// counter. Wraps at `10.0.255.0/24` with `ResourceExhausted`.
    pub fn allocate(&mut self) -> Result<(Ipv4Network, Ipv4Addr, Ipv4Addr), EmulatorError> {
        let n = if let Some(&n) = self.freed.iter().next() {
            self.freed.remove(&n);
            n
        } else {
            if self.next > 255 {
                return Err(EmulatorError::ResourceExhausted(
                    "subnet allocator exhausted past 10.0.255.0/24".to_string(),
                ));
            }
            let n = self.next;
            self.next += 1;
            n
        };
        let network = Ipv4Network::new(Ipv4Addr::new(10, 0, n as u8, 0), 24)
            .map_err(|e| EmulatorError::internal(e.to_string()))?;
        let a = Ipv4Addr::new(10, 0, n as u8, 1);
        let b = Ipv4Addr::new(10, 0, n as u8, 2);
        Ok((network, a, b))
    }

    /// Returns a subnet allocated by a prior `allocate()` call to the free
    /// list so the next allocation can reuse it.
    pub fn release(&mut self, network: Ipv4Network) {
        let n = network.ip().octets()[2];
        self.freed.insert(n as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_is_10_0_1_0() {
        let mut alloc = SubnetAllocator::new();
        let (net, a, b) = alloc.allocate().unwrap();
        assert_eq!(net.to_string(), "10.0.1.0/24");
        assert_eq!(a, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(b, Ipv4Addr::new(10, 0, 1, 2));
    }

    #[test]
    fn allocations_increment() {
        let mut alloc = SubnetAllocator::new();
        let _ = alloc.allocate().unwrap();
        let (net, ..) = alloc.allocate().unwrap();
        assert_eq!(net.to_string(), "10.0.2.0/24");
    }

    #[test]
    fn exhaustion_past_255() {
        let mut alloc = SubnetAllocator {
            next: 256,
            freed: BTreeSet::new(),
        };
        let err = alloc.allocate().unwrap_err();
        assert_eq!(err.kind(), netsim_proto::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn release_is_reused_before_advancing() {
        let mut alloc = SubnetAllocator::new();
        let (first, ..) = alloc.allocate().unwrap();
        let (_second, ..) = alloc.allocate().unwrap();
        alloc.release(first);
        let (reused, ..) = alloc.allocate().unwrap();
        assert_eq!(reused.to_string(), "10.0.1.0/24");
        let (next, ..) = alloc.allocate().unwrap();
        assert_eq!(next.to_string(), "10.0.3.0/24");
    }
}
