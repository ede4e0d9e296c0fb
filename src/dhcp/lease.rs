//! Lease table (spec §4.7, component C7).
//!
//! Maps a client hardware address to its assigned address and expiry,
//! sharing a mutex with the allocator that owns the address space so
//! the two can never disagree about what's free. Modeled on a
//! `Table<K, V>` wrapper with a background prune loop, swapping a
//! session-table's `Identifier -> Session` mapping for `MacAddr ->
//! Lease` and a fixed poll tick for a `prune` the engine drives on its
//! own timer.

use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::dhcp::alloc::{AllocError, Ipv4Allocator};
use std::net::Ipv4Addr;

/// A client hardware address (spec: 6-byte Ethernet MAC, the only
/// chaddr length this implementation handles per §4.7's non-goal on
/// exotic hardware types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Rejects anything but six colon-separated hex octets.
#[derive(Debug, Clone, Copy)]
pub struct ParseMacAddrError;

impl std::fmt::Display for ParseMacAddrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected six colon-separated hex octets, e.g. aa:bb:cc:dd:ee:ff")
    }
}

impl std::str::FromStr for MacAddr {
    type Err = ParseMacAddrError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacAddrError);
        }
        for (slot, part) in octets.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| ParseMacAddrError)?;
        }
        Ok(MacAddr(octets))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub expires_at_epoch_seconds: u64,
}

struct Inner {
    allocator: Ipv4Allocator,
    leases: AHashMap<MacAddr, Lease>,
}

/// The allocator and its lease table, behind one lock, so a renewal
/// and a fresh allocation can never race each other into inconsistent
/// bitmap/table state.
pub struct LeaseTable {
    inner: Mutex<Inner>,
    lease_seconds: u64,
}

impl LeaseTable {
    pub fn new(allocator: Ipv4Allocator, lease_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                allocator,
                leases: AHashMap::new(),
            }),
            lease_seconds,
        }
    }

    /// Reserves `addr` at startup for a static host or a `skip` entry,
    /// without creating a lease record.
    pub fn reserve(&self, addr: Ipv4Addr) -> Result<(), AllocError> {
        self.inner.lock().allocator.reserve(addr)
    }

    /// Renews `mac`'s existing lease if one is live, or allocates a
    /// fresh address (using `hint` when present and free) otherwise.
    /// Spec §4.7: "a client renewing its own address is never refused
    /// in favor of a different client."
    pub fn renew_or_allocate(
        &self,
        mac: MacAddr,
        hint: Option<Ipv4Addr>,
        now: u64,
    ) -> Result<Lease, AllocError> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.leases.get(&mac).copied() {
            let lease = Lease {
                address: existing.address,
                expires_at_epoch_seconds: now + self.lease_seconds,
            };
            inner.leases.insert(mac, lease);
            return Ok(lease);
        }

        let address = inner.allocator.allocate(hint)?;
        let lease = Lease {
            address,
            expires_at_epoch_seconds: now + self.lease_seconds,
        };
        inner.leases.insert(mac, lease);
        Ok(lease)
    }

    pub fn lookup(&self, mac: MacAddr) -> Option<Lease> {
        self.inner.lock().leases.get(&mac).copied()
    }

    /// Releases `mac`'s lease (DHCPRELEASE), freeing its address
    /// immediately rather than waiting for expiry.
    pub fn release(&self, mac: MacAddr) {
        let mut inner = self.inner.lock();
        if let Some(lease) = inner.leases.remove(&mac) {
            let _ = inner.allocator.free(lease.address);
        }
    }

    /// Frees every lease that expired at or before `now`. Returns how
    /// many leases were freed and the duration to wait before the next
    /// prune is worth running (the time until the soonest-expiring
    /// remaining lease, or one lease period if the table is empty) —
    /// the engine's `watch` loop sleeps this long between passes
    /// instead of polling on a fixed tick (spec §4.7's "quantized"
    /// prune interval).
    pub fn prune(&self, now: u64) -> (usize, Duration) {
        let mut inner = self.inner.lock();

        let expired: Vec<MacAddr> = inner
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at_epoch_seconds <= now)
            .map(|(mac, _)| *mac)
            .collect();

        for mac in &expired {
            if let Some(lease) = inner.leases.remove(mac) {
                let _ = inner.allocator.free(lease.address);
            }
        }

        let next = inner
            .leases
            .values()
            .map(|l| l.expires_at_epoch_seconds)
            .min();

        let wait = match next {
            Some(at) if at > now => Duration::from_secs(at - now),
            _ => Duration::from_secs(self.lease_seconds),
        };

        (expired.len(), wait)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
