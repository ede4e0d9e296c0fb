//! Static host child resource (spec §3 "host": static MAC → IP/mask,
//! optional boot program).

use std::any::Any;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dhcp::handlers::{Handler, Reply};
use crate::dhcp::lease::MacAddr;
use crate::dhcp::wire::Option_;
use crate::error::{Error, Result};
use crate::resource::autogroup::GroupChild;
use crate::resource::{Resource, ResourceId, Services, ShutdownCtx};

pub struct Host {
    pub name: String,
    pub server: Option<String>,
    pub mac: MacAddr,
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub boot_file: Option<String>,
}

impl Host {
    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::new(HostHandler {
            mac: self.mac,
            address: self.address,
            mask: self.mask,
            boot_file: self.boot_file.clone(),
        })
    }
}

#[async_trait]
impl Resource for Host {
    fn id(&self) -> ResourceId {
        ResourceId {
            kind: "dhcp_host",
            name: self.name.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.address.is_unspecified() {
            return Err(Error::configuration_invalid("host address must not be 0.0.0.0"));
        }
        Ok(())
    }

    async fn init(&self, _services: Services) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, mut ctx: ShutdownCtx) -> Result<()> {
        // A static host has no state to observe beyond its own
        // declaration; just wait for shutdown. The server absorbs
        // this resource's handler rather than calling watch on it
        // once grouped (spec §4.2: "no longer schedules its own
        // Watch"), but validate()/check_apply() must still be callable
        // standalone before grouping runs.
        ctx.cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, _apply_permitted: bool) -> Result<bool> {
        Ok(true)
    }

    fn cmp(&self, other: &dyn Resource) -> Option<String> {
        let other = other.as_any().downcast_ref::<Host>()?;
        if other.mac != self.mac {
            return Some("mac changed".to_string());
        }
        if other.address != self.address {
            return Some("address changed".to_string());
        }
        if other.mask != self.mask {
            return Some("mask changed".to_string());
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

impl GroupChild for Host {
    fn parent_name(&self) -> Option<&str> {
        self.server.as_deref()
    }
}

struct HostHandler {
    mac: MacAddr,
    address: Ipv4Addr,
    mask: Ipv4Addr,
    boot_file: Option<String>,
}

impl Handler for HostHandler {
    fn apply(&self, request: &crate::dhcp::wire::Packet, reply: Reply, _now: u64) -> (Reply, bool) {
        let Some(mut reply) = reply else { return (None, false) };

        if request.chaddr != self.mac {
            return (Some(reply), false);
        }

        reply.yiaddr = self.address;
        reply.options.push(Option_::SubnetMask(self.mask));
        if let Some(boot_file) = &self.boot_file {
            reply.options.push(Option_::BootfileName(boot_file.clone()));
        }

        (Some(reply), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::wire::{MessageType, Packet};

    fn request(mac: MacAddr) -> Packet {
        Packet {
            op: 1,
            xid: 1,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: mac,
            options: vec![Option_::MessageType(MessageType::Discover)],
        }
    }

    #[test]
    fn matching_mac_gets_the_static_address() {
        let host = Host {
            name: "desktop".to_string(),
            server: None,
            mac: MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
            address: Ipv4Addr::new(192, 0, 2, 10),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            boot_file: None,
        };

        let req = request(host.mac);
        let template = req.reply_template(MessageType::Offer);
        let (reply, stop) = host.handler().apply(&req, Some(template), 0);
        assert!(!stop);
        assert_eq!(reply.unwrap().yiaddr, Ipv4Addr::new(192, 0, 2, 10));
    }

    #[test]
    fn non_matching_mac_passes_through() {
        let host = Host {
            name: "desktop".to_string(),
            server: None,
            mac: MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
            address: Ipv4Addr::new(192, 0, 2, 10),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            boot_file: None,
        };

        let req = request(MacAddr([0; 6]));
        let template = req.reply_template(MessageType::Offer);
        let (reply, stop) = host.handler().apply(&req, Some(template), 0);
        assert!(!stop);
        assert_eq!(reply.unwrap().yiaddr, Ipv4Addr::UNSPECIFIED);
    }
}
