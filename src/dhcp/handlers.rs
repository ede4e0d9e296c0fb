//! The fixed handler chain (spec §4.5 and §9 "Plugin chain as data,
//! not inheritance"). Each handler is `(request, reply) -> (reply,
//! stop)`; grouping a host or range resource into a server appends its
//! own handler to this chain rather than subclassing anything.

use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::wire::{MessageType, Option_, Packet};

/// `None` reply means drop the packet; `Some` carries the
/// in-progress response.
pub type Reply = Option<Packet>;

pub trait Handler: Send + Sync {
    /// Runs this link in the chain. `stop == true` ends the chain
    /// (dropping if `reply` comes back `None`, responding immediately
    /// otherwise); `stop == false` continues to the next handler.
    /// `now` is the current epoch second, for handlers (ranges) that
    /// touch the lease table.
    fn apply(&self, request: &Packet, reply: Reply, now: u64) -> (Reply, bool);
}

/// Runs the full chain in order, stopping at the first `stop`.
pub fn run_chain(chain: &[Arc<dyn Handler>], request: &Packet, initial: Packet, now: u64) -> Reply {
    let mut reply = Some(initial);
    for handler in chain {
        let (next, stop) = handler.apply(request, reply, now);
        reply = next;
        if stop {
            return reply;
        }
    }
    reply
}

/// Emits the Lease Time option (51) from the server's default
/// duration. Static hosts and ranges may already have set a more
/// specific lease time; this handler only fills it in if absent.
pub struct LeaseTimeHandler {
    pub default_seconds: u32,
}

impl Handler for LeaseTimeHandler {
    fn apply(&self, _request: &Packet, reply: Reply, _now: u64) -> (Reply, bool) {
        let Some(mut reply) = reply else { return (None, false) };
        let already_set = reply
            .options
            .iter()
            .any(|o| matches!(o, Option_::LeaseTimeSeconds(_)));
        if !already_set {
            reply.options.push(Option_::LeaseTimeSeconds(self.default_seconds));
        }
        (Some(reply), false)
    }
}

/// Resolves and caches the server identifier (spec §4.5's sub-state
/// machine): explicit value, else the listen address's host part,
/// else the named interface's first IPv4 address. One mutex per
/// server, per spec §5's "the server's cached server-identifier has
/// one mutex".
pub struct ServerIdentity {
    explicit: Option<Option<Ipv4Addr>>, // Some(None) means "explicit empty: suppress the option"
    listen_host: Ipv4Addr,
    resolved: Mutex<Option<Option<Ipv4Addr>>>,
}

impl ServerIdentity {
    pub fn new(explicit: Option<Option<Ipv4Addr>>, listen_host: Ipv4Addr) -> Self {
        Self {
            explicit,
            listen_host,
            resolved: Mutex::new(None),
        }
    }

    /// Resolves on first use and caches the result. `None` means "do
    /// not emit the option" (an explicit empty string, spec §4.5).
    pub fn get(&self) -> Option<Ipv4Addr> {
        let mut cached = self.resolved.lock();
        if let Some(value) = *cached {
            return value;
        }

        let value = match self.explicit {
            Some(explicit) => explicit,
            None => Some(self.listen_host),
        };
        *cached = Some(value);
        value
    }
}

/// Resolves the server identifier and either drops packets addressed
/// to a different server or stamps ours onto the reply.
pub struct ServerIdHandler {
    pub identity: Arc<ServerIdentity>,
}

impl Handler for ServerIdHandler {
    fn apply(&self, request: &Packet, reply: Reply, _now: u64) -> (Reply, bool) {
        let ours = self.identity.get();

        if let Some(claimed) = request.server_id() {
            if claimed != Ipv4Addr::UNSPECIFIED && Some(claimed) != ours {
                return (None, true); // not addressed to us
            }
        }

        let Some(mut reply) = reply else { return (None, false) };
        if let Some(id) = ours {
            reply.options.retain(|o| !matches!(o, Option_::ServerId(_)));
            reply.options.push(Option_::ServerId(id));
        }
        (Some(reply), false)
    }
}

pub struct DnsHandler {
    pub servers: Vec<Ipv4Addr>,
}

impl Handler for DnsHandler {
    fn apply(&self, _request: &Packet, reply: Reply, _now: u64) -> (Reply, bool) {
        let Some(mut reply) = reply else { return (None, false) };
        if !self.servers.is_empty() {
            reply.options.push(Option_::Dns(self.servers.clone()));
        }
        (Some(reply), false)
    }
}

pub struct RouterHandler {
    pub routers: Vec<Ipv4Addr>,
}

impl Handler for RouterHandler {
    fn apply(&self, _request: &Packet, reply: Reply, _now: u64) -> (Reply, bool) {
        let Some(mut reply) = reply else { return (None, false) };
        if !self.routers.is_empty() {
            reply.options.push(Option_::Router(self.routers.clone()));
        }
        (Some(reply), false)
    }
}

/// Selects the message type appropriate for `request`, or `None` if
/// the request is not one this server answers (spec §4.5: Decline and
/// other types are logged and dropped upstream of the handler chain).
pub fn reply_message_type_for(request_type: MessageType) -> Option<MessageType> {
    match request_type {
        MessageType::Discover => Some(MessageType::Offer),
        MessageType::Request => Some(MessageType::Ack),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::lease::MacAddr;

    fn template() -> Packet {
        Packet {
            op: 2,
            xid: 1,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: MacAddr([0; 6]),
            options: vec![Option_::MessageType(MessageType::Offer)],
        }
    }

    fn request_with_server_id(id: Option<Ipv4Addr>) -> Packet {
        let mut p = template();
        p.op = 1;
        if let Some(id) = id {
            p.options.push(Option_::ServerId(id));
        }
        p
    }

    #[test]
    fn lease_time_fills_default_when_absent() {
        let handler = LeaseTimeHandler { default_seconds: 600 };
        let (reply, stop) = handler.apply(&template(), Some(template()), 0);
        assert!(!stop);
        let reply = reply.unwrap();
        assert!(matches!(
            reply.options.last(),
            Some(Option_::LeaseTimeSeconds(600))
        ));
    }

    #[test]
    fn mismatched_server_id_is_dropped() {
        let identity = Arc::new(ServerIdentity::new(
            Some(Some(Ipv4Addr::new(192, 0, 2, 1))),
            Ipv4Addr::new(192, 0, 2, 1),
        ));
        let handler = ServerIdHandler { identity };
        let request = request_with_server_id(Some(Ipv4Addr::new(198, 51, 100, 1)));
        let (reply, stop) = handler.apply(&request, Some(template()), 0);
        assert!(stop);
        assert!(reply.is_none());
    }

    #[test]
    fn matching_server_id_stamps_reply() {
        let identity = Arc::new(ServerIdentity::new(None, Ipv4Addr::new(192, 0, 2, 1)));
        let handler = ServerIdHandler { identity };
        let request = request_with_server_id(None);
        let (reply, stop) = handler.apply(&request, Some(template()), 0);
        assert!(!stop);
        let reply = reply.unwrap();
        assert!(reply
            .options
            .iter()
            .any(|o| matches!(o, Option_::ServerId(a) if *a == Ipv4Addr::new(192, 0, 2, 1))));
    }

    #[test]
    fn explicit_empty_server_id_suppresses_option() {
        let identity = Arc::new(ServerIdentity::new(Some(None), Ipv4Addr::new(192, 0, 2, 1)));
        let handler = ServerIdHandler { identity };
        let request = request_with_server_id(None);
        let (reply, _) = handler.apply(&request, Some(template()), 0);
        let reply = reply.unwrap();
        assert!(!reply.options.iter().any(|o| matches!(o, Option_::ServerId(_))));
    }
}
