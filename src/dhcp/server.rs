//! DHCPv4 server parent resource (spec §4.5, component C5). Owns the
//! UDP listener, absorbs host/range children via autogrouping, and
//! drives the handler chain per incoming packet.

use std::any::Any;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::dhcp::handlers::{
    run_chain, DnsHandler, Handler, LeaseTimeHandler, RouterHandler, ServerIdHandler,
    ServerIdentity,
};
use crate::dhcp::host::Host;
use crate::dhcp::range::Range;
use crate::dhcp::wire::{MessageType, Packet, CLIENT_PORT, SERVER_PORT};
use crate::error::{Error, Result};
use crate::resource::autogroup::GroupParent;
use crate::resource::event::EventSender;
use crate::resource::{Resource, ResourceId, RunningSignal, Services, ShutdownCtx};

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Declared attributes of the server (spec §3's "server" owns clause).
pub struct DhcpServer {
    pub name: String,
    pub listen: SocketAddrV4,
    pub interface: String,
    /// `None`: not configured, derive from the listen address. `Some(None)`:
    /// explicit empty string, suppress the option. `Some(Some(addr))`:
    /// explicit address.
    pub explicit_server_id: Option<Option<Ipv4Addr>>,
    pub default_lease_seconds: u32,
    pub dns: Vec<Ipv4Addr>,
    pub routers: Vec<Ipv4Addr>,

    children: Mutex<Vec<Arc<dyn Resource>>>,
    identity: OnceLock<Arc<ServerIdentity>>,
    chain: OnceLock<Vec<Arc<dyn Handler>>>,
    running: OnceLock<RunningSignal>,
    events: OnceLock<EventSender>,
}

impl DhcpServer {
    pub fn new(
        name: String,
        listen: SocketAddrV4,
        interface: String,
        explicit_server_id: Option<Option<Ipv4Addr>>,
        default_lease_seconds: u32,
        dns: Vec<Ipv4Addr>,
        routers: Vec<Ipv4Addr>,
    ) -> Self {
        Self {
            name,
            listen,
            interface,
            explicit_server_id,
            default_lease_seconds,
            dns,
            routers,
            children: Mutex::new(Vec::new()),
            identity: OnceLock::new(),
            chain: OnceLock::new(),
            running: OnceLock::new(),
            events: OnceLock::new(),
        }
    }

    fn identity(&self) -> &Arc<ServerIdentity> {
        self.identity.get().expect("init must run before identity is used")
    }

    fn chain(&self) -> &[Arc<dyn Handler>] {
        self.chain.get().expect("init must run before the handler chain is built")
    }

    /// Builds a reply's destination per the peer-selection rule in
    /// spec §4.5: relay agent, broadcast flag, known client address,
    /// or broadcast as a last resort.
    fn select_peer(request: &Packet, reply: &Packet, is_nak: bool) -> (SocketAddr, bool) {
        if request.giaddr != Ipv4Addr::UNSPECIFIED {
            return (SocketAddr::new(request.giaddr.into(), SERVER_PORT), false);
        }
        if is_nak {
            return (SocketAddr::new(Ipv4Addr::BROADCAST.into(), CLIENT_PORT), false);
        }
        if reply.ciaddr != Ipv4Addr::UNSPECIFIED {
            return (SocketAddr::new(reply.ciaddr.into(), CLIENT_PORT), false);
        }
        if request.flags & 0x8000 != 0 {
            return (SocketAddr::new(Ipv4Addr::BROADCAST.into(), CLIENT_PORT), false);
        }
        // Neither a relay, a NAK, a known client address, nor the
        // broadcast flag: broadcast anyway, but flag it so the caller
        // can log a warning (spec §4.5: "otherwise broadcast with a
        // warning").
        (SocketAddr::new(Ipv4Addr::BROADCAST.into(), CLIENT_PORT), true)
    }

    /// Runs one packet through parse → opcode check → template → type
    /// dispatch → handler chain, per spec §4.5. Returns `None` for
    /// anything that should be silently dropped.
    fn handle_datagram(&self, data: &[u8], services: &Services) -> Option<(Vec<u8>, SocketAddr)> {
        let request = Packet::parse(data)?;
        if !request.is_request() {
            return None;
        }

        let msg_type = request.message_type()?;
        let reply_type = match msg_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => MessageType::Ack,
            MessageType::Decline | MessageType::Release | MessageType::Inform => {
                services.logf(
                    log::Level::Debug,
                    format_args!("{msg_type:?} from {} logged and dropped", request.chaddr),
                );
                return None;
            }
            other => {
                services.logf(log::Level::Debug, format_args!("unhandled message type {other:?}"));
                return None;
            }
        };

        let template = request.reply_template(reply_type);
        let now = now_epoch_seconds();
        let reply = run_chain(self.chain(), &request, template, now)?;

        let is_nak = reply.message_type() == Some(MessageType::Nak);
        let (peer, warn) = Self::select_peer(&request, &reply, is_nak);
        if warn {
            services.logf(
                log::Level::Warn,
                format_args!("broadcasting reply to {} with no relay/flag/client hint", request.chaddr),
            );
        }

        Some((reply.to_bytes(), peer))
    }
}

#[async_trait]
impl Resource for DhcpServer {
    fn id(&self) -> ResourceId {
        ResourceId {
            kind: "dhcp_server",
            name: self.name.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(Error::configuration_invalid("dhcp server interface must not be empty"));
        }
        Ok(())
    }

    async fn init(&self, services: Services) -> Result<()> {
        let identity = Arc::new(ServerIdentity::new(self.explicit_server_id, *self.listen.ip()));
        self.identity
            .set(identity)
            .map_err(|_| Error::programmer("dhcp_server.init called twice"))?;

        let children = self.children.lock().clone();

        for child in &children {
            child.init(services.for_child(child.id())).await?;
        }

        let host_addrs: Vec<Ipv4Addr> = children
            .iter()
            .filter_map(|c| c.as_any().downcast_ref::<Host>())
            .map(|h| h.address)
            .collect();

        for child in &children {
            if let Some(range) = child.as_any().downcast_ref::<Range>() {
                for addr in &host_addrs {
                    let n = u32::from(*addr);
                    if n >= u32::from(range.from) && n < u32::from(range.to) {
                        range.reserve_externally(*addr);
                    }
                }
            }
        }

        let mut chain: Vec<Arc<dyn Handler>> = vec![
            Arc::new(LeaseTimeHandler {
                default_seconds: self.default_lease_seconds,
            }),
            Arc::new(ServerIdHandler {
                identity: self.identity().clone(),
            }),
            Arc::new(DnsHandler {
                servers: self.dns.clone(),
            }),
            Arc::new(RouterHandler {
                routers: self.routers.clone(),
            }),
        ];
        for child in &children {
            if let Some(host) = child.as_any().downcast_ref::<Host>() {
                chain.push(host.handler());
            }
        }
        for child in &children {
            if let Some(range) = child.as_any().downcast_ref::<Range>() {
                chain.push(range.handler());
            }
        }
        self.chain
            .set(chain)
            .map_err(|_| Error::programmer("dhcp_server.init called twice"))?;

        self.running
            .set(services.running_signal())
            .map_err(|_| Error::programmer("dhcp_server.init called twice"))?;
        self.events
            .set(services.event_sender())
            .map_err(|_| Error::programmer("dhcp_server.init called twice"))?;

        Ok(())
    }

    async fn watch(&self, mut ctx: ShutdownCtx) -> Result<()> {
        let socket = UdpSocket::bind(SocketAddr::V4(self.listen))
            .await
            .map_err(|e| Error::watch_failure(format!("bind {}: {e}", self.listen)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| Error::watch_failure(format!("set_broadcast: {e}")))?;

        let services = Services::new(
            self.id(),
            false,
            ctx.clone(),
            self.running.get().expect("init runs before watch").clone(),
            self.events.get().expect("init runs before watch").clone(),
            std::path::PathBuf::from("/var/lib/mgmtd"),
            Arc::new(parking_lot::RwLock::new(ahash::AHashMap::new())),
        );

        services.running();

        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = result.map_err(|e| Error::watch_failure(format!("recv_from: {e}")))?;
                    match self.handle_datagram(&buf[..len], &services) {
                        Some((bytes, peer)) => {
                            if let Err(e) = socket.send_to(&bytes, peer).await {
                                services.logf(log::Level::Error, format_args!("send_to {peer}: {e}"));
                            } else {
                                services.event();
                            }
                        }
                        None => {
                            services.logf(log::Level::Debug, format_args!("dropped packet from {src}"));
                        }
                    }
                }
                _ = ctx.cancelled() => return Ok(()),
            }
        }
    }

    async fn check_apply(&self, _apply_permitted: bool) -> Result<bool> {
        // Resolving the server identifier is the only reconcilable
        // state at this level; everything else is handled per-packet.
        // Spec §9(a): the exact failure mode when this runs before the
        // interface is up is left to the engine's retry policy, so we
        // simply force resolution and let a future retry happen if the
        // configured interface genuinely never comes up.
        self.identity().get();
        Ok(true)
    }

    fn cmp(&self, other: &dyn Resource) -> Option<String> {
        let other = other.as_any().downcast_ref::<DhcpServer>()?;
        if other.listen != self.listen {
            return Some("listen address changed".to_string());
        }
        if other.interface != self.interface {
            return Some("interface changed".to_string());
        }
        None
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_group_parent(&self) -> Option<&dyn GroupParent> {
        Some(self)
    }
}

impl GroupParent for DhcpServer {
    fn group_cmp(&self, candidate: &dyn Resource) -> bool {
        candidate.as_any().is::<Host>() || candidate.as_any().is::<Range>()
    }

    fn absorb(&self, child: Arc<dyn Resource>) {
        self.children.lock().push(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_peer_prefers_the_relay_agent() {
        let mut request = Packet {
            op: 1,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::new(10, 0, 0, 1),
            chaddr: crate::dhcp::lease::MacAddr([0; 6]),
            options: vec![],
        };
        let reply = request.reply_template(MessageType::Offer);
        let (peer, warn) = DhcpServer::select_peer(&request, &reply, false);
        assert_eq!(peer, SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), SERVER_PORT));
        assert!(!warn);

        request.giaddr = Ipv4Addr::UNSPECIFIED;
        let (peer, warn) = DhcpServer::select_peer(&request, &reply, false);
        assert_eq!(peer, SocketAddr::new(Ipv4Addr::BROADCAST.into(), CLIENT_PORT));
        assert!(warn);
    }

    #[test]
    fn select_peer_nak_always_broadcasts() {
        let request = Packet {
            op: 1,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::new(192, 0, 2, 5),
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: crate::dhcp::lease::MacAddr([0; 6]),
            options: vec![],
        };
        let reply = request.reply_template(MessageType::Nak);
        let (peer, warn) = DhcpServer::select_peer(&request, &reply, true);
        assert_eq!(peer, SocketAddr::new(Ipv4Addr::BROADCAST.into(), CLIENT_PORT));
        assert!(!warn);
    }
}
