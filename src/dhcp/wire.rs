//! DHCPv4 wire format (spec §6, RFC 2131/2132).
//!
//! Parse/serialize for the fixed BOOTP header plus the option TLVs
//! this server reads and writes. Field names follow RFC 2131 §2
//! (`op`, `xid`, `ciaddr`, `yiaddr`, `siaddr`, `giaddr`, `chaddr`,
//! `flags`) rather than the friendlier names used elsewhere in this
//! crate, matching the packet layout the RFC itself defines.

use std::net::Ipv4Addr;

use crate::dhcp::lease::MacAddr;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const HLEN_ETHERNET: u8 = 6;
const FLAG_BROADCAST: u16 = 0x8000;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_HOST_NAME: u8 = 12;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_TFTP_SERVER_NAME: u8 = 66;
const OPT_BOOTFILE_NAME: u8 = 67;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

/// An option value as read from, or to be written to, the wire.
#[derive(Debug, Clone)]
pub enum Option_ {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    Dns(Vec<Ipv4Addr>),
    HostName(String),
    RequestedIp(Ipv4Addr),
    LeaseTimeSeconds(u32),
    MessageType(MessageType),
    ServerId(Ipv4Addr),
    TftpServerName(String),
    BootfileName(String),
    Other(u8, Vec<u8>),
}

/// A parsed DHCPv4 packet, options kept in on-the-wire order.
#[derive(Debug, Clone)]
pub struct Packet {
    pub op: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub options: Vec<Option_>,
}

impl Packet {
    pub fn is_request(&self) -> bool {
        self.op == BOOTREQUEST
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|o| match o {
            Option_::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|o| match o {
            Option_::ServerId(a) => Some(*a),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|o| match o {
            Option_::RequestedIp(a) => Some(*a),
            _ => None,
        })
    }

    /// Builds the Offer/Ack/Nak reply template this server threads
    /// through the handler chain (spec §4.5): same `xid`/`flags`/
    /// `chaddr`/`giaddr` as the request, `op = BOOTREPLY`, no options
    /// yet.
    pub fn reply_template(&self, msg_type: MessageType) -> Packet {
        Packet {
            op: BOOTREPLY,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            options: vec![Option_::MessageType(msg_type)],
        }
    }

    pub fn set_message_type(&mut self, msg_type: MessageType) {
        self.options.retain(|o| !matches!(o, Option_::MessageType(_)));
        self.options.push(Option_::MessageType(msg_type));
    }

    /// Parses a UDP payload into a packet. Returns `None` on any
    /// structural malformation (short header, bad magic cookie, short
    /// option) — the caller logs and drops, per spec §4.5's failure
    /// semantics for the listener.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 240 {
            return None;
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        if htype != HTYPE_ETHERNET || hlen != HLEN_ETHERNET {
            return None;
        }

        let xid = u32::from_be_bytes(data[4..8].try_into().ok()?);
        let secs = u16::from_be_bytes(data[8..10].try_into().ok()?);
        let flags = u16::from_be_bytes(data[10..12].try_into().ok()?);
        let ciaddr = Ipv4Addr::from(<[u8; 4]>::try_from(&data[12..16]).ok()?);
        let yiaddr = Ipv4Addr::from(<[u8; 4]>::try_from(&data[16..20]).ok()?);
        let siaddr = Ipv4Addr::from(<[u8; 4]>::try_from(&data[20..24]).ok()?);
        let giaddr = Ipv4Addr::from(<[u8; 4]>::try_from(&data[24..28]).ok()?);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[28..34]);
        let chaddr = MacAddr(mac);

        if data[236..240] != MAGIC_COOKIE {
            return None;
        }

        let options = parse_options(&data[240..])?;

        Some(Packet {
            op,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options,
        })
    }

    /// Serializes this packet to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(300);
        buf.push(self.op);
        buf.push(HTYPE_ETHERNET);
        buf.push(HLEN_ETHERNET);
        buf.push(0); // hops
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr.0);
        buf.extend_from_slice(&[0u8; 10]); // chaddr padding to 16 bytes
        buf.extend_from_slice(&[0u8; 64]); // sname
        buf.extend_from_slice(&[0u8; 128]); // file
        buf.extend_from_slice(&MAGIC_COOKIE);

        for opt in &self.options {
            write_option(&mut buf, opt);
        }
        buf.push(OPT_END);

        buf
    }
}

fn parse_options(mut data: &[u8]) -> Option<Vec<Option_>> {
    let mut options = Vec::new();

    while !data.is_empty() {
        let code = data[0];
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            data = &data[1..];
            continue;
        }

        if data.len() < 2 {
            return None;
        }
        let len = data[1] as usize;
        if data.len() < 2 + len {
            return None;
        }
        let body = &data[2..2 + len];

        options.push(decode_option(code, body));
        data = &data[2 + len..];
    }

    Some(options)
}

fn ipv4_list(body: &[u8]) -> Vec<Ipv4Addr> {
    body.chunks_exact(4)
        .filter_map(|c| <[u8; 4]>::try_from(c).ok())
        .map(Ipv4Addr::from)
        .collect()
}

fn decode_option(code: u8, body: &[u8]) -> Option_ {
    match code {
        OPT_SUBNET_MASK if body.len() == 4 => {
            Option_::SubnetMask(Ipv4Addr::from(<[u8; 4]>::try_from(body).unwrap()))
        }
        OPT_ROUTER => Option_::Router(ipv4_list(body)),
        OPT_DNS => Option_::Dns(ipv4_list(body)),
        OPT_HOST_NAME => Option_::HostName(String::from_utf8_lossy(body).into_owned()),
        OPT_REQUESTED_IP if body.len() == 4 => {
            Option_::RequestedIp(Ipv4Addr::from(<[u8; 4]>::try_from(body).unwrap()))
        }
        OPT_LEASE_TIME if body.len() == 4 => {
            Option_::LeaseTimeSeconds(u32::from_be_bytes(body.try_into().unwrap()))
        }
        OPT_MESSAGE_TYPE if body.len() == 1 => match MessageType::from_u8(body[0]) {
            Some(t) => Option_::MessageType(t),
            None => Option_::Other(code, body.to_vec()),
        },
        OPT_SERVER_ID if body.len() == 4 => {
            Option_::ServerId(Ipv4Addr::from(<[u8; 4]>::try_from(body).unwrap()))
        }
        OPT_TFTP_SERVER_NAME => Option_::TftpServerName(String::from_utf8_lossy(body).into_owned()),
        OPT_BOOTFILE_NAME => Option_::BootfileName(String::from_utf8_lossy(body).into_owned()),
        _ => Option_::Other(code, body.to_vec()),
    }
}

fn write_option(buf: &mut Vec<u8>, opt: &Option_) {
    let mut push_tlv = |code: u8, body: &[u8]| {
        buf.push(code);
        buf.push(body.len() as u8);
        buf.extend_from_slice(body);
    };

    match opt {
        Option_::SubnetMask(a) => push_tlv(OPT_SUBNET_MASK, &a.octets()),
        Option_::Router(list) => {
            let body: Vec<u8> = list.iter().flat_map(|a| a.octets()).collect();
            push_tlv(OPT_ROUTER, &body);
        }
        Option_::Dns(list) => {
            let body: Vec<u8> = list.iter().flat_map(|a| a.octets()).collect();
            push_tlv(OPT_DNS, &body);
        }
        Option_::HostName(s) => push_tlv(OPT_HOST_NAME, s.as_bytes()),
        Option_::RequestedIp(a) => push_tlv(OPT_REQUESTED_IP, &a.octets()),
        Option_::LeaseTimeSeconds(secs) => push_tlv(OPT_LEASE_TIME, &secs.to_be_bytes()),
        Option_::MessageType(t) => push_tlv(OPT_MESSAGE_TYPE, &[t.to_u8()]),
        Option_::ServerId(a) => push_tlv(OPT_SERVER_ID, &a.octets()),
        Option_::TftpServerName(s) => push_tlv(OPT_TFTP_SERVER_NAME, s.as_bytes()),
        Option_::BootfileName(s) => push_tlv(OPT_BOOTFILE_NAME, s.as_bytes()),
        Option_::Other(code, body) => push_tlv(*code, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_discover(chaddr: [u8; 6]) -> Vec<u8> {
        let mut buf = vec![0u8; 240];
        buf[0] = BOOTREQUEST;
        buf[1] = HTYPE_ETHERNET;
        buf[2] = HLEN_ETHERNET;
        buf[4..8].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        buf[28..34].copy_from_slice(&chaddr);
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, 1]); // Discover
        buf.push(OPT_END);
        buf
    }

    #[test]
    fn parses_a_minimal_discover() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];
        let packet = Packet::parse(&sample_discover(mac)).expect("parses");
        assert!(packet.is_request());
        assert_eq!(packet.xid, 0xdead_beef);
        assert_eq!(packet.chaddr, MacAddr(mac));
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn round_trips_through_serialize() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];
        let packet = Packet::parse(&sample_discover(mac)).unwrap();
        let mut reply = packet.reply_template(MessageType::Offer);
        reply.yiaddr = Ipv4Addr::new(192, 0, 2, 10);
        reply.options.push(Option_::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)));
        reply.options.push(Option_::LeaseTimeSeconds(600));

        let bytes = reply.to_bytes();
        let reparsed = Packet::parse(&bytes).expect("reply re-parses");
        assert_eq!(reparsed.op, BOOTREPLY);
        assert_eq!(reparsed.yiaddr, Ipv4Addr::new(192, 0, 2, 10));
        assert_eq!(reparsed.message_type(), Some(MessageType::Offer));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(Packet::parse(&[0u8; 10]).is_none());
    }

    #[test]
    fn bad_magic_cookie_is_rejected() {
        let mut buf = sample_discover([0; 6]);
        buf[236] = 0; // corrupt the cookie
        assert!(Packet::parse(&buf).is_none());
    }
}
