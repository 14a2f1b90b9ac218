//! ICE building blocks: candidate lines, credentials and a STUN codec.
//!
//! Covers what the UDP transport needs from RFC 5389 (STUN) and RFC 8445
//! (ICE): Binding requests and responses with USERNAME, PRIORITY,
//! ICE-CONTROLLING/CONTROLLED, USE-CANDIDATE, XOR-MAPPED-ADDRESS,
//! MESSAGE-INTEGRITY and FINGERPRINT.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

use super::transport::TransportError;

type HmacSha1 = Hmac<Sha1>;

const MAGIC_COOKIE: u32 = 0x2112A442;
const HEADER_LEN: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354554e;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

/// Public STUN server used for server-reflexive candidates by default.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Characters allowed in ice-ufrag / ice-pwd (RFC 8839 `ice-char`).
const ICE_CHARS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

// CRC-32 (IEEE, reflected) for the FINGERPRINT attribute.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB88320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(!0u32, |crc, &b| {
        CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    // HMAC accepts keys of any length.
    if let Ok(mut mac) = HmacSha1::new_from_slice(key) {
        mac.update(data);
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    if getrandom::getrandom(&mut buf).is_err() {
        for chunk in buf.chunks_mut(16) {
            let id = uuid::Uuid::new_v4();
            chunk.copy_from_slice(&id.as_bytes()[..chunk.len()]);
        }
    }
    buf
}

fn random_token(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        for b in random_bytes::<16>() {
            if out.len() == len {
                break;
            }
            out.push(ICE_CHARS[(b & 63) as usize] as char);
        }
    }
    out
}

/// Fresh random STUN transaction id.
pub fn transaction_id() -> [u8; 12] {
    random_bytes()
}

/// Random ICE role tie-breaker.
pub fn tie_breaker() -> u64 {
    u64::from_be_bytes(random_bytes())
}

// ---------------------------------------------------------------------------
// Credentials and candidates
// ---------------------------------------------------------------------------

/// Local or remote ice-ufrag / ice-pwd pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Self {
        Self {
            ufrag: random_token(8),
            pwd: random_token(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateKind {
    fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

/// Candidate priority per RFC 8445 section 5.1.2.1.
pub fn priority(kind: CandidateKind, local_preference: u16, component: u8) -> u32 {
    (kind.type_preference() << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// A UDP ICE candidate, as carried in `candidate:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub priority: u32,
    pub addr: SocketAddr,
    pub kind: CandidateKind,
    pub related: Option<SocketAddr>,
}

impl Candidate {
    pub fn host(addr: SocketAddr) -> Self {
        Self {
            foundation: "1".into(),
            component: 1,
            priority: priority(CandidateKind::Host, 65535, 1),
            addr,
            kind: CandidateKind::Host,
            related: None,
        }
    }

    pub fn server_reflexive(addr: SocketAddr, base: SocketAddr) -> Self {
        Self {
            foundation: "2".into(),
            component: 1,
            priority: priority(CandidateKind::ServerReflexive, 65535, 1),
            addr,
            kind: CandidateKind::ServerReflexive,
            related: Some(base),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} udp {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.kind.as_str()
        )?;
        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

impl FromStr for Candidate {
    type Err = TransportError;

    /// Accepts `candidate:...` with or without the SDP `a=` prefix. TCP and
    /// mDNS (`*.local`) candidates are rejected; this transport can't use them.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| TransportError::Candidate(format!("{why}: {}", line.trim()));

        let line = line.trim();
        let body = line
            .strip_prefix("a=")
            .unwrap_or(line)
            .strip_prefix("candidate:")
            .ok_or_else(|| bad("not a candidate line"))?;

        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(bad("truncated candidate"));
        }
        if !parts[2].eq_ignore_ascii_case("udp") {
            return Err(bad("unsupported transport"));
        }

        let component = parts[1].parse().map_err(|_| bad("bad component"))?;
        let priority = parts[3].parse().map_err(|_| bad("bad priority"))?;
        let ip: IpAddr = parts[4].parse().map_err(|_| bad("unresolvable address"))?;
        let port: u16 = parts[5].parse().map_err(|_| bad("bad port"))?;
        let kind = match parts[7] {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            "prflx" => CandidateKind::PeerReflexive,
            "relay" => CandidateKind::Relay,
            _ => return Err(bad("unknown candidate type")),
        };

        let mut raddr = None;
        let mut rport = None;
        for pair in parts[8..].chunks(2) {
            match pair {
                ["raddr", value] => raddr = value.parse::<IpAddr>().ok(),
                ["rport", value] => rport = value.parse::<u16>().ok(),
                _ => {}
            }
        }

        Ok(Self {
            foundation: parts[0].to_string(),
            component,
            priority,
            addr: SocketAddr::new(ip, port),
            kind,
            related: raddr.zip(rport).map(|(ip, port)| SocketAddr::new(ip, port)),
        })
    }
}

/// The local address the OS would route outbound traffic from.
pub fn outbound_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

// ---------------------------------------------------------------------------
// STUN codec
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("not a STUN message")]
    NotStun,
    #[error("unsupported STUN message type {0:#06x}")]
    UnsupportedType(u16),
    #[error("truncated STUN attribute")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    Request,
    Success,
    Error,
}

impl StunClass {
    fn message_type(self) -> u16 {
        match self {
            Self::Request => BINDING_REQUEST,
            Self::Success => BINDING_SUCCESS,
            Self::Error => BINDING_ERROR,
        }
    }
}

/// ICE role attribute with its tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling(u64),
    Controlled(u64),
}

/// A STUN Binding message with the attributes ICE cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub class: StunClass,
    pub transaction_id: [u8; 12],
    pub username: Option<String>,
    pub priority: Option<u32>,
    pub role: Option<IceRole>,
    pub use_candidate: bool,
    pub mapped_address: Option<SocketAddr>,
    pub error_code: Option<u16>,
}

impl StunMessage {
    fn empty(class: StunClass, transaction_id: [u8; 12]) -> Self {
        Self {
            class,
            transaction_id,
            username: None,
            priority: None,
            role: None,
            use_candidate: false,
            mapped_address: None,
            error_code: None,
        }
    }

    /// Plain Binding request, as sent to a STUN server.
    pub fn binding_request() -> Self {
        Self::empty(StunClass::Request, transaction_id())
    }

    /// ICE connectivity check. `username` is `remote_ufrag:local_ufrag`.
    pub fn connectivity_check(username: String, priority: u32, role: IceRole) -> Self {
        Self {
            username: Some(username),
            priority: Some(priority),
            use_candidate: matches!(role, IceRole::Controlling(_)),
            role: Some(role),
            ..Self::empty(StunClass::Request, transaction_id())
        }
    }

    /// Success response reflecting the requester's address.
    pub fn success(transaction_id: [u8; 12], mapped: SocketAddr) -> Self {
        Self {
            mapped_address: Some(mapped),
            ..Self::empty(StunClass::Success, transaction_id)
        }
    }

    pub fn error(transaction_id: [u8; 12], code: u16) -> Self {
        Self {
            error_code: Some(code),
            ..Self::empty(StunClass::Error, transaction_id)
        }
    }

    /// Serialize. With a key, MESSAGE-INTEGRITY and FINGERPRINT are appended.
    pub fn encode(&self, integrity_key: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.class.message_type().to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        if let Some(username) = &self.username {
            put_attr(&mut buf, ATTR_USERNAME, username.as_bytes());
        }
        if let Some(priority) = self.priority {
            put_attr(&mut buf, ATTR_PRIORITY, &priority.to_be_bytes());
        }
        match self.role {
            Some(IceRole::Controlling(tb)) => put_attr(&mut buf, ATTR_ICE_CONTROLLING, &tb.to_be_bytes()),
            Some(IceRole::Controlled(tb)) => put_attr(&mut buf, ATTR_ICE_CONTROLLED, &tb.to_be_bytes()),
            None => {}
        }
        if self.use_candidate {
            put_attr(&mut buf, ATTR_USE_CANDIDATE, &[]);
        }
        if let Some(addr) = self.mapped_address {
            put_attr(&mut buf, ATTR_XOR_MAPPED_ADDRESS, &xor_address(addr, &self.transaction_id));
        }
        if let Some(code) = self.error_code {
            let value = [0, 0, (code / 100) as u8, (code % 100) as u8];
            put_attr(&mut buf, ATTR_ERROR_CODE, &value);
        }

        if let Some(key) = integrity_key {
            set_length(&mut buf, 24);
            let mac = hmac_sha1(key, &buf);
            put_attr(&mut buf, ATTR_MESSAGE_INTEGRITY, &mac);

            set_length(&mut buf, 8);
            let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
            put_attr(&mut buf, ATTR_FINGERPRINT, &fingerprint.to_be_bytes());
        } else {
            set_length(&mut buf, 0);
        }
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, StunError> {
        if !is_stun(data) {
            return Err(StunError::NotStun);
        }
        let message_type = u16::from_be_bytes([data[0], data[1]]);
        let class = match message_type {
            BINDING_REQUEST => StunClass::Request,
            BINDING_SUCCESS => StunClass::Success,
            BINDING_ERROR => StunClass::Error,
            other => return Err(StunError::UnsupportedType(other)),
        };
        let mut txn = [0u8; 12];
        txn.copy_from_slice(&data[8..HEADER_LEN]);
        let mut msg = Self::empty(class, txn);

        for (attr, value) in attributes(data)? {
            match attr {
                ATTR_USERNAME => msg.username = Some(String::from_utf8_lossy(value).into_owned()),
                ATTR_PRIORITY => msg.priority = be_u32(value),
                ATTR_ICE_CONTROLLING => msg.role = be_u64(value).map(IceRole::Controlling),
                ATTR_ICE_CONTROLLED => msg.role = be_u64(value).map(IceRole::Controlled),
                ATTR_USE_CANDIDATE => msg.use_candidate = true,
                ATTR_XOR_MAPPED_ADDRESS => msg.mapped_address = unxor_address(value, &txn),
                ATTR_MAPPED_ADDRESS if msg.mapped_address.is_none() => {
                    msg.mapped_address = plain_address(value)
                }
                ATTR_ERROR_CODE if value.len() >= 4 => {
                    msg.error_code = Some((value[2] & 0x07) as u16 * 100 + value[3] as u16)
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// Cheap check that a datagram looks like STUN rather than media.
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// Check MESSAGE-INTEGRITY of a raw STUN message against `key`.
pub fn verify_integrity(data: &[u8], key: &[u8]) -> bool {
    let Ok(attrs) = attributes(data) else {
        return false;
    };
    let mut offset = HEADER_LEN;
    for (attr, value) in attrs {
        if attr == ATTR_MESSAGE_INTEGRITY && value.len() == 20 {
            let mut signed = data[..offset].to_vec();
            let length = (offset - HEADER_LEN + 24) as u16;
            signed[2..4].copy_from_slice(&length.to_be_bytes());
            return hmac_sha1(key, &signed) == value;
        }
        offset += 4 + ((value.len() + 3) & !3);
    }
    false
}

fn attributes(data: &[u8]) -> Result<Vec<(u16, &[u8])>, StunError> {
    let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = HEADER_LEN + declared;
    if end > data.len() {
        return Err(StunError::Truncated);
    }
    let mut out = Vec::new();
    let mut pos = HEADER_LEN;
    while pos + 4 <= end {
        let attr = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;
        if start + len > end {
            return Err(StunError::Truncated);
        }
        out.push((attr, &data[start..start + len]));
        pos = start + ((len + 3) & !3);
    }
    Ok(out)
}

fn put_attr(buf: &mut Vec<u8>, attr: u16, value: &[u8]) {
    buf.extend_from_slice(&attr.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + (4 - value.len() % 4) % 4, 0);
}

/// Write the header length as if `extra` more attribute bytes followed.
fn set_length(buf: &mut [u8], extra: usize) {
    let length = (buf.len() - HEADER_LEN + extra) as u16;
    buf[2..4].copy_from_slice(&length.to_be_bytes());
}

fn be_u32(value: &[u8]) -> Option<u32> {
    value.get(..4)?.try_into().ok().map(u32::from_be_bytes)
}

fn be_u64(value: &[u8]) -> Option<u64> {
    value.get(..8)?.try_into().ok().map(u64::from_be_bytes)
}

fn xor_key(txn: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(txn);
    key
}

fn xor_address(addr: SocketAddr, txn: &[u8; 12]) -> Vec<u8> {
    let key = xor_key(txn);
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let (family, octets): (u8, Vec<u8>) = match addr.ip() {
        IpAddr::V4(ip) => (1, ip.octets().to_vec()),
        IpAddr::V6(ip) => (2, ip.octets().to_vec()),
    };
    let mut value = vec![0, family];
    value.extend_from_slice(&port.to_be_bytes());
    value.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k));
    value
}

fn unxor_address(value: &[u8], txn: &[u8; 12]) -> Option<SocketAddr> {
    let key = xor_key(txn);
    let port = u16::from_be_bytes([*value.get(2)?, *value.get(3)?]) ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match value[1] {
        1 => {
            let raw: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            let mut octets = [0u8; 4];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = b ^ key[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        2 => {
            let raw: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            let mut octets = [0u8; 16];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = b ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn plain_address(value: &[u8]) -> Option<SocketAddr> {
    let port = u16::from_be_bytes([*value.get(2)?, *value.get(3)?]);
    match value[1] {
        1 => {
            let octets: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        _ => None,
    }
}
