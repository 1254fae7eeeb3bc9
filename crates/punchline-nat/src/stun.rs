//! STUN Binding transactions (RFC 5389 subset)
//!
//! Only what NAT discovery needs is implemented: Binding Requests and
//! Responses, XOR-MAPPED-ADDRESS and MAPPED-ADDRESS, IPv4 only. The
//! [`StunServer`] answers Binding Requests with the observed source address
//! so a deployment can host its own reflexive endpoints and so the probe path
//! can be exercised over loopback.

use crate::error::StunError;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Default deadline for a single Binding transaction
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Interleave method and class bits into the 14-bit message type
    ///
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    #[must_use]
    pub fn encode(self, class: StunMessageClass) -> u16 {
        let method: u16 = match self {
            Self::Binding => 0x0001,
        };

        let class_bits: u16 = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        let m0_m3 = method & 0x0F;
        let c0 = (class_bits & 0x01) << 4;
        let m4_m6 = (method & 0x70) << 1;
        let c1 = (class_bits & 0x02) << 7;
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }

    /// Split a wire message type back into method and class
    ///
    /// # Errors
    ///
    /// Returns [`StunError::InvalidMessageType`] for methods other than Binding.
    pub fn decode(msg_type: u16) -> Result<(Self, StunMessageClass), StunError> {
        let c0 = (msg_type >> 4) & 0x01;
        let c1 = (msg_type >> 8) & 0x01;

        let class = match c0 | (c1 << 1) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let method = (msg_type & 0x0F) | ((msg_type >> 1) & 0x70) | ((msg_type >> 2) & 0xF80);
        match method {
            0x0001 => Ok((Self::Binding, class)),
            _ => Err(StunError::InvalidMessageType),
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001), plain encoding
    MappedAddress(SocketAddrV4),
    /// XOR-MAPPED-ADDRESS (0x0020), preferred over MAPPED-ADDRESS
    XorMappedAddress(SocketAddrV4),
    /// Any attribute this implementation does not interpret
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let value = match self {
            Self::MappedAddress(addr) => address_value(addr.port(), addr.ip().octets()),
            Self::XorMappedAddress(addr) => {
                let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
                let mut ip = addr.ip().octets();
                xor_with_cookie(&mut ip);
                address_value(port, ip)
            }
            Self::Unknown(_, data) => data.clone(),
        };

        out.extend_from_slice(&self.attr_type().to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(&value);

        let padding = (4 - (value.len() % 4)) % 4;
        out.extend(std::iter::repeat_n(0, padding));
    }

    fn decode(attr_type: u16, value: &[u8]) -> Result<Self, StunError> {
        match attr_type {
            ATTR_MAPPED_ADDRESS => {
                let (port, ip) = parse_address_value(value)?;
                Ok(Self::MappedAddress(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
            }
            ATTR_XOR_MAPPED_ADDRESS => {
                let (xor_port, mut ip) = parse_address_value(value)?;
                xor_with_cookie(&mut ip);
                let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;
                Ok(Self::XorMappedAddress(SocketAddrV4::new(
                    Ipv4Addr::from(ip),
                    port,
                )))
            }
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

fn address_value(port: u16, ip: [u8; 4]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8);
    value.push(0);
    value.push(FAMILY_IPV4);
    value.extend_from_slice(&port.to_be_bytes());
    value.extend_from_slice(&ip);
    value
}

fn parse_address_value(value: &[u8]) -> Result<(u16, [u8; 4]), StunError> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return Err(StunError::InvalidAttribute);
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = [value[4], value[5], value[6], value[7]];
    Ok((port, ip))
}

fn xor_with_cookie(ip: &mut [u8; 4]) {
    for (byte, key) in ip.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
        *byte ^= key;
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message method
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a Binding Request with a fresh random transaction id
    #[must_use]
    pub fn binding_request() -> Self {
        use rand::RngCore;
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a Binding Response reporting `mapped` for `transaction_id`
    #[must_use]
    pub fn binding_response(transaction_id: [u8; 12], mapped: SocketAddrV4) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: vec![
                StunAttribute::XorMappedAddress(mapped),
                StunAttribute::MappedAddress(mapped),
            ],
        }
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 24);

        bytes.extend_from_slice(&self.message_type.encode(self.message_class).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            attr.encode(&mut bytes);
        }

        // Length excludes the 20-byte header
        let msg_length = (bytes.len() - HEADER_SIZE) as u16;
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());

        bytes
    }

    /// Decode message from bytes
    ///
    /// Malformed individual attributes are skipped rather than failing the
    /// whole message.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is truncated, the magic cookie does not
    /// match, or the method is not Binding.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..HEADER_SIZE]);

        let (message_type, message_class) = StunMessageType::decode(msg_type)?;

        let end = bytes.len().min(HEADER_SIZE + msg_length);
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_length > end {
                break;
            }

            match StunAttribute::decode(attr_type, &bytes[offset..offset + attr_length]) {
                Ok(attr) => attributes.push(attr),
                Err(_) => trace!("skipping malformed STUN attribute {attr_type:#06x}"),
            }

            offset += attr_length + (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// The mapped address, preferring XOR-MAPPED-ADDRESS over MAPPED-ADDRESS
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddrV4> {
        let xor = self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        });

        xor.or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }
}

/// Resolve `host` and pick its first IPv4 address
///
/// # Errors
///
/// Returns [`StunError::Resolve`] if lookup fails or yields no IPv4 address.
pub async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, StunError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| StunError::Resolve(format!("{host}:{port}")))?;

    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StunError::Resolve(format!("{host}:{port}")))
}

/// Perform one Binding transaction against `host:port` with the default deadline
///
/// # Errors
///
/// See [`probe_addr`].
pub async fn probe(socket: &UdpSocket, host: &str, port: u16) -> Result<SocketAddr, StunError> {
    let server = resolve_ipv4(host, port).await?;
    probe_addr(socket, server, DEFAULT_TIMEOUT).await
}

/// Perform one Binding transaction against an already resolved server
///
/// Datagrams from any address other than `server`, datagrams that are not
/// STUN, and responses carrying a different transaction id are ignored
/// until the deadline.
///
/// # Errors
///
/// - [`StunError::Timeout`] if no matching response arrives in time
/// - [`StunError::NoUsableResponse`] if the matching response has no IPv4 mapping
/// - [`StunError::Io`] on socket failure
pub async fn probe_addr(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr, StunError> {
    let request = StunMessage::binding_request();
    socket.send_to(&request.encode(), server).await?;
    debug!("STUN binding request sent to {server}");

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1024];

    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
        {
            Ok(received) => received?,
            Err(_) => return Err(StunError::Timeout(server)),
        };

        if from != server {
            trace!("ignoring datagram from {from}, expected {server}");
            continue;
        }

        let Ok(response) = StunMessage::decode(&buf[..len]) else {
            trace!("ignoring non-STUN datagram from {from}");
            continue;
        };

        if response.transaction_id != request.transaction_id {
            trace!("ignoring STUN response with foreign transaction id from {from}");
            continue;
        }

        if response.message_class != StunMessageClass::SuccessResponse {
            return Err(StunError::NoUsableResponse(server));
        }

        let mapped = response
            .mapped_address()
            .ok_or(StunError::NoUsableResponse(server))?;
        debug!("STUN server {server} reports mapping {mapped}");
        return Ok(SocketAddr::V4(mapped));
    }
}

/// Minimal STUN responder
///
/// Answers every Binding Request with the source address it was observed
/// from. IPv6 sources are ignored.
pub struct StunServer {
    socket: UdpSocket,
}

impl StunServer {
    /// Bind a responder to `addr`
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, StunError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Get local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_addr(&self) -> Result<SocketAddr, StunError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve Binding Requests until the socket fails
    ///
    /// # Errors
    ///
    /// Returns the socket error that stopped the loop.
    pub async fn run(self) -> Result<(), StunError> {
        debug!("STUN responder listening on {}", self.socket.local_addr()?);
        let mut buf = [0u8; 1024];

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            };

            let request = match StunMessage::decode(&buf[..len]) {
                Ok(msg) if msg.message_class == StunMessageClass::Request => msg,
                _ => continue,
            };

            let SocketAddr::V4(source) = from else {
                continue;
            };

            let response = StunMessage::binding_response(request.transaction_id, source);
            if let Err(e) = self.socket.send_to(&response.encode(), from).await {
                warn!("STUN response to {from} failed: {e}");
            }
        }
    }
}

/// Errors that ICMP feedback can surface on an unconnected UDP socket
pub(crate) fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_message_type_encoding() {
        assert_eq!(
            StunMessageType::Binding.encode(StunMessageClass::Request),
            0x0001
        );
        assert_eq!(
            StunMessageType::Binding.encode(StunMessageClass::SuccessResponse),
            0x0101
        );
        assert_eq!(
            StunMessageType::decode(0x0111).unwrap(),
            (StunMessageType::Binding, StunMessageClass::ErrorResponse)
        );
        assert!(StunMessageType::decode(0x0003).is_err());
    }

    #[test]
    fn test_binding_request_header() {
        let request = StunMessage::binding_request();
        let bytes = request.encode();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&bytes[8..20], &request.transaction_id);
    }

    #[test]
    fn test_xor_mapped_address_known_vector() {
        // 192.0.2.1:32853 XOR-encoded against the magic cookie
        let mut bytes = vec![0x01, 0x01, 0x00, 0x0C, 0x21, 0x12, 0xA4, 0x42];
        bytes.extend_from_slice(&[7u8; 12]);
        bytes.extend_from_slice(&[0x00, 0x20, 0x00, 0x08]);
        bytes.extend_from_slice(&[0x00, 0x01, 0xA1, 0x47, 0xE1, 0x12, 0xA6, 0x43]);

        let msg = StunMessage::decode(&bytes).unwrap();
        assert_eq!(msg.message_class, StunMessageClass::SuccessResponse);
        assert_eq!(
            msg.mapped_address(),
            Some("192.0.2.1:32853".parse().unwrap())
        );
    }

    #[test]
    fn test_mapped_address_fallback() {
        let addr: SocketAddrV4 = "198.51.100.4:5000".parse().unwrap();
        let msg = StunMessage {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id: [1; 12],
            attributes: vec![StunAttribute::MappedAddress(addr)],
        };

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.mapped_address(), Some(addr));
    }

    #[test]
    fn test_xor_mapped_preferred() {
        let xor: SocketAddrV4 = "203.0.113.9:6000".parse().unwrap();
        let plain: SocketAddrV4 = "10.0.0.1:6000".parse().unwrap();
        let msg = StunMessage {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id: [2; 12],
            attributes: vec![
                StunAttribute::MappedAddress(plain),
                StunAttribute::XorMappedAddress(xor),
            ],
        };

        assert_eq!(msg.mapped_address(), Some(xor));
    }

    #[test]
    fn test_unknown_attribute_padding_skipped() {
        let addr: SocketAddrV4 = "203.0.113.9:6000".parse().unwrap();
        let msg = StunMessage {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id: [3; 12],
            attributes: vec![
                StunAttribute::Unknown(0x8022, b"punch".to_vec()),
                StunAttribute::XorMappedAddress(addr),
            ],
        };

        let bytes = msg.encode();
        // 4 + 5 value bytes padded to 8, then 4 + 8
        assert_eq!(bytes.len(), HEADER_SIZE + 12 + 12);
        assert_eq!(StunMessage::decode(&bytes).unwrap().mapped_address(), Some(addr));
    }

    #[test]
    fn test_ipv6_family_is_not_usable() {
        let mut bytes = vec![0x01, 0x01, 0x00, 0x18, 0x21, 0x12, 0xA4, 0x42];
        bytes.extend_from_slice(&[0u8; 12]);
        bytes.extend_from_slice(&[0x00, 0x20, 0x00, 0x14, 0x00, 0x02, 0x00, 0x50]);
        bytes.extend_from_slice(&[0u8; 16]);

        let msg = StunMessage::decode(&bytes).unwrap();
        assert!(msg.mapped_address().is_none());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::MessageTooShort)
        ));

        let mut bytes = StunMessage::binding_request().encode();
        bytes[4] = 0xFF;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::InvalidMagicCookie)
        ));
    }

    #[tokio::test]
    async fn test_probe_against_local_server() {
        let server = StunServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapped = probe(&socket, "127.0.0.1", server_addr.port()).await.unwrap();

        assert_eq!(mapped, socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_probe_ignores_foreign_transaction() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapped: SocketAddrV4 = "198.51.100.20:7000".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();

            let stale = StunMessage::binding_response([9; 12], "192.0.2.99:1".parse().unwrap());
            server.send_to(&stale.encode(), from).await.unwrap();
            server.send_to(b"not stun", from).await.unwrap();

            let real = StunMessage::binding_response(request.transaction_id, mapped);
            server.send_to(&real.encode(), from).await.unwrap();
        });

        let result = probe_addr(&client, server_addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, SocketAddr::V4(mapped));
    }

    #[tokio::test]
    async fn test_probe_ignores_other_sources() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapped: SocketAddrV4 = "198.51.100.30:7100".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();

            // Right transaction id, wrong sender, delivered first
            let spoofed = StunMessage::binding_response(
                request.transaction_id,
                "192.0.2.66:6666".parse().unwrap(),
            );
            intruder.send_to(&spoofed.encode(), from).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            let real = StunMessage::binding_response(request.transaction_id, mapped);
            server.send_to(&real.encode(), from).await.unwrap();
        });

        let result = probe_addr(&client, server_addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, SocketAddr::V4(mapped));
    }

    #[tokio::test]
    async fn test_probe_no_usable_response() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let empty = StunMessage {
                message_type: StunMessageType::Binding,
                message_class: StunMessageClass::SuccessResponse,
                transaction_id: request.transaction_id,
                attributes: Vec::new(),
            };
            server.send_to(&empty.encode(), from).await.unwrap();
        });

        let err = probe_addr(&client, server_addr, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StunError::NoUsableResponse(addr) if addr == server_addr));
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let err = probe_addr(
            &client,
            silent.local_addr().unwrap(),
            Duration::from_millis(150),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StunError::Timeout(_)));
    }
}
