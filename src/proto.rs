//! SOCKS5 wire protocol, restricted to the CONNECT subset (RFC 1928).

use bytes::{BufMut, BytesMut};
use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
const RESERVED: u8 = 0x00;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Authentication method selected during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    NoAuth,
    NoAcceptable,
}

impl Method {
    pub fn as_u8(self) -> u8 {
        match self {
            Method::NoAuth => METHOD_NO_AUTH,
            Method::NoAcceptable => METHOD_NO_ACCEPTABLE,
        }
    }
}

// +----+----------+----------+
// |VER | NMETHODS | METHODS  |
// +----+----------+----------+
// | 1  |    1     | 1 to 255 |
// +----+----------+----------+
#[derive(Debug)]
pub struct MethodRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodRequest {
    pub async fn read_from<S>(stream: &mut S) -> io::Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[1] == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no authentication methods offered",
            ));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;
        Ok(Self {
            version: header[0],
            methods,
        })
    }

    /// The reply method depends only on the offered set.
    pub fn select(&self) -> Method {
        if self.methods.contains(&METHOD_NO_AUTH) {
            Method::NoAuth
        } else {
            Method::NoAcceptable
        }
    }

    /// Whether the session may proceed past negotiation.
    pub fn accepted(&self) -> bool {
        self.version == VERSION && self.select() == Method::NoAuth
    }
}

pub async fn write_method_reply<S>(stream: &mut S, method: Method) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, method.as_u8()]).await
}

/// Destination address as it appeared on the wire. IPv6 and unknown address
/// types are carried through so the request can be rejected with the right
/// reply code after the framing has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAddr {
    Ipv4(Ipv4Addr),
    Domain(Vec<u8>),
    Ipv6,
    Unknown(u8),
}

// +----+-----+-------+------+----------+----------+
// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
// +----+-----+-------+------+----------+----------+
// | 1  |  1  | X'00' |  1   | Variable |    2     |
// +----+-----+-------+------+----------+----------+
pub struct ConnectRequest {
    pub version: u8,
    pub command: u8,
    pub addr: RequestAddr,
    pub port: u16,
}

impl ConnectRequest {
    /// Reads one request, always consuming the full address/port framing so
    /// the stream stays consistent even when the request is rejected.
    pub async fn read_from<S>(stream: &mut S) -> io::Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        let addr = match header[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                RequestAddr::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                stream.read_exact(&mut name).await?;
                RequestAddr::Domain(name)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                RequestAddr::Ipv6
            }
            // Unknown address types have no known length; nothing to consume.
            atyp => RequestAddr::Unknown(atyp),
        };

        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;

        Ok(Self {
            version: header[0],
            command: header[1],
            addr,
            port: u16::from_be_bytes(port),
        })
    }
}

/// Destination a request was accepted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(Ipv4Addr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: TargetAddr,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            TargetAddr::Ip(ip) => write!(f, "{}:{}", ip, self.port),
            TargetAddr::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decides the fate of a parsed request: the target to connect to, or the
/// reply code the client should be refused with.
pub fn evaluate(request: &ConnectRequest) -> Result<Target, Reply> {
    if request.command != CMD_CONNECT {
        return Err(Reply::CommandNotSupported);
    }
    let addr = match &request.addr {
        RequestAddr::Ipv4(ip) => TargetAddr::Ip(*ip),
        RequestAddr::Domain(raw) => match String::from_utf8(raw.clone()) {
            Ok(name) if !name.is_empty() => TargetAddr::Domain(name),
            _ => return Err(Reply::HostUnreachable),
        },
        RequestAddr::Ipv6 => return Err(Reply::AddressTypeNotSupported),
        RequestAddr::Unknown(_) => return Err(Reply::CommandNotSupported),
    };
    Ok(Target {
        addr,
        port: request.port,
    })
}

/// Writes the fixed 10-byte reply. The bound address echoed back is the
/// proxy's local client-facing address, success or not.
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bound: SocketAddr) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (octets, port) = match bound {
        SocketAddr::V4(v4) => (v4.ip().octets(), v4.port()),
        SocketAddr::V6(v6) => ([0u8; 4], v6.port()),
    };

    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(VERSION);
    buf.put_u8(reply.as_u8());
    buf.put_u8(RESERVED);
    buf.put_u8(ATYP_IPV4);
    buf.put_slice(&octets);
    buf.put_u16(port);
    stream.write_all(&buf).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn negotiation_selects_no_auth_when_offered() {
        let mut input: &[u8] = &[0x05, 0x02, 0x02, 0x00];
        let request = MethodRequest::read_from(&mut input).await.unwrap();
        assert_eq!(request.select(), Method::NoAuth);
        assert!(request.accepted());
    }

    #[tokio::test]
    async fn negotiation_rejects_without_no_auth() {
        let mut input: &[u8] = &[0x05, 0x01, 0x02];
        let request = MethodRequest::read_from(&mut input).await.unwrap();
        assert_eq!(request.select(), Method::NoAcceptable);
        assert!(!request.accepted());
    }

    #[tokio::test]
    async fn negotiation_rejects_wrong_version() {
        let mut input: &[u8] = &[0x04, 0x01, 0x00];
        let request = MethodRequest::read_from(&mut input).await.unwrap();
        assert_eq!(request.select(), Method::NoAuth);
        assert!(!request.accepted());
    }

    #[tokio::test]
    async fn negotiation_fails_on_short_input() {
        let mut input: &[u8] = &[0x05];
        let err = MethodRequest::read_from(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut input: &[u8] = &[0x05, 0x02, 0x00];
        let err = MethodRequest::read_from(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // A complete two-byte message offering zero methods is no better.
        let mut input: &[u8] = &[0x05, 0x00];
        let err = MethodRequest::read_from(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn connect_request_parses_ipv4() {
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x01, 192, 0, 2, 1, 0x01, 0xBB];
        let request = ConnectRequest::read_from(&mut input).await.unwrap();
        assert_eq!(request.version, 0x05);
        assert_eq!(request.command, 0x01);
        assert_eq!(request.addr, RequestAddr::Ipv4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(request.port, 443);
        assert!(input.is_empty());
    }

    #[tokio::test]
    async fn connect_request_parses_domain() {
        let mut input: &[u8] = &[
            0x05, 0x01, 0x00, 0x03, 0x0B, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c',
            b'o', b'm', 0x00, 0x50,
        ];
        let request = ConnectRequest::read_from(&mut input).await.unwrap();
        assert_eq!(request.addr, RequestAddr::Domain(b"example.com".to_vec()));
        assert_eq!(request.port, 80);
    }

    #[tokio::test]
    async fn connect_request_consumes_ipv6_framing() {
        let mut input = vec![0x05, 0x01, 0x00, 0x04];
        input.extend_from_slice(&[0u8; 16]);
        input.extend_from_slice(&[0x1F, 0x90]);
        let mut input = &input[..];
        let request = ConnectRequest::read_from(&mut input).await.unwrap();
        assert_eq!(request.addr, RequestAddr::Ipv6);
        assert_eq!(request.port, 8080);
        assert!(input.is_empty());
    }

    fn request(command: u8, addr: RequestAddr) -> ConnectRequest {
        ConnectRequest {
            version: VERSION,
            command,
            addr,
            port: 80,
        }
    }

    #[test]
    fn evaluate_accepts_connect() {
        let target = evaluate(&request(
            CMD_CONNECT,
            RequestAddr::Ipv4(Ipv4Addr::LOCALHOST),
        ))
        .unwrap();
        assert_eq!(target.addr, TargetAddr::Ip(Ipv4Addr::LOCALHOST));
        assert_eq!(target.port, 80);

        let target = evaluate(&request(
            CMD_CONNECT,
            RequestAddr::Domain(b"example.com".to_vec()),
        ))
        .unwrap();
        assert_eq!(target.addr, TargetAddr::Domain("example.com".into()));
    }

    #[test]
    fn evaluate_rejects_unsupported_requests() {
        let bind = evaluate(&request(0x02, RequestAddr::Ipv4(Ipv4Addr::LOCALHOST)));
        assert_eq!(bind.unwrap_err(), Reply::CommandNotSupported);

        let ipv6 = evaluate(&request(CMD_CONNECT, RequestAddr::Ipv6));
        assert_eq!(ipv6.unwrap_err(), Reply::AddressTypeNotSupported);

        let unknown = evaluate(&request(CMD_CONNECT, RequestAddr::Unknown(0x7F)));
        assert_eq!(unknown.unwrap_err(), Reply::CommandNotSupported);

        let bad_utf8 = evaluate(&request(CMD_CONNECT, RequestAddr::Domain(vec![0xFF, 0xFE])));
        assert_eq!(bad_utf8.unwrap_err(), Reply::HostUnreachable);

        let empty = evaluate(&request(CMD_CONNECT, RequestAddr::Domain(Vec::new())));
        assert_eq!(empty.unwrap_err(), Reply::HostUnreachable);
    }

    #[tokio::test]
    async fn reply_layout_is_ten_bytes() {
        let mut out = io::Cursor::new(Vec::new());
        let bound: SocketAddr = "10.1.2.3:1080".parse().unwrap();
        write_reply(&mut out, Reply::HostUnreachable, bound)
            .await
            .unwrap();
        assert_eq!(
            out.into_inner(),
            [0x05, 0x04, 0x00, 0x01, 10, 1, 2, 3, 0x04, 0x38]
        );
    }
}
