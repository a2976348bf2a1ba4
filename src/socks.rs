//! The SOCKS5 address record sent as the first plaintext payload.
use core::fmt::{Display, Formatter};
use std::io::{self, ErrorKind, Write};
use std::net::{IpAddr, SocketAddr};

use crate::specification::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

/// A destination the remote relay should connect to.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum SocksAddr {
    /// A literal socket address.
    Ip(SocketAddr),
    /// A domain name the relay resolves, and a port.
    Domain(String, u16),
}

impl SocksAddr {
    /// Encodes the record: `atyp | addr | port`, port big-endian.
    ///
    /// Fails with [`ErrorKind::InvalidInput`] if a domain name is longer than
    /// 255 bytes.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Writes the record into `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            SocksAddr::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        w.write_all(&[ATYP_IPV4])?;
                        w.write_all(&ip.octets())?;
                    }
                    IpAddr::V6(ip) => {
                        w.write_all(&[ATYP_IPV6])?;
                        w.write_all(&ip.octets())?;
                    }
                }
                w.write_all(&addr.port().to_be_bytes())
            }
            SocksAddr::Domain(name, port) => {
                let nbytes = name.len();
                if nbytes > u8::MAX as usize {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        "domain name length exceeds 255 bytes",
                    ));
                }
                w.write_all(&[ATYP_DOMAIN, nbytes as u8])?;
                w.write_all(name.as_bytes())?;
                w.write_all(&port.to_be_bytes())
            }
        }
    }

    /// Length of the encoded record.
    pub fn serialized_len(&self) -> usize {
        match self {
            SocksAddr::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            SocksAddr::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            SocksAddr::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }
}

impl From<SocketAddr> for SocksAddr {
    fn from(addr: SocketAddr) -> Self {
        SocksAddr::Ip(addr)
    }
}

impl From<(&str, u16)> for SocksAddr {
    fn from((host, port): (&str, u16)) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => SocksAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => SocksAddr::Domain(host.to_string(), port),
        }
    }
}

impl Display for SocksAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            SocksAddr::Ip(addr) => write!(f, "{}", addr),
            SocksAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// Length of the address record at the front of `buf`, or `default` if it
/// does not start with one.
pub(crate) fn head_size(buf: &[u8], default: usize) -> usize {
    if buf.len() < 2 {
        return default;
    }
    match buf[0] & 0x07 {
        ATYP_IPV4 => 1 + 4 + 2,
        ATYP_IPV6 => 1 + 16 + 2,
        ATYP_DOMAIN => 1 + 1 + buf[1] as usize + 2,
        _ => default,
    }
}
