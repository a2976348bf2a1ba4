//! All possible tunnel errors.
//!
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible tunnel errors.
///
/// The streaming surfaces ([`Tunnel`], [`SsrStream`]) report these wrapped in
/// an [`io::Error`] of kind [`ErrorKind::Other`]; use
/// `err.get_ref().and_then(|e| e.downcast_ref::<Error>())` to recover them.
///
/// [`Tunnel`]: crate::Tunnel
/// [`SsrStream`]: crate::SsrStream
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A cipher method, obfs or protocol name is not registered.
    ///
    /// Raised by [`dial`] before any socket is opened.
    ///
    /// [`dial`]: fn@crate::dial
    Unsupported(Unsupported),

    /// Resolving or connecting to the remote relay failed, or the connect
    /// deadline elapsed.
    Dial(io::Error),

    /// Writing the destination address through a freshly established
    /// connection failed. The socket has been closed.
    Handshake(io::Error),

    /// The remote relay closed the stream before the whole receive IV arrived.
    ShortIv {
        /// IV length of the cipher method.
        expected: usize,
        /// IV bytes seen before EOF.
        received: usize,
    },

    /// The obfs or protocol layer rejected bytes sent by the remote relay.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal. No recovery is defined; close the tunnel.
    BadDataReceived(BadDataReceived),

    /// The peer closed the connection.
    PeerClosed,
}

/// A name that none of the registries know about.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Unsupported {
    /// Unknown stream cipher method.
    Cipher(String),
    /// Unknown obfs plugin.
    Obfs(String),
    /// Unknown protocol plugin.
    Protocol(String),
}

/// Malformed framing received from the remote relay.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum BadDataReceived {
    /// A TLS application data record did not start with `17 03 03`.
    TlsRecordMagic,

    /// The TLS server handshake was too short to carry the server random.
    TlsHandshakeTooShort,

    /// The HMAC in the TLS server random or the Finished message is wrong.
    TlsHandshakeHmac,

    /// The server handshake (HTTP response header, TLS server flight) did not
    /// complete within the allowed size.
    HandshakeTooLong,

    /// The length field of an `auth_*` frame is out of range.
    AuthLength {
        /// The received frame length.
        received: usize,
    },

    /// The CRC32 of an `auth_*` length field does not match.
    AuthLengthChecksum,

    /// The Adler-32 or HMAC trailer of an `auth_*` frame does not match.
    AuthChecksum,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Unsupported(err) => write!(f, "Unsupported: {}", err),
            Error::Dial(err) => write!(f, "Dial: {}", err),
            Error::Handshake(err) => write!(f, "Handshake: {}", err),
            Error::ShortIv { expected, received } => write!(
                f,
                "ShortIv: expected {} bytes, received {}",
                expected, received
            ),
            Error::BadDataReceived(err) => write!(f, "BadDataReceived: {}", err),
            Error::PeerClosed => write!(f, "PeerClosed"),
        }
    }
}

impl Display for Unsupported {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Unsupported::Cipher(name) => write!(f, "cipher method {:?}", name),
            Unsupported::Obfs(name) => write!(f, "obfs {:?}", name),
            Unsupported::Protocol(name) => write!(f, "protocol {:?}", name),
        }
    }
}

impl Display for BadDataReceived {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            BadDataReceived::TlsRecordMagic => write!(f, "TlsRecordMagic"),
            BadDataReceived::TlsHandshakeTooShort => write!(f, "TlsHandshakeTooShort"),
            BadDataReceived::TlsHandshakeHmac => write!(f, "TlsHandshakeHmac"),
            BadDataReceived::HandshakeTooLong => write!(f, "HandshakeTooLong"),
            BadDataReceived::AuthLength { received } => {
                write!(f, "AuthLength: received {}", received)
            }
            BadDataReceived::AuthLengthChecksum => write!(f, "AuthLengthChecksum"),
            BadDataReceived::AuthChecksum => write!(f, "AuthChecksum"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Unsupported(err) => Some(err),
            Error::Dial(err) => Some(err),
            Error::Handshake(err) => Some(err),
            Error::BadDataReceived(err) => Some(err),
            Error::ShortIv { .. } | Error::PeerClosed => None,
        }
    }
}

impl error::Error for Unsupported {}

impl error::Error for BadDataReceived {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::PeerClosed => io::Error::new(ErrorKind::UnexpectedEof, e),
            e => io::Error::new(ErrorKind::Other, e),
        }
    }
}

impl From<BadDataReceived> for io::Error {
    fn from(e: BadDataReceived) -> Self {
        io::Error::new(ErrorKind::Other, Error::BadDataReceived(e))
    }
}

impl From<BadDataReceived> for Error {
    fn from(e: BadDataReceived) -> Self {
        Error::BadDataReceived(e)
    }
}

impl From<Unsupported> for Error {
    fn from(e: Unsupported) -> Self {
        Error::Unsupported(e)
    }
}
