//! The capability sets shared by the obfs and protocol layers.
//!
//! Both layers are closed sets of named implementations, constructed through
//! [`obfs::new`] and [`protocol::new`]. Each instance is owned by a single
//! connection and sees a shared, read-only [`ServerInfo`].
//!
//! [`obfs::new`]: crate::obfs::new
//! [`protocol::new`]: crate::protocol::new
use core::fmt::{Debug, Formatter};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{Rng, RngCore};

use crate::error::BadDataReceived;

/// Per-connection context handed to a plugin.
///
/// The obfs and protocol instances of one connection receive identical
/// copies except for `param`, which carries the obfs-param or the
/// protocol-param respectively.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct ServerInfo {
    /// Remote peer address of the established socket.
    pub host: String,
    /// Remote peer port of the established socket.
    pub port: u16,
    /// Advertised maximum segment size, always 1460.
    pub tcp_mss: u16,
    /// Plugin specific parameter string.
    pub param: String,
    /// The send IV of the stream cipher.
    pub iv: Vec<u8>,
    /// The stream cipher key.
    pub key: Vec<u8>,
    /// Length of the address record at the front of the first payload.
    pub head_len: usize,
    /// The receive IV, once known.
    pub recv_iv: Vec<u8>,
    /// Combined per-frame overhead of the obfs and protocol layers.
    pub overhead: usize,
}

impl Debug for ServerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tcp_mss", &self.tcp_mss)
            .field("param", &self.param)
            .field("iv_len", &self.iv.len())
            .field("key", &"*****")
            .field("head_len", &self.head_len)
            .field("overhead", &self.overhead)
            .finish()
    }
}

/// Result of [`Obfs::decode`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ObfsDecoded {
    /// Payload recovered from the wire bytes, possibly empty.
    pub data: Vec<u8>,
    /// Number of input bytes consumed. The rest must be offered again,
    /// followed by more wire bytes.
    pub consumed: usize,
    /// The obfs layer wants [`Obfs::encode`] to be called with an empty
    /// buffer and the result written to the wire.
    pub send_back: bool,
}

/// The outermost transformation layer, closest to the socket.
pub trait Obfs: Send + Debug {
    /// Installs the per-connection context.
    fn set_server_info(&mut self, info: Arc<ServerInfo>);

    /// Returns the state this plugin shares with other connections to the
    /// same server.
    fn data(&self) -> PluginData {
        PluginData::Empty
    }

    /// Installs state shared with other connections to the same server.
    fn set_data(&mut self, _data: PluginData) {}

    /// Bytes added per frame.
    fn overhead(&self) -> usize {
        0
    }

    /// Wraps bytes produced by the stream cipher for the wire.
    fn encode(&mut self, data: &[u8]) -> Vec<u8>;

    /// Unwraps wire bytes. `data` holds everything received and not yet
    /// consumed.
    ///
    /// Called once per socket read, so every complete frame in `data` must
    /// be consumed in this call; only a trailing partial frame may be left.
    fn decode(&mut self, data: &[u8]) -> Result<ObfsDecoded, BadDataReceived>;
}

/// The innermost transformation layer, closest to the caller.
pub trait Protocol: Send + Debug {
    /// Installs the per-connection context.
    fn set_server_info(&mut self, info: Arc<ServerInfo>);

    /// Returns the state this plugin shares with other connections to the
    /// same server.
    fn data(&self) -> PluginData {
        PluginData::Empty
    }

    /// Installs state shared with other connections to the same server.
    fn set_data(&mut self, _data: PluginData) {}

    /// Bytes added per frame.
    fn overhead(&self) -> usize {
        0
    }

    /// Frames caller plaintext before encryption.
    fn pre_encrypt(&mut self, data: &[u8]) -> Vec<u8>;

    /// Recovers caller plaintext from decrypted bytes. `data` holds every
    /// decrypted byte not yet consumed; returns the plaintext and how many
    /// input bytes were consumed.
    fn post_decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize), BadDataReceived>;
}

/// State a plugin shares across connections to the same server.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub enum PluginData {
    /// Nothing shared, or not initialised yet.
    #[default]
    Empty,
    /// Client identity of the `tls1.2_ticket_*` obfs.
    TlsTicket(Arc<TlsTicketData>),
    /// Client identity and connection counter of the `auth_*` protocols.
    AuthIdentity(Arc<AuthIdentity>),
}

impl PluginData {
    /// Returns `true` for [`PluginData::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, PluginData::Empty)
    }
}

/// The 32-byte client id the TLS obfs authenticates its handshake with.
#[derive(Clone, Eq, PartialEq)]
pub struct TlsTicketData {
    pub(crate) client_id: [u8; 32],
}

impl TlsTicketData {
    pub(crate) fn random(rng: &mut impl RngCore) -> Self {
        let mut client_id = [0u8; 32];
        rng.fill_bytes(&mut client_id);
        Self { client_id }
    }
}

impl Debug for TlsTicketData {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsTicketData").finish_non_exhaustive()
    }
}

/// Client id and connection counter of the `auth_*` protocols.
#[derive(Debug, Default)]
pub struct AuthIdentity(Mutex<Identity>);

#[derive(Debug, Default)]
struct Identity {
    client_id: Option<[u8; 4]>,
    connection_id: u32,
}

impl AuthIdentity {
    /// Advances the connection counter, regenerating the client id when it
    /// is missing or the counter is about to wrap. Returns the client id and
    /// the new connection id.
    pub(crate) fn next_connection(&self, rng: &mut impl Rng) -> ([u8; 4], u32) {
        let mut inner = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.connection_id > 0xFF00_0000 {
            inner.client_id = None;
        }
        let client_id = match inner.client_id {
            Some(id) => id,
            None => {
                let mut id = [0u8; 4];
                rng.fill_bytes(&mut id);
                inner.client_id = Some(id);
                inner.connection_id = rng.next_u32() & 0x00FF_FFFF;
                tracing::debug!(client_id = ?id, "new auth client id");
                id
            }
        };
        inner.connection_id = inner.connection_id.wrapping_add(1);
        (client_id, inner.connection_id)
    }

    /// The last connection id handed out.
    pub fn connection_id(&self) -> u32 {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).connection_id
    }

    #[cfg(test)]
    pub(crate) fn set_connection_id(&self, connection_id: u32) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).connection_id = connection_id;
    }
}

pub(crate) fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_secs() as u32
}
