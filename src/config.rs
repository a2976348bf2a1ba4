//! Configuration structures for dialing an SSR relay.
//!
//! A [`ServerDescriptor`] names everything needed to talk to one relay. It is
//! usually parsed from an `ssr://` link with [`link::parse`], or built in
//! three steps:
//!
//! 1. Choose the stream cipher method and its password.
//! 2. Choose the obfs plugin and its parameter.
//! 3. Choose the protocol plugin and its parameter.
//!
//! A [`Backend`] wraps a descriptor with the plugin state that connections to
//! the same relay share. Keep one `Backend` per relay for the lifetime of the
//! application and dial through it.
//!
//! # Example
//!
//! ```
//! use ssrwire::{Backend, ServerDescriptor};
//!
//! let descriptor = ServerDescriptor::builder_with_address("relay.example.com:8388")
//!     .with_cipher("aes-256-cfb", "secret")
//!     .with_obfs("tls1.2_ticket_auth", "cdn.example.com")
//!     .with_protocol("auth_aes128_md5", "")
//!     .with_remarks("example");
//!
//! let backend = Backend::new(descriptor);
//! assert_eq!(backend.descriptor().obfs(), "tls1.2_ticket_auth");
//! ```
//!
//! [`link::parse`]: crate::link::parse
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::{
    leaky_buf::LeakyBuf,
    plugin::{Obfs, PluginData, Protocol},
    specification::{
        CONNECT_TIMEOUT_MILLIS, LEAKY_BUF_DEPTH, LEAKY_BUF_SIZE, PIPE_READ_TIMEOUT_SECS,
    },
};

/// Everything needed to reach one SSR relay.
///
/// For details on constructing a descriptor, refer to the [`config`] module.
///
/// [`config`]: crate::config
#[derive(Clone, Default, Eq, PartialEq, Hash)]
pub struct ServerDescriptor {
    pub(crate) address: String,
    pub(crate) method: String,
    pub(crate) password: Vec<u8>,
    pub(crate) obfs: String,
    pub(crate) obfs_param: String,
    pub(crate) protocol: String,
    pub(crate) protocol_param: String,
    pub(crate) remarks: String,
    pub(crate) group: String,
}

/// A builder for creating a [`ServerDescriptor`].
///
/// To get a [`DescriptorBuilder`], use
/// [`ServerDescriptor::builder_with_address`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DescriptorBuilder<State> {
    state: State,
}

impl ServerDescriptor {
    /// Sets up the relay address, `host:port`.
    pub fn builder_with_address(address: impl Into<String>) -> DescriptorBuilder<WantsCipher> {
        DescriptorBuilder {
            state: WantsCipher {
                address: address.into(),
            },
        }
    }

    /// Attaches a human readable name.
    pub fn with_remarks(mut self, remarks: impl Into<String>) -> Self {
        self.remarks = remarks.into();
        self
    }

    /// Attaches a group name.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// The relay address, `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The stream cipher method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The password the cipher key is derived from.
    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// The obfs plugin name.
    pub fn obfs(&self) -> &str {
        &self.obfs
    }

    /// The obfs plugin parameter.
    pub fn obfs_param(&self) -> &str {
        &self.obfs_param
    }

    /// The protocol plugin name.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The protocol plugin parameter.
    pub fn protocol_param(&self) -> &str {
        &self.protocol_param
    }

    /// Free-form name of the relay. Never sent on the wire.
    pub fn remarks(&self) -> &str {
        &self.remarks
    }

    /// Free-form group of the relay. Never sent on the wire.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The link type, always `"ssr"`.
    pub fn kind(&self) -> &'static str {
        "ssr"
    }
}

impl core::fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("address", &self.address)
            .field("method", &self.method)
            .field("password", &"*****")
            .field("obfs", &self.obfs)
            .field("obfs_param", &self.obfs_param)
            .field("protocol", &self.protocol)
            .field("protocol_param", &self.protocol_param)
            .field("remarks", &self.remarks)
            .field("group", &self.group)
            .finish()
    }
}

impl DescriptorBuilder<WantsCipher> {
    /// Sets up the stream cipher method and password.
    ///
    /// The method name is checked when dialing.
    pub fn with_cipher(
        self,
        method: impl Into<String>,
        password: impl AsRef<[u8]>,
    ) -> DescriptorBuilder<WantsObfs> {
        DescriptorBuilder {
            state: WantsObfs {
                address: self.state.address,
                method: method.into(),
                password: password.as_ref().to_vec(),
            },
        }
    }
}

impl DescriptorBuilder<WantsObfs> {
    /// Sets up the obfs plugin and its parameter.
    pub fn with_obfs(
        self,
        name: impl Into<String>,
        param: impl Into<String>,
    ) -> DescriptorBuilder<WantsProtocol> {
        DescriptorBuilder {
            state: WantsProtocol {
                inner: WantsObfs { ..self.state },
                obfs: name.into(),
                obfs_param: param.into(),
            },
        }
    }

    /// Use the `plain` obfs.
    pub fn with_plain_obfs(self) -> DescriptorBuilder<WantsProtocol> {
        self.with_obfs("plain", "")
    }
}

impl DescriptorBuilder<WantsProtocol> {
    /// Sets up the protocol plugin and its parameter.
    pub fn with_protocol(
        self,
        name: impl Into<String>,
        param: impl Into<String>,
    ) -> ServerDescriptor {
        let WantsProtocol {
            inner,
            obfs,
            obfs_param,
        } = self.state;
        ServerDescriptor {
            address: inner.address,
            method: inner.method,
            password: inner.password,
            obfs,
            obfs_param,
            protocol: name.into(),
            protocol_param: param.into(),
            remarks: String::new(),
            group: String::new(),
        }
    }

    /// Use the `origin` protocol.
    pub fn with_origin_protocol(self) -> ServerDescriptor {
        self.with_protocol("origin", "")
    }
}

/// Descriptor builder state where the caller must supply a cipher.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsCipher {
    address: String,
}

/// Descriptor builder state where the caller must supply an obfs plugin.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsObfs {
    address: String,
    method: String,
    password: Vec<u8>,
}

/// Descriptor builder state where the caller must supply a protocol plugin.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsProtocol {
    inner: WantsObfs,
    obfs: String,
    obfs_param: String,
}

/// Long-lived per-relay state.
///
/// Carries the descriptor together with the plugin data that connections to
/// the same relay share, such as the client id and connection counter of the
/// `auth_*` protocols. Share it between tasks behind an [`Arc`].
#[derive(Debug)]
pub struct Backend {
    descriptor: ServerDescriptor,
    obfs_data: Mutex<PluginData>,
    protocol_data: Mutex<PluginData>,
    pub(crate) connect_timeout: Duration,
}

impl Backend {
    /// Creates the state for a relay no connection has been made to yet.
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            obfs_data: Mutex::default(),
            protocol_data: Mutex::default(),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MILLIS),
        }
    }

    /// Overrides the TCP connect deadline, 500 ms by default.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The relay descriptor.
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// The obfs data shared by connections so far.
    pub fn obfs_data(&self) -> PluginData {
        self.obfs_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The protocol data shared by connections so far.
    pub fn protocol_data(&self) -> PluginData {
        self.protocol_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Seeds the shared data from the first connection's plugins, then
    /// installs it into `obfs` and `protocol`.
    pub(crate) fn share_plugin_data(&self, obfs: &mut dyn Obfs, protocol: &mut dyn Protocol) {
        {
            let mut data = self.obfs_data.lock().unwrap_or_else(PoisonError::into_inner);
            if data.is_empty() {
                *data = obfs.data();
            }
            obfs.set_data(data.clone());
        }
        let mut data = self
            .protocol_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if data.is_empty() {
            *data = protocol.data();
        }
        protocol.set_data(data.clone());
    }
}

impl From<ServerDescriptor> for Backend {
    fn from(descriptor: ServerDescriptor) -> Self {
        Self::new(descriptor)
    }
}

/// Settings of the copy loop run by [`pipe`] and [`relay`].
///
/// [`pipe`]: fn@crate::pipe
/// [`relay`]: crate::relay
#[derive(Clone, Debug)]
pub struct PipeConfig {
    pub(crate) read_timeout: Duration,
    pub(crate) leaky_buf: Arc<LeakyBuf>,
}

impl PipeConfig {
    /// Overrides the per-read deadline, 600 s by default.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Uses `leaky_buf` as the buffer pool.
    pub fn with_leaky_buf(mut self, leaky_buf: Arc<LeakyBuf>) -> Self {
        self.leaky_buf = leaky_buf;
        self
    }

    /// The buffer pool copies draw from.
    pub fn leaky_buf(&self) -> &Arc<LeakyBuf> {
        &self.leaky_buf
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(PIPE_READ_TIMEOUT_SECS),
            leaky_buf: Arc::new(LeakyBuf::new(LEAKY_BUF_DEPTH, LEAKY_BUF_SIZE)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn descriptor() -> ServerDescriptor {
        ServerDescriptor::builder_with_address("127.0.0.1:8388")
            .with_cipher("aes-128-cfb", "test")
            .with_obfs("tls1.2_ticket_auth", "")
            .with_protocol("auth_aes128_sha1", "")
    }

    #[test]
    fn test_builder() {
        let d = ServerDescriptor::builder_with_address("relay:1")
            .with_cipher("none", b"\x00\xff")
            .with_plain_obfs()
            .with_origin_protocol()
            .with_group("g");
        assert_eq!(d.address(), "relay:1");
        assert_eq!(d.password(), b"\x00\xff");
        assert_eq!(d.obfs(), "plain");
        assert_eq!(d.protocol(), "origin");
        assert_eq!(d.group(), "g");
        assert_eq!(d.kind(), "ssr");
        assert!(!format!("{:?}", d).contains("\\xff"));
    }

    #[test]
    fn test_backend_shares_plugin_data() {
        let backend = Backend::new(descriptor());
        assert!(backend.obfs_data().is_empty());

        let mut obfs = crate::obfs::new("tls1.2_ticket_auth").unwrap();
        let mut protocol = crate::protocol::new("auth_aes128_sha1").unwrap();
        backend.share_plugin_data(obfs.as_mut(), protocol.as_mut());
        let PluginData::TlsTicket(first) = backend.obfs_data() else {
            panic!("obfs data not seeded");
        };

        let mut obfs = crate::obfs::new("tls1.2_ticket_auth").unwrap();
        let mut protocol = crate::protocol::new("auth_aes128_sha1").unwrap();
        backend.share_plugin_data(obfs.as_mut(), protocol.as_mut());
        match (obfs.data(), protocol.data(), backend.protocol_data()) {
            (PluginData::TlsTicket(ticket), PluginData::AuthIdentity(a), PluginData::AuthIdentity(b)) => {
                assert!(Arc::ptr_eq(&ticket, &first));
                assert!(Arc::ptr_eq(&a, &b));
            }
            other => panic!("unexpected plugin data: {:?}", other),
        }
    }

    #[test]
    fn test_pipe_config_defaults() {
        let config = PipeConfig::default().with_read_timeout(Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.leaky_buf().buf_size(), LEAKY_BUF_SIZE);
    }
}
