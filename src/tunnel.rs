use std::{
    io::{self, BufRead, ErrorKind, Read, Write},
    net::SocketAddr,
    sync::Arc,
};

use crate::{
    config::{Backend, ServerDescriptor},
    crypto::CipherSession,
    error::{BadDataReceived, Error, Unsupported},
    obfs,
    plugin::{Obfs, PluginData, Protocol, ServerInfo},
    protocol,
    socks::head_size,
    specification::{DEFAULT_HEAD_LEN, RECV_BUF_LEN, TCP_MSS},
};

/// Wire bytes that may be queued before [`Writer`] stops accepting plaintext.
const WIRE_OUT_HIGH_WATER: usize = 4 * RECV_BUF_LEN;

/// One SSR connection as a sans-I/O state machine.
///
/// The `Tunnel` composes the three layers of an SSR connection. You provide
/// plaintext on one side and receive relay traffic on the other, and vice
/// versa:
///
/// ```text
///         Plaintext                                   Wire
///         =========                                   ====
///     writer()    +------------------------------+  write_wire()
///                 |                              |
///       +--------->  protocol -> cipher -> obfs  +--------->
///                 |                              |
///       <---------+  protocol <- cipher <- obfs  <---------+
///                 |                              |
///     reader()    +------------------------------+   read_wire()
/// ```
///
/// * Use [`writer`] to run plaintext through the write pipeline, and then
///   use [`write_wire`] to send the queued wire bytes to the relay.
///
/// * Use [`read_wire`] to receive wire bytes from the relay. Then, use
///   [`reader`] to read the recovered plaintext.
///
/// The send IV is generated on the first write and placed in front of the
/// first encrypted frame; the receive IV is taken from the first bytes the
/// obfs layer yields. The first plaintext written should be the SOCKS5
/// address record of the destination.
///
/// The `Tunnel` contains no I/O code. For a tokio stream, see [`SsrStream`]
/// and [`dial`].
///
/// [`writer`]: Tunnel::writer
/// [`write_wire`]: Tunnel::write_wire
/// [`read_wire`]: Tunnel::read_wire
/// [`reader`]: Tunnel::reader
/// [`SsrStream`]: crate::SsrStream
/// [`dial`]: fn@crate::dial
#[derive(Debug)]
pub struct Tunnel {
    cipher: CipherSession,
    obfs: Box<dyn Obfs>,
    protocol: Box<dyn Protocol>,
    obfs_info: ServerInfo,
    protocol_info: ServerInfo,
    read_state: ReadState,
    recv_buf: Vec<u8>,
    wire_in: Vec<u8>,
    decrypted: Vec<u8>,
    plain: Vec<u8>,
    plain_pos: usize,
    wire_out: Vec<u8>,
    wire_out_pos: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum ReadState {
    Receive,
    Eof,
    Failed(BadDataReceived),
}

impl Tunnel {
    /// Creates the layers named by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`Unsupported`] if the cipher method, the obfs or the protocol
    /// is not known.
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self, Unsupported> {
        let cipher = CipherSession::new(descriptor.method(), descriptor.password())?;
        let obfs = obfs::new(descriptor.obfs())
            .ok_or_else(|| Unsupported::Obfs(descriptor.obfs().to_string()))?;
        let protocol = protocol::new(descriptor.protocol())
            .ok_or_else(|| Unsupported::Protocol(descriptor.protocol().to_string()))?;

        let info = ServerInfo {
            tcp_mss: TCP_MSS,
            key: cipher.key().to_vec(),
            head_len: DEFAULT_HEAD_LEN,
            overhead: obfs.overhead() + protocol.overhead(),
            ..Default::default()
        };
        let mut tunnel = Self {
            cipher,
            obfs,
            protocol,
            obfs_info: ServerInfo {
                param: descriptor.obfs_param().to_string(),
                ..info.clone()
            },
            protocol_info: ServerInfo {
                param: descriptor.protocol_param().to_string(),
                ..info
            },
            read_state: ReadState::Receive,
            recv_buf: vec![0u8; RECV_BUF_LEN],
            wire_in: Vec::new(),
            decrypted: Vec::new(),
            plain: Vec::new(),
            plain_pos: 0,
            wire_out: Vec::new(),
            wire_out_pos: 0,
        };
        tunnel.install_server_info();
        Ok(tunnel)
    }

    /// Records the remote address of the established socket, which the obfs
    /// and protocol layers see as the server host and port.
    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        for info in [&mut self.obfs_info, &mut self.protocol_info] {
            info.host = addr.ip().to_string();
            info.port = addr.port();
        }
        self.install_server_info();
    }

    /// Installs the plugin data shared by connections to `backend`, seeding it
    /// from this tunnel's plugins on first use.
    pub fn share_plugin_data(&mut self, backend: &Backend) {
        backend.share_plugin_data(self.obfs.as_mut(), self.protocol.as_mut());
    }

    /// The data the obfs layer currently shares.
    pub fn obfs_data(&self) -> PluginData {
        self.obfs.data()
    }

    /// The data the protocol layer currently shares.
    pub fn protocol_data(&self) -> PluginData {
        self.protocol.data()
    }

    fn install_server_info(&mut self) {
        self.obfs.set_server_info(Arc::new(self.obfs_info.clone()));
        self.protocol
            .set_server_info(Arc::new(self.protocol_info.clone()));
    }

    /// Generates the send IV and tells the plugins about it and about the
    /// address header at the front of `first`.
    fn begin_send(&mut self, first: &[u8]) {
        let iv = self.cipher.send_iv().to_vec();
        let head_len = head_size(first, DEFAULT_HEAD_LEN);
        for info in [&mut self.obfs_info, &mut self.protocol_info] {
            info.iv = iv.clone();
            info.head_len = head_len;
        }
        self.install_server_info();
    }

    fn encode(&mut self, buf: &[u8]) {
        if !self.cipher.iv_sent() {
            self.begin_send(buf);
        }
        let framed = self.protocol.pre_encrypt(buf);
        let encrypted = self.cipher.encrypt(&framed);
        let wire = self.obfs.encode(&encrypted);
        self.queue_wire(&wire);
    }

    fn queue_wire(&mut self, wire: &[u8]) {
        if self.wire_out_pos == self.wire_out.len() {
            self.wire_out.clear();
            self.wire_out_pos = 0;
        }
        self.wire_out.extend_from_slice(wire);
    }

    /// Runs everything received so far through the read pipeline.
    fn decode(&mut self) -> Result<(), BadDataReceived> {
        if !self.wire_in.is_empty() {
            let decoded = self.obfs.decode(&self.wire_in)?;
            self.wire_in.drain(..decoded.consumed);
            if decoded.send_back {
                let frame = self.obfs.encode(&[]);
                tracing::trace!(len = frame.len(), "obfs send-back queued");
                self.queue_wire(&frame);
            }
            if !decoded.data.is_empty() {
                let had_recv_iv = self.cipher.recv_iv().is_some();
                let decrypted = self.cipher.decrypt(&decoded.data);
                if !had_recv_iv {
                    if let Some(recv_iv) = self.cipher.recv_iv() {
                        let recv_iv = recv_iv.to_vec();
                        self.obfs_info.recv_iv = recv_iv.clone();
                        self.protocol_info.recv_iv = recv_iv;
                        self.install_server_info();
                    }
                }
                self.decrypted.extend_from_slice(&decrypted);
            }
        }
        if !self.decrypted.is_empty() {
            let (plain, consumed) = self.protocol.post_decrypt(&self.decrypted)?;
            self.decrypted.drain(..consumed);
            if self.plain_pos > 0 {
                self.plain.drain(..self.plain_pos);
                self.plain_pos = 0;
            }
            self.plain.extend_from_slice(&plain);
        }
        Ok(())
    }

    /// Reads relay bytes from the `wire` and runs them through the read
    /// pipeline, returning how many bytes were read.
    ///
    /// Once this function succeeds, call [`reader`] to get the recovered
    /// plaintext. A successful read does not always yield plaintext: the
    /// obfs and protocol layers keep partial frames until the rest arrives,
    /// in which case the reader reports `ErrorKind::WouldBlock` and
    /// `read_wire` should be called again. Check [`wants_write`] afterwards:
    /// some obfs handshakes answer the server before any data flows.
    ///
    /// If this function returns `Ok(0)`, the `wire` has reached EOF.
    ///
    /// # Errors
    ///
    /// 1. I/O errors from the `wire` are returned as they are. They are
    ///    recoverable; for example, on `ErrorKind::WouldBlock` call this
    ///    function again once the `wire` is readable.
    ///
    /// 2. Errors of kind `ErrorKind::Other` carry an [`Error`]:
    ///
    ///    * [`Error::ShortIv`] if the `wire` reached EOF before the whole
    ///      receive IV arrived.
    ///
    ///    * [`Error::BadDataReceived`] if the obfs or protocol layer rejected
    ///      the relay's framing. This is fatal; every later call returns the
    ///      same error.
    ///
    /// [`reader`]: Tunnel::reader
    /// [`wants_write`]: Tunnel::wants_write
    pub fn read_wire(&mut self, wire: &mut dyn Read) -> io::Result<usize> {
        match &self.read_state {
            ReadState::Receive => {}
            ReadState::Eof => return Ok(0),
            ReadState::Failed(reason) => return Err(reason.clone().into()),
        }
        let n = wire.read(&mut self.recv_buf)?;
        if n == 0 {
            self.read_state = ReadState::Eof;
            if let Some((expected, received)) = self.cipher.recv_iv_pending() {
                return Err(Error::ShortIv { expected, received }.into());
            }
            return Ok(0);
        }
        self.wire_in.extend_from_slice(&self.recv_buf[..n]);
        if let Err(reason) = self.decode() {
            tracing::warn!(%reason, "relay sent malformed data");
            self.read_state = ReadState::Failed(reason.clone());
            return Err(reason.into());
        }
        Ok(n)
    }

    /// Writes queued wire bytes to the `wire`, returning how many bytes were
    /// written.
    ///
    /// Short writes are retried until the queue is empty. Returns `Ok(0)` if
    /// nothing was queued.
    ///
    /// # Errors
    ///
    /// Returns the [`io::Error`] of the `wire`. Bytes written before the
    /// error are not sent again, so after `ErrorKind::WouldBlock` simply call
    /// this function again. A `wire` that accepts zero bytes yields
    /// [`Error::PeerClosed`].
    pub fn write_wire(&mut self, wire: &mut dyn Write) -> io::Result<usize> {
        let mut written = 0;
        while self.wire_out_pos < self.wire_out.len() {
            match wire.write(&self.wire_out[self.wire_out_pos..]) {
                Ok(0) => return Err(Error::PeerClosed.into()),
                Ok(n) => {
                    self.wire_out_pos += n;
                    written += n;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.wire_out.clear();
        self.wire_out_pos = 0;
        Ok(written)
    }

    /// Returns `true` if wire bytes are waiting for [`write_wire`].
    ///
    /// [`write_wire`]: Tunnel::write_wire
    pub fn wants_write(&self) -> bool {
        self.wire_out_pos < self.wire_out.len()
    }

    /// Returns a [`Reader`] over the recovered plaintext.
    pub fn reader(&mut self) -> Reader<'_> {
        Reader(self)
    }

    /// Returns a [`Writer`] that runs plaintext through the write pipeline.
    pub fn writer(&mut self) -> Writer<'_> {
        Writer(self)
    }
}

/// A structure that implements [`Read`] and [`BufRead`] for reading plaintext data.
///
/// `Reader` points to the plaintext recovered by the [`Tunnel`].
/// To create a `Reader`, use the [`reader`] method.
///
/// [`reader`]: Tunnel::reader
#[derive(Debug)]
pub struct Reader<'a>(&'a mut Tunnel);

impl Reader<'_> {
    /// Returns the number of unread plaintext bytes.
    pub fn remaining(&self) -> usize {
        self.0.plain.len() - self.0.plain_pos
    }

    /// Returns true if there is unread data in the reader.
    ///
    /// This is equivalent to `self.remaining() != 0`.
    pub fn has_remaining(&self) -> bool {
        self.remaining() != 0
    }
}

impl Read for Reader<'_> {
    /// Reads recovered plaintext.
    ///
    /// Returns `Ok(0)` once the relay has closed the connection and all
    /// plaintext has been read, and `ErrorKind::WouldBlock` if no plaintext
    /// is available yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let buffer = self.fill_buf()?;
        let k = std::cmp::min(buf.len(), buffer.len());
        buf[..k].copy_from_slice(&buffer[..k]);
        self.consume(k);
        Ok(k)
    }
}

impl BufRead for Reader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.has_remaining() {
            return Ok(&self.0.plain[self.0.plain_pos..]);
        }
        match self.0.read_state {
            ReadState::Eof => Ok(&[]),
            _ => Err(ErrorKind::WouldBlock.into()),
        }
    }

    /// Consumes `amt` bytes from the buffer. If `amt` exceeds what is
    /// buffered, all bytes are consumed.
    fn consume(&mut self, amt: usize) {
        self.0.plain_pos = std::cmp::min(self.0.plain_pos + amt, self.0.plain.len());
        if self.0.plain_pos == self.0.plain.len() {
            self.0.plain.clear();
            self.0.plain_pos = 0;
        }
    }
}

/// A structure that implements [`Write`] for writing plaintext data.
///
/// `Writer` runs plaintext through the protocol, cipher and obfs layers of
/// the [`Tunnel`] and queues the result for [`write_wire`].
/// To create a `Writer`, use the [`writer`] method.
///
/// [`writer`]: Tunnel::writer
/// [`write_wire`]: Tunnel::write_wire
#[derive(Debug)]
pub struct Writer<'a>(&'a mut Tunnel);

impl Write for Writer<'_> {
    /// Encodes the whole of `buf` and reports its plaintext length.
    ///
    /// An empty `buf` returns `Ok(0)` and produces nothing. If too many wire
    /// bytes are already queued, returns `ErrorKind::WouldBlock`; call
    /// [`write_wire`] first.
    ///
    /// [`write_wire`]: Tunnel::write_wire
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.0.wire_out.len() - self.0.wire_out_pos >= WIRE_OUT_HIGH_WATER {
            return Err(ErrorKind::WouldBlock.into());
        }
        self.0.encode(buf);
        Ok(buf.len())
    }

    /// Does nothing. Call [`write_wire`] to send the data to the relay.
    ///
    /// [`write_wire`]: Tunnel::write_wire
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
