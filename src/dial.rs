use std::{io, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, lookup_host},
    time::timeout,
};

use crate::{
    config::Backend, error::Error, socks::SocksAddr, tokio_stream_impl::SsrStream, tunnel::Tunnel,
};

/// Connects to the relay described by `backend` and asks it to open `dest`.
///
/// The cipher, obfs and protocol names are checked before any socket is
/// opened. The plugin data shared by connections to `backend` is installed
/// before the address record of `dest` is sent as the first payload.
///
/// # Errors
///
/// * [`Error::Unsupported`] if a name is not known.
/// * [`Error::Dial`] if resolving or connecting fails, or the connect
///   timeout of the backend elapses for every resolved address.
/// * [`Error::Handshake`] if the address record cannot be sent. The socket
///   is closed.
///
/// # Example
///
/// ```no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use ssrwire::{Backend, SocksAddr, dial, link};
/// use tokio::io::AsyncWriteExt;
///
/// let descriptor = link::parse("ssr://relay.example.com:8388:origin:aes-256-cfb:plain:secret", false)
///     .expect("malformed link");
/// let backend = Backend::new(descriptor);
/// let mut stream = dial(&backend, &SocksAddr::Domain("example.com".into(), 80)).await?;
/// stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
/// # Ok(())
/// # }
/// ```
pub async fn dial(backend: &Backend, dest: &SocksAddr) -> Result<SsrStream<TcpStream>, Error> {
    let descriptor = backend.descriptor();
    let mut tunnel = Tunnel::new(descriptor)?;
    let header = dest.to_bytes().map_err(Error::Handshake)?;

    let stream = connect(descriptor.address(), backend.connect_timeout)
        .await
        .map_err(Error::Dial)?;
    let peer_addr = stream.peer_addr().map_err(Error::Dial)?;
    tunnel.set_peer_addr(peer_addr);
    tunnel.share_plugin_data(backend);
    tracing::debug!(
        %peer_addr,
        method = descriptor.method(),
        obfs = descriptor.obfs(),
        protocol = descriptor.protocol(),
        "dial: connected to relay"
    );

    let mut stream = SsrStream::new(tunnel, stream);
    if let Err(e) = stream.write_all(&header).await {
        tracing::debug!(error = %e, %dest, "dial: sending destination failed");
        let _ = stream.inner_stream_mut().shutdown().await;
        return Err(Error::Handshake(e));
    }
    tracing::debug!(%dest, "dial: destination sent");
    Ok(stream)
}

/// Tries each resolved address in turn, each with its own deadline.
async fn connect(address: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host(address).await? {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            }
        }
        tracing::debug!(%addr, "dial: address unreachable");
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} resolved to no addresses", address),
        )
    }))
}

#[cfg(test)]
mod test {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        sync::Arc,
    };

    use tokio::{io::AsyncReadExt, net::TcpListener};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        config::ServerDescriptor, crypto::CipherSession, error::Unsupported, plugin::PluginData,
    };

    async fn listener_backend(obfs: &str, protocol: &str) -> (TcpListener, Backend) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let descriptor =
            ServerDescriptor::builder_with_address(listener.local_addr().unwrap().to_string())
                .with_cipher("aes-128-cfb", "test")
                .with_obfs(obfs, "")
                .with_protocol(protocol, "");
        (listener, Backend::new(descriptor))
    }

    #[tokio::test]
    async fn test_unknown_obfs_never_connects() {
        let (listener, backend) = listener_backend("nope", "origin").await;
        let dest = SocksAddr::from(SocketAddr::from((Ipv4Addr::new(1, 2, 3, 4), 80)));
        match dial(&backend, &dest).await {
            Err(Error::Unsupported(Unsupported::Obfs(name))) => assert_eq!(name, "nope"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(
            timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_first_payload_is_address() {
        let (listener, backend) = listener_backend("plain", "origin").await;
        let relay = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut wire = [0u8; 16 + 7];
            socket.read_exact(&mut wire).await.unwrap();
            let mut cipher = CipherSession::new("aes-128-cfb", b"test").unwrap();
            cipher.decrypt(&wire)
        });

        let dest = SocksAddr::from(SocketAddr::from((Ipv4Addr::new(1, 2, 3, 4), 80)));
        let _stream = dial(&backend, &dest).await.unwrap();
        assert_eq!(
            relay.await.unwrap(),
            [0x01, 0x01, 0x02, 0x03, 0x04, 0x00, 0x50]
        );
        assert!(logs_contain("dial: connected to relay"));
    }

    #[tokio::test]
    async fn test_plugin_data_shared_across_dials() {
        let (listener, backend) = listener_backend("tls1.2_ticket_auth", "auth_aes128_md5").await;
        let relay = tokio::spawn(async move {
            let mut sockets = Vec::new();
            for _ in 0..2 {
                sockets.push(listener.accept().await.unwrap().0);
            }
            sockets
        });
        assert!(backend.obfs_data().is_empty());
        assert!(backend.protocol_data().is_empty());

        let dest = SocksAddr::Domain("example.com".into(), 443);
        let first = dial(&backend, &dest).await.unwrap();
        let second = dial(&backend, &dest).await.unwrap();

        match (
            first.tunnel().obfs_data(),
            second.tunnel().obfs_data(),
            backend.obfs_data(),
        ) {
            (PluginData::TlsTicket(a), PluginData::TlsTicket(b), PluginData::TlsTicket(c)) => {
                assert!(Arc::ptr_eq(&a, &b));
                assert!(Arc::ptr_eq(&b, &c));
            }
            other => panic!("unexpected obfs data: {:?}", other),
        }
        let (PluginData::AuthIdentity(a), PluginData::AuthIdentity(b)) =
            (first.tunnel().protocol_data(), backend.protocol_data())
        else {
            panic!("protocol data not shared");
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert!(b.connection_id() >= 2);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let backend = Backend::new(
            ServerDescriptor::builder_with_address(addr.to_string())
                .with_cipher("aes-128-cfb", "test")
                .with_plain_obfs()
                .with_origin_protocol(),
        )
        .with_connect_timeout(Duration::from_millis(200));
        let dest = SocksAddr::Domain("example.com".into(), 80);
        assert!(matches!(dial(&backend, &dest).await, Err(Error::Dial(_))));
    }
}
