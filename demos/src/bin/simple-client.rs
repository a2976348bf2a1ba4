use ssrwire::{Backend, SocksAddr, dial, link};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

// Usage: simple-client <ssr://link> [host] [port]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().ok_or("missing ssr:// link")?;
    let host = args.next().unwrap_or_else(|| "example.com".to_string());
    let port: u16 = match args.next() {
        Some(port) => port.parse()?,
        None => 80,
    };

    let descriptor = link::parse(&url, true).ok_or("malformed ssr:// link")?;
    tracing::info!(
        address = descriptor.address(),
        remarks = descriptor.remarks(),
        "using relay"
    );
    let backend = Backend::new(descriptor);

    let dest = SocksAddr::from((host.as_str(), port));
    let mut stream = dial(&backend, &dest).await?;
    println!("connected to {} through relay", dest);

    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = vec![0; 4096];
    let mut total = 0;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                println!("server closed connection");
                break;
            }
            Ok(n) => {
                if total == 0 {
                    println!("{}", String::from_utf8_lossy(&buf[..n]));
                }
                total += n;
            }
            Err(e) => {
                println!("read failed: {:?}", e);
                return Err(e.into());
            }
        }
    }
    println!("received {} bytes", total);
    Ok(())
}
