use std::{fmt::Write as _, sync::Arc};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    error::BadDataReceived,
    obfs::pick_host,
    plugin::{Obfs, ObfsDecoded, ServerInfo},
    specification::OBFS_HANDSHAKE_MAX_LEN,
};

/// Request path prefix and suffix pairs the encoded head is wrapped in.
const REQUEST_PATHS: [(&str, &str); 7] = [
    ("", ""),
    ("login.php?redir=", ""),
    ("register.php?code=", ""),
    ("?keyword=", ""),
    ("search?src=typd&q=", "&lang=en"),
    ("s?ie=utf-8&f=8&rsv_bp=1&rsv_idx=1&ch=&bar=&wd=", "&rn="),
    ("post.php?id=", "&goto=view.php"),
];

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/40.0",
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/44.0.2403.157 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2228.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 9_1 like Mac OS X) AppleWebKit/601.1.46 (KHTML, like Gecko) Version/9.0 Mobile/13B143 Safari/601.1",
];

const BOUNDARY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// `http_simple` and `http_post`.
///
/// The first frame becomes an HTTP request whose path carries the IV and
/// the address header percent-encoded; the rest of that frame follows the
/// request header as the body. The first server frame is expected to start
/// with an HTTP response header, which is stripped.
#[derive(Debug)]
pub(crate) struct HttpSimple {
    post: bool,
    info: Arc<ServerInfo>,
    rng: StdRng,
    head_sent: bool,
    head_received: bool,
}

impl HttpSimple {
    pub(crate) fn new(post: bool) -> Self {
        Self {
            post,
            info: Arc::default(),
            rng: StdRng::from_os_rng(),
            head_sent: false,
            head_received: false,
        }
    }

    fn request_header(&mut self, head: &[u8]) -> String {
        let (hosts, custom_head) = match self.info.param.split_once('#') {
            Some((hosts, custom)) => (hosts, Some(custom)),
            None => (self.info.param.as_str(), None),
        };
        let mut host = pick_host(hosts, &self.info.host, &mut self.rng);
        if self.info.port != 80 {
            let _ = write!(host, ":{}", self.info.port);
        }
        let (prefix, suffix) = REQUEST_PATHS[self.rng.random_range(0..REQUEST_PATHS.len())];

        let mut header = String::with_capacity(512 + head.len() * 3);
        let method = if self.post { "POST" } else { "GET" };
        let _ = write!(header, "{} /{}", method, prefix);
        for b in head {
            let _ = write!(header, "%{:02x}", b);
        }
        let _ = write!(header, "{} HTTP/1.1\r\nHost: {}\r\n", suffix, host);

        match custom_head.filter(|h| !h.is_empty()) {
            Some(custom) => {
                header.push_str(&custom.replace("\\n", "\r\n"));
                header.push_str("\r\n\r\n");
            }
            None => {
                let ua = USER_AGENTS[self.rng.random_range(0..USER_AGENTS.len())];
                let _ = write!(header, "User-Agent: {}\r\n", ua);
                header.push_str(
                    "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
                     Accept-Language: en-US,en;q=0.8\r\n\
                     Accept-Encoding: gzip, deflate\r\n",
                );
                if self.post {
                    let boundary: String = (0..32)
                        .map(|_| {
                            BOUNDARY_ALPHABET[self.rng.random_range(0..BOUNDARY_ALPHABET.len())]
                                as char
                        })
                        .collect();
                    let _ = write!(
                        header,
                        "Content-Type: multipart/form-data; boundary={}\r\n",
                        boundary
                    );
                }
                header.push_str("DNT: 1\r\nConnection: keep-alive\r\n\r\n");
            }
        }
        header
    }
}

impl Obfs for HttpSimple {
    fn set_server_info(&mut self, info: Arc<ServerInfo>) {
        self.info = info;
    }

    fn encode(&mut self, data: &[u8]) -> Vec<u8> {
        if self.head_sent {
            return data.to_vec();
        }
        let head_len = self.info.iv.len() + self.info.head_len;
        let split = if data.len() > head_len + 64 {
            head_len + self.rng.random_range(0..64)
        } else {
            data.len()
        };
        let mut out = self.request_header(&data[..split]).into_bytes();
        out.extend_from_slice(&data[split..]);
        self.head_sent = true;
        out
    }

    fn decode(&mut self, data: &[u8]) -> Result<ObfsDecoded, BadDataReceived> {
        if self.head_received {
            return Ok(ObfsDecoded {
                data: data.to_vec(),
                consumed: data.len(),
                send_back: false,
            });
        }
        match data.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => {
                self.head_received = true;
                Ok(ObfsDecoded {
                    data: data[pos + 4..].to_vec(),
                    consumed: data.len(),
                    send_back: false,
                })
            }
            None if data.len() > OBFS_HANDSHAKE_MAX_LEN => Err(BadDataReceived::HandshakeTooLong),
            None => Ok(ObfsDecoded::default()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    fn info(param: &str) -> Arc<ServerInfo> {
        Arc::new(ServerInfo {
            host: "203.0.113.7".into(),
            port: 8388,
            tcp_mss: 1460,
            param: param.into(),
            iv: vec![0x11; 16],
            key: vec![0x22; 16],
            head_len: 7,
            ..Default::default()
        })
    }

    /// Splits a request produced by [`HttpSimple`] back into the frame it
    /// carried: the percent-encoded head followed by the body.
    pub(crate) fn unwrap_request(wire: &[u8]) -> Option<(String, Vec<u8>)> {
        let end = wire.windows(4).position(|w| w == b"\r\n\r\n")?;
        let header = String::from_utf8(wire[..end].to_vec()).ok()?;
        let request_line = header.lines().next()?;
        let mut frame = Vec::new();
        let bytes = request_line.as_bytes();
        let mut i = 0;
        while i + 2 < bytes.len() {
            if bytes[i] == b'%' {
                let hex = core::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
                frame.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else {
                i += 1;
            }
        }
        frame.extend_from_slice(&wire[end + 4..]);
        Some((header, frame))
    }

    #[test]
    fn test_request_carries_frame() {
        let mut obfs = HttpSimple::new(false);
        obfs.set_server_info(info(""));
        let frame: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let wire = obfs.encode(&frame);
        let (header, recovered) = unwrap_request(&wire).unwrap();
        assert!(header.starts_with("GET /"));
        assert!(header.contains("Host: 203.0.113.7:8388\r\n"));
        assert!(header.contains("User-Agent: "));
        assert_eq!(recovered, frame);

        // Later frames are not wrapped.
        assert_eq!(obfs.encode(b"tail"), b"tail");
    }

    #[test]
    fn test_post_with_host_list_and_custom_head() {
        let mut obfs = HttpSimple::new(true);
        obfs.set_server_info(info("cdn.example.com#Accept: */*\\nX-Test: 1"));
        let wire = obfs.encode(&[0xaa; 10]);
        let (header, recovered) = unwrap_request(&wire).unwrap();
        assert!(header.starts_with("POST /"));
        assert!(header.contains("Host: cdn.example.com:8388\r\n"));
        assert!(header.ends_with("Accept: */*\r\nX-Test: 1"));
        assert!(!header.contains("User-Agent"));
        assert_eq!(recovered, [0xaa; 10]);
    }

    #[test]
    fn test_post_boundary() {
        let mut obfs = HttpSimple::new(true);
        obfs.set_server_info(info(""));
        let wire = obfs.encode(b"x");
        let (header, _) = unwrap_request(&wire).unwrap();
        let boundary = header
            .lines()
            .find_map(|l| l.strip_prefix("Content-Type: multipart/form-data; boundary="))
            .unwrap();
        assert_eq!(boundary.len(), 32);
    }

    #[test]
    fn test_response_header_stripped_across_reads() {
        let mut obfs = HttpSimple::new(false);
        obfs.set_server_info(info(""));
        let response = b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\npayload";

        let partial = obfs.decode(&response[..20]).unwrap();
        assert_eq!(partial.consumed, 0);
        assert!(partial.data.is_empty());

        let full = obfs.decode(response).unwrap();
        assert_eq!(full.consumed, response.len());
        assert_eq!(full.data, b"payload");

        let next = obfs.decode(b"more").unwrap();
        assert_eq!(next.data, b"more");
    }

    #[test]
    fn test_endless_header_rejected() {
        let mut obfs = HttpSimple::new(false);
        obfs.set_server_info(info(""));
        let junk = vec![b'a'; OBFS_HANDSHAKE_MAX_LEN + 1];
        assert_eq!(
            obfs.decode(&junk).unwrap_err(),
            BadDataReceived::HandshakeTooLong
        );
    }
}
