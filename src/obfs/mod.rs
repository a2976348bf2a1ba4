//! The obfs registry.
//!
//! | name                      | wire disguise                                  |
//! |---------------------------|------------------------------------------------|
//! | `plain`                   | none                                           |
//! | `http_simple`             | first frame is an HTTP GET, response stripped  |
//! | `http_post`               | first frame is an HTTP POST, response stripped |
//! | `random_head`             | a random CRC-terminated head, then raw         |
//! | `tls1.2_ticket_auth`      | TLS 1.2 session ticket resumption              |
//! | `tls1.2_ticket_fastauth`  | the same without waiting for the server hello  |
//!
//! Every name also accepts a `_compatible` suffix.
use std::sync::Arc;

use rand::{Rng, rngs::StdRng};

use crate::{
    error::BadDataReceived,
    plugin::{Obfs, ObfsDecoded, ServerInfo},
};

pub(crate) mod http;
mod random_head;
mod tls;

/// Creates a fresh obfs instance by name, or `None` if the name is unknown.
pub fn new(name: &str) -> Option<Box<dyn Obfs>> {
    let name = name.strip_suffix("_compatible").unwrap_or(name);
    Some(match name {
        "plain" => Box::new(Plain),
        "http_simple" => Box::new(http::HttpSimple::new(false)),
        "http_post" => Box::new(http::HttpSimple::new(true)),
        "random_head" => Box::new(random_head::RandomHead::new()),
        "tls1.2_ticket_auth" => Box::new(tls::TlsTicketAuth::new(false)),
        "tls1.2_ticket_fastauth" => Box::new(tls::TlsTicketAuth::new(true)),
        _ => return None,
    })
}

/// Passes bytes through unchanged.
#[derive(Debug)]
struct Plain;

impl Obfs for Plain {
    fn set_server_info(&mut self, _info: Arc<ServerInfo>) {}

    fn encode(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decode(&mut self, data: &[u8]) -> Result<ObfsDecoded, BadDataReceived> {
        Ok(ObfsDecoded {
            data: data.to_vec(),
            consumed: data.len(),
            send_back: false,
        })
    }
}

/// Picks one host from a comma separated obfs-param host list, falling back
/// to `default` when the list is empty.
pub(crate) fn pick_host(hosts: &str, default: &str, rng: &mut StdRng) -> String {
    let hosts: Vec<&str> = hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .collect();
    if hosts.is_empty() {
        return default.to_string();
    }
    hosts[rng.random_range(0..hosts.len())].to_string()
}
