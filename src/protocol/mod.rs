//! The protocol registry.
//!
//! | name                | framing                                          |
//! |---------------------|--------------------------------------------------|
//! | `origin`            | none                                             |
//! | `verify_sha1`/`ota` | HMAC-SHA1 tagged header and chunks, client side  |
//! | `auth_sha1_v4`      | CRC/Adler-32 checked frames, timestamped header  |
//! | `auth_aes128_md5`   | HMAC-MD5 frames, AES-encrypted auth block        |
//! | `auth_aes128_sha1`  | HMAC-SHA1 frames, AES-encrypted auth block       |
//! | `auth_chain_a`      | RC4 frames with a running HMAC-MD5 chain         |
//! | `auth_chain_b`      | as `auth_chain_a`, key-derived padding lengths   |
//!
//! Every name also accepts a `_compatible` suffix.
use std::sync::Arc;

use crate::{
    error::BadDataReceived,
    plugin::{Protocol, ServerInfo},
};

mod auth_aes128;
mod auth_chain;
mod auth_sha1_v4;
mod verify;

/// Creates a fresh protocol instance by name, or `None` if the name is
/// unknown.
pub fn new(name: &str) -> Option<Box<dyn Protocol>> {
    let name = name.strip_suffix("_compatible").unwrap_or(name);
    Some(match name {
        "origin" => Box::new(Origin),
        "verify_sha1" | "ota" => Box::new(verify::VerifySha1::new()),
        "auth_sha1_v4" => Box::new(auth_sha1_v4::AuthSha1V4::new()),
        "auth_aes128_md5" => Box::new(auth_aes128::AuthAes128::new(auth_aes128::Hash::Md5)),
        "auth_aes128_sha1" => Box::new(auth_aes128::AuthAes128::new(auth_aes128::Hash::Sha1)),
        "auth_chain_a" => Box::new(auth_chain::AuthChain::new(auth_chain::Variant::A)),
        "auth_chain_b" => Box::new(auth_chain::AuthChain::new(auth_chain::Variant::B)),
        _ => return None,
    })
}

/// Passes bytes through unchanged.
#[derive(Debug)]
struct Origin;

impl Protocol for Origin {
    fn set_server_info(&mut self, _info: Arc<ServerInfo>) {}

    fn pre_encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn post_decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize), BadDataReceived> {
        Ok((data.to_vec(), data.len()))
    }
}

/// Random padding length prefix used by the `auth_sha1_v4` and
/// `auth_aes128` frames: a single byte below 128, otherwise `0xFF` followed
/// by the length in two bytes.
pub(crate) fn padding_len_prefix(rand_len: usize, big_endian: bool) -> Vec<u8> {
    if rand_len < 128 {
        return vec![rand_len as u8];
    }
    let len = rand_len as u16;
    let bytes = if big_endian {
        len.to_be_bytes()
    } else {
        len.to_le_bytes()
    };
    vec![0xFF, bytes[0], bytes[1]]
}
