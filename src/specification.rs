//! The informal specification of the ShadowsocksR wire format as seen by a client.

// Outbound byte stream:
// ```text
// | obfs_encode( | iv  | cipher( protocol_encode( addr | payload ) ) ) | obfs_encode( cipher( protocol_encode( payload ) ) ) | ...
// |              | ivB |                                              |
// |                      <- first frame ->                             |                 <- following frames ->              |
// ```
//
// First plaintext payload (SOCKS5 address record):
// ```text
// | atyp | addr                                    | port |
// |  1B  | 4B (0x01) / 1B len + name (0x03) / 16B (0x04) |  2B  |
// ```
pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// Advertised to plugins, never negotiated.
pub(crate) const TCP_MSS: u16 = 1460;

/// Default address header length reported to plugins when the first payload
/// is not a recognised address record.
pub(crate) const DEFAULT_HEAD_LEN: usize = 30;

/// Bytes requested from the socket per read.
pub(crate) const RECV_BUF_LEN: usize = 16 * 1024;

// Pipe buffer:
// ```text
// | len | hmac-sha1 tag | payload |
// |  2B |      10B      |  4096B  |
// ```
pub(crate) const LEAKY_BUF_SIZE: usize = 2 + HMAC_SHA1_TAG_LEN + 4096;
pub(crate) const LEAKY_BUF_DEPTH: usize = 2048;

pub(crate) const CONNECT_TIMEOUT_MILLIS: u64 = 500;
pub(crate) const PIPE_READ_TIMEOUT_SECS: u64 = 600;

/// SSR truncates every HMAC-SHA1 it puts on the wire to this length.
pub(crate) const HMAC_SHA1_TAG_LEN: usize = 10;

// auth_aes128 frame:
// ```text
// | len | hmac | rnd_len | random   | payload  | hmac |
// |  2B |  2B  | 1B / 3B | variable | variable |  4B  |
// ```
pub(crate) const AUTH_AES128_UNIT_LEN: usize = 4096;
pub(crate) const AUTH_AES128_HEAD_UNIT_LEN: usize = 1200;
pub(crate) const AUTH_AES128_OVERHEAD: usize = 9;

// auth_sha1_v4 frame:
// ```text
// | len | crc16 | rnd_len | random   | payload  | adler32 |
// |  2B |  2B   | 1B / 3B | variable | variable |   4B    |
// ```
pub(crate) const AUTH_SHA1_V4_UNIT_LEN: usize = 8100;
pub(crate) const AUTH_SHA1_V4_OVERHEAD: usize = 7;

// auth_chain frame:
// ```text
// | len ^ hash | random | rc4(payload) | random | hmac |
// |     2B     |      variable          |        |  2B  |
// ```
pub(crate) const AUTH_CHAIN_UNIT_LEN: usize = 2800;
pub(crate) const AUTH_CHAIN_OVERHEAD: usize = 4;

/// Frames at or above this length are rejected by the `auth_*` decoders.
pub(crate) const AUTH_FRAME_MAX_LEN: usize = 8192;

// TLS application data record:
// ```text
// | type | version | len | payload  |
// | 0x17 |  03 03  |  2B | variable |
// ```
pub(crate) const TLS_RECORD_HDR_LEN: usize = 5;
pub(crate) const TLS_OVERHEAD: usize = TLS_RECORD_HDR_LEN;

/// Largest server handshake (HTTP response header, TLS server flight) the
/// obfs decoders buffer.
pub(crate) const OBFS_HANDSHAKE_MAX_LEN: usize = 64 * 1024;
