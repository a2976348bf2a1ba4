use std::sync::Arc;

use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};

use crate::{
    crypto::{adler32, hmac_sha1},
    error::BadDataReceived,
    plugin::{AuthIdentity, PluginData, Protocol, ServerInfo, unix_time},
    protocol::padding_len_prefix,
    socks::head_size,
    specification::{
        AUTH_FRAME_MAX_LEN, AUTH_SHA1_V4_OVERHEAD, AUTH_SHA1_V4_UNIT_LEN, DEFAULT_HEAD_LEN,
        HMAC_SHA1_TAG_LEN,
    },
};

const SALT: &[u8] = b"auth_sha1_v4";

/// Shortest frame: length, crc, one padding byte and the Adler-32 trailer.
const MIN_FRAME_LEN: usize = 7;

/// `auth_sha1_v4`.
#[derive(Debug)]
pub(crate) struct AuthSha1V4 {
    info: Arc<ServerInfo>,
    identity: Arc<AuthIdentity>,
    rng: StdRng,
    header_sent: bool,
}

impl AuthSha1V4 {
    pub(crate) fn new() -> Self {
        Self {
            info: Arc::default(),
            identity: Arc::default(),
            rng: StdRng::from_os_rng(),
            header_sent: false,
        }
    }

    fn padding_len(&mut self, data_len: usize) -> usize {
        if data_len > 1200 {
            1
        } else if data_len > 900 {
            1 + self.rng.random_range(0..128)
        } else {
            1 + self.rng.random_range(0..512)
        }
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = if data.len() > 1300 {
            1
        } else if data.len() > 400 {
            1 + self.rng.random_range(0..128)
        } else {
            1 + self.rng.random_range(0..1024)
        };
        let frame_len = 6 + rand_len + 12 + data.len() + HMAC_SHA1_TAG_LEN;
        let start = out.len();

        out.extend_from_slice(&(frame_len as u16).to_be_bytes());
        let mut salted = out[start..start + 2].to_vec();
        salted.extend_from_slice(SALT);
        salted.extend_from_slice(&self.info.key);
        out.extend_from_slice(&crc32fast::hash(&salted).to_le_bytes());

        push_padding(&mut self.rng, rand_len, out);

        let (client_id, connection_id) = self.identity.next_connection(&mut self.rng);
        out.extend_from_slice(&unix_time().to_le_bytes());
        out.extend_from_slice(&client_id);
        out.extend_from_slice(&connection_id.to_le_bytes());
        out.extend_from_slice(data);

        let mut key = self.info.iv.clone();
        key.extend_from_slice(&self.info.key);
        let tag = hmac_sha1(&key, &out[start..]);
        out.extend_from_slice(&tag[..HMAC_SHA1_TAG_LEN]);
        debug_assert_eq!(out.len() - start, frame_len);
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = self.padding_len(data.len());
        pack_frame(&mut self.rng, rand_len, data, out);
    }
}

/// Writes `rand_len` bytes of padding announcing their own length.
fn push_padding(rng: &mut StdRng, rand_len: usize, out: &mut Vec<u8>) {
    let prefix = padding_len_prefix(rand_len, true);
    let start = out.len();
    out.extend_from_slice(&prefix);
    out.resize(start + rand_len, 0);
    rng.fill_bytes(&mut out[start + prefix.len()..]);
}

/// Frames `data` the way both directions of `auth_sha1_v4` do.
fn pack_frame(rng: &mut StdRng, rand_len: usize, data: &[u8], out: &mut Vec<u8>) {
    let frame_len = 4 + rand_len + data.len() + 4;
    let start = out.len();
    let len = (frame_len as u16).to_be_bytes();
    out.extend_from_slice(&len);
    out.extend_from_slice(&(crc32fast::hash(&len) as u16).to_le_bytes());
    push_padding(rng, rand_len, out);
    out.extend_from_slice(data);
    let checksum = adler32(&out[start..]);
    out.extend_from_slice(&checksum.to_le_bytes());
}

impl Protocol for AuthSha1V4 {
    fn set_server_info(&mut self, info: Arc<ServerInfo>) {
        self.info = info;
    }

    fn data(&self) -> PluginData {
        PluginData::AuthIdentity(self.identity.clone())
    }

    fn set_data(&mut self, data: PluginData) {
        if let PluginData::AuthIdentity(identity) = data {
            self.identity = identity;
        }
    }

    fn overhead(&self) -> usize {
        AUTH_SHA1_V4_OVERHEAD
    }

    fn pre_encrypt(&mut self, mut data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 1024);
        if data.is_empty() {
            return out;
        }
        if !self.header_sent {
            let head_len = head_size(data, DEFAULT_HEAD_LEN);
            let len = data.len().min(head_len + self.rng.random_range(0..32));
            let (head, rest) = data.split_at(len);
            self.pack_auth_data(head, &mut out);
            data = rest;
            self.header_sent = true;
        }
        for chunk in data.chunks(AUTH_SHA1_V4_UNIT_LEN) {
            self.pack_data(chunk, &mut out);
        }
        out
    }

    fn post_decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize), BadDataReceived> {
        let mut out = Vec::with_capacity(data.len());
        let mut pos = 0;
        while data.len() - pos > 4 {
            let frame = &data[pos..];
            if frame[2..4] != (crc32fast::hash(&frame[..2]) as u16).to_le_bytes() {
                return Err(BadDataReceived::AuthLengthChecksum);
            }
            let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
            if !(MIN_FRAME_LEN..AUTH_FRAME_MAX_LEN).contains(&len) {
                return Err(BadDataReceived::AuthLength { received: len });
            }
            if len > frame.len() {
                break;
            }
            if frame[len - 4..len] != adler32(&frame[..len - 4]).to_le_bytes() {
                return Err(BadDataReceived::AuthChecksum);
            }
            let start = match frame[4] {
                0xFF => u16::from_be_bytes([frame[5], frame[6]]) as usize + 4,
                n => n as usize + 4,
            };
            if start > len - 4 {
                return Err(BadDataReceived::AuthLength { received: len });
            }
            out.extend_from_slice(&frame[start..len - 4]);
            pos += len;
        }
        Ok((out, pos))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info() -> Arc<ServerInfo> {
        Arc::new(ServerInfo {
            iv: vec![0x42; 16],
            key: vec![0x24; 16],
            head_len: 7,
            ..Default::default()
        })
    }

    fn server_frames(payloads: &[&[u8]]) -> Vec<u8> {
        let mut rng = StdRng::from_seed([7u8; 32]);
        let mut out = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let rand_len = if i % 2 == 0 { 1 } else { 300 };
            pack_frame(&mut rng, rand_len, payload, &mut out);
        }
        out
    }

    #[test]
    fn test_decode_partial_frames() {
        let wire = server_frames(&[b"hello ".as_slice(), b"world", b"!"]);
        let mut protocol = AuthSha1V4::new();
        protocol.set_server_info(info());

        let mut received = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        for byte in &wire {
            pending.push(*byte);
            let (plain, consumed) = protocol.post_decrypt(&pending).unwrap();
            received.extend_from_slice(&plain);
            pending.drain(..consumed);
        }
        assert!(pending.is_empty());
        assert_eq!(received, b"hello world!");
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut wire = server_frames(&[b"hello".as_slice()]);
        let mut protocol = AuthSha1V4::new();

        let mut bad_crc = wire.clone();
        bad_crc[2] ^= 1;
        assert_eq!(
            protocol.post_decrypt(&bad_crc).unwrap_err(),
            BadDataReceived::AuthLengthChecksum
        );

        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert_eq!(
            protocol.post_decrypt(&wire).unwrap_err(),
            BadDataReceived::AuthChecksum
        );
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let len = (AUTH_FRAME_MAX_LEN as u16).to_be_bytes();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&(crc32fast::hash(&len) as u16).to_le_bytes());
        frame.extend_from_slice(&[0; 8]);
        let mut protocol = AuthSha1V4::new();
        assert_eq!(
            protocol.post_decrypt(&frame).unwrap_err(),
            BadDataReceived::AuthLength {
                received: AUTH_FRAME_MAX_LEN
            }
        );
    }

    #[test]
    fn test_auth_header() {
        let mut protocol = AuthSha1V4::new();
        protocol.set_server_info(info());
        let mut payload = vec![0x01, 10, 0, 0, 1, 0x00, 0x50];
        payload.extend((0..2000u32).map(|i| i as u8));
        let out = protocol.pre_encrypt(&payload);

        let len = u16::from_be_bytes([out[0], out[1]]) as usize;
        let mut salted = out[..2].to_vec();
        salted.extend_from_slice(SALT);
        salted.extend_from_slice(&[0x24; 16]);
        assert_eq!(out[2..6], crc32fast::hash(&salted).to_le_bytes());
        let mut key = vec![0x42; 16];
        key.extend_from_slice(&[0x24; 16]);
        assert_eq!(out[len - 10..len], hmac_sha1(&key, &out[..len - 10])[..10]);

        let rand_len = match out[6] {
            0xFF => u16::from_be_bytes([out[7], out[8]]) as usize,
            n => n as usize,
        };
        let auth = &out[6 + rand_len..];
        let connection_id = u32::from_le_bytes(auth[8..12].try_into().unwrap());
        assert_eq!(connection_id, protocol.identity.connection_id());

        let mut recovered = out[6 + rand_len + 12..len - 10].to_vec();
        let (rest, consumed) = AuthSha1V4::new().post_decrypt(&out[len..]).unwrap();
        assert_eq!(consumed, out.len() - len);
        recovered.extend_from_slice(&rest);
        assert_eq!(recovered, payload);
    }

    #[test]
    fn test_identity_shared() {
        let first = AuthSha1V4::new();
        let mut second = AuthSha1V4::new();
        second.set_data(first.data());
        assert!(Arc::ptr_eq(&first.identity, &second.identity));
    }
}
