use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};

use crate::{
    crypto::{aes128_encrypt_block, evp_bytes_to_key, hmac_md5, hmac_sha1, md5, sha1},
    error::BadDataReceived,
    plugin::{AuthIdentity, PluginData, Protocol, ServerInfo, unix_time},
    protocol::padding_len_prefix,
    specification::{
        AUTH_AES128_HEAD_UNIT_LEN, AUTH_AES128_OVERHEAD, AUTH_AES128_UNIT_LEN, AUTH_FRAME_MAX_LEN,
    },
};

const MIN_FRAME_LEN: usize = 7;

/// Digest the frames of an `auth_aes128` variant are authenticated with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Hash {
    Md5,
    Sha1,
}

impl Hash {
    fn salt(self) -> &'static [u8] {
        match self {
            Hash::Md5 => b"auth_aes128_md5",
            Hash::Sha1 => b"auth_aes128_sha1",
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Hash::Md5 => md5(data).to_vec(),
            Hash::Sha1 => sha1(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Hash::Md5 => hmac_md5(key, data).to_vec(),
            Hash::Sha1 => hmac_sha1(key, data).to_vec(),
        }
    }
}

/// `auth_aes128_md5` and `auth_aes128_sha1`.
///
/// A protocol-param of the form `uid:password` authenticates as that user;
/// anything else uses a random uid and the cipher key.
#[derive(Debug)]
pub(crate) struct AuthAes128 {
    hash: Hash,
    info: Arc<ServerInfo>,
    identity: Arc<AuthIdentity>,
    rng: StdRng,
    uid: [u8; 4],
    user_key: Vec<u8>,
    header_sent: bool,
    pack_id: u32,
    recv_id: u32,
}

impl AuthAes128 {
    pub(crate) fn new(hash: Hash) -> Self {
        Self {
            hash,
            info: Arc::default(),
            identity: Arc::default(),
            rng: StdRng::from_os_rng(),
            uid: [0; 4],
            user_key: Vec::new(),
            header_sent: false,
            pack_id: 1,
            recv_id: 1,
        }
    }

    fn padding_len(&mut self, data_len: usize) -> usize {
        if data_len > 1200 {
            1
        } else if self.pack_id > 4 {
            1 + self.rng.random_range(0..32)
        } else if data_len > 900 {
            1 + self.rng.random_range(0..128)
        } else {
            1 + self.rng.random_range(0..512)
        }
    }

    fn frame_key(&self, id: u32) -> Vec<u8> {
        let mut key = self.user_key.clone();
        key.extend_from_slice(&id.to_le_bytes());
        key
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = if data.len() > 400 {
            self.rng.random_range(0..512)
        } else {
            self.rng.random_range(0..1024)
        };
        let frame_len = 31 + rand_len + data.len() + 4;
        let start = out.len();

        let mut mac_key = self.info.iv.clone();
        mac_key.extend_from_slice(&self.info.key);

        let mut check_head = [0u8; 1];
        self.rng.fill_bytes(&mut check_head);
        out.push(check_head[0]);
        out.extend_from_slice(&self.hash.hmac(&mac_key, &check_head)[..6]);

        let (client_id, connection_id) = self.identity.next_connection(&mut self.rng);
        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&unix_time().to_le_bytes());
        block[4..8].copy_from_slice(&client_id);
        block[8..12].copy_from_slice(&connection_id.to_le_bytes());
        block[12..14].copy_from_slice(&(frame_len as u16).to_le_bytes());
        block[14..16].copy_from_slice(&(rand_len as u16).to_le_bytes());

        let mut password = STANDARD.encode(&self.user_key).into_bytes();
        password.extend_from_slice(self.hash.salt());
        let aes_key = evp_bytes_to_key(&password, 16);

        let auth_start = out.len();
        out.extend_from_slice(&self.uid);
        out.extend_from_slice(&aes128_encrypt_block(&aes_key, &block));
        let tag = self.hash.hmac(&mac_key, &out[auth_start..]);
        out.extend_from_slice(&tag[..4]);

        let padding_start = out.len();
        out.resize(padding_start + rand_len, 0);
        self.rng.fill_bytes(&mut out[padding_start..]);
        out.extend_from_slice(data);

        let tag = self.hash.hmac(&self.user_key, &out[start..]);
        out.extend_from_slice(&tag[..4]);
        debug_assert_eq!(out.len() - start, frame_len);
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = self.padding_len(data.len());
        let key = self.frame_key(self.pack_id);
        pack_frame(self.hash, &key, &mut self.rng, rand_len, data, out);
        self.pack_id = self.pack_id.wrapping_add(1);
    }
}

/// Frames `data` the way both directions of `auth_aes128` do.
fn pack_frame(
    hash: Hash,
    key: &[u8],
    rng: &mut StdRng,
    rand_len: usize,
    data: &[u8],
    out: &mut Vec<u8>,
) {
    let frame_len = 4 + rand_len + data.len() + 4;
    let start = out.len();
    let len = (frame_len as u16).to_le_bytes();
    out.extend_from_slice(&len);
    out.extend_from_slice(&hash.hmac(key, &len)[..2]);

    let prefix = padding_len_prefix(rand_len, false);
    let padding_start = out.len();
    out.extend_from_slice(&prefix);
    out.resize(padding_start + rand_len, 0);
    rng.fill_bytes(&mut out[padding_start + prefix.len()..]);

    out.extend_from_slice(data);
    let tag = hash.hmac(key, &out[start..]);
    out.extend_from_slice(&tag[..4]);
}

impl Protocol for AuthAes128 {
    fn set_server_info(&mut self, info: Arc<ServerInfo>) {
        let user = info
            .param
            .split_once(':')
            .and_then(|(uid, password)| Some((uid.trim().parse::<u32>().ok()?, password)));
        match user {
            Some((uid, password)) => {
                self.uid = uid.to_le_bytes();
                self.user_key = self.hash.digest(password.as_bytes());
            }
            None => {
                self.rng.fill_bytes(&mut self.uid);
                self.user_key = info.key.clone();
            }
        }
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
        AUTH_AES128_OVERHEAD
    }

    fn pre_encrypt(&mut self, mut data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 1024);
        if data.is_empty() {
            return out;
        }
        if !self.header_sent {
            let (head, rest) = data.split_at(data.len().min(AUTH_AES128_HEAD_UNIT_LEN));
            self.pack_auth_data(head, &mut out);
            data = rest;
            self.header_sent = true;
        }
        for chunk in data.chunks(AUTH_AES128_UNIT_LEN) {
            self.pack_data(chunk, &mut out);
        }
        out
    }

    fn post_decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize), BadDataReceived> {
        let mut out = Vec::with_capacity(data.len());
        let mut pos = 0;
        while data.len() - pos > 4 {
            let frame = &data[pos..];
            let key = self.frame_key(self.recv_id);
            if frame[2..4] != self.hash.hmac(&key, &frame[..2])[..2] {
                return Err(BadDataReceived::AuthLengthChecksum);
            }
            let len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
            if !(MIN_FRAME_LEN..AUTH_FRAME_MAX_LEN).contains(&len) {
                return Err(BadDataReceived::AuthLength { received: len });
            }
            if len > frame.len() {
                break;
            }
            if frame[len - 4..len] != self.hash.hmac(&key, &frame[..len - 4])[..4] {
                return Err(BadDataReceived::AuthChecksum);
            }
            self.recv_id = self.recv_id.wrapping_add(1);
            let start = match frame[4] {
                0xFF => u16::from_le_bytes([frame[5], frame[6]]) as usize + 4,
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
