use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::{RngCore, SeedableRng, rngs::StdRng};

use crate::{
    crypto::{Rc4, aes128_encrypt_block, evp_bytes_to_key, hmac_md5, md5},
    error::BadDataReceived,
    plugin::{AuthIdentity, PluginData, Protocol, ServerInfo, unix_time},
    socks::head_size,
    specification::{AUTH_CHAIN_OVERHEAD, AUTH_CHAIN_UNIT_LEN, DEFAULT_HEAD_LEN},
};

/// Server frames whose payload plus padding reach this length are rejected.
const MAX_FRAME_BODY_LEN: usize = 4096;

/// The xorshift128+ generator both ends derive padding lengths and
/// positions from.
#[derive(Clone, Debug, Default)]
struct XorShift128Plus {
    v0: u64,
    v1: u64,
}

impl XorShift128Plus {
    fn next(&mut self) -> u64 {
        let mut x = self.v0;
        let y = self.v1;
        self.v0 = y;
        x ^= x << 23;
        x ^= y ^ (x >> 17) ^ (y >> 26);
        self.v1 = x;
        x.wrapping_add(y)
    }

    fn init_from_bin(&mut self, bin: &[u8]) {
        let mut seed = [0u8; 16];
        let n = bin.len().min(16);
        seed[..n].copy_from_slice(&bin[..n]);
        self.v0 = u64::from_le_bytes(seed[..8].try_into().unwrap_or_default());
        self.v1 = u64::from_le_bytes(seed[8..].try_into().unwrap_or_default());
    }

    fn init_from_bin_len(&mut self, bin: &[u8], len: usize) {
        let mut seed = [0u8; 16];
        let n = bin.len().min(16);
        seed[..n].copy_from_slice(&bin[..n]);
        seed[..2].copy_from_slice(&(len as u16).to_le_bytes());
        self.init_from_bin(&seed);
        for _ in 0..4 {
            self.next();
        }
    }
}

/// `auth_chain_a` or `auth_chain_b`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Variant {
    A,
    B,
}

impl Variant {
    fn salt(self) -> &'static [u8] {
        match self {
            Variant::A => b"auth_chain_a",
            Variant::B => b"auth_chain_b",
        }
    }
}

/// Padding length policy. `auth_chain_b` pads towards sizes drawn from the
/// key so that frame lengths cluster on a per-server set.
#[derive(Debug)]
struct PaddingSizes {
    variant: Variant,
    overhead: usize,
    sizes: Vec<usize>,
    sizes2: Vec<usize>,
}

impl PaddingSizes {
    fn new(variant: Variant, key: &[u8], overhead: usize) -> Self {
        let mut sizes = Vec::new();
        let mut sizes2 = Vec::new();
        if variant == Variant::B {
            let mut random = XorShift128Plus::default();
            random.init_from_bin(key);
            let len = random.next() % 8 + 4;
            sizes = (0..len)
                .map(|_| (random.next() % 2340 % 2040 % 1440) as usize)
                .collect();
            sizes.sort_unstable();
            let len = random.next() % 16 + 8;
            sizes2 = (0..len)
                .map(|_| (random.next() % 2340 % 2040 % 1440) as usize)
                .collect();
            sizes2.sort_unstable();
        }
        Self {
            variant,
            overhead,
            sizes,
            sizes2,
        }
    }

    fn rnd_data_len(&self, buf_len: usize, last_hash: &[u8], random: &mut XorShift128Plus) -> usize {
        match self.variant {
            Variant::A if buf_len > 1440 => return 0,
            Variant::B if buf_len >= 1440 => return 0,
            _ => {}
        }
        random.init_from_bin_len(last_hash, buf_len);
        if self.variant == Variant::B {
            let target = buf_len + self.overhead;

            let pos = self.sizes.partition_point(|&s| s < target);
            let final_pos = pos + (random.next() % self.sizes.len() as u64) as usize;
            if final_pos < self.sizes.len() {
                return self.sizes[final_pos] - target;
            }

            let pos = self.sizes2.partition_point(|&s| s < target);
            let final_pos = pos + (random.next() % self.sizes2.len() as u64) as usize;
            if final_pos < self.sizes2.len() {
                return self.sizes2[final_pos] - target;
            }
            if final_pos < pos + self.sizes2.len() - 1 {
                return 0;
            }
        }
        let modulus = if buf_len > 1300 {
            31
        } else if buf_len > 900 {
            127
        } else if buf_len > 400 {
            521
        } else {
            1021
        };
        (random.next() % modulus) as usize
    }
}

fn rnd_start_pos(rand_len: usize, random: &mut XorShift128Plus) -> usize {
    (random.next() % 8_589_934_609 % rand_len as u64) as usize
}

/// One direction of the hash chain.
#[derive(Debug, Default)]
struct Chain {
    last_hash: [u8; 16],
    id: u32,
    random: XorShift128Plus,
}

impl Chain {
    fn starting_at(last_hash: [u8; 16]) -> Self {
        Self {
            last_hash,
            id: 1,
            random: XorShift128Plus::default(),
        }
    }

    fn mac_key(&self, user_key: &[u8]) -> Vec<u8> {
        let mut key = user_key.to_vec();
        key.extend_from_slice(&self.id.to_le_bytes());
        key
    }

    fn len_mask(&self) -> u16 {
        u16::from_le_bytes([self.last_hash[14], self.last_hash[15]])
    }
}

fn rc4_key(user_key: &[u8], client_hash: &[u8]) -> [u8; 16] {
    let mut password = STANDARD.encode(user_key).into_bytes();
    password.extend_from_slice(STANDARD.encode(client_hash).as_bytes());
    md5(&password)
}

/// Encrypts `data` and frames it onto `out`, advancing `chain`.
fn pack_frame(
    sizes: &PaddingSizes,
    chain: &mut Chain,
    rc4: &mut Rc4,
    user_key: &[u8],
    data: &[u8],
    rng: &mut StdRng,
    out: &mut Vec<u8>,
) {
    let mut body = data.to_vec();
    rc4.apply_keystream(&mut body);
    let rand_len = sizes.rnd_data_len(body.len(), &chain.last_hash, &mut chain.random);
    let mut padding = vec![0u8; rand_len];
    rng.fill_bytes(&mut padding);

    let start = out.len();
    out.extend_from_slice(&(body.len() as u16 ^ chain.len_mask()).to_le_bytes());
    if body.is_empty() || rand_len == 0 {
        out.extend_from_slice(&padding);
        out.extend_from_slice(&body);
    } else {
        let split = rnd_start_pos(rand_len, &mut chain.random);
        out.extend_from_slice(&padding[..split]);
        out.extend_from_slice(&body);
        out.extend_from_slice(&padding[split..]);
    }
    chain.last_hash = hmac_md5(&chain.mac_key(user_key), &out[start..]);
    out.extend_from_slice(&chain.last_hash[..2]);
    chain.id = chain.id.wrapping_add(1);
}

/// Strips complete frames off `data`, decrypting their payload onto `out`.
/// Returns the number of bytes consumed.
fn unpack_frames(
    sizes: &PaddingSizes,
    chain: &mut Chain,
    rc4: &mut Rc4,
    user_key: &[u8],
    data: &[u8],
    out: &mut Vec<Vec<u8>>,
) -> Result<usize, BadDataReceived> {
    let mut pos = 0;
    while data.len() - pos > 4 {
        let frame = &data[pos..];
        let data_len = (u16::from_le_bytes([frame[0], frame[1]]) ^ chain.len_mask()) as usize;
        let rand_len = sizes.rnd_data_len(data_len, &chain.last_hash, &mut chain.random);
        let len = data_len + rand_len;
        if len >= MAX_FRAME_BODY_LEN {
            return Err(BadDataReceived::AuthLength { received: len });
        }
        if len + 4 > frame.len() {
            break;
        }
        let hash = hmac_md5(&chain.mac_key(user_key), &frame[..len + 2]);
        if hash[..2] != frame[len + 2..len + 4] {
            return Err(BadDataReceived::AuthChecksum);
        }
        let start = if data_len > 0 && rand_len > 0 {
            2 + rnd_start_pos(rand_len, &mut chain.random)
        } else {
            2
        };
        let mut body = frame[start..start + data_len].to_vec();
        rc4.apply_keystream(&mut body);
        out.push(body);
        chain.last_hash = hash;
        chain.id = chain.id.wrapping_add(1);
        pos += len + 4;
    }
    Ok(pos)
}

/// `auth_chain_a` and `auth_chain_b`.
///
/// Frames are RC4-encrypted under a key bound to the handshake and chained:
/// each frame's HMAC-MD5 masks the next length field and seeds the next
/// padding length. The first server frame opens with the server's TCP MSS.
#[derive(Debug)]
pub(crate) struct AuthChain {
    variant: Variant,
    info: Arc<ServerInfo>,
    identity: Arc<AuthIdentity>,
    rng: StdRng,
    uid: [u8; 4],
    user_key: Vec<u8>,
    sizes: PaddingSizes,
    send: Chain,
    recv: Chain,
    encryptor: Option<Rc4>,
    decryptor: Option<Rc4>,
    server_tcp_mss: Option<u16>,
}

impl AuthChain {
    pub(crate) fn new(variant: Variant) -> Self {
        Self {
            variant,
            info: Arc::default(),
            identity: Arc::default(),
            rng: StdRng::from_os_rng(),
            uid: [0; 4],
            user_key: Vec::new(),
            sizes: PaddingSizes::new(variant, &[], 0),
            send: Chain::default(),
            recv: Chain::default(),
            encryptor: None,
            decryptor: None,
            server_tcp_mss: None,
        }
    }

    fn pack_auth_data(&mut self, out: &mut Vec<u8>) {
        let mut mac_key = self.info.iv.clone();
        mac_key.extend_from_slice(&self.info.key);

        let mut check_head = [0u8; 4];
        self.rng.fill_bytes(&mut check_head);
        let client_hash = hmac_md5(&mac_key, &check_head);
        out.extend_from_slice(&check_head);
        out.extend_from_slice(&client_hash[..8]);

        let (client_id, connection_id) = self.identity.next_connection(&mut self.rng);
        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&unix_time().to_le_bytes());
        block[4..8].copy_from_slice(&client_id);
        block[8..12].copy_from_slice(&connection_id.to_le_bytes());
        block[12..14].copy_from_slice(&(self.info.overhead as u16).to_le_bytes());

        let mut password = STANDARD.encode(&self.user_key).into_bytes();
        password.extend_from_slice(self.variant.salt());
        let aes_key = evp_bytes_to_key(&password, 16);

        let auth_start = out.len();
        let uid = u32::from_le_bytes(self.uid)
            ^ u32::from_le_bytes([client_hash[8], client_hash[9], client_hash[10], client_hash[11]]);
        out.extend_from_slice(&uid.to_le_bytes());
        out.extend_from_slice(&aes128_encrypt_block(&aes_key, &block));
        let server_hash = hmac_md5(&self.user_key, &out[auth_start..]);
        out.extend_from_slice(&server_hash[..4]);

        let key = rc4_key(&self.user_key, &client_hash);
        self.encryptor = Some(Rc4::new(&key));
        self.decryptor = Some(Rc4::new(&key));
        self.send = Chain::starting_at(client_hash);
        self.recv = Chain::starting_at(server_hash);
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let Some(rc4) = self.encryptor.as_mut() else {
            return;
        };
        pack_frame(
            &self.sizes,
            &mut self.send,
            rc4,
            &self.user_key,
            data,
            &mut self.rng,
            out,
        );
    }
}

impl Protocol for AuthChain {
    fn set_server_info(&mut self, info: Arc<ServerInfo>) {
        let param = info.param.split_once('#').map_or(info.param.as_str(), |(p, _)| p);
        let user = param
            .split_once(':')
            .and_then(|(uid, password)| Some((uid.trim().parse::<u32>().ok()?, password)));
        match user {
            Some((uid, password)) => {
                self.uid = uid.to_le_bytes();
                self.user_key = password.as_bytes().to_vec();
            }
            None => {
                self.rng.fill_bytes(&mut self.uid);
                self.user_key = info.key.clone();
            }
        }
        self.sizes = PaddingSizes::new(self.variant, &info.key, info.overhead);
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
        AUTH_CHAIN_OVERHEAD
    }

    fn pre_encrypt(&mut self, mut data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 1024);
        if data.is_empty() {
            return out;
        }
        if self.encryptor.is_none() {
            self.pack_auth_data(&mut out);
            let head_len = head_size(data, DEFAULT_HEAD_LEN);
            let len = data.len().min(head_len + (self.rng.next_u32() % 32) as usize);
            let (head, rest) = data.split_at(len);
            self.pack_data(head, &mut out);
            data = rest;
        }
        for chunk in data.chunks(AUTH_CHAIN_UNIT_LEN) {
            self.pack_data(chunk, &mut out);
        }
        out
    }

    fn post_decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize), BadDataReceived> {
        let Some(rc4) = self.decryptor.as_mut() else {
            return Err(BadDataReceived::AuthChecksum);
        };
        let mut bodies = Vec::new();
        let consumed = unpack_frames(
            &self.sizes,
            &mut self.recv,
            rc4,
            &self.user_key,
            data,
            &mut bodies,
        )?;

        let mut out = Vec::with_capacity(consumed);
        for body in bodies {
            if self.server_tcp_mss.is_none() {
                let mss = body.get(..2).map_or(0, |b| u16::from_le_bytes([b[0], b[1]]));
                tracing::trace!(mss, "auth_chain: server tcp mss");
                self.server_tcp_mss = Some(mss);
                out.extend_from_slice(body.get(2..).unwrap_or_default());
            } else {
                out.extend_from_slice(&body);
            }
        }
        Ok((out, consumed))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(param: &str) -> Arc<ServerInfo> {
        Arc::new(ServerInfo {
            param: param.into(),
            iv: vec![0x42; 16],
            key: vec![0x24; 16],
            head_len: 7,
            overhead: AUTH_CHAIN_OVERHEAD,
            ..Default::default()
        })
    }

    fn first_payload() -> Vec<u8> {
        let mut payload = vec![0x03, 11];
        payload.extend_from_slice(b"example.com");
        payload.extend_from_slice(&443u16.to_be_bytes());
        payload.extend((0..5000u32).map(|i| (i % 253) as u8));
        payload
    }

    #[test]
    fn test_xorshift_reference() {
        let mut random = XorShift128Plus::default();
        random.init_from_bin(&[1, 0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!((random.v0, random.v1), (1, 2));
        // x = 1 ^ (1 << 23); x ^= 2 ^ (x >> 17) ^ (2 >> 26)
        let x = 1u64 ^ (1 << 23);
        let x = x ^ 2 ^ (x >> 17);
        assert_eq!(random.next(), x + 2);
        assert_eq!((random.v0, random.v1), (2, x));
    }

    #[test]
    fn test_chain_b_sizes() {
        let sizes = PaddingSizes::new(Variant::B, &[0x24; 16], 4);
        assert!((4..12).contains(&sizes.sizes.len()));
        assert!((8..24).contains(&sizes.sizes2.len()));
        assert!(sizes.sizes.windows(2).all(|w| w[0] <= w[1]));
        assert!(sizes.sizes.iter().all(|&s| s < 1440));
        assert!(PaddingSizes::new(Variant::A, &[0x24; 16], 4).sizes.is_empty());
    }

    #[test]
    fn test_auth_header_and_client_frames() {
        for variant in [Variant::A, Variant::B] {
            let mut protocol = AuthChain::new(variant);
            protocol.set_server_info(info("99:hunter2#16"));
            assert_eq!(protocol.user_key, b"hunter2");
            let payload = first_payload();
            let out = protocol.pre_encrypt(&payload);

            let mut mac_key = vec![0x42; 16];
            mac_key.extend_from_slice(&[0x24; 16]);
            let client_hash = hmac_md5(&mac_key, &out[..4]);
            assert_eq!(out[4..12], client_hash[..8]);
            let uid = u32::from_le_bytes(out[12..16].try_into().unwrap())
                ^ u32::from_le_bytes(client_hash[8..12].try_into().unwrap());
            assert_eq!(uid, 99);
            assert_eq!(out[32..36], hmac_md5(b"hunter2", &out[12..32])[..4]);

            let mut mirror = Chain::starting_at(client_hash);
            let mut rc4 = Rc4::new(&rc4_key(b"hunter2", &client_hash));
            let mut bodies = Vec::new();
            let consumed = unpack_frames(
                &protocol.sizes,
                &mut mirror,
                &mut rc4,
                b"hunter2",
                &out[36..],
                &mut bodies,
            )
            .unwrap();
            assert_eq!(consumed, out.len() - 36);
            assert_eq!(bodies.concat(), payload);
        }
    }

    #[test]
    fn test_server_frames_partial_reads() {
        for variant in [Variant::A, Variant::B] {
            let mut protocol = AuthChain::new(variant);
            protocol.set_server_info(info(""));
            let out = protocol.pre_encrypt(&first_payload());

            let mut mac_key = vec![0x42; 16];
            mac_key.extend_from_slice(&[0x24; 16]);
            let client_hash = hmac_md5(&mac_key, &out[..4]);
            let server_hash = hmac_md5(&[0x24; 16], &out[12..32]);

            let mut server = Chain::starting_at(server_hash);
            let mut rc4 = Rc4::new(&rc4_key(&[0x24; 16], &client_hash));
            let mut rng = StdRng::from_seed([9u8; 32]);
            let mut wire = Vec::new();
            let mut first = 1460u16.to_le_bytes().to_vec();
            first.extend_from_slice(b"hello ");
            let big: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
            for body in [first.as_slice(), b"world".as_slice(), big.as_slice()] {
                pack_frame(&protocol.sizes, &mut server, &mut rc4, &[0x24; 16], body, &mut rng, &mut wire);
            }

            let mut received = Vec::new();
            let mut pending: Vec<u8> = Vec::new();
            for chunk in wire.chunks(7) {
                pending.extend_from_slice(chunk);
                let (plain, consumed) = protocol.post_decrypt(&pending).unwrap();
                received.extend_from_slice(&plain);
                pending.drain(..consumed);
            }
            assert!(pending.is_empty());
            assert_eq!(protocol.server_tcp_mss, Some(1460));
            let mut expected = b"hello world".to_vec();
            expected.extend_from_slice(&big);
            assert_eq!(received, expected);
        }
    }

    #[test]
    fn test_tampered_server_frame() {
        let mut protocol = AuthChain::new(Variant::A);
        protocol.set_server_info(info(""));
        let out = protocol.pre_encrypt(&first_payload());
        let mut mac_key = vec![0x42; 16];
        mac_key.extend_from_slice(&[0x24; 16]);
        let client_hash = hmac_md5(&mac_key, &out[..4]);
        let server_hash = hmac_md5(&[0x24; 16], &out[12..32]);

        let mut server = Chain::starting_at(server_hash);
        let mut rc4 = Rc4::new(&rc4_key(&[0x24; 16], &client_hash));
        let mut rng = StdRng::from_seed([9u8; 32]);
        let mut wire = Vec::new();
        pack_frame(&protocol.sizes, &mut server, &mut rc4, &[0x24; 16], b"\xb4\x05ok", &mut rng, &mut wire);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(
            protocol.post_decrypt(&wire).unwrap_err(),
            BadDataReceived::AuthChecksum
        );
    }

    #[test]
    fn test_decode_before_handshake() {
        let mut protocol = AuthChain::new(Variant::A);
        protocol.set_server_info(info(""));
        assert!(protocol.post_decrypt(b"12345").is_err());
    }
}
