//! Crypto interface.
//!
//! This module provides the stream ciphers of the ShadowsocksR transport
//! and the digest helpers shared by the obfs and protocol plugins.

use core::fmt::{Debug, Formatter};

use aws_lc_rs::cipher::{
    AES_128, AES_256, DecryptionContext, EncryptionContext, PaddedBlockEncryptingKey,
    StreamingDecryptingKey, StreamingEncryptingKey, UnboundCipherKey,
};
use aws_lc_rs::iv::FixedLength;
use cryptoxide::chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::{TryRngCore, rngs::OsRng};
use sha1::Sha1;
use zeroize::Zeroize;

use crate::error::Unsupported;

/// Stream cipher method of a ShadowsocksR server.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Method {
    /// No encryption. The key is still derived for the plugins' HMACs.
    None,
    /// AES-128 in CFB128 mode.
    Aes128Cfb,
    /// AES-256 in CFB128 mode.
    Aes256Cfb,
    /// AES-128 in CTR mode.
    Aes128Ctr,
    /// AES-256 in CTR mode.
    Aes256Ctr,
    /// RC4 keyed with `MD5(key | iv)`, 16-byte IV.
    Rc4Md5,
    /// RC4 keyed with `MD5(key | iv)`, 6-byte IV.
    Rc4Md5_6,
    /// ChaCha20 with a 64-bit nonce.
    ChaCha20,
    /// ChaCha20 with a 96-bit nonce.
    ChaCha20Ietf,
}

impl Method {
    /// Looks a method up by its SSR name, e.g. `aes-128-cfb`.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "none" | "plain" => Method::None,
            "aes-128-cfb" => Method::Aes128Cfb,
            "aes-256-cfb" => Method::Aes256Cfb,
            "aes-128-ctr" => Method::Aes128Ctr,
            "aes-256-ctr" => Method::Aes256Ctr,
            "rc4-md5" => Method::Rc4Md5,
            "rc4-md5-6" => Method::Rc4Md5_6,
            "chacha20" => Method::ChaCha20,
            "chacha20-ietf" => Method::ChaCha20Ietf,
            _ => return None,
        })
    }

    /// The SSR name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
            Method::Rc4Md5 => "rc4-md5",
            Method::Rc4Md5_6 => "rc4-md5-6",
            Method::ChaCha20 => "chacha20",
            Method::ChaCha20Ietf => "chacha20-ietf",
        }
    }

    /// Length of the key derived from the password.
    pub fn key_len(&self) -> usize {
        match self {
            Method::None
            | Method::Aes128Cfb
            | Method::Aes128Ctr
            | Method::Rc4Md5
            | Method::Rc4Md5_6 => 16,
            Method::Aes256Cfb | Method::Aes256Ctr | Method::ChaCha20 | Method::ChaCha20Ietf => 32,
        }
    }

    /// Length of the IV prepended to each direction of the stream.
    pub fn iv_len(&self) -> usize {
        match self {
            Method::None => 0,
            Method::Rc4Md5_6 => 6,
            Method::ChaCha20 => 8,
            Method::ChaCha20Ietf => 12,
            Method::Aes128Cfb
            | Method::Aes256Cfb
            | Method::Aes128Ctr
            | Method::Aes256Ctr
            | Method::Rc4Md5 => 16,
        }
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration, no salt.
///
/// `D_i = MD5(D_{i-1} | password)`, concatenated until `key_len` bytes.
pub(crate) fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// A key derived from the server password.
#[derive(Clone, Eq, PartialEq, Hash)]
pub(crate) struct CipherKey(Vec<u8>);

impl CipherKey {
    pub(crate) fn derive(password: &[u8], key_len: usize) -> Self {
        Self(evp_bytes_to_key(password, key_len))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Debug for CipherKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CipherKey").field(&"*****").finish()
    }
}

/// The per-connection stream cipher.
///
/// The send IV is drawn from the OS on first use and emitted in front of the
/// first encrypted output. The receive IV is collected from the front of the
/// inbound stream, however it is split across calls, before any plaintext is
/// produced.
pub(crate) struct CipherSession {
    method: Method,
    key: CipherKey,
    send_iv: Option<Vec<u8>>,
    iv_sent: bool,
    encryptor: Option<StreamCipher>,
    recv_iv: Vec<u8>,
    decryptor: Option<StreamCipher>,
}

impl CipherSession {
    pub(crate) fn new(method: &str, password: &[u8]) -> Result<Self, Unsupported> {
        let method =
            Method::from_name(method).ok_or_else(|| Unsupported::Cipher(method.to_string()))?;
        Ok(Self::with_method(method, password))
    }

    pub(crate) fn with_method(method: Method, password: &[u8]) -> Self {
        Self {
            method,
            key: CipherKey::derive(password, method.key_len()),
            send_iv: None,
            iv_sent: false,
            encryptor: None,
            recv_iv: Vec::with_capacity(method.iv_len()),
            decryptor: None,
        }
    }

    pub(crate) fn method(&self) -> Method {
        self.method
    }

    pub(crate) fn key(&self) -> &[u8] {
        self.key.as_bytes()
    }

    /// Returns the send IV, generating it on first call.
    pub(crate) fn send_iv(&mut self) -> &[u8] {
        let iv_len = self.method.iv_len();
        self.send_iv.get_or_insert_with(|| {
            let mut iv = vec![0u8; iv_len];
            OsRng
                .try_fill_bytes(&mut iv)
                .expect("system random source failure");
            iv
        })
    }

    /// The receive IV, once it has been read completely.
    pub(crate) fn recv_iv(&self) -> Option<&[u8]> {
        self.decryptor.as_ref().map(|_| self.recv_iv.as_slice())
    }

    /// `(expected, received)` while the receive IV is incomplete.
    pub(crate) fn recv_iv_pending(&self) -> Option<(usize, usize)> {
        match self.decryptor {
            Some(_) => None,
            None if self.method.iv_len() == 0 => None,
            None => Some((self.method.iv_len(), self.recv_iv.len())),
        }
    }

    pub(crate) fn iv_sent(&self) -> bool {
        self.iv_sent
    }

    pub(crate) fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        if self.encryptor.is_none() {
            let iv = self.send_iv().to_vec();
            self.encryptor = Some(StreamCipher::new(self.method, self.key(), &iv, true));
        }
        let mut out = Vec::with_capacity(self.method.iv_len() + data.len());
        if !self.iv_sent {
            if let Some(iv) = &self.send_iv {
                out.extend_from_slice(iv);
            }
            self.iv_sent = true;
            tracing::trace!(iv_len = self.method.iv_len(), "send IV emitted");
        }
        if let Some(encryptor) = self.encryptor.as_mut() {
            out.extend_from_slice(&encryptor.apply(data));
        }
        out
    }

    pub(crate) fn decrypt(&mut self, mut data: &[u8]) -> Vec<u8> {
        if self.decryptor.is_none() {
            let want = self.method.iv_len() - self.recv_iv.len();
            let take = want.min(data.len());
            self.recv_iv.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.recv_iv.len() < self.method.iv_len() {
                return Vec::new();
            }
            self.decryptor = Some(StreamCipher::new(
                self.method,
                self.key.as_bytes(),
                &self.recv_iv,
                false,
            ));
            tracing::trace!(iv_len = self.method.iv_len(), "recv IV consumed");
        }
        match self.decryptor.as_mut() {
            Some(decryptor) => decryptor.apply(data),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_send_iv(&mut self, iv: Vec<u8>) {
        assert_eq!(iv.len(), self.method.iv_len());
        self.send_iv = Some(iv);
    }
}

impl Debug for CipherSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSession")
            .field("method", &self.method)
            .field("iv_sent", &self.iv_sent)
            .field("recv_iv_len", &self.recv_iv.len())
            .finish_non_exhaustive()
    }
}

enum StreamCipher {
    Plain,
    AesEncrypt(StreamingEncryptingKey),
    AesDecrypt(StreamingDecryptingKey),
    Rc4(Rc4),
    ChaCha20(ChaCha20),
}

impl StreamCipher {
    fn new(method: Method, key: &[u8], iv: &[u8], encrypt: bool) -> Self {
        match method {
            Method::None => StreamCipher::Plain,
            Method::Aes128Cfb | Method::Aes256Cfb | Method::Aes128Ctr | Method::Aes256Ctr => {
                let algorithm = match method {
                    Method::Aes128Cfb | Method::Aes128Ctr => &AES_128,
                    _ => &AES_256,
                };
                let iv: [u8; 16] = iv.try_into().expect("AES IV is 16 bytes");
                let key = UnboundCipherKey::new(algorithm, key).expect("key length checked");
                let ctr = matches!(method, Method::Aes128Ctr | Method::Aes256Ctr);
                if encrypt {
                    let context = EncryptionContext::Iv128(FixedLength::from(iv));
                    let key = if ctr {
                        StreamingEncryptingKey::less_safe_ctr(key, context)
                    } else {
                        StreamingEncryptingKey::less_safe_cfb128(key, context)
                    };
                    StreamCipher::AesEncrypt(key.expect("AES stream setup failed"))
                } else {
                    let context = DecryptionContext::Iv128(FixedLength::from(iv));
                    let key = if ctr {
                        StreamingDecryptingKey::ctr(key, context)
                    } else {
                        StreamingDecryptingKey::cfb128(key, context)
                    };
                    StreamCipher::AesDecrypt(key.expect("AES stream setup failed"))
                }
            }
            Method::Rc4Md5 | Method::Rc4Md5_6 => {
                let mut material = key.to_vec();
                material.extend_from_slice(iv);
                let session_key = md5(&material);
                material.zeroize();
                StreamCipher::Rc4(Rc4::new(&session_key))
            }
            Method::ChaCha20 | Method::ChaCha20Ietf => StreamCipher::ChaCha20(ChaCha20::new(key, iv)),
        }
    }

    fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        match self {
            StreamCipher::Plain => data.to_vec(),
            StreamCipher::AesEncrypt(key) => {
                let mut out = vec![0u8; data.len() + AES_BLOCK_LEN];
                let n = key
                    .update(data, &mut out)
                    .expect("encrypt failed, this should never happen")
                    .written()
                    .len();
                out.truncate(n);
                out
            }
            StreamCipher::AesDecrypt(key) => {
                let mut out = vec![0u8; data.len() + AES_BLOCK_LEN];
                let n = key
                    .update(data, &mut out)
                    .expect("decrypt failed, this should never happen")
                    .written()
                    .len();
                out.truncate(n);
                out
            }
            StreamCipher::Rc4(rc4) => {
                let mut out = data.to_vec();
                rc4.apply_keystream(&mut out);
                out
            }
            StreamCipher::ChaCha20(chacha) => {
                let mut out = data.to_vec();
                chacha.process_mut(&mut out);
                out
            }
        }
    }
}

const AES_BLOCK_LEN: usize = 16;

/// The RC4 keystream generator.
pub(crate) struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub(crate) fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, b) in s.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    pub(crate) fn apply_keystream(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[self.s[self.i as usize].wrapping_add(self.s[self.j as usize]) as usize];
            *b ^= k;
        }
    }
}

impl Drop for Rc4 {
    fn drop(&mut self) {
        self.s.zeroize();
    }
}

impl Debug for Rc4 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}

/// Encrypts one block with AES-128-CBC under a zero IV, i.e. a single AES
/// block operation.
pub(crate) fn aes128_encrypt_block(key: &[u8], block: &[u8; 16]) -> [u8; 16] {
    let key = UnboundCipherKey::new(&AES_128, key).expect("AES-128 key is 16 bytes");
    let key = PaddedBlockEncryptingKey::cbc_pkcs7(key).expect("AES setup failed");
    let mut in_out = block.to_vec();
    key.less_safe_encrypt(
        &mut in_out,
        EncryptionContext::Iv128(FixedLength::from([0u8; 16])),
    )
    .expect("encrypt failed, this should never happen");
    let mut out = [0u8; 16];
    out.copy_from_slice(&in_out[..16]);
    out
}

pub(crate) fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

pub(crate) fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac =
        <Hmac<Md5> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac =
        <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Adler-32 as used by zlib.
pub(crate) fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    // 5552 is the largest n for which b cannot overflow before the reduction.
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}
