use std::sync::Arc;

use crate::{
    crypto::hmac_sha1,
    error::BadDataReceived,
    plugin::{Protocol, ServerInfo},
    specification::HMAC_SHA1_TAG_LEN,
};

const UNIT_LEN: usize = 4096;

/// Flag set in the address type byte to announce one-time authentication.
const OTA_FLAG: u8 = 0x10;

/// `verify_sha1`, also registered as `ota`.
///
/// The address header carries an HMAC-SHA1 tag keyed by IV and key; every
/// following chunk is prefixed by its length and a tag keyed by IV and the
/// chunk counter. Server bytes are not framed.
#[derive(Debug)]
pub(crate) struct VerifySha1 {
    info: Arc<ServerInfo>,
    header_sent: bool,
    chunk_id: u32,
}

impl VerifySha1 {
    pub(crate) fn new() -> Self {
        Self {
            info: Arc::default(),
            header_sent: false,
            chunk_id: 0,
        }
    }

    fn pack_header(&self, header: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(header);
        if let Some(atyp) = out.get_mut(start) {
            *atyp |= OTA_FLAG;
        }
        let mut key = self.info.iv.clone();
        key.extend_from_slice(&self.info.key);
        let tag = hmac_sha1(&key, &out[start..]);
        out.extend_from_slice(&tag[..HMAC_SHA1_TAG_LEN]);
    }

    fn pack_chunk(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let mut key = self.info.iv.clone();
        key.extend_from_slice(&self.chunk_id.to_be_bytes());
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(&hmac_sha1(&key, chunk)[..HMAC_SHA1_TAG_LEN]);
        out.extend_from_slice(chunk);
        self.chunk_id = self.chunk_id.wrapping_add(1);
    }
}

impl Protocol for VerifySha1 {
    fn set_server_info(&mut self, info: Arc<ServerInfo>) {
        self.info = info;
    }

    fn pre_encrypt(&mut self, mut data: &[u8]) -> Vec<u8> {
        let chunks = data.len() / UNIT_LEN + 1;
        let mut out = Vec::with_capacity(data.len() + chunks * (2 + HMAC_SHA1_TAG_LEN) + 16);
        if !self.header_sent {
            let head_len = self.info.head_len.min(data.len());
            let (header, rest) = data.split_at(head_len);
            self.pack_header(header, &mut out);
            data = rest;
            self.header_sent = true;
        }
        for chunk in data.chunks(UNIT_LEN) {
            self.pack_chunk(chunk, &mut out);
        }
        out
    }

    fn post_decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize), BadDataReceived> {
        Ok((data.to_vec(), data.len()))
    }
}
