use std::sync::Arc;

use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};

use crate::{
    error::BadDataReceived,
    plugin::{Obfs, ObfsDecoded, ServerInfo},
};

/// `random_head`.
///
/// The first write puts a random head on the wire and holds the payload back
/// until the server answers. The first server frame is discarded; from then
/// on bytes pass through untouched.
#[derive(Debug)]
pub(crate) struct RandomHead {
    rng: StdRng,
    head_sent: bool,
    raw_sent: bool,
    raw_recv: bool,
    pending: Vec<u8>,
}

impl RandomHead {
    pub(crate) fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            head_sent: false,
            raw_sent: false,
            raw_recv: false,
            pending: Vec::new(),
        }
    }

    fn random_head(&mut self) -> Vec<u8> {
        let mut head = vec![0u8; self.rng.random_range(4..100)];
        self.rng.fill_bytes(&mut head);
        let crc = !crc32fast::hash(&head);
        head.extend_from_slice(&crc.to_le_bytes());
        head
    }
}

impl Obfs for RandomHead {
    fn set_server_info(&mut self, _info: Arc<ServerInfo>) {}

    fn encode(&mut self, data: &[u8]) -> Vec<u8> {
        if self.raw_sent {
            return data.to_vec();
        }
        self.pending.extend_from_slice(data);
        if !self.head_sent {
            self.head_sent = true;
            return self.random_head();
        }
        if self.raw_recv {
            self.raw_sent = true;
            return core::mem::take(&mut self.pending);
        }
        Vec::new()
    }

    fn decode(&mut self, data: &[u8]) -> Result<ObfsDecoded, BadDataReceived> {
        if self.raw_recv {
            return Ok(ObfsDecoded {
                data: data.to_vec(),
                consumed: data.len(),
                send_back: false,
            });
        }
        self.raw_recv = true;
        tracing::trace!(len = data.len(), "random_head: server head discarded");
        Ok(ObfsDecoded {
            data: Vec::new(),
            consumed: data.len(),
            send_back: true,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_head_checksum() {
        let mut obfs = RandomHead::new();
        let head = obfs.encode(b"payload");
        assert!((8..104).contains(&head.len()));
        let (body, crc) = head.split_at(head.len() - 4);
        assert_eq!(
            u32::from_le_bytes(crc.try_into().unwrap()),
            0xFFFF_FFFF - crc32fast::hash(body)
        );
    }

    #[test]
    fn test_payload_held_until_server_answers() {
        let mut obfs = RandomHead::new();
        let _head = obfs.encode(b"first ");
        assert!(obfs.encode(b"second").is_empty());

        let decoded = obfs.decode(b"server junk").unwrap();
        assert!(decoded.data.is_empty());
        assert_eq!(decoded.consumed, 11);
        assert!(decoded.send_back);

        assert_eq!(obfs.encode(&[]), b"first second");
        assert_eq!(obfs.encode(b"raw"), b"raw");

        let decoded = obfs.decode(b"reply").unwrap();
        assert_eq!(decoded.data, b"reply");
        assert!(!decoded.send_back);
    }
}
