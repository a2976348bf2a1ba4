use std::sync::Arc;

use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};

use crate::{
    crypto::hmac_sha1,
    error::BadDataReceived,
    obfs::pick_host,
    plugin::{Obfs, ObfsDecoded, PluginData, ServerInfo, TlsTicketData, unix_time},
    specification::{HMAC_SHA1_TAG_LEN, OBFS_HANDSHAKE_MAX_LEN, TLS_OVERHEAD, TLS_RECORD_HDR_LEN},
};

const TLS_VERSION: [u8; 2] = [0x03, 0x03];
const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
const CONTENT_HANDSHAKE: u8 = 0x16;
const CONTENT_APPLICATION_DATA: u8 = 0x17;

const CIPHER_SUITES: [u8; 32] = [
    0x00, 0x1c, 0xc0, 0x2b, 0xc0, 0x2f, 0xcc, 0xa9, 0xcc, 0xa8, 0xcc, 0x14, 0xcc, 0x13, 0xc0, 0x0a,
    0xc0, 0x14, 0xc0, 0x09, 0xc0, 0x13, 0x00, 0x9c, 0x00, 0x35, 0x00, 0x2f, 0x00, 0x0a, 0x01, 0x00,
];

const EXT_RENEGOTIATION_INFO: [u8; 5] = [0xff, 0x01, 0x00, 0x01, 0x00];
const EXT_EXTENDED_MASTER_SECRET: [u8; 4] = [0x00, 0x17, 0x00, 0x00];
const EXT_SESSION_TICKET: [u8; 2] = [0x00, 0x23];

// signature_algorithms, status_request, signed_certificate_timestamp,
// channel_id, ec_point_formats, supported_groups
const EXT_TAIL: [u8; 59] = [
    0x00, 0x0d, 0x00, 0x16, 0x00, 0x14, 0x06, 0x01, 0x06, 0x03, 0x05, 0x01, 0x05, 0x03, 0x04, 0x01,
    0x04, 0x03, 0x03, 0x01, 0x03, 0x03, 0x02, 0x01, 0x02, 0x03, 0x00, 0x05, 0x00, 0x05, 0x01, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x12, 0x00, 0x00, 0x75, 0x50, 0x00, 0x00, 0x00, 0x0b, 0x00, 0x02, 0x01,
    0x00, 0x00, 0x0a, 0x00, 0x06, 0x00, 0x04, 0x00, 0x17, 0x00, 0x18,
];

/// Offset of the server random inside the server flight.
const SERVER_RANDOM_OFFSET: usize = TLS_RECORD_HDR_LEN + 4 + TLS_VERSION.len();
const SERVER_RANDOM_LEN: usize = 32;

/// Longest host name put in the SNI extension. Longer names are sent as an
/// empty SNI so every length field of the hello fits in a `u16`.
const SNI_HOST_MAX_LEN: usize = 255;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SendState {
    Initial,
    HelloSent,
    Established,
}

/// `tls1.2_ticket_auth` and `tls1.2_ticket_fastauth`.
///
/// The first write is disguised as a TLS 1.2 ClientHello resuming a session
/// ticket. Payload written before the server flight arrives is held back and
/// released behind ChangeCipherSpec and Finished, then everything travels
/// as application data records. The fast variant sends the whole client
/// flight at once.
#[derive(Debug)]
pub(crate) struct TlsTicketAuth {
    fastauth: bool,
    info: Arc<ServerInfo>,
    ticket: Arc<TlsTicketData>,
    rng: StdRng,
    send_state: SendState,
    handshake_received: bool,
    send_saver: Vec<u8>,
}

impl TlsTicketAuth {
    pub(crate) fn new(fastauth: bool) -> Self {
        let mut rng = StdRng::from_os_rng();
        let ticket = Arc::new(TlsTicketData::random(&mut rng));
        Self {
            fastauth,
            info: Arc::default(),
            ticket,
            rng,
            send_state: SendState::Initial,
            handshake_received: false,
            send_saver: Vec::new(),
        }
    }

    fn hmac(&self, data: &[u8]) -> [u8; HMAC_SHA1_TAG_LEN] {
        let mut key = Vec::with_capacity(self.info.key.len() + 32);
        key.extend_from_slice(&self.info.key);
        key.extend_from_slice(&self.ticket.client_id);
        let mut tag = [0u8; HMAC_SHA1_TAG_LEN];
        tag.copy_from_slice(&hmac_sha1(&key, data)[..HMAC_SHA1_TAG_LEN]);
        tag
    }

    /// A timestamped random whose tail authenticates its head.
    fn auth_random(&mut self) -> [u8; 32] {
        let mut random = [0u8; 32];
        random[..4].copy_from_slice(&unix_time().to_be_bytes());
        self.rng.fill_bytes(&mut random[4..22]);
        let tag = self.hmac(&random[..22]);
        random[22..].copy_from_slice(&tag);
        random
    }

    fn sni_host(&mut self) -> String {
        let hosts = if self.info.param.is_empty() {
            self.info.host.clone()
        } else {
            self.info.param.clone()
        };
        if hosts.ends_with(|c: char| c.is_ascii_digit()) {
            return String::new();
        }
        let host = pick_host(&hosts, "", &mut self.rng);
        if host.len() > SNI_HOST_MAX_LEN {
            tracing::debug!(len = host.len(), "tls: host too long for sni");
            return String::new();
        }
        host
    }

    fn client_hello(&mut self) -> Vec<u8> {
        let host = self.sni_host();

        let mut ext = Vec::with_capacity(512);
        ext.extend_from_slice(&EXT_RENEGOTIATION_INFO);
        ext.extend_from_slice(&[0x00, 0x00]);
        ext.extend_from_slice(&(host.len() as u16 + 5).to_be_bytes());
        ext.extend_from_slice(&(host.len() as u16 + 3).to_be_bytes());
        ext.push(0x00);
        ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
        ext.extend_from_slice(host.as_bytes());
        ext.extend_from_slice(&EXT_EXTENDED_MASTER_SECRET);
        let mut ticket = vec![0u8; self.rng.random_range(0..164) * 2 + 64];
        self.rng.fill_bytes(&mut ticket);
        ext.extend_from_slice(&EXT_SESSION_TICKET);
        ext.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
        ext.extend_from_slice(&ticket);
        ext.extend_from_slice(&EXT_TAIL);

        let mut hello = Vec::with_capacity(ext.len() + 128);
        hello.extend_from_slice(&TLS_VERSION);
        hello.extend_from_slice(&self.auth_random());
        hello.push(0x20);
        hello.extend_from_slice(&self.ticket.client_id);
        hello.extend_from_slice(&CIPHER_SUITES);
        hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        hello.extend_from_slice(&ext);

        let mut out = Vec::with_capacity(hello.len() + 9);
        out.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x01]);
        out.extend_from_slice(&(hello.len() as u16 + 4).to_be_bytes());
        out.extend_from_slice(&[0x01, 0x00]);
        out.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        out.extend_from_slice(&hello);
        out
    }

    /// ChangeCipherSpec and Finished, followed by held back payload.
    fn client_finish(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(43 + self.send_saver.len());
        out.extend_from_slice(&[CONTENT_CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01]);
        out.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x03, 0x00, 0x20]);
        let mut random = [0u8; 22];
        self.rng.fill_bytes(&mut random);
        out.extend_from_slice(&random);
        let tag = self.hmac(&out);
        out.extend_from_slice(&tag);
        out.append(&mut self.send_saver);
        self.send_state = SendState::Established;
        out
    }

    fn pack_records(&mut self, data: &[u8], out: &mut Vec<u8>) {
        if data.len() < 1024 {
            push_record(out, data);
            return;
        }
        let mut rest = data;
        while rest.len() > 2048 {
            let len = self.rng.random_range(100..4196).min(rest.len());
            let (record, tail) = rest.split_at(len);
            push_record(out, record);
            rest = tail;
        }
        if !rest.is_empty() {
            push_record(out, rest);
        }
    }

    /// Walks the server flight. Returns the offset just past the Finished
    /// record, or `None` if the flight is incomplete.
    fn server_flight_end(data: &[u8]) -> Option<usize> {
        let mut pos = 0;
        let mut ccs_seen = false;
        while pos + TLS_RECORD_HDR_LEN <= data.len() {
            let len = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as usize;
            let end = pos + TLS_RECORD_HDR_LEN + len;
            if end > data.len() {
                return None;
            }
            match data[pos] {
                CONTENT_CHANGE_CIPHER_SPEC => ccs_seen = true,
                CONTENT_HANDSHAKE if ccs_seen => return Some(end),
                _ => {}
            }
            pos = end;
        }
        None
    }

    fn verify_server_flight(&self, flight: &[u8]) -> Result<(), BadDataReceived> {
        if flight.len() < SERVER_RANDOM_OFFSET + SERVER_RANDOM_LEN + HMAC_SHA1_TAG_LEN {
            return Err(BadDataReceived::TlsHandshakeTooShort);
        }
        let random = &flight[SERVER_RANDOM_OFFSET..SERVER_RANDOM_OFFSET + SERVER_RANDOM_LEN];
        if self.hmac(&random[..22]) != random[22..] {
            return Err(BadDataReceived::TlsHandshakeHmac);
        }
        let (signed, tag) = flight.split_at(flight.len() - HMAC_SHA1_TAG_LEN);
        if self.hmac(signed) != tag {
            return Err(BadDataReceived::TlsHandshakeHmac);
        }
        Ok(())
    }
}

fn push_record(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&[CONTENT_APPLICATION_DATA, 0x03, 0x03]);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

/// Strips application data records. Returns the payload and the number of
/// bytes covered by complete records.
fn unpack_records(data: &[u8]) -> Result<(Vec<u8>, usize), BadDataReceived> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;
    while data.len() - pos >= TLS_RECORD_HDR_LEN {
        if data[pos..pos + 3] != [CONTENT_APPLICATION_DATA, 0x03, 0x03] {
            return Err(BadDataReceived::TlsRecordMagic);
        }
        let len = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as usize;
        let end = pos + TLS_RECORD_HDR_LEN + len;
        if end > data.len() {
            break;
        }
        out.extend_from_slice(&data[pos + TLS_RECORD_HDR_LEN..end]);
        pos = end;
    }
    Ok((out, pos))
}

impl Obfs for TlsTicketAuth {
    fn set_server_info(&mut self, info: Arc<ServerInfo>) {
        self.info = info;
    }

    fn data(&self) -> PluginData {
        PluginData::TlsTicket(self.ticket.clone())
    }

    fn set_data(&mut self, data: PluginData) {
        if let PluginData::TlsTicket(ticket) = data {
            self.ticket = ticket;
        }
    }

    fn overhead(&self) -> usize {
        TLS_OVERHEAD
    }

    fn encode(&mut self, data: &[u8]) -> Vec<u8> {
        match self.send_state {
            SendState::Established => {
                let mut out = Vec::with_capacity(data.len() + TLS_OVERHEAD);
                self.pack_records(data, &mut out);
                out
            }
            SendState::HelloSent => {
                if data.is_empty() {
                    return self.client_finish();
                }
                let mut saver = core::mem::take(&mut self.send_saver);
                self.pack_records(data, &mut saver);
                self.send_saver = saver;
                Vec::new()
            }
            SendState::Initial => {
                if !data.is_empty() {
                    let mut saver = core::mem::take(&mut self.send_saver);
                    self.pack_records(data, &mut saver);
                    self.send_saver = saver;
                }
                self.send_state = SendState::HelloSent;
                let mut out = self.client_hello();
                tracing::trace!(len = out.len(), fastauth = self.fastauth, "tls: client hello");
                if self.fastauth {
                    out.extend_from_slice(&self.client_finish());
                }
                out
            }
        }
    }

    fn decode(&mut self, data: &[u8]) -> Result<ObfsDecoded, BadDataReceived> {
        if self.handshake_received {
            let (data, consumed) = unpack_records(data)?;
            return Ok(ObfsDecoded {
                data,
                consumed,
                send_back: false,
            });
        }
        let Some(flight_end) = Self::server_flight_end(data) else {
            if data.len() > OBFS_HANDSHAKE_MAX_LEN {
                return Err(BadDataReceived::HandshakeTooLong);
            }
            return Ok(ObfsDecoded::default());
        };
        self.verify_server_flight(&data[..flight_end])?;
        self.handshake_received = true;
        tracing::trace!(len = flight_end, "tls: server flight verified");

        let (payload, consumed) = unpack_records(&data[flight_end..])?;
        Ok(ObfsDecoded {
            data: payload,
            consumed: flight_end + consumed,
            send_back: !self.fastauth,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(host: &str, param: &str) -> Arc<ServerInfo> {
        Arc::new(ServerInfo {
            host: host.into(),
            port: 443,
            tcp_mss: 1460,
            param: param.into(),
            iv: vec![0x01; 16],
            key: b"0123456789abcdef".to_vec(),
            head_len: 7,
            ..Default::default()
        })
    }

    /// Builds a server flight the way a relay answers a ticket hello.
    fn server_flight(obfs: &mut TlsTicketAuth, with_ticket: bool) -> Vec<u8> {
        let mut hello = TLS_VERSION.to_vec();
        hello.extend_from_slice(&obfs.auth_random());
        hello.push(0x20);
        hello.extend_from_slice(&obfs.ticket.client_id);
        hello.extend_from_slice(&[0xc0, 0x2f, 0x00, 0x00, 0x05, 0xff, 0x01, 0x00, 0x01, 0x00]);

        let mut out = vec![CONTENT_HANDSHAKE, 0x03, 0x03];
        out.extend_from_slice(&(hello.len() as u16 + 4).to_be_bytes());
        out.extend_from_slice(&[0x02, 0x00]);
        out.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        out.extend_from_slice(&hello);
        if with_ticket {
            out.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x03, 0x00, 0x44, 0x04, 0x00, 0x00, 0x40]);
            out.extend_from_slice(&[0x5a; 64]);
        }
        out.extend_from_slice(&[CONTENT_CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01]);
        out.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x03, 0x00, 0x28]);
        out.extend_from_slice(&[0x33; 30]);
        let tag = obfs.hmac(&out);
        out.extend_from_slice(&tag);
        out
    }

    fn parse_client_hello(hello: &[u8]) -> (Vec<u8>, String) {
        assert_eq!(hello[..3], [0x16, 0x03, 0x01]);
        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(hello.len(), record_len + 5);
        assert_eq!(hello[5..7], [0x01, 0x00]);
        assert_eq!(hello[9..11], TLS_VERSION);
        let random = hello[11..43].to_vec();
        assert_eq!(hello[43], 0x20);
        let suites_end = 44 + 32 + CIPHER_SUITES.len();
        assert_eq!(hello[76..suites_end], CIPHER_SUITES);
        let ext = &hello[suites_end + 2..];
        assert_eq!(ext[..5], EXT_RENEGOTIATION_INFO);
        let sni_len = u16::from_be_bytes([ext[12], ext[13]]) as usize;
        let host = String::from_utf8(ext[14..14 + sni_len].to_vec()).unwrap();
        assert!(ext.ends_with(&EXT_TAIL));
        (random, host)
    }

    #[test]
    fn test_client_hello_layout() {
        let mut obfs = TlsTicketAuth::new(false);
        obfs.set_server_info(info("203.0.113.9", "a.example.com,b.example.com"));
        let hello = obfs.encode(b"first frame");
        let (random, host) = parse_client_hello(&hello);
        assert!(host == "a.example.com" || host == "b.example.com");
        assert_eq!(obfs.hmac(&random[..22]), random[22..]);
    }

    #[test]
    fn test_numeric_host_has_empty_sni() {
        let mut obfs = TlsTicketAuth::new(false);
        obfs.set_server_info(info("203.0.113.9", ""));
        let hello = obfs.encode(b"x");
        let (_, host) = parse_client_hello(&hello);
        assert_eq!(host, "");
    }

    #[test]
    fn test_oversized_host_has_empty_sni() {
        let mut obfs = TlsTicketAuth::new(false);
        obfs.set_server_info(info("203.0.113.9", &"a".repeat(70_000)));
        let hello = obfs.encode(b"x");
        let (_, host) = parse_client_hello(&hello);
        assert_eq!(host, "");

        let longest = format!("{}.example.com", "b".repeat(SNI_HOST_MAX_LEN - 12));
        let mut obfs = TlsTicketAuth::new(false);
        obfs.set_server_info(info("203.0.113.9", &longest));
        let (_, host) = parse_client_hello(&obfs.encode(b"x"));
        assert_eq!(host, longest);
    }

    #[test]
    fn test_handshake_then_records() {
        let mut obfs = TlsTicketAuth::new(false);
        obfs.set_server_info(info("relay.example.com", ""));
        let _hello = obfs.encode(b"first");
        assert!(obfs.encode(b"second").is_empty());

        let mut wire = server_flight(&mut obfs, true);
        push_record(&mut wire, b"welcome");

        // Partial flight is buffered.
        let partial = obfs.decode(&wire[..40]).unwrap();
        assert_eq!(partial.consumed, 0);

        let decoded = obfs.decode(&wire).unwrap();
        assert!(decoded.send_back);
        assert_eq!(decoded.consumed, wire.len());
        assert_eq!(decoded.data, b"welcome");

        let finish = obfs.encode(&[]);
        assert_eq!(finish[..6], [0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        assert_eq!(finish[6..11], [0x16, 0x03, 0x03, 0x00, 0x20]);
        assert_eq!(obfs.hmac(&finish[..33]), finish[33..43]);
        let (held, used) = unpack_records(&finish[43..]).unwrap();
        assert_eq!(used, finish.len() - 43);
        assert_eq!(held, b"firstsecond");

        let (data, _) = unpack_records(&obfs.encode(b"later")).unwrap();
        assert_eq!(data, b"later");
    }

    #[test]
    fn test_decode_consumes_all_complete_records() {
        let mut obfs = TlsTicketAuth::new(true);
        obfs.set_server_info(info("relay.example.com", ""));
        let _ = obfs.encode(b"x");
        let mut wire = server_flight(&mut obfs, false);
        push_record(&mut wire, b"one");
        push_record(&mut wire, b"two");
        let complete = wire.len();
        push_record(&mut wire, b"three");
        wire.truncate(complete + 6);

        let decoded = obfs.decode(&wire).unwrap();
        assert_eq!(decoded.consumed, complete);
        assert_eq!(decoded.data, b"onetwo");

        let decoded = obfs.decode(&wire[complete..]).unwrap();
        assert_eq!(decoded.consumed, 0);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_fastauth_sends_everything() {
        let mut obfs = TlsTicketAuth::new(true);
        obfs.set_server_info(info("relay.example.com", ""));
        let out = obfs.encode(b"payload");
        let hello_len = u16::from_be_bytes([out[3], out[4]]) as usize + 5;
        let finish = &out[hello_len..];
        assert_eq!(finish[0], CONTENT_CHANGE_CIPHER_SPEC);
        let (held, _) = unpack_records(&finish[43..]).unwrap();
        assert_eq!(held, b"payload");

        let wire = server_flight(&mut obfs, false);
        let decoded = obfs.decode(&wire).unwrap();
        assert!(!decoded.send_back);
        assert_eq!(decoded.consumed, wire.len());
    }

    #[test]
    fn test_large_payload_split() {
        let mut obfs = TlsTicketAuth::new(true);
        obfs.set_server_info(info("relay.example.com", ""));
        let _ = obfs.encode(b"x");
        let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let wire = obfs.encode(&payload);
        let (data, used) = unpack_records(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(data, payload);
        assert!(wire.len() > payload.len() + TLS_OVERHEAD);
    }

    #[test]
    fn test_bad_server_flight() {
        let mut obfs = TlsTicketAuth::new(false);
        obfs.set_server_info(info("relay.example.com", ""));
        let _ = obfs.encode(b"x");
        let mut wire = server_flight(&mut obfs, false);
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert_eq!(
            obfs.decode(&wire).unwrap_err(),
            BadDataReceived::TlsHandshakeHmac
        );
    }

    #[test]
    fn test_bad_record_magic() {
        let mut obfs = TlsTicketAuth::new(true);
        obfs.set_server_info(info("relay.example.com", ""));
        let _ = obfs.encode(b"x");
        let wire = server_flight(&mut obfs, false);
        obfs.decode(&wire).unwrap();
        assert_eq!(
            obfs.decode(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28]).unwrap_err(),
            BadDataReceived::TlsRecordMagic
        );
    }

    #[test]
    fn test_shared_client_id() {
        let first = TlsTicketAuth::new(false);
        let mut second = TlsTicketAuth::new(false);
        second.set_data(first.data());
        assert_eq!(first.ticket.client_id, second.ticket.client_id);
    }
}
