//! The `ssr://` link format.
//!
//! ```text
//! ssr://BASE64URL( host ":" port ":" proto ":" method ":" obfs ":" BASE64URL(password)
//!                  "/?obfsparam=" BASE64URL(obfs_param)
//!                  "&protoparam=" BASE64URL(proto_param)
//!                  "&remarks="   BASE64URL(remarks)
//!                  "&group="     BASE64URL(group) )
//! ```
//!
//! The plain form drops every base64 layer and carries the fields verbatim.
//! The top-level split is bounded to six components, so a plain password
//! containing `:` only survives if it is the last component.
use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use url::form_urlencoded;

use crate::config::ServerDescriptor;

const SCHEME: &str = "ssr://";

/// Unpadded base64url on output, padding tolerated on input.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

fn decode(s: &str) -> Option<Vec<u8>> {
    // Some generators emit the standard alphabet.
    let s: String = s
        .trim()
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    B64.decode(s).ok()
}

fn decode_field(s: &str) -> String {
    decode(s)
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

/// Parses an `ssr://` link.
///
/// With `encoded` set the body and every inner field are base64url decoded,
/// otherwise they are taken verbatim. Returns `None` if the scheme is wrong,
/// the body does not decode, or fewer than two `:` separated components are
/// present. Inner fields that fail to decode are left empty.
///
/// # Example
///
/// ```
/// let d = ssrwire::link::parse(
///     "ssr://relay.example.com:8388:origin:aes-256-cfb:plain:secret/?remarks=home",
///     false,
/// )
/// .unwrap();
/// assert_eq!(d.address(), "relay.example.com:8388");
/// assert_eq!(d.password(), b"secret");
/// assert_eq!(d.remarks(), "home");
/// ```
pub fn parse(url: &str, encoded: bool) -> Option<ServerDescriptor> {
    let body = url.strip_prefix(SCHEME)?;
    let body = if encoded {
        String::from_utf8(decode(body)?).ok()?
    } else {
        body.to_string()
    };

    let parts: Vec<&str> = body.splitn(6, ':').collect();
    if parts.len() < 2 {
        return None;
    }
    let part = |i: usize| parts.get(i).copied().unwrap_or_default();

    let mut descriptor = ServerDescriptor {
        address: format!("{}:{}", parts[0], parts[1]),
        protocol: part(2).to_string(),
        method: part(3).to_string(),
        obfs: part(4).to_string(),
        ..Default::default()
    };

    let tail = part(5);
    let tail = tail.split_once('#').map_or(tail, |(before, _)| before);
    let (authority, query) = tail.split_once('?').unwrap_or((tail, ""));
    let password = authority.split('/').next().unwrap_or_default();
    descriptor.password = if encoded {
        decode(password).unwrap_or_default()
    } else {
        password.as_bytes().to_vec()
    };

    let field = |value: &str| {
        if encoded {
            decode_field(value)
        } else {
            value.to_string()
        }
    };
    let mut protocol_param = None;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "obfsparam" => descriptor.obfs_param = field(&value),
            "protoparam" | "protocolparam" => {
                protocol_param.get_or_insert_with(|| field(&value));
            }
            "remarks" => descriptor.remarks = field(&value),
            "group" => descriptor.group = field(&value),
            _ => {}
        }
    }
    descriptor.protocol_param = protocol_param.unwrap_or_default();

    Some(descriptor)
}

/// Renders `descriptor` as an `ssr://` link, base64url encoded if `encoded`
/// is set.
pub fn to_url(descriptor: &ServerDescriptor, encoded: bool) -> String {
    let field = |value: &[u8]| {
        if encoded {
            B64.encode(value)
        } else {
            String::from_utf8_lossy(value).into_owned()
        }
    };
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("obfsparam", &field(descriptor.obfs_param.as_bytes()))
        .append_pair("protoparam", &field(descriptor.protocol_param.as_bytes()))
        .append_pair("remarks", &field(descriptor.remarks.as_bytes()))
        .append_pair("group", &field(descriptor.group.as_bytes()))
        .finish();
    let body = format!(
        "{}:{}:{}:{}:{}/?{}",
        descriptor.address,
        descriptor.protocol,
        descriptor.method,
        descriptor.obfs,
        field(&descriptor.password),
        query
    );
    if encoded {
        format!("{}{}", SCHEME, B64.encode(body))
    } else {
        format!("{}{}", SCHEME, body)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "ssr://UE5FVU1PTk9VTFRSQU1JQ1JPU0NPUElDU0lMSUNPVk9MQ0FOT0NPTklPU0lTLnNhYzkwOTBzYWMuZ3E6MzE1NjM6YXV0aF9hZXMxMjhfbWQ1OmNoYWNoYTIwLWlldGY6dGxzMS4yX3RpY2tldF9hdXRoOlZqRm5VMkpoUzJ0NlFnLz9vYmZzcGFyYW09VUU1RlZVMVBUazlWVEZSU1FVMUpRMUpQVTBOUFVFbERVMGxNU1VOUFZrOU1RMEZPVDBOUFRrbFBVMGxUTG5OaFl6a3dPVEJ6WVdNdVozRSZwcm90b3BhcmFtPSZyZW1hcmtzPTVZV042TFM1TlEmZ3JvdXA9";

    #[test]
    fn test_parse_sample_link() {
        let d = parse(SAMPLE, true).unwrap();
        assert_eq!(
            d.address(),
            "PNEUMONOULTRAMICROSCOPICSILICOVOLCANOCONIOSIS.sac9090sac.gq:31563"
        );
        assert_eq!(d.protocol(), "auth_aes128_md5");
        assert_eq!(d.method(), "chacha20-ietf");
        assert_eq!(d.obfs(), "tls1.2_ticket_auth");
        assert_eq!(d.password(), b"V1gSbaKkzB");
        assert_eq!(
            d.obfs_param(),
            "PNEUMONOULTRAMICROSCOPICSILICOVOLCANOCONIOSIS.sac9090sac.gq"
        );
        assert_eq!(d.protocol_param(), "");
        assert_eq!(d.remarks(), "免费5");
        assert_eq!(d.group(), "");
        assert_eq!(d.kind(), "ssr");
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse("ssr://###", true).is_none());
        assert!(parse("ssr://###", false).is_none());
        assert!(parse("ss://host:1", false).is_none());
        assert!(parse("ssr://hostonly", false).is_none());
    }

    #[test]
    fn test_parse_missing_fields() {
        let d = parse("ssr://host:443", false).unwrap();
        assert_eq!(d.address(), "host:443");
        assert_eq!(d.method(), "");
        assert_eq!(d.obfs(), "");
        assert!(d.password().is_empty());

        let d = parse("ssr://host:443:origin:none:plain", false).unwrap();
        assert_eq!(d.obfs(), "plain");
        assert!(d.password().is_empty());
    }

    #[test]
    fn test_parse_bad_inner_field() {
        let body = "h:1:origin:none:plain:cGFzcw/?obfsparam=%%%&protocolparam=dWlkOmtleQ";
        let d = parse(&format!("ssr://{}", B64.encode(body)), true).unwrap();
        assert_eq!(d.password(), b"pass");
        assert_eq!(d.obfs_param(), "");
        assert_eq!(d.protocol_param(), "uid:key");
    }

    #[test]
    fn test_plain_password_with_colon() {
        let d = parse("ssr://h:1:origin:none:plain:a:b/?group=g", false).unwrap();
        assert_eq!(d.password(), b"a:b");
        assert_eq!(d.group(), "g");
    }

    #[test]
    fn test_round_trip() {
        let d = ServerDescriptor::builder_with_address("relay.example.com:8388")
            .with_cipher("aes-128-ctr", "pass word")
            .with_obfs("http_simple", "cdn.example.com,www.example.com")
            .with_protocol("auth_aes128_sha1", "1024:secret")
            .with_remarks("家")
            .with_group("group & co");

        let encoded = to_url(&d, true);
        assert!(!encoded.contains('='));
        assert_eq!(parse(&encoded, true).unwrap(), d);

        let plain = to_url(&d, false);
        assert_eq!(parse(&plain, false).unwrap(), d);
    }
}
