//! Service payload types shared between clients and the orchestrator.

#[cfg(feature = "logging")]
use crate::log::debug;
use std::{fmt, net::IpAddr};

/// The netId of a request or callback that has no backing network.
pub const NETID_UNSET: i32 = 0;

/// The netId of the local network used for tethered and locally advertised
/// services. Such a network is not usable by apps directly.
pub const LOCAL_NET_ID: i32 = 99;

/// The netId of the dummy interface, seen only when a local advertisement
/// loops back into discovery.
pub const DUMMY_NET_ID: i32 = 51;

/// An opaque handle to one network, as attributed by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Network(pub i32);

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Network({})", self.0)
    }
}

/// One TXT record attribute.
///
/// A key without `=` in the wire form carries no value at all, which is
/// distinct from an empty value (RFC 6763 section 6.4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxtEntry {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Info about one service instance, as seen by clients.
///
/// Clients fill in what a verb needs (type for discovery; name and type for
/// resolution; name, type, port and attributes for registration) and the
/// orchestrator fills in the rest on callbacks.
#[derive(Clone, Debug, Default)]
pub struct NsdServiceInfo {
    pub service_name: String,
    pub service_type: String,
    pub port: u16,
    pub txt: Vec<TxtEntry>,
    pub host_addresses: Vec<IpAddr>,
    /// The network the service was found on, or that the request targets.
    /// `None` targets or reports all networks.
    pub network: Option<Network>,
    /// OS interface index, kept when a service was seen on an interface that
    /// has no app-usable network. Zero means unset.
    pub interface_index: u32,
}

impl NsdServiceInfo {
    pub fn new(service_name: &str, service_type: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_type: service_type.to_string(),
            ..Self::default()
        }
    }
}

/// Decodes a raw DNS TXT record into attributes.
///
/// The wire form is a sequence of length-prefixed strings, each either
/// `key=value` or a bare boolean key.
pub(crate) fn parse_txt_record(raw: &[u8]) -> Vec<TxtEntry> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        let len = raw[i] as usize;
        i += 1;
        if len == 0 {
            continue;
        }
        if i + len > raw.len() {
            debug!("truncated TXT record, ignoring the tail");
            break;
        }
        let chunk = &raw[i..i + len];
        i += len;
        match chunk.iter().position(|&b| b == b'=') {
            Some(pos) => entries.push(TxtEntry {
                key: String::from_utf8_lossy(&chunk[..pos]).into_owned(),
                value: Some(chunk[pos + 1..].to_vec()),
            }),
            None => entries.push(TxtEntry {
                key: String::from_utf8_lossy(chunk).into_owned(),
                value: None,
            }),
        }
    }
    entries
}

/// Encodes attributes into the raw DNS TXT record form.
pub(crate) fn encode_txt_record(entries: &[TxtEntry]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for entry in entries {
        let mut chunk = entry.key.as_bytes().to_vec();
        if let Some(value) = &entry.value {
            chunk.push(b'=');
            chunk.extend_from_slice(value);
        }
        if chunk.len() > u8::MAX as usize {
            debug!("TXT attribute {} too long, skipped", entry.key);
            continue;
        }
        bytes.push(chunk.len() as u8);
        bytes.extend_from_slice(&chunk);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::{encode_txt_record, parse_txt_record, TxtEntry};
    use test_log::test;

    #[test]
    fn test_parse_txt_record() {
        let raw = b"\x07key=val\x04flag\x06empty=";
        let entries = parse_txt_record(raw);
        assert_eq!(
            entries,
            vec![
                TxtEntry {
                    key: "key".to_string(),
                    value: Some(b"val".to_vec()),
                },
                TxtEntry {
                    key: "flag".to_string(),
                    value: None,
                },
                TxtEntry {
                    key: "empty".to_string(),
                    value: Some(Vec::new()),
                },
            ]
        );
    }

    #[test]
    fn test_parse_txt_record_truncated() {
        // Length prefix claims more bytes than remain.
        let raw = b"\x03a=b\x10cut";
        let entries = parse_txt_record(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "a");
    }

    #[test]
    fn test_encode_txt_record() {
        let entries = vec![
            TxtEntry {
                key: "key".to_string(),
                value: Some(b"val".to_vec()),
            },
            TxtEntry {
                key: "flag".to_string(),
                value: None,
            },
        ];
        assert_eq!(encode_txt_record(&entries), b"\x07key=val\x04flag".to_vec());
    }

    #[test]
    fn test_txt_round_trip() {
        let entries = vec![TxtEntry {
            key: "path".to_string(),
            value: Some(b"/printers/1".to_vec()),
        }];
        assert_eq!(parse_txt_record(&encode_txt_record(&entries)), entries);
    }
}
