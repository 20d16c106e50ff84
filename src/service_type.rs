//! DNS-SD service type grammar and name handling.
//!
//! A service type is a pair of labels such as `_ipp._tcp`, optionally carrying
//! a subtype either as a leading label (`_sub._ipp._tcp`, see RFC 6763
//! section 7.1) or after a comma (`_ipp._tcp,_sub`). The `.local` domain and a
//! single trailing dot are tolerated for compatibility with the legacy
//! backend.

#[cfg(feature = "logging")]
use crate::log::error;

/// Max length in bytes of a single DNS label, per RFC 6763 section 4.1.1.
pub(crate) const MAX_LABEL_LENGTH: usize = 63;

/// Checks one service or subtype label: an underscore followed by 1 to 61
/// characters from `[A-Za-z0-9-_]`, ending with an alphanumeric.
fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.len() < 3 || bytes.len() > MAX_LABEL_LENGTH {
        return false;
    }
    if bytes[0] != b'_' {
        return false;
    }
    if !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes[1..bytes.len() - 1]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
}

/// Validates `service_type` and splits it into the type and an optional
/// subtype.
///
/// Returns the canonical type, e.g. `_ipp._tcp`, together with the subtype
/// label if one was given. When both the leading and the comma form are
/// present, the leading subtype wins. Returns `None` if the string does not
/// match the grammar.
pub fn parse_type_and_subtype(service_type: &str) -> Option<(String, Option<String>)> {
    if service_type.is_empty() {
        return None;
    }

    // Subtype may come after a comma, as in "_type._tcp,_subtype".
    let (head, comma_subtype) = match service_type.split_once(',') {
        Some((head, subtype)) => {
            if !is_valid_label(subtype) {
                return None;
            }
            (head, Some(subtype))
        }
        None => (service_type, None),
    };

    // Tolerate a single trailing dot, e.g. "_type._tcp." from old callers.
    let head = head.strip_suffix('.').unwrap_or(head);

    let mut labels: Vec<&str> = head.split('.').collect();
    if labels.last() == Some(&"local") {
        labels.pop();
    }

    let (leading_subtype, name, protocol) = match labels[..] {
        [name, protocol] => (None, name, protocol),
        [subtype, name, protocol] => (Some(subtype), name, protocol),
        _ => return None,
    };
    if protocol != "_tcp" && protocol != "_udp" {
        return None;
    }
    if !is_valid_label(name) {
        return None;
    }
    if let Some(subtype) = leading_subtype {
        if !is_valid_label(subtype) {
            return None;
        }
    }

    let subtype = leading_subtype.or(comma_subtype);
    Some((
        format!("{}.{}", name, protocol),
        subtype.map(str::to_string),
    ))
}

/// Decodes the mdnsresponder escape conventions in a DNS-SD name.
///
/// The full service name is escaped from standard DNS rules by the legacy
/// daemon, making it suitable for passing to standard resolver APIs. `\.` and
/// `\\` stand for the literal character; any other `\` starts a three-digit
/// decimal byte value. A truncated or malformed sequence is logged and
/// terminates decoding at that point.
pub fn unescape(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut unescaped = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '\\' {
            unescaped.push(c);
            i += 1;
            continue;
        }
        i += 1;
        if i >= chars.len() {
            error!("unexpected end of escape sequence in: {}", s);
            break;
        }
        let c = chars[i];
        if c == '.' || c == '\\' {
            unescaped.push(c);
            i += 1;
            continue;
        }
        if i + 2 >= chars.len() {
            error!("unexpected end of escape sequence in: {}", s);
            break;
        }
        let Some(value) = decimal_triple(chars[i], chars[i + 1], chars[i + 2]) else {
            error!("invalid escape sequence in: {}", s);
            break;
        };
        unescaped.push(value as char);
        i += 3;
    }
    unescaped
}

fn decimal_triple(d1: char, d2: char, d3: char) -> Option<u8> {
    let value = d1.to_digit(10)? * 100 + d2.to_digit(10)? * 10 + d3.to_digit(10)?;
    u8::try_from(value).ok()
}

/// Truncates a service instance name to up to `max_len` UTF-8 bytes, at a
/// code point boundary.
///
/// RFC 6763 section 4.1.1: service instance names are UTF-8 and up to 63
/// bytes. Truncating names used for registration follows the historical
/// behavior of mdnsresponder.
pub fn truncate_service_name(name: &str, max_len: usize) -> &str {
    if name.len() <= max_len {
        return name;
    }
    let mut end = 0;
    for (idx, ch) in name.char_indices() {
        let next = idx + ch.len_utf8();
        if next > max_len {
            break;
        }
        end = next;
    }
    &name[..end]
}

/// Splits a fully escaped instance name `<instance>.<type>.<domain>.` at the
/// first dot that is not part of a `\.` or `\\` escape.
///
/// Returns the raw (still escaped) instance label and the rest of the name
/// including its leading dot.
pub(crate) fn split_escaped_instance(full_name: &str) -> Option<(&str, &str)> {
    let mut iter = full_name.char_indices();
    while let Some((idx, c)) = iter.next() {
        if c == '.' {
            return Some((&full_name[..idx], &full_name[idx..]));
        }
        if c == '\\' {
            iter.next();
        }
    }
    None
}
