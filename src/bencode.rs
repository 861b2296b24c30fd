//! Bencode helpers on top of `serde_bencode`.
//!
//! `serde_bencode` happily ignores whatever follows the first value, so every decode here first
//! walks the input with a small structural scanner to find where that value ends.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use serde_bencode::value::Value;

const MAX_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum BencodeError {
    #[error("The bencode ended unexpectedly at byte {0}.")]
    UnexpectedEnd(usize),
    #[error("Found the invalid byte `{byte:#04x}` at position {position}.")]
    InvalidByte { byte: u8, position: usize },
    #[error("The integer starting at position {0} is not canonical.")]
    InvalidInteger(usize),
    #[error("The string length at position {0} is invalid.")]
    InvalidLength(usize),
    #[error("The dictionary key at position {0} is not a byte string.")]
    InvalidKey(usize),
    #[error("The value is nested deeper than {MAX_DEPTH} levels.")]
    TooDeep,
    #[error("Found {0} trailing bytes after the bencoded value.")]
    TrailingBytes(usize),
    #[error("Failed to (de)serialize the bencode with the error: `{0}`")]
    Serde(#[from] serde_bencode::Error),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BencodeError> {
    Ok(serde_bencode::to_bytes(value)?)
}

/// Decodes exactly one value, rejecting malformed or trailing input.
pub fn decode<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, BencodeError> {
    let end = value_end(bytes, 0, 0)?;
    if end != bytes.len() {
        return Err(BencodeError::TrailingBytes(bytes.len() - end));
    }
    Ok(serde_bencode::from_bytes(bytes)?)
}

/// Decodes the leading value and ignores the remainder.
/// Returns the value together with the number of bytes it occupied.
pub fn decode_prefix<'de, T: Deserialize<'de>>(
    bytes: &'de [u8],
) -> Result<(T, usize), BencodeError> {
    let end = value_end(bytes, 0, 0)?;
    Ok((serde_bencode::from_bytes(&bytes[..end])?, end))
}

/// Finds the raw encoded bytes of `key`'s value in a top-level dictionary.
pub fn dict_entry_span(bytes: &[u8], key: &[u8]) -> Result<Option<Range<usize>>, BencodeError> {
    match bytes.first() {
        Some(b'd') => {}
        Some(&byte) => return Err(BencodeError::InvalidByte { byte, position: 0 }),
        None => return Err(BencodeError::UnexpectedEnd(0)),
    }
    let mut pos = 1;
    loop {
        match bytes.get(pos) {
            Some(b'e') => return Ok(None),
            Some(b) if b.is_ascii_digit() => {}
            Some(_) => return Err(BencodeError::InvalidKey(pos)),
            None => return Err(BencodeError::UnexpectedEnd(pos)),
        }
        let key_end = value_end(bytes, pos, 1)?;
        let value_start = key_end;
        let value_stop = value_end(bytes, value_start, 1)?;
        if string_content(bytes, pos, key_end) == key {
            return Ok(Some(value_start..value_stop));
        }
        pos = value_stop;
    }
}

fn string_content(bytes: &[u8], start: usize, end: usize) -> &[u8] {
    let colon = bytes[start..end]
        .iter()
        .position(|&b| b == b':')
        .map_or(end, |i| start + i + 1);
    &bytes[colon..end]
}

/// Returns the position right after the value starting at `pos`.
fn value_end(bytes: &[u8], pos: usize, depth: usize) -> Result<usize, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::TooDeep);
    }
    match bytes.get(pos) {
        None => Err(BencodeError::UnexpectedEnd(pos)),
        Some(b'i') => {
            let end = find(bytes, pos + 1, b'e')?;
            let digits = &bytes[pos + 1..end];
            if !is_canonical_integer(digits) {
                return Err(BencodeError::InvalidInteger(pos));
            }
            Ok(end + 1)
        }
        Some(b'l') => {
            let mut cursor = pos + 1;
            loop {
                match bytes.get(cursor) {
                    Some(b'e') => return Ok(cursor + 1),
                    Some(_) => cursor = value_end(bytes, cursor, depth + 1)?,
                    None => return Err(BencodeError::UnexpectedEnd(cursor)),
                }
            }
        }
        Some(b'd') => {
            let mut cursor = pos + 1;
            loop {
                match bytes.get(cursor) {
                    Some(b'e') => return Ok(cursor + 1),
                    Some(b) if b.is_ascii_digit() => {
                        cursor = value_end(bytes, cursor, depth + 1)?;
                        cursor = value_end(bytes, cursor, depth + 1)?;
                    }
                    Some(_) => return Err(BencodeError::InvalidKey(cursor)),
                    None => return Err(BencodeError::UnexpectedEnd(cursor)),
                }
            }
        }
        Some(b) if b.is_ascii_digit() => {
            let colon = find(bytes, pos, b':')?;
            let digits = &bytes[pos..colon];
            if !digits.iter().all(u8::is_ascii_digit) || (digits.len() > 1 && digits[0] == b'0') {
                return Err(BencodeError::InvalidLength(pos));
            }
            let len: usize = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(BencodeError::InvalidLength(pos))?;
            let end = colon
                .checked_add(1 + len)
                .ok_or(BencodeError::InvalidLength(pos))?;
            if end > bytes.len() {
                return Err(BencodeError::UnexpectedEnd(bytes.len()));
            }
            Ok(end)
        }
        Some(&byte) => Err(BencodeError::InvalidByte {
            byte,
            position: pos,
        }),
    }
}

fn find(bytes: &[u8], from: usize, needle: u8) -> Result<usize, BencodeError> {
    bytes[from.min(bytes.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
        .ok_or(BencodeError::UnexpectedEnd(bytes.len()))
}

fn is_canonical_integer(digits: &[u8]) -> bool {
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return false;
    }
    if unsigned.len() > 1 && unsigned[0] == b'0' {
        return false;
    }
    // "-0" is not a valid integer
    !(digits.len() != unsigned.len() && unsigned == b"0")
}

#[cfg(test)]
mod test_bencode {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize, Serialize)]
    struct Msg {
        msg_type: u8,
        piece: u32,
    }

    #[test]
    fn decodes_generic_values() {
        let value: Value = decode(b"d3:bari-7e3:fool4:spami42eee").expect("is valid");
        let Value::Dict(dict) = value else {
            panic!("expected a dictionary")
        };
        assert_eq!(dict.get(b"bar".as_slice()), Some(&Value::Int(-7)));
        assert_eq!(
            dict.get(b"foo".as_slice()),
            Some(&Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Int(42)
            ]))
        );
    }

    #[test]
    fn strict_decode_rejects_trailing_bytes() {
        let err = decode::<Msg>(b"d8:msg_typei1e5:piecei0eexxxx").unwrap_err();
        assert!(matches!(err, BencodeError::TrailingBytes(4)));
    }

    #[test]
    fn prefix_decode_reports_consumed_length() {
        let bytes = b"d8:msg_typei1e5:piecei3eeRAWDATA";
        let (msg, used) = decode_prefix::<Msg>(bytes).expect("is valid");
        assert_eq!(
            msg,
            Msg {
                msg_type: 1,
                piece: 3
            }
        );
        assert_eq!(&bytes[used..], b"RAWDATA");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(decode::<Value>(b"i03e").is_err());
        assert!(decode::<Value>(b"i-0e").is_err());
        assert!(decode::<Value>(b"ie").is_err());
        assert!(decode::<Value>(b"5:abc").is_err());
        assert!(decode::<Value>(b"l4:spam").is_err());
        assert!(decode::<Value>(b"di1e3:fooe").is_err());
        assert!(decode::<Value>(b"x").is_err());
        assert!(decode::<Value>(b"").is_err());
    }

    #[test]
    fn encode_sorts_map_keys() {
        let mut m = HashMap::new();
        m.insert("ut_pex".to_string(), 2);
        m.insert("ut_metadata".to_string(), 1);
        let bytes = encode(&m).expect("encodes");
        assert_eq!(bytes, b"d11:ut_metadatai1e6:ut_pexi2ee".to_vec());
    }

    #[test]
    fn finds_raw_dictionary_entries() {
        let bytes = b"d8:announce3:url4:infod6:lengthi5eee";
        let span = dict_entry_span(bytes, b"info")
            .expect("is valid")
            .expect("has info");
        assert_eq!(&bytes[span], b"d6:lengthi5ee");
        assert_eq!(dict_entry_span(bytes, b"missing").expect("is valid"), None);
    }
}
