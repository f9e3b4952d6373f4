//! Minimal CBOR scanner.
//!
//! Only finds item boundaries; values are never decoded. Indefinite-length
//! items are rejected.

use crate::error::{KeysignError, KeysignResult};

/// Deepest array/map/tag nesting the scanner follows.
pub const MAX_DEPTH: usize = 64;

fn malformed(reason: impl Into<String>) -> KeysignError {
    KeysignError::MalformedCbor(reason.into())
}

/// Read the argument that follows an initial byte.
///
/// Returns the value and how many bytes it occupied after the initial byte.
pub fn read_length(bytes: &[u8], index: usize, additional_info: u8) -> KeysignResult<(u64, usize)> {
    let width = match additional_info {
        0..=23 => return Ok((u64::from(additional_info), 0)),
        24 => 1,
        25 => 2,
        26 => 4,
        27 => 8,
        other => return Err(malformed(format!("unsupported length encoding {other}"))),
    };

    let end = index
        .checked_add(width)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| malformed("length truncated"))?;
    let value = bytes[index..end]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    Ok((value, width))
}

fn to_usize(value: u64) -> KeysignResult<usize> {
    usize::try_from(value).map_err(|_| malformed("length exceeds address space"))
}

/// Offset one past the end of the item starting at `start`.
pub fn find_end_of_item(bytes: &[u8], start: usize) -> KeysignResult<usize> {
    scan_item(bytes, start, 0)
}

fn scan_item(bytes: &[u8], start: usize, depth: usize) -> KeysignResult<usize> {
    if depth > MAX_DEPTH {
        return Err(malformed(format!("nesting deeper than {MAX_DEPTH}")));
    }
    let initial = *bytes
        .get(start)
        .ok_or_else(|| malformed("index out of bounds"))?;
    let major_type = initial >> 5;
    let additional_info = initial & 0x1f;
    let (argument, width) = read_length(bytes, start + 1, additional_info)?;
    let mut index = start + 1 + width;

    match major_type {
        // Integers and simple values carry everything in the argument.
        0 | 1 | 7 => {}
        2 | 3 => {
            index = index
                .checked_add(to_usize(argument)?)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| malformed("string truncated"))?;
        }
        4 => {
            for _ in 0..argument {
                index = scan_item(bytes, index, depth + 1)?;
            }
        }
        5 => {
            for _ in 0..argument.saturating_mul(2) {
                index = scan_item(bytes, index, depth + 1)?;
            }
        }
        6 => {
            index = scan_item(bytes, index, depth + 1)?;
        }
        other => return Err(malformed(format!("unsupported major type {other}"))),
    }

    Ok(index)
}

/// Byte span of the first element of a top-level array.
pub fn extract_transaction_body(tx: &[u8]) -> KeysignResult<&[u8]> {
    let initial = *tx.first().ok_or_else(|| malformed("empty data"))?;
    if initial >> 5 != 4 {
        return Err(malformed(format!(
            "expected array, got major type {}",
            initial >> 5
        )));
    }

    let (length, width) = read_length(tx, 1, initial & 0x1f)?;
    if length < 2 {
        return Err(malformed("transaction array too short"));
    }

    let body_start = 1 + width;
    let body_end = find_end_of_item(tx, body_start)?;
    Ok(&tx[body_start..body_end])
}

#[cfg(test)]
mod tests {
    use serde_cbor::Value;

    use super::*;

    #[test]
    fn test_read_length_forms() {
        assert_eq!(read_length(&[], 0, 10).unwrap(), (10, 0));
        assert_eq!(read_length(&[0xff], 0, 24).unwrap(), (255, 1));
        assert_eq!(read_length(&[0x01, 0x00], 0, 25).unwrap(), (256, 2));
        assert_eq!(
            read_length(&[0x00, 0x01, 0x00, 0x00], 0, 26).unwrap(),
            (65_536, 4)
        );
        assert_eq!(
            read_length(&[0, 0, 0, 1, 0, 0, 0, 0], 0, 27).unwrap(),
            (1 << 32, 8)
        );
        assert!(read_length(&[0x01], 0, 25).is_err());
        assert!(read_length(&[], 0, 31).is_err());
    }

    #[test]
    fn test_nested_body_span_rescans_to_same_end() {
        let body = Value::Array(vec![
            Value::Integer(1),
            Value::Bytes(vec![0xab; 40]),
            Value::Text("x".repeat(300)),
            Value::Array(vec![Value::Integer(-5), Value::Bool(true)]),
            Value::Map(
                [(Value::Integer(0), Value::Integer(1_000_000_000_000))]
                    .into_iter()
                    .collect(),
            ),
        ]);
        let expected = serde_cbor::to_vec(&body).unwrap();
        let tx = serde_cbor::to_vec(&Value::Array(vec![body, Value::Integer(7)])).unwrap();

        let extracted = extract_transaction_body(&tx).unwrap();
        assert_eq!(extracted, expected.as_slice());
        assert_eq!(find_end_of_item(extracted, 0).unwrap(), extracted.len());
    }

    #[test]
    fn test_rejects_non_array_and_short_array() {
        assert!(extract_transaction_body(&[0xa0]).is_err());
        assert!(extract_transaction_body(&[0x81, 0x01]).is_err());
        assert!(extract_transaction_body(&[]).is_err());
    }

    #[test]
    fn test_truncated_string_is_error() {
        // bytes(5) with only two bytes present
        assert!(find_end_of_item(&[0x45, 0x01, 0x02], 0).is_err());
    }

    #[test]
    fn test_tagged_item() {
        // tag(258) [1, 2]
        let bytes = [0xd9, 0x01, 0x02, 0x82, 0x01, 0x02];
        assert_eq!(find_end_of_item(&bytes, 0).unwrap(), bytes.len());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        // [[[ ... [0] ... ]]] one level past the limit
        let mut bytes = vec![0x81; MAX_DEPTH + 1];
        bytes.push(0x00);
        assert!(matches!(
            find_end_of_item(&bytes, 0),
            Err(KeysignError::MalformedCbor(_))
        ));

        let mut bytes = vec![0x81; MAX_DEPTH];
        bytes.push(0x00);
        assert_eq!(find_end_of_item(&bytes, 0).unwrap(), bytes.len());

        // A long run of nested arrays fails cleanly instead of recursing.
        assert!(find_end_of_item(&vec![0x81; 1_000_000], 0).is_err());
    }
}
