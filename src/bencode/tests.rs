use super::*;
use bytes::Bytes;
use std::collections::BTreeMap;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap().as_int(), Some(42));
    assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
    assert_eq!(decode(b"i-17e").unwrap().as_int(), Some(-17));
    assert_eq!(
        decode(b"i9223372036854775807e").unwrap().as_int(),
        Some(i64::MAX)
    );
}

#[test]
fn reject_malformed_integers() {
    assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger(_))));
    assert!(matches!(
        decode(b"i007e"),
        Err(BencodeError::InvalidInteger(_))
    ));
    assert!(matches!(
        decode(b"i-0e"),
        Err(BencodeError::InvalidInteger(_))
    ));
    assert!(matches!(decode(b"i42"), Err(BencodeError::UnexpectedEof)));
}

#[test]
fn decode_byte_strings() {
    assert_eq!(decode(b"5:hello").unwrap().as_str(), Some("hello"));
    assert_eq!(decode(b"0:").unwrap().as_bytes().unwrap().len(), 0);

    // non-UTF-8 payloads survive intact
    let raw = decode(b"3:\xff\x00\x01").unwrap();
    assert_eq!(raw.as_bytes().unwrap().as_ref(), &[0xff, 0x00, 0x01]);
    assert_eq!(raw.as_str(), None);
}

#[test]
fn reject_malformed_byte_strings() {
    assert!(matches!(decode(b"5:hi"), Err(BencodeError::UnexpectedEof)));
    assert!(matches!(
        decode(b"05:hello"),
        Err(BencodeError::InvalidStringLength)
    ));
    assert!(matches!(
        decode(b"-1:x"),
        Err(BencodeError::UnexpectedChar('-'))
    ));
}

#[test]
fn decode_lists_and_dicts() {
    let list = decode(b"li1ei2ei3ee").unwrap();
    assert_eq!(list.as_list().unwrap().len(), 3);

    let dict = decode(b"d3:agei30e4:name5:alicee").unwrap();
    assert_eq!(dict.get(b"name").and_then(|v| v.as_str()), Some("alice"));
    assert_eq!(dict.get(b"age").and_then(|v| v.as_int()), Some(30));
    assert_eq!(dict.get(b"missing"), None);
}

#[test]
fn reject_non_string_dict_keys() {
    assert!(decode(b"di1ei2ee").is_err());
}

#[test]
fn reject_trailing_data() {
    assert!(matches!(
        decode(b"i42eextra"),
        Err(BencodeError::TrailingData)
    ));
}

#[test]
fn reject_deep_nesting() {
    let mut input = Vec::new();
    input.extend(std::iter::repeat_n(b'l', 100));
    input.extend(std::iter::repeat_n(b'e', 100));
    assert!(matches!(
        decode(&input),
        Err(BencodeError::NestingTooDeep)
    ));
}

#[test]
fn encode_sorts_dict_keys() {
    let mut d = BTreeMap::new();
    d.insert(Bytes::from_static(b"zz"), Value::Integer(1));
    d.insert(Bytes::from_static(b"aa"), Value::Integer(2));
    assert_eq!(encode(&Value::Dict(d)), b"d2:aai2e2:zzi1ee");
}

#[test]
fn round_trip() {
    let mut inner = BTreeMap::new();
    inner.insert(Bytes::from_static(b"pieces"), Value::bytes(&[0xab; 40]));
    inner.insert(Bytes::from_static(b"piece length"), Value::Integer(16384));

    let value = Value::List(vec![
        Value::Integer(-3),
        Value::string("swarm"),
        Value::Dict(inner),
        Value::List(vec![]),
    ]);

    let encoded = encode(&value);
    assert_eq!(decode(&encoded).unwrap(), value);
}
