use bytes::Bytes;

use super::*;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn decode_rejects_malformed_integers() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i42").is_err());
}

#[test]
fn decode_byte_strings() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    assert!(decode(b"5:spam").is_err());
}

#[test]
fn decode_lists_and_dicts() {
    let list = decode(b"l4:spami42ee").unwrap();
    let items = list.as_list().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1], Value::Integer(42));

    let dict = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    assert_eq!(dict.get(b"cow").and_then(|v| v.as_str()), Some("moo"));
    assert_eq!(dict.get(b"spam").and_then(|v| v.as_str()), Some("eggs"));
}

#[test]
fn decode_rejects_trailing_data() {
    assert!(matches!(
        decode(b"i42eextra"),
        Err(BencodeError::TrailingData)
    ));
}

#[test]
fn decode_rejects_deep_nesting() {
    let mut data = vec![b'l'; 80];
    data.extend(vec![b'e'; 80]);
    assert!(matches!(decode(&data), Err(BencodeError::TooDeep)));
}

#[test]
fn top_spans_cover_exact_value_bytes() {
    let data = b"d8:announce3:url4:infod6:lengthi5eee";
    let spans = decode_top_spans(data).unwrap();

    let announce = spans.get(b"announce".as_slice()).unwrap().clone();
    assert_eq!(&data[announce], b"3:url");

    let info = spans.get(b"info".as_slice()).unwrap().clone();
    assert_eq!(&data[info], b"d6:lengthi5ee");
}

#[test]
fn top_spans_require_a_dictionary() {
    assert!(matches!(
        decode_top_spans(b"le"),
        Err(BencodeError::NotADictionary)
    ));
}
