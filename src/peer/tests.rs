use bytes::Bytes;

use super::*;

#[test]
fn peer_id_has_client_tag_and_random_tail() {
    let a = PeerId::generate();
    let b = PeerId::generate();
    assert_eq!(&a.0[..8], b"-UR1010-");
    assert_ne!(a.0, b.0);
    assert_eq!(a.to_string().len(), 40);
}

#[test]
fn handshake_round_trip() {
    let hs = Handshake::new([3u8; 20], [4u8; 20]);
    let encoded = hs.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);
    assert_eq!(encoded[0], 0x12);
    assert_eq!(&encoded[1..19], PROTOCOL_TAG);
    assert_eq!(&encoded[19..27], &[0u8; 8]);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, [3u8; 20]);
    assert_eq!(decoded.peer_id, [4u8; 20]);
}

#[test]
fn handshake_rejects_bad_tag_and_short_reads() {
    let mut data = Handshake::new([0u8; 20], [0u8; 20]).encode().to_vec();
    data[1] = b'X';
    assert!(matches!(
        Handshake::decode(&data),
        Err(PeerError::BadHandshake)
    ));

    assert!(matches!(
        Handshake::decode(&data[..40]),
        Err(PeerError::BadHandshake)
    ));
}

#[test]
fn message_round_trips() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0x80, 0x01])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 3616,
        },
        Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::from_static(b"block bytes"),
        },
    ];

    for msg in messages {
        let decoded = Message::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }
}

#[test]
fn message_rejects_unknown_ids_and_bad_layouts() {
    // id 8 (cancel) is not part of this client's protocol surface
    let frame = Bytes::from_static(&[0, 0, 0, 1, 8]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::UnknownMessageId(8))
    ));

    // request with a truncated payload
    let frame = Bytes::from_static(&[0, 0, 0, 5, 6, 0, 0, 0, 1]);
    assert!(Message::decode(frame).is_err());
}

#[test]
fn bitfield_bit_layout_is_msb_first() {
    let mut bf = Bitfield::new(12);
    bf.set(0);
    bf.set(9);
    assert_eq!(bf.as_bytes(), &[0x80, 0x40]);
    assert!(bf.has(0));
    assert!(bf.has(9));
    assert!(!bf.has(1));

    bf.clear(0);
    assert!(!bf.has(0));
    assert_eq!(bf.count(), 1);
}

#[test]
fn full_bitfield_keeps_spare_bits_zero() {
    let bf = Bitfield::full(9);
    assert_eq!(bf.as_bytes(), &[0xFF, 0x80]);
    assert!(bf.is_complete());
    assert_eq!(bf.to_bit_string(), "111111111");
}

#[test]
fn wire_bitfield_spare_bits_must_be_zero() {
    // 9 pieces => 2 bytes, 7 spare bits
    let ok = Bytes::from_static(&[0xFF, 0x80]);
    assert!(Bitfield::from_message(&ok, 9).is_ok());

    let dirty = Bytes::from_static(&[0xFF, 0x81]);
    assert!(matches!(
        Bitfield::from_message(&dirty, 9),
        Err(PeerError::BadBitfield)
    ));

    let short = Bytes::from_static(&[0xFF]);
    assert!(matches!(
        Bitfield::from_message(&short, 9),
        Err(PeerError::BadBitfield)
    ));
}

#[test]
fn remote_peer_starts_choked_and_uninterested() {
    let peer = RemotePeer::new(
        "127.0.0.1:6881".parse().unwrap(),
        PeerId::generate(),
        4,
    );
    assert!(peer.am_choking);
    assert!(peer.peer_choking);
    assert!(!peer.am_interested);
    assert!(!peer.peer_interested);
    assert!(peer.bitfield.is_empty());
    assert_eq!(peer.rate, 0.0);
}
