//! Codec round-trip tests: varints, every frame type, ALPN selection and
//! session-id decoding.

use bytes::{Bytes, BytesMut};
use hqmcast::frame::{Frame, FrameHeader};
use hqmcast::{decode_session_id, select_alpn, varint, Error, ALPN_TOKEN};

#[test]
fn varint_boundary_round_trips() {
    let cases: &[(u64, usize)] = &[
        (0, 1),
        (63, 1),
        (64, 2),
        (16_383, 2),
        (16_384, 4),
        ((1 << 30) - 1, 4),
        (1 << 30, 8),
        ((1 << 62) - 1, 8),
    ];
    for &(v, width) in cases {
        let mut buf = BytesMut::new();
        let written = varint::encode(v, &mut buf);
        assert_eq!(written, width, "width of {v}");
        assert_eq!(varint::decode(&buf), Some((v, width)), "round trip of {v}");
    }
}

fn round_trip(frame: Frame, on_push_stream: bool) {
    let wire = frame.encode();
    let hdr = FrameHeader::parse(&wire).expect("complete header");
    assert_eq!(hdr.total_len() as usize, wire.len(), "span of {frame:?}");
    let decoded = Frame::decode(hdr.ftype, &wire[hdr.header_len..], on_push_stream)
        .expect("decodable")
        .expect("recognised");
    assert_eq!(frame, decoded);
}

#[test]
fn every_frame_type_round_trips() {
    round_trip(
        Frame::Data {
            payload: Bytes::from_static(b"some body bytes"),
        },
        false,
    );
    round_trip(
        Frame::Headers {
            push_id: None,
            block: Bytes::from_static(b"\x07:method\x03GET"),
        },
        false,
    );
    round_trip(
        Frame::Headers {
            push_id: Some(12),
            block: Bytes::from_static(b"\x07:status\x03200"),
        },
        true,
    );
    round_trip(
        Frame::Priority {
            body: Bytes::from_static(&[0x80, 0x00, 0x00, 0x10]),
        },
        false,
    );
    round_trip(Frame::CancelPush { push_id: 3 }, false);
    round_trip(
        Frame::Settings {
            settings: vec![(0x06, 16_384), (0x08, 0)],
        },
        false,
    );
    round_trip(
        Frame::PushPromise {
            push_id: 9,
            block: Bytes::from_static(b"\x05:path\x02/x"),
        },
        false,
    );
    round_trip(Frame::Goaway { id: 400 }, false);
    round_trip(Frame::MaxPushId { max: 1 << 20 }, false);
}

#[test]
fn frame_header_reports_exact_span() {
    // A frame whose length varint is wider than one byte.
    let frame = Frame::Data {
        payload: Bytes::from(vec![0u8; 300]),
    };
    let wire = frame.encode();
    let hdr = FrameHeader::parse(&wire).unwrap();
    assert_eq!(hdr.ftype, 0x00);
    assert_eq!(hdr.payload_len, 300);
    assert_eq!(hdr.header_len, 3); // 1-byte type + 2-byte length
    assert_eq!(hdr.total_len(), 303);
}

#[test]
fn unknown_frame_types_are_consumed_not_fatal() {
    assert_eq!(Frame::decode(0x1f, b"reserved", false).unwrap(), None);
    assert_eq!(Frame::decode(0x4040, b"", false).unwrap(), None);
}

#[test]
fn alpn_selection() {
    let offered = b"\x05h3-29\x06hqm-05";
    assert_eq!(select_alpn(offered).unwrap(), ALPN_TOKEN);
    assert_eq!(select_alpn(b"\x05h3-29"), Err(Error::AlpnFailed));
    assert_eq!(select_alpn(b""), Err(Error::AlpnFailed));
    // Truncated list entry.
    assert_eq!(select_alpn(b"\x10hqm"), Err(Error::AlpnFailed));
}

#[test]
fn session_id_hex_decoding() {
    assert_eq!(decode_session_id("0102").unwrap(), vec![0x01, 0x02]);
    assert_eq!(decode_session_id("deadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    // Odd length: lone nibble lands in the low half of the final byte.
    assert_eq!(decode_session_id("010").unwrap(), vec![0x01, 0x00]);
    assert!(decode_session_id("xy").is_err());
}
