//! RailCom decode and parse behavior over the public API.

use rs_dcc::railcom::{RailComFrame, DECODE, DEC_ACK, DEC_DATA_MAX, DEC_INV, PKT_MAX};
use rs_dcc::RailComMsg;

/// Encoded byte for a decoded value (the table is a bijection on data).
fn enc_for(dec: u8) -> u8 {
    (0..=255u8)
        .find(|&e| DECODE[e as usize] == dec)
        .expect("value present in table")
}

fn frame_of(enc: &[u8]) -> RailComFrame {
    let mut frame = RailComFrame::new();
    for &b in enc {
        frame.push_raw(b);
    }
    frame.parse();
    frame
}

#[test]
fn every_data_value_encodes_once() {
    for v in 0u8..DEC_DATA_MAX {
        let hits = (0..=255u8).filter(|&e| DECODE[e as usize] == v).count();
        assert_eq!(hits, 1, "datum {:#04x}", v);
    }
}

#[test]
fn valid_codewords_have_four_set_bits() {
    for e in 0..=255u8 {
        if DECODE[e as usize] < DEC_DATA_MAX {
            assert_eq!(e.count_ones(), 4, "codeword {:#04x}", e);
        }
    }
}

#[test]
fn same_symbols_same_messages() {
    let symbols = [
        enc_for(0x04),
        enc_for(0x12),
        0xf0,
        enc_for(0x00),
        enc_for(0x2a),
        0xf0,
        0xf0,
        0xf0,
    ];
    let a = frame_of(&symbols);
    let b = frame_of(&symbols);
    assert_eq!(a.ch1(), b.ch1());
    assert_eq!(a.ch2(), b.ch2());
    assert_eq!(a.ch1(), Some(RailComMsg::Ahi { val: 0x12 }));
    assert_eq!(a.ch2()[1], RailComMsg::Pom { val: 0x2a });
}

#[test]
fn channel2_is_all_or_nothing() {
    // six symbols where the last one is invalid: the whole channel drops
    let mut symbols = vec![0xf0u8; 5];
    symbols.push(0x00); // invalid 4/8 code
    let frame = frame_of(&symbols);
    assert!(frame.ch2().is_empty());
    assert!(!frame.parsed_all());

    // the same six with the junk replaced parse fully
    let symbols = vec![0xf0u8; 6];
    let frame = frame_of(&symbols);
    assert_eq!(frame.ch2().len(), 6);
    assert!(frame.parsed_all());
}

#[test]
fn eight_symbols_need_a_channel1_prefix() {
    // all-data symbols with a non-address lead: nothing parses
    let symbols: Vec<u8> = [0x33u8, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a]
        .iter()
        .map(|&d| enc_for(d))
        .collect();
    let frame = frame_of(&symbols);
    assert_eq!(frame.ch1(), None);
    assert!(frame.ch2().is_empty());
}

#[test]
fn truncated_multibyte_message_drops_channel2() {
    // DYN needs three symbols; give channel 2 a DYN header at the end
    let symbols = [
        0xf0,
        0xf0,
        0xf0,
        0xf0,
        0xf0,
        enc_for(0x1c), // DYN lead symbol with nothing after it
    ];
    let frame = frame_of(&symbols);
    assert!(frame.ch2().is_empty());
}

#[test]
fn reader_limit_is_eight_symbols() {
    let mut frame = RailComFrame::new();
    for _ in 0..PKT_MAX {
        assert!(frame.push_raw(0xf0));
    }
    assert!(!frame.push_raw(0xf0));
    assert_eq!(frame.len(), PKT_MAX);
}

#[test]
fn decode_constants_are_disjoint() {
    assert!(DEC_ACK >= DEC_DATA_MAX);
    assert_eq!(DECODE[0xf0], DEC_ACK);
    assert_eq!(DECODE[0x00], DEC_INV);
}
