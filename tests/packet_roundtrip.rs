//! Packet codec properties over the public API.

use rs_dcc::packet::{dcc_to_speed, speed_to_dcc, ADDRESS_MAX, ADDRESS_SHORT_MAX};
use rs_dcc::{DccPacket, FunctionGroup, PacketType};

#[test]
fn every_packet_xors_to_zero() {
    for a in [1u16, 3, 127, 128, 5000, ADDRESS_MAX] {
        for s in [-127i8, -1, 0, 1, 127] {
            let pkt = DccPacket::speed_128(a, s).unwrap();
            assert_eq!(pkt.bytes().iter().fold(0u8, |x, b| x ^ b), 0);
        }
        for g in FunctionGroup::ALL {
            let pkt = DccPacket::function_group(g, a).unwrap();
            assert_eq!(pkt.bytes().iter().fold(0u8, |x, b| x ^ b), 0);
        }
    }
    for cv in [1u16, 2, 255, 256, 1023, 1024] {
        for val in [0u8, 1, 0x7f, 0xff] {
            let pkt = DccPacket::svc_write_cv(cv, val).unwrap();
            assert_eq!(pkt.bytes().iter().fold(0u8, |x, b| x ^ b), 0);
            let pkt = DccPacket::svc_verify_cv(cv, val).unwrap();
            assert_eq!(pkt.bytes().iter().fold(0u8, |x, b| x ^ b), 0);
        }
    }
}

#[test]
fn address_encoding_exhaustive() {
    for a in 1..=ADDRESS_MAX {
        let pkt = DccPacket::speed_128(a, 0).unwrap();
        if a <= ADDRESS_SHORT_MAX {
            assert_eq!(pkt.len(), 4);
            assert_eq!(pkt.data(0) as u16, a);
        } else {
            assert_eq!(pkt.len(), 5);
            assert_eq!(pkt.data(0), 0xc0 | ((a >> 8) & 0x3f) as u8);
            assert_eq!(pkt.data(1), (a & 0xff) as u8);
        }
        assert_eq!(pkt.address(), Some(a));
    }
}

#[test]
fn speed_round_trip_exhaustive() {
    for s in -127i8..=127 {
        assert_eq!(dcc_to_speed(speed_to_dcc(s)), s);
        let pkt = DccPacket::speed_128(3, s).unwrap();
        assert_eq!(pkt.decode_speed_128(), Some(s));
        assert_eq!(DccPacket::decode_type(pkt.bytes()), PacketType::Speed128);
    }
}

#[test]
fn function_groups_exact_and_exclusive() {
    for g in FunctionGroup::ALL {
        // walk every single-function pattern in the group
        for num in g.first()..=g.last() {
            let mut pkt = DccPacket::function_group(g, 1000).unwrap();
            pkt.set_function(g, num, true).unwrap();
            let bits = pkt.decode_func(g).unwrap();
            assert_eq!(bits, 1 << (num - g.first()), "f{}", num);
            for other in FunctionGroup::ALL {
                if other != g {
                    assert!(pkt.decode_func(other).is_none());
                }
            }
        }
    }
}

#[test]
fn decode_rejects_corruption() {
    let mut bytes = DccPacket::speed_128(3, 8).unwrap().bytes().to_vec();
    assert_eq!(DccPacket::decode_type(&bytes), PacketType::Speed128);
    bytes[2] ^= 0x01; // flip one bit, checksum now wrong
    assert_eq!(DccPacket::decode_type(&bytes), PacketType::Invalid);
    assert_eq!(DccPacket::decode_type(&bytes[..2]), PacketType::Invalid);
}

#[test]
fn known_wire_images() {
    assert_eq!(
        DccPacket::speed_128(3, 8).unwrap().bytes(),
        &[0x03, 0x3f, 0x88, 0xb4]
    );
    let mut f0 = DccPacket::function_group(FunctionGroup::F0, 3).unwrap();
    f0.set_function(FunctionGroup::F0, 0, true).unwrap();
    assert_eq!(f0.bytes(), &[0x03, 0x90, 0x93]);
    assert_eq!(
        DccPacket::svc_write_cv(1, 3).unwrap().bytes(),
        &[0x7c, 0x00, 0x03, 0x7f]
    );
    assert_eq!(DccPacket::idle().bytes(), &[0xff, 0x00, 0xff]);
    assert_eq!(DccPacket::reset().bytes(), &[0x00, 0x00, 0x00]);
}

#[test]
fn long_address_cv_packets() {
    let pkt = DccPacket::ops_write_cv(2000, 29, 0x22).unwrap();
    assert_eq!(pkt.len(), 6);
    assert_eq!(pkt.address(), Some(2000));
    assert_eq!(pkt.cv_num(), 29);
    assert_eq!(pkt.cv_val(), 0x22);
    assert_eq!(DccPacket::decode_type(pkt.bytes()), PacketType::OpsWriteCv);
}
