//! Shared helpers for the integration tests.

use rs_dcc::hal::{MockAdc, MockClock, MockRailComUart, MockTrack};
use rs_dcc::{CommandStation, StationConfig};

pub type TestStation = CommandStation<MockTrack, MockRailComUart, MockAdc, MockClock>;

pub fn station(config: StationConfig) -> TestStation {
    CommandStation::new(
        MockTrack::new(),
        MockRailComUart::new(),
        MockAdc::new(),
        MockClock::new(),
        config,
    )
}

/// Reconstruct the transmitted packets from a recorded bit sequence.
///
/// Scans for `min_preamble - 1` consecutive ones followed by a zero (the
/// packet start bit), then reads 8-bit bytes each followed by a separator
/// until the separator is a one (the message stop). Trailing incomplete
/// packets are dropped.
pub fn parse_packets(bits: &[u8], min_preamble: usize) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut ones = 0usize;
    let mut i = 0usize;
    while i < bits.len() {
        if bits[i] == 1 {
            ones += 1;
            i += 1;
            continue;
        }
        if ones < min_preamble - 1 {
            ones = 0;
            i += 1;
            continue;
        }
        // bits[i] is the packet start bit
        ones = 0;
        i += 1;
        let mut packet = Vec::new();
        loop {
            if i + 9 > bits.len() {
                return packets;
            }
            let mut byte = 0u8;
            for k in 0..8 {
                byte = (byte << 1) | bits[i + k];
            }
            packet.push(byte);
            i += 8;
            let sep = bits[i];
            i += 1;
            if sep == 1 {
                ones = 1; // the stop bit opens the next preamble
                break;
            }
        }
        packets.push(packet);
    }
    packets
}

/// Raw ADC code for the quiescent baseline (~74 mA).
pub const RAW_BASE: u16 = 124;
/// Raw ADC code for an ack pulse (~909 mA).
pub const RAW_ACK: u16 = 1241;
