//! RailCom return-channel decoding.
//!
//! During the cutout after each packet, a decoder transmits 4/8-encoded
//! bytes at 250 kbaud. Each received byte maps through a fixed 256-entry
//! table to a 6-bit datum, one of the special symbols (ACK/NAK/BSY), or
//! invalid. A cutout's worth of symbols splits into channel 1 (at most one
//! address message) and channel 2 (the addressed decoder's messages).
//!
//! Channel 2 is all-or-nothing: exactly six data symbols must remain after
//! channel 1 and every one must parse, otherwise the channel is dropped.
//! Corruption on the rails is common; a dropped channel is data, not an
//! error.
//!
//! # Example
//!
//! ```rust
//! use rs_dcc::railcom::{RailComFrame, RailComMsg};
//!
//! // ACK, then POM(0x2a) = data symbols 0x00 0x2a, padded with ACKs
//! let mut frame = RailComFrame::new();
//! for enc in [0xf0, 0xac, 0xc9, 0xf0, 0xf0, 0xf0] {
//!     frame.push_raw(enc);
//! }
//! frame.parse();
//! assert_eq!(frame.ch2(), &[
//!     RailComMsg::Ack,
//!     RailComMsg::Pom { val: 0x2a },
//!     RailComMsg::Ack,
//!     RailComMsg::Ack,
//!     RailComMsg::Ack,
//! ]);
//! ```

use core::fmt;

use heapless::Vec;

use crate::traits::RailComUart;

/// Return-channel baud rate (RailCom 9.3.2).
pub const BAUD: u32 = 250_000;

/// Channel-1 symbol count.
pub const CH1_BYTES: usize = 2;
/// Channel-2 symbol count.
pub const CH2_BYTES: usize = 6;
/// Maximum symbols per cutout.
pub const PKT_MAX: usize = CH1_BYTES + CH2_BYTES;

/// Decoded value: not-acknowledge.
pub const DEC_NAK: u8 = 0x40;
/// Decoded value: acknowledge.
pub const DEC_ACK: u8 = 0x41;
/// Decoded value: busy (2012 edition only; never produced by the 2021 table).
pub const DEC_BSY: u8 = 0x42;
/// Decoded value: reserved symbol.
pub const DEC_RESV: u8 = 0x43;
/// Decoded value: invalid 4/8 code.
pub const DEC_INV: u8 = 0xff;
/// Decoded values below this are 6-bit data.
pub const DEC_DATA_MAX: u8 = 0x40;

/// DYN index for the first self-reported speed value.
pub const DYN_SPD1: u8 = 0;
/// DYN index for the second (high-range) speed value.
pub const DYN_SPD2: u8 = 1;

const NAK: u8 = DEC_NAK;
const ACK: u8 = DEC_ACK;
const BSY: u8 = DEC_BSY;
const RSV: u8 = DEC_RESV;
const INV: u8 = DEC_INV;

const fn decode_table() -> [u8; 256] {
    let mut t: [u8; 256] = [
        INV, INV, INV, INV, INV, INV, INV, INV, // 0x00-0x07
        INV, INV, INV, INV, INV, INV, INV, ACK, // 0x08-0x0f (0x0f: second ack)
        INV, INV, INV, INV, INV, INV, INV, 0x33, // 0x10-0x17
        INV, INV, INV, 0x34, INV, 0x35, 0x36, INV, // 0x18-0x1f
        INV, INV, INV, INV, INV, INV, INV, 0x3a, // 0x20-0x27
        INV, INV, INV, 0x3b, INV, 0x3c, 0x37, INV, // 0x28-0x2f
        INV, INV, INV, 0x3f, INV, 0x3d, 0x38, INV, // 0x30-0x37
        INV, 0x3e, 0x39, INV, NAK, INV, INV, INV, // 0x38-0x3f (0x3c: nak)
        INV, INV, INV, INV, INV, INV, INV, 0x24, // 0x40-0x47
        INV, INV, INV, 0x23, INV, 0x22, 0x21, INV, // 0x48-0x4f
        INV, INV, INV, 0x1f, INV, 0x1e, 0x20, INV, // 0x50-0x57
        INV, 0x1d, 0x1c, INV, 0x1b, INV, INV, INV, // 0x58-0x5f
        INV, INV, INV, 0x19, INV, 0x18, 0x1a, INV, // 0x60-0x67
        INV, 0x17, 0x16, INV, 0x15, INV, INV, INV, // 0x68-0x6f
        INV, 0x25, 0x14, INV, 0x13, INV, INV, INV, // 0x70-0x77
        0x32, INV, INV, INV, INV, INV, INV, INV, // 0x78-0x7f
        INV, INV, INV, INV, INV, INV, INV, RSV, // 0x80-0x87
        INV, INV, INV, 0x0e, INV, 0x0d, 0x0c, INV, // 0x88-0x8f
        INV, INV, INV, 0x0a, INV, 0x09, 0x0b, INV, // 0x90-0x97
        INV, 0x08, 0x07, INV, 0x06, INV, INV, INV, // 0x98-0x9f
        INV, INV, INV, 0x04, INV, 0x03, 0x05, INV, // 0xa0-0xa7
        INV, 0x02, 0x01, INV, 0x00, INV, INV, INV, // 0xa8-0xaf
        INV, 0x0f, 0x10, INV, 0x11, INV, INV, INV, // 0xb0-0xb7
        0x12, INV, INV, INV, INV, INV, INV, INV, // 0xb8-0xbf
        INV, INV, INV, RSV, INV, 0x2b, 0x30, INV, // 0xc0-0xc7
        INV, 0x2a, 0x2f, INV, 0x31, INV, INV, INV, // 0xc8-0xcf
        INV, 0x29, 0x2e, INV, 0x2d, INV, INV, INV, // 0xd0-0xd7
        0x2c, INV, INV, INV, INV, INV, INV, INV, // 0xd8-0xdf
        INV, RSV, 0x28, INV, 0x27, INV, INV, INV, // 0xe0-0xe7 (0xe1: resv)
        0x26, INV, INV, INV, INV, INV, INV, INV, // 0xe8-0xef
        ACK, INV, INV, INV, INV, INV, INV, INV, // 0xf0-0xf7
        INV, INV, INV, INV, INV, INV, INV, INV, // 0xf8-0xff
    ];
    if cfg!(feature = "railcom-2012") {
        t[0x0f] = NAK;
        t[0x3c] = RSV;
        t[0xe1] = BSY;
    }
    t
}

/// 4/8 decode table: encoded byte to decoded value.
pub static DECODE: [u8; 256] = decode_table();

/// Message packet ids (top four bits of the first data symbol).
const PKT_POM: u8 = 0;
const PKT_AHI: u8 = 1;
const PKT_ALO: u8 = 2;
const PKT_EXT: u8 = 5;
const PKT_DYN: u8 = 7;
const PKT_XPOM: u8 = 8; // 8..=11, low two bits are the sequence number

/// One parsed RailCom message. Equality is structural.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RailComMsg {
    /// Acknowledge.
    Ack,
    /// Not-acknowledge.
    Nak,
    /// Busy (2012 edition).
    Bsy,
    /// Programming-on-main answer: the CV value read back.
    Pom {
        /// CV value.
        val: u8,
    },
    /// Address high byte (channel 1).
    Ahi {
        /// High address byte.
        val: u8,
    },
    /// Address low byte (channel 1).
    Alo {
        /// Low address byte.
        val: u8,
    },
    /// Extended location message.
    Ext {
        /// Location type.
        typ: u8,
        /// Position value.
        pos: u8,
    },
    /// Dynamic telemetry (speed, temperature, ...).
    Dyn {
        /// DYN index; 0 is [`DYN_SPD1`].
        id: u8,
        /// Reported value.
        val: u8,
    },
    /// Extended POM answer: four CV values with a sequence number.
    Xpom {
        /// Sequence number 0..=3.
        ss: u8,
        /// The four CV values.
        val: [u8; 4],
    },
}

impl RailComMsg {
    /// Parse one channel-1 message from decoded symbols.
    ///
    /// Channel 1 carries only AHI and ALO. Returns the message and the
    /// number of symbols consumed.
    pub fn parse_ch1(d: &[u8]) -> Option<(RailComMsg, usize)> {
        let b0 = *d.first()?;
        if b0 >= DEC_DATA_MAX {
            return None;
        }
        let pkt_id = (b0 >> 2) & 0x0f;
        if d.len() < 2 || d[1] >= DEC_DATA_MAX {
            return None;
        }
        let val = (((b0 as u16) << 6) | d[1] as u16) as u8;
        match pkt_id {
            PKT_AHI => Some((RailComMsg::Ahi { val }, 2)),
            PKT_ALO => Some((RailComMsg::Alo { val }, 2)),
            _ => None,
        }
    }

    /// Parse one channel-2 message from decoded symbols.
    ///
    /// Returns the message and the number of symbols consumed, or `None`
    /// on any malformed input.
    pub fn parse_ch2(d: &[u8]) -> Option<(RailComMsg, usize)> {
        let b0 = *d.first()?;
        match b0 {
            DEC_ACK => return Some((RailComMsg::Ack, 1)),
            DEC_NAK => return Some((RailComMsg::Nak, 1)),
            DEC_BSY => return Some((RailComMsg::Bsy, 1)),
            _ => {}
        }
        if b0 >= DEC_DATA_MAX {
            return None;
        }
        let pkt_id = (b0 >> 2) & 0x0f;
        let datum = |i: usize| -> Option<u8> {
            let b = *d.get(i)?;
            if b < DEC_DATA_MAX {
                Some(b)
            } else {
                None
            }
        };
        match pkt_id {
            // 12-bit (2 symbol) messages; AHI/ALO are allowed in either channel
            PKT_POM | PKT_AHI | PKT_ALO => {
                let b1 = datum(1)?;
                let val = (((b0 as u16) << 6) | b1 as u16) as u8;
                let msg = match pkt_id {
                    PKT_POM => RailComMsg::Pom { val },
                    PKT_AHI => RailComMsg::Ahi { val },
                    _ => RailComMsg::Alo { val },
                };
                Some((msg, 2))
            }
            // 18-bit (3 symbol) messages
            PKT_EXT => {
                let b1 = datum(1)?;
                let b2 = datum(2)?;
                let typ = ((b0 << 4) & 0x30) | ((b1 >> 2) & 0x0f);
                let pos = ((b1 << 6) & 0xc0) | b2;
                Some((RailComMsg::Ext { typ, pos }, 3))
            }
            PKT_DYN => {
                let b1 = datum(1)?;
                let b2 = datum(2)?;
                let val = (((b0 as u16) << 6) | b1 as u16) as u8;
                Some((RailComMsg::Dyn { id: b2, val }, 3))
            }
            // 36-bit (6 symbol) messages, ids 8..=11
            id if id & 0x0c == PKT_XPOM => {
                let b1 = datum(1)?;
                let b2 = datum(2)?;
                let b3 = datum(3)?;
                let b4 = datum(4)?;
                let b5 = datum(5)?;
                // [ d0 ] [ d1 ] [ d2 ] [ d3 ] [ d4 ] [ d5 ]
                // IIII00 000000 111111 112222 222233 333333
                let val = [
                    (b0 << 6) | b1,
                    (b2 << 2) | (b3 >> 4),
                    (b3 << 4) | (b4 >> 2),
                    (b4 << 6) | b5,
                ];
                Some((RailComMsg::Xpom { ss: id & 0x03, val }, 6))
            }
            _ => None,
        }
    }

    fn id_name(&self) -> &'static str {
        match self {
            RailComMsg::Ack => "A",
            RailComMsg::Nak => "N",
            RailComMsg::Bsy => "B",
            RailComMsg::Pom { .. } => "C",
            RailComMsg::Ahi { .. } => "H",
            RailComMsg::Alo { .. } => "L",
            RailComMsg::Ext { .. } => "E",
            RailComMsg::Dyn { .. } => "D",
            RailComMsg::Xpom { .. } => "X",
        }
    }
}

/// Name of a DYN index for rendering.
pub fn dyn_name(id: u8) -> DynName {
    DynName(id)
}

/// Rendering helper returned by [`dyn_name`].
pub struct DynName(u8);

impl fmt::Display for DynName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            DYN_SPD1 => f.write_str("SPD1"),
            DYN_SPD2 => f.write_str("SPD2"),
            id => write!(f, "ID{}", id),
        }
    }
}

impl fmt::Display for RailComMsg {
    /// Compact rendering, e.g. `[A]`, `[C 2a]`, `[D SPD1=12]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.id_name())?;
        match self {
            RailComMsg::Ack | RailComMsg::Nak | RailComMsg::Bsy => {}
            RailComMsg::Pom { val } => write!(f, " {:02x}", val)?,
            RailComMsg::Ahi { val } => write!(f, " {:02x}", val)?,
            RailComMsg::Alo { val } => write!(f, " {:02x}", val)?,
            RailComMsg::Ext { typ, pos } => write!(f, " {:02x} {:02x}", typ, pos)?,
            RailComMsg::Dyn { id, val } => write!(f, " {}={}", dyn_name(*id), val)?,
            RailComMsg::Xpom { ss, val } => write!(
                f,
                " {} {:02x} {:02x} {:02x} {:02x}",
                ss, val[0], val[1], val[2], val[3]
            )?,
        }
        write!(f, "]")
    }
}

/// The symbols received in one cutout, raw and parsed.
#[derive(Clone, Debug)]
pub struct RailComFrame {
    enc: [u8; PKT_MAX],
    dec: [u8; PKT_MAX],
    len: usize,
    ch1: Option<RailComMsg>,
    ch2: Vec<RailComMsg, CH2_BYTES>,
    parsed_all: bool,
}

impl Default for RailComFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl RailComFrame {
    /// Empty frame.
    pub const fn new() -> Self {
        RailComFrame {
            enc: [0; PKT_MAX],
            dec: [0; PKT_MAX],
            len: 0,
            ch1: None,
            ch2: Vec::new(),
            parsed_all: false,
        }
    }

    /// Drop all symbols and parse results.
    pub fn clear(&mut self) {
        self.len = 0;
        self.ch1 = None;
        self.ch2.clear();
        self.parsed_all = false;
    }

    /// Append one raw (4/8-encoded) byte. Returns false once full.
    pub fn push_raw(&mut self, enc: u8) -> bool {
        if self.len >= PKT_MAX {
            return false;
        }
        self.enc[self.len] = enc;
        self.dec[self.len] = DECODE[enc as usize];
        self.len += 1;
        true
    }

    /// Number of symbols received.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no symbols were received.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decoded symbol values.
    pub fn decoded(&self) -> &[u8] {
        &self.dec[..self.len]
    }

    /// Channel-1 message, if one parsed.
    pub fn ch1(&self) -> Option<RailComMsg> {
        self.ch1
    }

    /// Channel-2 messages (empty on any channel-2 corruption).
    pub fn ch2(&self) -> &[RailComMsg] {
        &self.ch2
    }

    /// True when every received symbol was consumed by the parse.
    pub fn parsed_all(&self) -> bool {
        self.parsed_all
    }

    /// Split the received symbols into channel 1 and channel 2.
    ///
    /// Channel 1 must be the first two symbols and must contain an AHI or
    /// ALO message; anything else and channel 2 is attempted from the first
    /// symbol. Channel 2 succeeds only if all remaining symbols parse; on
    /// any failure it is cleared. Parsing the same symbols always yields
    /// the same messages.
    pub fn parse(&mut self) {
        let mut d: &[u8] = &self.dec[..self.len];

        self.ch1 = match RailComMsg::parse_ch1(d) {
            Some((msg, used)) => {
                d = &d[used..];
                Some(msg)
            }
            None => None,
        };

        self.ch2.clear();
        if d.len() == CH2_BYTES {
            let mut rest = d;
            while !rest.is_empty() {
                match RailComMsg::parse_ch2(rest) {
                    Some((msg, used)) => {
                        // capacity is one message per symbol, cannot overflow
                        let _ = self.ch2.push(msg);
                        rest = &rest[used..];
                    }
                    None => {
                        self.ch2.clear();
                        rest = d; // leave the junk unconsumed
                        break;
                    }
                }
            }
            d = rest;
        }

        self.parsed_all = d.is_empty();
    }

    /// Raw symbol rendering: data as six binary digits, specials as
    /// `AK`/`NK`/`BZ`, invalid bytes as hex.
    pub fn dump(&self) -> FrameDump<'_> {
        FrameDump(self)
    }

    /// Semantic rendering of the parsed channels.
    pub fn show(&self) -> FrameShow<'_> {
        FrameShow(self)
    }
}

/// Raw rendering returned by [`RailComFrame::dump`].
pub struct FrameDump<'a>(&'a RailComFrame);

impl fmt::Display for FrameDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.0;
        for i in 0..frame.len {
            if i > 0 {
                write!(f, " ")?;
            }
            let d = frame.dec[i];
            if d < DEC_DATA_MAX {
                for shift in (0..6).rev() {
                    write!(f, "{}", (d >> shift) & 1)?;
                }
            } else if d == DEC_ACK {
                write!(f, "AK")?;
            } else if d == DEC_NAK {
                write!(f, "NK")?;
            } else if d == DEC_BSY {
                write!(f, "BZ")?;
            } else {
                write!(f, "{:02x}", frame.enc[i])?;
            }
        }
        Ok(())
    }
}

/// Semantic rendering returned by [`RailComFrame::show`].
pub struct FrameShow<'a>(&'a RailComFrame);

impl fmt::Display for FrameShow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.0;
        if frame.len == 0 {
            return write!(f, "[no data]");
        }
        if frame.ch1.is_none() && frame.ch2.is_empty() {
            return write!(f, "[corrupt]");
        }
        if let Some(msg) = frame.ch1 {
            write!(f, "{} ", msg)?;
        }
        for (i, msg) in frame.ch2.iter().enumerate() {
            if i > 0 && frame.ch2[i - 1] == *msg {
                write!(f, "#")?; // same as previous message
            } else {
                write!(f, "{}", msg)?;
            }
            if i < frame.ch2.len() - 1 {
                write!(f, " ")?;
            }
        }
        if !frame.parsed_all {
            write!(f, " ! {} !", frame.dump())?;
        }
        Ok(())
    }
}

/// Drains the return-channel UART at cutout boundaries and parses the
/// resulting frame.
pub struct RailComReader<U: RailComUart> {
    uart: U,
    frame: RailComFrame,
}

impl<U: RailComUart> RailComReader<U> {
    /// Wrap a return-channel UART.
    pub fn new(uart: U) -> Self {
        RailComReader {
            uart,
            frame: RailComFrame::new(),
        }
    }

    /// Reset the UART at cutout start, in case the track edge glitched it.
    pub fn reset(&mut self) {
        self.uart.reset();
    }

    /// Drain up to [`PKT_MAX`] received bytes at cutout end.
    ///
    /// Non-blocking: takes whatever the UART has and leaves the rest.
    pub fn read(&mut self) {
        self.frame.clear();
        while self.frame.len() < PKT_MAX {
            match self.uart.read() {
                Some(b) => {
                    self.frame.push_raw(b);
                }
                None => break,
            }
        }
    }

    /// Parse the drained frame into channel messages.
    pub fn parse(&mut self) {
        self.frame.parse();
    }

    /// The current frame.
    pub fn frame(&self) -> &RailComFrame {
        &self.frame
    }

    /// The UART, for embedders that need to reconfigure it.
    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // encoded bytes for selected decoded values (from the 4/8 table)
    const ENC_00: u8 = 0xac;
    const ENC_2A: u8 = 0xc9;
    const ENC_ACK: u8 = 0xf0;

    fn enc_for(dec: u8) -> u8 {
        (0..=255u8)
            .find(|&e| DECODE[e as usize] == dec)
            .expect("value present in table")
    }

    #[test]
    fn table_specials() {
        assert_eq!(DECODE[0xf0], DEC_ACK);
        #[cfg(not(feature = "railcom-2012"))]
        {
            assert_eq!(DECODE[0x0f], DEC_ACK);
            assert_eq!(DECODE[0x3c], DEC_NAK);
            assert_eq!(DECODE[0xe1], DEC_RESV);
        }
        #[cfg(feature = "railcom-2012")]
        {
            assert_eq!(DECODE[0x0f], DEC_NAK);
            assert_eq!(DECODE[0x3c], DEC_RESV);
            assert_eq!(DECODE[0xe1], DEC_BSY);
        }
        assert_eq!(DECODE[0x00], DEC_INV);
        assert_eq!(DECODE[0xff], DEC_INV);
    }

    #[test]
    fn table_covers_all_data_values() {
        // every 6-bit datum has exactly one encoding
        for v in 0u8..0x40 {
            let count = (0..=255u8).filter(|&e| DECODE[e as usize] == v).count();
            assert_eq!(count, 1, "datum {:#x}", v);
        }
    }

    #[test]
    fn parse_pom() {
        // pkt_id 0, value 0x2a: symbols 0x00, 0x2a
        let d = [0x00, 0x2a];
        let (msg, used) = RailComMsg::parse_ch2(&d).unwrap();
        assert_eq!(msg, RailComMsg::Pom { val: 0x2a });
        assert_eq!(used, 2);
    }

    #[test]
    fn parse_dyn() {
        // pkt_id 7, val high bits in b0: id symbols {0b011100, val_lo, idx}
        let d = [0x1c, 0x0c, 0x00];
        let (msg, used) = RailComMsg::parse_ch2(&d).unwrap();
        assert_eq!(used, 3);
        assert_eq!(msg, RailComMsg::Dyn { id: DYN_SPD1, val: 0x0c });
    }

    #[test]
    fn parse_xpom() {
        let d = [0x20, 0x01, 0x02, 0x03, 0x04, 0x05];
        let (msg, used) = RailComMsg::parse_ch2(&d).unwrap();
        assert_eq!(used, 6);
        match msg {
            RailComMsg::Xpom { ss, val } => {
                assert_eq!(ss, 0);
                assert_eq!(val[0], (0x20 << 6) as u8 | 0x01);
                assert_eq!(val[1], (0x02 << 2) | (0x03 >> 4));
                assert_eq!(val[2], (0x03 << 4) | (0x04 >> 2));
                assert_eq!(val[3], ((0x04u8) << 6) | 0x05);
            }
            other => panic!("not xpom: {:?}", other),
        }
    }

    #[test]
    fn parse_is_deterministic() {
        let symbols = [ENC_ACK, ENC_00, ENC_2A, ENC_ACK, ENC_ACK, ENC_ACK];
        let mut a = RailComFrame::new();
        let mut b = RailComFrame::new();
        for s in symbols {
            a.push_raw(s);
            b.push_raw(s);
        }
        a.parse();
        b.parse();
        assert_eq!(a.ch1(), b.ch1());
        assert_eq!(a.ch2(), b.ch2());
    }

    #[test]
    fn channel1_then_channel2() {
        // AHI symbols: pkt_id 1 => first symbol 0b0001xx
        let ahi0 = enc_for(0x04);
        let ahi1 = enc_for(0x12);
        let mut frame = RailComFrame::new();
        for s in [ahi0, ahi1, ENC_ACK, ENC_ACK, ENC_ACK, ENC_ACK, ENC_ACK, ENC_ACK] {
            frame.push_raw(s);
        }
        frame.parse();
        assert_eq!(frame.ch1(), Some(RailComMsg::Ahi { val: 0x12 }));
        assert_eq!(frame.ch2().len(), 6);
        assert!(frame.parsed_all());
    }

    #[test]
    fn invalid_symbol_kills_channel2_only() {
        // channel 1 valid, then an invalid byte inside channel 2
        let ahi0 = enc_for(0x04);
        let ahi1 = enc_for(0x12);
        let mut frame = RailComFrame::new();
        for s in [ahi0, ahi1, ENC_ACK, 0x00, ENC_ACK, ENC_ACK, ENC_ACK, ENC_ACK] {
            frame.push_raw(s);
        }
        frame.parse();
        assert_eq!(frame.ch1(), Some(RailComMsg::Ahi { val: 0x12 }));
        assert!(frame.ch2().is_empty());
        assert!(!frame.parsed_all());
    }

    #[test]
    fn eight_data_symbols_without_channel1_parse_empty() {
        // pkt_id 12 in the lead symbol: not a channel-1 message, and eight
        // symbols cannot all be channel 2
        let symbols = [0x33u8, 0x34, 0xff, 0x35, 0x36, 0x37, 0x38, 0x39];
        let mut frame = RailComFrame::new();
        for dec in symbols {
            let enc = if dec == 0xff { 0x00 } else { enc_for(dec) };
            frame.push_raw(enc);
        }
        frame.parse();
        assert_eq!(frame.ch1(), None);
        assert!(frame.ch2().is_empty());
    }

    #[test]
    fn short_frame_has_no_channel2() {
        let mut frame = RailComFrame::new();
        for s in [ENC_ACK, ENC_ACK, ENC_ACK] {
            frame.push_raw(s);
        }
        frame.parse();
        assert_eq!(frame.ch1(), None);
        assert!(frame.ch2().is_empty());
    }

    #[cfg(feature = "std")]
    #[test]
    fn show_formats() {
        use std::string::ToString;

        let mut frame = RailComFrame::new();
        frame.parse();
        assert_eq!(frame.show().to_string(), "[no data]");

        let mut frame = RailComFrame::new();
        for s in [ENC_ACK, ENC_00, ENC_2A, ENC_ACK, ENC_ACK, ENC_ACK] {
            frame.push_raw(s);
        }
        frame.parse();
        assert_eq!(frame.show().to_string(), "[A] [C 2a] [A] # #");

        assert_eq!(RailComMsg::Dyn { id: 0, val: 9 }.to_string(), "[D SPD1=9]");
    }

    #[cfg(feature = "std")]
    #[test]
    fn dump_formats() {
        use std::string::ToString;
        let mut frame = RailComFrame::new();
        frame.push_raw(ENC_ACK);
        frame.push_raw(ENC_2A);
        frame.push_raw(0x00);
        assert_eq!(frame.dump().to_string(), "AK 101010 00");
    }

    #[test]
    fn parse_ext() {
        // pkt_id 5: {0b0101tt, tt tt pp, pppppp}
        let d = [0x17, 0x2e, 0x09];
        let (msg, used) = RailComMsg::parse_ch2(&d).unwrap();
        assert_eq!(used, 3);
        match msg {
            RailComMsg::Ext { typ, pos } => {
                assert_eq!(typ, ((0x17u8 << 4) & 0x30) | ((0x2e >> 2) & 0x0f));
                assert_eq!(pos, ((0x2eu8 << 6) & 0xc0) | 0x09);
            }
            other => panic!("not ext: {:?}", other),
        }
    }

    #[test]
    fn ahi_alo_allowed_in_channel2() {
        // address messages can show up on channel 2 as well
        let d = [0x04, 0x12];
        let (msg, used) = RailComMsg::parse_ch2(&d).unwrap();
        assert_eq!(used, 2);
        assert_eq!(msg, RailComMsg::Ahi { val: 0x12 });

        let d = [0x08, 0x03];
        let (msg, _) = RailComMsg::parse_ch2(&d).unwrap();
        assert_eq!(msg, RailComMsg::Alo { val: 0x03 });
    }

    #[test]
    fn channel1_accepts_only_address_messages() {
        // POM lead symbol is not valid channel-1 content
        assert!(RailComMsg::parse_ch1(&[0x00, 0x2a]).is_none());
        // specials are not valid channel-1 content
        assert!(RailComMsg::parse_ch1(&[DEC_ACK, 0x00]).is_none());
        // a lone address symbol is not enough
        assert!(RailComMsg::parse_ch1(&[0x04]).is_none());
    }

    #[test]
    fn xpom_inside_a_frame() {
        // channel 1 AHI, then one 6-symbol XPOM (ss=1) filling channel 2
        let syms = [0x04, 0x12, 0x25, 0x01, 0x02, 0x03, 0x04, 0x05];
        let mut frame = RailComFrame::new();
        for dec in syms {
            frame.push_raw(enc_for(dec));
        }
        frame.parse();
        assert_eq!(frame.ch1(), Some(RailComMsg::Ahi { val: 0x12 }));
        assert_eq!(frame.ch2().len(), 1);
        match frame.ch2()[0] {
            RailComMsg::Xpom { ss, .. } => assert_eq!(ss, 1),
            other => panic!("not xpom: {:?}", other),
        }
        assert!(frame.parsed_all());
    }

    #[test]
    fn truncated_xpom_fails() {
        let d = [0x20, 0x01, 0x02, 0x03, 0x04];
        assert!(RailComMsg::parse_ch2(&d).is_none());
    }

    #[test]
    fn unknown_pkt_id_fails() {
        // pkt_id 3 and 4 are unassigned
        assert!(RailComMsg::parse_ch2(&[0x0c, 0x00]).is_none());
        assert!(RailComMsg::parse_ch2(&[0x10, 0x00, 0x00]).is_none());
    }

    #[test]
    fn structural_equality() {
        assert_eq!(RailComMsg::Pom { val: 3 }, RailComMsg::Pom { val: 3 });
        assert_ne!(RailComMsg::Pom { val: 3 }, RailComMsg::Pom { val: 4 });
        assert_ne!(RailComMsg::Pom { val: 3 }, RailComMsg::Ahi { val: 3 });
        assert_eq!(
            RailComMsg::Dyn { id: 0, val: 7 },
            RailComMsg::Dyn { id: 0, val: 7 }
        );
        assert_ne!(
            RailComMsg::Dyn { id: 0, val: 7 },
            RailComMsg::Dyn { id: 1, val: 7 }
        );
    }

    #[test]
    fn reader_drains_up_to_eight_bytes() {
        use crate::hal::MockRailComUart;

        let mut uart = MockRailComUart::new();
        uart.queue_bytes(&[ENC_ACK; 10]);
        let mut reader = RailComReader::new(uart);
        reader.read();
        assert_eq!(reader.frame().len(), PKT_MAX);
        // the surplus stays in the fifo for the next cutout
        assert_eq!(reader.uart_mut().pending(), 2);

        reader.read();
        assert_eq!(reader.frame().len(), 2);
    }

    #[test]
    fn reader_reset_forwards_to_uart() {
        use crate::hal::MockRailComUart;

        let mut reader = RailComReader::new(MockRailComUart::new());
        reader.reset();
        reader.reset();
        assert_eq!(reader.uart_mut().reset_count, 2);
    }
}
