//! DCC packet encoding and decoding.
//!
//! A [`DccPacket`] is a plain value type: up to eight bytes, the last of
//! which is the XOR of the others. Every instruction family the station
//! emits has a constructor and in-place mutators that rebuild only the bytes
//! they own, so a throttle can keep its packets cached and patch a speed or
//! function bit without re-encoding the address.
//!
//! Decoding is two-layered: [`DccPacket::decode_type`] classifies a byte
//! buffer into a [`PacketType`], and per-family extractors
//! ([`DccPacket::decode_speed_128`], [`DccPacket::decode_func`]) return the
//! fields when — and only when — the buffer matches that family.
//!
//! # Example
//!
//! ```rust
//! use rs_dcc::packet::{DccPacket, PacketType};
//!
//! let pkt = DccPacket::speed_128(3, 8).unwrap();
//! assert_eq!(pkt.bytes(), &[0x03, 0x3f, 0x88, 0xb4]);
//! assert!(pkt.check_xor());
//! assert_eq!(DccPacket::decode_type(pkt.bytes()), PacketType::Speed128);
//! assert_eq!(pkt.decode_speed_128(), Some(8));
//! ```

use core::fmt;

use crate::error::Error;

/// Maximum packet length in bytes, XOR byte included.
pub const MSG_MAX: usize = 8;

/// Smallest valid locomotive address (0 is broadcast).
pub const ADDRESS_MIN: u16 = 1;
/// Largest short (7-bit) address.
pub const ADDRESS_SHORT_MAX: u16 = 127;
/// Largest long (14-bit) address.
pub const ADDRESS_MAX: u16 = 10239;

/// Most negative speed step (full reverse).
pub const SPEED_MIN: i8 = -127;
/// Most positive speed step (full forward).
pub const SPEED_MAX: i8 = 127;

/// Smallest CV number.
pub const CV_NUM_MIN: u16 = 1;
/// Largest CV number.
pub const CV_NUM_MAX: u16 = 1024;

/// Preamble length in operations mode (DCC 9.2 section A).
pub const OPS_PREAMBLE_BITS: usize = 14;
/// Long preamble length in service mode (DCC 9.2.3 section E).
pub const SVC_PREAMBLE_BITS: usize = 20;

/// Classification of a received byte buffer.
///
/// Returned by [`DccPacket::decode_type`]. `Invalid` covers bad length and
/// checksum failure; consumers treat `Invalid` packets as absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// Length or checksum failure, or a malformed payload.
    Invalid,
    /// Broadcast reset `{00 00 00}`.
    Reset,
    /// 128-step speed and direction.
    Speed128,
    /// 28-step speed and direction (recognized, never emitted).
    Speed28,
    /// Function group F0..F4.
    Func0,
    /// Function group F5..F8.
    Func5,
    /// Function group F9..F12.
    Func9,
    /// Function group F13..F20.
    Func13,
    /// Function group F21..F28.
    Func21,
    /// Function group F29..F36.
    Func29,
    /// Function group F37..F44.
    Func37,
    /// Function group F45..F52.
    Func45,
    /// Function group F53..F60.
    Func53,
    /// Function group F61..F68.
    Func61,
    /// Ops-mode CV write, long form.
    OpsWriteCv,
    /// Ops-mode CV bit manipulation, long form.
    OpsWriteBit,
    /// Service direct-mode byte write.
    SvcWriteCv,
    /// Service direct-mode bit write.
    SvcWriteBit,
    /// Service direct-mode byte verify.
    SvcVerifyCv,
    /// Service direct-mode bit verify.
    SvcVerifyBit,
    /// Accessory decoder packet (recognized, never emitted).
    Accessory,
    /// Reserved first-byte range 232..=252.
    Reserved,
    /// Advanced extended packet, first byte 253..=254.
    Advanced,
    /// Idle `{ff 00 ff}`.
    Idle,
    /// Well-formed but not an instruction this station implements.
    Unimplemented,
}

/// One of the DCC function groups, in rotation order.
///
/// The first three groups pack their function bits into the instruction byte
/// itself; the feature-expansion groups (F13 up) carry a separate data byte
/// selected by a fixed instruction byte (DCC 9.2.1 sections 2.3.6.5 to
/// 2.3.6.10).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FunctionGroup {
    /// F0..F4 (F0 lives in bit 4 of the instruction byte).
    F0,
    /// F5..F8.
    F5,
    /// F9..F12.
    F9,
    /// F13..F20, instruction byte 0xDE.
    F13,
    /// F21..F28, instruction byte 0xDF.
    F21,
    /// F29..F36, instruction byte 0xD8.
    F29,
    /// F37..F44, instruction byte 0xD9.
    F37,
    /// F45..F52, instruction byte 0xDA.
    F45,
    /// F53..F60, instruction byte 0xDB.
    F53,
    /// F61..F68, instruction byte 0xDC.
    F61,
}

impl FunctionGroup {
    /// All groups in rotation order.
    pub const ALL: [FunctionGroup; 10] = [
        FunctionGroup::F0,
        FunctionGroup::F5,
        FunctionGroup::F9,
        FunctionGroup::F13,
        FunctionGroup::F21,
        FunctionGroup::F29,
        FunctionGroup::F37,
        FunctionGroup::F45,
        FunctionGroup::F53,
        FunctionGroup::F61,
    ];

    /// First function number covered by this group.
    pub const fn first(self) -> u8 {
        match self {
            FunctionGroup::F0 => 0,
            FunctionGroup::F5 => 5,
            FunctionGroup::F9 => 9,
            FunctionGroup::F13 => 13,
            FunctionGroup::F21 => 21,
            FunctionGroup::F29 => 29,
            FunctionGroup::F37 => 37,
            FunctionGroup::F45 => 45,
            FunctionGroup::F53 => 53,
            FunctionGroup::F61 => 61,
        }
    }

    /// Last function number covered by this group.
    pub const fn last(self) -> u8 {
        match self {
            FunctionGroup::F0 => 4,
            FunctionGroup::F5 => 8,
            FunctionGroup::F9 => 12,
            FunctionGroup::F13 => 20,
            FunctionGroup::F21 => 28,
            FunctionGroup::F29 => 36,
            FunctionGroup::F37 => 44,
            FunctionGroup::F45 => 52,
            FunctionGroup::F53 => 60,
            FunctionGroup::F61 => 68,
        }
    }

    /// Position of this group in [`Self::ALL`] and in the throttle rotation.
    pub const fn index(self) -> usize {
        match self {
            FunctionGroup::F0 => 0,
            FunctionGroup::F5 => 1,
            FunctionGroup::F9 => 2,
            FunctionGroup::F13 => 3,
            FunctionGroup::F21 => 4,
            FunctionGroup::F29 => 5,
            FunctionGroup::F37 => 6,
            FunctionGroup::F45 => 7,
            FunctionGroup::F53 => 8,
            FunctionGroup::F61 => 9,
        }
    }

    /// Feature-expansion instruction byte for groups F13 and up.
    ///
    /// Returns `None` for the three groups whose function bits live in the
    /// instruction byte itself.
    pub const fn inst_byte(self) -> Option<u8> {
        match self {
            FunctionGroup::F0 | FunctionGroup::F5 | FunctionGroup::F9 => None,
            FunctionGroup::F13 => Some(0xde),
            FunctionGroup::F21 => Some(0xdf),
            FunctionGroup::F29 => Some(0xd8),
            FunctionGroup::F37 => Some(0xd9),
            FunctionGroup::F45 => Some(0xda),
            FunctionGroup::F53 => Some(0xdb),
            FunctionGroup::F61 => Some(0xdc),
        }
    }

    /// The group that carries function `num`, if any.
    pub fn containing(num: u8) -> Option<FunctionGroup> {
        FunctionGroup::ALL
            .iter()
            .copied()
            .find(|g| g.first() <= num && num <= g.last())
    }

    /// Packet type reported by [`DccPacket::decode_type`] for this group.
    pub const fn packet_type(self) -> PacketType {
        match self {
            FunctionGroup::F0 => PacketType::Func0,
            FunctionGroup::F5 => PacketType::Func5,
            FunctionGroup::F9 => PacketType::Func9,
            FunctionGroup::F13 => PacketType::Func13,
            FunctionGroup::F21 => PacketType::Func21,
            FunctionGroup::F29 => PacketType::Func29,
            FunctionGroup::F37 => PacketType::Func37,
            FunctionGroup::F45 => PacketType::Func45,
            FunctionGroup::F53 => PacketType::Func53,
            FunctionGroup::F61 => PacketType::Func61,
        }
    }

    /// Bit mask for function `num` within the group's function byte.
    ///
    /// For F0..F4 the mask applies to the instruction byte (F0 is bit 4, F1
    /// bit 0); for F5/F9 the low nibble of the instruction byte; for the
    /// expansion groups the separate data byte.
    pub fn bit_for(self, num: u8) -> Option<u8> {
        if num < self.first() || num > self.last() {
            return None;
        }
        let mask = match self {
            FunctionGroup::F0 => {
                if num == 0 {
                    0x10
                } else {
                    1 << (num - 1)
                }
            }
            _ => 1 << (num - self.first()),
        };
        Some(mask)
    }
}

/// A DCC instruction packet: byte buffer plus length.
///
/// Invariants for a non-empty packet: `1 <= len <= 8` and the last byte is
/// the XOR of the preceding ones. Packets are created by their owning
/// throttle or the service-mode engine, mutated only by their creator, and
/// copied by value into the bitstream's buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DccPacket {
    bytes: [u8; MSG_MAX],
    len: usize,
}

impl Default for DccPacket {
    fn default() -> Self {
        DccPacket {
            bytes: [0; MSG_MAX],
            len: 0,
        }
    }
}

impl DccPacket {
    /// Empty (zero-length) packet.
    pub const fn empty() -> Self {
        DccPacket {
            bytes: [0; MSG_MAX],
            len: 0,
        }
    }

    /// Idle packet `{ff 00 ff}` (DCC 9.2 section 2.1).
    pub const fn idle() -> Self {
        DccPacket {
            bytes: [0xff, 0x00, 0xff, 0, 0, 0, 0, 0],
            len: 3,
        }
    }

    /// Broadcast reset packet `{00 00 00}` (DCC 9.2 section 2.3.1.1).
    pub const fn reset() -> Self {
        DccPacket {
            bytes: [0; MSG_MAX],
            len: 3,
        }
    }

    /// Copy a received byte buffer. Oversized input yields an empty packet.
    pub fn from_bytes(msg: &[u8]) -> Self {
        let mut pkt = DccPacket::empty();
        if msg.len() <= MSG_MAX {
            pkt.bytes[..msg.len()].copy_from_slice(msg);
            pkt.len = msg.len();
        }
        pkt
    }

    /// 128-step speed packet (DCC 9.2.1 section 2.3.2.1).
    pub fn speed_128(adrs: u16, speed: i8) -> Result<Self, Error> {
        check_speed(speed)?;
        let mut pkt = DccPacket::empty();
        let idx = pkt.put_address(adrs)?;
        pkt.bytes[idx] = 0x3f; // CCC=001 GGGGG=11111
        pkt.bytes[idx + 1] = speed_to_dcc(speed);
        pkt.len = idx + 3;
        pkt.set_xor();
        Ok(pkt)
    }

    /// All-functions-off packet for one function group.
    pub fn function_group(group: FunctionGroup, adrs: u16) -> Result<Self, Error> {
        let mut pkt = DccPacket::empty();
        let idx = pkt.put_address(adrs)?;
        match group {
            FunctionGroup::F0 => {
                pkt.bytes[idx] = 0x80; // CCC=100, then f0:f4:f3:f2:f1
                pkt.len = idx + 2;
            }
            FunctionGroup::F5 => {
                pkt.bytes[idx] = 0xb0; // CCC=101, S=1, then f8:f7:f6:f5
                pkt.len = idx + 2;
            }
            FunctionGroup::F9 => {
                pkt.bytes[idx] = 0xa0; // CCC=101, S=0, then f12:f11:f10:f9
                pkt.len = idx + 2;
            }
            g => {
                pkt.bytes[idx] = g.inst_byte().unwrap_or(0);
                pkt.bytes[idx + 1] = 0x00;
                pkt.len = idx + 3;
            }
        }
        pkt.set_xor();
        Ok(pkt)
    }

    /// Ops-mode CV byte write, long form (DCC 9.2.1 section 2.3.7.3).
    pub fn ops_write_cv(adrs: u16, cv_num: u16, cv_val: u8) -> Result<Self, Error> {
        check_cv_num(cv_num)?;
        let mut pkt = DccPacket::empty();
        pkt.put_address(adrs)?;
        pkt.set_cv(cv_num, cv_val)?;
        Ok(pkt)
    }

    /// Ops-mode CV byte verify, long form.
    ///
    /// This is the packet a RailCom-capable decoder answers with a POM
    /// message; it reads the CV without changing it.
    pub fn ops_verify_cv(adrs: u16, cv_num: u16) -> Result<Self, Error> {
        check_cv_num(cv_num)?;
        let mut pkt = DccPacket::empty();
        pkt.put_address(adrs)?;
        pkt.set_cv_verify(cv_num)?;
        Ok(pkt)
    }

    /// Ops-mode CV bit write, long form.
    pub fn ops_write_bit(adrs: u16, cv_num: u16, bit_num: u8, bit_val: bool) -> Result<Self, Error> {
        check_cv_num(cv_num)?;
        check_bit(bit_num)?;
        let mut pkt = DccPacket::empty();
        pkt.put_address(adrs)?;
        pkt.set_cv_bit(cv_num, bit_num, bit_val)?;
        Ok(pkt)
    }

    /// Service direct-mode byte write (DCC 9.2.3 section E).
    pub fn svc_write_cv(cv_num: u16, cv_val: u8) -> Result<Self, Error> {
        check_cv_num(cv_num)?;
        let mut pkt = DccPacket::empty();
        let cv = cv_num - 1; // encoded as 0..=1023
        pkt.bytes[0] = 0x7c | (cv >> 8) as u8; // 0111CCAA, CC=11 "write byte"
        pkt.bytes[1] = cv as u8;
        pkt.bytes[2] = cv_val;
        pkt.len = 4;
        pkt.set_xor();
        Ok(pkt)
    }

    /// Service direct-mode byte verify.
    pub fn svc_verify_cv(cv_num: u16, cv_val: u8) -> Result<Self, Error> {
        check_cv_num(cv_num)?;
        let mut pkt = DccPacket::empty();
        let cv = cv_num - 1;
        pkt.bytes[0] = 0x74 | (cv >> 8) as u8; // 0111CCAA, CC=01 "verify byte"
        pkt.bytes[1] = cv as u8;
        pkt.bytes[2] = cv_val;
        pkt.len = 4;
        pkt.set_xor();
        Ok(pkt)
    }

    /// Service direct-mode bit write.
    pub fn svc_write_bit(cv_num: u16, bit_num: u8, bit_val: bool) -> Result<Self, Error> {
        check_cv_num(cv_num)?;
        check_bit(bit_num)?;
        let mut pkt = DccPacket::empty();
        let cv = cv_num - 1;
        pkt.bytes[0] = 0x78 | (cv >> 8) as u8; // 0111CCAA, CC=10 "bit manipulation"
        pkt.bytes[1] = cv as u8;
        pkt.bytes[2] = 0xf0 | ((bit_val as u8) << 3) | bit_num; // 111K DBBB, K=1 write
        pkt.len = 4;
        pkt.set_xor();
        Ok(pkt)
    }

    /// Service direct-mode bit verify.
    pub fn svc_verify_bit(cv_num: u16, bit_num: u8, bit_val: bool) -> Result<Self, Error> {
        check_cv_num(cv_num)?;
        check_bit(bit_num)?;
        let mut pkt = DccPacket::empty();
        let cv = cv_num - 1;
        pkt.bytes[0] = 0x78 | (cv >> 8) as u8;
        pkt.bytes[1] = cv as u8;
        pkt.bytes[2] = 0xe0 | ((bit_val as u8) << 3) | bit_num; // 111K DBBB, K=0 verify
        pkt.len = 4;
        pkt.set_xor();
        Ok(pkt)
    }

    /// Packet length in bytes, XOR included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length packet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The packet bytes, XOR included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Byte at `idx`, or 0 past the end.
    pub fn data(&self, idx: usize) -> u8 {
        if idx < self.len {
            self.bytes[idx]
        } else {
            0
        }
    }

    // ------------------------------------------------------------------
    // Address
    // ------------------------------------------------------------------

    /// Write `adrs` into the first one or two bytes; returns the count used.
    fn put_address(&mut self, adrs: u16) -> Result<usize, Error> {
        check_address(adrs)?;
        if adrs <= ADDRESS_SHORT_MAX {
            self.bytes[0] = adrs as u8;
            Ok(1)
        } else {
            self.bytes[0] = 0xc0 | ((adrs >> 8) & 0x3f) as u8;
            self.bytes[1] = adrs as u8;
            Ok(2)
        }
    }

    /// Re-address the packet in place, keeping every other field.
    ///
    /// Returns the number of address bytes used (1 or 2). The payload moves
    /// when the address size changes.
    pub fn set_address(&mut self, adrs: u16) -> Result<usize, Error> {
        check_address(adrs)?;
        let old_size = self.address_size();
        let new_size = if adrs <= ADDRESS_SHORT_MAX { 1 } else { 2 };
        if old_size != new_size && self.len > old_size {
            let payload_len = self.len - old_size;
            let mut payload = [0u8; MSG_MAX];
            payload[..payload_len].copy_from_slice(&self.bytes[old_size..self.len]);
            self.bytes[new_size..new_size + payload_len].copy_from_slice(&payload[..payload_len]);
            self.len = new_size + payload_len;
        }
        self.put_address(adrs)?;
        self.set_xor();
        Ok(new_size)
    }

    /// Number of address bytes implied by the first byte.
    pub fn address_size(&self) -> usize {
        if self.bytes[0] as u16 <= ADDRESS_SHORT_MAX {
            1
        } else {
            2
        }
    }

    /// Decoded address, including accessory and idle forms.
    ///
    /// `None` for reserved/advanced first bytes or a too-short buffer.
    pub fn address(&self) -> Option<u16> {
        if self.len < 2 {
            return None;
        }
        let b0 = self.bytes[0];
        if b0 < 128 {
            // broadcast (0) or 7-bit multifunction address
            Some(b0 as u16)
        } else if b0 < 192 {
            // accessory decoder, 9- or 11-bit address
            if self.len < 3 {
                return None;
            }
            let b1 = self.bytes[1];
            let adrs = (((b0 & 0x3f) as u16) << 2)
                | (((!b1 & 0x70) as u16) << 4)
                | (((b1 & 0x06) as u16) >> 1);
            Some(adrs)
        } else if b0 < 232 {
            // 14-bit multifunction address
            if self.len < 3 {
                return None;
            }
            Some((((b0 & 0x3f) as u16) << 8) | self.bytes[1] as u16)
        } else if b0 < 255 {
            None
        } else {
            Some(255) // idle
        }
    }

    // ------------------------------------------------------------------
    // XOR
    // ------------------------------------------------------------------

    /// Recompute the trailing XOR byte.
    pub fn set_xor(&mut self) {
        debug_assert!(self.len > 0 && self.len <= MSG_MAX);
        let mut x = 0u8;
        for b in &self.bytes[..self.len - 1] {
            x ^= b;
        }
        self.bytes[self.len - 1] = x;
    }

    /// True when the bytes XOR to zero.
    pub fn check_xor(&self) -> bool {
        Self::check_xor_bytes(self.bytes())
    }

    /// XOR check over a raw buffer.
    pub fn check_xor_bytes(msg: &[u8]) -> bool {
        msg.iter().fold(0u8, |x, b| x ^ b) == 0
    }

    // ------------------------------------------------------------------
    // Speed
    // ------------------------------------------------------------------

    /// Speed from a cached speed-128 packet.
    pub fn speed(&self) -> i8 {
        let idx = self.address_size() + 1; // skip address and 0x3f
        dcc_to_speed(self.data(idx))
    }

    /// Patch the speed byte of a cached speed-128 packet.
    pub fn set_speed(&mut self, speed: i8) -> Result<(), Error> {
        check_speed(speed)?;
        let idx = self.address_size() + 1;
        self.bytes[idx] = speed_to_dcc(speed);
        self.set_xor();
        Ok(())
    }

    /// Extract the speed if this buffer is a speed-128 packet.
    pub fn decode_speed_128(&self) -> Option<i8> {
        // address (1 or 2 bytes), instruction, speed, xor
        if self.len != 4 && self.len != 5 {
            return None;
        }
        let idx = self.address_size();
        if self.bytes[idx] != 0x3f {
            return None;
        }
        Some(dcc_to_speed(self.bytes[idx + 1]))
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Function state from a cached function-group packet.
    pub fn function(&self, group: FunctionGroup, num: u8) -> bool {
        let Some(mask) = group.bit_for(num) else {
            return false;
        };
        let idx = self.function_byte_index(group);
        self.data(idx) & mask != 0
    }

    /// Patch one function bit of a cached function-group packet.
    pub fn set_function(&mut self, group: FunctionGroup, num: u8, on: bool) -> Result<(), Error> {
        let mask = group.bit_for(num).ok_or(Error::InvalidFunction)?;
        let idx = self.function_byte_index(group);
        if on {
            self.bytes[idx] |= mask;
        } else {
            self.bytes[idx] &= !mask;
        }
        self.set_xor();
        Ok(())
    }

    fn function_byte_index(&self, group: FunctionGroup) -> usize {
        let idx = self.address_size();
        if group.inst_byte().is_some() {
            idx + 1 // expansion groups keep functions in the data byte
        } else {
            idx
        }
    }

    /// Extract the function bits if this buffer belongs to `group`.
    ///
    /// Bit `i` of the result is function `group.first() + i`; any other
    /// group returns `None`.
    pub fn decode_func(&self, group: FunctionGroup) -> Option<u8> {
        let idx = self.address_size();
        match group {
            FunctionGroup::F0 => {
                if self.len != 3 && self.len != 4 {
                    return None;
                }
                let instr = self.bytes[idx];
                if instr & 0xe0 != 0x80 {
                    return None;
                }
                // f0 is bit 4 on the wire; report it in bit 0
                Some(((instr & 0x0f) << 1) | ((instr >> 4) & 1))
            }
            FunctionGroup::F5 | FunctionGroup::F9 => {
                if self.len != 3 && self.len != 4 {
                    return None;
                }
                let want = if group == FunctionGroup::F5 { 0xb0 } else { 0xa0 };
                let instr = self.bytes[idx];
                if instr & 0xf0 != want {
                    return None;
                }
                Some(instr & 0x0f)
            }
            g => {
                if self.len != 4 && self.len != 5 {
                    return None;
                }
                if self.bytes[idx] != g.inst_byte().unwrap_or(0) {
                    return None;
                }
                Some(self.bytes[idx + 1])
            }
        }
    }

    // ------------------------------------------------------------------
    // CV access
    // ------------------------------------------------------------------

    /// Rewrite the packet tail as an ops-mode CV byte write.
    pub fn set_cv(&mut self, cv_num: u16, cv_val: u8) -> Result<(), Error> {
        check_cv_num(cv_num)?;
        let cv = cv_num - 1;
        let mut idx = self.address_size();
        self.bytes[idx] = 0xec | (cv >> 8) as u8; // 1110_11vv write byte
        idx += 1;
        self.bytes[idx] = cv as u8;
        idx += 1;
        self.bytes[idx] = cv_val;
        self.len = idx + 2;
        self.set_xor();
        Ok(())
    }

    /// Rewrite the packet tail as an ops-mode CV byte verify.
    pub fn set_cv_verify(&mut self, cv_num: u16) -> Result<(), Error> {
        check_cv_num(cv_num)?;
        let cv = cv_num - 1;
        let mut idx = self.address_size();
        self.bytes[idx] = 0xe4 | (cv >> 8) as u8; // 1110_01vv verify byte
        idx += 1;
        self.bytes[idx] = cv as u8;
        idx += 1;
        self.bytes[idx] = 0x00;
        self.len = idx + 2;
        self.set_xor();
        Ok(())
    }

    /// Rewrite the packet tail as an ops-mode CV bit write.
    pub fn set_cv_bit(&mut self, cv_num: u16, bit_num: u8, bit_val: bool) -> Result<(), Error> {
        check_cv_num(cv_num)?;
        check_bit(bit_num)?;
        let cv = cv_num - 1;
        let mut idx = self.address_size();
        self.bytes[idx] = 0xe8 | (cv >> 8) as u8; // 1110_10vv bit manipulation
        idx += 1;
        self.bytes[idx] = cv as u8;
        idx += 1;
        self.bytes[idx] = 0xf0 | ((bit_val as u8) << 3) | bit_num;
        self.len = idx + 2;
        self.set_xor();
        Ok(())
    }

    /// Patch the CV number of a cached service direct-mode packet.
    pub fn set_svc_cv_num(&mut self, cv_num: u16) -> Result<(), Error> {
        check_cv_num(cv_num)?;
        let cv = cv_num - 1;
        self.bytes[0] = (self.bytes[0] & 0xfc) | (cv >> 8) as u8;
        self.bytes[1] = cv as u8;
        self.set_xor();
        Ok(())
    }

    /// Patch the value byte of a cached service verify-byte packet.
    pub fn set_svc_cv_val(&mut self, cv_val: u8) {
        self.bytes[2] = cv_val;
        self.set_xor();
    }

    /// Patch bit number and value of a cached service bit-manipulation
    /// packet, keeping the CV number and the write/verify kind.
    pub fn set_svc_bit(&mut self, bit_num: u8, bit_val: bool) -> Result<(), Error> {
        check_bit(bit_num)?;
        self.bytes[2] = (self.bytes[2] & 0xf0) | ((bit_val as u8) << 3) | bit_num;
        self.set_xor();
        Ok(())
    }

    /// CV number from a cached long-form or direct-mode packet.
    pub fn cv_num(&self) -> u16 {
        let idx = if self.is_svc() { 0 } else { self.address_size() };
        let hi = (self.data(idx) & 0x03) as u16;
        ((hi << 8) | self.data(idx + 1) as u16) + 1
    }

    /// Data byte of a cached CV-access packet.
    pub fn cv_val(&self) -> u8 {
        let idx = if self.is_svc() { 0 } else { self.address_size() };
        self.data(idx + 2)
    }

    /// Bit index from a cached bit-manipulation packet.
    pub fn bit_num(&self) -> u8 {
        self.cv_val() & 0x07
    }

    /// Bit value from a cached bit-manipulation packet.
    pub fn bit_val(&self) -> bool {
        self.cv_val() & 0x08 != 0
    }

    fn is_svc(&self) -> bool {
        Self::is_svc_direct(self.bytes())
    }

    /// True if the buffer has the shape of a service direct-mode packet.
    ///
    /// Direct-mode packets overlap the mobile-decoder address space
    /// (first byte 0111_CCAA); whether one is actually a service
    /// instruction is state-dependent, so this only checks the shape.
    pub fn is_svc_direct(msg: &[u8]) -> bool {
        if msg.len() != 4 {
            return false;
        }
        let b0 = msg[0] & 0xfc;
        if b0 == 0x74 || b0 == 0x7c {
            return true; // verify or write byte
        }
        // bit manipulation needs the fixed 111x pattern in the data byte
        b0 == 0x78 && msg[2] & 0xe0 == 0xe0
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    /// Classify a received byte buffer.
    ///
    /// Length or checksum failure yields [`PacketType::Invalid`]. A buffer
    /// that does not decode as a mobile-decoder instruction but matches the
    /// service direct-mode shape classifies as the corresponding `Svc*`
    /// type.
    pub fn decode_type(msg: &[u8]) -> PacketType {
        if msg.len() < 3 {
            return PacketType::Invalid;
        }
        if !Self::check_xor_bytes(msg) {
            return PacketType::Invalid;
        }

        let b0 = msg[0];
        if b0 == 0 {
            if msg.len() == 3 && msg[1] == 0 && msg[2] == 0 {
                PacketType::Reset
            } else {
                PacketType::Invalid
            }
        } else if b0 <= 127 {
            // 7-bit multifunction address
            let t = Self::decode_payload(&msg[1..]);
            match t {
                PacketType::Unimplemented | PacketType::Reserved | PacketType::Invalid
                    if Self::is_svc_direct(msg) =>
                {
                    Self::svc_direct_type(msg)
                }
                t => t,
            }
        } else if b0 <= 191 {
            PacketType::Accessory
        } else if b0 <= 231 {
            // 14-bit multifunction address
            if msg.len() < 4 {
                PacketType::Invalid
            } else {
                Self::decode_payload(&msg[2..])
            }
        } else if b0 <= 252 {
            PacketType::Reserved
        } else if b0 <= 254 {
            PacketType::Advanced
        } else if msg.len() == 3 && msg[1] == 0 && msg[2] == 0xff {
            PacketType::Idle
        } else {
            PacketType::Invalid
        }
    }

    fn svc_direct_type(msg: &[u8]) -> PacketType {
        match (msg[0] >> 2) & 0x03 {
            0b01 => PacketType::SvcVerifyCv,
            0b11 => PacketType::SvcWriteCv,
            _ => {
                if msg[2] & 0x10 != 0 {
                    PacketType::SvcWriteBit
                } else {
                    PacketType::SvcVerifyBit
                }
            }
        }
    }

    /// Classify the instruction payload after the address bytes.
    fn decode_payload(pay: &[u8]) -> PacketType {
        if pay.is_empty() {
            return PacketType::Invalid;
        }
        let ccc = (pay[0] >> 5) & 0x07;
        match ccc {
            0 => PacketType::Unimplemented, // decoder and consist control
            1 => {
                // advanced operations: only 128-speed-step used
                if pay[0] == 0x3f && pay.len() == 3 {
                    PacketType::Speed128
                } else {
                    PacketType::Invalid
                }
            }
            2 | 3 => {
                if pay.len() == 2 {
                    PacketType::Speed28
                } else {
                    PacketType::Invalid
                }
            }
            4 => {
                if pay.len() == 2 {
                    PacketType::Func0
                } else {
                    PacketType::Invalid
                }
            }
            5 => {
                if pay.len() == 2 {
                    if pay[0] & 0x10 != 0 {
                        PacketType::Func5
                    } else {
                        PacketType::Func9
                    }
                } else {
                    PacketType::Invalid
                }
            }
            6 => {
                // feature expansion
                if pay.len() == 3 {
                    for g in FunctionGroup::ALL.iter().skip(3) {
                        if Some(pay[0]) == g.inst_byte() {
                            return g.packet_type();
                        }
                    }
                }
                PacketType::Unimplemented
            }
            _ => {
                // configuration variable access
                if pay[0] & 0x10 != 0 {
                    PacketType::Unimplemented // short form
                } else if pay.len() == 4 {
                    match (pay[0] >> 2) & 0x03 {
                        0 => PacketType::Reserved,
                        1 => PacketType::Unimplemented, // verify, svc only
                        2 => PacketType::OpsWriteBit,
                        _ => PacketType::OpsWriteCv,
                    }
                } else {
                    PacketType::Unimplemented // xpom
                }
            }
        }
    }

    /// Raw hex rendering, e.g. `{ 03 3f 88 b4 }`.
    pub fn dump(&self) -> PacketDump<'_> {
        PacketDump(self)
    }

    fn show_cv_access(&self, f: &mut fmt::Formatter<'_>, instr: u8, idx: usize) -> fmt::Result {
        // svc mode: instr is 0111_GGAA; ops mode: 1110_GGAA
        if self.len < idx + 3 {
            write!(f, "(short packet)")?;
            return write!(f, "{}", self.dump());
        }
        let op = (instr & 0x0c) >> 2;
        let cv = (((instr & 0x03) as u16) << 8 | self.bytes[idx] as u16) + 1;
        let data = self.bytes[idx + 1];
        match op {
            0 => write!(f, "op=0!")?,
            1 => write!(f, "cv{}=0x{:02x}?", cv, data)?,
            2 => {
                let bit = data & 0x07;
                let val = (data >> 3) & 1;
                if data & 0x10 != 0 {
                    write!(f, "cv{}[{}]={}", cv, bit, val)?;
                } else {
                    write!(f, "cv{}[{}]={}?", cv, bit, val)?;
                }
            }
            _ => write!(f, "cv{}=0x{:02x}", cv, data)?,
        }
        self.check_len_is(f, idx + 3)
    }

    fn check_len_is(&self, f: &mut fmt::Formatter<'_>, len: usize) -> fmt::Result {
        if self.len == len {
            return Ok(());
        }
        write!(f, " (unexpected length)")?;
        write!(f, "{}", self.dump())
    }
}

/// Signed speed step to the DCC speed byte (bit 7 = forward).
///
/// Speed 0 always encodes forward, per the stop convention.
pub fn speed_to_dcc(speed: i8) -> u8 {
    if speed < 0 {
        (-speed) as u8
    } else {
        speed as u8 | 0x80
    }
}

/// DCC speed byte to signed speed step.
pub fn dcc_to_speed(dcc: u8) -> i8 {
    if dcc & 0x80 != 0 {
        (dcc & 0x7f) as i8
    } else {
        -(dcc as i8)
    }
}

pub(crate) fn check_address(adrs: u16) -> Result<(), Error> {
    if (ADDRESS_MIN..=ADDRESS_MAX).contains(&adrs) {
        Ok(())
    } else {
        Err(Error::InvalidAddress)
    }
}

pub(crate) fn check_speed(speed: i8) -> Result<(), Error> {
    if speed >= SPEED_MIN {
        Ok(())
    } else {
        Err(Error::InvalidSpeed)
    }
}

pub(crate) fn check_cv_num(cv_num: u16) -> Result<(), Error> {
    if (CV_NUM_MIN..=CV_NUM_MAX).contains(&cv_num) {
        Ok(())
    } else {
        Err(Error::InvalidCvNum)
    }
}

pub(crate) fn check_bit(bit_num: u8) -> Result<(), Error> {
    if bit_num <= 7 {
        Ok(())
    } else {
        Err(Error::InvalidBit)
    }
}

/// Hex rendering returned by [`DccPacket::dump`].
pub struct PacketDump<'a>(&'a DccPacket);

impl fmt::Display for PacketDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for b in self.0.bytes() {
            write!(f, " {:02x}", b)?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for DccPacket {
    /// Semantic one-line rendering, e.g. `D 3 +8/128` or `D svc cv1=0x03`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D ")?;

        if self.len < 2 {
            write!(f, "(short packet)")?;
            return write!(f, "{}", self.dump());
        }

        let b0 = self.bytes[0];
        let mut idx = 1;

        if b0 < 128 || (192..232).contains(&b0) {
            if Self::is_svc_direct(self.bytes()) {
                write!(f, "svc ")?;
                return self.show_cv_access(f, self.bytes[0], 1);
            }

            let mut adrs = b0 as u16;
            if b0 >= 128 {
                if self.len < idx + 2 {
                    write!(f, "(short packet)")?;
                    return write!(f, "{}", self.dump());
                }
                adrs = ((adrs & 0x3f) << 8) | self.bytes[idx] as u16;
                idx += 1;
            }

            write!(f, "{} ", adrs)?;

            if self.len < idx + 2 {
                write!(f, "(short packet)")?;
                return write!(f, "{}", self.dump());
            }

            let instr = self.bytes[idx];
            idx += 1;

            if instr == 0x00 {
                write!(f, "reset")?;
                self.check_len_is(f, idx + 1)
            } else if instr == 0x3f {
                if self.len < idx + 2 {
                    write!(f, "(short packet)")?;
                    return write!(f, "{}", self.dump());
                }
                let speed = self.bytes[idx];
                idx += 1;
                if speed & 0x80 != 0 {
                    write!(f, "+{}/128", speed & 0x7f)?;
                } else {
                    write!(f, "-{}/128", speed & 0x7f)?;
                }
                self.check_len_is(f, idx + 1)
            } else if instr & 0xe0 == 0x80 {
                let bits = ((instr & 0x0f) << 1) | ((instr & 0x10) >> 4);
                write!(f, "f0={:02x}", bits)?;
                self.check_len_is(f, idx + 1)
            } else if instr & 0xf0 == 0xb0 {
                write!(f, "f5={:02x}", instr & 0x0f)?;
                self.check_len_is(f, idx + 1)
            } else if instr & 0xf0 == 0xa0 {
                write!(f, "f9={:02x}", instr & 0x0f)?;
                self.check_len_is(f, idx + 1)
            } else if instr & 0xf0 == 0xe0 {
                self.show_cv_access(f, instr, idx)
            } else if let Some(g) = FunctionGroup::ALL
                .iter()
                .copied()
                .find(|g| g.inst_byte() == Some(instr))
            {
                if self.len < idx + 2 {
                    write!(f, "(short packet)")?;
                    return write!(f, "{}", self.dump());
                }
                write!(f, "f{}={:02x}", g.first(), self.bytes[idx])?;
                idx += 1;
                self.check_len_is(f, idx + 1)
            } else {
                Ok(())
            }
        } else if (128..192).contains(&b0) {
            if self.len < 3 {
                write!(f, "(short packet)")?;
                return write!(f, "{}", self.dump());
            }
            let b1 = self.bytes[1];
            let adrs = (((b0 & 0x3f) as u16) << 2)
                | (((!b1 & 0x70) as u16) << 4)
                | (((b1 & 0x06) as u16) >> 1);
            let m = (b1 >> 7) & 1;
            let d = (b1 >> 3) & 1;
            let r = b1 & 1;
            write!(f, "{:5}: acc m={} d={} r={}: ", adrs, m, d, r)?;
            write!(f, "{}", self.dump())
        } else if b0 == 255 {
            write!(f, "idle")
        } else {
            // reserved (232..=252) or advanced extended (253..=254)
            write!(f, "{}", self.dump())
        }
    }
}
