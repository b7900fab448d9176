//! Per-locomotive throttle state.
//!
//! A throttle owns one cached packet per thing it can say on the track: a
//! speed-128 packet and one packet per function group up to the configured
//! [`FunctionCap`]. The scheduler asks it for the next packet via
//! [`Throttle::next_packet`], which walks a fixed rotation — speed on every
//! even slot, the function groups in order on the odd slots — so the speed
//! refreshes at half the throttle's bandwidth and every function group
//! still gets airtime.
//!
//! Ops-mode CV operations override the rotation: while a repeat counter is
//! armed, the CV packet is returned instead and the rotation cursor does
//! not move. The operation resolves either when a RailCom POM answer
//! arrives (delivered through [`Throttle::railcom`]) or when the counter
//! runs out.
//!
//! # Example
//!
//! ```rust
//! use rs_dcc::config::FunctionCap;
//! use rs_dcc::throttle::Throttle;
//!
//! let mut t = Throttle::new(3, FunctionCap::F28).unwrap();
//! t.set_speed(8).unwrap();
//! t.set_function(0, true).unwrap();
//!
//! // function change jumped the rotation to the F0 group
//! assert_eq!(t.next_packet().bytes(), &[0x03, 0x90, 0x93]);
//! // then the rotation continues with speed
//! assert_eq!(t.next_packet().bytes(), &[0x03, 0x3f, 0x88, 0xb4]);
//! ```

use crate::config::FunctionCap;
use crate::error::Error;
use crate::packet::{check_speed, DccPacket, FunctionGroup};
use crate::railcom::{RailComMsg, DYN_SPD1};
use crate::trace::StationTrace;

/// Times an ops-mode CV packet is sent.
pub const OPS_SEND_CNT: usize = 5;

/// Generational reference to a throttle in the scheduler's table.
///
/// Used as the correlation key between a transmitted packet and the
/// RailCom answer in the following cutout. A deleted throttle bumps its
/// slot's generation, so a stale id held by an in-flight packet resolves
/// to nothing instead of the wrong locomotive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleId {
    pub(crate) index: u16,
    pub(crate) generation: u16,
}

/// Result of a finished ops-mode CV operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpsOutcome {
    /// True if the operation succeeded.
    pub ok: bool,
    /// The CV value (reads), or the last POM answer (writes).
    pub value: u8,
}

/// Point-in-time view of one throttle for UI and status reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottleSnapshot {
    /// Locomotive address.
    pub address: u16,
    /// Commanded speed (sign is direction).
    pub speed: i8,
    /// RailCom self-reported speed, if one has been received.
    pub reported_speed: Option<u8>,
    /// True while an ops-mode CV operation is in flight.
    pub ops_busy: bool,
}

/// One locomotive's state and packet rotation.
pub struct Throttle {
    cap: FunctionCap,
    pkt_speed: DccPacket,
    pkt_funcs: [DccPacket; 10],
    seq: usize,

    pkt_read_cv: DccPacket,
    pkt_write_cv: DccPacket,
    pkt_write_bit: DccPacket,
    read_cv_cnt: usize,
    write_cv_cnt: usize,
    write_bit_cnt: usize,
    ops_cv_done: bool,
    ops_cv_ok: bool,
    ops_cv_val: u8,

    reported_speed: u8,
    reported_speed_us: Option<u64>,
    show_speed: bool,
}

impl Throttle {
    /// New throttle at `address`, speed 0, all functions off.
    pub fn new(address: u16, cap: FunctionCap) -> Result<Self, Error> {
        let mut pkt_funcs = [DccPacket::empty(); 10];
        for g in cap.groups() {
            pkt_funcs[g.index()] = DccPacket::function_group(*g, address)?;
        }
        Ok(Throttle {
            cap,
            pkt_speed: DccPacket::speed_128(address, 0)?,
            pkt_funcs,
            seq: 0,
            pkt_read_cv: DccPacket::ops_verify_cv(address, 1)?,
            pkt_write_cv: DccPacket::ops_write_cv(address, 1, 0)?,
            pkt_write_bit: DccPacket::ops_write_bit(address, 1, 0, false)?,
            read_cv_cnt: 0,
            write_cv_cnt: 0,
            write_bit_cnt: 0,
            ops_cv_done: false,
            ops_cv_ok: false,
            ops_cv_val: 0,
            reported_speed: 0,
            reported_speed_us: None,
            show_speed: false,
        })
    }

    /// The throttle's address.
    pub fn address(&self) -> u16 {
        self.pkt_speed.address().unwrap_or(0)
    }

    /// Re-address every cached packet and reset the rotation.
    ///
    /// Must not be called while the throttle is visible to the bit
    /// interrupt; the station brackets it.
    pub fn set_address(&mut self, address: u16) -> Result<(), Error> {
        self.pkt_speed.set_address(address)?;
        for g in self.cap.groups() {
            self.pkt_funcs[g.index()].set_address(address)?;
        }
        self.pkt_read_cv.set_address(address)?;
        self.pkt_write_cv.set_address(address)?;
        self.pkt_write_bit.set_address(address)?;
        self.seq = 0;
        Ok(())
    }

    /// Commanded speed.
    pub fn speed(&self) -> i8 {
        self.pkt_speed.speed()
    }

    /// Set the commanded speed.
    ///
    /// Backs the rotation up to an even slot so the new speed goes out on
    /// the very next packet.
    pub fn set_speed(&mut self, speed: i8) -> Result<(), Error> {
        check_speed(speed)?;
        self.pkt_speed.set_speed(speed)?;
        self.seq &= !1;
        Ok(())
    }

    /// The configured function cap.
    pub fn function_cap(&self) -> FunctionCap {
        self.cap
    }

    /// Commanded state of function `num`.
    pub fn function(&self, num: u8) -> Result<bool, Error> {
        let group = self.group_for(num)?;
        Ok(self.pkt_funcs[group.index()].function(group, num))
    }

    /// Set function `num`.
    ///
    /// Jumps the rotation to the function's group so the change goes out
    /// on the very next packet.
    pub fn set_function(&mut self, num: u8, on: bool) -> Result<(), Error> {
        let group = self.group_for(num)?;
        self.pkt_funcs[group.index()].set_function(group, num, on)?;
        self.seq = 2 * group.index() + 1;
        Ok(())
    }

    fn group_for(&self, num: u8) -> Result<FunctionGroup, Error> {
        if num > self.cap.max_function() {
            return Err(Error::InvalidFunction);
        }
        FunctionGroup::containing(num).ok_or(Error::InvalidFunction)
    }

    // ------------------------------------------------------------------
    // Ops-mode CV access
    // ------------------------------------------------------------------

    /// Start an ops-mode CV read (needs a RailCom-capable decoder).
    pub fn read_cv(&mut self, cv_num: u16) -> Result<(), Error> {
        self.pkt_read_cv.set_cv_verify(cv_num)?;
        self.ops_cv_done = false;
        self.ops_cv_ok = false;
        // one extra so the rotation notices the exhausted counter: when it
        // decrements to zero with no POM answer, the read has failed
        self.read_cv_cnt = OPS_SEND_CNT + 1;
        Ok(())
    }

    /// Start an ops-mode CV byte write.
    pub fn write_cv(&mut self, cv_num: u16, cv_val: u8) -> Result<(), Error> {
        self.pkt_write_cv.set_cv(cv_num, cv_val)?;
        self.ops_cv_done = false;
        self.ops_cv_ok = false;
        self.ops_cv_val = cv_val;
        self.write_cv_cnt = OPS_SEND_CNT;
        Ok(())
    }

    /// Start an ops-mode CV bit write.
    pub fn write_bit(&mut self, cv_num: u16, bit_num: u8, bit_val: bool) -> Result<(), Error> {
        self.pkt_write_bit.set_cv_bit(cv_num, bit_num, bit_val)?;
        self.ops_cv_done = false;
        self.ops_cv_ok = false;
        self.ops_cv_val = bit_val as u8;
        self.write_bit_cnt = OPS_SEND_CNT;
        Ok(())
    }

    /// Non-blocking poll of the pending ops-mode CV operation.
    ///
    /// `None` while the operation is still in flight.
    pub fn ops_done(&self) -> Option<OpsOutcome> {
        if !self.ops_cv_done {
            return None;
        }
        Some(OpsOutcome {
            ok: self.ops_cv_ok,
            value: self.ops_cv_val,
        })
    }

    /// True while a CV operation still has sends pending.
    pub fn ops_busy(&self) -> bool {
        self.read_cv_cnt > 0 || self.write_cv_cnt > 0 || self.write_bit_cnt > 0
    }

    // ------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------

    /// Rotation length: two slots per function group.
    pub fn seq_max(&self) -> usize {
        2 * self.cap.group_count()
    }

    /// Reset the rotation cursor (after the throttle list is resorted).
    pub fn restart(&mut self) {
        self.seq = 0;
    }

    /// The next packet to transmit for this locomotive.
    ///
    /// A pending CV operation preempts the rotation without advancing it.
    //
    //  0. Speed     1. F0-F4
    //  2. Speed     3. F5-F8
    //  4. Speed     5. F9-F12
    //  6. Speed     7. F13-F20
    //  8. Speed     9. F21-F28  (and so on up to the cap)
    pub fn next_packet(&mut self) -> DccPacket {
        debug_assert!(self.seq < self.seq_max());

        if self.read_cv_cnt > 0 {
            self.read_cv_cnt -= 1;
            if self.read_cv_cnt == 0 {
                // no POM answer arrived; a CV read needs one, so it failed
                self.ops_cv_done = true;
                self.ops_cv_ok = false;
                self.ops_cv_val = 0;
                // fall through to the rotation below
            } else {
                return self.pkt_read_cv;
            }
        }

        if self.write_cv_cnt > 0 {
            self.write_cv_cnt -= 1;
            if self.write_cv_cnt == 0 && !self.ops_cv_done {
                // writes get no mandatory answer; exhausting the repeats is
                // best-effort success
                self.ops_cv_done = true;
                self.ops_cv_ok = true;
            }
            return self.pkt_write_cv;
        }

        if self.write_bit_cnt > 0 {
            self.write_bit_cnt -= 1;
            if self.write_bit_cnt == 0 && !self.ops_cv_done {
                self.ops_cv_done = true;
                self.ops_cv_ok = true;
            }
            return self.pkt_write_bit;
        }

        let seq = self.seq;
        self.seq += 1;
        if self.seq >= self.seq_max() {
            self.seq = 0;
        }

        if seq & 1 == 0 {
            self.pkt_speed
        } else {
            self.pkt_funcs[seq / 2]
        }
    }

    // ------------------------------------------------------------------
    // RailCom return path
    // ------------------------------------------------------------------

    /// Deliver the channel-2 messages received in the cutout after one of
    /// this throttle's packets. Called in interrupt context.
    pub fn railcom(&mut self, msgs: &[RailComMsg], now_us: u64, trace: &StationTrace) {
        for msg in msgs {
            match *msg {
                RailComMsg::Pom { val } => {
                    if self.read_cv_cnt > 0 {
                        self.ops_cv_done = true;
                        self.ops_cv_ok = true;
                        self.ops_cv_val = val;
                        self.read_cv_cnt = 0;
                    } else if self.write_cv_cnt > 0 {
                        self.ops_cv_done = true;
                        self.ops_cv_ok = true;
                        self.ops_cv_val = val;
                        self.write_cv_cnt = 0;
                    } else if self.write_bit_cnt > 0 {
                        self.ops_cv_done = true;
                        self.ops_cv_ok = true;
                        self.ops_cv_val = val;
                        self.write_bit_cnt = 0;
                    }
                }
                RailComMsg::Dyn { id: DYN_SPD1, val } => {
                    if val != self.reported_speed || self.reported_speed_us.is_none() {
                        self.reported_speed = val;
                        self.reported_speed_us = Some(now_us);
                        if self.show_speed {
                            trace.push_args(format_args!(
                                "{}.{:06} speed={}",
                                now_us / 1_000_000,
                                now_us % 1_000_000,
                                val
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// The locomotive's self-reported speed and its observation time, if
    /// one has ever been received.
    pub fn reported_speed(&self) -> Option<(u8, u64)> {
        self.reported_speed_us.map(|us| (self.reported_speed, us))
    }

    /// Trace self-reported speed changes.
    pub fn set_show_speed(&mut self, on: bool) {
        self.show_speed = on;
    }

    /// Point-in-time view for UI and status reporting.
    pub fn snapshot(&self) -> ThrottleSnapshot {
        ThrottleSnapshot {
            address: self.address(),
            speed: self.speed(),
            reported_speed: self.reported_speed().map(|(v, _)| v),
            ops_busy: self.ops_busy(),
        }
    }
}
