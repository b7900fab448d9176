//! Packet scheduling: operations mode and service mode.
//!
//! The scheduler is the bitstream's [`PacketSource`]. In operations mode it
//! round-robins the throttle table; in service mode it runs the
//! direct-mode programming engine: a burst of reset packets, then command
//! packets, then closing resets, watching the current sensor for the
//! decoder's ack pulse.
//!
//! Service sequences follow the same three-phase template:
//!
//! 1. `svc_reset1_cnt` (20) resets to settle the decoder,
//! 2. `svc_command_cnt` (5) repetitions of the command packet,
//! 3. `svc_reset2_cnt` (5) closing resets.
//!
//! The ack threshold is armed from the long current average when the last
//! opening reset is fetched, and re-armed at the end of every closing-reset
//! block (a CV read runs many command blocks back to back and the baseline
//! drifts). Detection compares the short average against the threshold on
//! every fresh ADC sample batch.
//!
//! Everything in [`Scheduler::pull_packet`] and [`Scheduler::poll`] runs in
//! interrupt context. The throttle table is mutated only from the
//! foreground, under the station's interrupt-disable bracket.

extern crate alloc;

use alloc::vec::Vec;

use crate::bitstream::{PullOutcome, TrackPacket};
use crate::config::StationConfig;
use crate::current::CurrentSensor;
use crate::error::Error;
use crate::packet::{check_address, DccPacket};
use crate::throttle::{Throttle, ThrottleId};
use crate::traits::CurrentAdc;

/// Station operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Mode {
    /// Track off.
    Off,
    /// Operations: throttles multiplexed onto the track.
    Ops,
    /// Service: direct-mode programming sequence in progress.
    Service,
}

/// Which service-mode operation is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SvcOp {
    /// Byte write.
    WriteCv,
    /// Bit write.
    WriteBit,
    /// Byte read via bit-scan plus byte verify.
    ReadCv,
    /// Single-bit read.
    ReadBit,
}

/// Phase within one command block of a service sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SvcStep {
    /// No sequence active.
    None,
    /// Opening resets.
    Reset1,
    /// Command packets.
    Command,
    /// Closing resets.
    Reset2,
}

/// Outcome state of a service sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SvcStatus {
    InProgress,
    Success,
    Error,
}

/// Result of a finished service-mode operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SvcOutcome {
    /// True if the decoder acknowledged.
    pub ok: bool,
    /// The read-back value (reads); unspecified for writes.
    pub value: u8,
}

/// Sentinel for the read-CV byte-verify phase, after bits 7..0.
const VERIFY_BYTE: u8 = 8;

struct Slot {
    generation: u16,
    throttle: Option<Throttle>,
}

/// The packet scheduler.
pub struct Scheduler<A: CurrentAdc> {
    config: StationConfig,
    mode: Mode,
    sensor: CurrentSensor<A>,

    // throttle table: generational arena plus an address-sorted cursor order
    slots: Vec<Slot>,
    order: Vec<ThrottleId>,
    cursor: usize,

    // service engine
    svc_op: Option<SvcOp>,
    svc_step: SvcStep,
    svc_cmd_cnt: usize,
    svc_status: SvcStatus,
    svc_status_next: SvcStatus,
    pkt_reset: DccPacket,
    pkt_svc_write_cv: DccPacket,
    pkt_svc_write_bit: DccPacket,
    pkt_svc_verify_cv: DccPacket,
    pkt_svc_verify_bit: DccPacket,
    verify_bit: u8,
    verify_bit_val: bool,
    cv_val: u8,

    // ack detection
    ack_armed: bool,
    ack_ma: u16,
    acked: bool,
}

impl<A: CurrentAdc> Scheduler<A> {
    /// New scheduler in `Off` mode.
    pub fn new(adc: A, config: StationConfig) -> Self {
        Scheduler {
            config,
            mode: Mode::Off,
            sensor: CurrentSensor::new(adc),
            slots: Vec::new(),
            order: Vec::new(),
            cursor: 0,
            svc_op: None,
            svc_step: SvcStep::None,
            svc_cmd_cnt: 0,
            svc_status: SvcStatus::Error,
            svc_status_next: SvcStatus::Error,
            pkt_reset: DccPacket::reset(),
            pkt_svc_write_cv: DccPacket::svc_write_cv(1, 0).unwrap_or_default(),
            pkt_svc_write_bit: DccPacket::svc_write_bit(1, 0, false).unwrap_or_default(),
            pkt_svc_verify_cv: DccPacket::svc_verify_cv(1, 0).unwrap_or_default(),
            pkt_svc_verify_bit: DccPacket::svc_verify_bit(1, 0, false).unwrap_or_default(),
            verify_bit: 0,
            verify_bit_val: false,
            cv_val: 0,
            ack_armed: false,
            ack_ma: 0,
            acked: false,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The station configuration.
    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// The current sensor, for capture control and test scripting.
    pub fn sensor_mut(&mut self) -> &mut CurrentSensor<A> {
        &mut self.sensor
    }

    /// Leave whatever mode is active: ADC stopped, service state cleared.
    ///
    /// The station stops the bitstream alongside; at a service terminal
    /// the bitstream stops itself via [`PullOutcome::Off`].
    pub fn set_mode_off(&mut self) {
        self.mode = Mode::Off;
        self.svc_op = None;
        self.svc_step = SvcStep::None;
        self.svc_cmd_cnt = 0;
        self.ack_armed = false;
        self.acked = false;
        self.sensor.stop();
    }

    /// Enter operations mode.
    pub fn set_mode_ops(&mut self) {
        self.mode = Mode::Ops;
        self.svc_op = None;
    }

    // ------------------------------------------------------------------
    // Service-mode operations
    // ------------------------------------------------------------------

    /// Start a service-mode byte write.
    pub fn svc_write_cv(&mut self, cv_num: u16, cv_val: u8) -> Result<(), Error> {
        self.check_svc_idle()?;
        self.pkt_svc_write_cv = DccPacket::svc_write_cv(cv_num, cv_val)?;
        self.svc_start(SvcOp::WriteCv);
        Ok(())
    }

    /// Start a service-mode bit write.
    pub fn svc_write_bit(&mut self, cv_num: u16, bit_num: u8, bit_val: bool) -> Result<(), Error> {
        self.check_svc_idle()?;
        self.pkt_svc_write_bit = DccPacket::svc_write_bit(cv_num, bit_num, bit_val)?;
        self.svc_start(SvcOp::WriteBit);
        Ok(())
    }

    /// Start a service-mode byte read (bit-scan then byte verify).
    pub fn svc_read_cv(&mut self, cv_num: u16) -> Result<(), Error> {
        self.check_svc_idle()?;
        self.cv_val = 0;
        self.pkt_svc_verify_bit = DccPacket::svc_verify_bit(cv_num, 0, false)?;
        self.pkt_svc_verify_cv = DccPacket::svc_verify_cv(cv_num, 0)?;
        self.svc_start(SvcOp::ReadCv);
        Ok(())
    }

    /// Start a service-mode single-bit read.
    pub fn svc_read_bit(&mut self, cv_num: u16, bit_num: u8) -> Result<(), Error> {
        self.check_svc_idle()?;
        crate::packet::check_bit(bit_num)?;
        self.verify_bit = bit_num;
        self.pkt_svc_verify_bit = DccPacket::svc_verify_bit(cv_num, bit_num, false)?;
        self.svc_start(SvcOp::ReadBit);
        Ok(())
    }

    fn check_svc_idle(&self) -> Result<(), Error> {
        if self.mode != Mode::Off || self.svc_step != SvcStep::None {
            return Err(Error::BadMode);
        }
        Ok(())
    }

    fn svc_start(&mut self, op: SvcOp) {
        self.mode = Mode::Service;
        self.svc_op = Some(op);
        self.svc_status = SvcStatus::InProgress;
        self.svc_status_next = SvcStatus::InProgress;
        self.svc_step = SvcStep::Reset1;
        self.svc_cmd_cnt = self.config.svc_reset1_cnt;
        self.ack_armed = false;
        self.acked = false;
        self.sensor.start();
    }

    /// Non-blocking poll of the service-mode outcome.
    ///
    /// `None` while the sequence is still running. For reads, `value`
    /// carries the result (returned even on failure, as 0).
    pub fn svc_done(&self) -> Option<SvcOutcome> {
        if self.svc_status == SvcStatus::InProgress {
            return None;
        }
        Some(SvcOutcome {
            ok: self.svc_status == SvcStatus::Success,
            value: self.cv_val,
        })
    }

    // ------------------------------------------------------------------
    // Ack detection
    // ------------------------------------------------------------------

    fn ack_arm(&mut self) {
        self.ack_ma = self.sensor.long_avg_ma().saturating_add(self.config.ack_inc_ma);
        self.ack_armed = true;
        self.acked = false;
    }

    fn ack(&self) -> bool {
        self.acked
    }

    /// Once-per-bit housekeeping: drain the ADC and check for an ack.
    ///
    /// Runs in interrupt context; the ack latch is monotonic until the
    /// threshold is re-armed.
    pub fn poll(&mut self) {
        if self.mode != Mode::Service {
            return;
        }
        if !self.sensor.drain() {
            return;
        }
        if self.ack_armed && !self.acked && self.sensor.short_avg_ma() >= self.ack_ma {
            self.acked = true;
        }
    }

    // ------------------------------------------------------------------
    // Packet supply
    // ------------------------------------------------------------------

    /// Fill `out` with the next packet. Interrupt context; never blocks,
    /// never allocates, always leaves `out` valid.
    pub fn pull_packet(&mut self, out: &mut TrackPacket) -> PullOutcome {
        match self.mode {
            Mode::Ops => {
                self.pull_ops(out);
                PullOutcome::Packet
            }
            Mode::Service => match self.svc_op {
                Some(SvcOp::WriteCv) | Some(SvcOp::WriteBit) => self.pull_svc_write(out),
                Some(SvcOp::ReadCv) => self.pull_svc_read_cv(out),
                Some(SvcOp::ReadBit) => self.pull_svc_read_bit(out),
                None => {
                    out.set_idle();
                    PullOutcome::Off
                }
            },
            Mode::Off => {
                // keeps the stream coherent if a pull races a mode change
                out.set_idle();
                PullOutcome::Packet
            }
        }
    }

    fn pull_ops(&mut self, out: &mut TrackPacket) {
        // round-robin over the address-sorted order; an empty table or a
        // table of dead slots yields idle rather than stalling the stream
        for _ in 0..self.order.len() {
            let id = self.order[self.cursor];
            self.cursor += 1;
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
            if let Some(throttle) = self.throttle_mut(id) {
                let pkt = throttle.next_packet();
                out.set(pkt, Some(id));
                return;
            }
        }
        out.set_idle();
    }

    // Service mode, write CV (byte or bit):
    // 20 resets, then 5 write commands, then 5 resets. An ack during the
    // commands or closing resets reports success and, unless a current
    // capture is running, fast-forwards the rest of the sequence.
    fn pull_svc_write(&mut self, out: &mut TrackPacket) -> PullOutcome {
        debug_assert!(self.svc_step != SvcStep::None);

        if self.svc_step == SvcStep::Reset1 {
            debug_assert!(self.svc_cmd_cnt > 0);
            out.set(self.pkt_reset, None);
            self.svc_cmd_cnt -= 1;
            if self.svc_cmd_cnt == 0 {
                // the long average over the opening resets is the baseline
                // for the ack pulse
                self.ack_arm();
                self.svc_step = SvcStep::Command;
                self.svc_cmd_cnt = self.config.svc_command_cnt;
            }
            return PullOutcome::Packet;
        }

        if self.ack() {
            if !self.sensor.capturing() {
                self.svc_step = SvcStep::Reset2;
                self.svc_cmd_cnt = 0;
            }
            // latched; the outcome is published only at the terminal
            self.svc_status_next = SvcStatus::Success;
        }

        if self.svc_step == SvcStep::Command {
            debug_assert!(self.svc_cmd_cnt > 0);
            let pkt = match self.svc_op {
                Some(SvcOp::WriteCv) => self.pkt_svc_write_cv,
                _ => self.pkt_svc_write_bit,
            };
            out.set(pkt, None);
            self.svc_cmd_cnt -= 1;
            if self.svc_cmd_cnt == 0 {
                self.svc_step = SvcStep::Reset2;
                self.svc_cmd_cnt = self.config.svc_reset2_cnt;
            }
            return PullOutcome::Packet;
        }

        debug_assert!(self.svc_step == SvcStep::Reset2);

        if self.svc_cmd_cnt > 0 {
            out.set(self.pkt_reset, None);
            self.svc_cmd_cnt -= 1;
            return PullOutcome::Packet;
        }

        self.svc_terminal(out)
    }

    // Service mode, read CV:
    // after the opening resets, for each bit 7..0 run a verify-bit(bit, 1)
    // command block and a closing-reset block, ORing the bit into the
    // accumulator when the decoder acks. Then verify the accumulated byte
    // the same way; the final ack confirms the read.
    fn pull_svc_read_cv(&mut self, out: &mut TrackPacket) -> PullOutcome {
        debug_assert!(self.svc_step != SvcStep::None);

        if self.svc_step == SvcStep::Reset1 {
            debug_assert!(self.svc_cmd_cnt > 0);
            out.set(self.pkt_reset, None);
            self.svc_cmd_cnt -= 1;
            if self.svc_cmd_cnt == 0 {
                self.ack_arm();
                self.verify_bit = 7;
                self.verify_bit_val = true;
                let _ = self.pkt_svc_verify_bit.set_svc_bit(self.verify_bit, true);
                self.svc_step = SvcStep::Command;
                self.svc_cmd_cnt = self.config.svc_command_cnt;
            }
            return PullOutcome::Packet;
        }

        if self.ack() {
            if self.verify_bit < VERIFY_BYTE {
                // ack for one bit verify; keep the block running, further
                // acks for the same bit are idempotent
                self.cv_val |= 1 << self.verify_bit;
            } else {
                // ack for the final byte verify
                if !self.sensor.capturing() {
                    self.svc_step = SvcStep::Reset2;
                    self.svc_cmd_cnt = 0;
                }
                self.svc_status_next = SvcStatus::Success;
            }
        }

        if self.svc_step == SvcStep::Command {
            debug_assert!(self.svc_cmd_cnt > 0);
            if self.verify_bit == VERIFY_BYTE {
                out.set(self.pkt_svc_verify_cv, None);
            } else {
                out.set(self.pkt_svc_verify_bit, None);
            }
            self.svc_cmd_cnt -= 1;
            if self.svc_cmd_cnt == 0 {
                self.svc_step = SvcStep::Reset2;
                self.svc_cmd_cnt = self.config.svc_reset2_cnt;
            }
            return PullOutcome::Packet;
        }

        debug_assert!(self.svc_step == SvcStep::Reset2);

        if self.svc_cmd_cnt > 0 {
            out.set(self.pkt_reset, None);
            self.svc_cmd_cnt -= 1;
            if self.svc_cmd_cnt == 0 {
                // fresh baseline and threshold before the next command
                // block; the current does not hold steady across the
                // whole scan
                self.ack_arm();
            }
            return PullOutcome::Packet;
        }

        // one bit (or the byte verify) is completely done

        if (1..=7).contains(&self.verify_bit) {
            self.verify_bit -= 1;
            let _ = self.pkt_svc_verify_bit.set_svc_bit(self.verify_bit, true);
            out.set(self.pkt_svc_verify_bit, None);
            self.svc_step = SvcStep::Command;
            self.svc_cmd_cnt = self.config.svc_command_cnt - 1;
            return PullOutcome::Packet;
        }

        if self.verify_bit == 0 {
            // bits done; verify the accumulated byte
            self.verify_bit = VERIFY_BYTE;
            self.pkt_svc_verify_cv.set_svc_cv_val(self.cv_val);
            out.set(self.pkt_svc_verify_cv, None);
            self.svc_step = SvcStep::Command;
            self.svc_cmd_cnt = self.config.svc_command_cnt - 1;
            return PullOutcome::Packet;
        }

        debug_assert!(self.verify_bit == VERIFY_BYTE);
        self.svc_terminal(out)
    }

    // Service mode, read bit:
    // verify the bit as 0; if no ack, verify it as 1; record whichever
    // acked. Neither acking is an error.
    fn pull_svc_read_bit(&mut self, out: &mut TrackPacket) -> PullOutcome {
        debug_assert!(self.svc_step != SvcStep::None);

        if self.svc_step == SvcStep::Reset1 {
            debug_assert!(self.svc_cmd_cnt > 0);
            out.set(self.pkt_reset, None);
            self.svc_cmd_cnt -= 1;
            if self.svc_cmd_cnt == 0 {
                self.ack_arm();
                self.verify_bit_val = false; // try 0 first
                let _ = self.pkt_svc_verify_bit.set_svc_bit(self.verify_bit, false);
                self.svc_step = SvcStep::Command;
                self.svc_cmd_cnt = self.config.svc_command_cnt;
            }
            return PullOutcome::Packet;
        }

        if self.ack() {
            if !self.sensor.capturing() {
                self.svc_step = SvcStep::Reset2;
                self.svc_cmd_cnt = 0;
            }
            // whichever value we were verifying is the answer
            self.cv_val = self.verify_bit_val as u8;
            self.svc_status_next = SvcStatus::Success;
        }

        if self.svc_step == SvcStep::Command {
            debug_assert!(self.svc_cmd_cnt > 0);
            out.set(self.pkt_svc_verify_bit, None);
            self.svc_cmd_cnt -= 1;
            if self.svc_cmd_cnt == 0 {
                self.svc_step = SvcStep::Reset2;
                self.svc_cmd_cnt = self.config.svc_reset2_cnt;
            }
            return PullOutcome::Packet;
        }

        debug_assert!(self.svc_step == SvcStep::Reset2);

        if self.svc_cmd_cnt > 0 {
            out.set(self.pkt_reset, None);
            self.svc_cmd_cnt -= 1;
            return PullOutcome::Packet;
        }

        if self.svc_status_next == SvcStatus::InProgress && !self.verify_bit_val {
            // no ack for 0; try 1
            self.verify_bit_val = true;
            let _ = self.pkt_svc_verify_bit.set_svc_bit(self.verify_bit, true);
            out.set(self.pkt_svc_verify_bit, None);
            self.svc_step = SvcStep::Command;
            self.svc_cmd_cnt = self.config.svc_command_cnt - 1;
            return PullOutcome::Packet;
        }

        self.svc_terminal(out)
    }

    /// Latch the outcome and shut the sequence down.
    fn svc_terminal(&mut self, out: &mut TrackPacket) -> PullOutcome {
        debug_assert!(self.svc_cmd_cnt == 0);
        self.svc_status = if self.svc_status_next == SvcStatus::InProgress {
            SvcStatus::Error // no ack anywhere
        } else {
            SvcStatus::Success
        };
        self.set_mode_off();
        out.set_idle();
        PullOutcome::Off
    }

    /// Deliver RailCom channel-2 messages to the correlated throttle.
    pub fn deliver_railcom(
        &mut self,
        to: ThrottleId,
        msgs: &[crate::railcom::RailComMsg],
        now_us: u64,
        trace: &crate::trace::StationTrace,
    ) {
        if let Some(throttle) = self.throttle_mut(to) {
            throttle.railcom(msgs, now_us, trace);
        }
    }

    // ------------------------------------------------------------------
    // Throttle table (foreground only, under the station's irq bracket)
    // ------------------------------------------------------------------

    /// Find or create the throttle at `address`.
    ///
    /// Creation inserts in address-sorted order and restarts every
    /// rotation cursor so the round-robin wrap stays coherent.
    pub fn create_throttle(&mut self, address: u16) -> Result<ThrottleId, Error> {
        check_address(address)?;
        if let Some(id) = self.find_throttle(address) {
            return Ok(id);
        }

        let throttle = Throttle::new(address, self.config.function_cap)?;
        let id = match self.slots.iter_mut().position(|s| s.throttle.is_none()) {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.throttle = Some(throttle);
                ThrottleId {
                    index: index as u16,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    throttle: Some(throttle),
                });
                ThrottleId {
                    index: (self.slots.len() - 1) as u16,
                    generation: 0,
                }
            }
        };
        self.restart_throttles();
        Ok(id)
    }

    /// Remove and destroy the throttle at `address`.
    pub fn delete_throttle(&mut self, address: u16) -> Result<(), Error> {
        let id = self.find_throttle(address).ok_or(Error::NoSuchThrottle)?;
        self.delete_throttle_id(id)
    }

    /// Remove and destroy the throttle behind `id`.
    ///
    /// The slot's generation bumps, so stale references in in-flight
    /// packets stop resolving.
    pub fn delete_throttle_id(&mut self, id: ThrottleId) -> Result<(), Error> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.throttle.is_some())
            .ok_or(Error::NoSuchThrottle)?;
        slot.throttle = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.restart_throttles();
        Ok(())
    }

    /// Look up a live throttle by address.
    pub fn find_throttle(&self, address: u16) -> Option<ThrottleId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.throttle
                .as_ref()
                .filter(|t| t.address() == address)
                .map(|_| ThrottleId {
                    index: index as u16,
                    generation: slot.generation,
                })
        })
    }

    /// Rebuild the address-sorted round-robin order and reset every
    /// rotation cursor.
    pub fn restart_throttles(&mut self) {
        self.order.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(throttle) = slot.throttle.as_mut() {
                throttle.restart();
                self.order.push(ThrottleId {
                    index: index as u16,
                    generation: slot.generation,
                });
            }
        }
        let slots = &self.slots;
        self.order.sort_by_key(|id| {
            slots[id.index as usize]
                .throttle
                .as_ref()
                .map(|t| t.address())
                .unwrap_or(u16::MAX)
        });
        self.cursor = 0;
    }

    /// Number of live throttles.
    pub fn throttle_count(&self) -> usize {
        self.order.len()
    }

    /// Live throttle ids in round-robin (address) order.
    pub fn throttle_ids(&self) -> &[ThrottleId] {
        &self.order
    }

    /// Resolve a throttle id, respecting generations.
    pub fn throttle(&self, id: ThrottleId) -> Option<&Throttle> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.throttle.as_ref())
    }

    /// Mutable resolve, same rules as [`throttle`](Self::throttle).
    pub fn throttle_mut(&mut self, id: ThrottleId) -> Option<&mut Throttle> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.throttle.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockAdc;
    use crate::packet::PacketType;

    const RAW_BASE: u16 = 124; // ~74 mA
    const RAW_ACK: u16 = 1241; // ~909 mA

    fn sched() -> Scheduler<MockAdc> {
        Scheduler::new(MockAdc::new(), StationConfig::default())
    }

    fn settle_baseline(s: &mut Scheduler<MockAdc>) {
        s.sensor_mut().adc_mut().queue_level(RAW_BASE, crate::current::LONG_CNT);
        s.sensor_mut().drain();
    }

    fn pull(s: &mut Scheduler<MockAdc>) -> (TrackPacket, PullOutcome) {
        let mut out = TrackPacket::idle();
        let outcome = s.pull_packet(&mut out);
        (out, outcome)
    }

    fn spike(s: &mut Scheduler<MockAdc>) {
        s.sensor_mut().adc_mut().queue_level(RAW_ACK, crate::current::SHORT_CNT);
        s.poll();
    }

    // =========================================================================
    // Ops mode
    // =========================================================================

    #[test]
    fn ops_with_no_throttles_yields_idle() {
        let mut s = sched();
        s.set_mode_ops();
        let (out, outcome) = pull(&mut s);
        assert_eq!(outcome, PullOutcome::Packet);
        assert_eq!(out.packet().bytes(), DccPacket::idle().bytes());
        assert!(out.throttle().is_none());
    }

    #[test]
    fn ops_round_robins_in_address_order() {
        let mut s = sched();
        s.set_mode_ops();
        // created out of order; round robin must run sorted
        let id9 = s.create_throttle(9).unwrap();
        let id3 = s.create_throttle(3).unwrap();
        let id5 = s.create_throttle(5).unwrap();

        let mut seen = alloc::vec::Vec::new();
        for _ in 0..6 {
            let (out, _) = pull(&mut s);
            seen.push(out.throttle().unwrap());
        }
        assert_eq!(seen, alloc::vec![id3, id5, id9, id3, id5, id9]);
    }

    #[test]
    fn create_is_find_or_create() {
        let mut s = sched();
        let a = s.create_throttle(3).unwrap();
        let b = s.create_throttle(3).unwrap();
        assert_eq!(a, b);
        assert_eq!(s.throttle_count(), 1);
    }

    #[test]
    fn deleted_id_stops_resolving() {
        let mut s = sched();
        let id = s.create_throttle(3).unwrap();
        s.delete_throttle(3).unwrap();
        assert!(s.throttle(id).is_none());
        assert_eq!(s.delete_throttle_id(id), Err(Error::NoSuchThrottle));

        // a new throttle reuses the slot under a fresh generation
        let id2 = s.create_throttle(4).unwrap();
        assert_eq!(id2.index, id.index);
        assert_ne!(id2.generation, id.generation);
        assert!(s.throttle(id).is_none());
        assert!(s.throttle(id2).is_some());
    }

    #[test]
    fn delete_resets_the_rotation() {
        let mut s = sched();
        s.set_mode_ops();
        let id3 = s.create_throttle(3).unwrap();
        let id5 = s.create_throttle(5).unwrap();
        let _id9 = s.create_throttle(9).unwrap();

        // advance the cursor into the middle of the list
        pull(&mut s);
        pull(&mut s);

        s.delete_throttle(9).unwrap();
        assert_eq!(s.throttle_count(), 2);

        // deletion restarted the round robin from the lowest address
        let (out, _) = pull(&mut s);
        assert_eq!(out.throttle(), Some(id3));
        let (out, _) = pull(&mut s);
        assert_eq!(out.throttle(), Some(id5));
    }

    #[test]
    fn restart_resets_every_rotation_cursor() {
        let mut s = sched();
        s.set_mode_ops();
        let id = s.create_throttle(3).unwrap();

        // move the throttle's rotation off the speed slot
        pull(&mut s);
        s.restart_throttles();

        // back to the speed slot
        let (out, _) = pull(&mut s);
        assert_eq!(out.throttle(), Some(id));
        assert!(out.packet().decode_speed_128().is_some());
    }

    #[test]
    fn railcom_delivery_reaches_the_throttle() {
        let mut s = sched();
        s.set_mode_ops();
        let id = s.create_throttle(3).unwrap();
        s.throttle_mut(id).unwrap().read_cv(7).unwrap();
        pull(&mut s);

        let trace = crate::trace::StationTrace::new();
        s.deliver_railcom(id, &[crate::railcom::RailComMsg::Pom { val: 0x2a }], 0, &trace);

        let done = s.throttle(id).unwrap().ops_done().unwrap();
        assert!(done.ok);
        assert_eq!(done.value, 0x2a);
    }

    #[test]
    fn poll_outside_service_mode_is_inert() {
        let mut s = sched();
        s.set_mode_ops();
        s.sensor_mut().adc_mut().queue_level(RAW_ACK, 32);
        s.poll();
        // ops mode does not drain the ack path
        assert_eq!(s.sensor_mut().adc_mut().pending(), 32);
    }

    #[test]
    fn stale_railcom_delivery_is_dropped() {
        let mut s = sched();
        let id = s.create_throttle(3).unwrap();
        s.delete_throttle(3).unwrap();
        let trace = crate::trace::StationTrace::new();
        // must not panic or resurrect anything
        s.deliver_railcom(id, &[crate::railcom::RailComMsg::Ack], 0, &trace);
    }

    // =========================================================================
    // Service mode: write CV
    // =========================================================================

    #[test]
    fn write_cv_sequence_without_ack_fails() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_write_cv(1, 3).unwrap();
        assert_eq!(s.mode(), Mode::Service);
        assert!(s.svc_done().is_none());

        // 20 resets
        for _ in 0..20 {
            let (out, outcome) = pull(&mut s);
            assert_eq!(outcome, PullOutcome::Packet);
            assert_eq!(
                DccPacket::decode_type(out.packet().bytes()),
                PacketType::Reset
            );
        }
        // 5 write commands
        for _ in 0..5 {
            let (out, _) = pull(&mut s);
            assert_eq!(out.packet().bytes(), &[0x7c, 0x00, 0x03, 0x7f]);
        }
        // 5 closing resets
        for _ in 0..5 {
            let (out, _) = pull(&mut s);
            assert_eq!(
                DccPacket::decode_type(out.packet().bytes()),
                PacketType::Reset
            );
        }
        // terminal: no ack seen
        let (_, outcome) = pull(&mut s);
        assert_eq!(outcome, PullOutcome::Off);
        assert_eq!(s.mode(), Mode::Off);
        assert_eq!(s.svc_done().unwrap().ok, false);
    }

    #[test]
    fn write_cv_ack_during_commands_succeeds() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_write_cv(1, 3).unwrap();

        for _ in 0..20 {
            pull(&mut s);
        }
        // first command fetched
        let (out, _) = pull(&mut s);
        assert_eq!(out.packet().bytes(), &[0x7c, 0x00, 0x03, 0x7f]);

        // decoder acks while the command repeats
        spike(&mut s);

        // the sequence fast-forwards to the terminal
        let (_, outcome) = pull(&mut s);
        assert_eq!(outcome, PullOutcome::Off);
        let done = s.svc_done().unwrap();
        assert!(done.ok);
        assert_eq!(s.mode(), Mode::Off);
    }

    #[test]
    fn write_cv_ack_with_capture_runs_full_sequence() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.sensor_mut().capture_start(64);
        s.svc_write_cv(1, 3).unwrap();

        for _ in 0..20 {
            pull(&mut s);
        }
        pull(&mut s); // command 1
        spike(&mut s);

        // remaining 4 commands and 5 resets still go out
        let mut packets = 0;
        loop {
            let (_, outcome) = pull(&mut s);
            if outcome == PullOutcome::Off {
                break;
            }
            packets += 1;
        }
        assert_eq!(packets, 9);
        assert!(s.svc_done().unwrap().ok);
    }

    #[test]
    fn svc_busy_rejected() {
        let mut s = sched();
        s.svc_write_cv(1, 3).unwrap();
        assert_eq!(s.svc_write_cv(2, 4), Err(Error::BadMode));
    }

    // =========================================================================
    // Service mode: read CV
    // =========================================================================

    /// Drive a read-CV sequence, acking the bit verifies listed in
    /// `ack_bits` and (optionally) the final byte verify.
    fn run_read_cv(s: &mut Scheduler<MockAdc>, ack_bits: &[u8], ack_byte: bool) -> usize {
        let mut packets = 0;
        let mut current_block: Option<(bool, u8)> = None; // (is_byte, bit)
        loop {
            let mut out = TrackPacket::idle();
            let outcome = s.pull_packet(&mut out);
            if outcome == PullOutcome::Off {
                break;
            }
            packets += 1;
            let bytes = out.packet().bytes().to_vec();
            let t = DccPacket::decode_type(&bytes);
            let block = match t {
                PacketType::SvcVerifyBit => Some((false, out.packet().bit_num())),
                PacketType::SvcVerifyCv => Some((true, 0)),
                _ => None,
            };
            if let Some(b) = block {
                if current_block != Some(b) {
                    current_block = Some(b);
                    let ack = match b {
                        (true, _) => ack_byte,
                        (false, bit) => ack_bits.contains(&bit),
                    };
                    if ack {
                        s.sensor_mut()
                            .adc_mut()
                            .queue_level(RAW_ACK, crate::current::SHORT_CNT);
                        s.poll();
                        // settle back to the baseline for the next arm
                        s.sensor_mut()
                            .adc_mut()
                            .queue_level(RAW_BASE, crate::current::LONG_CNT);
                        s.sensor_mut().drain();
                    }
                }
            }
        }
        packets
    }

    #[test]
    fn read_cv_accumulates_bits() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_read_cv(1).unwrap();

        // CV value 3: bits 1 and 0 are set, and the byte verify acks
        run_read_cv(&mut s, &[0, 1], true);

        let done = s.svc_done().unwrap();
        assert!(done.ok);
        assert_eq!(done.value, 3);
    }

    #[test]
    fn read_cv_without_final_ack_fails() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_read_cv(1).unwrap();

        run_read_cv(&mut s, &[7, 2], false);

        let done = s.svc_done().unwrap();
        assert!(!done.ok);
        // the accumulator still carries what the bit scan saw
        assert_eq!(done.value, 0x84);
    }

    #[test]
    fn read_cv_packet_count_without_acks() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_read_cv(1).unwrap();
        let packets = run_read_cv(&mut s, &[], false);
        // 20 opening resets + 9 blocks of (5 commands + 5 resets)
        assert_eq!(packets, 20 + 9 * 10);
    }

    // =========================================================================
    // Service mode: read bit
    // =========================================================================

    #[test]
    fn read_bit_zero_acks_first_try() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_read_bit(1, 3).unwrap();

        for _ in 0..20 {
            pull(&mut s);
        }
        let (out, _) = pull(&mut s);
        assert_eq!(
            DccPacket::decode_type(out.packet().bytes()),
            PacketType::SvcVerifyBit
        );
        assert_eq!(out.packet().bit_num(), 3);
        assert!(!out.packet().bit_val());

        spike(&mut s);
        let (_, outcome) = pull(&mut s);
        assert_eq!(outcome, PullOutcome::Off);
        let done = s.svc_done().unwrap();
        assert!(done.ok);
        assert_eq!(done.value, 0);
    }

    #[test]
    fn read_bit_falls_back_to_one() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_read_bit(1, 3).unwrap();

        // opening resets + full verify-0 block with no ack
        for _ in 0..(20 + 5 + 5) {
            pull(&mut s);
        }
        // next pull starts the verify-1 block
        let (out, _) = pull(&mut s);
        assert!(out.packet().bit_val());

        spike(&mut s);
        let (_, outcome) = pull(&mut s);
        assert_eq!(outcome, PullOutcome::Off);
        let done = s.svc_done().unwrap();
        assert!(done.ok);
        assert_eq!(done.value, 1);
    }

    #[test]
    fn read_bit_no_ack_either_way_fails() {
        let mut s = sched();
        settle_baseline(&mut s);
        s.svc_read_bit(1, 3).unwrap();

        let mut packets = 0;
        loop {
            let (_, outcome) = pull(&mut s);
            if outcome == PullOutcome::Off {
                break;
            }
            packets += 1;
        }
        // 20 resets + verify-0 block (10) + verify-1 block (10)
        assert_eq!(packets, 40);
        assert!(!s.svc_done().unwrap().ok);
    }
}
