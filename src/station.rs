//! The command station: everything wired together.
//!
//! [`CommandStation`] owns the bitstream, the scheduler, the current
//! sensor, the clock, and the diagnostic trace ring, and exposes the
//! foreground command API: mode changes, service-mode CV operations,
//! throttle lifecycle and control, verbosity toggles, and the trace drain.
//!
//! Two call paths exist and never block each other:
//!
//! - **Foreground**: every public method except `on_bit_interrupt`.
//!   Arguments are validated here and rejected with [`Error`] before any
//!   state changes. Throttle-table mutation happens inside an
//!   interrupt-disable / mutate / fence / re-enable bracket.
//! - **Interrupt**: [`CommandStation::on_bit_interrupt`], called once per
//!   DCC bit-end by the board's timer interrupt (or by a test harness).
//!   It advances the bitstream, drains the ADC, runs ack detection, and
//!   records its own latency.
//!
//! # Example
//!
//! ```rust
//! use rs_dcc::hal::{MockAdc, MockClock, MockRailComUart, MockTrack};
//! use rs_dcc::{CommandStation, StationConfig};
//!
//! let mut station = CommandStation::new(
//!     MockTrack::new(),
//!     MockRailComUart::new(),
//!     MockAdc::new(),
//!     MockClock::new(),
//!     StationConfig::default(),
//! );
//!
//! station.set_mode_ops().unwrap();
//! let id = station.create_throttle(3).unwrap();
//! station.set_speed(id, 8).unwrap();
//! for _ in 0..100 {
//!     station.on_bit_interrupt();
//! }
//! station.set_mode_off().unwrap();
//! ```

use core::sync::atomic::{fence, Ordering};

use crate::bitstream::{Bitstream, PacketSource, PullOutcome, TrackPacket};
use crate::config::StationConfig;
use crate::error::Error;
use crate::railcom::RailComMsg;
use crate::scheduler::{Mode, Scheduler, SvcOutcome};
use crate::throttle::{OpsOutcome, ThrottleId};
use crate::trace::{StationTrace, TraceLine};
use crate::traits::{Clock, CurrentAdc, RailComUart, TrackDriver};

/// Latency statistics for the bit-interrupt path.
///
/// The running average is kept in fixed point, scaled by the window
/// length (16), so the update stays integer-only in interrupt context.
#[derive(Clone, Copy, Debug)]
pub struct LatencyStats {
    min_us: u32,
    max_us: u32,
    avg16_us: u32,
}

/// Running-average window length.
const AVG_LEN: u32 = 16;

impl LatencyStats {
    fn new() -> Self {
        LatencyStats {
            min_us: u32::MAX,
            max_us: 0,
            avg16_us: 0,
        }
    }

    fn record(&mut self, us: u32) {
        if us < self.min_us {
            self.min_us = us;
        }
        if us > self.max_us {
            self.max_us = us;
        }
        if self.avg16_us == 0 {
            self.avg16_us = us * AVG_LEN;
        } else {
            self.avg16_us = (self.avg16_us * (AVG_LEN - 1) + us) / AVG_LEN;
        }
    }

    /// Shortest observed call, in microseconds.
    pub fn min_us(&self) -> u32 {
        if self.min_us == u32::MAX {
            0
        } else {
            self.min_us
        }
    }

    /// Longest observed call, in microseconds.
    pub fn max_us(&self) -> u32 {
        self.max_us
    }

    /// Running average over the last ~16 calls, in microseconds.
    pub fn avg_us(&self) -> u32 {
        self.avg16_us / AVG_LEN
    }
}

/// Point-in-time view of the whole station for UI and status reporting.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationStatus {
    /// Current operating mode.
    pub mode: Mode,
    /// Snapshots of every live throttle, in address order.
    pub throttles: alloc::vec::Vec<crate::throttle::ThrottleSnapshot>,
    /// Shortest observed bit-interrupt call, in microseconds.
    pub latency_min_us: u32,
    /// Longest observed bit-interrupt call, in microseconds.
    pub latency_max_us: u32,
    /// Running-average bit-interrupt call, in microseconds.
    pub latency_avg_us: u32,
    /// Diagnostic lines lost to trace-ring overflow.
    pub trace_dropped: u32,
}

/// Scheduler-plus-trace view handed to the bitstream during `next_bit`.
struct SourceCtx<'a, A: CurrentAdc> {
    scheduler: &'a mut Scheduler<A>,
    trace: &'a StationTrace,
}

impl<A: CurrentAdc> PacketSource for SourceCtx<'_, A> {
    fn pull_packet(&mut self, out: &mut TrackPacket) -> PullOutcome {
        self.scheduler.pull_packet(out)
    }

    fn deliver_railcom(&mut self, to: ThrottleId, msgs: &[RailComMsg], now_us: u64) {
        self.scheduler.deliver_railcom(to, msgs, now_us, self.trace);
    }

    fn poll(&mut self) {
        self.scheduler.poll();
    }
}

/// The DCC command station core.
pub struct CommandStation<D, U, A, C>
where
    D: TrackDriver,
    U: RailComUart,
    A: CurrentAdc,
    C: Clock,
{
    bitstream: Bitstream<D, U>,
    scheduler: Scheduler<A>,
    clock: C,
    trace: StationTrace,
    latency: LatencyStats,
    echo: bool,
}

impl<D, U, A, C> CommandStation<D, U, A, C>
where
    D: TrackDriver,
    U: RailComUart,
    A: CurrentAdc,
    C: Clock,
{
    /// Build a station over its four hardware resources.
    pub fn new(driver: D, uart: U, adc: A, clock: C, config: StationConfig) -> Self {
        CommandStation {
            bitstream: Bitstream::new(driver, uart),
            scheduler: Scheduler::new(adc, config),
            clock,
            trace: StationTrace::new(),
            latency: LatencyStats::new(),
            echo: false,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.scheduler.mode()
    }

    // ------------------------------------------------------------------
    // Interrupt entry
    // ------------------------------------------------------------------

    /// Advance the station by one bit. Call once per bit-end interrupt.
    ///
    /// Does nothing when the stream is stopped (a wrap interrupt can
    /// still fire between `stop` and the gate taking effect).
    pub fn on_bit_interrupt(&mut self) {
        if !self.bitstream.is_running() {
            return;
        }
        let t0 = self.clock.now_us();
        let mut ctx = SourceCtx {
            scheduler: &mut self.scheduler,
            trace: &self.trace,
        };
        self.bitstream.next_bit(&mut ctx, &self.trace, t0);
        let dt = self.clock.now_us().wrapping_sub(t0);
        self.latency.record(dt as u32);
    }

    /// Latency statistics for the bit-interrupt path.
    pub fn latency(&self) -> LatencyStats {
        self.latency
    }

    /// Point-in-time view of the whole station.
    pub fn status(&self) -> StationStatus {
        let throttles = self
            .scheduler
            .throttle_ids()
            .iter()
            .filter_map(|&id| self.scheduler.throttle(id))
            .map(|t| t.snapshot())
            .collect();
        StationStatus {
            mode: self.scheduler.mode(),
            throttles,
            latency_min_us: self.latency.min_us(),
            latency_max_us: self.latency.max_us(),
            latency_avg_us: self.latency.avg_us(),
            trace_dropped: self.trace.dropped(),
        }
    }

    // ------------------------------------------------------------------
    // Mode control
    // ------------------------------------------------------------------

    /// Track off: bit interrupt disabled, ADC stopped, service state
    /// cleared. The only way to cancel a running sequence.
    pub fn set_mode_off(&mut self) -> Result<(), D::Error> {
        self.echo_cmd(format_args!("mode off"));
        self.scheduler.set_mode_off();
        self.bitstream.stop()
    }

    /// Enter operations mode and start the packet stream.
    ///
    /// The RailCom cutout follows the configuration.
    pub fn set_mode_ops(&mut self) -> Result<(), D::Error> {
        self.echo_cmd(format_args!("mode ops"));
        let railcom = self.scheduler.config().railcom;
        self.scheduler.set_mode_ops();
        let now = self.clock.now_us();
        let mut ctx = SourceCtx {
            scheduler: &mut self.scheduler,
            trace: &self.trace,
        };
        self.bitstream.start_ops(railcom, &mut ctx, &self.trace, now)
    }

    // ------------------------------------------------------------------
    // Service mode
    // ------------------------------------------------------------------

    /// Write a CV byte on the programming track. Enters service mode.
    pub fn write_cv(&mut self, cv_num: u16, cv_val: u8) -> Result<(), Error> {
        self.echo_cmd(format_args!("write cv{} 0x{:02x}", cv_num, cv_val));
        self.scheduler.svc_write_cv(cv_num, cv_val)?;
        self.start_svc_stream()
    }

    /// Write one CV bit on the programming track. Enters service mode.
    pub fn write_bit(&mut self, cv_num: u16, bit_num: u8, bit_val: bool) -> Result<(), Error> {
        self.echo_cmd(format_args!(
            "write cv{}[{}] {}",
            cv_num, bit_num, bit_val as u8
        ));
        self.scheduler.svc_write_bit(cv_num, bit_num, bit_val)?;
        self.start_svc_stream()
    }

    /// Read a CV byte on the programming track. Enters service mode.
    pub fn read_cv(&mut self, cv_num: u16) -> Result<(), Error> {
        self.echo_cmd(format_args!("read cv{}", cv_num));
        self.scheduler.svc_read_cv(cv_num)?;
        self.start_svc_stream()
    }

    /// Read one CV bit on the programming track. Enters service mode.
    pub fn read_bit(&mut self, cv_num: u16, bit_num: u8) -> Result<(), Error> {
        self.echo_cmd(format_args!("read cv{}[{}]", cv_num, bit_num));
        self.scheduler.svc_read_bit(cv_num, bit_num)?;
        self.start_svc_stream()
    }

    fn start_svc_stream(&mut self) -> Result<(), Error> {
        let now = self.clock.now_us();
        let mut ctx = SourceCtx {
            scheduler: &mut self.scheduler,
            trace: &self.trace,
        };
        // driver start errors leave the scheduler armed but the track
        // dead; report the sequence as failed rather than surfacing a
        // driver error type through the CV API
        if self.bitstream.start_svc(&mut ctx, &self.trace, now).is_err() {
            self.scheduler.set_mode_off();
            return Err(Error::BadMode);
        }
        Ok(())
    }

    /// Non-blocking poll of the service-mode outcome.
    ///
    /// `None` while the sequence runs; the station is back in `Off` by
    /// the time this returns `Some`.
    pub fn svc_done(&self) -> Option<SvcOutcome> {
        self.scheduler.svc_done()
    }

    // ------------------------------------------------------------------
    // Throttles
    // ------------------------------------------------------------------

    /// Find or create the throttle for `address`.
    pub fn create_throttle(&mut self, address: u16) -> Result<ThrottleId, Error> {
        self.echo_cmd(format_args!("throttle {}", address));
        self.with_irq_off(|s| s.create_throttle(address))
    }

    /// Remove the throttle at `address`.
    pub fn delete_throttle(&mut self, address: u16) -> Result<(), Error> {
        self.echo_cmd(format_args!("delete {}", address));
        self.with_irq_off(|s| s.delete_throttle(address))
    }

    /// Remove the throttle behind `id`.
    pub fn delete_throttle_id(&mut self, id: ThrottleId) -> Result<(), Error> {
        self.with_irq_off(|s| s.delete_throttle_id(id))
    }

    /// Look up a live throttle by address.
    pub fn find_throttle(&self, address: u16) -> Option<ThrottleId> {
        self.scheduler.find_throttle(address)
    }

    /// Number of live throttles.
    pub fn throttle_count(&self) -> usize {
        self.scheduler.throttle_count()
    }

    /// Set a throttle's speed (sign is direction, 0 is stop).
    pub fn set_speed(&mut self, id: ThrottleId, speed: i8) -> Result<(), Error> {
        self.echo_cmd(format_args!("speed {}", speed));
        self.with_irq_off(|s| {
            s.throttle_mut(id)
                .ok_or(Error::NoSuchThrottle)?
                .set_speed(speed)
        })
    }

    /// A throttle's commanded speed.
    pub fn speed(&self, id: ThrottleId) -> Result<i8, Error> {
        Ok(self.scheduler.throttle(id).ok_or(Error::NoSuchThrottle)?.speed())
    }

    /// Set a throttle function.
    pub fn set_function(&mut self, id: ThrottleId, num: u8, on: bool) -> Result<(), Error> {
        self.echo_cmd(format_args!("function {} {}", num, on as u8));
        self.with_irq_off(|s| {
            s.throttle_mut(id)
                .ok_or(Error::NoSuchThrottle)?
                .set_function(num, on)
        })
    }

    /// A throttle function's commanded state.
    pub fn function(&self, id: ThrottleId, num: u8) -> Result<bool, Error> {
        self.scheduler
            .throttle(id)
            .ok_or(Error::NoSuchThrottle)?
            .function(num)
    }

    /// Start an ops-mode CV read on a throttle (RailCom answer required).
    pub fn ops_read_cv(&mut self, id: ThrottleId, cv_num: u16) -> Result<(), Error> {
        self.echo_cmd(format_args!("ops read cv{}", cv_num));
        self.with_irq_off(|s| {
            s.throttle_mut(id)
                .ok_or(Error::NoSuchThrottle)?
                .read_cv(cv_num)
        })
    }

    /// Start an ops-mode CV byte write on a throttle.
    pub fn ops_write_cv(&mut self, id: ThrottleId, cv_num: u16, cv_val: u8) -> Result<(), Error> {
        self.echo_cmd(format_args!("ops write cv{} 0x{:02x}", cv_num, cv_val));
        self.with_irq_off(|s| {
            s.throttle_mut(id)
                .ok_or(Error::NoSuchThrottle)?
                .write_cv(cv_num, cv_val)
        })
    }

    /// Start an ops-mode CV bit write on a throttle.
    pub fn ops_write_bit(
        &mut self,
        id: ThrottleId,
        cv_num: u16,
        bit_num: u8,
        bit_val: bool,
    ) -> Result<(), Error> {
        self.echo_cmd(format_args!(
            "ops write cv{}[{}] {}",
            cv_num, bit_num, bit_val as u8
        ));
        self.with_irq_off(|s| {
            s.throttle_mut(id)
                .ok_or(Error::NoSuchThrottle)?
                .write_bit(cv_num, bit_num, bit_val)
        })
    }

    /// Non-blocking poll of a throttle's pending ops-mode CV operation.
    pub fn ops_done(&self, id: ThrottleId) -> Result<Option<OpsOutcome>, Error> {
        Ok(self
            .scheduler
            .throttle(id)
            .ok_or(Error::NoSuchThrottle)?
            .ops_done())
    }

    /// A throttle's RailCom self-reported speed and observation time.
    pub fn reported_speed(&self, id: ThrottleId) -> Result<Option<(u8, u64)>, Error> {
        Ok(self
            .scheduler
            .throttle(id)
            .ok_or(Error::NoSuchThrottle)?
            .reported_speed())
    }

    /// Run a foreground mutation of interrupt-visible state under the
    /// disable / mutate / fence / re-enable bracket.
    fn with_irq_off<R>(&mut self, f: impl FnOnce(&mut Scheduler<A>) -> R) -> R {
        let was_on = self.bitstream.irq_on();
        if was_on {
            self.bitstream.set_bit_irq(false);
        }
        let r = f(&mut self.scheduler);
        // publish the mutation before the interrupt can observe it
        fence(Ordering::SeqCst);
        if was_on {
            self.bitstream.set_bit_irq(true);
        }
        r
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Pop the oldest diagnostic line, if any. Call from the main loop.
    pub fn drain_trace(&self) -> Option<TraceLine> {
        self.trace.drain()
    }

    /// Lines lost to trace-ring overflow.
    pub fn trace_dropped(&self) -> u32 {
        self.trace.dropped()
    }

    /// Trace every transmitted DCC packet.
    pub fn set_show_dcc(&mut self, on: bool) {
        self.bitstream.set_show_dcc(on);
    }

    /// Trace every received RailCom frame.
    pub fn set_show_railcom(&mut self, on: bool) {
        self.bitstream.set_show_railcom(on);
    }

    /// Trace a throttle's self-reported speed changes.
    pub fn set_show_speed(&mut self, id: ThrottleId, on: bool) -> Result<(), Error> {
        self.with_irq_off(|s| {
            s.throttle_mut(id)
                .ok_or(Error::NoSuchThrottle)?
                .set_show_speed(on);
            Ok(())
        })
    }

    /// Echo accepted foreground commands into the trace.
    pub fn set_echo(&mut self, on: bool) {
        self.echo = on;
    }

    fn echo_cmd(&self, args: core::fmt::Arguments<'_>) {
        if self.echo {
            self.trace.push_args(format_args!("# {}", args));
        }
    }

    // ------------------------------------------------------------------
    // Test and embedder access
    // ------------------------------------------------------------------

    /// The underlying bitstream (driver and RailCom reader access).
    pub fn bitstream_mut(&mut self) -> &mut Bitstream<D, U> {
        &mut self.bitstream
    }

    /// The underlying scheduler (sensor and throttle access).
    pub fn scheduler_mut(&mut self) -> &mut Scheduler<A> {
        &mut self.scheduler
    }

    /// The clock.
    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }
}
