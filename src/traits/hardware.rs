//! Hardware abstraction traits for the track signal, RailCom return
//! channel, current sensing, and time.
//!
//! All four traits are deliberately small: the station core contains every
//! protocol decision, and a board implementation only moves bytes and
//! programs timer registers.
//!
//! # Implementation
//!
//! For testing and desktop development, use the mocks in
//! [`crate::hal::mock`]. A board crate implements these against its PWM,
//! UART, and ADC peripherals; the reference wiring is a PWM slice whose two
//! channels drive the signal and power pins, with the wrap interrupt
//! calling into the station once per bit.

/// One DCC bit value.
///
/// The wire encoding is a symmetric square wave: the half-period is 58 µs
/// for a one and 100 µs for a zero (DCC 9.1 nominal values).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bit {
    /// 100 µs half-period.
    Zero,
    /// 58 µs half-period.
    One,
}

impl Bit {
    /// Nominal half-period in microseconds.
    pub const fn half_period_us(self) -> u32 {
        match self {
            Bit::Zero => 100,
            Bit::One => 58,
        }
    }

    /// The bit as 0 or 1.
    pub const fn value(self) -> u8 {
        match self {
            Bit::Zero => 0,
            Bit::One => 1,
        }
    }

    /// Bit from a data bit value.
    pub const fn from_value(v: u8) -> Bit {
        if v == 0 {
            Bit::Zero
        } else {
            Bit::One
        }
    }
}

/// Power duty for a full-power bit: all four quarter-bits on.
pub const POWER_FULL: u8 = 4;
/// Power duty for the first cutout bit: on for one quarter-bit, then off.
pub const POWER_CUTOUT_START: u8 = 1;
/// Power duty for the remaining cutout bits: off.
pub const POWER_OFF: u8 = 0;

/// Track signal driver.
///
/// Models a double-buffered PWM: [`program_bit`](Self::program_bit) sets up
/// the bit that will go out *after* the one currently on the wire, and the
/// hardware latches the new period/duty at the next wrap. The wrap
/// interrupt is the station's heartbeat; the driver only gates it.
///
/// # Implementation Notes
///
/// - `power_quarters` is the number of quarter-bits the power channel stays
///   on: 4 for normal bits, 1 for the first cutout bit, 0 for the rest of
///   the cutout.
/// - `stop` must force both channels to 0% duty but keep the timer
///   running, so a later `begin`/`run` is glitch-free.
/// - `program_bit` is called from interrupt context and must not fail; it
///   is register writes only.
pub trait TrackDriver {
    /// Error type for start/stop operations.
    type Error;

    /// Initialize the timer, leaving output disabled.
    fn begin(&mut self) -> Result<(), Self::Error>;

    /// Start the timer running (the first bit must already be programmed).
    fn run(&mut self) -> Result<(), Self::Error>;

    /// Force both channels to 0% duty and leave the timer running.
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// Program the next bit's half-period and power duty.
    fn program_bit(&mut self, bit: Bit, power_quarters: u8);

    /// Gate the bit-end interrupt.
    fn set_bit_irq(&mut self, enabled: bool);
}

/// RailCom return-channel UART (250 kbaud, 8N1).
pub trait RailComUart {
    /// Reinitialize the receiver. Called at cutout start, because the
    /// power edge can glitch a UART that was mid-byte.
    fn reset(&mut self);

    /// Pop one received byte, or `None` when the FIFO is empty.
    ///
    /// Must not block; called from interrupt context.
    fn read(&mut self) -> Option<u8>;
}

/// Current-sense ADC sampling at a fixed rate into a hardware FIFO.
///
/// # Implementation Notes
///
/// - Samples are 12-bit codes in the low bits; bit 15 set flags a FIFO
///   error for that sample. The sensor counts errors and otherwise uses
///   the sample.
/// - `pop` must not block; the sensor drains whatever is there per call.
pub trait CurrentAdc {
    /// Start free-running conversion.
    fn start(&mut self);

    /// Stop conversion.
    fn stop(&mut self);

    /// Pop one raw sample from the FIFO, or `None` when empty.
    fn pop(&mut self) -> Option<u16>;
}

/// Monotonic time source.
///
/// Used for RailCom speed-report timestamps and the per-interrupt latency
/// metrics. On desktop this wraps `std::time::Instant`; on a board, a
/// free-running hardware timer.
pub trait Clock {
    /// Microseconds since an arbitrary epoch. Must be monotonic.
    fn now_us(&self) -> u64;
}
