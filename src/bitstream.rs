//! The DCC bit-stream engine.
//!
//! Emits a continuous stream of packets as bipolar square-wave bits through
//! a [`TrackDriver`]. The driver's PWM is double-buffered: everything
//! programmed during bit *N* takes effect at the start of bit *N+1*, so
//! [`Bitstream::next_bit`] runs once per bit-end interrupt and always
//! programs one bit ahead of the wire.
//!
//! The stream structure per packet is
//!
//! ```text
//! preamble (14 or 20 ones), 0, byte0, 0, byte1, 0, ..., byteN-1, 1
//! ```
//!
//! with an optional 4-bit-period RailCom cutout after the stop bit. The
//! cutout keeps power on for a quarter-bit, then off; the return-channel
//! UART is reset at cutout start and drained at cutout end, and the parsed
//! channel-2 messages are delivered to the throttle whose packet preceded
//! the cutout.
//!
//! The next packet is pulled from a [`PacketSource`] at the transition from
//! preamble to first data byte. The pull happens in interrupt context and
//! must neither allocate nor block; a source with nothing to say fills in
//! an idle packet.

use core::sync::atomic::{fence, Ordering};

use crate::packet::{DccPacket, OPS_PREAMBLE_BITS, SVC_PREAMBLE_BITS};
use crate::railcom::RailComReader;
use crate::throttle::ThrottleId;
use crate::trace::StationTrace;
use crate::traits::{Bit, RailComUart, TrackDriver, POWER_CUTOUT_START, POWER_FULL, POWER_OFF};

/// Cutout length in one-bit periods.
pub const CUTOUT_BITS: u8 = 4;

/// A packet queued for transmission, with the throttle that produced it.
///
/// The throttle reference is the correlation key for RailCom: the messages
/// received in the cutout after this packet belong to this throttle. A
/// stale reference (deleted throttle) resolves to nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackPacket {
    packet: DccPacket,
    throttle: Option<ThrottleId>,
}

impl TrackPacket {
    /// An idle track packet with no throttle correlation.
    pub fn idle() -> Self {
        TrackPacket {
            packet: DccPacket::idle(),
            throttle: None,
        }
    }

    /// Fill with a packet and optional throttle correlation.
    pub fn set(&mut self, packet: DccPacket, throttle: Option<ThrottleId>) {
        self.packet = packet;
        self.throttle = throttle;
    }

    /// Fill with an idle packet, clearing the correlation.
    pub fn set_idle(&mut self) {
        self.set(DccPacket::idle(), None);
    }

    /// Fill with a reset packet, clearing the correlation.
    pub fn set_reset(&mut self) {
        self.set(DccPacket::reset(), None);
    }

    /// The packet.
    pub fn packet(&self) -> &DccPacket {
        &self.packet
    }

    /// The producing throttle, if any.
    pub fn throttle(&self) -> Option<ThrottleId> {
        self.throttle
    }
}

/// What the source wants the stream to do after a pull.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullOutcome {
    /// Keep streaming; `out` holds the next packet.
    Packet,
    /// Shut the track down (service sequence finished).
    Off,
}

/// Supplies packets to the bitstream and consumes its return data.
///
/// Implemented by the scheduler. All three methods run in interrupt
/// context: no allocation, no blocking.
pub trait PacketSource {
    /// Fill `out` with the next packet to transmit.
    ///
    /// Must always leave `out` valid; with nothing to send, fill in an
    /// idle packet. Returning [`PullOutcome::Off`] stops the stream.
    fn pull_packet(&mut self, out: &mut TrackPacket) -> PullOutcome;

    /// Deliver parsed RailCom channel-2 messages to the throttle that sent
    /// the packet preceding the cutout.
    fn deliver_railcom(&mut self, to: ThrottleId, msgs: &[crate::railcom::RailComMsg], now_us: u64);

    /// Once-per-bit housekeeping (ADC drain, ack detection).
    fn poll(&mut self);
}

/// Where the stream is within the current packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    /// RailCom cutout; counts `CUTOUT_BITS` down to 0. At 0 the first
    /// preamble bit is programmed.
    Cutout { bits_left: u8 },
    /// Preamble ones; counts down to 0, then the packet start bit.
    Preamble { bits_left: usize },
    /// Packet data, MSB first. `bit` runs 7..=0, then -1 for the stop or
    /// byte-separator bit.
    Data { byte: usize, bit: i8 },
}

/// The bit-level transmit engine.
pub struct Bitstream<D: TrackDriver, U: RailComUart> {
    driver: D,
    railcom: RailComReader<U>,
    bufs: [TrackPacket; 2],
    cur: usize,
    segment: Segment,
    preamble_bits: usize,
    use_railcom: bool,
    running: bool,
    irq_on: bool,
    show_dcc: bool,
    show_railcom: bool,
}

impl<D: TrackDriver, U: RailComUart> Bitstream<D, U> {
    /// New stopped bitstream over a track driver and return-channel UART.
    pub fn new(driver: D, uart: U) -> Self {
        Bitstream {
            driver,
            railcom: RailComReader::new(uart),
            bufs: [TrackPacket::idle(), TrackPacket::idle()],
            cur: 0,
            segment: Segment::Preamble {
                bits_left: OPS_PREAMBLE_BITS,
            },
            preamble_bits: OPS_PREAMBLE_BITS,
            use_railcom: false,
            running: false,
            irq_on: false,
            show_dcc: false,
            show_railcom: false,
        }
    }

    /// Start streaming in operations mode (14-bit preamble).
    ///
    /// The stream opens on an idle packet; `railcom` enables the cutout.
    pub fn start_ops<S: PacketSource>(
        &mut self,
        railcom: bool,
        source: &mut S,
        trace: &StationTrace,
        now_us: u64,
    ) -> Result<(), D::Error> {
        self.bufs[self.cur].set_idle();
        self.start(OPS_PREAMBLE_BITS, railcom, source, trace, now_us)
    }

    /// Start streaming in service mode (20-bit preamble, no cutout).
    ///
    /// The stream opens on a reset packet.
    pub fn start_svc<S: PacketSource>(
        &mut self,
        source: &mut S,
        trace: &StationTrace,
        now_us: u64,
    ) -> Result<(), D::Error> {
        self.bufs[self.cur].set_reset();
        self.start(SVC_PREAMBLE_BITS, false, source, trace, now_us)
    }

    fn start<S: PacketSource>(
        &mut self,
        preamble_bits: usize,
        use_railcom: bool,
        source: &mut S,
        trace: &StationTrace,
        now_us: u64,
    ) -> Result<(), D::Error> {
        self.driver.begin()?;
        self.preamble_bits = preamble_bits;
        self.use_railcom = use_railcom;

        // first packet opens with a preamble, cutout or not
        self.segment = Segment::Preamble {
            bits_left: preamble_bits,
        };

        // program the first preamble bit, start the timer, then program the
        // second while the first is on the wire; from here the driver's bit
        // interrupt keeps the pipeline one bit ahead
        self.next_bit(source, trace, now_us);
        self.driver.run()?;
        self.next_bit(source, trace, now_us);

        self.running = true;
        self.set_bit_irq(true);
        Ok(())
    }

    /// Stop streaming: interrupt off, both channels to 0% duty.
    ///
    /// The timer keeps running so a subsequent start is glitch-free.
    pub fn stop(&mut self) -> Result<(), D::Error> {
        self.set_bit_irq(false);
        self.running = false;
        self.driver.stop()
    }

    /// True while the stream is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Gate the driver's bit interrupt, remembering the state for
    /// [`irq_on`](Self::irq_on).
    pub fn set_bit_irq(&mut self, enabled: bool) {
        self.irq_on = enabled;
        self.driver.set_bit_irq(enabled);
    }

    /// Current interrupt gate state.
    pub fn irq_on(&self) -> bool {
        self.irq_on
    }

    /// Trace every transmitted packet.
    pub fn set_show_dcc(&mut self, on: bool) {
        self.show_dcc = on;
    }

    /// Trace every received RailCom frame.
    pub fn set_show_railcom(&mut self, on: bool) {
        self.show_railcom = on;
    }

    /// The track driver, for embedders and tests.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// The RailCom reader, for embedders and tests.
    pub fn railcom_mut(&mut self) -> &mut RailComReader<U> {
        &mut self.railcom
    }

    /// Advance the stream by one bit. Called once per bit-end interrupt.
    ///
    /// A new bit has already started on the wire; everything programmed
    /// here affects the bit after it.
    pub fn next_bit<S: PacketSource>(
        &mut self,
        source: &mut S,
        trace: &StationTrace,
        now_us: u64,
    ) {
        match self.segment {
            Segment::Cutout { bits_left } => {
                if bits_left == CUTOUT_BITS {
                    // first cutout bit: power on for a quarter bit, then off
                    self.driver.program_bit(Bit::One, POWER_CUTOUT_START);
                    // reset the uart in case the power edge glitched it
                    self.railcom.reset();
                    self.segment = Segment::Cutout {
                        bits_left: bits_left - 1,
                    };
                } else if bits_left > 0 {
                    self.driver.program_bit(Bit::One, POWER_OFF);
                    self.segment = Segment::Cutout {
                        bits_left: bits_left - 1,
                    };
                } else {
                    // end of cutout: first bit of the next preamble
                    self.driver.program_bit(Bit::One, POWER_FULL);
                    self.segment = Segment::Preamble {
                        bits_left: self.preamble_bits - 1,
                    };
                }
            }

            Segment::Preamble { bits_left } => {
                if bits_left > 0 {
                    self.driver.program_bit(Bit::One, POWER_FULL);
                    if bits_left == self.preamble_bits - 1 {
                        // the previous packet (and its cutout) just ended
                        self.packet_boundary(source, trace, now_us);
                    }
                    self.segment = Segment::Preamble {
                        bits_left: bits_left - 1,
                    };
                } else {
                    // end of preamble: packet start bit, and fetch the
                    // packet whose bytes start next
                    self.driver.program_bit(Bit::Zero, POWER_FULL);
                    let next = 1 - self.cur;
                    let outcome = source.pull_packet(&mut self.bufs[next]);
                    // publish the freshly filled buffer before the swap
                    fence(Ordering::SeqCst);
                    self.cur = next;
                    if outcome == PullOutcome::Off {
                        let _ = self.stop();
                        return;
                    }
                    self.segment = Segment::Data { byte: 0, bit: 7 };
                }
            }

            Segment::Data { byte, bit } => {
                let len = self.bufs[self.cur].packet().len();
                debug_assert!(byte < len);
                if bit < 0 {
                    // a byte just finished: separator or message stop
                    if byte + 1 == len {
                        self.driver.program_bit(Bit::One, POWER_FULL);
                        if self.use_railcom {
                            self.segment = Segment::Cutout {
                                bits_left: CUTOUT_BITS,
                            };
                        } else {
                            // the stop bit counts as the first preamble bit
                            self.segment = Segment::Preamble {
                                bits_left: self.preamble_bits - 1,
                            };
                        }
                    } else {
                        self.driver.program_bit(Bit::Zero, POWER_FULL);
                        self.segment = Segment::Data {
                            byte: byte + 1,
                            bit: 7,
                        };
                    }
                } else {
                    let b = (self.bufs[self.cur].packet().data(byte) >> bit) & 1;
                    self.driver.program_bit(Bit::from_value(b), POWER_FULL);
                    self.segment = Segment::Data {
                        byte,
                        bit: bit - 1,
                    };
                }
            }
        }

        source.poll();
    }

    /// Runs on the first preamble bit: the previous packet is fully out
    /// and, with RailCom on, its cutout has just closed.
    fn packet_boundary<S: PacketSource>(
        &mut self,
        source: &mut S,
        trace: &StationTrace,
        now_us: u64,
    ) {
        if self.show_dcc {
            trace.push_args(format_args!(">> {}", self.bufs[self.cur].packet()));
        }
        if self.use_railcom {
            self.railcom.read();
            self.railcom.parse();
            if self.show_railcom {
                trace.push_args(format_args!("<< R {}", self.railcom.frame().show()));
            }
            // bufs[cur] still holds the packet the cutout answered
            if let Some(id) = self.bufs[self.cur].throttle() {
                let msgs = self.railcom.frame().ch2();
                if !msgs.is_empty() {
                    source.deliver_railcom(id, msgs, now_us);
                }
            }
        }
    }
}
