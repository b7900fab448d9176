//! # rs-dcc
//!
//! The core of a Digital Command Control (DCC) command station: a
//! real-time controller that drives a model-railroad track with a
//! bit-exact bipolar DCC signal, multiplexes independent locomotive
//! throttles into a continuous packet stream, programs Configuration
//! Variables in both service mode (ack-current detection) and operations
//! mode (RailCom return channel), and parses RailCom cutout responses.
//!
//! ## Features
//!
//! - **Packet codec**: encode/decode for speed-128, function groups
//!   F0..F68, ops/service CV byte and bit access, idle and reset
//! - **Bitstream engine**: preamble / data / RailCom-cutout state machine
//!   driven one bit ahead of the wire by a periodic interrupt
//! - **Scheduler**: throttle round-robin in operations mode; the
//!   reset/command/reset programming engine with current-pulse ack
//!   detection in service mode
//! - **RailCom**: 4/8 symbol decoding, channel-1/channel-2 parsing, POM
//!   correlation back to the originating throttle
//! - **Interrupt-safe diagnostics**: lock-free trace ring drained from
//!   the main loop
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without hardware:
//!
//! - `traits` - track driver, RailCom UART, current ADC, and clock seams
//! - `hal` - mock implementations for desktop testing
//! - `packet` - DCC packet encoding and decoding
//! - `railcom` - return-channel decoding
//! - `bitstream` - the bit-level transmit engine
//! - `throttle` / `scheduler` - packet sources
//! - `station` - everything wired together behind the command API
//!
//! A board crate implements the four hardware traits against its
//! peripherals and calls [`CommandStation::on_bit_interrupt`] from its
//! PWM wrap interrupt; everything else is portable.
//!
//! ## Example
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
//! // run trains
//! station.set_mode_ops().unwrap();
//! let loco = station.create_throttle(3).unwrap();
//! station.set_speed(loco, 8).unwrap();
//! station.set_function(loco, 0, true).unwrap();
//!
//! // each bit-end interrupt advances the stream by one bit
//! for _ in 0..500 {
//!     station.on_bit_interrupt();
//! }
//!
//! // drain diagnostics from the main loop
//! while let Some(line) = station.drain_trace() {
//!     println!("{}", line.as_str());
//! }
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

extern crate alloc;

/// The bit-level transmit engine and packet hand-off.
pub mod bitstream;
/// Station configuration and the function cap.
pub mod config;
/// Track current sensing for ack detection.
pub mod current;
/// Crate error type.
pub mod error;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// DCC packet encoding and decoding.
pub mod packet;
/// RailCom return-channel decoding.
pub mod railcom;
/// Operations-mode and service-mode packet scheduling.
pub mod scheduler;
/// The command station composition root.
pub mod station;
/// Per-locomotive throttle state and packet rotation.
pub mod throttle;
/// Interrupt-safe diagnostic line buffer.
pub mod trace;
/// Core traits for hardware abstraction.
pub mod traits;

// Re-exports for convenience
pub use bitstream::{Bitstream, PacketSource, PullOutcome, TrackPacket};
pub use config::{FunctionCap, StationConfig};
pub use current::CurrentSensor;
pub use error::Error;
pub use packet::{DccPacket, FunctionGroup, PacketType};
pub use railcom::{RailComFrame, RailComMsg, RailComReader};
pub use scheduler::{Mode, Scheduler, SvcOutcome};
pub use station::{CommandStation, LatencyStats, StationStatus};
pub use throttle::{OpsOutcome, Throttle, ThrottleId, ThrottleSnapshot};
pub use trace::{StationTrace, TraceBuf, TraceLine};
pub use traits::{Bit, Clock, CurrentAdc, RailComUart, TrackDriver};
