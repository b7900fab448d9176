//! Hardware Abstraction Layer implementations.
//!
//! This module contains concrete implementations of the traits defined in
//! [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `mock`: test implementations for desktop development. Board
//!   implementations (PWM slice + UART + ADC on an RP2040 or similar) live
//!   in the depending binary crate, next to its pin mapping.

pub mod mock;

pub use mock::*;
