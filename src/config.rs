//! Station configuration.
//!
//! Construction-time knobs gathered into [`StationConfig`], builder-style.
//!
//! # Example
//!
//! ```rust
//! use rs_dcc::config::{FunctionCap, StationConfig};
//!
//! let config = StationConfig::default()
//!     .with_function_cap(FunctionCap::F68)
//!     .with_railcom(true);
//! assert_eq!(config.function_cap.group_count(), 10);
//! ```

use crate::packet::FunctionGroup;

/// Highest function number a throttle carries packets for.
///
/// Selects the compiled-in group count: a throttle's rotation length and
/// function-packet array size derive from this. Most decoders stop at F28;
/// sound decoders go further.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionCap {
    /// F0..F8 (2 groups).
    F8,
    /// F0..F12 (3 groups).
    F12,
    /// F0..F20 (4 groups).
    F20,
    /// F0..F28 (5 groups).
    F28,
    /// F0..F36 (6 groups).
    F36,
    /// F0..F44 (7 groups).
    F44,
    /// F0..F52 (8 groups).
    F52,
    /// F0..F60 (9 groups).
    F60,
    /// F0..F68 (10 groups).
    F68,
}

impl Default for FunctionCap {
    fn default() -> Self {
        FunctionCap::F28
    }
}

impl FunctionCap {
    /// Number of function groups at this cap.
    pub const fn group_count(self) -> usize {
        match self {
            FunctionCap::F8 => 2,
            FunctionCap::F12 => 3,
            FunctionCap::F20 => 4,
            FunctionCap::F28 => 5,
            FunctionCap::F36 => 6,
            FunctionCap::F44 => 7,
            FunctionCap::F52 => 8,
            FunctionCap::F60 => 9,
            FunctionCap::F68 => 10,
        }
    }

    /// Highest function number at this cap.
    pub const fn max_function(self) -> u8 {
        match self {
            FunctionCap::F8 => 8,
            FunctionCap::F12 => 12,
            FunctionCap::F20 => 20,
            FunctionCap::F28 => 28,
            FunctionCap::F36 => 36,
            FunctionCap::F44 => 44,
            FunctionCap::F52 => 52,
            FunctionCap::F60 => 60,
            FunctionCap::F68 => 68,
        }
    }

    /// The function groups at this cap, in rotation order.
    pub fn groups(self) -> &'static [FunctionGroup] {
        &FunctionGroup::ALL[..self.group_count()]
    }
}

/// Complete station configuration.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationConfig {
    /// Highest function number throttles carry packets for.
    pub function_cap: FunctionCap,
    /// Emit RailCom cutouts in operations mode.
    pub railcom: bool,
    /// Ack threshold margin over the long-average baseline, in milliamps.
    pub ack_inc_ma: u16,
    /// Reset packets opening a service sequence.
    pub svc_reset1_cnt: usize,
    /// Repetitions of each service command packet.
    pub svc_command_cnt: usize,
    /// Reset packets closing each service command block.
    pub svc_reset2_cnt: usize,
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            function_cap: FunctionCap::default(),
            railcom: true,
            ack_inc_ma: 60,
            svc_reset1_cnt: 20,
            svc_command_cnt: 5,
            svc_reset2_cnt: 5,
        }
    }
}

impl StationConfig {
    /// Set the function cap.
    pub fn with_function_cap(mut self, cap: FunctionCap) -> Self {
        self.function_cap = cap;
        self
    }

    /// Enable or disable RailCom cutouts in operations mode.
    pub fn with_railcom(mut self, railcom: bool) -> Self {
        self.railcom = railcom;
        self
    }

    /// Set the ack threshold margin in milliamps.
    pub fn with_ack_inc_ma(mut self, ma: u16) -> Self {
        self.ack_inc_ma = ma;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StationConfig::default();
        assert_eq!(config.function_cap, FunctionCap::F28);
        assert!(config.railcom);
        assert_eq!(config.ack_inc_ma, 60);
        assert_eq!(config.svc_reset1_cnt, 20);
        assert_eq!(config.svc_command_cnt, 5);
        assert_eq!(config.svc_reset2_cnt, 5);
    }

    #[test]
    fn caps_cover_their_groups() {
        for cap in [
            FunctionCap::F8,
            FunctionCap::F12,
            FunctionCap::F20,
            FunctionCap::F28,
            FunctionCap::F36,
            FunctionCap::F44,
            FunctionCap::F52,
            FunctionCap::F60,
            FunctionCap::F68,
        ] {
            let groups = cap.groups();
            assert_eq!(groups.len(), cap.group_count());
            assert_eq!(groups.last().unwrap().last(), cap.max_function());
        }
    }

    #[test]
    fn builder_chains() {
        let config = StationConfig::default()
            .with_function_cap(FunctionCap::F8)
            .with_railcom(false)
            .with_ack_inc_ma(80);
        assert_eq!(config.function_cap, FunctionCap::F8);
        assert!(!config.railcom);
        assert_eq!(config.ack_inc_ma, 80);
    }
}
