//! Error taxonomy.
//!
//! Errors are split by when they can occur: [`ConfigError`] before any
//! register traffic, [`HardwareError`] during it, and [`CalFailure`] for
//! chip-internal routines that ran but did not converge.

use std::ops::Range;

use crate::TrxDir;

/// A configuration request violates a documented hardware constraint.
///
/// These are always raised *before* any register write is attempted, so a
/// rejected configuration leaves the board untouched.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The requested tuning frequency is outside the synthesizer range.
    #[error("Tuning value ({val} Hz) out of range ({}..{} Hz)", .range.start, .range.end)]
    #[allow(missing_docs)]
    TuningRange { range: Range<f64>, val: f64 },

    /// The requested sample rate is zero or negative.
    #[error("Sample rate must be positive, got {0} Hz")]
    SampleRate(f64),

    /// The oversample factor is not in the supported set {0,1,2,4,8,16,32}.
    #[error("Oversample factor {0} is not 0 (auto), 1 (bypass), or a power of two up to 32")]
    Oversample(u8),

    /// The computed internal clock would exceed the chip's maximum.
    #[error("Internal clock {freq} Hz exceeds the chip maximum of {max} Hz")]
    #[allow(missing_docs)]
    ClockRange { freq: f64, max: f64 },

    /// Tx interpolation relative to Rx decimation is unsupported.
    #[error("Tx oversample ({tx}) / Rx oversample ({rx}) must be 1, 2, or 4")]
    #[allow(missing_docs)]
    OversampleRatio { tx: u8, rx: u8 },

    /// The path id is not in the legal set for this chip role and direction.
    #[error("{chip} has no {dir} path {path}")]
    #[allow(missing_docs)]
    InvalidPath { chip: &'static str, dir: TrxDir, path: u8 },

    /// Two channels sharing a synthesizer request different sample rates.
    #[error("Non-matching {dir} MIMO sample rates: {a} Hz vs {b} Hz")]
    #[allow(missing_docs)]
    MimoRateMismatch { dir: TrxDir, a: f64, b: f64 },

    /// Two channels sharing a synthesizer are tuned further apart than the
    /// digital NCO can bridge.
    #[error("{dir} MIMO LO offset of {offset} Hz exceeds the {max} Hz NCO reach")]
    #[allow(missing_docs)]
    MimoLoOffset { dir: TrxDir, offset: f64, max: f64 },
}

/// A control-channel transaction failed while applying a configuration.
///
/// Any of these immediately aborts the in-progress configuration sequence;
/// no retry is attempted. Partial hardware state may remain.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HardwareError {
    /// Underlying OS I/O error, including transport timeouts.
    #[error("control pipe I/O error")]
    Io(#[from] std::io::Error),

    /// The transport moved fewer bytes than a full command block.
    #[error("short control transfer: expected {expected} bytes, got {got}")]
    #[allow(missing_docs)]
    ShortTransfer { expected: usize, got: usize },

    /// The device answered a command with a non-success status code.
    #[error("device rejected command with status 0x{0:02x}")]
    Status(u8),

    /// A frequency synthesizer failed to report lock after programming.
    #[error("{0} PLL failed to lock")]
    PllNotLocked(&'static str),
}

/// A chip-internal calibration or filter-tuning routine reported failure.
///
/// One channel's failed calibration does not stop the remaining channels
/// from being configured; all failures for the request are collected and
/// surfaced together in [`Error::Calibration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalFailure {
    /// Direction of the signal chain being calibrated.
    pub dir: TrxDir,
    /// Channel index on the chip (0 or 1).
    pub channel: u8,
    /// Which routine failed.
    pub what: &'static str,
    /// Status code the chip reported.
    pub status: u8,
}

impl std::fmt::Display for CalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ch{} {} failed with status {}",
            self.dir, self.channel, self.what, self.status
        )
    }
}

/// An error from operating the board.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request was rejected before touching hardware.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A register transaction failed mid-sequence.
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    /// One or more channels failed their calibration routines.
    #[error("calibration failed on {} signal chain(s): {}", .0.len(),
        .0.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("; "))]
    Calibration(Vec<CalFailure>),
}
