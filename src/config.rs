//! Channel configuration and validation.
//!
//! A [`SdrConfig`] describes the desired state of one transceiver slot:
//! both channels, both directions. Validation is pure and complete before
//! any register is written, so a rejected configuration leaves hardware
//! untouched.

use crate::clockgen;
use crate::error::ConfigError;
use crate::path::ChipRole;
use crate::rate;
use crate::trx7::LO_RANGE;
use crate::TrxDir;

/// Requested state of one direction of one channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectionConfig {
    /// Whether this signal chain should be powered at all.
    pub enabled: bool,
    /// Local oscillator frequency, Hz.
    pub center_frequency: f64,
    /// Host-facing sample rate, Hz.
    pub sample_rate: f64,
    /// Converter oversample ratio; 0 picks the largest supported, 1
    /// bypasses the halfband chain.
    pub oversample: u8,
    /// Path code for this role and direction, see [`crate::path`].
    pub path: u8,
    /// Replace the antenna signal with the chip's internal test tone.
    pub test_signal: bool,
    /// Run DC/IQ calibration after the chain is up; value is the
    /// calibration bandwidth in Hz (0 skips).
    pub calibrate: f64,
    /// Analog low-pass corner in Hz (0 leaves the filter alone).
    pub lpf: f64,
    /// Enable the digital channel filter.
    pub gfir_enabled: bool,
    /// Digital filter bandwidth, Hz.
    pub gfir_bandwidth: f64,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        DirectionConfig {
            enabled: false,
            center_frequency: 0.0,
            sample_rate: 0.0,
            oversample: 0,
            path: 0,
            test_signal: false,
            calibrate: 0.0,
            lpf: 0.0,
            gfir_enabled: false,
            gfir_bandwidth: 0.0,
        }
    }
}

/// Requested state of one channel, both directions.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelConfig {
    /// Receive chain.
    pub rx: DirectionConfig,
    /// Transmit chain.
    pub tx: DirectionConfig,
}

impl ChannelConfig {
    pub(crate) fn dir(&self, dir: TrxDir) -> &DirectionConfig {
        match dir {
            TrxDir::Rx => &self.rx,
            TrxDir::Tx => &self.tx,
        }
    }
}

/// Complete requested state of one transceiver slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SdrConfig {
    /// Per-channel settings.
    pub channels: [ChannelConfig; 2],
    /// Board reference clock, Hz.
    pub reference_clock: f64,
    /// Skip reloading the baseline register tables. On by default when
    /// retuning a running slot.
    pub skip_defaults: bool,
}

impl Default for SdrConfig {
    fn default() -> Self {
        SdrConfig {
            channels: [ChannelConfig::default(); 2],
            reference_clock: 30.72e6,
            skip_defaults: false,
        }
    }
}

const VALID_OVERSAMPLE: [u8; 7] = [0, 1, 2, 4, 8, 16, 32];

fn validate_direction(cfg: &DirectionConfig, role: ChipRole, dir: TrxDir) -> Result<(), ConfigError> {
    if !cfg.enabled {
        return Ok(());
    }
    if !LO_RANGE.contains(&cfg.center_frequency) {
        return Err(ConfigError::TuningRange {
            range: LO_RANGE,
            val: cfg.center_frequency,
        });
    }
    if !(cfg.sample_rate > 0.0) {
        return Err(ConfigError::SampleRate(cfg.sample_rate));
    }
    if !VALID_OVERSAMPLE.contains(&cfg.oversample) {
        return Err(ConfigError::Oversample(cfg.oversample));
    }
    role.check_path(dir, cfg.path)
}

/// Check an entire slot configuration without touching hardware.
///
/// Beyond per-direction ranges this enforces the cross-channel rules: when
/// both channels run the same direction they must agree on sample rate, and
/// their oscillators may differ by at most half that rate since the second
/// channel is reached by digital mixing.
pub(crate) fn validate(cfg: &SdrConfig, role: ChipRole) -> Result<(), ConfigError> {
    for ch in &cfg.channels {
        for dir in [TrxDir::Rx, TrxDir::Tx] {
            validate_direction(ch.dir(dir), role, dir)?;
        }
    }

    for dir in [TrxDir::Rx, TrxDir::Tx] {
        let (a, b) = (cfg.channels[0].dir(dir), cfg.channels[1].dir(dir));
        if a.enabled && b.enabled {
            if a.sample_rate != b.sample_rate {
                return Err(ConfigError::MimoRateMismatch {
                    dir,
                    a: a.sample_rate,
                    b: b.sample_rate,
                });
            }
            let offset = (a.center_frequency - b.center_frequency).abs();
            let max = a.sample_rate / 2.0;
            if offset > max {
                return Err(ConfigError::MimoLoOffset { dir, offset, max });
            }
        }
    }

    // Resolve every requested clock now so an impossible rate is caught
    // before anything is written. The primary slot derives both interface
    // clocks from one generator; the other slots draw per-chain converter
    // clocks from the distribution chip.
    match role {
        ChipRole::Primary => {
            let rx = active_dir(cfg, TrxDir::Rx);
            let tx = active_dir(cfg, TrxDir::Tx);
            if rx.is_some() || tx.is_some() {
                let rate = rx.or(tx).map(|d| d.sample_rate).unwrap_or(0.0);
                let rx_os = rx.map(|d| d.oversample).unwrap_or(0);
                let tx_os = tx.map(|d| d.oversample).unwrap_or(0);
                rate::plan(rate, rx_os, tx_os)?;
            }
        }
        ChipRole::Duplex | ChipRole::Monitor => {
            for ch in &cfg.channels {
                if ch.rx.enabled {
                    clockgen::check_rate(ch.rx.sample_rate)?;
                }
            }
            if role == ChipRole::Duplex {
                if let Some(tx) = active_dir(cfg, TrxDir::Tx) {
                    let factor = f64::from(clockgen::dac_factor(tx.oversample));
                    clockgen::check_rate(tx.sample_rate * factor)?;
                }
            }
        }
    }
    Ok(())
}

/// First enabled direction config for `dir`, if any channel uses it.
pub(crate) fn active_dir(cfg: &SdrConfig, dir: TrxDir) -> Option<&DirectionConfig> {
    cfg.channels.iter().map(|ch| ch.dir(dir)).find(|d| d.enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{duplex_rx, primary_rx};

    fn rx_at(freq: f64, rate: f64) -> DirectionConfig {
        DirectionConfig {
            enabled: true,
            center_frequency: freq,
            sample_rate: rate,
            path: primary_rx::LNAH,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_directions_are_not_checked() {
        let cfg = SdrConfig::default();
        assert!(validate(&cfg, ChipRole::Primary).is_ok());

        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx.center_frequency = 999e9; // ignored while disabled
        assert!(validate(&cfg, ChipRole::Primary).is_ok());
    }

    #[test]
    fn frequency_and_rate_ranges() {
        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx = rx_at(2.4e9, 10e6);
        assert!(validate(&cfg, ChipRole::Primary).is_ok());

        cfg.channels[0].rx.center_frequency = 20e9;
        assert!(matches!(
            validate(&cfg, ChipRole::Primary),
            Err(ConfigError::TuningRange { .. })
        ));

        cfg.channels[0].rx.center_frequency = 2.4e9;
        cfg.channels[0].rx.sample_rate = 0.0;
        assert!(matches!(
            validate(&cfg, ChipRole::Primary),
            Err(ConfigError::SampleRate(_))
        ));
    }

    #[test]
    fn path_codes_are_role_specific() {
        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx = rx_at(1e9, 5e6);
        cfg.channels[0].rx.path = duplex_rx::CALIBRATION; // code 3
        assert!(validate(&cfg, ChipRole::Duplex).is_ok());
        assert!(matches!(
            validate(&cfg, ChipRole::Primary),
            Err(ConfigError::InvalidPath { .. })
        ));
    }

    #[test]
    fn mimo_channels_must_share_a_rate() {
        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx = rx_at(1e9, 10e6);
        cfg.channels[1].rx = rx_at(1e9, 20e6);
        assert!(matches!(
            validate(&cfg, ChipRole::Primary),
            Err(ConfigError::MimoRateMismatch { .. })
        ));
    }

    #[test]
    fn mimo_lo_offset_limited_to_half_rate() {
        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx = rx_at(1.000e9, 10e6);
        cfg.channels[1].rx = rx_at(1.004e9, 10e6);
        assert!(validate(&cfg, ChipRole::Primary).is_ok());

        cfg.channels[1].rx.center_frequency = 1.006e9;
        assert!(matches!(
            validate(&cfg, ChipRole::Primary),
            Err(ConfigError::MimoLoOffset { .. })
        ));
    }

    #[test]
    fn primary_rate_plan_resolved_during_validation() {
        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx = rx_at(1e9, 10e6);
        cfg.channels[0].rx.oversample = 8;
        cfg.channels[0].tx = rx_at(1e9, 10e6);
        cfg.channels[0].tx.path = 1;
        cfg.channels[0].tx.oversample = 2; // tx below rx: impossible
        assert!(matches!(
            validate(&cfg, ChipRole::Primary),
            Err(ConfigError::OversampleRatio { .. })
        ));
    }

    #[test]
    fn external_slot_rates_checked_against_distribution_clock() {
        // 5 GS/s is beyond any divider of the 2.4576 GHz VCO.
        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx = rx_at(1e9, 5e9);
        cfg.channels[0].rx.path = duplex_rx::FDD;
        assert!(matches!(
            validate(&cfg, ChipRole::Duplex),
            Err(ConfigError::ClockRange { .. })
        ));
        assert!(matches!(
            validate(&cfg, ChipRole::Monitor),
            Err(ConfigError::ClockRange { .. })
        ));

        // The duplex DAC runs at twice the interface rate; a rate that
        // fits alone can still overrun once doubled.
        let mut cfg = SdrConfig::default();
        cfg.channels[0].tx = rx_at(1e9, 3e9);
        cfg.channels[0].tx.path = 1;
        assert!(matches!(
            validate(&cfg, ChipRole::Duplex),
            Err(ConfigError::ClockRange { .. })
        ));
    }

    #[test]
    fn oversample_membership() {
        let mut cfg = SdrConfig::default();
        cfg.channels[0].rx = rx_at(1e9, 10e6);
        cfg.channels[0].rx.oversample = 3;
        assert!(matches!(
            validate(&cfg, ChipRole::Primary),
            Err(ConfigError::Oversample(3))
        ));
    }
}
