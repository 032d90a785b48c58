//! Sample clock planning.
//!
//! The board derives every data-path clock of a transceiver slot from that
//! chip's internal clock generator (CGEN). Planning picks a CGEN frequency
//! plus halfband decimation/interpolation exponents so the converters run
//! at `4 x rate x oversample` while the host-facing interface runs at the
//! requested rate, then [`apply`] programs the chip and retunes the FPGA
//! sample interface to match.

use tracing::{debug, info};

use crate::error::{ConfigError, Error, HardwareError};
use crate::fpga::Fpga;
use crate::pipe::ControlPipe;
use crate::trx7::{regs, Trx7, TrxChannel, CGEN_MAX_HZ};

/// Above this rate automatic selection gives up on oversampling and runs
/// the converters at the interface rate with the halfbands bypassed. An
/// explicit ratio is still honored while CGEN stays in range.
pub const BYPASS_THRESHOLD_HZ: f64 = 62e6;

/// Halfband exponent value that bypasses the chain entirely.
const HB_BYPASS: u16 = 7;

/// Oversample ratios the halfband chain can realize.
const OVERSAMPLE_STEPS: [u8; 5] = [2, 4, 8, 16, 32];

/// Resolved clock plan for one transceiver slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockPlan {
    /// Internal clock generator frequency, Hz.
    pub cgen_hz: f64,
    /// Receive halfband decimation exponent, or 7 for bypass.
    pub decimation: u16,
    /// Transmit halfband interpolation exponent, or 7 for bypass.
    pub interpolation: u16,
    /// CGEN-to-converter clock divider select.
    pub clk_div: u16,
}

/// Host-facing rate of one halfband chain given its converter clock.
fn stage_rate(base_hz: f64, exponent: u16) -> f64 {
    if exponent == HB_BYPASS {
        base_hz
    } else {
        base_hz / (2u32 << exponent) as f64
    }
}

impl ClockPlan {
    /// Receive interface (host-facing) rate, Hz. The ADC always runs at a
    /// quarter of CGEN.
    pub fn rx_rate_hz(&self) -> f64 {
        stage_rate(self.cgen_hz / 4.0, self.decimation)
    }

    /// Transmit interface (host-facing) rate, Hz. The DAC clock is CGEN
    /// divided by the converter clock divider, which shrinks as the
    /// transmit ratio grows.
    pub fn tx_rate_hz(&self) -> f64 {
        stage_rate(self.cgen_hz / f64::from(1u16 << self.clk_div), self.interpolation)
    }
}

fn oversample_exponent(oversample: u8) -> Option<u16> {
    match oversample {
        2 => Some(0),
        4 => Some(1),
        8 => Some(2),
        16 => Some(3),
        32 => Some(4),
        _ => None,
    }
}

/// Pick the largest supported oversample that keeps CGEN within range.
fn auto_oversample(rate_hz: f64) -> u8 {
    let headroom = CGEN_MAX_HZ / (rate_hz * 4.0);
    OVERSAMPLE_STEPS
        .iter()
        .rev()
        .copied()
        .find(|&n| f64::from(n) <= headroom)
        .unwrap_or(OVERSAMPLE_STEPS[0])
}

/// Compute the clock plan for one slot.
///
/// An oversample of 0 lets the planner choose the highest ratio the clock
/// generator can support; 1 bypasses the halfband chain outright (only
/// valid when both directions agree). The transmit ratio may exceed the
/// receive ratio by at most 4x since both sides share one CGEN.
pub fn plan(rate_hz: f64, rx_oversample: u8, tx_oversample: u8) -> Result<ClockPlan, ConfigError> {
    if !(rate_hz > 0.0) {
        return Err(ConfigError::SampleRate(rate_hz));
    }

    // Past the bypass threshold auto-selection cannot oversample at all.
    // An explicit ratio is kept and checked against the CGEN limit below.
    let rx_os = if rx_oversample == 0 {
        if rate_hz > BYPASS_THRESHOLD_HZ {
            1
        } else {
            auto_oversample(rate_hz)
        }
    } else {
        rx_oversample
    };
    let tx_os = if tx_oversample == 0 { rx_os } else { tx_oversample };

    if rx_os == 1 || tx_os == 1 {
        if rx_os != tx_os {
            return Err(ConfigError::OversampleRatio { tx: tx_os, rx: rx_os });
        }
        let cgen_hz = rate_hz * 4.0;
        if cgen_hz > CGEN_MAX_HZ {
            return Err(ConfigError::ClockRange {
                freq: cgen_hz,
                max: CGEN_MAX_HZ,
            });
        }
        return Ok(ClockPlan {
            cgen_hz,
            decimation: HB_BYPASS,
            interpolation: HB_BYPASS,
            clk_div: 2,
        });
    }

    let dec = oversample_exponent(rx_os).ok_or(ConfigError::Oversample(rx_os))?;
    oversample_exponent(tx_os).ok_or(ConfigError::Oversample(tx_os))?;
    if tx_os < rx_os || tx_os / rx_os > 4 {
        return Err(ConfigError::OversampleRatio { tx: tx_os, rx: rx_os });
    }
    let ratio_log2 = (tx_os / rx_os).ilog2() as u16;
    let interp = dec + ratio_log2;

    let cgen_hz = rate_hz * 4.0 * f64::from(rx_os);
    if cgen_hz > CGEN_MAX_HZ {
        return Err(ConfigError::ClockRange {
            freq: cgen_hz,
            max: CGEN_MAX_HZ,
        });
    }

    Ok(ClockPlan {
        cgen_hz,
        decimation: dec,
        interpolation: interp,
        clk_div: 2 - ratio_log2,
    })
}

/// Program a resolved plan into one chip and the FPGA sample interface.
///
/// Writes the clock generator, the converter clock dividers, the halfband
/// exponents on both channel pages, retunes the FPGA interface PLLs and
/// finally pulses the chip logic reset so the sample interface restarts
/// clean.
pub(crate) fn apply<P: ControlPipe>(
    pipe: &mut P,
    subdevice: u8,
    ref_hz: f64,
    plan: &ClockPlan,
) -> Result<(), Error> {
    info!(
        cgen_mhz = plan.cgen_hz / 1e6,
        decimation = plan.decimation,
        interpolation = plan.interpolation,
        "applying clock plan"
    );
    {
        let mut chip = Trx7::new(pipe, subdevice);
        chip.set_cgen_frequency(plan.cgen_hz, ref_hz)?;
        chip.modify_field(regs::EN_ADCCLKH_CLKGN, 0)?;
        chip.modify_field(regs::CLKH_OV_CLKL_CGEN, plan.clk_div)?;
        for ch in [TrxChannel::B, TrxChannel::A] {
            chip.set_active_channel(ch)?;
            chip.modify_field(regs::HBD_OVR_RXTSP, plan.decimation)?;
            chip.modify_field(regs::HBI_OVR_TXTSP, plan.interpolation)?;
        }
    }
    {
        let mut fpga = Fpga::new(pipe);
        fpga.set_interface_freq(plan.tx_rate_hz(), plan.rx_rate_hz())?;
    }
    let mut chip = Trx7::new(pipe, subdevice);
    chip.reset_logic_registers()?;
    debug!(subdevice, "sample interface restarted");
    Ok(())
}

/// Read the effective host-facing sample rate back out of a chip.
pub(crate) fn read_back<P: ControlPipe>(
    pipe: &mut P,
    subdevice: u8,
    ref_hz: f64,
    dir: crate::TrxDir,
) -> Result<f64, HardwareError> {
    let mut chip = Trx7::new(pipe, subdevice);
    let cgen_hz = chip.cgen_frequency(ref_hz)?;
    match dir {
        crate::TrxDir::Rx => {
            let exponent = chip.read_field(regs::HBD_OVR_RXTSP)?;
            Ok(stage_rate(cgen_hz / 4.0, exponent))
        }
        crate::TrxDir::Tx => {
            let exponent = chip.read_field(regs::HBI_OVR_TXTSP)?;
            let clk_div = chip.read_field(regs::CLKH_OV_CLKL_CGEN)?;
            Ok(stage_rate(cgen_hz / f64::from(1u16 << clk_div), exponent))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::mock::MockPipe;

    #[test]
    fn auto_oversample_maximizes_within_cgen() {
        // 10 MS/s: 10e6 * 4 * 16 = 640 MHz fits exactly, 32 does not.
        let p = plan(10e6, 0, 0).unwrap();
        assert_eq!(p.decimation, 3);
        assert_eq!(p.interpolation, 3);
        assert!((p.cgen_hz - 640e6).abs() < 1.0);
        assert!((p.rx_rate_hz() - 10e6).abs() < 1e-3);
        assert!((p.tx_rate_hz() - 10e6).abs() < 1e-3);
    }

    #[test]
    fn plan_preserves_requested_rate() {
        for rate in [1e6, 2.5e6, 5e6, 15.36e6, 30.72e6, 61.44e6] {
            for os in [0u8, 2, 4, 8] {
                if f64::from(os.max(2)) * rate * 4.0 > CGEN_MAX_HZ {
                    continue;
                }
                let p = plan(rate, os, os).unwrap();
                assert!((p.rx_rate_hz() - rate).abs() < 1e-3, "rate {rate} os {os}");
                assert!((p.tx_rate_hz() - rate).abs() < 1e-3, "rate {rate} os {os}");
                assert!(p.cgen_hz <= CGEN_MAX_HZ);
            }
        }
    }

    #[test]
    fn high_rates_bypass_halfbands() {
        let p = plan(100e6, 0, 0).unwrap();
        assert_eq!(p.decimation, 7);
        assert_eq!(p.interpolation, 7);
        assert!((p.cgen_hz - 400e6).abs() < 1.0);
        assert!((p.rx_rate_hz() - 100e6).abs() < 1e-3);
    }

    #[test]
    fn explicit_oversample_survives_above_threshold() {
        // 70 MS/s x2 needs 560 MHz of CGEN, which is still in range; the
        // bypass shortcut only applies to auto-selection.
        let p = plan(70e6, 2, 2).unwrap();
        assert_eq!(p.decimation, 0);
        assert_eq!(p.interpolation, 0);
        assert!((p.cgen_hz - 560e6).abs() < 1.0);
        assert!((p.rx_rate_hz() - 70e6).abs() < 1e-3);
        assert!((p.tx_rate_hz() - 70e6).abs() < 1e-3);
        // x4 would push CGEN past its limit.
        assert!(matches!(
            plan(70e6, 4, 4),
            Err(ConfigError::ClockRange { .. })
        ));
    }

    #[test]
    fn explicit_bypass_requires_matching_directions() {
        let p = plan(20e6, 1, 1).unwrap();
        assert_eq!(p.decimation, 7);
        assert_eq!(p.clk_div, 2);
        assert!(matches!(
            plan(20e6, 1, 4),
            Err(ConfigError::OversampleRatio { .. })
        ));
    }

    #[test]
    fn tx_may_lead_rx_by_at_most_four() {
        let p = plan(5e6, 4, 16).unwrap();
        assert_eq!(p.decimation, 1);
        assert_eq!(p.interpolation, 3);
        assert_eq!(p.clk_div, 0);
        assert!((p.rx_rate_hz() - 5e6).abs() < 1e-3);
        assert!((p.tx_rate_hz() - 5e6).abs() < 1e-3);

        assert!(matches!(
            plan(5e6, 2, 16),
            Err(ConfigError::OversampleRatio { tx: 16, rx: 2 })
        ));
        assert!(matches!(
            plan(5e6, 8, 4),
            Err(ConfigError::OversampleRatio { tx: 4, rx: 8 })
        ));
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert!(matches!(plan(0.0, 0, 0), Err(ConfigError::SampleRate(_))));
        assert!(matches!(plan(-1e6, 0, 0), Err(ConfigError::SampleRate(_))));
        assert!(matches!(plan(10e6, 3, 3), Err(ConfigError::Oversample(3))));
        assert!(matches!(
            plan(40e6, 32, 32),
            Err(ConfigError::ClockRange { .. })
        ));
        assert!(matches!(
            plan(200e6, 0, 0),
            Err(ConfigError::ClockRange { .. })
        ));
    }

    #[test]
    fn apply_touches_chip_and_fpga_only_with_computed_values() {
        let mut pipe = MockPipe::new();
        let p = plan(10e6, 0, 0).unwrap();
        apply(&mut pipe, 0, 30.72e6, &p).unwrap();

        // Both channel pages carry the exponent.
        assert_eq!(pipe.reg(0, regs::HBD_OVR_RXTSP.addr) & 0b111, 3);
        assert_eq!(pipe.reg(0, regs::HBI_OVR_TXTSP.addr) & 0b111, 3);
        // Interface PLLs retuned to the host rate.
        let hz = crate::fpga::decode_rate(&pipe);
        assert!((hz.0 - 10e6).abs() < 1.0);
        assert!((hz.1 - 10e6).abs() < 1.0);
    }

    #[test]
    fn reapplying_same_plan_repeats_identical_writes() {
        let mut pipe = MockPipe::new();
        let p = plan(15.36e6, 4, 4).unwrap();
        // First application moves the chip out of its power-on state;
        // every one after that must journal the same register intent.
        apply(&mut pipe, 0, 30.72e6, &p).unwrap();
        pipe.journal.clear();
        apply(&mut pipe, 0, 30.72e6, &p).unwrap();
        let settled: Vec<_> = pipe.journal.clone();
        pipe.journal.clear();
        apply(&mut pipe, 0, 30.72e6, &p).unwrap();
        assert_eq!(settled, pipe.journal);
    }

    #[test]
    fn tx_readback_honors_clock_divider() {
        let mut pipe = MockPipe::new();
        let p = plan(5e6, 4, 16).unwrap();
        apply(&mut pipe, 0, 30.72e6, &p).unwrap();
        let rx = read_back(&mut pipe, 0, 30.72e6, crate::TrxDir::Rx).unwrap();
        let tx = read_back(&mut pipe, 0, 30.72e6, crate::TrxDir::Tx).unwrap();
        assert!((rx - 5e6).abs() < 1.0);
        assert!((tx - 5e6).abs() < 1.0);
    }
}
