//! Board clock-distribution chip.
//!
//! The duplex and monitor slots run their converters off a dedicated
//! clock-distribution chip instead of the TRX7's internal generator. Its
//! register file is bridged through the FPGA control subdevice: one PLL
//! locked to the board reference feeds per-output integer dividers.

use tracing::{debug, info};

use crate::error::{ConfigError, Error, HardwareError};
use crate::pipe::{ControlPipe, SpiPort, SUBDEV_FPGA};

/// Board reference the distribution chip locks to, Hz.
pub(crate) const REF_HZ: f64 = 30.72e6;

/// PLL multiple of the board reference. 30.72 MHz references yield a
/// 2.4576 GHz VCO.
const VCO_MULT: f64 = 80.0;

/// Pick the integer divider producing the closest achievable frequency.
fn plan_divider(vco_hz: f64, freq_hz: f64) -> Result<u16, ConfigError> {
    let div = (vco_hz / freq_hz).round();
    if (1.0..=f64::from(u16::MAX)).contains(&div) {
        Ok(div as u16)
    } else {
        Err(ConfigError::ClockRange {
            freq: freq_hz,
            max: vco_hz,
        })
    }
}

/// Check a converter clock against the board-reference VCO without
/// touching the hardware. Used to reject a configuration before any
/// register is written.
pub(crate) fn check_rate(freq_hz: f64) -> Result<(), ConfigError> {
    plan_divider(REF_HZ * VCO_MULT, freq_hz).map(|_| ())
}

/// DAC clock multiple the duplex slot needs for an oversample setting.
/// The equalizer in front of the external DACs always interpolates by
/// two unless the halfbands are bypassed outright.
pub(crate) fn dac_factor(oversample: u8) -> u16 {
    if oversample == 1 { 1 } else { 2 }
}

const REG_CTRL: u16 = 0x0120;
const REG_DIV_BASE: u16 = 0x0121;
/// Lock indicator, bit 0.
pub(crate) const REG_STATUS: u16 = 0x0128;

const CTRL_RESET: u16 = 1 << 0;
const CTRL_SYNC: u16 = 1 << 1;

/// Clock outputs of the distribution chip, as wired on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClkOutput {
    /// Shared DAC clock of the duplex slot (both channels).
    DuplexTx,
    /// Duplex slot ADC clock, channel A.
    DuplexRxA,
    /// Duplex slot ADC clock, channel B.
    DuplexRxB,
    /// Monitor slot ADC clock, channel A.
    MonitorRxA,
    /// Monitor slot ADC clock, channel B.
    MonitorRxB,
}

impl ClkOutput {
    fn divider_reg(self) -> u16 {
        let idx = match self {
            ClkOutput::DuplexTx => 0,
            ClkOutput::DuplexRxA => 1,
            ClkOutput::DuplexRxB => 2,
            ClkOutput::MonitorRxA => 3,
            ClkOutput::MonitorRxB => 4,
        };
        REG_DIV_BASE + idx
    }
}

/// Driver handle, borrowed per operation like the chip drivers.
pub(crate) struct ClockGen<'a, P> {
    spi: SpiPort<'a, P>,
    vco_hz: f64,
}

impl<'a, P: ControlPipe> ClockGen<'a, P> {
    pub(crate) fn new(pipe: &'a mut P, ref_hz: f64) -> Self {
        ClockGen {
            spi: SpiPort::new(pipe, SUBDEV_FPGA),
            vco_hz: ref_hz * VCO_MULT,
        }
    }

    /// Reset the chip, relock the PLL to the reference and resync outputs.
    pub(crate) fn reset(&mut self) -> Result<(), Error> {
        info!(vco_ghz = self.vco_hz / 1e9, "resetting clock distribution");
        self.spi.write_reg(REG_CTRL, CTRL_RESET)?;
        self.spi.write_reg(REG_CTRL, CTRL_SYNC)?;
        if !self.is_locked()? {
            return Err(HardwareError::PllNotLocked("clock distribution").into());
        }
        Ok(())
    }

    pub(crate) fn is_locked(&mut self) -> Result<bool, HardwareError> {
        Ok(self.spi.read_reg(REG_STATUS)? & 1 != 0)
    }

    /// Program one output divider for the closest achievable frequency.
    pub(crate) fn set_frequency(
        &mut self,
        out: ClkOutput,
        freq_hz: f64,
        check_lock: bool,
    ) -> Result<(), Error> {
        let div = plan_divider(self.vco_hz, freq_hz)?;
        debug!(?out, freq_mhz = freq_hz / 1e6, div, "setting clock output");
        self.spi.write_reg(out.divider_reg(), div)?;
        if check_lock && !self.is_locked()? {
            return Err(HardwareError::PllNotLocked("clock distribution").into());
        }
        Ok(())
    }

    /// Read back the frequency one output is currently producing.
    pub(crate) fn frequency(&mut self, out: ClkOutput) -> Result<f64, HardwareError> {
        let div = self.spi.read_reg(out.divider_reg())?;
        if div == 0 {
            return Ok(0.0);
        }
        Ok(self.vco_hz / f64::from(div))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::mock::MockPipe;

    #[test]
    fn divider_roundtrip() {
        let mut pipe = MockPipe::new();
        let mut cgen = ClockGen::new(&mut pipe, 30.72e6);
        cgen.set_frequency(ClkOutput::DuplexRxA, 122.88e6, true).unwrap();
        let f = cgen.frequency(ClkOutput::DuplexRxA).unwrap();
        assert!((f - 122.88e6).abs() < 1.0, "got {f}");
        // 2.4576 GHz / 122.88 MHz = 20 exactly.
        assert_eq!(pipe.reg(SUBDEV_FPGA, ClkOutput::DuplexRxA.divider_reg()), 20);
    }

    #[test]
    fn outputs_are_independent() {
        let mut pipe = MockPipe::new();
        let mut cgen = ClockGen::new(&mut pipe, 30.72e6);
        cgen.set_frequency(ClkOutput::MonitorRxA, 61.44e6, false).unwrap();
        cgen.set_frequency(ClkOutput::MonitorRxB, 30.72e6, false).unwrap();
        assert!((cgen.frequency(ClkOutput::MonitorRxA).unwrap() - 61.44e6).abs() < 1.0);
        assert!((cgen.frequency(ClkOutput::MonitorRxB).unwrap() - 30.72e6).abs() < 1.0);
    }

    #[test]
    fn rejects_frequencies_beyond_vco() {
        let mut pipe = MockPipe::new();
        let mut cgen = ClockGen::new(&mut pipe, 30.72e6);
        let err = cgen
            .set_frequency(ClkOutput::DuplexTx, 5e9, false)
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ClockRange { .. })));
        assert!(pipe.writes_to(SUBDEV_FPGA).is_empty());
    }

    #[test]
    fn rate_check_matches_divider_range() {
        assert!(check_rate(122.88e6).is_ok());
        // Divider of 1: the full VCO.
        assert!(check_rate(2.4576e9).is_ok());
        assert!(matches!(
            check_rate(5e9),
            Err(ConfigError::ClockRange { .. })
        ));
        // Below VCO / 65535 no divider reaches the frequency.
        assert!(matches!(
            check_rate(30e3),
            Err(ConfigError::ClockRange { .. })
        ));
    }

    #[test]
    fn dac_clock_doubles_except_in_bypass() {
        assert_eq!(dac_factor(1), 1);
        assert_eq!(dac_factor(0), 2);
        assert_eq!(dac_factor(2), 2);
        assert_eq!(dac_factor(8), 2);
    }

    #[test]
    fn lock_loss_is_surfaced() {
        let mut pipe = MockPipe::new();
        pipe.set_reg(SUBDEV_FPGA, REG_STATUS, 0);
        let mut cgen = ClockGen::new(&mut pipe, 30.72e6);
        let err = cgen
            .set_frequency(ClkOutput::DuplexTx, 122.88e6, true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Hardware(HardwareError::PllNotLocked(_))
        ));
    }
}
