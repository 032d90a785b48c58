//! Driver for one TRX7 transceiver chip instance.
//!
//! The TRX7 is a 2x2 analog/digital front end: two receive and two transmit
//! chains share one internal clock generator (CGEN) and a pair of fractional
//! synthesizers (SXR for receive, SXT for transmit). Registers above 0x0100
//! are paged per channel; the active page is selected through the `MAC`
//! field. Everything here goes through the register facade in [`crate::pipe`],
//! one chip per control subdevice.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{ConfigError, Error, HardwareError};
use crate::pipe::{ControlPipe, SpiPort};
use crate::TrxDir;

/// A named bit field inside a chip register.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Field {
    pub addr: u16,
    pub msb: u8,
    pub lsb: u8,
}

impl Field {
    pub(crate) const fn new(addr: u16, msb: u8, lsb: u8) -> Self {
        Field { addr, msb, lsb }
    }

    pub(crate) fn mask(&self) -> u16 {
        (((1u32 << (self.msb - self.lsb + 1)) - 1) as u16) << self.lsb
    }
}

/// Register map of the fields this crate touches.
pub(crate) mod regs {
    use super::Field;

    // Global control page.
    pub(crate) const MAC: Field = Field::new(0x0020, 1, 0);
    pub(crate) const RXEN_A: Field = Field::new(0x0020, 2, 2);
    pub(crate) const TXEN_A: Field = Field::new(0x0020, 3, 3);
    pub(crate) const RXEN_B: Field = Field::new(0x0020, 4, 4);
    pub(crate) const TXEN_B: Field = Field::new(0x0020, 5, 5);
    pub(crate) const LRST: Field = Field::new(0x0020, 9, 6);
    pub(crate) const SRST: Field = Field::new(0x0020, 15, 15);

    // Analog front end (ADC/DAC) power.
    pub(crate) const AFE: u16 = 0x0082;
    pub(crate) const PD_RX_AFE1: Field = Field::new(AFE, 0, 0);
    pub(crate) const PD_TX_AFE1: Field = Field::new(AFE, 1, 1);
    pub(crate) const PD_RX_AFE2: Field = Field::new(AFE, 2, 2);
    pub(crate) const PD_TX_AFE2: Field = Field::new(AFE, 3, 3);
    pub(crate) const AFE_POWERED_DOWN: u16 = 0x803E;

    // Internal clock generator.
    pub(crate) const CGEN_INT: Field = Field::new(0x0086, 9, 0);
    pub(crate) const CGEN_FRAC_LSB: Field = Field::new(0x0087, 15, 0);
    pub(crate) const CGEN_FRAC_MSB: Field = Field::new(0x0088, 3, 0);
    pub(crate) const CGEN_DIV: Field = Field::new(0x0088, 6, 4);
    pub(crate) const EN_ADCCLKH_CLKGN: Field = Field::new(0x0089, 0, 0);
    pub(crate) const CLKH_OV_CLKL_CGEN: Field = Field::new(0x0089, 2, 1);
    pub(crate) const CGEN_STATUS: u16 = 0x008C;
    pub(crate) const CGEN_LOCKED: Field = Field::new(CGEN_STATUS, 1, 0);

    // Transmit RF frontend (per channel page).
    pub(crate) const EN_DIR_TRF: Field = Field::new(0x0100, 14, 14);
    pub(crate) const EN_G_TRF: Field = Field::new(0x0100, 15, 15);
    pub(crate) const PD_TXPAD_TRF: Field = Field::new(0x0100, 0, 0);
    pub(crate) const PD_TLOBUF_TRF: Field = Field::new(0x0100, 1, 1);
    pub(crate) const EN_NEXTTX_TRF: Field = Field::new(0x0101, 0, 0);
    pub(crate) const SEL_BAND_TRF: Field = Field::new(0x0103, 1, 0);

    // Transmit baseband (per channel page).
    pub(crate) const EN_DIR_TBB: Field = Field::new(0x0105, 14, 14);
    pub(crate) const EN_G_TBB: Field = Field::new(0x0105, 15, 15);
    pub(crate) const PD_LPFIAMP_TBB: Field = Field::new(0x0105, 0, 0);
    pub(crate) const TSTIN_TBB: Field = Field::new(0x0105, 3, 2);

    // Receive RF frontend (per channel page).
    pub(crate) const EN_DIR_RFE: Field = Field::new(0x010C, 14, 14);
    pub(crate) const EN_G_RFE: Field = Field::new(0x010C, 15, 15);
    pub(crate) const PD_LNA_RFE: Field = Field::new(0x010C, 0, 0);
    pub(crate) const PD_TIA_RFE: Field = Field::new(0x010C, 1, 1);
    pub(crate) const PD_QGEN_RFE: Field = Field::new(0x010C, 2, 2);
    pub(crate) const PD_MXLOBUF_RFE: Field = Field::new(0x010C, 3, 3);
    pub(crate) const SEL_PATH_RFE: Field = Field::new(0x010D, 1, 0);
    pub(crate) const EN_NEXTRX_RFE: Field = Field::new(0x010D, 3, 3);

    // Receive baseband (per channel page).
    pub(crate) const EN_DIR_RBB: Field = Field::new(0x0115, 14, 14);
    pub(crate) const EN_G_RBB: Field = Field::new(0x0115, 15, 15);
    pub(crate) const PD_PGA_RBB: Field = Field::new(0x0115, 0, 0);
    pub(crate) const PD_LPFL_RBB: Field = Field::new(0x0115, 1, 1);
    pub(crate) const OSW_PGA_RBB: Field = Field::new(0x0115, 2, 2);

    // Synthesizer page (selected via MAC, SXR on page A, SXT on page B).
    pub(crate) const SX_INT: Field = Field::new(0x0120, 9, 0);
    pub(crate) const SX_FRAC_LSB: Field = Field::new(0x0121, 15, 0);
    pub(crate) const SX_FRAC_MSB: Field = Field::new(0x0122, 3, 0);
    pub(crate) const SX_DIV_LOCH: Field = Field::new(0x0122, 6, 4);
    pub(crate) const SX_TDD_EN: Field = Field::new(0x0122, 14, 14);
    pub(crate) const SX_EN: Field = Field::new(0x0122, 15, 15);
    pub(crate) const SX_STATUS: u16 = 0x0123;
    pub(crate) const SX_LOCKED: Field = Field::new(SX_STATUS, 1, 0);
    pub(crate) const EN_DIR_SX: Field = Field::new(0x0124, 14, 14);

    // Transmit signal path (per channel page).
    pub(crate) const EN_TXTSP: Field = Field::new(0x0200, 0, 0);
    pub(crate) const INSEL_TXTSP: Field = Field::new(0x0200, 2, 2);
    pub(crate) const HBI_OVR_TXTSP: Field = Field::new(0x0203, 2, 0);
    pub(crate) const GFIR_EN_TXTSP: Field = Field::new(0x0204, 0, 0);
    pub(crate) const GFIR_BW_TXTSP: Field = Field::new(0x0204, 3, 1);

    // Receive signal path (per channel page).
    pub(crate) const EN_RXTSP: Field = Field::new(0x0400, 0, 0);
    pub(crate) const INSEL_RXTSP: Field = Field::new(0x0400, 2, 2);
    pub(crate) const TSGMODE_RXTSP: Field = Field::new(0x0400, 3, 3);
    pub(crate) const TSGFC_RXTSP: Field = Field::new(0x0400, 9, 9);
    pub(crate) const HBD_OVR_RXTSP: Field = Field::new(0x0403, 2, 0);
    pub(crate) const GFIR_EN_RXTSP: Field = Field::new(0x0404, 0, 0);
    pub(crate) const GFIR_BW_RXTSP: Field = Field::new(0x0404, 3, 1);
    pub(crate) const RXTSP_CFG: u16 = 0x040C;
    pub(crate) const RXTSP_BYPASS_ALL: u16 = 0x01FF;

    // Calibration engine (per channel page).
    pub(crate) const CAL_BW: Field = Field::new(0x05C0, 11, 0);
    pub(crate) const CAL_START_RX: Field = Field::new(0x05C1, 0, 0);
    pub(crate) const CAL_START_TX: Field = Field::new(0x05C1, 1, 1);
    pub(crate) const LPF_BW: Field = Field::new(0x05C3, 11, 0);
    pub(crate) const LPF_START_RX: Field = Field::new(0x05C4, 0, 0);
    pub(crate) const LPF_START_TX: Field = Field::new(0x05C4, 1, 1);
    pub(crate) const CAL_STATUS: u16 = 0x05C2;
    pub(crate) const CAL_BUSY: Field = Field::new(CAL_STATUS, 15, 15);
    pub(crate) const CAL_CODE: Field = Field::new(CAL_STATUS, 3, 0);
}

/// Maximum internal clock (CGEN) frequency, Hz.
pub const CGEN_MAX_HZ: f64 = 640e6;

/// Synthesizer LO range, Hz.
pub const LO_RANGE: std::ops::Range<f64> = 30e6..3.8e9;

const SX_VCO_RANGE: std::ops::Range<f64> = 3.8e9..7.7e9;
const CGEN_VCO_RANGE: std::ops::Range<f64> = 1.3e9..2.6e9;
const MAX_VCO_DIV: u8 = 7;
const FRAC_ONE: f64 = (1u32 << 20) as f64;

const CAL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Logical sub-channel context of the chip register file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TrxChannel {
    A,
    B,
    /// Broadcast writes to both channel pages.
    Both,
    /// Receive synthesizer page.
    SxR,
    /// Transmit synthesizer page.
    SxT,
}

impl TrxChannel {
    fn mac(self) -> u16 {
        match self {
            TrxChannel::A | TrxChannel::SxR => 1,
            TrxChannel::B | TrxChannel::SxT => 2,
            TrxChannel::Both => 3,
        }
    }

    pub(crate) fn from_index(ch: u8) -> Self {
        if ch == 0 { TrxChannel::A } else { TrxChannel::B }
    }
}

/// Outcome of a chip-internal calibration routine. Zero means success.
pub(crate) struct CalOutcome(pub u8);

/// Fractional-N plan for one synthesizer or the clock generator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SynthPlan {
    pub int: u16,
    pub frac: u32,
    pub div: u8,
}

/// Pick the VCO octave divider and fractional-N words for `freq_hz`.
///
/// The output is `vco / 2^(div+1)`; the smallest divider that lifts the VCO
/// into its supported band is used.
pub(crate) fn synth_plan(
    freq_hz: f64,
    ref_hz: f64,
    vco: &std::ops::Range<f64>,
) -> Result<SynthPlan, ConfigError> {
    let mut div = 0u8;
    let mut vco_hz = freq_hz * 2.0;
    while vco_hz < vco.start && div < MAX_VCO_DIV {
        vco_hz *= 2.0;
        div += 1;
    }
    if !vco.contains(&vco_hz) {
        return Err(ConfigError::TuningRange {
            range: LO_RANGE,
            val: freq_hz,
        });
    }
    let n = vco_hz / ref_hz;
    let int = n as u16;
    let frac = ((n - int as f64) * FRAC_ONE).round() as u32;
    Ok(SynthPlan { int, frac, div })
}

/// One TRX7 chip, borrowed from the board for the duration of an operation.
pub(crate) struct Trx7<'a, P> {
    spi: SpiPort<'a, P>,
}

impl<'a, P: ControlPipe> Trx7<'a, P> {
    pub(crate) fn new(pipe: &'a mut P, subdevice: u8) -> Self {
        Trx7 {
            spi: SpiPort::new(pipe, subdevice),
        }
    }

    pub(crate) fn write_reg(&mut self, addr: u16, value: u16) -> Result<(), HardwareError> {
        self.spi.write_reg(addr, value)
    }

    pub(crate) fn read_field(&mut self, field: Field) -> Result<u16, HardwareError> {
        let raw = self.spi.read_reg(field.addr)?;
        Ok((raw & field.mask()) >> field.lsb)
    }

    pub(crate) fn modify_field(&mut self, field: Field, value: u16) -> Result<(), HardwareError> {
        self.spi
            .modify_reg(field.addr, field.mask(), value << field.lsb)
    }

    pub(crate) fn set_active_channel(&mut self, ch: TrxChannel) -> Result<(), HardwareError> {
        self.modify_field(regs::MAC, ch.mac())
    }

    /// Soft-reset the chip register file.
    pub(crate) fn reset_chip(&mut self) -> Result<(), HardwareError> {
        // Pulse SRST low, then restore the power-on control word.
        self.write_reg(regs::MAC.addr, 0x0000)?;
        self.write_reg(regs::MAC.addr, 0xFFFD)
    }

    /// Flush the digital interface logic after a clock change.
    ///
    /// Residual values in the sample interface survive rate changes unless
    /// the logic registers are pulsed through reset.
    pub(crate) fn reset_logic_registers(&mut self) -> Result<(), HardwareError> {
        self.modify_field(regs::LRST, 0)?;
        self.modify_field(regs::LRST, 0xF)
    }

    /// Tune one local oscillator and verify lock.
    ///
    /// When `dir` is receive this programs SXR, otherwise SXT. The active
    /// channel context is restored to A afterwards.
    pub(crate) fn tune_synthesizer(
        &mut self,
        dir: TrxDir,
        freq_hz: f64,
        ref_hz: f64,
    ) -> Result<(), Error> {
        if !LO_RANGE.contains(&freq_hz) {
            return Err(ConfigError::TuningRange {
                range: LO_RANGE,
                val: freq_hz,
            }
            .into());
        }
        let plan = synth_plan(freq_hz, ref_hz, &SX_VCO_RANGE)?;
        debug!(
            %dir,
            freq_mhz = freq_hz / 1e6,
            int = plan.int,
            frac = plan.frac,
            div = plan.div,
            "tuning synthesizer"
        );
        let page = match dir {
            TrxDir::Rx => TrxChannel::SxR,
            TrxDir::Tx => TrxChannel::SxT,
        };
        self.set_active_channel(page)?;
        self.modify_field(regs::EN_DIR_SX, 1)?;
        self.modify_field(regs::SX_INT, plan.int)?;
        self.modify_field(regs::SX_FRAC_LSB, plan.frac as u16)?;
        self.modify_field(regs::SX_FRAC_MSB, (plan.frac >> 16) as u16)?;
        self.modify_field(regs::SX_DIV_LOCH, plan.div as u16)?;
        self.modify_field(regs::SX_EN, 1)?;
        let locked = self.read_field(regs::SX_LOCKED)?;
        self.set_active_channel(TrxChannel::A)?;
        if locked != 0b10 {
            let name = match dir {
                TrxDir::Rx => "SXR",
                TrxDir::Tx => "SXT",
            };
            return Err(HardwareError::PllNotLocked(name).into());
        }
        Ok(())
    }

    /// Share one synthesizer between Rx and Tx (TDD operation).
    pub(crate) fn enable_sx_tdd(&mut self, enable: bool) -> Result<(), HardwareError> {
        self.set_active_channel(TrxChannel::SxT)?;
        self.modify_field(regs::SX_TDD_EN, enable as u16)?;
        self.set_active_channel(TrxChannel::A)
    }

    /// Program the internal clock generator and verify lock.
    pub(crate) fn set_cgen_frequency(
        &mut self,
        freq_hz: f64,
        ref_hz: f64,
    ) -> Result<(), Error> {
        let plan = synth_plan(freq_hz, ref_hz, &CGEN_VCO_RANGE).map_err(|_| {
            ConfigError::ClockRange {
                freq: freq_hz,
                max: CGEN_MAX_HZ,
            }
        })?;
        self.modify_field(regs::CGEN_INT, plan.int)?;
        self.modify_field(regs::CGEN_FRAC_LSB, plan.frac as u16)?;
        self.modify_field(regs::CGEN_FRAC_MSB, (plan.frac >> 16) as u16)?;
        self.modify_field(regs::CGEN_DIV, plan.div as u16)?;
        if self.read_field(regs::CGEN_LOCKED)? != 0b10 {
            return Err(HardwareError::PllNotLocked("CGEN").into());
        }
        Ok(())
    }

    /// Read back the clock generator output frequency.
    pub(crate) fn cgen_frequency(&mut self, ref_hz: f64) -> Result<f64, HardwareError> {
        let int = self.read_field(regs::CGEN_INT)? as f64;
        let frac_lsb = self.read_field(regs::CGEN_FRAC_LSB)? as u32;
        let frac_msb = self.read_field(regs::CGEN_FRAC_MSB)? as u32;
        let div = self.read_field(regs::CGEN_DIV)?;
        let frac = ((frac_msb << 16) | frac_lsb) as f64 / FRAC_ONE;
        Ok(ref_hz * (int + frac) / (1u32 << (div + 1)) as f64)
    }

    /// Enable or disable one signal chain using the chip's own converters.
    pub(crate) fn enable_channel(
        &mut self,
        dir: TrxDir,
        ch: u8,
        enable: bool,
    ) -> Result<(), HardwareError> {
        let on = enable as u16;
        let off = !enable as u16;
        let en_field = match (dir, ch) {
            (TrxDir::Rx, 0) => regs::RXEN_A,
            (TrxDir::Tx, 0) => regs::TXEN_A,
            (TrxDir::Rx, _) => regs::RXEN_B,
            (TrxDir::Tx, _) => regs::TXEN_B,
        };
        self.modify_field(en_field, on)?;
        self.set_active_channel(TrxChannel::from_index(ch))?;
        match dir {
            TrxDir::Tx => {
                self.modify_field(regs::EN_TXTSP, on)?;
                self.modify_field(regs::EN_DIR_TBB, 1)?;
                self.modify_field(regs::EN_G_TBB, on)?;
                self.modify_field(regs::PD_LPFIAMP_TBB, off)?;
                self.modify_field(regs::EN_DIR_TRF, 1)?;
                self.modify_field(regs::EN_G_TRF, on)?;
                self.modify_field(regs::PD_TLOBUF_TRF, off)?;
                self.modify_field(regs::PD_TXPAD_TRF, off)?;
                if ch > 0 {
                    // Channel B borrows the LO buffered through channel A.
                    self.set_active_channel(TrxChannel::A)?;
                    self.modify_field(regs::EN_NEXTTX_TRF, on)?;
                }
            }
            TrxDir::Rx => {
                self.modify_field(regs::EN_RXTSP, on)?;
                self.modify_field(regs::EN_DIR_RBB, 1)?;
                self.modify_field(regs::EN_G_RBB, on)?;
                self.modify_field(regs::PD_PGA_RBB, off)?;
                self.modify_field(regs::PD_LPFL_RBB, off)?;
                self.modify_field(regs::EN_DIR_RFE, 1)?;
                self.modify_field(regs::EN_G_RFE, on)?;
                self.modify_field(regs::PD_MXLOBUF_RFE, off)?;
                self.modify_field(regs::PD_QGEN_RFE, off)?;
                self.modify_field(regs::PD_TIA_RFE, off)?;
                self.modify_field(regs::PD_LNA_RFE, off)?;
                if ch > 0 {
                    self.set_active_channel(TrxChannel::A)?;
                    self.modify_field(regs::EN_NEXTRX_RFE, on)?;
                }
            }
        }
        self.set_active_channel(TrxChannel::A)
    }

    /// Enable one signal chain routed through external converters.
    ///
    /// The on-chip ADC/DAC is kept powered down and the baseband is switched
    /// to the external test input (Tx) or bypass output (Rx); the digital
    /// signal path stays disabled since sample processing happens off-chip.
    pub(crate) fn enable_channel_external(
        &mut self,
        dir: TrxDir,
        ch: u8,
        enable: bool,
    ) -> Result<(), HardwareError> {
        let on = enable as u16;
        let off = !enable as u16;
        let en_field = match (dir, ch) {
            (TrxDir::Rx, 0) => regs::RXEN_A,
            (TrxDir::Tx, 0) => regs::TXEN_A,
            (TrxDir::Rx, _) => regs::RXEN_B,
            (TrxDir::Tx, _) => regs::TXEN_B,
        };
        self.modify_field(en_field, on)?;
        self.set_active_channel(TrxChannel::from_index(ch))?;
        let (pd1, pd2) = match dir {
            TrxDir::Rx => (regs::PD_RX_AFE1, regs::PD_RX_AFE2),
            TrxDir::Tx => (regs::PD_TX_AFE1, regs::PD_TX_AFE2),
        };
        self.modify_field(pd1, 1)?;
        self.modify_field(pd2, 1)?;
        match dir {
            TrxDir::Tx => {
                self.modify_field(regs::EN_TXTSP, 0)?;
                self.modify_field(regs::EN_DIR_TBB, 1)?;
                self.modify_field(regs::EN_G_TBB, on)?;
                self.modify_field(regs::PD_LPFIAMP_TBB, off)?;
                self.modify_field(regs::TSTIN_TBB, 3)?; // external DAC input
                self.modify_field(regs::EN_DIR_TRF, 1)?;
                self.modify_field(regs::EN_G_TRF, on)?;
                self.modify_field(regs::PD_TLOBUF_TRF, off)?;
                self.modify_field(regs::PD_TXPAD_TRF, off)?;
            }
            TrxDir::Rx => {
                self.modify_field(regs::EN_RXTSP, 0)?;
                self.modify_field(regs::EN_DIR_RBB, 1)?;
                self.modify_field(regs::EN_G_RBB, on)?;
                self.modify_field(regs::PD_PGA_RBB, off)?;
                self.modify_field(regs::PD_LPFL_RBB, off)?;
                self.modify_field(regs::OSW_PGA_RBB, 1)?; // external ADC output
                self.modify_field(regs::EN_DIR_RFE, 1)?;
                self.modify_field(regs::EN_G_RFE, on)?;
                self.modify_field(regs::PD_MXLOBUF_RFE, off)?;
                self.modify_field(regs::PD_QGEN_RFE, off)?;
                self.modify_field(regs::PD_TIA_RFE, off)?;
                self.modify_field(regs::PD_LNA_RFE, off)?;
            }
        }
        self.set_active_channel(TrxChannel::A)
    }

    /// Select the receive frontend input (0 = none, 1 = LNAH, 2 = LNAL).
    pub(crate) fn set_rx_input(&mut self, sel: u16) -> Result<(), HardwareError> {
        self.modify_field(regs::SEL_PATH_RFE, sel)
    }

    /// Select the transmit band output (0 = none, 1 = band 1, 2 = band 2).
    pub(crate) fn set_tx_band(&mut self, band: u16) -> Result<(), HardwareError> {
        self.modify_field(regs::SEL_BAND_TRF, band)
    }

    /// Route a test signal into the given signal path of the active channel.
    pub(crate) fn set_test_signal(
        &mut self,
        dir: TrxDir,
        enable: bool,
    ) -> Result<(), HardwareError> {
        match dir {
            TrxDir::Tx => self.modify_field(regs::INSEL_TXTSP, enable as u16),
            TrxDir::Rx => {
                self.modify_field(regs::INSEL_RXTSP, enable as u16)?;
                if enable {
                    self.modify_field(regs::TSGFC_RXTSP, 1)?;
                    self.modify_field(regs::TSGMODE_RXTSP, 0)?;
                    self.write_reg(regs::RXTSP_CFG, regs::RXTSP_BYPASS_ALL)?;
                }
                Ok(())
            }
        }
    }

    /// Configure the general-purpose digital filter of the active channel.
    ///
    /// The bandwidth is quantized to a 3-bit code relative to the sample
    /// rate; anything at or above the full rate disables the filter stages.
    pub(crate) fn set_gfir(
        &mut self,
        dir: TrxDir,
        enable: bool,
        bandwidth_hz: f64,
        sample_rate_hz: f64,
    ) -> Result<(), HardwareError> {
        let (en, bw) = match dir {
            TrxDir::Rx => (regs::GFIR_EN_RXTSP, regs::GFIR_BW_RXTSP),
            TrxDir::Tx => (regs::GFIR_EN_TXTSP, regs::GFIR_BW_TXTSP),
        };
        if !enable {
            return self.modify_field(en, 0);
        }
        let ratio = (bandwidth_hz / sample_rate_hz).clamp(0.0, 1.0);
        let code = ((ratio * 7.0).round() as u16).min(7);
        self.modify_field(bw, code)?;
        self.modify_field(en, 1)
    }

    fn wait_cal(&mut self) -> Result<CalOutcome, HardwareError> {
        let deadline = Instant::now() + CAL_TIMEOUT;
        loop {
            if self.read_field(regs::CAL_BUSY)? == 0 {
                return Ok(CalOutcome(self.read_field(regs::CAL_CODE)? as u8));
            }
            if Instant::now() >= deadline {
                return Err(HardwareError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "calibration routine did not complete",
                )));
            }
            std::thread::sleep(CAL_POLL_INTERVAL);
        }
    }

    /// Run the DC/IQ calibration routine for the active channel.
    ///
    /// Blocks the caller until the chip-internal routine finishes or the
    /// deadline passes. A non-zero outcome means the routine ran but did
    /// not converge; that is the caller's to collect, not a transport
    /// failure.
    pub(crate) fn run_calibration(
        &mut self,
        dir: TrxDir,
        bandwidth_hz: f64,
    ) -> Result<CalOutcome, HardwareError> {
        let code = (bandwidth_hz / 100e3).round() as u16;
        self.modify_field(regs::CAL_BW, code.min(regs::CAL_BW.mask() >> regs::CAL_BW.lsb))?;
        let start = match dir {
            TrxDir::Rx => regs::CAL_START_RX,
            TrxDir::Tx => regs::CAL_START_TX,
        };
        self.modify_field(start, 1)?;
        let outcome = self.wait_cal()?;
        self.modify_field(start, 0)?;
        Ok(outcome)
    }

    /// Tune the analog low-pass filter of the active channel.
    pub(crate) fn tune_lpf(
        &mut self,
        dir: TrxDir,
        bandwidth_hz: f64,
    ) -> Result<CalOutcome, HardwareError> {
        let code = (bandwidth_hz / 100e3).round() as u16;
        self.modify_field(regs::LPF_BW, code.min(regs::LPF_BW.mask() >> regs::LPF_BW.lsb))?;
        let start = match dir {
            TrxDir::Rx => regs::LPF_START_RX,
            TrxDir::Tx => regs::LPF_START_TX,
        };
        self.modify_field(start, 1)?;
        let outcome = self.wait_cal()?;
        self.modify_field(start, 0)?;
        Ok(outcome)
    }
}

/// Baseline register values shared by every TRX7 slot on the board.
///
/// Values below 0x0100 are global; the per-channel page (0x0100 and up) is
/// written once per channel context.
const COMMON_DEFAULTS: &[(u16, u16)] = &[
    (0x0022, 0x0FFF),
    (0x0023, 0x5550),
    (0x002B, 0x0038),
    (0x002C, 0x0000),
    (0x002D, 0x0641),
    (0x0082, 0x8001),
    (0x0086, 0x4101),
    (0x0087, 0x5555),
    (0x0088, 0x0525),
    (0x0089, 0x1078),
    (0x008B, 0x218C),
    (0x00A6, 0x000F),
    (0x00A9, 0x8000),
    (0x00AC, 0x2000),
    (0x0100, 0x3409),
    (0x0101, 0x7800),
    (0x0103, 0x0A12),
    (0x0105, 0x0011),
    (0x0106, 0x318C),
    (0x0108, 0x218C),
    (0x0109, 0x57C1),
    (0x010A, 0x154C),
    (0x010B, 0x0001),
    (0x010C, 0x8865),
    (0x010D, 0x011A),
    (0x010E, 0x0000),
    (0x010F, 0x3142),
    (0x0110, 0x2B14),
    (0x0111, 0x0000),
    (0x0112, 0x000C),
    (0x0113, 0x03C2),
    (0x0114, 0x01F0),
    (0x0115, 0x000D),
    (0x0118, 0x418C),
    (0x0119, 0x5292),
    (0x011A, 0x3001),
    (0x011C, 0x8941),
    (0x011D, 0x0000),
    (0x011E, 0x0984),
    (0x0120, 0xE6C0),
    (0x0121, 0x3638),
    (0x0122, 0x0514),
    (0x0200, 0x00E1),
    (0x0204, 0x0000),
    (0x0208, 0x017B),
    (0x020B, 0x4000),
    (0x020C, 0x8000),
    (0x0400, 0x8081),
    (0x0404, 0x0006),
    (0x040B, 0x1020),
    (0x040C, 0x00FB),
];

/// Per-slot overrides: the duplex and monitor slots run their mixer bias
/// and LO buffer trims differently because of the board wiring.
const EXTERNAL_SLOT_OVERRIDES: &[(u16, u16)] = &[(0x010A, 0xD54C), (0x0119, 0xD292)];

fn defaults_for(external_converters: bool) -> Vec<(u16, u16)> {
    let mut vals = COMMON_DEFAULTS.to_vec();
    if external_converters {
        for (addr, val) in EXTERNAL_SLOT_OVERRIDES {
            if let Some(slot) = vals.iter_mut().find(|(a, _)| a == addr) {
                slot.1 = *val;
            }
        }
    }
    vals
}

impl<P: ControlPipe> Trx7<'_, P> {
    /// Reset the chip and load the baseline register table.
    ///
    /// Slots using external converters additionally power down the on-chip
    /// ADC/DAC block after loading defaults.
    pub(crate) fn apply_defaults(&mut self, external_converters: bool) -> Result<(), HardwareError> {
        self.reset_chip()?;
        let vals = defaults_for(external_converters);
        if external_converters {
            self.set_active_channel(TrxChannel::Both)?;
            self.spi.write_regs(&vals)?;
            self.write_reg(regs::AFE, regs::AFE_POWERED_DOWN)?;
        } else {
            self.set_active_channel(TrxChannel::A)?;
            self.spi.write_regs(&vals)?;
            // Channel B shares the global page; rewrite only the paged part.
            let paged: Vec<(u16, u16)> =
                vals.iter().copied().filter(|(a, _)| *a >= 0x0100).collect();
            self.set_active_channel(TrxChannel::B)?;
            self.spi.write_regs(&paged)?;
        }
        self.set_active_channel(TrxChannel::A)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::mock::MockPipe;

    #[test]
    fn field_mask() {
        assert_eq!(regs::MAC.mask(), 0b11);
        assert_eq!(regs::SRST.mask(), 0x8000);
        assert_eq!(regs::SEL_BAND_TRF.mask(), 0b11);
        assert_eq!(regs::CGEN_FRAC_LSB.mask(), 0xFFFF);
    }

    #[test]
    fn synth_plan_picks_octave() {
        // 2.4 GHz doubles once into the 3.8-7.7 GHz band.
        let plan = synth_plan(2.4e9, 30.72e6, &SX_VCO_RANGE).unwrap();
        assert_eq!(plan.div, 0);
        let n = plan.int as f64 + plan.frac as f64 / FRAC_ONE;
        let lo = 30.72e6 * n / 2.0;
        assert!((lo - 2.4e9).abs() < 1.0);

        // 30 MHz needs the full divider chain.
        let plan = synth_plan(30e6, 30.72e6, &SX_VCO_RANGE).unwrap();
        assert_eq!(plan.div, 6);
        let n = plan.int as f64 + plan.frac as f64 / FRAC_ONE;
        assert!((30.72e6 * n / 128.0 - 30e6).abs() < 1.0);
    }

    #[test]
    fn synth_plan_rejects_unreachable_vco() {
        assert!(synth_plan(20e9, 30.72e6, &SX_VCO_RANGE).is_err());
        assert!(synth_plan(1e3, 30.72e6, &SX_VCO_RANGE).is_err());
    }

    #[test]
    fn tune_checks_lock() {
        let mut pipe = MockPipe::new();
        Trx7::new(&mut pipe, 0)
            .tune_synthesizer(TrxDir::Rx, 2.4e9, 30.72e6)
            .unwrap();

        // Clearing the lock comparator makes tuning fail.
        pipe.set_reg(0, regs::SX_STATUS, 0);
        let err = Trx7::new(&mut pipe, 0)
            .tune_synthesizer(TrxDir::Tx, 2.4e9, 30.72e6)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Hardware(HardwareError::PllNotLocked("SXT"))
        ));
    }

    #[test]
    fn cgen_roundtrip() {
        let mut pipe = MockPipe::new();
        let mut chip = Trx7::new(&mut pipe, 1);
        chip.set_cgen_frequency(245.76e6, 30.72e6).unwrap();
        let read_back = chip.cgen_frequency(30.72e6).unwrap();
        assert!((read_back - 245.76e6).abs() < 10.0, "got {read_back}");
    }

    #[test]
    fn defaults_write_paged_registers_per_channel() {
        let mut pipe = MockPipe::new();
        Trx7::new(&mut pipe, 0).apply_defaults(false).unwrap();
        let writes = pipe.writes_to(0);
        // Global register 0x0022 once, paged register 0x0108 twice.
        assert_eq!(writes.iter().filter(|(a, _)| *a == 0x0022).count(), 1);
        assert_eq!(writes.iter().filter(|(a, _)| *a == 0x0108).count(), 2);
    }

    #[test]
    fn defaults_reload_chain_enable_registers() {
        // A previous bring-up leaves the analog enable groups modified;
        // reloading defaults must park them back at their table values so
        // later read-modify-writes start from a known state.
        let mut pipe = MockPipe::new();
        pipe.set_reg(0, 0x0100, 0x0001);
        pipe.set_reg(0, 0x0105, 0x4001);
        Trx7::new(&mut pipe, 0).apply_defaults(false).unwrap();
        assert_eq!(pipe.reg(0, 0x0100), 0x3409);
        assert_eq!(pipe.reg(0, 0x0105), 0x0011);
        assert_eq!(pipe.reg(0, 0x0082), 0x8001);
    }

    #[test]
    fn external_defaults_power_down_afe() {
        let mut pipe = MockPipe::new();
        Trx7::new(&mut pipe, 1).apply_defaults(true).unwrap();
        assert_eq!(pipe.reg(1, regs::AFE), regs::AFE_POWERED_DOWN);
        // Override table took effect.
        assert_eq!(pipe.reg(1, 0x010A), 0xD54C);
    }

    #[test]
    fn calibration_reports_chip_status() {
        let mut pipe = MockPipe::new();
        pipe.set_reg(0, regs::CAL_STATUS, 0x0003); // idle, failure code 3
        let outcome = Trx7::new(&mut pipe, 0)
            .run_calibration(TrxDir::Rx, 5e6)
            .unwrap();
        assert_eq!(outcome.0, 3);
    }
}
