//! FPGA gateware registers.
//!
//! The gateware owns everything that is not inside a transceiver chip: the
//! RF switch matrix, amplifier power rails, the sample-interface PLLs that
//! clock data between the FPGA and each chip's digital port, and the
//! equalizer stage in front of the duplex slot's external converters.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::HardwareError;
use crate::path::SwitchUpdate;
use crate::pipe::{ControlPipe, SpiPort, SUBDEV_FPGA};

/// Sample-interface PLL tuning block.
const REG_IFACE_TX_HI: u16 = 0x0010;
const REG_IFACE_TX_LO: u16 = 0x0011;
const REG_IFACE_RX_HI: u16 = 0x0012;
const REG_IFACE_RX_LO: u16 = 0x0013;
const REG_IFACE_START: u16 = 0x0014;
/// Bit 0 set once both interface PLLs report lock.
pub(crate) const REG_IFACE_DONE: u16 = 0x0015;

/// RF switch matrix.
pub(crate) const REG_RF_SWITCH: u16 = 0x00D1;
/// Amplifier power control.
pub(crate) const REG_PA_CTRL: u16 = 0x00D2;
/// Oversample select of the duplex-slot equalizer.
pub(crate) const REG_EQUALIZER_OVR: u16 = 0x00D4;

/// Power-on value of the switch matrix: primary bands/inputs parked on
/// their first option, duplex bank in FDD, monitor on its antenna.
const RF_SWITCH_DEFAULT: u16 = 0x3357;

const IFACE_POLL: Duration = Duration::from_millis(1);
const IFACE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) struct Fpga<'a, P> {
    spi: SpiPort<'a, P>,
}

impl<'a, P: ControlPipe> Fpga<'a, P> {
    pub(crate) fn new(pipe: &'a mut P) -> Self {
        Fpga {
            spi: SpiPort::new(pipe, SUBDEV_FPGA),
        }
    }

    /// Park the switch matrix and amplifier rails in their power-on state.
    pub(crate) fn init(&mut self) -> Result<(), HardwareError> {
        self.spi.write_reg(REG_RF_SWITCH, RF_SWITCH_DEFAULT)?;
        self.spi.write_reg(REG_PA_CTRL, 0x0003)
    }

    /// Read-modify-write the switch matrix with a routing update.
    pub(crate) fn update_rf_switches(&mut self, update: SwitchUpdate) -> Result<(), HardwareError> {
        if update == SwitchUpdate::default() {
            return Ok(());
        }
        let cur = self.spi.read_reg(REG_RF_SWITCH)?;
        let next = update.apply_to(cur);
        debug!("rf switches {cur:#06x} -> {next:#06x}");
        self.spi.write_reg(REG_RF_SWITCH, next)
    }

    pub(crate) fn read_pa_ctrl(&mut self) -> Result<u16, HardwareError> {
        self.spi.read_reg(REG_PA_CTRL)
    }

    pub(crate) fn write_pa_ctrl(&mut self, value: u16) -> Result<(), HardwareError> {
        self.spi.write_reg(REG_PA_CTRL, value)
    }

    /// Select the equalizer oversample ratio for the duplex slot.
    pub(crate) fn set_equalizer_oversample(&mut self, oversample: u8) -> Result<(), HardwareError> {
        self.spi.write_reg(REG_EQUALIZER_OVR, u16::from(oversample))
    }

    pub(crate) fn equalizer_oversample(&mut self) -> Result<u16, HardwareError> {
        self.spi.read_reg(REG_EQUALIZER_OVR)
    }

    /// Retune the sample-interface PLLs and wait for lock.
    pub(crate) fn set_interface_freq(&mut self, tx_hz: f64, rx_hz: f64) -> Result<(), HardwareError> {
        let tx = tx_hz.round() as u32;
        let rx = rx_hz.round() as u32;
        self.spi.write_regs(&[
            (REG_IFACE_TX_HI, (tx >> 16) as u16),
            (REG_IFACE_TX_LO, tx as u16),
            (REG_IFACE_RX_HI, (rx >> 16) as u16),
            (REG_IFACE_RX_LO, rx as u16),
            (REG_IFACE_START, 1),
        ])?;
        let deadline = Instant::now() + IFACE_TIMEOUT;
        loop {
            if self.spi.read_reg(REG_IFACE_DONE)? & 1 != 0 {
                return self.spi.write_reg(REG_IFACE_START, 0);
            }
            if Instant::now() >= deadline {
                return Err(HardwareError::PllNotLocked("sample interface"));
            }
            std::thread::sleep(IFACE_POLL);
        }
    }

}

/// Decode the interface rates (tx, rx) last written to the mock.
#[cfg(test)]
pub(crate) fn decode_rate(pipe: &crate::pipe::mock::MockPipe) -> (f64, f64) {
    let word = |hi: u16, lo: u16| {
        f64::from(
            (u32::from(pipe.reg(SUBDEV_FPGA, hi)) << 16) | u32::from(pipe.reg(SUBDEV_FPGA, lo)),
        )
    };
    (
        word(REG_IFACE_TX_HI, REG_IFACE_TX_LO),
        word(REG_IFACE_RX_HI, REG_IFACE_RX_LO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::mock::MockPipe;

    #[test]
    fn interface_freq_splits_words_and_clears_start() {
        let mut pipe = MockPipe::new();
        Fpga::new(&mut pipe).set_interface_freq(122.88e6, 61.44e6).unwrap();
        let (tx, rx) = decode_rate(&pipe);
        assert_eq!(tx, 122_880_000.0);
        assert_eq!(rx, 61_440_000.0);
        assert_eq!(pipe.reg(SUBDEV_FPGA, REG_IFACE_START), 0);
    }

    #[test]
    fn switch_update_is_read_modify_write() {
        let mut pipe = MockPipe::new();
        Fpga::new(&mut pipe).init().unwrap();
        let update = SwitchUpdate { set: 1 << 13, clear: 1 << 2 };
        Fpga::new(&mut pipe).update_rf_switches(update).unwrap();
        let reg = pipe.reg(SUBDEV_FPGA, REG_RF_SWITCH);
        assert_eq!(reg, (0x3357 | 1 << 13) & !(1 << 2));
    }

    #[test]
    fn empty_update_writes_nothing() {
        let mut pipe = MockPipe::new();
        Fpga::new(&mut pipe)
            .update_rf_switches(SwitchUpdate::default())
            .unwrap();
        assert!(pipe.writes_to(SUBDEV_FPGA).is_empty());
    }
}
