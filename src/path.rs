//! RF path selection.
//!
//! Each transceiver slot exposes a small set of front-panel routings; which
//! set depends on the slot's role on the board. Selecting a path is a pure
//! computation over two FPGA registers (the switch matrix at 0x00D1 and the
//! amplifier power register at 0x00D2) plus, for some roles, a band/input
//! select inside the chip itself. Nothing here touches hardware; the
//! orchestrator applies the returned register updates.

use crate::error::ConfigError;
use crate::TrxDir;

/// Role a transceiver slot plays in the board's RF network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipRole {
    /// Full-featured slot with two antenna ports per direction.
    Primary,
    /// Slot wired through a TDD/FDD switch bank and external converters.
    Duplex,
    /// Receive-oriented observation slot.
    Monitor,
}

impl ChipRole {
    /// Human-readable names of the selectable paths, index = path code.
    pub fn path_names(self, dir: TrxDir) -> &'static [&'static str] {
        match (self, dir) {
            (ChipRole::Primary, TrxDir::Rx) => &["NONE", "LNAH", "LNAL"],
            (ChipRole::Primary, TrxDir::Tx) => &["NONE", "BAND1", "BAND2"],
            (ChipRole::Duplex, TrxDir::Rx) => &["NONE", "TDD", "FDD", "CAL"],
            (ChipRole::Duplex, TrxDir::Tx) => &["NONE", "TDD", "FDD"],
            (ChipRole::Monitor, TrxDir::Rx) => &["NONE", "LNAH", "CAL"],
            (ChipRole::Monitor, TrxDir::Tx) => &["NONE", "BAND1"],
        }
    }

    /// Validate a raw path code for this role and direction.
    pub(crate) fn check_path(self, dir: TrxDir, path: u8) -> Result<(), ConfigError> {
        if (path as usize) < self.path_names(dir).len() {
            Ok(())
        } else {
            Err(ConfigError::InvalidPath {
                chip: self.name(),
                dir,
                path,
            })
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            ChipRole::Primary => "primary",
            ChipRole::Duplex => "duplex",
            ChipRole::Monitor => "monitor",
        }
    }
}

/// Receive inputs of a primary slot.
#[allow(missing_docs)]
pub mod primary_rx {
    pub const NONE: u8 = 0;
    pub const LNAH: u8 = 1;
    pub const LNAL: u8 = 2;
}

/// Transmit outputs of a primary slot.
#[allow(missing_docs)]
pub mod primary_tx {
    pub const NONE: u8 = 0;
    pub const BAND1: u8 = 1;
    pub const BAND2: u8 = 2;
}

/// Receive routings of a duplex slot.
#[allow(missing_docs)]
pub mod duplex_rx {
    pub const NONE: u8 = 0;
    pub const TDD: u8 = 1;
    pub const FDD: u8 = 2;
    pub const CALIBRATION: u8 = 3;
}

/// Transmit routings of a duplex slot.
#[allow(missing_docs)]
pub mod duplex_tx {
    pub const NONE: u8 = 0;
    pub const TDD: u8 = 1;
    pub const FDD: u8 = 2;
}

/// Receive inputs of a monitor slot.
#[allow(missing_docs)]
pub mod monitor_rx {
    pub const NONE: u8 = 0;
    pub const LNAH: u8 = 1;
    pub const CALIBRATION: u8 = 2;
}

/// Transmit outputs of a monitor slot.
#[allow(missing_docs)]
pub mod monitor_tx {
    pub const NONE: u8 = 0;
    pub const BAND1: u8 = 1;
}

/// Bits to set and clear in the FPGA switch matrix register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SwitchUpdate {
    pub set: u16,
    pub clear: u16,
}

impl SwitchUpdate {
    fn set(mut self, bit: u8) -> Self {
        self.set |= 1 << bit;
        self
    }

    fn clear(mut self, bit: u8) -> Self {
        self.clear |= 1 << bit;
        self
    }

    /// Merge into the current register value.
    pub(crate) fn apply_to(self, reg: u16) -> u16 {
        (reg & !self.clear) | self.set
    }
}

/// Chip-side selects that accompany a switch update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChipSelect {
    /// Value for the receive input mux (`SEL_PATH_RFE`), if touched.
    pub rx_input: Option<u16>,
    /// Value for the transmit band mux (`SEL_BAND_TRF`), if touched.
    pub tx_band: Option<u16>,
}

/// Full routing plan for one (role, direction, channel, path) selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RoutingPlan {
    pub switches: SwitchUpdate,
    pub chip: ChipSelect,
}

/// Compute the switch matrix and chip mux changes for a path selection.
///
/// `channel` is the chip-local channel (0 or 1). The code must already be
/// validated through [`ChipRole::check_path`]. A `NONE` path leaves the
/// board switches alone and only disconnects the chip-side mux.
pub(crate) fn routing(role: ChipRole, dir: TrxDir, channel: u8, path: u8) -> RoutingPlan {
    debug_assert!(channel < 2);
    let mut sw = SwitchUpdate::default();
    let mut chip = ChipSelect {
        rx_input: None,
        tx_band: None,
    };
    match (role, dir) {
        (ChipRole::Primary, TrxDir::Tx) => {
            match path {
                primary_tx::BAND1 => sw = sw.set(13 - channel),
                primary_tx::BAND2 => sw = sw.clear(13 - channel),
                _ => {}
            }
            chip.tx_band = Some(match path {
                primary_tx::BAND1 => 1,
                primary_tx::BAND2 => 2,
                _ => 0,
            });
        }
        (ChipRole::Primary, TrxDir::Rx) => {
            match path {
                primary_rx::LNAH => sw = sw.set(11 - channel),
                primary_rx::LNAL => sw = sw.clear(11 - channel),
                _ => {}
            }
            chip.rx_input = Some(match path {
                primary_rx::LNAH => 1,
                primary_rx::LNAL => 2,
                _ => 0,
            });
        }
        (ChipRole::Duplex, dir) => {
            // The duplex bank shares one trx/cal switch per channel and a
            // common antenna-select bit for channel 0 (bit 7) versus
            // channel 1 (bit 9, inverted sense).
            let shift = channel * 2;
            let ant = |sw: SwitchUpdate, towards_trx: bool| {
                match (channel, towards_trx) {
                    (0, true) => sw.clear(7),
                    (0, false) => sw.set(7),
                    (_, true) => sw.set(9),
                    (_, false) => sw.clear(9),
                }
            };
            match (dir, path) {
                (TrxDir::Tx, duplex_tx::TDD) => {
                    sw = ant(sw, true).set(6 + shift).clear(2 + shift).set(3 + shift);
                }
                (TrxDir::Rx, duplex_rx::TDD) => {
                    sw = ant(sw, false).clear(6 + shift).clear(2 + shift).set(3 + shift);
                }
                (TrxDir::Tx, duplex_tx::FDD) | (TrxDir::Rx, duplex_rx::FDD) => {
                    sw = ant(sw, true).set(6 + shift).clear(2 + shift).clear(3 + shift);
                }
                (TrxDir::Rx, duplex_rx::CALIBRATION) => {
                    sw = ant(sw, false).set(6 + shift).set(2 + shift).set(3 + shift);
                }
                _ => {}
            }
            // The duplex chip is hard-wired to band 1 / LNAH internally.
            match dir {
                TrxDir::Rx => chip.rx_input = Some(if path == duplex_rx::NONE { 0 } else { 1 }),
                TrxDir::Tx => chip.tx_band = Some(if path == duplex_tx::NONE { 0 } else { 1 }),
            }
        }
        (ChipRole::Monitor, TrxDir::Rx) => {
            match path {
                monitor_rx::LNAH => sw = sw.clear(14 + channel),
                monitor_rx::CALIBRATION => sw = sw.set(14 + channel),
                _ => {}
            }
            chip.rx_input = Some(if path == monitor_rx::NONE { 0 } else { 1 });
        }
        (ChipRole::Monitor, TrxDir::Tx) => {
            chip.tx_band = Some(if path == monitor_tx::NONE { 0 } else { 1 });
        }
    }
    RoutingPlan { switches: sw, chip }
}

/// Snapshot of the amplifier power register for bracketing.
///
/// Bits are active-low for the duplex LNAs and active-high for the power
/// amplifiers; [`Self::all_off`] renders everything unpowered regardless.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PaReg(pub u16);

impl PaReg {
    const PRIMARY_PA: [u8; 2] = [5, 4];
    const DUPLEX_PA: [u8; 2] = [3, 2];
    const DUPLEX_LNA: [u8; 2] = [1, 0];

    /// Mask of every amplifier control bit.
    pub(crate) const MASK: u16 = 0x003F;

    /// Register value with every amplifier unpowered.
    pub(crate) fn all_off(self) -> u16 {
        let mut v = self.0 & !Self::MASK;
        for b in Self::DUPLEX_LNA {
            v |= 1 << b; // LNA power-down is active high
        }
        v
    }

    pub(crate) fn with_primary_pa(mut self, channel: u8, on: bool) -> Self {
        let bit = 1 << Self::PRIMARY_PA[channel as usize];
        if on { self.0 |= bit } else { self.0 &= !bit }
        self
    }

    pub(crate) fn with_duplex_pa(mut self, channel: u8, on: bool) -> Self {
        let bit = 1 << Self::DUPLEX_PA[channel as usize];
        if on { self.0 |= bit } else { self.0 &= !bit }
        self
    }

    pub(crate) fn with_duplex_lna(mut self, channel: u8, on: bool) -> Self {
        let bit = 1 << Self::DUPLEX_LNA[channel as usize];
        // Inverted sense: set bit powers the LNA down.
        if on { self.0 &= !bit } else { self.0 |= bit }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_rejects_foreign_codes() {
        assert!(ChipRole::Primary.check_path(TrxDir::Rx, primary_rx::LNAL).is_ok());
        assert!(ChipRole::Primary.check_path(TrxDir::Rx, 3).is_err());
        assert!(ChipRole::Duplex.check_path(TrxDir::Rx, duplex_rx::CALIBRATION).is_ok());
        assert!(ChipRole::Duplex.check_path(TrxDir::Tx, 3).is_err());
        assert!(ChipRole::Monitor.check_path(TrxDir::Tx, monitor_tx::BAND1).is_ok());
        assert!(ChipRole::Monitor.check_path(TrxDir::Tx, 2).is_err());
    }

    #[test]
    fn primary_bands_are_per_channel_bits() {
        let p = routing(ChipRole::Primary, TrxDir::Tx, 0, primary_tx::BAND1);
        assert_eq!(p.switches, SwitchUpdate { set: 1 << 13, clear: 0 });
        assert_eq!(p.chip.tx_band, Some(1));

        let p = routing(ChipRole::Primary, TrxDir::Tx, 1, primary_tx::BAND2);
        assert_eq!(p.switches, SwitchUpdate { set: 0, clear: 1 << 12 });
        assert_eq!(p.chip.tx_band, Some(2));

        let p = routing(ChipRole::Primary, TrxDir::Rx, 1, primary_rx::LNAH);
        assert_eq!(p.switches, SwitchUpdate { set: 1 << 10, clear: 0 });
        assert_eq!(p.chip.rx_input, Some(1));
    }

    #[test]
    fn selecting_one_channel_leaves_sibling_bits_alone() {
        let p = routing(ChipRole::Primary, TrxDir::Rx, 0, primary_rx::LNAH);
        let touched = p.switches.set | p.switches.clear;
        // Channel 1's input select lives in bit 10.
        assert_eq!(touched & (1 << 10), 0);

        let reg = 0b0000_0100_0000_0000; // sibling on LNAH
        assert_eq!(p.switches.apply_to(reg) & (1 << 10), 1 << 10);
    }

    #[test]
    fn duplex_tdd_and_fdd_disagree_only_where_expected() {
        let tdd_tx = routing(ChipRole::Duplex, TrxDir::Tx, 0, duplex_tx::TDD).switches;
        assert_eq!(tdd_tx.set, (1 << 6) | (1 << 3));
        assert_eq!(tdd_tx.clear, (1 << 7) | (1 << 2));

        let tdd_rx = routing(ChipRole::Duplex, TrxDir::Rx, 0, duplex_rx::TDD).switches;
        assert_eq!(tdd_rx.set, (1 << 7) | (1 << 3));
        assert_eq!(tdd_rx.clear, (1 << 6) | (1 << 2));

        let fdd = routing(ChipRole::Duplex, TrxDir::Tx, 0, duplex_tx::FDD).switches;
        assert_eq!(fdd.set, 1 << 6);
        assert_eq!(fdd.clear, (1 << 7) | (1 << 2) | (1 << 3));

        // Channel 1 lands two bits higher and flips the antenna-select sense.
        let cal = routing(ChipRole::Duplex, TrxDir::Rx, 1, duplex_rx::CALIBRATION).switches;
        assert_eq!(cal.set, (1 << 8) | (1 << 4) | (1 << 5));
        assert_eq!(cal.clear, 1 << 9);
    }

    #[test]
    fn monitor_calibration_uses_high_bits() {
        let cal = routing(ChipRole::Monitor, TrxDir::Rx, 0, monitor_rx::CALIBRATION).switches;
        assert_eq!(cal, SwitchUpdate { set: 1 << 14, clear: 0 });
        let lnah = routing(ChipRole::Monitor, TrxDir::Rx, 1, monitor_rx::LNAH).switches;
        assert_eq!(lnah, SwitchUpdate { set: 0, clear: 1 << 15 });
    }

    #[test]
    fn none_path_touches_no_switches() {
        for (role, dir) in [
            (ChipRole::Primary, TrxDir::Rx),
            (ChipRole::Primary, TrxDir::Tx),
            (ChipRole::Duplex, TrxDir::Rx),
            (ChipRole::Duplex, TrxDir::Tx),
            (ChipRole::Monitor, TrxDir::Rx),
            (ChipRole::Monitor, TrxDir::Tx),
        ] {
            let p = routing(role, dir, 0, 0);
            assert_eq!(p.switches, SwitchUpdate::default(), "{role:?} {dir:?}");
            let sel = p.chip.rx_input.or(p.chip.tx_band);
            assert_eq!(sel, Some(0), "{role:?} {dir:?}");
        }
    }

    #[test]
    fn pa_bracketing_masks_every_amplifier() {
        let snapshot = PaReg(0xFFFF);
        let off = snapshot.all_off();
        // PAs cleared, LNA power-downs asserted, unrelated bits untouched.
        assert_eq!(off & PaReg::MASK, 0b0000_0011);
        assert_eq!(off & !PaReg::MASK, 0xFFC0);

        let on = PaReg(off)
            .with_primary_pa(0, true)
            .with_duplex_pa(1, true)
            .with_duplex_lna(0, true);
        assert_eq!(on.0 & PaReg::MASK, (1 << 5) | (1 << 2) | (1 << 0));
    }
}
