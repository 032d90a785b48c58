//! Pure-Rust control plane for the Triplex X3 SDR board.
//!
//! The X3 carries three TRX7 transceiver chips behind one FPGA. Each chip
//! slot plays a fixed role in the RF network: a full-featured primary slot,
//! a duplex slot wired through a TDD/FDD switch bank and external
//! converters, and a receive-oriented monitor slot. The host talks to all
//! of it over a packetized command/response pipe; this crate owns register
//! semantics and sequencing, while the transport is anything implementing
//! [`ControlPipe`].
//!
//! The central entry point is [`Board::configure`]: hand it the desired
//! state of one slot and it validates everything first, then brings the
//! slot up in dependency order with amplifiers unpowered until the end.
//!
//! ```no_run
//! use triplex_sdr::{Board, SdrConfig, TrxDir, path::primary_rx};
//!
//! # struct Pipe;
//! # impl triplex_sdr::ControlPipe for Pipe {
//! #     fn write(&mut self, d: &[u8], _: std::time::Duration) -> std::io::Result<usize> { Ok(d.len()) }
//! #     fn read(&mut self, b: &mut [u8], _: std::time::Duration) -> std::io::Result<usize> { Ok(b.len()) }
//! # }
//! # fn open_pipe() -> Pipe { Pipe }
//! fn main() -> anyhow::Result<()> {
//!     let mut board = Board::new(open_pipe());
//!     board.init()?;
//!
//!     let mut cfg = SdrConfig::default();
//!     cfg.channels[0].rx.enabled = true;
//!     cfg.channels[0].rx.center_frequency = 2.4e9;
//!     cfg.channels[0].rx.sample_rate = 10e6;
//!     cfg.channels[0].rx.path = primary_rx::LNAH;
//!     board.configure(0, &cfg)?;
//!
//!     println!("rx rate: {} Hz", board.sample_rate(0, TrxDir::Rx)?);
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod path;
pub mod rate;

mod clockgen;
mod fpga;
mod pipe;
mod trx7;

use tracing::{info, warn};

pub use crate::config::{ChannelConfig, DirectionConfig, SdrConfig};
pub use crate::error::{CalFailure, ConfigError, Error, HardwareError};
pub use crate::path::ChipRole;
pub use crate::pipe::{ControlPipe, BLOCK_SIZE};
pub use crate::rate::ClockPlan;

use crate::clockgen::{dac_factor, ClkOutput, ClockGen, REF_HZ as CLOCKGEN_REF_HZ};
use crate::config::active_dir;
use crate::error::CalFailure as Cal;
use crate::fpga::Fpga;
use crate::path::{PaReg, RoutingPlan};
use crate::pipe::SpiPort;
use crate::trx7::{regs, Trx7, TrxChannel};

/// Transceiver slots on the board.
pub const NUM_CHIPS: usize = 3;
/// Total stream channels (two per slot).
pub const NUM_CHANNELS: usize = NUM_CHIPS * 2;

/// Signal direction through a transceiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrxDir {
    /// Antenna to host.
    Rx,
    /// Host to antenna.
    Tx,
}

impl std::fmt::Display for TrxDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TrxDir::Rx => "Rx",
            TrxDir::Tx => "Tx",
        })
    }
}

/// Static description of one transceiver slot.
#[derive(Clone, Copy, Debug)]
pub struct SlotDescriptor {
    /// Role the slot plays in the RF network.
    pub role: ChipRole,
    /// Selectable receive paths, index = path code.
    pub rx_paths: &'static [&'static str],
    /// Selectable transmit paths, index = path code.
    pub tx_paths: &'static [&'static str],
}

/// Static description of the board.
#[derive(Clone, Copy, Debug)]
pub struct Descriptor {
    /// Marketing name of the board.
    pub name: &'static str,
    /// One entry per transceiver slot.
    pub slots: [SlotDescriptor; NUM_CHIPS],
}

const ROLES: [ChipRole; NUM_CHIPS] = [ChipRole::Primary, ChipRole::Duplex, ChipRole::Monitor];

/// A Triplex X3 board reached over a control pipe.
pub struct Board<P> {
    pipe: P,
    ref_clk: [f64; NUM_CHIPS],
}

impl<P: ControlPipe> Board<P> {
    /// Wrap an open control pipe. No register traffic happens here; call
    /// [`Board::init`] to bring the board to a known state.
    pub fn new(pipe: P) -> Self {
        Board {
            pipe,
            ref_clk: [CLOCKGEN_REF_HZ; NUM_CHIPS],
        }
    }

    /// Board description: slot roles and their selectable paths.
    pub fn descriptor(&self) -> Descriptor {
        let slot = |role: ChipRole| SlotDescriptor {
            role,
            rx_paths: role.path_names(TrxDir::Rx),
            tx_paths: role.path_names(TrxDir::Tx),
        };
        Descriptor {
            name: "Triplex X3",
            slots: [slot(ROLES[0]), slot(ROLES[1]), slot(ROLES[2])],
        }
    }

    /// Bring every slot to its power-on baseline.
    ///
    /// Parks the switch matrix, relocks the clock-distribution chip and
    /// loads the default register tables into all three chips.
    pub fn init(&mut self) -> Result<(), Error> {
        info!("initializing board");
        Fpga::new(&mut self.pipe).init()?;
        ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ).reset()?;
        for chip in 0..NUM_CHIPS {
            let external = ROLES[chip] != ChipRole::Primary;
            Trx7::new(&mut self.pipe, chip as u8).apply_defaults(external)?;
            self.ref_clk[chip] = CLOCKGEN_REF_HZ;
        }
        Ok(())
    }

    /// Hard-reset every transceiver chip through the device reset command.
    pub fn reset(&mut self) -> Result<(), Error> {
        for chip in 0..NUM_CHIPS {
            SpiPort::new(&mut self.pipe, chip as u8).device_reset()?;
        }
        Ok(())
    }

    /// Apply a full slot configuration.
    ///
    /// The request is validated in its entirety before the first register
    /// write. Amplifiers are unpowered for the whole sequence and switched
    /// back on as the final step, so the RF network never sees a
    /// half-configured slot. Calibration failures do not stop the
    /// remaining channels; they are collected and returned together as
    /// [`Error::Calibration`] after the slot is otherwise up.
    ///
    /// # Panics
    ///
    /// Panics if `chip` is not below [`NUM_CHIPS`].
    pub fn configure(&mut self, chip: usize, cfg: &SdrConfig) -> Result<(), Error> {
        assert!(chip < NUM_CHIPS, "chip index {chip} out of range");
        let role = ROLES[chip];
        config::validate(cfg, role)?;
        info!(chip, role = role.name(), "configuring slot");

        let pa_snapshot = self.power_amps_off()?;

        if !cfg.skip_defaults {
            Trx7::new(&mut self.pipe, chip as u8).apply_defaults(role != ChipRole::Primary)?;
        }
        if cfg.reference_clock > 0.0 {
            self.ref_clk[chip] = cfg.reference_clock;
        }

        self.tune_oscillators(chip, cfg)?;
        self.apply_rates(chip, role, cfg)?;

        let mut failures = Vec::new();
        for ch in 0..2u8 {
            for dir in [TrxDir::Rx, TrxDir::Tx] {
                self.bring_up_chain(chip, role, cfg, ch, dir, &mut failures)?;
            }
        }
        Trx7::new(&mut self.pipe, chip as u8).set_active_channel(TrxChannel::A)?;

        self.power_amps_on(role, cfg, pa_snapshot)?;

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(count = failures.len(), "calibration failures");
            Err(Error::Calibration(failures))
        }
    }

    /// Select an RF path on a running slot without a full reconfigure.
    ///
    /// `channel` is a board-level stream index (0..[`NUM_CHANNELS`]).
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not below [`NUM_CHANNELS`].
    pub fn set_path(&mut self, dir: TrxDir, channel: u8, path: u8) -> Result<(), Error> {
        assert!((channel as usize) < NUM_CHANNELS, "channel {channel} out of range");
        let chip = channel / 2;
        let role = ROLES[chip as usize];
        role.check_path(dir, path)?;
        let plan = path::routing(role, dir, channel % 2, path);
        self.apply_routing(chip, channel % 2, &plan)
    }

    /// Directly set the converter clock behind one stream channel.
    ///
    /// On the primary slot this replans the chip's internal clock
    /// generator for the given rate with automatic oversampling; on the
    /// other slots it programs the matching clock-distribution output.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not below [`NUM_CHANNELS`].
    pub fn set_sample_clock(&mut self, freq_hz: f64, channel: u8) -> Result<(), Error> {
        assert!((channel as usize) < NUM_CHANNELS, "channel {channel} out of range");
        let chip = (channel / 2) as usize;
        match ROLES[chip] {
            ChipRole::Primary => {
                let plan = rate::plan(freq_hz, 0, 0)?;
                rate::apply(&mut self.pipe, chip as u8, self.ref_clk[chip], &plan)
            }
            ChipRole::Duplex => {
                let out = if channel % 2 == 0 { ClkOutput::DuplexRxA } else { ClkOutput::DuplexRxB };
                ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ).set_frequency(out, freq_hz, true)
            }
            ChipRole::Monitor => {
                let out = if channel % 2 == 0 { ClkOutput::MonitorRxA } else { ClkOutput::MonitorRxB };
                ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ).set_frequency(out, freq_hz, true)
            }
        }
    }

    /// Read the effective host-facing sample rate of one stream channel.
    pub fn sample_rate(&mut self, channel: u8, dir: TrxDir) -> Result<f64, Error> {
        assert!((channel as usize) < NUM_CHANNELS, "channel {channel} out of range");
        let chip = (channel / 2) as usize;
        match ROLES[chip] {
            ChipRole::Primary => {
                Ok(rate::read_back(&mut self.pipe, chip as u8, self.ref_clk[chip], dir)?)
            }
            ChipRole::Duplex => {
                let mut cg = ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ);
                match dir {
                    TrxDir::Rx => {
                        let out = if channel % 2 == 0 { ClkOutput::DuplexRxA } else { ClkOutput::DuplexRxB };
                        Ok(cg.frequency(out)?)
                    }
                    TrxDir::Tx => {
                        let dac_hz = cg.frequency(ClkOutput::DuplexTx)?;
                        let os = Fpga::new(&mut self.pipe).equalizer_oversample()?;
                        Ok(dac_hz / f64::from(dac_factor(os as u8)))
                    }
                }
            }
            ChipRole::Monitor => match dir {
                TrxDir::Rx => {
                    let out = if channel % 2 == 0 { ClkOutput::MonitorRxA } else { ClkOutput::MonitorRxB };
                    Ok(ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ).frequency(out)?)
                }
                TrxDir::Tx => Ok(0.0),
            },
        }
    }

    fn power_amps_off(&mut self) -> Result<PaReg, Error> {
        let mut fpga = Fpga::new(&mut self.pipe);
        let snapshot = PaReg(fpga.read_pa_ctrl()?);
        fpga.write_pa_ctrl(snapshot.all_off())?;
        Ok(snapshot)
    }

    fn power_amps_on(
        &mut self,
        role: ChipRole,
        cfg: &SdrConfig,
        snapshot: PaReg,
    ) -> Result<(), Error> {
        let mut pa = snapshot;
        for ch in 0..2u8 {
            let c = &cfg.channels[ch as usize];
            match role {
                ChipRole::Primary => pa = pa.with_primary_pa(ch, c.tx.enabled),
                ChipRole::Duplex => {
                    pa = pa.with_duplex_pa(ch, c.tx.enabled).with_duplex_lna(ch, c.rx.enabled);
                }
                ChipRole::Monitor => {}
            }
        }
        Fpga::new(&mut self.pipe).write_pa_ctrl(pa.0)?;
        Ok(())
    }

    fn tune_oscillators(&mut self, chip: usize, cfg: &SdrConfig) -> Result<(), Error> {
        let rx = active_dir(cfg, TrxDir::Rx).map(|d| d.center_frequency);
        let tx = active_dir(cfg, TrxDir::Tx).map(|d| d.center_frequency);
        let ref_hz = self.ref_clk[chip];
        let mut trx = Trx7::new(&mut self.pipe, chip as u8);
        if let Some(f) = rx {
            trx.tune_synthesizer(TrxDir::Rx, f, ref_hz)?;
        }
        match (rx, tx) {
            (Some(r), Some(t)) if r == t => {
                // Same frequency both ways: share SXR and leave SXT cold.
                trx.enable_sx_tdd(true)?;
            }
            (_, Some(t)) => {
                trx.enable_sx_tdd(false)?;
                trx.tune_synthesizer(TrxDir::Tx, t, ref_hz)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_rates(&mut self, chip: usize, role: ChipRole, cfg: &SdrConfig) -> Result<(), Error> {
        let rx = active_dir(cfg, TrxDir::Rx);
        let tx = active_dir(cfg, TrxDir::Tx);
        if rx.is_none() && tx.is_none() {
            return Ok(());
        }
        match role {
            ChipRole::Primary => {
                let rate = rx.or(tx).map(|d| d.sample_rate).unwrap_or(0.0);
                let rx_os = rx.map(|d| d.oversample).unwrap_or(0);
                let tx_os = tx.map(|d| d.oversample).unwrap_or(0);
                let plan = rate::plan(rate, rx_os, tx_os)?;
                rate::apply(&mut self.pipe, chip as u8, self.ref_clk[chip], &plan)
            }
            ChipRole::Duplex => {
                if let Some(t) = tx {
                    let factor = dac_factor(t.oversample);
                    ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ).set_frequency(
                        ClkOutput::DuplexTx,
                        t.sample_rate * f64::from(factor),
                        true,
                    )?;
                    Fpga::new(&mut self.pipe).set_equalizer_oversample(t.oversample)?;
                }
                for (ch, out) in [(0, ClkOutput::DuplexRxA), (1, ClkOutput::DuplexRxB)] {
                    let d = &cfg.channels[ch].rx;
                    if d.enabled {
                        ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ)
                            .set_frequency(out, d.sample_rate, true)?;
                    }
                }
                Ok(())
            }
            ChipRole::Monitor => {
                for (ch, out) in [(0, ClkOutput::MonitorRxA), (1, ClkOutput::MonitorRxB)] {
                    let d = &cfg.channels[ch].rx;
                    if d.enabled {
                        ClockGen::new(&mut self.pipe, CLOCKGEN_REF_HZ)
                            .set_frequency(out, d.sample_rate, true)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn apply_routing(&mut self, chip: u8, ch: u8, plan: &RoutingPlan) -> Result<(), Error> {
        Fpga::new(&mut self.pipe).update_rf_switches(plan.switches)?;
        let mut trx = Trx7::new(&mut self.pipe, chip);
        trx.set_active_channel(TrxChannel::from_index(ch))?;
        if let Some(sel) = plan.chip.rx_input {
            trx.set_rx_input(sel)?;
        }
        if let Some(band) = plan.chip.tx_band {
            trx.set_tx_band(band)?;
        }
        trx.set_active_channel(TrxChannel::A)?;
        Ok(())
    }

    fn bring_up_chain(
        &mut self,
        chip: usize,
        role: ChipRole,
        cfg: &SdrConfig,
        ch: u8,
        dir: TrxDir,
        failures: &mut Vec<Cal>,
    ) -> Result<(), Error> {
        let d = cfg.channels[ch as usize].dir(dir);
        let sub = chip as u8;
        {
            let mut trx = Trx7::new(&mut self.pipe, sub);
            if role == ChipRole::Primary {
                trx.enable_channel(dir, ch, d.enabled)?;
            } else {
                trx.enable_channel_external(dir, ch, d.enabled)?;
            }
        }

        // A disabled duplex chain must not stay connected to the shared
        // switch bank, so its path is forced to the disconnected state.
        let path = if d.enabled { d.path } else { 0 };
        if d.enabled || role == ChipRole::Duplex {
            let plan = path::routing(role, dir, ch, path);
            self.apply_routing(sub, ch, &plan)?;
        }
        if !d.enabled {
            return Ok(());
        }

        let mut trx = Trx7::new(&mut self.pipe, sub);
        trx.set_active_channel(TrxChannel::from_index(ch))?;
        trx.set_test_signal(dir, d.test_signal)?;
        if role == ChipRole::Primary {
            trx.set_gfir(dir, d.gfir_enabled, d.gfir_bandwidth, d.sample_rate)?;
            // External-converter slots never use the on-chip converters,
            // so only primary chains need their AFE powered here.
            let afe = match (dir, ch) {
                (TrxDir::Rx, 0) => regs::PD_RX_AFE1,
                (TrxDir::Tx, 0) => regs::PD_TX_AFE1,
                (TrxDir::Rx, _) => regs::PD_RX_AFE2,
                (TrxDir::Tx, _) => regs::PD_TX_AFE2,
            };
            trx.modify_field(afe, 0)?;
        }
        if d.calibrate > 0.0 {
            let outcome = trx.run_calibration(dir, d.calibrate)?;
            if outcome.0 != 0 {
                failures.push(Cal { dir, channel: ch, what: "calibration", status: outcome.0 });
            }
        }
        if d.lpf > 0.0 {
            let outcome = trx.tune_lpf(dir, d.lpf)?;
            if outcome.0 != 0 {
                failures.push(Cal { dir, channel: ch, what: "filter tuning", status: outcome.0 });
            }
        }
        trx.set_active_channel(TrxChannel::A)?;
        Ok(())
    }
}
