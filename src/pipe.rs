//! Control-channel transport and the register access facade.
//!
//! The board is reachable through a packetized command/response pipe (PCIe
//! control BAR or a USB control endpoint). The transport itself is an
//! external collaborator: anything implementing [`ControlPipe`] can carry
//! the fixed-size command blocks. This module frames register reads and
//! writes into those blocks and checks the response status, surfacing byte
//! count or status mismatches as [`HardwareError`].

use std::io;
use std::time::Duration;

use crate::error::HardwareError;

/// Size of one command or response block on the control channel.
pub const BLOCK_SIZE: usize = 64;

/// Maximum number of 32-bit register words per command block.
const WORDS_PER_BLOCK: usize = 14;

/// Default timeout for a single register transaction.
const REG_TIMEOUT: Duration = Duration::from_millis(100);

/// A blocking command/response transport to the board controller.
///
/// `write` sends one fixed-size command block, `read` receives the matching
/// response block. Commands and responses are matched by ordering only, so
/// a caller must run one transaction to completion before issuing the next;
/// the board driver enforces this by owning the pipe exclusively.
///
/// Both calls return the number of bytes actually transferred. A timeout is
/// reported as an [`io::Error`] with kind [`io::ErrorKind::TimedOut`].
pub trait ControlPipe {
    /// Send one command block, returning the bytes written.
    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize>;
    /// Receive one response block, returning the bytes read.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Command opcodes understood by the board controller.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Cmd {
    SpiWrite = 0x21,
    SpiRead = 0x22,
    DeviceReset = 0x40,
}

const STATUS_COMPLETED: u8 = 0x01;

/// One 64-byte command/response block.
///
/// The payload carries up to 14 register words: for writes, bit 31 set,
/// address in bits 30:16, value in bits 15:0; for reads, the address in
/// bits 30:16. Words are big-endian on the wire.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
pub(crate) struct CtrlBlock {
    pub cmd: u8,
    pub status: u8,
    pub word_count: u8,
    pub subdevice: u8,
    pub reserved: [u8; 4],
    pub payload: [u8; 56],
}

impl CtrlBlock {
    pub(crate) fn new(cmd: Cmd, subdevice: u8) -> Self {
        CtrlBlock {
            cmd: cmd as u8,
            status: 0,
            word_count: 0,
            subdevice,
            reserved: [0; 4],
            payload: [0; 56],
        }
    }

    pub(crate) fn set_word(&mut self, idx: usize, word: u32) {
        self.payload[idx * 4..idx * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }

    pub(crate) fn word(&self, idx: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.payload[idx * 4..idx * 4 + 4]);
        u32::from_be_bytes(b)
    }
}

/// Register access to one subdevice over a shared control pipe.
///
/// Subdevices 0..=2 are the three transceiver chips; [`SUBDEV_FPGA`] is the
/// gateware register space. A port borrows the pipe for its lifetime, so
/// only one subdevice can be mid-transaction at a time.
pub(crate) struct SpiPort<'a, P> {
    pipe: &'a mut P,
    subdevice: u8,
}

/// Subdevice address of the FPGA register space.
pub(crate) const SUBDEV_FPGA: u8 = 3;

impl<'a, P: ControlPipe> SpiPort<'a, P> {
    pub(crate) fn new(pipe: &'a mut P, subdevice: u8) -> Self {
        SpiPort { pipe, subdevice }
    }

    fn transact(&mut self, block: &CtrlBlock) -> Result<CtrlBlock, HardwareError> {
        let sent = self.pipe.write(bytemuck::bytes_of(block), REG_TIMEOUT)?;
        if sent != BLOCK_SIZE {
            return Err(HardwareError::ShortTransfer {
                expected: BLOCK_SIZE,
                got: sent,
            });
        }
        let mut resp = [0u8; BLOCK_SIZE];
        let got = self.pipe.read(&mut resp, REG_TIMEOUT)?;
        if got != BLOCK_SIZE {
            return Err(HardwareError::ShortTransfer {
                expected: BLOCK_SIZE,
                got,
            });
        }
        let resp: CtrlBlock = bytemuck::pod_read_unaligned(&resp);
        if resp.status != STATUS_COMPLETED {
            return Err(HardwareError::Status(resp.status));
        }
        Ok(resp)
    }

    /// Write a batch of (address, value) pairs, in order.
    pub(crate) fn write_regs(&mut self, regs: &[(u16, u16)]) -> Result<(), HardwareError> {
        for chunk in regs.chunks(WORDS_PER_BLOCK) {
            let mut block = CtrlBlock::new(Cmd::SpiWrite, self.subdevice);
            block.word_count = chunk.len() as u8;
            for (i, (addr, value)) in chunk.iter().enumerate() {
                block.set_word(i, 0x8000_0000 | ((*addr as u32) << 16) | *value as u32);
            }
            self.transact(&block)?;
        }
        Ok(())
    }

    pub(crate) fn write_reg(&mut self, addr: u16, value: u16) -> Result<(), HardwareError> {
        self.write_regs(&[(addr, value)])
    }

    pub(crate) fn read_reg(&mut self, addr: u16) -> Result<u16, HardwareError> {
        let mut block = CtrlBlock::new(Cmd::SpiRead, self.subdevice);
        block.word_count = 1;
        block.set_word(0, (addr as u32) << 16);
        let resp = self.transact(&block)?;
        Ok(resp.word(0) as u16)
    }

    /// Read-modify-write: clear `mask`, then set `value & mask`.
    ///
    /// Always re-reads the register first so bits belonging to a sibling
    /// channel sharing the register are never disturbed.
    pub(crate) fn modify_reg(
        &mut self,
        addr: u16,
        mask: u16,
        value: u16,
    ) -> Result<(), HardwareError> {
        let old = self.read_reg(addr)?;
        self.write_reg(addr, (old & !mask) | (value & mask))
    }

    /// Issue a device-level reset of this subdevice.
    pub(crate) fn device_reset(&mut self) -> Result<(), HardwareError> {
        let block = CtrlBlock::new(Cmd::DeviceReset, self.subdevice);
        self.transact(&block)?;
        Ok(())
    }
}
