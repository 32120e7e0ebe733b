//! Behavioral fake of the EDA FPGA fabric.
//!
//! Implements [`Mmio`] over an in-memory model that mimics the pieces of
//! the hardware contract the driver relies on: PLL lock after a few
//! status polls, the slow-control handshake with loopback checkword, the
//! synchronization FSM walking `IDLE -> START_RO -> FIFO_READY` per
//! armed cycle, and per-slot hit FIFOs loaded from a script of cycles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::board::Board;
use crate::error::Result;
use crate::mmio::Mmio;
use crate::regs::{cmd, fifo, h2f, lw, syncst};
use crate::NUM_RFM;

const BIT_SC_RESET: u32 = 1 << 21;
const BIT_HOST_BUSY: u32 = 1 << 28;
const SC_START_MASK: u32 = 0xF << 24;

#[derive(Default)]
struct FifoCsr {
    event: u32,
    ienable: u32,
    almost_full: u32,
    almost_empty: u32,
}

struct FakeCore {
    ctrl: u32,
    ctrl_writes: Vec<u32>,

    state_reads: u32,
    pll_locks_after: u32,
    pll_never: bool,

    in_cycle: bool,
    ro_polls: u32,
    cycles: VecDeque<[Vec<u32>; NUM_RFM]>,

    sc_done: bool,
    sc_stuck: bool,
    loopback_corrupt: bool,
    loopback: [u32; NUM_RFM],
    cfg_ram: Vec<u8>,

    dcc_reads: u32,
    dcc_cmd_after: u32,
    trig: u32,
    bcid24: u32,
    bcid48_msb: u32,
    bcid48_lsb: u32,
    hits0: [u32; NUM_RFM],
    hits1: [u32; NUM_RFM],

    fifos: [VecDeque<u32>; NUM_RFM],
    csr: [FifoCsr; NUM_RFM],
}

impl FakeCore {
    fn new() -> Self {
        Self {
            ctrl: 0,
            ctrl_writes: Vec::new(),
            state_reads: 0,
            pll_locks_after: 2,
            pll_never: false,
            in_cycle: false,
            ro_polls: 0,
            cycles: VecDeque::new(),
            sc_done: false,
            sc_stuck: false,
            loopback_corrupt: false,
            loopback: [0; NUM_RFM],
            cfg_ram: vec![0; crate::sc::IMAGE_LEN],
            dcc_reads: 0,
            dcc_cmd_after: 2,
            trig: 7,
            bcid24: 0,
            bcid48_msb: 0,
            bcid48_lsb: 0,
            hits0: [0; NUM_RFM],
            hits1: [0; NUM_RFM],
            fifos: Default::default(),
            csr: Default::default(),
        }
    }

    fn read_state(&mut self) -> u32 {
        self.state_reads += 1;
        let pll = !self.pll_never && self.state_reads > self.pll_locks_after;
        let sync = if self.in_cycle {
            self.ro_polls += 1;
            if self.ro_polls <= 2 {
                syncst::START_RO
            } else {
                syncst::FIFO_READY
            }
        } else {
            syncst::IDLE
        };
        pll as u32 | (sync as u32) << 4 | (self.sc_done as u32) << 8
    }

    fn write_ctrl(&mut self, v: u32) {
        let rising = v & !self.ctrl;
        let falling = self.ctrl & !v;
        self.ctrl = v;
        self.ctrl_writes.push(v);

        if rising & BIT_SC_RESET != 0 && !self.sc_stuck {
            self.sc_done = false;
        }
        if rising & SC_START_MASK != 0 {
            let slot = ((rising & SC_START_MASK) >> 24).trailing_zeros() as usize;
            let word = u32::from_le_bytes(self.cfg_ram[..4].try_into().unwrap());
            self.loopback[slot] = if self.loopback_corrupt { !word } else { word };
            self.sc_done = true;
        }
        if rising & BIT_HOST_BUSY != 0 {
            if let Some(loads) = self.cycles.pop_front() {
                for (slot, words) in loads.into_iter().enumerate() {
                    self.fifos[slot].extend(words);
                }
                self.in_cycle = true;
                self.ro_polls = 0;
            }
        }
        if falling & BIT_HOST_BUSY != 0 {
            self.in_cycle = false;
        }
    }

    fn read_lw(&mut self, off: usize) -> u32 {
        match off {
            lw::CTRL => self.ctrl,
            lw::STATE => self.read_state(),
            lw::DCC => {
                self.dcc_reads += 1;
                if self.dcc_reads > self.dcc_cmd_after {
                    (cmd::RESET_BCID as u32) << 4
                } else {
                    0
                }
            }
            lw::CNT_TRIG => self.trig,
            lw::CNT_BCID24 => self.bcid24,
            lw::CNT_BCID48_MSB => self.bcid48_msb,
            lw::CNT_BCID48_LSB => self.bcid48_lsb,
            _ if (lw::CNT_HIT0..lw::CNT_HIT0 + 4 * NUM_RFM).contains(&off) => {
                self.hits0[(off - lw::CNT_HIT0) / 4]
            }
            _ if (lw::CNT_HIT1..lw::CNT_HIT1 + 4 * NUM_RFM).contains(&off) => {
                self.hits1[(off - lw::CNT_HIT1) / 4]
            }
            _ if (lw::SC_CHECK..lw::SC_CHECK + 4 * NUM_RFM).contains(&off) => {
                self.loopback[(off - lw::SC_CHECK) / 4]
            }
            _ => 0,
        }
    }

    fn read_h2f(&mut self, off: usize) -> u32 {
        if off >= h2f::FIFO_CSR {
            let slot = (off - h2f::FIFO_CSR) / 0x18;
            let reg = (off - h2f::FIFO_CSR) % 0x18;
            return match reg {
                fifo::LEVEL => self.fifos[slot].len() as u32,
                fifo::STATUS => {
                    if self.fifos[slot].is_empty() {
                        fifo::ST_EMPTY
                    } else {
                        0
                    }
                }
                fifo::EVENT => self.csr[slot].event,
                fifo::IENABLE => self.csr[slot].ienable,
                fifo::ALMOST_FULL => self.csr[slot].almost_full,
                fifo::ALMOST_EMPTY => self.csr[slot].almost_empty,
                _ => 0,
            };
        }
        let slot = (off - h2f::FIFO_DATA) / 0x10;
        self.fifos[slot].pop_front().unwrap_or(0)
    }

    fn write_h2f(&mut self, off: usize, v: u32) {
        if off >= h2f::FIFO_CSR && off < h2f::HR_CFG {
            let slot = (off - h2f::FIFO_CSR) / 0x18;
            match (off - h2f::FIFO_CSR) % 0x18 {
                fifo::EVENT => self.csr[slot].event = v,
                fifo::IENABLE => self.csr[slot].ienable = v,
                fifo::ALMOST_FULL => self.csr[slot].almost_full = v,
                fifo::ALMOST_EMPTY => self.csr[slot].almost_empty = v,
                _ => {}
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Win {
    Lw,
    H2f,
}

/// One bridge window of the fake, handed to [`Board`].
pub struct FakeWindow {
    core: Arc<Mutex<FakeCore>>,
    win: Win,
}

impl Mmio for FakeWindow {
    fn read32(&self, off: usize) -> Result<u32> {
        let mut core = self.core.lock().unwrap();
        Ok(match self.win {
            Win::Lw => core.read_lw(off),
            Win::H2f => core.read_h2f(off),
        })
    }

    fn write32(&self, off: usize, v: u32) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        match self.win {
            Win::Lw => {
                if off == lw::CTRL {
                    core.write_ctrl(v);
                }
            }
            Win::H2f => core.write_h2f(off, v),
        }
        Ok(())
    }

    fn write_block(&self, off: usize, data: &[u8]) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if matches!(self.win, Win::H2f) && off == h2f::HR_CFG {
            core.cfg_ram[..data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn read_block(&self, off: usize, data: &mut [u8]) -> Result<()> {
        let core = self.core.lock().unwrap();
        if matches!(self.win, Win::H2f) && off == h2f::HR_CFG {
            data.copy_from_slice(&core.cfg_ram[..data.len()]);
        }
        Ok(())
    }
}

/// Scripting and inspection handle shared with the windows.
#[derive(Clone)]
pub struct FakeFpga {
    core: Arc<Mutex<FakeCore>>,
}

impl FakeFpga {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Mutex::new(FakeCore::new())),
        }
    }

    pub fn windows(&self) -> (FakeWindow, FakeWindow) {
        (
            FakeWindow {
                core: self.core.clone(),
                win: Win::Lw,
            },
            FakeWindow {
                core: self.core.clone(),
                win: Win::H2f,
            },
        )
    }

    pub fn board(&self) -> Board<FakeWindow> {
        let (lw, h2f) = self.windows();
        Board::new(lw, h2f)
    }

    /// Queue the FIFO contents of one acquisition cycle.
    pub fn push_cycle(&self, loads: [Vec<u32>; NUM_RFM]) {
        self.core.lock().unwrap().cycles.push_back(loads);
    }

    /// Load words straight into a slot's FIFO (outside any cycle).
    pub fn load_fifo(&self, slot: usize, words: &[u32]) {
        self.core.lock().unwrap().fifos[slot].extend(words);
    }

    pub fn set_bcid(&self, msb: u32, lsb: u32, bcid24: u32) {
        let mut core = self.core.lock().unwrap();
        core.bcid48_msb = msb;
        core.bcid48_lsb = lsb;
        core.bcid24 = bcid24;
    }

    pub fn set_trig(&self, trig: u32) {
        self.core.lock().unwrap().trig = trig;
    }

    pub fn set_hits(&self, slot: usize, hits0: u32, hits1: u32) {
        let mut core = self.core.lock().unwrap();
        core.hits0[slot] = hits0;
        core.hits1[slot] = hits1;
    }

    pub fn set_pll_never(&self, never: bool) {
        self.core.lock().unwrap().pll_never = never;
    }

    pub fn set_sc_stuck(&self, stuck: bool) {
        let mut core = self.core.lock().unwrap();
        core.sc_stuck = stuck;
        core.sc_done = stuck;
    }

    pub fn set_loopback_corrupt(&self, corrupt: bool) {
        self.core.lock().unwrap().loopback_corrupt = corrupt;
    }

    pub fn ctrl_writes(&self) -> Vec<u32> {
        self.core.lock().unwrap().ctrl_writes.clone()
    }

    pub fn cfg_ram(&self) -> Vec<u8> {
        self.core.lock().unwrap().cfg_ram.clone()
    }

    pub fn fifo_watermarks(&self, slot: usize) -> (u32, u32) {
        let core = self.core.lock().unwrap();
        (core.csr[slot].almost_full, core.csr[slot].almost_empty)
    }
}
