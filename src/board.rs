//! Board driver primitives.
//!
//! Thin, typed operations over the two register windows: pulses on the
//! control register, synchronization commands, scalers, FIFO setup and
//! drain. Anything with run-level sequencing lives in [`crate::acq`];
//! everything here is a single hardware transaction (or a short pulse).

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::mmio::Mmio;
use crate::regs::{cmd, fifo, h2f, lw, CtrlReg, DccReg, Register, StateReg};

/// Settling time between the edges of a control-register pulse.
const PULSE_SETTLE: Duration = Duration::from_micros(1);
/// Settling time after writing a synchronization command code.
const CMD_SETTLE: Duration = Duration::from_micros(2);

/// One EDA board: the lightweight window carries control/status, the wide
/// window carries hit FIFOs and the slow-control staging RAM.
pub struct Board<M: Mmio> {
    lw: M,
    h2f: M,
}

impl<M: Mmio> Board<M> {
    pub fn new(lw: M, h2f: M) -> Self {
        Self { lw, h2f }
    }

    fn ctrl(&self) -> Result<CtrlReg> {
        Ok(CtrlReg::from_reg(self.lw.read32(lw::CTRL)?))
    }

    fn state(&self) -> Result<StateReg> {
        Ok(StateReg::from_reg(self.lw.read32(lw::STATE)?))
    }

    /// Read-modify-write on the control register.
    fn modify_ctrl<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CtrlReg),
    {
        let mut reg = self.ctrl()?;
        f(&mut reg);
        self.lw.write32(lw::CTRL, reg.to_reg())
    }

    /// Raise a control bit, let it settle, drop it again.
    fn pulse_ctrl<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&mut CtrlReg, bool),
    {
        self.modify_ctrl(|r| f(r, true))?;
        thread::sleep(PULSE_SETTLE);
        self.modify_ctrl(|r| f(r, false))
    }

    pub fn reset_fpga(&self) -> Result<()> {
        self.pulse_ctrl(|r, on| r.fpga_reset = on)
    }

    pub fn reset_hr(&self) -> Result<()> {
        self.pulse_ctrl(|r, on| r.hr_reset = on)
    }

    pub fn pll_locked(&self) -> Result<bool> {
        Ok(self.state()?.pll_locked)
    }

    /// Current 4-bit synchronization FSM state (see [`crate::regs::syncst`]).
    pub fn sync_state(&self) -> Result<u8> {
        Ok(self.state()?.sync_state.into())
    }

    pub fn sc_done(&self) -> Result<bool> {
        Ok(self.state()?.sc_done)
    }

    /// Power up slot `slot`.
    pub fn rfm_on(&self, slot: usize) -> Result<()> {
        self.modify_ctrl(|r| r.rfm_on = (u8::from(r.rfm_on) | 1 << slot).into())
    }

    /// Enable readout for slot `slot`.
    pub fn rfm_enable(&self, slot: usize) -> Result<()> {
        self.modify_ctrl(|r| r.rfm_enable = (u8::from(r.rfm_enable) | 1 << slot).into())
    }

    pub fn syn_select_cmd_dcc(&self) -> Result<()> {
        self.modify_ctrl(|r| r.cmd_dcc = true)
    }

    pub fn syn_select_cmd_soft(&self) -> Result<()> {
        self.modify_ctrl(|r| r.cmd_dcc = false)
    }

    /// Issue a 4-bit soft synchronization command and return to idle.
    pub fn syn_set_cmd(&self, code: u8) -> Result<()> {
        self.modify_ctrl(|r| r.syn_cmd = code.into())?;
        thread::sleep(CMD_SETTLE);
        self.modify_ctrl(|r| r.syn_cmd = cmd::IDLE.into())
    }

    pub fn syn_reset_bcid(&self) -> Result<()> {
        self.syn_set_cmd(cmd::RESET_BCID)
    }

    pub fn syn_start(&self) -> Result<()> {
        self.syn_set_cmd(cmd::START_ACQ)
    }

    pub fn syn_stop(&self) -> Result<()> {
        self.syn_set_cmd(cmd::STOP_ACQ)
    }

    pub fn syn_ramfull_ext(&self) -> Result<()> {
        self.syn_set_cmd(cmd::RAMFULL_EXT)
    }

    /// Arm the host-busy line: the host is ready for the next readout.
    pub fn syn_arm_fifo(&self) -> Result<()> {
        self.modify_ctrl(|r| r.host_busy = true)
    }

    /// Drop the host-busy line after a drained readout. The FSM falls
    /// back to idle before the line may be re-armed; that wait belongs to
    /// the acquisition loop, which polls it stop-aware like every other
    /// wait-state.
    pub fn syn_release_fifo(&self) -> Result<()> {
        self.modify_ctrl(|r| r.host_busy = false)
    }

    /// Latest command latched from the DCC bus.
    pub fn dcc_cmd_mem(&self) -> Result<u8> {
        Ok(DccReg::from_reg(self.lw.read32(lw::DCC)?).cmd_mem.into())
    }

    pub fn cnt_reset(&self) -> Result<()> {
        self.pulse_ctrl(|r, on| r.cnt_reset = on)
    }

    pub fn cnt_start(&self) -> Result<()> {
        self.modify_ctrl(|r| r.cnt_enable = true)
    }

    pub fn cnt_stop(&self) -> Result<()> {
        self.modify_ctrl(|r| r.cnt_enable = false)
    }

    pub fn cnt_hit0(&self, slot: usize) -> Result<u32> {
        self.lw.read32(lw::cnt_hit0(slot))
    }

    pub fn cnt_hit1(&self, slot: usize) -> Result<u32> {
        self.lw.read32(lw::cnt_hit1(slot))
    }

    pub fn cnt_trig(&self) -> Result<u32> {
        self.lw.read32(lw::CNT_TRIG)
    }

    pub fn cnt_bcid24(&self) -> Result<u32> {
        Ok(self.lw.read32(lw::CNT_BCID24)? & 0x00FF_FFFF)
    }

    pub fn cnt_bcid48_msb(&self) -> Result<u32> {
        Ok(self.lw.read32(lw::CNT_BCID48_MSB)? & 0x0000_FFFF)
    }

    pub fn cnt_bcid48_lsb(&self) -> Result<u32> {
        self.lw.read32(lw::CNT_BCID48_LSB)
    }

    /// Full 48-bit bunch-crossing counter.
    pub fn bcid48(&self) -> Result<u64> {
        let msb = self.cnt_bcid48_msb()?;
        let lsb = self.cnt_bcid48_lsb()?;
        Ok((msb as u64) << 32 | lsb as u64)
    }

    /// Prepare the hit FIFO of `slot` for a run: clear the event flag,
    /// mask interrupts, program the watermarks.
    pub fn fifo_init(&self, slot: usize) -> Result<()> {
        let csr = h2f::fifo_csr(slot);
        self.h2f.write32(csr + fifo::EVENT, 0)?;
        self.h2f.write32(csr + fifo::IENABLE, 0)?;
        self.h2f.write32(csr + fifo::ALMOST_FULL, fifo::ALMOST_FULL_LEVEL)?;
        self.h2f.write32(csr + fifo::ALMOST_EMPTY, fifo::ALMOST_EMPTY_LEVEL)
    }

    pub fn fifo_empty(&self, slot: usize) -> Result<bool> {
        let status = self.h2f.read32(h2f::fifo_csr(slot) + fifo::STATUS)?;
        Ok(status & fifo::ST_EMPTY != 0)
    }

    pub fn fifo_level(&self, slot: usize) -> Result<u32> {
        self.h2f.read32(h2f::fifo_csr(slot) + fifo::LEVEL)
    }

    /// Pop one word from the hit FIFO of `slot`.
    pub fn fifo_read(&self, slot: usize) -> Result<u32> {
        self.h2f.read32(h2f::fifo_data(slot))
    }

    /// Route the serial path to the slow-control shift chain.
    pub fn sc_select(&self) -> Result<()> {
        self.modify_ctrl(|r| r.sel_frame = false)
    }

    /// Route the serial path back to the readout frame chain.
    pub fn sc_deselect(&self) -> Result<()> {
        self.modify_ctrl(|r| r.sel_frame = true)
    }

    pub fn sc_reset(&self) -> Result<()> {
        self.pulse_ctrl(|r, on| r.sc_reset = on)
    }

    /// Strobe the start-slow-control bit of `slot`.
    pub fn sc_start(&self, slot: usize) -> Result<()> {
        self.pulse_ctrl(|r, on| {
            let mut bits = u8::from(r.sc_start);
            if on {
                bits |= 1 << slot;
            } else {
                bits &= !(1 << slot);
            }
            r.sc_start = bits.into();
        })
    }

    /// Loopback checkword register of `slot`.
    pub fn sc_check(&self, slot: usize) -> Result<u32> {
        self.lw.read32(lw::sc_check(slot))
    }

    /// Copy the slow-control image into the FPGA staging RAM.
    pub fn hr_cfg_write(&self, image: &[u8]) -> Result<()> {
        self.h2f.write_block(h2f::HR_CFG, image)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::fake::FakeFpga;

    #[test]
    fn test_reset_fpga_pulses_bit() {
        let fake = FakeFpga::new();
        let brd = fake.board();
        brd.reset_fpga().expect("reset failed");
        let writes = fake.ctrl_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0] & 0x1, 0x1);
        assert_eq!(writes[1] & 0x1, 0x0);
    }

    #[test]
    fn test_syn_set_cmd_returns_to_idle() {
        let fake = FakeFpga::new();
        let brd = fake.board();
        brd.syn_reset_bcid().expect("command failed");
        let codes: Vec<u8> = fake
            .ctrl_writes()
            .iter()
            .map(|w| ((w >> 16) & 0xF) as u8)
            .collect();
        assert_eq!(codes, vec![cmd::RESET_BCID, cmd::IDLE]);
    }

    #[test]
    fn test_rfm_bits_accumulate() {
        let fake = FakeFpga::new();
        let brd = fake.board();
        brd.rfm_on(0).unwrap();
        brd.rfm_on(2).unwrap();
        brd.rfm_enable(2).unwrap();
        let last = *fake.ctrl_writes().last().unwrap();
        assert_eq!((last >> 4) & 0xF, 0b0101);
        assert_eq!((last >> 8) & 0xF, 0b0100);
    }

    #[test]
    fn test_fifo_arm_and_release_toggle_host_busy() {
        let fake = FakeFpga::new();
        let brd = fake.board();
        brd.syn_arm_fifo().unwrap();
        brd.syn_release_fifo().unwrap();
        let busy: Vec<u32> = fake
            .ctrl_writes()
            .iter()
            .map(|w| w >> 28 & 0x1)
            .collect();
        assert_eq!(busy, vec![1, 0]);
    }

    #[test]
    fn test_fifo_init_programs_watermarks() {
        let fake = FakeFpga::new();
        let brd = fake.board();
        brd.fifo_init(1).expect("fifo init failed");
        assert_eq!(fake.fifo_watermarks(1), (5081, 2));
    }

    #[test]
    fn test_fifo_drain() {
        let fake = FakeFpga::new();
        fake.load_fifo(0, &[0xdead_beef, 0x0bad_cafe]);
        let brd = fake.board();
        assert!(!brd.fifo_empty(0).unwrap());
        assert_eq!(brd.fifo_level(0).unwrap(), 2);
        assert_eq!(brd.fifo_read(0).unwrap(), 0xdead_beef);
        assert_eq!(brd.fifo_read(0).unwrap(), 0x0bad_cafe);
        assert!(brd.fifo_empty(0).unwrap());
    }

    #[test]
    fn test_bcid48_composition() {
        let fake = FakeFpga::new();
        fake.set_bcid(0x1234, 0x5678_9abc, 0x42);
        let brd = fake.board();
        assert_eq!(brd.bcid48().unwrap(), 0x1234_5678_9abc);
        assert_eq!(brd.cnt_bcid24().unwrap(), 0x42);
    }
}
