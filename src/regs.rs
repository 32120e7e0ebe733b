//! EDA FPGA register map.
//!
//! Offsets are hardware constants of the FPGA image; the driver treats
//! them as opaque. Control and status registers are modeled as
//! [`packed_struct`] bitfields so that read-modify-write sequences go
//! through named fields instead of shift-and-mask arithmetic.

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

use std::fmt::Debug;

/// `Register` trait represents a 32-bit register of the FPGA fabric.
/// A register:
///
/// * supports being serialized from/to register format (`from_reg`/`to_reg`)
/// * lives at a fixed byte offset in its bridge window (`OFFSET`)
/// * is 4 bytes long (one "word")
pub trait Register: PackedStruct<[u8; 4]> + Send + Sync + PartialEq + Debug {
    const OFFSET: usize;

    /// Take register and unpack (as big endian)
    fn from_reg(reg: u32) -> Self {
        Self::unpack(&reg.to_be_bytes()).expect("unpacking error")
    }
    /// Pack into big-endian register
    fn to_reg(&self) -> u32 {
        u32::from_be_bytes(self.pack())
    }
}

/// Lightweight-bridge register offsets.
pub mod lw {
    /// Control register ([`super::CtrlReg`]).
    pub const CTRL: usize = 0x00;
    /// State register ([`super::StateReg`]), read-only.
    pub const STATE: usize = 0x04;
    /// DCC counter register ([`super::DccReg`]), read-only.
    pub const DCC: usize = 0x08;
    /// Per-slot hit scaler, plane 0.
    pub const CNT_HIT0: usize = 0x10;
    /// Per-slot hit scaler, plane 1.
    pub const CNT_HIT1: usize = 0x20;
    /// Trigger scaler.
    pub const CNT_TRIG: usize = 0x30;
    /// 24-bit bunch-crossing counter.
    pub const CNT_BCID24: usize = 0x34;
    /// Upper 16 bits of the 48-bit bunch-crossing counter.
    pub const CNT_BCID48_MSB: usize = 0x38;
    /// Lower 32 bits of the 48-bit bunch-crossing counter.
    pub const CNT_BCID48_LSB: usize = 0x3C;
    /// Per-slot slow-control loopback checkword.
    pub const SC_CHECK: usize = 0x50;

    pub fn cnt_hit0(slot: usize) -> usize {
        CNT_HIT0 + 4 * slot
    }
    pub fn cnt_hit1(slot: usize) -> usize {
        CNT_HIT1 + 4 * slot
    }
    pub fn sc_check(slot: usize) -> usize {
        SC_CHECK + 4 * slot
    }
}

/// Wide-bridge (H2F) offsets.
pub mod h2f {
    /// Per-slot FIFO data pop port.
    pub const FIFO_DATA: usize = 0x0000;
    const FIFO_DATA_STRIDE: usize = 0x10;
    /// Per-slot FIFO CSR cluster base.
    pub const FIFO_CSR: usize = 0x0100;
    const FIFO_CSR_STRIDE: usize = 0x18;
    /// Slow-control staging RAM.
    pub const HR_CFG: usize = 0x1000;

    pub fn fifo_data(slot: usize) -> usize {
        FIFO_DATA + FIFO_DATA_STRIDE * slot
    }
    pub fn fifo_csr(slot: usize) -> usize {
        FIFO_CSR + FIFO_CSR_STRIDE * slot
    }
}

/// FIFO CSR cluster: six 32-bit pins at consecutive offsets.
pub mod fifo {
    pub const LEVEL: usize = 0x00;
    pub const STATUS: usize = 0x04;
    pub const EVENT: usize = 0x08;
    pub const IENABLE: usize = 0x0C;
    pub const ALMOST_FULL: usize = 0x10;
    pub const ALMOST_EMPTY: usize = 0x14;

    /// Fill level (in words) that raises the almost-full flag.
    pub const ALMOST_FULL_LEVEL: u32 = 5081;
    /// Fill level that raises the almost-empty flag.
    pub const ALMOST_EMPTY_LEVEL: u32 = 2;
    /// Status bit flagging an empty FIFO.
    pub const ST_EMPTY: u32 = 1 << 1;
}

/// Synchronization FSM states as read from [`StateReg::sync_state`].
/// Ordering matters: the acquisition loop gates on ranges of these.
pub mod syncst {
    pub const IDLE: u8 = 0x0;
    pub const RESET_BCID: u8 = 0x1;
    pub const ACQUIRING: u8 = 0x2;
    pub const RAMFULL: u8 = 0x3;
    pub const START_RO: u8 = 0x4;
    pub const WAIT_END_RO: u8 = 0x5;
    pub const FIFO_READY: u8 = 0x6;
    pub const STOP_RUN: u8 = 0x7;
}

/// Synchronization command codes (4 bits wide).
pub mod cmd {
    pub const IDLE: u8 = 0x0;
    pub const RESET_BCID: u8 = 0x1;
    pub const START_ACQ: u8 = 0x2;
    pub const RAMFULL_EXT: u8 = 0x4;
    pub const STOP_ACQ: u8 = 0x8;
}

/// Board control register.
#[derive(PackedStruct, Clone, Debug, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct CtrlReg {
    /// FPGA logic reset (pulse).
    #[packed_field(bits = "0")]
    pub fpga_reset: bool,

    /// Hardroc reset line (pulse).
    #[packed_field(bits = "1")]
    pub hr_reset: bool,

    /// Per-slot power-on bits.
    #[packed_field(bits = "7:4")]
    pub rfm_on: Integer<u8, packed_bits::Bits4>,

    /// Per-slot readout-enable bits.
    #[packed_field(bits = "11:8")]
    pub rfm_enable: Integer<u8, packed_bits::Bits4>,

    /// Command source: set = DCC bus, cleared = soft commands.
    #[packed_field(bits = "12")]
    pub cmd_dcc: bool,

    /// Soft synchronization command code.
    #[packed_field(bits = "19:16")]
    pub syn_cmd: Integer<u8, packed_bits::Bits4>,

    /// Serial mux: set routes the readout frame path, cleared routes the
    /// slow-control path to the chips.
    #[packed_field(bits = "20")]
    pub sel_frame: bool,

    /// Slow-control sub-block reset (pulse).
    #[packed_field(bits = "21")]
    pub sc_reset: bool,

    /// Per-slot start-slow-control strobes (pulse).
    #[packed_field(bits = "27:24")]
    pub sc_start: Integer<u8, packed_bits::Bits4>,

    /// Host-busy line: armed while the host is ready for a readout.
    #[packed_field(bits = "28")]
    pub host_busy: bool,

    /// Scaler enable.
    #[packed_field(bits = "29")]
    pub cnt_enable: bool,

    /// Scaler reset (pulse).
    #[packed_field(bits = "30")]
    pub cnt_reset: bool,
}

impl Register for CtrlReg {
    const OFFSET: usize = lw::CTRL;
}

impl Default for CtrlReg {
    fn default() -> Self {
        Self {
            fpga_reset: false,
            hr_reset: false,
            rfm_on: 0.into(),
            rfm_enable: 0.into(),
            cmd_dcc: false,
            syn_cmd: cmd::IDLE.into(),
            sel_frame: false,
            sc_reset: false,
            sc_start: 0.into(),
            host_busy: false,
            cnt_enable: false,
            cnt_reset: false,
        }
    }
}

/// Board state register (read-only).
#[derive(PackedStruct, Clone, Debug, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct StateReg {
    /// Clock distribution is locked.
    #[packed_field(bits = "0")]
    pub pll_locked: bool,

    /// Synchronization FSM state (see [`syncst`]).
    #[packed_field(bits = "7:4")]
    pub sync_state: Integer<u8, packed_bits::Bits4>,

    /// Slow-control serializer finished shifting the configuration.
    #[packed_field(bits = "8")]
    pub sc_done: bool,
}

impl Register for StateReg {
    const OFFSET: usize = lw::STATE;
}

impl Default for StateReg {
    fn default() -> Self {
        Self {
            pll_locked: false,
            sync_state: syncst::IDLE.into(),
            sc_done: false,
        }
    }
}

/// DCC counter register (read-only): 24-bit frame counter plus the code
/// of the latest command captured from the DCC bus.
#[derive(PackedStruct, Clone, Debug, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct DccReg {
    /// Latest command currently decoded on the bus.
    #[packed_field(bits = "3:0")]
    pub cmd_now: Integer<u8, packed_bits::Bits4>,

    /// Latest command latched in memory.
    #[packed_field(bits = "7:4")]
    pub cmd_mem: Integer<u8, packed_bits::Bits4>,

    /// DCC frame counter.
    #[packed_field(bits = "23:8")]
    pub frames: Integer<u16, packed_bits::Bits16>,
}

impl Register for DccReg {
    const OFFSET: usize = lw::DCC;
}

impl Default for DccReg {
    fn default() -> Self {
        Self {
            cmd_now: 0.into(),
            cmd_mem: 0.into(),
            frames: 0.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ctrl_reg_pack() {
        let reg = CtrlReg {
            rfm_on: 0b0011.into(),
            rfm_enable: 0b0001.into(),
            cmd_dcc: true,
            syn_cmd: cmd::START_ACQ.into(),
            sel_frame: true,
            host_busy: true,
            cnt_enable: true,
            ..Default::default()
        };
        let expected_reg = [0x30u8, 0x12, 0x11, 0x30];
        let reg_bytes = reg.pack();
        assert_eq!(
            reg_bytes, expected_reg,
            "Incorrectly composed register:{:#04x?} sliced view: {:#04x?} expected view: {:#04x?}",
            reg, reg_bytes, expected_reg
        );
        assert_eq!(reg.to_reg(), 0x3012_1130);
    }

    #[test]
    fn test_ctrl_reg_round_trip() {
        let reg = CtrlReg {
            fpga_reset: true,
            sc_reset: true,
            sc_start: 0b0100.into(),
            cnt_reset: true,
            ..Default::default()
        };
        assert_eq!(CtrlReg::from_reg(reg.to_reg()), reg);
    }

    #[test]
    fn test_state_reg_unpack() {
        let reg = StateReg::from_reg(0x0000_0161);
        assert!(reg.pll_locked);
        assert!(reg.sc_done);
        assert_eq!(u8::from(reg.sync_state), syncst::FIFO_READY);
    }

    #[test]
    fn test_dcc_reg_unpack() {
        let reg = DccReg::from_reg(0x0000_2510);
        assert_eq!(u8::from(reg.cmd_mem), cmd::RESET_BCID);
        assert_eq!(u8::from(reg.cmd_now), 0);
        assert_eq!(u16::from(reg.frames), 0x25);
    }

    #[test]
    fn test_fifo_cluster_offsets() {
        assert_eq!(h2f::fifo_csr(0) + fifo::ALMOST_EMPTY, 0x114);
        assert_eq!(h2f::fifo_csr(3), 0x148);
        assert_eq!(h2f::fifo_data(2), 0x20);
        assert_eq!(lw::sc_check(3), 0x5C);
    }
}
