//! Slow-control configuration engine.
//!
//! Per-chip configuration travels to the hardrocs as one long serial
//! shift: 872 bits per chip, eight chips per chamber, staged in a byte
//! image the FPGA shifts out verbatim. The image layout is dictated by
//! the serializer: 4 checkword bytes, then the chip blocks in reverse
//! chip order, with bit-address `a` of chip `c` living at byte
//! `4 + (7-c)*109 + 108 - a/8`, bit `a%8`. Every bit-level accessor here
//! goes through that rule; getting it wrong silently misconfigures the
//! chips.

use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::board::Board;
use crate::cfg::Asic;
use crate::error::{ErrorKind, Result};
use crate::mmio::Mmio;
use crate::{NUM_CHANNELS, NUM_HR};

/// Bytes of serialized configuration per chip.
pub const HR_BYTES: usize = 109;
/// Bits of configuration per chip.
pub const HR_BITS: usize = 872;
/// Checkword prefix ahead of the chip blocks.
const PREFIX_LEN: usize = 4;
/// Full staging image: checkword plus eight chip blocks.
pub const IMAGE_LEN: usize = PREFIX_LEN + NUM_HR * HR_BYTES;

/// The two loopback checkwords; consecutive transmissions alternate
/// between them so a stale readback cannot pass verification.
const CHECK_A: u32 = 0xCAFE_FADE;
const CHECK_B: u32 = 0x36BA_FFE5;

/// Spacing between polls of the serializer-done bit.
const SC_DONE_POLL: Duration = Duration::from_micros(10);
/// Poll budget before declaring the serializer dead (1 s).
const SC_DONE_POLLS: u32 = 100_000;

// Bit addresses from the hardroc datasheet.
const ADDR_PA_GAIN: usize = 64;
const ADDR_SW_CS: usize = 600;
const ADDR_SW_RS: usize = 606;
const ADDR_MASK: usize = 618;
const ADDR_CHIP_ID: usize = 810;
const ADDR_DAC: usize = 818;

/// The slow-control staging buffer for one chamber.
#[derive(Clone)]
pub struct SlowControl {
    image: [u8; IMAGE_LEN],
}

impl SlowControl {
    pub fn new() -> Self {
        Self {
            image: [0u8; IMAGE_LEN],
        }
    }

    /// Raw staging image, checkword prefix included.
    pub fn image(&self) -> &[u8; IMAGE_LEN] {
        &self.image
    }

    /// Serialized block of one chip.
    pub fn chip_block(&self, chip: usize) -> &[u8] {
        assert!(chip < NUM_HR);
        let start = PREFIX_LEN + (NUM_HR - 1 - chip) * HR_BYTES;
        &self.image[start..start + HR_BYTES]
    }

    fn locate(chip: usize, addr: usize) -> (usize, u8) {
        assert!(chip < NUM_HR, "chip {} out of range", chip);
        assert!(addr < HR_BITS, "bit address {} out of range", addr);
        let byte = PREFIX_LEN + (NUM_HR - 1 - chip) * HR_BYTES + (HR_BYTES - 1 - addr / 8);
        (byte, 1 << (addr % 8))
    }

    pub fn set_bit(&mut self, chip: usize, addr: usize, on: bool) {
        let (byte, mask) = Self::locate(chip, addr);
        if on {
            self.image[byte] |= mask;
        } else {
            self.image[byte] &= !mask;
        }
    }

    pub fn get_bit(&self, chip: usize, addr: usize) -> bool {
        let (byte, mask) = Self::locate(chip, addr);
        self.image[byte] & mask != 0
    }

    /// Write an `nbits`-wide word with its LSB at `addr`.
    pub fn set_word(&mut self, chip: usize, addr: usize, nbits: usize, v: u32) {
        assert!(nbits <= 32);
        for k in 0..nbits {
            self.set_bit(chip, addr + k, v >> k & 1 != 0);
        }
    }

    pub fn get_word(&self, chip: usize, addr: usize, nbits: usize) -> u32 {
        let mut v = 0;
        for k in 0..nbits {
            v |= (self.get_bit(chip, addr + k) as u32) << k;
        }
        v
    }

    /// Write an `nbits`-wide word with its MSB at `addr`.
    pub fn set_word_msb(&mut self, chip: usize, addr: usize, nbits: usize, v: u32) {
        assert!(nbits <= 32);
        for k in 0..nbits {
            self.set_bit(chip, addr + k, v >> (nbits - 1 - k) & 1 != 0);
        }
    }

    pub fn get_word_msb(&self, chip: usize, addr: usize, nbits: usize) -> u32 {
        let mut v = 0;
        for k in 0..nbits {
            v |= (self.get_bit(chip, addr + k) as u32) << (nbits - 1 - k);
        }
        v
    }

    /// Preamplifier gain of one channel.
    pub fn set_preamp_gain(&mut self, chip: usize, ch: usize, gain: u8) {
        assert!(ch < NUM_CHANNELS);
        self.set_word(chip, ADDR_PA_GAIN + 8 * ch, 8, gain as u32);
    }

    pub fn preamp_gain(&self, chip: usize, ch: usize) -> u8 {
        assert!(ch < NUM_CHANNELS);
        self.get_word(chip, ADDR_PA_GAIN + 8 * ch, 8) as u8
    }

    /// Per-channel discriminator mask (3 bits, one per threshold plane).
    pub fn set_mask(&mut self, chip: usize, ch: usize, mask: u8) {
        assert!(ch < NUM_CHANNELS);
        assert!(mask < 8, "mask {} out of range", mask);
        self.set_word(chip, ADDR_MASK + 3 * ch, 3, mask as u32);
    }

    pub fn mask(&self, chip: usize, ch: usize) -> u8 {
        assert!(ch < NUM_CHANNELS);
        self.get_word(chip, ADDR_MASK + 3 * ch, 3) as u8
    }

    pub fn set_chip_id(&mut self, chip: usize, id: u8) {
        self.set_word_msb(chip, ADDR_CHIP_ID, 8, id as u32);
    }

    pub fn chip_id(&self, chip: usize) -> u8 {
        self.get_word_msb(chip, ADDR_CHIP_ID, 8) as u8
    }

    /// One of the three 10-bit discriminator DAC thresholds.
    pub fn set_dac(&mut self, chip: usize, dac: usize, v: u16) {
        assert!(dac < 3, "dac index {} out of range", dac);
        assert!(v < 1 << 10, "dac value {} out of range", v);
        self.set_word(chip, ADDR_DAC + 10 * dac, 10, v as u32);
    }

    pub fn dac(&self, chip: usize, dac: usize) -> u16 {
        assert!(dac < 3);
        self.get_word(chip, ADDR_DAC + 10 * dac, 10) as u16
    }

    /// Shaper feedback resistor switches; the 2-bit code drives both
    /// shaper branches.
    pub fn set_shaper_resis(&mut self, chip: usize, r: u8) {
        assert!(r < 4, "rshaper {} out of range", r);
        self.set_word(chip, ADDR_SW_RS, 2, r as u32);
        self.set_word(chip, ADDR_SW_RS + 2, 2, r as u32);
    }

    pub fn shaper_resis(&self, chip: usize) -> u8 {
        self.get_word(chip, ADDR_SW_RS, 2) as u8
    }

    /// Shaper capacitor switches; the 3-bit code drives both branches.
    pub fn set_shaper_capa(&mut self, chip: usize, c: u8) {
        assert!(c < 8, "cshaper {} out of range", c);
        self.set_word(chip, ADDR_SW_CS, 3, c as u32);
        self.set_word(chip, ADDR_SW_CS + 3, 3, c as u32);
    }

    pub fn shaper_capa(&self, chip: usize) -> u8 {
        self.get_word(chip, ADDR_SW_CS, 3) as u8
    }

    /// Calibration-injection switch of one channel.
    pub fn set_ctest(&mut self, chip: usize, ch: usize, on: bool) {
        assert!(ch < NUM_CHANNELS);
        self.set_bit(chip, ch, on);
    }

    /// Byte-copy the configuration block of `src` over `dst`.
    pub fn copy(&mut self, src: usize, dst: usize) {
        assert!(src < NUM_HR && dst < NUM_HR);
        let from = PREFIX_LEN + (NUM_HR - 1 - src) * HR_BYTES;
        let to = PREFIX_LEN + (NUM_HR - 1 - dst) * HR_BYTES;
        self.image.copy_within(from..from + HR_BYTES, to);
    }

    /// Load chip records injected by the configuration database: each
    /// record is serialized MSB-first starting at bit 871 and walking
    /// down to bit 0.
    pub fn load_from_db(&mut self, cfgs: &[Asic]) -> Result<()> {
        assert!(cfgs.len() <= NUM_HR);
        for (chip, asic) in cfgs.iter().enumerate() {
            let bits = asic.to_bits()?;
            debug_assert_eq!(bits.len(), HR_BITS);
            for (k, bit) in bits.iter().enumerate() {
                self.set_bit(chip, HR_BITS - 1 - k, *bit);
            }
        }
        Ok(())
    }

    /// Load the per-bit base configuration of one chip from a
    /// `conf_base.csv`-shaped file: `addr;name;col3;col4;bit` records
    /// with addresses descending strictly from 871 to 0.
    pub fn load_from_csv<R: BufRead>(&mut self, r: R, chip: usize) -> Result<()> {
        let mut want = HR_BITS as i64 - 1;
        let mut lineno = 0usize;
        for line in r.lines() {
            let line = line?;
            lineno += 1;
            if line.is_empty() {
                continue;
            }
            if want < 0 {
                Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("more than {} records", HR_BITS),
                })?
            }
            let fields: Vec<&str> = line.split(';').collect();
            if fields.len() != 5 {
                Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("want 5 fields, got {}", fields.len()),
                })?
            }
            let addr: i64 = fields[0].parse().map_err(|e| ErrorKind::Config {
                line: lineno,
                detail: format!("bad address {:?}: {}", fields[0], e),
            })?;
            if addr != want {
                Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("want address {}, got {}", want, addr),
                })?
            }
            let bit = match fields[4] {
                "0" => false,
                "1" => true,
                v => Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("bad bit value {:?}", v),
                })?,
            };
            self.set_bit(chip, addr as usize, bit);
            want -= 1;
        }
        if want != -1 {
            Err(ErrorKind::Config {
                line: lineno,
                detail: format!("file stops at address {}, want 0", want + 1),
            })?
        }
        Ok(())
    }

    /// Dump the staged bits in `hr_sc_<run>.csv` shape: `chip;addr;bit`
    /// with chips descending 7..0 and addresses 871..0 within each chip.
    pub fn write_csv<W: Write>(&self, mut w: W) -> Result<()> {
        for chip in (0..NUM_HR).rev() {
            for addr in (0..HR_BITS).rev() {
                writeln!(w, "{};{};{}", chip, addr, self.get_bit(chip, addr) as u8)?;
            }
        }
        Ok(())
    }

    /// Load a full `hr_sc_<run>.csv` dump back into the buffer, e.g. to
    /// replay the configuration of an earlier run.
    pub fn load_hr_sc<R: BufRead>(&mut self, r: R) -> Result<()> {
        let mut n = 0usize;
        let mut lineno = 0usize;
        for line in r.lines() {
            let line = line?;
            lineno += 1;
            if line.is_empty() {
                continue;
            }
            if n >= NUM_HR * HR_BITS {
                Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("more than {} records", NUM_HR * HR_BITS),
                })?
            }
            let fields: Vec<&str> = line.split(';').collect();
            if fields.len() != 3 {
                Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("want 3 fields, got {}", fields.len()),
                })?
            }
            let want_chip = NUM_HR - 1 - n / HR_BITS;
            let want_addr = HR_BITS - 1 - n % HR_BITS;
            let chip: usize = fields[0].parse().map_err(|e| ErrorKind::Config {
                line: lineno,
                detail: format!("bad chip {:?}: {}", fields[0], e),
            })?;
            let addr: usize = fields[1].parse().map_err(|e| ErrorKind::Config {
                line: lineno,
                detail: format!("bad address {:?}: {}", fields[1], e),
            })?;
            if chip != want_chip || addr != want_addr {
                Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!(
                        "want chip {} address {}, got chip {} address {}",
                        want_chip, want_addr, chip, addr
                    ),
                })?
            }
            let bit = match fields[2] {
                "0" => false,
                "1" => true,
                v => Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("bad bit value {:?}", v),
                })?,
            };
            self.set_bit(chip, addr, bit);
            n += 1;
        }
        if n != NUM_HR * HR_BITS {
            Err(ErrorKind::Config {
                line: lineno,
                detail: format!("want {} records, got {}", NUM_HR * HR_BITS, n),
            })?
        }
        Ok(())
    }

    /// Transmit the staged configuration to the chips behind `slot` and
    /// verify the loopback checkword.
    pub fn set_config<M: Mmio>(&mut self, brd: &Board<M>, slot: usize) -> Result<()> {
        let check = next_checkword(brd.sc_check(slot)?);
        self.image[..PREFIX_LEN].copy_from_slice(&check.to_le_bytes());
        transmit(brd, slot, &self.image)?;
        verify_loopback(brd, slot, check)
    }

    /// Run the transmission protocol with the read-back preparation
    /// payload instead of the configuration image.
    pub fn reset_read_registers<M: Mmio>(&self, brd: &Board<M>, slot: usize) -> Result<()> {
        let mut image = [0u8; IMAGE_LEN];
        let check = next_checkword(brd.sc_check(slot)?);
        image[..PREFIX_LEN].copy_from_slice(&check.to_le_bytes());
        transmit(brd, slot, &image)?;
        verify_loopback(brd, slot, check)
    }
}

impl Default for SlowControl {
    fn default() -> Self {
        Self::new()
    }
}

fn next_checkword(current: u32) -> u32 {
    if current == CHECK_A {
        CHECK_B
    } else {
        CHECK_A
    }
}

fn verify_loopback<M: Mmio>(brd: &Board<M>, slot: usize, want: u32) -> Result<()> {
    let got = brd.sc_check(slot)?;
    if got != want {
        Err(ErrorKind::LoopbackMismatch { slot, got, want })?
    }
    Ok(())
}

/// The slow-control serializer handshake.
fn transmit<M: Mmio>(brd: &Board<M>, slot: usize, image: &[u8; IMAGE_LEN]) -> Result<()> {
    brd.sc_select()?;
    brd.sc_reset()?;
    if brd.sc_done()? {
        // the done bit must drop on reset
        Err(ErrorKind::General(format!(
            "slot {}: slow-control serializer stuck busy after reset",
            slot
        )))?
    }
    brd.hr_cfg_write(image)?;
    brd.sc_start(slot)?;
    let mut polls = 0u32;
    while !brd.sc_done()? {
        polls += 1;
        if polls >= SC_DONE_POLLS {
            Err(ErrorKind::HardwareTimeout {
                what: format!("slot {} sc-done", slot),
                after: SC_DONE_POLL * SC_DONE_POLLS,
            })?
        }
        thread::sleep(SC_DONE_POLL);
    }
    debug!("slot {}: slow-control shifted after {} polls", slot, polls);
    Ok(())
}
