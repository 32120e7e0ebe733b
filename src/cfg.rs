//! Chip and run configuration.
//!
//! [`Asic`] mirrors the per-chip record of the condition database: 36
//! fields covering the full 872-bit slow-control register of one hardroc,
//! in datasheet order. The DAQ only reads these records; it serializes
//! them into the slow-control image ([`Asic::to_bits`]) and never mutates
//! them. The CSV readers cover the file-based configuration source used
//! when no database is wired in.

use std::fmt;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{ErrorKind, Result};
use crate::sc::HR_BITS;
use crate::{NUM_CHANNELS, NUM_HR, NUM_RFM};

/// Trigger mode of a run.
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerType {
    /// Externally clocked; reset-BCID arrives on the DCC bus.
    Dcc = 0,
    /// Self-triggered.
    Noise = 1,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Dcc => write!(f, "dcc"),
            TriggerType::Noise => write!(f, "noise"),
        }
    }
}

/// Where chip configurations come from. The two sources are mutually
/// exclusive for the lifetime of a device.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Records are injected by the orchestrator (`configure` payloads).
    Db,
    /// Records are read from the CSV files in this directory.
    Csv(PathBuf),
}

/// Per-chip configuration record, one field per slow-control register
/// group, most significant register first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asic {
    pub en_oc_dout1: bool,
    pub en_oc_dout2: bool,
    pub en_oc_transmit1: bool,
    pub en_oc_transmit2: bool,
    pub en_oc_chipsat: bool,
    pub sel_start_readout: bool,
    pub en_start_readout: bool,
    pub sel_end_readout: bool,
    pub en_end_readout: bool,
    /// Channel-reset mode (2 bits).
    pub raz_chn_mode: u8,
    pub inv_discri_trig: bool,
    /// Trigger shaping mode (2 bits).
    pub trig_mode: u8,
    /// Trigger output routing (2 bits).
    pub trig_out: u8,
    pub en_bandgap: bool,
    /// DAC enable/polarity block (4 bits).
    pub dac_ctrl: u8,
    /// Analog probe routing (3 bits).
    pub probe_ctrl: u8,
    /// Discriminator DAC threshold 2 (10 bits).
    pub b2: u16,
    /// Discriminator DAC threshold 1 (10 bits).
    pub b1: u16,
    /// Discriminator DAC threshold 0 (10 bits).
    pub b0: u16,
    /// Chip id, shifted MSB-first.
    pub header: u8,
    /// Per-channel mask of discriminator plane 2.
    pub mask2: u64,
    /// Per-channel mask of discriminator plane 1.
    pub mask1: u64,
    /// Per-channel mask of discriminator plane 0.
    pub mask0: u64,
    pub sc_on: bool,
    pub valid_dc: bool,
    /// Slow-shaper switch block (4 bits).
    pub sw_ss: u8,
    /// Buffer switch block (2 bits).
    pub swb_buf: u8,
    /// Shaper feedback resistor switches, 2 bits per branch.
    pub sw_rs: u8,
    /// Shaper capacitor switches, 3 bits per branch.
    pub sw_cs: u8,
    /// Low-gain path capacitor switches (9 bits).
    pub sw_lg: u16,
    /// Fast-shaper bias block 1 (4 bits).
    pub cmd_fsb1: u8,
    /// Fast-shaper bias block 2 (4 bits).
    pub cmd_fsb2: u8,
    /// Fast-shaper routing (2 bits).
    pub fsb_ctrl: u8,
    /// Input gain correction (5 bits).
    pub gain_corr: u8,
    /// Preamplifier gains, one hex-encoded byte per channel, channel 0
    /// first (128 characters).
    pub pa_gain: String,
    /// Per-channel calibration-injection switches.
    pub ctest: u64,
}

impl Default for Asic {
    fn default() -> Self {
        Self {
            en_oc_dout1: true,
            en_oc_dout2: true,
            en_oc_transmit1: true,
            en_oc_transmit2: true,
            en_oc_chipsat: false,
            sel_start_readout: true,
            en_start_readout: true,
            sel_end_readout: true,
            en_end_readout: true,
            raz_chn_mode: 0,
            inv_discri_trig: false,
            trig_mode: 0,
            trig_out: 0,
            en_bandgap: true,
            dac_ctrl: 0b1010,
            probe_ctrl: 0,
            b2: 450,
            b1: 350,
            b0: 250,
            header: 0,
            mask2: u64::MAX,
            mask1: u64::MAX,
            mask0: u64::MAX,
            sc_on: true,
            valid_dc: false,
            sw_ss: 0,
            swb_buf: 0,
            sw_rs: 0b1111,
            sw_cs: 0,
            sw_lg: 0,
            cmd_fsb1: 0,
            cmd_fsb2: 0,
            fsb_ctrl: 0,
            gain_corr: 0,
            pa_gain: "80".repeat(NUM_CHANNELS),
            ctest: 0,
        }
    }
}

impl Asic {
    /// Preamplifier gain of `ch`, decoded from the hex string.
    pub fn gain(&self, ch: usize) -> Result<u8> {
        assert!(ch < NUM_CHANNELS);
        if self.pa_gain.len() != 2 * NUM_CHANNELS {
            Err(ErrorKind::General(format!(
                "pa_gain must be {} hex characters, got {}",
                2 * NUM_CHANNELS,
                self.pa_gain.len()
            )))?
        }
        u8::from_str_radix(&self.pa_gain[2 * ch..2 * ch + 2], 16).map_err(|_| {
            ErrorKind::General(format!(
                "pa_gain of channel {} is not hex: {:?}",
                ch,
                &self.pa_gain[2 * ch..2 * ch + 2]
            ))
            .into()
        })
    }

    /// Serialize the record into the 872 bits the hardware shifts,
    /// MSB-first from register address 871 down to 0.
    pub fn to_bits(&self) -> Result<Vec<bool>> {
        fn word(bits: &mut Vec<bool>, v: u32, n: usize, what: &str) -> Result<()> {
            if u64::from(v) >= 1u64 << n {
                Err(ErrorKind::General(format!(
                    "{} value {} does not fit {} bits",
                    what, v, n
                )))?
            }
            for k in (0..n).rev() {
                bits.push(v >> k & 1 != 0);
            }
            Ok(())
        }

        let mut bits = Vec::with_capacity(HR_BITS);
        for flag in [
            self.en_oc_dout1,
            self.en_oc_dout2,
            self.en_oc_transmit1,
            self.en_oc_transmit2,
            self.en_oc_chipsat,
            self.sel_start_readout,
            self.en_start_readout,
            self.sel_end_readout,
            self.en_end_readout,
        ] {
            bits.push(flag);
        }
        word(&mut bits, self.raz_chn_mode.into(), 2, "raz_chn_mode")?;
        bits.push(self.inv_discri_trig);
        word(&mut bits, self.trig_mode.into(), 2, "trig_mode")?;
        word(&mut bits, self.trig_out.into(), 2, "trig_out")?;
        bits.push(self.en_bandgap);
        word(&mut bits, self.dac_ctrl.into(), 4, "dac_ctrl")?;
        word(&mut bits, self.probe_ctrl.into(), 3, "probe_ctrl")?;
        word(&mut bits, self.b2.into(), 10, "b2")?;
        word(&mut bits, self.b1.into(), 10, "b1")?;
        word(&mut bits, self.b0.into(), 10, "b0")?;
        // the chip id shifts LSB-first: its MSB sits at the low register
        // address, unlike every other field
        for k in 0..8 {
            bits.push(self.header >> k & 1 != 0);
        }
        for ch in (0..NUM_CHANNELS).rev() {
            bits.push(self.mask2 >> ch & 1 != 0);
            bits.push(self.mask1 >> ch & 1 != 0);
            bits.push(self.mask0 >> ch & 1 != 0);
        }
        bits.push(self.sc_on);
        bits.push(self.valid_dc);
        word(&mut bits, self.sw_ss.into(), 4, "sw_ss")?;
        word(&mut bits, self.swb_buf.into(), 2, "swb_buf")?;
        word(&mut bits, self.sw_rs.into(), 4, "sw_rs")?;
        word(&mut bits, self.sw_cs.into(), 6, "sw_cs")?;
        word(&mut bits, self.sw_lg.into(), 9, "sw_lg")?;
        word(&mut bits, self.cmd_fsb1.into(), 4, "cmd_fsb1")?;
        word(&mut bits, self.cmd_fsb2.into(), 4, "cmd_fsb2")?;
        word(&mut bits, self.fsb_ctrl.into(), 2, "fsb_ctrl")?;
        word(&mut bits, self.gain_corr.into(), 5, "gain_corr")?;
        for ch in (0..NUM_CHANNELS).rev() {
            word(&mut bits, self.gain(ch)?.into(), 8, "pa_gain")?;
        }
        for ch in (0..NUM_CHANNELS).rev() {
            bits.push(self.ctest >> ch & 1 != 0);
        }
        debug_assert_eq!(bits.len(), HR_BITS);
        Ok(bits)
    }
}

/// DAC floor thresholds per (slot, chip).
pub type DacFloors = [[[u16; 3]; NUM_HR]; NUM_RFM];
/// Preamplifier gains per (slot, chip, channel).
pub type PaGains = [[[u8; NUM_CHANNELS]; NUM_HR]; NUM_RFM];
/// Discriminator masks per (slot, chip, channel).
pub type Masks = [[[u8; NUM_CHANNELS]; NUM_HR]; NUM_RFM];

fn split_line(line: &str, want: usize, lineno: usize) -> Result<Vec<&str>> {
    let fields: Vec<&str> = line.split(';').collect();
    if fields.len() != want {
        Err(ErrorKind::Config {
            line: lineno,
            detail: format!("want {} fields, got {}", want, fields.len()),
        })?
    }
    Ok(fields)
}

fn parse_field<T>(s: &str, what: &str, lineno: usize) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    s.parse().map_err(|e| {
        ErrorKind::Config {
            line: lineno,
            detail: format!("bad {} {:?}: {}", what, s, e),
        }
        .into()
    })
}

fn expect_index(got: usize, want: usize, what: &str, lineno: usize) -> Result<()> {
    if got != want {
        Err(ErrorKind::Config {
            line: lineno,
            detail: format!("want {} {}, got {}", what, want, got),
        })?
    }
    Ok(())
}

/// Read `dac_floor_4rfm.csv`: `rfm;chip;dac0;dac1;dac2` with `(rfm, chip)`
/// strictly increasing in canonical order.
pub fn read_dac_floor<R: BufRead>(r: R) -> Result<DacFloors> {
    let mut out: DacFloors = [[[0; 3]; NUM_HR]; NUM_RFM];
    let mut n = 0usize;
    let mut lineno = 0usize;
    for line in r.lines() {
        let line = line?;
        lineno += 1;
        if line.is_empty() {
            continue;
        }
        if n >= NUM_RFM * NUM_HR {
            Err(ErrorKind::Config {
                line: lineno,
                detail: format!("more than {} records", NUM_RFM * NUM_HR),
            })?
        }
        let fields = split_line(&line, 5, lineno)?;
        let rfm: usize = parse_field(fields[0], "rfm", lineno)?;
        let chip: usize = parse_field(fields[1], "chip", lineno)?;
        expect_index(rfm, n / NUM_HR, "rfm", lineno)?;
        expect_index(chip, n % NUM_HR, "chip", lineno)?;
        for (i, field) in fields[2..].iter().enumerate() {
            let v: u16 = parse_field(field, "dac", lineno)?;
            if v >= 1 << 10 {
                Err(ErrorKind::Config {
                    line: lineno,
                    detail: format!("dac value {} does not fit 10 bits", v),
                })?
            }
            out[rfm][chip][i] = v;
        }
        n += 1;
    }
    if n != NUM_RFM * NUM_HR {
        Err(ErrorKind::Config {
            line: lineno,
            detail: format!("want {} records, got {}", NUM_RFM * NUM_HR, n),
        })?
    }
    Ok(out)
}

fn read_per_channel<R: BufRead>(r: R, what: &str, max: u8) -> Result<Masks> {
    let mut out: Masks = [[[0; NUM_CHANNELS]; NUM_HR]; NUM_RFM];
    let mut n = 0usize;
    let mut lineno = 0usize;
    for line in r.lines() {
        let line = line?;
        lineno += 1;
        if line.is_empty() {
            continue;
        }
        if n >= NUM_RFM * NUM_HR * NUM_CHANNELS {
            Err(ErrorKind::Config {
                line: lineno,
                detail: format!("more than {} records", NUM_RFM * NUM_HR * NUM_CHANNELS),
            })?
        }
        let fields = split_line(&line, 4, lineno)?;
        let rfm: usize = parse_field(fields[0], "rfm", lineno)?;
        let chip: usize = parse_field(fields[1], "chip", lineno)?;
        let ch: usize = parse_field(fields[2], "channel", lineno)?;
        expect_index(rfm, n / (NUM_HR * NUM_CHANNELS), "rfm", lineno)?;
        expect_index(chip, n / NUM_CHANNELS % NUM_HR, "chip", lineno)?;
        expect_index(ch, n % NUM_CHANNELS, "channel", lineno)?;
        let v: u16 = parse_field(fields[3], what, lineno)?;
        if v > max as u16 {
            Err(ErrorKind::Config {
                line: lineno,
                detail: format!("{} value {} above {}", what, v, max),
            })?
        }
        out[rfm][chip][ch] = v as u8;
        n += 1;
    }
    if n != NUM_RFM * NUM_HR * NUM_CHANNELS {
        Err(ErrorKind::Config {
            line: lineno,
            detail: format!("want {} records, got {}", NUM_RFM * NUM_HR * NUM_CHANNELS, n),
        })?
    }
    Ok(out)
}

/// Read `pa_gain_4rfm.csv`: `rfm;chip;channel;gain`, gain in `[0,255]`.
pub fn read_pa_gain<R: BufRead>(r: R) -> Result<PaGains> {
    read_per_channel(r, "gain", u8::MAX)
}

/// Read `mask_4rfm.csv`: `rfm;chip;channel;mask`, mask in `[0,7]`.
pub fn read_masks<R: BufRead>(r: R) -> Result<Masks> {
    read_per_channel(r, "mask", 7)
}

/// Write the `settings_<run>.csv` line: everything the offline analysis
/// needs to identify the run, as `key=value` pairs on a single line.
pub fn write_run_settings<W: Write>(
    mut w: W,
    run: u32,
    trigger: TriggerType,
    rshaper: u8,
    rfms: &[usize],
    thresholds: [u16; 3],
) -> Result<()> {
    let slots: Vec<String> = rfms.iter().map(|s| s.to_string()).collect();
    writeln!(
        w,
        "run={};started={};trigger={};rshaper={};rfms={};thr0={};thr1={};thr2={}",
        run,
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        trigger,
        rshaper,
        slots.join(","),
        thresholds[0],
        thresholds[1],
        thresholds[2],
    )?;
    Ok(())
}
