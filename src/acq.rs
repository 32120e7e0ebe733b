//! Acquisition state machine and per-cycle DIF assembly.
//!
//! One [`Device`] drives one EDA board through a run: `scan` selects the
//! populated slots, `configure` stages the chip records and downstream
//! addresses, `initialize` brings the hardware up and transmits the
//! slow-control bits, and `start`/`stop` frame the cycle loop. Each cycle
//! drains the hit FIFO of every active slot into a DIF record and ships
//! the records in parallel, one sink worker per slot, before the next
//! cycle may begin.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::{mpsc, oneshot};
use futures::future;
use futures::lock::Mutex;
use futures::SinkExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::board::Board;
use crate::cfg::{self, Asic, ConfigSource, TriggerType};
use crate::dif;
use crate::error::{ErrorKind, Result};
use crate::mmio::Mmio;
use crate::regs::{cmd, syncst};
use crate::sc::SlowControl;
use crate::sink::{self, DifSink, FileSink, TcpSink};
use crate::{NUM_CHANNELS, NUM_HR, NUM_RFM};

/// What to do between two polls of a hardware flag.
#[derive(Debug, Clone, Copy)]
pub enum PollPolicy {
    /// Spin on the register.
    Spin,
    /// Let other tasks run between polls.
    Yield,
    /// Back off for a fixed duration.
    Sleep(Duration),
}

impl PollPolicy {
    async fn relax(&self) {
        match self {
            PollPolicy::Spin => {}
            PollPolicy::Yield => tokio::task::yield_now().await,
            PollPolicy::Sleep(d) => tokio::time::sleep(*d).await,
        }
    }
}

/// Historical deployments proceed with acquisition when the DCC never
/// delivers reset-BCID; aborting instead is available as a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetBcidPolicy {
    Continue,
    Abort,
}

/// Hardware wait budgets, collected here so the test harness can compress
/// them.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Spacing of PLL-lock polls.
    pub pll_poll: Duration,
    /// Number of PLL-lock polls before giving up.
    pub pll_polls: u32,
    /// How long to wait for reset-BCID on the DCC bus.
    pub reset_bcid_wait: Duration,
    /// Deadline for the stop-request/stop-ack exchange.
    pub stop_deadline: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            pll_poll: Duration::from_millis(10),
            pll_polls: 100,
            reset_bcid_wait: Duration::from_secs(10),
            stop_deadline: Duration::from_secs(10),
        }
    }
}

/// Per-slot shipping counters, plus the latest hardware hit-scaler
/// readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotCounters {
    pub cycles: u32,
    pub frames: u64,
    pub bytes: u64,
    pub hits0: u32,
    pub hits1: u32,
}

/// `configure` payload for one chamber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberConfig {
    /// DIF id of the chamber.
    pub dif: u8,
    /// Chip records when the configuration source is the database.
    #[serde(default)]
    pub asics: Vec<Asic>,
}

/// One populated slot. A slot index is a hardware position in 0..4; the
/// DIF id is the logical chamber identity. The two are never
/// interchangeable.
struct Slot {
    idx: usize,
    dif_id: u8,
    host: Option<IpAddr>,
    asics: Vec<Asic>,
    sink: Option<Box<dyn DifSink>>,
    bcid48_offset: Option<u64>,
    counters: SlotCounters,
    scratch: Vec<u8>,
}

/// Driver state for one EDA board.
pub struct Device<M: Mmio> {
    brd: Board<M>,
    source: ConfigSource,
    run_dir: PathBuf,
    out_dir: PathBuf,
    trigger: TriggerType,
    rshaper: u8,
    slots: Vec<Slot>,
    sc: SlowControl,
    poll: PollPolicy,
    timings: Timings,
    reset_bcid_policy: ResetBcidPolicy,
    cycle: u32,
    initialized: bool,
}

impl<M: Mmio> Device<M> {
    pub fn new(lw: M, h2f: M, source: ConfigSource, run_dir: PathBuf, out_dir: PathBuf) -> Self {
        Self {
            brd: Board::new(lw, h2f),
            source,
            run_dir,
            out_dir,
            trigger: TriggerType::Dcc,
            rshaper: 3,
            slots: Vec::new(),
            sc: SlowControl::new(),
            poll: PollPolicy::Yield,
            timings: Timings::default(),
            reset_bcid_policy: ResetBcidPolicy::Continue,
            cycle: 0,
            initialized: false,
        }
    }

    pub fn set_poll_policy(&mut self, poll: PollPolicy) {
        self.poll = poll;
    }

    pub fn set_timings(&mut self, timings: Timings) {
        self.timings = timings;
    }

    pub fn set_reset_bcid_policy(&mut self, policy: ResetBcidPolicy) {
        self.reset_bcid_policy = policy;
    }

    pub fn stop_deadline(&self) -> Duration {
        self.timings.stop_deadline
    }

    pub fn counters(&self) -> Vec<(usize, SlotCounters)> {
        self.slots.iter().map(|s| (s.idx, s.counters)).collect()
    }

    /// Select the populated slots and the run-wide shaper/trigger mode.
    pub fn scan(&mut self, slots: &[usize], rshaper: u8, trigger: TriggerType) -> Result<()> {
        for &idx in slots {
            if idx >= NUM_RFM {
                Err(ErrorKind::InvalidState(format!(
                    "slot {} out of range 0..{}",
                    idx, NUM_RFM
                )))?
            }
        }
        self.slots = slots
            .iter()
            .map(|&idx| Slot {
                idx,
                dif_id: idx as u8,
                host: None,
                asics: Vec::new(),
                sink: None,
                bcid48_offset: None,
                counters: SlotCounters::default(),
                scratch: Vec::new(),
            })
            .collect();
        self.rshaper = rshaper;
        self.trigger = trigger;
        self.initialized = false;
        info!(
            "scanned slots {:?}, rshaper {}, trigger {}",
            slots, rshaper, trigger
        );
        Ok(())
    }

    /// Stage chamber configurations: the i-th entry belongs to the i-th
    /// scanned slot. `host` is the downstream consumer host; `None`
    /// selects the standalone file sink.
    pub fn configure(&mut self, host: Option<IpAddr>, chambers: Vec<ChamberConfig>) -> Result<()> {
        if chambers.len() != self.slots.len() {
            Err(ErrorKind::InvalidState(format!(
                "configure carries {} chambers, {} slots scanned",
                chambers.len(),
                self.slots.len()
            )))?
        }
        for (slot, chamber) in self.slots.iter_mut().zip(chambers) {
            match self.source {
                ConfigSource::Db => {
                    if chamber.asics.len() != NUM_HR {
                        Err(ErrorKind::InvalidState(format!(
                            "dif {:#04x}: want {} asic records, got {}",
                            chamber.dif,
                            NUM_HR,
                            chamber.asics.len()
                        )))?
                    }
                }
                ConfigSource::Csv(_) => {
                    if !chamber.asics.is_empty() {
                        Err(ErrorKind::InvalidState(
                            "asic records supplied while the configuration source is CSV"
                                .to_string(),
                        ))?
                    }
                }
            }
            slot.dif_id = chamber.dif;
            slot.host = host;
            slot.asics = chamber.asics;
        }
        Ok(())
    }

    /// Bring the hardware up: reset, wait for the clock distribution,
    /// stage and transmit the slow-control bits of every active slot.
    pub fn initialize(&mut self) -> Result<()> {
        self.brd.reset_fpga()?;
        self.wait_pll()?;
        self.brd.reset_hr()?;
        for i in 0..self.slots.len() {
            let idx = self.slots[i].idx;
            self.brd.rfm_on(idx)?;
            self.brd.rfm_enable(idx)?;
        }
        for i in 0..self.slots.len() {
            let idx = self.slots[i].idx;
            self.sc = SlowControl::new();
            match self.source.clone() {
                ConfigSource::Db => self.sc.load_from_db(&self.slots[i].asics)?,
                ConfigSource::Csv(dir) => self.stage_from_csv(&dir, idx)?,
            }
            for chip in 0..NUM_HR {
                self.sc.set_shaper_resis(chip, self.rshaper);
                self.sc.set_chip_id(chip, chip as u8);
            }
            self.sc.set_config(&self.brd, idx)?;
            info!("slot {}: slow control transmitted", idx);
        }
        self.brd.sc_deselect()?;
        self.initialized = true;
        Ok(())
    }

    fn wait_pll(&self) -> Result<()> {
        for _ in 0..self.timings.pll_polls {
            if self.brd.pll_locked()? {
                return Ok(());
            }
            std::thread::sleep(self.timings.pll_poll);
        }
        Err(ErrorKind::HardwareTimeout {
            what: "pll".to_string(),
            after: self.timings.pll_poll * self.timings.pll_polls,
        }
        .into())
    }

    /// Stage one slot's chips from the CSV files: the per-bit base
    /// configuration for chip 0, copied to the others, then the per-slot
    /// DAC floors, gains and masks on top.
    fn stage_from_csv(&mut self, dir: &Path, idx: usize) -> Result<()> {
        let base = BufReader::new(File::open(dir.join("conf_base.csv"))?);
        self.sc.load_from_csv(base, 0)?;
        for chip in 1..NUM_HR {
            self.sc.copy(0, chip);
        }
        let floors = cfg::read_dac_floor(BufReader::new(File::open(
            dir.join("dac_floor_4rfm.csv"),
        )?))?;
        let gains = cfg::read_pa_gain(BufReader::new(File::open(dir.join("pa_gain_4rfm.csv"))?))?;
        let masks = cfg::read_masks(BufReader::new(File::open(dir.join("mask_4rfm.csv"))?))?;
        for chip in 0..NUM_HR {
            for (dac, &v) in floors[idx][chip].iter().enumerate() {
                self.sc.set_dac(chip, dac, v);
            }
            for ch in 0..NUM_CHANNELS {
                self.sc.set_preamp_gain(chip, ch, gains[idx][chip][ch]);
                self.sc.set_mask(chip, ch, masks[idx][chip][ch]);
            }
        }
        Ok(())
    }

    /// Run the acquisition until `stop_rx` fires; returns the number of
    /// completed cycles.
    async fn run(&mut self, run: u32, mut stop_rx: mpsc::Receiver<()>) -> Result<u32> {
        let res = match self.begin_run(run).await {
            Ok(()) => {
                info!("run {}: acquisition started ({})", run, self.trigger);
                self.cycle_loop(&mut stop_rx).await
            }
            Err(e) => Err(e),
        };
        if let Err(ref e) = res {
            error!("run {}: {}", run, e);
        }
        let end = self.end_run();
        for slot in &mut self.slots {
            slot.sink = None;
        }
        for (idx, c) in self.counters() {
            info!(
                "run {}: slot {}: {} cycles, {} frames, {} bytes, hit scalers {}/{}",
                run, idx, c.cycles, c.frames, c.bytes, c.hits0, c.hits1
            );
        }
        res.and(end)?;
        Ok(self.cycle)
    }

    async fn begin_run(&mut self, run: u32) -> Result<()> {
        if !self.initialized {
            Err(ErrorKind::InvalidState("start before initialize".to_string()))?
        }
        if self.slots.is_empty() {
            Err(ErrorKind::InvalidState("start with no scanned slots".to_string()))?
        }
        self.cycle = 0;
        self.write_run_artifacts(run)?;
        self.brd.reset_hr()?;
        for slot in &mut self.slots {
            slot.counters = SlotCounters::default();
            slot.bcid48_offset = None;
        }
        for i in 0..self.slots.len() {
            let dif_id = self.slots[i].dif_id;
            let sink: Box<dyn DifSink> = match self.slots[i].host {
                Some(host) => Box::new(TcpSink::connect(sink::dif_addr(host, dif_id)).await?),
                None => Box::new(FileSink::create(&self.out_dir, run, dif_id).await?),
            };
            self.slots[i].sink = Some(sink);
        }
        match self.trigger {
            TriggerType::Dcc => self.start_dcc().await,
            TriggerType::Noise => self.start_noise(),
        }
    }

    fn write_run_artifacts(&self, run: u32) -> Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        let settings = File::create(self.run_dir.join(format!("settings_{}.csv", run)))?;
        let slots: Vec<usize> = self.slots.iter().map(|s| s.idx).collect();
        let thresholds = [self.sc.dac(0, 0), self.sc.dac(0, 1), self.sc.dac(0, 2)];
        cfg::write_run_settings(
            settings,
            run,
            self.trigger,
            self.rshaper,
            &slots,
            thresholds,
        )?;
        let dump = File::create(self.run_dir.join(format!("hr_sc_{}.csv", run)))?;
        self.sc.write_csv(BufWriter::new(dump))?;
        Ok(())
    }

    async fn start_dcc(&mut self) -> Result<()> {
        self.brd.syn_select_cmd_dcc()?;
        self.wait_reset_bcid().await?;
        self.brd.cnt_reset()?;
        self.brd.cnt_start()?;
        for i in 0..self.slots.len() {
            self.brd.fifo_init(self.slots[i].idx)?;
        }
        self.brd.syn_arm_fifo()
    }

    fn start_noise(&mut self) -> Result<()> {
        self.brd.syn_select_cmd_soft()?;
        for i in 0..self.slots.len() {
            self.brd.fifo_init(self.slots[i].idx)?;
        }
        self.brd.cnt_reset()?;
        self.brd.cnt_start()?;
        self.brd.syn_reset_bcid()?;
        self.brd.syn_start()?;
        self.brd.syn_arm_fifo()
    }

    /// Wait for the reset-BCID command to show up on the DCC bus. The
    /// timeout is non-fatal under the default policy: the run proceeds.
    async fn wait_reset_bcid(&self) -> Result<()> {
        let t0 = Instant::now();
        loop {
            if self.brd.dcc_cmd_mem()? == cmd::RESET_BCID {
                info!("DCC reset-BCID observed after {:?}", t0.elapsed());
                return Ok(());
            }
            if t0.elapsed() >= self.timings.reset_bcid_wait {
                match self.reset_bcid_policy {
                    ResetBcidPolicy::Continue => {
                        warn!("timeout waiting for DCC reset-BCID; starting acquisition anyway");
                        return Ok(());
                    }
                    ResetBcidPolicy::Abort => Err(ErrorKind::HardwareTimeout {
                        what: "dcc reset-bcid".to_string(),
                        after: self.timings.reset_bcid_wait,
                    })?,
                }
            }
            self.poll.relax().await;
        }
    }

    async fn cycle_loop(&mut self, stop_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        loop {
            if self.wait_readout(stop_rx).await? {
                return Ok(());
            }
            if self.trigger == TriggerType::Noise {
                self.brd.syn_ramfull_ext()?;
            }
            if self.wait_fifo_ready(stop_rx).await? {
                return Ok(());
            }
            for i in 0..self.slots.len() {
                self.read_dif(i)?;
            }
            if self.ack_fifo(stop_rx).await? {
                return Ok(());
            }
            // all slots must complete before the next cycle may begin
            let sends = self.slots.iter_mut().map(|slot| {
                let Slot { sink, scratch, .. } = slot;
                let sink = sink.as_mut().expect("BUG: sink missing during run");
                async move { sink.send(scratch).await }
            });
            future::try_join_all(sends).await?;
            if self.trigger == TriggerType::Noise {
                self.brd.syn_start()?;
            }
            self.cycle += 1;
        }
    }

    fn stop_requested(stop_rx: &mut mpsc::Receiver<()>) -> bool {
        // a dropped sender counts as a stop: nobody is left to end the run
        !matches!(stop_rx.try_next(), Err(_))
    }

    /// Acknowledge a drained readout: drop host-busy, wait for the FSM to
    /// come back to idle, re-arm. `Ok(true)` means stop arrived while
    /// waiting; the line stays released and the run teardown takes over.
    async fn ack_fifo(&mut self, stop_rx: &mut mpsc::Receiver<()>) -> Result<bool> {
        self.brd.syn_release_fifo()?;
        loop {
            if Self::stop_requested(stop_rx) {
                return Ok(true);
            }
            if self.brd.sync_state()? == syncst::IDLE {
                break;
            }
            self.poll.relax().await;
        }
        self.brd.syn_arm_fifo()?;
        Ok(false)
    }

    /// Gate on the start of a readout window; `Ok(true)` means stop.
    async fn wait_readout(&mut self, stop_rx: &mut mpsc::Receiver<()>) -> Result<bool> {
        loop {
            if Self::stop_requested(stop_rx) {
                return Ok(true);
            }
            let st = self.brd.sync_state()?;
            let ready = match self.trigger {
                TriggerType::Dcc => {
                    matches!(st, syncst::START_RO | syncst::WAIT_END_RO | syncst::FIFO_READY)
                }
                TriggerType::Noise => st >= syncst::RAMFULL,
            };
            if ready {
                return Ok(false);
            }
            self.poll.relax().await;
        }
    }

    /// Wait until the FIFOs hold the complete readout; `Ok(true)` means
    /// stop.
    async fn wait_fifo_ready(&mut self, stop_rx: &mut mpsc::Receiver<()>) -> Result<bool> {
        loop {
            if Self::stop_requested(stop_rx) {
                return Ok(true);
            }
            let st = self.brd.sync_state()?;
            let ready = match self.trigger {
                TriggerType::Dcc => st == syncst::FIFO_READY,
                TriggerType::Noise => st >= syncst::FIFO_READY,
            };
            if ready {
                return Ok(false);
            }
            self.poll.relax().await;
        }
    }

    /// Drain the hit FIFO of the i-th active slot and encode the cycle's
    /// DIF record into the slot's scratch buffer.
    fn read_dif(&mut self, i: usize) -> Result<()> {
        let idx = self.slots[i].idx;
        let bcid48 = self.brd.bcid48()?;
        let bcid24 = self.brd.cnt_bcid24()?;
        let trig = self.brd.cnt_trig()?;
        let hits0 = self.brd.cnt_hit0(idx)?;
        let hits1 = self.brd.cnt_hit1(idx)?;

        // one hardroc frame is five FIFO words: chip address and relative
        // BCID packed in the first, the discriminator payload in the rest
        let mut frames = Vec::new();
        while !self.brd.fifo_empty(idx)? {
            let w0 = self.brd.fifo_read(idx)?;
            let mut data = [0u8; dif::FRAME_DATA_LEN];
            for k in 0..4 {
                let w = self.brd.fifo_read(idx)?;
                data[4 * k..4 * k + 4].copy_from_slice(&w.to_be_bytes());
            }
            frames.push(dif::Frame {
                header: (w0 >> 24) as u8,
                bcid: w0 & 0x00FF_FFFF,
                data,
            });
        }

        let slot = &mut self.slots[i];
        // the hardware clears the 24-bit counter on reset-BCID but not
        // the 48-bit one; capture the difference on the first cycle and
        // carry it for the rest of the run
        let offset = *slot
            .bcid48_offset
            .get_or_insert_with(|| bcid48.wrapping_sub(bcid24 as u64));
        let record = dif::Dif {
            header: dif::GlobalHeader {
                id: slot.dif_id,
                dtc: slot.counters.cycles,
                atc: trig,
                gtc: self.cycle,
                abs_bcid: bcid48.wrapping_sub(offset) & 0xFFFF_FFFF_FFFF,
                time_dif_tc: bcid24,
            },
            frames,
        };

        slot.scratch.clear();
        let mut enc = dif::Encoder::new(&mut slot.scratch);
        enc.encode_grouped(&record)?;

        slot.counters.cycles += 1;
        slot.counters.frames += record.frames.len() as u64;
        slot.counters.bytes += slot.scratch.len() as u64;
        slot.counters.hits0 = hits0;
        slot.counters.hits1 = hits1;
        Ok(())
    }

    /// Reclaim the hardware at the end of a run. Every step is attempted;
    /// the first failure is reported.
    fn end_run(&mut self) -> Result<()> {
        let mut first_err = None;
        let mut note = |res: Result<()>| {
            if let Err(e) = res {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };
        note(self.brd.cnt_stop());
        if self.trigger == TriggerType::Noise {
            note(self.brd.syn_stop());
        }
        note(self.brd.cnt_reset());
        note(self.brd.reset_fpga());
        note(self.brd.reset_hr());
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Handle to a started run: the stop-request side of the bounded channel
/// pair and the completion slot of the acquisition task.
pub struct RunHandle {
    stop_tx: mpsc::Sender<()>,
    done_rx: oneshot::Receiver<Result<u32>>,
}

impl RunHandle {
    /// Ask the cycle loop to stop and wait for its acknowledgement;
    /// returns the run's cycle count or the error the loop died with.
    pub async fn stop(mut self, deadline: Duration) -> Result<u32> {
        // if the loop already exited the receiver is gone, which is fine
        let _ = tokio::time::timeout(deadline, self.stop_tx.send(())).await;
        match tokio::time::timeout(deadline, self.done_rx).await {
            Err(_) => Err(ErrorKind::HardwareTimeout {
                what: "stop-ack".to_string(),
                after: deadline,
            }
            .into()),
            Ok(Err(_)) => {
                Err(ErrorKind::General("acquisition task vanished".to_string()).into())
            }
            Ok(Ok(res)) => res,
        }
    }
}

/// Spawn the acquisition task for `run`. The device stays locked for the
/// duration of the run; everything else talks to it through the returned
/// handle.
pub fn start<M>(device: Arc<Mutex<Device<M>>>, run: u32) -> RunHandle
where
    M: Mmio + Send + Sync + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut dev = device.lock().await;
        let res = dev.run(run, stop_rx).await;
        let _ = done_tx.send(res);
    });
    RunHandle { stop_tx, done_rx }
}
