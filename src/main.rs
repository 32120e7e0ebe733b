use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::lock::Mutex;
use log::info;

use edaq::acq::Device;
use edaq::cfg::ConfigSource;
use edaq::error::Result;
use edaq::mmio::{DevMem, H2F_BASE, H2F_SPAN, LW_BASE, LW_SPAN};
use edaq::server::CtlServer;

/// Host-side DAQ for one EDA front-end board.
#[derive(Parser, Debug)]
#[clap(name = "edaq", version, about)]
struct Opt {
    /// Control server listen address.
    #[clap(long, default_value = "0.0.0.0:8877")]
    addr: String,

    /// Memory-mapped device exposing the FPGA bridge windows.
    #[clap(long, default_value = "/dev/mem")]
    dev: PathBuf,

    /// Directory for per-run artifacts (settings, slow-control dumps).
    #[clap(long, default_value = "run")]
    run_dir: PathBuf,

    /// Output directory for standalone-mode DIF files.
    #[clap(long, default_value = "daq")]
    odir: PathBuf,

    /// Directory holding the CSV configuration files. When absent, chip
    /// records are taken from the `configure` payloads.
    #[clap(long)]
    csv: Option<PathBuf>,

    /// Verbosity (-v: debug, -vv: trace).
    #[clap(short, parse(from_occurrences))]
    verbose: usize,
}

impl Opt {
    fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    env_logger::builder()
        .filter_level(opt.log_level())
        .parse_default_env()
        .init();

    let lw = DevMem::open(&opt.dev, LW_BASE, LW_SPAN)?;
    let h2f = DevMem::open(&opt.dev, H2F_BASE, H2F_SPAN)?;
    let source = match opt.csv {
        Some(dir) => {
            info!("configuration source: CSV files in {}", dir.display());
            ConfigSource::Csv(dir)
        }
        None => ConfigSource::Db,
    };

    let device = Device::new(lw, h2f, source, opt.run_dir, opt.odir);
    let server = CtlServer::bind(&opt.addr, Arc::new(Mutex::new(device))).await?;
    server.run().await
}
