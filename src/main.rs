//! meddump - dump samples or impedances from an EEG device.
//!
//! # Usage
//!
//! ```bash
//! meddump dummy channels=8 -c 10
//! meddump -i ebneuro address=192.168.171.81
//! meddump --json -c 100 openbci port=/dev/ttyUSB0 gain=12
//! meddump -vv --log-format json ebneuro address=192.168.171.81 recv_attempts=10
//! ```
//!
//! Options from `--config` are applied first; positional `key=val` pairs are
//! appended after them and therefore take precedence.

use anyhow::{Context, Result};
use clap::Parser;
use med_eeg::config::{ConfigSet, VERBOSITY_KEY};
use med_eeg::device::{Device, Mode};
use med_eeg::logging::{self, OutputFormat, TracingConfig};
use serde::Serialize;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meddump")]
#[command(about = "Dump EEG device data to stdout", long_about = None)]
struct Cli {
    /// Sample impedance instead of signal
    #[arg(short = 'i', long, conflicts_with = "test")]
    impedance: bool,

    /// Sample the device's test signal
    #[arg(short = 't', long)]
    test: bool,

    /// Stop after this many reads (runs forever if omitted)
    #[arg(short = 'c', long)]
    count: Option<u64>,

    /// Delay between reads in milliseconds
    #[arg(short = 'd', long, default_value_t = 0)]
    delay: u64,

    /// Be more verbose (repeat for more)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print one JSON object per line instead of columns
    #[arg(long)]
    json: bool,

    /// Log output on stderr: pretty, compact or json
    #[arg(long, default_value = "compact")]
    log_format: OutputFormat,

    /// TOML file with device options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Driver name (dummy, ebneuro, openbci)
    driver: String,

    /// Device options as key=val
    options: Vec<String>,
}

#[derive(Serialize)]
struct Record<'a> {
    index: u64,
    mode: Mode,
    values: &'a [f32],
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.impedance {
            Mode::Impedance
        } else if self.test {
            Mode::Test
        } else {
            Mode::Sampling
        }
    }

    fn device_config(&self) -> Result<ConfigSet> {
        let mut config = match &self.config {
            Some(path) => ConfigSet::from_toml_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ConfigSet::new(),
        };
        config.extend(ConfigSet::parse_pairs(&self.options));
        if self.verbose > 0 {
            config.push(VERBOSITY_KEY, self.verbose.to_string());
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mode = cli.mode();
    let config = cli.device_config()?;

    let verbosity = config.parse_or(VERBOSITY_KEY, 0u8)?;
    let tracing = TracingConfig::from_verbosity(verbosity)
        .with_format(cli.log_format)
        .with_ansi(io::stderr().is_terminal());
    if let Err(e) = logging::init(tracing) {
        eprintln!("Failed to initialise logging: {e}");
    }

    let mut device = Device::create(&cli.driver, &config)
        .with_context(|| format!("Failed to create {} device", cli.driver))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let result = dump(&mut device, &cli, mode, &mut out);

    if let Err(e) = device.set_mode(Mode::Idle) {
        eprintln!("Failed to set idle mode: {e}");
    }
    device.destroy();
    out.flush()?;

    result
}

fn dump(device: &mut Device, cli: &Cli, mode: Mode, out: &mut impl Write) -> Result<()> {
    let (channels, labels) = device.get_channels();
    if !cli.json {
        for label in labels {
            write!(out, "{label:>9} ")?;
        }
        writeln!(out)?;
    }

    device.set_mode(mode).context("Failed to set mode")?;

    let mut data = vec![0.0f32; channels];
    let delay = Duration::from_millis(cli.delay);
    let mut index = 0u64;

    while cli.count.map_or(true, |count| index < count) {
        match mode {
            Mode::Impedance => {
                device
                    .get_impedance(&mut data)
                    .context("Failed to read impedance")?;
            }
            _ => {
                device.sample(&mut data, 1).context("Failed to get sample")?;
            }
        }

        if cli.json {
            serde_json::to_writer(
                &mut *out,
                &Record {
                    index,
                    mode,
                    values: &data,
                },
            )?;
        } else {
            for value in &data {
                write!(out, "{value: >9.6} ")?;
            }
        }
        writeln!(out)?;
        out.flush()?;

        index += 1;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    Ok(())
}
