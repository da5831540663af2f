use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use bsl_core::flasher::{FlasherConfig, WholeImageFlasher};
use bsl_core::profile::{Speed, TargetModel};
use bsl_core::session::{Actions, ProgramSession, SessionConfig};
use bsl_core::transport::{SerialSettings, SerialTransport, list_ports};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "MSP430 Bootstrap Loader Tool (Pure Rust)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,

    /// Report the Value Line BSL variant and memory layout
    Info {
        port: String,
        #[arg(long, value_enum, default_value_t = Model::G2xx12)]
        model: Model,
        /// Drive DTR directly instead of through the adapter's inverter
        #[arg(long)]
        no_invert_dtr: bool,
    },

    /// Flash a whole image through the Value Line BSL
    Flash {
        port: String,
        /// TI-TXT or Intel-Hex firmware
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = Model::G2xx12)]
        model: Model,
        /// Drive DTR directly instead of through the adapter's inverter
        #[arg(long)]
        no_invert_dtr: bool,
    },

    /// Program through the ROM BSL
    Program(ProgramArgs),
}

#[derive(clap::Args, Debug)]
struct ProgramArgs {
    port: String,

    /// TI-TXT or Intel-Hex firmware
    file: Option<PathBuf>,

    /// Session settings in TOML; flags override them
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings to this TOML file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// File with the interrupt vectors used as password
    #[arg(long)]
    password: Option<PathBuf>,

    /// Flash programming patch for BSL 1.10 and older
    #[arg(long)]
    patch: Option<PathBuf>,

    /// Replacement BSL loaded into RAM
    #[arg(long)]
    new_bsl: Option<PathBuf>,

    /// Data bytes per frame (16..250)
    #[arg(long)]
    max_data: Option<usize>,

    /// Repeat the mass erase
    #[arg(long)]
    mass_erase_cycles: Option<u32>,

    /// Baud rate index: 0 = 9600, 1 = 19200, 2 = 38400
    #[arg(long)]
    speed: Option<u8>,

    /// Invert the DTR (RST) line
    #[arg(long)]
    invert_dtr: bool,

    /// Invert the RTS (TEST) line
    #[arg(long)]
    invert_rts: bool,

    /// Dump memory to a TI-TXT file instead of programming
    #[arg(long, num_args = 3, value_names = ["START", "LEN", "FILE"])]
    read: Option<Vec<String>>,

    /// Erase only the segment containing ADDR
    #[arg(long, value_name = "ADDR", value_parser = parse_number)]
    erase_segment: Option<u32>,

    /// MSP430X: select 64K pages with MEM_OFFSET
    #[arg(long)]
    extended: bool,

    /// Actions to run, e.g. +ecpvr
    #[arg(long)]
    actions: Option<String>,

    /// Erase-check, program and verify block by block
    #[arg(long)]
    one_pass: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Model {
    G2231,
    G2xx12,
}

impl From<Model> for TargetModel {
    fn from(model: Model) -> Self {
        match model {
            Model::G2231 => TargetModel::G2231,
            Model::G2xx12 => TargetModel::G2xx12,
        }
    }
}

/// Hex with `0x` prefix, otherwise decimal.
fn parse_number(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

/// Value Line adapters drive /RESET through an inverter.
fn value_line_settings(no_invert_dtr: bool) -> SerialSettings {
    SerialSettings {
        even_parity: false,
        invert_dtr: !no_invert_dtr,
        ..Default::default()
    }
}

fn whole_image(port: &str, model: Model, no_invert_dtr: bool, file: Option<PathBuf>) -> Result<()> {
    let config = FlasherConfig {
        model: model.into(),
        firmware_path: file,
        ..Default::default()
    };
    let flashing = config.firmware_path.is_some();

    let mut transport = SerialTransport::open(port, value_line_settings(no_invert_dtr))?;
    let outcome = WholeImageFlasher::new(config).run(&mut transport)?;

    info!(
        "{} BSL, MAIN = 0x{:04X}, application start = 0x{:04X}",
        outcome.detected.variant,
        outcome.detected.profile.main_start,
        outcome.detected.app_start()
    );
    if flashing {
        info!("Update successful: {} bytes sent", outcome.bytes_sent);
    }
    Ok(())
}

fn session_config(args: &ProgramArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(file) = &args.file {
        config.firmware_path = Some(file.clone());
    }
    if let Some(path) = &args.password {
        config.password_path = Some(path.clone());
    }
    if let Some(path) = &args.patch {
        config.patch_path = Some(path.clone());
    }
    if let Some(path) = &args.new_bsl {
        config.new_bsl_path = Some(path.clone());
    }
    if let Some(n) = args.max_data {
        config.max_data = n;
    }
    if let Some(n) = args.mass_erase_cycles {
        config.mass_erase_cycles = n;
    }
    if let Some(index) = args.speed {
        config.speed = Some(Speed::try_from(index).map_err(|e| anyhow!(e))?);
    }
    if args.extended {
        config.extended_memory = true;
    }
    if let Some(list) = &args.actions {
        let one_pass = config.actions.one_pass;
        config.actions = Actions::parse(list)?;
        config.actions.one_pass = one_pass;
    }
    if args.one_pass {
        config.actions.one_pass = true;
    }

    if let Some(read) = &args.read {
        let [start, len, file] = read.as_slice() else {
            return Err(anyhow!("--read needs START LEN FILE"));
        };
        let start = parse_number(start).map_err(|e| anyhow!(e))?;
        let len = parse_number(len).map_err(|e| anyhow!(e))?;
        config.dump_memory(start, len, PathBuf::from(file));
    }
    if let Some(address) = args.erase_segment {
        config.erase_segment_only(address);
    }
    Ok(config)
}

fn program(args: ProgramArgs) -> Result<()> {
    let config = session_config(&args)?;
    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        info!("Settings written to {}", path.display());
        return Ok(());
    }

    let settings = SerialSettings {
        invert_dtr: args.invert_dtr,
        invert_rts: args.invert_rts,
        ..Default::default()
    };
    let wait = config.actions.wait;

    let mut transport = SerialTransport::open(&args.port, settings)?;
    let result = ProgramSession::new(config).run(&mut transport);

    if wait {
        eprint!("Press <ENTER> to continue...");
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
    }

    let report = result?;
    if let Some(id) = report.device {
        info!("{}", id);
    }
    info!(
        "Done: {} bytes programmed at {} baud in {:.1}s",
        report.bytes_programmed,
        report.baud_rate,
        report.elapsed.as_secs_f32()
    );
    Ok(())
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Ports => {
            for port in list_ports()? {
                println!("{}", port);
            }
            Ok(())
        }
        Command::Info {
            port,
            model,
            no_invert_dtr,
        } => whole_image(&port, model, no_invert_dtr, None),
        Command::Flash {
            port,
            file,
            model,
            no_invert_dtr,
        } => whole_image(&port, model, no_invert_dtr, Some(file)),
        Command::Program(program_args) => program(program_args),
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    info!("Starting BSL-rs Tool (serialport backend)...");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
