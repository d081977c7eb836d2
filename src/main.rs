use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};

use machxo::{
    EraseFlags, Flashing, MachXO, Region, Transport, WaitOptions,
    constants::DEFAULT_I2C_ADDR,
    flashing::{ConfigMode, FlashOptions},
    format::{BitstreamFormat, read_bitstream_from_file},
    loader::RecordLayout,
    transport::{Baudrate, Ch341aI2c, I2cSpeed, Retry, RetryPolicy, SerprogSpi},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum TransportKind {
    /// CH341A USB to I2C bridge
    Ch341a,
    /// serprog programmer on a serial port, SPI bus
    Serprog,
}

fn parse_i2c_addr(s: &str) -> Result<u8, String> {
    let addr = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))?,
        None => s.parse::<u8>().map_err(|e| format!("Invalid number: {}", e))?,
    };
    if addr >= 0x80 {
        return Err(format!("0x{:02x} is not a 7-bit address", addr));
    }
    Ok(addr)
}

#[derive(Parser)]
#[command(name = "machxo")]
#[command(
    author,
    version,
    about = "Configuration tool for Lattice MachXO2/3 FPGAs",
    long_about = None
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Bus adapter the device is attached to
    #[arg(short, long, value_enum, default_value_t = TransportKind::Ch341a, global = true)]
    transport: TransportKind,

    /// Serial port of the serprog programmer, first port found when omitted
    #[arg(long, global = true)]
    port: Option<String>,

    /// Serial baud rate of the serprog programmer
    #[arg(long, value_enum, default_value_t = Baudrate::default(), global = true)]
    baud: Baudrate,

    /// SPI clock requested from the serprog programmer, in Hz
    #[arg(long, global = true)]
    spi_freq: Option<u32>,

    /// 7-bit I2C address of the configuration port
    #[arg(long, value_parser = parse_i2c_addr, default_value_t = DEFAULT_I2C_ADDR, global = true)]
    i2c_addr: u8,

    /// I2C clock of the CH341A
    #[arg(long, value_enum, default_value_t = I2cSpeed::default(), global = true)]
    i2c_speed: I2cSpeed,

    /// Which CH341A to use when several are plugged in
    #[arg(long, default_value_t = 0, global = true)]
    usb_index: usize,

    /// Attempts per bus transaction
    #[arg(long, default_value_t = 3, global = true)]
    retries: u32,

    /// Delay added before every further attempt
    #[arg(long, default_value_t = 10, global = true)]
    retry_backoff_ms: u64,

    /// Give up when the device stays busy for longer, waits forever when omitted
    #[arg(long, global = true)]
    busy_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get info about the connected device
    Info,
    /// Decode the status register
    Status,
    /// Erase configuration memory, configuration flash when no region is given
    Erase {
        #[arg(long)]
        sram: bool,
        #[arg(long)]
        feature_row: bool,
        #[arg(long)]
        config: bool,
        #[arg(long)]
        ufm: bool,
    },
    /// Program configuration flash and boot it
    Flash {
        /// Bitstream file: plain hex, JEDEC, Intel HEX or binary
        path: PathBuf,
        /// Format of the bitstream, guessed when omitted
        #[arg(long, value_enum)]
        format: Option<BitstreamFormat>,
        /// Every line of a plain hex file is one page
        #[arg(long)]
        page_per_record: bool,
        /// Skip reading the flash back
        #[arg(long)]
        no_verify: bool,
        /// Do not boot the new configuration
        #[arg(long)]
        no_refresh: bool,
        /// Keep the user design running while programming
        #[arg(long)]
        transparent: bool,
    },
    /// Compare configuration flash with a bitstream
    Verify {
        path: PathBuf,
        #[arg(long, value_enum)]
        format: Option<BitstreamFormat>,
        #[arg(long)]
        page_per_record: bool,
    },
    /// Dump flash pages
    Read {
        /// Read the user flash memory instead of configuration flash
        #[arg(long)]
        ufm: bool,
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// First page to read
        #[arg(long, default_value_t = 0)]
        start: u32,
        /// Write the pages to a file instead of dumping them
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Reload the configuration from flash
    Refresh,
    /// Wake the device from standby
    Wakeup,
}

fn open_transport(cli: &Cli) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match cli.transport {
        TransportKind::Ch341a => {
            let n = Ch341aI2c::scan_devices()?;
            anyhow::ensure!(n > 0, "No CH341A found");
            Box::new(Ch341aI2c::open_nth(cli.usb_index, cli.i2c_addr, cli.i2c_speed)?)
        }
        TransportKind::Serprog => {
            let mut spi = match &cli.port {
                Some(port) => SerprogSpi::open(port, cli.baud)?,
                None => {
                    log::debug!("Serial ports: {:?}", SerprogSpi::scan_ports()?);
                    SerprogSpi::open_any(cli.baud)?
                }
            };
            if let Some(freq) = cli.spi_freq {
                spi.set_spi_freq(freq)?;
            }
            Box::new(spi)
        }
    };
    Ok(transport)
}

fn layout(page_per_record: bool) -> RecordLayout {
    if page_per_record {
        RecordLayout::PagePerRecord
    } else {
        RecordLayout::Continuous
    }
}

fn run<T: Transport + ?Sized>(command: Commands, mut flashing: Flashing<'_, T>) -> Result<()> {
    match command {
        Commands::Info => {
            flashing.dump_info()?;
        }
        Commands::Status => {
            let status = flashing.device().read_status()?;
            log::info!("Status: 0x{:08x}", status.0);
            log::info!("  DONE: {}", status.done());
            log::info!("  Config enabled: {}", status.config_enabled());
            log::info!("  Busy: {}", status.busy());
            log::info!("  Fail: {}", status.fail());
            log::info!("  Config check: {}", status.config_error());
        }
        Commands::Erase {
            sram,
            feature_row,
            config,
            ufm,
        } => {
            let mut flags = EraseFlags::empty();
            flags.set(EraseFlags::SRAM, sram);
            flags.set(EraseFlags::FEATURE_ROW, feature_row);
            flags.set(EraseFlags::CONFIG_FLASH, config);
            flags.set(EraseFlags::UFM, ufm);
            if flags.is_empty() {
                flags = EraseFlags::CONFIG_FLASH;
            }
            flashing.erase(flags, ConfigMode::Offline)?;
        }
        Commands::Flash {
            path,
            format,
            page_per_record,
            no_verify,
            no_refresh,
            transparent,
        } => {
            flashing.dump_info()?;
            let bitstream = read_bitstream_from_file(&path, format)?;
            log::info!("Bitstream size: {}", bitstream.len());
            let options = FlashOptions {
                mode: if transparent {
                    ConfigMode::Transparent
                } else {
                    ConfigMode::Offline
                },
                layout: layout(page_per_record),
                verify: !no_verify,
                refresh: !no_refresh,
            };
            let report = flashing.flash(&bitstream, &options)?;
            if report.is_clean() {
                log::info!("Flashed {} pages", report.pages_written);
            } else {
                log::warn!(
                    "Flashed {} pages, {} anomalies, {} bytes left over",
                    report.pages_written,
                    report.anomalies.len(),
                    report.leftover_bytes
                );
            }
        }
        Commands::Verify {
            path,
            format,
            page_per_record,
        } => {
            let bitstream = read_bitstream_from_file(&path, format)?;
            log::info!("Bitstream size: {}", bitstream.len());
            flashing.verify(&bitstream, layout(page_per_record), ConfigMode::Transparent)?;
            log::info!("Verified!");
        }
        Commands::Read {
            ufm,
            pages,
            start,
            output,
        } => {
            let region = if ufm { Region::Ufm } else { Region::Config };
            let data = flashing.read(region, start, pages)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &data)?;
                    log::info!("{} bytes written to {}", data.len(), path.display());
                }
                None => {
                    let mut dump = Vec::new();
                    hxdmp::hexdump(&data, &mut dump)?;
                    println!("{}", String::from_utf8_lossy(&dump));
                }
            }
        }
        Commands::Refresh => {
            flashing.refresh()?;
        }
        Commands::Wakeup => {
            flashing.device().wakeup()?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let policy = RetryPolicy {
        attempts: cli.retries,
        backoff: Duration::from_millis(cli.retry_backoff_ms),
    };
    let mut transport = Retry::new(open_transport(&cli)?, policy);
    let wait = match cli.busy_timeout_ms {
        Some(ms) => WaitOptions::with_timeout(Duration::from_millis(ms)),
        None => WaitOptions::default(),
    };

    match cli.command {
        Commands::Wakeup => {
            // a sleeping part does not answer the ID read
            MachXO::new(&mut transport).wakeup()?;
            log::info!("Wakeup sent");
        }
        command => {
            let flashing = Flashing::new(&mut transport, wait)?.with_progress(cli.verbose == 0);
            run(command, flashing)?;
        }
    }

    Ok(())
}
