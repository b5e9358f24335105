//! Capture tool for the FX2LP + FPGA USB 2.0 sniffer.
//!
//! Normally launched by Wireshark through the extcap mechanism, but works
//! just as well from a shell with `--capture --fifo` pointed at a file or
//! named pipe.

#[macro_use]
extern crate bitfield;

mod capture;
mod device;
mod extcap;
mod fx2lp;
mod logging;
mod pcapng;
mod pump;
mod usb;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Error, bail};
use clap::{CommandFactory, Parser};
use futures_channel::oneshot;
use futures_lite::future::block_on;
use log::info;

use capture::{Capture, CaptureStop, Config, TriggerMode};
use usb::Speed;

#[derive(Parser)]
#[command(name = "usb-sniffer", version,
    about = "Wireshark extcap capture tool for the USB 2.0 sniffer")]
pub struct Options {
    /// Select USB speed
    #[arg(short, long, value_enum, default_value = "fs",
        help_heading = "Capture")]
    pub speed: Speed,

    /// Fold empty frames
    #[arg(short = 'l', long = "fold", help_heading = "Capture")]
    pub fold: bool,

    /// Limit the number of captured packets (0 for unlimited)
    #[arg(short = 'n', long, value_name = "NUMBER", default_value_t = 0,
        help_heading = "Capture")]
    pub limit: u64,

    /// Capture trigger
    #[arg(short, long, value_enum, default_value = "disabled",
        help_heading = "Capture")]
    pub trigger: TriggerMode,

    /// Perform a transfer rate test
    #[arg(long, help_heading = "Capture")]
    pub test: bool,

    /// Show the version of this utility
    #[arg(long, value_name = "VERSION",
        help_heading = "Wireshark extcap")]
    pub extcap_version: Option<String>,

    /// Provide a list of interfaces to capture from
    #[arg(long, help_heading = "Wireshark extcap")]
    pub extcap_interfaces: bool,

    /// Provide the interface to capture from
    #[arg(long, value_name = "NAME", help_heading = "Wireshark extcap")]
    pub extcap_interface: Option<String>,

    /// Provide a list of dlts for the given interface
    #[arg(long, help_heading = "Wireshark extcap")]
    pub extcap_dlts: bool,

    /// Provide a list of configurations for the given interface
    #[arg(long, help_heading = "Wireshark extcap")]
    pub extcap_config: bool,

    /// Start capture
    #[arg(short = 'c', long, help_heading = "Wireshark extcap")]
    pub capture: bool,

    /// Output fifo or file name
    #[arg(short, long, value_name = "NAME",
        help_heading = "Wireshark extcap")]
    pub fifo: Option<PathBuf>,

    /// Upload FX2LP firmware into the SRAM and run it
    #[arg(long, value_name = "FILE", help_heading = "Firmware update")]
    pub mcu_sram: Option<PathBuf>,

    /// Program FX2LP firmware into the EEPROM
    #[arg(long, value_name = "FILE", help_heading = "Firmware update")]
    pub mcu_eeprom: Option<PathBuf>,
}

fn main() -> ExitCode {
    let log_to_file = logging::init();
    if log_to_file {
        info!("Arguments:");
        for (index, argument) in std::env::args().enumerate() {
            info!("{index}: '{argument}'");
        }
    }

    let options = Options::parse();

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => match error.downcast_ref::<CaptureStop>() {
            // Reaching the capture limit is a normal way to finish.
            Some(CaptureStop::LimitReached) => ExitCode::SUCCESS,
            _ => {
                log::error!("{error:#}");
                eprintln!("Error: {error:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run(options: &Options) -> Result<(), Error> {
    if extcap::request(options) {
        return Ok(());
    }

    if options.capture {
        return run_capture(options);
    }

    if options.test {
        return run_speed_test();
    }

    if let Some(path) = &options.mcu_sram {
        return mcu_sram(path);
    }

    if let Some(path) = &options.mcu_eeprom {
        return mcu_eeprom(path);
    }

    Options::command()
        .print_help()
        .context("Failed to print help")?;
    Ok(())
}

/// Stop channel fired from the SIGINT handler; the pump drains its
/// transfers and the capture file is flushed before exit.
fn stop_on_interrupt() -> Result<oneshot::Receiver<()>, Error> {
    let (stop_tx, stop_rx) = oneshot::channel();
    let stop_tx = Mutex::new(Some(stop_tx));
    ctrlc::set_handler(move || {
        if let Some(stop_tx) = stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(());
        }
    }).context("Failed to set the interrupt handler")?;
    Ok(stop_rx)
}

fn run_capture(options: &Options) -> Result<(), Error> {
    let Some(path) = &options.fifo else {
        bail!("--capture requires --fifo");
    };

    info!("Opening file '{}'", path.display());
    let sink = File::create(path).with_context(||
        format!("Could not open '{}'", path.display()))?;

    info!("Opening capture device");
    let sniffer = block_on(device::open(device::VID_PID))
        .context("Could not open a capture device")?;

    let config = Config {
        speed: options.speed,
        fold_empty: options.fold,
        trigger: options.trigger,
        limit: options.limit,
    };

    let stop_rx = stop_on_interrupt()?;

    block_on(async {
        let endpoint = sniffer.begin_capture(options.speed).await?;
        info!("Starting capture");
        let mut capture = Capture::start(sink, config)?;
        let result = pump::run(endpoint, &mut capture, stop_rx).await;
        capture.flush()?;
        result
    })
}

fn run_speed_test() -> Result<(), Error> {
    info!("Starting speed test");
    let sniffer = block_on(device::open(device::VID_PID))
        .context("Could not open a capture device")?;
    let stop_rx = stop_on_interrupt()?;
    block_on(async {
        let endpoint = sniffer.begin_test().await?;
        pump::run_speed_test(endpoint, stop_rx).await
    })
}

fn mcu_sram(path: &Path) -> Result<(), Error> {
    let firmware = std::fs::read(path).with_context(||
        format!("Could not read '{}'", path.display()))?;
    let device = block_on(device::open(device::FX2LP_VID_PID))
        .context("Could not open an unconfigured FX2LP device")?;
    println!("Uploading {} bytes into the FX2LP SRAM", firmware.len());
    fx2lp::sram_upload(&device, &firmware)?;
    println!("...done");
    Ok(())
}

fn mcu_eeprom(path: &Path) -> Result<(), Error> {
    let firmware = std::fs::read(path).with_context(||
        format!("Could not read '{}'", path.display()))?;
    let device = block_on(device::open(device::VID_PID))
        .context("Could not open a capture device")?;
    println!("Programming {} bytes into the FX2LP EEPROM", firmware.len());
    fx2lp::eeprom_upload(&device, &firmware)?;
    println!("...done");
    Ok(())
}
