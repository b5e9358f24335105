//! Diagnostic logging.
//!
//! Wireshark gives extcap helpers no useful console: stdout belongs to the
//! extcap protocol and stderr is only shown on failure. When the
//! `USB_SNIFFER_LOG` environment variable names a file, log records are
//! appended there with timestamps; otherwise they go to stderr.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};

const LOG_ENV: &str = "USB_SNIFFER_LOG";

enum Target {
    Stderr,
    File(Mutex<File>),
}

struct Logger {
    target: Target,
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        match &self.target {
            Target::Stderr => eprintln!("{}", record.args()),
            Target::File(file) => {
                let mut file = file.lock().unwrap();
                let _ = writeln!(file, "{}  {}",
                    Local::now().format("%H:%M:%S%.3f"), record.args());
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Returns true when logging to a file, so callers can
/// decide whether verbose records are worth producing.
pub fn init() -> bool {
    let target = match std::env::var(LOG_ENV) {
        Ok(path) => match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "\nLog started on {}",
                    Local::now().format("%d/%m/%Y %H:%M:%S%.3f"));
                Target::File(Mutex::new(file))
            }
            Err(_) => Target::Stderr,
        },
        Err(_) => Target::Stderr,
    };

    let to_file = matches!(target, Target::File(_));
    if log::set_boxed_logger(Box::new(Logger { target })).is_ok() {
        log::set_max_level(if to_file {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
    to_file
}
