//! Bulk stream pump.
//!
//! Keeps four large transfers in flight against the data endpoint so the
//! device never stalls waiting for a resubmission, and feeds completions to
//! the decoder in submission order. Everything runs on one thread: the
//! select below is the only suspension point, and the decoder runs to
//! completion between completions.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Error, bail};
use futures_channel::oneshot;
use futures_util::{FutureExt, future::FusedFuture, select_biased};
use log::info;
use portable_async_sleep::async_sleep;

use crate::capture::Capture;
use crate::device::DataEndpoint;

const TRANSFER_SIZE: usize = 512 * 2000;
const TRANSFER_COUNT: usize = 4;

/// A quiet period this long recycles the in-flight transfers so partially
/// filled buffers still reach the decoder promptly.
const TRANSFER_TIMEOUT: Duration = Duration::from_millis(250);

/// Run the capture until the stream ends, an error occurs, or a stop is
/// requested through `stop_rx`.
pub async fn run<W: Write>(
    mut endpoint: DataEndpoint,
    capture: &mut Capture<W>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<(), Error> {
    use nusb::transfer::TransferError::Cancelled;

    while endpoint.pending() < TRANSFER_COUNT {
        let buffer = endpoint.allocate(TRANSFER_SIZE);
        endpoint.submit(buffer);
    }

    let mut slowest = Duration::ZERO;

    loop {
        select_biased!(
            _ = stop_rx => {
                // Stop requested. Cancel all transfers and drain them.
                endpoint.cancel_all();
            }
            completion = endpoint.next_complete().fuse() => {
                match completion.status {
                    Ok(()) if stop_rx.is_terminated() => {
                        drop(completion);
                        if endpoint.pending() == 0 {
                            return Ok(());
                        }
                    }
                    Ok(()) => {
                        let started = Instant::now();
                        capture.feed(&completion.buffer)?;
                        let elapsed = started.elapsed();
                        if elapsed > slowest {
                            slowest = elapsed;
                            info!("Processing time = {} ms (size = {} bytes)",
                                elapsed.as_millis(), completion.buffer.len());
                        }
                        endpoint.submit(completion.buffer);
                    }
                    Err(Cancelled) if stop_rx.is_terminated() => {
                        // Cancelled during shutdown. Drop it.
                        drop(completion);
                        if endpoint.pending() == 0 {
                            return Ok(());
                        }
                    }
                    Err(Cancelled) => {
                        // Recycled by the timeout tick below. Whatever was
                        // received still goes to the decoder, in order.
                        capture.feed(&completion.buffer)?;
                        endpoint.submit(completion.buffer);
                    }
                    Err(usb_error) => {
                        return Err(Error::from(usb_error)
                            .context("Bulk transfer failed"));
                    }
                }
            }
            _ = async_sleep(TRANSFER_TIMEOUT).fuse() => {
                // No completion for a while. Benign on an idle bus.
                endpoint.cancel_all();
            }
        );
    }
}

/// 16-bit xorshift matching the pattern generator in the FPGA test mode.
struct Xorshift16 {
    state: u16,
}

impl Xorshift16 {
    fn new() -> Xorshift16 {
        Xorshift16 { state: 0x6c41 }
    }

    fn next(&mut self) -> u16 {
        self.state ^= self.state << 7;
        self.state ^= self.state >> 9;
        self.state ^= self.state << 8;
        self.state
    }
}

/// Validate the device's test pattern and report the transfer rate once a
/// second, until stopped.
pub async fn run_speed_test(
    mut endpoint: DataEndpoint,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<(), Error> {
    let mut generator = Xorshift16::new();
    let mut window_bytes: u64 = 0;
    let mut window_start = Instant::now();
    let mut count: u64 = 0;

    while endpoint.pending() < TRANSFER_COUNT {
        let buffer = endpoint.allocate(TRANSFER_SIZE);
        endpoint.submit(buffer);
    }

    loop {
        select_biased!(
            _ = stop_rx => {
                endpoint.cancel_all();
                while endpoint.pending() > 0 {
                    let _ = endpoint.next_complete().await;
                }
                return Ok(());
            }
            completion = endpoint.next_complete().fuse() => {
                completion.status.context("Bulk transfer failed")?;
                for pair in completion.buffer.chunks_exact(2) {
                    let value = u16::from_le_bytes([pair[0], pair[1]]);
                    let expected = generator.next();
                    if value != expected {
                        bail!("Data error during the speed test on count \
                               {count}: expected {expected:04x}, \
                               got {value:04x}");
                    }
                    count += 1;
                }
                window_bytes += completion.buffer.len() as u64;
                endpoint.submit(completion.buffer);

                let elapsed = window_start.elapsed();
                if elapsed > Duration::from_secs(1) {
                    let rate = window_bytes as f64
                        / elapsed.as_secs_f64() / 1e6;
                    println!("Transfer rate: {rate:5.2} MB/s");
                    window_bytes = 0;
                    window_start = Instant::now();
                }
            }
        );
    }
}
