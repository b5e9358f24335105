//! Control-plane access to the sniffer hardware.
//!
//! The FX2LP exposes everything through vendor requests on endpoint zero:
//! the four capture-control registers, SRAM access for firmware upload and
//! an I2C bridge to the boot EEPROM. Captured data arrives on a single bulk
//! IN endpoint which is claimed here and handed to the pump.

use std::time::Duration;

use anyhow::{Context, Error, bail};
use futures_util::{FutureExt, select_biased};
use log::debug;
use num_enum::IntoPrimitive;
use nusb::{
    Interface, MaybeFuture,
    transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Recipient},
};
use portable_async_sleep::async_sleep;

use crate::usb::Speed;

/// The configured sniffer.
pub const VID_PID: (u16, u16) = (0x6666, 0x6620);
/// An unconfigured FX2LP, as enumerated before any firmware runs.
pub const FX2LP_VID_PID: (u16, u16) = (0x04b4, 0x8613);

pub const DATA_ENDPOINT: u8 = 0x82;
const DATA_ENDPOINT_SIZE: usize = 512;

const CTRL_TIMEOUT: Duration = Duration::from_millis(250);
const FLUSH_TIMEOUT: Duration = Duration::from_millis(20);
const FLUSH_ATTEMPTS: usize = 100;

/// FX2LP CPU control and status register; bit 0 holds the core in reset.
const CPUCS_ADDR: u16 = 0xe600;

/// Width of the capture-control register index in the wValue encoding.
const CTRL_REG_BITS: u8 = 4;

#[derive(Debug, Clone, Copy, IntoPrimitive)]
#[repr(u8)]
enum Request {
    Fx2lp = 0xa0,
    I2cRead = 0xb0,
    I2cWrite = 0xb1,
    CaptureCtrl = 0xd0,
}

/// Single-bit capture-control registers in the FPGA.
#[derive(Debug, Clone, Copy, IntoPrimitive)]
#[repr(u8)]
pub enum CaptureReg {
    Reset = 0,
    Enable = 1,
    Speed0 = 2,
    Speed1 = 3,
    Test = 4,
}

pub type DataEndpoint = nusb::Endpoint<Bulk, In>;

/// An open sniffer (or bare FX2LP) with interface 0 claimed.
pub struct Sniffer {
    interface: Interface,
}

/// Find and open the first device matching `vid_pid`.
pub async fn open(vid_pid: (u16, u16)) -> Result<Sniffer, Error> {
    let (vid, pid) = vid_pid;
    let info = nusb::list_devices()
        .await
        .context("Failed to list USB devices")?
        .find(|info| (info.vendor_id(), info.product_id()) == vid_pid);
    let Some(info) = info else {
        bail!("No device found with ID {vid:04x}:{pid:04x}");
    };
    let device = info.open()
        .await
        .context("Failed to open device")?;
    let interface = device.claim_interface(0)
        .await
        .context("Failed to claim interface 0")?;
    Ok(Sniffer { interface })
}

impl Sniffer {
    fn vendor_out(&self, request: Request, value: u16, data: &[u8])
        -> Result<(), Error>
    {
        let control = ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: request.into(),
            value,
            index: 0,
            data,
        };
        self.interface
            .control_out(control, CTRL_TIMEOUT)
            .wait()
            .with_context(|| format!("{request:?} request failed"))?;
        Ok(())
    }

    fn vendor_in(&self, request: Request, value: u16, data: &mut [u8])
        -> Result<(), Error>
    {
        let control = ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: request.into(),
            value,
            index: 0,
            length: data.len() as u16,
        };
        let result = self.interface
            .control_in(control, CTRL_TIMEOUT)
            .wait()
            .with_context(|| format!("{request:?} request failed"))?;
        let size = result.len();
        if size != data.len() {
            bail!("{request:?} request returned {size} of {} bytes",
                data.len());
        }
        data.copy_from_slice(&result);
        Ok(())
    }

    /// Write a single-bit capture-control register.
    pub fn write_reg(&self, reg: CaptureReg, bit: bool) -> Result<(), Error> {
        debug!("capture control: {reg:?} = {}", u8::from(bit));
        let value = u16::from(u8::from(reg))
            | (u16::from(bit) << CTRL_REG_BITS);
        self.vendor_out(Request::CaptureCtrl, value, &[])
    }

    /// Bring every capture-control register to a known state.
    fn init_registers(&self) -> Result<(), Error> {
        use CaptureReg::*;
        self.write_reg(Reset, true)?;
        self.write_reg(Enable, false)?;
        self.write_reg(Test, false)?;
        self.write_reg(Speed0, true)?;
        self.write_reg(Speed0, false)?;
        self.write_reg(Speed1, true)?;
        self.write_reg(Speed1, false)?;
        Ok(())
    }

    /// Configure the hardware for a capture at `speed` and return the data
    /// endpoint, flushed of any stale bytes from a previous run.
    pub async fn begin_capture(&self, speed: Speed)
        -> Result<DataEndpoint, Error>
    {
        use CaptureReg::*;
        self.init_registers()?;
        self.write_reg(Reset, true)?;
        self.write_reg(Enable, false)?;

        let mut endpoint = self.claim_data_endpoint()?;
        self.flush_endpoint(&mut endpoint).await?;

        let bits = speed.control_bits();
        self.write_reg(Speed0, bits & 1 != 0)?;
        self.write_reg(Speed1, bits & 2 != 0)?;
        self.write_reg(Reset, false)?;
        self.write_reg(Enable, true)?;
        Ok(endpoint)
    }

    /// Configure the hardware's pattern generator for a transfer rate test.
    pub async fn begin_test(&self) -> Result<DataEndpoint, Error> {
        use CaptureReg::*;
        self.init_registers()?;
        self.write_reg(Reset, true)?;
        self.write_reg(Test, true)?;

        let mut endpoint = self.claim_data_endpoint()?;
        self.flush_endpoint(&mut endpoint).await?;

        self.write_reg(Reset, false)?;
        Ok(endpoint)
    }

    fn claim_data_endpoint(&self) -> Result<DataEndpoint, Error> {
        self.interface
            .endpoint::<Bulk, In>(DATA_ENDPOINT)
            .context("Failed to claim the data endpoint")
    }

    /// Drain stale packets buffered on the device side. A quiet 20 ms means
    /// the FIFO is empty.
    async fn flush_endpoint(&self, endpoint: &mut DataEndpoint)
        -> Result<(), Error>
    {
        for _ in 0..FLUSH_ATTEMPTS {
            let buffer = endpoint.allocate(DATA_ENDPOINT_SIZE);
            endpoint.submit(buffer);
            let timed_out = select_biased!(
                completion = endpoint.next_complete().fuse() => {
                    completion.status.context("Flush read failed")?;
                    false
                }
                _ = async_sleep(FLUSH_TIMEOUT).fuse() => true,
            );
            if timed_out {
                endpoint.cancel_all();
                while endpoint.pending() > 0 {
                    let _ = endpoint.next_complete().await;
                }
                break;
            }
        }
        Ok(())
    }

    /// Hold or release the FX2LP core via CPUCS.
    pub fn fx2lp_reset(&self, reset: bool) -> Result<(), Error> {
        self.vendor_out(Request::Fx2lp, CPUCS_ADDR, &[u8::from(reset)])
    }

    pub fn fx2lp_sram_write(&self, addr: u16, data: &[u8])
        -> Result<(), Error>
    {
        self.vendor_out(Request::Fx2lp, addr, data)
    }

    pub fn fx2lp_sram_read(&self, addr: u16, data: &mut [u8])
        -> Result<(), Error>
    {
        self.vendor_in(Request::Fx2lp, addr, data)
    }

    pub fn i2c_write(&self, addr: u8, data: &[u8]) -> Result<(), Error> {
        self.vendor_out(Request::I2cWrite, u16::from(addr), data)
    }

    pub fn i2c_read(&self, addr: u8, data: &mut [u8]) -> Result<(), Error> {
        self.vendor_in(Request::I2cRead, u16::from(addr | 1), data)
    }
}
