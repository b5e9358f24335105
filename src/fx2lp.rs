//! FX2LP firmware upload, into SRAM for one-off runs or into the boot
//! EEPROM over the I2C bridge.

use std::thread::sleep;
use std::time::Duration;

use anyhow::{Error, bail};

use crate::device::Sniffer;

const FX2LP_SIZE: usize = 16384;

/// Endpoint zero transfer size for SRAM access.
const EP0_CHUNK: usize = 64;

const EEPROM_ADDR: u8 = 0xa2;
// The part has 64-byte pages, but the bridge protocol caps a write at 32.
const EEPROM_PAGE_SIZE: usize = 32;
const EEPROM_WRITE_DELAY: Duration = Duration::from_millis(7);

const BOOT_HEADER: usize = 12;
const BOOT_FOOTER: usize = 5;

/// Upload firmware into SRAM and let it run. The core is held in reset for
/// the duration of the upload and every chunk is read back and verified.
pub fn sram_upload(device: &Sniffer, firmware: &[u8]) -> Result<(), Error> {
    if firmware.len() > FX2LP_SIZE {
        bail!("Firmware image is too big ({} bytes)", firmware.len());
    }

    device.fx2lp_reset(true)?;

    let mut verify = [0u8; EP0_CHUNK];
    for (index, chunk) in firmware.chunks(EP0_CHUNK).enumerate() {
        let addr = (index * EP0_CHUNK) as u16;
        device.fx2lp_sram_write(addr, chunk)?;
        let readback = &mut verify[..chunk.len()];
        device.fx2lp_sram_read(addr, readback)?;
        if readback != chunk {
            bail!("SRAM verification failed at address {addr:#06x}");
        }
    }

    device.fx2lp_reset(false)
}

/// Program a C2-boot image containing `firmware` into the EEPROM.
pub fn eeprom_upload(device: &Sniffer, firmware: &[u8]) -> Result<(), Error> {
    let image = boot_image(firmware)?;

    let mut verify = [0u8; EEPROM_PAGE_SIZE];
    for (index, page) in image.chunks(EEPROM_PAGE_SIZE).enumerate() {
        let addr = (index * EEPROM_PAGE_SIZE) as u16;
        eeprom_write(device, addr, page)?;
        eeprom_read(device, addr, &mut verify)?;
        if verify != *page {
            bail!("EEPROM verification failed at address {addr:#06x}");
        }
    }

    Ok(())
}

/// Wrap firmware in the C2 boot format: a 12-byte header, the image, and a
/// footer that writes 0x01 to CPUCS to release the core, padded to a whole
/// number of EEPROM pages.
fn boot_image(firmware: &[u8]) -> Result<Vec<u8>, Error> {
    let data_size = firmware.len();
    let total = (BOOT_HEADER + data_size + BOOT_FOOTER)
        .next_multiple_of(EEPROM_PAGE_SIZE);
    if total > FX2LP_SIZE {
        bail!("Firmware image is too big ({data_size} bytes)");
    }

    let mut image = vec![0xff; total];
    image[0] = 0xc2;
    image[7] = 1; // 400 kHz I2C
    image[8] = (data_size >> 8) as u8;
    image[9] = data_size as u8;
    image[10] = 0;
    image[11] = 0;
    image[BOOT_HEADER..BOOT_HEADER + data_size].copy_from_slice(firmware);
    image[BOOT_HEADER + data_size..][..BOOT_FOOTER]
        .copy_from_slice(&[0x80, 0x01, 0xe6, 0x00, 0x00]);
    Ok(image)
}

fn eeprom_write(device: &Sniffer, addr: u16, page: &[u8])
    -> Result<(), Error>
{
    let mut buffer = Vec::with_capacity(2 + page.len());
    buffer.extend_from_slice(&addr.to_be_bytes());
    buffer.extend_from_slice(page);
    device.i2c_write(EEPROM_ADDR, &buffer)?;
    sleep(EEPROM_WRITE_DELAY);
    Ok(())
}

fn eeprom_read(device: &Sniffer, addr: u16, data: &mut [u8])
    -> Result<(), Error>
{
    device.i2c_write(EEPROM_ADDR, &addr.to_be_bytes())?;
    device.i2c_read(EEPROM_ADDR, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_image_layout() {
        let firmware = [0xaa; 100];
        let image = boot_image(&firmware).unwrap();

        // Padded to a whole number of pages.
        assert_eq!(image.len() % EEPROM_PAGE_SIZE, 0);
        assert_eq!(image.len(), 128);

        assert_eq!(image[0], 0xc2);
        assert_eq!(image[8], 0);
        assert_eq!(image[9], 100);
        assert_eq!(&image[BOOT_HEADER..BOOT_HEADER + 100], &firmware);
        // Footer writes 0x01 to CPUCS (0xe600).
        assert_eq!(&image[BOOT_HEADER + 100..BOOT_HEADER + 105],
            &[0x80, 0x01, 0xe6, 0x00, 0x00]);
        // Remainder is erased-state padding.
        assert!(image[BOOT_HEADER + 105..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn boot_image_rejects_oversized_firmware() {
        let firmware = vec![0; FX2LP_SIZE];
        assert!(boot_image(&firmware).is_err());
    }
}
