//! Live pcapng writer for capture output.
//!
//! Wireshark reads the capture through a FIFO, so every block must reach the
//! sink whole: each block is assembled in a scratch buffer, the total length
//! is patched into both length fields, and the result is written with a
//! single call. Two interfaces are declared up front, one carrying USB
//! packets and one carrying out-of-band info strings as Wireshark
//! "exported PDU" records dissected as syslog text.

use std::io::Write;

use anyhow::{Context, Error};

pub const LINKTYPE_USB_2_0: u16            = 288;
pub const LINKTYPE_USB_2_0_LOW_SPEED: u16  = 293;
pub const LINKTYPE_USB_2_0_FULL_SPEED: u16 = 294;
pub const LINKTYPE_USB_2_0_HIGH_SPEED: u16 = 295;
pub const LINKTYPE_WIRESHARK_UPPER_PDU: u16 = 252;

const BLOCK_SHB: u32 = 0x0a0d0d0a;
const BLOCK_IDB: u32 = 0x00000001;
const BLOCK_EPB: u32 = 0x00000006;

const BYTE_ORDER_MAGIC: u32 = 0x1a2b3c4d;
const SECTION_LENGTH_UNKNOWN: u32 = 0xffffffff;
const SNAP_LENGTH: u32 = 0xffff;

const OPT_END: u16 = 0x0000;
const OPT_SHB_HARDWARE: u16 = 0x0002;
const OPT_IF_NAME: u16 = 0x0002;
const OPT_IF_DESCRIPTION: u16 = 0x0003;
const OPT_IF_TSRESOL: u16 = 0x0009;

const INTERFACE_USB: u32 = 0;
const INTERFACE_INFO: u32 = 1;

/// Exported PDU preamble naming the dissector for info strings:
/// proto-name tag (12), length 6, "syslog", padding, end-of-tags.
const UPPER_PDU_HEADER: [u8; 14] =
    [0, 12, 0, 6, b's', b'y', b's', b'l', b'o', b'g', 0, 0, 0, 0];

pub struct Writer<W: Write> {
    dest: W,
    scratch: Vec<u8>,
}

impl<W: Write> Writer<W> {
    pub fn new(dest: W) -> Writer<W> {
        Writer {
            dest,
            scratch: Vec::with_capacity(4096),
        }
    }

    /// Write the Section Header Block.
    pub fn start_section(&mut self) -> Result<(), Error> {
        self.begin_block(BLOCK_SHB);
        self.put_u32(BYTE_ORDER_MAGIC);
        self.put_u16(1); // major version
        self.put_u16(0); // minor version
        self.put_u32(SECTION_LENGTH_UNKNOWN);
        self.put_u32(SECTION_LENGTH_UNKNOWN);
        self.put_str_option(OPT_SHB_HARDWARE, "USB Sniffer by Alex Taradov");
        self.put_end_option();
        self.finish_block()
    }

    /// Write an Interface Description Block. Interfaces are numbered in the
    /// order they are added.
    pub fn add_interface(&mut self, link_type: u16, name: &str, description: &str)
        -> Result<(), Error>
    {
        self.begin_block(BLOCK_IDB);
        self.put_u16(link_type);
        self.put_u16(0); // reserved
        self.put_u32(SNAP_LENGTH);
        self.put_str_option(OPT_IF_NAME, name);
        self.put_str_option(OPT_IF_DESCRIPTION, description);
        // Timestamp resolution 10^-9; one value byte plus padding.
        self.put_u16(OPT_IF_TSRESOL);
        self.put_u16(1);
        self.put_u32(9);
        self.put_end_option();
        self.finish_block()
    }

    /// Write a captured USB packet as an Enhanced Packet Block.
    pub fn add_packet(&mut self, timestamp_ns: u64, data: &[u8])
        -> Result<(), Error>
    {
        let length = data.len() as u32;
        self.begin_block(BLOCK_EPB);
        self.put_u32(INTERFACE_USB);
        self.put_u32((timestamp_ns >> 32) as u32);
        self.put_u32(timestamp_ns as u32);
        self.put_u32(length); // captured length
        self.put_u32(length); // original length
        self.put_bytes(data);
        self.pad();
        self.put_end_option();
        self.finish_block()
    }

    /// Write an out-of-band info string on the second interface.
    pub fn add_info(&mut self, timestamp_ns: u64, message: &str)
        -> Result<(), Error>
    {
        let length = (UPPER_PDU_HEADER.len() + message.len()) as u32;
        self.begin_block(BLOCK_EPB);
        self.put_u32(INTERFACE_INFO);
        self.put_u32((timestamp_ns >> 32) as u32);
        self.put_u32(timestamp_ns as u32);
        self.put_u32(length);
        self.put_u32(length);
        self.put_bytes(&UPPER_PDU_HEADER);
        self.put_bytes(message.as_bytes());
        self.pad();
        self.finish_block()
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.dest.flush().context("Failed to flush capture output")
    }

    fn begin_block(&mut self, block_type: u32) {
        self.put_u32(block_type);
        self.put_u32(0); // total length, patched in finish_block
    }

    /// Patch the block total length into both length fields and write the
    /// whole block to the sink at once.
    fn finish_block(&mut self) -> Result<(), Error> {
        let total = (self.scratch.len() + size_of::<u32>()) as u32;
        self.put_u32(total);
        self.scratch[4..8].copy_from_slice(&total.to_le_bytes());
        let result = self.dest
            .write_all(&self.scratch)
            .context("Failed to write capture output");
        self.scratch.clear();
        result
    }

    fn put_u16(&mut self, value: u16) {
        self.scratch.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.scratch.extend_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, data: &[u8]) {
        self.scratch.extend_from_slice(data);
    }

    fn pad(&mut self) {
        while self.scratch.len() % size_of::<u32>() != 0 {
            self.scratch.push(0);
        }
    }

    fn put_str_option(&mut self, code: u16, value: &str) {
        self.put_u16(code);
        self.put_u16(value.len() as u16);
        self.put_bytes(value.as_bytes());
        self.pad();
    }

    fn put_end_option(&mut self) {
        self.put_u16(OPT_END);
        self.put_u16(0);
    }
}
