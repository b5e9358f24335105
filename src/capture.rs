//! Streaming decoder for the sniffer's framed capture stream.
//!
//! The hardware interleaves two frame kinds on the bulk endpoint: 7-byte
//! data headers followed by a USB packet payload, and 4-byte status frames
//! reporting line state, VBUS, the external trigger input and the detected
//! bus speed. Every header carries the low 20 bits of a 60 MHz tick counter
//! plus an overflow flag that advances the host-side upper bits, so the
//! decoder can reconstruct monotonic nanosecond timestamps without ever
//! comparing raw ticks across a wrap.
//!
//! Decoded events pass through the trigger gate and the fold engine before
//! being written as pcapng blocks. Folding buffers runs of SOF/IN/NAK
//! traffic and low-speed keep-alives, replacing each completed group with a
//! count, and drains the buffer in order whenever anything interesting
//! happens.

use std::fmt;
use std::io::Write;

use anyhow::Error;
use clap::ValueEnum;

use crate::pcapng::{LINKTYPE_WIRESHARK_UPPER_PDU, Writer};
use crate::usb::{BusSpeed, PID, Speed};

const STATUS_HEADER_SIZE: usize = 4;
const DATA_HEADER_SIZE: usize = 7;
const MAX_DATA_SIZE: usize = 1280;

const FOLD_BUF_SIZE: usize = 128;
const FOLD_LIMIT_LS_FS: u32 = 1000;
const FOLD_LIMIT_HS: u32 = 8000;

const TIME_US: u64 = 1000;
const TIME_MS: u64 = 1000 * TIME_US;

/// Gap after which a synthetic info event keeps the timeline alive.
const UPDATE_INTERVAL: u64 = 2000 * TIME_MS;

/// Line-state durations below this are appended to the info string.
const LS_DELTA_THRESHOLD: u64 = 10 * TIME_MS;

const MIN_KEEPALIVE_DURATION: u64 = TIME_US;
const MAX_KEEPALIVE_DURATION: u64 = 2 * TIME_US;

/// Line states relevant to low-speed keep-alive detection.
const LS_SE0: u8 = 0;
const LS_J3: u8 = 12;

/// Ticks added to the upper accumulator on every TS_OVERFLOW flag.
const TS_OVERFLOW_STEP: u64 = 1 << 20;

bitfield! {
    /// Common layout of the 4-byte status and 7-byte data frame headers.
    ///
    /// Byte 0 and the timestamp bits are shared; byte 3 onwards reads as
    /// either the status fields or the data fields depending on `is_data`.
    pub struct Header(MSB0 [u8]);
    impl Debug;
    u32;
    pub is_data, _: 0;
    pub toggle, _: 1;
    pub zero, _: 2;
    pub ts_overflow, _: 3;
    pub ticks, _: 23, 4;
    // Byte 3 of status frames.
    pub u8, from into BusSpeed, speed, _: 25, 24;
    pub trigger, _: 26;
    pub vbus, _: 27;
    pub u8, line_state, _: 31, 28;
    // Bytes 3-6 of data frames.
    pub data_error, _: 26;
    pub crc_error, _: 27;
    pub overflow, _: 28;
    pub u16, size, _: 39, 29;
    pub u16, duration, _: 55, 40;
}

/// Convert 60 MHz device ticks to nanoseconds, rounding down.
fn ticks_to_ns(ticks: u64) -> u64 {
    (ticks * 100) / 6
}

/// Condition used to gate packet emission on the external trigger input.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum TriggerMode {
    Disabled,
    Low,
    High,
    Falling,
    Rising,
}

/// Capture session settings taken from the command line.
#[derive(Copy, Clone)]
pub struct Config {
    pub speed: Speed,
    pub fold_empty: bool,
    pub trigger: TriggerMode,
    /// Number of packets to capture; 0 means unlimited.
    pub limit: u64,
}

/// In-band conditions that terminate a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStop {
    /// The configured packet limit was reached. A normal end of capture.
    LimitReached,
    /// A structural framing violation was seen. Timestamps and packet
    /// boundaries downstream of it would be untrustworthy, so the capture
    /// is never resynchronized.
    Desync,
}

impl fmt::Display for CaptureStop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CaptureStop::LimitReached => "capture limit reached",
            CaptureStop::Desync => "protocol desynchronization",
        })
    }
}

impl std::error::Error for CaptureStop {}

enum DecodeState {
    Header,
    Payload,
}

/// An event withheld by the fold engine until its disposition is known.
enum Pending {
    Packet { ts: u64, data: Vec<u8> },
    Keepalive { ts: u64 },
}

/// All capture state, fed bytes from the bulk pump and writing pcapng
/// blocks to the sink as events are decoded.
pub struct Capture<W: Write> {
    writer: Writer<W>,
    config: Config,
    // Frame decoder.
    state: DecodeState,
    scratch: [u8; DATA_HEADER_SIZE],
    filled: usize,
    need: usize,
    payload: Vec<u8>,
    payload_needed: usize,
    toggle_expected: bool,
    overflow: bool,
    crc_error: bool,
    data_error: bool,
    // Timestamp reconstruction.
    ts_hi: u64,
    ts: u64,
    last_emitted: u64,
    // Last observed status fields; None until first seen.
    line_state: Option<u8>,
    vbus: Option<bool>,
    trigger_input: Option<bool>,
    bus_speed: Option<BusSpeed>,
    // Coalescing of identical line states.
    saved_ls: Option<u8>,
    saved_ts: u64,
    enabled: bool,
    // Fold engine.
    fold_buf: Vec<Pending>,
    fold_count: u32,
    remaining: Option<u64>,
}

impl<W: Write> Capture<W> {
    /// Write the file preamble and the initial info event, returning a
    /// capture ready to consume the device byte stream.
    pub fn start(sink: W, config: Config) -> Result<Capture<W>, Error> {
        let mut writer = Writer::new(sink);
        writer.start_section()?;
        writer.add_interface(
            config.speed.link_type(), "usb", "Hardware USB interface")?;
        writer.add_interface(
            LINKTYPE_WIRESHARK_UPPER_PDU, "info", "Out of band information")?;

        let mut capture = Capture {
            writer,
            config,
            state: DecodeState::Header,
            scratch: [0; DATA_HEADER_SIZE],
            filled: 0,
            need: STATUS_HEADER_SIZE,
            payload: Vec::with_capacity(MAX_DATA_SIZE),
            payload_needed: 0,
            toggle_expected: false,
            overflow: false,
            crc_error: false,
            data_error: false,
            ts_hi: 0,
            ts: 0,
            last_emitted: 0,
            line_state: None,
            vbus: None,
            trigger_input: None,
            bus_speed: None,
            saved_ls: None,
            saved_ts: 0,
            enabled: false,
            fold_buf: Vec::with_capacity(FOLD_BUF_SIZE),
            fold_count: 0,
            remaining: (config.limit != 0).then_some(config.limit),
        };

        if capture.config.trigger == TriggerMode::Disabled {
            capture.info(0, "Starting capture")?;
            capture.enabled = true;
        } else {
            capture.info(0, "Waiting for a trigger")?;
        }

        Ok(capture)
    }

    /// Consume a chunk of the device byte stream.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), Error> {
        for &byte in data {
            self.push_byte(byte)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()
    }

    fn push_byte(&mut self, byte: u8) -> Result<(), Error> {
        match self.state {
            DecodeState::Header => {
                if self.filled == 0 {
                    // The top bit of the first byte selects the frame kind
                    // and with it the header length.
                    self.need = if byte & 0x80 == 0 {
                        STATUS_HEADER_SIZE
                    } else {
                        DATA_HEADER_SIZE
                    };
                }
                self.scratch[self.filled] = byte;
                self.filled += 1;
                if self.filled == self.need {
                    self.filled = 0;
                    self.header_event()?;
                }
            }
            DecodeState::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.payload_needed {
                    self.state = DecodeState::Header;
                    self.data_event()?;
                }
            }
        }
        Ok(())
    }

    fn header_event(&mut self) -> Result<(), Error> {
        let raw = self.scratch;
        let header = Header(&raw);

        self.check_header(header.toggle(), header.zero())?;

        if header.ts_overflow() {
            self.ts_hi += TS_OVERFLOW_STEP;
        }
        self.ts = ticks_to_ns(self.ts_hi | u64::from(header.ticks()));
        self.toggle_expected = !header.toggle();

        if self.ts - self.last_emitted > UPDATE_INTERVAL {
            self.periodic_update()?;
        }

        if !header.is_data() {
            return self.status_event(
                header.line_state(),
                header.vbus(),
                header.trigger(),
                header.speed(),
            );
        }

        let size = usize::from(header.size());
        self.check_data_size(size)?;
        self.overflow = header.overflow();
        self.crc_error = header.crc_error();
        self.data_error = header.data_error();
        self.payload_needed = size - DATA_HEADER_SIZE;
        self.payload.clear();
        if self.payload_needed == 0 {
            self.data_event()
        } else {
            self.state = DecodeState::Payload;
            Ok(())
        }
    }

    fn check_header(&mut self, toggle: bool, zero: bool) -> Result<(), Error> {
        if toggle == self.toggle_expected && !zero {
            return Ok(());
        }
        if toggle != self.toggle_expected {
            let message = format!(
                "Error: received toggle value {}, expected {}",
                u8::from(toggle), u8::from(self.toggle_expected));
            self.info(self.ts, &message)?;
        }
        if zero {
            self.info(self.ts, "Error: zero bit in the header is not zero")?;
        }
        self.desync_error()
    }

    fn check_data_size(&mut self, size: usize) -> Result<(), Error> {
        if (DATA_HEADER_SIZE..=MAX_DATA_SIZE).contains(&size) {
            return Ok(());
        }
        self.info(self.ts, &format!("Error: invalid data size ({size})"))?;
        self.desync_error()
    }

    /// Report the offending header and stop. Always returns an error.
    fn desync_error(&mut self) -> Result<(), Error> {
        self.info(self.ts,
            "Error: protocol desynchronization, stopping the capture")?;
        let header = self.scratch[..self.need]
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.info(self.ts, &format!("Packet header: {header}"))?;
        Err(CaptureStop::Desync.into())
    }

    /// Diff a status frame against the last observed values and emit info
    /// events for every transition.
    fn status_event(&mut self, ls: u8, vbus: bool, trigger: bool,
                    speed: BusSpeed)
        -> Result<(), Error>
    {
        if self.trigger_input != Some(trigger) {
            let was_enabled = self.enabled;

            self.enabled = match self.config.trigger {
                TriggerMode::Disabled => true,
                TriggerMode::Low => !trigger,
                TriggerMode::High => trigger,
                // Edge conditions latch: once triggered, stay enabled.
                TriggerMode::Falling =>
                    self.enabled
                        || (!trigger && self.trigger_input == Some(true)),
                TriggerMode::Rising =>
                    self.enabled
                        || (trigger && self.trigger_input == Some(false)),
            };
            self.trigger_input = Some(trigger);

            let ts = self.ts;
            self.info(ts, &format!("Trigger input = {}", u8::from(trigger)))?;

            if self.enabled && !was_enabled {
                self.info(ts, "Starting capture")?;
            } else if was_enabled && !self.enabled {
                self.info(ts, "Waiting for a trigger")?;
            }
        }

        if self.vbus != Some(vbus) {
            self.vbus = Some(vbus);
            let ts = self.ts;
            self.info(ts, if vbus { "VBUS ON" } else { "VBUS OFF" })?;
        }

        if self.bus_speed != Some(speed) {
            self.bus_speed = Some(speed);
            if self.enabled {
                let ts = self.ts;
                if speed == BusSpeed::Reset {
                    self.info(ts, "--- Bus Reset ---")?;
                } else {
                    self.info(ts,
                        &format!("Detected speed: {}", speed.description()))?;
                }
            }
        }

        if self.line_state != Some(ls) {
            let delta = self.ts - self.saved_ts;
            self.line_state = Some(ls);

            // A short SE0 followed by J on a low-speed bus is the host's
            // keep-alive marker, not a line-state change worth reporting.
            if self.config.speed == Speed::Low
                && self.saved_ls == Some(LS_SE0)
                && ls == LS_J3
                && delta > MIN_KEEPALIVE_DURATION
                && delta < MAX_KEEPALIVE_DURATION
            {
                self.saved_ls = None;
                let ts = self.ts;
                self.keepalive_event(ts)?;
            } else {
                self.line_state_event()?;
                self.saved_ls = Some(ls);
                self.saved_ts = self.ts;
            }
        }

        Ok(())
    }

    /// Flush the pending line-state change, if any, as an info event at the
    /// timestamp the state was entered.
    fn line_state_event(&mut self) -> Result<(), Error> {
        let Some(saved) = self.saved_ls else {
            return Ok(());
        };
        self.saved_ls = None;

        let dp = saved & 3;
        let dm = (saved >> 2) & 3;
        let delta = self.ts - self.saved_ts;
        let low_speed = self.config.speed == Speed::Low;
        let mut level = 0;

        let mut message = String::from("Line state: ");
        if dp == 0 && dm == 0 {
            message.push_str("SE0");
        } else if dp == 0 {
            message.push_str(if low_speed { "J" } else { "K" });
            level = dm;
        } else if dm == 0 {
            message.push_str(if low_speed { "K" } else { "J" });
            level = dp;
        } else {
            message.push_str(&format!("Undefined (DP={dp} / DM={dm})"));
        }

        match level {
            1 => message.push_str(" [both]"),
            2 => message.push_str(" [single]"),
            _ => {}
        }

        if delta < LS_DELTA_THRESHOLD {
            let suffix = if delta < TIME_US {
                format!(" ({:.2} ns)", delta as f64)
            } else if delta < TIME_MS {
                format!(" ({:.2} us)", delta as f64 / TIME_US as f64)
            } else {
                format!(" ({:.2} ms)", delta as f64 / TIME_MS as f64)
            };
            message.push_str(&suffix);
        }

        let ts = self.saved_ts;
        self.info(ts, &message)
    }

    /// Handle a completed data frame payload.
    fn data_event(&mut self) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }

        let data_error = self.crc_error || self.data_error;
        let allow_sof = self.config.speed != Speed::Low;
        let pid = self.payload.first().copied().map(PID::from);
        let ts = self.ts;
        let payload = std::mem::take(&mut self.payload);

        self.line_state_event()?;

        if self.overflow || data_error || self.fold_buf.len() == FOLD_BUF_SIZE {
            self.stop_folding()?;
        }

        if self.overflow {
            self.info(ts, "Hardware buffer overflow")?;
        }

        if self.data_error {
            self.info(ts, "USB PHY error")?;
        }

        if data_error || !self.config.fold_empty {
            self.emit_packet(ts, &payload)?;
            self.payload = payload;
        } else if !self.fold_buf.is_empty() {
            if pid == Some(PID::IN) || pid == Some(PID::NAK) {
                // Keep the tail of an IN/NAK pair within the group.
                self.fold_buf.push(Pending::Packet { ts, data: payload });
            } else if pid == Some(PID::SOF) && allow_sof {
                // A new frame closes the previous group.
                self.fold_count += 1;
                self.fold_buf.clear();
                let limit = if self.config.speed == Speed::High {
                    FOLD_LIMIT_HS
                } else {
                    FOLD_LIMIT_LS_FS
                };
                if self.fold_count == limit {
                    self.stop_folding()?;
                }
                self.fold_buf.push(Pending::Packet { ts, data: payload });
            } else {
                self.stop_folding()?;
                self.emit_packet(ts, &payload)?;
                self.payload = payload;
            }
        } else if pid == Some(PID::SOF) && allow_sof {
            self.fold_buf.push(Pending::Packet { ts, data: payload });
        } else {
            self.emit_packet(ts, &payload)?;
            self.payload = payload;
        }

        self.check_capture_limit()
    }

    /// Handle a recognized low-speed keep-alive.
    fn keepalive_event(&mut self, ts: u64) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }

        if !self.config.fold_empty {
            self.info(ts, "Keep-alive")?;
        } else if !self.fold_buf.is_empty() {
            self.fold_count += 1;
            self.fold_buf.clear();
            if self.fold_count == FOLD_LIMIT_LS_FS {
                self.stop_folding()?;
            }
            self.fold_buf.push(Pending::Keepalive { ts });
        } else {
            self.fold_buf.push(Pending::Keepalive { ts });
        }

        self.check_capture_limit()
    }

    /// Summarize the folded groups and release every buffered event in
    /// arrival order.
    fn stop_folding(&mut self) -> Result<(), Error> {
        if self.fold_count == 0 && self.fold_buf.is_empty() {
            return Ok(());
        }

        let count = std::mem::take(&mut self.fold_count);
        let pending = std::mem::take(&mut self.fold_buf);
        let ts = self.ts;

        match count {
            0 => {}
            1 => self.info(ts, "Folded 1 empty frame")?,
            _ => self.info(ts, &format!("Folded {count} empty frames"))?,
        }

        for entry in pending {
            match entry {
                Pending::Packet { ts, data } => self.emit_packet(ts, &data)?,
                Pending::Keepalive { ts } => self.info(ts, "Keep-alive")?,
            }
        }

        Ok(())
    }

    fn emit_packet(&mut self, ts: u64, data: &[u8]) -> Result<(), Error> {
        self.writer.add_packet(ts, data)?;
        self.last_emitted = ts;
        Ok(())
    }

    /// Emit an info string, preceded by any pending line-state event and a
    /// drain of the fold buffer, and push it through to the sink.
    fn info(&mut self, ts: u64, message: &str) -> Result<(), Error> {
        self.line_state_event()?;
        self.stop_folding()?;
        self.writer.add_info(ts, message)?;
        self.last_emitted = ts;
        self.writer.flush()
    }

    fn periodic_update(&mut self) -> Result<(), Error> {
        if self.enabled {
            let ts = self.ts;
            self.info(ts, "Periodic update")?;
        }
        Ok(())
    }

    fn check_capture_limit(&mut self) -> Result<(), Error> {
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
            if *remaining == 0 {
                let ts = self.ts;
                self.info(ts, "Capture limit reached")?;
                return Err(CaptureStop::LimitReached.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::Speed;

    const SHB: u32 = 0x0a0d0d0a;
    const IDB: u32 = 1;
    const EPB: u32 = 6;

    fn config(speed: Speed) -> Config {
        Config {
            speed,
            fold_empty: false,
            trigger: TriggerMode::Disabled,
            limit: 0,
        }
    }

    fn data_header(toggle: bool, ts_overflow: bool, ticks: u32, flags: u8,
                   size: u16)
        -> [u8; 7]
    {
        [
            0x80 | (u8::from(toggle) << 6)
                 | (u8::from(ts_overflow) << 4)
                 | ((ticks >> 16) & 0xf) as u8,
            (ticks >> 8) as u8,
            ticks as u8,
            flags | ((size >> 8) & 0x7) as u8,
            size as u8,
            0,
            0,
        ]
    }

    fn status_header(toggle: bool, ticks: u32, ls: u8, vbus: bool,
                     trigger: bool, speed: u8)
        -> [u8; 4]
    {
        [
            (u8::from(toggle) << 6) | ((ticks >> 16) & 0xf) as u8,
            (ticks >> 8) as u8,
            ticks as u8,
            ls | (u8::from(vbus) << 4) | (u8::from(trigger) << 5)
               | (speed << 6),
        ]
    }

    /// Feed one data frame carrying `payload`, with monotonically supplied
    /// toggle and tick values.
    fn feed_packet(capture: &mut Capture<&mut Vec<u8>>, toggle: bool,
                   ticks: u32, payload: &[u8])
        -> Result<(), Error>
    {
        let size = (DATA_HEADER_SIZE + payload.len()) as u16;
        capture.feed(&data_header(toggle, false, ticks, 0, size))?;
        capture.feed(payload)
    }

    struct Block {
        block_type: u32,
        body: Vec<u8>,
    }

    fn parse_blocks(data: &[u8]) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let word = |at: usize| {
                u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
            };
            let block_type = word(offset);
            let total = word(offset + 4) as usize;
            assert_eq!(total, word(offset + total - 4) as usize);
            blocks.push(Block {
                block_type,
                body: data[offset + 8..offset + total - 4].to_vec(),
            });
            offset += total;
        }
        blocks
    }

    struct Packet {
        interface: u32,
        ts: u64,
        data: Vec<u8>,
    }

    fn parse_epb(block: &Block) -> Packet {
        assert_eq!(block.block_type, EPB);
        let word = |at: usize| {
            u32::from_le_bytes(block.body[at..at + 4].try_into().unwrap())
        };
        let length = word(12) as usize;
        assert_eq!(length, word(16) as usize);
        Packet {
            interface: word(0),
            ts: (u64::from(word(4)) << 32) | u64::from(word(8)),
            data: block.body[20..20 + length].to_vec(),
        }
    }

    /// Interface-1 packets carry a 14-byte exported-PDU preamble followed
    /// by the message text.
    fn info_text(block: &Block) -> String {
        let packet = parse_epb(block);
        assert_eq!(packet.interface, 1);
        String::from_utf8(packet.data[14..].to_vec()).unwrap()
    }

    fn packets(output: &[u8]) -> Vec<Packet> {
        parse_blocks(output)
            .iter()
            .filter(|block| block.block_type == EPB)
            .map(parse_epb)
            .filter(|packet| packet.interface == 0)
            .collect()
    }

    fn infos(output: &[u8]) -> Vec<String> {
        parse_blocks(output)
            .iter()
            .filter(|block| {
                block.block_type == EPB && parse_epb(block).interface == 1
            })
            .map(info_text)
            .collect()
    }

    #[test]
    fn empty_stream_writes_preamble() {
        let mut output = Vec::new();
        let capture = Capture::start(&mut output, config(Speed::Full)).unwrap();
        drop(capture);

        let blocks = parse_blocks(&output);
        let types: Vec<u32> =
            blocks.iter().map(|block| block.block_type).collect();
        assert_eq!(types, [SHB, IDB, IDB, EPB]);

        // Link types: 294 for full-speed USB, 252 for the info interface.
        let link = |block: &Block| {
            u16::from_le_bytes(block.body[0..2].try_into().unwrap())
        };
        assert_eq!(link(&blocks[1]), 294);
        assert_eq!(link(&blocks[2]), 252);

        assert_eq!(info_text(&blocks[3]), "Starting capture");
        assert_eq!(parse_epb(&blocks[3]).ts, 0);
    }

    #[test]
    fn single_data_frame_emits_packet() {
        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            let mut payload = vec![0u8; 513];
            payload[0] = 0x2d; // SETUP
            feed_packet(&mut capture, false, 0x10, &payload).unwrap();
        }

        let packets = packets(&output);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ts, 0x10 * 100 / 6);
        assert_eq!(packets[0].data.len(), 513);
        assert_eq!(packets[0].data[0], 0x2d);
    }

    #[test]
    fn timestamp_survives_counter_wrap() {
        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            capture.feed(&data_header(false, false, 0xfffff, 0, 8)).unwrap();
            capture.feed(&[0x69]).unwrap();
            capture.feed(&data_header(true, true, 0x00000, 0, 8)).unwrap();
            capture.feed(&[0x69]).unwrap();
        }

        let packets = packets(&output);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].ts, 0xfffff * 100 / 6);
        assert_eq!(packets[1].ts, 0x100000 * 100 / 6);
        assert_eq!(packets[1].ts, 17476266);
        assert!(packets[1].ts >= packets[0].ts);
    }

    #[test]
    fn toggle_violation_is_fatal() {
        let mut output = Vec::new();
        let error = {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            // First frame must carry toggle 0.
            capture.feed(&data_header(true, false, 0x10, 0, 8)).unwrap_err()
        };
        assert_eq!(
            error.downcast_ref::<CaptureStop>(),
            Some(&CaptureStop::Desync),
        );

        let infos = infos(&output);
        assert!(infos.contains(
            &"Error: received toggle value 1, expected 0".to_string()));
        assert!(infos.contains(
            &"Error: protocol desynchronization, stopping the capture"
                .to_string()));
    }

    #[test]
    fn zero_bit_violation_reports_header_bytes() {
        let mut output = Vec::new();
        let error = {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            let mut header = data_header(false, false, 0x10, 0, 8);
            header[0] |= 0x20;
            capture.feed(&header).unwrap_err()
        };
        assert_eq!(
            error.downcast_ref::<CaptureStop>(),
            Some(&CaptureStop::Desync),
        );

        let infos = infos(&output);
        assert!(infos.contains(
            &"Error: zero bit in the header is not zero".to_string()));
        let dump = infos.iter().find(|m| m.starts_with("Packet header:"));
        assert_eq!(dump.unwrap(), "Packet header: a0 00 10 00 08 00 00");
    }

    #[test]
    fn invalid_data_size_is_fatal() {
        let mut output = Vec::new();
        let error = {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            // Declared size below the data header size.
            capture.feed(&data_header(false, false, 0x10, 0, 3)).unwrap_err()
        };
        assert_eq!(
            error.downcast_ref::<CaptureStop>(),
            Some(&CaptureStop::Desync),
        );
        assert!(infos(&output).contains(
            &"Error: invalid data size (3)".to_string()));
    }

    #[test]
    fn folds_sof_runs_and_flushes_on_interesting_packet() {
        let mut output = Vec::new();
        {
            let mut fold_config = config(Speed::Full);
            fold_config.fold_empty = true;
            let mut capture =
                Capture::start(&mut output, fold_config).unwrap();

            let mut toggle = false;
            for frame in 0..6u32 {
                let sof = [0xa5, frame as u8, 0x00];
                feed_packet(&mut capture, toggle, 0x100 + frame * 0x10, &sof)
                    .unwrap();
                toggle = !toggle;
            }
            feed_packet(&mut capture, toggle, 0x200, &[0x2d, 0x00, 0x10])
                .unwrap();
        }

        let infos = infos(&output);
        assert_eq!(infos, ["Starting capture", "Folded 5 empty frames"]);

        // Only the head of the last group survives, followed by the packet
        // that stopped folding.
        let packets = packets(&output);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data[0], 0xa5);
        assert_eq!(packets[0].data[1], 5);
        assert_eq!(packets[1].data[0], 0x2d);

        // The fold summary carries the timestamp of the stopping packet.
        let blocks = parse_blocks(&output);
        let summary = blocks
            .iter()
            .filter(|b| b.block_type == EPB)
            .find(|b| parse_epb(b).interface == 1
                && info_text(b).starts_with("Folded"))
            .unwrap();
        assert_eq!(parse_epb(summary).ts, ticks_to_ns(0x200));
    }

    #[test]
    fn in_nak_pairs_stay_attached_to_their_frame() {
        let mut output = Vec::new();
        {
            let mut fold_config = config(Speed::Full);
            fold_config.fold_empty = true;
            let mut capture =
                Capture::start(&mut output, fold_config).unwrap();

            feed_packet(&mut capture, false, 0x100, &[0xa5, 0x01, 0x00])
                .unwrap();
            feed_packet(&mut capture, true, 0x110, &[0xa5, 0x02, 0x00])
                .unwrap();
            feed_packet(&mut capture, false, 0x120, &[0x69, 0x81, 0x00])
                .unwrap();
            feed_packet(&mut capture, true, 0x130, &[0x5a]).unwrap();
            feed_packet(&mut capture, false, 0x140, &[0xe1, 0x00, 0x10])
                .unwrap();
        }

        // The OUT token is not foldable: the group in progress is dropped
        // to a count, and the SOF head plus its IN/NAK tail are released
        // before it.
        assert_eq!(infos(&output),
            ["Starting capture", "Folded 1 empty frame"]);
        let pids: Vec<u8> =
            packets(&output).iter().map(|p| p.data[0]).collect();
        assert_eq!(pids, [0xa5, 0x69, 0x5a, 0xe1]);
    }

    #[test]
    fn fold_buffer_full_forces_drain() {
        let mut output = Vec::new();
        {
            let mut fold_config = config(Speed::Full);
            fold_config.fold_empty = true;
            let mut capture =
                Capture::start(&mut output, fold_config).unwrap();

            let mut toggle = false;
            // One SOF head, then enough NAKs to fill the buffer.
            feed_packet(&mut capture, toggle, 0x100, &[0xa5, 0x00, 0x00])
                .unwrap();
            toggle = !toggle;
            for count in 0..FOLD_BUF_SIZE as u32 {
                feed_packet(&mut capture, toggle, 0x110 + count, &[0x5a])
                    .unwrap();
                toggle = !toggle;
            }
        }

        // No group completed, so there is no folded summary; the buffer
        // contents are released intact when it fills up.
        assert_eq!(infos(&output), ["Starting capture"]);
        let packets = packets(&output);
        assert_eq!(packets.len(), FOLD_BUF_SIZE + 1);
        assert_eq!(packets[0].data[0], 0xa5);
        assert!(packets[1..].iter().all(|p| p.data[0] == 0x5a));
    }

    #[test]
    fn data_error_is_annotated_and_never_folded() {
        let mut output = Vec::new();
        {
            let mut fold_config = config(Speed::Full);
            fold_config.fold_empty = true;
            let mut capture =
                Capture::start(&mut output, fold_config).unwrap();

            feed_packet(&mut capture, false, 0x100, &[0xa5, 0x00, 0x00])
                .unwrap();
            // SOF with the PHY error flag set; bit 0x20 of byte 3.
            let header = data_header(true, false, 0x110, 0x20, 10);
            capture.feed(&header).unwrap();
            capture.feed(&[0xa5, 0x01, 0x00]).unwrap();
        }

        let infos = infos(&output);
        assert_eq!(infos, ["Starting capture", "USB PHY error"]);
        // Both the buffered SOF and the errored one are emitted.
        assert_eq!(packets(&output).len(), 2);
    }

    #[test]
    fn overflow_is_annotated() {
        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            // Overflow flag is bit 0x08 of byte 3.
            capture.feed(&data_header(false, false, 0x100, 0x08, 8)).unwrap();
            capture.feed(&[0x69]).unwrap();
        }
        assert_eq!(infos(&output),
            ["Starting capture", "Hardware buffer overflow"]);
        assert_eq!(packets(&output).len(), 1);
    }

    #[test]
    fn status_changes_emit_info_events() {
        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            capture.feed(&status_header(false, 0x10, 4, true, false, 1))
                .unwrap();
            // Same fields again: no new events.
            capture.feed(&status_header(true, 0x20, 4, true, false, 1))
                .unwrap();
            // Speed changes to reset.
            capture.feed(&status_header(false, 0x30, 4, true, false, 3))
                .unwrap();
        }

        // The bus-reset info flushes the pending line-state event first.
        assert_eq!(infos(&output), [
            "Starting capture",
            "Trigger input = 0",
            "VBUS ON",
            "Detected speed: Full-Speed",
            "Line state: K [both] (534.00 ns)",
            "--- Bus Reset ---",
        ]);
    }

    #[test]
    fn line_state_events_coalesce_and_report_duration() {
        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            // SE0 entered at 266 ns.
            capture.feed(&status_header(false, 0x10, 0, false, false, 1))
                .unwrap();
            // K state (DP=0, DM=3) 1500 ns later flushes the SE0 event.
            capture.feed(&status_header(true, 0x10 + 90, 12, false, false, 1))
                .unwrap();
            // A data packet flushes the pending K state.
            feed_packet(&mut capture, false, 0x10 + 180, &[0x2d, 0x00, 0x10])
                .unwrap();
        }

        let infos = infos(&output);
        assert!(infos.contains(&"Line state: SE0 (1.50 us)".to_string()));
        assert!(infos.contains(&"Line state: K (1.50 us)".to_string()));
    }

    #[test]
    fn low_speed_keepalive_replaces_line_state_event() {
        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Low)).unwrap();
            // SE0 at T, J3 at T + 1500 ns.
            capture.feed(&status_header(false, 0x10, 0, false, false, 0))
                .unwrap();
            capture.feed(&status_header(true, 0x10 + 90, 12, false, false, 0))
                .unwrap();
        }

        let infos = infos(&output);
        assert!(infos.contains(&"Keep-alive".to_string()));
        assert!(!infos.iter().any(|m| m.starts_with("Line state: SE0")));
    }

    #[test]
    fn keepalives_fold_into_groups() {
        let mut output = Vec::new();
        {
            let mut fold_config = config(Speed::Low);
            fold_config.fold_empty = true;
            let mut capture =
                Capture::start(&mut output, fold_config).unwrap();

            // Three keep-alives: SE0 then J3, 1.5 us apart, repeated.
            let mut toggle = false;
            for cycle in 0..3u32 {
                let base = 0x10 + cycle * 4000;
                capture.feed(&status_header(toggle, base, 0, false, false, 0))
                    .unwrap();
                toggle = !toggle;
                capture.feed(
                    &status_header(toggle, base + 90, 12, false, false, 0))
                    .unwrap();
                toggle = !toggle;
            }
            // A packet stops folding; SOFs are not foldable at low speed.
            feed_packet(&mut capture, toggle, 0x10000, &[0x2d, 0x00, 0x10])
                .unwrap();
        }

        let infos = infos(&output);
        assert!(infos.contains(&"Folded 2 empty frames".to_string()));
        assert_eq!(
            infos.iter().filter(|m| m.as_str() == "Keep-alive").count(), 1);
    }

    #[test]
    fn pre_trigger_traffic_is_gated() {
        let mut output = Vec::new();
        {
            let mut gated = config(Speed::Full);
            gated.trigger = TriggerMode::Rising;
            let mut capture = Capture::start(&mut output, gated).unwrap();

            // Trigger low: packets are dropped, status is still reported.
            capture.feed(&status_header(false, 0x10, 4, true, false, 1))
                .unwrap();
            feed_packet(&mut capture, true, 0x20, &[0x2d, 0x00, 0x10])
                .unwrap();

            // Rising edge starts the capture.
            capture.feed(&status_header(false, 0x30, 4, true, true, 1))
                .unwrap();
            feed_packet(&mut capture, true, 0x40, &[0x69, 0x81, 0x00])
                .unwrap();
        }

        // Only the post-trigger packet appears on interface 0.
        let packets = packets(&output);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data[0], 0x69);
        let infos = infos(&output);
        assert!(infos.contains(&"Waiting for a trigger".to_string()));
        assert!(infos.contains(&"Trigger input = 1".to_string()));
        assert!(infos.contains(&"Starting capture".to_string()));
    }

    #[test]
    fn falling_trigger_latches() {
        let mut output = Vec::new();
        {
            let mut gated = config(Speed::Full);
            gated.trigger = TriggerMode::Falling;
            let mut capture = Capture::start(&mut output, gated).unwrap();

            capture.feed(&status_header(false, 0x10, 4, false, true, 1))
                .unwrap();
            capture.feed(&status_header(true, 0x20, 4, false, false, 1))
                .unwrap();
            // Returning high must not disable the capture again.
            capture.feed(&status_header(false, 0x30, 4, false, true, 1))
                .unwrap();
            feed_packet(&mut capture, true, 0x40, &[0x2d, 0x00, 0x10])
                .unwrap();
        }

        assert_eq!(packets(&output).len(), 1);
        assert!(!infos(&output)[1..].contains(
            &"Waiting for a trigger".to_string()));
    }

    #[test]
    fn capture_limit_reached_ends_cleanly() {
        let mut output = Vec::new();
        let error = {
            let mut limited = config(Speed::Full);
            limited.limit = 2;
            let mut capture = Capture::start(&mut output, limited).unwrap();
            feed_packet(&mut capture, false, 0x10, &[0x69]).unwrap();
            feed_packet(&mut capture, true, 0x20, &[0x69]).unwrap_err()
        };
        assert_eq!(
            error.downcast_ref::<CaptureStop>(),
            Some(&CaptureStop::LimitReached),
        );
        assert_eq!(packets(&output).len(), 2);
        assert!(infos(&output).contains(
            &"Capture limit reached".to_string()));
    }

    #[test]
    fn long_gap_emits_periodic_update() {
        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            // Each overflow advances the clock by ~17.5 ms; 120 of them
            // push the gap past the two-second threshold.
            let mut toggle = false;
            for _ in 0..120 {
                capture.feed(&status_header(toggle, 0, 4, false, false, 1))
                    .unwrap();
                toggle = !toggle;
                let mut header = status_header(toggle, 0, 4, false, false, 1);
                header[0] |= 0x10; // TS_OVERFLOW
                capture.feed(&header).unwrap();
                toggle = !toggle;
            }
        }
        assert!(infos(&output).contains(&"Periodic update".to_string()));
    }

    #[test]
    fn header_field_extraction() {
        // Data frame: toggle set, overflow flags, size 520, duration 8.
        let raw = [0xc0u8, 0x00, 0x10, 0x02, 0x08, 0x00, 0x08];
        let header = Header(&raw);
        assert!(header.is_data());
        assert!(header.toggle());
        assert!(!header.zero());
        assert!(!header.ts_overflow());
        assert_eq!(header.ticks(), 0x10);
        assert_eq!(header.size(), 520);
        assert_eq!(header.duration(), 8);
        assert!(!header.overflow());
        assert!(!header.crc_error());
        assert!(!header.data_error());

        // Status frame: line state 12, VBUS on, trigger high, high speed.
        let raw = [0x40u8, 0x01, 0x02, 12 | 0x10 | 0x20 | 0x80];
        let header = Header(&raw);
        assert!(!header.is_data());
        assert!(header.toggle());
        assert_eq!(header.ticks(), 0x102);
        assert_eq!(header.line_state(), 12);
        assert!(header.vbus());
        assert!(header.trigger());
        assert_eq!(header.speed(), BusSpeed::High);
    }

    #[test]
    fn output_parses_with_conformant_reader() {
        use std::ops::Deref;

        use byteorder_slice::{LittleEndian, result::ReadSlice};
        use pcap_file::DataLink;
        use pcap_file::pcapng::PcapNgReader;
        use pcap_file::pcapng::PcapNgState;
        use pcap_file::pcapng::blocks::{
            Block,
            ENHANCED_PACKET_BLOCK,
            INTERFACE_DESCRIPTION_BLOCK,
            section_header::SectionHeaderOption,
        };

        let mut output = Vec::new();
        {
            let mut capture =
                Capture::start(&mut output, config(Speed::Full)).unwrap();
            feed_packet(&mut capture, false, 0x10, &[0x2d, 0x00, 0x10])
                .unwrap();
        }

        let mut reader = PcapNgReader::new(&output[..]).unwrap();
        assert!(reader.section().options.iter().any(|option| matches!(
            option,
            SectionHeaderOption::Hardware(hardware)
                if hardware == "USB Sniffer by Alex Taradov",
        )));

        // Interface 0 carries full-speed USB.
        {
            let raw = reader.next_raw_block().unwrap().unwrap();
            assert_eq!(raw.type_, INTERFACE_DESCRIPTION_BLOCK);
            match raw.try_into_block::<LittleEndian>(&PcapNgState::default())
                .unwrap()
            {
                Block::InterfaceDescription(interface) =>
                    assert_eq!(interface.linktype,
                        DataLink::USB_2_0_FULL_SPEED),
                _ => panic!("expected an interface description block"),
            }
        }

        // Interface 1 is the upper-PDU info interface.
        {
            let raw = reader.next_raw_block().unwrap().unwrap();
            assert_eq!(raw.type_, INTERFACE_DESCRIPTION_BLOCK);
            let mut slice = raw.body.deref();
            let link_type = slice.read_u16::<LittleEndian>().unwrap();
            assert_eq!(link_type, 252);
        }

        // The startup info event, then the packet.
        let mut epbs = Vec::new();
        while let Some(raw) = reader.next_raw_block() {
            let raw = raw.unwrap();
            assert_eq!(raw.type_, ENHANCED_PACKET_BLOCK);
            let mut slice = raw.body.deref();
            let interface = slice.read_u32::<LittleEndian>().unwrap();
            let ts_hi = slice.read_u32::<LittleEndian>().unwrap();
            let ts_lo = slice.read_u32::<LittleEndian>().unwrap();
            let length = slice.read_u32::<LittleEndian>().unwrap();
            let ts = (u64::from(ts_hi) << 32) | u64::from(ts_lo);
            epbs.push((interface, ts, length));
        }
        assert_eq!(epbs.len(), 2);
        assert_eq!(epbs[0].0, 1);
        assert_eq!(epbs[0].1, 0);
        assert_eq!(epbs[1], (0, 266, 3));
    }

    #[test]
    fn tick_conversion_rounds_down() {
        assert_eq!(ticks_to_ns(0), 0);
        assert_eq!(ticks_to_ns(0x10), 266);
        assert_eq!(ticks_to_ns(6), 100);
        assert_eq!(ticks_to_ns(0x100000), 17476266);
    }
}
