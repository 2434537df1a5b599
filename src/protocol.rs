//! Printer command stream: packet framing, bitmap packing and device messages.
//!
//! The vendor protocol is not public, so encoding sits behind
//! [`CommandEncoder`]. [`FramedEncoder`] is the protocol the crate ships:
//!
//! ```text
//! 22 21 | cmd | 00 | len_lo len_hi | payload | crc8(payload) | FF
//! ```
//!
//! Control packets go to the control characteristic, bitmap rows to the
//! data characteristic, and the device answers on the notify characteristic
//! with the same framing.

use std::fmt;

use crate::error::{Error, Result};
use crate::raster::LabelBitmap;

const PREAMBLE: [u8; 2] = [0x22, 0x21];
const TRAILER: u8 = 0xFF;

pub const CMD_STATUS: u8 = 0xA1;
pub const CMD_JOB_START: u8 = 0xA9;
pub const CMD_PAGE_DONE: u8 = 0xAA;
pub const CMD_CANCEL: u8 = 0xAC;
pub const CMD_PAGE_END: u8 = 0xAD;
pub const CMD_JOB_END: u8 = 0xAE;

/// CRC-8, polynomial 0x07, initial value 0.
pub fn crc8(data: &[u8]) -> u8 {
    let poly: u8 = 0x07;
    let mut crc: u8 = 0x00;

    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ poly;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Frame `payload` as a packet for command `command_id`.
pub fn build_packet(command_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREAMBLE.len() + 4 + payload.len() + 2);
    out.extend_from_slice(&PREAMBLE);
    out.push(command_id);
    out.push(0x00);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.push(crc8(payload));
    out.push(TRAILER);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command_id: u8,
    pub payload: Vec<u8>,
}

/// Parse one framed packet. The CRC is checked when present.
pub fn parse_packet(data: &[u8]) -> Result<Packet> {
    if data.len() < 6 {
        return Err(Error::Protocol("packet too short".into()));
    }
    if data[..2] != PREAMBLE {
        return Err(Error::Protocol("bad preamble".into()));
    }
    let command_id = data[2];
    let len = u16::from_le_bytes([data[4], data[5]]) as usize;
    let payload = data
        .get(6..6 + len)
        .ok_or_else(|| Error::Protocol(format!("payload truncated: want {len} bytes")))?
        .to_vec();
    if let Some(&crc) = data.get(6 + len) {
        if crc != crc8(&payload) {
            return Err(Error::Protocol(format!("crc mismatch on command {command_id:#04x}")));
        }
    }
    Ok(Packet {
        command_id,
        payload,
    })
}

/// Pack a row-major grayscale buffer (0 = black, anything else = white) into
/// 1 bit per pixel, rows top to bottom, bit 0 = leftmost pixel of each byte.
pub fn pack_1bpp_pixels(pixels: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(Error::Protocol("bitmap width/height must be > 0".into()));
    }
    let required = width
        .checked_mul(height)
        .ok_or_else(|| Error::Protocol("bitmap size overflow".into()))?;
    if pixels.len() < required {
        return Err(Error::Protocol("not enough pixels".into()));
    }
    let bytes_per_row = width.div_ceil(8);
    let mut out = Vec::with_capacity(bytes_per_row * height);
    for row in pixels[..required].chunks(width) {
        for group in row.chunks(8) {
            let mut b = 0u8;
            for (bit, &px) in group.iter().enumerate() {
                if px == 0 {
                    b |= 1 << bit;
                }
            }
            out.push(b);
        }
    }
    Ok(out)
}

/// Inverse of [`pack_1bpp_pixels`]: returns 0/255 pixels.
pub fn unpack_1bpp_pixels(packed: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    let bytes_per_row = width.div_ceil(8);
    if packed.len() < bytes_per_row * height {
        return Err(Error::Protocol("packed bitmap truncated".into()));
    }
    let mut out = Vec::with_capacity(width * height);
    for row in packed.chunks(bytes_per_row).take(height) {
        for x in 0..width {
            let black = row[x / 8] & (1 << (x % 8)) != 0;
            out.push(if black { 0 } else { 255 });
        }
    }
    Ok(out)
}

/// Split data into transport-sized chunks. A zero size means one chunk.
pub fn chunk_data(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if chunk_size == 0 {
        return vec![data];
    }
    data.chunks(chunk_size).collect()
}

/// Everything the device needs to know before the first page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeader {
    /// Bitmap width in dots (across the print head).
    pub width_dots: u16,
    /// Bitmap height in dots (feed direction).
    pub height_dots: u16,
    pub paper_type: u8,
    pub auto_detect: bool,
    pub density: u8,
    /// Copies the device should print in total.
    pub copies: u16,
    /// Pages the host will send (1, or `copies` when sending one by one).
    pub pages: u16,
    pub half_cut_depth: u8,
    pub gap_mm: u8,
    pub tail_length_mm: u8,
    pub rotation_code: u8,
}

impl JobHeader {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut p = Vec::with_capacity(16);
        p.extend_from_slice(&self.width_dots.to_le_bytes());
        p.extend_from_slice(&self.height_dots.to_le_bytes());
        p.push(self.paper_type);
        p.push(self.auto_detect as u8);
        p.push(self.density);
        p.extend_from_slice(&self.copies.to_le_bytes());
        p.extend_from_slice(&self.pages.to_le_bytes());
        p.push(self.half_cut_depth);
        p.push(self.gap_mm);
        p.push(self.tail_length_mm);
        p.push(self.rotation_code);
        p
    }

    pub fn from_payload(p: &[u8]) -> Result<Self> {
        if p.len() < 15 {
            return Err(Error::Protocol("job header too short".into()));
        }
        Ok(Self {
            width_dots: u16::from_le_bytes([p[0], p[1]]),
            height_dots: u16::from_le_bytes([p[2], p[3]]),
            paper_type: p[4],
            auto_detect: p[5] != 0,
            density: p[6],
            copies: u16::from_le_bytes([p[7], p[8]]),
            pages: u16::from_le_bytes([p[9], p[10]]),
            half_cut_depth: p[11],
            gap_mm: p[12],
            tail_length_mm: p[13],
            rotation_code: p[14],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterState {
    Standby,
    Printing,
    Unknown,
}

/// Hardware conditions that stop a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterFault {
    NoPaper,
    CoverOpen,
    Overheated,
    LowBattery,
    PaperJam,
    Other(u8),
}

impl PrinterFault {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::NoPaper,
            0x02 => Self::CoverOpen,
            0x03 => Self::Overheated,
            0x04 => Self::LowBattery,
            0x05 => Self::PaperJam,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::NoPaper => 0x01,
            Self::CoverOpen => 0x02,
            Self::Overheated => 0x03,
            Self::LowBattery => 0x04,
            Self::PaperJam => 0x05,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for PrinterFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPaper => write!(f, "out of labels"),
            Self::CoverOpen => write!(f, "cover open"),
            Self::Overheated => write!(f, "print head overheated"),
            Self::LowBattery => write!(f, "battery too low"),
            Self::PaperJam => write!(f, "paper jam"),
            Self::Other(code) => write!(f, "error code {code:#04x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterStatus {
    pub battery_percent: Option<u8>,
    pub temperature: Option<u8>,
    pub state: PrinterState,
    pub fault: Option<PrinterFault>,
}

impl PrinterStatus {
    /// Payload layout: `[state, battery, temperature, fault]`, where state is
    /// 0 standby / 1 printing and fault 0 means none.
    pub fn from_payload(payload: &[u8]) -> Self {
        let state = match payload.first() {
            Some(0) => PrinterState::Standby,
            Some(1) => PrinterState::Printing,
            _ => PrinterState::Unknown,
        };
        let fault = payload
            .get(3)
            .copied()
            .filter(|&code| code != 0)
            .map(PrinterFault::from_code);
        Self {
            battery_percent: payload.get(1).copied(),
            temperature: payload.get(2).copied(),
            state,
            fault,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let state = match self.state {
            PrinterState::Standby => 0,
            PrinterState::Printing => 1,
            PrinterState::Unknown => 0xFF,
        };
        vec![
            state,
            self.battery_percent.unwrap_or(0),
            self.temperature.unwrap_or(0),
            self.fault.map(PrinterFault::code).unwrap_or(0),
        ]
    }
}

/// Decoded device notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    Status(PrinterStatus),
    JobAccepted,
    JobRejected,
    /// A label left the printer; carries the running count.
    PageDone { printed: u16 },
    /// The device aborted the job.
    Fault(PrinterFault),
    Other(Packet),
}

/// Turns jobs and bitmaps into bytes for a particular printer family.
pub trait CommandEncoder: Send + Sync {
    fn status_request(&self) -> Vec<u8>;
    fn job_start(&self, header: &JobHeader) -> Vec<u8>;
    /// Raster payload for one page, written to the data channel.
    fn page_data(&self, bitmap: &LabelBitmap) -> Result<Vec<u8>>;
    fn page_end(&self, page_index: u16) -> Vec<u8>;
    fn job_end(&self) -> Vec<u8>;
    fn cancel(&self) -> Vec<u8>;
    fn decode(&self, notification: &[u8]) -> Result<DeviceMessage>;
}

/// The framed raster protocol described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedEncoder;

impl CommandEncoder for FramedEncoder {
    fn status_request(&self) -> Vec<u8> {
        build_packet(CMD_STATUS, &[0x00])
    }

    fn job_start(&self, header: &JobHeader) -> Vec<u8> {
        build_packet(CMD_JOB_START, &header.to_payload())
    }

    fn page_data(&self, bitmap: &LabelBitmap) -> Result<Vec<u8>> {
        pack_1bpp_pixels(bitmap.pixels(), bitmap.width() as usize, bitmap.height() as usize)
    }

    fn page_end(&self, page_index: u16) -> Vec<u8> {
        build_packet(CMD_PAGE_END, &page_index.to_le_bytes())
    }

    fn job_end(&self) -> Vec<u8> {
        build_packet(CMD_JOB_END, &[0x00])
    }

    fn cancel(&self) -> Vec<u8> {
        build_packet(CMD_CANCEL, &[0x00])
    }

    fn decode(&self, notification: &[u8]) -> Result<DeviceMessage> {
        let packet = parse_packet(notification)?;
        let msg = match packet.command_id {
            CMD_STATUS => DeviceMessage::Status(PrinterStatus::from_payload(&packet.payload)),
            CMD_JOB_START => match packet.payload.first() {
                Some(0x00) => DeviceMessage::JobAccepted,
                Some(0x01) => DeviceMessage::JobRejected,
                Some(&code) => DeviceMessage::Fault(PrinterFault::from_code(code)),
                None => return Err(Error::Protocol("empty job-start response".into())),
            },
            CMD_PAGE_DONE => {
                let p = &packet.payload;
                if p.len() < 2 {
                    return Err(Error::Protocol("short page-done payload".into()));
                }
                DeviceMessage::PageDone {
                    printed: u16::from_le_bytes([p[0], p[1]]),
                }
            }
            CMD_CANCEL => match packet.payload.first() {
                Some(&code) if code != 0 => DeviceMessage::Fault(PrinterFault::from_code(code)),
                _ => DeviceMessage::Other(packet),
            },
            _ => DeviceMessage::Other(packet),
        };
        Ok(msg)
    }
}
