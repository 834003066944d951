//! Legacy pcap writer (microsecond timestamps).

use super::RawPacket;
use crate::error::CaptureError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const SNAPLEN: u32 = 65535;

pub struct PcapWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl PcapWriter {
    /// Create (truncate) `path` and write the global header.
    pub fn create(path: &Path, linktype: i32) -> Result<Self, CaptureError> {
        let file = File::create(path).map_err(|source| CaptureError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        };
        writer.write_header(linktype)?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self, linktype: i32) -> Result<(), CaptureError> {
        let mut hdr = Vec::with_capacity(24);
        hdr.extend_from_slice(&MAGIC_MICROS.to_le_bytes());
        hdr.extend_from_slice(&2u16.to_le_bytes());
        hdr.extend_from_slice(&4u16.to_le_bytes());
        hdr.extend_from_slice(&0i32.to_le_bytes());
        hdr.extend_from_slice(&0u32.to_le_bytes());
        hdr.extend_from_slice(&SNAPLEN.to_le_bytes());
        hdr.extend_from_slice(&(linktype as u32).to_le_bytes());
        self.write_all(&hdr)
    }

    pub fn write_packet(&mut self, packet: &RawPacket) -> Result<(), CaptureError> {
        let caplen = packet.data.len() as u32;
        let orig_len = packet.orig_len.max(caplen);
        let mut rec = Vec::with_capacity(16 + packet.data.len());
        rec.extend_from_slice(&(packet.ts_sec as u32).to_le_bytes());
        rec.extend_from_slice(&(packet.ts_nsec / 1000).to_le_bytes());
        rec.extend_from_slice(&caplen.to_le_bytes());
        rec.extend_from_slice(&orig_len.to_le_bytes());
        rec.extend_from_slice(&packet.data);
        self.write_all(&rec)
    }

    pub fn finish(mut self) -> Result<(), CaptureError> {
        self.out.flush().map_err(|source| CaptureError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), CaptureError> {
        self.out.write_all(bytes).map_err(|source| CaptureError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
