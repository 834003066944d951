//! Streaming reader over legacy pcap and pcapng files.

use super::{RawPacket, LINKTYPE_ETHERNET};
use crate::error::CaptureError;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{Block, PcapBlockOwned, PcapError};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

const READ_BUFFER: usize = 65536;
/// Upper bound for a single record; the buffer doubles up to this on demand
const MAX_READ_BUFFER: usize = 16 << 20;
const NANOS_MAGIC: [u32; 2] = [0xa1b2_3c4d, 0x4d3c_b2a1];

/// Per pcapng interface: link type and timestamp units per second.
#[derive(Debug, Clone, Copy)]
struct InterfaceInfo {
    linktype: i32,
    units_per_sec: u64,
}

pub struct CaptureReader {
    path: PathBuf,
    reader: Box<dyn PcapReaderIterator>,
    buffer_size: usize,
    /// Legacy header state
    linktype: i32,
    nanosecond: bool,
    /// pcapng interfaces, indexed by interface id
    interfaces: Vec<InterfaceInfo>,
}

impl CaptureReader {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path).map_err(|source| CaptureError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = pcap_parser::create_reader(READ_BUFFER, BufReader::new(file)).map_err(|e| {
            CaptureError::Parse {
                path: path.to_path_buf(),
                reason: format!("not a pcap/pcapng file: {:?}", e),
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            buffer_size: READ_BUFFER,
            linktype: LINKTYPE_ETHERNET,
            nanosecond: false,
            interfaces: Vec::new(),
        })
    }

    /// Link type announced by the legacy header (or the first pcapng interface).
    pub fn linktype(&self) -> i32 {
        self.interfaces
            .first()
            .map(|i| i.linktype)
            .unwrap_or(self.linktype)
    }

    /// Next packet in file order, `None` at end of file.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let packet = match block {
                        PcapBlockOwned::LegacyHeader(hdr) => {
                            self.linktype = hdr.network.0;
                            self.nanosecond = NANOS_MAGIC.contains(&hdr.magic_number);
                            None
                        }
                        PcapBlockOwned::Legacy(pkt) => {
                            let (ts_nsec, carry) = if self.nanosecond {
                                (pkt.ts_usec % 1_000_000_000, (pkt.ts_usec / 1_000_000_000) as u64)
                            } else {
                                ((pkt.ts_usec % 1_000_000) * 1000, (pkt.ts_usec / 1_000_000) as u64)
                            };
                            let caplen = (pkt.caplen as usize).min(pkt.data.len());
                            Some(RawPacket {
                                ts_sec: pkt.ts_sec as u64 + carry,
                                ts_nsec,
                                orig_len: pkt.origlen,
                                linktype: self.linktype,
                                data: pkt.data[..caplen].to_vec(),
                            })
                        }
                        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                            self.interfaces.push(InterfaceInfo {
                                linktype: idb.linktype.0,
                                units_per_sec: units_per_sec(idb.if_tsresol),
                            });
                            None
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                            let iface = self
                                .interfaces
                                .get(epb.if_id as usize)
                                .copied()
                                .unwrap_or(InterfaceInfo {
                                    linktype: LINKTYPE_ETHERNET,
                                    units_per_sec: 1_000_000,
                                });
                            let ticks = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                            let ts_sec = ticks / iface.units_per_sec;
                            let rem = ticks % iface.units_per_sec;
                            let ts_nsec =
                                ((rem as u128 * 1_000_000_000) / iface.units_per_sec as u128) as u32;
                            let caplen = (epb.caplen as usize).min(epb.data.len());
                            Some(RawPacket {
                                ts_sec,
                                ts_nsec,
                                orig_len: epb.origlen,
                                linktype: iface.linktype,
                                data: epb.data[..caplen].to_vec(),
                            })
                        }
                        PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                            // no timestamp in simple packet blocks
                            let linktype = self
                                .interfaces
                                .first()
                                .map(|i| i.linktype)
                                .unwrap_or(self.linktype);
                            let caplen = (spb.origlen as usize).min(spb.data.len());
                            Some(RawPacket {
                                ts_sec: 0,
                                ts_nsec: 0,
                                orig_len: spb.origlen,
                                linktype,
                                data: spb.data[..caplen].to_vec(),
                            })
                        }
                        PcapBlockOwned::NG(_) => None,
                    };
                    self.reader.consume(offset);
                    if packet.is_some() {
                        return Ok(packet);
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    self.reader.refill().map_err(|e| CaptureError::Parse {
                        path: self.path.clone(),
                        reason: format!("refill error: {:?}", e),
                    })?;
                }
                Err(PcapError::BufferTooSmall) => {
                    let wanted = self.buffer_size.saturating_mul(2);
                    if wanted > MAX_READ_BUFFER || !self.reader.grow(wanted) {
                        return Err(CaptureError::Parse {
                            path: self.path.clone(),
                            reason: format!("record does not fit in {} bytes", self.buffer_size),
                        });
                    }
                    tracing::debug!(path = %self.path.display(), size = wanted, "read buffer grown");
                    self.buffer_size = wanted;
                    self.reader.refill().map_err(|e| CaptureError::Parse {
                        path: self.path.clone(),
                        reason: format!("refill error: {:?}", e),
                    })?;
                }
                Err(e) => {
                    return Err(CaptureError::Parse {
                        path: self.path.clone(),
                        reason: format!("{:?}", e),
                    })
                }
            }
        }
    }
}

/// pcapng `if_tsresol`: high bit selects base 2, otherwise base 10.
fn units_per_sec(tsresol: u8) -> u64 {
    let exp = (tsresol & 0x7f) as u32;
    if tsresol & 0x80 != 0 {
        2u64.checked_pow(exp).unwrap_or(1_000_000)
    } else {
        10u64.checked_pow(exp).unwrap_or(1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PcapWriter;

    fn frame(len: usize, fill: u8) -> RawPacket {
        RawPacket {
            ts_sec: 1_700_000_000,
            ts_nsec: 250_000,
            orig_len: len as u32,
            linktype: LINKTYPE_ETHERNET,
            data: vec![fill; len],
        }
    }

    #[test]
    fn tsresol_units() {
        assert_eq!(units_per_sec(6), 1_000_000);
        assert_eq!(units_per_sec(9), 1_000_000_000);
        assert_eq!(units_per_sec(0x80 | 10), 1024);
    }

    #[test]
    fn frames_larger_than_the_read_buffer_are_read_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jumbo.pcap");
        let mut writer = PcapWriter::create(&path, LINKTYPE_ETHERNET).unwrap();
        for (len, fill) in [(60, 1u8), (65535, 2), (60, 3), (65535, 4)] {
            writer.write_packet(&frame(len, fill)).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = CaptureReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(p) = reader.next_packet().unwrap() {
            assert!(p.data.iter().all(|b| *b == p.data[0]));
            assert_eq!(p.orig_len as usize, p.data.len());
            assert_eq!(p.ts_nsec, 250_000);
            seen.push((p.data.len(), p.data[0]));
        }
        assert_eq!(seen, vec![(60, 1), (65535, 2), (60, 3), (65535, 4)]);
    }
}
