//! Capture file access: streaming reader, packet decoding, legacy pcap writer.

mod packet;
mod reader;
mod writer;

pub use packet::{PacketSummary, TcpSummary, Transport};
pub use reader::CaptureReader;
pub use writer::PcapWriter;

/// Ethernet link type (DLT_EN10MB)
pub const LINKTYPE_ETHERNET: i32 = 1;
/// Raw IP link type (DLT_RAW)
pub const LINKTYPE_RAW: i32 = 101;
pub const LINKTYPE_IPV4: i32 = 228;
pub const LINKTYPE_IPV6: i32 = 229;

/// One captured frame with its timestamp, owned.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub ts_sec: u64,
    pub ts_nsec: u32,
    pub orig_len: u32,
    pub linktype: i32,
    pub data: Vec<u8>,
}

impl RawPacket {
    /// Timestamp in seconds
    pub fn timestamp(&self) -> f64 {
        self.ts_sec as f64 + self.ts_nsec as f64 / 1e9
    }

    pub fn decode(&self) -> PacketSummary {
        PacketSummary::decode(self.linktype, &self.data)
    }
}
