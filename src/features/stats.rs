//! Running statistics over the packets of one capture.

use super::{
    FeatureVector, AVG_DELTA_TIME, AVG_PACKET_LENGTH, AVG_TCP_PAYLOAD, DNS, FLAG_BASE, HTTP, ICMP,
    PACKET_COUNT, TCP, UDP,
};
use crate::capture::{PacketSummary, RawPacket, Transport};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct CaptureStats {
    features: FeatureVector,
    delta_sum: f64,
    length_sum: u64,
    tcp_payload_sum: u64,
    previous_ts: Option<f64>,
}

impl CaptureStats {
    pub fn packet_count(&self) -> u64 {
        self.features.counters[PACKET_COUNT]
    }

    pub fn observe(&mut self, packet: &RawPacket, ports: &HashMap<u16, usize>) {
        let summary = packet.decode();
        self.observe_summary(&summary, packet.timestamp(), packet.data.len(), ports);
    }

    pub fn observe_summary(
        &mut self,
        summary: &PacketSummary,
        ts: f64,
        length: usize,
        ports: &HashMap<u16, usize>,
    ) {
        let c = &mut self.features.counters;
        c[PACKET_COUNT] += 1;

        match summary.transport {
            Transport::Tcp(tcp) => {
                c[TCP] += 1;
                self.tcp_payload_sum += tcp.payload_len as u64;
                for bit in 0..9 {
                    if tcp.flags & (1 << bit) != 0 {
                        c[FLAG_BASE + bit] += 1;
                    }
                }
            }
            Transport::Udp { .. } => c[UDP] += 1,
            Transport::Icmp => c[ICMP] += 1,
            Transport::None => {}
        }

        if let Some((src, dst)) = summary.transport.ports() {
            let src_slot = ports.get(&src).copied();
            let dst_slot = ports.get(&dst).copied();
            if let Some(slot) = src_slot {
                c[slot] += 1;
            }
            if let Some(slot) = dst_slot.filter(|s| Some(*s) != src_slot) {
                c[slot] += 1;
            }
        }

        if summary.dns {
            c[DNS] += 1;
        }
        if summary.http {
            c[HTTP] += 1;
        }

        let previous = self.previous_ts.unwrap_or(ts);
        self.delta_sum += ts - previous;
        self.previous_ts = Some(ts);
        self.length_sum += length as u64;
    }

    pub fn finish(self) -> FeatureVector {
        let mut fv = self.features;
        let packets = fv.counters[PACKET_COUNT];
        let tcp = fv.counters[TCP];
        fv.averages[AVG_DELTA_TIME] = if packets > 1 {
            self.delta_sum / (packets - 1) as f64
        } else {
            0.0
        };
        fv.averages[AVG_PACKET_LENGTH] = if packets > 0 {
            self.length_sum as f64 / packets as f64
        } else {
            0.0
        };
        fv.averages[AVG_TCP_PAYLOAD] = if tcp > 0 {
            self.tcp_payload_sum as f64 / tcp as f64
        } else {
            0.0
        };
        fv
    }
}
