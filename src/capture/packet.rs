//! Per-packet protocol summary used by feature extraction and splitting.

use super::{LINKTYPE_ETHERNET, LINKTYPE_IPV4, LINKTYPE_IPV6, LINKTYPE_RAW};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;

const DNS_PORT: u16 = 53;
const DNS_HEADER_LEN: usize = 12;

const HTTP_PREFIXES: [&[u8]; 10] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
    b"HTTP/1.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSummary {
    pub src_port: u16,
    pub dst_port: u16,
    /// FIN=0x001 .. CWR=0x080, NS=0x100
    pub flags: u16,
    pub payload_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    None,
    Tcp(TcpSummary),
    Udp { src_port: u16, dst_port: u16 },
    Icmp,
}

impl Transport {
    /// (source, destination) ports for TCP and UDP
    pub fn ports(&self) -> Option<(u16, u16)> {
        match *self {
            Transport::Tcp(t) => Some((t.src_port, t.dst_port)),
            Transport::Udp { src_port, dst_port } => Some((src_port, dst_port)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSummary {
    /// (source, destination) IP
    pub endpoints: Option<(IpAddr, IpAddr)>,
    pub transport: Transport,
    pub dns: bool,
    pub http: bool,
}

impl PacketSummary {
    /// Decode what the link type allows; undecodable frames yield an empty summary.
    pub fn decode(linktype: i32, data: &[u8]) -> Self {
        let sliced = match linktype {
            LINKTYPE_ETHERNET => SlicedPacket::from_ethernet(data).ok(),
            LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => SlicedPacket::from_ip(data).ok(),
            _ => None,
        };
        match sliced {
            Some(s) => Self::from_sliced(&s),
            None => Self::empty(),
        }
    }

    fn empty() -> Self {
        Self {
            endpoints: None,
            transport: Transport::None,
            dns: false,
            http: false,
        }
    }

    fn from_sliced(sliced: &SlicedPacket<'_>) -> Self {
        let endpoints = match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let h = ipv4.header();
                Some((IpAddr::from(h.source_addr()), IpAddr::from(h.destination_addr())))
            }
            Some(NetSlice::Ipv6(ipv6)) => {
                let h = ipv6.header();
                Some((IpAddr::from(h.source_addr()), IpAddr::from(h.destination_addr())))
            }
            _ => None,
        };

        let mut summary = Self {
            endpoints,
            ..Self::empty()
        };

        match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                let payload = tcp.payload();
                summary.transport = Transport::Tcp(TcpSummary {
                    src_port: tcp.source_port(),
                    dst_port: tcp.destination_port(),
                    flags: tcp_flags(
                        tcp.fin(),
                        tcp.syn(),
                        tcp.rst(),
                        tcp.psh(),
                        tcp.ack(),
                        tcp.urg(),
                        tcp.ece(),
                        tcp.cwr(),
                        tcp.ns(),
                    ),
                    payload_len: payload.len(),
                });
                summary.dns = is_dns(tcp.source_port(), tcp.destination_port(), payload);
                summary.http = is_http(payload);
            }
            Some(TransportSlice::Udp(udp)) => {
                summary.transport = Transport::Udp {
                    src_port: udp.source_port(),
                    dst_port: udp.destination_port(),
                };
                summary.dns = is_dns(udp.source_port(), udp.destination_port(), udp.payload());
            }
            Some(TransportSlice::Icmpv4(_)) => summary.transport = Transport::Icmp,
            _ => {}
        }
        summary
    }
}

#[allow(clippy::too_many_arguments)]
fn tcp_flags(
    fin: bool,
    syn: bool,
    rst: bool,
    psh: bool,
    ack: bool,
    urg: bool,
    ece: bool,
    cwr: bool,
    ns: bool,
) -> u16 {
    [fin, syn, rst, psh, ack, urg, ece, cwr, ns]
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .fold(0u16, |acc, (bit, _)| acc | (1 << bit))
}

fn is_dns(src_port: u16, dst_port: u16, payload: &[u8]) -> bool {
    (src_port == DNS_PORT || dst_port == DNS_PORT) && payload.len() >= DNS_HEADER_LEN
}

fn is_http(payload: &[u8]) -> bool {
    HTTP_PREFIXES.iter().any(|p| payload.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn flag_bits_follow_header_order() {
        assert_eq!(tcp_flags(true, false, false, false, false, false, false, false, false), 0x001);
        assert_eq!(tcp_flags(false, true, false, false, true, false, false, false, false), 0x012);
        assert_eq!(tcp_flags(false, false, false, false, false, false, false, false, true), 0x100);
    }

    #[test]
    fn decodes_tcp_http_request() {
        let payload = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(51000, 80, 1, 1024)
            .syn()
            .psh();
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, payload).unwrap();

        let s = PacketSummary::decode(LINKTYPE_ETHERNET, &data);
        assert!(s.http);
        assert!(!s.dns);
        match s.transport {
            Transport::Tcp(t) => {
                assert_eq!((t.src_port, t.dst_port), (51000, 80));
                assert_eq!(t.flags, 0x002 | 0x008);
                assert_eq!(t.payload_len, payload.len());
            }
            other => panic!("expected tcp, got {:?}", other),
        }
    }

    #[test]
    fn decodes_udp_dns_query() {
        let payload = [0u8; 20];
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([10, 0, 0, 1], [8, 8, 8, 8], 64)
            .udp(40000, 53);
        let mut data = Vec::new();
        builder.write(&mut data, &payload).unwrap();

        let s = PacketSummary::decode(LINKTYPE_ETHERNET, &data);
        assert!(s.dns);
        assert_eq!(s.transport.ports(), Some((40000, 53)));
    }

    #[test]
    fn garbage_decodes_to_empty_summary() {
        let s = PacketSummary::decode(LINKTYPE_ETHERNET, &[0xff; 5]);
        assert_eq!(s.endpoints, None);
        assert_eq!(s.transport, Transport::None);
    }
}
