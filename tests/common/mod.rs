//! Transport-stream checks shared by the integration tests.

use std::collections::HashMap;

pub const TS_PACKET_SIZE: usize = 188;
pub const VIDEO_PID: u16 = 0x0100;

pub struct TsPacket {
    pub pid: u16,
    pub cc: u8,
    pub unit_start: bool,
    pub random_access: bool,
    pub payload: Vec<u8>,
}

pub fn split_packets(data: &[u8]) -> Vec<TsPacket> {
    assert_eq!(data.len() % TS_PACKET_SIZE, 0, "truncated transport stream");
    data.chunks(TS_PACKET_SIZE)
        .map(|pkt| {
            assert_eq!(pkt[0], 0x47, "lost sync");
            let pid = (u16::from(pkt[1] & 0x1F) << 8) | u16::from(pkt[2]);
            let unit_start = pkt[1] & 0x40 != 0;
            let has_adaptation = pkt[3] & 0x20 != 0;
            let mut payload_start = 4;
            let mut random_access = false;
            if has_adaptation {
                let af_len = pkt[4] as usize;
                if af_len > 0 {
                    random_access = pkt[5] & 0x40 != 0;
                }
                payload_start = 5 + af_len;
            }
            TsPacket {
                pid,
                cc: pkt[3] & 0x0F,
                unit_start,
                random_access,
                payload: pkt[payload_start..].to_vec(),
            }
        })
        .collect()
}

/// Every payload-bearing packet must advance its PID's counter by one,
/// mod 16.
pub fn assert_continuity(packets: &[TsPacket]) {
    let mut last: HashMap<u16, u8> = HashMap::new();
    for (i, pkt) in packets.iter().enumerate() {
        if let Some(prev) = last.get(&pkt.pid) {
            assert_eq!(
                pkt.cc,
                (prev + 1) & 0x0F,
                "continuity break on pid {:#06x} at packet {i}",
                pkt.pid
            );
        }
        last.insert(pkt.pid, pkt.cc);
    }
}

/// PTS of the PES packet at the head of `payload`, if any.
pub fn parse_pes_pts(payload: &[u8]) -> Option<i64> {
    if payload.len() < 14 || payload[..3] != [0x00, 0x00, 0x01] {
        return None;
    }
    let p = &payload[9..14];
    Some(
        (i64::from(p[0] & 0x0E) << 29)
            | (i64::from(p[1]) << 22)
            | (i64::from(p[2] & 0xFE) << 14)
            | (i64::from(p[3]) << 7)
            | (i64::from(p[4]) >> 1),
    )
}
