//! MPEG-TS push over a TCP byte stream.
//!
//! Connects to a `tcp://host:port` destination, writes the transport
//! stream header once, then muxes one packet per encoded frame. Send
//! failures after connect are logged by the caller and the sink stays
//! live; the receiver sees a plain MPEG-TS byte stream.

use std::net::TcpStream;
use std::sync::Mutex;

use crate::mpegts::{StreamLayout, TsWriter};
use crate::ring::EncodedPacket;

pub struct TcpPusher {
    writer: Mutex<TsWriter<TcpStream>>,
}

impl TcpPusher {
    pub fn connect(dest: &str, layout: StreamLayout) -> Result<Self, String> {
        let addr = parse_tcp_url(dest)?;
        let stream = TcpStream::connect(&addr)
            .map_err(|e| format!("failed to connect to {dest}: {e}"))?;
        stream
            .set_nodelay(true)
            .map_err(|e| format!("failed to set TCP_NODELAY on {dest}: {e}"))?;
        let mut writer = TsWriter::new(stream, layout);
        writer.write_header()?;
        log::info!("tcp output connected to {addr}");
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn send(&self, packet: &EncodedPacket) -> Result<(), String> {
        self.writer.lock().unwrap().write_packet(
            packet.stream,
            packet.pts,
            &packet.data,
            packet.keyframe,
        )
    }
}

/// Accepts `tcp://host:port` and returns `host:port`.
fn parse_tcp_url(dest: &str) -> Result<String, String> {
    let rest = dest
        .strip_prefix("tcp://")
        .ok_or_else(|| format!("invalid tcp output destination (want tcp://host:port): {dest}"))?;
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(rest.to_string())
        }
        _ => Err(format!(
            "invalid tcp output destination (want tcp://host:port): {dest}"
        )),
    }
}
