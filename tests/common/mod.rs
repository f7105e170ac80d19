#![cfg(test)]
#![allow(dead_code)]

use fieldgate::channel::{AckId, ChannelError, PacketChannel};
use fieldgate::config::Config;
use fieldgate::packet::Packet;
use std::path::Path;

/// In-memory channel double. Records every accepted packet and can be made
/// to refuse sends to simulate a dropped link.
#[derive(Default)]
pub struct FakeChannel {
    pub next_id: AckId,
    pub sent: Vec<(AckId, Packet)>,
    pub fail_sends: bool,
}

impl FakeChannel {
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.iter().map(|(_, p)| p.payload.clone()).collect()
    }

    pub fn last_id(&self) -> AckId {
        self.next_id
    }
}

impl PacketChannel for FakeChannel {
    fn send(&mut self, packet: &Packet) -> Result<AckId, ChannelError> {
        if self.fail_sends {
            return Err(ChannelError::Disconnected);
        }
        self.next_id += 1;
        self.sent.push((self.next_id, packet.clone()));
        Ok(self.next_id)
    }
}

pub fn base_config(extra: &str) -> Config {
    let raw = format!(
        "[agent]\nmax_packet_size = 4096\nmax_inflight = 4\n\n[streams.gps]\nbuf_size = 2\ntopic = \"/device/1/gps\"\n{extra}"
    );
    Config::parse(&raw).unwrap()
}

pub fn config_with_spill(dir: &Path, extra: &str) -> Config {
    let persistence = format!(
        "\n[persistence]\npath = \"{}\"\nmax_file_size = 1024\nmax_file_count = 3\n",
        dir.display()
    );
    base_config(&format!("{persistence}{extra}"))
}
