// Art-Net Module - ArtDmx packet encoding and UDP transmission of universe frames
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::dmx::{DmxFrame, UniverseAddress, DMX_CHANNELS};
use crate::error::{Error, Result};

pub const ARTNET_PORT: u16 = 6454;

const HEADER: &[u8; 8] = b"Art-Net\0";
const OP_DMX: u16 = 0x5000;
const PROTOCOL_VERSION: u16 = 14;
const PACKET_LEN: usize = 18 + DMX_CHANNELS;

/// Delivers one universe frame to the lighting network
pub trait Transmit: Send + Sync {
    fn send(&self, address: UniverseAddress, frame: &DmxFrame) -> Result<()>;
}

/// Build an ArtDmx (OpDmx) packet carrying a full 512 channel frame
pub fn encode_dmx_packet(
    address: UniverseAddress,
    sequence: u8,
    frame: &DmxFrame,
) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];

    packet[0..8].copy_from_slice(HEADER);
    // OpCode is little-endian, everything else big-endian
    packet[8..10].copy_from_slice(&OP_DMX.to_le_bytes());
    packet[10..12].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    packet[12] = sequence;
    packet[13] = 0; // physical port
    // configured sub-net is sent as the raw SubUni byte (its universe nibble, sub-net 0)
    packet[14] = address.subnet;
    packet[15] = address.net;
    packet[16..18].copy_from_slice(&(DMX_CHANNELS as u16).to_be_bytes());
    packet[18..].copy_from_slice(frame);

    packet
}

/// Art-Net sender bound to a local gateway and aimed at one node
pub struct ArtNetController {
    socket: UdpSocket,
    node: SocketAddr,
    sequence: AtomicU8,
}

impl ArtNetController {
    /// `src` is the local address to bind (empty for all interfaces), `dst`
    /// the Art-Net node. Both use the Art-Net port unless one is given.
    pub fn new(src: &str, dst: &str) -> Result<Self> {
        let node = resolve(dst)?;
        let local = if src.is_empty() {
            SocketAddr::from(([0, 0, 0, 0], ARTNET_PORT))
        } else {
            resolve(src)?
        };

        let socket = UdpSocket::bind(local)?;
        socket.set_broadcast(true)?;

        tracing::info!("Art-Net controller {} -> {}", local, node);

        Ok(ArtNetController {
            socket,
            node,
            sequence: AtomicU8::new(0),
        })
    }

    // 0 means "sequencing disabled" on the receiving side, so cycle 1..=255
    fn next_sequence(&self) -> u8 {
        let step = |s: u8| if s == u8::MAX { 1 } else { s + 1 };
        let previous = self
            .sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(step(s)))
            .unwrap_or(0);
        step(previous)
    }
}

impl Transmit for ArtNetController {
    fn send(&self, address: UniverseAddress, frame: &DmxFrame) -> Result<()> {
        let packet = encode_dmx_packet(address, self.next_sequence(), frame);
        self.socket
            .send_to(&packet, self.node)
            .map_err(|e| Error::Transmit {
                target: format!("{} (universe {})", self.node, address),
                reason: e.to_string(),
            })?;
        tracing::trace!("Sent ArtDmx for universe {} to {}", address, self.node);
        Ok(())
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    let with_port = if addr.parse::<SocketAddr>().is_ok() || has_port(addr) {
        addr.to_string()
    } else {
        format!("{}:{}", addr, ARTNET_PORT)
    };
    with_port
        .to_socket_addrs()
        .map_err(|e| Error::InvalidParameter(format!("invalid Art-Net address {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| Error::InvalidParameter(format!("Art-Net address {} did not resolve", addr)))
}

// hostname:port, but not a bare IPv6 address
fn has_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}
