use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    #[error("invalid hardware address: {0}")]
    InvalidMac(String),
    #[error("wake io error: {0}")]
    Io(#[from] io::Error),
}

// Out-of-band power-on. Fire-and-forget: returns once the signal is sent.
#[async_trait]
pub trait WakeSignal: Send + Sync {
    async fn wake(&self, mac: &str) -> Result<(), WakeError>;
}

pub struct MagicPacket {
    target: SocketAddr,
}

impl MagicPacket {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

#[async_trait]
impl WakeSignal for MagicPacket {
    async fn wake(&self, mac: &str) -> Result<(), WakeError> {
        let packet = magic_packet(parse_mac(mac)?);
        let bind_addr: SocketAddr = ([0, 0, 0, 0], 0).into();
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        socket.send_to(&packet, self.target).await?;
        tracing::debug!(%mac, target = %self.target, "sent wake packet");
        Ok(())
    }
}

fn parse_mac(mac: &str) -> Result<[u8; 6], WakeError> {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(WakeError::InvalidMac(mac.to_string()));
    }
    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).map_err(|_| WakeError::InvalidMac(mac.to_string()))?;
    }
    Ok(out)
}

fn magic_packet(mac: [u8; 6]) -> Vec<u8> {
    let mut packet = vec![0xFF; 6];
    for _ in 0..16 {
        packet.extend_from_slice(&mac);
    }
    packet
}
