use crate::config::DiscoveryConfig;
use crate::deadline::race_with_timeout;
use crate::model::DeviceDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const DEVICE_NAME_HEADER: &str = "dlnadevicename.lge.com";
const MAX_REPLY_SIZE: usize = 4096;
const SEARCH_MX_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no device answered discovery within {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("no hardware address known for {ip}")]
    MacLookup { ip: IpAddr },
    #[error("discovery io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid discovery config: {0}")]
    Config(String),
}

#[async_trait]
pub trait Discover: Send + Sync {
    async fn discover_device(&self, timeout: Duration) -> Result<DeviceDescriptor, DiscoveryError>;
}

// Resolves an IP address to the hardware address of the host behind it.
#[async_trait]
pub trait NeighborLookup: Send + Sync {
    async fn mac_for(&self, ip: IpAddr) -> io::Result<Option<String>>;
}

pub struct SsdpDiscovery {
    search_addr: SocketAddr,
    search_target: String,
    neighbors: Arc<dyn NeighborLookup>,
}

impl SsdpDiscovery {
    pub fn new(
        search_addr: SocketAddr,
        search_target: impl Into<String>,
        neighbors: Arc<dyn NeighborLookup>,
    ) -> Self {
        Self {
            search_addr,
            search_target: search_target.into(),
            neighbors,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let search_addr = config
            .multicast_addr
            .parse()
            .map_err(|_| DiscoveryError::Config(config.multicast_addr.clone()))?;
        Ok(Self::new(
            search_addr,
            config.search_target.clone(),
            Arc::new(KernelNeighbors),
        ))
    }

    async fn scan(&self) -> Result<DeviceDescriptor, DiscoveryError> {
        let bind_addr: SocketAddr = if self.search_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        // Bound before the query goes out so an early reply waits in the socket buffer.
        let socket = UdpSocket::bind(bind_addr).await?;
        let query = search_request(&self.search_target, self.search_addr);
        socket.send_to(query.as_bytes(), self.search_addr).await?;
        tracing::debug!(target_addr = %self.search_addr, st = %self.search_target, "sent ssdp search");

        let mut buf = vec![0u8; MAX_REPLY_SIZE];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            let Some(reply) = SsdpReply::parse(&buf[..len]) else {
                continue;
            };
            let (Some(name), Some(uuid)) = (reply.device_name(), reply.uuid()) else {
                tracing::debug!(from = %from, "ignoring ssdp reply from non-target device");
                continue;
            };

            let ip = from.ip();
            let mac = self
                .neighbors
                .mac_for(ip)
                .await?
                .ok_or(DiscoveryError::MacLookup { ip })?;

            tracing::info!(%ip, %mac, %uuid, "discovered tv");
            return Ok(DeviceDescriptor {
                name: name.to_string(),
                ip: ip.to_string(),
                mac,
                uuid: uuid.to_string(),
            });
        }
    }
}

#[async_trait]
impl Discover for SsdpDiscovery {
    async fn discover_device(&self, timeout: Duration) -> Result<DeviceDescriptor, DiscoveryError> {
        race_with_timeout(self.scan(), timeout)
            .await
            .map_err(|err| DiscoveryError::Timeout(err.after))?
    }
}

fn search_request(search_target: &str, host: SocketAddr) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {host}\r\nMAN: \"ssdp:discover\"\r\nMX: {SEARCH_MX_SECS}\r\nST: {search_target}\r\n\r\n"
    )
}

#[derive(Debug, Default)]
struct SsdpReply {
    headers: HashMap<String, String>,
}

impl SsdpReply {
    fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));
        let status = lines.next()?;
        if !status.starts_with("HTTP/1.1 200") && !status.starts_with("HTTP/1.0 200") {
            return None;
        }

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        Some(Self { headers })
    }

    fn device_name(&self) -> Option<&str> {
        self.headers
            .get(DEVICE_NAME_HEADER)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    // `USN: uuid:<id>::urn:...` → `<id>`
    fn uuid(&self) -> Option<&str> {
        let usn = self.headers.get("usn")?;
        let rest = usn.strip_prefix("uuid:")?;
        let id = rest.split("::").next()?;
        (!id.is_empty()).then_some(id)
    }
}

// Reads the kernel's neighbour table, falling back to `ip neigh`.
pub struct KernelNeighbors;

#[async_trait]
impl NeighborLookup for KernelNeighbors {
    async fn mac_for(&self, ip: IpAddr) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string("/proc/net/arp").await {
            Ok(table) => {
                if let Some(mac) = parse_proc_arp(&table, ip) {
                    return Ok(Some(mac));
                }
            }
            Err(err) => tracing::debug!(error = %err, "arp table unavailable"),
        }

        let output = tokio::process::Command::new("ip")
            .args(["neigh", "show", &ip.to_string()])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                Ok(parse_ip_neigh(&String::from_utf8_lossy(&out.stdout)))
            }
            Ok(_) => Ok(None),
            Err(err) => {
                tracing::debug!(error = %err, "ip neigh unavailable");
                Ok(None)
            }
        }
    }
}

fn parse_proc_arp(table: &str, ip: IpAddr) -> Option<String> {
    let wanted = ip.to_string();
    table
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|cols| cols.first() == Some(&wanted.as_str()))
        .and_then(|cols| cols.get(3).map(|mac| mac.to_string()))
        .and_then(normalize_mac)
}

fn parse_ip_neigh(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "lladdr" {
            return words.next().map(str::to_string).and_then(normalize_mac);
        }
    }
    None
}

fn normalize_mac(mac: String) -> Option<String> {
    let upper = mac.to_ascii_uppercase();
    if upper == "00:00:00:00:00:00" || upper.split(':').count() != 6 {
        return None;
    }
    Some(upper)
}
