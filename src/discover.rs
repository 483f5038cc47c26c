//! LAN discovery of machines.
//!
//! Machines answer a `discover` datagram broadcast on the discovery port
//! with `name@address|key:value|...`. Replies land in a [DeviceRegistry]
//! keyed by address; entries not refreshed within the TTL drop out of
//! listings until the machine announces itself again.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use dashmap::DashMap;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, task::JoinHandle, time::Instant};

use crate::{config::DiscoveryConfig, Protocol};

const DISCOVER_DATAGRAM: &[u8] = b"discover";

/// A machine that announced itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Name the machine gave itself.
    pub name: String,
    /// Where to reach it.
    pub address: IpAddr,
    /// Model, if announced.
    pub model: Option<String>,
    /// Protocol, if the announcement says.
    pub protocol: Option<Protocol>,
    /// Every other key, kept as announced.
    pub properties: BTreeMap<String, String>,
}

/// Parse a `name@address|key:value|...` announcement. An address that
/// doesn't parse is replaced by `source`, where the datagram came from.
pub fn parse_announcement(datagram: &str, source: IpAddr) -> Option<DeviceEntry> {
    let mut fields = datagram.trim().split('|');
    let (name, address) = fields.next()?.rsplit_once('@')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut entry = DeviceEntry {
        name: name.to_owned(),
        address: address.trim().parse().unwrap_or(source),
        model: None,
        protocol: None,
        properties: BTreeMap::new(),
    };

    for field in fields {
        let Some((key, value)) = field.split_once(':') else {
            tracing::trace!(field, "ignoring malformed announcement field");
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "model" => entry.model = Some(value.to_owned()),
            "SACP" => entry.protocol = Some(Protocol::Sacp),
            _ => {
                entry.properties.insert(key.to_owned(), value.to_owned());
            }
        }
    }

    Some(entry)
}

/// Everything heard from, keyed by address. Written only by the
/// discovery listener.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: DashMap<IpAddr, (DeviceEntry, Instant)>,
}

impl DeviceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn upsert(&self, entry: DeviceEntry) {
        tracing::debug!(name = %entry.name, address = %entry.address, "device announced");
        self.entries.insert(entry.address, (entry, Instant::now()));
    }

    /// Entries seen within `ttl`, ordered by address.
    pub fn entries(&self, ttl: Duration) -> Vec<DeviceEntry> {
        let now = Instant::now();
        let mut entries: Vec<DeviceEntry> = self
            .entries
            .iter()
            .filter(|item| now.duration_since(item.value().1) <= ttl)
            .map(|item| item.value().0.clone())
            .collect();
        entries.sort_by_key(|entry| entry.address);
        entries
    }
}

/// Broadcast address of every non-loopback IPv4 interface.
fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![];
    for interface in default_net::get_interfaces() {
        for net in &interface.ipv4 {
            if net.addr.is_loopback() {
                continue;
            }
            match ipnet::Ipv4Net::new(net.addr, net.prefix_len) {
                Ok(network) => targets.push(SocketAddr::from((network.broadcast(), port))),
                Err(err) => tracing::debug!(interface = interface.name, error = %err, "skipping interface"),
            }
        }
    }
    targets
}

type Round = Shared<BoxFuture<'static, Vec<DeviceEntry>>>;

/// Handle to discover machines on the local network.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    registry: Arc<DeviceRegistry>,
    config: DiscoveryConfig,
    targets: Option<Vec<SocketAddr>>,
    pending: parking_lot::Mutex<Option<Round>>,
    rounds: AtomicUsize,
    listener: JoinHandle<()>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("config", &self.config)
            .field("rounds", &self.rounds())
            .finish_non_exhaustive()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl Discovery {
    /// Bind a broadcast-capable socket and start listening for replies.
    pub async fn bind(config: DiscoveryConfig) -> Result<Arc<Self>> {
        Self::open(config, None).await
    }

    /// Like [Discovery::bind], but send discover datagrams to `targets`
    /// instead of interface broadcast addresses.
    pub async fn with_targets(config: DiscoveryConfig, targets: Vec<SocketAddr>) -> Result<Arc<Self>> {
        Self::open(config, Some(targets)).await
    }

    async fn open(config: DiscoveryConfig, targets: Option<Vec<SocketAddr>>) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        socket.set_broadcast(true)?;
        tracing::debug!(local = %socket.local_addr()?, "discovery socket bound");

        let registry = Arc::new(DeviceRegistry::new());
        let listener = tokio::spawn(listen(socket.clone(), registry.clone()));

        Ok(Arc::new(Self {
            socket,
            registry,
            config,
            targets,
            pending: parking_lot::Mutex::new(None),
            rounds: AtomicUsize::new(0),
            listener,
        }))
    }

    /// Everything heard from so far.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Broadcast rounds run so far.
    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Broadcast, wait out the debounce window, and list fresh entries.
    /// Calls made while a round is running share that round.
    pub async fn list(self: &Arc<Self>) -> Vec<DeviceEntry> {
        let round = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(round) => round.clone(),
                None => {
                    let this = self.clone();
                    let round = async move { this.round().await }.boxed().shared();
                    *pending = Some(round.clone());
                    round
                }
            }
        };
        round.await
    }

    async fn round(&self) -> Vec<DeviceEntry> {
        self.rounds.fetch_add(1, Ordering::Relaxed);

        let targets = match &self.targets {
            Some(targets) => targets.clone(),
            None => broadcast_targets(self.config.port),
        };
        for target in &targets {
            if let Err(err) = self.socket.send_to(DISCOVER_DATAGRAM, target).await {
                tracing::warn!(target = %target, error = %err, "discover broadcast failed");
            }
        }

        tokio::time::sleep(self.config.debounce()).await;
        *self.pending.lock() = None;
        self.registry.entries(self.config.ttl())
    }
}

async fn listen(socket: Arc<UdpSocket>, registry: Arc<DeviceRegistry>) {
    let mut buf = [0u8; 1536];
    loop {
        let (n, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::debug!(error = %err, "discovery receive failed");
                continue;
            }
        };

        let datagram = String::from_utf8_lossy(&buf[..n]);
        match parse_announcement(&datagram, source.ip()) {
            Some(entry) => registry.upsert(entry),
            None => tracing::trace!(source = %source, "ignoring datagram"),
        }
    }
}
