/*!
 * Device discovery for starsync.
 *
 * Locates Alpaca servers on the network via the UDP discovery protocol,
 * enumerates their configured devices over the management API, and merges
 * the results into the registry. Automatic scans and manual address/port
 * entry share one merge path; descriptors are deduplicated by
 * `address:port` and manual entries keep their tag across rescans.
 */
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use starsync_core::config::SharedConfig;
use starsync_core::error::Error as CoreError;
use starsync_core::event::SharedEventBus;
use starsync_core::types::Value;
use starsync_core::utils::with_timeout;

use crate::device::{Device, DeviceError, DeviceEvent, DeviceType, Result};
use crate::registry::SharedDeviceRegistry;
use crate::transport::{Transport, TransportRequest};

/// Payload broadcast to solicit Alpaca discovery responses
const DISCOVERY_MESSAGE: &[u8] = b"alpacadiscovery1";

/// An Alpaca server found by a scan or registered manually
///
/// Ephemeral: a later pass produces a replacement descriptor for the same
/// `address:port` rather than mutating this one.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredServer {
    /// Host address the server answered from
    pub address: String,
    /// HTTP port of the Alpaca API
    pub port: u16,
    /// Server name from the management description
    pub server_name: String,
    /// Manufacturer from the management description
    pub manufacturer: String,
    /// When this descriptor was produced
    pub discovered_at: DateTime<Utc>,
    /// Whether the server was entered manually by the operator
    pub is_manual_entry: bool,
}

impl DiscoveredServer {
    /// Dedup key: `address:port`
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Build the endpoint URL for a device, routing through the proxy when set
///
/// Direct endpoints have the form
/// `http://{address}:{port}/api/v1/{type}/{number}`; proxied endpoints are
/// `{proxy}/proxy/{address}/{port}/api/v1/{type}/{number}`. The rewrite is
/// deterministic and reversible via [`invert_proxied_endpoint`].
pub fn device_endpoint(
    proxy_base: Option<&str>,
    address: &str,
    port: u16,
    device_type: DeviceType,
    number: u32,
) -> Result<url::Url> {
    let raw = match proxy_base {
        Some(base) => format!(
            "{}/proxy/{}/{}/api/v1/{}/{}",
            base.trim_end_matches('/'),
            address,
            port,
            device_type.as_path(),
            number
        ),
        None => format!(
            "http://{}:{}/api/v1/{}/{}",
            address,
            port,
            device_type.as_path(),
            number
        ),
    };
    url::Url::parse(&raw)
        .map_err(|e| DeviceError::discovery(raw, format!("invalid endpoint: {}", e)))
}

/// Recover the original `(address, port)` behind an endpoint URL
///
/// Understands both direct and proxied endpoint forms; used for
/// diagnostics only, since descriptors always retain the originals.
pub fn invert_proxied_endpoint(endpoint: &url::Url) -> Option<(String, u16)> {
    let segments: Vec<&str> = endpoint.path_segments()?.collect();
    if let Some(idx) = segments.iter().position(|s| *s == "proxy") {
        let address = segments.get(idx + 1)?;
        let port = segments.get(idx + 2)?.parse::<u16>().ok()?;
        return Some(((*address).to_string(), port));
    }
    let host = endpoint.host_str()?;
    let port = endpoint.port_or_known_default()?;
    Some((host.to_string(), port))
}

type ScanFuture = Shared<BoxFuture<'static, Vec<DiscoveredServer>>>;

struct DiscoveryInner {
    config: SharedConfig,
    transport: Arc<dyn Transport>,
    registry: SharedDeviceRegistry,
    bus: SharedEventBus<DeviceEvent>,
    servers: Mutex<HashMap<String, DiscoveredServer>>,
    in_flight: tokio::sync::Mutex<Option<(u64, ScanFuture)>>,
    scan_generation: AtomicU64,
}

/// Discovery service
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryService {
    /// Create a discovery service
    pub fn new(
        config: SharedConfig,
        transport: Arc<dyn Transport>,
        registry: SharedDeviceRegistry,
        bus: SharedEventBus<DeviceEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                transport,
                registry,
                bus,
                servers: Mutex::new(HashMap::new()),
                in_flight: tokio::sync::Mutex::new(None),
                scan_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Run a discovery pass
    ///
    /// Broadcasts the discovery message, enumerates every responding
    /// server, registers its devices, and returns the descriptors of this
    /// pass. Silence is an empty result, not an error. A `discover` call
    /// while a scan is already in flight joins that scan instead of
    /// starting a second one.
    pub async fn discover(&self) -> Vec<DiscoveredServer> {
        let (generation, scan) = {
            let mut guard = self.inner.in_flight.lock().await;
            if let Some((generation, scan)) = guard.as_ref() {
                debug!("Joining discovery scan already in flight");
                (*generation, scan.clone())
            } else {
                let generation = self
                    .inner
                    .scan_generation
                    .fetch_add(1, Ordering::Relaxed);
                let inner = Arc::clone(&self.inner);
                let scan: ScanFuture = async move { run_scan(inner).await }.boxed().shared();
                *guard = Some((generation, scan.clone()));
                (generation, scan)
            }
        };

        let result = scan.await;

        let mut guard = self.inner.in_flight.lock().await;
        if matches!(guard.as_ref(), Some((current, _)) if *current == generation) {
            *guard = None;
        }
        result
    }

    /// Register an Alpaca server by address and port
    ///
    /// Validates the address syntactically, enumerates the server's
    /// configured devices, and merges them into the registry exactly like
    /// an automatic scan would. The resulting descriptor is tagged
    /// `is_manual_entry`, and that tag survives later automatic rescans.
    pub async fn add_manual(&self, address: &str, port: u16) -> Result<DiscoveredServer> {
        validate_address(address, port)?;

        let mut descriptor = enumerate_server(&self.inner, address, port).await?;
        descriptor.is_manual_entry = true;

        let mut servers = self.inner.servers.lock().expect("descriptor lock poisoned");
        servers.insert(descriptor.key(), descriptor.clone());
        info!("Manually registered server {}", descriptor.key());
        Ok(descriptor)
    }

    /// Snapshot of the current descriptor set
    pub fn servers(&self) -> Vec<DiscoveredServer> {
        let servers = self.inner.servers.lock().expect("descriptor lock poisoned");
        let mut list: Vec<DiscoveredServer> = servers.values().cloned().collect();
        list.sort_by(|a, b| a.key().cmp(&b.key()));
        list
    }
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService").finish_non_exhaustive()
    }
}

fn validate_address(address: &str, port: u16) -> Result<()> {
    let endpoint = format!("{}:{}", address, port);
    if address.is_empty() {
        return Err(DeviceError::discovery(endpoint, "address must not be empty"));
    }
    if address.contains(char::is_whitespace) {
        return Err(DeviceError::discovery(
            endpoint,
            "address must not contain whitespace",
        ));
    }
    if address.contains("://") {
        return Err(DeviceError::discovery(
            endpoint,
            "address must be a bare host, not a URL",
        ));
    }
    if port == 0 {
        return Err(DeviceError::discovery(endpoint, "port must be non-zero"));
    }
    Ok(())
}

async fn run_scan(inner: Arc<DiscoveryInner>) -> Vec<DiscoveredServer> {
    let discovery = inner.config.get().discovery.clone();
    let candidates = probe_network(
        discovery.port,
        discovery.scan_window(),
        &discovery.extra_targets,
    )
    .await;

    if candidates.is_empty() {
        debug!("Discovery pass found no servers");
    }

    let mut found = Vec::new();
    for (address, port) in candidates {
        match enumerate_server(&inner, &address, port).await {
            Ok(descriptor) => found.push(descriptor),
            Err(error) => {
                // One unreachable server must not abort the pass
                warn!("Failed to enumerate {}:{}: {}", address, port, error);
                inner.bus.publish(&DeviceEvent::Error {
                    id: None,
                    message: error.to_string(),
                });
            }
        }
    }

    let mut servers = inner.servers.lock().expect("descriptor lock poisoned");
    for mut descriptor in found.clone() {
        // Replace wholesale, but the manual tag is sticky
        if let Some(existing) = servers.get(&descriptor.key()) {
            descriptor.is_manual_entry |= existing.is_manual_entry;
        }
        servers.insert(descriptor.key(), descriptor);
    }

    found
        .into_iter()
        .map(|d| servers.get(&d.key()).cloned().unwrap_or(d))
        .collect()
}

/// Broadcast the discovery message and collect `(address, port)` responders
async fn probe_network(
    discovery_port: u16,
    window: Duration,
    extra_targets: &[String],
) -> Vec<(String, u16)> {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(error) => {
            warn!("Could not bind discovery socket: {}", error);
            return Vec::new();
        }
    };
    if let Err(error) = socket.set_broadcast(true) {
        warn!("Could not enable broadcast: {}", error);
    }

    if let Err(error) = socket
        .send_to(DISCOVERY_MESSAGE, (Ipv4Addr::BROADCAST, discovery_port))
        .await
    {
        debug!("Broadcast send failed: {}", error);
    }
    for target in extra_targets {
        if let Err(error) = socket
            .send_to(DISCOVERY_MESSAGE, (target.as_str(), discovery_port))
            .await
        {
            debug!("Unicast probe of {} failed: {}", target, error);
        }
    }

    let mut responders = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let deadline = tokio::time::Instant::now() + window;
    let mut buffer = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let received = with_timeout(remaining, async {
            socket.recv_from(&mut buffer).await.map_err(CoreError::from)
        })
        .await;
        match received {
            Ok((len, peer)) => {
                let Some(port) = parse_discovery_response(&buffer[..len]) else {
                    debug!("Ignoring malformed discovery response from {}", peer);
                    continue;
                };
                let address = peer.ip().to_string();
                if seen.insert(format!("{}:{}", address, port)) {
                    debug!("Server responded from {}:{}", address, port);
                    responders.push((address, port));
                }
            }
            Err(CoreError::Timeout(_)) => break, // window elapsed
            Err(error) => {
                debug!("Discovery receive failed: {}", error);
                break;
            }
        }
    }

    responders
}

/// Parse the `{"AlpacaPort": n}` discovery reply
fn parse_discovery_response(payload: &[u8]) -> Option<u16> {
    let json: serde_json::Value = serde_json::from_slice(payload).ok()?;
    json.get("AlpacaPort")?
        .as_u64()
        .and_then(|port| u16::try_from(port).ok())
}

/// Query a server's management API and merge its devices into the registry
async fn enumerate_server(
    inner: &DiscoveryInner,
    address: &str,
    port: u16,
) -> Result<DiscoveredServer> {
    let network = &inner.config.get().network;
    let timeout = network.call_timeout();
    let management_base = url::Url::parse(&format!("http://{}:{}/management/v1", address, port))
        .map_err(|e| {
            DeviceError::discovery(format!("{}:{}", address, port), e.to_string())
        })?;

    let description = inner
        .transport
        .execute(TransportRequest::get(
            management_base.clone(),
            "description",
            timeout,
        ))
        .await
        .and_then(|response| response.into_value("description"))
        .map_err(|e| DeviceError::discovery(management_base.as_str(), e.to_string()))?;

    let (server_name, manufacturer) = match description.as_object() {
        Some(fields) => (
            field_string(fields, "ServerName"),
            field_string(fields, "Manufacturer"),
        ),
        None => (String::new(), String::new()),
    };

    let configured = inner
        .transport
        .execute(TransportRequest::get(
            management_base.clone(),
            "configureddevices",
            timeout,
        ))
        .await
        .and_then(|response| response.into_value("configureddevices"))
        .map_err(|e| DeviceError::discovery(management_base.as_str(), e.to_string()))?;

    let proxy_base = network.proxy_base.clone();
    let mut registered = 0usize;
    for entry in configured.as_array().unwrap_or(&[]) {
        let Some(fields) = entry.as_object() else {
            continue;
        };
        let type_name = field_string(fields, "DeviceType");
        let device_type = match type_name.parse::<DeviceType>() {
            Ok(device_type) => device_type,
            Err(_) => {
                warn!("Skipping device of unknown type {:?}", type_name);
                continue;
            }
        };
        let number = fields
            .get("DeviceNumber")
            .and_then(Value::as_integer)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        let name = field_string(fields, "DeviceName");

        let endpoint =
            device_endpoint(proxy_base.as_deref(), address, port, device_type, number)?;
        let device = Device::discovered(address, port, device_type, number, name, endpoint);

        // Rediscovery leaves live devices untouched: same id, no reset
        match inner.registry.add(device) {
            Ok(()) => registered += 1,
            Err(DeviceError::DuplicateDevice(id)) => {
                debug!("Device {} already registered, leaving untouched", id);
            }
            Err(error) => return Err(error),
        }
    }

    info!(
        "Enumerated {}:{} ({} new devices)",
        address, port, registered
    );

    Ok(DiscoveredServer {
        address: address.to_string(),
        port,
        server_name,
        manufacturer,
        discovered_at: Utc::now(),
        is_manual_entry: false,
    })
}

fn field_string(fields: &HashMap<String, Value>, key: &str) -> String {
    fields
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
