/*!
 * Application root for the device synchronization layer.
 *
 * An [`Observatory`] is explicitly constructed, with no ambient global
 * store, and owns the registry, event bus, transport, dispatcher,
 * connection manager, and discovery service. The presentation layer talks
 * to this facade: synchronous reads for rendering, async commands for
 * everything that touches the network, and `on`/`off` subscriptions for
 * change notification.
 */
use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use starsync_core::config::{Config, SharedConfig};
use starsync_core::event::{SharedEventBus, SubscriptionId};
use starsync_core::types::{Id, Value};
use starsync_core::utils::spawn_and_log;

use crate::connection::ConnectionManager;
use crate::device::{
    ConnectionState, Device, DeviceEvent, DeviceEventKind, Result,
};
use crate::discovery::{DiscoveredServer, DiscoveryService};
use crate::dispatcher::{CallOptions, CommandDispatcher};
use crate::image::ImageData;
use crate::protocols::HttpTransport;
use crate::registry::SharedDeviceRegistry;
use crate::transport::Transport;

/// The synchronization layer's application root
#[derive(Debug, Clone)]
pub struct Observatory {
    config: SharedConfig,
    bus: SharedEventBus<DeviceEvent>,
    registry: SharedDeviceRegistry,
    dispatcher: CommandDispatcher,
    connections: ConnectionManager,
    discovery: DiscoveryService,
}

impl Observatory {
    /// Create an observatory talking to real devices over HTTP
    pub fn new(config: Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.network)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create an observatory over an explicit transport backend
    ///
    /// This is how the simulator is selected: by construction, never as a
    /// silent fallback of the HTTP transport.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let config = SharedConfig::new(config);
        let bus: SharedEventBus<DeviceEvent> = SharedEventBus::new();
        let registry = SharedDeviceRegistry::new(bus.clone());
        let dispatcher =
            CommandDispatcher::new(registry.clone(), Arc::clone(&transport), bus.clone());
        let connections = ConnectionManager::new(
            registry.clone(),
            Arc::clone(&transport),
            bus.clone(),
            config.get().network.call_timeout(),
        );
        let discovery = DiscoveryService::new(
            config.clone(),
            transport,
            registry.clone(),
            bus.clone(),
        );

        info!("Observatory initialized");
        Self {
            config,
            bus,
            registry,
            dispatcher,
            connections,
            discovery,
        }
    }

    /// The configuration this observatory runs with
    pub fn config(&self) -> &Config {
        self.config.get()
    }

    // ── Registry reads (synchronous, render-safe) ──

    /// Look up a device by id
    pub fn device(&self, id: &Id) -> Option<Device> {
        self.registry.get(id)
    }

    /// Snapshot of all devices in registration order
    pub fn devices(&self) -> Vec<Device> {
        self.registry.list()
    }

    /// Resolve a selector (exact id, or legacy `type:number`) to an id
    pub fn resolve(&self, selector: &str) -> Result<Id> {
        self.registry.resolve(selector)
    }

    /// First device matching a predicate, in registration order
    pub fn find_device<F>(&self, predicate: F) -> Option<Device>
    where
        F: Fn(&Device) -> bool,
    {
        self.registry.find_by(predicate)
    }

    // ── Registry writes ──

    /// Register a device
    pub fn add_device(&self, device: Device) -> Result<()> {
        self.registry.add(device)
    }

    /// Remove a device
    ///
    /// A Connected device is first instructed to disconnect, best-effort
    /// and in the background: a stuck remote device never delays the
    /// removal itself. Absent ids are a no-op.
    pub fn remove_device(&self, id: &Id) -> Option<Device> {
        if let Some(device) = self.registry.get(id) {
            if device.connection_state != ConnectionState::Disconnected {
                let connections = self.connections.clone();
                let endpoint = device.endpoint.clone();
                spawn_and_log("remove-disconnect", async move {
                    connections.release_endpoint(endpoint).await
                });
            }
        }
        self.registry.remove(id)
    }

    /// Merge a partial property map into a device
    ///
    /// Safe to call speculatively: unknown ids are ignored.
    pub fn update_properties(&self, id: &Id, partial: HashMap<String, Value>) {
        self.registry.update_properties(id, partial);
    }

    // ── Connection lifecycle ──

    /// Connect a device; idempotent while connecting or connected
    pub async fn connect(&self, id: &Id) -> Result<ConnectionState> {
        self.connections.connect(id).await
    }

    /// Disconnect a device; always reaches `Disconnected` locally
    pub async fn disconnect(&self, id: &Id) -> Result<ConnectionState> {
        self.connections.disconnect(id).await
    }

    // ── Command dispatch ──

    /// Invoke a device method with named arguments
    pub async fn call_method(
        &self,
        id: &Id,
        action: &str,
        args: &[(String, Value)],
        opts: CallOptions,
    ) -> Result<Value> {
        self.dispatcher.call_method(id, action, args, opts).await
    }

    /// Write a scalar device property
    pub async fn set_property(
        &self,
        id: &Id,
        name: &str,
        value: Value,
        opts: CallOptions,
    ) -> Result<()> {
        self.dispatcher.set_property(id, name, value, opts).await
    }

    /// Read a device property and sync it into the registry
    pub async fn get_property(&self, id: &Id, name: &str, opts: CallOptions) -> Result<Value> {
        self.dispatcher.get_property(id, name, opts).await
    }

    /// Fetch and decode a captured image
    pub async fn fetch_image(
        &self,
        id: &Id,
        action: &str,
        opts: CallOptions,
    ) -> Result<ImageData> {
        self.dispatcher.fetch_image(id, action, opts).await
    }

    // ── Discovery ──

    /// Run (or join) a discovery pass
    pub async fn discover(&self) -> Vec<DiscoveredServer> {
        self.discovery.discover().await
    }

    /// Register an Alpaca server manually by address and port
    pub async fn add_manual(&self, address: &str, port: u16) -> Result<DiscoveredServer> {
        self.discovery.add_manual(address, port).await
    }

    /// Snapshot of the known server descriptors
    pub fn servers(&self) -> Vec<DiscoveredServer> {
        self.discovery.servers()
    }

    // ── Events ──

    /// Subscribe to an event kind
    pub fn on<F>(&self, kind: DeviceEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    /// Unsubscribe a handler; idempotent
    pub fn off(&self, kind: DeviceEventKind, id: SubscriptionId) {
        self.bus.off(kind, id);
    }

    /// The event bus, for collaborators that publish their own events
    pub fn bus(&self) -> &SharedEventBus<DeviceEvent> {
        &self.bus
    }
}
