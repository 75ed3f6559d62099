/*!
 * Remote command dispatch.
 *
 * Translates local intent (invoke a device method, read or write a
 * property) into calls against the device endpoint and reconciles the
 * result with registry state. Latency-sensitive controls apply an
 * optimistic property patch before the call resolves and are corrected on
 * failure; the UI never waits on a round-trip to reflect intent, but
 * converges to ground truth.
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use starsync_core::event::SharedEventBus;
use starsync_core::types::{Id, Value};

use crate::device::{Device, DeviceError, DeviceEvent, Result};
use crate::image::{decode_image, ImageData};
use crate::registry::{DeviceRegistry, SharedDeviceRegistry};
use crate::transport::{Transport, TransportRequest};

/// Default bound on a remote call
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for a single dispatched call
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Bound on the whole call; on expiry the call fails with a
    /// `RemoteCall { kind: Timeout }` and is never retried here
    pub timeout: Duration,
    /// Property patch applied optimistically before the call resolves
    pub optimistic: Option<HashMap<String, Value>>,
}

impl CallOptions {
    /// Options with a specific timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            optimistic: None,
        }
    }

    /// Attach an optimistic property patch
    pub fn optimistic(mut self, patch: HashMap<String, Value>) -> Self {
        self.optimistic = Some(patch);
        self
    }

    /// Attach a single-property optimistic patch
    pub fn optimistic_property(self, name: impl Into<String>, value: Value) -> Self {
        let mut patch = HashMap::new();
        patch.insert(name.into(), value);
        self.optimistic(patch)
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            optimistic: None,
        }
    }
}

/// An applied optimistic property patch, holding what it overwrote
///
/// The two phases are explicit so they are testable without any transport:
/// [`apply`](Self::apply) merges the patch and records priors,
/// [`commit`](Self::commit) keeps the patch, [`revert`](Self::revert)
/// restores the priors and emits correcting `PropertyChanged` events.
#[derive(Debug)]
pub struct OptimisticUpdate {
    id: Id,
    prior: HashMap<String, Option<Value>>,
}

impl OptimisticUpdate {
    /// Apply a patch immediately, recording the prior value of each key
    pub fn apply(
        registry: &DeviceRegistry,
        id: &Id,
        patch: HashMap<String, Value>,
    ) -> Self {
        let prior = match registry.get(id) {
            Some(device) => patch
                .keys()
                .map(|key| (key.clone(), device.property(key).cloned()))
                .collect(),
            None => HashMap::new(),
        };
        registry.update_properties(id, patch);
        Self {
            id: id.clone(),
            prior,
        }
    }

    /// Keep the applied patch; the remote result is authoritative now
    pub fn commit(self) {}

    /// Restore every recorded prior value
    pub fn revert(self, registry: &DeviceRegistry) {
        debug!("Reverting optimistic update on {}", self.id);
        registry.revert_properties(&self.id, self.prior);
    }
}

/// Remote command dispatcher
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    registry: SharedDeviceRegistry,
    transport: Arc<dyn Transport>,
    bus: SharedEventBus<DeviceEvent>,
}

impl CommandDispatcher {
    /// Create a dispatcher
    pub fn new(
        registry: SharedDeviceRegistry,
        transport: Arc<dyn Transport>,
        bus: SharedEventBus<DeviceEvent>,
    ) -> Self {
        Self {
            registry,
            transport,
            bus,
        }
    }

    /// Invoke a device method
    ///
    /// Arguments are named protocol parameters, rendered with Alpaca form
    /// casing by [`Value::to_param`]. Fails with `UnknownDevice` /
    /// `NotConnected` before any transport contact.
    pub async fn call_method(
        &self,
        id: &Id,
        action: &str,
        args: &[(String, Value)],
        opts: CallOptions,
    ) -> Result<Value> {
        let device = self.connected_device(id)?;

        let mut request = TransportRequest::put(device.endpoint, action, opts.timeout);
        for (name, value) in args {
            request = request.param(name, value.to_param());
        }

        let update = opts
            .optimistic
            .map(|patch| OptimisticUpdate::apply(self.registry.registry(), id, patch));

        let outcome = self
            .transport
            .execute(request)
            .await
            .and_then(|response| response.into_value(action));
        self.reconcile(id, action, update, outcome)
    }

    /// Write a scalar property (gain, offset, cooler target, ...)
    ///
    /// The written value is applied optimistically unless the caller
    /// supplied an explicit patch. The property name is used verbatim as
    /// the action; its parameter key is the name with the first letter
    /// uppercased. Pass exact casing through [`call_method`] when a
    /// property deviates from that convention.
    pub async fn set_property(
        &self,
        id: &Id,
        name: &str,
        value: Value,
        opts: CallOptions,
    ) -> Result<()> {
        let device = self.connected_device(id)?;

        let request = TransportRequest::put(device.endpoint, name, opts.timeout)
            .param(param_key(name), value.to_param());

        let patch = opts.optimistic.unwrap_or_else(|| {
            let mut patch = HashMap::new();
            patch.insert(name.to_string(), value.clone());
            patch
        });
        let update = Some(OptimisticUpdate::apply(
            self.registry.registry(),
            id,
            patch,
        ));

        let outcome = self
            .transport
            .execute(request)
            .await
            .and_then(|response| response.into_value(name));
        self.reconcile(id, name, update, outcome).map(|_| ())
    }

    /// Read a property from the device and sync it into the registry
    ///
    /// On success the fresh value is merged into the device's properties
    /// (emitting `PropertyChanged` when it differs), so polling keeps the
    /// read model converged with ground truth.
    pub async fn get_property(&self, id: &Id, name: &str, opts: CallOptions) -> Result<Value> {
        let device = self.connected_device(id)?;

        let request = TransportRequest::get(device.endpoint, name, opts.timeout);
        let outcome = self
            .transport
            .execute(request)
            .await
            .and_then(|response| response.into_value(name));

        match outcome {
            Ok(value) => {
                let mut patch = HashMap::new();
                patch.insert(name.to_string(), value.clone());
                self.registry.update_properties(id, patch);
                self.registry.clear_last_error(id);
                Ok(value)
            }
            Err(error) => {
                self.fail(id, &error);
                Err(error)
            }
        }
    }

    /// Fetch and decode a binary image result
    ///
    /// The payload is validated completely before the image is returned;
    /// malformed payloads yield `Decode` and nothing reaches observers.
    pub async fn fetch_image(
        &self,
        id: &Id,
        action: &str,
        opts: CallOptions,
    ) -> Result<ImageData> {
        let device = self.connected_device(id)?;

        let request =
            TransportRequest::get(device.endpoint, action, opts.timeout).binary();
        let outcome = async {
            let bytes = self
                .transport
                .execute(request)
                .await?
                .into_binary(action)?;
            decode_image(action, &bytes)
        }
        .await;

        match outcome {
            Ok(image) => {
                self.registry.clear_last_error(id);
                Ok(image)
            }
            Err(error) => {
                self.fail(id, &error);
                Err(error)
            }
        }
    }

    fn connected_device(&self, id: &Id) -> Result<Device> {
        let device = self
            .registry
            .get(id)
            .ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;
        if !device.is_connected() {
            return Err(DeviceError::NotConnected(id.clone()));
        }
        Ok(device)
    }

    fn reconcile(
        &self,
        id: &Id,
        action: &str,
        update: Option<OptimisticUpdate>,
        outcome: Result<Value>,
    ) -> Result<Value> {
        match outcome {
            Ok(value) => {
                if let Some(update) = update {
                    update.commit();
                }
                self.registry.clear_last_error(id);
                Ok(value)
            }
            Err(error) => {
                warn!("Dispatch of {} on {} failed: {}", action, id, error);
                if let Some(update) = update {
                    update.revert(self.registry.registry());
                }
                self.fail(id, &error);
                Err(error)
            }
        }
    }

    fn fail(&self, id: &Id, error: &DeviceError) {
        self.registry.set_last_error(id, &error.to_string());
        self.bus.publish(&DeviceEvent::Error {
            id: Some(id.clone()),
            message: error.to_string(),
        });
    }
}

/// Parameter key convention: first letter uppercased
fn param_key(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectionState, DeviceEventKind, DeviceType, RemoteCallKind};
    use crate::protocols::SimulatorTransport;
    use std::sync::Mutex;
    use url::Url;

    struct Fixture {
        dispatcher: CommandDispatcher,
        registry: SharedDeviceRegistry,
        transport: Arc<SimulatorTransport>,
        bus: SharedEventBus<DeviceEvent>,
        id: Id,
    }

    fn fixture() -> Fixture {
        let bus = SharedEventBus::new();
        let registry = SharedDeviceRegistry::new(bus.clone());
        let transport = Arc::new(SimulatorTransport::new());
        let dispatcher =
            CommandDispatcher::new(registry.clone(), transport.clone(), bus.clone());

        let endpoint = Url::parse("http://sim.local:11111/api/v1/camera/0").unwrap();
        let device =
            Device::discovered("sim.local", 11111, DeviceType::Camera, 0, "Cam", endpoint);
        let id = device.id.clone();
        registry.add(device).unwrap();

        Fixture {
            dispatcher,
            registry,
            transport,
            bus,
            id,
        }
    }

    fn connect(fixture: &Fixture) {
        fixture
            .registry
            .begin_transition(
                &fixture.id,
                &[ConnectionState::Disconnected],
                ConnectionState::Connecting,
            )
            .unwrap();
        fixture
            .registry
            .complete_transition(&fixture.id, ConnectionState::Connected, None);
    }

    fn exposure_args() -> Vec<(String, Value)> {
        vec![
            ("Duration".to_string(), Value::Integer(5)),
            ("Light".to_string(), Value::Bool(true)),
        ]
    }

    #[tokio::test]
    async fn test_dispatch_refused_without_connection() {
        let fixture = fixture();

        let err = fixture
            .dispatcher
            .call_method(&fixture.id, "startexposure", &exposure_args(), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected(_)));
        // No network attempt was made
        assert!(fixture.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_device() {
        let fixture = fixture();
        let err = fixture
            .dispatcher
            .get_property(&Id::from_string("ghost"), "gain", CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownDevice(_)));
        assert!(fixture.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_optimistic_patch_visible_before_resolution_and_committed() {
        let fixture = fixture();
        connect(&fixture);

        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = Arc::clone(&observed);
        fixture.bus.on(DeviceEventKind::PropertyChanged, move |event| {
            if let DeviceEvent::PropertyChanged {
                property, value, ..
            } = event
            {
                observed_clone
                    .lock()
                    .unwrap()
                    .push((property.clone(), value.clone()));
            }
        });

        let opts =
            CallOptions::default().optimistic_property("isexposing", Value::Bool(true));
        fixture
            .dispatcher
            .call_method(&fixture.id, "startexposure", &exposure_args(), opts)
            .await
            .unwrap();

        // The optimistic event fired synchronously before the call resolved
        let events = observed.lock().unwrap();
        assert_eq!(
            events.first(),
            Some(&("isexposing".to_string(), Value::Bool(true)))
        );
        drop(events);

        // And the committed state is still in place
        let device = fixture.registry.get(&fixture.id).unwrap();
        assert_eq!(device.property("isexposing"), Some(&Value::Bool(true)));
        assert!(device.last_error.is_none());
    }

    #[tokio::test]
    async fn test_optimistic_patch_reverted_on_failure() {
        let fixture = fixture();
        connect(&fixture);
        fixture
            .transport
            .fail_action("startexposure", RemoteCallKind::Transport, "shutter jam");

        let opts =
            CallOptions::default().optimistic_property("isexposing", Value::Bool(true));
        let err = fixture
            .dispatcher
            .call_method(&fixture.id, "startexposure", &exposure_args(), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::RemoteCall { .. }));

        let device = fixture.registry.get(&fixture.id).unwrap();
        // The optimistic key was new, so revert removed it entirely
        assert_eq!(device.property("isexposing"), None);
        assert!(device.last_error.as_deref().unwrap().contains("shutter jam"));
    }

    #[tokio::test]
    async fn test_set_property_applies_and_converges() {
        let fixture = fixture();
        connect(&fixture);

        fixture
            .dispatcher
            .set_property(&fixture.id, "gain", Value::Integer(120), CallOptions::default())
            .await
            .unwrap();

        let device = fixture.registry.get(&fixture.id).unwrap();
        assert_eq!(device.property("gain"), Some(&Value::Integer(120)));

        // The simulator stored the write under the action name
        let read = fixture
            .dispatcher
            .get_property(&fixture.id, "gain", CallOptions::default())
            .await
            .unwrap();
        assert_eq!(read, Value::Integer(120));
    }

    #[tokio::test]
    async fn test_set_property_failure_restores_prior_value() {
        let fixture = fixture();
        connect(&fixture);

        fixture
            .dispatcher
            .set_property(&fixture.id, "gain", Value::Integer(100), CallOptions::default())
            .await
            .unwrap();

        fixture
            .transport
            .fail_action("gain", RemoteCallKind::Timeout, "no answer");
        let err = fixture
            .dispatcher
            .set_property(&fixture.id, "gain", Value::Integer(999), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::RemoteCall {
                kind: RemoteCallKind::Timeout,
                ..
            }
        ));

        let device = fixture.registry.get(&fixture.id).unwrap();
        assert_eq!(device.property("gain"), Some(&Value::Integer(100)));
    }

    #[tokio::test]
    async fn test_get_property_syncs_registry() {
        let fixture = fixture();
        connect(&fixture);
        fixture
            .transport
            .seed_property("/api/v1/camera/0", "ccdtemperature", Value::Float(-10.5));

        let value = fixture
            .dispatcher
            .get_property(&fixture.id, "ccdtemperature", CallOptions::default())
            .await
            .unwrap();
        assert_eq!(value, Value::Float(-10.5));

        let device = fixture.registry.get(&fixture.id).unwrap();
        assert_eq!(
            device.property("ccdtemperature"),
            Some(&Value::Float(-10.5))
        );
    }

    #[tokio::test]
    async fn test_failure_emits_error_event() {
        let fixture = fixture();
        connect(&fixture);
        fixture
            .transport
            .fail_action("gain", RemoteCallKind::Transport, "boom");

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = Arc::clone(&errors);
        fixture.bus.on(DeviceEventKind::Error, move |event| {
            if let DeviceEvent::Error { message, .. } = event {
                errors_clone.lock().unwrap().push(message.clone());
            }
        });

        fixture
            .dispatcher
            .get_property(&fixture.id, "gain", CallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].contains("boom"));
    }

    #[test]
    fn test_optimistic_update_without_transport() {
        let bus = SharedEventBus::new();
        let registry = SharedDeviceRegistry::new(bus.clone());
        let endpoint = Url::parse("http://sim.local:11111/api/v1/focuser/0").unwrap();
        let device =
            Device::discovered("sim.local", 11111, DeviceType::Focuser, 0, "Foc", endpoint);
        let id = device.id.clone();
        registry.add(device).unwrap();
        registry
            .begin_transition(
                &id,
                &[ConnectionState::Disconnected],
                ConnectionState::Connecting,
            )
            .unwrap();
        registry.complete_transition(&id, ConnectionState::Connected, None);

        let mut patch = HashMap::new();
        patch.insert("position".to_string(), Value::Integer(5200));
        let update = OptimisticUpdate::apply(registry.registry(), &id, patch);
        assert_eq!(
            registry.get(&id).unwrap().property("position"),
            Some(&Value::Integer(5200))
        );

        update.revert(registry.registry());
        assert_eq!(registry.get(&id).unwrap().property("position"), None);
    }

    #[test]
    fn test_param_key_convention() {
        assert_eq!(param_key("gain"), "Gain");
        assert_eq!(param_key("position"), "Position");
        assert_eq!(param_key(""), "");
    }
}
