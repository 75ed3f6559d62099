/*!
 * Device registry for starsync.
 *
 * The registry is the single source of truth mapping device ids to
 * [`Device`] records. Lookups are synchronous so the presentation layer can
 * read on every render without awaiting I/O; all mutation happens under one
 * write lock that is never held across an await point or an event handler.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use starsync_core::event::SharedEventBus;
use starsync_core::types::{Id, Value};

use crate::device::{
    ConnectionState, Device, DeviceError, DeviceEvent, DeviceType, Result,
};

/// Outcome of attempting to start a connection lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionStart {
    /// The intermediate state was entered; the caller owns the transition
    Started,
    /// The device was not in an allowed source state; no change was made
    AlreadyInState(ConnectionState),
}

struct RegistryInner {
    devices: HashMap<Id, Device>,
    /// Insertion order, for deterministic iteration and resolution
    order: Vec<Id>,
}

/// Device registry
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
    bus: SharedEventBus<DeviceEvent>,
}

impl DeviceRegistry {
    /// Create a new device registry publishing on the given bus
    pub fn new(bus: SharedEventBus<DeviceEvent>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                devices: HashMap::new(),
                order: Vec::new(),
            }),
            bus,
        }
    }

    /// Register a device
    ///
    /// Fails with [`DeviceError::DuplicateDevice`] if the id is already
    /// present; on success emits `DeviceAdded`.
    pub fn add(&self, device: Device) -> Result<()> {
        let id = device.id.clone();
        {
            let mut inner = self.write();
            if inner.devices.contains_key(&id) {
                return Err(DeviceError::DuplicateDevice(id));
            }
            inner.order.push(id.clone());
            inner.devices.insert(id.clone(), device);
        }
        debug!("Registered device {}", id);
        self.bus.publish(&DeviceEvent::DeviceAdded { id });
        Ok(())
    }

    /// Remove a device
    ///
    /// An absent id is a no-op, not an error. Emits `DeviceRemoved` when a
    /// device was actually removed and returns the removed record.
    pub fn remove(&self, id: &Id) -> Option<Device> {
        let removed = {
            let mut inner = self.write();
            let removed = inner.devices.remove(id);
            if removed.is_some() {
                inner.order.retain(|existing| existing != id);
            }
            removed
        };
        if removed.is_some() {
            debug!("Removed device {}", id);
            self.bus.publish(&DeviceEvent::DeviceRemoved { id: id.clone() });
        }
        removed
    }

    /// Look up a device by id
    ///
    /// Synchronous and O(1); returns a clone of the record.
    pub fn get(&self, id: &Id) -> Option<Device> {
        self.read().devices.get(id).cloned()
    }

    /// Whether a device with the given id is registered
    pub fn contains(&self, id: &Id) -> bool {
        self.read().devices.contains_key(id)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.read().devices.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.read().devices.is_empty()
    }

    /// Snapshot of all devices in registration order
    ///
    /// Mutations after the call are not visible in the returned snapshot.
    pub fn list(&self) -> Vec<Device> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id).cloned())
            .collect()
    }

    /// First device matching the predicate, in registration order
    pub fn find_by<F>(&self, predicate: F) -> Option<Device>
    where
        F: Fn(&Device) -> bool,
    {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id))
            .find(|device| predicate(device))
            .cloned()
    }

    /// Resolve a selector to a registered device id
    ///
    /// Resolution precedence, in order:
    /// 1. the selector as an exact device id;
    /// 2. a `{type}:{number}` pair (legacy identifiers), matching the first
    ///    device of that type and number in registration order.
    ///
    /// Lookup failure is surfaced as [`DeviceError::UnknownDevice`]; there
    /// is deliberately no default-device fallback.
    pub fn resolve(&self, selector: &str) -> Result<Id> {
        let inner = self.read();

        let as_id = Id::from_string(selector);
        if inner.devices.contains_key(&as_id) {
            return Ok(as_id);
        }

        if let Some((type_part, number_part)) = selector.rsplit_once(':') {
            if let (Ok(device_type), Ok(number)) =
                (type_part.parse::<DeviceType>(), number_part.parse::<u32>())
            {
                if let Some(id) = inner
                    .order
                    .iter()
                    .filter_map(|id| inner.devices.get(id))
                    .find(|d| d.device_type == device_type && d.number == number)
                    .map(|d| d.id.clone())
                {
                    return Ok(id);
                }
            }
        }

        Err(DeviceError::UnknownDevice(as_id))
    }

    /// Merge a partial property map into a device, last-writer-wins per key
    ///
    /// Unknown ids are logged and ignored: callers update speculatively and
    /// must not fail on stale ids. Writes against a Disconnected device are
    /// rejected (logged, no mutation). One `PropertyChanged` is emitted per
    /// key whose value actually changed.
    pub fn update_properties(&self, id: &Id, partial: HashMap<String, Value>) {
        let mut changed = Vec::new();
        {
            let mut inner = self.write();
            let Some(device) = inner.devices.get_mut(id) else {
                debug!("Ignoring property update for unknown device {}", id);
                return;
            };
            if device.connection_state == ConnectionState::Disconnected {
                warn!(
                    "Rejecting property update for disconnected device {}",
                    id
                );
                return;
            }
            for (key, value) in partial {
                let is_change = device.property(&key) != Some(&value);
                if is_change {
                    device.properties.insert(key.clone(), value.clone());
                    changed.push((key, value));
                }
            }
        }
        for (property, value) in changed {
            self.bus.publish(&DeviceEvent::PropertyChanged {
                id: id.clone(),
                property,
                value,
            });
        }
    }

    /// Restore property values recorded before an optimistic update
    ///
    /// Keys that had a prior value are set back to it; keys the update
    /// introduced are removed. A correcting `PropertyChanged` is emitted
    /// for every key touched (removed keys correct to `Null`). Unlike
    /// [`update_properties`](Self::update_properties) this does not check
    /// the connection state: it only undoes writes this layer made itself.
    pub(crate) fn revert_properties(
        &self,
        id: &Id,
        prior: HashMap<String, Option<Value>>,
    ) {
        let mut corrections = Vec::new();
        {
            let mut inner = self.write();
            let Some(device) = inner.devices.get_mut(id) else {
                return;
            };
            for (key, previous) in prior {
                match previous {
                    Some(value) => {
                        if device.property(&key) != Some(&value) {
                            device.properties.insert(key.clone(), value.clone());
                            corrections.push((key, value));
                        }
                    }
                    None => {
                        if device.properties.remove(&key).is_some() {
                            corrections.push((key, Value::Null));
                        }
                    }
                }
            }
        }
        for (property, value) in corrections {
            self.bus.publish(&DeviceEvent::PropertyChanged {
                id: id.clone(),
                property,
                value,
            });
        }
    }

    /// Attempt to enter an intermediate lifecycle state
    ///
    /// The check-and-set runs under the write lock: if the device is in one
    /// of `allowed_from`, it moves to `to` and the caller owns the
    /// transition until [`complete_transition`](Self::complete_transition).
    /// Any other state returns [`TransitionStart::AlreadyInState`] without
    /// touching the device; this is the mutual exclusion that guarantees
    /// at most one in-flight connect or disconnect per device.
    pub(crate) fn begin_transition(
        &self,
        id: &Id,
        allowed_from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<TransitionStart> {
        let start = {
            let mut inner = self.write();
            let device = inner
                .devices
                .get_mut(id)
                .ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;
            if allowed_from.contains(&device.connection_state) {
                device.connection_state = to;
                TransitionStart::Started
            } else {
                TransitionStart::AlreadyInState(device.connection_state)
            }
        };
        if start == TransitionStart::Started {
            self.bus.publish(&DeviceEvent::ConnectionChanged {
                id: id.clone(),
                state: to,
                detail: None,
            });
        }
        Ok(start)
    }

    /// Finish a lifecycle transition started with `begin_transition`
    ///
    /// Records the failure detail in `last_error` when present; a clean
    /// arrival at `Connected` clears it. Emits `ConnectionChanged`.
    pub(crate) fn complete_transition(
        &self,
        id: &Id,
        to: ConnectionState,
        detail: Option<String>,
    ) {
        {
            let mut inner = self.write();
            let Some(device) = inner.devices.get_mut(id) else {
                // Removed mid-transition; nothing left to update.
                debug!("Device {} vanished during transition", id);
                return;
            };
            device.connection_state = to;
            match &detail {
                Some(message) => device.last_error = Some(message.clone()),
                None if to == ConnectionState::Connected => device.last_error = None,
                None => {}
            }
        }
        self.bus.publish(&DeviceEvent::ConnectionChanged {
            id: id.clone(),
            state: to,
            detail,
        });
    }

    /// Record a failure on a device
    pub(crate) fn set_last_error(&self, id: &Id, message: &str) {
        let mut inner = self.write();
        if let Some(device) = inner.devices.get_mut(id) {
            device.last_error = Some(message.to_string());
        }
    }

    /// Clear a device's failure record after a successful operation
    pub(crate) fn clear_last_error(&self, id: &Id) {
        let mut inner = self.write();
        if let Some(device) = inner.devices.get_mut(id) {
            device.last_error = None;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("registry lock poisoned")
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .finish()
    }
}

/// A shared device registry that can be cloned
#[derive(Debug, Clone)]
pub struct SharedDeviceRegistry(Arc<DeviceRegistry>);

impl SharedDeviceRegistry {
    /// Create a new shared device registry publishing on the given bus
    pub fn new(bus: SharedEventBus<DeviceEvent>) -> Self {
        Self(Arc::new(DeviceRegistry::new(bus)))
    }

    /// Get a reference to the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.0
    }
}

impl AsRef<DeviceRegistry> for SharedDeviceRegistry {
    fn as_ref(&self) -> &DeviceRegistry {
        self.registry()
    }
}

impl std::ops::Deref for SharedDeviceRegistry {
    type Target = DeviceRegistry;

    fn deref(&self) -> &DeviceRegistry {
        self.registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceEventKind;
    use starsync_core::event::Event as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    fn camera(address: &str, number: u32) -> Device {
        let endpoint = Url::parse(&format!(
            "http://{}:11111/api/v1/camera/{}",
            address, number
        ))
        .unwrap();
        Device::discovered(address, 11111, DeviceType::Camera, number, "Cam", endpoint)
    }

    fn registry() -> (DeviceRegistry, SharedEventBus<DeviceEvent>) {
        let bus = SharedEventBus::new();
        (DeviceRegistry::new(bus.clone()), bus)
    }

    #[test]
    fn test_add_and_get() {
        let (registry, _bus) = registry();
        let device = camera("10.0.0.2", 0);
        let id = device.id.clone();

        registry.add(device).unwrap();
        let fetched = registry.get(&id).unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_duplicate_add_fails() {
        let (registry, _bus) = registry();
        registry.add(camera("10.0.0.2", 0)).unwrap();
        let err = registry.add(camera("10.0.0.2", 0)).unwrap_err();
        assert!(matches!(err, DeviceError::DuplicateDevice(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let (registry, bus) = registry();
        let removals = Arc::new(AtomicUsize::new(0));
        let removals_clone = Arc::clone(&removals);
        bus.on(DeviceEventKind::DeviceRemoved, move |_| {
            removals_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.remove(&Id::from_string("nope")).is_none());
        assert_eq!(removals.load(Ordering::SeqCst), 0);

        registry.add(camera("10.0.0.2", 0)).unwrap();
        assert!(registry
            .remove(&Id::from_string("10.0.0.2:11111:camera:0"))
            .is_some());
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let (registry, _bus) = registry();
        registry.add(camera("10.0.0.3", 0)).unwrap();
        registry.add(camera("10.0.0.1", 0)).unwrap();
        registry.add(camera("10.0.0.2", 1)).unwrap();

        let listed: Vec<String> = registry
            .list()
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(
            listed,
            vec![
                "10.0.0.3:11111:camera:0",
                "10.0.0.1:11111:camera:0",
                "10.0.0.2:11111:camera:1"
            ]
        );
    }

    #[test]
    fn test_resolve_precedence() {
        let (registry, _bus) = registry();
        registry.add(camera("10.0.0.1", 0)).unwrap();
        registry.add(camera("10.0.0.2", 0)).unwrap();

        // Exact id wins
        let id = registry.resolve("10.0.0.2:11111:camera:0").unwrap();
        assert_eq!(id.as_str(), "10.0.0.2:11111:camera:0");

        // Legacy type:number resolves to the first match in order
        let id = registry.resolve("camera:0").unwrap();
        assert_eq!(id.as_str(), "10.0.0.1:11111:camera:0");

        // Lookup failure is surfaced, never defaulted
        let err = registry.resolve("focuser:3").unwrap_err();
        assert!(matches!(err, DeviceError::UnknownDevice(_)));
    }

    #[test]
    fn test_update_properties_unknown_id_is_silent() {
        let (registry, _bus) = registry();
        registry.add(camera("10.0.0.1", 0)).unwrap();
        let before = registry.list();

        let mut partial = HashMap::new();
        partial.insert("gain".to_string(), Value::Integer(120));
        registry.update_properties(&Id::from_string("stale-id"), partial);

        let after = registry.list();
        assert_eq!(before.len(), after.len());
        assert!(after[0].properties.is_empty());
    }

    #[test]
    fn test_update_properties_rejected_when_disconnected() {
        let (registry, _bus) = registry();
        let device = camera("10.0.0.1", 0);
        let id = device.id.clone();
        registry.add(device).unwrap();

        let mut partial = HashMap::new();
        partial.insert("gain".to_string(), Value::Integer(120));
        registry.update_properties(&id, partial);

        assert!(registry.get(&id).unwrap().properties.is_empty());
    }

    #[test]
    fn test_update_properties_emits_per_changed_key() {
        let (registry, bus) = registry();
        let device = camera("10.0.0.1", 0);
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

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.on(DeviceEventKind::PropertyChanged, move |event| {
            if let DeviceEvent::PropertyChanged { property, .. } = event {
                seen_clone.lock().unwrap().push(property.clone());
            }
        });

        let mut partial = HashMap::new();
        partial.insert("gain".to_string(), Value::Integer(120));
        partial.insert("cooleron".to_string(), Value::Bool(true));
        registry.update_properties(&id, partial.clone());

        {
            let mut events = seen.lock().unwrap();
            events.sort();
            assert_eq!(*events, vec!["cooleron", "gain"]);
            events.clear();
        }

        // Re-applying identical values is quiet
        registry.update_properties(&id, partial);
        assert!(seen.lock().unwrap().is_empty());

        let device = registry.get(&id).unwrap();
        assert_eq!(device.property("gain"), Some(&Value::Integer(120)));
    }

    #[test]
    fn test_transition_mutual_exclusion() {
        let (registry, _bus) = registry();
        let device = camera("10.0.0.1", 0);
        let id = device.id.clone();
        registry.add(device).unwrap();

        let first = registry
            .begin_transition(
                &id,
                &[ConnectionState::Disconnected],
                ConnectionState::Connecting,
            )
            .unwrap();
        assert_eq!(first, TransitionStart::Started);

        let second = registry
            .begin_transition(
                &id,
                &[ConnectionState::Disconnected],
                ConnectionState::Connecting,
            )
            .unwrap();
        assert_eq!(
            second,
            TransitionStart::AlreadyInState(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_complete_transition_clears_error_on_connect() {
        let (registry, _bus) = registry();
        let device = camera("10.0.0.1", 0);
        let id = device.id.clone();
        registry.add(device).unwrap();
        registry.set_last_error(&id, "previous failure");

        registry
            .begin_transition(
                &id,
                &[ConnectionState::Disconnected],
                ConnectionState::Connecting,
            )
            .unwrap();
        registry.complete_transition(&id, ConnectionState::Connected, None);

        let device = registry.get(&id).unwrap();
        assert_eq!(device.connection_state, ConnectionState::Connected);
        assert!(device.last_error.is_none());
    }

    #[test]
    fn test_events_observed_in_cause_order() {
        let (registry, bus) = registry();
        let states = Arc::new(Mutex::new(Vec::new()));
        let states_clone = Arc::clone(&states);
        bus.on(DeviceEventKind::ConnectionChanged, move |event| {
            if let DeviceEvent::ConnectionChanged { state, .. } = event {
                states_clone.lock().unwrap().push(*state);
            }
        });

        let device = camera("10.0.0.1", 0);
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

        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn test_event_kind_helper() {
        let event = DeviceEvent::DeviceAdded {
            id: Id::from_string("x"),
        };
        assert_eq!(event.kind(), DeviceEventKind::DeviceAdded);
    }
}
