/*!
 * Simulated transport backend.
 *
 * An in-memory stand-in for a fleet of Alpaca devices, used for offline
 * demonstration and tests. It is selected explicitly when constructing the
 * `Observatory`; the real transport never falls back to it.
 */
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tracing::debug;

use starsync_core::types::Value;

use crate::device::{DeviceError, RemoteCallKind, Result};
use crate::transport::{
    AlpacaEnvelope, Method, Transport, TransportRequest, TransportResponse,
};

#[derive(Debug, Default)]
struct SimDevice {
    connected: bool,
    properties: HashMap<String, Value>,
}

/// Simulated Alpaca transport
///
/// Devices are keyed by their endpoint path (`/api/v1/camera/0`). Property
/// reads answer from a per-device table, writes update it, and a small set
/// of camera actions apply their side effects. Failures can be scripted
/// per action for tests.
#[derive(Debug, Default)]
pub struct SimulatorTransport {
    devices: RwLock<HashMap<String, SimDevice>>,
    failures: RwLock<HashMap<String, (RemoteCallKind, String)>>,
    call_log: Mutex<Vec<String>>,
}

impl SimulatorTransport {
    /// Create an empty simulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a property value for a device endpoint path
    pub fn seed_property(&self, device_path: &str, name: &str, value: Value) {
        let mut devices = self.devices.write().unwrap();
        devices
            .entry(device_path.to_string())
            .or_default()
            .properties
            .insert(name.to_string(), value);
    }

    /// Script a failure for every subsequent call to an action
    pub fn fail_action(&self, action: &str, kind: RemoteCallKind, message: &str) {
        self.failures
            .write()
            .unwrap()
            .insert(action.to_string(), (kind, message.to_string()));
    }

    /// Stop failing an action
    pub fn clear_failure(&self, action: &str) {
        self.failures.write().unwrap().remove(action);
    }

    /// All calls seen so far, as `METHOD path/action` strings
    pub fn calls(&self) -> Vec<String> {
        self.call_log.lock().unwrap().clone()
    }

    /// Number of calls seen for a specific action
    pub fn calls_for(&self, action: &str) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.ends_with(&format!("/{}", action)))
            .count()
    }

    /// Whether the simulated device at a path is connected
    pub fn is_connected(&self, device_path: &str) -> bool {
        self.devices
            .read()
            .unwrap()
            .get(device_path)
            .map(|d| d.connected)
            .unwrap_or(false)
    }

    fn ok(value: serde_json::Value) -> TransportResponse {
        TransportResponse::Envelope(AlpacaEnvelope {
            value,
            ..AlpacaEnvelope::default()
        })
    }

    fn param<'a>(request: &'a TransportRequest, name: &str) -> Option<&'a str> {
        request
            .params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
impl Transport for SimulatorTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        let action = request.action.to_ascii_lowercase();
        let device_path = request.base.path().trim_end_matches('/').to_string();

        self.call_log
            .lock()
            .unwrap()
            .push(format!("{:?} {}/{}", request.method, device_path, action));

        if let Some((kind, message)) = self.failures.read().unwrap().get(&action) {
            return Err(DeviceError::RemoteCall {
                kind: *kind,
                action: action.clone(),
                message: message.clone(),
            });
        }

        let mut devices = self.devices.write().unwrap();
        let device = devices.entry(device_path).or_default();

        match (request.method, action.as_str()) {
            (Method::Put, "connected") => {
                let target = Self::param(&request, "Connected")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                device.connected = target;
                debug!(connected = target, "simulator connection write");
                Ok(Self::ok(serde_json::Value::Null))
            }
            (Method::Get, "connected") => {
                Ok(Self::ok(serde_json::Value::Bool(device.connected)))
            }
            (Method::Put, "startexposure") => {
                device
                    .properties
                    .insert("isexposing".to_string(), Value::Bool(true));
                device
                    .properties
                    .insert("imageready".to_string(), Value::Bool(false));
                Ok(Self::ok(serde_json::Value::Null))
            }
            (Method::Put, "stopexposure" | "abortexposure") => {
                device
                    .properties
                    .insert("isexposing".to_string(), Value::Bool(false));
                Ok(Self::ok(serde_json::Value::Null))
            }
            (Method::Put, name) => {
                // Plain property write: first parameter is the value
                if let Some((_, raw)) = request.params.first() {
                    let value = serde_json::from_str::<serde_json::Value>(raw)
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::String(raw.clone()));
                    device.properties.insert(name.to_string(), value);
                }
                Ok(Self::ok(serde_json::Value::Null))
            }
            (Method::Get, name) => match device.properties.get(name) {
                Some(value) => Ok(Self::ok(value.to_json())),
                None => Ok(TransportResponse::Envelope(AlpacaEnvelope {
                    error_number: 1024,
                    error_message: format!("Property {} is not implemented", name),
                    ..AlpacaEnvelope::default()
                })),
            },
        }
    }
}
