/*!
 * Connection lifecycle management.
 *
 * Drives each device through disconnected → connecting → connected →
 * disconnecting against the remote `connected` property. Only this module
 * mutates [`ConnectionState`]; the intermediate states act as the
 * transition lock, so racing calls collapse to a single remote attempt.
 */
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use starsync_core::event::SharedEventBus;
use starsync_core::types::Id;

use crate::device::{ConnectionState, DeviceError, DeviceEvent, Result};
use crate::registry::{SharedDeviceRegistry, TransitionStart};
use crate::transport::{Transport, TransportRequest};

/// Connection state machine for registered devices
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    registry: SharedDeviceRegistry,
    transport: Arc<dyn Transport>,
    bus: SharedEventBus<DeviceEvent>,
    timeout: Duration,
}

impl ConnectionManager {
    /// Create a connection manager
    pub fn new(
        registry: SharedDeviceRegistry,
        transport: Arc<dyn Transport>,
        bus: SharedEventBus<DeviceEvent>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            bus,
            timeout,
        }
    }

    /// Connect a device
    ///
    /// Allowed only from `Disconnected`; any other state returns the
    /// current state without a remote call, making concurrent connects
    /// idempotent. On remote failure the device reverts to `Disconnected`
    /// with `last_error` recorded, and the error is returned.
    pub async fn connect(&self, id: &Id) -> Result<ConnectionState> {
        let request = self.connected_request(id, true)?;
        match self.registry.begin_transition(
            id,
            &[ConnectionState::Disconnected],
            ConnectionState::Connecting,
        )? {
            TransitionStart::AlreadyInState(state) => {
                debug!("Connect on {} ignored, device is {}", id, state);
                return Ok(state);
            }
            TransitionStart::Started => {}
        }

        let outcome = self
            .transport
            .execute(request)
            .await
            .and_then(|response| response.into_value("connected"));
        match outcome {
            Ok(_) => {
                self.registry
                    .complete_transition(id, ConnectionState::Connected, None);
                info!("Device {} connected", id);
                Ok(ConnectionState::Connected)
            }
            Err(error) => {
                warn!("Connect failed for {}: {}", id, error);
                self.registry.complete_transition(
                    id,
                    ConnectionState::Disconnected,
                    Some(error.to_string()),
                );
                Err(error)
            }
        }
    }

    /// Disconnect a device
    ///
    /// Allowed from `Connected`, or from `Connecting` to cancel. The device
    /// always ends `Disconnected` locally: a failing remote call is logged,
    /// recorded in `last_error`, and emitted as an `Error` event, but never
    /// keeps the device stuck.
    pub async fn disconnect(&self, id: &Id) -> Result<ConnectionState> {
        let request = self.connected_request(id, false)?;
        match self.registry.begin_transition(
            id,
            &[ConnectionState::Connected, ConnectionState::Connecting],
            ConnectionState::Disconnecting,
        )? {
            TransitionStart::AlreadyInState(state) => {
                debug!("Disconnect on {} ignored, device is {}", id, state);
                return Ok(state);
            }
            TransitionStart::Started => {}
        }

        let outcome = self
            .transport
            .execute(request)
            .await
            .and_then(|response| response.into_value("connected"));
        let detail = match outcome {
            Ok(_) => None,
            Err(error) => {
                warn!("Remote disconnect failed for {}: {}", id, error);
                self.bus.publish(&DeviceEvent::Error {
                    id: Some(id.clone()),
                    message: error.to_string(),
                });
                Some(error.to_string())
            }
        };

        self.registry
            .complete_transition(id, ConnectionState::Disconnected, detail);
        info!("Device {} disconnected", id);
        Ok(ConnectionState::Disconnected)
    }

    /// Fire a remote disconnect for a device already removed from the
    /// registry; there is no local state left to transition
    pub(crate) async fn release_endpoint(&self, endpoint: url::Url) -> Result<()> {
        let request = TransportRequest::put(endpoint, "connected", self.timeout)
            .param("Connected", "False");
        self.transport.execute(request).await.map(|_| ())
    }

    fn connected_request(&self, id: &Id, target: bool) -> Result<TransportRequest> {
        let device = self
            .registry
            .get(id)
            .ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;
        Ok(
            TransportRequest::put(device.endpoint, "connected", self.timeout).param(
                "Connected",
                if target { "True" } else { "False" },
            ),
        )
    }
}
