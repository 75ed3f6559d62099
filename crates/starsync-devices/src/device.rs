/*!
 * Device record and core device types.
 *
 * A [`Device`] is a plain record of identity and live state, owned
 * exclusively by the registry. Behavior lives elsewhere: the connection
 * manager drives [`ConnectionState`], the dispatcher and optimistic-update
 * callers mutate properties.
 */
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use starsync_core::error::Error as CoreError;
use starsync_core::event::Event;
use starsync_core::types::{Id, Value};

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A device with the same id is already registered
    #[error("Device {0} already registered")]
    DuplicateDevice(Id),

    /// No device with the given id (or selector) is registered
    #[error("Unknown device: {0}")]
    UnknownDevice(Id),

    /// The device is not connected
    #[error("Device {0} is not connected")]
    NotConnected(Id),

    /// A remote call against the device endpoint failed
    #[error("Remote call {action} failed ({kind:?}): {message}")]
    RemoteCall {
        /// How the call failed
        kind: RemoteCallKind,
        /// The device action that was being invoked
        action: String,
        /// Transport status or protocol error message
        message: String,
    },

    /// A discovery scan or manual server registration failed
    #[error("Discovery failed for {endpoint}: {message}")]
    Discovery {
        /// The endpoint that was being queried
        endpoint: String,
        /// What went wrong
        message: String,
    },

    /// A binary image payload could not be decoded
    #[error("Image decode error: {0}")]
    Decode(String),

    /// A device selector could not be parsed
    #[error("Invalid device selector: {0}")]
    InvalidSelector(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// How a remote call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCallKind {
    /// The caller-supplied timeout elapsed
    Timeout,
    /// The transport failed (connect error, non-success HTTP status)
    Transport,
    /// The device answered with a protocol-level error
    Protocol,
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a remote-call timeout error
    pub fn timeout<S: Into<String>>(action: S) -> Self {
        DeviceError::RemoteCall {
            kind: RemoteCallKind::Timeout,
            action: action.into(),
            message: "timed out".to_string(),
        }
    }

    /// Create a remote-call transport error
    pub fn transport<A: Into<String>, M: Into<String>>(action: A, message: M) -> Self {
        DeviceError::RemoteCall {
            kind: RemoteCallKind::Transport,
            action: action.into(),
            message: message.into(),
        }
    }

    /// Create a remote-call protocol error
    pub fn protocol<A: Into<String>, M: Into<String>>(action: A, message: M) -> Self {
        DeviceError::RemoteCall {
            kind: RemoteCallKind::Protocol,
            action: action.into(),
            message: message.into(),
        }
    }

    /// Create a discovery error
    pub fn discovery<E: Into<String>, M: Into<String>>(endpoint: E, message: M) -> Self {
        DeviceError::Discovery {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create an image decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        DeviceError::Decode(msg.into())
    }
}

/// Category of an instrument, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Telescope mount
    Telescope,
    /// Imaging camera
    Camera,
    /// Focuser
    Focuser,
    /// Filter wheel
    FilterWheel,
    /// Dome controller
    Dome,
    /// Field rotator
    Rotator,
    /// Switch bank (power, dew heaters)
    Switch,
    /// Safety monitor
    SafetyMonitor,
    /// Weather / observing conditions sensor
    ObservingConditions,
    /// Dust cover and flat calibrator
    CoverCalibrator,
}

impl DeviceType {
    /// The lowercase URL path segment used by the Alpaca protocol
    pub fn as_path(&self) -> &'static str {
        match self {
            DeviceType::Telescope => "telescope",
            DeviceType::Camera => "camera",
            DeviceType::Focuser => "focuser",
            DeviceType::FilterWheel => "filterwheel",
            DeviceType::Dome => "dome",
            DeviceType::Rotator => "rotator",
            DeviceType::Switch => "switch",
            DeviceType::SafetyMonitor => "safetymonitor",
            DeviceType::ObservingConditions => "observingconditions",
            DeviceType::CoverCalibrator => "covercalibrator",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_path())
    }
}

impl FromStr for DeviceType {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "telescope" => Ok(DeviceType::Telescope),
            "camera" => Ok(DeviceType::Camera),
            "focuser" => Ok(DeviceType::Focuser),
            "filterwheel" => Ok(DeviceType::FilterWheel),
            "dome" => Ok(DeviceType::Dome),
            "rotator" => Ok(DeviceType::Rotator),
            "switch" => Ok(DeviceType::Switch),
            "safetymonitor" => Ok(DeviceType::SafetyMonitor),
            "observingconditions" => Ok(DeviceType::ObservingConditions),
            "covercalibrator" => Ok(DeviceType::CoverCalibrator),
            other => Err(DeviceError::InvalidSelector(format!(
                "unknown device type: {}",
                other
            ))),
        }
    }
}

/// Connection lifecycle state
///
/// Exactly one state holds at any time. Transitions run only through the
/// connection manager; the intermediate states double as the transition
/// lock, so at most one connect or disconnect is in flight per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected (initial; re-enterable)
    Disconnected,
    /// A connect call is in flight
    Connecting,
    /// Connected and accepting commands
    Connected,
    /// A disconnect call is in flight
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{}", s)
    }
}

/// A single controllable instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Globally unique, process-stable identifier
    pub id: Id,
    /// Instrument category; immutable after creation
    pub device_type: DeviceType,
    /// Device number scoping the device within its server
    pub number: u32,
    /// Human-readable device name as reported by the server
    pub name: String,
    /// Base URL for all remote calls (possibly proxied)
    pub endpoint: Url,
    /// Current connection lifecycle state
    pub connection_state: ConnectionState,
    /// Live property state, last-writer-wins per key
    pub properties: HashMap<String, Value>,
    /// Last failure message; cleared on the next successful operation
    pub last_error: Option<String>,
}

impl Device {
    /// Create a device record for an enumerated server device
    ///
    /// The id follows the `{address}:{port}:{type}:{number}` scheme, stable
    /// across rediscovery of the same server.
    pub fn discovered(
        address: &str,
        port: u16,
        device_type: DeviceType,
        number: u32,
        name: impl Into<String>,
        endpoint: Url,
    ) -> Self {
        let id = Id::from_string(format!(
            "{}:{}:{}:{}",
            address,
            port,
            device_type.as_path(),
            number
        ));
        Self::with_id(id, device_type, number, name, endpoint)
    }

    /// Create a device record with an explicit id (manual registration)
    pub fn with_id(
        id: Id,
        device_type: DeviceType,
        number: u32,
        name: impl Into<String>,
        endpoint: Url,
    ) -> Self {
        Self {
            id,
            device_type,
            number,
            name: name.into(),
            endpoint,
            connection_state: ConnectionState::Disconnected,
            properties: HashMap::new(),
            last_error: None,
        }
    }

    /// Whether the device currently accepts property and method traffic
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Get a property value
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// Device event published on the bus
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A device was added to the registry
    DeviceAdded {
        /// The device id
        id: Id,
    },
    /// A device was removed from the registry
    DeviceRemoved {
        /// The device id
        id: Id,
    },
    /// A device's connection state changed
    ConnectionChanged {
        /// The device id
        id: Id,
        /// The state after the change
        state: ConnectionState,
        /// Failure detail when the change resulted from an error
        detail: Option<String>,
    },
    /// A property value changed
    PropertyChanged {
        /// The device id
        id: Id,
        /// The property name
        property: String,
        /// The new value
        value: Value,
    },
    /// An error occurred
    Error {
        /// The device id, when the error is device-scoped
        id: Option<Id>,
        /// The error message
        message: String,
    },
}

/// Discriminant for [`DeviceEvent`], used for subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    /// Device added to the registry
    DeviceAdded,
    /// Device removed from the registry
    DeviceRemoved,
    /// Connection state changed
    ConnectionChanged,
    /// Property value changed
    PropertyChanged,
    /// An error occurred
    Error,
}

impl Event for DeviceEvent {
    type Kind = DeviceEventKind;

    fn kind(&self) -> DeviceEventKind {
        match self {
            DeviceEvent::DeviceAdded { .. } => DeviceEventKind::DeviceAdded,
            DeviceEvent::DeviceRemoved { .. } => DeviceEventKind::DeviceRemoved,
            DeviceEvent::ConnectionChanged { .. } => DeviceEventKind::ConnectionChanged,
            DeviceEvent::PropertyChanged { .. } => DeviceEventKind::PropertyChanged,
            DeviceEvent::Error { .. } => DeviceEventKind::Error,
        }
    }
}
