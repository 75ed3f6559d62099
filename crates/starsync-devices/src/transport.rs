/*!
 * Transport seam for remote device calls.
 *
 * The dispatcher, connection manager, and discovery service talk to devices
 * through the [`Transport`] trait. The production backend is the Alpaca
 * HTTP client; the simulator is a separate backend selected explicitly.
 * Transports never retry and never fall back to another backend.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use url::Url;

use starsync_core::types::Value;

use crate::device::{DeviceError, Result};

/// HTTP method of a device call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Read a property or fetch a result
    Get,
    /// Write a property or invoke an action
    Put,
}

/// A single request against a device or management endpoint
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method
    pub method: Method,
    /// Base URL of the device (or management root)
    pub base: Url,
    /// Action segment appended to the base, e.g. `connected`
    pub action: String,
    /// Request parameters; query string for GET, form body for PUT
    pub params: Vec<(String, String)>,
    /// Caller-supplied bound on the whole call
    pub timeout: Duration,
    /// Request the binary image representation instead of JSON
    pub expect_binary: bool,
}

impl TransportRequest {
    /// Build a GET request
    pub fn get(base: Url, action: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            base,
            action: action.into(),
            params: Vec::new(),
            timeout,
            expect_binary: false,
        }
    }

    /// Build a PUT request
    pub fn put(base: Url, action: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Put,
            base,
            action: action.into(),
            params: Vec::new(),
            timeout,
            expect_binary: false,
        }
    }

    /// Add a request parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Mark the request as expecting a binary image payload
    pub fn binary(mut self) -> Self {
        self.expect_binary = true;
        self
    }

    /// The full URL of the targeted action
    pub fn url(&self) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                DeviceError::transport(&self.action, "endpoint cannot be a base URL")
            })?;
            segments.pop_if_empty().push(&self.action);
        }
        Ok(url)
    }
}

/// Response from a transport
#[derive(Debug, Clone)]
pub enum TransportResponse {
    /// A decoded Alpaca JSON envelope
    Envelope(AlpacaEnvelope),
    /// Raw bytes of a binary image payload
    Binary(Bytes),
}

impl TransportResponse {
    /// Unwrap the JSON envelope, extracting its value
    ///
    /// Fails with a protocol error when the response was binary or the
    /// envelope carries a device error.
    pub fn into_value(self, action: &str) -> Result<Value> {
        match self {
            TransportResponse::Envelope(envelope) => envelope.into_value(action),
            TransportResponse::Binary(_) => Err(DeviceError::protocol(
                action,
                "expected a JSON envelope, got a binary payload",
            )),
        }
    }

    /// Unwrap a binary payload
    pub fn into_binary(self, action: &str) -> Result<Bytes> {
        match self {
            TransportResponse::Binary(bytes) => Ok(bytes),
            TransportResponse::Envelope(_) => Err(DeviceError::protocol(
                action,
                "expected a binary payload, got a JSON envelope",
            )),
        }
    }
}

/// The JSON response envelope every Alpaca endpoint returns
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlpacaEnvelope {
    /// The returned value, absent for plain writes
    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
    /// Device error number; zero means success
    #[serde(rename = "ErrorNumber", default)]
    pub error_number: i32,
    /// Device error message accompanying a non-zero error number
    #[serde(rename = "ErrorMessage", default)]
    pub error_message: String,
    /// Echo of the client transaction id
    #[serde(rename = "ClientTransactionID", default)]
    pub client_transaction_id: u32,
    /// Server-assigned transaction id
    #[serde(rename = "ServerTransactionID", default)]
    pub server_transaction_id: u32,
}

impl AlpacaEnvelope {
    /// Extract the payload value, mapping device errors to
    /// [`DeviceError::RemoteCall`] with `Protocol` kind
    pub fn into_value(self, action: &str) -> Result<Value> {
        if self.error_number != 0 {
            return Err(DeviceError::protocol(
                action,
                format!("{} ({})", self.error_message, self.error_number),
            ));
        }
        Ok(Value::from(self.value))
    }
}

/// Backend executing device calls
///
/// Implementations must be honest about failure: no retry, no fallback to
/// another backend, no simulated responses on error paths.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Execute a single request within its timeout
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse>;
}
