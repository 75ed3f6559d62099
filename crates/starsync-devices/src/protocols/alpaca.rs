/*!
 * Alpaca HTTP transport.
 *
 * Executes device calls against ASCOM Alpaca HTTP endpoints: GET renders
 * parameters as a query string, PUT as a form body, and every request
 * carries the `ClientID`/`ClientTransactionID` pair the protocol expects.
 */
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::{debug, trace};

use starsync_core::config::NetworkConfig;

use crate::device::{DeviceError, Result};
use crate::transport::{
    AlpacaEnvelope, Method, Transport, TransportRequest, TransportResponse,
};

/// MIME type of the Alpaca binary image representation
const IMAGE_BYTES_MIME: &str = "application/imagebytes";

/// Alpaca HTTP transport over a shared reqwest client
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    /// Random id identifying this client session to servers
    client_id: u32,
    /// Monotonic per-request transaction counter
    transaction_counter: AtomicU32,
}

impl HttpTransport {
    /// Build a transport from network configuration
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| {
                DeviceError::transport("client", format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            client_id: uuid::Uuid::new_v4().as_u128() as u32,
            transaction_counter: AtomicU32::new(1),
        })
    }

    fn next_transaction_id(&self) -> u32 {
        self.transaction_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn map_request_error(action: &str, error: reqwest::Error) -> DeviceError {
        if error.is_timeout() {
            DeviceError::timeout(action)
        } else {
            DeviceError::transport(action, error.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        let action = request.action.clone();
        let url = request.url()?;
        let transaction_id = self.next_transaction_id();

        let mut params = request.params.clone();
        params.push(("ClientID".to_string(), self.client_id.to_string()));
        params.push((
            "ClientTransactionID".to_string(),
            transaction_id.to_string(),
        ));

        trace!(%url, method = ?request.method, transaction_id, "device call");

        let builder = match request.method {
            Method::Get => self.client.get(url.clone()).query(&params),
            Method::Put => self.client.put(url.clone()).form(&params),
        };
        let builder = if request.expect_binary {
            builder.header(reqwest::header::ACCEPT, IMAGE_BYTES_MIME)
        } else {
            builder
        };

        let response = builder
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| Self::map_request_error(&action, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(%url, %status, "device call failed");
            return Err(DeviceError::transport(
                &action,
                format!("HTTP {} from {}", status, url),
            ));
        }

        let is_binary = request.expect_binary
            && response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.starts_with(IMAGE_BYTES_MIME))
                .unwrap_or(false);

        if is_binary {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| Self::map_request_error(&action, e))?;
            return Ok(TransportResponse::Binary(bytes));
        }

        let envelope: AlpacaEnvelope = response
            .json()
            .await
            .map_err(|e| DeviceError::protocol(&action, format!("undecodable envelope: {}", e)))?;
        Ok(TransportResponse::Envelope(envelope))
    }
}
