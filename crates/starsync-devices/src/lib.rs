/*!
 * starsync devices
 *
 * The unified device synchronization layer: the authoritative device
 * registry, per-device connection lifecycle, remote command dispatch with
 * optimistic reconciliation, binary image decoding, and network discovery
 * for ASCOM Alpaca instruments.
 */

#![warn(missing_docs)]

// Re-export core prelude
pub use starsync_core::prelude;

pub mod connection;
pub mod device;
pub mod discovery;
pub mod dispatcher;
pub mod image;
pub mod observatory;
pub mod protocols;
pub mod registry;
pub mod transport;

// Re-export the types most consumers need
pub use connection::ConnectionManager;
pub use device::{
    ConnectionState, Device, DeviceError, DeviceEvent, DeviceEventKind, DeviceType,
    RemoteCallKind,
};
pub use discovery::{DiscoveredServer, DiscoveryService};
pub use dispatcher::{CallOptions, CommandDispatcher, OptimisticUpdate};
pub use image::{ImageData, PixelBuffer};
pub use observatory::Observatory;
pub use registry::{DeviceRegistry, SharedDeviceRegistry};
pub use transport::Transport;

/// starsync devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), starsync_core::error::Error> {
    tracing::info!("starsync devices {} initialized", VERSION);
    Ok(())
}
