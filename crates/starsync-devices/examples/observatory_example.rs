use std::sync::Arc;

use starsync_core::config::Config;
use starsync_core::types::Value;
use starsync_devices::protocols::SimulatorTransport;
use starsync_devices::{
    CallOptions, Device, DeviceEvent, DeviceEventKind, DeviceType, Observatory,
};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Run against the simulator backend; swap for Observatory::new(config)
    // to talk to real Alpaca devices
    let transport = Arc::new(SimulatorTransport::new());
    let observatory = Observatory::with_transport(Config::default(), transport);

    // Subscribe to property and connection changes
    observatory.on(DeviceEventKind::ConnectionChanged, |event| {
        if let DeviceEvent::ConnectionChanged { id, state, .. } = event {
            info!("{} is now {}", id, state);
        }
    });
    observatory.on(DeviceEventKind::PropertyChanged, |event| {
        if let DeviceEvent::PropertyChanged {
            id,
            property,
            value,
        } = event
        {
            info!("{}: {} = {:?}", id, property, value);
        }
    });

    // Register a camera manually
    let endpoint = Url::parse("http://sim.local:11111/api/v1/camera/0")?;
    let camera = Device::discovered(
        "sim.local",
        11111,
        DeviceType::Camera,
        0,
        "Main Imager",
        endpoint,
    );
    let camera_id = camera.id.clone();
    observatory.add_device(camera)?;

    // Connect and start an exposure with an optimistic state update
    observatory.connect(&camera_id).await?;

    let args = vec![
        ("Duration".to_string(), Value::Integer(5)),
        ("Light".to_string(), Value::Bool(true)),
    ];
    let opts = CallOptions::default().optimistic_property("isexposing", Value::Bool(true));
    observatory
        .call_method(&camera_id, "startexposure", &args, opts)
        .await?;

    // The registry reflects the exposure immediately
    let device = observatory.device(&camera_id).expect("camera registered");
    info!(
        "isexposing = {:?}",
        device.property("isexposing").and_then(|v| v.as_bool())
    );

    // Set the gain and read it back through the device
    observatory
        .set_property(&camera_id, "gain", Value::Integer(120), CallOptions::default())
        .await?;
    let gain = observatory
        .get_property(&camera_id, "gain", CallOptions::default())
        .await?;
    info!("gain read back as {:?}", gain);

    observatory.disconnect(&camera_id).await?;
    Ok(())
}
