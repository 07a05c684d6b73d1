use beamflow_core::config::Config;
use beamflow_devices::{DeviceKind, Session};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = Config::default();
    config.endpoint.host = "192.168.195.129".to_string();
    config.endpoint.port = 5577;

    println!("Connecting to control server at {}...", config.endpoint.address());
    let session = Session::connect(config).await?;
    println!("Successfully connected! Listing all devices:\n");

    // The registry keeps discovery order
    for descriptor in session.registry().descriptors() {
        let units = descriptor.units.as_deref().unwrap_or("-");
        println!(
            "  {:<30} kind={:<8} units={}",
            descriptor.name.as_str(),
            descriptor.kind.as_str(),
            units
        );
    }

    // Search for motors by pattern and read the first one back
    let motors = session.registry().find_by_pattern(".*[Mm]otor.*")?;
    println!("\n{} motor(s) matched the pattern", motors.len());

    if let Some(descriptor) = motors.first() {
        let motor = session.motor(descriptor.name.as_str())?;
        let position = motor.get().await?;
        println!("{} is at {}", descriptor.name, position);
    }

    // Signals are read the same way
    if let Some(descriptor) = session.registry().find_by_kind(DeviceKind::Signal).first() {
        let signal = session.signal(descriptor.name.as_str())?;
        let value = signal.get().await?;
        println!("{} reads {}", descriptor.name, value);
    }

    session.disconnect();
    Ok(())
}
