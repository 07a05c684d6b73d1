use beamflow_core::config::Config;
use beamflow_devices::Session;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Default control server address - modify as needed
    let mut config = Config::default();
    config.endpoint.host = "192.168.195.129".to_string();
    config.endpoint.port = 5577;

    println!(
        "Testing connection to control server at {}...",
        config.endpoint.address()
    );

    // Connect performs the liveness handshake and an initial discovery cycle
    let session = Session::connect(config).await?;
    println!(
        "Successfully connected ({} devices discovered)",
        session.registry().len()
    );

    session.disconnect();
    Ok(())
}
