/*!
 * Beamflow Devices
 *
 * This crate is the protocol client and device lifecycle core of
 * beamflow: the wire codec, the dispatcher-based transport client, the
 * discovery/registry pair, the typed device drivers (motor, signal,
 * detector), and the session manager that ties them together.
 */

#![warn(missing_docs)]

pub mod device;
pub mod devices;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod session;
pub mod transport;
pub mod wire;

// Re-export the working surface for convenience
pub use device::{
    Descriptor, DeviceHandle, DeviceKind, DeviceName, Limits, Movable, Readable, Reading, Writable,
};
pub use devices::{
    Detector, DetectorFrame, Motion, MotionState, Motor, MotorOptions, MotorStatus, Signal,
    StatusSource,
};
pub use discovery::{discover, DiscoveryOptions};
pub use error::{
    CallError, ClientError, ConnectError, DeviceError, DiscoveryError, MotionError, Result,
};
pub use registry::{Registry, RegistryEvent, SharedRegistry};
pub use session::Session;
pub use transport::{MessageSocket, TcpMessageSocket, Transport, TransportOptions};

/// Beamflow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
