/*!
 * Typed device drivers for beamflow.
 *
 * Each driver wraps one descriptor and issues its operations through the
 * shared transport. Drivers re-check registry membership on every
 * operation, so handles to devices dropped by a later discovery cycle
 * fail with `DeviceError::NotFound`.
 */

pub mod detector;
pub mod motor;
pub mod signal;

pub use detector::{Detector, DetectorFrame};
pub use motor::{Motion, MotionState, Motor, MotorOptions, MotorStatus, StatusSource};
pub use signal::Signal;

use beamflow_core::types::Value;

use crate::device::DeviceName;
use crate::error::DeviceError;

/// Fail with `NotFound` when the server listed the device as missing
pub(crate) fn check_not_found(
    payload: &Value,
    original_name: &str,
    name: &DeviceName,
) -> Result<(), DeviceError> {
    let missing = payload
        .get("not_found")
        .and_then(Value::as_array)
        .map(|list| list.iter().any(|v| v.as_str() == Some(original_name)))
        .unwrap_or(false);
    if missing {
        Err(DeviceError::NotFound(name.to_string()))
    } else {
        Ok(())
    }
}
