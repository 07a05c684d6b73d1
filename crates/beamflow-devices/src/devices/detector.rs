/*!
 * Detector driver for beamflow.
 *
 * 2-D detector support is still under development on the server side, so
 * this driver pins down the acquisition contract only: arm, trigger,
 * read. Frame encoding is intentionally left opaque.
 */
use tracing::debug;

use beamflow_core::object;
use beamflow_core::types::Value;

use crate::device::Descriptor;
use crate::error::DeviceError;
use crate::registry::SharedRegistry;
use crate::transport::Transport;

/// Opaque acquisition frame returned by a detector read
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorFrame {
    /// Frame payload as delivered by the server
    pub payload: Value,
}

/// Typed driver for a remote detector
#[derive(Debug, Clone)]
pub struct Detector {
    descriptor: Descriptor,
    transport: Transport,
    registry: SharedRegistry,
}

impl Detector {
    pub(crate) fn new(
        descriptor: Descriptor,
        transport: Transport,
        registry: SharedRegistry,
    ) -> Self {
        Self {
            descriptor,
            transport,
            registry,
        }
    }

    /// The descriptor this detector is bound to
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn ensure_registered(&self) -> Result<(), DeviceError> {
        if self.registry.contains(self.descriptor.name.as_str()) {
            Ok(())
        } else {
            Err(DeviceError::NotFound(self.descriptor.name.to_string()))
        }
    }

    /// Prepare the detector for acquisition
    pub async fn arm(&self) -> Result<(), DeviceError> {
        self.ensure_registered()?;
        debug!(detector = %self.descriptor.name, "arming");
        self.transport
            .call(
                "arm_detector",
                object! { "name" => self.descriptor.original_name.as_str() },
            )
            .await?;
        Ok(())
    }

    /// Trigger one acquisition
    pub async fn trigger(&self) -> Result<(), DeviceError> {
        self.ensure_registered()?;
        debug!(detector = %self.descriptor.name, "triggering");
        self.transport
            .call(
                "trigger_detector",
                object! { "name" => self.descriptor.original_name.as_str() },
            )
            .await?;
        Ok(())
    }

    /// Read the latest acquisition frame
    pub async fn read(&self) -> Result<DetectorFrame, DeviceError> {
        self.ensure_registered()?;
        let payload = self
            .transport
            .call(
                "read_detector",
                object! { "name" => self.descriptor.original_name.as_str() },
            )
            .await?;
        Ok(DetectorFrame { payload })
    }
}
