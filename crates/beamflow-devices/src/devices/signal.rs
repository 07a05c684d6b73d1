/*!
 * Signal driver for beamflow.
 *
 * Signals are scalar values: analog inputs, encoder readbacks, ring
 * current and the like. Every signal is readable; writes are allowed
 * only when the descriptor is not read-only and are rejected locally
 * before any network round trip otherwise.
 */
use async_trait::async_trait;
use tracing::debug;

use beamflow_core::object;
use beamflow_core::types::Value;

use crate::device::{Descriptor, Readable, Reading, Writable};
use crate::devices::check_not_found;
use crate::error::{CallError, DeviceError};
use crate::registry::SharedRegistry;
use crate::transport::Transport;

/// Typed driver for a remote scalar signal
#[derive(Debug, Clone)]
pub struct Signal {
    descriptor: Descriptor,
    transport: Transport,
    registry: SharedRegistry,
}

impl Signal {
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

    /// The descriptor this signal is bound to
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

    /// Read the current value. A single call, cheap and side-effect free.
    pub async fn get(&self) -> Result<f64, DeviceError> {
        self.ensure_registered()?;

        let payload = self
            .transport
            .call(
                "get_freerun",
                object! {
                    "names" => Value::Array(vec![self.descriptor.original_name.as_str().into()]),
                },
            )
            .await?;
        check_not_found(&payload, &self.descriptor.original_name, &self.descriptor.name)?;

        payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.first())
            .and_then(Value::as_float)
            .ok_or_else(|| {
                CallError::Malformed("signal read returned no value".to_string()).into()
            })
    }

    /// Write a value to the signal
    ///
    /// Read-only signals fail immediately with
    /// [`DeviceError::Unsupported`] and never touch the wire.
    pub async fn set(&self, value: f64) -> Result<(), DeviceError> {
        self.ensure_registered()?;

        if self.descriptor.read_only {
            return Err(DeviceError::Unsupported(format!(
                "signal '{}' is read-only",
                self.descriptor.name
            )));
        }

        debug!(signal = %self.descriptor.name, value, "writing signal");
        self.transport
            .call(
                "set_signal",
                object! {
                    "name" => self.descriptor.original_name.as_str(),
                    "value" => value,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Readable for Signal {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    async fn read(&self) -> Result<Reading, DeviceError> {
        let value = self.get().await?;
        Ok(Reading::now(Value::Float(value)))
    }
}

#[async_trait]
impl Writable for Signal {
    async fn write(&self, value: Value) -> Result<(), DeviceError> {
        let value = value.as_float().ok_or_else(|| {
            DeviceError::Unsupported("signals accept numeric values only".to_string())
        })?;
        self.set(value).await
    }
}
