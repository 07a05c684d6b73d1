/*!
 * Device model for beamflow.
 *
 * This module defines the descriptor record produced by discovery, the
 * capability traits shared by the typed drivers, and the closed
 * [`DeviceHandle`] variant that callers receive from `resolve`.
 */
use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use beamflow_core::types::Value;

use crate::devices::detector::Detector;
use crate::devices::motor::{Motion, Motor};
use crate::devices::signal::Signal;
use crate::error::DeviceError;

/// Kinds of remote-controllable entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Positionable axis with motion completion
    Motor,
    /// Scalar value, readable and sometimes writable
    Signal,
    /// Acquisition device (contract stubbed upstream)
    Detector,
}

impl DeviceKind {
    /// Get the lowercase name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Motor => "motor",
            DeviceKind::Signal => "signal",
            DeviceKind::Detector => "detector",
        }
    }

    /// Parse a kind from its lowercase name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "motor" => Some(DeviceKind::Motor),
            "signal" => Some(DeviceKind::Signal),
            "detector" => Some(DeviceKind::Detector),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A sanitized device name: the unique registry key
///
/// Raw server-side names are free-form (`"Motor 2"`); the registry keys
/// them by a lowercase identifier form (`motor_2`). The raw name is kept
/// on the descriptor for wire calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(String);

impl DeviceName {
    /// Sanitize a raw server-side name into an identifier
    pub fn sanitize(raw: &str) -> Self {
        static NON_WORD: OnceLock<Regex> = OnceLock::new();
        let non_word = NON_WORD.get_or_init(|| Regex::new(r"\W").unwrap());

        let mut name = non_word.replace_all(raw, "_").to_lowercase();
        if name.chars().next().map_or(false, |c| c.is_ascii_digit()) {
            name.insert(0, '_');
        }
        Self(name)
    }

    /// Get the string form of the name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Soft travel limits reported for a motor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Lower bound in device units
    pub low: Option<f64>,
    /// Upper bound in device units
    pub high: Option<f64>,
}

impl Limits {
    /// Whether a position lies within the limits
    pub fn contains(&self, position: f64) -> bool {
        self.low.map_or(true, |low| position >= low)
            && self.high.map_or(true, |high| position <= high)
    }
}

/// Immutable metadata record for one remote entity
///
/// Descriptors are produced by a discovery cycle and never mutated;
/// re-running discovery replaces the whole set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Sanitized name, unique within a discovery cycle
    pub name: DeviceName,
    /// Verbatim server-side name used on the wire
    pub original_name: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Engineering units, when reported or enriched
    pub units: Option<String>,
    /// Whether writes are rejected locally
    pub read_only: bool,
    /// Soft travel limits (motors)
    pub limits: Limits,
    /// Human-readable label from enrichment
    pub label: Option<String>,
}

/// A timestamped reading from a readable device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// The value read
    pub value: Value,
    /// When the value was read
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Create a reading stamped with the current time
    pub fn now(value: Value) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }
}

/// A device whose current value can be read
#[async_trait]
pub trait Readable: Send + Sync {
    /// The descriptor this device is bound to
    fn descriptor(&self) -> &Descriptor;

    /// Read the current value with a timestamp
    async fn read(&self) -> Result<Reading, DeviceError>;
}

/// A readable device that also accepts writes
#[async_trait]
pub trait Writable: Readable {
    /// Write a value to the device
    async fn write(&self, value: Value) -> Result<(), DeviceError>;
}

/// A device that can be commanded to a position
#[async_trait]
pub trait Movable: Readable {
    /// Start a move and return its awaitable completion
    async fn move_to(&self, target: f64) -> Result<Motion, DeviceError>;

    /// Cancel any in-progress move; a no-op when idle
    async fn stop(&self) -> Result<(), DeviceError>;
}

/// A resolved, typed handle bound to one descriptor
///
/// This closed variant is the only place kind-based dispatch happens;
/// everything downstream works through the typed driver or one of the
/// capability traits.
#[derive(Debug, Clone)]
pub enum DeviceHandle {
    /// A motor driver
    Motor(Motor),
    /// A signal driver
    Signal(Signal),
    /// A detector driver
    Detector(Detector),
}

impl DeviceHandle {
    /// The descriptor this handle is bound to
    pub fn descriptor(&self) -> &Descriptor {
        match self {
            DeviceHandle::Motor(motor) => motor.descriptor(),
            DeviceHandle::Signal(signal) => signal.descriptor(),
            DeviceHandle::Detector(detector) => detector.descriptor(),
        }
    }

    /// The sanitized device name
    pub fn name(&self) -> &DeviceName {
        &self.descriptor().name
    }

    /// The device kind
    pub fn kind(&self) -> DeviceKind {
        self.descriptor().kind
    }

    /// View the handle through the read capability, when it has one
    pub fn as_readable(&self) -> Option<&dyn Readable> {
        match self {
            DeviceHandle::Motor(motor) => Some(motor),
            DeviceHandle::Signal(signal) => Some(signal),
            // Detector reads return opaque frames, not scalar readings
            DeviceHandle::Detector(_) => None,
        }
    }

    /// View the handle through the write capability, when it has one
    pub fn as_writable(&self) -> Option<&dyn Writable> {
        match self {
            DeviceHandle::Signal(signal) if !signal.descriptor().read_only => Some(signal),
            _ => None,
        }
    }

    /// View the handle through the motion capability, when it has one
    pub fn as_movable(&self) -> Option<&dyn Movable> {
        match self {
            DeviceHandle::Motor(motor) => Some(motor),
            _ => None,
        }
    }

    /// Unwrap into a motor driver
    pub fn into_motor(self) -> Option<Motor> {
        match self {
            DeviceHandle::Motor(motor) => Some(motor),
            _ => None,
        }
    }

    /// Unwrap into a signal driver
    pub fn into_signal(self) -> Option<Signal> {
        match self {
            DeviceHandle::Signal(signal) => Some(signal),
            _ => None,
        }
    }

    /// Unwrap into a detector driver
    pub fn into_detector(self) -> Option<Detector> {
        match self {
            DeviceHandle::Detector(detector) => Some(detector),
            _ => None,
        }
    }
}
