/*!
 * Device discovery for beamflow.
 *
 * A discovery cycle issues one catalog request to the remote server,
 * validates the returned entity list into [`Descriptor`] records, and
 * applies optional local enrichment (labels, units). Catalog order is
 * preserved; an empty catalog is valid; a malformed entry fails the
 * whole cycle so the registry is never partially updated.
 */
use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use beamflow_core::config::EnrichmentConfig;
use beamflow_core::types::Value;

use crate::device::{Descriptor, DeviceKind, DeviceName, Limits};
use crate::error::DiscoveryError;
use crate::transport::Transport;

/// Options governing a discovery cycle
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Deadline for the catalog request
    pub timeout: Duration,
    /// Local descriptor enrichment keyed by sanitized device name
    pub enrichment: EnrichmentConfig,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

/// Run one discovery cycle against the remote server
pub async fn discover(
    transport: &Transport,
    options: &DiscoveryOptions,
) -> Result<Vec<Descriptor>, DiscoveryError> {
    debug!("requesting device catalog");
    let payload = transport
        .call_with_timeout("get_configuration", Value::Null, options.timeout)
        .await?;

    let descriptors = parse_catalog(&payload, &options.enrichment)?;
    info!(devices = descriptors.len(), "discovery cycle complete");
    Ok(descriptors)
}

/// Parse a catalog payload into descriptors, preserving catalog order
pub(crate) fn parse_catalog(
    payload: &Value,
    enrichment: &EnrichmentConfig,
) -> Result<Vec<Descriptor>, DiscoveryError> {
    let entries = payload
        .get("devices")
        .and_then(Value::as_array)
        .ok_or_else(|| DiscoveryError::Malformed("catalog has no 'devices' list".to_string()))?;

    if entries.is_empty() {
        warn!("catalog is empty");
    }

    let mut seen: HashMap<DeviceName, String> = HashMap::new();
    let mut descriptors = Vec::with_capacity(entries.len());

    for entry in entries {
        descriptors.push(parse_entry(entry, &mut seen, enrichment)?);
    }

    Ok(descriptors)
}

fn parse_entry(
    entry: &Value,
    seen: &mut HashMap<DeviceName, String>,
    enrichment: &EnrichmentConfig,
) -> Result<Descriptor, DiscoveryError> {
    let original_name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| DiscoveryError::Malformed("catalog entry has no name".to_string()))?
        .to_string();

    let kind_name = entry.get("kind").and_then(Value::as_str).ok_or_else(|| {
        DiscoveryError::Malformed(format!("device '{}' has no kind", original_name))
    })?;
    let kind = DeviceKind::parse(kind_name).ok_or_else(|| {
        DiscoveryError::Malformed(format!(
            "device '{}' has unknown kind '{}'",
            original_name, kind_name
        ))
    })?;

    let name = DeviceName::sanitize(&original_name);
    if let Some(first) = seen.insert(name.clone(), original_name.clone()) {
        return Err(DiscoveryError::NameCollision {
            first,
            second: original_name,
            sanitized: name.as_str().to_string(),
        });
    }

    let units = entry
        .get("units")
        .and_then(Value::as_str)
        .map(str::to_string);

    // Analog inputs are read-only unless the server says otherwise
    let read_only = entry
        .get("read_only")
        .and_then(Value::as_bool)
        .unwrap_or(kind == DeviceKind::Signal);

    let limits = entry
        .get("limits")
        .map(|limits| Limits {
            low: limits.get("low").and_then(Value::as_float),
            high: limits.get("high").and_then(Value::as_float),
        })
        .unwrap_or_default();

    let mut descriptor = Descriptor {
        name,
        original_name,
        kind,
        units,
        read_only,
        limits,
        label: None,
    };

    if let Some(extra) = enrichment.devices.get(descriptor.name.as_str()) {
        debug!(device = %descriptor.name, "applying descriptor enrichment");
        descriptor.label = extra.label.clone();
        if extra.units.is_some() {
            descriptor.units = extra.units.clone();
        }
    }

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamflow_core::config::DeviceEnrichment;
    use beamflow_core::object;

    fn catalog() -> Value {
        object! {
            "devices" => Value::Array(vec![
                object! { "name" => "Motor 2", "kind" => "motor", "units" => "mm",
                          "limits" => object! { "low" => -10.0, "high" => 10.0 } },
                object! { "name" => "New AI 2", "kind" => "signal", "units" => "V" },
                object! { "name" => "Pilatus", "kind" => "detector" },
            ]),
        }
    }

    #[test]
    fn test_parse_catalog_preserves_order() {
        let descriptors = parse_catalog(&catalog(), &EnrichmentConfig::default()).unwrap();

        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["motor_2", "new_ai_2", "pilatus"]);

        let motor = &descriptors[0];
        assert_eq!(motor.kind, DeviceKind::Motor);
        assert_eq!(motor.original_name, "Motor 2");
        assert_eq!(motor.units.as_deref(), Some("mm"));
        assert_eq!(motor.limits.low, Some(-10.0));
        assert!(!motor.read_only);

        // Signals default to read-only
        assert!(descriptors[1].read_only);
    }

    #[test]
    fn test_empty_catalog_is_valid() {
        let payload = object! { "devices" => Value::Array(vec![]) };
        let descriptors = parse_catalog(&payload, &EnrichmentConfig::default()).unwrap();
        assert!(descriptors.is_empty());
    }

    #[test]
    fn test_missing_devices_list_is_malformed() {
        let payload = object! { "configuration" => "{}" };
        let err = parse_catalog(&payload, &EnrichmentConfig::default()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Malformed(_)));
    }

    #[test]
    fn test_entry_without_name_is_malformed() {
        let payload = object! {
            "devices" => Value::Array(vec![object! { "kind" => "motor" }]),
        };
        let err = parse_catalog(&payload, &EnrichmentConfig::default()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Malformed(_)));
    }

    #[test]
    fn test_entry_without_kind_is_malformed() {
        let payload = object! {
            "devices" => Value::Array(vec![object! { "name" => "Motor 2" }]),
        };
        let err = parse_catalog(&payload, &EnrichmentConfig::default()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Malformed(_)));
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let payload = object! {
            "devices" => Value::Array(vec![object! { "name" => "X", "kind" => "camera" }]),
        };
        let err = parse_catalog(&payload, &EnrichmentConfig::default()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Malformed(_)));
    }

    #[test]
    fn test_name_collision_is_reported() {
        let payload = object! {
            "devices" => Value::Array(vec![
                object! { "name" => "Motor 2", "kind" => "motor" },
                object! { "name" => "Motor*2", "kind" => "motor" },
            ]),
        };
        let err = parse_catalog(&payload, &EnrichmentConfig::default()).unwrap_err();
        match err {
            DiscoveryError::NameCollision {
                first,
                second,
                sanitized,
            } => {
                assert_eq!(first, "Motor 2");
                assert_eq!(second, "Motor*2");
                assert_eq!(sanitized, "motor_2");
            }
            other => panic!("expected name collision, got {:?}", other),
        }
    }

    #[test]
    fn test_enrichment_is_applied() {
        let mut enrichment = EnrichmentConfig::default();
        enrichment.devices.insert(
            "motor_2".to_string(),
            DeviceEnrichment {
                label: Some("Sample stage X".to_string()),
                units: Some("um".to_string()),
            },
        );

        let descriptors = parse_catalog(&catalog(), &enrichment).unwrap();
        assert_eq!(descriptors[0].label.as_deref(), Some("Sample stage X"));
        assert_eq!(descriptors[0].units.as_deref(), Some("um"));
        // Other devices untouched
        assert_eq!(descriptors[1].label, None);
        assert_eq!(descriptors[1].units.as_deref(), Some("V"));
    }
}
