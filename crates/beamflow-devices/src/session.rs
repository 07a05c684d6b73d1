/*!
 * Session manager for beamflow.
 *
 * A [`Session`] owns the connect/disconnect lifecycle: it establishes
 * the transport, confirms liveness, runs the initial discovery cycle,
 * and hands out typed device handles that share the one connection.
 */
use tracing::info;

use beamflow_core::config::{Config, SharedConfig};

use crate::device::{Descriptor, DeviceHandle, DeviceKind};
use crate::devices::{Detector, Motor, MotorOptions, Signal};
use crate::discovery::{discover, DiscoveryOptions};
use crate::error::{DeviceError, Result};
use crate::registry::{Registry, SharedRegistry};
use crate::transport::{MessageSocket, Transport, TransportOptions};

/// A connected client session against one remote control server
#[derive(Debug, Clone)]
pub struct Session {
    transport: Transport,
    registry: SharedRegistry,
    config: SharedConfig,
}

impl Session {
    /// Connect to the configured endpoint, confirm liveness, and run the
    /// initial discovery cycle
    pub async fn connect(config: Config) -> Result<Self> {
        let options = TransportOptions::from(&config.transport);
        let transport = Transport::connect(&config.endpoint.address(), options).await?;
        Self::bootstrap(config, transport).await
    }

    /// Build a session over an already-established message socket
    ///
    /// Useful for simulators and tests; the handshake and discovery
    /// cycle run exactly as for [`Session::connect`].
    pub async fn with_socket(config: Config, socket: Box<dyn MessageSocket>) -> Result<Self> {
        let options = TransportOptions::from(&config.transport);
        let transport =
            Transport::with_socket(&config.endpoint.address(), options, socket).await?;
        Self::bootstrap(config, transport).await
    }

    async fn bootstrap(config: Config, transport: Transport) -> Result<Self> {
        let session = Self {
            transport,
            registry: SharedRegistry::default(),
            config: SharedConfig::new(config),
        };
        session.rediscover().await?;
        info!(
            endpoint = %session.transport.endpoint(),
            devices = session.registry.len(),
            "session established"
        );
        Ok(session)
    }

    /// The registry of the latest discovery cycle
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// The transport shared by every handle of this session
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The configuration this session was created with
    pub fn config(&self) -> &Config {
        self.config.get()
    }

    /// Re-run discovery and replace the registry wholesale
    ///
    /// Handles bound to devices that disappear fail their next operation
    /// with [`DeviceError::NotFound`].
    pub async fn rediscover(&self) -> Result<()> {
        let config = self.config.get();
        let options = DiscoveryOptions {
            timeout: config.transport.call_timeout(),
            enrichment: config.enrichment.clone(),
        };
        let descriptors = discover(&self.transport, &options).await?;
        self.registry.replace(Registry::from_descriptors(descriptors));
        Ok(())
    }

    /// Resolve a device name into a typed handle
    pub fn resolve(&self, name: &str) -> std::result::Result<DeviceHandle, DeviceError> {
        let descriptor = self
            .registry
            .find_by_name(name)
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
        Ok(self.resolve_descriptor(&descriptor))
    }

    /// Construct the typed handle for a descriptor
    ///
    /// This is the single point of kind-based dispatch in the client.
    pub fn resolve_descriptor(&self, descriptor: &Descriptor) -> DeviceHandle {
        let descriptor = descriptor.clone();
        match descriptor.kind {
            DeviceKind::Motor => DeviceHandle::Motor(Motor::new(
                descriptor,
                self.transport.clone(),
                self.registry.clone(),
                MotorOptions::from_config(&self.config.get().motion),
            )),
            DeviceKind::Signal => DeviceHandle::Signal(Signal::new(
                descriptor,
                self.transport.clone(),
                self.registry.clone(),
            )),
            DeviceKind::Detector => DeviceHandle::Detector(Detector::new(
                descriptor,
                self.transport.clone(),
                self.registry.clone(),
            )),
        }
    }

    /// Resolve a name into a motor driver
    pub fn motor(&self, name: &str) -> std::result::Result<Motor, DeviceError> {
        let handle = self.resolve(name)?;
        handle
            .into_motor()
            .ok_or_else(|| DeviceError::Unsupported(format!("'{}' is not a motor", name)))
    }

    /// Resolve a name into a signal driver
    pub fn signal(&self, name: &str) -> std::result::Result<Signal, DeviceError> {
        let handle = self.resolve(name)?;
        handle
            .into_signal()
            .ok_or_else(|| DeviceError::Unsupported(format!("'{}' is not a signal", name)))
    }

    /// Resolve a name into a detector driver
    pub fn detector(&self, name: &str) -> std::result::Result<Detector, DeviceError> {
        let handle = self.resolve(name)?;
        handle
            .into_detector()
            .ok_or_else(|| DeviceError::Unsupported(format!("'{}' is not a detector", name)))
    }

    /// Whether the underlying connection is still up
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Tear the connection down. Idempotent; handles from this session
    /// fail further calls with a disconnect error.
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamflow_core::object;
    use beamflow_core::types::Value;
    use std::time::Duration;

    use crate::devices::MotionState;
    use crate::transport::testkit::{mock_socket, with_handshake, MockBehavior, MockServer};
    use crate::wire::Request;

    fn catalog_reply() -> MockBehavior {
        MockBehavior::Ok(object! {
            "devices" => Value::Array(vec![
                object! { "name" => "Motor 2", "kind" => "motor", "units" => "mm" },
                object! { "name" => "Motor 3", "kind" => "motor", "units" => "deg" },
                object! { "name" => "New AI 2", "kind" => "signal", "units" => "V" },
                object! { "name" => "Pilatus", "kind" => "detector" },
            ]),
        })
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.transport.call_timeout_ms = 500;
        config.motion.poll_interval_ms = 10;
        config
    }

    async fn session_over_mock<F>(script: F) -> (Session, MockServer)
    where
        F: FnMut(&Request) -> MockBehavior + Send + 'static,
    {
        let (socket, server) = mock_socket(with_handshake(script));
        let session = Session::with_socket(test_config(), Box::new(socket))
            .await
            .expect("session bootstrap");
        (session, server)
    }

    #[tokio::test]
    async fn test_connect_discovers_devices() {
        let (session, server) = session_over_mock(|request| {
            assert_eq!(request.command, "get_configuration");
            catalog_reply()
        })
        .await;

        assert_eq!(session.registry().len(), 4);
        assert!(session.registry().contains("motor_2"));
        assert!(session.registry().contains("new_ai_2"));
        assert_eq!(
            server.sent_commands(),
            vec!["test_connection", "get_configuration"]
        );
    }

    #[tokio::test]
    async fn test_resolve_dispatches_by_kind() {
        let (session, _server) = session_over_mock(|_| catalog_reply()).await;

        assert!(matches!(
            session.resolve("motor_2").unwrap(),
            DeviceHandle::Motor(_)
        ));
        assert!(matches!(
            session.resolve("new_ai_2").unwrap(),
            DeviceHandle::Signal(_)
        ));
        assert!(matches!(
            session.resolve("pilatus").unwrap(),
            DeviceHandle::Detector(_)
        ));
        assert!(matches!(
            session.resolve("missing").unwrap_err(),
            DeviceError::NotFound(_)
        ));

        // Raw server-side spellings resolve too
        assert!(session.resolve("Motor 2").is_ok());
    }

    #[tokio::test]
    async fn test_typed_accessors_check_kind() {
        let (session, _server) = session_over_mock(|_| catalog_reply()).await;

        assert!(session.motor("motor_2").is_ok());
        assert!(matches!(
            session.motor("new_ai_2").unwrap_err(),
            DeviceError::Unsupported(_)
        ));
        assert!(session.signal("new_ai_2").is_ok());
        assert!(session.detector("pilatus").is_ok());
    }

    #[tokio::test]
    async fn test_end_to_end_motion_through_session() {
        let mut polls = 0;
        let (session, _server) = session_over_mock(move |request| {
            match request.command.as_str() {
                "get_configuration" => catalog_reply(),
                "move_motor" => MockBehavior::Ok(Value::Null),
                "get_motor_status" => {
                    polls += 1;
                    if polls < 3 {
                        MockBehavior::Ok(object! { "position" => 42.0, "moving" => true })
                    } else {
                        MockBehavior::Ok(object! { "position" => 45.0, "moving" => false })
                    }
                }
                other => panic!("unexpected command {}", other),
            }
        })
        .await;

        let motor = session.motor("motor_2").unwrap();
        let motion = motor.set(45.0).await.unwrap();
        assert_eq!(motion.await.unwrap(), 45.0);
        assert_eq!(motor.state(), MotionState::Idle);
    }

    #[tokio::test]
    async fn test_rediscovery_invalidates_vanished_handles() {
        let mut cycles = 0;
        let (session, _server) = session_over_mock(move |request| {
            match request.command.as_str() {
                "get_configuration" => {
                    cycles += 1;
                    if cycles == 1 {
                        catalog_reply()
                    } else {
                        // Motor 3 is gone in the second cycle
                        MockBehavior::Ok(object! {
                            "devices" => Value::Array(vec![
                                object! { "name" => "Motor 2", "kind" => "motor" },
                                object! { "name" => "New AI 2", "kind" => "signal" },
                            ]),
                        })
                    }
                }
                other => panic!("unexpected command {}", other),
            }
        })
        .await;

        let motor3 = session.motor("motor_3").unwrap();
        session.rediscover().await.unwrap();

        assert!(matches!(
            motor3.get().await.unwrap_err(),
            DeviceError::NotFound(_)
        ));
        // Surviving devices keep working
        assert!(session.registry().contains("motor_2"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_fails_calls() {
        let (session, _server) = session_over_mock(|request| {
            assert_eq!(request.command, "get_configuration");
            catalog_reply()
        })
        .await;

        let motor = session.motor("motor_2").unwrap();
        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());

        // Give the dispatcher a beat to wind down
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            motor.get().await.unwrap_err(),
            DeviceError::Call(crate::error::CallError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_find_by_pattern_through_session() {
        let (session, _server) = session_over_mock(|_| catalog_reply()).await;

        let motors: Vec<String> = session
            .registry()
            .find_by_pattern(".*[Mm]otor.*")
            .unwrap()
            .iter()
            .map(|d| d.name.to_string())
            .collect();
        assert_eq!(motors, vec!["motor_2", "motor_3"]);
    }
}
