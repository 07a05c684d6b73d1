/*!
 * Motor driver for beamflow.
 *
 * A move is a fire-and-forget command on the wire; this driver turns it
 * into a single awaitable completion. The motion state machine is
 * `Idle -> Moving -> {Done, Error, Stopped}`: a terminal state resets to
 * `Idle` before the next `set`, and a completed move leaves the motor
 * idle immediately.
 *
 * Motion progress arrives either by polling `get_motor_status` on a
 * fixed interval or by subscribing to `motor_status` pushes; both
 * strategies sit behind the same `set`/`get`/`stop` contract.
 */
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use beamflow_core::config::MotionConfig;
use beamflow_core::object;
use beamflow_core::types::Value;

use crate::device::{Descriptor, Movable, Readable, Reading};
use crate::devices::check_not_found;
use crate::error::{CallError, DeviceError, MotionError};
use crate::registry::SharedRegistry;
use crate::transport::Transport;
use crate::wire::PushEvent;

/// How the driver learns about motion progress
#[derive(Debug, Clone)]
pub enum StatusSource {
    /// Poll `get_motor_status` on a fixed interval
    Poll(Duration),
    /// React to `motor_status` push events
    Push,
}

/// Options governing motion supervision
#[derive(Debug, Clone)]
pub struct MotorOptions {
    /// Status delivery strategy
    pub status_source: StatusSource,
    /// Overall deadline for one move
    pub move_timeout: Duration,
    /// Position tolerance for declaring a move complete
    pub tolerance: f64,
}

impl MotorOptions {
    /// Build options from the motion section of the client configuration
    pub fn from_config(motion: &MotionConfig) -> Self {
        let status_source = if motion.push_status {
            StatusSource::Push
        } else {
            StatusSource::Poll(motion.poll_interval())
        };
        Self {
            status_source,
            move_timeout: motion.move_timeout(),
            tolerance: motion.tolerance,
        }
    }
}

impl Default for MotorOptions {
    fn default() -> Self {
        Self::from_config(&MotionConfig::default())
    }
}

/// Snapshot of remote motion state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorStatus {
    /// Current position in device units
    pub position: f64,
    /// Whether the axis is still in motion
    pub moving: bool,
    /// Fault code, when the server reports one
    pub fault: Option<i64>,
}

impl MotorStatus {
    fn from_payload(payload: &Value) -> Result<Self, CallError> {
        let position = payload
            .get("position")
            .and_then(Value::as_float)
            .ok_or_else(|| CallError::Malformed("motor status has no position".to_string()))?;
        Ok(Self {
            position,
            moving: payload.get("moving").and_then(Value::as_bool).unwrap_or(false),
            fault: payload.get("fault").and_then(Value::as_integer),
        })
    }
}

/// Motion state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// No move in progress
    Idle,
    /// A move has been commanded and is being supervised
    Moving,
    /// The last move reached its goal
    Done,
    /// The last move faulted or lost its status feed
    Error,
    /// The last move was cancelled
    Stopped,
}

#[derive(Debug, Default)]
struct MoveCtl {
    cancelled: AtomicBool,
    notify: Notify,
}

#[derive(Debug)]
struct MotorInner {
    state: MotionState,
    active: Option<Arc<MoveCtl>>,
}

#[derive(Debug)]
struct MotorShared {
    inner: StdMutex<MotorInner>,
}

impl MotorShared {
    fn lock(&self) -> MutexGuard<'_, MotorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Typed driver for a remote motor
#[derive(Debug, Clone)]
pub struct Motor {
    descriptor: Descriptor,
    transport: Transport,
    registry: SharedRegistry,
    options: MotorOptions,
    shared: Arc<MotorShared>,
}

impl Motor {
    pub(crate) fn new(
        descriptor: Descriptor,
        transport: Transport,
        registry: SharedRegistry,
        options: MotorOptions,
    ) -> Self {
        Self {
            descriptor,
            transport,
            registry,
            options,
            shared: Arc::new(MotorShared {
                inner: StdMutex::new(MotorInner {
                    state: MotionState::Idle,
                    active: None,
                }),
            }),
        }
    }

    /// The descriptor this motor is bound to
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Current state of the motion state machine
    pub fn state(&self) -> MotionState {
        self.shared.lock().state
    }

    fn ensure_registered(&self) -> Result<(), DeviceError> {
        if self.registry.contains(self.descriptor.name.as_str()) {
            Ok(())
        } else {
            Err(DeviceError::NotFound(self.descriptor.name.to_string()))
        }
    }

    /// Read the current position. A single call, cheap and side-effect free.
    pub async fn get(&self) -> Result<f64, DeviceError> {
        self.ensure_registered()?;

        let payload = self
            .transport
            .call(
                "get_motor",
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
            .and_then(|entry| entry.get("position"))
            .and_then(Value::as_float)
            .ok_or_else(|| {
                CallError::Malformed("motor read returned no position".to_string()).into()
            })
    }

    /// Command a move and return its awaitable completion
    ///
    /// The returned [`Motion`] resolves with the final position when the
    /// axis settles within tolerance of the goal, or with a
    /// [`MotionError`] on fault, cancellation, or lost status feed.
    pub async fn set(&self, target: f64) -> Result<Motion, DeviceError> {
        self.ensure_registered()?;

        let ctl = Arc::new(MoveCtl::default());
        {
            let mut inner = self.shared.lock();
            if inner.state == MotionState::Moving {
                return Err(DeviceError::Busy(format!(
                    "motor '{}' is already moving",
                    self.descriptor.name
                )));
            }
            // Terminal states reset here. Moving is entered optimistically
            // and rolled back if the move command is not accepted.
            inner.state = MotionState::Moving;
            inner.active = Some(ctl.clone());
        }

        // Subscribe before commanding the move so no status push is missed
        let updates = match self.options.status_source {
            StatusSource::Push => Some(self.transport.subscribe()),
            StatusSource::Poll(_) => None,
        };

        debug!(motor = %self.descriptor.name, target, "commanding move");
        let accepted = self
            .transport
            .call(
                "move_motor",
                object! {
                    "names" => Value::Array(vec![self.descriptor.original_name.as_str().into()]),
                    "goals" => Value::Array(vec![Value::Float(target)]),
                },
            )
            .await;

        if let Err(e) = accepted {
            let mut inner = self.shared.lock();
            inner.state = MotionState::Idle;
            inner.active = None;
            return Err(e.into());
        }

        let (done_tx, done_rx) = oneshot::channel();
        let monitor = MoveMonitor {
            descriptor: self.descriptor.clone(),
            transport: self.transport.clone(),
            shared: self.shared.clone(),
            ctl,
            target,
            tolerance: self.options.tolerance,
            move_timeout: self.options.move_timeout,
            poll_interval: match self.options.status_source {
                StatusSource::Poll(interval) => interval,
                StatusSource::Push => Duration::ZERO,
            },
            updates,
            done_tx,
        };
        tokio::spawn(monitor.run());

        Ok(Motion { rx: done_rx })
    }

    /// Cancel any in-progress move
    ///
    /// Safe to call at any time: a no-op when nothing is moving. The
    /// remote stop is best-effort; the local state transitions to
    /// `Stopped` even when the stop command itself fails.
    pub async fn stop(&self) -> Result<(), DeviceError> {
        let ctl = self.shared.lock().active.clone();
        let Some(ctl) = ctl else {
            trace!(motor = %self.descriptor.name, "stop with no move in progress is a no-op");
            return Ok(());
        };

        ctl.cancelled.store(true, Ordering::SeqCst);
        ctl.notify.notify_waiters();

        if let Err(e) = self
            .transport
            .call(
                "stop_motor",
                object! {
                    "names" => Value::Array(vec![self.descriptor.original_name.as_str().into()]),
                },
            )
            .await
        {
            warn!(
                motor = %self.descriptor.name,
                "stop command failed: {} (local state is Stopped anyway)", e
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Readable for Motor {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    async fn read(&self) -> Result<Reading, DeviceError> {
        let position = self.get().await?;
        Ok(Reading::now(Value::Float(position)))
    }
}

#[async_trait]
impl Movable for Motor {
    async fn move_to(&self, target: f64) -> Result<Motion, DeviceError> {
        self.set(target).await
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        Motor::stop(self).await
    }
}

/// Awaitable completion of one commanded move
#[derive(Debug)]
pub struct Motion {
    rx: oneshot::Receiver<Result<f64, MotionError>>,
}

impl Future for Motion {
    type Output = Result<f64, MotionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            // The monitor went away without answering
            Err(_) => Err(MotionError::Call(CallError::Disconnected)),
        })
    }
}

enum Outcome {
    Done(f64),
    Fault(f64, Option<i64>),
    Cancelled(Option<f64>),
    DeadlineExceeded,
    CallFailed(CallError),
}

/// Supervises one move until a terminal state
struct MoveMonitor {
    descriptor: Descriptor,
    transport: Transport,
    shared: Arc<MotorShared>,
    ctl: Arc<MoveCtl>,
    target: f64,
    tolerance: f64,
    move_timeout: Duration,
    poll_interval: Duration,
    updates: Option<broadcast::Receiver<PushEvent>>,
    done_tx: oneshot::Sender<Result<f64, MotionError>>,
}

impl MoveMonitor {
    async fn run(mut self) {
        let deadline = Instant::now() + self.move_timeout;
        let ctl = self.ctl.clone();
        let mut last_position = None;

        let outcome = loop {
            if ctl.cancelled.load(Ordering::SeqCst) {
                break Outcome::Cancelled(last_position);
            }

            let status = tokio::select! {
                // Wakes on stop(); the flag check above decides
                _ = ctl.notify.notified() => continue,
                status = tokio::time::timeout_at(deadline, self.next_status()) => match status {
                    Err(_) => break Outcome::DeadlineExceeded,
                    Ok(Err(e)) => break Outcome::CallFailed(e),
                    Ok(Ok(status)) => status,
                },
            };

            last_position = Some(status.position);
            trace!(
                motor = %self.descriptor.name,
                position = status.position,
                moving = status.moving,
                "motion status"
            );

            if let Some(code) = status.fault {
                break Outcome::Fault(status.position, Some(code));
            }
            if !status.moving {
                if (status.position - self.target).abs() <= self.tolerance {
                    break Outcome::Done(status.position);
                }
                // Settled away from the goal
                break Outcome::Fault(status.position, None);
            }
        };

        self.finish(outcome);
    }

    async fn next_status(&mut self) -> Result<MotorStatus, CallError> {
        match self.updates.as_mut() {
            None => {
                tokio::time::sleep(self.poll_interval).await;
                let payload = self
                    .transport
                    .call(
                        "get_motor_status",
                        object! { "name" => self.descriptor.original_name.as_str() },
                    )
                    .await?;
                MotorStatus::from_payload(&payload)
            }
            Some(updates) => loop {
                match updates.recv().await {
                    Ok(event) => {
                        if event.event != "motor_status" {
                            continue;
                        }
                        if event.payload.get("name").and_then(Value::as_str)
                            != Some(self.descriptor.original_name.as_str())
                        {
                            continue;
                        }
                        return MotorStatus::from_payload(&event.payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            motor = %self.descriptor.name,
                            skipped, "status subscription lagged"
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CallError::Disconnected);
                    }
                }
            },
        }
    }

    fn finish(self, outcome: Outcome) {
        let (state, result) = match outcome {
            Outcome::Done(position) => {
                debug!(motor = %self.descriptor.name, position, "move complete");
                (MotionState::Done, Ok(position))
            }
            Outcome::Fault(position, code) => {
                warn!(motor = %self.descriptor.name, position, ?code, "move faulted");
                (
                    MotionState::Error,
                    Err(MotionError::Fault {
                        last_position: position,
                        fault_code: code,
                    }),
                )
            }
            Outcome::Cancelled(last_position) => {
                debug!(motor = %self.descriptor.name, "move cancelled");
                (
                    MotionState::Stopped,
                    Err(MotionError::Cancelled { last_position }),
                )
            }
            Outcome::DeadlineExceeded => {
                warn!(
                    motor = %self.descriptor.name,
                    "move did not finish within {:?}", self.move_timeout
                );
                (
                    MotionState::Error,
                    Err(MotionError::Call(CallError::Timeout(self.move_timeout))),
                )
            }
            Outcome::CallFailed(e) => {
                warn!(motor = %self.descriptor.name, "status feed failed: {}", e);
                (MotionState::Error, Err(MotionError::Call(e)))
            }
        };

        {
            let mut inner = self.shared.lock();
            inner.active = None;
            // A completed move leaves the motor idle; faults and stops stay
            // visible until the next set
            inner.state = if state == MotionState::Done {
                MotionState::Idle
            } else {
                state
            };
        }
        let _ = self.done_tx.send(result);
    }
}
