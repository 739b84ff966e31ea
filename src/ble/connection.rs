//! BLE connection state and connect timeouts.
//!
//! A connect attempt is guarded by a timer. The timer does not act on the
//! peripheral itself; when it fires it posts a
//! [`PlatformEvent::ConnectTimeout`] tagged with the attempt number, so the
//! timeout is handled on the same event path as every other completion.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

use crate::ble::platform::{DeviceId, PlatformEvent};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connect requested, waiting for the platform.
    Connecting,
    /// Link established; service discovery about to start.
    Connected,
    /// Waiting for service discovery.
    DiscoveringServices,
    /// Services known; matched services are being driven.
    Ready,
}

impl ConnectionState {
    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::DiscoveringServices | Self::Ready
        )
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::DiscoveringServices)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Handle to a scheduled connect timeout.
///
/// Cancelling is idempotent; dropping the handle cancels it too.
pub struct TimeoutHandle {
    cancel_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TimeoutHandle {
    /// Create a handle that runs `cancel_fn` when cancelled.
    pub fn new(cancel_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel_fn: Some(Box::new(cancel_fn)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel_fn: None }
    }

    /// Cancel the timeout. Safe to call when already cancelled.
    pub fn cancel(&mut self) {
        if let Some(f) = self.cancel_fn.take() {
            f();
        }
    }

    /// Whether `cancel` still has work to do.
    pub fn is_armed(&self) -> bool {
        self.cancel_fn.is_some()
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Schedules connect timeouts.
pub trait ConnectTimer: Send + Sync {
    /// Arrange for `ConnectTimeout { id, attempt }` to be delivered after `after`.
    fn schedule(&self, id: &DeviceId, attempt: u64, after: Duration) -> TimeoutHandle;
}

/// Connect timer backed by tokio tasks.
///
/// Timers run on the runtime captured at construction, so `schedule` may be
/// called from any thread.
#[derive(Debug, Clone)]
pub struct TokioConnectTimer {
    events: mpsc::UnboundedSender<PlatformEvent>,
    runtime: Handle,
}

impl TokioConnectTimer {
    /// Create a timer on the current runtime that posts onto the given event channel.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(events: mpsc::UnboundedSender<PlatformEvent>) -> Self {
        Self::with_handle(events, Handle::current())
    }

    /// Create a timer on an explicit runtime.
    pub fn with_handle(events: mpsc::UnboundedSender<PlatformEvent>, runtime: Handle) -> Self {
        Self { events, runtime }
    }
}

impl ConnectTimer for TokioConnectTimer {
    fn schedule(&self, id: &DeviceId, attempt: u64, after: Duration) -> TimeoutHandle {
        let events = self.events.clone();
        let id = id.clone();

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            trace!("Connect timer fired for {} (attempt {})", id, attempt);
            let _ = events.send(PlatformEvent::ConnectTimeout { id, attempt });
        });

        TimeoutHandle::new(move || handle.abort())
    }
}

/// A scheduled timeout recorded by [`ManualConnectTimer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTimeout {
    /// Device the timer was armed for.
    pub id: DeviceId,
    /// Attempt number.
    pub attempt: u64,
    /// Requested delay.
    pub after: Duration,
}

/// Connect timer that only records what was scheduled.
///
/// Useful when driving the state machines by hand: the caller decides when,
/// and whether, a `ConnectTimeout` event is delivered.
#[derive(Debug, Default, Clone)]
pub struct ManualConnectTimer {
    scheduled: Arc<Mutex<Vec<ScheduledTimeout>>>,
    cancelled: Arc<Mutex<Vec<(DeviceId, u64)>>>,
}

impl ManualConnectTimer {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything scheduled so far.
    pub fn scheduled(&self) -> Vec<ScheduledTimeout> {
        self.scheduled.lock().clone()
    }

    /// Every (device, attempt) whose timer was cancelled.
    pub fn cancelled(&self) -> Vec<(DeviceId, u64)> {
        self.cancelled.lock().clone()
    }

    /// The event the most recent timer would deliver.
    pub fn last_event(&self) -> Option<PlatformEvent> {
        self.scheduled
            .lock()
            .last()
            .map(|s| PlatformEvent::ConnectTimeout {
                id: s.id.clone(),
                attempt: s.attempt,
            })
    }
}

impl ConnectTimer for ManualConnectTimer {
    fn schedule(&self, id: &DeviceId, attempt: u64, after: Duration) -> TimeoutHandle {
        self.scheduled.lock().push(ScheduledTimeout {
            id: id.clone(),
            attempt,
            after,
        });

        let cancelled = self.cancelled.clone();
        let id = id.clone();
        TimeoutHandle::new(move || cancelled.lock().push((id, attempt)))
    }
}
