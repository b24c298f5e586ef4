//! Cancellable, deadline-bound byte stream to one validated device.
//!
//! A [`SerialTransport`] holds at most one open session. Every I/O call takes
//! a timeout and an external [`CancellationToken`]; whichever fires first
//! ends the call with a zero or partial result and an [`IoStatus`] saying
//! why. Only genuine I/O faults are returned as errors.
//!
//! Reads are serialized across the whole transport by a single-slot gate.
//! The gate permit is held by the read future itself, so it is released on
//! every exit path, including when the future is dropped by cancellation.

use crate::device::{DeviceEndpoint, PhysicalDeviceId};
use crate::error::{Error, Result};
use crate::port::{PortConfiguration, PortOpener, SerialStreamIo};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How a bounded I/O call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Completed,
    /// The caller's token fired, or the session was torn down.
    Cancelled,
    /// The call's own deadline elapsed.
    TimedOut,
    /// No session was open.
    NotConnected,
}

/// Result value of a bounded I/O call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOutcome<T> {
    pub value: T,
    pub status: IoStatus,
}

impl<T> IoOutcome<T> {
    pub fn new(value: T, status: IoStatus) -> Self {
        Self { value, status }
    }

    pub fn completed(value: T) -> Self {
        Self::new(value, IoStatus::Completed)
    }

    pub fn is_completed(&self) -> bool {
        self.status == IoStatus::Completed
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

type Stream = Box<dyn SerialStreamIo>;

/// Upper bound on the bytes returned by one `receive`.
pub const MAX_READ_SIZE: usize = 64 * 1024;

/// Deadline `timeout` from now. `None` when it lies beyond what the clock
/// can represent, which is treated as no deadline.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct TransportSession {
    endpoint: DeviceEndpoint,
    reader: tokio::sync::Mutex<ReadHalf<Stream>>,
    writer: tokio::sync::Mutex<WriteHalf<Stream>>,
    /// Fired when the session is torn down; aborts in-flight I/O.
    closed: CancellationToken,
    /// Guards the decision to start I/O against a concurrent teardown.
    start_lock: Mutex<()>,
}

impl TransportSession {
    fn new(endpoint: DeviceEndpoint, stream: Stream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            endpoint,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
            start_lock: Mutex::new(()),
        }
    }

    /// Decide whether I/O may begin. `Some` carries the reason it may not.
    fn check_start(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Option<IoStatus> {
        let _guard = self.start_lock.lock();
        if cancel.is_cancelled() || self.closed.is_cancelled() {
            Some(IoStatus::Cancelled)
        } else if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(IoStatus::TimedOut)
        } else {
            None
        }
    }

    fn close(&self) {
        let _guard = self.start_lock.lock();
        self.closed.cancel();
    }

    async fn write(&self, bytes: &[u8]) -> std::io::Result<usize> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(bytes.len())
    }

    async fn read(&self, max_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; max_bytes.min(MAX_READ_SIZE)];
        let n = self.reader.lock().await.read(&mut buffer).await?;
        buffer.truncate(n);
        Ok(buffer)
    }
}

/// Byte-stream access to the currently connected device.
pub struct SerialTransport {
    opener: Arc<dyn PortOpener>,
    config: PortConfiguration,
    session: Mutex<Option<Arc<TransportSession>>>,
    open_lock: tokio::sync::Mutex<()>,
    read_gate: Semaphore,
    last_activity: Mutex<Option<Instant>>,
}

impl SerialTransport {
    pub fn new(opener: Arc<dyn PortOpener>, config: PortConfiguration) -> Self {
        Self {
            opener,
            config,
            session: Mutex::new(None),
            open_lock: tokio::sync::Mutex::new(()),
            read_gate: Semaphore::new(1),
            last_activity: Mutex::new(None),
        }
    }

    /// Open a session to `endpoint`.
    ///
    /// A no-op when that device is already open. Any other open session is
    /// torn down first and its in-flight I/O ends as cancelled.
    pub async fn open(&self, endpoint: &DeviceEndpoint) -> Result<()> {
        let _opening = self.open_lock.lock().await;

        if let Some(current) = self.current() {
            if current.endpoint.id == endpoint.id {
                trace!(device = %endpoint.id, "Session already open");
                return Ok(());
            }
        }
        self.teardown();

        let port = self
            .opener
            .open(&endpoint.port_name, &self.config)
            .await
            .map_err(|e| {
                warn!(device = %endpoint.id, port = %endpoint.port_name, error = %e, "Failed to open transport");
                Error::open_failed(endpoint.port_name.as_str(), e)
            })?;

        let session = TransportSession::new(endpoint.clone(), port.into_stream());
        *self.session.lock() = Some(Arc::new(session));
        info!(device = %endpoint.id, port = %endpoint.port_name, "Transport session opened");
        Ok(())
    }

    /// Close the session if it belongs to `id`. Returns whether it did.
    pub fn disconnect(&self, id: &PhysicalDeviceId) -> bool {
        let matches = self
            .current()
            .is_some_and(|session| &session.endpoint.id == id);
        if !matches {
            trace!(device = %id, "Disconnect ignored, device not open");
            return false;
        }

        self.teardown();
        info!(device = %id, "Transport session closed");
        true
    }

    /// Write all of `bytes`, bounded by `timeout` and `cancel`.
    ///
    /// Returns the number of bytes written; zero when the call was cancelled,
    /// timed out, or no device is connected.
    pub async fn send(
        &self,
        bytes: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IoOutcome<usize>> {
        let Some(session) = self.current() else {
            return Ok(IoOutcome::new(0, IoStatus::NotConnected));
        };
        let deadline = deadline_after(timeout);

        if let Some(status) = session.check_start(cancel, deadline) {
            trace!(device = %session.endpoint.id, ?status, "Send not started");
            return Ok(IoOutcome::new(0, status));
        }

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(IoOutcome::new(0, IoStatus::Cancelled)),
            _ = session.closed.cancelled() => return Ok(IoOutcome::new(0, IoStatus::Cancelled)),
            _ = wait_until(deadline) => {
                debug!(device = %session.endpoint.id, ?timeout, "Send timed out");
                return Ok(IoOutcome::new(0, IoStatus::TimedOut));
            }
            written = session.write(bytes) => written?,
        };

        if written > 0 {
            self.touch();
        }
        trace!(device = %session.endpoint.id, written, "Sent");
        Ok(IoOutcome::completed(written))
    }

    /// Read up to `max_bytes`, bounded by `timeout` and `cancel`.
    ///
    /// Returns whatever one read produced, which may be short and is never
    /// more than [`MAX_READ_SIZE`]. Waits for the read gate first; time spent
    /// waiting counts against the deadline.
    pub async fn receive(
        &self,
        max_bytes: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IoOutcome<Vec<u8>>> {
        let Some(session) = self.current() else {
            return Ok(IoOutcome::new(Vec::new(), IoStatus::NotConnected));
        };
        if max_bytes == 0 {
            return Ok(IoOutcome::completed(Vec::new()));
        }
        let deadline = deadline_after(timeout);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => IoOutcome::new(Vec::new(), IoStatus::Cancelled),
            _ = session.closed.cancelled() => IoOutcome::new(Vec::new(), IoStatus::Cancelled),
            _ = wait_until(deadline) => IoOutcome::new(Vec::new(), IoStatus::TimedOut),
            read = self.gated_read(&session, max_bytes, deadline, cancel) => read?,
        };

        match outcome.status {
            IoStatus::Completed if outcome.value.is_empty() => {
                debug!(device = %session.endpoint.id, "End of stream");
            }
            IoStatus::Completed => {
                trace!(device = %session.endpoint.id, read = outcome.value.len(), "Received");
            }
            status => {
                trace!(device = %session.endpoint.id, ?status, "Receive ended early");
            }
        }
        Ok(outcome)
    }

    async fn gated_read(
        &self,
        session: &TransportSession,
        max_bytes: usize,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<IoOutcome<Vec<u8>>> {
        let _permit = self
            .read_gate
            .acquire()
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        if let Some(status) = session.check_start(cancel, deadline) {
            return Ok(IoOutcome::new(Vec::new(), status));
        }
        Ok(IoOutcome::completed(session.read(max_bytes).await?))
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn connected_device(&self) -> Option<DeviceEndpoint> {
        self.current().map(|session| session.endpoint.clone())
    }

    /// Time of the last non-empty successful send.
    pub fn last_activity(&self) -> Option<Instant> {
        *self.last_activity.lock()
    }

    /// True while a receive holds the read gate.
    pub fn read_in_flight(&self) -> bool {
        self.read_gate.available_permits() == 0
    }

    fn current(&self) -> Option<Arc<TransportSession>> {
        self.session.lock().clone()
    }

    fn teardown(&self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
            debug!(device = %session.endpoint.id, "Transport session torn down");
        }
    }

    fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_activity.lock();
        match *last {
            Some(previous) if previous >= now => {}
            _ => *last = Some(now),
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("connected", &self.connected_device())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
