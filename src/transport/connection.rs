//! Stream connection and receive loop.
//!
//! A [`Connection`] owns one duplex byte stream. It assigns serials to
//! outbound commands and runs a background task that reads response
//! frames and forwards them, in arrival order, to a single consumer.
//!
//! # Lifecycle
//!
//! 1. `Connection::open` - read and discard the server greeting
//! 2. Receive loop spawned; replies flow out of the returned channel
//! 3. `Connection::send` - write `[0, serial, name, params]`
//! 4. `Connection::close` - stop the loop and shut the write half
//!
//! The loop ends on `close`, on a clean end of stream, or on the first
//! I/O or decode failure. A failure is kept as the terminal status and
//! reported by [`Connection::wait`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, trace, warn};

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::identifiers::Serial;
use crate::protocol::{CommandEnvelope, FrameReader, Reply, write_frame};

// ============================================================================
// Types
// ============================================================================

/// Type-erased write half of the stream.
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receiving end of the reply stream produced by the receive loop.
pub type ReplyReceiver = mpsc::UnboundedReceiver<Reply>;

/// State of the receive loop.
#[derive(Debug, Clone)]
pub enum LoopStatus {
    /// Still reading frames.
    Running,
    /// Stopped by `close` or a clean end of stream.
    Stopped,
    /// Stopped by an I/O or decode failure.
    Failed(Arc<Error>),
}

impl LoopStatus {
    #[inline]
    fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Write half plus the serial counter, guarded together so serials hit
/// the wire in the order they are assigned.
struct WriteState {
    writer: Option<BoxedWriter>,
    next_serial: Serial,
}

/// Internal shared state for a connection.
struct ConnectionInner {
    /// Write half and serial counter.
    write: tokio::sync::Mutex<WriteState>,
    /// Stops the receive loop; `Some` error marks a write failure.
    shutdown_tx: Mutex<Option<oneshot::Sender<Option<Error>>>>,
    /// Set by the first `close`.
    closed: AtomicBool,
    /// Flipped to `true` by `close`; aborts sends waiting on the stream.
    closing: watch::Sender<bool>,
    /// Receive loop status.
    status: watch::Receiver<LoopStatus>,
}

// ============================================================================
// Connection
// ============================================================================

/// Client end of one protocol stream.
///
/// `Connection` is cheap to clone; clones share the stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection - Constructor
// ============================================================================

impl Connection {
    /// Opens a connection over an established stream.
    ///
    /// Reads exactly one frame, the server greeting, before spawning the
    /// receive loop. Returns the connection and the reply stream.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid
    /// - [`Error::Connection`] if the stream ends before the greeting
    /// - [`Error::Protocol`] if the greeting frame is malformed
    pub async fn open<S>(stream: S, options: &ClientOptions) -> Result<(Self, ReplyReceiver)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        options.validate()?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, options.max_frame_len);

        let greeting: Value = reader
            .read_value()
            .await?
            .ok_or_else(|| Error::connection("stream closed before greeting"))?;
        debug!(%greeting, "Greeting received");

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(LoopStatus::Running);

        tokio::spawn(Self::run_receive_loop(
            reader,
            reply_tx,
            shutdown_rx,
            status_tx,
        ));

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                write: tokio::sync::Mutex::new(WriteState {
                    writer: Some(Box::new(write_half)),
                    next_serial: Serial::FIRST,
                }),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                closed: AtomicBool::new(false),
                closing: watch::Sender::new(false),
                status: status_rx,
            }),
        };

        Ok((connection, reply_rx))
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Sends a command and returns the serial assigned to it.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is closed
    /// - [`Error::Connection`] if the write fails (terminal)
    pub async fn send(&self, name: &str, params: &Value) -> Result<Serial> {
        self.send_with(name, params, |_| Ok(())).await
    }

    /// Sends a command, calling `register` with the serial before any byte
    /// is written.
    ///
    /// `register` runs while the write lock is held, so a response can
    /// never arrive for a serial that has not been registered. If it
    /// fails, nothing is written.
    ///
    /// A `close` while waiting for the lock or the stream aborts the send
    /// with [`Error::ClientExiting`]; a frame interrupted mid-write leaves
    /// the stream unusable, so the writer is dropped.
    pub(crate) async fn send_with<F>(&self, name: &str, params: &Value, register: F) -> Result<Serial>
    where
        F: FnOnce(Serial) -> Result<()>,
    {
        let mut closing = self.inner.closing.subscribe();
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut state = tokio::select! {
            state = self.inner.write.lock() => state,
            _ = closing.wait_for(|c| *c) => return Err(Error::ClientExiting),
        };
        let serial = state.next_serial;
        let Some(writer) = state.writer.as_mut() else {
            return Err(Error::ConnectionClosed);
        };

        register(serial)?;

        let envelope = CommandEnvelope::new(serial, name, params);
        let written = tokio::select! {
            biased;

            _ = closing.wait_for(|c| *c) => Err(Error::ClientExiting),
            result = write_frame(writer, &envelope) => result,
        };

        match written {
            Ok(()) => {}
            Err(Error::ClientExiting) => {
                debug!(%serial, command = name, "Send aborted by close");
                state.writer = None;
                return Err(Error::ClientExiting);
            }
            Err(e) => {
                error!(%serial, command = name, error = %e, "Write failed, closing connection");
                state.writer = None;
                self.signal_shutdown(Some(Error::connection(e.to_string())));
                return Err(e);
            }
        }

        state.next_serial = serial.next();
        trace!(%serial, command = name, "Command sent");
        Ok(serial)
    }

    /// Closes the connection.
    ///
    /// Stops the receive loop, waits for it to finish and shuts down the
    /// write half. Calling `close` more than once is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            trace!("Connection already closed");
            return;
        }

        self.inner.closing.send_replace(true);
        self.signal_shutdown(None);

        let mut status = self.inner.status.clone();
        let _ = status.wait_for(|s| !s.is_running()).await;

        // Pending sends observe `closing` and release the lock
        let writer = self.inner.write.lock().await.writer.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            debug!(error = %e, "Write half shutdown failed");
        }

        debug!("Connection closed");
    }

    /// Waits for the receive loop to stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminated`] wrapping the failure that stopped the
    /// loop. A loop stopped by `close` or a clean end of stream yields
    /// `Ok(())`.
    pub async fn wait(&self) -> Result<()> {
        let mut status = self.inner.status.clone();
        let _ = status.wait_for(|s| !s.is_running()).await;
        let outcome = status.borrow().clone();

        match outcome {
            LoopStatus::Failed(err) => Err(Error::Terminated(err)),
            LoopStatus::Running | LoopStatus::Stopped => Ok(()),
        }
    }

    /// Returns `true` once the connection is closed or its loop stopped.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || !self.inner.status.borrow().is_running()
    }

    /// Returns the current receive loop status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> LoopStatus {
        self.inner.status.borrow().clone()
    }
}

// ============================================================================
// Connection - Internal
// ============================================================================

impl Connection {
    fn signal_shutdown(&self, reason: Option<Error>) {
        if let Some(tx) = self.inner.shutdown_tx.lock().take() {
            let _ = tx.send(reason);
        }
    }

    /// Reads frames until shutdown, end of stream or the first failure.
    async fn run_receive_loop<R>(
        mut reader: FrameReader<R>,
        reply_tx: mpsc::UnboundedSender<Reply>,
        mut shutdown_rx: oneshot::Receiver<Option<Error>>,
        status_tx: watch::Sender<LoopStatus>,
    ) where
        R: AsyncRead + Unpin,
    {
        let outcome: Result<()> = loop {
            tokio::select! {
                biased;

                reason = &mut shutdown_rx => {
                    match reason {
                        Ok(Some(err)) => break Err(err),
                        Ok(None) | Err(_) => {
                            debug!("Shutdown requested");
                            break Ok(());
                        }
                    }
                }

                frame = reader.read_frame() => {
                    match frame {
                        Ok(Some(payload)) => match Reply::from_frame(&payload) {
                            Ok(reply) => {
                                trace!(serial = %reply.serial, "Reply received");
                                if reply_tx.send(reply).is_err() {
                                    debug!("Reply consumer dropped");
                                    break Ok(());
                                }
                            }
                            Err(e) => break Err(e),
                        },
                        Ok(None) => {
                            debug!("Stream ended");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let status = match outcome {
            Ok(()) => LoopStatus::Stopped,
            Err(e) => {
                warn!(error = %e, "Receive loop failed");
                LoopStatus::Failed(Arc::new(e))
            }
        };
        status_tx.send_replace(status);

        debug!("Receive loop terminated");
    }
}

// ============================================================================
// Tests
// ============================================================================
