//! Serial-to-caller response correlation.
//!
//! The [`Dispatcher`] is the only consumer of a connection's reply
//! stream. Each sent command gets a one-shot [`ResponseSlot`] keyed by its
//! serial; a background task routes every reply to its slot exactly once.
//!
//! # Pending Table
//!
//! ```text
//! send ──register──►┌──────────────────┐◄──remove── dispatch task
//!                   │ serial → slot tx │
//! close ──sweep────►└──────────────────┘
//! ```
//!
//! Register, remove and sweep all go through one lock. After the sweep
//! the table is marked closed and further registrations fail, so no
//! caller can wait on a slot that will never be resolved.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::identifiers::Serial;
use crate::protocol::{Command, Reply};

use super::connection::{Connection, ReplyReceiver};

// ============================================================================
// Types
// ============================================================================

/// Sending half of a response slot.
type SlotSender = oneshot::Sender<Result<Reply>>;

/// Pending table plus its closed flag.
#[derive(Default)]
struct PendingTable {
    slots: FxHashMap<Serial, SlotSender>,
    closed: bool,
}

impl PendingTable {
    /// Adds a slot for `serial`; refused once the table has been swept.
    fn register(&mut self, serial: Serial, tx: SlotSender) -> Result<()> {
        if self.closed {
            return Err(Error::ClientExiting);
        }
        self.slots.insert(serial, tx);
        Ok(())
    }

    /// Marks the table closed and takes every remaining slot.
    fn close(&mut self) -> Vec<SlotSender> {
        self.closed = true;
        self.slots.drain().map(|(_, tx)| tx).collect()
    }
}

/// Internal shared state for a dispatcher.
struct DispatcherInner {
    connection: Connection,
    pending: Arc<Mutex<PendingTable>>,
    dispatch_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// ResponseSlot
// ============================================================================

/// One-shot slot that resolves to the reply for one serial.
///
/// Resolves exactly once: with the server reply, or with
/// [`Error::ClientExiting`] if the dispatcher shuts down first.
#[derive(Debug)]
pub struct ResponseSlot {
    serial: Serial,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl ResponseSlot {
    /// Returns the serial this slot waits on.
    #[inline]
    #[must_use]
    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientExiting`] if the dispatcher shut down before
    /// a reply arrived.
    pub async fn recv(self) -> Result<Reply> {
        self.rx.await.map_err(|_| Error::ClientExiting)?
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Multiplexes concurrent commands over one connection.
///
/// Cheap to clone; clones share the connection and pending table.
///
/// # Example
///
/// ```ignore
/// let client = Dispatcher::connect(&ClientOptions::new()).await?;
///
/// // Sync: send and wait
/// let title = client.execute(&GetTitle).await?;
///
/// // Async: send now, wait later
/// let slot = client.send(&GetCurrentUrl).await?;
/// let reply = slot.recv().await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connection", &self.inner.connection)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatcher - Constructors
// ============================================================================

impl Dispatcher {
    /// Dials `options.address` over TCP and opens a dispatcher on it.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid
    /// - [`Error::Connection`] if dialing or the greeting fails
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        options.validate()?;

        let stream = TcpStream::connect(options.address.as_str())
            .await
            .map_err(|e| Error::connection(format!("connect to {}: {e}", options.address)))?;
        debug!(address = %options.address, "TCP connected");

        Self::open(stream, options).await
    }

    /// Opens a dispatcher over an established stream.
    ///
    /// # Errors
    ///
    /// As [`Connection::open`].
    pub async fn open<S>(stream: S, options: &ClientOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (connection, replies) = Connection::open(stream, options).await?;
        Ok(Self::new(connection, replies))
    }

    /// Wraps an open connection and starts the dispatch task.
    ///
    /// `replies` must be the stream returned alongside `connection`.
    pub fn new(connection: Connection, replies: ReplyReceiver) -> Self {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let task = tokio::spawn(Self::run_dispatch_loop(replies, Arc::clone(&pending)));

        Self {
            inner: Arc::new(DispatcherInner {
                connection,
                pending,
                dispatch_task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }
}

// ============================================================================
// Dispatcher - Public API
// ============================================================================

impl Dispatcher {
    /// Sends a command and returns its response slot without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the command fails its own check;
    ///   nothing is written and no serial is used
    /// - [`Error::ClientExiting`] if the dispatcher already shut down, or
    ///   `close` interrupted the write
    /// - [`Error::ConnectionClosed`] / [`Error::Connection`] on transport failure
    pub async fn send<C: Command + ?Sized>(&self, cmd: &C) -> Result<ResponseSlot> {
        let name = cmd.name();
        if !cmd.is_valid() {
            debug!(command = name, "Command rejected by validity check");
            return Err(Error::invalid_argument(format!(
                "{name}: invalid parameters"
            )));
        }

        let params = cmd.params();
        let (tx, rx) = oneshot::channel();
        let pending = Arc::clone(&self.inner.pending);

        let serial = self
            .inner
            .connection
            .send_with(name, &params, move |serial| pending.lock().register(serial, tx))
            .await?;

        Ok(ResponseSlot { serial, rx })
    }

    /// Sends a command and waits for its decoded result.
    ///
    /// A result that does not match the command's expected shape closes
    /// the connection before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::Driver`] if the server reported a failure
    /// - [`Error::Protocol`] if the result could not be decoded
    /// - anything [`Dispatcher::send`] or [`ResponseSlot::recv`] returns
    pub async fn execute<C: Command>(&self, cmd: &C) -> Result<C::Output> {
        let slot = self.send(cmd).await?;
        let reply = slot.recv().await?;

        match C::decode_reply(reply) {
            Err(e @ Error::Protocol { .. }) => {
                error!(command = cmd.name(), error = %e, "Undecodable result, closing connection");
                self.close().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Returns the number of commands awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().slots.len()
    }

    /// Returns `true` once the shutdown sweep has run.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed
    }

    /// Returns the underlying connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Closes the connection and waits for the shutdown sweep.
    ///
    /// Every pending slot resolves with [`Error::ClientExiting`] before this
    /// returns. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.connection.close().await;

        if let Some(task) = self.inner.dispatch_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Dispatch task panicked");
        }
    }

    /// Waits until the connection stops.
    ///
    /// # Errors
    ///
    /// As [`Connection::wait`].
    pub async fn wait(&self) -> Result<()> {
        self.inner.connection.wait().await
    }
}

// ============================================================================
// Dispatcher - Internal
// ============================================================================

impl Dispatcher {
    /// Routes replies until the connection's stream ends, then sweeps.
    async fn run_dispatch_loop(mut replies: ReplyReceiver, pending: Arc<Mutex<PendingTable>>) {
        while let Some(reply) = replies.recv().await {
            Self::deliver(&pending, reply);
        }

        Self::fail_pending(&pending);
        debug!("Dispatch loop terminated");
    }

    /// Delivers one reply to its slot, if the slot is still registered.
    fn deliver(pending: &Mutex<PendingTable>, reply: Reply) {
        let serial = reply.serial;
        let slot = pending.lock().slots.remove(&serial);

        match slot {
            Some(tx) => {
                if tx.send(Ok(reply)).is_err() {
                    trace!(%serial, "Caller dropped response slot");
                }
            }
            None => warn!(%serial, "Reply for unknown serial"),
        }
    }

    /// Resolves every pending slot with [`Error::ClientExiting`].
    fn fail_pending(pending: &Mutex<PendingTable>) {
        let drained = pending.lock().close();

        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(Error::ClientExiting));
        }

        if count > 0 {
            debug!(count, "Failed pending commands on shutdown");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures_util::future::join_all;
    use serde_json::{Value, json};
    use tokio::io::AsyncWriteExt;
    use tokio::time::{sleep, timeout};

    use crate::error::DriverErrorKind;
    use crate::protocol::{GetTitle, Navigate, RawCommand, encode_frame};
    use crate::testing::{MockReply, MockServer};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn open(server: tokio::io::DuplexStream) -> Dispatcher {
        open_stream(server).await
    }

    async fn open_stream<S>(stream: S) -> Dispatcher
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Dispatcher::open(stream, &ClientOptions::new())
            .await
            .expect("open dispatcher")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_their_own_reply() {
        const CALLERS: u64 = 50;

        // Later commands are answered first
        let (_server, stream) = MockServer::spawn(|cmd| {
            let marker = cmd.params["marker"].as_u64().unwrap_or_default();
            MockReply::Delayed(
                Duration::from_millis(CALLERS - marker),
                json!({ "value": marker }),
            )
        });
        let client = open(stream).await;

        let calls = (0..CALLERS).map(|marker| {
            let client = client.clone();
            tokio::spawn(async move {
                let cmd = RawCommand::new("test:Echo", json!({ "marker": marker }));
                let data = client.execute(&cmd).await.expect("echo");
                (marker, data)
            })
        });

        let results = timeout(TEST_TIMEOUT, join_all(calls))
            .await
            .expect("timed out");
        for result in results {
            let (marker, data) = result.expect("task");
            assert_eq!(data, json!({ "value": marker }));
        }

        assert_eq!(client.pending_count(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_resolves_every_pending_slot() {
        const OUTSTANDING: usize = 10;

        let (_server, stream) = MockServer::spawn(|_| MockReply::Silent);
        let client = open(stream).await;

        let mut slots = Vec::new();
        for _ in 0..OUTSTANDING {
            slots.push(client.send(&GetTitle).await.expect("send"));
        }
        assert_eq!(client.pending_count(), OUTSTANDING);

        client.close().await;
        assert_eq!(client.pending_count(), 0);
        assert!(client.is_closed());

        for slot in slots {
            let result = timeout(TEST_TIMEOUT, slot.recv()).await.expect("timed out");
            assert!(matches!(result, Err(Error::ClientExiting)));
        }
    }

    #[tokio::test]
    async fn test_close_twice_is_harmless() {
        let (_server, stream) = MockServer::spawn(|_| MockReply::Silent);
        let client = open(stream).await;

        client.close().await;
        client.close().await;

        let err = client.send(&GetTitle).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_invalid_command_sends_nothing() {
        let (server, stream) = MockServer::spawn(|_| MockReply::value(json!("Example")));
        let client = open(stream).await;

        let err = client
            .send(&Navigate { url: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(client.pending_count(), 0);

        // The next valid command still gets the first serial
        let slot = client.send(&GetTitle).await.expect("send");
        assert_eq!(slot.serial(), Serial::FIRST);
        slot.recv().await.expect("reply");

        let received = server.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].name, "WebDriver:GetTitle");
        client.close().await;
    }

    #[tokio::test]
    async fn test_driver_error_reaches_only_its_caller() {
        let (_server, stream) = MockServer::spawn(|cmd| match cmd.name.as_str() {
            "WebDriver:FindElement" => MockReply::err(DriverErrorKind::NoSuchElement, "#nope"),
            _ => MockReply::value(json!("Example")),
        });
        let client = open(stream).await;

        let err = client
            .execute(&crate::protocol::FindElement::css("#nope"))
            .await
            .unwrap_err();
        assert_eq!(err.driver_kind(), Some(DriverErrorKind::NoSuchElement));
        assert!(err.is_recoverable());

        // Connection stays usable
        assert_eq!(client.execute(&GetTitle).await.expect("title"), "Example");
        client.close().await;
    }

    #[tokio::test]
    async fn test_unknown_serial_is_ignored() {
        let stray = encode_frame(&json!([1, 999, null, {"value": "stray"}])).expect("encode");
        let mut stray = Some(stray);
        let (_server, stream) = MockServer::spawn(move |cmd| match stray.take() {
            Some(mut bytes) => {
                // Stray reply first, then the real one
                let real = json!([1, cmd.serial, null, {"value": "Example"}]);
                bytes.extend(encode_frame(&real).expect("encode"));
                MockReply::Raw(bytes)
            }
            None => MockReply::value(json!("Example")),
        });
        let client = open(stream).await;

        assert_eq!(client.execute(&GetTitle).await.expect("title"), "Example");
        assert_eq!(client.execute(&GetTitle).await.expect("title"), "Example");
        client.close().await;
    }

    #[tokio::test]
    async fn test_upstream_failure_fails_pending_slots() {
        let (_server, stream) = MockServer::spawn(|cmd| match cmd.name.as_str() {
            "test:Break" => MockReply::Raw(b"not a frame".to_vec()),
            _ => MockReply::Silent,
        });
        let client = open(stream).await;

        let waiting = client.send(&GetTitle).await.expect("send");
        client
            .send(&RawCommand::new("test:Break", Value::Null))
            .await
            .expect("send");

        let result = timeout(TEST_TIMEOUT, waiting.recv()).await.expect("timed out");
        assert!(matches!(result, Err(Error::ClientExiting)));

        let err = client.wait().await.unwrap_err();
        assert!(matches!(err, Error::Terminated(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_swept_table_refuses_registration() {
        let mut table = PendingTable::default();
        let (tx, _rx) = oneshot::channel();
        table.register(Serial::FIRST, tx).expect("open table");

        let swept = table.close();
        assert_eq!(swept.len(), 1);
        assert!(table.slots.is_empty());

        let (tx, _rx) = oneshot::channel();
        let err = table.register(Serial::FIRST.next(), tx).unwrap_err();
        assert!(matches!(err, Error::ClientExiting));
    }

    #[tokio::test]
    async fn test_close_unblocks_sender_on_stalled_peer() {
        // Peer sends its greeting and then never reads
        let (client, server) = tokio::io::duplex(64);
        let (_server_read, mut server_write) = tokio::io::split(server);
        let greeting = encode_frame(&json!({"marionetteProtocol": 3})).expect("encode");
        server_write.write_all(&greeting).await.expect("write");

        let client = open_stream(client).await;

        let sender = {
            let client = client.clone();
            tokio::spawn(async move {
                let pad = "x".repeat(4096);
                client
                    .send(&RawCommand::new("test:Big", json!({ "pad": pad })))
                    .await
                    .map(|slot| slot.serial())
            })
        };

        sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());
        assert_eq!(client.pending_count(), 1);

        timeout(TEST_TIMEOUT, client.close())
            .await
            .expect("close timed out");

        let result = timeout(TEST_TIMEOUT, sender)
            .await
            .expect("sender still blocked after close")
            .expect("task");
        assert!(matches!(result, Err(Error::ClientExiting)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_terminal() {
        // Separate pipes for each direction so the write side can fail
        // while the read side stays open.
        let (client_read, mut server_write) = tokio::io::duplex(1024);
        let (client_write, server_read) = tokio::io::duplex(1024);
        let greeting = encode_frame(&json!({"marionetteProtocol": 3})).expect("encode");
        server_write.write_all(&greeting).await.expect("write");

        let client = open_stream(tokio::io::join(client_read, client_write)).await;

        let waiting = client.send(&GetTitle).await.expect("first send");
        drop(server_read);

        let err = client.send(&GetTitle).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));

        let result = timeout(TEST_TIMEOUT, waiting.recv()).await.expect("timed out");
        assert!(matches!(result, Err(Error::ClientExiting)));

        let err = timeout(TEST_TIMEOUT, client.wait())
            .await
            .expect("timed out")
            .unwrap_err();
        match err {
            Error::Terminated(source) => assert!(matches!(*source, Error::Connection { .. })),
            other => panic!("unexpected error: {other}"),
        }

        let err = client.send(&GetTitle).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_sends_leaves_no_caller_waiting() {
        const SENDERS: usize = 32;

        let (_server, stream) = MockServer::spawn(|_| MockReply::Silent);
        let client = open(stream).await;

        let sends = (0..SENDERS).map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let cmd = RawCommand::new("test:Race", json!({ "i": i }));
                match client.send(&cmd).await {
                    Ok(slot) => slot.recv().await.map(|_| ()),
                    Err(e) => Err(e),
                }
            })
        });
        let sends: Vec<_> = sends.collect();

        client.close().await;

        let results = timeout(TEST_TIMEOUT, join_all(sends))
            .await
            .expect("a caller hung past close");
        for result in results {
            let err = result.expect("task").unwrap_err();
            assert!(err.is_connection_error(), "unexpected error: {err}");
        }
        assert_eq!(client.pending_count(), 0);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_shape_mismatch_closes_connection() {
        let (_server, stream) = MockServer::spawn(|_| MockReply::value(json!(42)));
        let client = open(stream).await;

        let err = client.execute(&GetTitle).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(client.is_closed());
        assert!(client.connection().is_closed());
    }
}
