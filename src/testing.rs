//! Scripted in-memory server for tests.
//!
//! [`MockServer::spawn`] returns the client end of a `tokio::io::duplex`
//! pipe. The server task sends a greeting, then answers every command
//! frame with whatever the handler returns, recording each command.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;

use crate::error::DriverErrorKind;
use crate::protocol::{FrameReader, WireError, encode_frame};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Installs a test subscriber honouring `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One command as the server saw it.
#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub serial: u64,
    pub name: String,
    pub params: Value,
}

/// What the server does with a command.
pub(crate) enum MockReply {
    /// Reply `[1, serial, null, data]`.
    Ok(Value),
    /// Reply with a driver error.
    Err(DriverErrorKind, String),
    /// Reply with `data` after a delay, without blocking later commands.
    Delayed(Duration, Value),
    /// Never reply.
    Silent,
    /// Write these bytes verbatim instead of a reply.
    Raw(Vec<u8>),
}

impl MockReply {
    pub(crate) fn ok(data: Value) -> Self {
        Self::Ok(data)
    }

    pub(crate) fn value(value: Value) -> Self {
        Self::Ok(json!({ "value": value }))
    }

    pub(crate) fn err(kind: DriverErrorKind, message: &str) -> Self {
        Self::Err(kind, message.to_string())
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

/// Handle to a running mock server.
pub(crate) struct MockServer {
    log: Arc<Mutex<Vec<Received>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Starts a server answering with `handler`.
    pub(crate) fn spawn<H>(handler: H) -> (Self, DuplexStream)
    where
        H: FnMut(&Received) -> MockReply + Send + 'static,
    {
        init_tracing();

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(Self::run(server, handler, Arc::clone(&log)));

        (Self { log, task }, client)
    }

    /// Commands received so far, in arrival order.
    pub(crate) fn received(&self) -> Vec<Received> {
        self.log.lock().clone()
    }

    /// Number of received commands named `name`.
    pub(crate) fn count(&self, name: &str) -> usize {
        self.log.lock().iter().filter(|r| r.name == name).count()
    }

    async fn run<H>(stream: DuplexStream, mut handler: H, log: Arc<Mutex<Vec<Received>>>)
    where
        H: FnMut(&Received) -> MockReply + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
        let mut reader = FrameReader::new(read_half, PIPE_CAPACITY);

        let greeting = json!({ "applicationType": "gecko", "marionetteProtocol": 3 });
        if Self::write(&writer, &greeting).await.is_err() {
            return;
        }

        while let Ok(Some(frame)) = reader.read_value::<(u8, u64, String, Value)>().await {
            let (_, serial, name, params) = frame;
            let received = Received {
                serial,
                name,
                params,
            };
            log.lock().push(received.clone());

            let reply = handler(&received);
            let writer = Arc::clone(&writer);
            let outcome = match reply {
                MockReply::Ok(data) => Self::write(&writer, &json!([1, serial, null, data])).await,
                MockReply::Err(kind, message) => {
                    let error = WireError {
                        error: kind.as_str().to_string(),
                        message,
                        stacktrace: String::new(),
                    };
                    Self::write(&writer, &json!([1, serial, error, null])).await
                }
                MockReply::Delayed(delay, data) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = Self::write(&writer, &json!([1, serial, null, data])).await;
                    });
                    Ok(())
                }
                MockReply::Silent => Ok(()),
                MockReply::Raw(bytes) => writer.lock().await.write_all(&bytes).await,
            };

            if outcome.is_err() {
                break;
            }
        }
    }

    async fn write(writer: &SharedWriter, value: &Value) -> std::io::Result<()> {
        let frame = encode_frame(value).map_err(std::io::Error::other)?;
        let mut writer = writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
