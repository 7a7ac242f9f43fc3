// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Log relaying from the worker back to the orchestrator.
//!
//! The worker's fmt layer writes through [`LogRelay`]. Every formatted line
//! goes to stdout and, once `/ping` switched relaying on, into a channel that a
//! background task drains and posts to the orchestrator's `/log` endpoint. The
//! orchestrator side is [`serve_log_sink`], which prints whatever arrives.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::routing::post;
use axum::Router;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

use super::RpcClient;
use crate::transport::{Transport, TransportListener};

struct RelaySink {
    tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// `MakeWriter` that tees log output to stdout and, when connected, to a
/// remote `/log` endpoint.
#[derive(Clone, Default)]
pub struct LogRelay {
    sink: Arc<Mutex<Option<RelaySink>>>,
}

impl LogRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start relaying to `target`. Replaces any earlier target.
    pub fn connect(&self, target: Transport) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward(RpcClient::new(target), rx));
        if let Ok(mut sink) = self.sink.lock() {
            // Dropping the old sender lets the old task drain and stop.
            *sink = Some(RelaySink { tx, task });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().map(|sink| sink.is_some()).unwrap_or(false)
    }

    /// Stop relaying and wait until everything queued so far was delivered.
    pub async fn close(&self) {
        let sink = self.sink.lock().ok().and_then(|mut sink| sink.take());
        if let Some(RelaySink { tx, task }) = sink {
            drop(tx);
            let _ = task.await;
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.sink
            .lock()
            .ok()
            .and_then(|sink| sink.as_ref().map(|s| s.tx.clone()))
    }
}

async fn forward(client: RpcClient, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(first) = rx.recv().await {
        let mut batch = BytesMut::from(&first[..]);
        while let Ok(more) = rx.try_recv() {
            batch.extend_from_slice(&more);
        }
        if let Err(e) = client.push_log(batch.freeze()).await {
            // Not through tracing: that would feed straight back into the relay.
            let _ = writeln!(io::stderr(), "log relay to {} failed: {e}", client.endpoint());
        }
    }
}

pub struct RelayWriter {
    stdout: io::Stdout,
    remote: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Write for RelayWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdout.write_all(buf)?;
        if let Some(remote) = &self.remote {
            let _ = remote.send(Bytes::copy_from_slice(buf));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()
    }
}

impl<'a> MakeWriter<'a> for LogRelay {
    type Writer = RelayWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RelayWriter {
            stdout: io::stdout(),
            remote: self.sender(),
        }
    }
}

/// Serve `POST /log` on `listener`, printing each body verbatim, until
/// `shutdown` fires.
pub fn serve_log_sink(listener: TransportListener, shutdown: CancellationToken) -> JoinHandle<io::Result<()>> {
    let router = Router::new().route("/log", post(print_log));
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    })
}

async fn print_log(body: Bytes) {
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(&body).await;
    let _ = stdout.flush().await;
}
