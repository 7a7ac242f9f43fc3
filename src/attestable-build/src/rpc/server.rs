// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use futures_util::{Stream, StreamExt};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, RwLock, RwLockReadGuard};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{BuildQuery, LogRelay, PingQuery, VendorQuery, REPORT_HEADER};
use crate::archive;
use crate::build::{run_build, BuildEnvironment};
use crate::error::render_chain;
use crate::transport::{Transport, TransportListener};

/// Delay between the build response finishing and the worker exiting.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Shared state of a worker serving one build.
pub struct WorkerState {
    build_env: BuildEnvironment,
    relay: Option<LogRelay>,
    session_claimed: AtomicBool,
    /// Vendor unpacks hold this shared; claiming the build session takes it
    /// exclusively, so a build never starts while the workspace is written.
    workspace: RwLock<()>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl WorkerState {
    pub fn new(build_env: BuildEnvironment, relay: Option<LogRelay>) -> Self {
        Self {
            build_env,
            relay,
            session_claimed: AtomicBool::new(false),
            workspace: RwLock::new(()),
            shutdown: CancellationToken::new(),
            grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Cancelled once the worker has decided to exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shared hold on the workspace for one vendor unpack, `None` once the
    /// build session is claimed.
    async fn begin_vendor(&self) -> Option<RwLockReadGuard<'_, ()>> {
        let guard = self.workspace.read().await;
        if self.session_claimed.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    /// Claim the single build session after in-flight vendor unpacks finish.
    /// Returns `false` if it was already claimed.
    async fn claim_session(&self) -> bool {
        let _exclusive = self.workspace.write().await;
        !self.session_claimed.swap(true, Ordering::SeqCst)
    }

    /// Cancel the worker `grace` after `after` resolves (or is dropped).
    fn schedule_shutdown(&self, after: oneshot::Receiver<()>) {
        let token = self.shutdown.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            let _ = after.await;
            tokio::time::sleep(grace).await;
            info!("Build session over, shutting down");
            token.cancel();
        });
    }
}

pub fn worker_router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/vendor", post(vendor))
        .route("/build", post(build))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Serve the worker protocol until the build session ends.
pub async fn serve_worker(listener: TransportListener, state: Arc<WorkerState>) -> io::Result<()> {
    let shutdown = state.shutdown_token();
    axum::serve(listener, worker_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    if let Some(relay) = &state.relay {
        relay.close().await;
    }
    Ok(())
}

async fn ping(State(state): State<Arc<WorkerState>>, Query(query): Query<PingQuery>) -> Response {
    if query.relay_enabled() {
        if let (Some(relay), Some(host)) = (&state.relay, query.host.as_deref()) {
            match Transport::parse(host) {
                Ok(target) => {
                    if !relay.is_connected() {
                        relay.connect(target);
                        info!(%host, "Relaying logs to orchestrator");
                    }
                }
                Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            }
        }
    }
    "pong".into_response()
}

async fn vendor(State(state): State<Arc<WorkerState>>, Query(query): Query<VendorQuery>, body: Body) -> Response {
    let Some(_workspace) = state.begin_vendor().await else {
        return (StatusCode::CONFLICT, "vendor archives must be uploaded before the build").into_response();
    };

    let target = state.build_env.work_dir.join(&query.target);
    info!(?target, "Receiving vendor archive");

    let result = async {
        let upload = receive_upload(body, "worker-vendor-").await?;
        archive::unpack_async(upload.to_path_buf(), target.clone())
            .await
            .map_err(|e| io::Error::other(render_chain(&e)))
    }
    .await;

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(?target, "vendor upload failed: {e}");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

async fn build(State(state): State<Arc<WorkerState>>, Query(query): Query<BuildQuery>, body: Body) -> Response {
    let Some(nonce) = query.nonce.filter(|nonce| !nonce.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing nonce").into_response();
    };
    if !state.claim_session().await {
        return (StatusCode::CONFLICT, "a build already ran on this worker").into_response();
    }

    let (done_tx, done_rx) = oneshot::channel();
    state.schedule_shutdown(done_rx);

    let upload = match receive_upload(body, "worker-source-").await {
        Ok(path) => path,
        Err(e) => {
            error!("could not receive source archive: {e}");
            return (StatusCode::BAD_REQUEST, format!("could not receive source archive: {e}")).into_response();
        }
    };

    let outcome = match run_build(&state.build_env, &upload, &nonce).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = render_chain(&e);
            error!("{message}");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };
    drop(upload);

    let file = match tokio::fs::File::open(&outcome.archive).await {
        Ok(file) => file,
        Err(e) => {
            error!("could not open output archive: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("could not open output archive: {e}")).into_response();
        }
    };
    let length = file.metadata().await.map(|m| m.len()).ok();

    let mut response = Response::new(Body::from_stream(NotifyOnDrop {
        inner: ReaderStream::new(file),
        _archive: outcome.archive,
        done: Some(done_tx),
    }));
    if let Some(length) = length {
        response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(report) = &outcome.report {
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(report);
        match HeaderValue::try_from(encoded) {
            Ok(value) => {
                response.headers_mut().insert(REPORT_HEADER, value);
            }
            Err(e) => {
                error!("could not encode report header: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }

    info!(
        output_hash = %outcome.payload.output_hash,
        attested = outcome.report.is_some(),
        "Build finished, streaming output"
    );
    response
}

/// Stream a request body into a fresh temp file.
async fn receive_upload(body: Body, prefix: &str) -> io::Result<TempPath> {
    let path = tempfile::Builder::new().prefix(prefix).suffix(".tar").tempfile()?.into_temp_path();
    let mut file = tokio::fs::File::create(&path).await?;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(io::Error::other)?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(path)
}

/// Response body that signals once hyper is done with it and then removes
/// the archive it was reading.
struct NotifyOnDrop<S> {
    inner: S,
    _archive: TempPath,
    done: Option<oneshot::Sender<()>>,
}

impl<S> Stream for NotifyOnDrop<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for NotifyOnDrop<S> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
