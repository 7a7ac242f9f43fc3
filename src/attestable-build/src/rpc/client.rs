// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use std::path::Path;

use base64::Engine;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{RpcError, REPORT_HEADER};
use crate::transport::Transport;

type RequestBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Result of a successful `/build` call.
#[derive(Debug)]
pub struct BuildResponse {
    /// Raw attestation document, absent when the worker runs without one.
    pub report: Option<Vec<u8>>,
    pub archive_size: u64,
}

/// One-request-per-connection HTTP client over any [`Transport`].
#[derive(Debug, Clone)]
pub struct RpcClient {
    endpoint: Transport,
}

impl RpcClient {
    pub fn new(endpoint: Transport) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Transport {
        &self.endpoint
    }

    /// `GET /ping`, telling the worker where to relay its logs.
    pub async fn ping(&self, log_host: Option<&str>, relay: bool) -> Result<(), RpcError> {
        let query = {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            if let Some(host) = log_host {
                query.append_pair("host", host);
            }
            if relay {
                query.append_pair("logger", "1");
            }
            query.finish()
        };
        let response = self.send(Method::GET, &format!("/ping?{query}"), empty()).await?;
        expect_ok(response).await.map(drop)
    }

    /// `POST /vendor`: stream `archive` to be unpacked into `target`.
    #[tracing::instrument(skip_all, fields(archive = ?archive, target = ?target))]
    pub async fn upload_vendor(&self, archive: &Path, target: &Path) -> Result<(), RpcError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("target", &target.to_string_lossy())
            .finish();
        let body = file_body(archive).await?;
        let response = self.send(Method::POST, &format!("/vendor?{query}"), body).await?;
        expect_ok(response).await.map(drop)
    }

    /// `POST /build`: stream the source archive, write the returned output
    /// archive to `dest` and decode the attestation header.
    #[tracing::instrument(skip_all, fields(nonce = %nonce))]
    pub async fn build(&self, archive: &Path, nonce: &str, dest: &Path) -> Result<BuildResponse, RpcError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("nonce", nonce)
            .finish();
        let body = file_body(archive).await?;
        let response = self.send(Method::POST, &format!("/build?{query}"), body).await?;
        let response = expect_ok(response).await?;

        let report = response
            .headers()
            .get(REPORT_HEADER)
            .map(|value| {
                base64::engine::general_purpose::URL_SAFE
                    .decode(value.as_bytes())
                    .map_err(RpcError::InvalidReport)
            })
            .transpose()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = response.into_body();
        let mut archive_size = 0u64;
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame?.into_data() {
                file.write_all(&data).await?;
                archive_size += data.len() as u64;
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        debug!(archive_size, has_report = report.is_some(), "Build response received");
        Ok(BuildResponse { report, archive_size })
    }

    /// `POST /log` with a chunk of formatted log output.
    pub async fn push_log(&self, data: Bytes) -> Result<(), RpcError> {
        let body = Full::new(data).map_err(|never| match never {}).boxed_unsync();
        let response = self.send(Method::POST, "/log", body).await?;
        expect_ok(response).await.map(drop)
    }

    async fn send(&self, method: Method, path: &str, body: RequestBody) -> Result<Response<Incoming>, RpcError> {
        let stream = self.endpoint.connect().await?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("worker connection closed with error: {e}");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body)?;
        Ok(sender.send_request(request).await?)
    }
}

fn empty() -> RequestBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

async fn file_body(path: &Path) -> Result<RequestBody, RpcError> {
    let file = tokio::fs::File::open(path).await?;
    let stream = ReaderStream::new(file).map_ok(Frame::data);
    Ok(StreamBody::new(stream).boxed_unsync())
}

/// Pass 200 responses through; turn anything else into a `Status` error
/// carrying the body text verbatim.
async fn expect_ok(response: Response<Incoming>) -> Result<Response<Incoming>, RpcError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let body = response.into_body().collect().await?.to_bytes();
    Err(RpcError::Status {
        status: status.as_u16(),
        message: String::from_utf8_lossy(&body).into_owned(),
    })
}
