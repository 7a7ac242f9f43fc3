// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! HTTP/1.1 protocol between the orchestrator and the worker.
//!
//! | Endpoint                        | Direction     | Response                                       |
//! |---------------------------------|---------------|------------------------------------------------|
//! | `GET /ping?host=<uri>&logger=1` | orch → worker | 200 once serving                               |
//! | `POST /vendor?target=<dir>`     | orch → worker | 200, or 4xx with the error text                |
//! | `POST /build?nonce=<hex>`       | orch → worker | 200 + output archive + `Report` header, or 4xx |
//! | `POST /log`                     | worker → orch | 200; body is printed verbatim                  |

mod client;
mod relay;
mod server;

pub use client::{BuildResponse, RpcClient};
pub use relay::{serve_log_sink, LogRelay};
pub use server::{serve_worker, worker_router, WorkerState};

use serde::{Deserialize, Serialize};

/// Response header carrying the base64url attestation document.
pub const REPORT_HEADER: &str = "Report";

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error("HTTP exchange with the worker failed")]
    Http(#[from] hyper::Error),

    #[error("could not build request")]
    Request(#[from] hyper::http::Error),

    #[error("peer answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("I/O error during transfer")]
    Io(#[from] std::io::Error),

    #[error("`{REPORT_HEADER}` header is not valid base64url")]
    InvalidReport(#[source] base64::DecodeError),
}

impl RpcError {
    /// Non-200 answers from the peer, as opposed to transport failures.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Status { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingQuery {
    /// Reverse address of the orchestrator's log sink.
    #[serde(default)]
    pub host: Option<String>,
    /// `1` enables log relaying to `host`.
    #[serde(default)]
    pub logger: Option<String>,
}

impl PingQuery {
    pub fn relay_enabled(&self) -> bool {
        self.logger.as_deref() == Some("1")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorQuery {
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildQuery {
    #[serde(default)]
    pub nonce: Option<String>,
}
