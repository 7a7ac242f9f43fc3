// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use nsm_api::api::{Request, Response};
use nsm_api::driver;
use serde_bytes::ByteBuf;

use super::{AttestationError, Attestor};

/// Attestation through the Nitro Secure Module device (`/dev/nsm`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NsmAttestor;

impl Attestor for NsmAttestor {
    fn attest(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AttestationError> {
        let fd = driver::nsm_init();
        if fd < 0 {
            return Err(AttestationError::DeviceUnavailable);
        }

        let request = Request::Attestation {
            user_data: Some(ByteBuf::from(user_data.to_vec())),
            nonce: Some(ByteBuf::from(nonce.to_vec())),
            public_key: None,
        };
        let response = driver::nsm_process_request(fd, request);
        driver::nsm_exit(fd);

        match response {
            Response::Attestation { document } => Ok(document),
            Response::Error(code) => Err(AttestationError::Rejected(format!("{code:?}"))),
            other => Err(AttestationError::Rejected(format!("unexpected response {other:?}"))),
        }
    }
}
