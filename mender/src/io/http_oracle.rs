//! Remote repair oracle over HTTP.
//!
//! POSTs the [`RepairRequest`] as JSON and expects a [`RepairResult`] body.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use tracing::{info, instrument, warn};

use crate::io::oracle::{OracleError, RepairOracle, RepairRequest, RepairResult};

#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("parse endpoint {endpoint}"))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

/// Map an HTTP status to the oracle failure taxonomy.
///
/// Auth failures are retried alongside overload and server errors. Other
/// client errors mean the request itself was refused.
pub fn classify_status(status: StatusCode) -> OracleError {
    let message = format!("non-success status: {status}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
    {
        OracleError::Unavailable(message)
    } else {
        OracleError::Malformed(message)
    }
}

impl RepairOracle for HttpOracle {
    #[instrument(skip_all, fields(path = %request.path, endpoint = %self.endpoint))]
    fn repair(&self, request: &RepairRequest) -> Result<RepairResult, OracleError> {
        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .map_err(|err| OracleError::Unavailable(format!("request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "oracle rejected request");
            return Err(classify_status(status));
        }
        let result = response
            .json::<RepairResult>()
            .map_err(|err| OracleError::Malformed(format!("invalid json response: {err}")))?;
        info!(success = result.success, "oracle answered");
        Ok(result)
    }
}
