//! HTTP readiness probe.

use crate::error::Result;
use rollout_core::probe::{JsonExpectation, ProbeFailure, StatusRange};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// One GET. Connection errors are `Transport`; a wrong status or body is
    /// `NotReady`.
    pub async fn get(
        &self,
        url: &str,
        expect_status: StatusRange,
        expect_json: Option<&JsonExpectation>,
    ) -> std::result::Result<(), ProbeFailure> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeFailure::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        debug!(%url, status, "probe response");
        if !expect_status.contains(status) {
            return Err(ProbeFailure::NotReady(format!(
                "HTTP {status}, expected {expect_status}"
            )));
        }
        let Some(expect) = expect_json else {
            return Ok(());
        };
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProbeFailure::NotReady(format!("body is not JSON: {e}")))?;
        match body.pointer(&expect.pointer) {
            Some(found) if *found == expect.equals => Ok(()),
            Some(found) => Err(ProbeFailure::NotReady(format!(
                "{} is {found}, expected {}",
                expect.pointer, expect.equals
            ))),
            None => Err(ProbeFailure::NotReady(format!(
                "{} missing from body",
                expect.pointer
            ))),
        }
    }
}
