//! Health checks over HTTP.

use crate::error::env_var;
use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use rollout_core::health::{CheckContext, CheckKind, CheckRunner, CheckSuccess, HealthCheckSpec};
use rollout_core::probe::StatusRange;
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

pub struct HttpCheckRunner {
    client: reqwest::Client,
}

impl HttpCheckRunner {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn endpoint(&self, url: &str, expect: StatusRange) -> Result<CheckSuccess, String> {
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        status_detail(resp.status().as_u16(), expect).map(|detail| CheckSuccess {
            detail,
            token: None,
        })
    }

    async fn auth_round_trip(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret_env: &str,
        audience: Option<&str>,
        scope: Option<&str>,
    ) -> Result<CheckSuccess, String> {
        let secret = env_var(client_secret_env).map_err(|e| e.to_string())?;
        let body = token_form(client_id, &secret, audience, scope)?;
        let resp = self
            .client
            .post(token_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        if !StatusRange::default().contains(status) {
            return Err(format!("token endpoint returned HTTP {status}"));
        }
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| format!("token response is not JSON: {e}"))?;
        match parsed.access_token {
            Some(token) if !token.is_empty() => {
                debug!(client_id, "access token issued");
                Ok(CheckSuccess {
                    detail: format!("token issued for client '{client_id}'"),
                    token: Some(token),
                })
            }
            _ => Err("token response has no access_token".into()),
        }
    }

    async fn data_query(
        &self,
        url: &str,
        bearer_from: Option<&str>,
        expect: StatusRange,
        ctx: &CheckContext,
    ) -> Result<CheckSuccess, String> {
        let mut req = self.client.get(url);
        if let Some(from) = bearer_from {
            let token = ctx
                .token(from)
                .ok_or_else(|| format!("no token from check '{from}'"))?;
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        status_detail(resp.status().as_u16(), expect).map(|detail| CheckSuccess {
            detail,
            token: None,
        })
    }
}

fn status_detail(status: u16, expect: StatusRange) -> Result<String, String> {
    if expect.contains(status) {
        Ok(format!("HTTP {status}"))
    } else {
        Err(format!("HTTP {status}, expected {expect}"))
    }
}

/// `application/x-www-form-urlencoded` body for a client-credentials grant.
pub fn token_form(
    client_id: &str,
    client_secret: &str,
    audience: Option<&str>,
    scope: Option<&str>,
) -> Result<String, String> {
    let mut fields = vec![
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];
    if let Some(a) = audience {
        fields.push(("audience", a));
    }
    if let Some(s) = scope {
        fields.push(("scope", s));
    }
    serde_urlencoded::to_string(&fields).map_err(|e| e.to_string())
}

impl CheckRunner for HttpCheckRunner {
    fn run<'a>(
        &'a self,
        spec: &'a HealthCheckSpec,
        ctx: &'a CheckContext,
    ) -> BoxFuture<'a, Result<CheckSuccess, String>> {
        Box::pin(async move {
            match &spec.check {
                CheckKind::Endpoint { url, expect_status } => self.endpoint(url, *expect_status).await,
                CheckKind::AuthRoundTrip {
                    token_url,
                    client_id,
                    client_secret_env,
                    audience,
                    scope,
                } => {
                    self.auth_round_trip(
                        token_url,
                        client_id,
                        client_secret_env,
                        audience.as_deref(),
                        scope.as_deref(),
                    )
                    .await
                }
                CheckKind::DataQuery {
                    url,
                    bearer_from,
                    expect_status,
                } => {
                    self.data_query(url, bearer_from.as_deref(), *expect_status, ctx)
                        .await
                }
            }
        })
    }
}
