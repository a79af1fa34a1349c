use crate::http::HttpProber;
use crate::records;
use crate::status::{ObjectQuery, ObjectStatusProber};
use futures::future::BoxFuture;
use rollout_core::gate::Prober;
use rollout_core::probe::{ProbeFailure, ProbeTarget};

/// Dispatches each probe kind to its substrate. Object probes need a cluster
/// connection; without one they fail as `Transport`.
pub struct ClusterProber {
    http: HttpProber,
    objects: Option<ObjectStatusProber>,
}

impl ClusterProber {
    pub fn new(http: HttpProber, objects: Option<ObjectStatusProber>) -> Self {
        Self { http, objects }
    }
}

impl Prober for ClusterProber {
    fn probe<'a>(
        &'a self,
        unit: &'a str,
        target: &'a ProbeTarget,
    ) -> BoxFuture<'a, Result<(), ProbeFailure>> {
        Box::pin(async move {
            match target {
                ProbeTarget::HttpGet {
                    url,
                    expect_status,
                    expect_json,
                } => self.http.get(url, *expect_status, expect_json.as_ref()).await,
                ProbeTarget::RecordExists {
                    dsn_env,
                    table,
                    column,
                    value,
                } => records::record_exists(dsn_env, table, column, value).await,
                ProbeTarget::ObjectStatusField {
                    api_version,
                    kind,
                    namespace,
                    name,
                    selector,
                    field,
                    equals,
                } => {
                    let Some(objects) = &self.objects else {
                        return Err(ProbeFailure::Transport("no cluster connection".into()));
                    };
                    let query = ObjectQuery {
                        api_version,
                        kind,
                        namespace: namespace.as_deref(),
                        name: name.as_deref(),
                        selector: selector.as_deref(),
                        field,
                        equals,
                    };
                    objects.check(unit, &query).await
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_core::probe::StatusRange;

    #[tokio::test]
    async fn dispatches_http_probes() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/ready")
            .with_status(200)
            .create_async()
            .await;
        let prober = ClusterProber::new(HttpProber::new().unwrap(), None);
        let target = ProbeTarget::HttpGet {
            url: format!("{}/ready", server.url()),
            expect_status: StatusRange::default(),
            expect_json: None,
        };
        prober.probe("identity", &target).await.unwrap();
    }

    #[tokio::test]
    async fn object_probe_without_cluster_is_transport() {
        let prober = ClusterProber::new(HttpProber::new().unwrap(), None);
        let target = ProbeTarget::ObjectStatusField {
            api_version: "batch/v1".into(),
            kind: "Job".into(),
            namespace: Some("identity".into()),
            name: Some("realm-import".into()),
            selector: None,
            field: "/status/succeeded".into(),
            equals: "1".into(),
        };
        let err = prober.probe("realm-import", &target).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
    }
}
