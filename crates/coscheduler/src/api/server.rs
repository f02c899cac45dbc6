use std::sync::Arc;
use std::sync::RwLock;

use anyhow::Context;
use anyhow::Result;
use ipc_monitor::IpcMonitor;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::AgentChannel;
use crate::lifecycle::LifecycleController;
use crate::score::ScoreBook;

use super::handlers;

/// Assembles the control routes. Split out so tests can exercise the
/// endpoints without binding a listener.
pub fn build_routes(
    engine: Arc<IpcMonitor>,
    lifecycle: Arc<LifecycleController>,
    agent: Arc<AgentChannel>,
    book: Arc<RwLock<ScoreBook>>,
) -> impl poem::Endpoint {
    Route::new()
        .at("/healthz", get(handlers::ping))
        .at("/api/v1/reset", post(handlers::reset_counters))
        .at("/api/v1/pgid", post(handlers::add_pgid))
        .at("/api/v1/pgid/remove", post(handlers::remove_pgid))
        .at("/api/v1/threshold", post(handlers::set_threshold))
        .at("/api/v1/agent", post(handlers::set_agent_endpoint))
        .at("/api/v1/profile", post(handlers::request_profile))
        .at(
            "/api/v1/score",
            get(handlers::dump_scores).post(handlers::update_score),
        )
        .at("/api/v1/baseline", post(handlers::update_baseline))
        .data(engine)
        .data(lifecycle)
        .data(agent)
        .data(book)
        .with(Tracing)
}

/// HTTP server for the control surface.
pub struct ControlServer {
    listen_addr: String,
    engine: Arc<IpcMonitor>,
    lifecycle: Arc<LifecycleController>,
    agent: Arc<AgentChannel>,
    book: Arc<RwLock<ScoreBook>>,
}

impl ControlServer {
    pub fn new(
        listen_addr: String,
        engine: Arc<IpcMonitor>,
        lifecycle: Arc<LifecycleController>,
        agent: Arc<AgentChannel>,
        book: Arc<RwLock<ScoreBook>>,
    ) -> Self {
        Self {
            listen_addr,
            engine,
            lifecycle,
            agent,
            book,
        }
    }

    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!("Starting control API server on {}", self.listen_addr);

        let app = build_routes(self.engine, self.lifecycle, self.agent, self.book);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => result.context("control server failed"),
            _ = token.cancelled() => {
                info!("control server shutting down");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use ipc_monitor::pmu::CounterSample;
    use ipc_monitor::pmu::CounterSource;
    use ipc_monitor::pmu::PmuError;
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use serde_json::json;
    use utils::shared_memory::RegionBacking;
    use utils::shared_memory::SnapshotRegion;

    use crate::lifecycle::Enrollment;
    use crate::lifecycle::PgidLiveness;
    use crate::lifecycle::ProfileSink;
    use crate::lifecycle::TransportError;
    use crate::Pgid;

    use super::*;

    struct NullCounters;

    impl CounterSource for NullCounters {
        fn read(&self) -> Result<CounterSample, PmuError> {
            Ok(CounterSample::default())
        }
    }

    struct AnyLiveness;

    impl PgidLiveness for AnyLiveness {
        fn has_members(&self, _pgid: Pgid) -> bool {
            true
        }
    }

    struct DropSink;

    impl ProfileSink for DropSink {
        fn send_request(&self, _: Pgid, _: u64, _: i32) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn test_client(
    ) -> (TestClient<impl poem::Endpoint>, Arc<AgentChannel>, Arc<RwLock<ScoreBook>>) {
        let engine = Arc::new(IpcMonitor::new(
            RegionBacking::Private(SnapshotRegion::boxed()),
            vec![Box::new(NullCounters)],
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&engine) as Arc<dyn Enrollment>,
            Arc::new(AnyLiveness),
            Arc::new(DropSink),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        ));
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(AgentChannel::new(dir.path()).unwrap());
        let book = Arc::new(RwLock::new(ScoreBook::new()));

        let routes = build_routes(engine, lifecycle, Arc::clone(&agent), Arc::clone(&book));
        (TestClient::new(routes), agent, book)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (cli, _, _) = test_client();
        let resp = cli.get("/healthz").send().await;
        resp.assert_status_is_ok();
    }

    #[tokio::test]
    async fn add_pgid_validates_payload() {
        let (cli, _, _) = test_client();

        let resp = cli
            .post("/api/v1/pgid")
            .body_json(&json!({"pgid": -1, "jobid": 1, "worker_num": 2}))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);

        let resp = cli
            .post("/api/v1/pgid")
            .body_json(&json!({"pgid": 100, "jobid": 1, "worker_num": 0}))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn add_twice_conflicts_and_remove_twice_is_not_found() {
        let (cli, _, _) = test_client();

        let body = json!({"pgid": 100, "jobid": 1, "worker_num": 2});
        cli.post("/api/v1/pgid")
            .body_json(&body)
            .send()
            .await
            .assert_status_is_ok();
        let resp = cli.post("/api/v1/pgid").body_json(&body).send().await;
        resp.assert_status(StatusCode::CONFLICT);

        cli.post("/api/v1/pgid/remove")
            .body_json(&json!({"pgid": 100}))
            .send()
            .await
            .assert_status_is_ok();
        let resp = cli
            .post("/api/v1/pgid/remove")
            .body_json(&json!({"pgid": 100}))
            .send()
            .await;
        resp.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn threshold_must_be_positive() {
        let (cli, _, _) = test_client();
        let resp = cli
            .post("/api/v1/threshold")
            .body_json(&json!({"seconds": 0}))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);

        cli.post("/api/v1/threshold")
            .body_json(&json!({"seconds": 60}))
            .send()
            .await
            .assert_status_is_ok();
    }

    #[tokio::test]
    async fn agent_endpoint_round_trips() {
        let (cli, agent, _) = test_client();

        let resp = cli
            .post("/api/v1/agent")
            .body_json(&json!({"id": -3}))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(agent.endpoint(), None);

        cli.post("/api/v1/agent")
            .body_json(&json!({"id": 7}))
            .send()
            .await
            .assert_status_is_ok();
        assert_eq!(agent.endpoint(), Some(7));
    }

    #[tokio::test]
    async fn score_updates_and_dump() {
        let (cli, _, book) = test_client();

        cli.post("/api/v1/score")
            .body_json(&json!({"jobid1": 1, "jobid2": 2, "score": 0.75}))
            .send()
            .await
            .assert_status_is_ok();
        cli.post("/api/v1/baseline")
            .body_json(&json!({"jobid": 1, "ipc": 0.5}))
            .send()
            .await
            .assert_status_is_ok();

        assert_eq!(book.read().unwrap().score(2, 1), 0.75);
        assert_eq!(book.read().unwrap().baseline_ipc(1), Some(0.5));

        let resp = cli.get("/api/v1/score").send().await;
        resp.assert_status_is_ok();
        let body = resp.json().await;
        body.value().object().get("entries").array().assert_len(1);
    }

    #[tokio::test]
    async fn non_finite_scores_are_rejected() {
        let (cli, _, _) = test_client();
        // JSON has no NaN literal; a null score fails deserialization with
        // a 400 from the extractor as well.
        let resp = cli
            .post("/api/v1/score")
            .body_json(&json!({"jobid1": 1, "jobid2": 2, "score": null}))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_endpoint_succeeds() {
        let (cli, _, _) = test_client();
        cli.post("/api/v1/reset").send().await.assert_status_is_ok();
    }
}
