//! Read-only status surface: the reconciler's snapshot as JSON over axum.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use recsync_reconciler::StatusHandle;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "recsync-web";

pub fn app(status: StatusHandle) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(status)
}

/// Bind and serve until the process exits. Handlers only ever clone a
/// snapshot, so a slow or in-progress tick never blocks a status query.
pub async fn serve(status: StatusHandle, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status endpoint listening");
    axum::serve(listener, app(status)).await?;
    Ok(())
}

async fn status_handler(State(status): State<StatusHandle>) -> impl IntoResponse {
    Json(status.snapshot().await)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use recsync_core::{JobKey, StatusSnapshot, TrackedJob};
    use tower::ServiceExt;

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = app(StatusHandle::new());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_starts_empty() {
        let app = app(StatusHandle::new());
        let resp = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let value = body_json(resp).await;
        assert_eq!(value["tracked_jobs"], serde_json::json!([]));
        assert!(value["last_error"].is_null());
    }

    #[tokio::test]
    async fn status_reflects_published_snapshot() {
        let status = StatusHandle::new();
        status
            .publish(StatusSnapshot {
                tracked_jobs: vec![TrackedJob {
                    key: JobKey::new("ingest1", "job1"),
                    logical_name: "PCR 1".into(),
                    basename: "show_2024".into(),
                    source_id: "src-7".into(),
                    started_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
                }],
                last_poll_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 5).single().unwrap()),
                last_error: Some("job ingest2/job4: no source mapping".into()),
            })
            .await;

        let resp = app(status)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let value = body_json(resp).await;

        assert_eq!(value["tracked_jobs"][0]["source_id"], "src-7");
        assert_eq!(value["tracked_jobs"][0]["key"]["ingest_id"], "ingest1");
        assert_eq!(
            value["last_error"],
            "job ingest2/job4: no source mapping"
        );
    }
}
