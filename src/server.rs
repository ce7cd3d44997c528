use crate::watcher::Watcher;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use log::{error, info};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

const SERVICE_NAME: &str = "appointment-watcher";

pub fn router(watcher: Arc<Watcher>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/poll", get(poll).post(poll))
        .route("/test-notification", post(test_notification))
        .with_state(watcher)
}

/// Serve the HTTP trigger surface until `shutdown` resolves.
pub async fn serve<F>(bind: &str, watcher: Arc<Watcher>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(watcher))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn health(State(watcher): State<Arc<Watcher>>) -> Response {
    let ledger = match watcher.ledger().stats() {
        Ok(stats) => serde_json::to_value(stats).unwrap_or_default(),
        Err(e) => {
            error!("Health check could not read ledger: {e}");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "service": SERVICE_NAME,
                    "timestamp": Utc::now(),
                    "error": e.to_string(),
                })),
            )
                .into_response();
        }
    };

    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": Utc::now(),
        "phase": watcher.phase(),
        "ledger": ledger,
    }))
    .into_response()
}

async fn poll(State(watcher): State<Arc<Watcher>>) -> Response {
    match watcher.run_once().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn test_notification(State(watcher): State<Arc<Watcher>>) -> Response {
    let html = format!(
        "<b>{SERVICE_NAME}</b> test notification\n{}",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    match watcher.dispatcher().send_status(&html).await {
        Ok(sent) => Json(json!({ "status": "sent", "attempts": sent.attempts })).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParserConfig, WatcherConfig};
    use crate::dispatch::retry::RetryPolicy;
    use crate::dispatch::{Dispatcher, Notifier};
    use crate::error::SendError;
    use crate::ledger::SqliteLedger;
    use crate::mail::directory::DirectorySource;
    use crate::parser::AppointmentParser;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[derive(Default)]
    struct CapturingNotifier {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for CapturingNotifier {
        async fn send_message(&self, _chat_target: &str, html: &str) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(html.to_string());
            Ok(())
        }
    }

    fn watcher(dir: &TempDir, notifier: Arc<CapturingNotifier>) -> Arc<Watcher> {
        let dispatcher = Dispatcher::new(
            notifier,
            "chat",
            3,
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        Arc::new(Watcher::new(
            Arc::new(DirectorySource::new(dir.path())),
            AppointmentParser::new(&ParserConfig::default()),
            dispatcher,
            Arc::new(SqliteLedger::open_in_memory().unwrap()),
            WatcherConfig::default(),
        ))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_phase_and_ledger() {
        let dir = TempDir::new().unwrap();
        let app = router(watcher(&dir, Arc::default()));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE_NAME);
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["ledger"]["total"], 0);
    }

    #[tokio::test]
    async fn test_poll_runs_a_cycle() {
        let dir = TempDir::new().unwrap();
        let date = Utc::now().to_rfc3339();
        std::fs::write(
            dir.path().join("confirm.txt"),
            format!(
                "From: TLScontact <noreply@tlscontact.com>\nSubject: Rendez-vous\nDate: {date}\n---\n\
                 Rendez-vous le 14/03/2026 à 10h00\nhttps://tlscontact.com/confirm/1\n"
            ),
        )
        .unwrap();
        let notifier = Arc::new(CapturingNotifier::default());
        let app = router(watcher(&dir, notifier.clone()));

        let response = app
            .clone()
            .oneshot(Request::post("/poll").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["notified"], 1);

        let again = app
            .oneshot(Request::get("/poll").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let report = body_json(again).await;
        assert_eq!(report["notified"], 0);
        assert_eq!(report["already_seen"], 1);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_failure_is_500() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        let dispatcher = Dispatcher::new(
            Arc::new(CapturingNotifier::default()),
            "chat",
            3,
            RetryPolicy::default(),
            Duration::from_secs(5),
        );
        let watcher = Arc::new(Watcher::new(
            Arc::new(DirectorySource::new(missing)),
            AppointmentParser::new(&ParserConfig::default()),
            dispatcher,
            Arc::new(SqliteLedger::open_in_memory().unwrap()),
            WatcherConfig::default(),
        ));

        let response = router(watcher)
            .oneshot(Request::post("/poll").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["status"], "error");
    }

    #[tokio::test]
    async fn test_notification_endpoint_sends_status() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(CapturingNotifier::default());
        let app = router(watcher(&dir, notifier.clone()));

        let response = app
            .oneshot(Request::post("/test-notification").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["attempts"], 1);
        let sent = notifier.sent.lock().unwrap();
        assert!(sent[0].contains("test notification"));
    }
}
