use super::*;
use axum::{body, body::Body, http::Request};
use chrono::Utc;
use shared::domain::ReconsiderPolicy;
use storage::{NewConnection, NewProfile};
use tower::ServiceExt;

struct TestApp {
    app: Router,
    storage: Storage,
    alice: UserId,
    bob: UserId,
}

async fn test_app_with_policy(policy: ReconsiderPolicy) -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user(&NewProfile {
            username: "alice",
            company: Some("Acme"),
            ..Default::default()
        })
        .await
        .expect("alice");
    let bob = storage
        .create_user(&NewProfile {
            username: "bob",
            ..Default::default()
        })
        .await
        .expect("bob");

    let api = ApiContext::new(storage.clone()).with_reconsider_policy(policy);
    let app = build_router(Arc::new(AppState { api }), 4096);
    TestApp {
        app,
        storage,
        alice,
        bob,
    }
}

async fn test_app() -> TestApp {
    test_app_with_policy(ReconsiderPolicy::AllowAll).await
}

impl TestApp {
    async fn pending(&self) -> ConnectionId {
        self.storage
            .create_connection(&NewConnection {
                requester_id: self.bob,
                responder_id: self.alice,
                opportunity_id: None,
                request_type: None,
                created_at: Utc::now(),
            })
            .await
            .expect("connection")
    }

    async fn post(&self, uri: String, json: Option<serde_json::Value>) -> StatusCode {
        let builder = Request::post(uri);
        let request = match json {
            Some(json) => {
                let payload = json.to_string();
                builder
                    .header("content-type", "application/json")
                    .header("content-length", payload.len())
                    .body(Body::from(payload))
            }
            None => builder.body(Body::empty()),
        }
        .expect("request");
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("response")
            .status()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, uri: String) -> T {
        let request = Request::get(uri).body(Body::empty()).expect("request");
        let response = self.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let t = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = t.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn lists_connections_and_stats_for_user() {
    let t = test_app().await;
    let first = t.pending().await;
    let _second = t.pending().await;
    assert_eq!(
        t.post(format!("/connections/{}/share", first.0), None).await,
        StatusCode::NO_CONTENT
    );

    let records: Vec<ConnectionRecord> = t
        .get_json(format!("/users/{}/connections", t.alice.0))
        .await;
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .any(|r| r.connection_id == first && r.status == "accepted"));

    let stats: ConnectionStats = t
        .get_json(format!("/users/{}/connections/stats", t.alice.0))
        .await;
    assert_eq!(stats.active, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total, 2);
}

#[tokio::test]
async fn decline_route_stores_reason_and_reconsider_clears_it() {
    let t = test_app().await;
    let id = t.pending().await;

    let status = t
        .post(
            format!("/connections/{}/decline", id.0),
            Some(serde_json::json!({ "reason": "" })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let stored = t.storage.load_connection(id).await.expect("load").expect("row");
    assert_eq!(stored.status, "rejected");
    assert_eq!(stored.decline_reason.as_deref(), Some(""));

    let status = t
        .post(format!("/connections/{}/reconsider", id.0), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let stored = t.storage.load_connection(id).await.expect("load").expect("row");
    assert_eq!(stored.status, "pending");
    assert_eq!(stored.decline_reason, None);
}

#[tokio::test]
async fn transitions_on_unknown_connection_are_not_found() {
    let t = test_app().await;
    for action in ["share", "revoke", "reconsider"] {
        let status = t.post(format!("/connections/777/{action}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "action={action}");
    }
}

#[tokio::test]
async fn revoked_connection_stays_closed_under_declined_only_policy() {
    let t = test_app_with_policy(ReconsiderPolicy::DeclinedOnly).await;
    let id = t.pending().await;
    assert_eq!(
        t.post(format!("/connections/{}/revoke", id.0), None).await,
        StatusCode::NO_CONTENT
    );
    assert_eq!(
        t.post(format!("/connections/{}/reconsider", id.0), None).await,
        StatusCode::FORBIDDEN
    );
}

#[tokio::test]
async fn questionnaire_route_returns_link() {
    let t = test_app().await;
    let id = t.pending().await;
    let questionnaire = t
        .storage
        .create_questionnaire(t.alice, "Fit check")
        .await
        .expect("questionnaire");

    let request = Request::post(format!("/connections/{}/questionnaires", id.0))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "questionnaire_id": questionnaire.0 }).to_string(),
        ))
        .expect("request");
    let response = t.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let link: QuestionnaireLink = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(link.connection_id, id);
    assert_eq!(link.status, "sent");
}

#[tokio::test]
async fn oversized_decline_body_is_rejected() {
    let t = test_app().await;
    let id = t.pending().await;
    let reason = "x".repeat(8192);
    let status = t
        .post(
            format!("/connections/{}/decline", id.0),
            Some(serde_json::json!({ "reason": reason })),
        )
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
