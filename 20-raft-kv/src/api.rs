//! HTTP surface.
//!
//! | Method/Path | Body | Success |
//! |---|---|---|
//! | `POST /store` | `{key, value}` | `200 {message, data:{key,value}}` |
//! | `GET /store/:key` | | `200 {message, data:{key,value}}` |
//! | `DELETE /store/:key` | | `200 {message, data:{key}}` |
//! | `POST /raft/join` | `{nodeId, raftAddress}` | `200 {message, data: stats}` |
//! | `POST /raft/remove` | `{nodeId}` | `200 {message}` |
//! | `GET /raft/stats` | | `200 {message, data: stats}` |
//! | `GET /raft/pass_leadership` | | `200 {message}` |
//!
//! Every failure is `422 {"error": ...}`, with `"outcome": "unknown"` added
//! when the request may still take effect. A forwarded request answers with
//! the leader's status and body unchanged.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::consensus::Consensus;
use crate::error::Error;
use crate::forward::{FORWARDED_HEADER, ForwardedResponse};
use crate::membership::{JoinRequest, MembershipCoordinator, RemoveRequest};
use crate::router::{Hop, Routed, WriteRouter};
use crate::transfer::pass_leadership;

#[derive(Clone)]
pub struct AppState<C> {
    pub router: WriteRouter<C>,
    pub membership: MembershipCoordinator<C>,
}

pub fn routes<C: Consensus>(state: AppState<C>) -> Router {
    Router::new()
        .route("/store", post(store::<C>))
        .route("/store/:key", get(fetch::<C>).delete(remove_key::<C>))
        .route("/raft/join", post(join::<C>))
        .route("/raft/remove", post(remove_member::<C>))
        .route("/raft/stats", get(stats::<C>))
        .route("/raft/pass_leadership", get(transfer_leader::<C>))
        .with_state(state)
}

/// Converts library errors into the JSON error envelope.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::InvalidInput(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "request failed");
        let body = if self.0.is_ambiguous() {
            json!({ "error": self.0.to_string(), "outcome": "unknown" })
        } else {
            json!({ "error": self.0.to_string() })
        };
        (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn hop(headers: &HeaderMap) -> Hop {
    if headers.contains_key(FORWARDED_HEADER) {
        Hop::Forwarded
    } else {
        Hop::Origin
    }
}

fn ok(body: Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

/// Passes the leader's answer through unchanged.
fn relay(response: ForwardedResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(response.body)).into_response()
}

fn respond<T>(routed: Routed<T>, local: impl FnOnce(T) -> Value) -> Response {
    match routed {
        Routed::Local(value) => ok(local(value)),
        Routed::Forwarded(response) => relay(response),
    }
}

#[derive(Debug, Deserialize)]
struct StoreRequest {
    key: String,
    #[serde(default)]
    value: Value,
}

async fn store<C: Consensus>(
    State(state): State<AppState<C>>,
    headers: HeaderMap,
    body: Result<Json<StoreRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let routed = state
        .router
        .store(&request.key, request.value.clone(), hop(&headers))
        .await?;
    Ok(respond(routed, |result| {
        json!({
            "message": "success persisting data",
            "data": { "key": result.key, "value": request.value },
        })
    }))
}

async fn fetch<C: Consensus>(
    State(state): State<AppState<C>>,
    Path(key): Path<String>,
) -> ApiResult {
    let record = state.router.get(&key)?;
    Ok(ok(json!({ "message": "success fetching data", "data": record })))
}

async fn remove_key<C: Consensus>(
    State(state): State<AppState<C>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> ApiResult {
    let routed = state.router.delete(&key, hop(&headers)).await?;
    Ok(respond(routed, |result| {
        json!({ "message": "success removing data", "data": { "key": result.key } })
    }))
}

async fn join<C: Consensus>(
    State(state): State<AppState<C>>,
    body: Result<Json<JoinRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let message = format!(
        "node {} at {} joined successfully",
        request.node_id, request.raft_address
    );
    let stats = state.membership.handle_join(request).await?;
    Ok(ok(json!({ "message": message, "data": stats })))
}

async fn remove_member<C: Consensus>(
    State(state): State<AppState<C>>,
    body: Result<Json<RemoveRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let node_id = request.node_id;
    state.membership.handle_remove(request).await?;
    Ok(ok(json!({ "message": format!("node {node_id} removed successfully") })))
}

async fn stats<C: Consensus>(State(state): State<AppState<C>>) -> ApiResult {
    let stats = state.router.consensus().stats().await?;
    Ok(ok(json!({ "message": "here is the raft status", "data": stats })))
}

async fn transfer_leader<C: Consensus>(
    State(state): State<AppState<C>>,
    headers: HeaderMap,
) -> ApiResult {
    let routed = pass_leadership(&state.router, hop(&headers)).await?;
    Ok(respond(routed, |()| json!({ "message": "success transferring leader" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{NodeConfig, NodeOptions};
    use crate::consensus::Role;
    use crate::consensus::stub::StubConsensus;
    use crate::forward::Forwarder;
    use crate::fsm::StateMachine;
    use crate::locator::LeaderLocator;
    use crate::store::DurableStore;

    fn app(role: Role) -> (Router, StubConsensus) {
        let store = DurableStore::temporary().unwrap();
        let consensus = StubConsensus::new(1, role, StateMachine::new(store.clone()));
        let config = Arc::new(NodeConfig {
            server_address: "127.0.0.1:8001".into(),
            join_address: None,
            raft_node_id: 1,
            raft_address: "127.0.0.1:7001".into(),
            volume_dir: "/tmp/node1".into(),
            peers: vec![],
        });
        let options = NodeOptions::default();
        let locator =
            LeaderLocator::new(consensus.clone(), store, config.clone(), options.apply_timeout);
        let forwarder = Forwarder::new(1, Duration::from_secs(1)).unwrap();
        let router = WriteRouter::new(
            consensus.clone(),
            locator,
            forwarder.clone(),
            options.apply_timeout,
        );
        let membership = MembershipCoordinator::new(router.clone(), forwarder, config, &options);
        (routes(AppState { router, membership }), consensus)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn store_fetch_delete_on_leader() {
        let (app, _) = app(Role::Leader);

        let request = post_json("/store", json!({"key": "x", "value": {"a": 1}}));
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "success persisting data");

        let (status, body) = call(&app, get("/store/x")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"key": "x", "value": {"a": 1}}));

        let delete = Request::delete("/store/x").body(Body::empty()).unwrap();
        let (status, body) = call(&app, delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"key": "x"}));

        let (status, body) = call(&app, get("/store/x")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn padded_key_answers_with_trimmed_key() {
        let (app, _) = app(Role::Leader);

        let request = post_json("/store", json!({"key": " x ", "value": 1}));
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"key": "x", "value": 1}));

        let (status, body) = call(&app, get("/store/x")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["value"], 1);
    }

    #[tokio::test]
    async fn bad_input_is_422_without_outcome() {
        let (app, consensus) = app(Role::Leader);

        let (status, body) = call(&app, post_json("/store", json!({"key": " ", "value": 1}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.get("outcome").is_none());

        let malformed = Request::post("/store")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(&app, malformed).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());

        assert_eq!(consensus.applies(), 0);
    }

    #[tokio::test]
    async fn commit_timeout_reports_unknown_outcome() {
        let (app, consensus) = app(Role::Leader);
        consensus.stall_applies();

        let (status, body) = call(&app, post_json("/store", json!({"key": "x", "value": 1}))).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["outcome"], "unknown");
    }

    #[tokio::test]
    async fn forwarded_write_to_follower_is_refused() {
        let (app, _) = app(Role::Follower);
        let request = Request::post("/store")
            .header("content-type", "application/json")
            .header(FORWARDED_HEADER, "2")
            .body(Body::from(json!({"key": "x", "value": 1}).to_string()))
            .unwrap();

        let (status, body) = call(&app, request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "node is not the leader");
    }

    #[tokio::test]
    async fn join_and_stats_on_leader() {
        let (app, _) = app(Role::Leader);

        let (status, body) = call(
            &app,
            post_json("/raft/join", json!({"nodeId": 2, "raftAddress": "127.0.0.1:7002"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "node 2 at 127.0.0.1:7002 joined successfully");

        let (status, body) = call(&app, get("/raft/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["node_id"], 1);
        assert_eq!(body["data"]["latest_configuration"][0]["nodeId"], 2);
    }

    #[tokio::test]
    async fn join_on_follower_fails() {
        let (app, _) = app(Role::Follower);
        let (status, _) = call(
            &app,
            post_json("/raft/join", json!({"nodeId": 2, "raftAddress": "127.0.0.1:7002"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn pass_leadership_on_leader() {
        let (app, consensus) = app(Role::Leader);
        let (status, body) = call(&app, get("/raft/pass_leadership")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "success transferring leader");
        assert_eq!(consensus.transfers(), 1);
    }

    #[tokio::test]
    async fn remove_member_on_leader() {
        let (app, _) = app(Role::Leader);
        let (status, body) = call(&app, post_json("/raft/remove", json!({"nodeId": 3}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "node 3 removed successfully");
    }
}
