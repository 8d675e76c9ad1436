use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::handler::{self, ApiDoc};
use crate::api::state::AppState;
use crate::config::ServerConfig;
use crate::utils::signal::terminate;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("忽略无效的 CORS 来源: {}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let conversation = Router::new()
        .route("/create", post(handler::create_conversation))
        .route("/chat", post(handler::chat))
        .route("/history", post(handler::get_history))
        .route("/get", post(handler::get_conversation))
        .route("/get-all", post(handler::get_all_conversations))
        .route("/get-all-ids", post(handler::get_all_conversation_ids))
        .route("/rename", post(handler::rename_conversation))
        .route("/autorename", post(handler::auto_rename_conversation))
        .route("/end", post(handler::end_conversation))
        .route("/load-knowledge-base", post(handler::load_knowledge_base));

    Router::new()
        .route("/v1/ping", get(handler::ping))
        .route("/v1/health", get(handler::health))
        .route("/v1/llm/prompt", post(handler::llm_prompt))
        .nest("/v1/{domain}", conversation)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(Extension(state))
        .layer(cors_layer(cors_origins))
}

/// 启动 HTTP 服务，收到退出信号后停止接受新连接并等待进行中的请求完成
pub async fn http_server(state: Arc<AppState>, server: &ServerConfig) -> Result<()> {
    let app = router(state, &server.cors_origins);
    let listener = tokio::net::TcpListener::bind(&server.bind_address)
        .await
        .with_context(|| format!("绑定地址 {} 失败", server.bind_address))?;
    info!("开始监听 http://{}，接口文档位于 /swagger-ui", server.bind_address);
    axum::serve(listener, app)
        .with_graceful_shutdown(terminate())
        .await
        .context("HTTP 服务异常退出")?;
    info!("HTTP 服务已停止");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::api::state::tests::test_state;

    async fn test_app(fail: bool) -> Router {
        router(test_state(fail).await, &[])
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, text) = send(app, request).await;
        (status, serde_json::from_str(&text).unwrap())
    }

    async fn create(app: &Router, user_name: &str) -> i64 {
        let (status, body) = post_json(app, "/v1/pdf/create", json!({ "user_name": user_name })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["chat_history"], json!([]));
        body["data"]["conversation_id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_create_chat_and_history() {
        let app = test_app(false).await;
        let id = create(&app, "alice").await;

        let (status, body) = post_json(
            &app,
            "/v1/pdf/chat",
            json!({ "conversation_id": id, "message": "What is Rust?", "stream": false }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status_code"], 200);
        assert_eq!(body["data"]["response"], "Hello");

        let (_, body) = post_json(&app, "/v1/pdf/history", json!({ "conversation_id": id })).await;
        let history = body["data"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[1]["content"], "Hello");

        let (_, body) = post_json(&app, "/v1/pdf/get-all-ids", json!({ "user_name": "alice" })).await;
        assert_eq!(body["data"], json!([id]));
        // 对话按知识库隔离
        let (_, body) = post_json(&app, "/v1/website/get-all-ids", json!({ "user_name": "alice" })).await;
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_stream_chat_emits_deltas_then_done() {
        let app = test_app(false).await;
        let id = create(&app, "bob").await;

        let request = Request::post("/v1/pdf/chat")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "conversation_id": id, "message": "hi" }).to_string()))
            .unwrap();
        let (status, text) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let hel = text.find("data: Hel").unwrap();
        let lo = text.find("data: lo").unwrap();
        let done = text.find("event: done").unwrap();
        assert!(hel < lo && lo < done);
        assert!(!text.contains("event: error"));

        let (_, body) = post_json(&app, "/v1/pdf/get", json!({ "conversation_id": id })).await;
        assert_eq!(body["data"]["history"][1]["content"], "Hello");
    }

    #[tokio::test]
    async fn test_failed_turn_returns_error_body() {
        let app = test_app(true).await;
        let id = create(&app, "carol").await;

        let (status, body) = post_json(
            &app,
            "/v1/pdf/chat",
            json!({ "conversation_id": id, "message": "hi", "stream": false }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["data"]["conversation_id"], id);
        assert_eq!(body["data"]["response"], Value::Null);
        assert!(body["data"]["error"].as_str().unwrap().contains("503"));

        let request = Request::post("/v1/pdf/chat")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "conversation_id": id, "message": "again" }).to_string()))
            .unwrap();
        let (_, text) = send(&app, request).await;
        assert!(text.contains("event: error"));
        assert!(!text.contains("event: done"));
    }

    #[tokio::test]
    async fn test_missing_conversation_and_mode_mismatch() {
        let app = test_app(false).await;
        let id = create(&app, "dave").await;

        let (status, body) = post_json(&app, "/v1/pdf/history", json!({ "conversation_id": 999 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));

        let (_, body) = post_json(&app, "/v1/pdf/get", json!({ "conversation_id": 999 })).await;
        assert_eq!(body["data"], Value::Null);

        let (status, _) = post_json(
            &app,
            "/v1/pdf/chat",
            json!({ "conversation_id": 999, "message": "hi", "stream": false }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post_json(
            &app,
            "/v1/pdf/chat",
            json!({ "conversation_id": id, "message": "hi", "stream": false, "mode": "AUTO" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rename_end_and_chat_after_end() {
        let app = test_app(false).await;
        let id = create(&app, "erin").await;

        let (_, body) = post_json(&app, "/v1/pdf/rename", json!({ "conversation_id": id, "name": "Rust" })).await;
        assert_eq!(body["data"]["name"], "Rust");

        let (status, body) = post_json(&app, "/v1/pdf/end", json!({ "conversation_id": id })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "Rust");
        assert!(body["data"]["ended_at"].is_string());

        let (status, _) = post_json(
            &app,
            "/v1/pdf/chat",
            json!({ "conversation_id": id, "message": "hi", "stream": false }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_load_knowledge_base() {
        let app = test_app(false).await;

        let request = Request::post("/v1/arxiv/load-knowledge-base").body(Body::empty()).unwrap();
        let (status, text) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["data"]["documents"], 2);
        assert_eq!(body["data"]["skipped"], false);

        let (_, body) = post_json(&app, "/v1/arxiv/load-knowledge-base", json!({ "recreate": false })).await;
        assert_eq!(body["data"]["skipped"], true);

        let request = Request::post("/v1/arxiv/load-knowledge-base").body(Body::from("{")).unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, text) = send(&app, Request::get("/v1/health").body(Body::empty()).unwrap()).await;
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["data"]["database"], true);
        assert_eq!(body["data"]["knowledge"][1], json!({ "corpus": "arxiv", "state": "loaded" }));
    }

    #[tokio::test]
    async fn test_ping_and_openapi() {
        let app = test_app(false).await;
        let (status, text) = send(&app, Request::get("/v1/ping").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["data"]["status"], "success");

        let (status, text) = send(&app, Request::get("/api-docs/openapi.json").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("/v1/{domain}/chat"));
    }
}
