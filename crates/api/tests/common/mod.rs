#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use relay_events::EventBus;
use relay_goofish::token::{AuthError, TokenSource};
use relay_goofish::transport::{ChatSocket, Connector, TransportError};
use relay_goofish::{AccountCredential, ClientManager, ConnectionConfig};
use serde_json::Value;
use tower::ServiceExt;

use relay_api::config::ServerConfig;
use relay_api::router::build_app_router;
use relay_api::state::AppState;
use relay_api::ws::WsManager;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:4200".to_string()],
        request_timeout_secs: 30,
        event_channel_capacity: 64,
        accounts_file: None,
        connection: ConnectionConfig::default(),
    }
}

/// Gateway that refuses every connection, so accounts never reach `Ready`.
pub struct UnreachableGateway;

#[async_trait]
impl Connector for UnreachableGateway {
    async fn connect(
        &self,
        _credential: &AccountCredential,
    ) -> Result<Box<dyn ChatSocket>, TransportError> {
        Err(TransportError::Connect("gateway unreachable".into()))
    }
}

pub struct StaticToken;

#[async_trait]
impl TokenSource for StaticToken {
    async fn fetch_token(&self, _credential: &AccountCredential) -> Result<String, AuthError> {
        Ok("test-token".into())
    }
}

/// Router plus the client manager behind it.
pub struct TestApp {
    pub router: Router,
    pub clients: Arc<ClientManager>,
}

/// Build the full application router through the same builder `main.rs`
/// uses, so tests exercise the production middleware stack.
pub fn build_test_app() -> TestApp {
    let config = test_config();
    let clients = ClientManager::new(
        config.connection.clone(),
        Arc::new(UnreachableGateway),
        Arc::new(StaticToken),
        Arc::new(EventBus::new(config.event_channel_capacity)),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        ws_manager: Arc::new(WsManager::new()),
        clients: Arc::clone(&clients),
    };

    TestApp {
        router: build_app_router(state, &config),
        clients,
    }
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty(), false).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty(), false).await
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    send(app, Method::POST, uri, Body::from(body.to_string()), true).await
}

async fn send(app: Router, method: Method, uri: &str, body: Body, json: bool) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if json {
        builder = builder.header("content-type", "application/json");
    }
    app.oneshot(builder.body(body).unwrap()).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Registration payload for a seller account.
pub fn account_body(account_id: &str) -> Value {
    serde_json::json!({ "cookies": format!("unb={account_id}; _m_h5_tk=abc_123") })
}
