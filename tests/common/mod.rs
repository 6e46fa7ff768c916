#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, header},
};
use bucketgate::{AppServices, AuthMode, Credentials, ServerConfig, create_app};
use serde_json::Value;
use tower::ServiceExt;

pub const USERNAME: &str = "operator";
pub const PASSWORD: &str = "correct horse battery staple";
pub const JWT_SECRET: &[u8] = b"test-jwt-secret-that-is-long-enough";

/// Peer address attached to every test request.
pub fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}

/// Config with local sign-in enabled.
pub fn local_config() -> ServerConfig {
    ServerConfig {
        auth: AuthMode::Local(Credentials {
            username: USERNAME.to_string(),
            password: PASSWORD.to_string(),
        }),
        jwt_secret: Some(JWT_SECRET.to_vec()),
        allowed_locations: vec!["eu-west".to_string()],
        ..ServerConfig::default()
    }
}

/// Config with authentication disabled.
pub fn disabled_config() -> ServerConfig {
    ServerConfig {
        auth: AuthMode::Disabled,
        jwt_secret: Some(JWT_SECRET.to_vec()),
        ..ServerConfig::default()
    }
}

pub struct TestApp {
    pub app: Router,
    pub services: AppServices,
}

impl TestApp {
    pub fn new(config: ServerConfig) -> Self {
        let services = AppServices::new(&config).unwrap();
        let app = create_app(&config, &services);
        Self { app, services }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Sign in with the test account. Returns (token, cookie header value).
    pub async fn login(&self) -> (String, String) {
        let response = self
            .send(json_request(
                "POST",
                "/api/auth/login",
                serde_json::json!({ "username": USERNAME, "password": PASSWORD }),
            ))
            .await;
        assert_eq!(response.status(), 200);

        let cookie = session_cookie_pair(&response).expect("login should set a cookie");
        let body = body_json(response).await;
        let token = body["token"].as_str().unwrap().to_string();
        (token, cookie)
    }

    /// Issue a ticket using the given cookie. Returns the response body.
    pub async fn issue_ticket(&self, cookie: &str, resource: &str, resource_type: &str) -> Value {
        let response = self
            .send(
                request("POST", "/api/tickets")
                    .header(header::COOKIE, cookie)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "resource": resource,
                            "resource_type": resource_type,
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), 201);
        body_json(response).await
    }
}

/// Request builder with a peer address, as the real server would attach.
pub fn request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(peer()))
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    request(method, uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    request("GET", uri).body(Body::empty()).unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// `name=value` part of the session Set-Cookie header.
pub fn session_cookie_pair(response: &Response<Body>) -> Option<String> {
    let set_cookie = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
    set_cookie.split(';').next().map(|pair| pair.to_string())
}

/// Read the SSE body, failing the test if it does not end in time.
pub async fn read_stream(response: Response<Body>) -> String {
    let bytes = tokio::time::timeout(Duration::from_secs(5), body_bytes(response))
        .await
        .expect("stream should end");
    String::from_utf8(bytes).unwrap()
}
