//! Fake Google endpoints served by axum on ephemeral ports.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

pub const ACCEPTED_CODE: &str = "4/0AX4XfWaccepted";

pub async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[derive(Default)]
pub struct TokenServerState {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub forms: Mutex<Vec<Vec<(String, String)>>>,
}

async fn token(
    State(state): State<Arc<TokenServerState>>,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    let field = |key: &str| {
        form.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };
    state.forms.lock().unwrap().push(form.clone());

    match field("grant_type").as_str() {
        "authorization_code" if field("code") == ACCEPTED_CODE => {
            state.exchanges.fetch_add(1, Ordering::SeqCst);
            Json(json!({
                "access_token": "ya29.first",
                "refresh_token": "1//refresh",
                "expires_in": 3599,
                "scope": "https://www.googleapis.com/auth/calendar",
                "token_type": "Bearer"
            }))
            .into_response()
        }
        "refresh_token" if field("refresh_token") == "1//refresh" => {
            let n = state.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({
                "access_token": format!("ya29.refreshed-{n}"),
                "expires_in": 3599,
                "token_type": "Bearer"
            }))
            .into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant", "error_description": "Bad Request"})),
        )
            .into_response(),
    }
}

/// Token endpoint accepting [`ACCEPTED_CODE`] and the refresh token it hands out.
pub async fn token_server() -> (SocketAddr, Arc<TokenServerState>) {
    let state = Arc::new(TokenServerState::default());
    let app = Router::new()
        .route("/token", post(token))
        .with_state(state.clone());
    (spawn(app).await, state)
}

#[derive(Default)]
pub struct CalendarState {
    pub authorizations: Mutex<Vec<String>>,
    pub hits: AtomicUsize,
}

async fn events(State(state): State<Arc<CalendarState>>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.authorizations.lock().unwrap().push(auth.clone());
    if !auth.starts_with("Bearer ya29.") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": {"code": 401}}))).into_response();
    }
    Json(json!({
        "items": [{
            "id": "evt1",
            "summary": "Standup",
            "start": {"dateTime": "2024-05-01T09:00:00Z"},
            "end": {"dateTime": "2024-05-01T09:15:00Z"}
        }]
    }))
    .into_response()
}

/// Calendar API exposing only `GET /calendars/primary/events`.
pub async fn calendar_server() -> (SocketAddr, Arc<CalendarState>) {
    let state = Arc::new(CalendarState::default());
    let app = Router::new()
        .route("/calendars/primary/events", get(events))
        .with_state(state.clone());
    (spawn(app).await, state)
}
