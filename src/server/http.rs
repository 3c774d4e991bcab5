//! HTTP endpoints: pages, authentication, profile management, and
//! matchmaking control.
//!
//! Every failure a client can see is `{success:false, message}` with the
//! status code from the error taxonomy; authentication failures stay
//! deliberately generic so usernames cannot be enumerated.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::App;
use crate::validate;

const GENERIC_AUTH_FAILURE: &str = "Invalid username or password";

/// Handler-level error: status code plus a user-visible message.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Not authenticated")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"success": false, "message": self.message})),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// Read one cookie value out of the request headers.
pub(super) fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if let Some((key, val)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(val.to_string());
                }
            }
        }
    }
    None
}

pub(super) struct Authed {
    pub session_id: String,
    pub username: String,
    pub user_id: i64,
}

/// Session-cookie authentication; bumps `last_active` on success.
pub(super) fn authenticate(app: &App, headers: &HeaderMap) -> Result<Authed, ApiError> {
    let session_id = cookie(headers, "session_id").ok_or_else(ApiError::unauthorized)?;
    if !validate::valid_input(&session_id) || !validate::valid_length(&session_id, 1, 128) {
        return Err(ApiError::unauthorized());
    }
    let session = app
        .sessions
        .get(&session_id)
        .ok_or_else(ApiError::unauthorized)?;
    app.sessions.touch(&session_id);
    Ok(Authed {
        session_id,
        username: session.username,
        user_id: session.user_id,
    })
}

/// Create a session and answer with the cookie plus a redirect target.
fn session_response(app: &App, user_id: i64, username: &str, addr: SocketAddr) -> ApiResult {
    let session_id = app
        .sessions
        .create(user_id, username, &addr.ip().to_string())
        .map_err(|e| {
            warn!(error = %e, "Session creation failed");
            ApiError::internal("Could not create session")
        })?;

    let mut cookie = format!(
        "session_id={session_id}; Path=/; HttpOnly; SameSite=Strict; Max-Age=3600"
    );
    if app.config.server.secure_cookies {
        cookie.push_str("; Secure");
    }

    Ok((
        [(SET_COOKIE, cookie)],
        Json(json!({
            "success": true,
            "message": "Login successful",
            "redirect": "/home",
        })),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

async fn serve_page(app: &App, name: &str) -> Response {
    if let Some(dir) = &app.config.server.frontend_dir {
        match tokio::fs::read_to_string(dir.join(name)).await {
            Ok(body) => Html(body).into_response(),
            Err(_) => ApiError::not_found(format!("Page not found: {name}")).into_response(),
        }
    } else {
        Html(format!(
            "<!doctype html><html><head><title>gambit</title></head><body><h1>gambit</h1><p>{name}</p></body></html>"
        ))
        .into_response()
    }
}

pub async fn index() -> Redirect {
    Redirect::to("/login")
}

pub async fn login_page(State(app): State<Arc<App>>) -> Response {
    serve_page(&app, "login.html").await
}

pub async fn register_page(State(app): State<Arc<App>>) -> Response {
    serve_page(&app, "register.html").await
}

pub async fn home_page(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
    match authenticate(&app, &headers) {
        Ok(_) => serve_page(&app, "home.html").await,
        Err(_) => Redirect::to("/login").into_response(),
    }
}

pub async fn stats_page(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
    match authenticate(&app, &headers) {
        Ok(_) => serve_page(&app, "stats.html").await,
        Err(_) => Redirect::to("/login").into_response(),
    }
}

pub async fn profile_page(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
    match authenticate(&app, &headers) {
        Ok(_) => serve_page(&app, "profile.html").await,
        Err(_) => Redirect::to("/login").into_response(),
    }
}

/// The game page is only reachable while the user is in an active game.
pub async fn game_page(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
    match authenticate(&app, &headers) {
        Ok(authed) if app.registry.user_in_game(authed.user_id) => {
            serve_page(&app, "game.html").await
        }
        Ok(_) => Redirect::to("/home").into_response(),
        Err(_) => Redirect::to("/login").into_response(),
    }
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("Page not found")
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

pub async fn login(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginRequest>,
) -> ApiResult {
    if body.username.is_empty() || body.password.is_empty() {
        return Err(ApiError::bad_request("Missing credentials"));
    }
    if !validate::valid_username(&body.username) || !validate::valid_length(&body.username, 1, 128)
    {
        return Err(ApiError::bad_request("Invalid username format"));
    }
    if !validate::valid_input(&body.password) || !validate::valid_length(&body.password, 1, 128) {
        return Err(ApiError::bad_request("Invalid password format"));
    }

    let credentials = app.users.credentials(&body.username).map_err(|e| {
        warn!(error = %e, "Credential lookup failed");
        ApiError::internal("Server error")
    })?;
    let Some(credentials) = credentials else {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, GENERIC_AUTH_FAILURE));
    };
    if !crate::auth::verify_password(&body.password, &credentials.password_hash) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, GENERIC_AUTH_FAILURE));
    }

    session_response(&app, credentials.user_id, &body.username, addr)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    confirm_password: String,
}

pub async fn register(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult {
    if body.username.is_empty() || body.password.is_empty() || body.confirm_password.is_empty() {
        return Err(ApiError::bad_request("Missing required fields"));
    }
    if body.password != body.confirm_password {
        return Err(ApiError::bad_request("Passwords do not match"));
    }
    if !validate::valid_username(&body.username) {
        return Err(ApiError::bad_request("Username contains invalid characters"));
    }
    if !validate::valid_length(&body.username, 3, 20) {
        return Err(ApiError::bad_request(
            "Username must be between 3 and 20 characters",
        ));
    }
    if !validate::valid_length(&body.password, 12, 128) {
        return Err(ApiError::bad_request("Password must be at least 12 characters"));
    }
    if !validate::valid_input(&body.password) {
        return Err(ApiError::bad_request("Password contains invalid characters"));
    }

    let user_id = app
        .users
        .create(&body.username, &body.password)
        .map_err(|e| {
            warn!(error = %e, "User creation failed");
            ApiError::internal("Could not create new user")
        })?;
    let Some(user_id) = user_id else {
        return Err(ApiError::conflict("Username already exists"));
    };

    session_response(&app, user_id, &body.username, addr)
}

pub async fn session_info(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let authed = authenticate(&app, &headers)?;
    let stats = app
        .users
        .stats(authed.user_id)
        .map_err(|e| {
            warn!(error = %e, "Stats lookup failed");
            ApiError::internal("Server error")
        })?
        .ok_or_else(|| ApiError::not_found("Stats not found"))?;

    Ok(Json(json!({
        "success": true,
        "username": authed.username,
        "elo": stats.elo,
    }))
    .into_response())
}

pub async fn logout(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    if let Some(session_id) = cookie(&headers, "session_id") {
        if validate::valid_input(&session_id) {
            app.sessions.delete(&session_id);
        }
    }
    Ok(Json(json!({"success": true, "message": "Logged out successfully"})).into_response())
}

// ---------------------------------------------------------------------------
// Matchmaking control
// ---------------------------------------------------------------------------

pub async fn search(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let authed = authenticate(&app, &headers)?;

    if app.registry.user_in_game(authed.user_id) {
        return Err(ApiError::conflict("Already in an active game"));
    }
    if !app
        .matchmaking
        .enqueue(authed.user_id, &authed.username, &authed.session_id)
    {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Matchmaking queue is full",
        ));
    }

    Ok(Json(json!({"success": true, "message": "Searching for opponent..."})).into_response())
}

pub async fn cancel_search(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let authed = authenticate(&app, &headers)?;

    if app.matchmaking.cancel(&authed.session_id) {
        Ok(Json(json!({"success": true, "message": "Search cancelled"})).into_response())
    } else {
        Err(ApiError::not_found("Not currently searching"))
    }
}

// ---------------------------------------------------------------------------
// Stats and profile
// ---------------------------------------------------------------------------

pub async fn stats(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult {
    let authed = authenticate(&app, &headers)?;
    let stats = app
        .users
        .stats(authed.user_id)
        .map_err(|e| {
            warn!(error = %e, "Stats lookup failed");
            ApiError::internal("Server error")
        })?
        .ok_or_else(|| ApiError::not_found("Stats not found"))?;

    Ok(Json(json!({
        "success": true,
        "elo": stats.elo,
        "wins": stats.wins,
        "draws": stats.draws,
        "losses": stats.losses,
        "join_date": stats.join_date,
        "last_game": stats.last_game,
    }))
    .into_response())
}

/// Verify the caller's password against the users table.
fn verify_current_password(app: &App, username: &str, password: &str) -> Result<i64, ApiError> {
    let credentials = app
        .users
        .credentials(username)
        .map_err(|e| {
            warn!(error = %e, "Credential lookup failed");
            ApiError::internal("Server error")
        })?
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, GENERIC_AUTH_FAILURE))?;
    if !crate::auth::verify_password(password, &credentials.password_hash) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, GENERIC_AUTH_FAILURE));
    }
    Ok(credentials.user_id)
}

#[derive(Debug, Deserialize)]
pub struct UpdateUsernameRequest {
    #[serde(default)]
    new_username: String,
    #[serde(default)]
    password: String,
}

pub async fn update_username(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<UpdateUsernameRequest>,
) -> ApiResult {
    let authed = authenticate(&app, &headers)?;

    if body.new_username.is_empty() || body.password.is_empty() {
        return Err(ApiError::bad_request("Missing credentials"));
    }
    if !validate::valid_username(&body.new_username) {
        return Err(ApiError::bad_request("Username contains invalid characters"));
    }
    if !validate::valid_length(&body.new_username, 3, 20) {
        return Err(ApiError::bad_request(
            "Username must be between 3 and 20 characters",
        ));
    }
    if !validate::valid_input(&body.password) {
        return Err(ApiError::bad_request("Invalid password"));
    }

    verify_current_password(&app, &authed.username, &body.password)?;

    let renamed = app
        .users
        .rename(authed.user_id, &body.new_username)
        .map_err(|e| {
            warn!(error = %e, "Username update failed");
            ApiError::internal("Server error")
        })?;
    if !renamed {
        return Err(ApiError::conflict("Username already exists"));
    }

    // Every live session must report the new name on its next lookup.
    app.sessions.rename_user(authed.user_id, &body.new_username);
    app.sessions.touch(&authed.session_id);

    Ok(Json(json!({"success": true, "message": "Username updated successfully"})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    #[serde(default)]
    current_password: String,
    #[serde(default)]
    new_password: String,
    #[serde(default)]
    confirm_password: String,
}

pub async fn update_password(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<UpdatePasswordRequest>,
) -> ApiResult {
    let authed = authenticate(&app, &headers)?;

    if body.current_password.is_empty() || body.new_password.is_empty() {
        return Err(ApiError::bad_request("Current and new passwords are required"));
    }
    if body.new_password != body.confirm_password {
        return Err(ApiError::bad_request("Passwords don't match"));
    }
    if !validate::valid_length(&body.new_password, 12, 128) {
        return Err(ApiError::bad_request(
            "New password must be at least 12 characters",
        ));
    }
    if !validate::valid_input(&body.new_password) {
        return Err(ApiError::bad_request("Password contains invalid characters"));
    }

    verify_current_password(&app, &authed.username, &body.current_password)?;

    let updated = app
        .users
        .update_password(authed.user_id, &body.new_password)
        .map_err(|e| {
            warn!(error = %e, "Password update failed");
            ApiError::internal("Failed to update password")
        })?;
    if !updated {
        return Err(ApiError::internal("Failed to update password"));
    }

    // Log out every other session; the one making the change stays live.
    for session_id in app.sessions.user_sessions(authed.user_id) {
        if session_id != authed.session_id {
            app.sessions.delete(&session_id);
        }
    }
    app.sessions.touch(&authed.session_id);

    Ok(Json(json!({"success": true, "message": "Password updated successfully"})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    #[serde(default)]
    password: String,
}

pub async fn delete_account(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<DeleteAccountRequest>,
) -> ApiResult {
    let authed = authenticate(&app, &headers)?;

    if body.password.is_empty() {
        return Err(ApiError::bad_request("Password is required for confirmation"));
    }
    if !validate::valid_input(&body.password) {
        return Err(ApiError::bad_request("Invalid password"));
    }

    verify_current_password(&app, &authed.username, &body.password)?;

    let deleted = app.users.delete(authed.user_id).map_err(|e| {
        warn!(error = %e, "Account deletion failed");
        ApiError::internal("Failed to delete account")
    })?;
    if !deleted {
        return Err(ApiError::internal("Failed to delete account"));
    }

    app.sessions.logout_all(authed.user_id);

    Ok(Json(json!({"success": true, "message": "Account deleted successfully"})).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_parses_multi_pair_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; session_id=abc123; lang=en"),
        );
        assert_eq!(cookie(&headers, "session_id").as_deref(), Some("abc123"));
        assert_eq!(cookie(&headers, "theme").as_deref(), Some("dark"));
        assert_eq!(cookie(&headers, "missing"), None);
    }

    #[test]
    fn cookie_handles_absent_header() {
        let headers = HeaderMap::new();
        assert_eq!(cookie(&headers, "session_id"), None);
    }
}
