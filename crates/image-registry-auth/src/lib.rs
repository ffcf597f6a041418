//! Entry points that let an image registry authenticate its clients against
//! `ImageRegistryAccount`s: an HTTP service for token servers and a CLI for
//! exec based auth plugins.

use std::{io::Write, process::ExitCode, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use image_registry_operator::{auth::Authenticator, store::Store};
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;

pub const AUTH_PATH: &str = "/auth";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serve HTTP requests"))]
    Serve { source: std::io::Error },
}

/// Builds the routes of the auth service.
pub fn router<S: Store>(authenticator: Arc<Authenticator<S>>) -> Router {
    Router::new()
        .route(AUTH_PATH, get(authenticate::<S>))
        .with_state(authenticator)
        .route(HEALTH_PATH, get(|| async { "OK" }))
}

/// Serves `router` on `listener` until `shutdown` completes.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context(ServeSnafu)
}

async fn authenticate<S: Store>(
    State(authenticator): State<Arc<Authenticator<S>>>,
    headers: HeaderMap,
) -> Response {
    let Some((username, password)) = basic_credentials(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({}))).into_response();
    };

    match authenticator.authenticate(&username, &password).await {
        Some(labels) => (StatusCode::OK, Json(labels)).into_response(),
        None => (StatusCode::FORBIDDEN, Json(serde_json::json!({}))).into_response(),
    }
}

/// Extracts username and password from an `Authorization: Basic` header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

/// Process exit codes of the authentication CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthnExit {
    /// The labels of the account were printed to stdout.
    Success,
    Usage,
    /// The Kubernetes client could not be set up or the lookup failed.
    Setup,
    InvalidCredentials,
}

impl AuthnExit {
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Usage => 1,
            Self::Setup => 2,
            Self::InvalidCredentials => 3,
        }
    }
}

impl From<AuthnExit> for ExitCode {
    fn from(value: AuthnExit) -> Self {
        Self::from(value.code())
    }
}

/// Authenticates once and reports the result the way exec based registry
/// auth plugins expect it.
pub async fn run_authn<S: Store>(
    authenticator: &Authenticator<S>,
    username: &str,
    password: &str,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> AuthnExit {
    // Nothing sensible is left to do if stderr cannot be written to
    let labels = match authenticator.try_authenticate(username, password).await {
        Ok(Some(labels)) => labels,
        Ok(None) => {
            let _ = writeln!(stderr, "invalid credentials provided");
            return AuthnExit::InvalidCredentials;
        }
        Err(error) => {
            let _ = writeln!(stderr, "authn error: {}", snafu::Report::from_error(error));
            return AuthnExit::Setup;
        }
    };

    match serde_json::to_string(&labels) {
        Ok(json) if writeln!(stdout, "{json}").is_ok() => AuthnExit::Success,
        _ => {
            let _ = writeln!(stderr, "failed to write labels");
            AuthnExit::Setup
        }
    }
}
