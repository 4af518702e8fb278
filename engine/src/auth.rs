// HTTP Basic authentication for every route (API and dashboard alike).
//
// A single username/password pair comes from the config. Requests without a
// matching `Authorization: Basic ...` header get a 401 with a
// `WWW-Authenticate` challenge so browsers show their login prompt.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

const REALM: &str = "Basic realm=\"radiocontrol\", charset=\"UTF-8\"";

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check a raw `Authorization` header value.
    pub fn accepts(&self, header_value: &str) -> bool {
        // The scheme name is case-insensitive.
        let Some((scheme, encoded)) = header_value.trim_start().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return false;
        };
        // Evaluate both so a wrong username takes as long as a wrong password.
        let user_ok = same_bytes(user.as_bytes(), self.username.as_bytes());
        let pass_ok = same_bytes(pass.as_bytes(), self.password.as_bytes());
        user_ok & pass_ok
    }
}

fn same_bytes(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn require_basic_auth(
    State(creds): State<Arc<Credentials>>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| creds.accepts(v));

    if authorized {
        return next.run(req).await;
    }

    debug!("rejected unauthenticated request to {}", req.uri().path());
    let mut res = StatusCode::UNAUTHORIZED.into_response();
    res.headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
    res
}
