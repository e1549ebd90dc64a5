//! # Authentication
//!
//! - [`token`]: verifies the bearer token a browser presents
//! - [`credentials`]: exchanges that token for temporary cloud credentials
//!
//! Both sit behind traits so the WebSocket layer can be driven by test doubles.

pub mod credentials;
pub mod token;

use actix_web::{http::header::AUTHORIZATION, web, HttpRequest};
use std::collections::HashMap;

pub use credentials::{CognitoCredentialBroker, CredentialBroker, TemporaryCredentials};
pub use token::{Claims, SessionAuthenticator, TokenVerifier};

/// Extract a bearer token from the upgrade request.
///
/// Token sources, in priority order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `?token=<token>` query parameter (browsers cannot set WebSocket headers)
///
/// Returns `None` when neither is present; the client must then
/// authenticate with its first message.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    if let Some(value) = req.headers().get(AUTHORIZATION) {
        if let Some(token) = value.to_str().ok().and_then(|v| v.strip_prefix("Bearer ")) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|query| query.get("token").cloned())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_bearer_token_sources() {
        let req = TestRequest::default()
            .insert_header((AUTHORIZATION, "Bearer header-token"))
            .uri("/ws?token=query-token")
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("header-token"));

        let req = TestRequest::default().uri("/ws?token=query-token").to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("query-token"));

        let req = TestRequest::default()
            .insert_header((AUTHORIZATION, "Basic abc"))
            .uri("/ws")
            .to_http_request();
        assert_eq!(bearer_token(&req), None);

        let req = TestRequest::default().uri("/ws?token=").to_http_request();
        assert_eq!(bearer_token(&req), None);
    }
}
