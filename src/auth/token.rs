//! Bearer token verification against the user pool's published signing keys.

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::{RelayError, RelayResult};

/// Identity carried by a verified token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify signature, audience, issuer and expiry, returning the identity.
    async fn verify(&self, token: &str) -> RelayResult<Claims>;
}

/// Shortest gap between two key set fetches triggered by unknown `kid`s.
pub const MIN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Verifies RS256 tokens with keys looked up by `kid` in a cached JWKS.
///
/// The key set is fetched lazily and refreshed whenever a token names a key
/// that is not cached, which covers key rotation. Refreshes are at least
/// [`MIN_KEY_REFRESH_INTERVAL`] apart, so tokens with made-up `kid`s cannot
/// drive traffic to the key endpoint.
pub struct SessionAuthenticator {
    http: reqwest::Client,
    jwks_url: String,
    validation: Validation,
    keys: RwLock<JwkSet>,
    /// Time of the last fetch attempt; held while fetching
    last_refresh: Mutex<Option<Instant>>,
    min_refresh_interval: Duration,
}

impl SessionAuthenticator {
    pub fn new(config: &AuthConfig, http: reqwest::Client) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[config.client_id.as_str()]);
        validation.set_issuer(&[config.issuer()]);

        Self {
            http,
            jwks_url: config.jwks_url(),
            validation,
            keys: RwLock::new(JwkSet { keys: Vec::new() }),
            last_refresh: Mutex::new(None),
            min_refresh_interval: MIN_KEY_REFRESH_INTERVAL,
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    async fn refresh_keys(&self) -> RelayResult<()> {
        debug!(url = %self.jwks_url, "Fetching token signing keys");
        let response = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| RelayError::Authentication(format!("signing key fetch failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Authentication(format!(
                "signing key endpoint returned HTTP {}",
                status
            )));
        }

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| RelayError::Authentication(format!("invalid signing key set: {}", e)))?;

        info!(keys = set.keys.len(), "Token signing keys refreshed");
        *self.keys.write().await = set;
        Ok(())
    }

    async fn cached_key(&self, kid: &str) -> RelayResult<Option<DecodingKey>> {
        let keys = self.keys.read().await;
        keys.find(kid)
            .map(DecodingKey::from_jwk)
            .transpose()
            .map_err(|e| RelayError::Authentication(format!("unusable signing key {}: {}", kid, e)))
    }

    async fn decoding_key(&self, kid: &str) -> RelayResult<DecodingKey> {
        if let Some(key) = self.cached_key(kid).await? {
            return Ok(key);
        }

        let mut last_refresh = self.last_refresh.lock().await;
        // Another verification may have refreshed while we waited for the lock
        if let Some(key) = self.cached_key(kid).await? {
            return Ok(key);
        }
        match *last_refresh {
            Some(at) if at.elapsed() < self.min_refresh_interval => {
                warn!(kid, "Unknown signing key, refresh throttled");
            }
            _ => {
                *last_refresh = Some(Instant::now());
                self.refresh_keys().await?;
            }
        }
        drop(last_refresh);

        self.cached_key(kid)
            .await?
            .ok_or_else(|| RelayError::Authentication(format!("no signing key with kid {}", kid)))
    }
}

#[async_trait]
impl TokenVerifier for SessionAuthenticator {
    async fn verify(&self, token: &str) -> RelayResult<Claims> {
        let header = decode_header(token)
            .map_err(|e| RelayError::Authentication(format!("malformed token: {}", e)))?;
        let kid = header
            .kid
            .ok_or_else(|| RelayError::Authentication("token header has no kid".to_string()))?;

        let key = self.decoding_key(&kid).await?;
        let data = decode::<Claims>(token, &key, &self.validation)
            .map_err(|e| RelayError::Authentication(e.to_string()))?;

        debug!(sub = %data.claims.sub, "Token verified");
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SIGNING_KEY: &str = include_str!("test_signing_key.pem");
    const MODULUS: &str = "oLlcZQ7f_V8en6l-cZNDp9jvhEwvre_LWwbt35fZUAUJnouudCRiKmkYDqlzUI8aYrFxE126aeignQdp2j0zfxjgYaJnr_Im6Ocau4y9I9HWCEiJbztakuFNg9duf9HcgKhwoz9T_KCEQwy1pSE3mu9DuyJSj0CH_tEi9RhpsnBY31F7kQn6_BLPh2aueFIe2ypM94BbJth70IWo1Mosci9tvyE4YY6iO5vFT0S42CVSQ8Kja5xMq83ytS6oHbfBO25pmNtU3-2VX2-5Ag9YMLb7Gc2UWB9cm86PXvHDMdftMz_ndCgI9NDGHvxDyj9014lW9aOPr0pOOX1isgtHlw";
    const ISSUER: &str = "https://issuer.test/pool-1";
    const CLIENT_ID: &str = "client-123";

    fn authenticator(server: &MockServer) -> SessionAuthenticator {
        let mut config = AppConfig::default().auth;
        config.client_id = CLIENT_ID.to_string();
        config.issuer = Some(ISSUER.to_string());
        config.jwks_url = Some(format!("{}/jwks.json", server.uri()));
        SessionAuthenticator::new(&config, reqwest::Client::new())
            .with_min_refresh_interval(Duration::ZERO)
    }

    fn jwks() -> serde_json::Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "kid": "key-1",
                "use": "sig",
                "alg": "RS256",
                "n": MODULUS,
                "e": "AQAB"
            }]
        })
    }

    fn token(kid: Option<&str>, audience: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        let claims = json!({
            "sub": "user-1",
            "email": "student@example.com",
            "aud": audience,
            "iss": ISSUER,
            "exp": chrono::Utc::now().timestamp() + 3600,
        });
        let key = EncodingKey::from_rsa_pem(SIGNING_KEY.as_bytes()).unwrap();
        encode(&header, &claims, &key).unwrap()
    }

    async fn serve_jwks(server: &MockServer, fetches: u64) {
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks()))
            .expect(fetches)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_valid_token_and_cached_keys() {
        let server = MockServer::start().await;
        serve_jwks(&server, 1).await;
        let auth = authenticator(&server);
        let token = token(Some("key-1"), CLIENT_ID);

        let claims = auth.verify(&token).await.unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("student@example.com"));

        // Served from cache the second time
        assert!(auth.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let server = MockServer::start().await;
        serve_jwks(&server, 1).await;
        let auth = authenticator(&server);

        let result = auth.verify(&token(Some("key-1"), "someone-else")).await;
        assert!(matches!(result, Err(RelayError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_missing_kid_rejected_without_fetch() {
        let server = MockServer::start().await;
        serve_jwks(&server, 0).await;
        let auth = authenticator(&server);

        let result = auth.verify(&token(None, CLIENT_ID)).await;
        assert!(matches!(result, Err(RelayError::Authentication(msg)) if msg.contains("kid")));
        assert!(auth.verify("not-a-jwt").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_kid_refreshes_once_per_attempt() {
        let server = MockServer::start().await;
        serve_jwks(&server, 2).await;
        let auth = authenticator(&server);

        let rotated = token(Some("key-2"), CLIENT_ID);
        assert!(auth.verify(&rotated).await.is_err());
        assert!(auth.verify(&rotated).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_kid_refresh_is_throttled() {
        let server = MockServer::start().await;
        serve_jwks(&server, 1).await;
        let auth = authenticator(&server).with_min_refresh_interval(Duration::from_secs(3600));

        let forged = token(Some("made-up"), CLIENT_ID);
        for _ in 0..5 {
            assert!(matches!(auth.verify(&forged).await, Err(RelayError::Authentication(_))));
        }
        // Known keys still verify from the one cached fetch
        assert!(auth.verify(&token(Some("key-1"), CLIENT_ID)).await.is_ok());
    }

    #[tokio::test]
    async fn test_key_fetch_failure_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let auth = authenticator(&server);

        let result = auth.verify(&token(Some("key-1"), CLIENT_ID)).await;
        assert!(matches!(result, Err(RelayError::Authentication(msg)) if msg.contains("503")));
    }
}
