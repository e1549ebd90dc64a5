//! Exchange of a verified bearer token for short-lived cloud credentials.
//!
//! The identity pool is called over its JSON API: `GetId` resolves the
//! identity for the token, `GetCredentialsForIdentity` issues the keys. Both
//! calls present the token as the login for the user-pool provider.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::error::{RelayError, RelayResult};

const GET_ID_TARGET: &str = "AWSCognitoIdentityService.GetId";
const GET_CREDENTIALS_TARGET: &str = "AWSCognitoIdentityService.GetCredentialsForIdentity";
const AMZ_JSON: &str = "application/x-amz-json-1.1";

/// Temporary credentials handed to the voice process.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_key: String,
    pub session_token: String,
}

#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn exchange(&self, token: &str) -> RelayResult<TemporaryCredentials>;
}

pub struct CognitoCredentialBroker {
    http: reqwest::Client,
    endpoint: String,
    identity_pool_id: String,
    login_provider: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetIdResponse {
    identity_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetCredentialsResponse {
    credentials: CredentialsPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialsPayload {
    access_key_id: String,
    secret_key: String,
    session_token: String,
}

impl CognitoCredentialBroker {
    pub fn new(config: &AuthConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: config.identity_endpoint(),
            identity_pool_id: config.identity_pool_id.clone(),
            login_provider: config.login_provider(),
        }
    }

    fn logins(&self, token: &str) -> Value {
        let mut logins = serde_json::Map::new();
        logins.insert(self.login_provider.clone(), Value::String(token.to_string()));
        Value::Object(logins)
    }

    async fn call<T: DeserializeOwned>(&self, target: &str, body: Value) -> RelayResult<T> {
        debug!(target, "Calling identity pool");
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Amz-Target", target)
            .header(CONTENT_TYPE, AMZ_JSON)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| RelayError::CredentialExchange(format!("{}: {}", target, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RelayError::CredentialExchange(format!(
                "{} returned HTTP {}: {}",
                target, status, detail
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RelayError::CredentialExchange(format!("{} response: {}", target, e)))
    }
}

#[async_trait]
impl CredentialBroker for CognitoCredentialBroker {
    async fn exchange(&self, token: &str) -> RelayResult<TemporaryCredentials> {
        let identity: GetIdResponse = self
            .call(
                GET_ID_TARGET,
                json!({
                    "IdentityPoolId": self.identity_pool_id,
                    "Logins": self.logins(token),
                }),
            )
            .await?;

        let issued: GetCredentialsResponse = self
            .call(
                GET_CREDENTIALS_TARGET,
                json!({
                    "IdentityId": identity.identity_id,
                    "Logins": self.logins(token),
                }),
            )
            .await?;

        info!(identity_id = %identity.identity_id, "Temporary credentials issued");
        Ok(TemporaryCredentials {
            access_key_id: issued.credentials.access_key_id,
            secret_key: issued.credentials.secret_key,
            session_token: issued.credentials.session_token,
        })
    }
}
