//! Typed HTTP client for the SkyShift API server
//!
//! Routes mirror the server: global kinds live at `/{plural}`, namespaced
//! kinds at `/{namespace}/{plural}`, with `?watch=true` turning list/get
//! into an NDJSON event stream.

use serde::{Deserialize, Serialize};

use skyshift_common::object::{ApiObject, Kind, Object, ObjectList};
use skyshift_common::{Error, Result};

use crate::watch::{ndjson_events, ClientWatchStream};

/// Wire shape of API error bodies
#[derive(Debug, Deserialize, Serialize)]
pub struct ApiErrorBody {
    /// Error kind name (e.g. "Conflict")
    pub kind: String,
    /// Human-readable message
    pub error: String,
}

/// Response body of `POST /token` and invite issuance
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// The issued token
    pub token: String,
}

/// Request body of `POST /register_user`
#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Invite token; required unless the server is bootstrapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite: Option<String>,
}

/// Request body of `POST /token`
#[derive(Debug, Deserialize, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Request body of `POST /invite`
#[derive(Debug, Deserialize, Serialize)]
pub struct InviteRequest {
    /// Roles granted to whoever registers with this invite
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Request body of `POST /revoke_invite`
#[derive(Debug, Deserialize, Serialize)]
pub struct RevokeInviteRequest {
    pub token: String,
}

/// Client for one SkyShift API server, carrying one identity
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    /// Create an unauthenticated client (login/register only)
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Attach a bearer token and return self for chaining
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The server this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, kind: Kind, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if kind.namespaced() => {
                format!("{}/{}/{}", self.base_url, ns, kind.plural())
            }
            _ => format!("{}/{}", self.base_url, kind.plural()),
        }
    }

    fn object_url(&self, kind: Kind, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.collection_url(kind, namespace), name)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::transient("api-client", e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_api_error(status.as_u16(), &body))
    }

    async fn send_object(&self, builder: reqwest::RequestBuilder) -> Result<Object> {
        let response = self.send(builder).await?;
        response
            .json::<Object>()
            .await
            .map_err(|e| Error::transient("api-client", format!("decode response: {e}")))
    }

    /// Create an object
    pub async fn create(&self, obj: &Object) -> Result<Object> {
        let url = self.collection_url(obj.kind(), obj.namespace());
        self.send_object(self.request(reqwest::Method::POST, url).json(obj))
            .await
    }

    /// Replace an object; optimistic when it carries a resource version
    pub async fn update(&self, obj: &Object) -> Result<Object> {
        let url = self.collection_url(obj.kind(), obj.namespace());
        self.send_object(self.request(reqwest::Method::PUT, url).json(obj))
            .await
    }

    /// Fetch one object
    pub async fn get(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<Object> {
        let url = self.object_url(kind, namespace, name);
        self.send_object(self.request(reqwest::Method::GET, url)).await
    }

    /// Fetch one object, typed
    pub async fn get_as<T: ApiObject>(&self, namespace: Option<&str>, name: &str) -> Result<T> {
        T::try_from_object(self.get(T::KIND, namespace, name).await?)
    }

    /// List objects of a kind; `None` lists across all namespaces
    pub async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<ObjectList> {
        let url = self.collection_url(kind, namespace);
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        response
            .json::<ObjectList>()
            .await
            .map_err(|e| Error::transient("api-client", format!("decode list: {e}")))
    }

    /// Delete one object, returning its final state
    pub async fn delete(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<Object> {
        let url = self.object_url(kind, namespace, name);
        self.send_object(self.request(reqwest::Method::DELETE, url))
            .await
    }

    /// Open a watch stream over a kind.
    ///
    /// `from_version` is the inclusive resume point; without it the
    /// stream opens with the current state as ADD events.
    pub async fn watch(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        from_version: Option<i64>,
    ) -> Result<ClientWatchStream> {
        let mut url = format!("{}?watch=true", self.collection_url(kind, namespace));
        if let Some(from) = from_version {
            url.push_str(&format!("&from_version={from}"));
        }
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        Ok(ndjson_events(response))
    }

    /// Fetch aggregated logs for a job
    pub async fn job_logs(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let url = format!("{}/{}/jobs/{}/logs", self.base_url, namespace, name);
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| Error::transient("api-client", format!("decode logs: {e}")))
    }

    /// Log in, returning a session token
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenResponse> {
        let url = format!("{}/token", self.base_url);
        let response = self
            .send(self.request(reqwest::Method::POST, url).json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            }))
            .await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::transient("api-client", format!("decode token: {e}")))
    }

    /// Register a new user with an invite token
    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        let url = format!("{}/register_user", self.base_url);
        self.send(self.request(reqwest::Method::POST, url).json(request))
            .await?;
        Ok(())
    }

    /// Issue an invite granting the given roles
    pub async fn invite(&self, roles: Vec<String>) -> Result<TokenResponse> {
        let url = format!("{}/invite", self.base_url);
        let response = self
            .send(self.request(reqwest::Method::POST, url).json(&InviteRequest { roles }))
            .await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::transient("api-client", format!("decode invite: {e}")))
    }

    /// Revoke a previously issued invite
    pub async fn revoke_invite(&self, token: &str) -> Result<()> {
        let url = format!("{}/revoke_invite", self.base_url);
        self.send(self.request(reqwest::Method::POST, url).json(&RevokeInviteRequest {
            token: token.to_string(),
        }))
        .await?;
        Ok(())
    }
}

/// Map an HTTP error response back onto the error taxonomy
fn map_api_error(status: u16, body: &str) -> Error {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.to_string());
    match status {
        400 => Error::invalid("Object", message),
        401 | 403 => Error::unauthorized(message),
        404 => Error::not_found(message),
        409 => {
            // The server distinguishes create collisions from stale
            // versions in the error kind field.
            match serde_json::from_str::<ApiErrorBody>(body) {
                Ok(b) if b.kind == "AlreadyExists" => Error::already_exists(b.error),
                _ => Error::Conflict {
                    key: message,
                    expected: 0,
                },
            }
        }
        410 => Error::WatchGap {
            prefix: message,
            requested: 0,
        },
        422 => Error::unsupported("api", message),
        503 => Error::transient("api", message),
        _ => Error::fatal("api", format!("unexpected status {status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_urls() {
        let client = ApiClient::new("http://127.0.0.1:50051/");
        assert_eq!(
            client.collection_url(Kind::Cluster, None),
            "http://127.0.0.1:50051/clusters"
        );
        assert_eq!(
            client.collection_url(Kind::Job, Some("team-a")),
            "http://127.0.0.1:50051/team-a/jobs"
        );
        // Namespaced kind without a namespace lists across all namespaces.
        assert_eq!(
            client.collection_url(Kind::Job, None),
            "http://127.0.0.1:50051/jobs"
        );
    }

    #[test]
    fn test_error_mapping() {
        let conflict = map_api_error(
            409,
            r#"{"kind":"Conflict","error":"resource version 4 is outdated"}"#,
        );
        assert!(conflict.is_conflict());

        let exists = map_api_error(409, r#"{"kind":"AlreadyExists","error":"jobs/default/j1"}"#);
        assert!(matches!(exists, Error::AlreadyExists { .. }));

        assert!(!map_api_error(401, "denied").is_retryable());
        assert!(matches!(map_api_error(410, "gap"), Error::WatchGap { .. }));
        assert!(map_api_error(503, "busy").is_retryable());
    }
}
