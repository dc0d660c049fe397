//! Generic per-kind handlers
//!
//! Request flow: authenticate (bearer token, via the `AuthUser`
//! extractor) → authorize → decode + validate → store operation → encode
//! response. WATCH turns the response into a lazy NDJSON stream that
//! stays open until either side closes.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use tracing::warn;

use skyshift_common::object::{Action, Kind, Object, ObjectList};
use skyshift_common::Error;
use skyshift_store::ObjectWatchStream;

use crate::auth::AuthUser;
use crate::authorize::authorize;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Query parameters accepted on GET endpoints
#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    /// Turn the response into a watch stream
    #[serde(default)]
    pub watch: bool,
    /// Inclusive resume point for the watch stream
    #[serde(default)]
    pub from_version: Option<i64>,
}

/// Decode a JSON or YAML request body into a validated object of `kind`.
///
/// When the route carries a namespace it is injected into the object (or
/// checked against it when both are present).
fn decode_body(
    kind: Kind,
    namespace: Option<&str>,
    headers: &HeaderMap,
    body: &Bytes,
) -> ApiResult<Object> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    let mut obj: Object = if content_type.starts_with("application/yaml")
        || content_type.starts_with("text/yaml")
    {
        serde_yaml::from_slice(body)
            .map_err(|e| ApiError(Error::invalid(kind.as_str(), e.to_string())))?
    } else if content_type.starts_with("application/json") {
        serde_json::from_slice(body)
            .map_err(|e| ApiError(Error::invalid(kind.as_str(), e.to_string())))?
    } else {
        return Err(ApiError(Error::invalid(
            kind.as_str(),
            format!("unsupported content type: {content_type}"),
        )));
    };

    if obj.kind() != kind {
        return Err(ApiError(Error::invalid(
            kind.as_str(),
            format!("body is a {}, endpoint expects {}", obj.kind(), kind),
        )));
    }

    if let Some(ns) = namespace {
        match obj.namespace() {
            None => obj.metadata_mut().namespace = Some(ns.to_string()),
            Some(own) if own != ns => {
                return Err(ApiError(Error::invalid_field(
                    kind.as_str(),
                    "metadata.namespace",
                    format!("body namespace '{own}' does not match path namespace '{ns}'"),
                )))
            }
            Some(_) => {}
        }
    }

    obj.normalize();
    obj.validate().map_err(ApiError)?;
    Ok(obj)
}

/// `POST /{ns?}/{plural}`: create an object
pub async fn create_object(
    kind: Kind,
    namespace: Option<String>,
    state: AppState,
    auth: AuthUser,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Object>> {
    let obj = decode_body(kind, namespace.as_deref(), &headers, &body)?;
    authorize(
        &state.store,
        &auth.username,
        Action::Create,
        kind,
        obj.namespace(),
    )
    .await?;
    let created = state.store.create(obj).await?;
    Ok(Json(created))
}

/// `PUT /{ns?}/{plural}`: replace an object
pub async fn update_object(
    kind: Kind,
    namespace: Option<String>,
    state: AppState,
    auth: AuthUser,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Object>> {
    let obj = decode_body(kind, namespace.as_deref(), &headers, &body)?;
    authorize(
        &state.store,
        &auth.username,
        Action::Update,
        kind,
        obj.namespace(),
    )
    .await?;
    let updated = state.store.update(obj).await?;
    Ok(Json(updated))
}

/// `GET /{ns?}/{plural}`: list, or watch when `?watch=true`
pub async fn list_objects(
    kind: Kind,
    namespace: Option<String>,
    state: AppState,
    auth: AuthUser,
    query: WatchQuery,
) -> ApiResult<Response> {
    let action = if query.watch { Action::Watch } else { Action::List };
    authorize(&state.store, &auth.username, action, kind, namespace.as_deref()).await?;

    if query.watch {
        let stream = state
            .store
            .watch(kind, namespace.as_deref(), query.from_version)
            .await?;
        return Ok(watch_response(stream));
    }

    let (objects, version) = state
        .store
        .list_and_version(kind, namespace.as_deref())
        .await?;
    let list = ObjectList::new(kind, objects).at_version(version);
    Ok(json_response(&list)?)
}

/// `GET /{ns?}/{plural}/{name}`: fetch one object, or watch just it
pub async fn get_object(
    kind: Kind,
    namespace: Option<String>,
    name: String,
    state: AppState,
    auth: AuthUser,
    query: WatchQuery,
) -> ApiResult<Response> {
    let action = if query.watch { Action::Watch } else { Action::Get };
    authorize(&state.store, &auth.username, action, kind, namespace.as_deref()).await?;

    if query.watch {
        let stream = state
            .store
            .watch(kind, namespace.as_deref(), query.from_version)
            .await?;
        let filtered: ObjectWatchStream = Box::pin(stream.filter(move |item| {
            let keep = match item {
                Ok(event) => event.object.name() == name,
                Err(_) => true,
            };
            async move { keep }
        }));
        return Ok(watch_response(filtered));
    }

    let obj = state.store.get(kind, namespace.as_deref(), &name).await?;
    Ok(json_response(&obj)?)
}

/// `DELETE /{ns?}/{plural}/{name}`: delete an object (cascading for
/// namespaces)
pub async fn delete_object(
    kind: Kind,
    namespace: Option<String>,
    name: String,
    state: AppState,
    auth: AuthUser,
) -> ApiResult<Json<Object>> {
    authorize(
        &state.store,
        &auth.username,
        Action::Delete,
        kind,
        namespace.as_deref(),
    )
    .await?;
    let deleted = state.store.delete(kind, namespace.as_deref(), &name).await?;
    Ok(Json(deleted))
}

/// `PATCH /{ns?}/{plural}/{name}`: RFC 6902 JSON Patch against the
/// stored object, revalidated through the single decode point
pub async fn patch_object(
    kind: Kind,
    namespace: Option<String>,
    name: String,
    state: AppState,
    auth: AuthUser,
    body: Bytes,
) -> ApiResult<Json<Object>> {
    authorize(
        &state.store,
        &auth.username,
        Action::Update,
        kind,
        namespace.as_deref(),
    )
    .await?;

    let patch: json_patch::Patch = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::invalid(kind.as_str(), format!("invalid patch list: {e}"))))?;

    let current = state.store.get(kind, namespace.as_deref(), &name).await?;
    let version = current.metadata().resource_version;
    let mut value = serde_json::to_value(&current)
        .map_err(|e| ApiError(Error::fatal("api", e.to_string())))?;
    json_patch::patch(&mut value, &patch)
        .map_err(|e| ApiError(Error::invalid(kind.as_str(), format!("patch failed: {e}"))))?;

    let mut patched: Object = serde_json::from_value(value)
        .map_err(|e| ApiError(Error::invalid(kind.as_str(), e.to_string())))?;
    patched.validate().map_err(ApiError)?;
    // The patch applies to exactly the version that was read.
    patched.metadata_mut().resource_version = version;
    let updated = state.store.update(patched).await?;
    Ok(Json(updated))
}

/// Serialize a value as a JSON response
fn json_response<T: serde::Serialize>(value: &T) -> ApiResult<Response> {
    let body = serde_json::to_vec(value).map_err(|e| ApiError(Error::fatal("api", e.to_string())))?;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| ApiError(Error::fatal("api", e.to_string())))
}

/// Wrap a watch stream as an NDJSON response. The stream ends when the
/// consumer disconnects, the store drops a lagging consumer, or the
/// server shuts down.
fn watch_response(stream: ObjectWatchStream) -> Response {
    let lines = stream.map(|item| match item {
        Ok(event) => {
            let mut line = serde_json::to_vec(&event).unwrap_or_default();
            line.push(b'\n');
            Ok(line)
        }
        Err(err) => {
            warn!(error = %err, "terminating watch stream");
            Err(std::io::Error::other(err.to_string()))
        }
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .expect("static response build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_body_injects_path_namespace() {
        let body = Bytes::from_static(br#"{"kind":"Job","metadata":{"name":"j1"}}"#);
        let obj = decode_body(Kind::Job, Some("team-a"), &HeaderMap::new(), &body).unwrap();
        assert_eq!(obj.namespace(), Some("team-a"));
    }

    #[test]
    fn test_decode_body_rejects_namespace_mismatch() {
        let body =
            Bytes::from_static(br#"{"kind":"Job","metadata":{"name":"j1","namespace":"team-b"}}"#);
        assert!(decode_body(Kind::Job, Some("team-a"), &HeaderMap::new(), &body).is_err());
    }

    #[test]
    fn test_decode_body_rejects_kind_mismatch() {
        let body = Bytes::from_static(br#"{"kind":"Cluster","metadata":{"name":"c1"}}"#);
        assert!(decode_body(Kind::Job, Some("default"), &HeaderMap::new(), &body).is_err());
    }

    #[test]
    fn test_decode_body_accepts_yaml() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/yaml".parse().unwrap());
        let body = Bytes::from_static(
            b"kind: Cluster\nmetadata:\n  name: c1\nspec:\n  manager: slurm\n",
        );
        let obj = decode_body(Kind::Cluster, None, &headers, &body).unwrap();
        assert_eq!(obj.kind(), Kind::Cluster);
    }

    #[test]
    fn test_decode_body_rejects_unknown_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/csv".parse().unwrap());
        let body = Bytes::from_static(br#"{"kind":"Cluster","metadata":{"name":"c1"}}"#);
        assert!(decode_body(Kind::Cluster, None, &headers, &body).is_err());
    }
}
