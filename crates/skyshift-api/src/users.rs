//! Users, sessions and invites
//!
//! Registration requires a live invite token; the bootstrap admin is
//! created directly by the server's installation hook and is the seed
//! for the first invite. Invites are single-use: the record keyed by the
//! token's hash is consumed on registration and removable via
//! `revoke_invite` before that.

use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use skyshift_common::object::{Action, Kind, Object, ObjectMeta, User, UserSpec};
use skyshift_common::retry::{with_backoff, BackoffPolicy};
use skyshift_common::Error;

use crate::auth::{hash_password, token_hash, verify_password, AuthUser};
use crate::authorize::authorize;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Key prefix for persisted invite records
const INVITES_PREFIX: &str = "/registry/invites";

/// Request body of `POST /register_user`
#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Invite token issued by an existing user
    #[serde(default)]
    pub invite: Option<String>,
}

/// Request body of `POST /token`
#[derive(Debug, Deserialize, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Request body of `POST /invite`
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct InviteRequest {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Request body of `POST /revoke_invite`
#[derive(Debug, Deserialize, Serialize)]
pub struct RevokeInviteRequest {
    pub token: String,
}

/// Token response for login and invite issuance
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Persisted invite record, keyed by the token's hash
#[derive(Debug, Deserialize, Serialize)]
pub struct InviteRecord {
    pub issuer: String,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

fn invite_key(token: &str) -> String {
    format!("{INVITES_PREFIX}/{}", token_hash(token))
}

/// `POST /register_user`
pub async fn register_user(
    state: AppState,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<Object>> {
    let invite_token = request
        .invite
        .as_deref()
        .ok_or_else(|| ApiError(Error::unauthorized("registration requires an invite token")))?;
    let claims = state.auth.verify_invite_token(invite_token)?;

    // A signed token alone is not enough: the stored record must still
    // exist (revocation removes it; registration consumes it).
    let key = invite_key(invite_token);
    let record = state
        .kv
        .get(&key)
        .await?
        .ok_or_else(|| ApiError(Error::unauthorized("invite token revoked or already used")))?;
    let record: InviteRecord = serde_json::from_slice(&record.value)
        .map_err(|e| ApiError(Error::fatal("api", format!("corrupt invite record: {e}"))))?;

    let user = User {
        metadata: ObjectMeta::named(request.username.clone()),
        spec: UserSpec {
            password_hash: hash_password(&request.password)?,
            email: request.email.clone(),
            roles: claims.roles.clone(),
        },
    };
    let created = state.store.create(Object::User(user)).await?;

    // Bind the invite's roles to the new user.
    for role_name in &record.roles {
        bind_user_to_role(&state, role_name, &request.username).await?;
    }

    // Consume the invite.
    let _ = state.kv.delete(&key, None).await;
    info!(user = %request.username, issuer = %record.issuer, "registered user from invite");
    Ok(Json(created))
}

/// Add `username` to a role's user list, retrying around concurrent
/// role updates.
async fn bind_user_to_role(state: &AppState, role_name: &str, username: &str) -> ApiResult<()> {
    let policy = BackoffPolicy::budgeted(5);
    let outcome = with_backoff(&policy, "bind_user_to_role", || async {
        let obj = state.store.get(Kind::Role, None, role_name).await?;
        let Object::Role(mut role) = obj else {
            return Err(Error::fatal("api", "role key held a non-role object"));
        };
        if role.spec.users.iter().any(|u| u == username) {
            return Ok(());
        }
        role.spec.users.push(username.to_string());
        state.store.update(Object::Role(role)).await.map(|_| ())
    })
    .await;

    match outcome {
        Ok(()) => Ok(()),
        // A vanished role leaves the user registered but unbound.
        Err(err) if err.is_not_found() => {
            tracing::warn!(role = %role_name, "invite referenced a missing role");
            Ok(())
        }
        Err(err) => Err(ApiError(err)),
    }
}

/// `POST /token`: log in and receive a session token
pub async fn login(
    state: AppState,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let denied = || ApiError(Error::unauthorized("incorrect username or password"));

    let obj = state
        .store
        .get(Kind::User, None, &request.username)
        .await
        .map_err(|_| denied())?;
    let Object::User(user) = obj else {
        return Err(denied());
    };
    if !verify_password(&request.password, &user.spec.password_hash) {
        return Err(denied());
    }

    let token = state.auth.create_session_token(&request.username)?;
    Ok(Json(TokenResponse { token }))
}

/// `POST /invite`: issue an invite granting the given roles
pub async fn create_invite(
    state: AppState,
    auth: AuthUser,
    Json(request): Json<InviteRequest>,
) -> ApiResult<Json<TokenResponse>> {
    authorize(&state.store, &auth.username, Action::Create, Kind::User, None).await?;

    // Every granted role must exist up front.
    for role_name in &request.roles {
        state.store.get(Kind::Role, None, role_name).await?;
    }

    let token = state
        .auth
        .create_invite_token(&auth.username, request.roles.clone())?;
    let record = InviteRecord {
        issuer: auth.username.clone(),
        roles: request.roles,
        created_at: Utc::now(),
    };
    let value = serde_json::to_vec(&record)
        .map_err(|e| ApiError(Error::fatal("api", e.to_string())))?;
    state.kv.put(&invite_key(&token), value, Some(0)).await?;
    Ok(Json(TokenResponse { token }))
}

/// `POST /revoke_invite`: invalidate an invite before it is used
pub async fn revoke_invite(
    state: AppState,
    auth: AuthUser,
    Json(request): Json<RevokeInviteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    authorize(&state.store, &auth.username, Action::Delete, Kind::User, None).await?;
    state.kv.delete(&invite_key(&request.token), None).await?;
    Ok(Json(serde_json::json!({"revoked": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_key_hides_the_token() {
        let key = invite_key("secret-token");
        assert!(key.starts_with("/registry/invites/"));
        assert!(!key.contains("secret-token"));
        // Deterministic per token.
        assert_eq!(key, invite_key("secret-token"));
        assert_ne!(key, invite_key("other-token"));
    }

    #[test]
    fn test_invite_record_round_trip() {
        let record = InviteRecord {
            issuer: "admin".to_string(),
            roles: vec!["reader-role".to_string()],
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record).unwrap();
        let back: InviteRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.issuer, "admin");
        assert_eq!(back.roles, vec!["reader-role"]);
    }
}
