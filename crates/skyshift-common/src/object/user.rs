//! User object
//!
//! Users are global objects named by username. Only the password hash is
//! persisted; registration and verification live in the API crate.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::meta::ObjectMeta;

/// Specification of a User
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
    /// Salted password hash (never the cleartext password)
    pub password_hash: String,
    /// Optional contact address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Roles granted at registration time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl UserSpec {
    pub fn validate(&self) -> Result<()> {
        if self.password_hash.is_empty() {
            return Err(Error::invalid_field(
                "User",
                "spec.password_hash",
                "password hash cannot be empty",
            ));
        }
        if let Some(email) = &self.email {
            if !email.contains('@') {
                return Err(Error::invalid_field("User", "spec.email", "invalid email address"));
            }
        }
        Ok(())
    }
}

/// User object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct User {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: UserSpec,
}

impl User {
    /// The username this object represents
    pub fn username(&self) -> &str {
        &self.metadata.name
    }
}
