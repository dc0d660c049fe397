//! Shared controller helpers

use skyshift_client::ApiClient;
use skyshift_common::object::ApiObject;
use skyshift_common::{Error, Result};

/// Bound on reread-and-retry rounds around a conflicting update
const UPDATE_ATTEMPTS: u32 = 5;

/// Read-modify-write with optimistic concurrency.
///
/// `mutate` runs against a fresh copy on every attempt and returns false
/// to signal that no write is needed. Returns the stored object after
/// the write (or the unchanged object when `mutate` declined).
pub async fn update_object_with<T, F>(
    client: &ApiClient,
    namespace: Option<&str>,
    name: &str,
    mutate: F,
) -> Result<T>
where
    T: ApiObject,
    F: Fn(&mut T) -> bool,
{
    let mut last_err: Option<Error> = None;
    for _ in 0..UPDATE_ATTEMPTS {
        let mut obj: T = client.get_as(namespace, name).await?;
        if !mutate(&mut obj) {
            return Ok(obj);
        }
        match client.update(&obj.clone().into()).await {
            Ok(stored) => return T::try_from_object(stored),
            Err(err) if err.is_conflict() => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::transient("controller", "update retries exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshift_common::object::Namespace;

    #[tokio::test]
    async fn test_update_surfaces_connection_errors() {
        // No server behind this address: the get fails transiently and
        // the helper must not spin.
        let client = ApiClient::new("http://127.0.0.1:1");
        let result =
            update_object_with::<Namespace, _>(&client, None, "default", |_| true).await;
        assert!(result.is_err());
    }
}
