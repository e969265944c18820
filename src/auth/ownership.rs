//! Ownership authorization for mutation routes.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::debug;

use super::principal::Principal;
use crate::error::{GateError, Result};

/// Why an owner lookup produced no owner.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The referenced resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The backing store could not answer.
    #[error("{0}")]
    Backend(String),
}

/// Resolves the principal id owning the resource a request refers to.
///
/// Each protected route supplies its own implementation, typically reading a
/// path parameter and querying the corresponding record.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn owner_of(&self, parts: &Parts) -> std::result::Result<String, LookupError>;
}

/// Allows a mutation only for the resource's owner or an unrestricted role.
pub struct OwnershipGuard<L> {
    lookup: Arc<L>,
}

impl<L> Clone for OwnershipGuard<L> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
        }
    }
}

impl<L: OwnerLookup> OwnershipGuard<L> {
    pub fn new(lookup: L) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    pub fn from_arc(lookup: Arc<L>) -> Self {
        Self { lookup }
    }

    /// Decide whether `principal` may mutate the resource `parts` refers to.
    ///
    /// The lookup runs before any role check, so a missing resource is always
    /// reported as not found, even to unrestricted principals.
    pub async fn authorize(&self, principal: Option<&Principal>, parts: &Parts) -> Result<()> {
        let principal = principal.ok_or(GateError::Unauthenticated)?;

        let owner = match self.lookup.owner_of(parts).await {
            Ok(owner) => owner,
            Err(LookupError::NotFound(what)) => {
                return Err(GateError::NotFound(format!("{} not found", what)))
            }
            Err(LookupError::Backend(reason)) => return Err(GateError::OwnerLookup(reason)),
        };

        if principal.is_unrestricted() || principal.id == owner {
            return Ok(());
        }

        debug!(
            principal = %principal.id,
            owner = %owner,
            path = %parts.uri.path(),
            "Ownership check denied"
        );
        Err(GateError::Forbidden)
    }
}

/// Axum middleware applying an [`OwnershipGuard`].
///
/// The principal is read from the request extensions.
pub async fn require_owner<L: OwnerLookup + 'static>(
    State(guard): State<OwnershipGuard<L>>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    if let Err(err) = guard.authorize(parts.extensions.get::<Principal>(), &parts).await {
        return err.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use axum::http::Request as HttpRequest;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Owners keyed by the last path segment.
    struct MapLookup {
        owners: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl MapLookup {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                owners: entries
                    .iter()
                    .map(|(id, owner)| (id.to_string(), owner.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OwnerLookup for MapLookup {
        async fn owner_of(&self, parts: &Parts) -> std::result::Result<String, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = parts.uri.path().rsplit('/').next().unwrap_or_default();
            self.owners
                .get(id)
                .cloned()
                .ok_or_else(|| LookupError::NotFound("extension".to_string()))
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl OwnerLookup for FailingLookup {
        async fn owner_of(&self, _parts: &Parts) -> std::result::Result<String, LookupError> {
            Err(LookupError::Backend("connection refused".to_string()))
        }
    }

    fn parts(path: &str) -> Parts {
        HttpRequest::builder().uri(path).body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_owner_allowed() {
        let guard = OwnershipGuard::new(MapLookup::new(&[("ext-1", "alice")]));
        let alice = Principal::new("alice", Role::User);
        assert!(guard.authorize(Some(&alice), &parts("/extensions/ext-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_owner_forbidden() {
        let guard = OwnershipGuard::new(MapLookup::new(&[("ext-1", "alice")]));
        let bob = Principal::new("bob", Role::Developer);
        let err = guard
            .authorize(Some(&bob), &parts("/extensions/ext-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Forbidden));
    }

    #[tokio::test]
    async fn test_admin_bypasses_owner_comparison() {
        let guard = OwnershipGuard::new(MapLookup::new(&[("ext-1", "alice")]));
        let admin = Principal::new("root", Role::Admin);
        tokio_test::assert_ok!(guard.authorize(Some(&admin), &parts("/extensions/ext-1")).await);
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found_for_every_role() {
        let guard = OwnershipGuard::new(MapLookup::new(&[]));
        for role in [Role::User, Role::Developer, Role::Admin] {
            let principal = Principal::new("alice", role);
            let err = guard
                .authorize(Some(&principal), &parts("/extensions/gone"))
                .await
                .unwrap_err();
            assert!(matches!(err, GateError::NotFound(_)), "{:?}", role);
        }
    }

    #[tokio::test]
    async fn test_anonymous_is_unauthenticated_without_lookup() {
        let lookup = Arc::new(MapLookup::new(&[("ext-1", "alice")]));
        let guard = OwnershipGuard::from_arc(Arc::clone(&lookup));
        let err = guard
            .authorize(None, &parts("/extensions/ext-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Unauthenticated));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_as_lookup_error() {
        let guard = OwnershipGuard::new(FailingLookup);
        let admin = Principal::new("root", Role::Admin);
        let err = guard
            .authorize(Some(&admin), &parts("/extensions/ext-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::OwnerLookup(_)));
    }
}
