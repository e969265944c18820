//! Principals, roles and ownership authorization.

mod ownership;
mod principal;

pub use ownership::{require_owner, LookupError, OwnerLookup, OwnershipGuard};
pub use principal::{ApiKeyId, Principal, Role};
