//! Identity and policy.
//!
//! `identity` turns credentials into [`Principal`]s, `authorize` applies
//! route/scope/model/tool policy to them, `keys` issues new credentials, and
//! `jwks` supplies token verification keys.

pub mod authorize;
pub mod identity;
pub mod jwks;
pub mod keys;
pub mod principal;
pub mod tools;

pub use authorize::{Authorizer, RequestDescriptor, RouteRule};
pub use identity::IdentityResolver;
pub use keys::{issue_key, IssueKeyRequest, IssuedKey};
pub use principal::{BudgetRefs, Principal, RateLimits, Role};
