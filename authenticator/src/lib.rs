//! Tenant identity for inbound API requests.
//!
//! Requests carry RS256 tokens whose subject names a tenant (`tenant-<name>`).
//! [`KeySet`] holds the RSA public keys the tokens are checked against,
//! [`TokenVerifier`] validates a single token and [`TenantResolver`] applies
//! an endpoint's tenant policy to a whole request.

pub mod errors;
pub mod keyset;
pub mod tenant;
pub mod token;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use errors::{AuthError, KeySetError, TokenError};
pub use keyset::KeySet;
pub use tenant::{CredentialSource, TENANT_TEST_HEADER, TenantPolicy, TenantResolver};
pub use token::TokenVerifier;
