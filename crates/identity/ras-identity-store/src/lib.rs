//! Store abstractions for server-side OIDC login flows.
//!
//! Two capability contracts are defined here: a [`TransactionStore`] for the
//! short-lived state of an in-progress login (PKCE verifier, `state`, `nonce`,
//! application state) and a [`StateStore`] for long-lived sessions (ID token,
//! refresh token, cached access tokens). Backends are injected at construction
//! time; this crate ships in-memory implementations of both.

mod error;
mod options;
mod state;
mod transaction;
mod types;

pub use error::{StoreError, StoreResult};
pub use options::StoreOptions;
pub use state::{DEFAULT_ABSOLUTE_DURATION_SECONDS, InMemoryStateStore, StateStore};
pub use transaction::{InMemoryTransactionStore, TransactionStore};
pub use types::{
    AppState, CacheKey, CachedToken, LogoutClaims, MAX_LIFETIME_SECONDS, SessionInternal,
    SessionRecord, TransactionKind, TransactionRecord, UserClaims, expiry_after,
};
