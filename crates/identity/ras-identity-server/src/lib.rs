//! Server-side OIDC login and session lifecycle.
//!
//! [`ServerClient`] drives the authorization code flow with PKCE, account
//! linking and Client-Initiated Backchannel Authentication against an Auth0
//! style identity provider. Sessions live in a pluggable
//! [`StateStore`](ras_identity_store::StateStore) and in-progress logins in a
//! [`TransactionStore`](ras_identity_store::TransactionStore). Access tokens
//! are cached per session and refreshed on demand, with concurrent refreshes
//! of the same token coalesced into one provider call.

mod ciba;
mod config;
mod error;
mod flow;
mod idp;
mod manager;
mod pkce;
mod token_cache;
mod types;
mod verifier;

#[cfg(test)]
mod test_support;

pub use ciba::{BackchannelFlow, BackchannelState, SLOW_DOWN_INCREMENT};
pub use config::{AuthorizationParams, DEFAULT_AUDIENCE, DEFAULT_SCOPE, ServerClientConfig};
pub use error::{IdpError, OAuthErrorResponse, ServerClientError, ServerClientResult};
pub use flow::{AuthorizationCodeFlow, CompletedFlow};
pub use idp::{HttpIdpClient, IdpClient, IdpResult};
pub use manager::{ServerClient, ServerClientBuilder};
pub use pkce::PkceChallenge;
pub use token_cache::TokenCache;
pub use types::{
    AccessTokenOptions, BackchannelAuthorizeRequest, BackchannelAuthorizeResponse,
    CodeExchangeRequest, ConnectionTokenOptions, ConnectionTokenRequest, LinkResult,
    LoginBackchannelOptions, LoginHint, LoginResult, LogoutOptions, RefreshTokenRequest,
    SessionData, StartLinkUserOptions, StartLoginOptions, TokenResponse,
};
pub use verifier::{BACKCHANNEL_LOGOUT_EVENT, IdTokenClaims, JwtTokenVerifier, TokenVerifier};

// Re-export store types for convenience
pub use ras_identity_store::{
    AppState, CacheKey, CachedToken, InMemoryStateStore, InMemoryTransactionStore, LogoutClaims,
    SessionRecord, StateStore, StoreError, StoreOptions, TransactionKind, TransactionStore,
    UserClaims,
};
