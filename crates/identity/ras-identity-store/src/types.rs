//! Records persisted by transaction and state stores.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Caller-supplied payload threaded through a login flow and returned verbatim.
pub type AppState = serde_json::Value;

/// Upper bound for provider-supplied lifetimes: ten years
pub const MAX_LIFETIME_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// `now + seconds`, with `seconds` clamped to [`MAX_LIFETIME_SECONDS`]
pub fn expiry_after(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    let seconds = seconds.min(MAX_LIFETIME_SECONDS) as i64;
    now.checked_add_signed(Duration::seconds(seconds))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Which flow created a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Login,
    LinkUser,
}

/// Short-lived state stored between the authorization redirect and the callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub flow_id: String,
    pub kind: TransactionKind,
    pub code_verifier: String,
    pub state: String,
    pub nonce: String,
    pub redirect_uri: String,
    pub audience: Option<String>,
    pub scope: String,
    pub app_state: Option<AppState>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TransactionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow_id: String,
        kind: TransactionKind,
        code_verifier: String,
        state: String,
        nonce: String,
        redirect_uri: String,
        audience: Option<String>,
        scope: String,
        app_state: Option<AppState>,
        ttl_seconds: u64,
    ) -> Self {
        let created_at = Utc::now();
        let expires_at = expiry_after(created_at, ttl_seconds);

        Self {
            flow_id,
            kind,
            code_verifier,
            state,
            nonce,
            redirect_uri,
            audience,
            scope,
            app_state,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Profile claims of the authenticated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(flatten)]
    pub additional_claims: HashMap<String, serde_json::Value>,
}

impl UserClaims {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            name: None,
            nickname: None,
            email: None,
            email_verified: None,
            picture: None,
            additional_claims: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInternal {
    /// Provider session id (`sid` claim of the ID token)
    pub sid: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// Identifies one access token slot within a session.
///
/// Primary tokens are keyed by audience and scope. Connection tokens use a
/// separate namespace keyed only by the connection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub audience: String,
    pub scope: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
}

impl CacheKey {
    pub fn new(audience: impl Into<String>, scope: &str) -> Self {
        Self {
            audience: audience.into(),
            scope: scope.split_whitespace().map(String::from).collect(),
            connection: None,
        }
    }

    pub fn for_connection(connection: impl Into<String>) -> Self {
        Self {
            audience: String::new(),
            scope: BTreeSet::new(),
            connection: Some(connection.into()),
        }
    }

    pub fn is_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Space separated scope string, sorted
    pub fn scope_string(&self) -> String {
        self.scope.iter().cloned().collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn new(access_token: String, token_type: String, expires_in_seconds: u64) -> Self {
        Self {
            access_token,
            token_type,
            expires_at: expiry_after(Utc::now(), expires_in_seconds),
        }
    }

    /// A token inside the skew window is treated as expired
    pub fn is_fresh(&self, skew: Duration) -> bool {
        Utc::now()
            .checked_add_signed(skew)
            .is_some_and(|deadline| deadline < self.expires_at)
    }
}

/// Long-lived state of an authenticated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user: UserClaims,
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub internal: SessionInternal,
    #[serde(default, with = "token_cache_entries")]
    pub token_cache: HashMap<CacheKey, CachedToken>,
}

impl SessionRecord {
    pub fn new(
        session_id: String,
        user: UserClaims,
        id_token: String,
        refresh_token: Option<String>,
        sid: Option<String>,
    ) -> Self {
        Self {
            session_id,
            user,
            id_token,
            refresh_token,
            internal: SessionInternal {
                sid,
                issued_at: Utc::now(),
            },
            token_cache: HashMap::new(),
        }
    }

    pub fn token(&self, key: &CacheKey) -> Option<&CachedToken> {
        self.token_cache.get(key)
    }

    /// Returns the cached token for `key` only if it is outside the skew window
    pub fn fresh_token(&self, key: &CacheKey, skew: Duration) -> Option<&CachedToken> {
        self.token(key).filter(|token| token.is_fresh(skew))
    }

    pub fn insert_token(&mut self, key: CacheKey, token: CachedToken) {
        self.token_cache.insert(key, token);
    }

    pub fn matches_logout(&self, claims: &LogoutClaims) -> bool {
        if claims.sub.is_none() && claims.sid.is_none() {
            return false;
        }

        let sub_matches = claims.sub.as_deref().is_none_or(|sub| sub == self.user.sub);
        let sid_matches = claims
            .sid
            .as_deref()
            .is_none_or(|sid| Some(sid) == self.internal.sid.as_deref());

        sub_matches && sid_matches
    }
}

/// Claims extracted from a verified backchannel logout token
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogoutClaims {
    pub sub: Option<String>,
    pub sid: Option<String>,
}

/// The token cache is persisted as a list so that JSON backends can store it.
mod token_cache_entries {
    use super::{CacheKey, CachedToken};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct EntryRef<'a> {
        key: &'a CacheKey,
        token: &'a CachedToken,
    }

    #[derive(Deserialize)]
    struct Entry {
        key: CacheKey,
        token: CachedToken,
    }

    pub fn serialize<S: Serializer>(
        cache: &HashMap<CacheKey, CachedToken>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(cache.iter().map(|(key, token)| EntryRef { key, token }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<CacheKey, CachedToken>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.key, entry.token))
            .collect())
    }
}
