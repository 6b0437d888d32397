//! Client-Initiated Backchannel Authentication.
//!
//! The flow posts to `/bc-authorize` and then polls the token endpoint until
//! the user approves or denies on their authentication device, the request
//! expires, or the caller cancels. Nothing is persisted while polling.

use crate::config::ServerClientConfig;
use crate::error::{IdpError, OAuthErrorResponse, ServerClientError, ServerClientResult};
use crate::idp::IdpClient;
use crate::types::{BackchannelAuthorizeRequest, LoginBackchannelOptions, TokenResponse};
use ras_identity_store::MAX_LIFETIME_SECONDS;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Added to the poll interval each time the provider answers `slow_down`
pub const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackchannelState {
    NotStarted,
    Pending,
    Polling,
    Completed,
    Denied,
    Expired,
    Cancelled,
    Failed,
}

impl BackchannelState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Denied | Self::Expired | Self::Cancelled | Self::Failed
        )
    }
}

/// What a single poll told us
enum PollOutcome {
    Pending,
    SlowDown,
    Done(ServerClientResult<TokenResponse>),
}

#[derive(Clone)]
pub struct BackchannelFlow {
    config: Arc<ServerClientConfig>,
    idp: Arc<dyn IdpClient>,
}

impl BackchannelFlow {
    pub fn new(config: Arc<ServerClientConfig>, idp: Arc<dyn IdpClient>) -> Self {
        Self { config, idp }
    }

    fn authorize_request(
        &self,
        options: &LoginBackchannelOptions,
    ) -> ServerClientResult<BackchannelAuthorizeRequest> {
        let mut params = self.config.authorization_params.clone();
        params.extend(options.authorization_params.clone());

        let login_hint = serde_json::json!({
            "format": "iss_sub",
            "iss": self.config.issuer()?,
            "sub": options.login_hint.sub,
        });

        Ok(BackchannelAuthorizeRequest {
            login_hint: login_hint.to_string(),
            scope: self
                .config
                .resolve_scope(params.get("scope").map(String::as_str)),
            binding_message: options.binding_message.clone(),
            authorization_details: options.authorization_details.clone(),
            params,
        })
    }

    /// Run the flow to a terminal state
    pub async fn login(
        &self,
        options: &LoginBackchannelOptions,
        cancel: &CancellationToken,
    ) -> ServerClientResult<TokenResponse> {
        let mut state = BackchannelState::NotStarted;
        let request = self.authorize_request(options)?;

        let response = self
            .idp
            .backchannel_authorize(request)
            .await
            .map_err(|e| ServerClientError::from_idp(e, terminal_error))?;

        let auth_req_id = response.auth_req_id;
        let deadline =
            Instant::now() + Duration::from_secs(response.expires_in.min(MAX_LIFETIME_SECONDS));
        let mut interval = Duration::from_secs(
            response
                .interval
                .unwrap_or(self.config.backchannel_default_interval_seconds),
        );
        transition(&mut state, BackchannelState::Pending, &auth_req_id);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    transition(&mut state, BackchannelState::Cancelled, &auth_req_id);
                    return Err(ServerClientError::Cancelled);
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if Instant::now() >= deadline {
                transition(&mut state, BackchannelState::Expired, &auth_req_id);
                return Err(ServerClientError::BackchannelExpired);
            }

            transition(&mut state, BackchannelState::Polling, &auth_req_id);
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    transition(&mut state, BackchannelState::Cancelled, &auth_req_id);
                    return Err(ServerClientError::Cancelled);
                }
                polled = self.idp.poll_backchannel(&auth_req_id) => polled,
            };

            match classify(polled) {
                PollOutcome::Pending => {
                    debug!("Backchannel request {} still pending", auth_req_id);
                }
                PollOutcome::SlowDown => {
                    interval = interval.saturating_add(SLOW_DOWN_INCREMENT);
                    debug!(
                        "Backchannel request {} asked to slow down, interval now {:?}",
                        auth_req_id, interval
                    );
                }
                PollOutcome::Done(result) => {
                    let next = match &result {
                        Ok(_) => BackchannelState::Completed,
                        Err(ServerClientError::BackchannelDenied(_)) => BackchannelState::Denied,
                        Err(ServerClientError::BackchannelExpired) => BackchannelState::Expired,
                        Err(_) => BackchannelState::Failed,
                    };
                    transition(&mut state, next, &auth_req_id);
                    return result;
                }
            }
        }
    }
}

fn classify(result: Result<TokenResponse, IdpError>) -> PollOutcome {
    match result {
        Ok(tokens) => PollOutcome::Done(Ok(tokens)),
        Err(IdpError::Provider(response)) => match response.error.as_str() {
            "authorization_pending" => PollOutcome::Pending,
            "slow_down" => PollOutcome::SlowDown,
            _ => PollOutcome::Done(Err(terminal_error(response))),
        },
        Err(other) => PollOutcome::Done(Err(ServerClientError::Idp(other))),
    }
}

fn terminal_error(response: OAuthErrorResponse) -> ServerClientError {
    match response.error.as_str() {
        "access_denied" => ServerClientError::BackchannelDenied(response),
        "expired_token" => ServerClientError::BackchannelExpired,
        _ => ServerClientError::BackchannelFailed(response),
    }
}

fn transition(state: &mut BackchannelState, next: BackchannelState, auth_req_id: &str) {
    if *state == next {
        return;
    }
    match next {
        BackchannelState::Completed => info!("Backchannel request {} completed", auth_req_id),
        BackchannelState::Denied | BackchannelState::Expired | BackchannelState::Failed => {
            warn!("Backchannel request {} ended as {:?}", auth_req_id, next)
        }
        _ => debug!(
            "Backchannel request {}: {:?} -> {:?}",
            auth_req_id, state, next
        ),
    }
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::types::BackchannelAuthorizeResponse;

    fn flow(idp: Arc<FakeIdpClient>) -> BackchannelFlow {
        BackchannelFlow::new(Arc::new(test_config()), idp)
    }

    fn authorized(expires_in: u64, interval: Option<u64>) -> BackchannelAuthorizeResponse {
        BackchannelAuthorizeResponse {
            auth_req_id: "req-1".to_string(),
            expires_in,
            interval,
        }
    }

    fn gaps(idp: &FakeIdpClient) -> Vec<Duration> {
        let instants = idp.poll_instants.lock().unwrap();
        instants.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[test]
    fn test_terminal_states() {
        assert!(BackchannelState::Completed.is_terminal());
        assert!(BackchannelState::Cancelled.is_terminal());
        assert!(!BackchannelState::Pending.is_terminal());
        assert!(!BackchannelState::Polling.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_approved() {
        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(300, Some(5))));
        idp.push_poll_response(Err(provider_error("authorization_pending")));
        idp.push_poll_response(Err(provider_error("authorization_pending")));
        idp.push_poll_response(Ok(token_response("at", 3600, None, None)));

        let started = Instant::now();
        let tokens = flow(idp.clone())
            .login(
                &LoginBackchannelOptions::new("auth0|123").with_binding_message("Approve 42"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at");
        assert_eq!(idp.poll_count(), 3);
        assert_eq!(
            idp.poll_instants.lock().unwrap()[0] - started,
            Duration::from_secs(5)
        );
        assert_eq!(gaps(&idp), vec![Duration::from_secs(5); 2]);

        let request = idp.authorize_requests.lock().unwrap()[0].clone();
        let hint: serde_json::Value = serde_json::from_str(&request.login_hint).unwrap();
        assert_eq!(hint["format"], "iss_sub");
        assert_eq!(hint["iss"], format!("https://{}/", TEST_DOMAIN));
        assert_eq!(hint["sub"], "auth0|123");
        assert_eq!(request.binding_message.as_deref(), Some("Approve 42"));
        assert_eq!(request.scope, crate::config::DEFAULT_SCOPE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_widens_interval() {
        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(300, None)));
        idp.push_poll_response(Err(provider_error("slow_down")));
        idp.push_poll_response(Err(provider_error("authorization_pending")));
        idp.push_poll_response(Ok(token_response("at", 3600, None, None)));

        flow(idp.clone())
            .login(&LoginBackchannelOptions::new("auth0|123"), &CancellationToken::new())
            .await
            .unwrap();

        // default interval is 5s, then 10s after slow_down
        assert_eq!(
            gaps(&idp),
            vec![Duration::from_secs(10), Duration::from_secs(10)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_and_failed() {
        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(300, Some(1))));
        idp.push_poll_response(Err(provider_error("access_denied")));

        let result = flow(idp.clone())
            .login(&LoginBackchannelOptions::new("auth0|123"), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(ServerClientError::BackchannelDenied(e)) if e.error == "access_denied"
        ));

        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(300, Some(1))));
        idp.push_poll_response(Err(provider_error("invalid_grant")));
        let result = flow(idp)
            .login(&LoginBackchannelOptions::new("auth0|123"), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(ServerClientError::BackchannelFailed(e)) if e.error == "invalid_grant"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(10, Some(5))));
        for _ in 0..5 {
            idp.push_poll_response(Err(provider_error("authorization_pending")));
        }

        let result = flow(idp.clone())
            .login(&LoginBackchannelOptions::new("auth0|123"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ServerClientError::BackchannelExpired)));
        // the second wake-up lands on the deadline and does not poll
        assert_eq!(idp.poll_count(), 1);

        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(300, Some(5))));
        idp.push_poll_response(Err(provider_error("expired_token")));
        let result = flow(idp)
            .login(&LoginBackchannelOptions::new("auth0|123"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ServerClientError::BackchannelExpired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(300, Some(5))));
        for _ in 0..10 {
            idp.push_poll_response(Err(provider_error("authorization_pending")));
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let result = flow(idp.clone())
            .login(&LoginBackchannelOptions::new("auth0|123"), &cancel)
            .await;
        assert!(matches!(result, Err(ServerClientError::Cancelled)));
        assert_eq!(idp.poll_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_slow_poll() {
        let idp = Arc::new(FakeIdpClient::new().with_poll_delay(Duration::from_secs(10)));
        idp.push_authorize_response(Ok(authorized(300, Some(5))));
        idp.push_poll_response(Ok(token_response("at", 3600, None, None)));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = flow(idp.clone())
            .login(&LoginBackchannelOptions::new("auth0|123"), &cancel)
            .await;
        assert!(matches!(result, Err(ServerClientError::Cancelled)));
        assert_eq!(idp.poll_count(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_expires_in_from_provider() {
        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Ok(authorized(u64::MAX, Some(1))));
        idp.push_poll_response(Err(provider_error("authorization_pending")));
        idp.push_poll_response(Ok(token_response("at", 3600, None, None)));

        let tokens = flow(idp.clone())
            .login(&LoginBackchannelOptions::new("auth0|123"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(idp.poll_count(), 2);
    }

    #[tokio::test]
    async fn test_authorize_rejection() {
        let idp = Arc::new(FakeIdpClient::new());
        idp.push_authorize_response(Err(provider_error("unauthorized_client")));

        let result = flow(idp.clone())
            .login(&LoginBackchannelOptions::new("auth0|123"), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(ServerClientError::BackchannelFailed(e)) if e.error == "unauthorized_client"
        ));
        assert_eq!(idp.poll_count(), 0);
    }
}
