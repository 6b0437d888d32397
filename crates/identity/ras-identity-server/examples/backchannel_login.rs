//! Log a user in through Client-Initiated Backchannel Authentication
//!
//! Configuration is read from `auth0.toml` (or `AUTH0_CONFIG_FILE`) and
//! `AUTH0_*` environment variables, e.g. `AUTH0_DOMAIN`, `AUTH0_CLIENT_ID` and
//! `AUTH0_CLIENT_SECRET`. The default token verifier expects the application
//! to sign ID tokens with HS256.
//!
//! Usage: `cargo run --example backchannel_login -- <user sub> [binding message]`
//!
//! Press Ctrl-C while waiting for approval to cancel the request.

use ras_identity_server::{
    AccessTokenOptions, LoginBackchannelOptions, ServerClient, ServerClientConfig, StoreOptions,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let sub = args
        .next()
        .ok_or("usage: backchannel_login <user sub> [binding message]")?;
    let binding_message = args
        .next()
        .unwrap_or_else(|| "Sign in to the example app".to_string());

    let config = ServerClientConfig::load()?;
    let client = ServerClient::new(config)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    println!("Waiting for {} to approve \"{}\"...", sub, binding_message);
    let store_options = StoreOptions::new();
    let session = client
        .login_backchannel(
            "example-session",
            LoginBackchannelOptions::new(sub).with_binding_message(binding_message),
            &cancel,
            &store_options,
        )
        .await?;

    println!("Logged in as {}", session.user.sub);
    if let Some(email) = &session.user.email {
        println!("Email: {}", email);
    }

    let access_token = client
        .get_access_token(
            "example-session",
            &AccessTokenOptions::default(),
            &store_options,
        )
        .await?;
    println!("Access token: {}...", preview(&access_token));

    Ok(())
}

/// First 16 characters of a token
fn preview(token: &str) -> String {
    token.chars().take(16).collect()
}
