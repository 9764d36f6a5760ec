#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::helix::{TwitchTokenValidation, refresh_user_token, validate_user_token};
use crate::SecretString;

/// Source of the user access token shared by both connections and Helix.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
	/// Current token, refreshed first when it is about to expire.
	async fn access_token(&self) -> anyhow::Result<SecretString>;

	/// Refresh now regardless of expiry, e.g. after the server rejected the token.
	async fn force_refresh(&self) -> anyhow::Result<SecretString>;
}

/// Fixed token without refresh support.
pub struct StaticTokenProvider(SecretString);

impl StaticTokenProvider {
	pub fn new(token: SecretString) -> Self {
		Self(token)
	}
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
	async fn access_token(&self) -> anyhow::Result<SecretString> {
		Ok(self.0.clone())
	}

	async fn force_refresh(&self) -> anyhow::Result<SecretString> {
		anyhow::bail!("static token cannot be refreshed")
	}
}

struct TokenState {
	access_token: SecretString,
	refresh_token: Option<SecretString>,
	expires_at: Option<Instant>,
	last_refresh_attempt: Option<Instant>,
}

/// OAuth user token with refresh-token rotation.
pub struct RefreshingTokenProvider {
	client_id: String,
	client_secret: Option<SecretString>,
	refresh_buffer: Duration,
	min_refresh_interval: Duration,
	state: Mutex<TokenState>,
}

impl RefreshingTokenProvider {
	pub fn new(
		client_id: impl Into<String>,
		client_secret: Option<SecretString>,
		access_token: SecretString,
		refresh_token: Option<SecretString>,
	) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret,
			refresh_buffer: Duration::from_secs(60),
			min_refresh_interval: Duration::from_secs(30),
			state: Mutex::new(TokenState {
				access_token,
				refresh_token,
				expires_at: None,
				last_refresh_attempt: None,
			}),
		}
	}

	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	/// Validate the current token, recording its expiry. Refreshes once if validation fails.
	pub async fn validate(&self) -> anyhow::Result<TwitchTokenValidation> {
		let token = self.access_token().await?;
		let validation = match validate_user_token(token.expose()).await {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "token validation failed; trying refresh");
				let token = self.force_refresh().await.context("refresh after failed validation")?;
				validate_user_token(token.expose()).await.context("validate refreshed token")?
			}
		};

		let mut state = self.state.lock().await;
		state.expires_at = Instant::now().checked_add(Duration::from_secs(validation.expires_in));
		Ok(validation)
	}

	fn can_refresh(&self, state: &TokenState) -> bool {
		self.client_secret.is_some() && state.refresh_token.is_some()
	}

	async fn refresh_locked(&self, state: &mut TokenState) -> anyhow::Result<SecretString> {
		let (Some(secret), Some(refresh)) = (self.client_secret.as_ref(), state.refresh_token.as_ref()) else {
			anyhow::bail!("token refresh requires client_secret and refresh_token");
		};

		if let Some(last) = state.last_refresh_attempt
			&& last.elapsed() < self.min_refresh_interval
		{
			return Ok(state.access_token.clone());
		}
		state.last_refresh_attempt = Some(Instant::now());

		let resp = refresh_user_token(&self.client_id, secret.expose(), refresh.expose())
			.await
			.context("refresh user token")?;

		state.access_token = SecretString::new(resp.access_token);
		if let Some(new_refresh) = resp.refresh_token {
			state.refresh_token = Some(SecretString::new(new_refresh));
		}
		state.expires_at = Instant::now().checked_add(Duration::from_secs(resp.expires_in));
		metrics::counter!("streambot_token_refreshes_total").increment(1);
		info!(expires_in = resp.expires_in, "refreshed user OAuth token");
		Ok(state.access_token.clone())
	}
}

#[async_trait::async_trait]
impl TokenProvider for RefreshingTokenProvider {
	async fn access_token(&self) -> anyhow::Result<SecretString> {
		let mut state = self.state.lock().await;

		let expiring = state
			.expires_at
			.is_some_and(|at| Instant::now() + self.refresh_buffer >= at);

		if expiring && self.can_refresh(&state) {
			match self.refresh_locked(&mut state).await {
				Ok(token) => return Ok(token),
				Err(e) => warn!(error = %e, "token expiring and refresh failed; using current token"),
			}
		}

		Ok(state.access_token.clone())
	}

	async fn force_refresh(&self) -> anyhow::Result<SecretString> {
		let mut state = self.state.lock().await;
		self.refresh_locked(&mut state).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn static_provider_returns_token_and_refuses_refresh() {
		let p = StaticTokenProvider::new(SecretString::new("abc"));
		assert_eq!(p.access_token().await.unwrap().expose(), "abc");
		assert!(p.force_refresh().await.is_err());
	}

	#[tokio::test]
	async fn refreshing_provider_without_secret_cannot_force_refresh() {
		let p = RefreshingTokenProvider::new("cid", None, SecretString::new("tok"), Some(SecretString::new("r")));
		let err = p.force_refresh().await.unwrap_err();
		assert!(err.to_string().contains("client_secret"), "unexpected error: {err}");
		assert_eq!(p.access_token().await.unwrap().expose(), "tok");
	}
}
