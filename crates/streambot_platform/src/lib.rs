#![forbid(unsafe_code)]

pub mod roles;
pub mod twitch;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Lifecycle of a chat or EventSub socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	Connecting,
	Open,
	Closing,
	Errored,
}

impl ConnectionState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Idle => "idle",
			Self::Connecting => "connecting",
			Self::Open => "open",
			Self::Closing => "closing",
			Self::Errored => "errored",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
	#[error("connection is stopping")]
	Stopping,
}

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// Roles a user holds in the bot's channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRoles {
	pub moderator: bool,
	pub vip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
	pub id: String,
	pub login: String,
	pub display_name: Option<String>,
}

/// Channel operations the bot performs on behalf of the broadcaster.
#[async_trait::async_trait]
pub trait ChannelApi: Send + Sync {
	async fn send_message(&self, text: &str) -> anyhow::Result<()>;

	async fn timeout_user(&self, user_id: &str, duration_secs: u32, reason: Option<&str>) -> anyhow::Result<()>;

	async fn delete_message(&self, message_id: &str) -> anyhow::Result<()>;

	async fn add_moderator(&self, user_id: &str) -> anyhow::Result<()>;

	async fn remove_moderator(&self, user_id: &str) -> anyhow::Result<()>;

	async fn add_vip(&self, user_id: &str) -> anyhow::Result<()>;

	async fn remove_vip(&self, user_id: &str) -> anyhow::Result<()>;

	async fn shoutout(&self, user_id: &str) -> anyhow::Result<()>;

	async fn user_roles(&self, user_id: &str) -> anyhow::Result<UserRoles>;

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserInfo>>;
}
