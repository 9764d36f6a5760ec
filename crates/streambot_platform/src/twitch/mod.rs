#![forbid(unsafe_code)]

pub mod auth;
pub mod eventsub;
pub mod helix;
pub mod irc;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;
use url::Url;

use self::helix::HelixClient;
use self::irc::connection::ChatConnection;
use crate::{ChannelApi, ConnectionState, UserInfo, UserRoles};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

pub fn default_ws_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
				.await
				.with_context(|| format!("connect_async to {url}"))?;
			Ok(ws)
		}) as BoxFuture<'static, anyhow::Result<TwitchWs>>
	})
}

/// `ChannelApi` over Helix, sending chat through the IRC connection while it is open.
///
/// The token user acts as broadcaster and moderator for every call.
pub struct TwitchChannelApi {
	helix: HelixClient,
	broadcaster_id: String,
	chat: Option<ChatConnection>,
}

impl TwitchChannelApi {
	pub fn new(helix: HelixClient, broadcaster_id: impl Into<String>, chat: Option<ChatConnection>) -> Self {
		Self {
			helix,
			broadcaster_id: broadcaster_id.into(),
			chat,
		}
	}

	pub fn helix(&self) -> &HelixClient {
		&self.helix
	}

	pub fn broadcaster_id(&self) -> &str {
		&self.broadcaster_id
	}
}

#[async_trait::async_trait]
impl ChannelApi for TwitchChannelApi {
	async fn send_message(&self, text: &str) -> anyhow::Result<()> {
		if let Some(chat) = self.chat.as_ref()
			&& chat.state() == ConnectionState::Open
		{
			return chat.send_message(text);
		}
		debug!("chat socket not open; sending through helix");
		self.helix
			.send_chat_message(&self.broadcaster_id, &self.broadcaster_id, text)
			.await
	}

	async fn timeout_user(&self, user_id: &str, duration_secs: u32, reason: Option<&str>) -> anyhow::Result<()> {
		self.helix
			.ban_user(&self.broadcaster_id, &self.broadcaster_id, user_id, Some(duration_secs), reason)
			.await
	}

	async fn delete_message(&self, message_id: &str) -> anyhow::Result<()> {
		self.helix
			.delete_chat_message(&self.broadcaster_id, &self.broadcaster_id, message_id)
			.await
	}

	async fn add_moderator(&self, user_id: &str) -> anyhow::Result<()> {
		self.helix.add_moderator(&self.broadcaster_id, user_id).await
	}

	async fn remove_moderator(&self, user_id: &str) -> anyhow::Result<()> {
		self.helix.remove_moderator(&self.broadcaster_id, user_id).await
	}

	async fn add_vip(&self, user_id: &str) -> anyhow::Result<()> {
		self.helix.add_vip(&self.broadcaster_id, user_id).await
	}

	async fn remove_vip(&self, user_id: &str) -> anyhow::Result<()> {
		self.helix.remove_vip(&self.broadcaster_id, user_id).await
	}

	async fn shoutout(&self, user_id: &str) -> anyhow::Result<()> {
		self.helix
			.send_shoutout(&self.broadcaster_id, user_id, &self.broadcaster_id)
			.await
	}

	async fn user_roles(&self, user_id: &str) -> anyhow::Result<UserRoles> {
		let moderator = self
			.helix
			.is_user_moderator_in_channel(&self.broadcaster_id, user_id)
			.await?;
		let vip = self.helix.is_user_vip_in_channel(&self.broadcaster_id, user_id).await?;
		Ok(UserRoles { moderator, vip })
	}

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserInfo>> {
		let user = self.helix.get_user_by_login(login).await?;
		Ok(user.map(|u| UserInfo {
			id: u.id,
			login: u.login,
			display_name: u.display_name,
		}))
	}
}
