#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use url::Url;

use super::auth::TokenProvider;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const CHAT_MESSAGES_PATH: &str = "/helix/chat/messages";
const CHAT_SHOUTOUTS_PATH: &str = "/helix/chat/shoutouts";
const CHANNEL_VIPS_PATH: &str = "/helix/channels/vips";
const MODERATION_BANS_PATH: &str = "/helix/moderation/bans";
const MODERATION_CHAT_PATH: &str = "/helix/moderation/chat";
const MODERATION_MODERATORS_PATH: &str = "/helix/moderation/moderators";
const TOKEN_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const TOKEN_REFRESH_URL: &str = "https://id.twitch.tv/oauth2/token";

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Read the body and fail on a non-success status.
async fn success_body(resp: reqwest::Response, label: &'static str) -> anyhow::Result<String> {
	let status = resp.status();
	let body = resp.text().await.with_context(|| format!("helix {label} read body"))?;
	if !status.is_success() {
		anyhow::bail!("helix {label} failed: status={status} body={body}");
	}
	Ok(body)
}

/// True when the error came from a 401/403 response.
pub fn is_helix_auth_error(err: &anyhow::Error) -> bool {
	format!("{err:#}").to_ascii_lowercase().contains("helix auth failed")
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchTokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

#[derive(Clone)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	tokens: Arc<dyn TokenProvider>,
}

#[derive(Debug, Serialize)]
struct HelixSendChatMessage<'a> {
	broadcaster_id: &'a str,
	sender_id: &'a str,
	message: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixBanRequest<'a> {
	data: HelixBanData<'a>,
}

#[derive(Debug, Serialize)]
struct HelixBanData<'a> {
	user_id: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	duration: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reason: Option<&'a str>,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("streambot/0.x (helix)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
			tokens,
		})
	}

	pub fn tokens(&self) -> &Arc<dyn TokenProvider> {
		&self.tokens
	}

	async fn authed(&self, req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
		let token = self.tokens.access_token().await.context("helix access token")?;
		Ok(req
			.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", token.expose())))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	pub(crate) async fn create_eventsub_subscription(
		&self,
		kind: &str,
		version: &str,
		session_id: &str,
		condition: &serde_json::Value,
	) -> anyhow::Result<HelixCreateSubscriptionResponse> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;

		let req = HelixCreateSubscriptionRequest {
			r#type: kind,
			version,
			condition,
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url)).await?.json(&req),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={kind}): body={body}");
		}
		if !status.is_success() {
			anyhow::bail!("helix create subscription failed (type={kind}): status={status} body={body}");
		}

		serde_json::from_str(&body).with_context(|| format!("helix create subscription parse json (type={kind})"))
	}

	pub async fn get_user_by_login(&self, login: &str) -> anyhow::Result<Option<HelixUser>> {
		let url = self.url(&format!("/helix/users?login={}", urlencoding::encode(login)))?;

		let resp = send_with_retry(self.authed(self.http.get(url)).await?, "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;
		let body = success_body(resp, "GET /helix/users").await?;

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data.into_iter().next())
	}

	pub async fn get_token_user(&self) -> anyhow::Result<HelixUser> {
		let url = self.url("/helix/users")?;

		let resp = send_with_retry(self.authed(self.http.get(url)).await?, "GET /helix/users (whoami)")
			.await
			.context("helix GET /helix/users (whoami) send")?;
		let body = success_body(resp, "GET /helix/users (whoami)").await?;

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users (whoami) parse json")?;
		parsed.data.into_iter().next().context("helix whoami returned empty data")
	}

	fn broadcaster_user_url(&self, base: &str, broadcaster_id: &str, user_id: &str) -> anyhow::Result<Url> {
		self.url(&format!(
			"{base}?broadcaster_id={b}&user_id={u}",
			b = urlencoding::encode(broadcaster_id),
			u = urlencoding::encode(user_id),
		))
	}

	pub async fn is_user_moderator_in_channel(&self, broadcaster_id: &str, user_id: &str) -> anyhow::Result<bool> {
		let url = self.broadcaster_user_url(MODERATION_MODERATORS_PATH, broadcaster_id, user_id)?;

		let resp = send_with_retry(self.authed(self.http.get(url)).await?, "GET /helix/moderation/moderators")
			.await
			.context("helix GET /helix/moderation/moderators send")?;
		let body = success_body(resp, "GET /helix/moderation/moderators").await?;

		let parsed: HelixChannelUsersResponse = serde_json::from_str(&body).context("helix moderators parse json")?;
		Ok(parsed.data.iter().any(|m| m.user_id == user_id))
	}

	pub async fn is_user_vip_in_channel(&self, broadcaster_id: &str, user_id: &str) -> anyhow::Result<bool> {
		let url = self.broadcaster_user_url(CHANNEL_VIPS_PATH, broadcaster_id, user_id)?;

		let resp = send_with_retry(self.authed(self.http.get(url)).await?, "GET /helix/channels/vips")
			.await
			.context("helix GET /helix/channels/vips send")?;
		let body = success_body(resp, "GET /helix/channels/vips").await?;

		let parsed: HelixChannelUsersResponse = serde_json::from_str(&body).context("helix vips parse json")?;
		Ok(parsed.data.iter().any(|v| v.user_id == user_id))
	}

	pub async fn add_vip(&self, broadcaster_id: &str, user_id: &str) -> anyhow::Result<()> {
		let url = self.broadcaster_user_url(CHANNEL_VIPS_PATH, broadcaster_id, user_id)?;
		let resp = send_with_retry(self.authed(self.http.post(url)).await?, "POST /helix/channels/vips").await?;
		success_body(resp, "POST /helix/channels/vips").await.map(drop)
	}

	pub async fn remove_vip(&self, broadcaster_id: &str, user_id: &str) -> anyhow::Result<()> {
		let url = self.broadcaster_user_url(CHANNEL_VIPS_PATH, broadcaster_id, user_id)?;
		let resp = send_with_retry(self.authed(self.http.delete(url)).await?, "DELETE /helix/channels/vips").await?;
		success_body(resp, "DELETE /helix/channels/vips").await.map(drop)
	}

	pub async fn add_moderator(&self, broadcaster_id: &str, user_id: &str) -> anyhow::Result<()> {
		let url = self.broadcaster_user_url(MODERATION_MODERATORS_PATH, broadcaster_id, user_id)?;
		let resp = send_with_retry(
			self.authed(self.http.post(url)).await?,
			"POST /helix/moderation/moderators",
		)
		.await?;
		success_body(resp, "POST /helix/moderation/moderators").await.map(drop)
	}

	pub async fn remove_moderator(&self, broadcaster_id: &str, user_id: &str) -> anyhow::Result<()> {
		let url = self.broadcaster_user_url(MODERATION_MODERATORS_PATH, broadcaster_id, user_id)?;
		let resp = send_with_retry(
			self.authed(self.http.delete(url)).await?,
			"DELETE /helix/moderation/moderators",
		)
		.await?;
		success_body(resp, "DELETE /helix/moderation/moderators").await.map(drop)
	}

	pub async fn send_chat_message(&self, broadcaster_id: &str, sender_id: &str, message: &str) -> anyhow::Result<()> {
		let url = self.url(CHAT_MESSAGES_PATH)?;
		let req = HelixSendChatMessage {
			broadcaster_id,
			sender_id,
			message,
		};
		let resp = send_with_retry(
			self.authed(self.http.post(url)).await?.json(&req),
			"POST /helix/chat/messages",
		)
		.await
		.context("helix POST /helix/chat/messages send")?;
		success_body(resp, "POST /helix/chat/messages").await.map(drop)
	}

	pub async fn delete_chat_message(&self, broadcaster_id: &str, moderator_id: &str, message_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?broadcaster_id={b}&moderator_id={m}&message_id={msg}",
			base = MODERATION_CHAT_PATH,
			b = urlencoding::encode(broadcaster_id),
			m = urlencoding::encode(moderator_id),
			msg = urlencoding::encode(message_id),
		))?;
		let resp = send_with_retry(self.authed(self.http.delete(url)).await?, "DELETE /helix/moderation/chat")
			.await
			.context("helix DELETE /helix/moderation/chat send")?;
		success_body(resp, "DELETE /helix/moderation/chat").await.map(drop)
	}

	/// Ban, or time out when `duration_seconds` is set.
	pub async fn ban_user(
		&self,
		broadcaster_id: &str,
		moderator_id: &str,
		user_id: &str,
		duration_seconds: Option<u32>,
		reason: Option<&str>,
	) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?broadcaster_id={b}&moderator_id={m}",
			base = MODERATION_BANS_PATH,
			b = urlencoding::encode(broadcaster_id),
			m = urlencoding::encode(moderator_id),
		))?;
		let req = HelixBanRequest {
			data: HelixBanData {
				user_id,
				duration: duration_seconds,
				reason,
			},
		};
		let resp = send_with_retry(
			self.authed(self.http.post(url)).await?.json(&req),
			"POST /helix/moderation/bans",
		)
		.await
		.context("helix POST /helix/moderation/bans send")?;
		success_body(resp, "POST /helix/moderation/bans").await.map(drop)
	}

	pub async fn send_shoutout(&self, from_broadcaster_id: &str, to_broadcaster_id: &str, moderator_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?from_broadcaster_id={f}&to_broadcaster_id={t}&moderator_id={m}",
			base = CHAT_SHOUTOUTS_PATH,
			f = urlencoding::encode(from_broadcaster_id),
			t = urlencoding::encode(to_broadcaster_id),
			m = urlencoding::encode(moderator_id),
		))?;
		let resp = send_with_retry(self.authed(self.http.post(url)).await?, "POST /helix/chat/shoutouts").await?;
		success_body(resp, "POST /helix/chat/shoutouts").await.map(drop)
	}

	pub(crate) async fn list_eventsub_subscriptions_by_type(
		&self,
		subscription_type: &str,
		after: Option<&str>,
	) -> anyhow::Result<HelixListSubscriptionsResponse> {
		let mut path = format!(
			"{base}?type={ty}",
			base = EVENTSUB_SUBSCRIPTIONS_PATH,
			ty = urlencoding::encode(subscription_type)
		);
		if let Some(after) = after {
			path.push_str("&after=");
			path.push_str(&urlencoding::encode(after));
		}

		let url = self.url(&path)?;

		let resp = send_with_retry(self.authed(self.http.get(url)).await?, "GET /helix/eventsub/subscriptions")
			.await
			.context("helix GET /helix/eventsub/subscriptions send")?;
		let body = success_body(resp, "GET /helix/eventsub/subscriptions").await?;

		serde_json::from_str(&body).context("helix list subscriptions parse json")
	}

	pub(crate) async fn list_all_eventsub_subscriptions_by_type(
		&self,
		subscription_type: &str,
	) -> anyhow::Result<Vec<HelixSubscriptionData>> {
		let mut out: Vec<HelixSubscriptionData> = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let page = self
				.list_eventsub_subscriptions_by_type(subscription_type, after.as_deref())
				.await?;

			out.extend(page.data);

			let next = page.pagination.and_then(|p| p.cursor);
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}
}

pub async fn validate_user_token(access_token: &str) -> anyhow::Result<TwitchTokenValidation> {
	let http = reqwest::Client::builder()
		.user_agent("streambot/0.x (oauth-validate)")
		.build()
		.context("build reqwest client")?;

	let resp = http
		.get(TOKEN_VALIDATE_URL)
		.header("Authorization", format!("OAuth {}", access_token))
		.send()
		.await
		.context("twitch validate token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch validate token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch validate token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch validate token parse json")
}

#[derive(Debug, Deserialize)]
pub struct TwitchTokenRefreshResponse {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	pub expires_in: u64,
}

pub async fn refresh_user_token(
	client_id: &str,
	client_secret: &str,
	refresh_token: &str,
) -> anyhow::Result<TwitchTokenRefreshResponse> {
	let http = reqwest::Client::builder()
		.user_agent("streambot/0.x (oauth-refresh)")
		.build()
		.context("build reqwest client")?;

	let resp = http
		.post(TOKEN_REFRESH_URL)
		.form(&[
			("grant_type", "refresh_token"),
			("client_id", client_id),
			("client_secret", client_secret),
			("refresh_token", refresh_token),
		])
		.send()
		.await
		.context("twitch refresh token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch refresh token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch refresh token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch refresh token parse json")
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixUsersResponse {
	pub(crate) data: Vec<HelixUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,
	#[serde(default)]
	pub display_name: Option<String>,
}

/// Shape shared by the moderators and VIPs listings.
#[derive(Debug, Deserialize)]
pub(crate) struct HelixChannelUsersResponse {
	pub(crate) data: Vec<HelixChannelUser>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixChannelUser {
	pub(crate) user_id: String,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'a str,
	version: &'a str,
	condition: &'a serde_json::Value,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'a str,
	session_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixCreateSubscriptionResponse {
	pub(crate) data: Vec<HelixSubscriptionData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixListSubscriptionsResponse {
	pub(crate) data: Vec<HelixSubscriptionData>,
	#[serde(default)]
	pub(crate) pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixPagination {
	#[serde(default)]
	pub(crate) cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixSubscriptionData {
	pub(crate) id: String,
	pub(crate) status: String,
	#[serde(rename = "type")]
	pub(crate) r#type: String,
	#[serde(default)]
	pub(crate) condition: serde_json::Value,
	#[serde(default)]
	pub(crate) transport: Option<serde_json::Value>,
}
