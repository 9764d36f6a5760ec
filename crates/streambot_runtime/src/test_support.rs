#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use streambot_domain::{Action, BotEvent, ChannelId, ChatMessage, ChatRoles, EventMeta, EventPayload, Raid, Redemption};
use streambot_platform::{ChannelApi, UserInfo, UserRoles};
use tokio::sync::Notify;

use crate::pipeline::ActionExecutor;

pub const HOME_CHANNEL: &str = "1000";

/// Executor that records every action it is handed.
#[derive(Default)]
pub struct RecordingExecutor {
	actions: parking_lot::Mutex<Vec<Action>>,
	fail_with: Option<String>,
	gate: Option<Arc<Notify>>,
	started: Notify,
}

impl RecordingExecutor {
	pub fn failing(message: &str) -> Self {
		Self {
			fail_with: Some(message.to_string()),
			..Self::default()
		}
	}

	/// Blocks every execution until `gate` is notified.
	pub fn gated(gate: Arc<Notify>) -> Self {
		Self {
			gate: Some(gate),
			..Self::default()
		}
	}

	pub fn actions(&self) -> Vec<Action> {
		self.actions.lock().clone()
	}

	pub async fn wait_started(&self) {
		self.started.notified().await;
	}
}

#[async_trait::async_trait]
impl ActionExecutor for RecordingExecutor {
	async fn execute(&self, action: &Action) -> anyhow::Result<()> {
		self.actions.lock().push(action.clone());
		self.started.notify_one();
		if let Some(gate) = &self.gate {
			gate.notified().await;
		}
		match &self.fail_with {
			Some(message) => Err(anyhow!(message.clone())),
			None => Ok(()),
		}
	}
}

/// In-memory channel that records calls and serves canned lookups.
#[derive(Default)]
pub struct FakeApi {
	pub calls: parking_lot::Mutex<Vec<String>>,
	pub roles: parking_lot::Mutex<HashMap<String, UserRoles>>,
	pub users: parking_lot::Mutex<HashMap<String, UserInfo>>,
	pub fail_lookups: bool,
	pub user_lookups: AtomicUsize,
}

impl FakeApi {
	pub fn with_user(self, id: &str, login: &str) -> Self {
		self.users.lock().insert(
			login.to_string(),
			UserInfo {
				id: id.to_string(),
				login: login.to_string(),
				display_name: Some(login.to_uppercase()),
			},
		);
		self
	}

	pub fn with_roles(self, id: &str, roles: UserRoles) -> Self {
		self.roles.lock().insert(id.to_string(), roles);
		self
	}

	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().clone()
	}

	fn record(&self, call: String) {
		self.calls.lock().push(call);
	}
}

#[async_trait::async_trait]
impl ChannelApi for FakeApi {
	async fn send_message(&self, text: &str) -> anyhow::Result<()> {
		self.record(format!("send:{text}"));
		Ok(())
	}

	async fn timeout_user(&self, user_id: &str, duration_secs: u32, _reason: Option<&str>) -> anyhow::Result<()> {
		self.record(format!("timeout:{user_id}:{duration_secs}"));
		Ok(())
	}

	async fn delete_message(&self, message_id: &str) -> anyhow::Result<()> {
		self.record(format!("delete:{message_id}"));
		Ok(())
	}

	async fn add_moderator(&self, user_id: &str) -> anyhow::Result<()> {
		self.record(format!("add_mod:{user_id}"));
		Ok(())
	}

	async fn remove_moderator(&self, user_id: &str) -> anyhow::Result<()> {
		self.record(format!("remove_mod:{user_id}"));
		Ok(())
	}

	async fn add_vip(&self, user_id: &str) -> anyhow::Result<()> {
		self.record(format!("add_vip:{user_id}"));
		Ok(())
	}

	async fn remove_vip(&self, user_id: &str) -> anyhow::Result<()> {
		self.record(format!("remove_vip:{user_id}"));
		Ok(())
	}

	async fn shoutout(&self, user_id: &str) -> anyhow::Result<()> {
		self.record(format!("shoutout:{user_id}"));
		Ok(())
	}

	async fn user_roles(&self, user_id: &str) -> anyhow::Result<UserRoles> {
		if self.fail_lookups {
			return Err(anyhow!("helix auth failed"));
		}
		Ok(self.roles.lock().get(user_id).copied().unwrap_or_default())
	}

	async fn user_by_login(&self, login: &str) -> anyhow::Result<Option<UserInfo>> {
		self.user_lookups.fetch_add(1, Ordering::Relaxed);
		if self.fail_lookups {
			return Err(anyhow!("helix auth failed"));
		}
		Ok(self.users.lock().get(&login.to_lowercase()).cloned())
	}
}

pub fn meta(id: &str, user_id: &str, user_name: &str) -> EventMeta {
	EventMeta {
		id: id.to_string(),
		timestamp_ms: 0,
		user_id: Some(user_id.to_string()),
		user_name: Some(user_name.to_string()),
		channel_id: ChannelId::new(HOME_CHANNEL).ok(),
	}
}

pub fn chat_with_roles(id: &str, user_id: &str, user_name: &str, text: &str, roles: ChatRoles) -> BotEvent {
	BotEvent::new(
		meta(id, user_id, user_name),
		EventPayload::Chat(ChatMessage {
			text: text.to_string(),
			color: "#FFFFFF".to_string(),
			roles,
			emotes: Vec::new(),
			source_channel_id: None,
			user_login: Some(user_name.to_lowercase()),
		}),
	)
}

pub fn chat(id: &str, user_id: &str, user_name: &str, text: &str) -> BotEvent {
	chat_with_roles(id, user_id, user_name, text, ChatRoles::default())
}

pub fn redemption(id: &str, user_id: &str, user_name: &str, reward_id: &str, input: Option<&str>) -> BotEvent {
	BotEvent::new(
		meta(id, user_id, user_name),
		EventPayload::Redemption(Redemption {
			reward_id: reward_id.to_string(),
			reward_title: format!("Reward {reward_id}"),
			reward_cost: 500,
			user_input: input.map(str::to_string),
			user_login: Some(user_name.to_lowercase()),
		}),
	)
}

pub fn raid(id: &str, from_id: &str, from_name: &str, viewers: u64) -> BotEvent {
	BotEvent::new(
		meta(id, from_id, from_name),
		EventPayload::Raid(Raid {
			from_id: from_id.to_string(),
			from_login: from_name.to_lowercase(),
			from_name: from_name.to_string(),
			viewers,
		}),
	)
}

/// Text of every `SendMessage` in `actions`.
pub fn sent(actions: &[Action]) -> Vec<String> {
	actions
		.iter()
		.filter_map(|a| match a {
			Action::SendMessage { text, .. } => Some(text.clone()),
			_ => None,
		})
		.collect()
}
