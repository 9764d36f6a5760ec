#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Platform channel (broadcaster) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("whitespace in channel id: {id:?}")));
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.trim().to_string())
	}
}

/// Prefix for ids of events the bot authored itself.
pub const BOT_EVENT_ID_PREFIX: &str = "bot_";

/// Role flags derived from chat badges or API lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRoles {
	pub moderator: bool,
	pub vip: bool,
	pub broadcaster: bool,
	pub staff: bool,
	pub admin: bool,
	pub global_mod: bool,
}

impl ChatRoles {
	/// Broadcaster or moderator.
	pub fn can_moderate(&self) -> bool {
		self.broadcaster || self.moderator
	}
}

/// Emote occurrence in message text, char offsets, inclusive end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmotePosition {
	pub id: String,
	pub start: usize,
	pub end: usize,
}

/// Fields shared by every event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
	/// Unique per connection lifetime.
	pub id: String,
	pub timestamp_ms: i64,
	pub user_id: Option<String>,
	pub user_name: Option<String>,
	pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub text: String,
	pub color: String,
	pub roles: ChatRoles,
	pub emotes: Vec<EmotePosition>,
	/// Set only when the message came from a linked (shared chat) channel.
	pub source_channel_id: Option<ChannelId>,
	pub user_login: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
	pub reward_id: String,
	pub reward_title: String,
	pub reward_cost: i64,
	pub user_input: Option<String>,
	pub user_login: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raid {
	pub from_id: String,
	pub from_login: String,
	pub from_name: String,
	pub viewers: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
	Chat(ChatMessage),
	System { text: String },
	Join,
	Part,
	MessageDeleted { target_id: String },
	Follow,
	Redemption(Redemption),
	Raid(Raid),
}

/// Normalized event produced by either feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotEvent {
	pub meta: EventMeta,
	pub payload: EventPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Chat,
	System,
	Join,
	Part,
	MessageDeleted,
	Follow,
	Redemption,
	Raid,
}

impl EventKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Chat => "chat",
			EventKind::System => "system",
			EventKind::Join => "join",
			EventKind::Part => "part",
			EventKind::MessageDeleted => "message_deleted",
			EventKind::Follow => "follow",
			EventKind::Redemption => "redemption",
			EventKind::Raid => "raid",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl BotEvent {
	pub fn new(meta: EventMeta, payload: EventPayload) -> Self {
		Self { meta, payload }
	}

	pub fn id(&self) -> &str {
		&self.meta.id
	}

	pub fn kind(&self) -> EventKind {
		match &self.payload {
			EventPayload::Chat(_) => EventKind::Chat,
			EventPayload::System { .. } => EventKind::System,
			EventPayload::Join => EventKind::Join,
			EventPayload::Part => EventKind::Part,
			EventPayload::MessageDeleted { .. } => EventKind::MessageDeleted,
			EventPayload::Follow => EventKind::Follow,
			EventPayload::Redemption(_) => EventKind::Redemption,
			EventPayload::Raid(_) => EventKind::Raid,
		}
	}

	pub fn chat(&self) -> Option<&ChatMessage> {
		match &self.payload {
			EventPayload::Chat(msg) => Some(msg),
			_ => None,
		}
	}

	pub fn redemption(&self) -> Option<&Redemption> {
		match &self.payload {
			EventPayload::Redemption(r) => Some(r),
			_ => None,
		}
	}

	/// True for events the bot authored itself.
	pub fn is_bot_authored(&self) -> bool {
		self.meta.id.starts_with(BOT_EVENT_ID_PREFIX)
	}
}

/// Side effect requested by a processor, executed by the action executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
	SendMessage { text: String, forward_to_ui: bool },
	Timeout { user_id: String, duration_secs: u32, reason: String },
	DeleteMessage { message_id: String },
	AddVip { user_id: String },
	RemoveVip { user_id: String },
	AddModerator { user_id: String },
	RemoveModerator { user_id: String },
	Shoutout { user_id: String },
}

impl Action {
	pub fn send(text: impl Into<String>) -> Self {
		Action::SendMessage {
			text: text.into(),
			forward_to_ui: true,
		}
	}

	pub fn kind(&self) -> ActionKind {
		match self {
			Action::SendMessage { .. } => ActionKind::SendMessage,
			Action::Timeout { .. } => ActionKind::Timeout,
			Action::DeleteMessage { .. } => ActionKind::DeleteMessage,
			Action::AddVip { .. } => ActionKind::AddVip,
			Action::RemoveVip { .. } => ActionKind::RemoveVip,
			Action::AddModerator { .. } => ActionKind::AddModerator,
			Action::RemoveModerator { .. } => ActionKind::RemoveModerator,
			Action::Shoutout { .. } => ActionKind::Shoutout,
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown action type: {0}")]
pub struct ParseActionKindError(pub String);

/// Stable action type strings, as stored by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
	#[serde(rename = "send_message")]
	SendMessage,
	#[serde(rename = "timeout")]
	Timeout,
	#[serde(rename = "delete_message")]
	DeleteMessage,
	#[serde(rename = "add_vip")]
	AddVip,
	#[serde(rename = "remove_vip")]
	RemoveVip,
	#[serde(rename = "add_mod")]
	AddModerator,
	#[serde(rename = "remove_mod")]
	RemoveModerator,
	#[serde(rename = "shoutout")]
	Shoutout,
}

impl ActionKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ActionKind::SendMessage => "send_message",
			ActionKind::Timeout => "timeout",
			ActionKind::DeleteMessage => "delete_message",
			ActionKind::AddVip => "add_vip",
			ActionKind::RemoveVip => "remove_vip",
			ActionKind::AddModerator => "add_mod",
			ActionKind::RemoveModerator => "remove_mod",
			ActionKind::Shoutout => "shoutout",
		}
	}
}

impl fmt::Display for ActionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ActionKind {
	type Err = ParseActionKindError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"send_message" => Ok(ActionKind::SendMessage),
			"timeout" | "mute_user" => Ok(ActionKind::Timeout),
			"delete_message" => Ok(ActionKind::DeleteMessage),
			"add_vip" => Ok(ActionKind::AddVip),
			"remove_vip" => Ok(ActionKind::RemoveVip),
			"add_mod" => Ok(ActionKind::AddModerator),
			"remove_mod" => Ok(ActionKind::RemoveModerator),
			"shoutout" => Ok(ActionKind::Shoutout),
			other => Err(ParseActionKindError(other.to_string())),
		}
	}
}
