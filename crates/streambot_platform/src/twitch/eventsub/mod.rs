#![forbid(unsafe_code)]

pub mod connection;
pub mod guard;
pub mod subscriptions;


use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use streambot_domain::{BotEvent, ChannelId, EventMeta, EventPayload, Raid, Redemption};
use tokio::time::Instant;

pub use connection::{DEFAULT_EVENTSUB_WS_URL, EventSubConfig, EventSubConnection};
pub use guard::{EventSubGuard, EventSubGuardError};
pub use subscriptions::{EventSubSubscriber, HelixSubscriber, SubscriptionSpec, default_subscriptions};

/// Notification metadata. Routing reads the type fields through [`EventSubMetadataPeek`].
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	pub(crate) message_id: String,
	pub(crate) message_timestamp: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeek {
	pub(crate) metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeekInner {
	#[serde(default)]
	pub(crate) message_id: Option<String>,
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSessionMessage {
	pub(crate) payload: EventSubSessionPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSessionPayload {
	pub(crate) session: EventSubSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSession {
	pub(crate) id: String,

	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	pub(crate) reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotification<TEvent> {
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotificationPayload<TEvent> {
	pub(crate) event: TEvent,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSubscription {
	#[serde(rename = "type")]
	pub(crate) r#type: String,
	#[serde(default)]
	pub(crate) status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevocation {
	pub(crate) payload: EventSubRevocationPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevocationPayload {
	pub(crate) subscription: EventSubSubscription,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelFollowEvent {
	pub(crate) user_id: String,
	#[allow(dead_code)]
	pub(crate) user_login: String,
	pub(crate) user_name: String,
	pub(crate) broadcaster_user_id: String,
	#[serde(default)]
	pub(crate) followed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelRedemptionEvent {
	pub(crate) user_id: String,
	pub(crate) user_login: String,
	pub(crate) user_name: String,
	pub(crate) broadcaster_user_id: String,
	#[serde(default)]
	pub(crate) user_input: Option<String>,
	pub(crate) reward: ChannelReward,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelReward {
	pub(crate) id: String,
	pub(crate) title: String,
	pub(crate) cost: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelRaidEvent {
	pub(crate) from_broadcaster_user_id: String,
	pub(crate) from_broadcaster_user_login: String,
	pub(crate) from_broadcaster_user_name: String,
	pub(crate) to_broadcaster_user_id: String,
	pub(crate) viewers: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelSubscribeEvent {
	pub(crate) user_id: String,
	pub(crate) user_name: String,
	pub(crate) broadcaster_user_id: String,
	pub(crate) tier: String,
	#[serde(default)]
	pub(crate) is_gift: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelBitsUseEvent {
	#[serde(default)]
	pub(crate) user_id: Option<String>,
	#[serde(default)]
	pub(crate) user_name: Option<String>,
	pub(crate) broadcaster_user_id: String,
	pub(crate) bits: u64,
}

/// Convert an RFC3339 EventSub timestamp into Unix milliseconds.
pub(crate) fn parse_timestamp_ms(ts: &str) -> anyhow::Result<i64> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(dt.timestamp_millis())
}

pub(crate) fn peek(raw_json: &str) -> anyhow::Result<EventSubMetadataPeekInner> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata)
}

pub(crate) fn parse_session(raw_json: &str) -> anyhow::Result<EventSubSession> {
	let msg: EventSubSessionMessage = serde_json::from_str(raw_json).context("parse EventSub session message")?;
	Ok(msg.payload.session)
}

pub(crate) fn parse_revocation(raw_json: &str) -> anyhow::Result<EventSubSubscription> {
	let msg: EventSubRevocation = serde_json::from_str(raw_json).context("parse EventSub revocation")?;
	Ok(msg.payload.subscription)
}

fn channel(id: &str) -> Option<ChannelId> {
	ChannelId::new(id).ok()
}

fn meta(id: String, timestamp_ms: i64, user_id: Option<String>, user_name: Option<String>, channel_id: &str) -> EventMeta {
	EventMeta {
		id,
		timestamp_ms,
		user_id,
		user_name,
		channel_id: channel(channel_id),
	}
}

fn parse<T: serde::de::DeserializeOwned>(raw_json: &str, ty: &str) -> anyhow::Result<EventSubNotification<T>> {
	serde_json::from_str(raw_json).with_context(|| format!("parse {ty} notification"))
}

/// Turn a `notification` frame into an event. `Ok(None)` for frames that are not
/// notifications or whose subscription type the bot does not handle.
pub fn normalize_notification(raw_json: &str) -> anyhow::Result<Option<BotEvent>> {
	let peeked = peek(raw_json)?;
	if peeked.message_type != "notification" {
		return Ok(None);
	}
	let Some(ty) = peeked.subscription_type else {
		return Ok(None);
	};

	let event = match ty.as_str() {
		"channel.follow" => {
			let msg: EventSubNotification<ChannelFollowEvent> = parse(raw_json, &ty)?;
			let ts = parse_timestamp_ms(&msg.metadata.message_timestamp)?;
			let ev = msg.payload.event;
			let followed_ms = ev
				.followed_at
				.as_deref()
				.and_then(|f| parse_timestamp_ms(f).ok())
				.unwrap_or(ts);
			BotEvent::new(
				meta(
					format!("follow_{followed_ms}_{}", ev.user_id),
					ts,
					Some(ev.user_id),
					Some(ev.user_name),
					&ev.broadcaster_user_id,
				),
				EventPayload::Follow,
			)
		}
		"channel.channel_points_custom_reward_redemption.add" => {
			let msg: EventSubNotification<ChannelRedemptionEvent> = parse(raw_json, &ty)?;
			let ts = parse_timestamp_ms(&msg.metadata.message_timestamp)?;
			let ev = msg.payload.event;
			let user_input = ev.user_input.filter(|s| !s.trim().is_empty());
			BotEvent::new(
				meta(
					format!("redemption_{ts}_{}_{}", ev.user_id, ev.reward.id),
					ts,
					Some(ev.user_id),
					Some(ev.user_name),
					&ev.broadcaster_user_id,
				),
				EventPayload::Redemption(Redemption {
					reward_id: ev.reward.id,
					reward_title: ev.reward.title,
					reward_cost: ev.reward.cost,
					user_input,
					user_login: Some(ev.user_login),
				}),
			)
		}
		"channel.raid" => {
			let msg: EventSubNotification<ChannelRaidEvent> = parse(raw_json, &ty)?;
			let ts = parse_timestamp_ms(&msg.metadata.message_timestamp)?;
			let ev = msg.payload.event;
			BotEvent::new(
				meta(
					format!("raid_{ts}_{}", ev.from_broadcaster_user_id),
					ts,
					Some(ev.from_broadcaster_user_id.clone()),
					Some(ev.from_broadcaster_user_name.clone()),
					&ev.to_broadcaster_user_id,
				),
				EventPayload::Raid(Raid {
					from_id: ev.from_broadcaster_user_id,
					from_login: ev.from_broadcaster_user_login,
					from_name: ev.from_broadcaster_user_name,
					viewers: ev.viewers,
				}),
			)
		}
		"channel.subscribe" => {
			let msg: EventSubNotification<ChannelSubscribeEvent> = parse(raw_json, &ty)?;
			let ts = parse_timestamp_ms(&msg.metadata.message_timestamp)?;
			let ev = msg.payload.event;
			let text = if ev.is_gift {
				format!("{} received a gifted tier {} sub", ev.user_name, ev.tier)
			} else {
				format!("{} subscribed at tier {}", ev.user_name, ev.tier)
			};
			BotEvent::new(
				meta(
					msg.metadata.message_id,
					ts,
					Some(ev.user_id),
					Some(ev.user_name),
					&ev.broadcaster_user_id,
				),
				EventPayload::System { text },
			)
		}
		"channel.bits.use" => {
			let msg: EventSubNotification<ChannelBitsUseEvent> = parse(raw_json, &ty)?;
			let ts = parse_timestamp_ms(&msg.metadata.message_timestamp)?;
			let ev = msg.payload.event;
			let who = ev.user_name.clone().unwrap_or_else(|| "anonymous".to_string());
			BotEvent::new(
				meta(msg.metadata.message_id, ts, ev.user_id, ev.user_name, &ev.broadcaster_user_id),
				EventPayload::System {
					text: format!("{who} used {} bits", ev.bits),
				},
			)
		}
		_ => return Ok(None),
	};

	Ok(Some(event))
}

/// Drops frames whose `message_id` was already seen inside the window.
pub struct MessageDedup {
	window: Duration,
	seen: HashMap<String, Instant>,
	order: VecDeque<(Instant, String)>,
}

impl MessageDedup {
	pub fn new(window: Duration) -> Self {
		Self {
			window,
			seen: HashMap::new(),
			order: VecDeque::new(),
		}
	}

	/// Record `id`; returns `false` if it is a duplicate.
	pub fn insert(&mut self, id: &str) -> bool {
		let now = Instant::now();
		self.prune(now);
		if self.seen.contains_key(id) {
			return false;
		}
		self.seen.insert(id.to_string(), now);
		self.order.push_back((now, id.to_string()));
		true
	}

	pub fn len(&self) -> usize {
		self.seen.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.is_empty()
	}

	fn prune(&mut self, now: Instant) {
		while let Some((at, _)) = self.order.front() {
			if now.duration_since(*at) < self.window {
				break;
			}
			if let Some((_, id)) = self.order.pop_front() {
				self.seen.remove(&id);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn notification(ty: &str, event: serde_json::Value) -> String {
		serde_json::json!({
			"metadata": {
				"message_id": "m-1",
				"message_type": "notification",
				"message_timestamp": "2024-05-01T12:00:00.123456789Z",
				"subscription_type": ty,
				"subscription_version": "1"
			},
			"payload": {
				"subscription": { "id": "s-1", "type": ty, "status": "enabled" },
				"event": event
			}
		})
		.to_string()
	}

	#[test]
	fn follow_becomes_follow_event() {
		let raw = notification(
			"channel.follow",
			serde_json::json!({
				"user_id": "77", "user_login": "fan", "user_name": "Fan",
				"broadcaster_user_id": "42", "broadcaster_user_login": "chan", "broadcaster_user_name": "Chan",
				"followed_at": "2024-05-01T11:59:59Z"
			}),
		);
		let ev = normalize_notification(&raw).unwrap().unwrap();
		assert_eq!(ev.payload, EventPayload::Follow);
		assert_eq!(ev.id(), "follow_1714564799000_77");
		assert_eq!(ev.meta.user_name.as_deref(), Some("Fan"));
		assert_eq!(ev.meta.channel_id.as_ref().map(|c| c.as_str()), Some("42"));
		assert_eq!(ev.meta.timestamp_ms, 1_714_564_800_123);
	}

	#[test]
	fn redemption_carries_reward_fields() {
		let raw = notification(
			"channel.channel_points_custom_reward_redemption.add",
			serde_json::json!({
				"id": "r-1", "user_id": "77", "user_login": "fan", "user_name": "Fan",
				"broadcaster_user_id": "42", "user_input": "  ",
				"reward": { "id": "rw", "title": "Pull", "cost": 500, "prompt": "" }
			}),
		);
		let ev = normalize_notification(&raw).unwrap().unwrap();
		let r = ev.redemption().unwrap();
		assert_eq!(r.reward_id, "rw");
		assert_eq!(r.reward_title, "Pull");
		assert_eq!(r.reward_cost, 500);
		assert_eq!(r.user_input, None);
		assert!(ev.id().starts_with("redemption_1714564800123_77_rw"));
	}

	#[test]
	fn raid_carries_viewers() {
		let raw = notification(
			"channel.raid",
			serde_json::json!({
				"from_broadcaster_user_id": "9", "from_broadcaster_user_login": "raider", "from_broadcaster_user_name": "Raider",
				"to_broadcaster_user_id": "42", "to_broadcaster_user_login": "chan", "to_broadcaster_user_name": "Chan",
				"viewers": 31
			}),
		);
		let ev = normalize_notification(&raw).unwrap().unwrap();
		match ev.payload {
			EventPayload::Raid(r) => {
				assert_eq!(r.from_login, "raider");
				assert_eq!(r.viewers, 31);
			}
			other => panic!("unexpected payload: {other:?}"),
		}
	}

	#[test]
	fn bits_become_system_text() {
		let raw = notification(
			"channel.bits.use",
			serde_json::json!({ "user_id": "77", "user_name": "Fan", "broadcaster_user_id": "42", "bits": 100 }),
		);
		let ev = normalize_notification(&raw).unwrap().unwrap();
		assert_eq!(
			ev.payload,
			EventPayload::System {
				text: "Fan used 100 bits".to_string()
			}
		);
	}

	#[test]
	fn unknown_types_and_keepalives_are_skipped() {
		let raw = notification("channel.hype_train.begin", serde_json::json!({}));
		assert!(normalize_notification(&raw).unwrap().is_none());

		let keepalive = r#"{"metadata":{"message_id":"k","message_type":"session_keepalive","message_timestamp":"2024-05-01T12:00:00Z"},"payload":{}}"#;
		assert!(normalize_notification(keepalive).unwrap().is_none());
	}

	#[test]
	fn malformed_notification_is_an_error() {
		let raw = notification("channel.follow", serde_json::json!({ "user_id": 5 }));
		assert!(normalize_notification(&raw).is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn dedup_drops_repeats_inside_window_only() {
		let mut dedup = MessageDedup::new(Duration::from_secs(300));
		assert!(dedup.insert("a"));
		assert!(!dedup.insert("a"));
		assert!(dedup.insert("b"));

		tokio::time::advance(Duration::from_secs(301)).await;
		assert!(dedup.insert("a"));
		assert_eq!(dedup.len(), 1);
	}
}
