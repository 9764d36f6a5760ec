#![forbid(unsafe_code)]

use anyhow::Context;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::twitch::helix::{HelixClient, HelixSubscriptionData, is_helix_auth_error};

/// One EventSub subscription the bot keeps on its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
	pub kind: &'static str,
	pub version: &'static str,
	pub condition: serde_json::Value,
}

/// The bot's subscription set. The token user is both broadcaster and moderator.
pub fn default_subscriptions(broadcaster_id: &str, moderator_id: &str) -> Vec<SubscriptionSpec> {
	vec![
		SubscriptionSpec {
			kind: "channel.follow",
			version: "2",
			condition: json!({ "broadcaster_user_id": broadcaster_id, "moderator_user_id": moderator_id }),
		},
		SubscriptionSpec {
			kind: "channel.channel_points_custom_reward_redemption.add",
			version: "1",
			condition: json!({ "broadcaster_user_id": broadcaster_id }),
		},
		SubscriptionSpec {
			kind: "channel.raid",
			version: "1",
			condition: json!({ "to_broadcaster_user_id": broadcaster_id }),
		},
		SubscriptionSpec {
			kind: "channel.subscribe",
			version: "1",
			condition: json!({ "broadcaster_user_id": broadcaster_id }),
		},
		SubscriptionSpec {
			kind: "channel.bits.use",
			version: "1",
			condition: json!({ "broadcaster_user_id": broadcaster_id }),
		},
	]
}

fn condition_value<'a>(condition: &'a serde_json::Value, key: &str) -> &'a str {
	condition.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

fn condition_matches(existing: &serde_json::Value, wanted: &serde_json::Value) -> bool {
	wanted
		.as_object()
		.is_some_and(|w| w.keys().all(|k| condition_value(existing, k) == condition_value(wanted, k)))
}

fn transport_session_id(transport: &Option<serde_json::Value>) -> Option<&str> {
	transport.as_ref().and_then(|t| t.get("session_id")).and_then(|v| v.as_str())
}

/// True when no enabled subscription with the same type and condition exists on `session_id`.
pub(crate) fn needs_subscription(existing: &[HelixSubscriptionData], spec: &SubscriptionSpec, session_id: &str) -> bool {
	!existing.iter().any(|s| {
		s.r#type == spec.kind
			&& s.status == "enabled"
			&& transport_session_id(&s.transport) == Some(session_id)
			&& condition_matches(&s.condition, &spec.condition)
	})
}

/// Creates the bot's subscriptions for a freshly welcomed session.
#[async_trait::async_trait]
pub trait EventSubSubscriber: Send + Sync {
	async fn subscribe_all(&self, session_id: &str) -> anyhow::Result<()>;
}

pub struct HelixSubscriber {
	helix: HelixClient,
	specs: Vec<SubscriptionSpec>,
}

impl HelixSubscriber {
	pub fn new(helix: HelixClient, specs: Vec<SubscriptionSpec>) -> Self {
		Self { helix, specs }
	}

	async fn ensure(&self, session_id: &str, spec: &SubscriptionSpec) -> anyhow::Result<()> {
		let existing = self
			.helix
			.list_all_eventsub_subscriptions_by_type(spec.kind)
			.await
			.with_context(|| format!("list subscriptions type={}", spec.kind))?;

		if !needs_subscription(&existing, spec, session_id) {
			debug!(kind = spec.kind, "already subscribed on this session; skipping");
			return Ok(());
		}

		match self
			.helix
			.create_eventsub_subscription(spec.kind, spec.version, session_id, &spec.condition)
			.await
		{
			Ok(resp) => {
				let id = resp.data.first().map(|sub| sub.id.as_str());
				info!(kind = spec.kind, version = spec.version, id = ?id, "eventsub subscription created");
				Ok(())
			}
			Err(e) if format!("{e:#}").contains("conflict") => {
				debug!(kind = spec.kind, "subscription already exists (conflict)");
				Ok(())
			}
			Err(e) => Err(e),
		}
	}

	/// One pass over every spec; returns `true` if a call was rejected as unauthorized.
	async fn subscribe_pass(&self, session_id: &str) -> bool {
		let mut auth_failed = false;
		for spec in &self.specs {
			if let Err(e) = self.ensure(session_id, spec).await {
				if is_helix_auth_error(&e) {
					auth_failed = true;
					break;
				}
				warn!(kind = spec.kind, error = %format!("{e:#}"), "eventsub subscription failed");
			}
		}
		auth_failed
	}
}

#[async_trait::async_trait]
impl EventSubSubscriber for HelixSubscriber {
	async fn subscribe_all(&self, session_id: &str) -> anyhow::Result<()> {
		if !self.subscribe_pass(session_id).await {
			return Ok(());
		}

		warn!("eventsub subscription rejected token; refreshing and retrying once");
		self.helix
			.tokens()
			.force_refresh()
			.await
			.context("refresh token after subscription auth failure")?;

		if self.subscribe_pass(session_id).await {
			anyhow::bail!("eventsub subscriptions still unauthorized after token refresh");
		}
		Ok(())
	}
}
