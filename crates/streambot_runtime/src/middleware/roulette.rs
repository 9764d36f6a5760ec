#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use streambot_domain::{Action, ActionKind, BotEvent};
use streambot_platform::roles::RolesCache;
use streambot_platform::{ChannelApi, unix_ms_now};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{display_name, fill_dollar};
use crate::config::BotConfig;
use crate::config::bot::RouletteConfig;
use crate::pipeline::{Middleware, MiddlewareOutput};
use crate::scheduler::{NewScheduledAction, ScheduledActionStore};

/// Delay past the mute end before roles are restored.
const RESTORE_GRACE_MS: i64 = 1_000;
const PRUNE_THRESHOLD: usize = 1_024;

/// `!roulette`: a chance of a timed mute. Moderator and VIP roles lost to
/// the mute are restored through the scheduler.
pub struct RouletteMiddleware {
	cfg: RouletteConfig,
	api: Arc<dyn ChannelApi>,
	roles: Arc<RolesCache>,
	scheduled: Arc<dyn ScheduledActionStore>,
	cooldowns: HashMap<String, Instant>,
	rng: StdRng,
}

impl RouletteMiddleware {
	pub fn new(
		cfg: RouletteConfig,
		api: Arc<dyn ChannelApi>,
		roles: Arc<RolesCache>,
		scheduled: Arc<dyn ScheduledActionStore>,
	) -> Self {
		Self {
			cfg,
			api,
			roles,
			scheduled,
			cooldowns: HashMap::new(),
			rng: StdRng::from_os_rng(),
		}
	}

	pub fn with_rng(mut self, rng: StdRng) -> Self {
		self.rng = rng;
		self
	}

	fn pick(&mut self, messages: &[String], user: &str) -> Vec<Action> {
		messages
			.choose(&mut self.rng)
			.map(|m| vec![Action::send(fill_dollar(m, &[("user", user)]))])
			.unwrap_or_default()
	}

	fn cooldown(&self) -> Duration {
		Duration::from_millis(self.cfg.cooldown_ms)
	}

	/// True if `user_id` is still cooling down; records the attempt otherwise.
	fn check_cooldown(&mut self, user_id: &str, now: Instant) -> bool {
		let cooldown = self.cooldown();
		if self
			.cooldowns
			.get(user_id)
			.is_some_and(|last| now.duration_since(*last) < cooldown)
		{
			return true;
		}
		if self.cooldowns.len() >= PRUNE_THRESHOLD {
			self.cooldowns.retain(|_, last| now.duration_since(*last) < cooldown);
		}
		self.cooldowns.insert(user_id.to_string(), now);
		false
	}

	async fn schedule_restore(&self, kind: ActionKind, user_id: &str, user_name: &str, at_ms: i64) {
		let res = self
			.scheduled
			.schedule(NewScheduledAction {
				execution_id: None,
				action_type: kind.as_str().to_string(),
				params: json!({}),
				target_user_id: user_id.to_string(),
				target_user_name: Some(user_name.to_string()),
				execute_at_ms: at_ms,
			})
			.await;
		if let Err(e) = res {
			warn!(user_id, %kind, error = %e, "failed to schedule role restore");
		}
	}
}

#[async_trait::async_trait]
impl Middleware for RouletteMiddleware {
	fn name(&self) -> &'static str {
		"roulette"
	}

	async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
		if !self.cfg.enabled || event.is_bot_authored() {
			return Ok(MiddlewareOutput::pass());
		}
		let Some(chat) = event.chat() else {
			return Ok(MiddlewareOutput::pass());
		};
		let text = chat.text.trim();
		if !self.cfg.commands.iter().any(|c| c == text) {
			return Ok(MiddlewareOutput::pass());
		}
		let Some(user_id) = event.meta.user_id.clone() else {
			return Ok(MiddlewareOutput::pass());
		};
		let user = display_name(event);

		if self.check_cooldown(&user_id, Instant::now()) {
			let messages = self.cfg.cooldown_messages.clone();
			return Ok(MiddlewareOutput::actions(self.pick(&messages, &user), false));
		}

		let chance = self.cfg.chance_fraction();
		if self.rng.random::<f64>() >= chance {
			let messages = self.cfg.survival_messages.clone();
			return Ok(MiddlewareOutput::accept(self.pick(&messages, &user)));
		}

		let login = chat.user_login.as_deref().unwrap_or(&user);
		let allow_mods = self.cfg.allow_to_mute_moderators;
		let protected = chat.roles.broadcaster
			|| self.cfg.protected_users.iter().any(|p| p.eq_ignore_ascii_case(login))
			|| (chat.roles.moderator && !allow_mods);
		let protected_messages = self.cfg.protected_messages.clone();
		if protected {
			return Ok(MiddlewareOutput::accept(self.pick(&protected_messages, &user)));
		}

		let roles = match self.roles.roles(self.api.as_ref(), &user_id).await {
			Ok(roles) => roles,
			Err(e) => {
				warn!(user_id = %user_id, error = %e, "roulette role lookup failed");
				return Ok(MiddlewareOutput::accept(self.pick(&protected_messages, &user)));
			}
		};
		if roles.moderator && !allow_mods {
			return Ok(MiddlewareOutput::accept(self.pick(&protected_messages, &user)));
		}

		let death_messages = self.cfg.death_messages.clone();
		let mut actions = self.pick(&death_messages, &user);
		let reason = match actions.first() {
			Some(Action::SendMessage { text, .. }) => text.clone(),
			_ => "roulette".to_string(),
		};
		// moderators cannot be timed out
		if roles.moderator {
			actions.push(Action::RemoveModerator {
				user_id: user_id.clone(),
			});
		}
		let duration_secs = u32::try_from((self.cfg.mute_duration_ms / 1_000).max(1)).unwrap_or(u32::MAX);
		actions.push(Action::Timeout {
			user_id: user_id.clone(),
			duration_secs,
			reason,
		});

		let restore_at = unix_ms_now() + i64::try_from(self.cfg.mute_duration_ms).unwrap_or(i64::MAX / 2) + RESTORE_GRACE_MS;
		if roles.moderator {
			self.schedule_restore(ActionKind::AddModerator, &user_id, &user, restore_at).await;
		}
		if roles.vip {
			self.schedule_restore(ActionKind::AddVip, &user_id, &user, restore_at).await;
		}
		info!(user_id = %user_id, duration_secs, moderator = roles.moderator, vip = roles.vip, "roulette mute");
		Ok(MiddlewareOutput::accept(actions))
	}

	fn update_config(&mut self, cfg: &BotConfig) {
		self.cfg = cfg.roulette.clone();
	}
}

#[cfg(test)]
mod tests {
	use streambot_domain::ChatRoles;
	use streambot_platform::UserRoles;

	use super::*;
	use crate::scheduler::InMemoryScheduledActionStore;
	use crate::test_support::{FakeApi, chat, chat_with_roles, sent};

	struct Fixture {
		middleware: RouletteMiddleware,
		store: Arc<InMemoryScheduledActionStore>,
	}

	fn fixture(chance: f64, api: FakeApi) -> Fixture {
		let store = Arc::new(InMemoryScheduledActionStore::default());
		let cfg = RouletteConfig {
			enabled: true,
			chance,
			survival_messages: vec!["${user} lives".into()],
			death_messages: vec!["${user} dies".into()],
			cooldown_messages: vec!["${user} wait".into()],
			protected_messages: vec!["${user} is protected".into()],
			protected_users: vec!["Streamer_Friend".into()],
			..RouletteConfig::default()
		};
		let middleware = RouletteMiddleware::new(cfg, Arc::new(api), Arc::new(RolesCache::default()), store.clone())
			.with_rng(StdRng::seed_from_u64(3));
		Fixture { middleware, store }
	}

	#[tokio::test(start_paused = true)]
	async fn second_spin_within_cooldown_gets_a_cooldown_message() {
		let mut f = fixture(1.0, FakeApi::default());
		let out = f.middleware.process(&chat("1", "u1", "Alice", "!roulette")).await.unwrap();
		assert!(out.accepted);
		assert!(out.actions.iter().any(|a| matches!(a, Action::Timeout { .. })));

		let out = f.middleware.process(&chat("2", "u1", "Alice", "!roulette")).await.unwrap();
		assert!(!out.accepted);
		assert_eq!(sent(&out.actions), vec!["Alice wait"]);
		assert_eq!(out.actions.len(), 1);

		tokio::time::advance(Duration::from_millis(30_001)).await;
		let out = f.middleware.process(&chat("3", "u1", "Alice", "!рулетка")).await.unwrap();
		assert!(out.accepted);
	}

	#[tokio::test]
	async fn zero_chance_always_survives() {
		let mut f = fixture(0.0, FakeApi::default());
		let out = f.middleware.process(&chat("1", "u1", "Alice", "!roulette")).await.unwrap();
		assert!(out.accepted);
		assert_eq!(sent(&out.actions), vec!["Alice lives"]);
	}

	#[tokio::test]
	async fn mute_times_out_with_the_death_message() {
		let mut f = fixture(1.0, FakeApi::default());
		let out = f.middleware.process(&chat("1", "u1", "Alice", "!roulette")).await.unwrap();
		assert_eq!(
			out.actions,
			vec![
				Action::send("Alice dies"),
				Action::Timeout {
					user_id: "u1".into(),
					duration_secs: 120,
					reason: "Alice dies".into(),
				},
			]
		);
		assert!(f.store.pending_due(i64::MAX).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn vip_is_restored_after_the_mute() {
		let api = FakeApi::default().with_roles("u1", UserRoles { moderator: false, vip: true });
		let mut f = fixture(1.0, api);
		let before = unix_ms_now();
		f.middleware.process(&chat("1", "u1", "Alice", "!roulette")).await.unwrap();

		let pending = f.store.pending_due(i64::MAX).await.unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].action_type, "add_vip");
		assert_eq!(pending[0].target_user_id, "u1");
		assert!(pending[0].execute_at_ms >= before + 121_000);
	}

	#[tokio::test]
	async fn moderators_lose_mod_before_timeout_when_allowed() {
		let api = FakeApi::default().with_roles("u1", UserRoles { moderator: true, vip: false });
		let mut f = fixture(1.0, api);
		f.middleware.cfg.allow_to_mute_moderators = true;
		let badges = ChatRoles {
			moderator: true,
			..ChatRoles::default()
		};
		let out = f.middleware.process(&chat_with_roles("1", "u1", "Mod", "!roulette", badges)).await.unwrap();
		assert!(matches!(out.actions[1], Action::RemoveModerator { .. }));
		assert!(matches!(out.actions[2], Action::Timeout { .. }));
		assert_eq!(f.store.pending_due(i64::MAX).await.unwrap()[0].action_type, "add_mod");
	}

	#[tokio::test]
	async fn protected_users_are_never_muted() {
		let mut f = fixture(1.0, FakeApi::default());
		let broadcaster = ChatRoles {
			broadcaster: true,
			..ChatRoles::default()
		};
		let out = f.middleware.process(&chat_with_roles("1", "b", "Host", "!roulette", broadcaster)).await.unwrap();
		assert_eq!(sent(&out.actions), vec!["Host is protected"]);

		let out = f.middleware.process(&chat("2", "f", "streamer_friend", "!roulette")).await.unwrap();
		assert_eq!(sent(&out.actions), vec!["streamer_friend is protected"]);

		let moderator = ChatRoles {
			moderator: true,
			..ChatRoles::default()
		};
		let out = f.middleware.process(&chat_with_roles("3", "m", "Mod", "!roulette", moderator)).await.unwrap();
		assert!(out.accepted);
		assert!(!out.actions.iter().any(|a| matches!(a, Action::Timeout { .. })));
	}

	#[tokio::test]
	async fn role_lookup_failure_spares_the_user() {
		let api = FakeApi {
			fail_lookups: true,
			..FakeApi::default()
		};
		let mut f = fixture(1.0, api);
		let out = f.middleware.process(&chat("1", "u1", "Alice", "!roulette")).await.unwrap();
		assert!(out.accepted);
		assert_eq!(sent(&out.actions), vec!["Alice is protected"]);
	}

	#[tokio::test]
	async fn other_text_and_disabled_pass() {
		let mut f = fixture(1.0, FakeApi::default());
		assert!(!f.middleware.process(&chat("1", "u1", "Alice", "!roulette now")).await.unwrap().accepted);
		f.middleware.update_config(&BotConfig::default());
		let out = f.middleware.process(&chat("2", "u1", "Alice", "!roulette")).await.unwrap();
		assert!(!out.accepted);
		assert!(out.actions.is_empty());
	}
}
