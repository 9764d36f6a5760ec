#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use streambot_domain::{Action, BotEvent, ChannelId, ChatMessage};
use streambot_platform::unix_ms_now;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{display_name, fill_braces};
use crate::config::BotConfig;
use crate::config::bot::{LotteryConfig, WarmupKind};
use crate::lottery::{LotteryStore, StatKind, Winner};
use crate::pipeline::{Middleware, MiddlewareOutput};

struct Participant {
	user_id: String,
	user_name: String,
}

struct ActiveDraw {
	/// `None` when the draw could not be persisted.
	id: Option<i64>,
	subject: String,
	initiator_name: String,
	started_at: Instant,
	ends_at: Instant,
	participants: Vec<Participant>,
	entered: HashSet<String>,
	/// Indices into the configured warm-up list.
	fired: HashSet<usize>,
}

impl ActiveDraw {
	fn count(&self) -> usize {
		self.participants.len()
	}

	fn remaining_secs(&self, now: Instant) -> u64 {
		ceil_secs(self.ends_at.saturating_duration_since(now))
	}
}

fn ceil_secs(d: Duration) -> u64 {
	d.as_millis().div_ceil(1_000) as u64
}

/// Timed giveaway: `idle -> collecting -> resolving -> idle`, one draw at a time.
/// Time-based warm-ups and the resolution run from pipeline deadlines.
pub struct LotteryMiddleware {
	cfg: LotteryConfig,
	store: Arc<dyn LotteryStore>,
	home_channel: Option<ChannelId>,
	active: Option<ActiveDraw>,
	last_draw_end: Option<Instant>,
	rng: StdRng,
}

impl LotteryMiddleware {
	pub fn new(cfg: LotteryConfig, store: Arc<dyn LotteryStore>, home_channel: Option<ChannelId>) -> Self {
		Self {
			cfg,
			store,
			home_channel,
			active: None,
			last_draw_end: None,
			rng: StdRng::from_os_rng(),
		}
	}

	pub fn with_rng(mut self, rng: StdRng) -> Self {
		self.rng = rng;
		self
	}

	pub fn is_running(&self) -> bool {
		self.active.is_some()
	}

	fn from_foreign_channel(&self, chat: &ChatMessage) -> bool {
		match (&self.home_channel, &chat.source_channel_id) {
			(Some(home), Some(source)) => home != source,
			_ => false,
		}
	}

	fn is_start_command(&self, text: &str) -> bool {
		let command = self.cfg.command.to_lowercase();
		!command.is_empty() && text.to_lowercase().starts_with(&command)
	}

	fn is_cancel_command(&self, text: &str) -> bool {
		!self.cfg.cancel_command.is_empty() && text.to_lowercase() == self.cfg.cancel_command.to_lowercase()
	}

	fn is_blacklisted(&self, subject: &str) -> bool {
		let subject = subject.to_lowercase();
		self.cfg.subject_blacklist.iter().any(|b| b.to_lowercase() == subject)
	}

	async fn start(&mut self, event: &BotEvent, chat: &ChatMessage) -> anyhow::Result<MiddlewareOutput> {
		let Some(user_id) = event.meta.user_id.clone() else {
			return Ok(MiddlewareOutput::pass());
		};
		if self.from_foreign_channel(chat) {
			return Ok(MiddlewareOutput::pass());
		}
		let messages = &self.cfg.messages;

		let Some(subject) = extract_subject(&chat.text) else {
			let reply = fill_braces(&messages.subject_required, &[("command", self.cfg.command.as_str())]);
			return Ok(MiddlewareOutput::accept(vec![Action::send(reply)]));
		};
		if self.is_blacklisted(&subject) {
			let reply = fill_braces(&messages.subject_blacklisted, &[("subject", subject.as_str())]);
			return Ok(MiddlewareOutput::accept(vec![Action::send(reply)]));
		}
		if let Some(active) = &self.active {
			let reply = fill_braces(
				&messages.already_running,
				&[("subject", active.subject.as_str()), ("trigger", self.cfg.entry_trigger.as_str())],
			);
			return Ok(MiddlewareOutput::accept(vec![Action::send(reply)]));
		}

		let now = Instant::now();
		let cooldown = Duration::from_secs(self.cfg.command_cooldown_sec);
		if let Some(last) = self.last_draw_end {
			let elapsed = now.duration_since(last);
			if elapsed < cooldown {
				let remaining = ceil_secs(cooldown - elapsed).to_string();
				let reply = fill_braces(&messages.cooldown, &[("cooldown", remaining.as_str())]);
				return Ok(MiddlewareOutput::accept(vec![Action::send(reply)]));
			}
		}

		if self.cfg.enforce_unique_subject && self.store.is_subject_used(&subject).await? {
			let reply = fill_braces(&messages.already_used, &[("subject", subject.as_str())]);
			return Ok(MiddlewareOutput::accept(vec![Action::send(reply)]));
		}

		let user_name = display_name(event);
		let id = match self.store.create_draw(&subject, &user_id, &user_name, unix_ms_now()).await {
			Ok(id) => Some(id),
			Err(e) => {
				warn!(error = %e, "failed to persist lottery draw");
				None
			}
		};
		self.record(&user_id, &user_name, StatKind::Initiated).await;

		let duration = Duration::from_secs(self.cfg.timer_duration_sec);
		let timer = self.cfg.timer_duration_sec.to_string();
		let reply = fill_braces(
			&self.cfg.messages.start,
			&[
				("subject", subject.as_str()),
				("initiator", user_name.as_str()),
				("timer", timer.as_str()),
				("trigger", self.cfg.entry_trigger.as_str()),
			],
		);
		info!(subject = %subject, initiator = %user_name, duration_secs = duration.as_secs(), "lottery started");
		self.active = Some(ActiveDraw {
			id,
			subject,
			initiator_name: user_name,
			started_at: now,
			ends_at: now + duration,
			participants: Vec::new(),
			entered: HashSet::new(),
			fired: HashSet::new(),
		});
		Ok(MiddlewareOutput::accept(vec![Action::send(reply)]))
	}

	async fn cancel(&mut self, chat: &ChatMessage) -> anyhow::Result<MiddlewareOutput> {
		if !chat.roles.can_moderate() {
			return Ok(MiddlewareOutput::pass());
		}
		let Some(draw) = self.active.take() else {
			return Ok(MiddlewareOutput::pass());
		};
		self.last_draw_end = Some(Instant::now());
		let count = draw.count() as u32;
		if let Some(id) = draw.id
			&& let Err(e) = self.store.cancel_draw(id, count).await
		{
			warn!(draw_id = id, error = %e, "failed to mark lottery cancelled");
		}
		let count = count.to_string();
		let reply = fill_braces(
			&self.cfg.messages.cancelled,
			&[
				("subject", draw.subject.as_str()),
				("initiator", draw.initiator_name.as_str()),
				("count", count.as_str()),
			],
		);
		info!(subject = %draw.subject, "lottery cancelled");
		Ok(MiddlewareOutput::accept(vec![Action::send(reply)]))
	}

	/// Adds a participant once. Returns count warm-up messages that became due.
	async fn enter(&mut self, user_id: &str, user_name: &str) -> Vec<Action> {
		let Some(draw) = self.active.as_mut() else {
			return Vec::new();
		};
		if !draw.entered.insert(user_id.to_string()) {
			return Vec::new();
		}
		draw.participants.push(Participant {
			user_id: user_id.to_string(),
			user_name: user_name.to_string(),
		});

		let count = draw.count();
		let count_str = count.to_string();
		let mut actions = Vec::new();
		for (idx, warmup) in self.cfg.messages.warmup.iter().enumerate() {
			if warmup.kind != WarmupKind::Count || count < warmup.value as usize || draw.fired.contains(&idx) {
				continue;
			}
			draw.fired.insert(idx);
			debug!(warmup = %warmup.id, count, "lottery warm-up fired");
			actions.push(Action::send(fill_braces(
				&warmup.message,
				&[
					("subject", draw.subject.as_str()),
					("count", count_str.as_str()),
					("initiator", draw.initiator_name.as_str()),
				],
			)));
		}
		self.record(user_id, user_name, StatKind::Entry).await;
		actions
	}

	async fn record(&self, user_id: &str, user_name: &str, kind: StatKind) {
		if let Err(e) = self.store.record_stat(user_id, user_name, kind).await {
			warn!(user_id, ?kind, error = %e, "failed to record lottery stats");
		}
	}

	/// Due instants of the time warm-ups that have not fired and land before the end.
	fn pending_warmups(&self) -> Vec<(usize, Instant)> {
		let Some(draw) = &self.active else {
			return Vec::new();
		};
		self.cfg
			.messages
			.warmup
			.iter()
			.enumerate()
			.filter(|(idx, w)| w.kind == WarmupKind::Time && !draw.fired.contains(idx))
			.map(|(idx, w)| (idx, draw.started_at + Duration::from_secs(w.value)))
			.filter(|(_, at)| *at < draw.ends_at)
			.collect()
	}

	async fn resolve(&mut self) -> Vec<Action> {
		let Some(draw) = self.active.take() else {
			return Vec::new();
		};
		self.last_draw_end = Some(Instant::now());
		let count = draw.count() as u32;
		let count_str = count.to_string();

		let winner = draw.participants.choose(&mut self.rng);
		let reply = match winner {
			Some(winner) => {
				info!(subject = %draw.subject, winner = %winner.user_name, participants = count, "lottery resolved");
				fill_braces(
					&self.cfg.messages.winner,
					&[
						("subject", draw.subject.as_str()),
						("winner", winner.user_name.as_str()),
						("count", count_str.as_str()),
						("initiator", draw.initiator_name.as_str()),
					],
				)
			}
			None => {
				info!(subject = %draw.subject, "lottery ended without participants");
				fill_braces(
					&self.cfg.messages.no_participants,
					&[
						("subject", draw.subject.as_str()),
						("count", "0"),
						("initiator", draw.initiator_name.as_str()),
					],
				)
			}
		};

		if let Some(winner) = winner {
			self.record(&winner.user_id, &winner.user_name, StatKind::Win).await;
		}
		if let Some(id) = draw.id {
			let stored_winner = winner.map(|w| Winner {
				user_id: &w.user_id,
				user_name: &w.user_name,
			});
			if let Err(e) = self.store.complete_draw(id, stored_winner, count).await {
				warn!(draw_id = id, error = %e, "failed to complete lottery draw");
			}
			if self.cfg.enforce_unique_subject
				&& winner.is_some()
				&& let Err(e) = self.store.mark_subject_used(&draw.subject, id).await
			{
				warn!(draw_id = id, error = %e, "failed to mark lottery subject used");
			}
		}
		vec![Action::send(reply)]
	}
}

/// Everything after the command word, without a leading `@`.
fn extract_subject(text: &str) -> Option<String> {
	let rest: Vec<&str> = text.split_whitespace().skip(1).collect();
	let joined = rest.join(" ");
	let subject = joined.strip_prefix('@').unwrap_or(&joined).trim();
	(!subject.is_empty()).then(|| subject.to_string())
}

#[async_trait::async_trait]
impl Middleware for LotteryMiddleware {
	fn name(&self) -> &'static str {
		"lottery"
	}

	async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
		if !self.cfg.enabled || event.is_bot_authored() {
			return Ok(MiddlewareOutput::pass());
		}

		if let Some(redemption) = event.redemption() {
			if self.active.is_none() || !self.cfg.channel_point_reward_ids.contains(&redemption.reward_id) {
				return Ok(MiddlewareOutput::pass());
			}
			let Some(user_id) = event.meta.user_id.clone() else {
				return Ok(MiddlewareOutput::pass());
			};
			let actions = self.enter(&user_id, &display_name(event)).await;
			let accepted = !actions.is_empty();
			return Ok(MiddlewareOutput::actions(actions, accepted));
		}

		let Some(chat) = event.chat() else {
			return Ok(MiddlewareOutput::pass());
		};
		let text = chat.text.trim();
		if self.is_start_command(text) {
			return self.start(event, chat).await;
		}
		if self.is_cancel_command(text) {
			return self.cancel(chat).await;
		}
		if self.cfg.allow_chat_entry && text == self.cfg.entry_trigger {
			if self.active.is_none() || self.from_foreign_channel(chat) {
				return Ok(MiddlewareOutput::pass());
			}
			let Some(user_id) = event.meta.user_id.clone() else {
				return Ok(MiddlewareOutput::pass());
			};
			let actions = self.enter(&user_id, &display_name(event)).await;
			return Ok(MiddlewareOutput::actions(actions, false));
		}
		Ok(MiddlewareOutput::pass())
	}

	fn update_config(&mut self, cfg: &BotConfig) {
		self.cfg = cfg.lottery.clone();
	}

	fn next_deadline(&self) -> Option<Instant> {
		let draw = self.active.as_ref()?;
		let warmups = self.pending_warmups().into_iter().map(|(_, at)| at);
		warmups.chain(std::iter::once(draw.ends_at)).min()
	}

	async fn on_deadline(&mut self, now: Instant) -> anyhow::Result<Vec<Action>> {
		let mut due = self.pending_warmups();
		due.retain(|(_, at)| *at <= now);
		due.sort_by_key(|(_, at)| *at);

		let mut actions = Vec::new();
		let Some(draw) = self.active.as_mut() else {
			return Ok(actions);
		};
		let count = draw.count().to_string();
		let timer = draw.remaining_secs(now).to_string();
		for (idx, _) in due {
			draw.fired.insert(idx);
			let warmup = &self.cfg.messages.warmup[idx];
			debug!(warmup = %warmup.id, timer = %timer, "lottery warm-up fired");
			actions.push(Action::send(fill_braces(
				&warmup.message,
				&[
					("subject", draw.subject.as_str()),
					("count", count.as_str()),
					("timer", timer.as_str()),
					("initiator", draw.initiator_name.as_str()),
				],
			)));
		}
		let ended = now >= draw.ends_at;
		if ended {
			actions.extend(self.resolve().await);
		}
		Ok(actions)
	}
}
