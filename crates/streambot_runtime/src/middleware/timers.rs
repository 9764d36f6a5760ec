#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use streambot_domain::{Action, BotEvent};
use tokio::time::Instant;
use tracing::debug;

use crate::config::BotConfig;
use crate::config::bot::TimersConfig;
use crate::pipeline::{Middleware, MiddlewareOutput};

#[derive(Debug, Default, Clone, Copy)]
struct TimerState {
	messages: u32,
	last_sent: Option<Instant>,
}

/// Periodic announcements gated by chat activity. Never accepts.
pub struct TimersMiddleware {
	cfg: TimersConfig,
	state: HashMap<String, TimerState>,
}

impl TimersMiddleware {
	pub fn new(cfg: TimersConfig) -> Self {
		let mut m = Self {
			cfg: TimersConfig::default(),
			state: HashMap::new(),
		};
		m.apply(cfg);
		m
	}

	/// Keeps counters of timers that survive the reload.
	fn apply(&mut self, cfg: TimersConfig) {
		self.state.retain(|id, _| cfg.timers.iter().any(|t| &t.id == id));
		for timer in &cfg.timers {
			self.state.entry(timer.id.clone()).or_default();
		}
		self.cfg = cfg;
	}
}

#[async_trait::async_trait]
impl Middleware for TimersMiddleware {
	fn name(&self) -> &'static str {
		"timers"
	}

	async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
		if !self.cfg.enabled || event.chat().is_none() || event.is_bot_authored() {
			return Ok(MiddlewareOutput::pass());
		}
		let now = Instant::now();
		let mut actions = Vec::new();
		for timer in self.cfg.timers.iter().filter(|t| t.enabled) {
			let state = self.state.entry(timer.id.clone()).or_default();
			state.messages += 1;
			let enough_messages = timer.min_messages == 0 || state.messages >= timer.min_messages;
			let interval = Duration::from_secs(timer.min_interval_sec);
			let enough_time = state.last_sent.is_none_or(|last| now.duration_since(last) >= interval);
			if enough_messages && enough_time {
				*state = TimerState {
					messages: 0,
					last_sent: Some(now),
				};
				debug!(timer = %timer.id, "timer announcement");
				actions.push(Action::send(timer.message.clone()));
			}
		}
		Ok(MiddlewareOutput::actions(actions, false))
	}

	fn update_config(&mut self, cfg: &BotConfig) {
		self.apply(cfg.timers.clone());
	}
}
