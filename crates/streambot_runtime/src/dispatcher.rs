#![forbid(unsafe_code)]

use std::sync::Arc;

use streambot_domain::{Action, BotEvent};
use streambot_platform::roles::RolesCache;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::EventCache;
use crate::config::BotConfig;
use crate::pipeline::Pipeline;

/// Owns the pipeline. Events, middleware deadlines and config swaps are
/// handled one at a time on a single task.
pub struct Dispatcher {
	pipeline: Pipeline,
	roles: Arc<RolesCache>,
	cache: Arc<EventCache>,
}

impl Dispatcher {
	pub fn new(pipeline: Pipeline, roles: Arc<RolesCache>, cache: Arc<EventCache>) -> Self {
		Self { pipeline, roles, cache }
	}

	pub async fn handle_event(&mut self, event: BotEvent) {
		if !event.is_bot_authored()
			&& let (Some(chat), Some(user_id)) = (event.chat(), event.meta.user_id.as_deref())
		{
			self.roles.observe(user_id, &chat.roles);
		}
		let out = self.pipeline.process(event).await;
		if let Some(name) = out.accepted_by {
			debug!(middleware = name, actions = out.actions.len(), "event handled");
		}
		self.cache.insert(out.event);
		self.cache_replies(&out.actions);
	}

	pub async fn handle_deadlines(&mut self, now: Instant) {
		let actions = self.pipeline.fire_deadlines(now).await;
		self.cache_replies(&actions);
	}

	pub fn apply_config(&mut self, cfg: &BotConfig) {
		self.pipeline.update_config(cfg);
		self.cache.update_settings(&cfg.cache);
	}

	fn cache_replies(&self, actions: &[Action]) {
		for action in actions {
			if let Action::SendMessage {
				text,
				forward_to_ui: true,
			} = action
			{
				self.cache.insert_bot_reply(text);
			}
		}
	}

	/// Runs until the event channel closes or `shutdown_rx` fires.
	pub async fn run(
		mut self,
		mut events_rx: mpsc::Receiver<BotEvent>,
		mut config_rx: watch::Receiver<Arc<BotConfig>>,
		shutdown_rx: oneshot::Receiver<()>,
	) {
		let mut maybe_shutdown = Some(shutdown_rx);
		let mut config_open = true;

		loop {
			let deadline = self.pipeline.next_deadline();
			tokio::select! {
				ev = events_rx.recv() => {
					let Some(ev) = ev else {
						debug!("event channel closed; dispatcher exiting");
						break;
					};
					self.handle_event(ev).await;
				}

				_ = async {
					if let Some(at) = deadline {
						tokio::time::sleep_until(at).await;
					}
				}, if deadline.is_some() => {
					self.handle_deadlines(Instant::now()).await;
				}

				changed = config_rx.changed(), if config_open => {
					if changed.is_err() {
						config_open = false;
						continue;
					}
					let cfg = config_rx.borrow_and_update().clone();
					self.apply_config(&cfg);
					info!(version = cfg.version, "bot config applied");
				}

				_ = async {
					if let Some(rx) = &mut maybe_shutdown {
						let _ = rx.await;
					}
				}, if maybe_shutdown.is_some() => {
					info!("dispatcher observed shutdown");
					break;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use streambot_domain::{ChannelId, ChatRoles, EventPayload};

	use super::*;
	use crate::config::bot::{CacheConfig, GreetingConfig, LotteryConfig};
	use crate::lottery::InMemoryLotteryStore;
	use crate::middleware::greeting::GreetingMiddleware;
	use crate::middleware::lottery::LotteryMiddleware;
	use crate::test_support::{HOME_CHANNEL, RecordingExecutor, chat, chat_with_roles, meta, sent};

	struct Fixture {
		dispatcher: Dispatcher,
		executor: Arc<RecordingExecutor>,
		roles: Arc<RolesCache>,
		cache: Arc<EventCache>,
	}

	fn fixture(lottery: LotteryConfig) -> Fixture {
		let executor = Arc::new(RecordingExecutor::default());
		let pipeline = Pipeline::new(executor.clone())
			.with(LotteryMiddleware::new(
				lottery,
				Arc::new(InMemoryLotteryStore::default()),
				ChannelId::new(HOME_CHANNEL).ok(),
			))
			.with(GreetingMiddleware::new(GreetingConfig {
				enabled: true,
				reply: "hello!".into(),
			}));
		let roles = Arc::new(RolesCache::default());
		let cache = Arc::new(EventCache::new(&CacheConfig::default(), ChannelId::new(HOME_CHANNEL).ok()));
		Fixture {
			dispatcher: Dispatcher::new(pipeline, roles.clone(), cache.clone()),
			executor,
			roles,
			cache,
		}
	}

	#[tokio::test]
	async fn events_and_replies_land_in_the_cache() {
		let mut f = fixture(LotteryConfig::default());
		let moderator = ChatRoles {
			moderator: true,
			..ChatRoles::default()
		};
		f.dispatcher
			.handle_event(chat_with_roles("m1", "u1", "Alice", "hi all", moderator))
			.await;

		assert_eq!(sent(&f.executor.actions()), vec!["hello!"]);
		let snapshot = f.cache.snapshot();
		assert_eq!(snapshot.events.len(), 2);
		assert_eq!(snapshot.events[0].id(), "m1");
		assert!(snapshot.events[1].is_bot_authored());
		assert!(f.roles.cached("u1").is_some_and(|r| r.moderator));

		f.dispatcher
			.handle_event(BotEvent::new(meta("j", "u2", "Bob"), EventPayload::Join))
			.await;
		assert_eq!(f.cache.len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn run_loop_fires_deadlines_and_applies_config() {
		let lottery = LotteryConfig {
			enabled: true,
			command: "!draw".into(),
			timer_duration_sec: 30,
			..LotteryConfig::default()
		};
		let f = fixture(lottery);
		let executor = f.executor.clone();
		let (events_tx, events_rx) = mpsc::channel(16);
		let (config_tx, config_rx) = watch::channel(Arc::new(BotConfig::default()));
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let task = tokio::spawn(f.dispatcher.run(events_rx, config_rx, shutdown_rx));

		events_tx.send(chat("1", "host", "Host", "!draw prize")).await.unwrap();
		events_tx.send(chat("2", "a", "Alice", "+")).await.unwrap();
		tokio::time::sleep(Duration::from_secs(31)).await;
		let replies = sent(&executor.actions());
		assert_eq!(replies.len(), 2, "{replies:?}");
		assert!(replies[1].contains("Alice"), "{}", replies[1]);

		let mut cfg = BotConfig::default();
		cfg.greeting.reply = "reloaded".into();
		config_tx.send(Arc::new(cfg)).unwrap();
		tokio::time::sleep(Duration::from_millis(10)).await;
		events_tx.send(chat("3", "b", "Bob", "привет")).await.unwrap();
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(sent(&executor.actions()).last().map(String::as_str), Some("reloaded"));

		shutdown_tx.send(()).unwrap();
		task.await.unwrap();
	}
}
