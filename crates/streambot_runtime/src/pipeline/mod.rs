#![forbid(unsafe_code)]

mod executor;

use std::sync::Arc;

use streambot_domain::{Action, BotEvent};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BotConfig;

pub use executor::{ActionExecutor, ChannelActionExecutor};

/// What a processor decided for one event.
#[derive(Debug, Default)]
pub struct MiddlewareOutput {
	/// Replacement for the working event; `None` keeps it.
	pub event: Option<BotEvent>,
	pub actions: Vec<Action>,
	/// Stop the chain here.
	pub accepted: bool,
}

impl MiddlewareOutput {
	pub fn pass() -> Self {
		Self::default()
	}

	pub fn accept(actions: Vec<Action>) -> Self {
		Self {
			event: None,
			actions,
			accepted: true,
		}
	}

	pub fn actions(actions: Vec<Action>, accepted: bool) -> Self {
		Self {
			event: None,
			actions,
			accepted,
		}
	}
}

/// A stateful event processor. State is only touched from the dispatcher task,
/// one event at a time.
#[async_trait::async_trait]
pub trait Middleware: Send {
	fn name(&self) -> &'static str;

	async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput>;

	/// Swap in a new configuration; takes effect on the next event.
	fn update_config(&mut self, _cfg: &BotConfig) {}

	/// Earliest instant at which `on_deadline` wants to run.
	fn next_deadline(&self) -> Option<Instant> {
		None
	}

	async fn on_deadline(&mut self, _now: Instant) -> anyhow::Result<Vec<Action>> {
		Ok(Vec::new())
	}
}

#[derive(Debug)]
pub struct PipelineOutput {
	pub event: BotEvent,
	pub actions: Vec<Action>,
	pub accepted_by: Option<&'static str>,
}

/// Fixed-order middleware chain plus the executor its actions go to.
pub struct Pipeline {
	middlewares: Vec<Box<dyn Middleware>>,
	executor: Arc<dyn ActionExecutor>,
}

impl Pipeline {
	pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
		Self {
			middlewares: Vec::new(),
			executor,
		}
	}

	pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
		self.middlewares.push(Box::new(middleware));
		self
	}

	pub fn names(&self) -> Vec<&'static str> {
		self.middlewares.iter().map(|m| m.name()).collect()
	}

	/// Run `event` through the chain, then execute the collected actions in order.
	pub async fn process(&mut self, event: BotEvent) -> PipelineOutput {
		metrics::counter!("streambot_events_total", "kind" => event.kind().as_str()).increment(1);

		let mut working = event;
		let mut actions = Vec::new();
		let mut accepted_by = None;

		for middleware in self.middlewares.iter_mut() {
			let name = middleware.name();
			match middleware.process(&working).await {
				Ok(out) => {
					if let Some(replacement) = out.event {
						working = replacement;
					}
					actions.extend(out.actions);
					if out.accepted {
						debug!(middleware = name, event_id = %working.id(), "event accepted");
						accepted_by = Some(name);
						break;
					}
				}
				Err(e) => {
					warn!(middleware = name, event_id = %working.id(), error = %e, "middleware failed");
				}
			}
		}

		execute_all(self.executor.as_ref(), &actions).await;
		PipelineOutput {
			event: working,
			actions,
			accepted_by,
		}
	}

	pub fn update_config(&mut self, cfg: &BotConfig) {
		for middleware in self.middlewares.iter_mut() {
			middleware.update_config(cfg);
		}
		debug!(version = cfg.version, "pipeline config updated");
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		self.middlewares.iter().filter_map(|m| m.next_deadline()).min()
	}

	/// Run every middleware whose deadline has passed and execute what they emit.
	pub async fn fire_deadlines(&mut self, now: Instant) -> Vec<Action> {
		let mut actions = Vec::new();
		for middleware in self.middlewares.iter_mut() {
			if !middleware.next_deadline().is_some_and(|d| d <= now) {
				continue;
			}
			match middleware.on_deadline(now).await {
				Ok(out) => actions.extend(out),
				Err(e) => warn!(middleware = middleware.name(), error = %e, "deadline handler failed"),
			}
		}
		execute_all(self.executor.as_ref(), &actions).await;
		actions
	}
}

async fn execute_all(executor: &dyn ActionExecutor, actions: &[Action]) {
	for action in actions {
		if let Err(e) = executor.execute(action).await {
			warn!(kind = %action.kind(), error = %e, "action failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use anyhow::anyhow;
	use streambot_domain::EventPayload;

	use super::*;
	use crate::test_support::{RecordingExecutor, chat, sent};

	struct Echo {
		name: &'static str,
		accept: bool,
		seen: Arc<parking_lot::Mutex<Vec<String>>>,
	}

	#[async_trait::async_trait]
	impl Middleware for Echo {
		fn name(&self) -> &'static str {
			self.name
		}

		async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
			let text = event.chat().map(|c| c.text.clone()).unwrap_or_default();
			self.seen.lock().push(format!("{}:{text}", self.name));
			Ok(MiddlewareOutput::actions(vec![Action::send(format!("{} saw {text}", self.name))], self.accept))
		}
	}

	struct Upper;

	#[async_trait::async_trait]
	impl Middleware for Upper {
		fn name(&self) -> &'static str {
			"upper"
		}

		async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
			let mut event = event.clone();
			if let EventPayload::Chat(msg) = &mut event.payload {
				msg.text = msg.text.to_uppercase();
			}
			Ok(MiddlewareOutput {
				event: Some(event),
				..MiddlewareOutput::pass()
			})
		}
	}

	struct Broken;

	#[async_trait::async_trait]
	impl Middleware for Broken {
		fn name(&self) -> &'static str {
			"broken"
		}

		async fn process(&mut self, _event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
			Err(anyhow!("no banner configured"))
		}
	}

	struct Alarm {
		at: Option<Instant>,
	}

	#[async_trait::async_trait]
	impl Middleware for Alarm {
		fn name(&self) -> &'static str {
			"alarm"
		}

		async fn process(&mut self, _event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
			Ok(MiddlewareOutput::pass())
		}

		fn next_deadline(&self) -> Option<Instant> {
			self.at
		}

		async fn on_deadline(&mut self, _now: Instant) -> anyhow::Result<Vec<Action>> {
			self.at = None;
			Ok(vec![Action::send("ring")])
		}
	}

	fn echo(name: &'static str, accept: bool, seen: &Arc<parking_lot::Mutex<Vec<String>>>) -> Echo {
		Echo {
			name,
			accept,
			seen: seen.clone(),
		}
	}

	#[tokio::test]
	async fn accepted_event_stops_the_chain() {
		let seen = Arc::default();
		let executor = Arc::new(RecordingExecutor::default());
		let mut pipeline = Pipeline::new(executor.clone())
			.with(echo("a", false, &seen))
			.with(echo("b", true, &seen))
			.with(echo("c", false, &seen));

		let out = pipeline.process(chat("1", "u", "User", "hi")).await;
		assert_eq!(out.accepted_by, Some("b"));
		assert_eq!(*seen.lock(), vec!["a:hi", "b:hi"]);
		assert_eq!(sent(&executor.actions()), vec!["a saw hi", "b saw hi"]);
		assert_eq!(sent(&out.actions), sent(&executor.actions()));
	}

	#[tokio::test]
	async fn rewritten_event_reaches_later_processors() {
		let seen = Arc::default();
		let mut pipeline = Pipeline::new(Arc::new(RecordingExecutor::default()))
			.with(Upper)
			.with(echo("a", false, &seen));

		let out = pipeline.process(chat("1", "u", "User", "hi")).await;
		assert_eq!(*seen.lock(), vec!["a:HI"]);
		assert_eq!(out.event.chat().unwrap().text, "HI");
		assert_eq!(out.accepted_by, None);
	}

	#[tokio::test]
	async fn failing_processor_is_skipped() {
		let seen = Arc::default();
		let mut pipeline = Pipeline::new(Arc::new(RecordingExecutor::failing("boom")))
			.with(Broken)
			.with(echo("a", false, &seen));

		let out = pipeline.process(chat("1", "u", "User", "hi")).await;
		assert_eq!(*seen.lock(), vec!["a:hi"]);
		assert_eq!(out.actions.len(), 1);
		assert_eq!(pipeline.names(), vec!["broken", "a"]);
	}

	#[tokio::test(start_paused = true)]
	async fn deadlines_fire_once_due() {
		let executor = Arc::new(RecordingExecutor::default());
		let at = Instant::now() + Duration::from_secs(5);
		let mut pipeline = Pipeline::new(executor.clone()).with(Alarm { at: Some(at) });
		assert_eq!(pipeline.next_deadline(), Some(at));

		assert!(pipeline.fire_deadlines(Instant::now()).await.is_empty());
		tokio::time::advance(Duration::from_secs(5)).await;
		assert_eq!(sent(&pipeline.fire_deadlines(Instant::now()).await), vec!["ring"]);
		assert_eq!(pipeline.next_deadline(), None);
		assert_eq!(sent(&executor.actions()), vec!["ring"]);
	}
}
