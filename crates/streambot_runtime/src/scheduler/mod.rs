#![forbid(unsafe_code)]

pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use streambot_domain::{Action, ActionKind};
use streambot_platform::unix_ms_now;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pipeline::ActionExecutor;

pub use store::{
	InMemoryScheduledActionStore, NewScheduledAction, NewTriggerExecution, ScheduledAction, ScheduledActionStore,
	SqlScheduledActionStore,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_TIMEOUT_SECS: u32 = 60;
const DEFAULT_TIMEOUT_REASON: &str = "Scheduled timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
	/// Another tick was still running.
	Skipped,
	Ran { done: usize, failed: usize },
}

/// Polls the durable store and executes due actions exactly once. Failed
/// actions are recorded and never retried.
pub struct ActionScheduler {
	inner: Arc<Inner>,
	poll_interval: Duration,
	task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
	store: Arc<dyn ScheduledActionStore>,
	executor: Arc<dyn ActionExecutor>,
	action_timeout: Duration,
	running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl ActionScheduler {
	pub fn new(store: Arc<dyn ScheduledActionStore>, executor: Arc<dyn ActionExecutor>) -> Self {
		Self {
			inner: Arc::new(Inner {
				store,
				executor,
				action_timeout: DEFAULT_ACTION_TIMEOUT,
				running: AtomicBool::new(false),
			}),
			poll_interval: DEFAULT_POLL_INTERVAL,
			task: parking_lot::Mutex::new(None),
		}
	}

	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
		if let Some(inner) = Arc::get_mut(&mut self.inner) {
			inner.action_timeout = timeout;
		}
		self
	}

	/// Start the poll loop. The first tick runs immediately. No-op if already started.
	pub fn start(&self) {
		let mut task = self.task.lock();
		if task.as_ref().is_some_and(|t| !t.is_finished()) {
			return;
		}

		let inner = Arc::clone(&self.inner);
		let interval = self.poll_interval;
		info!(interval_secs = interval.as_secs(), "action scheduler started");
		*task = Some(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				match inner.tick().await {
					Ok(TickOutcome::Ran { done, failed }) if done + failed > 0 => {
						info!(done, failed, "scheduled actions executed");
					}
					Ok(_) => {}
					Err(e) => warn!(error = %e, "scheduler tick failed"),
				}
			}
		}));
	}

	pub fn stop(&self) {
		if let Some(task) = self.task.lock().take() {
			task.abort();
			info!("action scheduler stopped");
		}
	}

	/// Run a sweep now, outside the poll cycle.
	pub async fn force_check(&self) -> anyhow::Result<TickOutcome> {
		self.inner.tick().await
	}
}

impl Drop for ActionScheduler {
	fn drop(&mut self) {
		if let Some(task) = self.task.get_mut().take() {
			task.abort();
		}
	}
}

impl Inner {
	async fn tick(&self) -> anyhow::Result<TickOutcome> {
		if self
			.running
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			debug!("scheduler tick already running");
			return Ok(TickOutcome::Skipped);
		}
		let _guard = RunningGuard(&self.running);

		let due = self.store.pending_due(unix_ms_now()).await?;
		let (mut done, mut failed) = (0, 0);
		for row in due {
			match self.run(&row).await {
				Ok(()) => {
					done += 1;
					metrics::counter!("streambot_scheduled_actions_total", "outcome" => "done").increment(1);
					if let Err(e) = self.store.mark_done(row.id, unix_ms_now()).await {
						warn!(id = row.id, error = %e, "failed to mark scheduled action done");
					}
				}
				Err(message) => {
					failed += 1;
					metrics::counter!("streambot_scheduled_actions_total", "outcome" => "failed").increment(1);
					warn!(id = row.id, action_type = %row.action_type, error = %message, "scheduled action failed");
					if let Err(e) = self.store.mark_failed(row.id, &message).await {
						warn!(id = row.id, error = %e, "failed to mark scheduled action failed");
					}
				}
			}
		}
		Ok(TickOutcome::Ran { done, failed })
	}

	async fn run(&self, row: &ScheduledAction) -> Result<(), String> {
		let action = action_from_row(row)?;
		debug!(id = row.id, kind = %action.kind(), user_id = %row.target_user_id, "executing scheduled action");
		match tokio::time::timeout(self.action_timeout, self.executor.execute(&action)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(format!("{e:#}")),
			Err(_) => Err(format!("timed out after {}s", self.action_timeout.as_secs())),
		}
	}
}

fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
	params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Decode a stored row into an executable action.
pub fn action_from_row(row: &ScheduledAction) -> Result<Action, String> {
	let kind: ActionKind = row.action_type.parse().map_err(|e: streambot_domain::ParseActionKindError| e.to_string())?;
	let user_id = row.target_user_id.clone();
	let action = match kind {
		ActionKind::RemoveVip => Action::RemoveVip { user_id },
		ActionKind::RemoveModerator => Action::RemoveModerator { user_id },
		ActionKind::AddVip => Action::AddVip { user_id },
		ActionKind::AddModerator => Action::AddModerator { user_id },
		ActionKind::Shoutout => Action::Shoutout { user_id },
		ActionKind::SendMessage => Action::SendMessage {
			text: param_str(&row.params, "message")
				.ok_or_else(|| "send_message requires a message param".to_string())?
				.to_string(),
			forward_to_ui: false,
		},
		ActionKind::Timeout => Action::Timeout {
			user_id,
			duration_secs: row
				.params
				.get("duration")
				.and_then(Value::as_u64)
				.and_then(|d| u32::try_from(d).ok())
				.unwrap_or(DEFAULT_TIMEOUT_SECS),
			reason: param_str(&row.params, "reason").unwrap_or(DEFAULT_TIMEOUT_REASON).to_string(),
		},
		ActionKind::DeleteMessage => Action::DeleteMessage {
			message_id: param_str(&row.params, "message_id")
				.ok_or_else(|| "delete_message requires a message_id param".to_string())?
				.to_string(),
		},
	};
	Ok(action)
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use tokio::sync::Notify;

	use super::store::ScheduledStatus;
	use super::*;
	use crate::test_support::RecordingExecutor;

	fn new_action(kind: &str, at: i64, params: Value) -> NewScheduledAction {
		NewScheduledAction {
			execution_id: None,
			action_type: kind.to_string(),
			params,
			target_user_id: "42".to_string(),
			target_user_name: None,
			execute_at_ms: at,
		}
	}

	#[tokio::test]
	async fn only_past_due_actions_execute() {
		let store = Arc::new(InMemoryScheduledActionStore::default());
		let executor = Arc::new(RecordingExecutor::default());
		let now = unix_ms_now();
		let past = store.schedule(new_action("remove_vip", now - 1_000, json!({}))).await.unwrap();
		let future = store.schedule(new_action("remove_mod", now + 3_600_000, json!({}))).await.unwrap();

		let scheduler = ActionScheduler::new(store.clone(), executor.clone());
		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Ran { done: 1, failed: 0 });
		assert_eq!(executor.actions(), vec![Action::RemoveVip { user_id: "42".into() }]);

		let history = store.history(10, 0).await.unwrap();
		let status = |id| history.iter().find(|a| a.id == id).unwrap().status;
		assert_eq!(status(past), ScheduledStatus::Done);
		assert_eq!(status(future), ScheduledStatus::Pending);

		// executed exactly once
		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Ran { done: 0, failed: 0 });
		assert_eq!(executor.actions().len(), 1);
	}

	#[tokio::test]
	async fn failures_are_recorded_and_not_retried() {
		let store = Arc::new(InMemoryScheduledActionStore::default());
		let executor = Arc::new(RecordingExecutor::failing("helix auth failed"));
		let now = unix_ms_now();
		let unknown = store.schedule(new_action("teleport", now, json!({}))).await.unwrap();
		let missing = store.schedule(new_action("send_message", now, json!({}))).await.unwrap();
		let rejected = store.schedule(new_action("add_vip", now, json!({}))).await.unwrap();

		let scheduler = ActionScheduler::new(store.clone(), executor.clone());
		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Ran { done: 0, failed: 3 });

		let history = store.history(10, 0).await.unwrap();
		let error = |id| history.iter().find(|a| a.id == id).unwrap().error_message.clone().unwrap();
		assert_eq!(error(unknown), "unknown action type: teleport");
		assert!(error(missing).contains("message param"));
		assert!(error(rejected).contains("helix auth failed"));

		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Ran { done: 0, failed: 0 });
		assert_eq!(executor.actions().len(), 1);
	}

	#[tokio::test]
	async fn overlapping_ticks_are_skipped() {
		let store = Arc::new(InMemoryScheduledActionStore::default());
		let gate = Arc::new(Notify::new());
		let executor = Arc::new(RecordingExecutor::gated(gate.clone()));
		store.schedule(new_action("shoutout", unix_ms_now(), json!({}))).await.unwrap();

		let scheduler = Arc::new(ActionScheduler::new(store.clone(), executor.clone()));
		let first = tokio::spawn({
			let scheduler = scheduler.clone();
			async move { scheduler.force_check().await.unwrap() }
		});
		executor.wait_started().await;

		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Skipped);
		gate.notify_one();
		assert_eq!(first.await.unwrap(), TickOutcome::Ran { done: 1, failed: 0 });
	}

	#[tokio::test(start_paused = true)]
	async fn hung_action_times_out() {
		let store = Arc::new(InMemoryScheduledActionStore::default());
		let executor = Arc::new(RecordingExecutor::gated(Arc::new(Notify::new())));
		let id = store.schedule(new_action("add_mod", unix_ms_now(), json!({}))).await.unwrap();

		let scheduler = ActionScheduler::new(store.clone(), executor).with_action_timeout(Duration::from_secs(5));
		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Ran { done: 0, failed: 1 });
		let row = store.history(1, 0).await.unwrap().remove(0);
		assert_eq!(row.id, id);
		assert_eq!(row.error_message.as_deref(), Some("timed out after 5s"));
	}

	#[tokio::test(start_paused = true)]
	async fn loop_ticks_immediately_then_on_interval() {
		let store = Arc::new(InMemoryScheduledActionStore::default());
		let executor = Arc::new(RecordingExecutor::default());
		store.schedule(new_action("add_vip", unix_ms_now(), json!({}))).await.unwrap();

		let scheduler = ActionScheduler::new(store.clone(), executor.clone()).with_poll_interval(Duration::from_secs(30));
		scheduler.start();
		scheduler.start();
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(executor.actions().len(), 1);

		store.schedule(new_action("add_mod", unix_ms_now(), json!({}))).await.unwrap();
		tokio::time::sleep(Duration::from_secs(31)).await;
		assert_eq!(executor.actions().len(), 2);
		scheduler.stop();
	}

	#[tokio::test]
	async fn broken_row_does_not_block_other_due_actions() {
		let db = crate::storage::memory_db().await;
		let crate::storage::Database::Sqlite(pool) = &db else {
			panic!("expected sqlite");
		};
		sqlx::query(
			"INSERT INTO scheduled_actions (action_type, action_params, target_user_id, execute_at, status, created_at) \
			VALUES ('add_vip', 'not json', '41', 0, 'pending', 0)",
		)
		.execute(pool)
		.await
		.unwrap();
		let store = Arc::new(SqlScheduledActionStore::new(db.clone()));
		let executor = Arc::new(RecordingExecutor::default());
		store.schedule(new_action("add_vip", unix_ms_now() - 1_000, json!({}))).await.unwrap();

		let scheduler = ActionScheduler::new(store.clone(), executor.clone());
		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Ran { done: 1, failed: 0 });
		assert_eq!(executor.actions(), vec![Action::AddVip { user_id: "42".into() }]);
		assert_eq!(scheduler.force_check().await.unwrap(), TickOutcome::Ran { done: 0, failed: 0 });
	}

	#[test]
	fn timeout_params_default() {
		let row = ScheduledAction {
			id: 1,
			execution_id: None,
			action_type: "mute_user".into(),
			params: json!({ "duration": 300 }),
			target_user_id: "7".into(),
			target_user_name: None,
			execute_at_ms: 0,
			status: ScheduledStatus::Pending,
			created_at_ms: 0,
			executed_at_ms: None,
			error_message: None,
		};
		assert_eq!(
			action_from_row(&row).unwrap(),
			Action::Timeout {
				user_id: "7".into(),
				duration_secs: 300,
				reason: "Scheduled timeout".into(),
			}
		);
	}
}
