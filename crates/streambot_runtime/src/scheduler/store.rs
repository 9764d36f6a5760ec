#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use streambot_platform::unix_ms_now;
use tokio::sync::Mutex;
use tracing::warn;

use crate::storage::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledStatus {
	Pending,
	Done,
	Failed,
	Cancelled,
}

impl ScheduledStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			ScheduledStatus::Pending => "pending",
			ScheduledStatus::Done => "done",
			ScheduledStatus::Failed => "failed",
			ScheduledStatus::Cancelled => "cancelled",
		}
	}
}

impl fmt::Display for ScheduledStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ScheduledStatus {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(ScheduledStatus::Pending),
			"done" => Ok(ScheduledStatus::Done),
			"failed" => Ok(ScheduledStatus::Failed),
			"cancelled" => Ok(ScheduledStatus::Cancelled),
			other => Err(anyhow!("unknown scheduled action status: {other}")),
		}
	}
}

/// Durable delayed action. `params` is stored as an opaque JSON blob.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledAction {
	pub id: i64,
	pub execution_id: Option<i64>,
	pub action_type: String,
	pub params: serde_json::Value,
	pub target_user_id: String,
	pub target_user_name: Option<String>,
	pub execute_at_ms: i64,
	pub status: ScheduledStatus,
	pub created_at_ms: i64,
	pub executed_at_ms: Option<i64>,
	pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledAction {
	pub execution_id: Option<i64>,
	pub action_type: String,
	pub params: serde_json::Value,
	pub target_user_id: String,
	pub target_user_name: Option<String>,
	pub execute_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTriggerExecution {
	pub trigger_id: String,
	pub trigger_name: String,
	pub event_type: String,
	pub event_id: Option<String>,
	pub source_user_id: String,
	pub source_user_name: String,
	pub target_user_id: Option<String>,
	pub target_user_name: Option<String>,
	pub args: Vec<String>,
	pub input: String,
}

#[async_trait::async_trait]
pub trait ScheduledActionStore: Send + Sync {
	async fn schedule(&self, action: NewScheduledAction) -> anyhow::Result<i64>;

	/// Pending actions with `execute_at <= now_ms`, oldest first.
	async fn pending_due(&self, now_ms: i64) -> anyhow::Result<Vec<ScheduledAction>>;

	async fn mark_done(&self, id: i64, executed_at_ms: i64) -> anyhow::Result<()>;

	async fn mark_failed(&self, id: i64, error: &str) -> anyhow::Result<()>;

	async fn cancel(&self, id: i64) -> anyhow::Result<bool>;

	async fn cancel_by_user_and_type(&self, user_id: &str, action_type: &str) -> anyhow::Result<u64>;

	async fn pending_remove_for_user(&self, user_id: &str, action_type: &str) -> anyhow::Result<Option<ScheduledAction>>;

	async fn extend(&self, id: i64, execute_at_ms: i64) -> anyhow::Result<bool>;

	/// Most recently created first.
	async fn history(&self, limit: u32, offset: u32) -> anyhow::Result<Vec<ScheduledAction>>;

	async fn record_execution(&self, execution: NewTriggerExecution) -> anyhow::Result<i64>;
}

#[derive(Default)]
struct MemoryState {
	next_id: i64,
	actions: Vec<ScheduledAction>,
	executions: Vec<(i64, NewTriggerExecution)>,
}

#[derive(Default)]
pub struct InMemoryScheduledActionStore {
	inner: Mutex<MemoryState>,
}

impl InMemoryScheduledActionStore {
	#[cfg(test)]
	pub(crate) async fn executions(&self) -> Vec<NewTriggerExecution> {
		self.inner.lock().await.executions.iter().map(|(_, e)| e.clone()).collect()
	}
}

fn transition(actions: &mut [ScheduledAction], id: i64, f: impl FnOnce(&mut ScheduledAction)) -> bool {
	match actions
		.iter_mut()
		.find(|a| a.id == id && a.status == ScheduledStatus::Pending)
	{
		Some(action) => {
			f(action);
			true
		}
		None => false,
	}
}

#[async_trait::async_trait]
impl ScheduledActionStore for InMemoryScheduledActionStore {
	async fn schedule(&self, action: NewScheduledAction) -> anyhow::Result<i64> {
		let mut guard = self.inner.lock().await;
		guard.next_id += 1;
		let id = guard.next_id;
		guard.actions.push(ScheduledAction {
			id,
			execution_id: action.execution_id,
			action_type: action.action_type,
			params: action.params,
			target_user_id: action.target_user_id,
			target_user_name: action.target_user_name,
			execute_at_ms: action.execute_at_ms,
			status: ScheduledStatus::Pending,
			created_at_ms: unix_ms_now(),
			executed_at_ms: None,
			error_message: None,
		});
		Ok(id)
	}

	async fn pending_due(&self, now_ms: i64) -> anyhow::Result<Vec<ScheduledAction>> {
		let guard = self.inner.lock().await;
		let mut due: Vec<ScheduledAction> = guard
			.actions
			.iter()
			.filter(|a| a.status == ScheduledStatus::Pending && a.execute_at_ms <= now_ms)
			.cloned()
			.collect();
		due.sort_by_key(|a| (a.execute_at_ms, a.id));
		Ok(due)
	}

	async fn mark_done(&self, id: i64, executed_at_ms: i64) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		transition(&mut guard.actions, id, |a| {
			a.status = ScheduledStatus::Done;
			a.executed_at_ms = Some(executed_at_ms);
		});
		Ok(())
	}

	async fn mark_failed(&self, id: i64, error: &str) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		transition(&mut guard.actions, id, |a| {
			a.status = ScheduledStatus::Failed;
			a.executed_at_ms = Some(unix_ms_now());
			a.error_message = Some(error.to_string());
		});
		Ok(())
	}

	async fn cancel(&self, id: i64) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		Ok(transition(&mut guard.actions, id, |a| a.status = ScheduledStatus::Cancelled))
	}

	async fn cancel_by_user_and_type(&self, user_id: &str, action_type: &str) -> anyhow::Result<u64> {
		let mut guard = self.inner.lock().await;
		let mut cancelled = 0;
		for action in guard.actions.iter_mut().filter(|a| {
			a.status == ScheduledStatus::Pending && a.target_user_id == user_id && a.action_type == action_type
		}) {
			action.status = ScheduledStatus::Cancelled;
			cancelled += 1;
		}
		Ok(cancelled)
	}

	async fn pending_remove_for_user(&self, user_id: &str, action_type: &str) -> anyhow::Result<Option<ScheduledAction>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.actions
			.iter()
			.filter(|a| {
				a.status == ScheduledStatus::Pending && a.target_user_id == user_id && a.action_type == action_type
			})
			.min_by_key(|a| (a.execute_at_ms, a.id))
			.cloned())
	}

	async fn extend(&self, id: i64, execute_at_ms: i64) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		Ok(transition(&mut guard.actions, id, |a| a.execute_at_ms = execute_at_ms))
	}

	async fn history(&self, limit: u32, offset: u32) -> anyhow::Result<Vec<ScheduledAction>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.actions
			.iter()
			.rev()
			.skip(offset as usize)
			.take(limit as usize)
			.cloned()
			.collect())
	}

	async fn record_execution(&self, execution: NewTriggerExecution) -> anyhow::Result<i64> {
		let mut guard = self.inner.lock().await;
		let id = guard.executions.len() as i64 + 1;
		guard.executions.push((id, execution));
		Ok(id)
	}
}

pub struct SqlScheduledActionStore {
	db: Database,
}

impl SqlScheduledActionStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

type ActionRow = (
	i64,
	Option<i64>,
	String,
	String,
	String,
	Option<String>,
	i64,
	String,
	i64,
	Option<i64>,
	Option<String>,
);

const ACTION_COLUMNS: &str = "id, execution_id, action_type, action_params, target_user_id, target_user_name, \
	execute_at, status, created_at, executed_at, error_message";

fn action_from_row(row: ActionRow) -> anyhow::Result<ScheduledAction> {
	let (id, execution_id, action_type, params, target_user_id, target_user_name, execute_at, status, created_at, executed_at, error_message) =
		row;
	Ok(ScheduledAction {
		id,
		execution_id,
		action_type,
		params: serde_json::from_str(&params).with_context(|| format!("decode params of scheduled action {id}"))?,
		target_user_id,
		target_user_name,
		execute_at_ms: execute_at,
		status: status.parse()?,
		created_at_ms: created_at,
		executed_at_ms: executed_at,
		error_message,
	})
}

/// Decodes each row on its own; a broken row is returned with its error
/// instead of failing the whole batch.
fn decode_rows(rows: Vec<ActionRow>) -> (Vec<ScheduledAction>, Vec<(i64, String)>) {
	let mut actions = Vec::with_capacity(rows.len());
	let mut broken = Vec::new();
	for row in rows {
		let id = row.0;
		match action_from_row(row) {
			Ok(action) => actions.push(action),
			Err(e) => broken.push((id, format!("{e:#}"))),
		}
	}
	(actions, broken)
}

#[async_trait::async_trait]
impl ScheduledActionStore for SqlScheduledActionStore {
	async fn schedule(&self, action: NewScheduledAction) -> anyhow::Result<i64> {
		let params = serde_json::to_string(&action.params).context("encode action params")?;
		let now = unix_ms_now();
		let (id,): (i64,) = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO scheduled_actions (execution_id, action_type, action_params, target_user_id, \
				target_user_name, execute_at, status, created_at) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?) RETURNING id",
			)
			.bind(action.execution_id)
			.bind(&action.action_type)
			.bind(&params)
			.bind(&action.target_user_id)
			.bind(&action.target_user_name)
			.bind(action.execute_at_ms)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert scheduled action (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(
				"INSERT INTO scheduled_actions (execution_id, action_type, action_params, target_user_id, \
				target_user_name, execute_at, status, created_at) VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7) RETURNING id",
			)
			.bind(action.execution_id)
			.bind(&action.action_type)
			.bind(&params)
			.bind(&action.target_user_id)
			.bind(&action.target_user_name)
			.bind(action.execute_at_ms)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert scheduled action (postgres)")?,
		};
		Ok(id)
	}

	async fn pending_due(&self, now_ms: i64) -> anyhow::Result<Vec<ScheduledAction>> {
		let rows: Vec<ActionRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {ACTION_COLUMNS} FROM scheduled_actions WHERE status = 'pending' AND execute_at <= ? \
				ORDER BY execute_at ASC, id ASC"
			))
			.bind(now_ms)
			.fetch_all(pool)
			.await
			.context("select due actions (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {ACTION_COLUMNS} FROM scheduled_actions WHERE status = 'pending' AND execute_at <= $1 \
				ORDER BY execute_at ASC, id ASC"
			))
			.bind(now_ms)
			.fetch_all(pool)
			.await
			.context("select due actions (postgres)")?,
		};
		let (actions, broken) = decode_rows(rows);
		for (id, error) in broken {
			warn!(id, %error, "undecodable scheduled action; marking failed");
			if let Err(e) = self.mark_failed(id, &error).await {
				warn!(id, error = %e, "failed to mark undecodable scheduled action");
			}
		}
		Ok(actions)
	}

	async fn mark_done(&self, id: i64, executed_at_ms: i64) -> anyhow::Result<()> {
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query("UPDATE scheduled_actions SET status = 'done', executed_at = ? WHERE id = ? AND status = 'pending'")
					.bind(executed_at_ms)
					.bind(id)
					.execute(pool)
					.await
					.context("mark action done (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"UPDATE scheduled_actions SET status = 'done', executed_at = $1 WHERE id = $2 AND status = 'pending'",
				)
				.bind(executed_at_ms)
				.bind(id)
				.execute(pool)
				.await
				.context("mark action done (postgres)")?;
			}
		}
		Ok(())
	}

	async fn mark_failed(&self, id: i64, error: &str) -> anyhow::Result<()> {
		let now = unix_ms_now();
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"UPDATE scheduled_actions SET status = 'failed', executed_at = ?, error_message = ? \
					WHERE id = ? AND status = 'pending'",
				)
				.bind(now)
				.bind(error)
				.bind(id)
				.execute(pool)
				.await
				.context("mark action failed (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"UPDATE scheduled_actions SET status = 'failed', executed_at = $1, error_message = $2 \
					WHERE id = $3 AND status = 'pending'",
				)
				.bind(now)
				.bind(error)
				.bind(id)
				.execute(pool)
				.await
				.context("mark action failed (postgres)")?;
			}
		}
		Ok(())
	}

	async fn cancel(&self, id: i64) -> anyhow::Result<bool> {
		let affected = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query("UPDATE scheduled_actions SET status = 'cancelled' WHERE id = ? AND status = 'pending'")
					.bind(id)
					.execute(pool)
					.await
					.context("cancel action (sqlite)")?
					.rows_affected()
			}
			Database::Postgres(pool) => {
				sqlx::query("UPDATE scheduled_actions SET status = 'cancelled' WHERE id = $1 AND status = 'pending'")
					.bind(id)
					.execute(pool)
					.await
					.context("cancel action (postgres)")?
					.rows_affected()
			}
		};
		Ok(affected > 0)
	}

	async fn cancel_by_user_and_type(&self, user_id: &str, action_type: &str) -> anyhow::Result<u64> {
		let affected = match &self.db {
			Database::Sqlite(pool) => sqlx::query(
				"UPDATE scheduled_actions SET status = 'cancelled' \
				WHERE target_user_id = ? AND action_type = ? AND status = 'pending'",
			)
			.bind(user_id)
			.bind(action_type)
			.execute(pool)
			.await
			.context("cancel user actions (sqlite)")?
			.rows_affected(),
			Database::Postgres(pool) => sqlx::query(
				"UPDATE scheduled_actions SET status = 'cancelled' \
				WHERE target_user_id = $1 AND action_type = $2 AND status = 'pending'",
			)
			.bind(user_id)
			.bind(action_type)
			.execute(pool)
			.await
			.context("cancel user actions (postgres)")?
			.rows_affected(),
		};
		Ok(affected)
	}

	async fn pending_remove_for_user(&self, user_id: &str, action_type: &str) -> anyhow::Result<Option<ScheduledAction>> {
		let row: Option<ActionRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {ACTION_COLUMNS} FROM scheduled_actions \
				WHERE target_user_id = ? AND action_type = ? AND status = 'pending' \
				ORDER BY execute_at ASC, id ASC LIMIT 1"
			))
			.bind(user_id)
			.bind(action_type)
			.fetch_optional(pool)
			.await
			.context("select pending remove (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {ACTION_COLUMNS} FROM scheduled_actions \
				WHERE target_user_id = $1 AND action_type = $2 AND status = 'pending' \
				ORDER BY execute_at ASC, id ASC LIMIT 1"
			))
			.bind(user_id)
			.bind(action_type)
			.fetch_optional(pool)
			.await
			.context("select pending remove (postgres)")?,
		};
		row.map(action_from_row).transpose()
	}

	async fn extend(&self, id: i64, execute_at_ms: i64) -> anyhow::Result<bool> {
		let affected = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query("UPDATE scheduled_actions SET execute_at = ? WHERE id = ? AND status = 'pending'")
					.bind(execute_at_ms)
					.bind(id)
					.execute(pool)
					.await
					.context("extend action (sqlite)")?
					.rows_affected()
			}
			Database::Postgres(pool) => {
				sqlx::query("UPDATE scheduled_actions SET execute_at = $1 WHERE id = $2 AND status = 'pending'")
					.bind(execute_at_ms)
					.bind(id)
					.execute(pool)
					.await
					.context("extend action (postgres)")?
					.rows_affected()
			}
		};
		Ok(affected > 0)
	}

	async fn history(&self, limit: u32, offset: u32) -> anyhow::Result<Vec<ScheduledAction>> {
		let rows: Vec<ActionRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {ACTION_COLUMNS} FROM scheduled_actions ORDER BY id DESC LIMIT ? OFFSET ?"
			))
			.bind(i64::from(limit))
			.bind(i64::from(offset))
			.fetch_all(pool)
			.await
			.context("select action history (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {ACTION_COLUMNS} FROM scheduled_actions ORDER BY id DESC LIMIT $1 OFFSET $2"
			))
			.bind(i64::from(limit))
			.bind(i64::from(offset))
			.fetch_all(pool)
			.await
			.context("select action history (postgres)")?,
		};
		let (actions, broken) = decode_rows(rows);
		for (id, error) in broken {
			warn!(id, %error, "skipping undecodable scheduled action in history");
		}
		Ok(actions)
	}

	async fn record_execution(&self, execution: NewTriggerExecution) -> anyhow::Result<i64> {
		let args = serde_json::to_string(&execution.args).context("encode trigger args")?;
		let now = unix_ms_now();
		let (id,): (i64,) = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO trigger_executions (trigger_id, trigger_name, event_type, event_id, source_user_id, \
				source_user_name, target_user_id, target_user_name, context_args, context_input, created_at) \
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
			)
			.bind(&execution.trigger_id)
			.bind(&execution.trigger_name)
			.bind(&execution.event_type)
			.bind(&execution.event_id)
			.bind(&execution.source_user_id)
			.bind(&execution.source_user_name)
			.bind(&execution.target_user_id)
			.bind(&execution.target_user_name)
			.bind(&args)
			.bind(&execution.input)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert trigger execution (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(
				"INSERT INTO trigger_executions (trigger_id, trigger_name, event_type, event_id, source_user_id, \
				source_user_name, target_user_id, target_user_name, context_args, context_input, created_at) \
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING id",
			)
			.bind(&execution.trigger_id)
			.bind(&execution.trigger_name)
			.bind(&execution.event_type)
			.bind(&execution.event_id)
			.bind(&execution.source_user_id)
			.bind(&execution.source_user_name)
			.bind(&execution.target_user_id)
			.bind(&execution.target_user_name)
			.bind(&args)
			.bind(&execution.input)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert trigger execution (postgres)")?,
		};
		Ok(id)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::storage::memory_db;

	fn new_action(kind: &str, user: &str, at: i64) -> NewScheduledAction {
		NewScheduledAction {
			execution_id: None,
			action_type: kind.to_string(),
			params: json!({}),
			target_user_id: user.to_string(),
			target_user_name: Some(format!("name-{user}")),
			execute_at_ms: at,
		}
	}

	async fn exercise(store: &dyn ScheduledActionStore) {
		let now = 1_000_000;
		let past = store.schedule(new_action("remove_vip", "u1", now - 10)).await.unwrap();
		let future = store.schedule(new_action("remove_vip", "u2", now + 60_000)).await.unwrap();
		let msg = store
			.schedule(NewScheduledAction {
				params: json!({ "message": "hi" }),
				..new_action("send_message", "u1", now - 20)
			})
			.await
			.unwrap();

		let due = store.pending_due(now).await.unwrap();
		assert_eq!(due.iter().map(|a| a.id).collect::<Vec<_>>(), vec![msg, past]);
		assert_eq!(due[0].params["message"], "hi");
		assert_eq!(due[1].status, ScheduledStatus::Pending);

		store.mark_done(past, now).await.unwrap();
		store.mark_failed(msg, "boom").await.unwrap();
		// terminal rows never transition again
		store.mark_done(msg, now).await.unwrap();
		assert!(store.pending_due(now).await.unwrap().is_empty());

		let history = store.history(10, 0).await.unwrap();
		assert_eq!(history.len(), 3);
		assert_eq!(history[0].id, msg);
		assert_eq!(history[0].status, ScheduledStatus::Failed);
		assert_eq!(history[0].error_message.as_deref(), Some("boom"));
		assert_eq!(history[2].status, ScheduledStatus::Done);
		assert_eq!(history[2].executed_at_ms, Some(now));

		let pending = store.pending_remove_for_user("u2", "remove_vip").await.unwrap().unwrap();
		assert_eq!(pending.id, future);
		assert!(store.extend(future, now + 120_000).await.unwrap());
		assert_eq!(
			store.pending_remove_for_user("u2", "remove_vip").await.unwrap().unwrap().execute_at_ms,
			now + 120_000
		);
		assert!(store.pending_remove_for_user("u1", "remove_vip").await.unwrap().is_none());

		assert_eq!(store.cancel_by_user_and_type("u2", "remove_vip").await.unwrap(), 1);
		assert!(!store.cancel(future).await.unwrap());
		assert!(!store.extend(future, now).await.unwrap());

		let exec = store
			.record_execution(NewTriggerExecution {
				trigger_id: "t".into(),
				args: vec!["@bob".into()],
				..NewTriggerExecution::default()
			})
			.await
			.unwrap();
		let linked = store
			.schedule(NewScheduledAction {
				execution_id: Some(exec),
				..new_action("add_vip", "u3", now)
			})
			.await
			.unwrap();
		assert_eq!(store.history(1, 0).await.unwrap()[0].execution_id, Some(exec));
		assert!(store.cancel(linked).await.unwrap());
	}

	#[tokio::test]
	async fn in_memory_store_semantics() {
		exercise(&InMemoryScheduledActionStore::default()).await;
	}

	#[tokio::test]
	async fn sqlite_store_semantics() {
		exercise(&SqlScheduledActionStore::new(memory_db().await)).await;
	}

	#[tokio::test]
	async fn undecodable_row_is_failed_and_the_rest_still_come_due() {
		let db = memory_db().await;
		let Database::Sqlite(pool) = &db else {
			panic!("expected sqlite");
		};
		sqlx::query(
			"INSERT INTO scheduled_actions (action_type, action_params, target_user_id, execute_at, status, created_at) \
			VALUES ('add_vip', 'not json', 'u0', 0, 'pending', 0)",
		)
		.execute(pool)
		.await
		.unwrap();
		let store = SqlScheduledActionStore::new(db.clone());
		let good = store.schedule(new_action("add_vip", "u1", 10)).await.unwrap();

		let due = store.pending_due(1_000).await.unwrap();
		assert_eq!(due.iter().map(|a| a.id).collect::<Vec<_>>(), vec![good]);

		let (status, error): (String, Option<String>) =
			sqlx::query_as("SELECT status, error_message FROM scheduled_actions WHERE id = 1")
				.fetch_one(pool)
				.await
				.unwrap();
		assert_eq!(status, "failed");
		assert!(error.unwrap().contains("decode params of scheduled action 1"));

		assert_eq!(store.pending_due(1_000).await.unwrap().len(), 1);
		let history = store.history(10, 0).await.unwrap();
		assert_eq!(history.iter().map(|a| a.id).collect::<Vec<_>>(), vec![good]);
	}

	#[test]
	fn status_strings_parse() {
		for s in [
			ScheduledStatus::Pending,
			ScheduledStatus::Done,
			ScheduledStatus::Failed,
			ScheduledStatus::Cancelled,
		] {
			assert_eq!(s.as_str().parse::<ScheduledStatus>().unwrap(), s);
		}
		assert!("executed".parse::<ScheduledStatus>().is_err());
	}
}
