#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use anyhow::{Context, anyhow};
use streambot_platform::unix_ms_now;
use tokio::sync::Mutex;

use crate::storage::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStatus {
	Pending,
	Completed,
	Cancelled,
}

impl DrawStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			DrawStatus::Pending => "pending",
			DrawStatus::Completed => "completed",
			DrawStatus::Cancelled => "cancelled",
		}
	}

	fn parse(s: &str) -> anyhow::Result<Self> {
		match s {
			"pending" => Ok(DrawStatus::Pending),
			"completed" => Ok(DrawStatus::Completed),
			"cancelled" => Ok(DrawStatus::Cancelled),
			other => Err(anyhow!("unknown draw status: {other}")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawRecord {
	pub id: i64,
	pub subject: String,
	pub initiator_id: String,
	pub initiator_name: String,
	pub started_at_ms: i64,
	pub ended_at_ms: Option<i64>,
	pub winner_id: Option<String>,
	pub winner_name: Option<String>,
	pub participant_count: u32,
	pub status: DrawStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
	Entry,
	Win,
	Initiated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LotteryStats {
	pub user_id: String,
	pub user_name: String,
	pub total_entries: u64,
	pub total_wins: u64,
	pub total_initiated: u64,
	pub last_win_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Winner<'a> {
	pub user_id: &'a str,
	pub user_name: &'a str,
}

#[async_trait::async_trait]
pub trait LotteryStore: Send + Sync {
	async fn create_draw(&self, subject: &str, initiator_id: &str, initiator_name: &str, started_at_ms: i64) -> anyhow::Result<i64>;

	async fn complete_draw(&self, id: i64, winner: Option<Winner<'_>>, participant_count: u32) -> anyhow::Result<()>;

	async fn cancel_draw(&self, id: i64, participant_count: u32) -> anyhow::Result<()>;

	/// Subjects are compared lowercase.
	async fn is_subject_used(&self, subject: &str) -> anyhow::Result<bool>;

	async fn mark_subject_used(&self, subject: &str, draw_id: i64) -> anyhow::Result<()>;

	async fn record_stat(&self, user_id: &str, user_name: &str, kind: StatKind) -> anyhow::Result<()>;

	async fn stats(&self, user_id: &str) -> anyhow::Result<Option<LotteryStats>>;

	/// Newest first.
	async fn recent_draws(&self, limit: u32) -> anyhow::Result<Vec<DrawRecord>>;
}

#[derive(Default)]
struct MemoryState {
	draws: Vec<DrawRecord>,
	used: HashSet<String>,
	stats: HashMap<String, LotteryStats>,
}

#[derive(Default)]
pub struct InMemoryLotteryStore {
	inner: Mutex<MemoryState>,
}

impl MemoryState {
	fn finish(&mut self, id: i64, status: DrawStatus, winner: Option<Winner<'_>>, participant_count: u32) -> anyhow::Result<()> {
		let draw = self
			.draws
			.iter_mut()
			.find(|d| d.id == id)
			.ok_or_else(|| anyhow!("unknown draw {id}"))?;
		draw.status = status;
		draw.ended_at_ms = Some(unix_ms_now());
		draw.participant_count = participant_count;
		draw.winner_id = winner.map(|w| w.user_id.to_string());
		draw.winner_name = winner.map(|w| w.user_name.to_string());
		Ok(())
	}
}

#[async_trait::async_trait]
impl LotteryStore for InMemoryLotteryStore {
	async fn create_draw(&self, subject: &str, initiator_id: &str, initiator_name: &str, started_at_ms: i64) -> anyhow::Result<i64> {
		let mut guard = self.inner.lock().await;
		let id = guard.draws.len() as i64 + 1;
		guard.draws.push(DrawRecord {
			id,
			subject: subject.to_string(),
			initiator_id: initiator_id.to_string(),
			initiator_name: initiator_name.to_string(),
			started_at_ms,
			ended_at_ms: None,
			winner_id: None,
			winner_name: None,
			participant_count: 0,
			status: DrawStatus::Pending,
		});
		Ok(id)
	}

	async fn complete_draw(&self, id: i64, winner: Option<Winner<'_>>, participant_count: u32) -> anyhow::Result<()> {
		self.inner
			.lock()
			.await
			.finish(id, DrawStatus::Completed, winner, participant_count)
	}

	async fn cancel_draw(&self, id: i64, participant_count: u32) -> anyhow::Result<()> {
		self.inner
			.lock()
			.await
			.finish(id, DrawStatus::Cancelled, None, participant_count)
	}

	async fn is_subject_used(&self, subject: &str) -> anyhow::Result<bool> {
		Ok(self.inner.lock().await.used.contains(&subject.to_lowercase()))
	}

	async fn mark_subject_used(&self, subject: &str, _draw_id: i64) -> anyhow::Result<()> {
		self.inner.lock().await.used.insert(subject.to_lowercase());
		Ok(())
	}

	async fn record_stat(&self, user_id: &str, user_name: &str, kind: StatKind) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		let stats = guard.stats.entry(user_id.to_string()).or_insert_with(|| LotteryStats {
			user_id: user_id.to_string(),
			..LotteryStats::default()
		});
		stats.user_name = user_name.to_string();
		match kind {
			StatKind::Entry => stats.total_entries += 1,
			StatKind::Win => {
				stats.total_wins += 1;
				stats.last_win_at_ms = Some(unix_ms_now());
			}
			StatKind::Initiated => stats.total_initiated += 1,
		}
		Ok(())
	}

	async fn stats(&self, user_id: &str) -> anyhow::Result<Option<LotteryStats>> {
		Ok(self.inner.lock().await.stats.get(user_id).cloned())
	}

	async fn recent_draws(&self, limit: u32) -> anyhow::Result<Vec<DrawRecord>> {
		let guard = self.inner.lock().await;
		Ok(guard.draws.iter().rev().take(limit as usize).cloned().collect())
	}
}

pub struct SqlLotteryStore {
	db: Database,
}

impl SqlLotteryStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

type DrawRow = (
	i64,
	String,
	String,
	String,
	i64,
	Option<i64>,
	Option<String>,
	Option<String>,
	i64,
	String,
);

type StatsRow = (String, String, i64, i64, i64, Option<i64>);

fn draw_from_row(row: DrawRow) -> anyhow::Result<DrawRecord> {
	let (id, subject, initiator_id, initiator_name, started_at, ended_at, winner_id, winner_name, count, status) = row;
	Ok(DrawRecord {
		id,
		subject,
		initiator_id,
		initiator_name,
		started_at_ms: started_at,
		ended_at_ms: ended_at,
		winner_id,
		winner_name,
		participant_count: count.max(0) as u32,
		status: DrawStatus::parse(&status)?,
	})
}

#[async_trait::async_trait]
impl LotteryStore for SqlLotteryStore {
	async fn create_draw(&self, subject: &str, initiator_id: &str, initiator_name: &str, started_at_ms: i64) -> anyhow::Result<i64> {
		let (id,): (i64,) = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO lottery_draws (subject, initiator_id, initiator_name, started_at, status) \
				VALUES (?, ?, ?, ?, ?) RETURNING id",
			)
			.bind(subject)
			.bind(initiator_id)
			.bind(initiator_name)
			.bind(started_at_ms)
			.bind(DrawStatus::Pending.as_str())
			.fetch_one(pool)
			.await
			.context("insert draw (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(
				"INSERT INTO lottery_draws (subject, initiator_id, initiator_name, started_at, status) \
				VALUES ($1, $2, $3, $4, $5) RETURNING id",
			)
			.bind(subject)
			.bind(initiator_id)
			.bind(initiator_name)
			.bind(started_at_ms)
			.bind(DrawStatus::Pending.as_str())
			.fetch_one(pool)
			.await
			.context("insert draw (postgres)")?,
		};
		Ok(id)
	}

	async fn complete_draw(&self, id: i64, winner: Option<Winner<'_>>, participant_count: u32) -> anyhow::Result<()> {
		let now = unix_ms_now();
		let winner_id = winner.map(|w| w.user_id);
		let winner_name = winner.map(|w| w.user_name);
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"UPDATE lottery_draws SET status = ?, ended_at = ?, winner_id = ?, winner_name = ?, \
					participant_count = ? WHERE id = ?",
				)
				.bind(DrawStatus::Completed.as_str())
				.bind(now)
				.bind(winner_id)
				.bind(winner_name)
				.bind(i64::from(participant_count))
				.bind(id)
				.execute(pool)
				.await
				.context("complete draw (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"UPDATE lottery_draws SET status = $1, ended_at = $2, winner_id = $3, winner_name = $4, \
					participant_count = $5 WHERE id = $6",
				)
				.bind(DrawStatus::Completed.as_str())
				.bind(now)
				.bind(winner_id)
				.bind(winner_name)
				.bind(i64::from(participant_count))
				.bind(id)
				.execute(pool)
				.await
				.context("complete draw (postgres)")?;
			}
		}
		Ok(())
	}

	async fn cancel_draw(&self, id: i64, participant_count: u32) -> anyhow::Result<()> {
		let now = unix_ms_now();
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"UPDATE lottery_draws SET status = ?, ended_at = ?, participant_count = ? WHERE id = ?",
				)
				.bind(DrawStatus::Cancelled.as_str())
				.bind(now)
				.bind(i64::from(participant_count))
				.bind(id)
				.execute(pool)
				.await
				.context("cancel draw (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"UPDATE lottery_draws SET status = $1, ended_at = $2, participant_count = $3 WHERE id = $4",
				)
				.bind(DrawStatus::Cancelled.as_str())
				.bind(now)
				.bind(i64::from(participant_count))
				.bind(id)
				.execute(pool)
				.await
				.context("cancel draw (postgres)")?;
			}
		}
		Ok(())
	}

	async fn is_subject_used(&self, subject: &str) -> anyhow::Result<bool> {
		let subject = subject.to_lowercase();
		let row: Option<(String,)> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as("SELECT subject FROM lottery_used_subjects WHERE subject = ?")
				.bind(&subject)
				.fetch_optional(pool)
				.await
				.context("select used subject (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as("SELECT subject FROM lottery_used_subjects WHERE subject = $1")
				.bind(&subject)
				.fetch_optional(pool)
				.await
				.context("select used subject (postgres)")?,
		};
		Ok(row.is_some())
	}

	async fn mark_subject_used(&self, subject: &str, draw_id: i64) -> anyhow::Result<()> {
		let subject = subject.to_lowercase();
		let now = unix_ms_now();
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO lottery_used_subjects (subject, draw_id, used_at) VALUES (?, ?, ?) \
					ON CONFLICT(subject) DO NOTHING",
				)
				.bind(&subject)
				.bind(draw_id)
				.bind(now)
				.execute(pool)
				.await
				.context("insert used subject (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO lottery_used_subjects (subject, draw_id, used_at) VALUES ($1, $2, $3) \
					ON CONFLICT (subject) DO NOTHING",
				)
				.bind(&subject)
				.bind(draw_id)
				.bind(now)
				.execute(pool)
				.await
				.context("insert used subject (postgres)")?;
			}
		}
		Ok(())
	}

	async fn record_stat(&self, user_id: &str, user_name: &str, kind: StatKind) -> anyhow::Result<()> {
		let now = unix_ms_now();
		let (entries, wins, initiated) = match kind {
			StatKind::Entry => (1_i64, 0_i64, 0_i64),
			StatKind::Win => (0, 1, 0),
			StatKind::Initiated => (0, 0, 1),
		};
		let last_win = (kind == StatKind::Win).then_some(now);
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO lottery_stats (user_id, user_name, total_entries, total_wins, total_initiated, \
					last_win_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
					ON CONFLICT(user_id) DO UPDATE SET user_name = excluded.user_name, \
					total_entries = lottery_stats.total_entries + excluded.total_entries, \
					total_wins = lottery_stats.total_wins + excluded.total_wins, \
					total_initiated = lottery_stats.total_initiated + excluded.total_initiated, \
					last_win_at = COALESCE(excluded.last_win_at, lottery_stats.last_win_at), \
					updated_at = excluded.updated_at",
				)
				.bind(user_id)
				.bind(user_name)
				.bind(entries)
				.bind(wins)
				.bind(initiated)
				.bind(last_win)
				.bind(now)
				.execute(pool)
				.await
				.context("upsert lottery stats (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO lottery_stats (user_id, user_name, total_entries, total_wins, total_initiated, \
					last_win_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
					ON CONFLICT (user_id) DO UPDATE SET user_name = EXCLUDED.user_name, \
					total_entries = lottery_stats.total_entries + EXCLUDED.total_entries, \
					total_wins = lottery_stats.total_wins + EXCLUDED.total_wins, \
					total_initiated = lottery_stats.total_initiated + EXCLUDED.total_initiated, \
					last_win_at = COALESCE(EXCLUDED.last_win_at, lottery_stats.last_win_at), \
					updated_at = EXCLUDED.updated_at",
				)
				.bind(user_id)
				.bind(user_name)
				.bind(entries)
				.bind(wins)
				.bind(initiated)
				.bind(last_win)
				.bind(now)
				.execute(pool)
				.await
				.context("upsert lottery stats (postgres)")?;
			}
		}
		Ok(())
	}

	async fn stats(&self, user_id: &str) -> anyhow::Result<Option<LotteryStats>> {
		const SELECT: &str =
			"SELECT user_id, user_name, total_entries, total_wins, total_initiated, last_win_at FROM lottery_stats";
		let row: Option<StatsRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!("{SELECT} WHERE user_id = ?"))
				.bind(user_id)
				.fetch_optional(pool)
				.await
				.context("select lottery stats (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!("{SELECT} WHERE user_id = $1"))
				.bind(user_id)
				.fetch_optional(pool)
				.await
				.context("select lottery stats (postgres)")?,
		};
		Ok(row.map(|(user_id, user_name, entries, wins, initiated, last_win)| LotteryStats {
			user_id,
			user_name,
			total_entries: entries.max(0) as u64,
			total_wins: wins.max(0) as u64,
			total_initiated: initiated.max(0) as u64,
			last_win_at_ms: last_win,
		}))
	}

	async fn recent_draws(&self, limit: u32) -> anyhow::Result<Vec<DrawRecord>> {
		const SELECT: &str = "SELECT id, subject, initiator_id, initiator_name, started_at, ended_at, winner_id, \
			winner_name, participant_count, status FROM lottery_draws ORDER BY id DESC";
		let rows: Vec<DrawRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!("{SELECT} LIMIT ?"))
				.bind(i64::from(limit))
				.fetch_all(pool)
				.await
				.context("select draws (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!("{SELECT} LIMIT $1"))
				.bind(i64::from(limit))
				.fetch_all(pool)
				.await
				.context("select draws (postgres)")?,
		};
		rows.into_iter().map(draw_from_row).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::memory_db;

	async fn exercise(store: &dyn LotteryStore) {
		let first = store.create_draw("Keyboard", "b", "Host", 10).await.unwrap();
		let second = store.create_draw("Mouse", "b", "Host", 20).await.unwrap();

		store
			.complete_draw(
				first,
				Some(Winner {
					user_id: "u1",
					user_name: "Alice",
				}),
				2,
			)
			.await
			.unwrap();
		store.cancel_draw(second, 0).await.unwrap();

		let draws = store.recent_draws(10).await.unwrap();
		assert_eq!(draws.len(), 2);
		assert_eq!(draws[0].id, second);
		assert_eq!(draws[0].status, DrawStatus::Cancelled);
		assert_eq!(draws[1].status, DrawStatus::Completed);
		assert_eq!(draws[1].winner_name.as_deref(), Some("Alice"));
		assert_eq!(draws[1].participant_count, 2);
		assert!(draws[1].ended_at_ms.is_some());

		assert!(!store.is_subject_used("keyboard").await.unwrap());
		store.mark_subject_used("KeyBoard", first).await.unwrap();
		store.mark_subject_used("keyboard", first).await.unwrap();
		assert!(store.is_subject_used("KEYBOARD").await.unwrap());

		store.record_stat("u1", "Alice", StatKind::Entry).await.unwrap();
		store.record_stat("u1", "Alice", StatKind::Entry).await.unwrap();
		store.record_stat("u1", "AliceNew", StatKind::Win).await.unwrap();
		store.record_stat("b", "Host", StatKind::Initiated).await.unwrap();

		let stats = store.stats("u1").await.unwrap().unwrap();
		assert_eq!(stats.total_entries, 2);
		assert_eq!(stats.total_wins, 1);
		assert_eq!(stats.total_initiated, 0);
		assert_eq!(stats.user_name, "AliceNew");
		assert!(stats.last_win_at_ms.is_some());
		assert_eq!(store.stats("b").await.unwrap().unwrap().total_initiated, 1);
		assert!(store.stats("nobody").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn in_memory_store_semantics() {
		exercise(&InMemoryLotteryStore::default()).await;
	}

	#[tokio::test]
	async fn sqlite_store_semantics() {
		exercise(&SqlLotteryStore::new(memory_db().await)).await;
	}
}
