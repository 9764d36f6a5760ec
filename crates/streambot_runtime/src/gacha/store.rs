#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Context;
use streambot_platform::unix_ms_now;
use tokio::sync::Mutex;

use crate::storage::Database;

/// Per-user, per-banner pity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PityRecord {
	pub pulls_since_top: u32,
	pub pulls_since_second: u32,
	pub second_rate_up_misses: u32,
	/// Next 5★ is the featured item.
	pub guaranteed_top: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPity {
	pub user_id: String,
	pub user_name: String,
	pub banner_id: u32,
	pub pity: PityRecord,
	pub updated_at_ms: i64,
}

#[async_trait::async_trait]
pub trait PityStore: Send + Sync {
	async fn get(&self, user_id: &str, banner_id: u32) -> anyhow::Result<Option<UserPity>>;

	/// Insert or replace the record for (user, banner).
	async fn save(&self, user_id: &str, user_name: &str, banner_id: u32, pity: PityRecord) -> anyhow::Result<()>;

	/// Zero the counters, keeping the row.
	async fn reset(&self, user_id: &str, banner_id: u32) -> anyhow::Result<bool>;

	async fn delete(&self, user_id: &str, banner_id: u32) -> anyhow::Result<bool>;

	async fn delete_banner(&self, banner_id: u32) -> anyhow::Result<u64>;

	async fn count_users(&self, banner_id: u32) -> anyhow::Result<u64>;

	/// Users of a banner ordered by most recent pull.
	async fn users(&self, banner_id: u32, limit: u32, offset: u32) -> anyhow::Result<Vec<UserPity>>;

	/// Case-insensitive substring search on user name.
	async fn search(&self, banner_id: Option<u32>, query: &str) -> anyhow::Result<Vec<UserPity>>;
}

#[derive(Default)]
pub struct InMemoryPityStore {
	inner: Mutex<BTreeMap<(String, u32), UserPity>>,
}

fn by_recency(rows: &mut [UserPity]) {
	rows.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms).then_with(|| a.user_id.cmp(&b.user_id)));
}

#[async_trait::async_trait]
impl PityStore for InMemoryPityStore {
	async fn get(&self, user_id: &str, banner_id: u32) -> anyhow::Result<Option<UserPity>> {
		let guard = self.inner.lock().await;
		Ok(guard.get(&(user_id.to_string(), banner_id)).cloned())
	}

	async fn save(&self, user_id: &str, user_name: &str, banner_id: u32, pity: PityRecord) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.insert(
			(user_id.to_string(), banner_id),
			UserPity {
				user_id: user_id.to_string(),
				user_name: user_name.to_string(),
				banner_id,
				pity,
				updated_at_ms: unix_ms_now(),
			},
		);
		Ok(())
	}

	async fn reset(&self, user_id: &str, banner_id: u32) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		match guard.get_mut(&(user_id.to_string(), banner_id)) {
			Some(row) => {
				row.pity = PityRecord::default();
				row.updated_at_ms = unix_ms_now();
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn delete(&self, user_id: &str, banner_id: u32) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		Ok(guard.remove(&(user_id.to_string(), banner_id)).is_some())
	}

	async fn delete_banner(&self, banner_id: u32) -> anyhow::Result<u64> {
		let mut guard = self.inner.lock().await;
		let before = guard.len();
		guard.retain(|(_, b), _| *b != banner_id);
		Ok((before - guard.len()) as u64)
	}

	async fn count_users(&self, banner_id: u32) -> anyhow::Result<u64> {
		let guard = self.inner.lock().await;
		Ok(guard.keys().filter(|(_, b)| *b == banner_id).count() as u64)
	}

	async fn users(&self, banner_id: u32, limit: u32, offset: u32) -> anyhow::Result<Vec<UserPity>> {
		let guard = self.inner.lock().await;
		let mut rows: Vec<UserPity> = guard.values().filter(|r| r.banner_id == banner_id).cloned().collect();
		by_recency(&mut rows);
		Ok(rows.into_iter().skip(offset as usize).take(limit as usize).collect())
	}

	async fn search(&self, banner_id: Option<u32>, query: &str) -> anyhow::Result<Vec<UserPity>> {
		let needle = query.trim().to_lowercase();
		let guard = self.inner.lock().await;
		let mut rows: Vec<UserPity> = guard
			.values()
			.filter(|r| banner_id.is_none_or(|b| r.banner_id == b))
			.filter(|r| r.user_name.to_lowercase().contains(&needle))
			.cloned()
			.collect();
		by_recency(&mut rows);
		Ok(rows)
	}
}

pub struct SqlPityStore {
	db: Database,
}

impl SqlPityStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

type PityRow = (String, String, i64, i64, i64, i64, bool, i64);

const PITY_COLUMNS: &str =
	"user_id, user_name, banner_id, pulls_since_top, pulls_since_second, second_rate_up_misses, guaranteed_top, updated_at";

fn pity_from_row(row: PityRow) -> UserPity {
	let (user_id, user_name, banner_id, top, second, misses, guaranteed, updated_at) = row;
	UserPity {
		user_id,
		user_name,
		banner_id: banner_id as u32,
		pity: PityRecord {
			pulls_since_top: top as u32,
			pulls_since_second: second as u32,
			second_rate_up_misses: misses as u32,
			guaranteed_top: guaranteed,
		},
		updated_at_ms: updated_at,
	}
}

fn like_pattern(query: &str) -> String {
	let escaped = query.trim().to_lowercase().replace('%', "\\%").replace('_', "\\_");
	format!("%{escaped}%")
}

#[async_trait::async_trait]
impl PityStore for SqlPityStore {
	async fn get(&self, user_id: &str, banner_id: u32) -> anyhow::Result<Option<UserPity>> {
		let row: Option<PityRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE user_id = ? AND banner_id = ?"
			))
			.bind(user_id)
			.bind(i64::from(banner_id))
			.fetch_optional(pool)
			.await
			.context("select pity (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE user_id = $1 AND banner_id = $2"
			))
			.bind(user_id)
			.bind(i64::from(banner_id))
			.fetch_optional(pool)
			.await
			.context("select pity (postgres)")?,
		};
		Ok(row.map(pity_from_row))
	}

	async fn save(&self, user_id: &str, user_name: &str, banner_id: u32, pity: PityRecord) -> anyhow::Result<()> {
		let now = unix_ms_now();
		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO user_pity (user_id, banner_id, user_name, pulls_since_top, pulls_since_second, \
					second_rate_up_misses, guaranteed_top, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
					ON CONFLICT(user_id, banner_id) DO UPDATE SET user_name = excluded.user_name, \
					pulls_since_top = excluded.pulls_since_top, pulls_since_second = excluded.pulls_since_second, \
					second_rate_up_misses = excluded.second_rate_up_misses, guaranteed_top = excluded.guaranteed_top, \
					updated_at = excluded.updated_at",
				)
				.bind(user_id)
				.bind(i64::from(banner_id))
				.bind(user_name)
				.bind(i64::from(pity.pulls_since_top))
				.bind(i64::from(pity.pulls_since_second))
				.bind(i64::from(pity.second_rate_up_misses))
				.bind(pity.guaranteed_top)
				.bind(now)
				.execute(pool)
				.await
				.context("upsert pity (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO user_pity (user_id, banner_id, user_name, pulls_since_top, pulls_since_second, \
					second_rate_up_misses, guaranteed_top, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
					ON CONFLICT (user_id, banner_id) DO UPDATE SET user_name = EXCLUDED.user_name, \
					pulls_since_top = EXCLUDED.pulls_since_top, pulls_since_second = EXCLUDED.pulls_since_second, \
					second_rate_up_misses = EXCLUDED.second_rate_up_misses, guaranteed_top = EXCLUDED.guaranteed_top, \
					updated_at = EXCLUDED.updated_at",
				)
				.bind(user_id)
				.bind(i64::from(banner_id))
				.bind(user_name)
				.bind(i64::from(pity.pulls_since_top))
				.bind(i64::from(pity.pulls_since_second))
				.bind(i64::from(pity.second_rate_up_misses))
				.bind(pity.guaranteed_top)
				.bind(now)
				.execute(pool)
				.await
				.context("upsert pity (postgres)")?;
			}
		}
		Ok(())
	}

	async fn reset(&self, user_id: &str, banner_id: u32) -> anyhow::Result<bool> {
		let now = unix_ms_now();
		let affected = match &self.db {
			Database::Sqlite(pool) => sqlx::query(
				"UPDATE user_pity SET pulls_since_top = 0, pulls_since_second = 0, second_rate_up_misses = 0, \
				guaranteed_top = 0, updated_at = ? WHERE user_id = ? AND banner_id = ?",
			)
			.bind(now)
			.bind(user_id)
			.bind(i64::from(banner_id))
			.execute(pool)
			.await
			.context("reset pity (sqlite)")?
			.rows_affected(),
			Database::Postgres(pool) => sqlx::query(
				"UPDATE user_pity SET pulls_since_top = 0, pulls_since_second = 0, second_rate_up_misses = 0, \
				guaranteed_top = FALSE, updated_at = $1 WHERE user_id = $2 AND banner_id = $3",
			)
			.bind(now)
			.bind(user_id)
			.bind(i64::from(banner_id))
			.execute(pool)
			.await
			.context("reset pity (postgres)")?
			.rows_affected(),
		};
		Ok(affected > 0)
	}

	async fn delete(&self, user_id: &str, banner_id: u32) -> anyhow::Result<bool> {
		let affected = match &self.db {
			Database::Sqlite(pool) => sqlx::query("DELETE FROM user_pity WHERE user_id = ? AND banner_id = ?")
				.bind(user_id)
				.bind(i64::from(banner_id))
				.execute(pool)
				.await
				.context("delete pity (sqlite)")?
				.rows_affected(),
			Database::Postgres(pool) => sqlx::query("DELETE FROM user_pity WHERE user_id = $1 AND banner_id = $2")
				.bind(user_id)
				.bind(i64::from(banner_id))
				.execute(pool)
				.await
				.context("delete pity (postgres)")?
				.rows_affected(),
		};
		Ok(affected > 0)
	}

	async fn delete_banner(&self, banner_id: u32) -> anyhow::Result<u64> {
		let affected = match &self.db {
			Database::Sqlite(pool) => sqlx::query("DELETE FROM user_pity WHERE banner_id = ?")
				.bind(i64::from(banner_id))
				.execute(pool)
				.await
				.context("delete banner pity (sqlite)")?
				.rows_affected(),
			Database::Postgres(pool) => sqlx::query("DELETE FROM user_pity WHERE banner_id = $1")
				.bind(i64::from(banner_id))
				.execute(pool)
				.await
				.context("delete banner pity (postgres)")?
				.rows_affected(),
		};
		Ok(affected)
	}

	async fn count_users(&self, banner_id: u32) -> anyhow::Result<u64> {
		let (count,): (i64,) = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM user_pity WHERE banner_id = ?")
				.bind(i64::from(banner_id))
				.fetch_one(pool)
				.await
				.context("count pity users (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM user_pity WHERE banner_id = $1")
				.bind(i64::from(banner_id))
				.fetch_one(pool)
				.await
				.context("count pity users (postgres)")?,
		};
		Ok(count.max(0) as u64)
	}

	async fn users(&self, banner_id: u32, limit: u32, offset: u32) -> anyhow::Result<Vec<UserPity>> {
		let rows: Vec<PityRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE banner_id = ? \
				ORDER BY updated_at DESC, user_id ASC LIMIT ? OFFSET ?"
			))
			.bind(i64::from(banner_id))
			.bind(i64::from(limit))
			.bind(i64::from(offset))
			.fetch_all(pool)
			.await
			.context("list pity users (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE banner_id = $1 \
				ORDER BY updated_at DESC, user_id ASC LIMIT $2 OFFSET $3"
			))
			.bind(i64::from(banner_id))
			.bind(i64::from(limit))
			.bind(i64::from(offset))
			.fetch_all(pool)
			.await
			.context("list pity users (postgres)")?,
		};
		Ok(rows.into_iter().map(pity_from_row).collect())
	}

	async fn search(&self, banner_id: Option<u32>, query: &str) -> anyhow::Result<Vec<UserPity>> {
		let pattern = like_pattern(query);
		let rows: Vec<PityRow> = match (&self.db, banner_id) {
			(Database::Sqlite(pool), Some(banner)) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE banner_id = ? AND LOWER(user_name) LIKE ? ESCAPE '\\' \
				ORDER BY updated_at DESC, user_id ASC"
			))
			.bind(i64::from(banner))
			.bind(&pattern)
			.fetch_all(pool)
			.await
			.context("search pity (sqlite)")?,
			(Database::Sqlite(pool), None) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE LOWER(user_name) LIKE ? ESCAPE '\\' \
				ORDER BY updated_at DESC, user_id ASC"
			))
			.bind(&pattern)
			.fetch_all(pool)
			.await
			.context("search pity (sqlite)")?,
			(Database::Postgres(pool), Some(banner)) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE banner_id = $1 AND LOWER(user_name) LIKE $2 ESCAPE '\\' \
				ORDER BY updated_at DESC, user_id ASC"
			))
			.bind(i64::from(banner))
			.bind(&pattern)
			.fetch_all(pool)
			.await
			.context("search pity (postgres)")?,
			(Database::Postgres(pool), None) => sqlx::query_as(&format!(
				"SELECT {PITY_COLUMNS} FROM user_pity WHERE LOWER(user_name) LIKE $1 ESCAPE '\\' \
				ORDER BY updated_at DESC, user_id ASC"
			))
			.bind(&pattern)
			.fetch_all(pool)
			.await
			.context("search pity (postgres)")?,
		};
		Ok(rows.into_iter().map(pity_from_row).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::memory_db;

	fn record(top: u32) -> PityRecord {
		PityRecord {
			pulls_since_top: top,
			pulls_since_second: top % 10,
			second_rate_up_misses: 1,
			guaranteed_top: true,
		}
	}

	async fn exercise(store: &dyn PityStore) {
		assert!(store.get("u1", 0).await.unwrap().is_none());

		store.save("u1", "Alice", 0, record(12)).await.unwrap();
		store.save("u2", "Bob", 0, record(3)).await.unwrap();
		store.save("u1", "Alice", 1, record(40)).await.unwrap();

		let row = store.get("u1", 0).await.unwrap().unwrap();
		assert_eq!(row.pity, record(12));
		assert_eq!(row.user_name, "Alice");

		store.save("u1", "AliceRenamed", 0, record(13)).await.unwrap();
		let row = store.get("u1", 0).await.unwrap().unwrap();
		assert_eq!(row.pity.pulls_since_top, 13);
		assert_eq!(row.user_name, "AliceRenamed");

		assert_eq!(store.count_users(0).await.unwrap(), 2);
		assert_eq!(store.users(0, 1, 0).await.unwrap().len(), 1);
		assert_eq!(store.users(0, 10, 1).await.unwrap().len(), 1);

		let found = store.search(None, "alice").await.unwrap();
		assert_eq!(found.len(), 2);
		let found = store.search(Some(1), "ALI").await.unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].banner_id, 1);
		assert!(store.search(None, "%").await.unwrap().is_empty());

		assert!(store.reset("u2", 0).await.unwrap());
		assert_eq!(store.get("u2", 0).await.unwrap().unwrap().pity, PityRecord::default());
		assert!(!store.reset("ghost", 0).await.unwrap());

		assert!(store.delete("u2", 0).await.unwrap());
		assert!(!store.delete("u2", 0).await.unwrap());
		assert_eq!(store.delete_banner(1).await.unwrap(), 1);
		assert_eq!(store.count_users(1).await.unwrap(), 0);
		assert_eq!(store.count_users(0).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn in_memory_store_semantics() {
		exercise(&InMemoryPityStore::default()).await;
	}

	#[tokio::test]
	async fn sqlite_store_semantics() {
		exercise(&SqlPityStore::new(memory_db().await)).await;
	}
}
