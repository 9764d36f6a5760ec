#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

/// Connection pool shared by every SQL-backed store.
#[derive(Clone)]
pub enum Database {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl Database {
	/// Connect and run the embedded migrations for the backend named by the URL scheme.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			// every connection to an in-memory database sees its own empty schema
			let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
			let mut pool_opts = SqlitePoolOptions::new();
			if in_memory {
				pool_opts = pool_opts.max_connections(1).idle_timeout(None).max_lifetime(None);
			}

			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			info!(in_memory, "sqlite database ready");
			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			info!("postgres database ready");
			Ok(Self::Postgres(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self {
			Database::Sqlite(_) => "sqlite",
			Database::Postgres(_) => "postgres",
		}
	}
}

#[cfg(test)]
pub(crate) async fn memory_db() -> Database {
	Database::connect("sqlite::memory:").await.unwrap()
}
