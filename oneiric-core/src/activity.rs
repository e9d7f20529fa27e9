//! Durable pause/drain state for `(domain, key)` pairs.
//!
//! Backed by an embedded SQLite database when the `activity-store` feature
//! is enabled (the default), so operator pause/drain decisions survive a
//! process restart. Without the feature, an in-memory map is used instead —
//! useful for tests and for embedders who manage their own persistence.

use oneiric_model::{ActivityCounts, DomainActivity};

#[cfg(feature = "activity-store")]
mod sqlite_backend {
    use super::*;
    use chrono::Utc;
    use oneiric_model::{ConfigError, OneiricError};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::{Row, SqlitePool};
    use std::path::Path;
    use std::str::FromStr;

    pub struct ActivityStore {
        pool: SqlitePool,
    }

    impl ActivityStore {
        pub async fn open(path: &Path) -> Result<Self, OneiricError> {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
                .map_err(|e| ConfigError(e.to_string()))?
                .create_if_missing(true);
            Self::from_options(options).await
        }

        /// An ephemeral store backed by an in-memory SQLite database, used by
        /// tests that need the real backend without a file on disk.
        pub async fn open_in_memory() -> Result<Self, OneiricError> {
            let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| ConfigError(e.to_string()))?;
            Self::from_options(options).await
        }

        async fn from_options(options: SqliteConnectOptions) -> Result<Self, OneiricError> {
            let pool = SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await
                .map_err(|e| ConfigError(e.to_string()))?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS domain_activity (
                    domain TEXT NOT NULL,
                    key TEXT NOT NULL,
                    paused INTEGER NOT NULL DEFAULT 0,
                    draining INTEGER NOT NULL DEFAULT 0,
                    note TEXT,
                    updated_at TEXT,
                    PRIMARY KEY (domain, key)
                )",
            )
            .execute(&pool)
            .await
            .map_err(|e| ConfigError(e.to_string()))?;
            Ok(Self { pool })
        }

        pub async fn set(
            &self,
            domain: &str,
            key: &str,
            paused: bool,
            draining: bool,
            note: Option<&str>,
        ) -> Result<(), OneiricError> {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO domain_activity (domain, key, paused, draining, note, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(domain, key) DO UPDATE SET
                    paused = excluded.paused,
                    draining = excluded.draining,
                    note = excluded.note,
                    updated_at = excluded.updated_at",
            )
            .bind(domain)
            .bind(key)
            .bind(paused)
            .bind(draining)
            .bind(note)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| ConfigError(e.to_string()))?;
            tracing::info!(domain, key, paused, draining, note, "activity state updated");
            Ok(())
        }

        pub async fn get(&self, domain: &str, key: &str) -> Result<Option<DomainActivity>, OneiricError> {
            let row = sqlx::query(
                "SELECT domain, key, paused, draining, note, updated_at
                 FROM domain_activity WHERE domain = ?1 AND key = ?2",
            )
            .bind(domain)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ConfigError(e.to_string()))?;
            Ok(row.map(row_to_activity))
        }

        pub async fn snapshot_all(&self) -> Result<Vec<DomainActivity>, OneiricError> {
            let rows = sqlx::query("SELECT domain, key, paused, draining, note, updated_at FROM domain_activity")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ConfigError(e.to_string()))?;
            Ok(rows.into_iter().map(row_to_activity).collect())
        }

        pub async fn global_counts(&self) -> Result<ActivityCounts, OneiricError> {
            let all = self.snapshot_all().await?;
            Ok(tally(&all))
        }

        /// Whether a watcher should proceed: `false` when paused. Draining
        /// pairs still return `true` here — the caller defers rather than
        /// rejecting outright, per the watcher's own retry-after-delay policy.
        pub async fn should_accept_work(&self, domain: &str, key: &str) -> Result<bool, OneiricError> {
            match self.get(domain, key).await? {
                Some(activity) => Ok(!activity.paused),
                None => Ok(true),
            }
        }
    }

    fn row_to_activity(row: sqlx::sqlite::SqliteRow) -> DomainActivity {
        let updated_at: Option<String> = row.get("updated_at");
        DomainActivity {
            domain: row.get("domain"),
            key: row.get("key"),
            paused: row.get("paused"),
            draining: row.get("draining"),
            note: row.get("note"),
            updated_at: updated_at.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[cfg(feature = "activity-store")]
pub use sqlite_backend::ActivityStore;

#[cfg(not(feature = "activity-store"))]
mod memory_backend {
    use super::*;
    use oneiric_model::OneiricError;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct ActivityStore {
        state: Mutex<BTreeMap<(String, String), DomainActivity>>,
    }

    impl ActivityStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn open_in_memory() -> Result<Self, OneiricError> {
            Ok(Self::default())
        }

        pub async fn set(
            &self,
            domain: &str,
            key: &str,
            paused: bool,
            draining: bool,
            note: Option<&str>,
        ) -> Result<(), OneiricError> {
            let mut activity = DomainActivity::new(domain, key);
            activity.paused = paused;
            activity.draining = draining;
            activity.note = note.map(str::to_string);
            self.state.lock().insert((domain.to_string(), key.to_string()), activity);
            Ok(())
        }

        pub async fn get(&self, domain: &str, key: &str) -> Result<Option<DomainActivity>, OneiricError> {
            Ok(self.state.lock().get(&(domain.to_string(), key.to_string())).cloned())
        }

        pub async fn snapshot_all(&self) -> Result<Vec<DomainActivity>, OneiricError> {
            Ok(self.state.lock().values().cloned().collect())
        }

        pub async fn global_counts(&self) -> Result<ActivityCounts, OneiricError> {
            let all = self.snapshot_all().await?;
            Ok(tally(&all))
        }

        pub async fn should_accept_work(&self, domain: &str, key: &str) -> Result<bool, OneiricError> {
            match self.get(domain, key).await? {
                Some(activity) => Ok(!activity.paused),
                None => Ok(true),
            }
        }
    }
}

#[cfg(not(feature = "activity-store"))]
pub use memory_backend::ActivityStore;

fn tally(all: &[DomainActivity]) -> ActivityCounts {
    let mut counts = ActivityCounts::default();
    for activity in all {
        counts.total += 1;
        if activity.paused {
            counts.paused += 1;
        }
        if activity.draining {
            counts.draining += 1;
        }
        if activity.note.is_some() {
            counts.noted += 1;
        }
    }
    counts
}

#[cfg(all(test, not(feature = "activity-store")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_blocks_work_and_unpause_restores_it() {
        let store = ActivityStore::new();
        assert!(store.should_accept_work("service", "status").await.unwrap());
        store.set("service", "status", true, false, Some("deploy window")).await.unwrap();
        assert!(!store.should_accept_work("service", "status").await.unwrap());
        let counts = store.global_counts().await.unwrap();
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.noted, 1);
        store.set("service", "status", false, false, None).await.unwrap();
        assert!(store.should_accept_work("service", "status").await.unwrap());
    }
}
