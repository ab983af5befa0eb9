use docrepo_core::{ManualClock, Repository, RepositoryConfig, StaticSchemaManager};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn content_model() -> Arc<StaticSchemaManager> {
    Arc::new(StaticSchemaManager::default_content_model())
}

#[allow(dead_code)]
pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("repository.db")
}

#[allow(dead_code)]
pub fn sqlite_config(dir: &TempDir) -> RepositoryConfig {
    RepositoryConfig::sqlite("test", db_path(dir))
}

/// Non-clustered repository over a file database in `dir`.
#[allow(dead_code)]
pub fn open_repository(dir: &TempDir) -> Repository {
    Repository::new(sqlite_config(dir), content_model()).unwrap()
}

/// One cluster node over the shared database in `dir`.
#[allow(dead_code)]
pub fn open_cluster_node(dir: &TempDir, delay_ms: u64, clock: &ManualClock) -> Repository {
    Repository::with_clock(
        sqlite_config(dir).with_clustering(delay_ms),
        content_model(),
        Arc::new(clock.clone()),
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn count_rows(dir: &TempDir, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(db_path(dir)).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .unwrap()
}
