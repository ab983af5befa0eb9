mod common;

use common::{content_model, count_rows, db_path, open_repository, sqlite_config};
use docrepo_core::{
    Credentials, Dialect, DocumentType, ManualClock, RepoError, Repository, RepositoryConfig,
    StaticSchemaManager,
};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn backend_is_not_touched_until_first_connection() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);

    assert!(!db_path(&dir).exists());
    assert_eq!(repository.init_stats().dialect_probes, 0);
    assert!(repository.dialect().is_none());

    let session = repository.get_connection(None).unwrap();
    assert!(db_path(&dir).exists());
    assert!(session.is_live());
    assert!(matches!(repository.dialect(), Some(Dialect::Sqlite { .. })));

    let stats = repository.init_stats();
    assert_eq!(stats.dialect_probes, 1);
    assert_eq!(stats.model_builds, 1);
    assert_eq!(stats.cluster_registrations, 0);
}

#[test]
fn later_connections_reuse_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);

    let first = repository.get_connection(None).unwrap();
    let second = repository.get_connection(None).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(repository.active_session_count(), 2);
    assert_eq!(repository.init_stats().model_builds, 1);
}

#[test]
fn unknown_backend_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sqlite_config(&dir);
    config.backend = "oracle".to_string();

    let err = Repository::new(config, content_model()).unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}

#[test]
fn missing_path_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sqlite_config(&dir);
    config.properties.clear();

    let err = Repository::new(config, content_model()).unwrap_err();
    assert!(matches!(err, RepoError::Configuration(_)));
}

#[test]
fn invalid_schema_model_fails_every_call_without_rebuilding() {
    let dir = tempfile::tempdir().unwrap();
    let broken = StaticSchemaManager::new().with_type(DocumentType::new("Broken", &["missing"]));
    let repository = Repository::new(sqlite_config(&dir), Arc::new(broken)).unwrap();

    for _ in 0..2 {
        let err = repository.get_connection(None).unwrap_err();
        assert!(matches!(err, RepoError::Configuration(_)));
        assert!(!err.is_retryable());
    }
    assert_eq!(repository.init_stats().model_builds, 1);
    assert_eq!(repository.active_session_count(), 0);
}

#[test]
fn connectivity_failure_is_retried_on_next_call() {
    let dir = tempfile::tempdir().unwrap();
    let missing_dir = dir.path().join("not-yet");
    let config = RepositoryConfig::sqlite("retry", missing_dir.join("repository.db"));
    let repository = Repository::new(config, content_model()).unwrap();

    let err = repository.get_connection(None).unwrap_err();
    assert!(matches!(err, RepoError::Connectivity(_)));
    assert!(err.is_retryable());
    assert_eq!(repository.init_stats().model_builds, 0);

    std::fs::create_dir_all(&missing_dir).unwrap();
    let session = repository.get_connection(None).unwrap();
    assert!(session.is_live());
    assert_eq!(repository.init_stats().dialect_probes, 1);
    assert_eq!(repository.init_stats().model_builds, 1);
}

#[test]
fn concurrent_first_connections_bootstrap_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let repository = common::open_cluster_node(&dir, 200, &clock);
    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));

    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let repository = repository.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                repository.get_connection(None)
            })
        })
        .collect();
    let sessions: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    let stats = repository.init_stats();
    assert_eq!(stats.dialect_probes, 1);
    assert_eq!(stats.model_builds, 1);
    assert_eq!(stats.cluster_registrations, 1);
    assert_eq!(count_rows(&dir, "cluster_nodes"), 1);
    assert_eq!(repository.active_session_count(), callers);

    let mut ids: Vec<_> = sessions.iter().map(|session| session.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), callers);
}

#[test]
fn closing_sessions_updates_the_live_set() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);

    let mut first = repository.get_connection(None).unwrap();
    let second = repository.get_connection(None).unwrap();
    assert_eq!(repository.active_session_count(), 2);

    first.close();
    first.close();
    assert!(!first.is_live());
    assert!(matches!(
        first.get_children(None),
        Err(RepoError::SessionClosed)
    ));
    assert_eq!(repository.active_session_count(), 1);

    drop(second);
    assert_eq!(repository.active_session_count(), 0);
}

#[test]
fn repository_close_force_closes_sessions_and_leaves_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(0);
    let repository = common::open_cluster_node(&dir, 100, &clock);

    let mut session = repository.get_connection(None).unwrap();
    let folder = session.create_document(None, "docs", "Folder").unwrap();
    let other = repository.get_connection(None).unwrap();
    assert_eq!(count_rows(&dir, "cluster_nodes"), 1);

    repository.close();
    repository.close();

    assert!(repository.is_closed());
    assert!(!session.is_live());
    assert!(!other.is_live());
    assert_eq!(repository.active_session_count(), 0);
    assert!(repository.cluster_node_id().is_none());
    assert_eq!(count_rows(&dir, "cluster_nodes"), 0);
    assert!(matches!(session.commit(), Err(RepoError::SessionClosed)));
    assert!(matches!(
        session.get_document(folder.id),
        Err(RepoError::SessionClosed)
    ));
    assert!(matches!(
        repository.get_connection(None),
        Err(RepoError::RepositoryClosed)
    ));
}

#[test]
fn toml_config_binds_typed_and_expanded_properties() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("DOCREPO_LIFECYCLE_TEST_DIR", dir.path());
    let config = RepositoryConfig::from_toml_str(
        r#"
name = "main"
clustering_enabled = true
clustering_delay_ms = 50

[properties]
path = "${DOCREPO_LIFECYCLE_TEST_DIR}/main.db"
"busyTimeout/Integer" = "2500"
unknownKnob = "ignored"
"#,
    )
    .unwrap();
    assert_eq!(config.clustering_delay_ms, 50);

    let repository = Repository::new(config, content_model()).unwrap();
    let session = repository
        .get_connection(Some(Credentials::new("alice", Some("secret".to_string()))))
        .unwrap();

    assert!(dir.path().join("main.db").exists());
    assert_eq!(session.credentials().unwrap().user, "alice");
    assert!(!format!("{:?}", session.credentials()).contains("secret"));
    assert!(repository.cluster_node_id().is_some());
}
