mod common;

use common::{content_model, db_path, open_repository, sqlite_config};
use docrepo_core::{RepoError, Repository};
use rusqlite::Connection;

#[test]
fn commit_invalidates_other_sessions_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);
    let mut writer = repository.get_connection(None).unwrap();
    let reader = repository.get_connection(None).unwrap();

    let doc = writer.create_document(None, "draft", "Note").unwrap();
    writer.set_property(doc.id, "dublincore:title", "v1").unwrap();
    writer.commit().unwrap();

    assert_eq!(
        reader
            .get_document(doc.id)
            .unwrap()
            .string_property("dublincore:title"),
        Some("v1")
    );
    assert!(reader.is_cached(doc.id));

    writer.set_property(doc.id, "dublincore:title", "v2").unwrap();
    writer.commit().unwrap();

    assert!(!reader.is_cached(doc.id));
    assert_eq!(
        reader
            .get_document(doc.id)
            .unwrap()
            .string_property("dublincore:title"),
        Some("v2")
    );
    assert!(writer.is_cached(doc.id));
}

#[test]
fn deletion_evicts_and_later_reads_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);
    let mut writer = repository.get_connection(None).unwrap();
    let reader = repository.get_connection(None).unwrap();

    let folder = writer.create_document(None, "folder", "Folder").unwrap();
    let child = writer.create_document(Some(folder.id), "child", "Note").unwrap();
    writer.commit().unwrap();
    reader.get_document(folder.id).unwrap();
    reader.get_document(child.id).unwrap();
    assert_eq!(reader.cached_count(), 2);

    writer.remove_document(folder.id).unwrap();
    writer.commit().unwrap();

    assert_eq!(reader.cached_count(), 0);
    assert!(matches!(
        reader.get_document(folder.id),
        Err(RepoError::NotFound(id)) if id == folder.id
    ));
    assert!(matches!(
        reader.get_document(child.id),
        Err(RepoError::NotFound(_))
    ));
}

#[test]
fn cascade_deleted_rows_from_other_sessions_are_announced() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);
    let mut remover = repository.get_connection(None).unwrap();
    let mut adder = repository.get_connection(None).unwrap();

    let folder = remover.create_document(None, "shared", "Folder").unwrap();
    remover.commit().unwrap();

    // The remover collects the subtree before the adder's child exists.
    remover.remove_document(folder.id).unwrap();
    let late_child = adder.create_document(Some(folder.id), "late", "Note").unwrap();
    adder.commit().unwrap();
    assert!(adder.is_cached(late_child.id));

    remover.commit().unwrap();
    assert!(!adder.is_cached(late_child.id));
    assert!(matches!(
        adder.get_document(late_child.id),
        Err(RepoError::NotFound(_))
    ));
}

#[test]
fn conflicting_commit_rolls_back_and_announces_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);
    let mut setup = repository.get_connection(None).unwrap();
    let doc = setup.create_document(None, "contract", "Note").unwrap();
    setup.set_property(doc.id, "dublincore:title", "before").unwrap();
    setup.create_document(None, "taken", "Folder").unwrap();
    setup.commit().unwrap();

    let observer = repository.get_connection(None).unwrap();
    observer.get_document(doc.id).unwrap();

    let mut failing = repository.get_connection(None).unwrap();
    failing.set_property(doc.id, "dublincore:title", "after").unwrap();
    failing.create_document(None, "taken", "Folder").unwrap();

    let err = failing.commit().unwrap_err();
    assert!(matches!(err, RepoError::Conflict(_)));
    assert!(!failing.has_pending_changes());
    assert!(!failing.is_cached(doc.id));

    assert!(observer.is_cached(doc.id));
    assert_eq!(
        failing
            .get_document(doc.id)
            .unwrap()
            .string_property("dublincore:title"),
        Some("before")
    );
    assert_eq!(failing.get_children(None).unwrap().len(), 2);
}

#[test]
fn update_of_concurrently_removed_document_is_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);
    let mut first = repository.get_connection(None).unwrap();
    let mut second = repository.get_connection(None).unwrap();

    let doc = first.create_document(None, "contested", "Note").unwrap();
    first.commit().unwrap();

    first.set_property(doc.id, "note:body", "edit").unwrap();
    second.remove_document(doc.id).unwrap();
    second.commit().unwrap();

    assert!(matches!(first.commit(), Err(RepoError::Conflict(_))));
    assert!(matches!(
        first.get_document(doc.id),
        Err(RepoError::NotFound(_))
    ));
}

#[test]
fn busy_backend_fails_commit_with_connectivity() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sqlite_config(&dir);
    config
        .properties
        .insert("busyTimeout/Integer".to_string(), "50".to_string());
    let repository = Repository::new(config, content_model()).unwrap();

    let mut writer = repository.get_connection(None).unwrap();
    let observer = repository.get_connection(None).unwrap();
    let doc = writer.create_document(None, "doc", "Note").unwrap();
    writer.commit().unwrap();
    observer.get_document(doc.id).unwrap();

    let blocker = Connection::open(db_path(&dir)).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    writer.set_property(doc.id, "note:body", "blocked").unwrap();
    let err = writer.commit().unwrap_err();
    assert!(matches!(err, RepoError::Connectivity(_)));
    assert!(err.is_retryable());
    assert!(!writer.has_pending_changes());
    assert!(observer.is_cached(doc.id));

    blocker.execute_batch("ROLLBACK").unwrap();
    assert_eq!(writer.get_document(doc.id).unwrap().property("note:body"), None);
}

#[test]
fn repository_clear_caches_reaches_every_session() {
    let dir = tempfile::tempdir().unwrap();
    let repository = open_repository(&dir);
    let mut writer = repository.get_connection(None).unwrap();
    let reader = repository.get_connection(None).unwrap();

    let doc = writer.create_document(None, "cached", "Folder").unwrap();
    writer.commit().unwrap();
    reader.get_document(doc.id).unwrap();

    assert_eq!(repository.clear_caches(), 2);
    assert_eq!(writer.cached_count(), 0);
    assert_eq!(reader.cached_count(), 0);
    assert_eq!(reader.get_document(doc.id).unwrap().name, "cached");
}
