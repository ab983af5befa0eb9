//! CLI smoke entry point.
//!
//! # Responsibility
//! - Open the repository described by a TOML file with the default content
//!   model and report what the first session sees.
//! - Keep output deterministic for quick local sanity checks.
//!
//! Usage: `docrepo_cli <repository.toml> [absolute-log-dir]`

use docrepo_core::{
    core_version, default_log_level, init_logging, PollOutcome, RepoResult, Repository,
    RepositoryConfig, StaticSchemaManager,
};
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else {
        eprintln!("usage: docrepo_cli <repository.toml> [absolute-log-dir]");
        return ExitCode::from(2);
    };
    if let Some(log_dir) = args.next() {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    match run(&config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("event=cli_run module=cli status=error error={}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &str) -> RepoResult<()> {
    let config = RepositoryConfig::load(config_path)?;
    let repository = Repository::new(
        config,
        Arc::new(StaticSchemaManager::default_content_model()),
    )?;

    let mut session = repository.get_connection(None)?;
    let roots = session.get_children(None)?;
    println!("docrepo_core version={}", core_version());
    println!("repository={}", repository.name());
    if let Some(dialect) = repository.dialect() {
        println!("dialect={}", dialect.name());
    }
    println!("root_documents={}", roots.len());
    for doc in &roots {
        println!("  {} [{}] {}", doc.name, doc.doc_type, doc.id);
    }
    if let Some(node_id) = repository.cluster_node_id() {
        println!("cluster_node={node_id}");
        if let PollOutcome::Received(count) = repository.receive_cluster_invalidations()? {
            println!("cluster_invalidations={count}");
        }
    }

    session.close();
    repository.close();
    Ok(())
}
