//! Repository: shared connection point for sessions.
//!
//! # Responsibility
//! - Lazily bootstrap the backend (dialect, model, schema, cluster node) on
//!   the first successful `get_connection`.
//! - Track live sessions and fan committed invalidations out to them.
//! - Propagate invalidations to other processes through the cluster tables.
//!
//! # Invariants
//! - Backend bootstrap runs at most once to completion.
//! - A session is in the live set from `get_connection` until its `close`.
//! - Cluster mapper, node id and poll timestamp are only touched under the
//!   cluster mutex; cluster fan-out happens after that mutex is released.
//! - Cluster persistence failures never fail a session commit.
//!
//! # See also
//! - crate::session for the per-session cache and commit path.

mod poller;

pub use poller::ClusterPoller;

use crate::binary::{BinaryManager, BinaryRef};
use crate::clock::{Clock, SystemClock};
use crate::config::RepositoryConfig;
use crate::db::{ConnectionFactory, Dialect};
use crate::error::{RepoError, RepoResult};
use crate::invalidation::Invalidations;
use crate::mapper::{ClusterNodeId, Mapper, SqliteMapper};
use crate::model::{Model, SchemaManager, SqlInfo};
use crate::session::{Credentials, Session, SessionId, SessionState};
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Result of one `receive_cluster_invalidations` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Clustering is off for this repository.
    Disabled,
    /// Clustering is on but the backend has not been bootstrapped yet, or the
    /// repository is closed.
    NotInitialized,
    /// The previous poll was less than `clustering_delay_ms` ago.
    Throttled,
    /// Number of documents invalidated by other nodes since the last poll.
    Received(usize),
}

/// Snapshot of bootstrap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitStats {
    pub dialect_probes: usize,
    pub model_builds: usize,
    pub cluster_registrations: usize,
}

/// Shared handle to one named repository. Clones refer to the same state.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

/// State bootstrapped on first connection.
struct Backend {
    dialect: Dialect,
    model: Arc<Model>,
    sql: Arc<SqlInfo>,
}

struct ClusterState {
    mapper: Box<dyn Mapper>,
    node_id: ClusterNodeId,
    last_poll_millis: i64,
}

#[derive(Default)]
struct Counters {
    dialect_probes: AtomicUsize,
    model_builds: AtomicUsize,
    cluster_registrations: AtomicUsize,
    cluster_sync_failures: AtomicUsize,
}

pub(crate) struct RepositoryInner {
    config: RepositoryConfig,
    schema_manager: Arc<dyn SchemaManager>,
    factory: ConnectionFactory,
    binary_manager: Option<BinaryManager>,
    clock: Arc<dyn Clock>,
    backend: OnceCell<Arc<Backend>>,
    init_failure: OnceCell<String>,
    sessions: RwLock<Vec<Arc<SessionState>>>,
    next_session_id: AtomicU64,
    cluster: Mutex<Option<ClusterState>>,
    closed: AtomicBool,
    counters: Counters,
}

impl Repository {
    /// Creates a repository handle. No backend connection is opened until the
    /// first `get_connection`.
    ///
    /// # Errors
    /// - `Configuration` for an unknown backend or a missing `path`.
    /// - `Io` when the binary store directory cannot be created.
    pub fn new(
        config: RepositoryConfig,
        schema_manager: Arc<dyn SchemaManager>,
    ) -> RepoResult<Self> {
        Self::with_clock(config, schema_manager, Arc::new(SystemClock))
    }

    /// Same as `new` with an explicit time source for cluster throttling.
    pub fn with_clock(
        config: RepositoryConfig,
        schema_manager: Arc<dyn SchemaManager>,
        clock: Arc<dyn Clock>,
    ) -> RepoResult<Self> {
        let factory = ConnectionFactory::from_config(&config)?;
        let binary_manager = config
            .binary_store
            .as_ref()
            .map(|root| BinaryManager::new(root.clone()))
            .transpose()?;
        info!(
            "event=repository_create module=repository status=ok name={} backend={} clustering={} delay_ms={}",
            config.name,
            factory.describe(),
            config.clustering_enabled,
            config.clustering_delay_ms
        );
        Ok(Self {
            inner: Arc::new(RepositoryInner {
                config,
                schema_manager,
                factory,
                binary_manager,
                clock,
                backend: OnceCell::new(),
                init_failure: OnceCell::new(),
                sessions: RwLock::new(Vec::new()),
                next_session_id: AtomicU64::new(1),
                cluster: Mutex::new(None),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// Opens a session, bootstrapping the backend on first use.
    ///
    /// # Errors
    /// - `Configuration` when the dialect or schema model is unusable. This
    ///   is recorded and returned by every later call.
    /// - `Connectivity` when the backend cannot be reached; a later call
    ///   retries the bootstrap.
    /// - `RepositoryClosed` after `close`.
    pub fn get_connection(&self, credentials: Option<Credentials>) -> RepoResult<Session> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let backend = Arc::clone(inner.backend()?);

        let conn = inner.factory.connect()?;
        let mapper = SqliteMapper::new(
            conn,
            Arc::clone(&backend.model),
            Arc::clone(&backend.sql),
            Arc::clone(&inner.clock),
        );
        let id = inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(SessionState::new(id, Box::new(mapper)));

        let active = {
            let mut sessions = inner.sessions.write();
            if inner.closed.load(Ordering::SeqCst) {
                drop(sessions);
                state.close();
                return Err(RepoError::RepositoryClosed);
            }
            sessions.push(Arc::clone(&state));
            sessions.len()
        };
        info!(
            "event=session_open module=repository status=ok repository={} session_id={} user={} active_sessions={}",
            inner.config.name,
            id,
            credentials.as_ref().map_or("-", |c| c.user.as_str()),
            active
        );
        Ok(Session::new(
            state,
            Arc::clone(inner),
            Arc::clone(&backend.model),
            credentials,
        ))
    }

    /// Force-closes every live session and leaves the cluster. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = std::mem::take(&mut *inner.sessions.write());
        let closed = sessions.iter().filter(|state| state.close()).count();

        let cluster = inner.cluster.lock().take();
        if let Some(mut state) = cluster {
            inner.leave_cluster(state.mapper.as_mut(), &state.node_id);
        }

        info!(
            "event=repository_close module=repository status=ok repository={} sessions_closed={}",
            inner.config.name, closed
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Fetches invalidations queued by other nodes and applies them to every
    /// live session.
    ///
    /// # Errors
    /// - `ClusterSync` when the fetch fails; the poll timestamp is not
    ///   advanced, so the next call retries.
    pub fn receive_cluster_invalidations(&self) -> RepoResult<PollOutcome> {
        let inner = &self.inner;
        if !inner.config.clustering_enabled {
            return Ok(PollOutcome::Disabled);
        }
        let invalidations = {
            let mut guard = inner.cluster.lock();
            let Some(cluster) = guard.as_mut() else {
                return Ok(PollOutcome::NotInitialized);
            };
            let now = inner.clock.now_millis();
            if cluster.last_poll_millis.saturating_add(inner.delay_millis()) > now {
                return Ok(PollOutcome::Throttled);
            }
            let invalidations = cluster.mapper.get_cluster_invalidations().map_err(|err| {
                inner.counters.cluster_sync_failures.fetch_add(1, Ordering::SeqCst);
                let err = RepoError::cluster_sync(err);
                warn!(
                    "event=cluster_receive module=repository status=error repository={} node_id={} error={}",
                    inner.config.name, cluster.node_id, err
                );
                err
            })?;
            cluster.last_poll_millis = inner.clock.now_millis();
            invalidations
        };

        if !invalidations.is_empty() {
            let delivered = inner.fan_out(&invalidations, None);
            debug!(
                "event=cluster_receive module=repository status=ok repository={} invalidations={} sessions={}",
                inner.config.name,
                invalidations.len(),
                delivered
            );
        }
        Ok(PollOutcome::Received(invalidations.len()))
    }

    /// Makes the next `receive_cluster_invalidations` call poll regardless of
    /// the configured delay.
    pub fn process_cluster_invalidations_next(&self) {
        let inner = &self.inner;
        if let Some(cluster) = inner.cluster.lock().as_mut() {
            cluster.last_poll_millis = inner.clock.now_millis() - inner.delay_millis() - 1;
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Drops every cached document of every live session. Returns how many
    /// entries were dropped.
    pub fn clear_caches(&self) -> usize {
        let sessions = self.inner.sessions.read().clone();
        sessions.iter().map(|state| state.clear_caches()).sum()
    }

    pub fn init_stats(&self) -> InitStats {
        let counters = &self.inner.counters;
        InitStats {
            dialect_probes: counters.dialect_probes.load(Ordering::SeqCst),
            model_builds: counters.model_builds.load(Ordering::SeqCst),
            cluster_registrations: counters.cluster_registrations.load(Ordering::SeqCst),
        }
    }

    /// Number of cluster persist or fetch failures since creation.
    pub fn cluster_sync_failures(&self) -> usize {
        self.inner.counters.cluster_sync_failures.load(Ordering::SeqCst)
    }

    pub fn cluster_node_id(&self) -> Option<ClusterNodeId> {
        self.inner
            .cluster
            .lock()
            .as_ref()
            .map(|cluster| cluster.node_id.clone())
    }

    /// Backend dialect, once bootstrapped.
    pub fn dialect(&self) -> Option<Dialect> {
        self.inner.backend.get().map(|backend| backend.dialect.clone())
    }

    pub fn get_binary(&self, input: &mut dyn Read) -> RepoResult<BinaryRef> {
        self.inner.binary_manager()?.get_binary(input)
    }

    pub fn read_binary(&self, binary: &BinaryRef) -> RepoResult<Vec<u8>> {
        self.inner.binary_manager()?.read(binary)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.inner.config.name)
            .field("backend", &self.inner.factory.describe())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RepositoryInner {
    fn ensure_open(&self) -> RepoResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RepoError::RepositoryClosed)
        } else {
            Ok(())
        }
    }

    fn delay_millis(&self) -> i64 {
        i64::try_from(self.config.clustering_delay_ms).unwrap_or(i64::MAX)
    }

    fn backend(&self) -> RepoResult<&Arc<Backend>> {
        if let Some(backend) = self.backend.get() {
            return Ok(backend);
        }
        self.backend.get_or_try_init(|| {
            self.bootstrap().map_err(|err| {
                if let RepoError::Configuration(message) = &err {
                    let _ = self.init_failure.set(message.clone());
                }
                err
            })
        })
    }

    fn bootstrap(&self) -> RepoResult<Arc<Backend>> {
        if let Some(message) = self.init_failure.get() {
            return Err(RepoError::Configuration(message.clone()));
        }
        let started_at = Instant::now();
        debug!(
            "event=repository_init module=repository status=start repository={}",
            self.config.name
        );

        let probe = self.factory.connect()?;
        self.counters.dialect_probes.fetch_add(1, Ordering::SeqCst);
        let dialect = Dialect::detect(&probe)?;
        drop(probe);

        self.counters.model_builds.fetch_add(1, Ordering::SeqCst);
        let model = Arc::new(Model::build(self.schema_manager.as_ref())?);
        let sql = Arc::new(SqlInfo::new(&model, dialect.clone()));

        let mut mapper = SqliteMapper::new(
            self.factory.connect()?,
            Arc::clone(&model),
            Arc::clone(&sql),
            Arc::clone(&self.clock),
        );
        mapper.create_database()?;

        if self.config.clustering_enabled {
            let node_id = mapper.create_cluster_node()?;
            self.counters
                .cluster_registrations
                .fetch_add(1, Ordering::SeqCst);
            info!(
                "event=cluster_join module=repository status=ok repository={} node_id={}",
                self.config.name, node_id
            );
            let last_poll_millis = self.clock.now_millis() - self.delay_millis() - 1;
            let mut cluster = self.cluster.lock();
            // `close` marks the repository closed before it takes this lock.
            if self.closed.load(Ordering::SeqCst) {
                drop(cluster);
                self.leave_cluster(&mut mapper, &node_id);
                return Err(RepoError::RepositoryClosed);
            }
            *cluster = Some(ClusterState {
                mapper: Box::new(mapper),
                node_id,
                last_poll_millis,
            });
        } else {
            mapper.close();
        }

        info!(
            "event=repository_init module=repository status=ok repository={} dialect={} types={} duration_ms={}",
            self.config.name,
            dialect.name(),
            model.type_names().count(),
            started_at.elapsed().as_millis()
        );
        Ok(Arc::new(Backend {
            dialect,
            model,
            sql,
        }))
    }

    /// Deregisters the node and releases the cluster mapper. Failures are
    /// logged; the node row is then left for an operator to remove.
    fn leave_cluster(&self, mapper: &mut dyn Mapper, node_id: &ClusterNodeId) {
        match mapper.remove_cluster_node() {
            Ok(()) => info!(
                "event=cluster_leave module=repository status=ok repository={} node_id={}",
                self.config.name, node_id
            ),
            Err(err) => error!(
                "event=cluster_leave module=repository status=error repository={} node_id={} error={}",
                self.config.name, node_id, err
            ),
        }
        mapper.close();
    }

    /// Applies committed invalidations to the other live sessions, then
    /// queues them for the other cluster nodes.
    pub(crate) fn invalidate(&self, invalidations: &Invalidations, origin: Option<SessionId>) {
        if invalidations.is_empty() {
            return;
        }
        self.fan_out(invalidations, origin);

        let mut cluster = self.cluster.lock();
        let Some(state) = cluster.as_mut() else {
            return;
        };
        if let Err(err) = state.mapper.insert_cluster_invalidations(invalidations) {
            self.counters
                .cluster_sync_failures
                .fetch_add(1, Ordering::SeqCst);
            let err = RepoError::cluster_sync(err);
            warn!(
                "event=cluster_send module=repository status=error repository={} node_id={} invalidations={} error={}",
                self.config.name,
                state.node_id,
                invalidations.len(),
                err
            );
        }
    }

    /// Returns the number of sessions reached.
    fn fan_out(&self, invalidations: &Invalidations, origin: Option<SessionId>) -> usize {
        let sessions = self.sessions.read().clone();
        let mut delivered = 0;
        for state in sessions
            .iter()
            .filter(|state| Some(state.id()) != origin && state.is_live())
        {
            state.invalidate(invalidations);
            delivered += 1;
        }
        delivered
    }

    pub(crate) fn close_session(&self, id: SessionId) {
        self.sessions.write().retain(|state| state.id() != id);
    }

    pub(crate) fn binary_manager(&self) -> RepoResult<&BinaryManager> {
        self.binary_manager.as_ref().ok_or_else(|| {
            RepoError::Configuration(format!(
                "repository `{}` has no binary store configured",
                self.config.name
            ))
        })
    }
}
