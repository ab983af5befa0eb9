//! Background driver for cluster invalidation polling.

use super::{PollOutcome, Repository};
use crate::error::RepoResult;
use log::{debug, info, warn};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Calls `Repository::receive_cluster_invalidations` every `interval` on a
/// dedicated thread until stopped, dropped, or the repository closes.
pub struct ClusterPoller {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ClusterPoller {
    pub fn start(repository: Repository, interval: Duration) -> RepoResult<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let name = format!("cluster-poller-{}", repository.name());
        let handle = thread::Builder::new().name(name).spawn(move || {
            info!(
                "event=poller_start module=repository status=ok repository={} interval_ms={}",
                repository.name(),
                interval.as_millis()
            );
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if repository.is_closed() {
                    break;
                }
                match repository.receive_cluster_invalidations() {
                    Ok(PollOutcome::Received(count)) if count > 0 => debug!(
                        "event=poller_tick module=repository status=ok repository={} invalidations={}",
                        repository.name(),
                        count
                    ),
                    Ok(PollOutcome::Disabled) => break,
                    Ok(_) => {}
                    Err(err) => warn!(
                        "event=poller_tick module=repository status=error repository={} error={}",
                        repository.name(),
                        err
                    ),
                }
            }
            info!(
                "event=poller_stop module=repository status=ok repository={}",
                repository.name()
            );
        })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("event=poller_stop module=repository status=error error_code=thread_panicked");
            }
        }
    }
}

impl Drop for ClusterPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
