// Single-flight coordination — at most one in-progress download per asset path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightState {
    InProgress,
    Done(Result<(), FetchError>),
}

type FlightTable = Arc<Mutex<HashMap<String, watch::Receiver<FlightState>>>>;

/// Tracks which asset paths are currently being downloaded.
///
/// Paths absent from the table are either cached (final file on disk) or
/// absent; the table only ever holds in-progress entries.
pub struct FlightCoordinator {
    in_flight: FlightTable,
    follower_ceiling: Duration,
}

/// Outcome of [`FlightCoordinator::acquire`].
pub enum Flight {
    /// The caller owns the download and must report its outcome.
    Leader(FlightGuard),
    /// Someone else is downloading; wait for them instead.
    Follower(FlightWaiter),
}

impl FlightCoordinator {
    pub fn new(follower_ceiling: Duration) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            follower_ceiling,
        }
    }

    /// Claim the download of `path`, or join the one already running.
    pub fn acquire(&self, path: &str) -> Flight {
        let mut table = self.in_flight.lock();
        if let Some(rx) = table.get(path) {
            debug!("flight {} already in progress, following", path);
            return Flight::Follower(FlightWaiter {
                path: path.to_string(),
                rx: rx.clone(),
                ceiling: self.follower_ceiling,
            });
        }

        let (tx, rx) = watch::channel(FlightState::InProgress);
        table.insert(path.to_string(), rx);
        debug!("flight {} acquired", path);
        Flight::Leader(FlightGuard {
            path: path.to_string(),
            tx: Some(tx),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_in_flight(&self, path: &str) -> bool {
        self.in_flight.lock().contains_key(path)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Ownership of one in-progress download.
///
/// Dropping the guard without calling [`FlightGuard::complete`] releases the
/// path as failed, so a panicking or aborted download never wedges it.
pub struct FlightGuard {
    path: String,
    tx: Option<watch::Sender<FlightState>>,
    in_flight: FlightTable,
}

impl FlightGuard {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Release the path and wake every follower with `result`.
    pub fn complete(mut self, result: Result<(), FetchError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<(), FetchError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        // Remove first: a woken follower must never observe a stale in-progress entry.
        self.in_flight.lock().remove(&self.path);
        debug!("flight {} released ok={}", self.path, result.is_ok());
        tx.send_replace(FlightState::Done(result));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("flight {} dropped without completing", self.path);
            self.finish(Err(FetchError::Transport(
                "download abandoned before completion".to_string(),
            )));
        }
    }
}

/// Handle held by a request that found the path already in progress.
pub struct FlightWaiter {
    path: String,
    rx: watch::Receiver<FlightState>,
    ceiling: Duration,
}

impl FlightWaiter {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the leader to finish, up to the follower ceiling.
    ///
    /// Timing out only affects this waiter; the leader keeps downloading.
    pub async fn wait(mut self) -> Result<(), FetchError> {
        let waited = tokio::time::timeout(
            self.ceiling,
            self.rx.wait_for(|state| matches!(state, FlightState::Done(_))),
        )
        .await;

        match waited {
            Err(_) => {
                warn!(
                    "flight {} follower gave up after {:?}",
                    self.path, self.ceiling
                );
                Err(FetchError::DownloadTimeout(self.ceiling))
            }
            Ok(Ok(state)) => match &*state {
                FlightState::Done(result) => result.clone(),
                FlightState::InProgress => Err(FetchError::Transport(
                    "download state lost".to_string(),
                )),
            },
            Ok(Err(_)) => Err(FetchError::Transport(
                "download abandoned before completion".to_string(),
            )),
        }
    }
}
