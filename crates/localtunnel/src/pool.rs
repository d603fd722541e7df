use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::connection::{self, ConnectionExit, PoolStats, SessionTarget};
use crate::tunnel::Shared;

/// Everything a pool needs to keep one session's connections alive
pub(crate) struct Pool {
    pub session: Weak<Shared>,
    pub session_id: u64,
    pub target: Arc<SessionTarget>,
    pub size: usize,
    pub closing: CancellationToken,
    pub stats: Arc<PoolStats>,
}

impl Pool {
    /// Start the supervisor task for this session
    pub fn spawn(self) {
        tokio::spawn(self.supervise());
    }

    fn start(&self, workers: &mut Slots<ConnectionExit>, slot: usize) {
        let target = self.target.clone();
        let closing = self.closing.clone();
        let stats = self.stats.clone();
        workers.spawn(slot, async move {
            connection::run(slot, &target, &closing, &stats).await
        });
    }

    /// Keep `size` slots occupied until the session closes.
    ///
    /// A slot whose connection failed while relaying is redialed; a failed
    /// dial closes the session.
    async fn supervise(self) {
        let mut workers = Slots::new();
        for slot in 0..self.size {
            self.start(&mut workers, slot);
        }

        tracing::debug!(
            "Connection pool started for session {} with {} slots",
            self.session_id,
            self.size
        );

        while let Some((slot, joined)) = workers.join_next().await {
            let exit = match joined {
                Ok(exit) => exit,
                Err(e) => {
                    if self.closing.is_cancelled() {
                        continue;
                    }
                    tracing::error!("Connection {} task failed ({}), redialing", slot, e);
                    self.stats.record_replacement();
                    self.start(&mut workers, slot);
                    continue;
                }
            };

            match exit {
                ConnectionExit::Replace(err) => {
                    if self.closing.is_cancelled() {
                        continue;
                    }
                    tracing::debug!("Connection {} lost ({}), redialing", slot, err);
                    self.stats.record_replacement();
                    self.start(&mut workers, slot);
                }
                ConnectionExit::Closed => {
                    tracing::trace!("Connection {} closed", slot);
                }
                ConnectionExit::Fatal(err) => {
                    tracing::error!("Connection {} failed: {}", slot, err);
                    match self.session.upgrade() {
                        Some(shared) => {
                            shared.close_session(self.session_id);
                        }
                        None => self.closing.cancel(),
                    }
                }
            }
        }

        tracing::debug!("Connection pool stopped for session {}", self.session_id);
    }
}

/// Worker tasks keyed by the slot each one occupies
struct Slots<T> {
    tasks: JoinSet<T>,
    slots: HashMap<task::Id, usize>,
}

impl<T: Send + 'static> Slots<T> {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            slots: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, slot: usize, worker: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let handle = self.tasks.spawn(worker);
        self.slots.insert(handle.id(), slot);
    }

    /// Next finished worker and its slot, including workers that panicked
    async fn join_next(&mut self) -> Option<(usize, Result<T, JoinError>)> {
        loop {
            let (id, joined) = match self.tasks.join_next_with_id().await? {
                Ok((id, output)) => (id, Ok(output)),
                Err(e) => (e.id(), Err(e)),
            };
            if let Some(slot) = self.slots.remove(&id) {
                return Some((slot, joined));
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}
