//! Bounded worker pool over a shared device list.
//!
//! Each worker loops: claim the next unclaimed device, connect, run every
//! copy job then every command, publish one [`ExecLog`], repeat. A worker
//! retires once the list is exhausted; the result stream closes when the
//! last one does.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::error::{FleetError, Result};
use crate::ssh::{ConnInfo, Connector, RemoteClient, SshConnector};
use crate::task::{CopyInfo, ExecLog};

/// Capacity of the result stream unless overridden; publishing blocks
/// until the consumer keeps up.
const DEFAULT_STREAM_CAPACITY: usize = 1;

/// What every worker applies to each device, plus the claim cursor.
struct Plan {
    connector: Arc<dyn Connector>,
    conn_infos: Vec<Arc<ConnInfo>>,
    copy_infos: Vec<CopyInfo>,
    cmds: Vec<String>,
    cursor: Mutex<usize>,
}

impl Plan {
    /// Hand out the next unclaimed device, each exactly once.
    fn try_claim_next(&self) -> Option<(usize, Arc<ConnInfo>)> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *cursor;
        let info = self.conn_infos.get(index)?.clone();
        *cursor += 1;
        Some((index, info))
    }

    /// Run everything against one device and return its log text.
    async fn process(&self, info: &ConnInfo) -> String {
        let mut log = String::new();

        let client = match self.connector.connect(info).await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", info.addr, e);
                push_error(&mut log, &e);
                return log;
            }
        };

        self.apply(client.as_ref(), &info.addr, &mut log).await;

        if let Err(e) = client.close().await {
            tracing::debug!("Close for {} failed: {}", info.addr, e);
        }

        log
    }

    async fn apply(&self, client: &dyn RemoteClient, device: &str, log: &mut String) {
        for copy in &self.copy_infos {
            if let Err(e) = client.copy(&copy.source, &copy.destination).await {
                tracing::debug!("Copy to {}:{} failed: {}", device, copy.destination, e);
                push_error(log, &e);
                return;
            }
        }

        for cmd in &self.cmds {
            match client.exec(cmd).await {
                Ok(output) => log.push_str(&output),
                Err(e) => {
                    tracing::debug!("Exec `{}` on {} failed: {}", cmd, device, e);
                    push_error(log, &e);
                    return;
                }
            }
        }
    }
}

fn push_error(log: &mut String, err: &FleetError) {
    log.push_str(&err.to_string());
    log.push('\n');
}

/// Runs one fixed plan over a list of devices with a bounded number of workers.
///
/// A manager is single-use: `start` may only be called once, and the result
/// stream is handed out once via [`TaskManager::log_stream`].
pub struct TaskManager {
    plan: Arc<Plan>,
    log_tx: Mutex<Option<mpsc::Sender<ExecLog>>>,
    log_rx: Mutex<Option<mpsc::Receiver<ExecLog>>>,
}

impl TaskManager {
    /// Create a manager that connects over SSH.
    pub fn new(conn_infos: Vec<Arc<ConnInfo>>, copy_infos: Vec<CopyInfo>, cmds: Vec<String>) -> Self {
        Self::with_connector(SshConnector, conn_infos, copy_infos, cmds)
    }

    /// Create a manager with a custom way of reaching devices.
    pub fn with_connector(
        connector: impl Connector + 'static,
        conn_infos: Vec<Arc<ConnInfo>>,
        copy_infos: Vec<CopyInfo>,
        cmds: Vec<String>,
    ) -> Self {
        let (log_tx, log_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);

        Self {
            plan: Arc::new(Plan {
                connector: Arc::new(connector),
                conn_infos,
                copy_infos,
                cmds,
                cursor: Mutex::new(0),
            }),
            log_tx: Mutex::new(Some(log_tx)),
            log_rx: Mutex::new(Some(log_rx)),
        }
    }

    /// Resize the result stream buffer (minimum 1).
    ///
    /// Only a fresh manager is resized: once the stream has been handed out
    /// or the pool started, the existing stream is kept.
    pub fn with_capacity(self, capacity: usize) -> Self {
        let fresh = self
            .log_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
            && self
                .log_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some();

        if !fresh {
            tracing::warn!("Result stream already in use; keeping its capacity");
            return self;
        }

        let (log_tx, log_rx) = mpsc::channel(capacity.max(1));

        Self {
            plan: self.plan,
            log_tx: Mutex::new(Some(log_tx)),
            log_rx: Mutex::new(Some(log_rx)),
        }
    }

    /// Take the result stream. Returns `None` if it was already taken.
    ///
    /// The stream yields one record per device and ends once every worker
    /// has retired.
    pub fn log_stream(&self) -> Option<mpsc::Receiver<ExecLog>> {
        self.log_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Run `worker_count` workers until every device has been processed.
    ///
    /// Resolves after the last worker retires, at which point the result
    /// stream is closed. The stream must be drained concurrently, otherwise
    /// workers block on publishing.
    pub async fn start(&self, worker_count: usize) -> Result<()> {
        let sender = self
            .log_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(FleetError::AlreadyStarted)?;

        tracing::info!(
            "Starting {} worker(s) for {} device(s)",
            worker_count,
            self.plan.conn_infos.len()
        );

        let workers: Vec<_> = (0..worker_count)
            .map(|id| tokio::spawn(run_worker(id, self.plan.clone(), sender.clone())))
            .collect();

        // Workers now hold the only senders
        drop(sender);

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        tracing::info!("All workers finished");
        Ok(())
    }

    #[cfg(test)]
    fn claimed(&self) -> usize {
        *self.plan.cursor.lock().unwrap()
    }
}

async fn run_worker(id: usize, plan: Arc<Plan>, logs: mpsc::Sender<ExecLog>) {
    while let Some((index, info)) = plan.try_claim_next() {
        tracing::debug!("Worker {} claimed device #{} ({})", id, index, info.addr);

        let log = plan.process(&info).await;
        let record = ExecLog {
            device: info.addr.clone(),
            log,
        };

        if logs.send(record).await.is_err() {
            tracing::warn!("Result stream dropped; worker {} stopping", id);
            break;
        }
    }

    tracing::debug!("Worker {} retired", id);
}
