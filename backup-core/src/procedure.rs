//! Distributed procedures and the bounded poller that waits for them.

use crate::config::ProcedureConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Log roll procedure run on every region server before a backup.
pub const ROLLLOG_PROCEDURE_SIGNATURE: &str = "rolllog-proc";
pub const ROLLLOG_PROCEDURE_NAME: &str = "rolllog";
pub const BACKUP_ROOT_PROP: &str = "backupRoot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureDescription {
    pub signature: String,
    pub instance: String,
    pub props: BTreeMap<String, String>,
}

impl ProcedureDescription {
    pub fn new(signature: &str, instance: &str, props: BTreeMap<String, String>) -> Self {
        Self {
            signature: signature.to_string(),
            instance: instance.to_string(),
            props,
        }
    }
}

/// A cluster-wide procedure implementation.
#[async_trait]
pub trait ProcedureManager: Send + Sync {
    async fn exec_procedure(&self, desc: &ProcedureDescription) -> Result<()>;

    async fn is_procedure_done(&self, desc: &ProcedureDescription) -> Result<bool>;
}

/// Procedure managers by signature.
pub struct ProcedureRegistry {
    managers: HashMap<String, Arc<dyn ProcedureManager>>,
    config: ProcedureConfig,
}

impl ProcedureRegistry {
    pub fn new(config: ProcedureConfig) -> Self {
        Self {
            managers: HashMap::new(),
            config,
        }
    }

    pub fn register(&mut self, signature: &str, manager: Arc<dyn ProcedureManager>) {
        self.managers.insert(signature.to_string(), manager);
    }

    pub fn get(&self, signature: &str) -> Result<Arc<dyn ProcedureManager>> {
        self.managers.get(signature).cloned().ok_or_else(|| {
            BackupError::Config(format!("The procedure is not registered: {signature}"))
        })
    }

    /// Start a procedure. Returns how long the caller should wait for it.
    pub async fn exec_procedure(&self, desc: &ProcedureDescription) -> Result<Duration> {
        let manager = self.get(&desc.signature)?;
        info!(
            signature = %desc.signature,
            instance = %desc.instance,
            "Executing procedure"
        );
        manager.exec_procedure(desc).await?;
        Ok(self.config.max_wait())
    }

    /// Start a procedure and poll it to completion.
    pub async fn execute_and_wait(
        &self,
        desc: &ProcedureDescription,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let manager = self.get(&desc.signature)?;
        let max_wait = self.exec_procedure(desc).await?;
        let policy = RetryPolicy {
            max_wait,
            ..RetryPolicy::from_config(&self.config)
        };
        wait_for_procedure(manager.as_ref(), desc, &policy, cancel).await
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_wait: Duration,
    pub num_retries: u32,
    pub base_pause: Duration,
    pub backoff: Vec<u64>,
}

impl RetryPolicy {
    pub fn from_config(config: &ProcedureConfig) -> Self {
        Self {
            max_wait: config.max_wait(),
            num_retries: config.num_retries,
            base_pause: config.base_pause(),
            backoff: config.backoff.clone(),
        }
    }

    /// Upper bound for a single pause.
    pub fn max_pause(&self) -> Duration {
        self.max_wait / self.num_retries.max(1)
    }
}

/// Pause before retry number `attempt`. Attempts past the end of `schedule`
/// reuse its last multiplier.
pub fn backoff_delay(attempt: usize, base: Duration, schedule: &[u64]) -> Duration {
    let multiplier = match schedule.last() {
        Some(last) => schedule.get(attempt).copied().unwrap_or(*last),
        None => 1,
    };
    base.saturating_mul(u32::try_from(multiplier).unwrap_or(u32::MAX))
}

/// Poll `manager` until `desc` is done.
///
/// Status is checked before each pause, so an already finished procedure
/// returns without sleeping. Fails with `ProcedureTimeout` once `max_wait`
/// has elapsed and with `Cancelled` if `cancel` fires during a pause.
pub async fn wait_for_procedure(
    manager: &dyn ProcedureManager,
    desc: &ProcedureDescription,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = Instant::now();
    let max_pause = policy.max_pause();
    let mut attempt = 0usize;

    loop {
        if manager.is_procedure_done(desc).await? {
            debug!(
                signature = %desc.signature,
                instance = %desc.instance,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Procedure done"
            );
            return Ok(());
        }

        if start.elapsed() >= policy.max_wait {
            return Err(BackupError::ProcedureTimeout {
                signature: desc.signature.clone(),
                instance: desc.instance.clone(),
                max_wait_ms: policy.max_wait.as_millis() as u64,
            });
        }

        let pause = backoff_delay(attempt, policy.base_pause, &policy.backoff).min(max_pause);
        debug!(
            signature = %desc.signature,
            attempt,
            pause_ms = pause.as_millis() as u64,
            "Waiting for procedure"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!(
                    "waiting for procedure '{} : {}'",
                    desc.signature, desc.instance
                )));
            }
            _ = tokio::time::sleep(pause) => {}
        }
        attempt += 1;
    }
}
