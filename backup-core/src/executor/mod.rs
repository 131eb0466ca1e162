//! Backup lifecycle driver.
//!
//! A full backup runs as a sequence of phase functions over one exclusively
//! borrowed [`BackupInfo`]:
//! - begin: mark the session running and persist it
//! - roll log: hold log retention on first backup, roll logs cluster-wide
//! - snapshot tables, then copy each snapshot into the backup root
//! - store manifests and complete
//!
//! The first error aborts the remaining phases and runs [`fail_backup`].

pub mod cleanup;

use crate::config::BackupConfig;
use crate::fs::BackupFs;
use crate::history::{rs_log_timestamp_mins, BackupHistory};
use crate::manifest::{BackupManifest, BackupType, ManifestSource, TableName};
use crate::procedure::{
    ProcedureDescription, ProcedureRegistry, BACKUP_ROOT_PROP, ROLLLOG_PROCEDURE_NAME,
    ROLLLOG_PROCEDURE_SIGNATURE,
};
use crate::services::{CopyRequest, CopyService, SnapshotService, WalCatalog};
use crate::session::{BackupInfo, BackupPhase, BackupRequest, BackupState};
use crate::utils::errors::{BackupError, Result};
use crate::utils::now_millis;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Collaborators a backup attempt talks to.
#[derive(Clone)]
pub struct BackupServices {
    pub procedures: Arc<ProcedureRegistry>,
    pub snapshots: Arc<dyn SnapshotService>,
    pub copier: Arc<dyn CopyService>,
    pub history: Arc<dyn BackupHistory>,
    pub wals: Arc<dyn WalCatalog>,
    pub fs: Arc<dyn BackupFs>,
}

/// Terminal result of a backup attempt. The session is returned either way.
#[derive(Debug)]
pub enum BackupOutcome {
    Completed(BackupInfo),
    Failed { session: BackupInfo, cause: BackupError },
}

impl BackupOutcome {
    pub fn session(&self) -> &BackupInfo {
        match self {
            BackupOutcome::Completed(session) | BackupOutcome::Failed { session, .. } => session,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, BackupOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<BackupInfo> {
        match self {
            BackupOutcome::Completed(session) => Ok(session),
            BackupOutcome::Failed { cause, .. } => Err(cause),
        }
    }
}

/// Drives one full backup of a set of tables.
pub struct FullTableBackupClient {
    services: BackupServices,
    config: BackupConfig,
    session: BackupInfo,
    cancel_token: CancellationToken,
}

impl FullTableBackupClient {
    /// Validate the request and set up the session. Nothing is touched yet.
    pub fn new(
        services: BackupServices,
        config: BackupConfig,
        backup_id: impl Into<String>,
        request: &BackupRequest,
    ) -> Result<Self> {
        if request.backup_type != BackupType::Full {
            return Err(BackupError::Config(format!(
                "Full table backup cannot run a {} request",
                request.backup_type
            )));
        }
        // surfaces an unregistered roll-log procedure before any work starts
        services.procedures.get(ROLLLOG_PROCEDURE_SIGNATURE)?;

        let session = BackupInfo::new(backup_id, request)?;
        Ok(Self {
            services,
            config,
            session,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Cancelling the token interrupts the roll-log wait.
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn session(&self) -> &BackupInfo {
        &self.session
    }

    pub async fn execute(self) -> BackupOutcome {
        let Self {
            services,
            config,
            mut session,
            cancel_token,
        } = self;

        match run_full_backup(&services, &config, &mut session, &cancel_token).await {
            Ok(()) => BackupOutcome::Completed(session),
            Err(cause) => {
                fail_backup(&services, &config, &mut session, &cause).await;
                BackupOutcome::Failed { session, cause }
            }
        }
    }
}

async fn run_full_backup(
    services: &BackupServices,
    config: &BackupConfig,
    session: &mut BackupInfo,
    cancel: &CancellationToken,
) -> Result<()> {
    begin_backup(services.history.as_ref(), session).await?;

    let root = session.target_root_dir.clone();
    let history = services.history.as_ref();
    let first_backup = matches!(history.read_backup_start_code(&root).await?, None | Some(0));
    if first_backup {
        // hold every existing log until this backup has captured them
        history.write_backup_start_code(0, &root).await?;
    }

    let roll_timestamps = roll_log(services, session, cancel).await?;
    if first_backup {
        let files = services.wals.files_older_than(&roll_timestamps).await?;
        debug!(
            backup_id = %session.backup_id,
            count = files.len(),
            "Registering logs older than the roll as covered"
        );
        history
            .record_wal_files(&files, &session.backup_id, &root)
            .await?;
    }

    snapshot_tables(services.snapshots.as_ref(), session).await?;
    snapshot_copy(services.copier.as_ref(), history, session).await?;

    history
        .add_incremental_backup_table_set(&session.tables, &root)
        .await?;

    // past this point a cancel request no longer stops the backup
    session.state = BackupState::Complete;
    history
        .write_region_server_log_timestamp(&session.tables, &roll_timestamps, &root)
        .await?;
    let timestamp_map = history.read_log_timestamp_map(&root).await?;
    if let Some(start_code) = rs_log_timestamp_mins(&timestamp_map).into_values().min() {
        history.write_backup_start_code(start_code, &root).await?;
    }

    complete_backup(services, config, session).await
}

/// Mark the session running and persist it.
pub async fn begin_backup(history: &dyn BackupHistory, session: &mut BackupInfo) -> Result<()> {
    session.start_ts = now_millis();
    session.state = BackupState::Running;
    info!(
        backup_id = %session.backup_id,
        start_ts = session.start_ts,
        "Backup started"
    );
    history.update_backup_info(session).await
}

/// Roll logs on every region server. Returns each server's roll timestamp.
pub async fn roll_log(
    services: &BackupServices,
    session: &BackupInfo,
    cancel: &CancellationToken,
) -> Result<HashMap<String, i64>> {
    info!(backup_id = %session.backup_id, "Execute roll log procedure for full backup");

    let mut props = BTreeMap::new();
    props.insert(
        BACKUP_ROOT_PROP.to_string(),
        session.target_root_dir.display().to_string(),
    );
    let desc = ProcedureDescription::new(ROLLLOG_PROCEDURE_SIGNATURE, ROLLLOG_PROCEDURE_NAME, props);
    services.procedures.execute_and_wait(&desc, cancel).await?;

    services
        .history
        .read_region_server_last_log_roll_result(&session.target_root_dir)
        .await
}

/// `snapshot_<millis>_<namespace>_<qualifier>`
pub fn snapshot_name_for(table: &TableName, millis: i64) -> String {
    format!("snapshot_{}_{}_{}", millis, table.namespace(), table.qualifier())
}

/// Snapshot every table and record the snapshot names on the session.
pub async fn snapshot_tables(snapshots: &dyn SnapshotService, session: &mut BackupInfo) -> Result<()> {
    for table in session.tables.clone() {
        let name = snapshot_name_for(&table, now_millis());
        debug!(backup_id = %session.backup_id, table = %table, snapshot = %name, "Taking snapshot");
        snapshots.take_snapshot(&name, &table).await?;
        session.set_snapshot_name(&table, name);
    }
    Ok(())
}

/// Copy each table's snapshot into its target directory, in table order.
/// The first non-zero exit code aborts the copy of the remaining tables.
pub async fn snapshot_copy(
    copier: &dyn CopyService,
    history: &dyn BackupHistory,
    session: &mut BackupInfo,
) -> Result<()> {
    info!(backup_id = %session.backup_id, "Snapshot copy is starting");
    session.phase = BackupPhase::SnapshotCopy;
    history.update_backup_info(session).await?;
    debug!(
        "There are {} snapshots to be copied.",
        session.snapshot_names().len()
    );

    for table in session.tables.clone() {
        let snapshot_name = session.snapshot_name(&table).map(str::to_string).ok_or_else(|| {
            BackupError::Snapshot(format!("No snapshot recorded for table {table}"))
        })?;
        let target_dir = session
            .backup_status(&table)
            .map(|s| s.target_dir.clone())
            .ok_or_else(|| BackupError::Config(format!("No target directory for table {table}")))?;
        let request = CopyRequest {
            snapshot_name,
            target_dir,
            workers: session.workers,
            bandwidth: session.bandwidth,
        };

        debug!(
            "Copy snapshot {} to {}",
            request.snapshot_name,
            request.target_dir.display()
        );
        let code = copier.copy(session, BackupType::Full, &request).await?;
        if code != 0 {
            error!(
                "Exporting Snapshot {} failed with return code: {}.",
                request.snapshot_name, code
            );
            return Err(BackupError::CopyFailed {
                snapshot: request.snapshot_name,
                target: request.target_dir,
                code,
            });
        }
        info!("Snapshot copy {} finished.", request.snapshot_name);
    }
    Ok(())
}

/// Write the table manifests and, for incremental backups, the overall one.
pub async fn add_manifest(services: &BackupServices, session: &mut BackupInfo) -> Result<()> {
    session.phase = BackupPhase::StoreManifest;
    let fs = services.fs.as_ref();
    let history = services.history.as_ref();
    history.update_backup_info(session).await?;

    for table in &session.tables {
        let mut manifest = BackupManifest::open(fs, ManifestSource::FromTable(session, table))?;
        for image in history.get_table_ancestors(session, table).await? {
            manifest.add_dependent_image(image);
        }
        if session.backup_type == BackupType::Incremental {
            let mut table_map = HashMap::new();
            if let Some(servers) = session.incr_timestamp_map.get(table) {
                table_map.insert(table.clone(), servers.clone());
            }
            manifest.set_incr_timestamp_map(table_map);
        }
        manifest.store(fs)?;
    }

    if session.backup_type == BackupType::Incremental {
        let mut manifest = BackupManifest::open(fs, ManifestSource::Building(session))?;
        manifest.set_incr_timestamp_map(session.incr_timestamp_map.clone());
        for image in history.get_ancestors(session).await? {
            manifest.add_dependent_image(image);
        }
        manifest.store(fs)?;
    }
    Ok(())
}

/// Mark the session complete, store manifests, persist and clean up.
pub async fn complete_backup(
    services: &BackupServices,
    config: &BackupConfig,
    session: &mut BackupInfo,
) -> Result<()> {
    session.end_ts = now_millis();
    session.state = BackupState::Complete;
    session.progress = 100;
    add_manifest(services, session).await?;

    debug!(
        backup_id = %session.backup_id,
        "Backup finished: {}",
        session.metadata_summary()
    );
    services.history.update_backup_info(session).await?;

    match session.backup_type {
        BackupType::Full => {
            cleanup::delete_snapshots(services.snapshots.as_ref(), session).await;
            cleanup::cleanup_export_snapshot_log(services.fs.as_ref(), &config.staging_root);
        }
        BackupType::Incremental => {
            cleanup::cleanup_distcp_log(services.fs.as_ref(), session);
        }
    }

    info!(backup_id = %session.backup_id, "Backup completed");
    Ok(())
}

/// Record the failure durably, then undo what the attempt left behind.
pub async fn fail_backup(
    services: &BackupServices,
    config: &BackupConfig,
    session: &mut BackupInfo,
    cause: &BackupError,
) {
    error!(backup_id = %session.backup_id, "Unexpected BackupException : {}", cause);

    session.end_ts = now_millis();
    session.failed_msg = Some(cause.failure_message());
    session.state = BackupState::Failed;
    error!("{}", session.failure_record());

    if let Err(e) = services.history.update_backup_info(session).await {
        error!(
            backup_id = %session.backup_id,
            "Failed to persist failed backup session: {}",
            e
        );
    }

    if session.backup_type == BackupType::Full {
        cleanup::delete_snapshots(services.snapshots.as_ref(), session).await;
        cleanup::cleanup_export_snapshot_log(services.fs.as_ref(), &config.staging_root);
    }
    cleanup::cleanup_target_dir(services.fs.as_ref(), session);

    info!(backup_id = %session.backup_id, "Backup failed");
}
