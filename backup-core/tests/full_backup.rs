use async_trait::async_trait;
use backup_core::fs::{BackupFs, LocalFs};
use backup_core::config::ProcedureConfig;
use backup_core::history::{BackupHistory, InMemoryHistory};
use backup_core::manifest::{BackupManifest, MANIFEST_FILE_NAME};
use backup_core::procedure::{
    ProcedureDescription, ProcedureManager, ProcedureRegistry, ROLLLOG_PROCEDURE_SIGNATURE,
};
use backup_core::services::{CopyRequest, CopyService, SnapshotService, WalCatalog};
use backup_core::{
    BackupConfig, BackupError, BackupInfo, BackupOutcome, BackupPhase, BackupRequest,
    BackupServices, BackupState, BackupType, FullTableBackupClient, TableName,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Log roll that reports a fixed roll timestamp per region server.
struct FakeLogRoll {
    history: Arc<InMemoryHistory>,
    done: bool,
}

#[async_trait]
impl ProcedureManager for FakeLogRoll {
    async fn exec_procedure(&self, desc: &ProcedureDescription) -> backup_core::Result<()> {
        let root = PathBuf::from(&desc.props["backupRoot"]);
        self.history
            .write_region_server_last_log_roll_result("rs1:16020", 1000, &root)
            .await?;
        self.history
            .write_region_server_last_log_roll_result("rs2:16020", 2000, &root)
            .await
    }

    async fn is_procedure_done(&self, _desc: &ProcedureDescription) -> backup_core::Result<bool> {
        Ok(self.done)
    }
}

/// Refuses to snapshot the table named `fail_take`; refuses every delete
/// when `fail_delete` is set.
#[derive(Default)]
struct FakeSnapshots {
    live: Mutex<Vec<String>>,
    taken: Mutex<Vec<String>>,
    fail_take: Option<String>,
    fail_delete: bool,
}

#[async_trait]
impl SnapshotService for FakeSnapshots {
    async fn take_snapshot(&self, name: &str, table: &TableName) -> backup_core::Result<()> {
        if self.fail_take.as_deref() == Some(table.qualifier()) {
            return Err(BackupError::Snapshot(format!("table {table} is offline")));
        }
        self.live.lock().unwrap().push(name.to_string());
        self.taken.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn delete_snapshot(&self, name: &str) -> backup_core::Result<()> {
        if self.fail_delete {
            return Err(BackupError::Snapshot(format!("cannot delete {name}")));
        }
        self.live.lock().unwrap().retain(|n| n != name);
        Ok(())
    }
}

/// Writes a data file per table and leaves export staging output behind.
/// Returns exit code 3 for snapshots of `fail_on`.
struct FakeCopier {
    staging_root: PathBuf,
    fail_on: Option<String>,
    copied: Mutex<Vec<String>>,
    args: Mutex<Vec<Vec<String>>>,
    /// Phase of the stored session at each copy
    stored_phases: Mutex<Vec<BackupPhase>>,
    history: Arc<InMemoryHistory>,
}

#[async_trait]
impl CopyService for FakeCopier {
    async fn copy(
        &self,
        session: &mut BackupInfo,
        backup_type: BackupType,
        request: &CopyRequest,
    ) -> backup_core::Result<i32> {
        assert_eq!(backup_type, BackupType::Full);
        self.args.lock().unwrap().push(request.to_args());
        if let Some(stored) = self.history.backup_info(&session.backup_id).await? {
            self.stored_phases.lock().unwrap().push(stored.phase);
        }
        std::fs::create_dir_all(self.staging_root.join(format!("exportSnapshot-{}", request.snapshot_name)))?;
        std::fs::create_dir_all(&request.target_dir)?;

        if let Some(fail) = &self.fail_on {
            if request.snapshot_name.ends_with(&format!("_{fail}")) {
                std::fs::write(request.target_dir.join("partial"), b"half")?;
                return Ok(3);
            }
        }

        std::fs::write(request.target_dir.join("data"), b"table data")?;
        self.copied.lock().unwrap().push(request.snapshot_name.clone());
        let table: TableName = request
            .target_dir
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .unwrap()
            .parse()?;
        session.add_bytes_copied(&table, 10);
        Ok(0)
    }
}

/// Local filesystem whose deletes fail below `fail_under`.
struct FlakyFs {
    inner: LocalFs,
    fail_under: PathBuf,
}

impl BackupFs for FlakyFs {
    fn exists(&self, path: &Path) -> backup_core::Result<bool> {
        self.inner.exists(path)
    }

    fn list(&self, dir: &Path) -> backup_core::Result<Option<Vec<PathBuf>>> {
        self.inner.list(dir)
    }

    fn delete_recursive(&self, path: &Path) -> backup_core::Result<bool> {
        if path.starts_with(&self.fail_under) {
            return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into());
        }
        self.inner.delete_recursive(path)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> backup_core::Result<()> {
        self.inner.write_atomic(path, data)
    }

    fn read(&self, path: &Path) -> backup_core::Result<Vec<u8>> {
        self.inner.read(path)
    }
}

struct FakeWals;

#[async_trait]
impl WalCatalog for FakeWals {
    async fn files_older_than(&self, roll: &HashMap<String, i64>) -> backup_core::Result<Vec<String>> {
        let mut files: Vec<String> = roll.keys().map(|rs| format!("{rs}/wal.0")).collect();
        files.sort();
        Ok(files)
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    config: BackupConfig,
    history: Arc<InMemoryHistory>,
    snapshots: Arc<FakeSnapshots>,
    copier: Arc<FakeCopier>,
    services: BackupServices,
}

fn harness(fail_on: Option<&str>, roll_done: bool, register_roll: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("backup-root");
    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&staging).unwrap();

    let mut config = BackupConfig::default();
    config.staging_root = staging.clone();

    let fs: Arc<dyn BackupFs> = Arc::new(LocalFs::new());
    let history = Arc::new(InMemoryHistory::new(fs.clone()));
    let snapshots = Arc::new(FakeSnapshots::default());
    let copier = Arc::new(FakeCopier {
        staging_root: staging,
        fail_on: fail_on.map(str::to_string),
        copied: Mutex::new(Vec::new()),
        args: Mutex::new(Vec::new()),
        stored_phases: Mutex::new(Vec::new()),
        history: history.clone(),
    });

    let mut procedures = ProcedureRegistry::new(config.procedure.clone());
    if register_roll {
        procedures.register(
            ROLLLOG_PROCEDURE_SIGNATURE,
            Arc::new(FakeLogRoll {
                history: history.clone(),
                done: roll_done,
            }),
        );
    }

    let services = BackupServices {
        procedures: Arc::new(procedures),
        snapshots: snapshots.clone(),
        copier: copier.clone(),
        history: history.clone(),
        wals: Arc::new(FakeWals),
        fs,
    };

    Harness {
        _dir: dir,
        root,
        config,
        history,
        snapshots,
        copier,
        services,
    }
}

fn full_request(h: &Harness, tables: &[&str]) -> BackupRequest {
    BackupRequest::new(
        BackupType::Full,
        tables.iter().map(|t| t.parse().unwrap()).collect(),
        h.root.clone(),
    )
}

async fn run(h: &Harness, backup_id: &str, tables: &[&str]) -> BackupOutcome {
    run_with(h, h.services.clone(), backup_id, tables).await
}

async fn run_with(h: &Harness, services: BackupServices, backup_id: &str, tables: &[&str]) -> BackupOutcome {
    FullTableBackupClient::new(services, h.config.clone(), backup_id, &full_request(h, tables))
        .unwrap()
        .execute()
        .await
}

#[tokio::test]
async fn test_full_backup_completes() {
    let h = harness(None, true, true);
    let outcome = run(&h, "backup_100", &["T1"]).await;
    assert!(outcome.is_completed());
    let session = outcome.into_result().unwrap();

    assert_eq!(session.state, BackupState::Complete);
    assert_eq!(session.phase, BackupPhase::StoreManifest);
    assert_eq!(session.progress, 100);
    assert!(session.failed_msg.is_none());
    assert!(session.end_ts >= session.start_ts);
    assert_eq!(session.total_bytes_copied, 10);

    let table_dir = h.root.join("default/T1/backup_100");
    assert!(table_dir.join(MANIFEST_FILE_NAME).exists());
    assert!(table_dir.join("data").exists());

    let manifest = BackupManifest::load(&LocalFs::new(), &table_dir).unwrap();
    assert_eq!(manifest.root_dir(), h.root.as_path());
    assert_eq!(manifest.backup_type(), BackupType::Full);
    assert!(manifest.backup_image().ancestors().is_empty());

    // the snapshot taken for T1 is gone again
    let taken = h.snapshots.taken.lock().unwrap().clone();
    assert_eq!(taken.len(), 1);
    assert!(taken[0].starts_with("snapshot_") && taken[0].ends_with("_default_T1"));
    assert!(h.snapshots.live.lock().unwrap().is_empty());

    // export staging output removed
    assert_eq!(std::fs::read_dir(&h.config.staging_root).unwrap().count(), 0);

    let stored = h.history.backup_info("backup_100").await.unwrap().unwrap();
    assert_eq!(stored.state, BackupState::Complete);
    assert_eq!(stored.progress, 100);

    // the copy phase was persisted before copying started
    assert_eq!(*h.copier.stored_phases.lock().unwrap(), vec![BackupPhase::SnapshotCopy]);
}

#[tokio::test]
async fn test_copy_request_carries_workers_and_bandwidth() {
    let h = harness(None, true, true);
    let mut request = full_request(&h, &["T1"]);
    request.workers = Some(4);
    request.bandwidth = Some(50);
    FullTableBackupClient::new(h.services.clone(), h.config.clone(), "backup_100", &request)
        .unwrap()
        .execute()
        .await
        .into_result()
        .unwrap();

    let args = h.copier.args.lock().unwrap().clone();
    assert_eq!(args.len(), 1);
    assert_eq!(&args[0][4..], &["-mappers", "4", "-bandwidth", "50"]);
}

#[tokio::test]
async fn test_first_backup_records_logs_and_start_code() {
    let h = harness(None, true, true);
    run(&h, "backup_100", &["T1", "ns1:T2"]).await.into_result().unwrap();

    let wals = h.history.wal_files(&h.root).await;
    assert_eq!(wals.len(), 2);
    assert_eq!(wals["rs1:16020/wal.0"], "backup_100");

    // minimum over servers of the per-server minimum
    assert_eq!(h.history.read_backup_start_code(&h.root).await.unwrap(), Some(1000));

    let map = h.history.read_log_timestamp_map(&h.root).await.unwrap();
    let t2: TableName = "ns1:T2".parse().unwrap();
    assert_eq!(map[&t2]["rs2:16020"], 2000);
    assert!(h
        .history
        .incremental_backup_table_set(&h.root)
        .await
        .unwrap()
        .contains(&t2));

    // a later backup is not the first one
    run(&h, "backup_200", &["T1"]).await.into_result().unwrap();
    let wals = h.history.wal_files(&h.root).await;
    assert!(wals.values().all(|id| id == "backup_100"));
    assert!(h.root.join("default/T1/backup_200").join(MANIFEST_FILE_NAME).exists());
}

#[tokio::test]
async fn test_copy_failure_on_second_table_rolls_back() {
    let h = harness(Some("T2"), true, true);
    let outcome = run(&h, "backup_100", &["T1", "T2"]).await;

    let BackupOutcome::Failed { session, cause } = outcome else {
        panic!("backup should have failed");
    };
    assert!(matches!(cause, BackupError::CopyFailed { code: 3, .. }));

    assert_eq!(session.state, BackupState::Failed);
    assert_eq!(session.phase, BackupPhase::SnapshotCopy);
    let msg = session.failed_msg.clone().unwrap();
    assert!(msg.starts_with("Failed of exporting snapshot snapshot_"));
    assert!(msg.ends_with("with reason code 3"));
    assert!(session.failure_record().contains("failedphase=SNAPSHOTCOPY"));
    assert!(session.failure_record().contains(&msg));

    // T1 was copied, then rolled back together with T2's partial data
    assert_eq!(h.copier.copied.lock().unwrap().len(), 1);
    assert!(!h.root.join("default/T1").exists());
    assert!(!h.root.join("default/T2").exists());
    assert!(!h.root.join("default/T1/backup_100").join(MANIFEST_FILE_NAME).exists());

    assert!(h.snapshots.live.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(&h.config.staging_root).unwrap().count(), 0);

    let stored = h.history.backup_info("backup_100").await.unwrap().unwrap();
    assert_eq!(stored.state, BackupState::Failed);
    assert_eq!(stored.failed_msg.as_deref(), Some(msg.as_str()));
}

#[tokio::test]
async fn test_rollback_keeps_earlier_backups_of_the_table() {
    let h = harness(None, true, true);
    run(&h, "backup_100", &["T1"]).await.into_result().unwrap();

    let failing = harness(Some("T1"), true, true);
    let services = BackupServices {
        copier: failing.copier.clone(),
        ..h.services.clone()
    };
    let outcome = FullTableBackupClient::new(services, h.config.clone(), "backup_200", &full_request(&h, &["T1"]))
        .unwrap()
        .execute()
        .await;
    assert!(!outcome.is_completed());

    assert!(!h.root.join("default/T1/backup_200").exists());
    assert!(h.root.join("default/T1/backup_100").join(MANIFEST_FILE_NAME).exists());
}

#[tokio::test]
async fn test_cancelled_roll_log_wait_fails_before_copy() {
    let h = harness(None, false, true);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = FullTableBackupClient::new(
        h.services.clone(),
        h.config.clone(),
        "backup_100",
        &full_request(&h, &["T1"]),
    )
    .unwrap()
    .with_cancel(cancel)
    .execute()
    .await;

    let session = outcome.session().clone();
    assert!(matches!(outcome.into_result(), Err(BackupError::Cancelled(_))));
    assert_eq!(session.state, BackupState::Failed);
    assert_eq!(session.phase, BackupPhase::Request);
    assert!(h.snapshots.taken.lock().unwrap().is_empty());
    assert!(!h.root.exists());
}

#[tokio::test]
async fn test_unregistered_roll_log_is_rejected_up_front() {
    let h = harness(None, true, false);
    let err = FullTableBackupClient::new(
        h.services.clone(),
        h.config.clone(),
        "backup_100",
        &full_request(&h, &["T1"]),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BackupError::Config(msg) if msg.contains("rolllog-proc")));
    assert!(h.history.backup_info("backup_100").await.unwrap().is_none());
}

#[tokio::test]
async fn test_incremental_request_is_rejected() {
    let h = harness(None, true, true);
    let mut request = full_request(&h, &["T1"]);
    request.backup_type = BackupType::Incremental;
    let result = FullTableBackupClient::new(h.services.clone(), h.config.clone(), "backup_100", &request);
    assert!(matches!(result, Err(BackupError::Config(_))));
}

#[tokio::test]
async fn test_cleanup_failures_keep_the_copy_error() {
    let h = harness(Some("T3"), true, true);
    let snapshots = Arc::new(FakeSnapshots {
        fail_delete: true,
        ..Default::default()
    });
    let fs: Arc<dyn BackupFs> = Arc::new(FlakyFs {
        inner: LocalFs::new(),
        fail_under: h.root.join("default/T1"),
    });
    let services = BackupServices {
        snapshots: snapshots.clone(),
        fs,
        ..h.services.clone()
    };

    let outcome = run_with(&h, services, "backup_100", &["T1", "T2", "T3"]).await;
    let BackupOutcome::Failed { session, cause } = outcome else {
        panic!("backup should have failed");
    };
    assert!(matches!(cause, BackupError::CopyFailed { code: 3, .. }));
    assert!(session
        .failed_msg
        .as_deref()
        .unwrap()
        .starts_with("Failed of exporting snapshot"));

    // T1 could not be removed; the tables after it still were
    assert!(h.root.join("default/T1/backup_100/data").exists());
    assert!(!h.root.join("default/T2").exists());
    assert!(!h.root.join("default/T3").exists());

    // snapshot deletes failed, staging cleanup still ran
    assert_eq!(snapshots.live.lock().unwrap().len(), 3);
    assert_eq!(std::fs::read_dir(&h.config.staging_root).unwrap().count(), 0);

    let stored = h.history.backup_info("backup_100").await.unwrap().unwrap();
    assert_eq!(stored.state, BackupState::Failed);
    assert_eq!(stored.phase, BackupPhase::SnapshotCopy);
}

#[tokio::test]
async fn test_snapshot_failure_deletes_earlier_snapshots_only() {
    let h = harness(None, true, true);
    let earlier = h.root.join("default/T1/backup_50");
    std::fs::create_dir_all(&earlier).unwrap();
    std::fs::write(earlier.join("data"), b"old").unwrap();

    let snapshots = Arc::new(FakeSnapshots {
        fail_take: Some("T2".to_string()),
        ..Default::default()
    });
    let services = BackupServices {
        snapshots: snapshots.clone(),
        ..h.services.clone()
    };

    let outcome = run_with(&h, services, "backup_100", &["T1", "T2"]).await;
    let BackupOutcome::Failed { session, cause } = outcome else {
        panic!("backup should have failed");
    };
    assert!(matches!(cause, BackupError::Snapshot(_)));
    assert_eq!(session.state, BackupState::Failed);
    assert_eq!(session.phase, BackupPhase::Request);

    // the T1 snapshot was taken and deleted again
    assert_eq!(snapshots.taken.lock().unwrap().len(), 1);
    assert!(snapshots.live.lock().unwrap().is_empty());

    // nothing was copied and existing data is untouched
    assert!(h.copier.copied.lock().unwrap().is_empty());
    assert!(earlier.join("data").exists());
    assert!(!h.root.join("default/T1/backup_100").exists());
    assert!(!h.root.join("default/T2").exists());
}

#[tokio::test(start_paused = true)]
async fn test_roll_log_timeout_fails_the_backup() {
    let h = harness(None, false, true);
    let mut procedures = ProcedureRegistry::new(ProcedureConfig {
        max_wait_ms: 50,
        pause_ms: 10,
        ..ProcedureConfig::default()
    });
    procedures.register(
        ROLLLOG_PROCEDURE_SIGNATURE,
        Arc::new(FakeLogRoll {
            history: h.history.clone(),
            done: false,
        }),
    );
    let services = BackupServices {
        procedures: Arc::new(procedures),
        ..h.services.clone()
    };

    let outcome = run_with(&h, services, "backup_100", &["T1"]).await;
    let BackupOutcome::Failed { session, cause } = outcome else {
        panic!("backup should have failed");
    };
    assert!(matches!(cause, BackupError::ProcedureTimeout { max_wait_ms: 50, .. }));
    assert_eq!(session.state, BackupState::Failed);
    assert_eq!(session.phase, BackupPhase::Request);
    assert!(h.snapshots.taken.lock().unwrap().is_empty());

    let stored = h.history.backup_info("backup_100").await.unwrap().unwrap();
    assert!(stored
        .failed_msg
        .as_deref()
        .unwrap()
        .contains("wasn't completed in expectedTime:50 ms"));
}
