//! Backup images: the nodes of the backup dependency graph.
//!
//! An image records one backup (full or incremental) together with the
//! earlier images it needs for a point-in-time restore.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Per table, per region server (`host:port`), the last log timestamp captured.
pub type IncrTimestampMap = HashMap<TableName, HashMap<String, i64>>;

/// A namespaced table identifier. Renders as `ns:qualifier`, or just
/// `qualifier` in the default namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    namespace: String,
    qualifier: String,
}

impl TableName {
    pub fn new(namespace: &str, qualifier: &str) -> Result<Self> {
        for part in [namespace, qualifier] {
            if part.is_empty() || part.contains(['/', ':']) {
                return Err(BackupError::InvalidTableName(format!("{namespace}:{qualifier}")));
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            qualifier: qualifier.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }
}

impl FromStr for TableName {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((ns, qualifier)) => Self::new(ns, qualifier),
            None => Self::new(DEFAULT_NAMESPACE, s),
        }
    }
}

impl TryFrom<String> for TableName {
    type Error = BackupError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TableName> for String {
    fn from(table: TableName) -> Self {
        table.to_string()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == DEFAULT_NAMESPACE {
            write!(f, "{}", self.qualifier)
        } else {
            write!(f, "{}:{}", self.namespace, self.qualifier)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Full,
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "FULL"),
            BackupType::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

/// Normalise a region server address to `host:port`.
///
/// Accepts `host:port` and the `host,port,startcode` server-name form.
pub fn normalize_server_address(address: &str) -> Result<String> {
    let invalid = || BackupError::InvalidServerAddress(address.to_string());
    let (host, port) = match address.split(',').collect::<Vec<_>>().as_slice() {
        [host, port, _startcode] => (*host, *port),
        [single] => single.rsplit_once(':').ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() {
        return Err(invalid());
    }
    Ok(format!("{host}:{port}"))
}

#[derive(Debug, Clone)]
pub struct BackupImage {
    backup_id: String,
    backup_type: BackupType,
    root_dir: String,
    tables: Vec<TableName>,
    start_ts: i64,
    complete_ts: i64,
    ancestors: Vec<BackupImage>,
    incr_time_ranges: IncrTimestampMap,
}

impl BackupImage {
    pub fn new(
        backup_id: impl Into<String>,
        backup_type: BackupType,
        root_dir: impl Into<String>,
        tables: Vec<TableName>,
        start_ts: i64,
        complete_ts: i64,
    ) -> Self {
        Self {
            backup_id: backup_id.into(),
            backup_type,
            root_dir: root_dir.into(),
            tables,
            start_ts,
            complete_ts,
            ancestors: Vec::new(),
            incr_time_ranges: HashMap::new(),
        }
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn backup_type(&self) -> BackupType {
        self.backup_type
    }

    pub fn root_dir(&self) -> &str {
        &self.root_dir
    }

    pub fn tables(&self) -> &[TableName] {
        &self.tables
    }

    pub fn start_ts(&self) -> i64 {
        self.start_ts
    }

    pub fn complete_ts(&self) -> i64 {
        self.complete_ts
    }

    pub fn ancestors(&self) -> &[BackupImage] {
        &self.ancestors
    }

    pub fn incr_time_ranges(&self) -> &IncrTimestampMap {
        &self.incr_time_ranges
    }

    pub fn add_ancestor(&mut self, image: BackupImage) {
        self.ancestors.push(image);
    }

    pub fn set_incr_time_ranges(&mut self, ranges: IncrTimestampMap) {
        self.incr_time_ranges = ranges;
    }

    pub fn has_ancestor(&self, backup_id: &str) -> bool {
        self.ancestors.iter().any(|a| a.backup_id == backup_id)
    }

    pub fn has_table(&self, table: &TableName) -> bool {
        self.tables.contains(table)
    }

    /// Ordering key of the backup id (`name_timestamp`).
    fn id_key(&self) -> (&str, IdStamp<'_>) {
        let (name, ts) = self
            .backup_id
            .rsplit_once('_')
            .unwrap_or((self.backup_id.as_str(), ""));
        let stamp = match ts.parse::<u64>() {
            Ok(n) => IdStamp::Numeric(n),
            Err(_) => IdStamp::Text(ts),
        };
        (name, stamp)
    }

    pub(crate) fn to_record(&self) -> Result<ImageRecord> {
        let mut tst_map = Vec::new();
        for (table, servers) in &self.incr_time_ranges {
            for (server, timestamp) in servers {
                tst_map.push(TableServerTimestamp {
                    table: table.clone(),
                    server: normalize_server_address(server)?,
                    timestamp: *timestamp,
                });
            }
        }
        tst_map.sort_by(|a, b| (&a.table, &a.server).cmp(&(&b.table, &b.server)));

        Ok(ImageRecord {
            backup_id: self.backup_id.clone(),
            backup_type: self.backup_type,
            root_dir: self.root_dir.clone(),
            table_list: self.tables.clone(),
            start_ts: self.start_ts,
            complete_ts: self.complete_ts,
            ancestors: self
                .ancestors
                .iter()
                .map(BackupImage::to_record)
                .collect::<Result<_>>()?,
            tst_map,
        })
    }

    pub(crate) fn from_record(record: ImageRecord) -> Result<Self> {
        let mut image = BackupImage::new(
            record.backup_id,
            record.backup_type,
            record.root_dir,
            record.table_list,
            record.start_ts,
            record.complete_ts,
        );
        for ancestor in record.ancestors {
            image.add_ancestor(BackupImage::from_record(ancestor)?);
        }

        let mut ranges: IncrTimestampMap = HashMap::new();
        for entry in record.tst_map {
            ranges
                .entry(entry.table)
                .or_default()
                .insert(normalize_server_address(&entry.server)?, entry.timestamp);
        }
        image.set_incr_time_ranges(ranges);
        Ok(image)
    }
}

/// Timestamp part of a backup id. Numeric stamps sort before any text stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum IdStamp<'a> {
    Numeric(u64),
    Text(&'a str),
}

impl Ord for BackupImage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id_key().cmp(&other.id_key())
    }
}

impl PartialOrd for BackupImage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for BackupImage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BackupImage {}

impl Hash for BackupImage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id_key().hash(state);
    }
}

/// Serialized form of an image, ancestors included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ImageRecord {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub root_dir: String,
    pub table_list: Vec<TableName>,
    pub start_ts: i64,
    pub complete_ts: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestors: Vec<ImageRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tst_map: Vec<TableServerTimestamp>,
}

/// One (table, server, timestamp) triple of the incremental timestamp map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableServerTimestamp {
    pub table: TableName,
    pub server: String,
    pub timestamp: i64,
}
