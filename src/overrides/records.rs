//! Namespace and override records.
//!
//! The limiter only reads these records. They are administered elsewhere and
//! arrive either through [`OverrideRecords`] mutations or a YAML record file
//! that is re-read periodically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HivelimitError, Result, StoreError};

/// A tenant-scoped grouping of identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Namespace {
    pub fn new(workspace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_id("ns"),
            workspace_id: workspace_id.into(),
            name: name.into(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An administratively configured limit for one identifier (or pattern).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub id: String,
    pub namespace_id: String,
    pub workspace_id: String,
    /// Exact identifier, or a pattern where `*` matches any run of characters
    pub identifier: String,
    pub limit: u64,
    /// Window duration in milliseconds
    pub duration: u64,
    pub created_at: DateTime<Utc>,
}

impl Override {
    pub fn new(
        namespace: &Namespace,
        identifier: impl Into<String>,
        limit: u64,
        duration: u64,
    ) -> Self {
        Self {
            id: new_id("rlor"),
            namespace_id: namespace.id.clone(),
            workspace_id: namespace.workspace_id.clone(),
            identifier: identifier.into(),
            limit,
            duration,
            created_at: Utc::now(),
        }
    }

    pub fn is_pattern(&self) -> bool {
        self.identifier.contains('*')
    }

    /// Number of non-wildcard characters; more literal patterns are more specific.
    fn specificity(&self) -> usize {
        self.identifier.chars().filter(|c| *c != '*').count()
    }

    pub fn matches(&self, identifier: &str) -> bool {
        if self.is_pattern() {
            wildcard_match(&self.identifier, identifier)
        } else {
            self.identifier == identifier
        }
    }
}

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Glob match where `*` matches any (possibly empty) run of characters.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return value.is_empty(),
    };
    if !value.starts_with(first) {
        return false;
    }
    let mut remaining = &value[first.len()..];

    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

/// Read contract the limiter needs from the override record store.
#[async_trait]
pub trait OverrideSource: Send + Sync {
    /// Find a live (not soft-deleted) namespace by name within a workspace.
    async fn find_namespace(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> std::result::Result<Option<Namespace>, StoreError>;

    /// Find the override that applies to `identifier` in a namespace.
    async fn find_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> std::result::Result<Option<Override>, StoreError>;
}

#[derive(Debug, Default)]
struct RecordSet {
    namespaces: HashMap<String, Namespace>,
    /// namespace id -> overrides in that namespace
    overrides: HashMap<String, Vec<Override>>,
}

/// In-process override record store.
#[derive(Debug, Default)]
pub struct OverrideRecords {
    records: RwLock<RecordSet>,
}

/// YAML record file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideFile {
    #[serde(default)]
    pub namespaces: Vec<NamespaceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub overrides: Vec<OverrideEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideEntry {
    pub identifier: String,
    pub limit: u64,
    /// Window duration in milliseconds
    pub duration: u64,
}

impl OverrideRecords {
    /// Create an empty record store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load records from a YAML file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading override records");

        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&contents)
    }

    /// Load records from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: OverrideFile = serde_yaml::from_str(yaml).map_err(|e| {
            HivelimitError::Config(format!("Failed to parse override records: {}", e))
        })?;

        let records = Self::new();
        for entry in file.namespaces {
            let mut namespace = Namespace::new(entry.workspace_id, entry.name);
            if let Some(id) = entry.id {
                namespace.id = id;
            }
            records.insert_namespace(namespace.clone())?;

            for o in entry.overrides {
                if o.limit == 0 || o.duration == 0 {
                    return Err(HivelimitError::Config(format!(
                        "override for '{}' in namespace '{}' needs a positive limit and duration",
                        o.identifier, namespace.name
                    )));
                }
                let record = Override::new(&namespace, o.identifier, o.limit, o.duration);
                records.upsert_override(record);
            }
        }

        Ok(records)
    }

    /// Add a namespace. Names are unique among live namespaces of a workspace.
    pub fn insert_namespace(&self, namespace: Namespace) -> Result<()> {
        let mut records = self.records.write();
        let duplicate = records.namespaces.values().any(|existing| {
            !existing.is_deleted()
                && existing.workspace_id == namespace.workspace_id
                && existing.name == namespace.name
        });
        if duplicate {
            return Err(HivelimitError::Config(format!(
                "namespace '{}' already exists in workspace '{}'",
                namespace.name, namespace.workspace_id
            )));
        }

        records.namespaces.insert(namespace.id.clone(), namespace);
        Ok(())
    }

    /// Soft-delete a namespace. Returns false if it does not exist.
    pub fn soft_delete_namespace(&self, namespace_id: &str) -> bool {
        let mut records = self.records.write();
        match records.namespaces.get_mut(namespace_id) {
            Some(namespace) => {
                namespace.deleted_at.get_or_insert_with(Utc::now);
                true
            }
            None => false,
        }
    }

    /// Insert an override, replacing any existing one for the same identifier.
    pub fn upsert_override(&self, record: Override) {
        let mut records = self.records.write();
        let overrides = records
            .overrides
            .entry(record.namespace_id.clone())
            .or_default();
        overrides.retain(|existing| existing.identifier != record.identifier);
        overrides.push(record);
    }

    /// Swap in a freshly loaded record set.
    pub fn replace_with(&self, other: OverrideRecords) {
        *self.records.write() = other.records.into_inner();
    }

    pub fn namespace_count(&self) -> usize {
        self.records.read().namespaces.len()
    }

    fn lookup_namespace(&self, workspace_id: &str, name: &str) -> Option<Namespace> {
        let records = self.records.read();
        records
            .namespaces
            .values()
            .find(|ns| !ns.is_deleted() && ns.workspace_id == workspace_id && ns.name == name)
            .cloned()
    }

    /// Exact identifier first, then the most specific matching pattern.
    fn lookup_override(&self, namespace_id: &str, identifier: &str) -> Option<Override> {
        let records = self.records.read();
        let overrides = records.overrides.get(namespace_id)?;

        if let Some(exact) = overrides
            .iter()
            .find(|o| !o.is_pattern() && o.identifier == identifier)
        {
            return Some(exact.clone());
        }

        overrides
            .iter()
            .filter(|o| o.is_pattern() && o.matches(identifier))
            .max_by(|a, b| {
                a.specificity()
                    .cmp(&b.specificity())
                    .then_with(|| b.identifier.cmp(&a.identifier))
            })
            .cloned()
    }
}

#[async_trait]
impl OverrideSource for OverrideRecords {
    async fn find_namespace(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> std::result::Result<Option<Namespace>, StoreError> {
        Ok(self.lookup_namespace(workspace_id, name))
    }

    async fn find_override(
        &self,
        namespace_id: &str,
        identifier: &str,
    ) -> std::result::Result<Option<Override>, StoreError> {
        Ok(self.lookup_override(namespace_id, identifier))
    }
}

/// Spawn a task that re-reads the record file on an interval.
///
/// A file that fails to load leaves the current records in place.
pub fn spawn_reloader(
    records: Arc<OverrideRecords>,
    path: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately and the file was loaded at startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Override reloader shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match OverrideRecords::load(&path).await {
                        Ok(fresh) => {
                            records.replace_with(fresh);
                            debug!(
                                path = %path,
                                namespaces = records.namespace_count(),
                                "Reloaded override records"
                            );
                        }
                        Err(e) => warn!(
                            path = %path,
                            error = %e,
                            "Failed to reload override records, keeping previous"
                        ),
                    }
                }
            }
        }
    })
}
