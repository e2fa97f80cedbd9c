//! SQLite implementation of the ResourceStorage trait
//!
//! Every identity is one row of `resources`; deletions with a resource
//! version turn the row into a tombstone instead of removing it. Changes are
//! appended to `resource_changes` inside the same transaction, so a watch can
//! resume after a restart as long as its revision is still retained.
//!
//! The connection is synchronous; every call runs on the blocking pool.
//! Change events are broadcast after commit while the connection lock is
//! still held, which keeps live delivery in revision order.
//!
//! Version order: configurable, `NumericAware` unless the storage
//! configuration says otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use super::backend::{
    validate_record, DeleteOutcome, HealthStatus, ListOptions, ListPage, ResourceStorage,
    StorageEvent, StorageEventType, StorageFactory, StorageStats, UpsertOutcome, WatchStream,
};
use super::connection::Storage;
use super::pagination::paginate;
use super::version::VersionOrder;
use super::watch::{broadcast_capacity, check_window, parse_since, watch_stream};
use crate::config::StorageConfig;
use crate::error::{Result, SynchroError};
use crate::types::{GroupVersionKind, GroupVersionResource, ResourceIdentity, ResourceRecord};

const COLUMNS: &str = "cluster, grp, version, kind, namespace, name, resource, uid, \
    resource_version, labels, annotations, created_at, last_seen, payload, deleted, deleted_at";

/// A `resources` row
struct StoredRow {
    record: ResourceRecord,
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    let namespace: String = row.get(4)?;
    let record = ResourceRecord {
        cluster: row.get(0)?,
        gvk: GroupVersionKind::new(
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ),
        resource: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        namespace: (!namespace.is_empty()).then_some(namespace),
        name: row.get(5)?,
        uid: row.get(7)?,
        resource_version: row.get(8)?,
        labels: json_column(row, 9)?,
        annotations: json_column(row, 10)?,
        created_at: time_column(row, 11)?,
        last_seen: time_column(row, 12)?.unwrap_or_else(Utc::now),
        payload: json_column(row, 13)?,
        deleted: row.get(14)?,
    };
    Ok(StoredRow { record })
}

fn select_one(conn: &Connection, identity: &ResourceIdentity) -> Result<Option<StoredRow>> {
    let sql = format!(
        "SELECT {} FROM resources
         WHERE cluster = ?1 AND grp = ?2 AND version = ?3 AND kind = ?4
           AND namespace = ?5 AND name = ?6",
        COLUMNS
    );
    let row = conn
        .query_row(
            &sql,
            params![
                identity.cluster,
                identity.gvk.group,
                identity.gvk.version,
                identity.gvk.kind,
                identity.namespace_key(),
                identity.name,
            ],
            read_row,
        )
        .optional()?;
    Ok(row)
}

fn select_live(
    conn: &Connection,
    cluster: &str,
    gvr: &GroupVersionResource,
    namespace: Option<&str>,
) -> Result<Vec<ResourceRecord>> {
    let sql = format!(
        "SELECT {} FROM resources
         WHERE cluster = ?1 AND grp = ?2 AND version = ?3 AND resource = ?4
           AND deleted = 0 AND (?5 IS NULL OR namespace = ?5)",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![cluster, gvr.group, gvr.version, gvr.resource, namespace],
        read_row,
    )?;
    let records = rows
        .map(|row| row.map(|r| r.record))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

fn select_live_in_cluster(conn: &Connection, cluster: &str) -> Result<Vec<ResourceRecord>> {
    let sql = format!(
        "SELECT {} FROM resources WHERE cluster = ?1 AND deleted = 0",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![cluster], read_row)?;
    let records = rows
        .map(|row| row.map(|r| r.record))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

fn write_row(
    conn: &Connection,
    record: &ResourceRecord,
    deleted_at: Option<&DateTime<Utc>>,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO resources ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            COLUMNS
        ),
        params![
            record.cluster,
            record.gvk.group,
            record.gvk.version,
            record.gvk.kind,
            record.namespace_key(),
            record.name,
            (!record.resource.is_empty()).then_some(&record.resource),
            record.uid,
            record.resource_version,
            serde_json::to_string(&record.labels)?,
            serde_json::to_string(&record.annotations)?,
            record.created_at.as_ref().map(format_time),
            format_time(&record.last_seen),
            serde_json::to_string(&record.payload)?,
            record.deleted,
            deleted_at.map(format_time),
        ],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, identity: &ResourceIdentity) -> Result<()> {
    conn.execute(
        "DELETE FROM resources
         WHERE cluster = ?1 AND grp = ?2 AND version = ?3 AND kind = ?4
           AND namespace = ?5 AND name = ?6",
        params![
            identity.cluster,
            identity.gvk.group,
            identity.gvk.version,
            identity.gvk.kind,
            identity.namespace_key(),
            identity.name,
        ],
    )?;
    Ok(())
}

fn event_type_name(event_type: StorageEventType) -> &'static str {
    match event_type {
        StorageEventType::Added => "ADDED",
        StorageEventType::Modified => "MODIFIED",
        StorageEventType::Deleted => "DELETED",
        StorageEventType::Bookmark => "BOOKMARK",
    }
}

fn parse_event_type(raw: &str) -> Result<StorageEventType> {
    match raw {
        "ADDED" => Ok(StorageEventType::Added),
        "MODIFIED" => Ok(StorageEventType::Modified),
        "DELETED" => Ok(StorageEventType::Deleted),
        "BOOKMARK" => Ok(StorageEventType::Bookmark),
        other => Err(SynchroError::Internal(format!(
            "unknown change event type '{}'",
            other
        ))),
    }
}

fn append_change(
    conn: &Connection,
    event_type: StorageEventType,
    cluster: &str,
    gvr: &GroupVersionResource,
    record: Option<ResourceRecord>,
) -> Result<StorageEvent> {
    let encoded = record.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO resource_changes (cluster, grp, version, resource, event_type, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            cluster,
            gvr.group,
            gvr.version,
            gvr.resource,
            event_type_name(event_type),
            encoded,
        ],
    )?;
    Ok(StorageEvent {
        event_type,
        revision: conn.last_insert_rowid() as u64,
        cluster: cluster.to_string(),
        gvr: gvr.clone(),
        record,
    })
}

fn latest_revision(conn: &Connection) -> Result<u64> {
    let latest: i64 = conn.query_row(
        "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'resource_changes'), 0)",
        [],
        |row| row.get(0),
    )?;
    Ok(latest as u64)
}

fn first_retained(conn: &Connection, latest: u64) -> Result<u64> {
    let first: Option<i64> =
        conn.query_row("SELECT MIN(revision) FROM resource_changes", [], |row| {
            row.get(0)
        })?;
    Ok(first.map(|r| r as u64).unwrap_or(latest + 1))
}

fn trim_changes(conn: &Connection, window: usize) -> Result<()> {
    let latest = latest_revision(conn)?;
    let window = window as u64;
    if latest > window {
        conn.execute(
            "DELETE FROM resource_changes WHERE revision <= ?1",
            params![(latest - window) as i64],
        )?;
    }
    Ok(())
}

fn replay(
    conn: &Connection,
    cluster: &str,
    gvr: &GroupVersionResource,
    since: u64,
) -> Result<Vec<StorageEvent>> {
    let mut stmt = conn.prepare(
        "SELECT revision, event_type, record FROM resource_changes
         WHERE revision > ?1 AND cluster = ?2 AND grp = ?3 AND version = ?4 AND resource = ?5
         ORDER BY revision",
    )?;
    let rows = stmt.query_map(
        params![since as i64, cluster, gvr.group, gvr.version, gvr.resource],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        },
    )?;

    let mut events = Vec::new();
    for row in rows {
        let (revision, event_type, record) = row?;
        events.push(StorageEvent {
            event_type: parse_event_type(&event_type)?,
            revision: revision as u64,
            cluster: cluster.to_string(),
            gvr: gvr.clone(),
            record: record.map(|r| serde_json::from_str(&r)).transpose()?,
        });
    }
    Ok(events)
}

/// Shared state behind the async facade
struct SqliteInner {
    storage: Storage,
    order: VersionOrder,
    window: usize,
    tx: broadcast::Sender<StorageEvent>,
}

impl SqliteInner {
    /// Run a write transaction and publish its change events after commit
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &mut Vec<StorageEvent>) -> Result<T>,
    {
        let mut conn = self.storage.connection();
        let tx = conn.transaction()?;
        let mut events = Vec::new();
        let result = f(&tx, &mut events)?;
        if !events.is_empty() {
            trim_changes(&tx, self.window)?;
        }
        tx.commit()?;
        for event in events {
            let _ = self.tx.send(event);
        }
        Ok(result)
    }

    fn upsert(&self, record: ResourceRecord) -> Result<UpsertOutcome> {
        let identity = record.identity();
        self.write(|conn, events| {
            let outcome = match select_one(conn, &identity)? {
                Some(stored)
                    if !self
                        .order
                        .is_newer(&record.resource_version, &stored.record.resource_version) =>
                {
                    return Ok(UpsertOutcome::Unchanged);
                }
                Some(stored) if !stored.record.deleted => UpsertOutcome::Updated,
                _ => UpsertOutcome::Created,
            };

            write_row(conn, &record, None)?;
            let event_type = match outcome {
                UpsertOutcome::Updated => StorageEventType::Modified,
                _ => StorageEventType::Added,
            };
            let gvr = record.gvr();
            let cluster = record.cluster.clone();
            events.push(append_change(conn, event_type, &cluster, &gvr, Some(record))?);
            Ok(outcome)
        })
    }

    fn delete(
        &self,
        identity: &ResourceIdentity,
        resource_version: Option<String>,
    ) -> Result<DeleteOutcome> {
        self.write(|conn, events| {
            let stored = select_one(conn, identity)?;
            if let (Some(stored), Some(rv)) = (&stored, resource_version.as_deref()) {
                if !self.order.is_at_least(rv, &stored.record.resource_version) {
                    return Ok(DeleteOutcome::Absent);
                }
            }

            let now = Utc::now();
            match (stored, resource_version) {
                (Some(stored), rv) if !stored.record.deleted => {
                    let mut record = stored.record;
                    record.deleted = true;
                    match rv {
                        Some(rv) => {
                            record.resource_version = rv;
                            write_row(conn, &record, Some(&now))?;
                        }
                        None => delete_row(conn, identity)?,
                    }
                    let gvr = record.gvr();
                    events.push(append_change(
                        conn,
                        StorageEventType::Deleted,
                        &identity.cluster,
                        &gvr,
                        Some(record),
                    )?);
                    Ok(DeleteOutcome::Deleted)
                }
                (Some(mut tombstone), Some(rv)) => {
                    tombstone.record.resource_version = rv;
                    write_row(conn, &tombstone.record, Some(&now))?;
                    Ok(DeleteOutcome::Absent)
                }
                (None, Some(rv)) => {
                    let tombstone = ResourceRecord {
                        cluster: identity.cluster.clone(),
                        gvk: identity.gvk.clone(),
                        resource: String::new(),
                        namespace: identity.namespace.clone(),
                        name: identity.name.clone(),
                        uid: None,
                        resource_version: rv,
                        labels: Default::default(),
                        annotations: Default::default(),
                        created_at: None,
                        last_seen: now,
                        payload: serde_json::Value::Null,
                        deleted: true,
                    };
                    write_row(conn, &tombstone, Some(&now))?;
                    Ok(DeleteOutcome::Absent)
                }
                _ => Ok(DeleteOutcome::Absent),
            }
        })
    }

    fn purge<F>(&self, select: F, delete_sql: &str, scope: Vec<String>) -> Result<usize>
    where
        F: FnOnce(&Connection) -> Result<Vec<ResourceRecord>>,
    {
        self.write(|conn, events| {
            let live = select(conn)?;
            conn.execute(delete_sql, rusqlite::params_from_iter(scope.iter()))?;
            let removed = live.len();
            for mut record in live {
                record.deleted = true;
                let gvr = record.gvr();
                let cluster = record.cluster.clone();
                events.push(append_change(
                    conn,
                    StorageEventType::Deleted,
                    &cluster,
                    &gvr,
                    Some(record),
                )?);
            }
            Ok(removed)
        })
    }

    fn start_watch(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        since: Option<u64>,
    ) -> Result<WatchStream> {
        // Subscribing under the connection lock means no commit can slip
        // between the replay read and the live feed
        let conn = self.storage.connection();
        let rx = self.tx.subscribe();
        let latest = latest_revision(&conn)?;
        let replayed = match since {
            Some(since) => {
                check_window(since, first_retained(&conn, latest)?, latest)?;
                replay(&conn, cluster, gvr, since)?
            }
            None => Vec::new(),
        };
        drop(conn);
        Ok(watch_stream(replayed, rx, cluster, gvr, latest))
    }

    fn stats(&self) -> Result<StorageStats> {
        self.storage.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT cluster,
                        SUM(CASE WHEN deleted = 0 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN deleted = 1 THEN 1 ELSE 0 END)
                 FROM resources GROUP BY cluster",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut stats = StorageStats {
                backend: "sqlite".to_string(),
                ..Default::default()
            };
            let mut cluster_counts = HashMap::new();
            for row in rows {
                let (cluster, live, tombstones) = row?;
                stats.record_count += live as u64;
                stats.tombstone_count += tombstones as u64;
                if live > 0 {
                    cluster_counts.insert(cluster, live as u64);
                }
            }
            stats.cluster_counts = cluster_counts;
            stats.revision = latest_revision(conn)?;
            Ok(stats)
        })
    }
}

/// SQLite-based storage backend
pub struct SqliteBackend {
    inner: Arc<SqliteInner>,
}

impl SqliteBackend {
    /// Wrap an opened database
    pub fn new(storage: Storage, order: VersionOrder, watch_window: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity(watch_window));
        Self {
            inner: Arc::new(SqliteInner {
                storage,
                order,
                window: watch_window.max(1),
                tx,
            }),
        }
    }

    /// Open the database named by the storage configuration
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let storage = Storage::open(&config.expanded_db_path())?;
        Ok(Self::new(storage, config.version_order, config.watch_window))
    }

    /// Create an in-memory SQLite backend (useful for testing)
    pub fn in_memory() -> Result<Self> {
        let config = StorageConfig::memory();
        Ok(Self::new(
            Storage::open_in_memory()?,
            config.version_order,
            config.watch_window,
        ))
    }

    /// Get a reference to the underlying Storage
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| SynchroError::Internal(format!("storage task failed: {}", e)))?
    }
}

#[async_trait]
impl ResourceStorage for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn version_order(&self) -> VersionOrder {
        self.inner.order
    }

    async fn upsert(&self, mut record: ResourceRecord) -> Result<UpsertOutcome> {
        validate_record(&record)?;
        record.deleted = false;
        self.blocking(move |inner| inner.upsert(record)).await
    }

    async fn delete(
        &self,
        identity: &ResourceIdentity,
        resource_version: Option<&str>,
    ) -> Result<DeleteOutcome> {
        let identity = identity.clone();
        let resource_version = resource_version.map(str::to_string);
        self.blocking(move |inner| inner.delete(&identity, resource_version))
            .await
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<ResourceRecord>> {
        let identity = identity.clone();
        self.blocking(move |inner| {
            inner.storage.with_connection(|conn| {
                Ok(select_one(conn, &identity)?
                    .map(|row| row.record)
                    .filter(|record| !record.deleted))
            })
        })
        .await
    }

    async fn list(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        options: &ListOptions,
    ) -> Result<ListPage> {
        let cluster = cluster.to_string();
        let gvr = gvr.clone();
        let options = options.clone();
        self.blocking(move |inner| {
            let (candidates, revision) = inner.storage.with_connection(|conn| {
                let candidates = select_live(conn, &cluster, &gvr, options.namespace.as_deref())?;
                Ok((candidates, latest_revision(conn)?))
            })?;
            paginate(candidates, &options, &revision.to_string())
        })
        .await
    }

    async fn watch(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
        since: Option<&str>,
    ) -> Result<WatchStream> {
        let since = parse_since(since)?;
        let cluster = cluster.to_string();
        let gvr = gvr.clone();
        self.blocking(move |inner| inner.start_watch(&cluster, &gvr, since))
            .await
    }

    async fn purge_resource(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<usize> {
        let cluster = cluster.to_string();
        let gvr = gvr.clone();
        self.blocking(move |inner| {
            let scope = vec![
                cluster.clone(),
                gvr.group.clone(),
                gvr.version.clone(),
                gvr.resource.clone(),
            ];
            inner.purge(
                |conn| select_live(conn, &cluster, &gvr, None),
                "DELETE FROM resources
                 WHERE cluster = ?1 AND grp = ?2 AND version = ?3 AND resource = ?4",
                scope,
            )
        })
        .await
    }

    async fn purge_cluster(&self, cluster: &str) -> Result<usize> {
        let cluster = cluster.to_string();
        self.blocking(move |inner| {
            let scope = vec![cluster.clone()];
            inner.purge(
                |conn| select_live_in_cluster(conn, &cluster),
                "DELETE FROM resources WHERE cluster = ?1",
                scope,
            )
        })
        .await
    }

    async fn compact_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_time(&older_than);
        self.blocking(move |inner| {
            inner.storage.with_connection(|conn| {
                let removed = conn.execute(
                    "DELETE FROM resources WHERE deleted = 1 AND deleted_at < ?1",
                    params![cutoff],
                )?;
                Ok(removed)
            })
        })
        .await
    }

    async fn count(&self, cluster: &str, gvr: &GroupVersionResource) -> Result<u64> {
        let cluster = cluster.to_string();
        let gvr = gvr.clone();
        self.blocking(move |inner| {
            inner.storage.with_connection(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM resources
                     WHERE cluster = ?1 AND grp = ?2 AND version = ?3 AND resource = ?4
                       AND deleted = 0",
                    params![cluster, gvr.group, gvr.version, gvr.resource],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
        })
        .await
    }

    async fn stats(&self) -> Result<StorageStats> {
        self.blocking(|inner| inner.stats()).await
    }

    async fn health(&self) -> HealthStatus {
        let start = Instant::now();
        let check = self
            .blocking(|inner| {
                inner.storage.with_connection(|conn| {
                    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                    Ok(())
                })?;
                inner.storage.db_size()
            })
            .await;

        match check {
            Ok(size) => {
                let mut status = HealthStatus {
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    ..Default::default()
                };
                status
                    .details
                    .insert("db_size_bytes".to_string(), size.to_string());
                status
                    .details
                    .insert("db_path".to_string(), self.storage().db_path().to_string());
                status
            }
            Err(e) => HealthStatus {
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                ..HealthStatus::unhealthy(e.to_string())
            },
        }
    }
}

/// Factory binding the SQLite backend
pub struct SqliteStorageFactory {
    storage: Arc<SqliteBackend>,
}

impl SqliteStorageFactory {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let backend = SqliteBackend::open(config)?;
        tracing::info!(path = %backend.storage().db_path(), "sqlite storage opened");
        Ok(Self {
            storage: Arc::new(backend),
        })
    }
}

#[async_trait]
impl StorageFactory for SqliteStorageFactory {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn resource_storage(&self) -> Arc<dyn ResourceStorage> {
        self.storage.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        self.storage.blocking(|inner| inner.storage.checkpoint()).await?;
        tracing::info!("sqlite storage shut down");
        Ok(())
    }
}
