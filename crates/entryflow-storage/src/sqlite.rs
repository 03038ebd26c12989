//! SQLite implementation of [`PipelineStore`].
//!
//! [`SqliteStore`] keeps nodes, entries and the processing cache in one
//! SQLite database with WAL mode and foreign keys enabled. Payloads and node
//! configurations are stored as JSON TEXT columns via serde_json, so filter
//! predicates can be evaluated in SQL with `json_extract`.
//!
//! Status changes are guarded in SQL (`WHERE status IN (...)`) using the
//! legal source statuses of the entry state machine, so a stale caller can
//! never move an entry along an illegal edge.

use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params, Row};
use serde_json::Value;
use tracing::debug;

use entryflow_core::{
    CacheKey, CacheMatchField, CacheWrite, CachedProcessedEntry, ContentHash, CoreError,
    DataChannel, DataChannelId, EntryPayload, EntryStatus, FilterOutcome, Node, NodeConfig,
    NodeEntry, NodeEntryId, NodeGraph, NodeId, NodeOutput, NodeOutputId, NodeType, ProjectId,
    TransitionCause,
};

use crate::error::StorageError;
use crate::hash::{hash_input, hash_output, node_hash};
use crate::sql::{filter_predicate, status_sources, CACHE_COLUMNS, ENTRY_COLUMNS};
use crate::traits::PipelineStore;
use crate::types::{ChildEntry, ConfigChange, FilterRunStats, InvalidationReport, StatusCounts};

/// SQLite-backed implementation of [`PipelineStore`].
///
/// Multi-statement writes run inside a transaction.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore { conn })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore { conn })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn assert_node_exists(conn: &Connection, id: NodeId) -> Result<(), StorageError> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?1)",
            params![id.0],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StorageError::NodeNotFound(id));
        }
        Ok(())
    }

    fn load_node(conn: &Connection, id: NodeId) -> Result<Node, StorageError> {
        conn.query_row(
            "SELECT id, project_id, name, node_type, hash, config_json FROM nodes WHERE id = ?1",
            params![id.0],
            NodeRow::from_row,
        )
        .optional()?
        .ok_or(StorageError::NodeNotFound(id))?
        .into_node()
    }

    /// Copies every cache row of `old_hash` to `new_hash`. Existing rows
    /// under `new_hash` win.
    fn copy_cache_rows(
        conn: &Connection,
        old_hash: &ContentHash,
        new_hash: &ContentHash,
        node: NodeId,
    ) -> Result<usize, StorageError> {
        let copied = conn.execute(
            "INSERT INTO cached_processed_entries
                 (node_id, node_hash, incoming_input_hash, incoming_output_hash,
                  outgoing_input_hash, outgoing_output_hash, filter_outcome, explanation)
             SELECT ?3, ?2, incoming_input_hash, incoming_output_hash,
                    outgoing_input_hash, outgoing_output_hash, filter_outcome, explanation
             FROM cached_processed_entries
             WHERE node_hash = ?1
             ON CONFLICT (node_hash, incoming_input_hash, incoming_output_hash) DO NOTHING",
            params![old_hash.as_str(), new_hash.as_str(), node.0],
        )?;
        Ok(copied)
    }

    /// Deletes the entries descended from `node` and resets the node's own
    /// entries. Callers run this inside their transaction.
    fn reset_node(conn: &Connection, node: NodeId) -> Result<InvalidationReport, StorageError> {
        const DOOMED: &str = "WITH RECURSIVE doomed(id) AS (
                SELECT child.id
                FROM node_entries child
                JOIN node_entries parent ON child.parent_node_entry_id = parent.id
                WHERE parent.node_id = ?1
                UNION
                SELECT child.id
                FROM node_entries child
                JOIN doomed ON child.parent_node_entry_id = doomed.id
            )";

        // Counted up front: the parent cascade may remove rows before the
        // DELETE reaches them, which would hide them from `changes()`.
        let doomed: i64 = conn.query_row(
            &format!("{DOOMED} SELECT COUNT(*) FROM doomed"),
            params![node.0],
            |row| row.get(0),
        )?;
        conn.execute(
            &format!("{DOOMED} DELETE FROM node_entries WHERE id IN (SELECT id FROM doomed)"),
            params![node.0],
        )?;

        let reset = conn.execute(
            "UPDATE node_entries
             SET status = 'PENDING',
                 error = NULL,
                 diagnostic = NULL,
                 outgoing_input_hash = NULL,
                 outgoing_output_hash = NULL,
                 filter_outcome = NULL,
                 claimed_at = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE node_id = ?1",
            params![node.0],
        )?;

        Ok(InvalidationReport {
            reset,
            deleted_descendants: doomed as usize,
        })
    }

    fn query_entries<P: Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<NodeEntry>, StorageError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, EntryRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    fn load_entry(conn: &Connection, id: NodeEntryId) -> Result<NodeEntry, StorageError> {
        conn.query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM node_entries WHERE id = ?1"),
            params![id.0],
            EntryRow::from_row,
        )
        .optional()?
        .ok_or(StorageError::EntryNotFound(id))?
        .into_entry()
    }

    /// Turns a guarded UPDATE that touched no row into the matching error.
    fn check_transition(
        conn: &Connection,
        id: NodeEntryId,
        to: EntryStatus,
        changed: usize,
    ) -> Result<(), StorageError> {
        if changed > 0 {
            return Ok(());
        }
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM node_entries WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            None => Err(StorageError::EntryNotFound(id)),
            Some(status) => {
                let from: EntryStatus = status.parse()?;
                Err(CoreError::IllegalTransition { from, to }.into())
            }
        }
    }

    fn load_output(conn: &Connection, id: NodeOutputId) -> Result<NodeOutput, StorageError> {
        conn.query_row(
            "SELECT id, node_id, label FROM node_outputs WHERE id = ?1",
            params![id.0],
            output_from_row,
        )
        .optional()?
        .ok_or(StorageError::OutputNotFound(id))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct NodeRow {
    id: i64,
    project_id: i64,
    name: String,
    node_type: String,
    hash: String,
    config_json: String,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(NodeRow {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            node_type: row.get(3)?,
            hash: row.get(4)?,
            config_json: row.get(5)?,
        })
    }

    fn into_node(self) -> Result<Node, StorageError> {
        let config: NodeConfig = serde_json::from_str(&self.config_json)?;
        let node_type: NodeType = self.node_type.parse()?;
        if config.node_type() != node_type {
            return Err(StorageError::IntegrityError {
                reason: format!(
                    "node {} is stored as {} but its config is {}",
                    self.id,
                    node_type,
                    config.node_type()
                ),
            });
        }
        Ok(Node {
            id: NodeId(self.id),
            project_id: ProjectId(self.project_id),
            name: self.name,
            hash: ContentHash(self.hash),
            config,
        })
    }
}

struct EntryRow {
    id: i64,
    node_id: i64,
    parent: Option<i64>,
    input_hash: String,
    output_hash: String,
    status: String,
    payload_json: String,
    error: Option<String>,
    diagnostic: Option<String>,
    outgoing_input_hash: Option<String>,
    outgoing_output_hash: Option<String>,
    filter_outcome: Option<String>,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(EntryRow {
            id: row.get(0)?,
            node_id: row.get(1)?,
            parent: row.get(2)?,
            input_hash: row.get(3)?,
            output_hash: row.get(4)?,
            status: row.get(5)?,
            payload_json: row.get(6)?,
            error: row.get(7)?,
            diagnostic: row.get(8)?,
            outgoing_input_hash: row.get(9)?,
            outgoing_output_hash: row.get(10)?,
            filter_outcome: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<NodeEntry, StorageError> {
        Ok(NodeEntry {
            id: NodeEntryId(self.id),
            node_id: NodeId(self.node_id),
            parent_node_entry_id: self.parent.map(NodeEntryId),
            input_hash: ContentHash(self.input_hash),
            output_hash: ContentHash(self.output_hash),
            status: self.status.parse()?,
            payload: serde_json::from_str(&self.payload_json)?,
            error: self.error,
            diagnostic: self.diagnostic,
            outgoing_input_hash: self.outgoing_input_hash.map(ContentHash),
            outgoing_output_hash: self.outgoing_output_hash.map(ContentHash),
            filter_outcome: parse_outcome(self.filter_outcome)?,
        })
    }
}

struct CacheRow {
    node_id: Option<i64>,
    node_hash: String,
    incoming_input_hash: String,
    incoming_output_hash: String,
    outgoing_input_hash: Option<String>,
    outgoing_output_hash: Option<String>,
    filter_outcome: Option<String>,
    explanation: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CacheRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CacheRow {
            node_id: row.get(0)?,
            node_hash: row.get(1)?,
            incoming_input_hash: row.get(2)?,
            incoming_output_hash: row.get(3)?,
            outgoing_input_hash: row.get(4)?,
            outgoing_output_hash: row.get(5)?,
            filter_outcome: row.get(6)?,
            explanation: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_cached(self) -> Result<CachedProcessedEntry, StorageError> {
        Ok(CachedProcessedEntry {
            node_id: self.node_id.map(NodeId),
            key: CacheKey {
                node_hash: ContentHash(self.node_hash),
                incoming_input_hash: ContentHash(self.incoming_input_hash),
                incoming_output_hash: ContentHash(self.incoming_output_hash),
            },
            result: CacheWrite {
                outgoing_input_hash: self.outgoing_input_hash.map(ContentHash),
                outgoing_output_hash: self.outgoing_output_hash.map(ContentHash),
                filter_outcome: parse_outcome(self.filter_outcome)?,
                explanation: self.explanation,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_outcome(value: Option<String>) -> Result<Option<FilterOutcome>, StorageError> {
    Ok(value.map(|s| s.parse::<FilterOutcome>()).transpose()?)
}

fn output_from_row(row: &Row<'_>) -> rusqlite::Result<NodeOutput> {
    Ok(NodeOutput {
        id: NodeOutputId(row.get(0)?),
        node_id: NodeId(row.get(1)?),
        label: row.get(2)?,
    })
}

fn hash_param(hash: &Option<ContentHash>) -> Option<&str> {
    hash.as_ref().map(ContentHash::as_str)
}

// ---------------------------------------------------------------------------
// PipelineStore
// ---------------------------------------------------------------------------

impl PipelineStore for SqliteStore {
    // -- Graph --

    fn create_node(
        &mut self,
        project: ProjectId,
        name: &str,
        config: &NodeConfig,
    ) -> Result<Node, StorageError> {
        config.validate()?;
        let hash = node_hash(config);
        let config_json = serde_json::to_string(config)?;
        let node_type = config.node_type();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO nodes (project_id, name, node_type, hash, config_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project.0, name, node_type.as_str(), hash.as_str(), config_json],
        )?;
        let id = NodeId(tx.last_insert_rowid());
        for label in node_type.output_labels() {
            tx.execute(
                "INSERT INTO node_outputs (node_id, label) VALUES (?1, ?2)",
                params![id.0, label],
            )?;
        }
        tx.commit()?;

        Ok(Node {
            id,
            project_id: project,
            name: name.to_string(),
            hash,
            config: config.clone(),
        })
    }

    fn get_node(&self, id: NodeId) -> Result<Node, StorageError> {
        Self::load_node(&self.conn, id)
    }

    fn replace_config(
        &mut self,
        id: NodeId,
        config: &NodeConfig,
        carry_cache: bool,
    ) -> Result<ConfigChange, StorageError> {
        let tx = self.conn.transaction()?;
        let existing = Self::load_node(&tx, id)?;
        if existing.node_type() != config.node_type() {
            return Err(CoreError::NodeTypeMismatch {
                node: id,
                expected: existing.node_type(),
                actual: config.node_type(),
            }
            .into());
        }
        config.validate()?;
        let hash = node_hash(config);
        tx.execute(
            "UPDATE nodes
             SET config_json = ?1, hash = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE id = ?3",
            params![serde_json::to_string(config)?, hash.as_str(), id.0],
        )?;

        let mut carried = 0;
        let mut invalidation = None;
        if hash != existing.hash {
            if carry_cache {
                carried = Self::copy_cache_rows(&tx, &existing.hash, &hash, id)?;
            }
            invalidation = Some(Self::reset_node(&tx, id)?);
        }
        tx.commit()?;

        debug!(node = %id, %hash, carried, invalidated = invalidation.is_some(), "replaced node config");
        Ok(ConfigChange {
            previous_hash: existing.hash.clone(),
            node: Node {
                hash,
                config: config.clone(),
                ..existing
            },
            carried,
            invalidation,
        })
    }

    fn delete_node(&mut self, id: NodeId) -> Result<(), StorageError> {
        let deleted = self
            .conn
            .execute("DELETE FROM nodes WHERE id = ?1", params![id.0])?;
        if deleted == 0 {
            return Err(StorageError::NodeNotFound(id));
        }
        Ok(())
    }

    fn list_outputs(&self, node: NodeId) -> Result<Vec<NodeOutput>, StorageError> {
        Self::assert_node_exists(&self.conn, node)?;
        let mut stmt = self
            .conn
            .prepare("SELECT id, node_id, label FROM node_outputs WHERE node_id = ?1 ORDER BY id")?;
        let outputs = stmt
            .query_map(params![node.0], output_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(outputs)
    }

    fn output_by_label(&self, node: NodeId, label: &str) -> Result<NodeOutput, StorageError> {
        Self::assert_node_exists(&self.conn, node)?;
        self.conn
            .query_row(
                "SELECT id, node_id, label FROM node_outputs WHERE node_id = ?1 AND label = ?2",
                params![node.0, label],
                output_from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::IntegrityError {
                reason: format!("node {node} has no output labelled '{label}'"),
            })
    }

    fn connect(
        &mut self,
        origin: NodeOutputId,
        destination: NodeId,
    ) -> Result<DataChannel, StorageError> {
        let output = Self::load_output(&self.conn, origin)?;
        let origin_node = Self::load_node(&self.conn, output.node_id)?;
        let destination_node = Self::load_node(&self.conn, destination)?;
        if origin_node.project_id != destination_node.project_id {
            return Err(StorageError::IntegrityError {
                reason: format!(
                    "cannot connect node {} to node {} across projects",
                    origin_node.id, destination
                ),
            });
        }

        let graph = self.load_graph(origin_node.project_id)?;
        if graph.would_create_cycle(origin_node.id, destination)? {
            return Err(CoreError::CycleDetected {
                origin: origin_node.id,
                destination,
            }
            .into());
        }

        // Connecting the same pair twice returns the existing channel.
        self.conn.execute(
            "INSERT INTO data_channels (origin_id, destination_id) VALUES (?1, ?2)
             ON CONFLICT (origin_id, destination_id) DO NOTHING",
            params![origin.0, destination.0],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM data_channels WHERE origin_id = ?1 AND destination_id = ?2",
            params![origin.0, destination.0],
            |row| row.get(0),
        )?;
        Ok(DataChannel {
            id: DataChannelId(id),
            origin_id: origin,
            destination_id: destination,
        })
    }

    fn load_graph(&self, project: ProjectId) -> Result<NodeGraph, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, name, node_type, hash, config_json
             FROM nodes WHERE project_id = ?1 ORDER BY id",
        )?;
        let nodes = stmt
            .query_map(params![project.0], NodeRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(NodeRow::into_node)
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT o.id, o.node_id, o.label
             FROM node_outputs o JOIN nodes n ON n.id = o.node_id
             WHERE n.project_id = ?1 ORDER BY o.id",
        )?;
        let outputs = stmt
            .query_map(params![project.0], output_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.origin_id, c.destination_id
             FROM data_channels c
             JOIN node_outputs o ON o.id = c.origin_id
             JOIN nodes n ON n.id = o.node_id
             WHERE n.project_id = ?1 ORDER BY c.id",
        )?;
        let channels = stmt
            .query_map(params![project.0], |row| {
                Ok(DataChannel {
                    id: DataChannelId(row.get(0)?),
                    origin_id: NodeOutputId(row.get(1)?),
                    destination_id: NodeId(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NodeGraph::from_parts(nodes, &outputs, &channels)?)
    }

    // -- Entries --

    fn insert_entries(
        &mut self,
        node: NodeId,
        payloads: &[EntryPayload],
    ) -> Result<Vec<NodeEntryId>, StorageError> {
        Self::assert_node_exists(&self.conn, node)?;
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(payloads.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO node_entries (node_id, input_hash, output_hash, payload_json)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for payload in payloads {
                stmt.execute(params![
                    node.0,
                    hash_input(payload).as_str(),
                    hash_output(payload).as_str(),
                    serde_json::to_string(payload)?,
                ])?;
                ids.push(NodeEntryId(tx.last_insert_rowid()));
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn insert_child_entries(&mut self, children: &[ChildEntry]) -> Result<usize, StorageError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO node_entries
                     (node_id, parent_node_entry_id, input_hash, output_hash, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for child in children {
                inserted += stmt.execute(params![
                    child.destination.0,
                    child.parent.0,
                    hash_input(&child.payload).as_str(),
                    hash_output(&child.payload).as_str(),
                    serde_json::to_string(&child.payload)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn get_entry(&self, id: NodeEntryId) -> Result<NodeEntry, StorageError> {
        Self::load_entry(&self.conn, id)
    }

    fn list_entries(&self, node: NodeId) -> Result<Vec<NodeEntry>, StorageError> {
        Self::query_entries(
            &self.conn,
            &format!("SELECT {ENTRY_COLUMNS} FROM node_entries WHERE node_id = ?1 ORDER BY id"),
            params![node.0],
        )
    }

    fn list_pending(&self, node: NodeId, batch_size: usize) -> Result<Vec<NodeEntry>, StorageError> {
        Self::query_entries(
            &self.conn,
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM node_entries
                 WHERE node_id = ?1 AND status = 'PENDING' ORDER BY id LIMIT ?2"
            ),
            params![node.0, batch_size as i64],
        )
    }

    fn list_processed(&self, node: NodeId) -> Result<Vec<NodeEntry>, StorageError> {
        Self::query_entries(
            &self.conn,
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM node_entries
                 WHERE node_id = ?1 AND status = 'PROCESSED' ORDER BY id"
            ),
            params![node.0],
        )
    }

    fn claim_entries(&mut self, ids: &[NodeEntryId]) -> Result<Vec<NodeEntry>, StorageError> {
        let sources = status_sources(EntryStatus::Processing, TransitionCause::Processing);
        let tx = self.conn.transaction()?;
        let mut claimed = Vec::with_capacity(ids.len());
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE node_entries
                 SET status = 'PROCESSING',
                     claimed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1 AND status IN ({sources})"
            ))?;
            for id in ids {
                if stmt.execute(params![id.0])? > 0 {
                    claimed.push(*id);
                }
            }
        }
        let entries = claimed
            .into_iter()
            .map(|id| Self::load_entry(&tx, id))
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit()?;
        Ok(entries)
    }

    fn record_processed(&mut self, id: NodeEntryId, result: &CacheWrite) -> Result<(), StorageError> {
        let sources = status_sources(EntryStatus::Processed, TransitionCause::Processing);
        let changed = self.conn.execute(
            &format!(
                "UPDATE node_entries
                 SET status = 'PROCESSED',
                     outgoing_input_hash = ?2,
                     outgoing_output_hash = ?3,
                     filter_outcome = ?4,
                     error = NULL,
                     diagnostic = NULL,
                     claimed_at = NULL,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1 AND status IN ({sources})"
            ),
            params![
                id.0,
                hash_param(&result.outgoing_input_hash),
                hash_param(&result.outgoing_output_hash),
                result.filter_outcome.map(FilterOutcome::as_str),
            ],
        )?;
        Self::check_transition(&self.conn, id, EntryStatus::Processed, changed)
    }

    fn record_deferred(&mut self, id: NodeEntryId, diagnostic: &str) -> Result<(), StorageError> {
        let sources = status_sources(EntryStatus::Pending, TransitionCause::Processing);
        let changed = self.conn.execute(
            &format!(
                "UPDATE node_entries
                 SET status = 'PENDING',
                     diagnostic = ?2,
                     claimed_at = NULL,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1 AND status IN ({sources})"
            ),
            params![id.0, diagnostic],
        )?;
        Self::check_transition(&self.conn, id, EntryStatus::Pending, changed)
    }

    fn record_failed(&mut self, id: NodeEntryId, error: &str) -> Result<(), StorageError> {
        let sources = status_sources(EntryStatus::Error, TransitionCause::Processing);
        let changed = self.conn.execute(
            &format!(
                "UPDATE node_entries
                 SET status = 'ERROR',
                     error = ?2,
                     claimed_at = NULL,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1 AND status IN ({sources})"
            ),
            params![id.0, error],
        )?;
        Self::check_transition(&self.conn, id, EntryStatus::Error, changed)
    }

    fn status_counts(&self, node: NodeId) -> Result<StatusCounts, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM node_entries WHERE node_id = ?1 GROUP BY status")?;
        let rows = stmt
            .query_map(params![node.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.0.insert(status.parse()?, count as usize);
        }
        Ok(counts)
    }

    fn recover_stale(&mut self, node: Option<NodeId>, older_than: Duration) -> Result<usize, StorageError> {
        let modifier = format!("-{} seconds", older_than.as_secs());
        let recovered = self.conn.execute(
            "UPDATE node_entries
             SET status = 'PENDING',
                 diagnostic = 'claim expired; returned to pending',
                 claimed_at = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE status = 'PROCESSING'
               AND (claimed_at IS NULL
                    OR claimed_at <= strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?1))
               AND (?2 IS NULL OR node_id = ?2)",
            params![modifier, node.map(|n| n.0)],
        )?;
        if recovered > 0 {
            debug!(recovered, ?node, "recovered stale processing entries");
        }
        Ok(recovered)
    }

    // -- Cache --

    fn lookup_cache(
        &self,
        node_hash: &ContentHash,
        incoming_input_hash: &ContentHash,
        incoming_output_hash: &ContentHash,
        match_fields: &[CacheMatchField],
    ) -> Result<Option<CachedProcessedEntry>, StorageError> {
        let mut sql = format!("SELECT {CACHE_COLUMNS} FROM cached_processed_entries WHERE node_hash = ?1");
        let mut values = vec![node_hash.as_str()];
        for field in match_fields {
            let (column, value) = match field {
                CacheMatchField::IncomingInputHash => ("incoming_input_hash", incoming_input_hash),
                CacheMatchField::IncomingOutputHash => ("incoming_output_hash", incoming_output_hash),
            };
            values.push(value.as_str());
            sql.push_str(&format!(" AND {column} = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY id LIMIT 1");

        self.conn
            .query_row(&sql, params_from_iter(values), CacheRow::from_row)
            .optional()?
            .map(CacheRow::into_cached)
            .transpose()
    }

    fn write_cache(
        &mut self,
        node: NodeId,
        key: &CacheKey,
        result: &CacheWrite,
    ) -> Result<bool, StorageError> {
        let inserted = self.conn.execute(
            "INSERT INTO cached_processed_entries
                 (node_id, node_hash, incoming_input_hash, incoming_output_hash,
                  outgoing_input_hash, outgoing_output_hash, filter_outcome, explanation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (node_hash, incoming_input_hash, incoming_output_hash) DO NOTHING",
            params![
                node.0,
                key.node_hash.as_str(),
                key.incoming_input_hash.as_str(),
                key.incoming_output_hash.as_str(),
                hash_param(&result.outgoing_input_hash),
                hash_param(&result.outgoing_output_hash),
                result.filter_outcome.map(FilterOutcome::as_str),
                result.explanation,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn convert_cache(
        &mut self,
        old_hash: &ContentHash,
        new_hash: &ContentHash,
        node: NodeId,
    ) -> Result<usize, StorageError> {
        if old_hash == new_hash {
            return Ok(0);
        }
        let copied = Self::copy_cache_rows(&self.conn, old_hash, new_hash, node)?;
        debug!(copied, %old_hash, %new_hash, "converted cache rows");
        Ok(copied)
    }

    fn count_cache_rows(&self, node_hash: &ContentHash) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cached_processed_entries WHERE node_hash = ?1",
            params![node_hash.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn put_output(&mut self, hash: &ContentHash, output: &Value) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO entry_outputs (hash, output_json) VALUES (?1, ?2)",
            params![hash.as_str(), serde_json::to_string(output)?],
        )?;
        Ok(())
    }

    fn get_output(&self, hash: &ContentHash) -> Result<Option<Value>, StorageError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT output_json FROM entry_outputs WHERE hash = ?1",
                params![hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    // -- Bulk --

    fn invalidate_descendants(&mut self, node: NodeId) -> Result<InvalidationReport, StorageError> {
        Self::assert_node_exists(&self.conn, node)?;
        let tx = self.conn.transaction()?;
        let report = Self::reset_node(&tx, node)?;
        tx.commit()?;
        debug!(%node, reset = report.reset, deleted = report.deleted_descendants, "invalidated node");
        Ok(report)
    }

    fn mark_all_processing(&mut self, node: NodeId) -> Result<usize, StorageError> {
        let sources = status_sources(EntryStatus::Processing, TransitionCause::Processing);
        let tx = self.conn.transaction()?;
        let marked = tx.execute(
            &format!(
                "UPDATE node_entries
                 SET status = 'PROCESSING',
                     claimed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE node_id = ?1 AND status IN ({sources})"
            ),
            params![node.0],
        )?;
        tx.commit()?;
        Ok(marked)
    }

    fn classify_filter(&mut self, node: &Node) -> Result<FilterRunStats, StorageError> {
        let filter = node.as_filter()?;
        let predicate = filter_predicate(&filter.filters, 3)?;
        let tx = self.conn.transaction()?;

        let classified: i64 = tx.query_row(
            "SELECT COUNT(*) FROM node_entries WHERE node_id = ?1 AND status = 'PROCESSING'",
            params![node.id.0],
            |row| row.get(0),
        )?;

        let cache_hits: i64 = tx.query_row(
            "SELECT COUNT(*) FROM node_entries ne
             WHERE ne.node_id = ?1 AND ne.status = 'PROCESSING'
               AND EXISTS (
                   SELECT 1 FROM cached_processed_entries c
                   WHERE c.node_hash = ?2
                     AND c.incoming_input_hash = ne.input_hash
                     AND c.incoming_output_hash = ne.output_hash
                     AND c.filter_outcome IS NOT NULL
               )",
            params![node.id.0, node.hash.as_str()],
            |row| row.get(0),
        )?;

        // One statement evaluates every uncached entry against the predicate.
        let mut bound = vec![
            rusqlite::types::Value::Integer(node.id.0),
            rusqlite::types::Value::Text(node.hash.0.clone()),
        ];
        bound.extend(predicate.params);
        let cache_writes = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO cached_processed_entries
                     (node_id, node_hash, incoming_input_hash, incoming_output_hash, filter_outcome)
                 SELECT ?1, ?2, ne.input_hash, ne.output_hash,
                        CASE WHEN {} THEN 'PASSED' ELSE 'FAILED' END
                 FROM node_entries ne
                 WHERE ne.node_id = ?1 AND ne.status = 'PROCESSING'
                   AND NOT EXISTS (
                       SELECT 1 FROM cached_processed_entries c
                       WHERE c.node_hash = ?2
                         AND c.incoming_input_hash = ne.input_hash
                         AND c.incoming_output_hash = ne.output_hash
                         AND c.filter_outcome IS NOT NULL
                   )
                 ORDER BY ne.id",
                predicate.expr
            ),
            params_from_iter(bound),
        )?;

        let mut passed = 0;
        let mut failed = 0;
        {
            let mut stmt = tx.prepare(
                "SELECT c.filter_outcome, COUNT(*)
                 FROM node_entries ne
                 JOIN cached_processed_entries c
                   ON c.node_hash = ?2
                  AND c.incoming_input_hash = ne.input_hash
                  AND c.incoming_output_hash = ne.output_hash
                 WHERE ne.node_id = ?1 AND ne.status = 'PROCESSING'
                 GROUP BY c.filter_outcome",
            )?;
            let rows = stmt
                .query_map(params![node.id.0, node.hash.as_str()], |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (outcome, count) in rows {
                match parse_outcome(outcome)? {
                    Some(FilterOutcome::Passed) => passed = count as usize,
                    Some(FilterOutcome::Failed) => failed = count as usize,
                    None => {}
                }
            }
        }

        tx.execute(
            "UPDATE node_entries
             SET filter_outcome = (
                     SELECT c.filter_outcome FROM cached_processed_entries c
                     WHERE c.node_hash = ?2
                       AND c.incoming_input_hash = node_entries.input_hash
                       AND c.incoming_output_hash = node_entries.output_hash
                 ),
                 status = 'PROCESSED',
                 outgoing_input_hash = NULL,
                 outgoing_output_hash = NULL,
                 error = NULL,
                 diagnostic = NULL,
                 claimed_at = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE node_id = ?1 AND status = 'PROCESSING'",
            params![node.id.0, node.hash.as_str()],
        )?;
        tx.commit()?;

        let stats = FilterRunStats {
            classified: classified as usize,
            cache_writes,
            cache_hits: cache_hits as usize,
            passed,
            failed,
        };
        debug!(node = %node.id, ?stats, "classified filter entries");
        Ok(stats)
    }
}
