//! DuckDB-backed store, one database file per workspace.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use aeroschema_core::{
    FactId, NodeFact, Pattern, PatternDraft, PatternId, PatternMatch, PatternScope, Run,
};
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{Connection, OptionalExt, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{CatalogStore, StoreError, UpsertOutcome, check_workspace, fold_members};

const SCHEMA: &str = "
CREATE SEQUENCE IF NOT EXISTS fact_ids START 1;
CREATE SEQUENCE IF NOT EXISTS pattern_ids START 1;
CREATE SEQUENCE IF NOT EXISTS match_ids START 1;

CREATE TABLE IF NOT EXISTS workspace_meta (
    workspace VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id VARCHAR PRIMARY KEY,
    body VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS node_facts (
    id BIGINT PRIMARY KEY,
    run_id VARCHAR NOT NULL,
    body VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS patterns (
    id BIGINT PRIMARY KEY,
    spec_version VARCHAR NOT NULL,
    message_root VARCHAR NOT NULL,
    section_path VARCHAR NOT NULL,
    node_type VARCHAR NOT NULL,
    signature_hash VARCHAR NOT NULL,
    rule VARCHAR NOT NULL,
    times_seen BIGINT NOT NULL,
    first_seen VARCHAR NOT NULL,
    last_seen VARCHAR NOT NULL,
    example_fact_ids VARCHAR NOT NULL,
    active BOOLEAN NOT NULL,
    superseded_by BIGINT,
    UNIQUE (spec_version, message_root, signature_hash)
);

CREATE TABLE IF NOT EXISTS pattern_matches (
    id BIGINT PRIMARY KEY,
    run_id VARCHAR NOT NULL,
    node_fact_id BIGINT NOT NULL,
    body VARCHAR NOT NULL,
    UNIQUE (run_id, node_fact_id)
);
";

/// Bound on `superseded_by` hops when resolving a merged-away pattern.
const MAX_SUPERSEDE_HOPS: usize = 32;

const PATTERN_COLUMNS: &str = "id, spec_version, message_root, section_path, node_type, \
     signature_hash, rule, times_seen, first_seen, last_seen, example_fact_ids, active, superseded_by";

/// Raw pattern row before JSON and timestamp decoding.
struct PatternRow {
    id: i64,
    spec_version: String,
    message_root: String,
    section_path: String,
    node_type: String,
    signature_hash: String,
    rule: String,
    times_seen: i64,
    first_seen: String,
    last_seen: String,
    example_fact_ids: String,
    active: bool,
    superseded_by: Option<i64>,
}

impl PatternRow {
    fn read(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            spec_version: row.get(1)?,
            message_root: row.get(2)?,
            section_path: row.get(3)?,
            node_type: row.get(4)?,
            signature_hash: row.get(5)?,
            rule: row.get(6)?,
            times_seen: row.get(7)?,
            first_seen: row.get(8)?,
            last_seen: row.get(9)?,
            example_fact_ids: row.get(10)?,
            active: row.get(11)?,
            superseded_by: row.get(12)?,
        })
    }

    fn into_pattern(self, workspace: &str) -> Result<Pattern, StoreError> {
        Ok(Pattern {
            id: self.id as PatternId,
            workspace: workspace.to_string(),
            spec_version: self.spec_version,
            message_root: self.message_root,
            section_path: self.section_path,
            node_type: self.node_type,
            rule: serde_json::from_str(&self.rule)?,
            signature_hash: self.signature_hash,
            times_seen: self.times_seen.max(0) as u64,
            first_seen: parse_ts(&self.first_seen)?,
            last_seen: parse_ts(&self.last_seen)?,
            example_fact_ids: serde_json::from_str(&self.example_fact_ids)?,
            active: self.active,
            superseded_by: self.superseded_by.map(|id| id as PatternId),
        })
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Other(format!("bad timestamp {s:?}: {e}")))
}

fn is_constraint_violation(err: &duckdb::Error) -> bool {
    let msg = err.to_string();
    msg.contains("Constraint Error") || msg.contains("Duplicate key")
}

/// DuckDB store for one workspace.
///
/// The connection sits behind a mutex; pattern upserts additionally run
/// inside a transaction against the `(spec_version, message_root,
/// signature_hash)` unique index, and a constraint violation surfaces as
/// [`StoreError::CatalogConflict`] for the caller to retry.
pub struct DuckStore {
    workspace: String,
    conn: Mutex<Connection>,
}

impl DuckStore {
    /// Open an in-memory database.
    pub fn open_in_memory(workspace: &str) -> Result<Self, StoreError> {
        Self::init(workspace, Connection::open_in_memory()?)
    }

    /// Open or create the database file for `workspace`.
    ///
    /// A file created for one workspace refuses to open for another.
    pub fn open(workspace: &str, path: &Path) -> Result<Self, StoreError> {
        let store = Self::init(workspace, Connection::open(path)?)?;
        info!(workspace, path = %path.display(), "opened catalog");
        Ok(store)
    }

    fn init(workspace: &str, conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let owner: Option<String> = conn
            .query_row("SELECT workspace FROM workspace_meta LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match owner {
            Some(owner) => check_workspace(workspace, &owner)?,
            None => {
                conn.execute("INSERT INTO workspace_meta VALUES (?)", params![workspace])?;
            }
        }
        Ok(Self {
            workspace: workspace.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn select_patterns(
        &self,
        conn: &Connection,
        where_clause: &str,
        args: &[&dyn duckdb::ToSql],
    ) -> Result<Vec<Pattern>, StoreError> {
        let sql = format!("SELECT {PATTERN_COLUMNS} FROM patterns {where_clause} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, PatternRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|r| r.into_pattern(&self.workspace))
            .collect()
    }

    fn pattern_by_id(&self, conn: &Connection, id: PatternId) -> Result<Pattern, StoreError> {
        self.select_patterns(conn, "WHERE id = ?", &[&(id as i64)])?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found("pattern", id))
    }

    fn pattern_by_signature(
        &self,
        conn: &Connection,
        draft: &PatternDraft,
    ) -> Result<Option<Pattern>, StoreError> {
        Ok(self
            .select_patterns(
                conn,
                "WHERE spec_version = ? AND message_root = ? AND signature_hash = ?",
                &[
                    &draft.scope.spec_version,
                    &draft.scope.message_root,
                    &draft.signature_hash,
                ],
            )?
            .into_iter()
            .next())
    }

    /// The live survivor of a pattern deactivated by consolidation.
    fn live_pattern(&self, conn: &Connection, mut p: Pattern) -> Result<Pattern, StoreError> {
        for _ in 0..MAX_SUPERSEDE_HOPS {
            match (p.active, p.superseded_by) {
                (false, Some(next)) => p = self.pattern_by_id(conn, next)?,
                _ => break,
            }
        }
        Ok(p)
    }

    fn insert_pattern(&self, conn: &Connection, p: &Pattern) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "INSERT INTO patterns ({PATTERN_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                p.id as i64,
                p.spec_version,
                p.message_root,
                p.section_path,
                p.node_type,
                p.signature_hash,
                p.rule.canonical_json()?,
                p.times_seen as i64,
                ts(p.first_seen),
                ts(p.last_seen),
                serde_json::to_string(&p.example_fact_ids)?,
                p.active,
                p.superseded_by.map(|id| id as i64),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::CatalogConflict {
                    signature: p.signature_hash.clone(),
                }
            } else {
                StoreError::DuckDb(e)
            }
        })?;
        Ok(())
    }

    fn save_pattern_counters(&self, conn: &Connection, p: &Pattern) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE patterns SET times_seen = ?, first_seen = ?, last_seen = ?, \
             example_fact_ids = ?, active = ?, superseded_by = ? WHERE id = ?",
            params![
                p.times_seen as i64,
                ts(p.first_seen),
                ts(p.last_seen),
                serde_json::to_string(&p.example_fact_ids)?,
                p.active,
                p.superseded_by.map(|id| id as i64),
                p.id as i64,
            ],
        )?;
        Ok(())
    }

    fn next_id(conn: &Connection, sequence: &str) -> Result<i64, StoreError> {
        Ok(conn.query_row(&format!("SELECT nextval('{sequence}')"), [], |row| {
            row.get(0)
        })?)
    }

    fn new_pattern(
        &self,
        conn: &Connection,
        draft: &PatternDraft,
        times_seen: u64,
        first_seen: DateTime<Utc>,
        now: DateTime<Utc>,
        examples: &[FactId],
    ) -> Result<Pattern, StoreError> {
        let id = Self::next_id(conn, "pattern_ids")? as PatternId;
        let mut p = Pattern {
            id,
            workspace: self.workspace.clone(),
            spec_version: draft.scope.spec_version.clone(),
            message_root: draft.scope.message_root.clone(),
            section_path: draft.section_path.clone(),
            node_type: draft.node_type.clone(),
            rule: draft.rule.clone(),
            signature_hash: draft.signature_hash.clone(),
            times_seen,
            first_seen,
            last_seen: now,
            example_fact_ids: Vec::new(),
            active: true,
            superseded_by: None,
        };
        p.push_examples(examples);
        self.insert_pattern(conn, &p)?;
        Ok(p)
    }
}

impl CatalogStore for DuckStore {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        check_workspace(&self.workspace, &run.workspace)?;
        self.lock()?.execute(
            "INSERT INTO runs (id, body) VALUES (?, ?)",
            params![run.id.to_string(), serde_json::to_string(run)?],
        )?;
        Ok(())
    }

    fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        check_workspace(&self.workspace, &run.workspace)?;
        let changed = self.lock()?.execute(
            "UPDATE runs SET body = ? WHERE id = ?",
            params![serde_json::to_string(run)?, run.id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("run", run.id));
        }
        Ok(())
    }

    fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        let body: Option<String> = self
            .lock()?
            .query_row(
                "SELECT body FROM runs WHERE id = ?",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let body = body.ok_or_else(|| StoreError::not_found("run", id))?;
        Ok(serde_json::from_str(&body)?)
    }

    fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM runs")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut runs = bodies
            .iter()
            .map(|b| serde_json::from_str::<Run>(b))
            .collect::<Result<Vec<_>, _>>()?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn insert_facts(&self, facts: &mut [NodeFact]) -> Result<(), StoreError> {
        for fact in facts.iter() {
            check_workspace(&self.workspace, &fact.workspace)?;
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for fact in facts.iter_mut() {
            let id = Self::next_id(&tx, "fact_ids")?;
            fact.id = Some(id as FactId);
            tx.execute(
                "INSERT INTO node_facts (id, run_id, body) VALUES (?, ?, ?)",
                params![id, fact.run_id.to_string(), serde_json::to_string(&*fact)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_fact(&self, id: FactId) -> Result<NodeFact, StoreError> {
        let body: Option<String> = self
            .lock()?
            .query_row(
                "SELECT body FROM node_facts WHERE id = ?",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?;
        let body = body.ok_or_else(|| StoreError::not_found("fact", id))?;
        Ok(serde_json::from_str(&body)?)
    }

    fn facts_for_run(&self, run_id: Uuid) -> Result<Vec<NodeFact>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM node_facts WHERE run_id = ? ORDER BY id")?;
        let bodies = stmt
            .query_map(params![run_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bodies
            .iter()
            .map(|b| serde_json::from_str(b))
            .collect::<Result<Vec<_>, _>>()?)
    }

    fn upsert_pattern(
        &self,
        draft: &PatternDraft,
        seen: u64,
        examples: &[FactId],
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        check_workspace(&self.workspace, &draft.scope.workspace)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let outcome = match self.pattern_by_signature(&tx, draft)? {
            Some(found) => {
                let mut p = self.live_pattern(&tx, found)?;
                p.times_seen += seen;
                p.last_seen = now;
                p.push_examples(examples);
                self.save_pattern_counters(&tx, &p)?;
                UpsertOutcome {
                    pattern: p,
                    inserted: false,
                }
            }
            None => UpsertOutcome {
                pattern: self.new_pattern(&tx, draft, seen, now, now, examples)?,
                inserted: true,
            },
        };
        tx.commit()?;
        debug!(
            pattern_id = outcome.pattern.id,
            inserted = outcome.inserted,
            signature = %draft.signature_hash,
            "pattern upserted"
        );
        Ok(outcome)
    }

    fn record_pattern_hit(&self, id: PatternId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let changed = self.lock()?.execute(
            "UPDATE patterns SET times_seen = times_seen + 1, last_seen = ? WHERE id = ?",
            params![ts(now), id as i64],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("pattern", id));
        }
        Ok(())
    }

    fn get_pattern(&self, id: PatternId) -> Result<Pattern, StoreError> {
        let conn = self.lock()?;
        self.pattern_by_id(&conn, id)
    }

    fn patterns_in_scope(&self, scope: &PatternScope) -> Result<Vec<Pattern>, StoreError> {
        if scope.workspace != self.workspace {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        self.select_patterns(
            &conn,
            "WHERE active AND spec_version = ? AND message_root = ?",
            &[&scope.spec_version, &scope.message_root],
        )
    }

    fn list_patterns(&self, include_inactive: bool) -> Result<Vec<Pattern>, StoreError> {
        let conn = self.lock()?;
        let filter = if include_inactive { "" } else { "WHERE active" };
        self.select_patterns(&conn, filter, &[])
    }

    fn merge_patterns(
        &self,
        draft: &PatternDraft,
        members: &[PatternId],
        now: DateTime<Utc>,
    ) -> Result<Pattern, StoreError> {
        check_workspace(&self.workspace, &draft.scope.workspace)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let folded = members
            .iter()
            .map(|id| self.pattern_by_id(&tx, *id))
            .collect::<Result<Vec<_>, _>>()?;
        let (total, first_seen, examples) = fold_members(&folded);

        let survivor = match self.pattern_by_signature(&tx, draft)? {
            Some(mut p) => {
                p.times_seen = if members.contains(&p.id) {
                    total
                } else {
                    p.times_seen + total
                };
                p.last_seen = now;
                p.active = true;
                p.superseded_by = None;
                if let Some(first) = first_seen {
                    p.first_seen = p.first_seen.min(first);
                }
                p.push_examples(&examples);
                self.save_pattern_counters(&tx, &p)?;
                p
            }
            None => self.new_pattern(
                &tx,
                draft,
                total,
                first_seen.unwrap_or(now),
                now,
                &examples,
            )?,
        };

        for mut p in folded.into_iter().filter(|p| p.id != survivor.id) {
            p.active = false;
            p.superseded_by = Some(survivor.id);
            self.save_pattern_counters(&tx, &p)?;
        }
        tx.commit()?;
        info!(
            survivor = survivor.id,
            merged = members.len(),
            times_seen = survivor.times_seen,
            "patterns consolidated"
        );
        Ok(survivor)
    }

    fn insert_match(&self, m: &mut PatternMatch) -> Result<(), StoreError> {
        check_workspace(&self.workspace, &m.workspace)?;
        let conn = self.lock()?;
        let id = Self::next_id(&conn, "match_ids")?;
        m.id = Some(id as u64);
        let body = serde_json::to_string(&*m)?;
        conn.execute(
            "INSERT INTO pattern_matches (id, run_id, node_fact_id, body) VALUES (?, ?, ?, ?)",
            params![id, m.run_id.to_string(), m.node_fact_id as i64, body],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::DuplicateMatch {
                    run_id: m.run_id,
                    node_fact_id: m.node_fact_id,
                }
            } else {
                StoreError::DuckDb(e)
            }
        })?;
        Ok(())
    }

    fn matches_for_run(&self, run_id: Uuid) -> Result<Vec<PatternMatch>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM pattern_matches WHERE run_id = ? ORDER BY id")?;
        let bodies = stmt
            .query_map(params![run_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bodies
            .iter()
            .map(|b| serde_json::from_str(b))
            .collect::<Result<Vec<_>, _>>()?)
    }

    fn discard_run_results(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let run = run_id.to_string();
        let facts = tx.execute("DELETE FROM node_facts WHERE run_id = ?", params![run])?;
        let matches = tx.execute("DELETE FROM pattern_matches WHERE run_id = ?", params![run])?;
        tx.commit()?;
        Ok(facts + matches)
    }
}
