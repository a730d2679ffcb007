//! 审计记录与工作流历史
//!
//! 每个工作流结束（成功或失败）后，协调器生成一条 AuditRecord 交给审计出口；写入在阻塞线程池中完成，失败只记日志。
//! WorkflowHistory 是基于 SQLite 的实现，另提供最近记录、条件检索、过期清理与统计。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// 一个工作流的审计记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    /// completed / failed
    pub status: String,
    pub machine_id: Option<String>,
    pub final_output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub step_count: usize,
    pub metadata: Map<String, Value>,
}

/// 审计出口；record 失败只记日志，不影响工作流结果
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), String>;
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 历史表中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub status: String,
    pub machine_id: Option<String>,
    pub final_output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub step_count: usize,
    pub metadata: Value,
}

/// 检索条件，字段均可选
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// 查询文本包含（不区分大小写）
    pub query_contains: Option<String>,
    pub status: Option<String>,
    pub machine_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total_workflows: u64,
    pub status_counts: BTreeMap<String, u64>,
    pub average_duration_ms: Option<f64>,
    pub oldest_record: Option<DateTime<Utc>>,
    pub newest_record: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "id, workflow_id, timestamp, query, status, machine_id, final_output, error, duration_ms, step_count, metadata";

/// SQLite 工作流历史
pub struct WorkflowHistory {
    conn: Mutex<Connection>,
}

impl WorkflowHistory {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workflow_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                query TEXT NOT NULL,
                status TEXT NOT NULL,
                machine_id TEXT,
                final_output TEXT,
                error TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                step_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON workflow_history(timestamp);
            CREATE INDEX IF NOT EXISTS idx_history_status ON workflow_history(status);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 写入一条记录，返回行 id
    pub fn log(&self, record: &AuditRecord) -> Result<i64, HistoryError> {
        let conn = self.lock();
        let metadata = Value::Object(record.metadata.clone()).to_string();
        conn.execute(
            "INSERT INTO workflow_history
                (workflow_id, timestamp, query, status, machine_id, final_output, error, duration_ms, step_count, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.workflow_id,
                record.timestamp,
                record.query,
                record.status,
                record.machine_id,
                record.final_output,
                record.error,
                record.duration_ms as i64,
                record.step_count as i64,
                metadata,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 最近的记录，最新在前
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.search(&HistoryFilter {
            limit: Some(limit),
            ..HistoryFilter::default()
        })
    }

    pub fn search(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut sql = format!("SELECT {} FROM workflow_history WHERE 1=1", COLUMNS);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(q) = &filter.query_contains {
            args.push(Box::new(format!("%{}%", escape_like(&q.to_lowercase()))));
            sql.push_str(&format!(" AND LOWER(query) LIKE ?{} ESCAPE '\\'", args.len()));
        }
        if let Some(status) = &filter.status {
            args.push(Box::new(status.clone()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(machine) = &filter.machine_id {
            args.push(Box::new(machine.clone()));
            sql.push_str(&format!(" AND machine_id = ?{}", args.len()));
        }
        if let Some(since) = filter.since {
            args.push(Box::new(since));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_entry,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// 删除早于 retention_days 天的记录，返回删除条数
    pub fn cleanup_older_than(&self, retention_days: i64) -> Result<usize, HistoryError> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let removed = self.lock().execute(
            "DELETE FROM workflow_history WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "workflow history cleaned up");
        }
        Ok(removed)
    }

    pub fn statistics(&self) -> Result<HistoryStats, HistoryError> {
        let conn = self.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM workflow_history", [], |r| r.get(0))?;

        let mut status_counts = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM workflow_history GROUP BY status")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (status, count) = row?;
                status_counts.insert(status, count as u64);
            }
        }

        let average_duration_ms: Option<f64> =
            conn.query_row("SELECT AVG(duration_ms) FROM workflow_history", [], |r| r.get(0))?;
        let (oldest_record, newest_record): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = conn
            .query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM workflow_history",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;

        Ok(HistoryStats {
            total_workflows: total as u64,
            status_counts,
            average_duration_ms,
            oldest_record,
            newest_record,
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let metadata: String = row.get(10)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        timestamp: row.get(2)?,
        query: row.get(3)?,
        status: row.get(4)?,
        machine_id: row.get(5)?,
        final_output: row.get(6)?,
        error: row.get(7)?,
        duration_ms: row.get::<_, i64>(8)?.max(0) as u64,
        step_count: row.get::<_, i64>(9)?.max(0) as usize,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    })
}

impl AuditSink for WorkflowHistory {
    fn record(&self, record: &AuditRecord) -> Result<(), String> {
        self.log(record).map(|_| ()).map_err(|e| e.to_string())
    }
}

/// 转义 LIKE 通配符，使 % 与 _ 按字面匹配
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
