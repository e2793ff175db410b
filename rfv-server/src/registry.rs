//! Association registry: which VM is paired with which datapath, and how
//! each VM port maps to a virtual switch port and a datapath port.
//!
//! One row per port. A row is mapped when all six association fields are
//! set. The mapping fields (`vm_port`, `vs_id`, `vs_port`, `dp_port`) are
//! either all set or all empty; writes that break this are rejected.

use chrono::Utc;
use rfv_proto::{DpId, ErrorKind, VmId};
use serde::Serialize;
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt record {id}: {field}={value}")]
    Corrupt {
        id: String,
        field: &'static str,
        value: String,
    },

    #[error("Partial mapping in record {0}")]
    PartialMapping(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Database(_) => ErrorKind::TransportUnavailable,
            RegistryError::NotFound(_) => ErrorKind::StaleDirective,
            RegistryError::Corrupt { .. } | RegistryError::PartialMapping(_) => {
                ErrorKind::MalformedField
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// One row of the association table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociationRecord {
    pub id: String,
    pub vm_id: Option<VmId>,
    pub vm_port: Option<u32>,
    pub vs_id: Option<DpId>,
    pub vs_port: Option<u32>,
    pub dp_id: Option<DpId>,
    pub dp_port: Option<u32>,
}

impl Default for AssociationRecord {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            vm_id: None,
            vm_port: None,
            vs_id: None,
            vs_port: None,
            dp_id: None,
            dp_port: None,
        }
    }
}

impl AssociationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_vm(vm_id: VmId) -> Self {
        Self {
            vm_id: Some(vm_id),
            ..Self::default()
        }
    }

    pub fn for_datapath(dp_id: DpId, vm_id: Option<VmId>) -> Self {
        Self {
            dp_id: Some(dp_id),
            vm_id,
            ..Self::default()
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.vm_id.is_some()
            && self.dp_id.is_some()
            && self.vm_port.is_some()
            && self.vs_id.is_some()
            && self.vs_port.is_some()
            && self.dp_port.is_some()
    }

    pub fn is_idle_vm(&self) -> bool {
        self.vm_id.is_some() && self.dp_id.is_none()
    }

    pub fn is_idle_dp(&self) -> bool {
        self.dp_id.is_some() && self.vm_id.is_none()
    }

    /// Mapping fields all set or all empty.
    pub fn mapping_consistent(&self) -> bool {
        let set = [
            self.vm_port.is_some(),
            self.vs_id.is_some(),
            self.vs_port.is_some(),
            self.dp_port.is_some(),
        ];
        set.iter().all(|s| *s) || set.iter().all(|s| !*s)
    }

    pub fn clear_mapping(&mut self) {
        self.vm_port = None;
        self.vs_id = None;
        self.vs_port = None;
        self.dp_port = None;
    }
}

/// Constraint on one field of a registry query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldFilter<T> {
    #[default]
    Any,
    Empty,
    Present,
    Eq(T),
}

/// Conjunction of per-field filters.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub vm_id: FieldFilter<VmId>,
    pub vm_port: FieldFilter<u32>,
    pub vs_id: FieldFilter<DpId>,
    pub vs_port: FieldFilter<u32>,
    pub dp_id: FieldFilter<DpId>,
    pub dp_port: FieldFilter<u32>,
}

impl RecordQuery {
    pub fn vm(vm_id: VmId) -> Self {
        Self {
            vm_id: FieldFilter::Eq(vm_id),
            ..Self::default()
        }
    }

    pub fn datapath(dp_id: DpId) -> Self {
        Self {
            dp_id: FieldFilter::Eq(dp_id),
            ..Self::default()
        }
    }
}

fn push_id_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, filter: FieldFilter<u64>) {
    match filter {
        FieldFilter::Any => {}
        FieldFilter::Empty => {
            qb.push(format!(" AND {column} IS NULL"));
        }
        FieldFilter::Present => {
            qb.push(format!(" AND {column} IS NOT NULL"));
        }
        FieldFilter::Eq(v) => {
            qb.push(format!(" AND {column} = "));
            qb.push_bind(v.to_string());
        }
    }
}

fn push_port_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, filter: FieldFilter<u32>) {
    match filter {
        FieldFilter::Any => {}
        FieldFilter::Empty => {
            qb.push(format!(" AND {column} IS NULL"));
        }
        FieldFilter::Present => {
            qb.push(format!(" AND {column} IS NOT NULL"));
        }
        FieldFilter::Eq(v) => {
            qb.push(format!(" AND {column} = "));
            qb.push_bind(i64::from(v));
        }
    }
}

/// SQLite-backed association table.
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rftable (
                id TEXT PRIMARY KEY,
                vm_id TEXT,
                vm_port INTEGER,
                vs_id TEXT,
                vs_port INTEGER,
                dp_id TEXT,
                dp_port INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rftable_vm ON rftable(vm_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rftable_dp ON rftable(dp_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Records matching `query`, in insertion order.
    pub async fn get_entries(&self, query: &RecordQuery) -> Result<Vec<AssociationRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, vm_id, vm_port, vs_id, vs_port, dp_id, dp_port FROM rftable WHERE 1 = 1",
        );
        push_id_filter(&mut qb, "vm_id", query.vm_id);
        push_port_filter(&mut qb, "vm_port", query.vm_port);
        push_id_filter(&mut qb, "vs_id", query.vs_id);
        push_port_filter(&mut qb, "vs_port", query.vs_port);
        push_id_filter(&mut qb, "dp_id", query.dp_id);
        push_port_filter(&mut qb, "dp_port", query.dp_port);
        qb.push(" ORDER BY rowid");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn get_entry(&self, id: &str) -> Result<AssociationRecord> {
        let row = sqlx::query(
            "SELECT id, vm_id, vm_port, vs_id, vs_port, dp_id, dp_port FROM rftable WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    pub async fn all(&self) -> Result<Vec<AssociationRecord>> {
        self.get_entries(&RecordQuery::default()).await
    }

    /// Inserts the record or replaces the one with the same id.
    pub async fn set_entry(&self, record: &AssociationRecord) -> Result<()> {
        if !record.mapping_consistent() {
            return Err(RegistryError::PartialMapping(record.id.clone()));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO rftable (id, vm_id, vm_port, vs_id, vs_port, dp_id, dp_port, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                vm_id = excluded.vm_id,
                vm_port = excluded.vm_port,
                vs_id = excluded.vs_id,
                vs_port = excluded.vs_port,
                dp_id = excluded.dp_id,
                dp_port = excluded.dp_port,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(record.vm_id.map(|v| v.to_string()))
        .bind(record.vm_port.map(i64::from))
        .bind(record.vs_id.map(|v| v.to_string()))
        .bind(record.vs_port.map(i64::from))
        .bind(record.dp_id.map(|v| v.to_string()))
        .bind(record.dp_port.map(i64::from))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_entry(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM rftable WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM rftable").execute(&self.pool).await?;
        Ok(())
    }

    /// Binds every idle row of `dp_id` to `vm_id`. Returns the number of
    /// rows claimed; zero if another VM got there first.
    pub async fn claim_idle_datapath(&self, dp_id: DpId, vm_id: VmId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE rftable SET vm_id = ?, updated_at = ? WHERE dp_id = ? AND vm_id IS NULL",
        )
        .bind(vm_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(dp_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Blanks the mapping fields of every row bound to `vm_id`.
    pub async fn reset_mapping_for_vm(&self, vm_id: VmId) -> Result<u64> {
        self.reset_mapping("vm_id = ?", vm_id.to_string(), None).await
    }

    /// Blanks the mapping fields of every row bound to `dp_id`, keeping the
    /// VM pairing.
    pub async fn reset_mapping_for_dp(&self, dp_id: DpId) -> Result<u64> {
        self.reset_mapping("dp_id = ?", dp_id.to_string(), None).await
    }

    /// Blanks the mapping of the row at (`dp_id`, `dp_port`).
    pub async fn reset_mapping_for_dp_port(&self, dp_id: DpId, dp_port: u32) -> Result<u64> {
        self.reset_mapping("dp_id = ? AND dp_port = ?", dp_id.to_string(), Some(dp_port))
            .await
    }

    async fn reset_mapping(&self, filter: &str, id: String, port: Option<u32>) -> Result<u64> {
        let sql = format!(
            "UPDATE rftable SET vm_port = NULL, vs_id = NULL, vs_port = NULL, dp_port = NULL, updated_at = ? WHERE {filter}"
        );
        let mut query = sqlx::query(&sql).bind(Utc::now().to_rfc3339()).bind(id);
        if let Some(port) = port {
            query = query.bind(i64::from(port));
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Sets all four mapping fields of `id` at once, provided the row is
    /// still unmapped. Returns false when the row was mapped meanwhile.
    pub async fn fill_mapping(
        &self,
        id: &str,
        vm_port: u32,
        vs_id: DpId,
        vs_port: u32,
        dp_port: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rftable
            SET vm_port = ?, vs_id = ?, vs_port = ?, dp_port = ?, updated_at = ?
            WHERE id = ? AND vs_id IS NULL
            "#,
        )
        .bind(i64::from(vm_port))
        .bind(vs_id.to_string())
        .bind(i64::from(vs_port))
        .bind(i64::from(dp_port))
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn parse_id(row: &SqliteRow, id: &str, field: &'static str) -> Result<Option<u64>> {
    let raw: Option<String> = row.get(field);
    raw.map(|s| {
        s.parse::<u64>().map_err(|_| RegistryError::Corrupt {
            id: id.to_string(),
            field,
            value: s.clone(),
        })
    })
    .transpose()
}

fn parse_port(row: &SqliteRow, id: &str, field: &'static str) -> Result<Option<u32>> {
    let raw: Option<i64> = row.get(field);
    raw.map(|v| {
        u32::try_from(v).map_err(|_| RegistryError::Corrupt {
            id: id.to_string(),
            field,
            value: v.to_string(),
        })
    })
    .transpose()
}

fn row_to_record(row: &SqliteRow) -> Result<AssociationRecord> {
    let id: String = row.get("id");
    Ok(AssociationRecord {
        vm_id: parse_id(row, &id, "vm_id")?,
        vm_port: parse_port(row, &id, "vm_port")?,
        vs_id: parse_id(row, &id, "vs_id")?,
        vs_port: parse_port(row, &id, "vs_port")?,
        dp_id: parse_id(row, &id, "dp_id")?,
        dp_port: parse_port(row, &id, "dp_port")?,
        id,
    })
}
