use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    PgPool, Postgres, Row,
    postgres::{PgArguments, PgExecutor, PgRow},
};

use crate::{
    Document, Fields, NativeOp, OrderDirection, Query, Result, StoreError,
    store::{BulkWriteResult, DocumentStore, StoreTransaction, WriteOp, check_write_ceiling},
};

/// SQLSTATE codes Postgres raises when a serializable transaction loses a race.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// PostgreSQL-backed document store implementation.
///
/// Documents live in a single `documents` table keyed by `(collection, id)`
/// with the body in a JSONB column. Transactions run at SERIALIZABLE
/// isolation, so a lost race surfaces as `StoreError::Aborted` on commit.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Creates a new PostgreSQL document store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

/// Maps lost serializable races to `Aborted`; everything else stays a database error.
fn map_db_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = error
        && matches!(
            db_err.code().as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
        )
    {
        return StoreError::Aborted(db_err.message().to_string());
    }
    StoreError::Database(error)
}

fn row_to_document(row: PgRow) -> Result<Document> {
    let data: Value = row.try_get("data")?;
    let fields = match data {
        Value::Object(map) => map,
        _ => Fields::new(),
    };

    Ok(Document {
        id: row.try_get("id")?,
        fields,
        version: row.try_get("version")?,
        update_time: row.try_get("updated_at")?,
    })
}

enum Bind {
    Text(String),
    Json(Value),
    Int(i64),
}

/// Accumulates positional parameters while the SQL text is assembled.
#[derive(Default)]
struct SqlBuilder {
    sql: String,
    binds: Vec<Bind>,
}

impl SqlBuilder {
    fn push(&mut self, bind: Bind) -> String {
        self.binds.push(bind);
        format!("${}", self.binds.len())
    }

    fn where_clause(&mut self, query: &Query) {
        let collection = self.push(Bind::Text(query.collection.clone()));
        self.sql.push_str(&format!(" WHERE collection = {collection}"));

        for filter in &query.filters {
            let field = self.push(Bind::Text(filter.field.clone()));
            let value = self.push(Bind::Json(filter.value.clone()));
            let target = format!("data->{field}");

            let predicate = match filter.op {
                NativeOp::Equal => format!("{target} = {value}"),
                NativeOp::NotEqual => format!("{target} IS NOT NULL AND {target} <> {value}"),
                NativeOp::GreaterThan
                | NativeOp::GreaterThanOrEqual
                | NativeOp::LessThan
                | NativeOp::LessThanOrEqual => format!(
                    "jsonb_typeof({target}) = jsonb_typeof({value}) AND {target} {} {value}",
                    filter.op
                ),
                NativeOp::In => {
                    format!("{target} IS NOT NULL AND {value} @> jsonb_build_array({target})")
                }
                NativeOp::NotIn => format!(
                    "{target} IS NOT NULL AND NOT ({value} @> jsonb_build_array({target}))"
                ),
                NativeOp::ArrayContains => format!(
                    "jsonb_typeof({target}) = 'array' AND {target} @> jsonb_build_array({value})"
                ),
                NativeOp::ArrayContainsAny => format!(
                    "jsonb_typeof({target}) = 'array' AND EXISTS (SELECT 1 FROM jsonb_array_elements({value}) AS e WHERE {target} @> jsonb_build_array(e.value))"
                ),
            };
            self.sql.push_str(&format!(" AND ({predicate})"));
        }
    }

    fn order_and_page(&mut self, query: &Query) {
        let mut clauses = Vec::new();
        for order in &query.order_by {
            let field = self.push(Bind::Text(order.field.clone()));
            self.sql
                .push_str(&format!(" AND data->{field} IS NOT NULL"));
            let direction = match order.direction {
                OrderDirection::Ascending => "ASC",
                OrderDirection::Descending => "DESC",
            };
            clauses.push(format!("data->{field} {direction}"));
        }
        clauses.push("id ASC".to_string());
        self.sql.push_str(&format!(" ORDER BY {}", clauses.join(", ")));

        if let Some(limit) = query.limit {
            let limit = self.push(Bind::Int(limit as i64));
            self.sql.push_str(&format!(" LIMIT {limit}"));
        }
        if query.offset > 0 {
            let offset = self.push(Bind::Int(query.offset as i64));
            self.sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    fn select(query: &Query, columns: &str) -> Self {
        let mut builder = Self {
            sql: format!("SELECT {columns} FROM documents"),
            binds: Vec::new(),
        };
        builder.where_clause(query);
        builder.order_and_page(query);
        builder
    }

    fn count(query: &Query) -> Self {
        let mut builder = Self {
            sql: "SELECT COUNT(*) FROM documents".to_string(),
            binds: Vec::new(),
        };
        builder.where_clause(query);
        builder
    }

    fn build(&self) -> sqlx::query::Query<'_, Postgres, PgArguments> {
        let mut q = sqlx::query(&self.sql);
        for bind in &self.binds {
            q = match bind {
                Bind::Text(s) => q.bind(s.clone()),
                Bind::Json(v) => q.bind(v.clone()),
                Bind::Int(i) => q.bind(*i),
            };
        }
        q
    }
}

async fn fetch_one_document<'e, E: PgExecutor<'e>>(
    executor: E,
    collection: &str,
    id: &str,
) -> Result<Option<Document>> {
    let row: Option<PgRow> = sqlx::query(
        r#"
        SELECT id, data, version, updated_at
        FROM documents
        WHERE collection = $1 AND id = $2
        "#,
    )
    .bind(collection)
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(map_db_error)?;

    row.map(row_to_document).transpose()
}

async fn fetch_documents<'e, E: PgExecutor<'e>>(executor: E, query: &Query) -> Result<Vec<Document>> {
    query.validate()?;
    let builder = SqlBuilder::select(query, "id, data, version, updated_at");
    let rows = builder
        .build()
        .fetch_all(executor)
        .await
        .map_err(map_db_error)?;
    rows.into_iter().map(row_to_document).collect()
}

async fn execute_op<'e, E: PgExecutor<'e>>(executor: E, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::Create {
            collection,
            id,
            fields,
        } => {
            let result = sqlx::query(
                r#"
                INSERT INTO documents (collection, id, data, version, updated_at)
                VALUES ($1, $2, $3, nextval('document_revisions'), NOW())
                ON CONFLICT (collection, id) DO NOTHING
                "#,
            )
            .bind(collection)
            .bind(id)
            .bind(Value::Object(fields.clone()))
            .execute(executor)
            .await
            .map_err(map_db_error)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::AlreadyExists {
                    collection: collection.clone(),
                    id: id.clone(),
                });
            }
        }
        WriteOp::Update {
            collection,
            id,
            fields,
        } => {
            let result = sqlx::query(
                r#"
                UPDATE documents
                SET data = data || $3, version = nextval('document_revisions'), updated_at = NOW()
                WHERE collection = $1 AND id = $2
                "#,
            )
            .bind(collection)
            .bind(id)
            .bind(Value::Object(fields.clone()))
            .execute(executor)
            .await
            .map_err(map_db_error)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    collection: collection.clone(),
                    id: id.clone(),
                });
            }
        }
        WriteOp::Delete { collection, id } => {
            sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .execute(executor)
                .await
                .map_err(map_db_error)?;
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        fetch_one_document(&self.pool, collection, id).await
    }

    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        let op = WriteOp::Create {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        };
        execute_op(&self.pool, &op).await
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        execute_op(&self.pool, &WriteOp::update(collection, id, fields)).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        execute_op(&self.pool, &WriteOp::delete(collection, id)).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        fetch_documents(&self.pool, query).await
    }

    async fn count(&self, query: &Query) -> Result<u64> {
        query.validate()?;
        let builder = SqlBuilder::count(query);
        let row = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkWriteResult> {
        let outcomes =
            futures_util::future::join_all(ops.iter().map(|op| execute_op(&self.pool, op))).await;

        let mut result = BulkWriteResult::default();
        for (op, outcome) in ops.iter().zip(outcomes) {
            match outcome {
                Ok(()) => result.succeeded += 1,
                Err(e) => result.failures.push((op.id().to_string(), e)),
            }
        }
        Ok(result)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;

        Ok(Box::new(PostgresTransaction { tx, writes: 0 }))
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    writes: usize,
}

impl PostgresTransaction {
    async fn stage(&mut self, op: WriteOp) -> Result<()> {
        check_write_ceiling(self.writes)?;
        execute_op(&mut *self.tx, &op).await?;
        self.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn get(&mut self, collection: &str, id: &str) -> Result<Option<Document>> {
        fetch_one_document(&mut *self.tx, collection, id).await
    }

    async fn query(&mut self, query: &Query) -> Result<Vec<Document>> {
        fetch_documents(&mut *self.tx, query).await
    }

    async fn query_refs(&mut self, query: &Query) -> Result<Vec<String>> {
        query.validate()?;
        let builder = SqlBuilder::select(query, "id");
        let rows = builder
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn create(&mut self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.stage(WriteOp::Create {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        })
        .await
    }

    async fn update(&mut self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.stage(WriteOp::update(collection, id, fields)).await
    }

    async fn delete(&mut self, collection: &str, id: &str) -> Result<()> {
        self.stage(WriteOp::delete(collection, id)).await
    }

    fn write_count(&self) -> usize {
        self.writes
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await.map_err(|e| {
            let err = map_db_error(e);
            if matches!(err, StoreError::Aborted(_)) {
                tracing::debug!("serializable transaction lost a race on commit");
            }
            err
        })
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.rollback().await.map_err(map_db_error)
    }
}
