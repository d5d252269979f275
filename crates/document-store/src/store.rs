use async_trait::async_trait;

use crate::{Document, Fields, Query, Result, StoreError};

/// Hard ceiling on the number of writes a single transaction may carry.
pub const MAX_TRANSACTION_WRITES: usize = 500;

/// A single mutation, used by bulk writes and transactional batches.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a new document; fails if the ID is taken.
    Create {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Merge top-level fields into an existing document; fails if absent.
    Update {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Remove a document. Removing an absent document is not an error.
    Delete { collection: String, id: String },
}

impl WriteOp {
    pub fn update(collection: impl Into<String>, id: impl Into<String>, fields: Fields) -> Self {
        WriteOp::Update {
            collection: collection.into(),
            id: id.into(),
            fields,
        }
    }

    pub fn delete(collection: impl Into<String>, id: impl Into<String>) -> Self {
        WriteOp::Delete {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Returns the target document ID.
    pub fn id(&self) -> &str {
        match self {
            WriteOp::Create { id, .. } | WriteOp::Update { id, .. } | WriteOp::Delete { id, .. } => {
                id
            }
        }
    }

    /// Returns the target collection.
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Create { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

/// Per-item outcome of an unordered bulk write.
#[derive(Debug, Default)]
pub struct BulkWriteResult {
    /// Number of operations that were applied.
    pub succeeded: usize,

    /// Operations that failed, keyed by document ID.
    pub failures: Vec<(String, StoreError)>,
}

/// Core trait for document store implementations.
///
/// A document store keeps schemaless JSON documents grouped in named
/// collections and answers filtered, ordered, paginated queries over them.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Generates a fresh document ID.
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Reads a document. Returns None if it does not exist.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Inserts a new document.
    ///
    /// Fails with `AlreadyExists` if the ID is taken.
    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Merges top-level fields into an existing document.
    ///
    /// Fails with `NotFound` if the document does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Removes a document. Removing an absent document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Runs a query and returns the matching documents.
    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Counts matching documents using the store's native aggregation.
    ///
    /// Ordering, limit and offset on the query are ignored.
    async fn count(&self, query: &Query) -> Result<u64>;

    /// Applies independent writes with no ordering guarantee between them.
    ///
    /// A failing item does not stop the others; failures are reported per item.
    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkWriteResult>;

    /// Opens a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// An open, all-or-nothing transaction.
///
/// Writes become visible to other readers only on `commit`. A commit fails
/// with `StoreError::Aborted` when a concurrent writer invalidated something
/// this transaction read. Transactions do not offer a count aggregation;
/// callers count the references returned by `query_refs`.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Reads a document within the transaction.
    async fn get(&mut self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Runs a query within the transaction.
    async fn query(&mut self, query: &Query) -> Result<Vec<Document>>;

    /// Returns only the IDs of the documents matching a query.
    async fn query_refs(&mut self, query: &Query) -> Result<Vec<String>>;

    /// Stages a document insert.
    async fn create(&mut self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Stages a top-level merge into an existing document.
    async fn update(&mut self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Stages a document removal.
    async fn delete(&mut self, collection: &str, id: &str) -> Result<()>;

    /// Number of writes staged so far.
    fn write_count(&self) -> usize;

    /// Commits every staged write atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every staged write.
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Stages a write described as a [`WriteOp`].
    async fn apply(&mut self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::Create {
                collection,
                id,
                fields,
            } => self.create(&collection, &id, fields).await,
            WriteOp::Update {
                collection,
                id,
                fields,
            } => self.update(&collection, &id, fields).await,
            WriteOp::Delete { collection, id } => self.delete(&collection, &id).await,
        }
    }
}

/// Rejects a write that would push a transaction past the ceiling.
pub fn check_write_ceiling(staged: usize) -> Result<()> {
    if staged >= MAX_TRANSACTION_WRITES {
        return Err(StoreError::InvalidArgument(format!(
            "transaction exceeds {MAX_TRANSACTION_WRITES} writes"
        )));
    }
    Ok(())
}
