use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    Document, Fields, Query, Result, StoreError,
    store::{BulkWriteResult, DocumentStore, StoreTransaction, WriteOp, check_write_ceiling},
};

#[derive(Debug, Clone)]
struct StoredDocument {
    fields: Fields,
    version: i64,
    update_time: DateTime<Utc>,
}

type Collection = BTreeMap<String, StoredDocument>;

/// Staged state of each document a transaction wrote; `None` marks a delete.
type Overlay = BTreeMap<String, Option<StoredDocument>>;

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, Collection>,
    revision: i64,
}

impl MemoryState {
    fn next_revision(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }

    fn version_of(&self, collection: &str, id: &str) -> i64 {
        self.collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|d| d.version)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
struct IndexConfig {
    enforce: bool,
    indexes: HashSet<(String, Vec<String>)>,
}

impl IndexConfig {
    fn check(&self, query: &Query) -> Result<()> {
        if !self.enforce || !query.needs_composite_index() {
            return Ok(());
        }
        let fields = query.index_fields();
        if self
            .indexes
            .contains(&(query.collection.clone(), fields.clone()))
        {
            return Ok(());
        }
        Err(StoreError::FailedPrecondition(format!(
            "The query requires an index on {}({})",
            query.collection,
            fields.join(", ")
        )))
    }
}

/// In-memory document store implementation for testing and local runs.
///
/// Provides the same interface and transactional semantics as the
/// PostgreSQL implementation. Composite-index enforcement is opt-in so that
/// index-dependent fallbacks can be exercised without a real backend.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<RwLock<MemoryState>>,
    index_config: Arc<IndexConfig>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDocumentStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes filter+order queries fail unless a matching composite index
    /// has been declared.
    pub fn require_composite_indexes(mut self) -> Self {
        Arc::make_mut(&mut self.index_config).enforce = true;
        self
    }

    /// Declares a composite index over `fields` (filter fields first, then
    /// ordered fields, in query order).
    pub fn with_composite_index(mut self, collection: &str, fields: &[&str]) -> Self {
        Arc::make_mut(&mut self.index_config).indexes.insert((
            collection.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        ));
        self
    }

    /// Simulates the backend becoming unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the number of documents in a collection.
    pub async fn document_count(&self, collection: &str) -> usize {
        self.state
            .read()
            .await
            .collections
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Clears all documents.
    pub async fn clear(&self) {
        self.state.write().await.collections.clear();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

fn to_document(id: &str, stored: &StoredDocument) -> Document {
    Document {
        id: id.to_string(),
        fields: stored.fields.clone(),
        version: stored.version,
        update_time: stored.update_time,
    }
}

fn apply_op(
    collection: &mut Collection,
    op: &WriteOp,
    revision: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    match op {
        WriteOp::Create {
            collection: name,
            id,
            fields,
        } => {
            if collection.contains_key(id) {
                return Err(StoreError::AlreadyExists {
                    collection: name.clone(),
                    id: id.clone(),
                });
            }
            collection.insert(
                id.clone(),
                StoredDocument {
                    fields: fields.clone(),
                    version: revision,
                    update_time: now,
                },
            );
        }
        WriteOp::Update {
            collection: name,
            id,
            fields,
        } => {
            let stored = collection.get_mut(id).ok_or_else(|| StoreError::NotFound {
                collection: name.clone(),
                id: id.clone(),
            })?;
            for (key, value) in fields {
                stored.fields.insert(key.clone(), value.clone());
            }
            stored.version = revision;
            stored.update_time = now;
        }
        WriteOp::Delete { id, .. } => {
            collection.remove(id);
        }
    }
    Ok(())
}

/// Runs `query` over documents supplied in ID order.
fn run_query<'a>(
    docs: impl IntoIterator<Item = (&'a String, &'a StoredDocument)>,
    query: &Query,
) -> Vec<Document> {
    let mut matched: Vec<(&String, &StoredDocument)> = docs
        .into_iter()
        .filter(|(_, doc)| query.filters.iter().all(|f| f.matches(&doc.fields)))
        .filter(|(_, doc)| query.has_order_fields(&doc.fields))
        .collect();

    // Stable sort keeps ID order between equal keys
    if !query.order_by.is_empty() {
        matched.sort_by(|(_, a), (_, b)| query.compare_documents(&a.fields, &b.fields));
    }

    let limit = query.limit.unwrap_or(usize::MAX);
    matched
        .into_iter()
        .skip(query.offset)
        .take(limit)
        .map(|(id, doc)| to_document(id, doc))
        .collect()
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|doc| to_document(id, doc)))
    }

    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let revision = state.next_revision();
        let op = WriteOp::Create {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        };
        let docs = state.collections.entry(collection.to_string()).or_default();
        apply_op(docs, &op, revision, Utc::now())
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let revision = state.next_revision();
        let op = WriteOp::update(collection, id, fields);
        let docs = state.collections.entry(collection.to_string()).or_default();
        apply_op(docs, &op, revision, Utc::now())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(docs) = state.collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.check_available()?;
        query.validate()?;
        self.index_config.check(query)?;
        let state = self.state.read().await;
        Ok(run_query(
            state.collections.get(&query.collection).into_iter().flatten(),
            query,
        ))
    }

    async fn count(&self, query: &Query) -> Result<u64> {
        self.check_available()?;
        query.validate()?;
        let state = self.state.read().await;
        let count = state
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| query.filters.iter().all(|f| f.matches(&doc.fields)))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkWriteResult> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let mut result = BulkWriteResult::default();
        let now = Utc::now();

        for op in ops {
            let revision = state.next_revision();
            let docs = state
                .collections
                .entry(op.collection().to_string())
                .or_default();
            match apply_op(docs, &op, revision, now) {
                Ok(()) => result.succeeded += 1,
                Err(e) => result.failures.push((op.id().to_string(), e)),
            }
        }

        Ok(result)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.check_available()?;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            reads: HashMap::new(),
            writes: Vec::new(),
            staged: HashMap::new(),
            scans: Vec::new(),
        }))
    }
}

/// Optimistic transaction over an [`InMemoryDocumentStore`].
///
/// Reads record the committed revision of each document they touch; writes
/// are staged and replayed over the committed state at commit time. Reads
/// inside the transaction observe its own staged writes through an overlay
/// holding the latest staged state of each written document.
///
/// Queries also record which committed documents matched, so a concurrent
/// insert into a queried range aborts the commit like a changed read does.
struct MemoryTransaction {
    store: InMemoryDocumentStore,
    reads: HashMap<(String, String), i64>,
    writes: Vec<WriteOp>,
    staged: HashMap<String, Overlay>,
    scans: Vec<(Query, Vec<(String, i64)>)>,
}

/// IDs and versions of the committed documents `query` matches.
fn scan(state: &MemoryState, query: &Query) -> Vec<(String, i64)> {
    run_query(state.collections.get(&query.collection).into_iter().flatten(), query)
        .into_iter()
        .map(|doc| (doc.id, doc.version))
        .collect()
}

impl MemoryTransaction {
    /// The document as this transaction sees it.
    fn current(&self, state: &MemoryState, collection: &str, id: &str) -> Option<StoredDocument> {
        match self.staged.get(collection).and_then(|docs| docs.get(id)) {
            Some(staged) => staged.clone(),
            None => state
                .collections
                .get(collection)
                .and_then(|docs| docs.get(id))
                .cloned(),
        }
    }

    /// Committed collection with the overlay on top, in ID order.
    fn visible<'a>(
        &'a self,
        state: &'a MemoryState,
        collection: &str,
    ) -> Vec<(&'a String, &'a StoredDocument)> {
        let committed = state.collections.get(collection).into_iter().flatten();
        let Some(overlay) = self.staged.get(collection) else {
            return committed.collect();
        };

        let mut docs: Vec<(&String, &StoredDocument)> = committed
            .filter(|(id, _)| !overlay.contains_key(*id))
            .chain(
                overlay
                    .iter()
                    .filter_map(|(id, doc)| doc.as_ref().map(|doc| (id, doc))),
            )
            .collect();
        docs.sort_by(|(a, _), (b, _)| a.cmp(b));
        docs
    }

    fn record_read(&mut self, state: &MemoryState, collection: &str, id: &str) {
        self.reads
            .entry((collection.to_string(), id.to_string()))
            .or_insert_with(|| state.version_of(collection, id));
    }

    /// Validates `op` against the document it targets and records the result
    /// in the overlay.
    async fn stage(&mut self, op: WriteOp) -> Result<()> {
        self.store.check_available()?;
        check_write_ceiling(self.writes.len())?;

        let store = self.store.clone();
        let state = store.state.read().await;
        let revision = state.revision + 1;
        let mut target: Collection = self
            .current(&state, op.collection(), op.id())
            .map(|doc| (op.id().to_string(), doc))
            .into_iter()
            .collect();
        drop(state);

        apply_op(&mut target, &op, revision, Utc::now())?;
        self.staged
            .entry(op.collection().to_string())
            .or_default()
            .insert(op.id().to_string(), target.remove(op.id()));
        self.writes.push(op);
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get(&mut self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.store.check_available()?;
        let store = self.store.clone();
        let state = store.state.read().await;
        self.record_read(&state, collection, id);
        Ok(self
            .current(&state, collection, id)
            .map(|doc| to_document(id, &doc)))
    }

    async fn query(&mut self, query: &Query) -> Result<Vec<Document>> {
        self.store.check_available()?;
        query.validate()?;
        self.store.index_config.check(query)?;

        let store = self.store.clone();
        let state = store.state.read().await;
        let results = run_query(self.visible(&state, &query.collection), query);
        for doc in &results {
            self.record_read(&state, &query.collection, &doc.id);
        }
        self.scans.push((query.clone(), scan(&state, query)));
        Ok(results)
    }

    async fn query_refs(&mut self, query: &Query) -> Result<Vec<String>> {
        let docs = self.query(query).await?;
        Ok(docs.into_iter().map(|d| d.id).collect())
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
        self.writes.len()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.store.check_available()?;
        let mut state = self.store.state.write().await;

        for ((collection, id), seen) in &self.reads {
            if state.version_of(collection, id) != *seen {
                tracing::debug!(%collection, %id, "transaction read set changed, aborting");
                return Err(StoreError::Aborted(format!(
                    "document {collection}/{id} changed since it was read"
                )));
            }
        }
        for (query, seen) in &self.scans {
            if scan(&state, query) != *seen {
                tracing::debug!(collection = %query.collection, "transaction query results changed, aborting");
                return Err(StoreError::Aborted(format!(
                    "query results on {} changed since they were read",
                    query.collection
                )));
            }
        }

        // Replay onto copies so a failing write leaves committed state untouched
        let revision = state.next_revision();
        let now = Utc::now();
        let mut touched: HashMap<String, Collection> = HashMap::new();
        for op in &self.writes {
            let docs = touched
                .entry(op.collection().to_string())
                .or_insert_with(|| {
                    state
                        .collections
                        .get(op.collection())
                        .cloned()
                        .unwrap_or_default()
                });
            apply_op(docs, op, revision, now)?;
        }

        state.collections.extend(touched);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
