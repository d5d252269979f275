//! Generic repository over one document collection.

use std::sync::Arc;

use common::EntityId;
use document_store::{
    Document, DocumentStore, Fields, MAX_TRANSACTION_WRITES, NativeOp, Query,
    StoreError, WriteOp,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    Entity, EntityCodec, FieldMapper, JsonCodec, Page, RepositoryError, Result, Specification,
    UpdateMap, unit_of_work::Transaction,
};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Returns true if a failed query was rejected for lack of a composite index.
fn is_missing_index(error: &StoreError) -> bool {
    let message = error.to_string().to_lowercase();
    (error.code() == "FAILED_PRECONDITION" && message.contains("index"))
        || message.contains("requires an index")
}

fn record_operation(collection: &'static str, op: &'static str) {
    metrics::counter!("repository_operations_total", "collection" => collection, "op" => op)
        .increment(1);
}

/// CRUD, batch mutation, count and specification-based find over the
/// collection of entity `E`.
///
/// A repository is either unbound, writing straight to the store, or bound
/// to a [`Transaction`] by a [`crate::UnitOfWork`], in which case every read
/// and write goes through that transaction.
pub struct Repository<E: Entity> {
    store: Arc<dyn DocumentStore>,
    codec: Arc<dyn EntityCodec<E>>,
    mapper: Arc<dyn FieldMapper>,
    tx: Option<Transaction>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            codec: self.codec.clone(),
            mapper: self.mapper.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<E> Repository<E>
where
    E: Entity + Serialize + DeserializeOwned,
{
    /// Creates a repository that stores entities in their serde form.
    pub fn json(store: Arc<dyn DocumentStore>, mapper: Arc<dyn FieldMapper>) -> Self {
        Self::new(store, Arc::new(JsonCodec::<E>::new()), mapper)
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        codec: Arc<dyn EntityCodec<E>>,
        mapper: Arc<dyn FieldMapper>,
    ) -> Self {
        Self {
            store,
            codec,
            mapper,
            tx: None,
        }
    }

    /// Returns a copy of this repository bound to `tx`.
    pub fn with_transaction(&self, tx: &Transaction) -> Self {
        Self {
            tx: Some(tx.clone()),
            ..self.clone()
        }
    }

    /// Returns true if this handle is bound to a transaction.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub fn mapper(&self) -> &dyn FieldMapper {
        self.mapper.as_ref()
    }

    async fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        match &self.tx {
            Some(tx) => tx.get(E::COLLECTION, id).await,
            None => self.store.get(E::COLLECTION, id).await,
        }
    }

    async fn query_documents(&self, query: &Query) -> StoreResult<Vec<Document>> {
        match &self.tx {
            Some(tx) => tx.query(query).await,
            None => self.store.query(query).await,
        }
    }

    async fn write(&self, op: WriteOp) -> StoreResult<()> {
        match &self.tx {
            Some(tx) => tx.apply(op).await,
            None => match op {
                WriteOp::Create {
                    collection,
                    id,
                    fields,
                } => self.store.create(&collection, &id, fields).await,
                WriteOp::Update {
                    collection,
                    id,
                    fields,
                } => self.store.update(&collection, &id, fields).await,
                WriteOp::Delete { collection, id } => self.store.delete(&collection, &id).await,
            },
        }
    }

    fn not_found(id: &EntityId) -> RepositoryError {
        RepositoryError::NotFound {
            collection: E::COLLECTION.to_string(),
            id: id.to_string(),
        }
    }

    fn stamped(mut fields: Fields) -> Fields {
        fields.insert(
            "updated_at".to_string(),
            Value::String(common::timestamp::encode(&common::timestamp::now())),
        );
        fields
    }

    /// Persists a new entity.
    ///
    /// Assigns a store-generated ID when the entity has none and stamps both
    /// timestamps. Returns the entity as stored.
    #[tracing::instrument(skip_all, fields(collection = E::COLLECTION))]
    pub async fn create(&self, mut entity: E) -> Result<E> {
        let meta = entity.meta_mut();
        if meta.id.is_empty() {
            meta.id = EntityId::from_string(self.store.new_id());
        }
        let now = common::timestamp::now();
        meta.created_at = now;
        meta.updated_at = now;
        let id = meta.id.to_string();

        let fields = self.codec.encode(&entity)?;
        match &self.tx {
            Some(tx) => tx.create(E::COLLECTION, &id, fields).await?,
            None => self.store.create(E::COLLECTION, &id, fields).await?,
        }

        record_operation(E::COLLECTION, "create");
        tracing::debug!(%id, "entity created");
        Ok(entity)
    }

    /// Reads an entity, failing with `NotFound` when absent.
    #[tracing::instrument(skip(self), fields(collection = E::COLLECTION))]
    pub async fn read(&self, id: &EntityId) -> Result<E> {
        let document = self
            .get_document(id.as_str())
            .await?
            .ok_or_else(|| Self::not_found(id))?;
        self.codec.decode(document)
    }

    /// Returns true if the entity exists.
    pub async fn exists(&self, id: &EntityId) -> Result<bool> {
        Ok(self.get_document(id.as_str()).await?.is_some())
    }

    /// Applies a partial update keyed by domain field names.
    ///
    /// Never overwrites the whole entity and never touches `created_at`;
    /// `updated_at` is always refreshed.
    #[tracing::instrument(skip(self, updates), fields(collection = E::COLLECTION))]
    pub async fn update(&self, id: &EntityId, updates: &UpdateMap) -> Result<()> {
        let fields = Self::stamped(self.mapper.map_updates(updates)?);
        self.write(WriteOp::update(E::COLLECTION, id.as_str(), fields))
            .await?;
        record_operation(E::COLLECTION, "update");
        Ok(())
    }

    /// Flags an entity as deleted.
    #[tracing::instrument(skip(self), fields(collection = E::COLLECTION))]
    pub async fn soft_delete(&self, id: &EntityId) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("deleted".to_string(), Value::Bool(true));
        self.write(WriteOp::update(E::COLLECTION, id.as_str(), Self::stamped(fields)))
            .await?;
        record_operation(E::COLLECTION, "soft_delete");
        Ok(())
    }

    /// Physically removes an entity. Removing an absent entity succeeds.
    #[tracing::instrument(skip(self), fields(collection = E::COLLECTION))]
    pub async fn delete(&self, id: &EntityId) -> Result<()> {
        self.write(WriteOp::delete(E::COLLECTION, id.as_str()))
            .await?;
        record_operation(E::COLLECTION, "delete");
        Ok(())
    }

    /// Moves an entity to another owner of the same kind.
    ///
    /// Fails with `InvalidInput` if the entity has no owner to replace.
    #[tracing::instrument(skip(self), fields(collection = E::COLLECTION))]
    pub async fn transfer(&self, id: &EntityId, new_owner: &EntityId) -> Result<()> {
        let entity = self.read(id).await?;
        if entity.meta().parent().is_none() {
            return Err(RepositoryError::InvalidInput(format!(
                "{} {id} has no parent to transfer from",
                E::COLLECTION
            )));
        }

        self.write(WriteOp::update(
            E::COLLECTION,
            id.as_str(),
            Self::transfer_fields(new_owner),
        ))
        .await?;
        record_operation(E::COLLECTION, "transfer");
        Ok(())
    }

    fn transfer_fields(new_owner: &EntityId) -> Fields {
        let mut fields = Fields::new();
        fields.insert(
            "parent_id".to_string(),
            Value::String(new_owner.to_string()),
        );
        Self::stamped(fields)
    }

    fn base_query(&self, spec: &Specification) -> Result<Query> {
        let filters = self.mapper.map_filters(&spec.filters)?;
        Ok(Query::collection(E::COLLECTION).filters(filters))
    }

    /// Finds one page of entities matching a specification.
    ///
    /// Fetches `limit + 1` rows to learn whether more exist.
    ///
    /// If the store rejects the filter+sort combination for lack of a
    /// composite index, the same filters are retried without the sort. The
    /// caller then gets correctly filtered but unsorted results instead of an
    /// error; the fallback is logged and counted in
    /// `repository_index_fallback_total`.
    #[tracing::instrument(skip(self, spec), fields(collection = E::COLLECTION))]
    pub async fn find_by_specification(&self, spec: &Specification) -> Result<Page<E>> {
        let pagination = spec.pagination.normalize();
        let limit = pagination.limit as usize;

        let mut query = self.base_query(spec)?;
        for order in self.mapper.map_sorts(&spec.sorts) {
            query = query.order_by(order);
        }
        let query = query
            .limit(limit + 1)
            .offset(pagination.offset as usize);

        let documents = match self.query_documents(&query).await {
            Ok(documents) => documents,
            Err(e) if !query.order_by.is_empty() && is_missing_index(&e) => {
                tracing::warn!(
                    error = %e,
                    "composite index unavailable, returning unsorted results"
                );
                metrics::counter!("repository_index_fallback_total", "collection" => E::COLLECTION)
                    .increment(1);
                self.query_documents(&query.without_order()).await?
            }
            Err(e) => return Err(e.into()),
        };

        let has_more = documents.len() > limit;
        let data = documents
            .into_iter()
            .take(limit)
            .map(|doc| self.codec.decode(doc))
            .collect::<Result<Vec<_>>>()?;

        record_operation(E::COLLECTION, "find");
        Ok(Page {
            data,
            limit: pagination.limit,
            offset: pagination.offset,
            has_more,
        })
    }

    /// Finds an entity by its unique name.
    ///
    /// Only valid for entities with a unique name field; for others this
    /// fails with `InvalidInput` without querying.
    #[tracing::instrument(skip(self), fields(collection = E::COLLECTION))]
    pub async fn find_by_name(&self, name: &str) -> Result<Option<E>> {
        let Some(field) = E::UNIQUE_NAME_FIELD else {
            return Err(RepositoryError::InvalidInput(format!(
                "{} has no unique name",
                E::COLLECTION
            )));
        };

        let query = Query::collection(E::COLLECTION)
            .filter(field, NativeOp::Equal, Value::String(name.to_string()))
            .limit(1);
        let documents = self.query_documents(&query).await?;
        documents
            .into_iter()
            .next()
            .map(|doc| self.codec.decode(doc))
            .transpose()
    }

    /// Returns the IDs of every entity matching the specification's filters.
    ///
    /// Sorts and pagination are ignored.
    pub async fn find_all_ids(&self, spec: &Specification) -> Result<Vec<EntityId>> {
        let query = self.base_query(spec)?;
        let ids = match &self.tx {
            Some(tx) => tx.query_refs(&query).await?,
            None => self
                .store
                .query(&query)
                .await?
                .into_iter()
                .map(|doc| doc.id)
                .collect(),
        };
        Ok(ids.into_iter().map(EntityId::from).collect())
    }

    /// Counts entities matching the specification's filters.
    ///
    /// Unbound repositories use the store's native count. Inside a
    /// transaction, where the store offers no count, matching references are
    /// counted instead; slower, but consistent with the transaction's view.
    #[tracing::instrument(skip(self, spec), fields(collection = E::COLLECTION))]
    pub async fn count(&self, spec: &Specification) -> Result<u64> {
        let query = self.base_query(spec)?;
        let count = match &self.tx {
            Some(tx) => tx.query_refs(&query).await?.len() as u64,
            None => self.store.count(&query).await?,
        };
        Ok(count)
    }

    /// Applies the same partial update to many entities.
    #[tracing::instrument(skip(self, ids, updates), fields(collection = E::COLLECTION, count = ids.len()))]
    pub async fn batch_update(&self, ids: &[EntityId], updates: &UpdateMap) -> Result<usize> {
        let fields = Self::stamped(self.mapper.map_updates(updates)?);
        let ops = ids
            .iter()
            .map(|id| WriteOp::update(E::COLLECTION, id.as_str(), fields.clone()))
            .collect();
        self.apply_batch(ops, "batch_update").await
    }

    /// Physically removes many entities.
    #[tracing::instrument(skip(self, ids), fields(collection = E::COLLECTION, count = ids.len()))]
    pub async fn batch_delete(&self, ids: &[EntityId]) -> Result<usize> {
        let ops = ids
            .iter()
            .map(|id| WriteOp::delete(E::COLLECTION, id.as_str()))
            .collect();
        self.apply_batch(ops, "batch_delete").await
    }

    /// Moves many entities to another owner.
    ///
    /// Unlike [`Repository::transfer`], entities are not read first; their
    /// owner ID is rewritten in place.
    #[tracing::instrument(skip(self, ids), fields(collection = E::COLLECTION, count = ids.len()))]
    pub async fn batch_transfer(&self, ids: &[EntityId], new_owner: &EntityId) -> Result<usize> {
        let fields = Self::transfer_fields(new_owner);
        let ops = ids
            .iter()
            .map(|id| WriteOp::update(E::COLLECTION, id.as_str(), fields.clone()))
            .collect();
        self.apply_batch(ops, "batch_transfer").await
    }

    /// Inside a transaction, applies writes one by one under the
    /// per-transaction ceiling, refusing the whole batch up front if it would
    /// not fit. Outside, hands them to the store's unordered bulk path; the
    /// first failure is returned after the rest have been applied.
    async fn apply_batch(&self, ops: Vec<WriteOp>, op_name: &'static str) -> Result<usize> {
        if ops.is_empty() {
            return Ok(0);
        }

        let applied = match &self.tx {
            Some(tx) => {
                let staged = tx.write_count().await?;
                if staged + ops.len() > MAX_TRANSACTION_WRITES {
                    return Err(RepositoryError::TooManyOperations {
                        requested: ops.len(),
                        limit: MAX_TRANSACTION_WRITES - staged.min(MAX_TRANSACTION_WRITES),
                    });
                }
                let count = ops.len();
                for op in ops {
                    tx.apply(op).await?;
                }
                count
            }
            None => {
                let result = self.store.bulk_write(ops).await?;
                if let Some((id, error)) = result.failures.into_iter().next() {
                    tracing::warn!(%id, error = %error, succeeded = result.succeeded, "bulk write partially failed");
                    return Err(error.into());
                }
                result.succeeded
            }
        };

        metrics::counter!("repository_operations_total", "collection" => E::COLLECTION, "op" => op_name)
            .increment(applied as u64);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityFieldMapper, EntityMeta, FieldKind, FieldSpec, Operator, Sort};
    use document_store::InMemoryDocumentStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Photo {
        #[serde(flatten)]
        meta: EntityMeta,
        status: String,
        rank: i64,
    }

    impl Entity for Photo {
        const COLLECTION: &'static str = "photos";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    fn photo(status: &str, rank: i64) -> Photo {
        Photo {
            meta: EntityMeta::new("tester"),
            status: status.into(),
            rank,
        }
    }

    fn repo(store: InMemoryDocumentStore) -> Repository<Photo> {
        let mapper = EntityFieldMapper::new([
            FieldSpec::new("status", "status", FieldKind::String),
            FieldSpec::new("rank", "rank", FieldKind::Integer),
        ]);
        Repository::json(Arc::new(store), Arc::new(mapper))
    }

    #[test]
    fn missing_index_is_recognised_by_code_and_message() {
        let missing = StoreError::FailedPrecondition(
            "The query requires an index on photos(status, rank)".into(),
        );
        assert!(is_missing_index(&missing));
        assert!(!is_missing_index(&StoreError::TransactionClosed));
        assert!(!is_missing_index(&StoreError::Aborted("index changed".into())));
    }

    #[tokio::test]
    async fn create_assigns_id_and_timestamps() {
        let repo = repo(InMemoryDocumentStore::new());
        let created = repo.create(photo("NEW", 1)).await.unwrap();

        assert!(!created.meta.id.is_empty());
        assert_eq!(created.meta.created_at, created.meta.updated_at);

        let read = repo.read(&created.meta.id).await.unwrap();
        assert_eq!(read, created);
    }

    #[tokio::test]
    async fn create_keeps_caller_id() {
        let repo = repo(InMemoryDocumentStore::new());
        let mut p = photo("NEW", 1);
        p.meta.id = EntityId::from("fixed");
        let created = repo.create(p).await.unwrap();
        assert_eq!(created.meta.id.as_str(), "fixed");

        let duplicate = repo.create(created.clone()).await;
        assert!(matches!(duplicate, Err(RepositoryError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let repo = repo(InMemoryDocumentStore::new());
        let result = repo.read(&EntityId::from("nope")).await;
        assert!(matches!(result, Err(RepositoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn soft_delete_flips_flag() {
        let repo = repo(InMemoryDocumentStore::new());
        let created = repo.create(photo("NEW", 1)).await.unwrap();
        repo.soft_delete(&created.meta.id).await.unwrap();

        let read = repo.read(&created.meta.id).await.unwrap();
        assert!(read.meta.deleted);
        assert!(read.meta.updated_at >= created.meta.updated_at);
    }

    #[tokio::test]
    async fn transfer_requires_existing_parent() {
        let repo = repo(InMemoryDocumentStore::new());
        let orphan = repo.create(photo("NEW", 1)).await.unwrap();
        let result = repo
            .transfer(&orphan.meta.id, &EntityId::from("album-2"))
            .await;
        assert!(matches!(result, Err(RepositoryError::InvalidInput(_))));

        let mut owned = photo("NEW", 2);
        owned.meta = owned
            .meta
            .with_parent(common::ParentRef::new("album-1", "album"));
        let owned = repo.create(owned).await.unwrap();
        repo.transfer(&owned.meta.id, &EntityId::from("album-2"))
            .await
            .unwrap();

        let moved = repo.read(&owned.meta.id).await.unwrap();
        let parent = moved.meta.parent().unwrap();
        assert_eq!(parent.id.as_str(), "album-2");
        assert_eq!(parent.kind, "album");
    }

    #[tokio::test]
    async fn find_by_name_requires_unique_name() {
        let repo = repo(InMemoryDocumentStore::new());
        assert!(matches!(
            repo.find_by_name("x").await,
            Err(RepositoryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn find_sorted_page_with_has_more() {
        let repo = repo(InMemoryDocumentStore::new());
        for rank in 1..=5 {
            repo.create(photo("NEW", rank)).await.unwrap();
        }

        let spec = Specification::new()
            .sort(Sort::desc("rank"))
            .paginate(2, 0);
        let page = repo.find_by_specification(&spec).await.unwrap();
        let ranks: Vec<_> = page.data.iter().map(|p| p.rank).collect();
        assert_eq!(ranks, vec![5, 4]);
        assert!(page.has_more);

        let last = repo
            .find_by_specification(&spec.clone().paginate(2, 4))
            .await
            .unwrap();
        assert_eq!(last.data.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn count_matches_inside_and_outside_transaction() {
        let store = InMemoryDocumentStore::new();
        let repo = repo(store.clone());
        for (status, rank) in [("FAILED", 1), ("FAILED", 2), ("NEW", 3)] {
            repo.create(photo(status, rank)).await.unwrap();
        }
        let spec = Specification::new().filter("status", Operator::Eq, "FAILED");

        let outside = repo.count(&spec).await.unwrap();

        let uow = crate::UnitOfWork::new(Arc::new(store));
        let inside = uow
            .with_transaction(&repo, |repo| async move { repo.count(&spec).await })
            .await
            .unwrap();

        assert_eq!(outside, 2);
        assert_eq!(inside, outside);
    }
}
