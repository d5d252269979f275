//! Transaction handle and unit of work.

use std::future::Future;
use std::sync::Arc;

use document_store::{
    Document, DocumentStore, Fields, Query, StoreError, StoreTransaction, WriteOp,
};
use tokio::sync::Mutex;

use crate::{Entity, Repository, RepositoryError, Result};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared handle to one open store transaction.
///
/// Cloned into every repository scoped to it. Once the transaction is
/// committed or rolled back, every clone fails with `TransactionClosed`, so a
/// handle retained past its unit of work cannot write outside it.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Mutex<Option<Box<dyn StoreTransaction>>>>,
}

impl Transaction {
    pub fn new(tx: Box<dyn StoreTransaction>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub(crate) async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.get(collection, id).await
    }

    pub(crate) async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.query(query).await
    }

    pub(crate) async fn query_refs(&self, query: &Query) -> StoreResult<Vec<String>> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.query_refs(query).await
    }

    pub(crate) async fn create(&self, collection: &str, id: &str, fields: Fields) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.create(collection, id, fields).await
    }

    pub(crate) async fn apply(&self, op: WriteOp) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        tx.apply(op).await
    }

    /// Number of writes staged so far.
    pub async fn write_count(&self) -> Result<usize> {
        let guard = self.inner.lock().await;
        let tx = guard.as_ref().ok_or(StoreError::TransactionClosed)?;
        Ok(tx.write_count())
    }

    /// Returns true while the transaction can still take operations.
    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Commits the transaction. A lost race surfaces as `TransactionAborted`.
    pub async fn commit(&self) -> Result<()> {
        let tx = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(StoreError::TransactionClosed)?;
        tx.commit().await.map_err(RepositoryError::from)
    }

    /// Discards every staged write.
    pub async fn rollback(&self) -> Result<()> {
        let tx = self
            .inner
            .lock()
            .await
            .take()
            .ok_or(StoreError::TransactionClosed)?;
        tx.rollback().await.map_err(RepositoryError::from)
    }
}

/// Something that can be re-bound to a transaction: a repository or a group
/// of repositories.
pub trait TransactionScoped {
    fn scoped(&self, tx: &Transaction) -> Self;
}

impl<E: Entity> TransactionScoped for Repository<E> {
    fn scoped(&self, tx: &Transaction) -> Self {
        self.with_transaction(tx)
    }
}

macro_rules! impl_scoped_tuple {
    ($($name:ident),+) => {
        impl<$($name: TransactionScoped),+> TransactionScoped for ($($name,)+) {
            #[allow(non_snake_case)]
            fn scoped(&self, tx: &Transaction) -> Self {
                let ($($name,)+) = self;
                ($($name.scoped(tx),)+)
            }
        }
    };
}

impl_scoped_tuple!(A);
impl_scoped_tuple!(A, B);
impl_scoped_tuple!(A, B, C);
impl_scoped_tuple!(A, B, C, D);

/// Runs a callback against repositories bound to one atomic transaction.
#[derive(Clone)]
pub struct UnitOfWork {
    store: Arc<dyn DocumentStore>,
}

impl UnitOfWork {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Opens a transaction without running anything in it.
    pub async fn begin(&self) -> Result<Transaction> {
        Ok(Transaction::new(self.store.begin().await?))
    }

    /// Opens a transaction, hands `f` the repositories re-bound to it, and
    /// commits iff `f` succeeds; otherwise rolls back and returns `f`'s error.
    ///
    /// A commit that loses a race with a concurrent writer returns
    /// `RepositoryError::TransactionAborted`. Nothing is retried here; the
    /// caller decides whether to run the whole unit again.
    ///
    /// The scoped handles must not outlive `f`; once the transaction ends
    /// they fail with `InvalidInput`.
    #[tracing::instrument(skip_all)]
    pub async fn with_transaction<R, F, Fut, T, Err>(&self, repos: &R, f: F) -> std::result::Result<T, Err>
    where
        R: TransactionScoped,
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = std::result::Result<T, Err>>,
        Err: From<RepositoryError>,
    {
        let tx = self.begin().await?;
        let scoped = repos.scoped(&tx);

        match f(scoped).await {
            Ok(value) => {
                if let Err(e) = tx.commit().await {
                    if matches!(e, RepositoryError::TransactionAborted(_)) {
                        tracing::warn!(error = %e, "transaction aborted on commit");
                    }
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use document_store::InMemoryDocumentStore;

    #[tokio::test]
    async fn closed_transaction_rejects_operations() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let uow = UnitOfWork::new(store);

        let tx = uow.begin().await.unwrap();
        let retained = tx.clone();
        assert!(tx.is_active().await);
        tx.commit().await.unwrap();

        assert!(!retained.is_active().await);
        assert!(matches!(
            retained.get("images", "x").await,
            Err(StoreError::TransactionClosed)
        ));
        assert!(retained.commit().await.is_err());
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let memory = InMemoryDocumentStore::new();
        let uow = UnitOfWork::new(Arc::new(memory.clone()));

        let tx = uow.begin().await.unwrap();
        tx.create("images", "x", Fields::new()).await.unwrap();
        assert_eq!(tx.write_count().await.unwrap(), 1);
        tx.rollback().await.unwrap();

        assert_eq!(memory.document_count("images").await, 0);
    }
}
