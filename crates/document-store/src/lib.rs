pub mod document;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use document::{Document, Fields};
pub use error::{Result, StoreError};
pub use memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;
pub use query::{FieldFilter, NativeOp, OrderBy, OrderDirection, Query};
pub use store::{
    BulkWriteResult, DocumentStore, MAX_TRANSACTION_WRITES, StoreTransaction, WriteOp,
};
