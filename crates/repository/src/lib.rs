//! Persistence layer for document-backed entities.
//!
//! This crate provides:
//! - `Specification`, the query intent (filters, sorts, pagination) a repository accepts
//! - `FieldMapper`, per-entity translation from domain field names to storage fields
//! - `Repository<E>`, CRUD, batch mutation, count and specification-based find
//!   over one collection
//! - `UnitOfWork`, which binds several repositories to one atomic transaction

pub mod entity;
pub mod error;
pub mod mapper;
pub mod repository;
pub mod specification;
pub mod unit_of_work;

pub use entity::{Entity, EntityCodec, EntityMeta, JsonCodec};
pub use error::{RepositoryError, Result};
pub use mapper::{BaseFieldMapper, EntityFieldMapper, FieldKind, FieldMapper, FieldSpec, UpdateMap};
pub use repository::Repository;
pub use specification::{Direction, Filter, Operator, Page, Pagination, Sort, Specification};
pub use unit_of_work::{Transaction, TransactionScoped, UnitOfWork};
