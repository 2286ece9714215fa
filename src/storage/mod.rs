//! C1 — durable persistence: a transactional structured store (Postgres)
//! plus a content-addressed blob filesystem.

pub mod blobs;
pub mod db;
pub mod models;

pub use blobs::{BlobHandle, BlobKind, BlobStore};
pub use db::Store;
