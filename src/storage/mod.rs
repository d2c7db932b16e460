//! Filesystem access for bucket and object operations.
//!
//! The [`backend::StorageBackend`] trait is what the operation handlers
//! call; [`local::LocalBackend`] implements it over the mount directory.

pub mod backend;
pub mod local;
