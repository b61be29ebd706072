//! Mirador DB - PostgreSQL persistence for cached listings.
//!
//! [`RecordRepository`] implements [`mirador_core::traits::RecordStore`] over
//! a `PgPool`. The schema ships as an embedded migration, see
//! [`RecordRepository::migrate`].

pub mod repository;

pub use repository::{RecordRepository, StoreStats};
