//! Sluice Connectors - concrete collaborator adapters
//!
//! This crate provides the reference adapters behind the core contracts:
//! - PostgreSQL as a source (sqlx)
//! - BlazingDB as a destination or source (HTTP connector)
//! - S3 as the slice store for the unload path (object_store)

pub mod blazing;
pub mod postgres;
pub mod s3;

pub use blazing::{BlazingConfig, BlazingConnector, BlazingDestination, BlazingSource};
pub use postgres::PostgresSource;
pub use s3::{parse_s3_uri, S3Config, S3SliceStore};
