//! Sluice Core - data model and collaborator contracts
//!
//! This crate defines the pieces shared by the pipeline runtime and the
//! concrete adapters:
//! - the column/cell data model and the delimited row encoder
//! - the `Source` and `Destination` collaborator traits
//! - the error taxonomy used across the workspace

pub mod destination;
pub mod encoder;
pub mod error;
pub mod source;
pub mod storage;
pub mod types;
pub mod util;

pub use destination::{Destination, QueryResult};
pub use encoder::RowEncoder;
pub use error::Error;
pub use source::{ChunkStream, RowStream, Source};
pub use storage::SliceStore;
pub use types::{build_datatype, parse_cell, Cell, Column, ColumnType, Row, RowFormat, DATE_FORMAT};
pub use util::format_size;
