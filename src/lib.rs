mod codec;
mod document;
mod engine;
mod errors;
mod index;
mod metadata;
mod query;
mod server;

pub use crate::document::{canonical_string, matches, merge};
pub use crate::engine::Engine;
pub use crate::errors::{CodecError, DocumentValidationError, YarDbError};
pub use crate::index::Index;
pub use crate::metadata::{Metadata, Status};
pub use crate::query::{CompareOp, Direction, FilterExpr, Literal, QueryError, QueryOptions, StringFunction};
pub use crate::server::{router, serve};

pub type Document = serde_json::Map<String, serde_json::Value>;
