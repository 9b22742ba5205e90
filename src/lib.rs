pub mod cli;
pub mod concepts;
pub mod dataset;
pub mod embedding;
pub mod error;
pub mod init;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod signals;
pub mod utils;

pub use error::{
    ConceptError, PipelineError, QueryError, SchemaError, SiftError, StorageError,
};
