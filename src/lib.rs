pub mod config;
pub mod datagen;
pub mod error;
pub mod execution;
pub mod http;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod prompts;
pub mod review;
pub mod schema;
pub mod sql;

pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineOptions, PipelineResponse};
pub use schema::SchemaDescriptor;
