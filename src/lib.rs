pub mod clustering;
pub mod config;
pub mod db;
pub mod dedup;
pub mod environment;
pub mod error;
pub mod llm;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod prompts;
pub mod selection;
pub mod similarity;

pub const TARGET_DB: &str = "db_query";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DEDUP: &str = "dedup";
pub const TARGET_PIPELINE: &str = "pipeline";

pub use error::PipelineError;
