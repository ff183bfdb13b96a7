pub mod types;

pub use types::{ChatHistory, ChatRole, Chunk, DeployType, DocumentInfo, ModelInfo, Region, SearchResult};
