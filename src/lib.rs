// Core modules
pub mod api;
pub mod config;
pub mod deployment;
pub mod improvement;
pub mod indicators;
pub mod journal;
pub mod llm;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod predictor;
pub mod status;

// Re-export commonly used types
pub use deployment::{DeploymentManager, DeploymentRecord};
pub use improvement::{ImprovementEngine, ImprovementRequest};
pub use models::*;
pub use pipeline::{SelfImprovementLoop, SessionResult};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
