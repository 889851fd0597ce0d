pub mod api;
pub mod config;
pub mod data;
pub mod model;
pub mod pipeline;
pub mod schema;
pub mod storage;
pub mod warehouse;

pub use model::{train_linear_model, FeatureMismatch, ModelArtifact};
pub use pipeline::{run_training_job, TrainingReport};
