pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::{
    explain_pairs, predict_topk, BatchSource, ExplainableVncf, NegativeSampler, Prediction, RecommendationModel,
    TopKOptions, TopKPrediction, VncfSettings,
};
pub use config::Config;
pub use error::{EvncfError, Result};
pub use models::*;
pub use services::experiment::{ExperimentRunner, ResultRow};
pub use services::training::{Trainer, TrainingReport};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
