use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub prediction: PredictionConfig,
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub grid: Vec<ExperimentRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub embed_dim: usize,
    pub num_layers: usize,
    #[serde(rename = "lambda")]
    pub lamb: f32,
    pub learning_rate: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub train_batch_size: usize,
    pub negative_sampling_size: usize,
    pub corruption_rate: f32,
    pub epochs: usize,
    pub epoch_chunk: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    pub predict_batch_size: usize,
    pub topk: usize,
    pub topk_keyphrases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub runs: usize,
    pub metrics: Vec<String>,
    pub explanation_metrics: Vec<String>,
    pub topk_cutoffs: Vec<usize>,
    pub table_path: String,
    pub file_name: String,
    pub checkpoint_dir: Option<String>,
    #[serde(default)]
    pub explanation_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[default]
    Adam,
    #[serde(rename = "SGD")]
    Sgd,
    AdaGrad,
    #[serde(rename = "RMSProp")]
    RmsProp,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Adam => "Adam",
            OptimizerKind::Sgd => "SGD",
            OptimizerKind::AdaGrad => "AdaGrad",
            OptimizerKind::RmsProp => "RMSProp",
        };
        f.write_str(name)
    }
}

/// One hyperparameter combination of an experiment grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRow {
    pub model: String,
    pub rank: usize,
    pub num_layers: usize,
    pub train_batch_size: usize,
    pub predict_batch_size: usize,
    pub lambda: f32,
    pub learning_rate: f64,
    pub epoch: usize,
    pub negative_sampling_size: usize,
    #[serde(default)]
    pub optimizer: OptimizerKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                name: "E-VNCF".to_string(),
                embed_dim: 50,
                num_layers: 1,
                lamb: 0.0001,
                learning_rate: 0.0001,
                optimizer: OptimizerKind::Adam,
                seed: None,
            },
            training: TrainingConfig {
                train_batch_size: 128,
                negative_sampling_size: 1,
                corruption_rate: 0.1,
                epochs: 100,
                epoch_chunk: 10,
            },
            prediction: PredictionConfig {
                predict_batch_size: 128,
                topk: 10,
                topk_keyphrases: 10,
            },
            experiment: ExperimentConfig {
                runs: 3,
                metrics: ["R-Precision", "NDCG", "Clicks", "Recall", "Precision", "MAP"]
                    .iter()
                    .map(|m| m.to_string())
                    .collect(),
                explanation_metrics: ["NDCG", "Recall", "Precision", "MAP"]
                    .iter()
                    .map(|m| m.to_string())
                    .collect(),
                topk_cutoffs: vec![10],
                table_path: "tables".to_string(),
                file_name: "convergence.json".to_string(),
                checkpoint_dir: None,
                explanation_mode: false,
            },
            grid: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("EVNCF").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// The explicit grid, or a single row assembled from the model, training
    /// and prediction sections when no grid is configured.
    pub fn grid_rows(&self) -> Vec<ExperimentRow> {
        if !self.grid.is_empty() {
            return self.grid.clone();
        }

        vec![ExperimentRow {
            model: self.model.name.clone(),
            rank: self.model.embed_dim,
            num_layers: self.model.num_layers,
            train_batch_size: self.training.train_batch_size,
            predict_batch_size: self.prediction.predict_batch_size,
            lambda: self.model.lamb,
            learning_rate: self.model.learning_rate,
            epoch: self.training.epochs,
            negative_sampling_size: self.training.negative_sampling_size,
            optimizer: self.model.optimizer,
        }]
    }
}
