use crate::algorithms::{explain_pairs, predict_topk, ExplainableVncf, NegativeSampler, TopKOptions, VncfSettings};
use crate::config::{Config, ExperimentRow, OptimizerKind};
use crate::models::{Dataset, Interactions};
use crate::services::training::Trainer;
use crate::utils::metrics::{evaluate, evaluate_explanation, MetricScores};
use crate::utils::round4;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MODEL_NAME: &str = "E-VNCF";

/// One line of the result table: the grid row that produced it, the cutoff
/// and epoch it was measured at, and one rounded score per metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub model: String,
    pub rank: usize,
    pub num_layers: usize,
    pub train_batch_size: usize,
    pub predict_batch_size: usize,
    pub lambda: f32,
    #[serde(rename = "topK")]
    pub topk: usize,
    pub learning_rate: f64,
    pub epoch: usize,
    pub negative_sampling_size: usize,
    pub optimizer: OptimizerKind,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f64>,
}

impl ResultRow {
    /// One row per cutoff; `cutoff_index` selects the score column.
    pub fn from_scores(
        row: &ExperimentRow,
        topk: usize,
        epoch: usize,
        scores: &MetricScores,
        cutoff_index: usize,
    ) -> Self {
        let metrics = scores
            .iter()
            .filter_map(|(name, values)| values.get(cutoff_index).map(|&v| (name.clone(), round4(v))))
            .collect();

        Self {
            model: row.model.clone(),
            rank: row.rank,
            num_layers: row.num_layers,
            train_batch_size: row.train_batch_size,
            predict_batch_size: row.predict_batch_size,
            lambda: row.lambda,
            topk,
            learning_rate: row.learning_rate,
            epoch,
            negative_sampling_size: row.negative_sampling_size,
            optimizer: row.optimizer,
            metrics,
        }
    }
}

/// Repeats every grid row `runs` times: train in chunks, evaluate after each
/// chunk and persist the growing result table after every row.
pub struct ExperimentRunner {
    config: Config,
    dataset: Dataset,
    train: Interactions,
    test: Interactions,
}

impl ExperimentRunner {
    pub fn new(config: Config, dataset: Dataset) -> Result<Self> {
        let train = dataset
            .train_interactions()
            .context("invalid training interactions")?;
        let test = dataset
            .test_interactions()
            .context("invalid test interactions")?;

        Ok(Self {
            config,
            dataset,
            train,
            test,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn train_interactions(&self) -> &Interactions {
        &self.train
    }

    pub fn table_file(&self) -> PathBuf {
        Path::new(&self.config.experiment.table_path).join(&self.config.experiment.file_name)
    }

    fn cutoffs(&self) -> Vec<usize> {
        if self.config.experiment.topk_cutoffs.is_empty() {
            vec![self.config.prediction.topk]
        } else {
            self.config.experiment.topk_cutoffs.clone()
        }
    }

    fn metric_names(&self) -> &[String] {
        if self.config.experiment.explanation_mode {
            &self.config.experiment.explanation_metrics
        } else {
            &self.config.experiment.metrics
        }
    }

    pub fn run(&self) -> Result<Vec<ResultRow>> {
        let rows = self.config.grid_rows();
        let mut results = Vec::new();

        for run in 0..self.config.experiment.runs {
            for (index, row) in rows.iter().enumerate() {
                if row.model != MODEL_NAME {
                    warn!("Skipping grid row {}: unknown model '{}'", index, row.model);
                    continue;
                }

                info!(
                    "Run {} row {}: {}",
                    run,
                    index,
                    serde_json::to_string(row).unwrap_or_default()
                );
                match self.run_row(run, index, row) {
                    Ok(rows) => results.extend(rows),
                    Err(e) => warn!("Skipping grid row {} in run {}: {:#}", index, run, e),
                }

                self.save_table(&results)?;
            }
        }

        Ok(results)
    }

    fn settings_for(&self, row: &ExperimentRow, run: usize) -> VncfSettings {
        let settings = VncfSettings::new(
            self.dataset.num_users,
            self.dataset.num_items,
            self.dataset.text_dim(),
            row.rank,
            row.num_layers,
            row.lambda,
            row.learning_rate,
        )
        .with_optimizer(row.optimizer);

        match self.config.model.seed {
            Some(seed) => settings.with_seed(seed.wrapping_add(run as u64)),
            None => settings,
        }
    }

    fn sampler_for(&self, row: &ExperimentRow, run: usize) -> Result<NegativeSampler> {
        // Explanations are insensitive to the number of negatives.
        let negatives = if self.config.experiment.explanation_mode {
            1
        } else {
            row.negative_sampling_size
        };
        let sampler = NegativeSampler::new(self.train.clone(), row.train_batch_size, negatives)?;

        Ok(match self.config.model.seed {
            Some(seed) => sampler.with_seed(seed.wrapping_add(run as u64)),
            None => sampler,
        })
    }

    fn run_row(&self, run: usize, index: usize, row: &ExperimentRow) -> Result<Vec<ResultRow>> {
        let mut model = ExplainableVncf::build(self.settings_for(row, run)).context("failed to build model")?;
        let mut trainer = Trainer::new(self.sampler_for(row, run)?, self.config.training.corruption_rate)?;

        let cutoffs = self.cutoffs();
        let chunk = self.config.training.epoch_chunk.max(1);
        let mut results = Vec::new();
        let mut trained = 0;

        while trained < row.epoch {
            let epochs = chunk.min(row.epoch - trained);
            let report = trainer
                .train(&mut model, epochs, trained == 0)
                .with_context(|| format!("training failed after {} epochs", trained))?;
            trained += epochs;

            let scores = self.evaluate_model(&model, row, &cutoffs)?;
            info!(
                "Epoch {}: last loss {:?}, scores {:?}",
                trained, report.last_loss, scores
            );
            for (c, &topk) in cutoffs.iter().enumerate() {
                results.push(ResultRow::from_scores(row, topk, trained, &scores, c));
            }
        }

        if let Some(dir) = &self.config.experiment.checkpoint_dir {
            let name = format!("{}-run{}-row{}", MODEL_NAME, run, index);
            model.save(dir, &name).context("failed to save checkpoint")?;
        }

        model.close();
        Ok(results)
    }

    fn evaluate_model(&self, model: &ExplainableVncf, row: &ExperimentRow, cutoffs: &[usize]) -> Result<MetricScores> {
        let depth = cutoffs.iter().copied().max().unwrap_or(self.config.prediction.topk);

        let scores = if self.config.experiment.explanation_mode {
            let pairs: Vec<(usize, usize)> = self
                .test
                .records()
                .iter()
                .map(|record| (record.user_id, record.item_id))
                .collect();
            let explanations = explain_pairs(
                model,
                &pairs,
                &self.dataset.keyphrase_names,
                depth,
                row.predict_batch_size,
            )?;
            evaluate_explanation(&explanations, &self.test, self.metric_names(), cutoffs)?
        } else {
            let options = TopKOptions::new(depth, row.predict_batch_size);
            let prediction = predict_topk(model, &self.train, &options, &self.dataset.keyphrase_names)?;
            evaluate(&prediction.items, &self.test, self.metric_names(), cutoffs)?
        };

        Ok(scores)
    }

    /// Trains one model on the first grid row for the configured epochs,
    /// without evaluation.
    pub fn train_final_model(&self) -> Result<ExplainableVncf> {
        let rows = self.config.grid_rows();
        let row = rows.first().context("experiment grid is empty")?;

        let mut model = ExplainableVncf::build(self.settings_for(row, 0))?;
        let mut trainer = Trainer::new(self.sampler_for(row, 0)?, self.config.training.corruption_rate)?;
        trainer.train(&mut model, row.epoch, true)?;
        Ok(model)
    }

    pub fn save_table(&self, results: &[ResultRow]) -> Result<PathBuf> {
        let path = self.table_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let writer = BufWriter::new(
            fs::File::create(&path).with_context(|| format!("failed to create {}", path.display()))?,
        );
        serde_json::to_writer_pretty(writer, results)?;
        info!("Saved {} result rows to {}", results.len(), path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Interaction;

    fn dataset() -> Dataset {
        Dataset {
            num_users: 3,
            num_items: 5,
            keyphrase_names: vec!["fast".to_string(), "cheap".to_string(), "quiet".to_string()],
            train: vec![
                Interaction::new(0, 0, 1.0).with_keyphrases(vec![0]),
                Interaction::new(0, 1, 1.0).with_keyphrases(vec![1, 2]),
                Interaction::new(1, 2, 1.0).with_keyphrases(vec![2]),
                Interaction::new(2, 3, 1.0),
            ],
            test: vec![
                Interaction::new(0, 4, 1.0).with_keyphrases(vec![1]),
                Interaction::new(1, 0, 1.0).with_keyphrases(vec![0, 2]),
            ],
        }
    }

    fn config(table_path: &Path) -> Config {
        let mut config = Config::default();
        config.model.embed_dim = 2;
        config.model.seed = Some(7);
        config.training.train_batch_size = 4;
        config.training.epochs = 3;
        config.training.epoch_chunk = 2;
        config.prediction.predict_batch_size = 2;
        config.experiment.runs = 1;
        config.experiment.topk_cutoffs = vec![2, 3];
        config.experiment.table_path = table_path.display().to_string();
        config.experiment.file_name = "results.json".to_string();
        config
    }

    #[test]
    fn test_rows_per_chunk_and_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ExperimentRunner::new(config(dir.path()), dataset()).unwrap();

        let results = runner.run().unwrap();

        // Chunks end at epochs 2 and 3, each with two cutoffs.
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].epoch, 2);
        assert_eq!(results[3].epoch, 3);
        assert_eq!(results[1].topk, 3);
        assert_eq!(results[0].metrics.len(), 6);
        for value in results[0].metrics.values() {
            assert_eq!(*value, round4(*value));
        }
        assert!(runner.table_file().is_file());
    }

    #[test]
    fn test_table_uses_result_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.experiment.topk_cutoffs = vec![2];
        config.training.epochs = 2;
        let runner = ExperimentRunner::new(config, dataset()).unwrap();

        runner.run().unwrap();

        let content = fs::read_to_string(runner.table_file()).unwrap();
        let table: Vec<serde_json::Value> = serde_json::from_str(&content).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0]["topK"], 2);
        assert_eq!(table[0]["model"], MODEL_NAME);
        assert!(table[0].get("NDCG").is_some());
        assert_eq!(table[0]["optimizer"], "Adam");
    }

    #[test]
    fn test_failing_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        let mut bad = config.grid_rows().remove(0);
        bad.rank = 0;
        let mut unknown = bad.clone();
        unknown.model = "CDE-VAE".to_string();
        config.grid = vec![bad, unknown];
        let runner = ExperimentRunner::new(config, dataset()).unwrap();

        let results = runner.run().unwrap();

        assert!(results.is_empty());
        assert!(runner.table_file().is_file());
    }

    #[test]
    fn test_explanation_mode_uses_explanation_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.experiment.explanation_mode = true;
        config.experiment.topk_cutoffs = vec![2];
        config.training.epochs = 2;
        let runner = ExperimentRunner::new(config, dataset()).unwrap();

        let results = runner.run().unwrap();

        assert_eq!(results.len(), 1);
        let names: Vec<&str> = results[0].metrics.keys().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["MAP", "NDCG", "Precision", "Recall"]);
    }

    #[test]
    fn test_checkpoint_written_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.training.epochs = 1;
        config.experiment.checkpoint_dir = Some(dir.path().join("models").display().to_string());
        let runner = ExperimentRunner::new(config, dataset()).unwrap();

        runner.run().unwrap();

        let restored = ExplainableVncf::from_checkpoint(dir.path().join("models"), "E-VNCF-run0-row0").unwrap();
        assert_eq!(restored.settings().embed_dim, 2);
    }
}
