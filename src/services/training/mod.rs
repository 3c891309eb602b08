use crate::algorithms::initializer::svd_embeddings;
use crate::algorithms::{BatchSource, ExplainableVncf};
use crate::error::Result;
use crate::models::InteractionBatch;
use crate::utils::validation::validate_corruption_rate;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs: usize,
    pub steps: usize,
    /// Loss of the final batch; `None` when no batch was consumed.
    pub last_loss: Option<f32>,
    pub epoch_losses: Vec<f32>,
    pub elapsed: Duration,
}

/// Drives epochs of training from a batch source. The current batch
/// collection lives here, so consecutive `train` calls continue with the
/// batches resampled at the end of the previous call.
pub struct Trainer<S: BatchSource> {
    source: S,
    batches: Vec<InteractionBatch>,
    corruption_rate: f32,
    epochs_completed: usize,
}

impl<S: BatchSource> Trainer<S> {
    pub fn new(mut source: S, corruption_rate: f32) -> Result<Self> {
        validate_corruption_rate(corruption_rate)?;
        let batches = source.get_batches()?;

        Ok(Self {
            source,
            batches,
            corruption_rate,
            epochs_completed: 0,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn batches(&self) -> &[InteractionBatch] {
        &self.batches
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn train(
        &mut self,
        model: &mut ExplainableVncf,
        epochs: usize,
        reinitialize_embeddings: bool,
    ) -> Result<TrainingReport> {
        let start = Instant::now();

        if reinitialize_embeddings {
            let (users, items) = svd_embeddings(self.source.interactions(), model.settings().embed_dim)?;
            model.initialize_embeddings_from_matrix(users, items)?;
            info!("Embeddings initialized from the rating matrix SVD");
        }

        let mut report = TrainingReport {
            epochs,
            steps: 0,
            last_loss: None,
            epoch_losses: Vec::with_capacity(epochs),
            elapsed: Duration::ZERO,
        };

        for _ in 0..epochs {
            let mut total = 0.0;
            for batch in &self.batches {
                let loss = model.train_step(batch, self.corruption_rate)?;
                total += loss;
                report.last_loss = Some(loss);
                report.steps += 1;
            }

            self.epochs_completed += 1;
            let mean_loss = if self.batches.is_empty() {
                0.0
            } else {
                total / self.batches.len() as f32
            };
            report.epoch_losses.push(mean_loss);
            info!(
                "Epoch {}: mean loss {:.6} over {} batches",
                self.epochs_completed,
                mean_loss,
                self.batches.len()
            );

            self.batches = self.source.get_batches()?;
        }

        report.elapsed = start.elapsed();
        debug!(
            "Trained {} epochs ({} steps) in {:?}, last loss {:?}",
            epochs, report.steps, report.elapsed, report.last_loss
        );
        Ok(report)
    }
}
