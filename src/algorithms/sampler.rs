use crate::error::{EvncfError, Result};
use crate::models::{Interaction, InteractionBatch, Interactions};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Producer of training batches for one epoch.
pub trait BatchSource {
    /// A freshly drawn, ordered batch collection covering one epoch.
    fn get_batches(&mut self) -> Result<Vec<InteractionBatch>>;

    /// The observed interaction table the batches are drawn from.
    fn interactions(&self) -> &Interactions;
}

/// Mixes every observed interaction with uniformly drawn unobserved items
/// (rating 0, no keyphrases). Negatives are redrawn on every call.
pub struct NegativeSampler {
    interactions: Interactions,
    rated: Vec<Vec<usize>>,
    batch_size: usize,
    negative_sampling_size: usize,
    rng: StdRng,
}

impl NegativeSampler {
    pub fn new(interactions: Interactions, batch_size: usize, negative_sampling_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(EvncfError::Configuration(
                "train_batch_size must be positive".to_string(),
            ));
        }

        let rated = interactions.rated_items();
        Ok(Self {
            interactions,
            rated,
            batch_size,
            negative_sampling_size,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn negative_sampling_size(&self) -> usize {
        self.negative_sampling_size
    }

    fn draw_negative(&mut self, user: usize) -> Option<usize> {
        let num_items = self.interactions.num_items();
        let rated = &self.rated[user];
        if rated.len() >= num_items {
            return None;
        }

        // Dense users: pick directly from the complement.
        if rated.len() * 2 > num_items {
            let candidates: Vec<usize> = (0..num_items)
                .filter(|item| rated.binary_search(item).is_err())
                .collect();
            return candidates.choose(&mut self.rng).copied();
        }

        loop {
            let item = self.rng.gen_range(0..num_items);
            if rated.binary_search(&item).is_err() {
                return Some(item);
            }
        }
    }
}

impl BatchSource for NegativeSampler {
    fn get_batches(&mut self) -> Result<Vec<InteractionBatch>> {
        let positives = self.interactions.len();
        let mut rows: Vec<Interaction> = Vec::with_capacity(positives * (1 + self.negative_sampling_size));
        rows.extend(self.interactions.records().iter().cloned());

        for index in 0..positives {
            let user = self.interactions.records()[index].user_id;
            for _ in 0..self.negative_sampling_size {
                match self.draw_negative(user) {
                    Some(item) => rows.push(Interaction::new(user, item, 0.0)),
                    None => break,
                }
            }
        }

        rows.shuffle(&mut self.rng);
        let batches: Vec<InteractionBatch> = rows
            .chunks(self.batch_size)
            .map(InteractionBatch::from_interactions)
            .collect();

        debug!(
            "Sampled {} positives and {} negatives into {} batches",
            positives,
            rows.len() - positives,
            batches.len()
        );
        Ok(batches)
    }

    fn interactions(&self) -> &Interactions {
        &self.interactions
    }
}
