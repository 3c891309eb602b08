pub mod initializer;
pub mod layers;
pub mod optimizer;
pub mod predictor;
pub mod sampler;
pub mod vncf;

pub use predictor::{explain_pairs, predict_topk, TopKOptions, TopKPrediction};
pub use sampler::{BatchSource, NegativeSampler};
pub use vncf::{ExplainableVncf, VncfSettings};

use crate::error::Result;
use crate::models::PredictionRow;
use ndarray::{Array1, Array2};

/// Ratings and keyphrase scores for a list of (user, item) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub ratings: Array1<f32>,
    pub keyphrases: Array2<f32>,
}

impl Prediction {
    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    pub fn rows(&self, user_ids: &[usize], item_ids: &[usize]) -> Vec<PredictionRow> {
        user_ids
            .iter()
            .zip(item_ids)
            .enumerate()
            .map(|(r, (&user_id, &item_id))| PredictionRow {
                user_id,
                item_id,
                rating: self.ratings[r],
                keyphrase_scores: self.keyphrases.row(r).to_vec(),
            })
            .collect()
    }
}

/// A trained model that scores (user, item) pairs in inference mode.
pub trait RecommendationModel: Send + Sync {
    fn num_users(&self) -> usize;
    fn num_items(&self) -> usize;
    fn text_dim(&self) -> usize;
    fn predict(&self, user_ids: &[usize], item_ids: &[usize]) -> Result<Prediction>;
}
