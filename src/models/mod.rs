use crate::error::{EvncfError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One observed user-item interaction. `keyphrases` lists the keyphrase
/// indices mentioned for the pair; a repeated index counts more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: usize,
    pub item_id: usize,
    #[serde(default = "default_rating")]
    pub rating: f32,
    #[serde(default)]
    pub keyphrases: Vec<usize>,
}

fn default_rating() -> f32 {
    1.0
}

impl Interaction {
    pub fn new(user_id: usize, item_id: usize, rating: f32) -> Self {
        Self {
            user_id,
            item_id,
            rating,
            keyphrases: Vec::new(),
        }
    }

    pub fn with_keyphrases(mut self, keyphrases: Vec<usize>) -> Self {
        self.keyphrases = keyphrases;
        self
    }
}

/// Sparse keyphrase incidence rows, one per interaction in a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyphraseRows {
    rows: Vec<Vec<usize>>,
}

impl KeyphraseRows {
    pub fn new(rows: Vec<Vec<usize>>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> &[usize] {
        &self.rows[index]
    }

    /// Materializes the rows as a dense `(rows, text_dim)` count matrix.
    pub fn to_dense(&self, text_dim: usize) -> Result<Array2<f32>> {
        let mut dense = Array2::zeros((self.rows.len(), text_dim));
        for (r, row) in self.rows.iter().enumerate() {
            for &k in row {
                if k >= text_dim {
                    return Err(EvncfError::ShapeMismatch(format!(
                        "keyphrase {} in row {} exceeds text_dim {}",
                        k, r, text_dim
                    )));
                }
                dense[[r, k]] += 1.0;
            }
        }
        Ok(dense)
    }
}

/// A batch of parallel interaction columns fed to one training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionBatch {
    pub user_ids: Vec<usize>,
    pub item_ids: Vec<usize>,
    pub ratings: Vec<f32>,
    pub keyphrases: KeyphraseRows,
}

impl InteractionBatch {
    pub fn new(
        user_ids: Vec<usize>,
        item_ids: Vec<usize>,
        ratings: Vec<f32>,
        keyphrases: KeyphraseRows,
    ) -> Self {
        Self {
            user_ids,
            item_ids,
            ratings,
            keyphrases,
        }
    }

    pub fn from_interactions(interactions: &[Interaction]) -> Self {
        Self {
            user_ids: interactions.iter().map(|i| i.user_id).collect(),
            item_ids: interactions.iter().map(|i| i.item_id).collect(),
            ratings: interactions.iter().map(|i| i.rating).collect(),
            keyphrases: KeyphraseRows::new(
                interactions.iter().map(|i| i.keyphrases.clone()).collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }
}

/// The observed interaction table of a training split.
#[derive(Debug, Clone, PartialEq)]
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    records: Vec<Interaction>,
}

impl Interactions {
    pub fn new(num_users: usize, num_items: usize, records: Vec<Interaction>) -> Result<Self> {
        for record in &records {
            if record.user_id >= num_users || record.item_id >= num_items {
                return Err(EvncfError::InvalidIndex(format!(
                    "interaction ({}, {}) outside {} users x {} items",
                    record.user_id, record.item_id, num_users, num_items
                )));
            }
        }

        Ok(Self {
            num_users,
            num_items,
            records,
        })
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn records(&self) -> &[Interaction] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sorted, deduplicated item indices per user.
    pub fn rated_items(&self) -> Vec<Vec<usize>> {
        let mut rated = vec![Vec::new(); self.num_users];
        for record in &self.records {
            rated[record.user_id].push(record.item_id);
        }
        for items in rated.iter_mut() {
            items.sort_unstable();
            items.dedup();
        }
        rated
    }

    /// Dense `(num_users, num_items)` rating matrix; duplicate pairs keep the
    /// last rating seen.
    pub fn rating_matrix(&self) -> Array2<f32> {
        let mut matrix = Array2::zeros((self.num_users, self.num_items));
        for record in &self.records {
            matrix[[record.user_id, record.item_id]] = record.rating;
        }
        matrix
    }
}

/// Train/test split with its keyphrase vocabulary, as read by the trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub num_users: usize,
    pub num_items: usize,
    pub keyphrase_names: Vec<String>,
    pub train: Vec<Interaction>,
    pub test: Vec<Interaction>,
}

impl Dataset {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn text_dim(&self) -> usize {
        self.keyphrase_names.len()
    }

    pub fn train_interactions(&self) -> Result<Interactions> {
        Interactions::new(self.num_users, self.num_items, self.train.clone())
    }

    pub fn test_interactions(&self) -> Result<Interactions> {
        Interactions::new(self.num_users, self.num_items, self.test.clone())
    }
}

/// Scores for one (user, item) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub user_id: usize,
    pub item_id: usize,
    pub rating: f32,
    pub keyphrase_scores: Vec<f32>,
}

impl PredictionRow {
    /// `[user_id, item_id, rating, keyphrase_scores...]`
    pub fn to_vec(&self) -> Vec<f32> {
        let mut row = Vec::with_capacity(3 + self.keyphrase_scores.len());
        row.push(self.user_id as f32);
        row.push(self.item_id as f32);
        row.push(self.rating);
        row.extend_from_slice(&self.keyphrase_scores);
        row
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub user_id: usize,
    pub item_id: usize,
    pub keyphrase_indices: Vec<usize>,
    pub keyphrases: Vec<String>,
}
