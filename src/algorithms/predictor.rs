use super::RecommendationModel;
use crate::config::PredictionConfig;
use crate::error::{EvncfError, Result};
use crate::models::{Explanation, Interactions, PredictionRow};
use crate::utils::top_k_indices;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct TopKOptions {
    pub topk: usize,
    pub batch_size: usize,
    pub explain: bool,
    pub topk_keyphrases: usize,
}

impl TopKOptions {
    pub fn new(topk: usize, batch_size: usize) -> Self {
        Self {
            topk,
            batch_size,
            explain: false,
            topk_keyphrases: 0,
        }
    }

    pub fn with_explanations(mut self, topk_keyphrases: usize) -> Self {
        self.explain = true;
        self.topk_keyphrases = topk_keyphrases;
        self
    }

    pub fn from_config(config: &PredictionConfig) -> Self {
        Self::new(config.topk, config.predict_batch_size)
    }
}

/// Ranked items per user (index = user id) and, when requested, one
/// explanation per kept (user, item) pair in ranking order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopKPrediction {
    pub items: Vec<Vec<usize>>,
    pub explanations: Vec<Explanation>,
}

/// Scores every unrated item of every user and keeps the best `topk`.
///
/// Candidates are scored in ascending item order, `batch_size` pairs at a
/// time, and sorted with a stable descending sort: equal ratings keep the
/// lower item id first. Rows are never padded, so a user with fewer than
/// `topk` candidates gets a shorter row and a user who rated everything gets
/// an empty one.
pub fn predict_topk<M>(
    model: &M,
    observed: &Interactions,
    options: &TopKOptions,
    keyphrase_names: &[String],
) -> Result<TopKPrediction>
where
    M: RecommendationModel + ?Sized,
{
    check_options(options.batch_size, options.explain, model.text_dim(), keyphrase_names)?;
    if observed.num_users() != model.num_users() || observed.num_items() != model.num_items() {
        return Err(EvncfError::shape(
            format!("{} users x {} items", model.num_users(), model.num_items()),
            format!("{} users x {} items", observed.num_users(), observed.num_items()),
        ));
    }

    let rated = observed.rated_items();
    let ranked = rated
        .par_iter()
        .enumerate()
        .map(|(user, rated)| rank_user(model, user, rated, options, keyphrase_names))
        .collect::<Result<Vec<_>>>()?;

    let mut prediction = TopKPrediction::default();
    for (items, explanations) in ranked {
        prediction.items.push(items);
        prediction.explanations.extend(explanations);
    }

    info!(
        "Ranked top-{} items for {} users ({} explanations)",
        options.topk,
        prediction.items.len(),
        prediction.explanations.len()
    );
    Ok(prediction)
}

fn rank_user<M>(
    model: &M,
    user: usize,
    rated: &[usize],
    options: &TopKOptions,
    keyphrase_names: &[String],
) -> Result<(Vec<usize>, Vec<Explanation>)>
where
    M: RecommendationModel + ?Sized,
{
    let candidates: Vec<usize> = (0..model.num_items())
        .filter(|item| rated.binary_search(item).is_err())
        .collect();

    let mut scored: Vec<PredictionRow> = Vec::with_capacity(candidates.len());
    for chunk in candidates.chunks(options.batch_size) {
        let users = vec![user; chunk.len()];
        let prediction = model.predict(&users, chunk)?;
        scored.extend(chunk.iter().enumerate().map(|(r, &item_id)| PredictionRow {
            user_id: user,
            item_id,
            rating: prediction.ratings[r],
            keyphrase_scores: if options.explain {
                prediction.keyphrases.row(r).to_vec()
            } else {
                Vec::new()
            },
        }));
    }

    // Stable: ties stay in ascending item order.
    scored.sort_by(|a, b| b.rating.total_cmp(&a.rating));
    scored.truncate(options.topk);

    let items = scored.iter().map(|row| row.item_id).collect();
    let explanations = if options.explain {
        scored
            .iter()
            .map(|row| explain_row(row, keyphrase_names, options.topk_keyphrases))
            .collect()
    } else {
        Vec::new()
    };

    debug!("user {}: {} candidates, kept {}", user, candidates.len(), scored.len());
    Ok((items, explanations))
}

/// Top keyphrases for explicit (user, item) pairs, e.g. held-out test pairs.
pub fn explain_pairs<M>(
    model: &M,
    pairs: &[(usize, usize)],
    keyphrase_names: &[String],
    topk_keyphrases: usize,
    batch_size: usize,
) -> Result<Vec<Explanation>>
where
    M: RecommendationModel + ?Sized,
{
    check_options(batch_size, true, model.text_dim(), keyphrase_names)?;

    let mut explanations = Vec::with_capacity(pairs.len());
    for chunk in pairs.chunks(batch_size) {
        let (user_ids, item_ids): (Vec<usize>, Vec<usize>) = chunk.iter().copied().unzip();
        let prediction = model.predict(&user_ids, &item_ids)?;
        explanations.extend(
            prediction
                .rows(&user_ids, &item_ids)
                .iter()
                .map(|row| explain_row(row, keyphrase_names, topk_keyphrases)),
        );
    }

    info!("Explained {} pairs with top-{} keyphrases", explanations.len(), topk_keyphrases);
    Ok(explanations)
}

fn explain_row(row: &PredictionRow, keyphrase_names: &[String], topk_keyphrases: usize) -> Explanation {
    let keyphrase_indices = top_k_indices(&row.keyphrase_scores, topk_keyphrases);
    let keyphrases = keyphrase_indices
        .iter()
        .filter_map(|&k| keyphrase_names.get(k).cloned())
        .collect();

    Explanation {
        user_id: row.user_id,
        item_id: row.item_id,
        keyphrase_indices,
        keyphrases,
    }
}

fn check_options(batch_size: usize, explain: bool, text_dim: usize, keyphrase_names: &[String]) -> Result<()> {
    if batch_size == 0 {
        return Err(EvncfError::Configuration(
            "predict_batch_size must be positive".to_string(),
        ));
    }
    if explain && keyphrase_names.len() < text_dim {
        return Err(EvncfError::shape(
            format!("{} keyphrase names", text_dim),
            keyphrase_names.len(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::Prediction;
    use crate::models::Interaction;
    use ndarray::{Array1, Array2};

    /// Rating is looked up in a fixed table; keyphrase k scores `item * k`.
    struct TableModel {
        ratings: Array2<f32>,
        text_dim: usize,
    }

    impl RecommendationModel for TableModel {
        fn num_users(&self) -> usize {
            self.ratings.nrows()
        }

        fn num_items(&self) -> usize {
            self.ratings.ncols()
        }

        fn text_dim(&self) -> usize {
            self.text_dim
        }

        fn predict(&self, user_ids: &[usize], item_ids: &[usize]) -> Result<Prediction> {
            let ratings = Array1::from_iter(
                user_ids.iter().zip(item_ids).map(|(&u, &i)| self.ratings[[u, i]]),
            );
            let keyphrases = Array2::from_shape_fn((item_ids.len(), self.text_dim), |(r, k)| {
                item_ids[r] as f32 * k as f32
            });
            Ok(Prediction { ratings, keyphrases })
        }
    }

    fn model() -> TableModel {
        TableModel {
            ratings: ndarray::array![
                [0.1, 0.9, 0.5, 0.7, 0.3],
                [0.5, 0.5, 0.5, 0.5, 0.5],
                [0.9, 0.8, 0.7, 0.6, 0.5],
            ],
            text_dim: 3,
        }
    }

    fn observed() -> Interactions {
        Interactions::new(
            3,
            5,
            vec![
                Interaction::new(0, 1, 1.0),
                Interaction::new(1, 4, 1.0),
                Interaction::new(2, 0, 1.0),
                Interaction::new(2, 1, 1.0),
                Interaction::new(2, 2, 1.0),
                Interaction::new(2, 3, 1.0),
                Interaction::new(2, 4, 1.0),
            ],
        )
        .unwrap()
    }

    fn names() -> Vec<String> {
        vec!["cozy".to_string(), "spicy".to_string(), "cheap".to_string()]
    }

    #[test]
    fn test_topk_excludes_rated_items() {
        let result = predict_topk(&model(), &observed(), &TopKOptions::new(3, 2), &[]).unwrap();

        assert_eq!(result.items[0], vec![3, 2, 4]);
        assert!(!result.items[0].contains(&1));
        assert!(result.explanations.is_empty());
    }

    #[test]
    fn test_ties_keep_ascending_item_order() {
        let result = predict_topk(&model(), &observed(), &TopKOptions::new(10, 3), &[]).unwrap();
        assert_eq!(result.items[1], vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_user_without_candidates_gets_empty_row() {
        let result = predict_topk(&model(), &observed(), &TopKOptions::new(2, 4), &[]).unwrap();

        assert_eq!(result.items.len(), 3);
        assert!(result.items[2].is_empty());
        for (user, items) in result.items.iter().enumerate() {
            let rated = observed().rated_items()[user].len();
            assert!(items.len() <= 2.min(5 - rated));
        }
    }

    #[test]
    fn test_batch_size_does_not_change_ranking() {
        let small = predict_topk(&model(), &observed(), &TopKOptions::new(4, 1), &[]).unwrap();
        let large = predict_topk(&model(), &observed(), &TopKOptions::new(4, 100), &[]).unwrap();
        assert_eq!(small, large);
    }

    #[test]
    fn test_explanations_follow_ranking() {
        let options = TopKOptions::new(2, 8).with_explanations(2);
        let result = predict_topk(&model(), &observed(), &options, &names()).unwrap();

        assert_eq!(result.explanations.len(), 4);
        let first = &result.explanations[0];
        assert_eq!((first.user_id, first.item_id), (0, 3));
        assert_eq!(first.keyphrase_indices, vec![2, 1]);
        assert_eq!(first.keyphrases, vec!["cheap".to_string(), "spicy".to_string()]);
    }

    #[test]
    fn test_explain_requires_names() {
        let options = TopKOptions::new(2, 8).with_explanations(2);
        let result = predict_topk(&model(), &observed(), &options, &names()[..1]);
        assert!(matches!(result, Err(EvncfError::ShapeMismatch(_))));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = predict_topk(&model(), &observed(), &TopKOptions::new(2, 0), &[]);
        assert!(matches!(result, Err(EvncfError::Configuration(_))));
    }

    #[test]
    fn test_explain_pairs() {
        let explanations = explain_pairs(&model(), &[(0, 0), (2, 4), (1, 2)], &names(), 1, 2).unwrap();

        assert_eq!(explanations.len(), 3);
        assert_eq!(explanations[1].item_id, 4);
        assert_eq!(explanations[1].keyphrase_indices, vec![2]);
        // Item 0 scores every keyphrase 0; the stable order keeps index 0.
        assert_eq!(explanations[0].keyphrase_indices, vec![0]);
    }
}
