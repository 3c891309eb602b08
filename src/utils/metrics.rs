use super::mean;
use crate::error::{EvncfError, Result};
use crate::models::{Explanation, Interactions};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

pub const RANKING_METRICS: [&str; 6] = ["R-Precision", "NDCG", "Clicks", "Recall", "Precision", "MAP"];
pub const EXPLANATION_METRICS: [&str; 4] = ["NDCG", "Recall", "Precision", "MAP"];

/// Metric name -> one mean score per requested cutoff.
pub type MetricScores = BTreeMap<String, Vec<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    RPrecision,
    Ndcg,
    Clicks,
    Recall,
    Precision,
    Map,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::RPrecision => "R-Precision",
            Metric::Ndcg => "NDCG",
            Metric::Clicks => "Clicks",
            Metric::Recall => "Recall",
            Metric::Precision => "Precision",
            Metric::Map => "MAP",
        }
    }

    pub fn parse_all(names: &[String]) -> Result<Vec<Metric>> {
        names.iter().map(|name| name.parse()).collect()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = EvncfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "R-Precision" => Ok(Metric::RPrecision),
            "NDCG" => Ok(Metric::Ndcg),
            "Clicks" => Ok(Metric::Clicks),
            "Recall" => Ok(Metric::Recall),
            "Precision" => Ok(Metric::Precision),
            "MAP" => Ok(Metric::Map),
            other => Err(EvncfError::Configuration(format!("unknown metric '{}'", other))),
        }
    }
}

/// Ranking metrics at a single cutoff `k` with binary relevance.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn score(&self, metric: Metric, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        match metric {
            Metric::RPrecision => self.calculate_r_precision(recommended, relevant),
            Metric::Ndcg => self.calculate_ndcg_at_k(recommended, relevant),
            Metric::Clicks => self.calculate_clicks(recommended, relevant),
            Metric::Recall => self.calculate_recall_at_k(recommended, relevant),
            Metric::Precision => self.calculate_precision_at_k(recommended, relevant),
            Metric::Map => self.calculate_average_precision(recommended, relevant),
        }
    }

    fn hits<'a>(&self, recommended: &'a [usize], relevant: &'a HashSet<usize>) -> impl Iterator<Item = bool> + 'a {
        recommended
            .iter()
            .take(self.k)
            .map(move |item| relevant.contains(item))
    }

    /// Hits among the first `|relevant|` recommendations; ignores `k`.
    pub fn calculate_r_precision(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let hits = recommended
            .iter()
            .take(relevant.len())
            .filter(|item| relevant.contains(item))
            .count();
        hits as f64 / relevant.len() as f64
    }

    pub fn calculate_precision_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if self.k == 0 {
            return 0.0;
        }

        let hits = self.hits(recommended, relevant).filter(|&hit| hit).count();
        hits as f64 / self.k as f64
    }

    pub fn calculate_recall_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let hits = self.hits(recommended, relevant).filter(|&hit| hit).count();
        hits as f64 / relevant.len() as f64
    }

    pub fn calculate_ndcg_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        let dcg: f64 = self
            .hits(recommended, relevant)
            .enumerate()
            .filter(|&(_, hit)| hit)
            .map(|(i, _)| discount(i))
            .sum();
        let idcg: f64 = (0..self.k.min(relevant.len())).map(discount).sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    /// Pages of ten results scanned before the first hit; `k / 10` on a miss.
    pub fn calculate_clicks(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        match self.hits(recommended, relevant).position(|hit| hit) {
            Some(first_hit) => first_hit as f64 / 10.0,
            None => self.k as f64 / 10.0,
        }
    }

    pub fn calculate_average_precision(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        let denominator = self.k.min(relevant.len());
        if denominator == 0 {
            return 0.0;
        }

        let mut relevant_found = 0;
        let mut precision_sum = 0.0;
        for (i, hit) in self.hits(recommended, relevant).enumerate() {
            if hit {
                relevant_found += 1;
                precision_sum += relevant_found as f64 / (i + 1) as f64;
            }
        }

        precision_sum / denominator as f64
    }
}

fn discount(position: usize) -> f64 {
    1.0 / ((position + 2) as f64).log2()
}

fn score_lists<'a, I>(lists: I, metrics: &[Metric], cutoffs: &[usize]) -> MetricScores
where
    I: Iterator<Item = (&'a [usize], &'a HashSet<usize>)>,
{
    let mut per_metric: Vec<Vec<Vec<f64>>> = vec![vec![Vec::new(); cutoffs.len()]; metrics.len()];
    for (recommended, relevant) in lists {
        for (c, &k) in cutoffs.iter().enumerate() {
            let calculator = MetricsCalculator::new(k);
            for (m, &metric) in metrics.iter().enumerate() {
                per_metric[m][c].push(calculator.score(metric, recommended, relevant));
            }
        }
    }

    metrics
        .iter()
        .zip(per_metric)
        .map(|(metric, scores)| {
            (
                metric.name().to_string(),
                scores.iter().map(|values| mean(values)).collect(),
            )
        })
        .collect()
}

/// Scores ranked item lists (index = user id) against held-out interactions.
/// Users without held-out items are left out of the means.
pub fn evaluate(
    predictions: &[Vec<usize>],
    held_out: &Interactions,
    metric_names: &[String],
    cutoffs: &[usize],
) -> Result<MetricScores> {
    let metrics = Metric::parse_all(metric_names)?;
    if predictions.len() != held_out.num_users() {
        return Err(EvncfError::shape(
            format!("{} prediction rows", held_out.num_users()),
            predictions.len(),
        ));
    }

    let relevant: Vec<HashSet<usize>> = held_out
        .rated_items()
        .into_iter()
        .map(|items| items.into_iter().collect())
        .collect();
    let lists = predictions
        .iter()
        .zip(&relevant)
        .filter(|(_, relevant)| !relevant.is_empty())
        .map(|(recommended, relevant)| (recommended.as_slice(), relevant));

    let scores = score_lists(lists, &metrics, cutoffs);
    debug!(
        "Evaluated {} users with held-out items",
        relevant.iter().filter(|r| !r.is_empty()).count()
    );
    Ok(scores)
}

/// Scores predicted keyphrase lists against the keyphrases recorded for the
/// same (user, item) pair. Pairs without reference keyphrases are skipped.
pub fn evaluate_explanation(
    explanations: &[Explanation],
    references: &Interactions,
    metric_names: &[String],
    cutoffs: &[usize],
) -> Result<MetricScores> {
    let metrics = Metric::parse_all(metric_names)?;

    let mut reference: HashMap<(usize, usize), HashSet<usize>> = HashMap::new();
    for record in references.records() {
        reference
            .entry((record.user_id, record.item_id))
            .or_default()
            .extend(record.keyphrases.iter().copied());
    }

    let lists = explanations.iter().filter_map(|explanation| {
        reference
            .get(&(explanation.user_id, explanation.item_id))
            .filter(|keyphrases| !keyphrases.is_empty())
            .map(|keyphrases| (explanation.keyphrase_indices.as_slice(), keyphrases))
    });

    Ok(score_lists(lists, &metrics, cutoffs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Interaction;

    fn set(items: &[usize]) -> HashSet<usize> {
        items.iter().copied().collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_precision_and_recall() {
        let calc = MetricsCalculator::new(4);
        let relevant = set(&[1, 5, 9]);
        let recommended = [5, 2, 9, 7, 1];

        assert!(close(calc.calculate_precision_at_k(&recommended, &relevant), 0.5));
        assert!(close(calc.calculate_recall_at_k(&recommended, &relevant), 2.0 / 3.0));
    }

    #[test]
    fn test_r_precision_uses_relevant_count() {
        let calc = MetricsCalculator::new(10);
        let relevant = set(&[1, 5]);
        assert!(close(calc.calculate_r_precision(&[5, 3, 1], &relevant), 0.5));
    }

    #[test]
    fn test_ndcg_perfect_and_partial() {
        let calc = MetricsCalculator::new(3);
        let relevant = set(&[4, 8]);

        assert!(close(calc.calculate_ndcg_at_k(&[8, 4, 0], &relevant), 1.0));

        let expected = 0.5 / (1.0 + 1.0 / 3f64.log2());
        assert!(close(calc.calculate_ndcg_at_k(&[0, 2, 4], &relevant), expected));
    }

    #[test]
    fn test_clicks() {
        let calc = MetricsCalculator::new(10);
        let relevant = set(&[3]);

        assert!(close(calc.calculate_clicks(&[3, 1], &relevant), 0.0));
        assert!(close(calc.calculate_clicks(&[0, 1, 2, 3], &relevant), 0.3));
        assert!(close(calc.calculate_clicks(&[0, 1], &relevant), 1.0));
    }

    #[test]
    fn test_average_precision() {
        let calc = MetricsCalculator::new(3);
        let relevant = set(&[1, 2]);
        // Hits at ranks 1 and 3: (1/1 + 2/3) / 2.
        let ap = calc.calculate_average_precision(&[1, 0, 2], &relevant);
        assert!(close(ap, (1.0 + 2.0 / 3.0) / 2.0));
    }

    #[test]
    fn test_evaluate_skips_users_without_held_out_items() {
        let held_out = Interactions::new(
            3,
            6,
            vec![Interaction::new(0, 2, 1.0), Interaction::new(2, 5, 1.0)],
        )
        .unwrap();
        let predictions = vec![vec![2, 0], vec![1, 3], vec![0, 1]];
        let names: Vec<String> = ["Recall", "Precision"].iter().map(|s| s.to_string()).collect();

        let scores = evaluate(&predictions, &held_out, &names, &[1, 2]).unwrap();

        assert_eq!(scores["Recall"], vec![0.5, 0.5]);
        assert_eq!(scores["Precision"], vec![0.5, 0.25]);
    }

    #[test]
    fn test_evaluate_rejects_unknown_metric_and_row_count() {
        let held_out = Interactions::new(1, 2, vec![Interaction::new(0, 1, 1.0)]).unwrap();

        let unknown = evaluate(&[vec![1]], &held_out, &["F1".to_string()], &[1]);
        assert!(matches!(unknown, Err(EvncfError::Configuration(_))));

        let rows = evaluate(&[], &held_out, &["NDCG".to_string()], &[1]);
        assert!(matches!(rows, Err(EvncfError::ShapeMismatch(_))));
    }

    #[test]
    fn test_evaluate_explanation_matches_pairs() {
        let references = Interactions::new(
            2,
            3,
            vec![
                Interaction::new(0, 1, 1.0).with_keyphrases(vec![0, 2]),
                Interaction::new(1, 2, 1.0),
            ],
        )
        .unwrap();
        let explanations = vec![
            Explanation {
                user_id: 0,
                item_id: 1,
                keyphrase_indices: vec![2, 1],
                keyphrases: vec![],
            },
            Explanation {
                user_id: 1,
                item_id: 2,
                keyphrase_indices: vec![0, 1],
                keyphrases: vec![],
            },
        ];

        let names: Vec<String> = EXPLANATION_METRICS.iter().map(|s| s.to_string()).collect();
        let scores = evaluate_explanation(&explanations, &references, &names, &[2]).unwrap();

        assert_eq!(scores.len(), 4);
        assert!(close(scores["Precision"][0], 0.5));
        assert!(close(scores["Recall"][0], 0.5));
        assert!(close(scores["MAP"][0], 0.5));
    }
}
