use crate::error::{EvncfError, Result};
use crate::models::Interactions;
use nalgebra::DMatrix;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use tracing::debug;

pub fn normal<R: Rng + ?Sized>(rng: &mut R, rows: usize, cols: usize, std_dev: f32) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || {
        let z: f32 = rng.sample(StandardNormal);
        z * std_dev
    })
}

/// Glorot/Xavier uniform kernel for a dense layer.
pub fn xavier_uniform<R: Rng + ?Sized>(rng: &mut R, fan_in: usize, fan_out: usize) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);
    Array2::from_shape_simple_fn((fan_in, fan_out), || dist.sample(rng))
}

pub fn zeros(size: usize) -> Array1<f32> {
    Array1::zeros(size)
}

/// Embedding table initialized from N(0, 1/sqrt(embed_dim)).
pub fn embedding_table<R: Rng + ?Sized>(rng: &mut R, count: usize, embed_dim: usize) -> Array2<f32> {
    normal(rng, count, embed_dim, 1.0 / (embed_dim as f32).sqrt())
}

/// User and item embeddings derived from a truncated SVD of the observed rating
/// matrix: `U_k * sqrt(S_k)` and `V_k * sqrt(S_k)`. Columns beyond the rank of
/// the matrix are left at zero.
pub fn svd_embeddings(interactions: &Interactions, embed_dim: usize) -> Result<(Array2<f32>, Array2<f32>)> {
    if embed_dim == 0 {
        return Err(EvncfError::Configuration(
            "embed_dim must be positive for SVD initialization".to_string(),
        ));
    }

    let num_users = interactions.num_users();
    let num_items = interactions.num_items();
    let ratings = interactions.rating_matrix();
    let matrix = DMatrix::from_fn(num_users, num_items, |r, c| ratings[[r, c]] as f64);

    let svd = matrix.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(EvncfError::NumericInstability(
                "SVD did not produce singular vectors".to_string(),
            ))
        }
    };

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

    let rank = embed_dim.min(order.len());
    let mut user_embeddings = Array2::zeros((num_users, embed_dim));
    let mut item_embeddings = Array2::zeros((num_items, embed_dim));

    for (k, &component) in order.iter().take(rank).enumerate() {
        let scale = svd.singular_values[component].max(0.0).sqrt();
        for user in 0..num_users {
            user_embeddings[[user, k]] = (u[(user, component)] * scale) as f32;
        }
        for item in 0..num_items {
            item_embeddings[[item, k]] = (v_t[(component, item)] * scale) as f32;
        }
    }

    debug!(
        "SVD initialization: {} users, {} items, {} of {} components kept",
        num_users,
        num_items,
        rank,
        embed_dim
    );

    Ok((user_embeddings, item_embeddings))
}
