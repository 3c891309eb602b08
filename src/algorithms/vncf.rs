use super::initializer;
use super::layers::{Dense, DenseGradient};
use super::optimizer::{build_optimizer, Optimizer};
use super::{Prediction, RecommendationModel};
use crate::config::OptimizerKind;
use crate::error::{EvncfError, Result};
use crate::models::InteractionBatch;
use crate::utils::validation;
use chrono::{DateTime, Utc};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const KL_WEIGHT: f32 = 0.01;
/// log-std is squashed into `[-LOG_STD_BOUND, LOG_STD_BOUND]`.
pub const LOG_STD_BOUND: f32 = 3.0;
const CHECKPOINT_FILE: &str = "model.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VncfSettings {
    pub num_users: usize,
    pub num_items: usize,
    pub text_dim: usize,
    pub embed_dim: usize,
    pub num_layers: usize,
    pub lamb: f32,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub seed: Option<u64>,
}

impl VncfSettings {
    pub fn new(
        num_users: usize,
        num_items: usize,
        text_dim: usize,
        embed_dim: usize,
        num_layers: usize,
        lamb: f32,
        learning_rate: f64,
    ) -> Self {
        Self {
            num_users,
            num_items,
            text_dim,
            embed_dim,
            num_layers,
            lamb,
            learning_rate,
            optimizer: OptimizerKind::Adam,
            seed: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn hidden_dim(&self) -> usize {
        4 * self.embed_dim
    }

    pub fn latent_dim(&self) -> usize {
        2 * self.embed_dim
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub user_embeddings: Array2<f32>,
    pub item_embeddings: Array2<f32>,
    pub residual: Vec<Dense>,
    pub rating_head: Dense,
    pub keyphrase_head: Dense,
}

impl Parameters {
    fn initialize<R: Rng + ?Sized>(settings: &VncfSettings, rng: &mut R) -> Self {
        let user_embeddings = initializer::embedding_table(rng, settings.num_users, settings.embed_dim);
        let item_embeddings = initializer::embedding_table(rng, settings.num_items, settings.embed_dim);

        let mut residual = Vec::with_capacity(settings.num_layers);
        let mut input_dim = 2 * settings.embed_dim;
        for _ in 0..settings.num_layers {
            residual.push(Dense::new(rng, input_dim, settings.hidden_dim()));
            input_dim = settings.hidden_dim();
        }

        Self {
            user_embeddings,
            item_embeddings,
            residual,
            rating_head: Dense::new(rng, settings.latent_dim(), 1),
            keyphrase_head: Dense::new(rng, settings.latent_dim(), settings.text_dim),
        }
    }

    /// `lamb * sum(W^2)` over every regularized kernel; embeddings and biases
    /// are not regularized.
    pub fn l2_penalty(&self, lamb: f32) -> f32 {
        self.residual.iter().map(|layer| layer.l2_penalty(lamb)).sum::<f32>()
            + self.rating_head.l2_penalty(lamb)
            + self.keyphrase_head.l2_penalty(lamb)
    }

    fn check_shapes(&self, settings: &VncfSettings) -> Result<()> {
        let expect = |name: &str, found: &[usize], expected: [usize; 2]| -> Result<()> {
            if found != expected {
                return Err(EvncfError::shape(
                    format!("{} {:?}", name, expected),
                    format!("{:?}", found),
                ));
            }
            Ok(())
        };

        expect("user embeddings", self.user_embeddings.shape(), [settings.num_users, settings.embed_dim])?;
        expect("item embeddings", self.item_embeddings.shape(), [settings.num_items, settings.embed_dim])?;

        if self.residual.len() != settings.num_layers {
            return Err(EvncfError::shape(
                format!("{} residual layers", settings.num_layers),
                self.residual.len(),
            ));
        }
        let mut input_dim = 2 * settings.embed_dim;
        for layer in &self.residual {
            expect("residual kernel", layer.kernel.shape(), [input_dim, settings.hidden_dim()])?;
            input_dim = settings.hidden_dim();
        }

        expect("rating head", self.rating_head.kernel.shape(), [settings.latent_dim(), 1])?;
        expect(
            "keyphrase head",
            self.keyphrase_head.kernel.shape(),
            [settings.latent_dim(), settings.text_dim],
        )?;
        Ok(())
    }
}

struct Gradients {
    user_embeddings: Array2<f32>,
    item_embeddings: Array2<f32>,
    residual: Vec<DenseGradient>,
    rating_head: DenseGradient,
    keyphrase_head: DenseGradient,
}

#[derive(Debug, Clone)]
pub struct LatentCode {
    pub mean: Array2<f32>,
    pub log_std: Array2<f32>,
    pub z: Array2<f32>,
}

/// Random draws of one forward pass. Inference uses neither.
#[derive(Default)]
struct Perturbation {
    dropout_mask: Option<Array2<f32>>,
    noise: Option<Array2<f32>>,
}

struct ForwardPass {
    layer_inputs: Vec<Array2<f32>>,
    pre_latent: Array2<f32>,
    latent: LatentCode,
    rating: Array2<f32>,
    keyphrases: Array2<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub rating: f32,
    pub keyphrase: f32,
    pub kl: f32,
    pub l2: f32,
    pub total: f32,
}

/// Splits the encoder output into the latent mean (rectified) and the bounded
/// log standard deviation.
pub fn split_latent(pre_latent: &Array2<f32>, embed_dim: usize) -> (Array2<f32>, Array2<f32>) {
    let half = 2 * embed_dim;
    let mean = pre_latent.slice(s![.., ..half]).mapv(|x| x.max(0.0));
    let log_std = pre_latent
        .slice(s![.., half..])
        .mapv(|x| LOG_STD_BOUND * x.tanh());
    (mean, log_std)
}

/// `mean + exp(log_std) * noise` when noise is given, otherwise the mean.
pub fn reparameterize(mean: &Array2<f32>, log_std: &Array2<f32>, noise: Option<&Array2<f32>>) -> Array2<f32> {
    match noise {
        Some(noise) => {
            let mut z = log_std.mapv(f32::exp) * noise;
            z += mean;
            z
        }
        None => mean.clone(),
    }
}

/// KL(N(mean, exp(log_std)^2) || N(0, I)), averaged over every element.
pub fn kl_divergence(mean: &Array2<f32>, log_std: &Array2<f32>) -> f32 {
    if mean.is_empty() {
        return 0.0;
    }
    let total = Zip::from(mean)
        .and(log_std)
        .fold(0.0f32, |acc, &m, &ls| acc + m * m + (2.0 * ls).exp() - 1.0 - 2.0 * ls);
    0.5 * total / mean.len() as f32
}

/// 1.0 for rows with at least one nonzero keyphrase target, else 0.0.
pub fn keyphrase_mask(targets: &Array2<f32>) -> Array1<f32> {
    targets.map_axis(Axis(1), |row| {
        if row.iter().any(|&v| v != 0.0) {
            1.0
        } else {
            0.0
        }
    })
}

pub fn rating_loss(predictions: ArrayView1<f32>, targets: ArrayView1<f32>) -> f32 {
    if predictions.is_empty() {
        return 0.0;
    }
    let total = Zip::from(&predictions)
        .and(&targets)
        .fold(0.0f32, |acc, &p, &t| acc + (p - t) * (p - t));
    total / predictions.len() as f32
}

/// Per-row mean squared error, zeroed for masked rows, averaged over rows.
pub fn keyphrase_loss(predictions: &Array2<f32>, targets: &Array2<f32>, mask: &Array1<f32>) -> f32 {
    let (rows, cols) = predictions.dim();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let squared = (predictions - targets).mapv(|d| d * d);
    let per_row = squared.sum_axis(Axis(1)) / cols as f32;
    (per_row * mask).sum() / rows as f32
}

fn forward(
    params: &Parameters,
    settings: &VncfSettings,
    user_ids: &[usize],
    item_ids: &[usize],
    perturbation: &Perturbation,
) -> ForwardPass {
    let users = params.user_embeddings.select(Axis(0), user_ids);
    let items = params.item_embeddings.select(Axis(0), item_ids);

    let mut hidden = concatenate![Axis(1), users, items];
    if let Some(mask) = &perturbation.dropout_mask {
        hidden *= mask;
    }

    // Linear stack, no activation between blocks.
    let mut layer_inputs = Vec::with_capacity(params.residual.len());
    for layer in &params.residual {
        let next = layer.forward(&hidden);
        layer_inputs.push(hidden);
        hidden = next;
    }

    let (mean, log_std) = split_latent(&hidden, settings.embed_dim);
    let z = reparameterize(&mean, &log_std, perturbation.noise.as_ref());
    let rating = params.rating_head.forward(&z);
    let keyphrases = params.keyphrase_head.forward(&z);

    ForwardPass {
        layer_inputs,
        pre_latent: hidden,
        latent: LatentCode { mean, log_std, z },
        rating,
        keyphrases,
    }
}

#[allow(clippy::too_many_arguments)]
fn backward(
    params: &Parameters,
    settings: &VncfSettings,
    user_ids: &[usize],
    item_ids: &[usize],
    pass: &ForwardPass,
    perturbation: &Perturbation,
    ratings: &Array1<f32>,
    targets: &Array2<f32>,
    mask: &Array1<f32>,
) -> Gradients {
    let rows = user_ids.len() as f32;
    let lamb = settings.lamb;

    let mut grad_rating = pass.rating.clone();
    for (g, &r) in grad_rating.column_mut(0).iter_mut().zip(ratings.iter()) {
        *g = 2.0 * (*g - r) / rows;
    }

    // The mask is a constant: no gradient flows into it.
    let scale = 2.0 / (rows * settings.text_dim as f32);
    let mut grad_keyphrases = &pass.keyphrases - targets;
    Zip::from(grad_keyphrases.rows_mut())
        .and(mask)
        .for_each(|mut row, &m| row.mapv_inplace(|d| d * m * scale));

    let z = &pass.latent.z;
    let (rating_head, grad_z_rating) = params.rating_head.backward(z, &grad_rating, lamb);
    let (keyphrase_head, grad_z_keyphrase) = params.keyphrase_head.backward(z, &grad_keyphrases, lamb);
    let grad_z = grad_z_rating + grad_z_keyphrase;

    let latent = &pass.latent;
    let count = latent.mean.len() as f32;
    let half = settings.latent_dim();
    let pre_mean = pass.pre_latent.slice(s![.., ..half]);

    let mut grad_pre_mean = Array2::zeros(latent.mean.raw_dim());
    Zip::from(&mut grad_pre_mean)
        .and(&grad_z)
        .and(&latent.mean)
        .and(&pre_mean)
        .for_each(|g, &dz, &m, &pre| {
            let grad_mean = dz + KL_WEIGHT * m / count;
            *g = if pre > 0.0 { grad_mean } else { 0.0 };
        });

    let mut grad_pre_log_std = Array2::zeros(latent.log_std.raw_dim());
    if let Some(noise) = &perturbation.noise {
        Zip::from(&mut grad_pre_log_std)
            .and(&grad_z)
            .and(&latent.log_std)
            .and(noise)
            .for_each(|g, &dz, &ls, &eps| *g = dz * eps * ls.exp());
    }
    Zip::from(&mut grad_pre_log_std)
        .and(&latent.log_std)
        .for_each(|g, &ls| {
            let grad_log_std = *g + KL_WEIGHT * ((2.0 * ls).exp() - 1.0) / count;
            let tanh = ls / LOG_STD_BOUND;
            *g = grad_log_std * LOG_STD_BOUND * (1.0 - tanh * tanh);
        });

    let mut grad_hidden = concatenate![Axis(1), grad_pre_mean, grad_pre_log_std];

    let mut residual = Vec::with_capacity(params.residual.len());
    for (layer, input) in params.residual.iter().zip(&pass.layer_inputs).rev() {
        let (grad, grad_input) = layer.backward(input, &grad_hidden, lamb);
        residual.push(grad);
        grad_hidden = grad_input;
    }
    residual.reverse();

    if let Some(mask) = &perturbation.dropout_mask {
        grad_hidden *= mask;
    }

    let embed_dim = settings.embed_dim;
    let mut user_embeddings = Array2::zeros(params.user_embeddings.raw_dim());
    let mut item_embeddings = Array2::zeros(params.item_embeddings.raw_dim());
    for (row, (&user, &item)) in user_ids.iter().zip(item_ids).enumerate() {
        let grad = grad_hidden.row(row);
        let mut user_row = user_embeddings.row_mut(user);
        user_row += &grad.slice(s![..embed_dim]);
        let mut item_row = item_embeddings.row_mut(item);
        item_row += &grad.slice(s![embed_dim..]);
    }

    Gradients {
        user_embeddings,
        item_embeddings,
        residual,
        rating_head,
        keyphrase_head,
    }
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    settings: &'a VncfSettings,
    steps: usize,
    saved_at: DateTime<Utc>,
    parameters: &'a Parameters,
}

#[derive(Deserialize)]
struct Checkpoint {
    settings: VncfSettings,
    steps: usize,
    saved_at: DateTime<Utc>,
    parameters: Parameters,
}

pub fn checkpoint_path(path: impl AsRef<Path>, name: &str) -> PathBuf {
    path.as_ref().join(name).join(CHECKPOINT_FILE)
}

/// Explainable variational neural collaborative filtering model. Owns its
/// parameters, optimizer state and random stream for one training session.
pub struct ExplainableVncf {
    settings: VncfSettings,
    params: Parameters,
    optimizer: Box<dyn Optimizer>,
    rng: StdRng,
    steps: usize,
}

impl ExplainableVncf {
    pub fn build(settings: VncfSettings) -> Result<Self> {
        validation::validate_settings(&settings)?;

        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let params = Parameters::initialize(&settings, &mut rng);
        let optimizer = build_optimizer(settings.optimizer, settings.learning_rate);

        info!(
            "Built E-VNCF: {} users, {} items, text_dim {}, embed_dim {}, {} layers, optimizer {}",
            settings.num_users,
            settings.num_items,
            settings.text_dim,
            settings.embed_dim,
            settings.num_layers,
            settings.optimizer
        );

        Ok(Self {
            settings,
            params,
            optimizer,
            rng,
            steps: 0,
        })
    }

    /// Builds a model with the dimensions stored in a checkpoint and restores it.
    pub fn from_checkpoint(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let checkpoint = Self::read_checkpoint(path.as_ref(), name)?;
        let mut model = Self::build(checkpoint.settings.clone())?;
        model.restore(checkpoint)?;
        Ok(model)
    }

    pub fn settings(&self) -> &VncfSettings {
        &self.settings
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn train_step(&mut self, batch: &InteractionBatch, corruption_rate: f32) -> Result<f32> {
        self.train_step_with_sampling(batch, corruption_rate, true)
    }

    pub fn train_step_with_sampling(
        &mut self,
        batch: &InteractionBatch,
        corruption_rate: f32,
        sampling_enabled: bool,
    ) -> Result<f32> {
        Ok(self
            .train_step_detailed(batch, corruption_rate, sampling_enabled)?
            .total)
    }

    /// One optimizer update on `batch`. A non-finite loss aborts the step
    /// before any parameter changes.
    pub fn train_step_detailed(
        &mut self,
        batch: &InteractionBatch,
        corruption_rate: f32,
        sampling_enabled: bool,
    ) -> Result<LossBreakdown> {
        validation::validate_batch(batch, &self.settings)?;
        validation::validate_corruption_rate(corruption_rate)?;

        let targets = batch.keyphrases.to_dense(self.settings.text_dim)?;
        let ratings = Array1::from(batch.ratings.clone());
        let mask = keyphrase_mask(&targets);

        let perturbation = self.draw_perturbation(batch.len(), corruption_rate, sampling_enabled);
        let pass = forward(&self.params, &self.settings, &batch.user_ids, &batch.item_ids, &perturbation);
        let loss = self.loss(&pass, &ratings, &targets, &mask);

        if !loss.total.is_finite() {
            return Err(EvncfError::NumericInstability(format!(
                "loss became {} at step {} (rating {}, keyphrase {}, kl {}, l2 {})",
                loss.total,
                self.steps + 1,
                loss.rating,
                loss.keyphrase,
                loss.kl,
                loss.l2
            )));
        }

        let gradients = backward(
            &self.params,
            &self.settings,
            &batch.user_ids,
            &batch.item_ids,
            &pass,
            &perturbation,
            &ratings,
            &targets,
            &mask,
        );
        self.apply(&gradients);
        self.steps += 1;

        debug!("step {}: loss {:.6}", self.steps, loss.total);
        Ok(loss)
    }

    /// Ratings and keyphrase scores with sampling and dropout disabled.
    pub fn predict(&self, user_ids: &[usize], item_ids: &[usize]) -> Result<Prediction> {
        validation::validate_pairs(user_ids, item_ids, self.settings.num_users, self.settings.num_items)?;

        let pass = forward(&self.params, &self.settings, user_ids, item_ids, &Perturbation::default());
        Ok(Prediction {
            ratings: pass.rating.column(0).to_owned(),
            keyphrases: pass.keyphrases,
        })
    }

    /// Latent code of each pair; `z` carries sampling noise when enabled.
    pub fn encode(&mut self, user_ids: &[usize], item_ids: &[usize], sampling_enabled: bool) -> Result<LatentCode> {
        validation::validate_pairs(user_ids, item_ids, self.settings.num_users, self.settings.num_items)?;

        let perturbation = self.draw_perturbation(user_ids.len(), 0.0, sampling_enabled);
        Ok(forward(&self.params, &self.settings, user_ids, item_ids, &perturbation).latent)
    }

    pub fn initialize_embeddings_from_matrix(
        &mut self,
        user_embeddings: Array2<f32>,
        item_embeddings: Array2<f32>,
    ) -> Result<()> {
        let user_shape = [self.settings.num_users, self.settings.embed_dim];
        let item_shape = [self.settings.num_items, self.settings.embed_dim];
        if user_embeddings.shape() != user_shape {
            return Err(EvncfError::shape(
                format!("user embeddings {:?}", user_shape),
                format!("{:?}", user_embeddings.shape()),
            ));
        }
        if item_embeddings.shape() != item_shape {
            return Err(EvncfError::shape(
                format!("item embeddings {:?}", item_shape),
                format!("{:?}", item_embeddings.shape()),
            ));
        }
        if user_embeddings.iter().chain(item_embeddings.iter()).any(|v| !v.is_finite()) {
            return Err(EvncfError::NumericInstability(
                "initial embeddings contain non-finite values".to_string(),
            ));
        }

        if self.steps > 0 {
            warn!("Embeddings re-seeded after {} training steps", self.steps);
        }
        self.params.user_embeddings = user_embeddings;
        self.params.item_embeddings = item_embeddings;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
        let file_path = checkpoint_path(path, name);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let checkpoint = CheckpointRef {
            settings: &self.settings,
            steps: self.steps,
            saved_at: Utc::now(),
            parameters: &self.params,
        };
        let mut writer = BufWriter::new(fs::File::create(&file_path)?);
        serde_json::to_writer(&mut writer, &checkpoint)?;
        writer.flush()?;

        info!("Model saved in path: {}", file_path.display());
        Ok(file_path)
    }

    /// Restores parameters saved under `(path, name)`. Optimizer moments start
    /// fresh after a restore.
    pub fn load(&mut self, path: impl AsRef<Path>, name: &str) -> Result<()> {
        let checkpoint = Self::read_checkpoint(path.as_ref(), name)?;
        self.restore(checkpoint)
    }

    /// Ends the session and releases every parameter buffer.
    pub fn close(self) {
        info!("Closing E-VNCF session after {} steps", self.steps);
    }

    fn read_checkpoint(path: &Path, name: &str) -> Result<Checkpoint> {
        let file_path = checkpoint_path(path, name);
        if !file_path.is_file() {
            return Err(EvncfError::ModelNotFound(file_path.display().to_string()));
        }
        let reader = BufReader::new(fs::File::open(&file_path)?);
        let checkpoint: Checkpoint = serde_json::from_reader(reader)?;
        debug!("Read checkpoint {} saved at {}", file_path.display(), checkpoint.saved_at);
        Ok(checkpoint)
    }

    fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        checkpoint.parameters.check_shapes(&self.settings)?;
        self.params = checkpoint.parameters;
        self.steps = checkpoint.steps;
        self.optimizer.reset();
        info!("Model restored at step {}", self.steps);
        Ok(())
    }

    fn draw_perturbation(&mut self, rows: usize, corruption_rate: f32, sampling_enabled: bool) -> Perturbation {
        let rng = &mut self.rng;

        let dropout_mask = if corruption_rate > 0.0 {
            let keep = 1.0 - corruption_rate;
            Some(Array2::from_shape_simple_fn((rows, 2 * self.settings.embed_dim), || {
                if rng.gen::<f32>() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            }))
        } else {
            None
        };

        let noise = if sampling_enabled {
            Some(initializer::normal(rng, rows, self.settings.latent_dim(), 1.0))
        } else {
            None
        };

        Perturbation { dropout_mask, noise }
    }

    fn loss(
        &self,
        pass: &ForwardPass,
        ratings: &Array1<f32>,
        targets: &Array2<f32>,
        mask: &Array1<f32>,
    ) -> LossBreakdown {
        let rating = rating_loss(pass.rating.column(0), ratings.view());
        let keyphrase = keyphrase_loss(&pass.keyphrases, targets, mask);
        let kl = kl_divergence(&pass.latent.mean, &pass.latent.log_std);
        let l2 = self.params.l2_penalty(self.settings.lamb);

        LossBreakdown {
            rating,
            keyphrase,
            kl,
            l2,
            total: rating + keyphrase + KL_WEIGHT * kl + l2,
        }
    }

    fn apply(&mut self, gradients: &Gradients) {
        let optimizer = &mut *self.optimizer;
        let params = &mut self.params;
        optimizer.begin_step();

        optimizer.update(
            "embeddings/user",
            params.user_embeddings.view_mut().into_dyn(),
            gradients.user_embeddings.view().into_dyn(),
        );
        optimizer.update(
            "embeddings/item",
            params.item_embeddings.view_mut().into_dyn(),
            gradients.item_embeddings.view().into_dyn(),
        );

        for (i, (layer, grad)) in params.residual.iter_mut().zip(&gradients.residual).enumerate() {
            update_dense(optimizer, &format!("residual/dense_{}", i), layer, grad);
        }
        update_dense(optimizer, "prediction/rating", &mut params.rating_head, &gradients.rating_head);
        update_dense(optimizer, "prediction/keyphrase", &mut params.keyphrase_head, &gradients.keyphrase_head);
    }
}

fn update_dense(optimizer: &mut dyn Optimizer, scope: &str, layer: &mut Dense, grad: &DenseGradient) {
    optimizer.update(
        &format!("{}/kernel", scope),
        layer.kernel.view_mut().into_dyn(),
        grad.kernel.view().into_dyn(),
    );
    optimizer.update(
        &format!("{}/bias", scope),
        layer.bias.view_mut().into_dyn(),
        grad.bias.view().into_dyn(),
    );
}

impl RecommendationModel for ExplainableVncf {
    fn num_users(&self) -> usize {
        self.settings.num_users
    }

    fn num_items(&self) -> usize {
        self.settings.num_items
    }

    fn text_dim(&self) -> usize {
        self.settings.text_dim
    }

    fn predict(&self, user_ids: &[usize], item_ids: &[usize]) -> Result<Prediction> {
        ExplainableVncf::predict(self, user_ids, item_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeyphraseRows;
    use ndarray::array;

    fn small_settings() -> VncfSettings {
        VncfSettings::new(3, 4, 2, 2, 1, 0.01, 0.01).with_seed(11)
    }

    fn two_row_batch() -> InteractionBatch {
        InteractionBatch::new(
            vec![0, 2],
            vec![1, 3],
            vec![1.0, 0.0],
            KeyphraseRows::new(vec![vec![0, 1], vec![]]),
        )
    }

    #[test]
    fn test_build_rejects_non_positive_dimensions() {
        let settings = VncfSettings::new(3, 0, 2, 2, 1, 0.01, 0.01);
        assert!(matches!(
            ExplainableVncf::build(settings),
            Err(EvncfError::Configuration(_))
        ));

        let settings = VncfSettings::new(3, 4, 2, 2, 0, 0.01, 0.01);
        assert!(matches!(
            ExplainableVncf::build(settings),
            Err(EvncfError::Configuration(_))
        ));
    }

    #[test]
    fn test_predict_shapes_for_placeholder_inputs() {
        for (users, items, embed_dim, text_dim) in [(1, 1, 1, 1), (3, 4, 2, 2), (5, 2, 8, 7)] {
            let model = ExplainableVncf::build(VncfSettings::new(users, items, text_dim, embed_dim, 2, 0.01, 0.001))
                .unwrap();
            let prediction = model.predict(&[0, 0], &[0, 0]).unwrap();

            assert_eq!(prediction.ratings.len(), 2);
            assert_eq!(prediction.keyphrases.shape(), &[2, text_dim]);
        }
    }

    #[test]
    fn test_kl_is_zero_for_standard_normal() {
        let zeros = Array2::<f32>::zeros((3, 4));
        assert_eq!(kl_divergence(&zeros, &zeros), 0.0);
    }

    #[test]
    fn test_kl_positive_away_from_prior() {
        let mean = array![[1.0f32, 0.0]];
        let log_std = array![[0.0f32, 0.5]];
        assert!(kl_divergence(&mean, &log_std) > 0.0);
    }

    #[test]
    fn test_split_latent_bounds_log_std() {
        let pre = array![[-2.0f32, 1.5, 100.0, -100.0]];
        let (mean, log_std) = split_latent(&pre, 1);

        assert_eq!(mean, array![[0.0f32, 1.5]]);
        assert!(log_std.iter().all(|v| v.abs() <= LOG_STD_BOUND));
        assert!((log_std[[0, 0]] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_reparameterize_without_noise_is_mean() {
        let mean = array![[0.5f32, 1.0]];
        let log_std = array![[1.0f32, -1.0]];
        assert_eq!(reparameterize(&mean, &log_std, None), mean);

        let noise = array![[1.0f32, 0.0]];
        let z = reparameterize(&mean, &log_std, Some(&noise));
        assert!((z[[0, 0]] - (0.5 + 1.0f32.exp())).abs() < 1e-5);
        assert_eq!(z[[0, 1]], 1.0);
    }

    #[test]
    fn test_inference_predict_is_deterministic() {
        let model = ExplainableVncf::build(small_settings()).unwrap();
        let first = model.predict(&[0, 1, 2], &[3, 2, 1]).unwrap();
        let second = model.predict(&[0, 1, 2], &[3, 2, 1]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sampled_latent_is_stochastic() {
        let mut model = ExplainableVncf::build(small_settings()).unwrap();
        let first = model.encode(&[0, 1], &[2, 3], true).unwrap();
        let second = model.encode(&[0, 1], &[2, 3], true).unwrap();

        assert_eq!(first.mean, second.mean);
        assert_ne!(first.z, second.z);

        let plain = model.encode(&[0, 1], &[2, 3], false).unwrap();
        assert_eq!(plain.z, plain.mean);
    }

    #[test]
    fn test_empty_keyphrase_row_contributes_nothing() {
        let targets = array![[1.0f32, 0.0], [0.0, 0.0]];
        let mask = keyphrase_mask(&targets);
        assert_eq!(mask, array![1.0f32, 0.0]);

        let a = array![[0.5f32, 0.5], [0.0, 0.0]];
        let b = array![[0.5f32, 0.5], [9.0, -7.0]];
        assert_eq!(keyphrase_loss(&a, &targets, &mask), keyphrase_loss(&b, &targets, &mask));

        let only_empty = array![[0.0f32, 0.0]];
        assert_eq!(
            keyphrase_loss(&array![[3.0f32, 4.0]], &only_empty, &keyphrase_mask(&only_empty)),
            0.0
        );
    }

    #[test]
    fn test_single_step_updates_rating_head() {
        let mut model = ExplainableVncf::build(small_settings()).unwrap();
        let before = model.parameters().rating_head.kernel.clone();

        let loss = model.train_step(&two_row_batch(), 0.1).unwrap();

        assert!(loss.is_finite());
        assert_ne!(model.parameters().rating_head.kernel, before);
        assert_eq!(model.steps(), 1);
    }

    #[test]
    fn test_loss_decreases_on_fixed_batch() {
        let settings = small_settings().with_optimizer(OptimizerKind::Sgd);
        let mut model = ExplainableVncf::build(settings).unwrap();
        let batch = two_row_batch();

        let first = model.train_step_with_sampling(&batch, 0.0, false).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = model.train_step_with_sampling(&batch, 0.0, false).unwrap();
        }
        assert!(last < first, "loss went from {} to {}", first, last);
    }

    #[test]
    fn test_non_finite_loss_leaves_parameters_untouched() {
        let mut model = ExplainableVncf::build(small_settings()).unwrap();
        let before = model.parameters().clone();
        let batch = InteractionBatch::new(
            vec![0],
            vec![0],
            vec![1e30],
            KeyphraseRows::new(vec![vec![]]),
        );

        let result = model.train_step(&batch, 0.0);
        assert!(matches!(result, Err(EvncfError::NumericInstability(_))));
        assert_eq!(model.parameters(), &before);
        assert_eq!(model.steps(), 0);
    }

    #[test]
    fn test_wide_keyphrase_row_is_shape_mismatch() {
        let mut model = ExplainableVncf::build(small_settings()).unwrap();
        let batch = InteractionBatch::new(
            vec![0],
            vec![0],
            vec![1.0],
            KeyphraseRows::new(vec![vec![2]]),
        );
        assert!(matches!(
            model.train_step(&batch, 0.1),
            Err(EvncfError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_initialize_embeddings_checks_shape() {
        let mut model = ExplainableVncf::build(small_settings()).unwrap();
        let result = model.initialize_embeddings_from_matrix(Array2::zeros((3, 3)), Array2::zeros((4, 2)));
        assert!(matches!(result, Err(EvncfError::ShapeMismatch(_))));

        let users = Array2::from_elem((3, 2), 0.25f32);
        model
            .initialize_embeddings_from_matrix(users.clone(), Array2::zeros((4, 2)))
            .unwrap();
        assert_eq!(model.parameters().user_embeddings, users);
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = ExplainableVncf::build(small_settings()).unwrap();
        assert!(matches!(
            model.load(dir.path(), "absent"),
            Err(EvncfError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_load_rejects_other_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let model = ExplainableVncf::build(small_settings()).unwrap();
        model.save(dir.path(), "small").unwrap();

        let mut wider = ExplainableVncf::build(VncfSettings::new(3, 4, 2, 3, 1, 0.01, 0.01)).unwrap();
        assert!(matches!(
            wider.load(dir.path(), "small"),
            Err(EvncfError::ShapeMismatch(_))
        ));
    }
}
