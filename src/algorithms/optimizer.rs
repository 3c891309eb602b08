use crate::config::OptimizerKind;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use std::collections::HashMap;

/// Gradient-descent update rule over named parameter tensors. `begin_step`
/// is called once per batch, before the `update` calls of that batch.
pub trait Optimizer: Send + Sync {
    fn begin_step(&mut self) {}
    fn update(&mut self, key: &str, params: ArrayViewMutD<'_, f32>, gradients: ArrayViewD<'_, f32>);
    fn reset(&mut self);
}

pub fn build_optimizer(kind: OptimizerKind, learning_rate: f64) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate, 0.9, 0.999, 1e-8)),
        OptimizerKind::Sgd => Box::new(SGD::new(learning_rate)),
        OptimizerKind::AdaGrad => Box::new(AdaGrad::new(learning_rate, 1e-8)),
        OptimizerKind::RmsProp => Box::new(RMSprop::new(learning_rate, 0.9, 1e-8)),
    }
}

fn slot<'a>(
    state: &'a mut HashMap<String, ArrayD<f32>>,
    key: &str,
    like: &ArrayViewMutD<'_, f32>,
) -> &'a mut ArrayD<f32> {
    let slot = state
        .entry(key.to_string())
        .or_insert_with(|| ArrayD::zeros(like.raw_dim()));
    // Shape changes only when a parameter was replaced wholesale.
    if slot.raw_dim() != like.raw_dim() {
        *slot = ArrayD::zeros(like.raw_dim());
    }
    slot
}

#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f64,
}

impl SGD {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for SGD {
    fn update(&mut self, _key: &str, mut params: ArrayViewMutD<'_, f32>, gradients: ArrayViewD<'_, f32>) {
        params.scaled_add(-(self.learning_rate as f32), &gradients);
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: usize,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn step_count(&self) -> usize {
        self.t
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.001, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, key: &str, mut params: ArrayViewMutD<'_, f32>, gradients: ArrayViewD<'_, f32>) {
        let t = self.t.max(1) as i32;
        let beta1 = self.beta1 as f32;
        let beta2 = self.beta2 as f32;
        let epsilon = self.epsilon as f32;
        // Bias correction folded into the step size.
        let lr_t = (self.learning_rate
            * (1.0 - self.beta2.powi(t)).sqrt()
            / (1.0 - self.beta1.powi(t))) as f32;

        let m = slot(&mut self.m, key, &params);
        Zip::from(&mut *m)
            .and(&gradients)
            .for_each(|m, &g| *m = beta1 * *m + (1.0 - beta1) * g);

        let v = slot(&mut self.v, key, &params);
        Zip::from(&mut *v)
            .and(&gradients)
            .for_each(|v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        let m = &self.m[key];
        let v = &self.v[key];
        Zip::from(&mut params)
            .and(m)
            .and(v)
            .for_each(|p, &m, &v| *p -= lr_t * m / (v.sqrt() + epsilon));
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }
}

#[derive(Debug, Clone)]
pub struct AdaGrad {
    learning_rate: f64,
    epsilon: f64,
    sum_squared_gradients: HashMap<String, ArrayD<f32>>,
}

impl AdaGrad {
    pub fn new(learning_rate: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            epsilon,
            sum_squared_gradients: HashMap::new(),
        }
    }
}

impl Optimizer for AdaGrad {
    fn update(&mut self, key: &str, mut params: ArrayViewMutD<'_, f32>, gradients: ArrayViewD<'_, f32>) {
        let learning_rate = self.learning_rate as f32;
        let epsilon = self.epsilon as f32;
        let sum_sq_grad = slot(&mut self.sum_squared_gradients, key, &params);

        Zip::from(&mut params)
            .and(sum_sq_grad)
            .and(&gradients)
            .for_each(|p, acc, &g| {
                *acc += g * g;
                *p -= learning_rate * g / (*acc + epsilon).sqrt();
            });
    }

    fn reset(&mut self) {
        self.sum_squared_gradients.clear();
    }
}

#[derive(Debug, Clone)]
pub struct RMSprop {
    learning_rate: f64,
    decay_rate: f64,
    epsilon: f64,
    cache: HashMap<String, ArrayD<f32>>,
}

impl RMSprop {
    pub fn new(learning_rate: f64, decay_rate: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            decay_rate,
            epsilon,
            cache: HashMap::new(),
        }
    }
}

impl Optimizer for RMSprop {
    fn update(&mut self, key: &str, mut params: ArrayViewMutD<'_, f32>, gradients: ArrayViewD<'_, f32>) {
        let learning_rate = self.learning_rate as f32;
        let decay = self.decay_rate as f32;
        let epsilon = self.epsilon as f32;
        let cache = slot(&mut self.cache, key, &params);

        Zip::from(&mut params)
            .and(cache)
            .and(&gradients)
            .for_each(|p, c, &g| {
                *c = decay * *c + (1.0 - decay) * g * g;
                *p -= learning_rate * g / (*c + epsilon).sqrt();
            });
    }

    fn reset(&mut self) {
        self.cache.clear();
    }
}
