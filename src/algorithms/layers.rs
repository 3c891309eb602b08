use super::initializer;
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fully connected layer without activation: `y = x W + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct DenseGradient {
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(rng: &mut R, input_dim: usize, output_dim: usize) -> Self {
        Self {
            kernel: initializer::xavier_uniform(rng, input_dim, output_dim),
            bias: initializer::zeros(output_dim),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.kernel.ncols()
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        input.dot(&self.kernel) + &self.bias
    }

    /// Gradients of the loss with respect to the layer's parameters and its
    /// input. `lamb` adds the gradient of the `lamb * ||W||^2` kernel penalty.
    pub fn backward(
        &self,
        input: &Array2<f32>,
        grad_output: &Array2<f32>,
        lamb: f32,
    ) -> (DenseGradient, Array2<f32>) {
        let mut kernel = input.t().dot(grad_output);
        if lamb > 0.0 {
            kernel.scaled_add(2.0 * lamb, &self.kernel);
        }
        let bias = grad_output.sum_axis(Axis(0));
        let grad_input = grad_output.dot(&self.kernel.t());

        (DenseGradient { kernel, bias }, grad_input)
    }

    pub fn l2_penalty(&self, lamb: f32) -> f32 {
        lamb * self.kernel.iter().map(|w| w * w).sum::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn layer() -> Dense {
        Dense {
            kernel: array![[1.0f32, -1.0], [0.5, 2.0], [0.0, 1.0]],
            bias: array![0.1f32, -0.2],
        }
    }

    #[test]
    fn test_forward_applies_bias_per_row() {
        let out = layer().forward(&array![[1.0, 1.0, 1.0], [0.0, 0.0, 0.0]]);
        let expected = array![[1.6f32, 1.8], [0.1, -0.2]];
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let dense = layer();
        let input = array![[0.3f32, -0.7, 1.1], [0.5, 0.2, -0.4]];
        // loss = sum(forward(input)) + lamb * ||W||^2
        let lamb = 0.1f32;
        let loss = |d: &Dense| d.forward(&input).sum() + d.l2_penalty(lamb);
        let (grad, grad_input) = dense.backward(&input, &Array2::ones((2, 2)), lamb);

        let h = 1e-3f32;
        for ((r, c), analytic) in grad.kernel.indexed_iter() {
            let mut plus = dense.clone();
            plus.kernel[[r, c]] += h;
            let mut minus = dense.clone();
            minus.kernel[[r, c]] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!((numeric - analytic).abs() < 1e-2, "kernel[{},{}]", r, c);
        }

        assert_eq!(grad.bias, array![2.0f32, 2.0]);
        assert_eq!(grad_input.row(0).to_vec(), vec![0.0f32, 2.5, 1.0]);
    }
}
