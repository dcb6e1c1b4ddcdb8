use crate::errors::NetResult;
use crate::layers::{expect_input_count, expect_output_match, InputRef, Layer, LayerCaps, NetStatus};
use crate::tensor::CombinedTensor;
use crate::types::TensorShape;

/// Smooth rectifier with a learnable affine transform and two sparsity
/// regularizers.
///
/// For `t = a * x + b` the activation is `t + alpha` when `t >= 0` and
/// `alpha * exp(t / alpha)` otherwise, so the output is strictly positive
/// and the two branches join smoothly at `t = 0`. The (a, b) pair is not
/// trained through the downstream loss: its gradient comes from the
/// regularizers alone. `kl_weight` scales the KL-divergence term with
/// sparsity target `lambda`, normalized by the number of elements per
/// sample; `other_weight` scales the raw activation-sum term, unnormalized.
/// They are independent knobs and both can be active at once.
pub struct SparsityReLULayer {
    lambda: f32,
    alpha: f32,
    kl_weight: f32,
    other_weight: f32,
    local_lr: f32,

    /// data = [a, b].
    weights: CombinedTensor,
    input_shape: TensorShape,
}

impl SparsityReLULayer {
    pub fn new(lambda: f32, alpha: f32, kl_weight: f32, other_weight: f32) -> Self {
        let mut weights = CombinedTensor::from_dims(1, 2, 1, 1);
        weights.data.as_slice_mut()[0] = 1.0;
        weights.data.as_slice_mut()[1] = 0.0;
        // With no active regularizer there is nothing to train here.
        let local_lr = if kl_weight == 0.0 && other_weight == 0.0 {
            0.0
        } else {
            1.0
        };
        Self {
            lambda,
            alpha,
            kl_weight,
            other_weight,
            local_lr,
            weights,
            input_shape: TensorShape::new(0, 0, 0, 0),
        }
    }

    pub fn with_local_lr(mut self, local_lr: f32) -> Self {
        self.local_lr = local_lr;
        self
    }

    fn scale(&self) -> f32 {
        self.weights.data.as_slice()[0]
    }

    fn offset(&self) -> f32 {
        self.weights.data.as_slice()[1]
    }
}

impl Layer for SparsityReLULayer {
    fn kind(&self) -> &'static str {
        "sparsityrelu"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            // The KL regularizer gradient does not follow the downstream
            // loss, so the layer stops being gradient-safe once it is
            // active.
            gradient_safe: self.kl_weight == 0.0,
            dynamic_aware: false,
            is_loss: true,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        Ok(vec![inputs[0]])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.input_shape = inputs[0];
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let a = self.scale();
        let b = self.offset();
        let alpha = self.alpha;
        let source = inputs[0].data.as_slice();
        let target = outputs[0].data.as_slice_mut();
        for (t, &x) in target.iter_mut().zip(source) {
            let transformed = a * x + b;
            *t = if transformed >= 0.0 {
                transformed + alpha
            } else {
                alpha * (transformed / alpha).exp()
            };
        }
        Ok(())
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let a = self.scale();
        let b = self.offset();
        let alpha = self.alpha;
        let lambda = self.lambda;

        let mut a_delta_kl = 0.0f32;
        let mut b_delta_kl = 0.0f32;
        let mut a_delta_other = 0.0f32;
        let mut b_delta_other = 0.0f32;

        let inv_elements_per_sample = 1.0 / self.input_shape.elements_per_sample() as f32;

        let input = &mut inputs[0];
        let backprop = input.backprop;
        let buffer = &mut *input.buffer;
        let source = buffer.data.as_slice();
        let out_delta = outputs[0].delta.as_slice();
        let input_delta = buffer.delta.as_slice_mut();

        for ((dx, &x), &dy) in input_delta.iter_mut().zip(source).zip(out_delta) {
            let transformed = a * x + b;
            let mut delta = a;

            a_delta_kl -= 1.0 / a;

            if transformed >= 0.0 {
                a_delta_kl += lambda * x;
                b_delta_kl += lambda;

                a_delta_other += x;
                b_delta_other += 1.0;
            } else {
                let rise = (transformed / alpha).exp();
                delta *= rise;

                a_delta_kl -= (x / alpha) - lambda * x * rise;
                b_delta_kl += (-1.0 / alpha) + lambda * rise;

                a_delta_other += x * rise;
                b_delta_other += rise;
            }

            if backprop {
                *dx = dy * delta;
            }
        }

        let weight_delta = self.weights.delta.as_slice_mut();
        weight_delta[0] +=
            inv_elements_per_sample * self.kl_weight * a_delta_kl + self.other_weight * a_delta_other;
        weight_delta[1] +=
            inv_elements_per_sample * self.kl_weight * b_delta_kl + self.other_weight * b_delta_other;
        Ok(())
    }

    fn parameters(&self) -> Vec<&CombinedTensor> {
        vec![&self.weights]
    }

    fn parameters_mut(&mut self) -> Vec<&mut CombinedTensor> {
        vec![&mut self.weights]
    }

    fn local_learning_rate(&self) -> f32 {
        self.local_lr
    }

    fn loss(&self) -> Option<f32> {
        // The regularizers act through the parameter gradient only; the
        // reported scalar is always zero.
        Some(0.0)
    }
}
