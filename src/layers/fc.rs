use ndarray::{ArrayView2, ArrayViewMut2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::errors::NetResult;
use crate::layers::{
    expect_input_count, expect_output_match, InitHint, InputRef, Layer, NetStatus,
};
use crate::tensor::{math, CombinedTensor, Tensor};
use crate::types::TensorShape;

/// Fully connected layer: a GEMM of the flattened input against a
/// (neurons, input_elements) weight matrix plus a bias vector.
pub struct FullyConnectedLayer {
    neurons: usize,
    seed: u64,
    local_lr: f32,

    weights: CombinedTensor,
    bias: CombinedTensor,
    init_hint: InitHint,

    input_elements: usize,
    samples: usize,
}

impl FullyConnectedLayer {
    pub fn new(neurons: usize, seed: u64) -> Self {
        Self {
            neurons,
            seed,
            local_lr: 1.0,
            weights: CombinedTensor::from_dims(0, 0, 0, 0),
            bias: CombinedTensor::from_dims(0, 0, 0, 0),
            init_hint: InitHint::Saturating,
            input_elements: 0,
            samples: 0,
        }
    }

    pub fn with_local_lr(mut self, local_lr: f32) -> Self {
        self.local_lr = local_lr;
        self
    }
}

impl Layer for FullyConnectedLayer {
    fn kind(&self) -> &'static str {
        "fullyconnected"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        Ok(vec![TensorShape::flat(inputs[0].samples, self.neurons)])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;

        self.samples = inputs[0].samples;
        self.input_elements = inputs[0].elements_per_sample();

        let weight_shape = TensorShape::new(1, 1, self.neurons, self.input_elements);
        if self.weights.shape() != weight_shape {
            self.weights = CombinedTensor::new(weight_shape);
            self.bias = CombinedTensor::from_dims(1, self.neurons, 1, 1);
            self.init_weights();
        }
        Ok(())
    }

    fn receive_init_hint(&mut self, hint: InitHint) {
        self.init_hint = hint;
    }

    fn init_weights(&mut self) {
        let fan_in = self.input_elements;
        let fan_out = self.neurons;
        let bound = match self.init_hint {
            InitHint::Saturating => (6.0 / (fan_in + fan_out) as f32).sqrt(),
            InitHint::Rectifier => (6.0 / fan_in as f32).sqrt(),
        };
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.weights.data = Tensor::random(self.weights.shape(), bound, &mut rng);
        self.weights.clear_delta();
        self.bias.data.clear(0.0);
        self.bias.clear_delta();
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let input = inputs[0];
        let output = &mut outputs[0];

        let x = input.data.batch_matrix();
        let w = ArrayView2::from_shape(
            (self.neurons, self.input_elements),
            self.weights.data.as_slice(),
        )
        .expect("weight storage is contiguous");
        let out = output.data.batch_matrix_mut();
        // out[s][n] = sum_i x[s][i] * w[n][i]
        math::gemm(1.0, x, false, w, true, 0.0, out);

        let bias = self.bias.data.as_slice();
        let mut out = output.data.batch_matrix_mut();
        for mut row in out.axis_iter_mut(Axis(0)) {
            for (value, b) in row.iter_mut().zip(bias) {
                *value += b;
            }
        }
        Ok(())
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let output = &outputs[0];
        let delta = output.delta.batch_matrix();

        // dW += dOut^T * X
        {
            let input = &inputs[0];
            let x = input.buffer.data.batch_matrix();
            let dw = ArrayViewMut2::from_shape(
                (self.neurons, self.input_elements),
                self.weights.delta.as_slice_mut(),
            )
            .expect("weight storage is contiguous");
            math::gemm(1.0, delta, true, x, false, 1.0, dw);
        }

        // dB += column sums of dOut
        {
            let bias_delta = self.bias.delta.as_slice_mut();
            for row in delta.axis_iter(Axis(0)) {
                for (b, value) in bias_delta.iter_mut().zip(row) {
                    *b += value;
                }
            }
        }

        // dX = dOut * W
        let input = &mut inputs[0];
        if input.backprop {
            let w = ArrayView2::from_shape(
                (self.neurons, self.input_elements),
                self.weights.data.as_slice(),
            )
            .expect("weight storage is contiguous");
            let dx = input.buffer.delta.batch_matrix_mut();
            math::gemm(1.0, delta, false, w, false, 0.0, dx);
        }
        Ok(())
    }

    fn parameters(&self) -> Vec<&CombinedTensor> {
        vec![&self.weights, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut CombinedTensor> {
        vec![&mut self.weights, &mut self.bias]
    }

    fn local_learning_rate(&self) -> f32 {
        self.local_lr
    }
}
