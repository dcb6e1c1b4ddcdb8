use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::errors::{NetError, NetResult};
use crate::layers::{
    expect_input_count, expect_output_match, InitHint, InputRef, Layer, NetStatus,
};
use crate::tensor::math::{self, Im2ColParams};
use crate::tensor::{CombinedTensor, Tensor};
use crate::types::TensorShape;

/// 2-D convolution lowered to GEMM through im2col.
///
/// Weights are stored as (kernels, input_maps / group, kH, kW); `group > 1`
/// partitions input and output maps into independent slices.
pub struct ConvolutionLayer {
    kernel_width: usize,
    kernel_height: usize,
    kernels: usize,
    stride_width: usize,
    stride_height: usize,
    pad_width: usize,
    pad_height: usize,
    group: usize,
    seed: u64,
    local_lr: f32,

    weights: CombinedTensor,
    bias: CombinedTensor,
    init_hint: InitHint,

    input_shape: TensorShape,
    output_shape: TensorShape,
    columns: Array2<f32>,
    columns_delta: Array2<f32>,
}

impl ConvolutionLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kernel_width: usize,
        kernel_height: usize,
        kernels: usize,
        stride_width: usize,
        stride_height: usize,
        pad_width: usize,
        pad_height: usize,
        group: usize,
        seed: u64,
    ) -> Self {
        tracing::debug!(
            "convolution created: {}x{} kernels: {} stride: {}x{} pad: {}x{} group: {}",
            kernel_width,
            kernel_height,
            kernels,
            stride_width,
            stride_height,
            pad_width,
            pad_height,
            group
        );
        Self {
            kernel_width,
            kernel_height,
            kernels,
            stride_width,
            stride_height,
            pad_width,
            pad_height,
            group,
            seed,
            local_lr: 1.0,
            weights: CombinedTensor::from_dims(0, 0, 0, 0),
            bias: CombinedTensor::from_dims(0, 0, 0, 0),
            init_hint: InitHint::Saturating,
            input_shape: TensorShape::new(0, 0, 0, 0),
            output_shape: TensorShape::new(0, 0, 0, 0),
            columns: Array2::zeros((0, 0)),
            columns_delta: Array2::zeros((0, 0)),
        }
    }

    pub fn simple(kernel_width: usize, kernel_height: usize, kernels: usize, seed: u64) -> Self {
        Self::new(kernel_width, kernel_height, kernels, 1, 1, 0, 0, 1, seed)
    }

    pub fn with_local_lr(mut self, local_lr: f32) -> Self {
        self.local_lr = local_lr;
        self
    }

    fn im2col_params(&self) -> Im2ColParams {
        Im2ColParams {
            kernel_width: self.kernel_width,
            kernel_height: self.kernel_height,
            stride_width: self.stride_width,
            stride_height: self.stride_height,
            pad_width: self.pad_width,
            pad_height: self.pad_height,
        }
    }

    fn maps_per_group(&self) -> usize {
        self.input_shape.maps / self.group
    }

    fn kernels_per_group(&self) -> usize {
        self.kernels / self.group
    }

    fn fan_in(&self) -> usize {
        self.maps_per_group() * self.kernel_width * self.kernel_height
    }

    fn fan_out(&self) -> usize {
        self.kernels_per_group() * self.kernel_width * self.kernel_height
    }

}

impl Layer for ConvolutionLayer {
    fn kind(&self) -> &'static str {
        "convolution"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        if input.maps % self.group != 0 || self.kernels % self.group != 0 {
            return Err(NetError::ShapeMsg(format!(
                "convolution group {} does not divide maps {} / kernels {}",
                self.group, input.maps, self.kernels
            )));
        }
        if input.width + 2 * self.pad_width < self.kernel_width
            || input.height + 2 * self.pad_height < self.kernel_height
        {
            return Err(NetError::ShapeMsg(format!(
                "convolution kernel {}x{} does not fit input {input}",
                self.kernel_width, self.kernel_height
            )));
        }
        let params = self.im2col_params();
        Ok(vec![TensorShape::new(
            input.samples,
            self.kernels,
            params.output_height(input.height),
            params.output_width(input.width),
        )])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;

        self.input_shape = inputs[0];
        self.output_shape = outputs[0];

        let rows = self.input_shape.maps * self.kernel_height * self.kernel_width;
        let cols = self.output_shape.samples * self.output_shape.height * self.output_shape.width;
        self.columns = Array2::zeros((rows, cols));
        self.columns_delta = Array2::zeros((rows, cols));

        let weight_shape = TensorShape::new(
            self.kernels,
            self.maps_per_group(),
            self.kernel_height,
            self.kernel_width,
        );
        if self.weights.shape() != weight_shape {
            self.weights = CombinedTensor::new(weight_shape);
            self.bias = CombinedTensor::from_dims(1, self.kernels, 1, 1);
            self.init_weights();
        }
        Ok(())
    }

    fn receive_init_hint(&mut self, hint: InitHint) {
        self.init_hint = hint;
    }

    fn init_weights(&mut self) {
        let bound = match self.init_hint {
            InitHint::Saturating => (6.0 / (self.fan_in() + self.fan_out()) as f32).sqrt(),
            InitHint::Rectifier => (6.0 / self.fan_in() as f32).sqrt(),
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
        let params = self.im2col_params();
        math::im2col(&input.data, &params, &mut self.columns);

        let spatial = self.output_shape.height * self.output_shape.width;
        let kpg = self.kernels_per_group();
        let fan_in = self.fan_in();
        let weight_matrix =
            ArrayView2::from_shape((self.kernels, fan_in), self.weights.data.as_slice())
                .expect("weight storage is contiguous");

        for sample in 0..self.output_shape.samples {
            let mut out_matrix = output.data.sample_matrix_mut(sample);
            for g in 0..self.group {
                let weight_block = weight_matrix.slice(s![g * kpg..(g + 1) * kpg, ..]);
                let column_block = self.columns.slice(s![
                    g * fan_in..(g + 1) * fan_in,
                    sample * spatial..(sample + 1) * spatial
                ]);
                let out_block = out_matrix.slice_mut(s![g * kpg..(g + 1) * kpg, ..]);
                math::gemm(1.0, weight_block, false, column_block, false, 0.0, out_block);
            }
        }

        let bias = self.bias.data.as_slice();
        let mut out_view = output.data.view_mut();
        for sample in 0..self.output_shape.samples {
            for map in 0..self.kernels {
                out_view
                    .slice_mut(s![sample, map, .., ..])
                    .mapv_inplace(|v| v + bias[map]);
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
        let spatial = self.output_shape.height * self.output_shape.width;
        let kpg = self.kernels_per_group();
        let fan_in = self.fan_in();

        // Bias gradient: sum over samples and spatial positions.
        {
            let delta_view = output.delta.view();
            let bias_delta = self.bias.delta.as_slice_mut();
            for sample in 0..self.output_shape.samples {
                for map in 0..self.kernels {
                    bias_delta[map] += delta_view.slice(s![sample, map, .., ..]).sum();
                }
            }
        }

        // Weight gradient: dW_g += dOut_g(s) * columns_g(s)^T per sample.
        {
            let group = self.group;
            let columns = std::mem::take(&mut self.columns);
            let mut weight_delta =
                ArrayViewMut2::from_shape((self.kernels, fan_in), self.weights.delta.as_slice_mut())
                    .expect("weight storage is contiguous");
            for sample in 0..self.output_shape.samples {
                let delta_matrix = output.delta.sample_matrix(sample);
                for g in 0..group {
                    let delta_block = delta_matrix.slice(s![g * kpg..(g + 1) * kpg, ..]);
                    let column_block = columns.slice(s![
                        g * fan_in..(g + 1) * fan_in,
                        sample * spatial..(sample + 1) * spatial
                    ]);
                    let dw_block = weight_delta.slice_mut(s![g * kpg..(g + 1) * kpg, ..]);
                    math::gemm(1.0, delta_block, false, column_block, true, 1.0, dw_block);
                }
            }
            self.columns = columns;
        }

        // Input gradient through the column adjoint.
        let input = &mut inputs[0];
        if input.backprop {
            let weight_matrix =
                ArrayView2::from_shape((self.kernels, fan_in), self.weights.data.as_slice())
                    .expect("weight storage is contiguous");
            for sample in 0..self.output_shape.samples {
                let delta_matrix = output.delta.sample_matrix(sample);
                for g in 0..self.group {
                    let weight_block = weight_matrix.slice(s![g * kpg..(g + 1) * kpg, ..]);
                    let delta_block = delta_matrix.slice(s![g * kpg..(g + 1) * kpg, ..]);
                    let column_block = self.columns_delta.slice_mut(s![
                        g * fan_in..(g + 1) * fan_in,
                        sample * spatial..(sample + 1) * spatial
                    ]);
                    math::gemm(1.0, weight_block, true, delta_block, false, 0.0, column_block);
                }
            }
            let params = self.im2col_params();
            math::col2im(&self.columns_delta, &params, &mut input.buffer.delta);
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
