use ndarray::Zip;

use crate::errors::NetResult;
use crate::layers::{
    expect_input_count, expect_output_match, InitHint, InputRef, Layer, NetStatus,
};
use crate::tensor::CombinedTensor;
use crate::types::TensorShape;

const LEAKY_SLOPE: f32 = 0.1;

/// Pointwise activation functions, plus a per-sample softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonLinearity {
    Tanh,
    Sigmoid,
    ReLU,
    LeakyReLU,
    Softmax,
}

impl NonLinearity {
    pub fn kind_str(&self) -> &'static str {
        match self {
            NonLinearity::Tanh => "tanh",
            NonLinearity::Sigmoid => "sigm",
            NonLinearity::ReLU => "relu",
            NonLinearity::LeakyReLU => "leaky",
            NonLinearity::Softmax => "softmax",
        }
    }
}

pub struct NonLinearityLayer {
    function: NonLinearity,
    shape: TensorShape,
}

impl NonLinearityLayer {
    pub fn new(function: NonLinearity) -> Self {
        Self {
            function,
            shape: TensorShape::new(0, 0, 0, 0),
        }
    }
}

impl Layer for NonLinearityLayer {
    fn kind(&self) -> &'static str {
        self.function.kind_str()
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        Ok(vec![inputs[0]])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.shape = inputs[0];
        Ok(())
    }

    fn activation_hint(&self) -> Option<InitHint> {
        match self.function {
            NonLinearity::Tanh | NonLinearity::Sigmoid | NonLinearity::Softmax => {
                Some(InitHint::Saturating)
            }
            NonLinearity::ReLU | NonLinearity::LeakyReLU => Some(InitHint::Rectifier),
        }
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let input = &inputs[0].data;
        let output = &mut outputs[0].data;
        match self.function {
            NonLinearity::Tanh => {
                Zip::from(output.array_mut())
                    .and(input.array())
                    .par_for_each(|o, &x| *o = x.tanh());
            }
            NonLinearity::Sigmoid => {
                Zip::from(output.array_mut())
                    .and(input.array())
                    .par_for_each(|o, &x| *o = 1.0 / (1.0 + (-x).exp()));
            }
            NonLinearity::ReLU => {
                Zip::from(output.array_mut())
                    .and(input.array())
                    .par_for_each(|o, &x| *o = if x > 0.0 { x } else { 0.0 });
            }
            NonLinearity::LeakyReLU => {
                Zip::from(output.array_mut())
                    .and(input.array())
                    .par_for_each(|o, &x| *o = if x > 0.0 { x } else { LEAKY_SLOPE * x });
            }
            NonLinearity::Softmax => {
                for sample in 0..self.shape.samples {
                    let source = input.sample_slice(sample);
                    let target = output.sample_slice_mut(sample);
                    let maximum = source.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0;
                    for (t, &x) in target.iter_mut().zip(source) {
                        *t = (x - maximum).exp();
                        sum += *t;
                    }
                    for t in target.iter_mut() {
                        *t /= sum;
                    }
                }
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
        let input = &mut inputs[0];
        if !input.backprop {
            return Ok(());
        }
        let output = &outputs[0];
        match self.function {
            // Closed forms use the already-computed output.
            NonLinearity::Tanh => {
                Zip::from(input.buffer.delta.array_mut())
                    .and(output.delta.array())
                    .and(output.data.array())
                    .par_for_each(|dx, &dy, &y| *dx = dy * (1.0 - y * y));
            }
            NonLinearity::Sigmoid => {
                Zip::from(input.buffer.delta.array_mut())
                    .and(output.delta.array())
                    .and(output.data.array())
                    .par_for_each(|dx, &dy, &y| *dx = dy * y * (1.0 - y));
            }
            NonLinearity::ReLU => {
                // Derivative at exactly zero is taken as zero.
                let buffer = &mut *input.buffer;
                Zip::from(buffer.delta.array_mut())
                    .and(output.delta.array())
                    .and(buffer.data.array())
                    .par_for_each(|dx, &dy, &x| *dx = if x > 0.0 { dy } else { 0.0 });
            }
            NonLinearity::LeakyReLU => {
                let buffer = &mut *input.buffer;
                Zip::from(buffer.delta.array_mut())
                    .and(output.delta.array())
                    .and(buffer.data.array())
                    .par_for_each(|dx, &dy, &x| {
                        *dx = if x > 0.0 { dy } else { LEAKY_SLOPE * dy }
                    });
            }
            NonLinearity::Softmax => {
                for sample in 0..self.shape.samples {
                    let y = output.data.sample_slice(sample);
                    let dy = output.delta.sample_slice(sample);
                    let dot: f32 = y.iter().zip(dy).map(|(&yi, &di)| yi * di).sum();
                    let dx = input.buffer.delta.sample_slice_mut(sample);
                    for ((xi, &yi), &di) in dx.iter_mut().zip(y).zip(dy) {
                        *xi = yi * (di - dot);
                    }
                }
            }
        }
        Ok(())
    }
}
