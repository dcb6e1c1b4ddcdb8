use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::{NetError, NetResult};
use crate::layers::{expect_input_count, expect_output_match, InputRef, Layer, NetStatus};
use crate::tensor::{CombinedTensor, Tensor};
use crate::types::TensorShape;

/// Inverted dropout: during training each activation is kept with
/// probability (1 - fraction) and scaled by 1 / (1 - fraction); during
/// testing the layer is an identity. The mask is stored for backward.
pub struct DropoutLayer {
    fraction: f32,
    rng: StdRng,
    mask: Tensor,
}

impl DropoutLayer {
    pub fn new(fraction: f32, seed: u64) -> NetResult<Self> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(NetError::Config(format!(
                "dropout fraction must be in [0, 1), got {fraction}"
            )));
        }
        Ok(Self {
            fraction,
            rng: StdRng::seed_from_u64(seed),
            mask: Tensor::from_dims(0, 0, 0, 0),
        })
    }
}

impl Layer for DropoutLayer {
    fn kind(&self) -> &'static str {
        "dropout"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        Ok(vec![inputs[0]])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.mask.resize(inputs[0]);
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        status: &NetStatus,
    ) -> NetResult<()> {
        let source = inputs[0].data.as_slice();
        let target = outputs[0].data.as_slice_mut();
        if status.is_testing {
            target.copy_from_slice(source);
            self.mask.clear(1.0);
            return Ok(());
        }
        let keep = 1.0 - self.fraction;
        let scale = 1.0 / keep;
        let mask = self.mask.as_slice_mut();
        for ((t, &x), m) in target.iter_mut().zip(source).zip(mask.iter_mut()) {
            *m = if self.rng.gen::<f32>() < keep { scale } else { 0.0 };
            *t = x * *m;
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
        if input.backprop {
            let target = input.buffer.delta.as_slice_mut();
            let delta = outputs[0].delta.as_slice();
            let mask = self.mask.as_slice();
            for ((t, &d), &m) in target.iter_mut().zip(delta).zip(mask) {
                *t = d * m;
            }
        }
        Ok(())
    }
}
