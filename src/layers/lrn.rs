use crate::errors::NetResult;
use crate::layers::{expect_input_count, expect_output_match, InputRef, Layer, NetStatus};
use crate::tensor::{CombinedTensor, Tensor};
use crate::types::TensorShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationMethod {
    AcrossChannels,
    WithinChannel,
}

/// Local response normalization:
/// `out = in / (1 + (alpha / n) * sum)^beta` where `sum` is the squared
/// activation total over a neighbourhood in the chosen dimension.
pub struct LocalResponseNormalizationLayer {
    size: usize,
    alpha: f32,
    beta: f32,
    method: NormalizationMethod,
    input_shape: TensorShape,
    /// Squared-sum of each element's neighbourhood, kept from forward.
    region_sums: Tensor,
    region_sizes: Tensor,
}

impl LocalResponseNormalizationLayer {
    pub fn new(size: usize, alpha: f32, beta: f32, method: NormalizationMethod) -> Self {
        tracing::debug!(
            "lrn created, size: {}, alpha: {}, beta: {}, method: {:?}",
            size,
            alpha,
            beta,
            method
        );
        Self {
            size,
            alpha,
            beta,
            method,
            input_shape: TensorShape::new(0, 0, 0, 0),
            region_sums: Tensor::from_dims(0, 0, 0, 0),
            region_sizes: Tensor::from_dims(0, 0, 0, 0),
        }
    }

    fn window(&self) -> (isize, isize) {
        // Asymmetric split for even sizes, matching the forward sums.
        (((self.size - 1) / 2) as isize, (self.size / 2) as isize)
    }
}

impl Layer for LocalResponseNormalizationLayer {
    fn kind(&self) -> &'static str {
        "lrn"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        Ok(vec![inputs[0]])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.input_shape = inputs[0];
        self.region_sums.resize(self.input_shape);
        self.region_sizes.resize(self.input_shape);
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let (sub, add) = self.window();
        let shape = self.input_shape;
        let source = inputs[0].data.view();
        let mut target = outputs[0].data.view_mut();
        let mut sums = self.region_sums.view_mut();
        let mut sizes = self.region_sizes.view_mut();

        for sample in 0..shape.samples {
            for map in 0..shape.maps {
                for y in 0..shape.height {
                    for x in 0..shape.width {
                        let mut region_sum = 0.0;
                        let mut region_size = 0usize;
                        match self.method {
                            NormalizationMethod::WithinChannel => {
                                let y0 = (y as isize - sub).max(0) as usize;
                                let y1 = ((y as isize + add) as usize).min(shape.height - 1);
                                let x0 = (x as isize - sub).max(0) as usize;
                                let x1 = ((x as isize + add) as usize).min(shape.width - 1);
                                for iy in y0..=y1 {
                                    for ix in x0..=x1 {
                                        let value = source[[sample, map, iy, ix]];
                                        region_sum += value * value;
                                        region_size += 1;
                                    }
                                }
                            }
                            NormalizationMethod::AcrossChannels => {
                                let m0 = (map as isize - sub).max(0) as usize;
                                let m1 = ((map as isize + add) as usize).min(shape.maps - 1);
                                for imap in m0..=m1 {
                                    let value = source[[sample, imap, y, x]];
                                    region_sum += value * value;
                                    region_size += 1;
                                }
                            }
                        }
                        sums[[sample, map, y, x]] = region_sum;
                        sizes[[sample, map, y, x]] = region_size as f32;
                        let divisor = (1.0 + (self.alpha / region_size as f32) * region_sum)
                            .powf(self.beta);
                        target[[sample, map, y, x]] = source[[sample, map, y, x]] / divisor;
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
        let (sub, add) = self.window();
        let shape = self.input_shape;
        input.buffer.delta.clear(0.0);

        let buffer = &mut *input.buffer;
        let source = buffer.data.view();
        let mut target = buffer.delta.view_mut();
        let delta = outputs[0].delta.view();
        let sums = self.region_sums.view();
        let sizes = self.region_sizes.view();

        // out_i = in_i * (1 + c_i * s_i)^(-beta) with c_i = alpha / n_i.
        // d out_i / d in_j =
        //   [i == j] * (1 + c_i s_i)^(-beta)
        //   - 2 beta c_i in_i in_j (1 + c_i s_i)^(-beta - 1)   for j in R(i).
        for sample in 0..shape.samples {
            for map in 0..shape.maps {
                for y in 0..shape.height {
                    for x in 0..shape.width {
                        let dout = delta[[sample, map, y, x]];
                        if dout == 0.0 {
                            continue;
                        }
                        let s = sums[[sample, map, y, x]];
                        let c = self.alpha / sizes[[sample, map, y, x]];
                        let base = 1.0 + c * s;
                        let pow_beta = base.powf(-self.beta);
                        let pow_beta1 = base.powf(-self.beta - 1.0);
                        let center = source[[sample, map, y, x]];

                        target[[sample, map, y, x]] += dout * pow_beta;
                        let scale = -2.0 * self.beta * c * center * pow_beta1 * dout;
                        match self.method {
                            NormalizationMethod::WithinChannel => {
                                let y0 = (y as isize - sub).max(0) as usize;
                                let y1 = ((y as isize + add) as usize).min(shape.height - 1);
                                let x0 = (x as isize - sub).max(0) as usize;
                                let x1 = ((x as isize + add) as usize).min(shape.width - 1);
                                for iy in y0..=y1 {
                                    for ix in x0..=x1 {
                                        target[[sample, map, iy, ix]] +=
                                            scale * source[[sample, map, iy, ix]];
                                    }
                                }
                            }
                            NormalizationMethod::AcrossChannels => {
                                let m0 = (map as isize - sub).max(0) as usize;
                                let m1 = ((map as isize + add) as usize).min(shape.maps - 1);
                                for imap in m0..=m1 {
                                    target[[sample, imap, y, x]] +=
                                        scale * source[[sample, imap, y, x]];
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
