use crate::errors::{NetError, NetResult};
use crate::layers::{expect_input_count, expect_output_match, InputRef, Layer, NetStatus};
use crate::tensor::{CombinedTensor, Tensor};
use crate::types::TensorShape;

/// Non-overlapping max pooling. The input's spatial dimensions must be
/// divisible by the region.
pub struct MaxPoolingLayer {
    region_width: usize,
    region_height: usize,
    input_shape: TensorShape,
    output_shape: TensorShape,
    /// Flat input index (y * width + x) of each output cell's maximum.
    maximum_mask: Tensor,
}

impl MaxPoolingLayer {
    pub fn new(region_width: usize, region_height: usize) -> Self {
        tracing::debug!(
            "max pooling created: {}x{} regions",
            region_width,
            region_height
        );
        Self {
            region_width,
            region_height,
            input_shape: TensorShape::new(0, 0, 0, 0),
            output_shape: TensorShape::new(0, 0, 0, 0),
            maximum_mask: Tensor::from_dims(0, 0, 0, 0),
        }
    }
}

impl Layer for MaxPoolingLayer {
    fn kind(&self) -> &'static str {
        "maxpooling"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        if input.width % self.region_width != 0 || input.height % self.region_height != 0 {
            return Err(NetError::ShapeMsg(format!(
                "pooling region {}x{} does not divide input {input}",
                self.region_width, self.region_height
            )));
        }
        Ok(vec![TensorShape::new(
            input.samples,
            input.maps,
            input.height / self.region_height,
            input.width / self.region_width,
        )])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.input_shape = inputs[0];
        self.output_shape = outputs[0];
        self.maximum_mask.resize(self.output_shape);
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        pool_forward(
            &inputs[0].data,
            &mut outputs[0].data,
            &mut self.maximum_mask,
            self.region_width,
            self.region_height,
            self.region_width,
            self.region_height,
        );
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
            pool_backward(
                &outputs[0].delta,
                &mut input.buffer.delta,
                &self.maximum_mask,
            );
        }
        Ok(())
    }
}

/// Max pooling with an explicit stride; windows may overlap, in which case
/// backward contributions to a shared input position sum.
pub struct AdvancedMaxPoolingLayer {
    region_width: usize,
    region_height: usize,
    stride_width: usize,
    stride_height: usize,
    input_shape: TensorShape,
    output_shape: TensorShape,
    maximum_mask: Tensor,
}

impl AdvancedMaxPoolingLayer {
    pub fn new(
        region_width: usize,
        region_height: usize,
        stride_width: usize,
        stride_height: usize,
    ) -> Self {
        Self {
            region_width,
            region_height,
            stride_width,
            stride_height,
            input_shape: TensorShape::new(0, 0, 0, 0),
            output_shape: TensorShape::new(0, 0, 0, 0),
            maximum_mask: Tensor::from_dims(0, 0, 0, 0),
        }
    }
}

impl Layer for AdvancedMaxPoolingLayer {
    fn kind(&self) -> &'static str {
        "amaxpooling"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        if input.width < self.region_width || input.height < self.region_height {
            return Err(NetError::ShapeMsg(format!(
                "pooling region {}x{} exceeds input {input}",
                self.region_width, self.region_height
            )));
        }
        Ok(vec![TensorShape::new(
            input.samples,
            input.maps,
            (input.height - self.region_height) / self.stride_height + 1,
            (input.width - self.region_width) / self.stride_width + 1,
        )])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.input_shape = inputs[0];
        self.output_shape = outputs[0];
        self.maximum_mask.resize(self.output_shape);
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        pool_forward(
            &inputs[0].data,
            &mut outputs[0].data,
            &mut self.maximum_mask,
            self.region_width,
            self.region_height,
            self.stride_width,
            self.stride_height,
        );
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
            pool_backward(
                &outputs[0].delta,
                &mut input.buffer.delta,
                &self.maximum_mask,
            );
        }
        Ok(())
    }
}

fn pool_forward(
    input: &Tensor,
    output: &mut Tensor,
    mask: &mut Tensor,
    region_width: usize,
    region_height: usize,
    stride_width: usize,
    stride_height: usize,
) {
    let in_shape = input.shape();
    let out_shape = output.shape();
    let source = input.view();
    let mut target = output.view_mut();
    let mut mask_view = mask.view_mut();

    for sample in 0..out_shape.samples {
        for map in 0..out_shape.maps {
            for oy in 0..out_shape.height {
                for ox in 0..out_shape.width {
                    let mut maximum = f32::NEG_INFINITY;
                    let mut max_index = 0usize;
                    for iy in oy * stride_height..oy * stride_height + region_height {
                        for ix in ox * stride_width..ox * stride_width + region_width {
                            let value = source[[sample, map, iy, ix]];
                            if value > maximum {
                                maximum = value;
                                max_index = iy * in_shape.width + ix;
                            }
                        }
                    }
                    target[[sample, map, oy, ox]] = maximum;
                    mask_view[[sample, map, oy, ox]] = max_index as f32;
                }
            }
        }
    }
}

fn pool_backward(output_delta: &Tensor, input_delta: &mut Tensor, mask: &Tensor) {
    let in_shape = input_delta.shape();
    let out_shape = output_delta.shape();
    input_delta.clear(0.0);
    let source = output_delta.view();
    let mask_view = mask.view();
    let mut target = input_delta.view_mut();

    for sample in 0..out_shape.samples {
        for map in 0..out_shape.maps {
            for oy in 0..out_shape.height {
                for ox in 0..out_shape.width {
                    let flat = mask_view[[sample, map, oy, ox]] as usize;
                    let iy = flat / in_shape.width;
                    let ix = flat % in_shape.width;
                    target[[sample, map, iy, ix]] += source[[sample, map, oy, ox]];
                }
            }
        }
    }
}
