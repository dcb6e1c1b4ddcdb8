use crate::errors::{NetError, NetResult};
use crate::layers::{expect_input_count, expect_output_match, InputRef, Layer, LayerCaps, NetStatus};
use crate::tensor::{math, CombinedTensor, Tensor};
use crate::types::TensorShape;

/// Re-views the input as one flat vector per sample. The storage layout is
/// unchanged, so forward and backward are straight copies.
pub struct FlattenLayer;

impl Layer for FlattenLayer {
    fn kind(&self) -> &'static str {
        "flatten"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        Ok(vec![TensorShape::flat(
            input.samples,
            input.elements_per_sample(),
        )])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        outputs[0]
            .data
            .as_slice_mut()
            .copy_from_slice(inputs[0].data.as_slice());
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
            input
                .buffer
                .delta
                .as_slice_mut()
                .copy_from_slice(outputs[0].delta.as_slice());
        }
        Ok(())
    }
}

/// Pads the input with a zero border so the output is
/// (H + border_y, W + border_x) with the input centred.
pub struct ResizeLayer {
    border_x: usize,
    border_y: usize,
    input_shape: TensorShape,
}

impl ResizeLayer {
    pub fn new(border_x: usize, border_y: usize) -> Self {
        Self {
            border_x,
            border_y,
            input_shape: TensorShape::new(0, 0, 0, 0),
        }
    }
}

impl Layer for ResizeLayer {
    fn kind(&self) -> &'static str {
        "resize"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        Ok(vec![TensorShape::new(
            input.samples,
            input.maps,
            input.height + self.border_y,
            input.width + self.border_x,
        )])
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
        let input = &inputs[0].data;
        let output = &mut outputs[0].data;
        output.clear(0.0);
        let (ox, oy) = (self.border_x / 2, self.border_y / 2);
        let source = input.view();
        let mut target = output.view_mut();
        for sample in 0..self.input_shape.samples {
            for map in 0..self.input_shape.maps {
                for y in 0..self.input_shape.height {
                    for x in 0..self.input_shape.width {
                        target[[sample, map, y + oy, x + ox]] = source[[sample, map, y, x]];
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
        input.buffer.delta.clear(0.0);
        let (ox, oy) = (self.border_x / 2, self.border_y / 2);
        let source = outputs[0].delta.view();
        let mut target = input.buffer.delta.view_mut();
        for sample in 0..self.input_shape.samples {
            for map in 0..self.input_shape.maps {
                for y in 0..self.input_shape.height {
                    for x in 0..self.input_shape.width {
                        target[[sample, map, y, x]] = source[[sample, map, y + oy, x + ox]];
                    }
                }
            }
        }
        Ok(())
    }
}

/// Nearest-neighbour upsampling by an integer factor per axis.
pub struct UpscaleLayer {
    region_width: usize,
    region_height: usize,
}

impl UpscaleLayer {
    pub fn new(region_width: usize, region_height: usize) -> Self {
        Self {
            region_width,
            region_height,
        }
    }
}

impl Layer for UpscaleLayer {
    fn kind(&self) -> &'static str {
        "upscale"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        Ok(vec![TensorShape::new(
            input.samples,
            input.maps,
            input.height * self.region_height,
            input.width * self.region_width,
        )])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        math::up(
            &inputs[0].data,
            &mut outputs[0].data,
            self.region_width,
            self.region_height,
            1.0,
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
            // Each input position fans out to a full block, so the adjoint
            // is the block sum.
            math::down(
                &outputs[0].delta,
                &mut input.buffer.delta,
                self.region_width,
                self.region_height,
                1.0,
            );
        }
        Ok(())
    }
}

/// Block-average downsampling for raw inputs. Only valid before the first
/// trainable layer: backpropagating through it is an error.
pub struct InputDownSamplingLayer {
    region_width: usize,
    region_height: usize,
}

impl InputDownSamplingLayer {
    pub fn new(region_width: usize, region_height: usize) -> Self {
        Self {
            region_width,
            region_height,
        }
    }
}

impl Layer for InputDownSamplingLayer {
    fn kind(&self) -> &'static str {
        "downsampling"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: false,
            is_loss: false,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        if input.width % self.region_width != 0 || input.height % self.region_height != 0 {
            return Err(NetError::ShapeMsg(format!(
                "downsampling region {}x{} does not divide input {input}",
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
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let scale = 1.0 / (self.region_width * self.region_height) as f32;
        math::down(
            &inputs[0].data,
            &mut outputs[0].data,
            self.region_width,
            self.region_height,
            scale,
        );
        Ok(())
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        if inputs[0].backprop {
            return Err(NetError::State(
                "input downsampling is a pre-processing layer and does not support backpropagation"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Prepends two maps carrying the normalized x and y coordinate of each
/// pixel; the input occupies maps 2 and up.
pub struct SpatialPriorLayer {
    input_shape: TensorShape,
}

impl SpatialPriorLayer {
    pub fn new() -> Self {
        Self {
            input_shape: TensorShape::new(0, 0, 0, 0),
        }
    }
}

impl Default for SpatialPriorLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for SpatialPriorLayer {
    fn kind(&self) -> &'static str {
        "spatialprior"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        let input = inputs[0];
        Ok(vec![TensorShape::new(
            input.samples,
            input.maps + 2,
            input.height,
            input.width,
        )])
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
        let input = &inputs[0].data;
        let output = &mut outputs[0].data;
        let shape = self.input_shape;
        for sample in 0..shape.samples {
            for map in 0..shape.maps {
                Tensor::copy_map(input, sample, map, output, sample, map + 2)?;
            }
        }
        let mut target = output.view_mut();
        for sample in 0..shape.samples {
            for y in 0..shape.height {
                for x in 0..shape.width {
                    target[[sample, 0, y, x]] = x as f32 / shape.width as f32;
                    target[[sample, 1, y, x]] = y as f32 / shape.height as f32;
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
        let shape = self.input_shape;
        for sample in 0..shape.samples {
            for map in 0..shape.maps {
                Tensor::copy_map(
                    &outputs[0].delta,
                    sample,
                    map + 2,
                    &mut input.buffer.delta,
                    sample,
                    map,
                )?;
            }
        }
        Ok(())
    }
}

/// Concatenates two flat inputs along the width dimension.
pub struct ConcatLayer {
    width_a: usize,
    width_b: usize,
    samples: usize,
}

impl ConcatLayer {
    pub fn new() -> Self {
        Self {
            width_a: 0,
            width_b: 0,
            samples: 0,
        }
    }
}

impl Default for ConcatLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for ConcatLayer {
    fn kind(&self) -> &'static str {
        "concat"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        if a.maps != 1 || a.height != 1 || b.maps != 1 || b.height != 1 {
            return Err(NetError::ShapeMsg(format!(
                "concat needs flat inputs, got {a} and {b}"
            )));
        }
        if a.samples != b.samples {
            return Err(NetError::shape("concat", a, b));
        }
        Ok(vec![TensorShape::flat(a.samples, a.width + b.width)])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.width_a = inputs[0].width;
        self.width_b = inputs[1].width;
        self.samples = inputs[0].samples;
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let output = &mut outputs[0];
        for sample in 0..self.samples {
            let target = output.data.sample_slice_mut(sample);
            target[..self.width_a].copy_from_slice(inputs[0].data.sample_slice(sample));
            target[self.width_a..].copy_from_slice(inputs[1].data.sample_slice(sample));
        }
        Ok(())
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        for sample in 0..self.samples {
            let source = outputs[0].delta.sample_slice(sample);
            if inputs[0].backprop {
                inputs[0]
                    .buffer
                    .delta
                    .sample_slice_mut(sample)
                    .copy_from_slice(&source[..self.width_a]);
            }
            if inputs[1].backprop {
                inputs[1]
                    .buffer
                    .delta
                    .sample_slice_mut(sample)
                    .copy_from_slice(&source[self.width_a..]);
            }
        }
        Ok(())
    }
}

/// Concatenates two inputs with identical spatial dimensions along the map
/// dimension.
pub struct ConcatenationLayer {
    maps_a: usize,
    input_shape_a: TensorShape,
    input_shape_b: TensorShape,
}

impl ConcatenationLayer {
    pub fn new() -> Self {
        Self {
            maps_a: 0,
            input_shape_a: TensorShape::new(0, 0, 0, 0),
            input_shape_b: TensorShape::new(0, 0, 0, 0),
        }
    }
}

impl Default for ConcatenationLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for ConcatenationLayer {
    fn kind(&self) -> &'static str {
        "concatenation"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        if a.samples != b.samples || a.width != b.width || a.height != b.height {
            return Err(NetError::shape("concatenation", a, b));
        }
        Ok(vec![TensorShape::new(
            a.samples,
            a.maps + b.maps,
            a.height,
            a.width,
        )])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.maps_a = inputs[0].maps;
        self.input_shape_a = inputs[0];
        self.input_shape_b = inputs[1];
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let output = &mut outputs[0];
        for sample in 0..self.input_shape_a.samples {
            for map in 0..self.input_shape_a.maps {
                Tensor::copy_map(&inputs[0].data, sample, map, &mut output.data, sample, map)?;
            }
            for map in 0..self.input_shape_b.maps {
                Tensor::copy_map(
                    &inputs[1].data,
                    sample,
                    map,
                    &mut output.data,
                    sample,
                    self.maps_a + map,
                )?;
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
        for sample in 0..self.input_shape_a.samples {
            if inputs[0].backprop {
                for map in 0..self.input_shape_a.maps {
                    Tensor::copy_map(
                        &outputs[0].delta,
                        sample,
                        map,
                        &mut inputs[0].buffer.delta,
                        sample,
                        map,
                    )?;
                }
            }
            if inputs[1].backprop {
                for map in 0..self.input_shape_b.maps {
                    Tensor::copy_map(
                        &outputs[0].delta,
                        sample,
                        self.maps_a + map,
                        &mut inputs[1].buffer.delta,
                        sample,
                        map,
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Elementwise sum of two identically shaped inputs.
pub struct SumLayer;

impl Layer for SumLayer {
    fn kind(&self) -> &'static str {
        "sum"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 2)?;
        if inputs[0] != inputs[1] {
            return Err(NetError::shape("sum", inputs[0], inputs[1]));
        }
        Ok(vec![inputs[0]])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        math::add(&inputs[0].data, &inputs[1].data, &mut outputs[0].data)
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        for input in inputs.iter_mut() {
            if input.backprop {
                input
                    .buffer
                    .delta
                    .as_slice_mut()
                    .copy_from_slice(outputs[0].delta.as_slice());
            }
        }
        Ok(())
    }
}

/// Fans one input out to N identical outputs and sums their gradients on the
/// way back. Insert this wherever one buffer feeds several consumers that
/// all backpropagate.
pub struct GradientAccumulationLayer {
    output_count: usize,
}

impl GradientAccumulationLayer {
    pub fn new(output_count: usize) -> Self {
        Self { output_count }
    }
}

impl Layer for GradientAccumulationLayer {
    fn kind(&self) -> &'static str {
        "gradientaccumulation"
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        Ok(vec![inputs[0]; self.output_count])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        for output in outputs.iter_mut() {
            output
                .data
                .as_slice_mut()
                .copy_from_slice(inputs[0].data.as_slice());
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
        input.buffer.delta.clear(0.0);
        let target = input.buffer.delta.as_slice_mut();
        for output in outputs {
            for (t, &d) in target.iter_mut().zip(output.delta.as_slice()) {
                *t += d;
            }
        }
        Ok(())
    }
}
