use crate::errors::NetResult;
use crate::layers::{expect_input_count, expect_output_match, Layer, LayerCaps, NetStatus};
use crate::tensor::CombinedTensor;
use crate::types::{Task, TensorShape};

/// The graph's data source. It produces four buffers per batch — data,
/// label, helper and weight — which the batch assembler fills in place
/// before each forward pass; the layer itself only defines their shapes.
pub struct InputLayer {
    batch_size: usize,
    maps: usize,
    height: usize,
    width: usize,
    task: Task,
    class_count: usize,
}

/// Output buffer indices of [`InputLayer`].
pub const INPUT_DATA: usize = 0;
pub const INPUT_LABEL: usize = 1;
pub const INPUT_HELPER: usize = 2;
pub const INPUT_WEIGHT: usize = 3;

impl InputLayer {
    pub fn new(
        batch_size: usize,
        maps: usize,
        height: usize,
        width: usize,
        task: Task,
        class_count: usize,
    ) -> Self {
        Self {
            batch_size,
            maps,
            height,
            width,
            task,
            class_count,
        }
    }

    pub fn data_shape(&self) -> TensorShape {
        TensorShape::new(self.batch_size, self.maps, self.height, self.width)
    }

    pub fn label_shape(&self) -> TensorShape {
        match self.task {
            Task::Classification => TensorShape::flat(self.batch_size, self.class_count),
            Task::Segmentation => TensorShape::new(
                self.batch_size,
                self.class_count,
                self.height,
                self.width,
            ),
            Task::BinarySegmentation => {
                TensorShape::new(self.batch_size, 1, self.height, self.width)
            }
            // Ground truth travels in the metadata slot; the tensor is a stub.
            Task::Detection => TensorShape::flat(self.batch_size, 1),
        }
    }

    pub fn task(&self) -> Task {
        self.task
    }
}

impl Layer for InputLayer {
    fn kind(&self) -> &'static str {
        "input"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: true,
            is_loss: false,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 0)?;
        Ok(vec![
            self.data_shape(),
            self.label_shape(),
            TensorShape::new(self.batch_size, 2, 1, 1),
            TensorShape::flat(self.batch_size, 1),
        ])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        _inputs: &[&CombinedTensor],
        _outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        // Buffers are filled externally by the batch assembler.
        Ok(())
    }

    fn backward(
        &mut self,
        _inputs: &mut [crate::layers::InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        Ok(())
    }
}
