use crate::tensor::Tensor;
use crate::types::TensorShape;
use crate::util::bbox::BoundingBox;

/// Per-sample side information that travels alongside a tensor buffer.
///
/// Detection layers exchange ground-truth and predicted boxes through this
/// channel; everything else leaves it at `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PerSampleMeta {
    #[default]
    None,
    Boxes(Vec<BoundingBox>),
}

impl PerSampleMeta {
    pub fn boxes(&self) -> Option<&[BoundingBox]> {
        match self {
            PerSampleMeta::Boxes(v) => Some(v),
            PerSampleMeta::None => None,
        }
    }
}

/// A value tensor paired with its gradient tensor of identical shape, plus
/// the optional per-sample metadata slot.
#[derive(Debug, Clone)]
pub struct CombinedTensor {
    pub data: Tensor,
    pub delta: Tensor,
    pub meta: Vec<PerSampleMeta>,
    /// Marks buffers whose shape may change between batches.
    pub is_dynamic: bool,
}

impl CombinedTensor {
    pub fn new(shape: TensorShape) -> Self {
        Self {
            data: Tensor::new(shape),
            delta: Tensor::new(shape),
            meta: vec![PerSampleMeta::None; shape.samples],
            is_dynamic: false,
        }
    }

    pub fn from_dims(samples: usize, maps: usize, height: usize, width: usize) -> Self {
        Self::new(TensorShape::new(samples, maps, height, width))
    }

    pub fn shape(&self) -> TensorShape {
        self.data.shape()
    }

    /// Resizes data and delta together, discarding contents on change. The
    /// metadata vector tracks the sample count.
    pub fn resize(&mut self, shape: TensorShape) {
        self.data.resize(shape);
        self.delta.resize(shape);
        self.meta.resize(shape.samples, PerSampleMeta::None);
    }

    pub fn clear_delta(&mut self) {
        self.delta.clear(0.0);
    }
}
