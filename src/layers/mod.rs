pub mod conv;
pub mod dropout;
pub mod fc;
pub mod input;
pub mod loss;
pub mod lrn;
pub mod nonlinearity;
pub mod pooling;
pub mod shape_ops;
pub mod sparsity;
pub mod yolo;

pub use conv::ConvolutionLayer;
pub use dropout::DropoutLayer;
pub use fc::FullyConnectedLayer;
pub use input::InputLayer;
pub use loss::{
    BinaryStatLayer, ConfusionMatrixLayer, DetectionStatLayer, MultiClassErrorLayer,
    SquareErrorLayer,
};
pub use lrn::{LocalResponseNormalizationLayer, NormalizationMethod};
pub use nonlinearity::{NonLinearity, NonLinearityLayer};
pub use pooling::{AdvancedMaxPoolingLayer, MaxPoolingLayer};
pub use shape_ops::{
    ConcatLayer, ConcatenationLayer, FlattenLayer, GradientAccumulationLayer,
    InputDownSamplingLayer, ResizeLayer, SpatialPriorLayer, SumLayer, UpscaleLayer,
};
pub use sparsity::SparsityReLULayer;
pub use yolo::{YOLODetectionLayer, YOLOLossLayer};

use crate::errors::NetResult;
use crate::stats::StatAggregator;
use crate::tensor::CombinedTensor;
use crate::types::TensorShape;

/// Static capability table of a layer kind.
#[derive(Debug, Clone, Copy)]
pub struct LayerCaps {
    /// Participates in gradient checks: backward produces an exact or
    /// near-exact analytic gradient.
    pub gradient_safe: bool,
    /// Tolerates input shape changes between batches.
    pub dynamic_aware: bool,
    /// Contributes a scalar loss term.
    pub is_loss: bool,
}

impl LayerCaps {
    pub const DEFAULT: LayerCaps = LayerCaps {
        gradient_safe: true,
        dynamic_aware: false,
        is_loss: false,
    };

    pub const LOSS: LayerCaps = LayerCaps {
        gradient_safe: true,
        dynamic_aware: false,
        is_loss: true,
    };
}

impl Default for LayerCaps {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Weight-initialization hint a nonlinearity offers to the trainable layer
/// directly upstream of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitHint {
    /// Saturating activation (tanh, sigmoid): Xavier fan-in/fan-out bound.
    Saturating,
    /// Rectifier activation: He bound.
    Rectifier,
}

/// Execution-time flags shared with every layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetStatus {
    pub is_testing: bool,
}

/// Mutable handle to an upstream buffer during backpropagation.
///
/// `backprop` mirrors the connection flag: when false the layer must leave
/// `buffer.delta` untouched.
pub struct InputRef<'a> {
    pub buffer: &'a mut CombinedTensor,
    pub backprop: bool,
}

/// A differentiable graph node.
///
/// The life of a layer: `create_outputs` answers what buffers it would
/// produce for given input shapes; `connect` validates the wiring and sizes
/// internal scratch and parameters; then `forward`/`backward` run every
/// batch. Layers own their parameters; the graph owns all activation
/// buffers.
pub trait Layer: Send {
    fn kind(&self) -> &'static str;

    fn caps(&self) -> LayerCaps {
        LayerCaps::DEFAULT
    }

    /// Computes output buffer shapes for the given input shapes, or a shape
    /// error if the inputs are invalid for this layer.
    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>>;

    /// Stores derived dimensions and allocates scratch/parameters. Succeeds
    /// iff `outputs` matches what `create_outputs` returned for `inputs`.
    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()>;

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        status: &NetStatus,
    ) -> NetResult<()>;

    /// Writes input deltas (for connections with backprop enabled) and adds
    /// to parameter deltas. Reads output deltas from `outputs`.
    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        outputs: &[CombinedTensor],
        status: &NetStatus,
    ) -> NetResult<()>;

    fn parameters(&self) -> Vec<&CombinedTensor> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut CombinedTensor> {
        Vec::new()
    }

    /// Multiplier applied to the global learning rate for this layer's
    /// parameters.
    fn local_learning_rate(&self) -> f32 {
        1.0
    }

    /// For nonlinearities: the hint offered to the directly upstream
    /// trainable layer.
    fn activation_hint(&self) -> Option<InitHint> {
        None
    }

    /// Called during graph initialization when a downstream layer offers a
    /// hint.
    fn receive_init_hint(&mut self, _hint: InitHint) {}

    /// (Re-)initializes parameters from the layer's seed.
    fn init_weights(&mut self) {}

    /// Scalar loss contributed by the most recent forward pass.
    fn loss(&self) -> Option<f32> {
        None
    }

    /// Claims aggregator slots for the metrics this layer publishes. Called
    /// once, before the aggregator is initialized.
    fn register_stats(&mut self, _stats: &mut StatAggregator) -> NetResult<()> {
        Ok(())
    }

    /// Pushes accumulated metrics into the aggregator and clears them.
    fn publish_stats(&mut self, _stats: &mut StatAggregator) {}
}

pub(crate) fn expect_input_count(
    kind: &'static str,
    inputs: &[TensorShape],
    count: usize,
) -> NetResult<()> {
    if inputs.len() != count {
        return Err(crate::errors::NetError::ShapeMsg(format!(
            "{kind} expects {count} input(s), got {}",
            inputs.len()
        )));
    }
    Ok(())
}

pub(crate) fn expect_output_match(
    kind: &'static str,
    expected: &[TensorShape],
    actual: &[TensorShape],
) -> NetResult<()> {
    if expected.len() != actual.len() {
        return Err(crate::errors::NetError::Wiring(format!(
            "{kind} expects {} output buffer(s), got {}",
            expected.len(),
            actual.len()
        )));
    }
    for (e, a) in expected.iter().zip(actual) {
        if e != a {
            return Err(crate::errors::NetError::Wiring(format!(
                "{kind} output buffer mismatch: expected {e}, found {a}"
            )));
        }
    }
    Ok(())
}
