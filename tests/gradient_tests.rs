//! Finite-difference verification of every gradient-safe layer.
//!
//! For each layer and seed: run forward, take the loss `L = sum |out|`,
//! backpropagate its gradient, then compare input and parameter gradients
//! against central differences. A run passes when at least 85% of the
//! checked elements agree within 20% relative error and the overall
//! gradient magnitude ratio stays in [0.8, 1.2]; a layer passes when at
//! least 80% of 50 seeded runs pass.

use oxidenet::layers::{
    AdvancedMaxPoolingLayer, ConcatLayer, ConcatenationLayer, ConvolutionLayer, FlattenLayer,
    FullyConnectedLayer, GradientAccumulationLayer, InputRef, Layer, LocalResponseNormalizationLayer,
    MaxPoolingLayer, NonLinearity, NonLinearityLayer, NormalizationMethod, ResizeLayer,
    SparsityReLULayer, SpatialPriorLayer, SquareErrorLayer, SumLayer, UpscaleLayer,
};
use oxidenet::tensor::CombinedTensor;
use oxidenet::types::TensorShape;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEEDS: u64 = 50;
const MIN_RUN_SUCCESS: f64 = 0.8;
const MIN_ELEMENT_SUCCESS: f64 = 0.85;
const RELATIVE_TOLERANCE: f64 = 0.2;
const EPSILON: f32 = 1e-2;

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn loss_of(outputs: &[CombinedTensor]) -> f64 {
    outputs
        .iter()
        .flat_map(|o| o.data.as_slice())
        .map(|&v| v.abs() as f64)
        .sum()
}

fn run_forward(layer: &mut dyn Layer, inputs: &[CombinedTensor], outputs: &mut [CombinedTensor]) {
    let refs: Vec<&CombinedTensor> = inputs.iter().collect();
    layer
        .forward(&refs, outputs, &Default::default())
        .expect("forward failed");
}

struct GradientCheck {
    checked: usize,
    within_tolerance: usize,
    analytic_magnitude: f64,
    numeric_magnitude: f64,
}

impl GradientCheck {
    fn new() -> Self {
        Self {
            checked: 0,
            within_tolerance: 0,
            analytic_magnitude: 0.0,
            numeric_magnitude: 0.0,
        }
    }

    fn record(&mut self, analytic: f64, numeric: f64) {
        self.checked += 1;
        self.analytic_magnitude += analytic.abs();
        self.numeric_magnitude += numeric.abs();
        let scale = analytic.abs().max(numeric.abs());
        if scale < 1e-4 || (analytic - numeric).abs() / scale <= RELATIVE_TOLERANCE {
            self.within_tolerance += 1;
        }
    }

    fn passes(&self) -> bool {
        if self.checked == 0 {
            return true;
        }
        let element_rate = self.within_tolerance as f64 / self.checked as f64;
        if element_rate < MIN_ELEMENT_SUCCESS {
            return false;
        }
        if self.numeric_magnitude < 1e-6 && self.analytic_magnitude < 1e-6 {
            return true;
        }
        let ratio = self.analytic_magnitude / self.numeric_magnitude.max(1e-12);
        (0.8..=1.2).contains(&ratio)
    }
}

/// One seeded gradient check of a freshly built layer.
fn check_once(
    build: &dyn Fn() -> Box<dyn Layer>,
    input_shapes: &[TensorShape],
    seed: u64,
) -> bool {
    let mut layer = build();
    let output_shapes = layer.create_outputs(input_shapes).expect("create_outputs");
    layer.connect(input_shapes, &output_shapes).expect("connect");

    let mut rng = StdRng::seed_from_u64(seed);
    let mut inputs: Vec<CombinedTensor> = input_shapes
        .iter()
        .map(|&shape| {
            let mut buffer = CombinedTensor::new(shape);
            for value in buffer.data.as_slice_mut() {
                *value = rng.gen_range(-1.0..1.0);
            }
            buffer
        })
        .collect();
    let mut outputs: Vec<CombinedTensor> = output_shapes
        .iter()
        .map(|&shape| CombinedTensor::new(shape))
        .collect();

    run_forward(layer.as_mut(), &inputs, &mut outputs);

    // Shape soundness: what create_outputs promised is what forward wrote.
    for (buffer, &shape) in outputs.iter().zip(output_shapes.iter()) {
        assert_eq!(buffer.shape(), shape);
    }

    // dL/dout for L = sum |out|.
    for output in &mut outputs {
        let data = output.data.as_slice().to_vec();
        for (d, v) in output.delta.as_slice_mut().iter_mut().zip(data) {
            *d = sign(v);
        }
    }

    {
        let mut refs: Vec<InputRef<'_>> = inputs
            .iter_mut()
            .map(|buffer| InputRef {
                buffer,
                backprop: true,
            })
            .collect();
        layer
            .backward(&mut refs, &outputs, &Default::default())
            .expect("backward failed");
    }

    let analytic_inputs: Vec<Vec<f32>> = inputs
        .iter()
        .map(|b| b.delta.as_slice().to_vec())
        .collect();
    let analytic_parameters: Vec<Vec<f32>> = layer
        .parameters()
        .iter()
        .map(|p| p.delta.as_slice().to_vec())
        .collect();

    let mut check = GradientCheck::new();

    // Input gradients by central differences.
    for input_index in 0..inputs.len() {
        let elements = inputs[input_index].data.elements();
        let stride = (elements / 48).max(1);
        for element in (0..elements).step_by(stride) {
            let original = inputs[input_index].data.as_slice()[element];

            inputs[input_index].data.as_slice_mut()[element] = original + EPSILON;
            run_forward(layer.as_mut(), &inputs, &mut outputs);
            let loss_plus = loss_of(&outputs);

            inputs[input_index].data.as_slice_mut()[element] = original - EPSILON;
            run_forward(layer.as_mut(), &inputs, &mut outputs);
            let loss_minus = loss_of(&outputs);

            inputs[input_index].data.as_slice_mut()[element] = original;
            let numeric = (loss_plus - loss_minus) / (2.0 * EPSILON as f64);
            check.record(analytic_inputs[input_index][element] as f64, numeric);
        }
    }

    // Parameter gradients by central differences.
    for parameter_index in 0..analytic_parameters.len() {
        let elements = analytic_parameters[parameter_index].len();
        let stride = (elements / 32).max(1);
        for element in (0..elements).step_by(stride) {
            let original = layer.parameters()[parameter_index].data.as_slice()[element];

            layer.parameters_mut()[parameter_index].data.as_slice_mut()[element] =
                original + EPSILON;
            run_forward(layer.as_mut(), &inputs, &mut outputs);
            let loss_plus = loss_of(&outputs);

            layer.parameters_mut()[parameter_index].data.as_slice_mut()[element] =
                original - EPSILON;
            run_forward(layer.as_mut(), &inputs, &mut outputs);
            let loss_minus = loss_of(&outputs);

            layer.parameters_mut()[parameter_index].data.as_slice_mut()[element] = original;
            let numeric = (loss_plus - loss_minus) / (2.0 * EPSILON as f64);
            check.record(analytic_parameters[parameter_index][element] as f64, numeric);
        }
    }

    check.passes()
}

fn check_layer(name: &str, build: &dyn Fn() -> Box<dyn Layer>, input_shapes: &[TensorShape]) {
    let mut passed = 0;
    for seed in 0..SEEDS {
        if check_once(build, input_shapes, 1000 + seed) {
            passed += 1;
        }
    }
    let rate = passed as f64 / SEEDS as f64;
    assert!(
        rate >= MIN_RUN_SUCCESS,
        "{name}: only {passed}/{SEEDS} gradient runs passed"
    );
}

#[test]
fn convolution_gradients() {
    check_layer(
        "convolution",
        &|| Box::new(ConvolutionLayer::simple(3, 3, 3, 42)),
        &[TensorShape::new(2, 2, 5, 5)],
    );
}

#[test]
fn strided_padded_convolution_gradients() {
    check_layer(
        "convolution stride/pad",
        &|| Box::new(ConvolutionLayer::new(3, 3, 2, 2, 2, 1, 1, 1, 43)),
        &[TensorShape::new(1, 2, 6, 6)],
    );
}

#[test]
fn grouped_convolution_gradients() {
    check_layer(
        "convolution group",
        &|| Box::new(ConvolutionLayer::new(3, 3, 4, 1, 1, 1, 1, 2, 44)),
        &[TensorShape::new(1, 4, 4, 4)],
    );
}

#[test]
fn fully_connected_gradients() {
    check_layer(
        "fullyconnected",
        &|| Box::new(FullyConnectedLayer::new(4, 45)),
        &[TensorShape::flat(2, 6)],
    );
}

#[test]
fn max_pooling_gradients() {
    check_layer(
        "maxpooling",
        &|| Box::new(MaxPoolingLayer::new(2, 2)),
        &[TensorShape::new(2, 2, 4, 4)],
    );
}

#[test]
fn advanced_max_pooling_gradients() {
    check_layer(
        "amaxpooling",
        &|| Box::new(AdvancedMaxPoolingLayer::new(3, 3, 2, 2)),
        &[TensorShape::new(2, 2, 5, 5)],
    );
}

#[test]
fn nonlinearity_gradients() {
    for function in [
        NonLinearity::Tanh,
        NonLinearity::Sigmoid,
        NonLinearity::ReLU,
        NonLinearity::LeakyReLU,
    ] {
        check_layer(
            function.kind_str(),
            &|| Box::new(NonLinearityLayer::new(function)),
            &[TensorShape::new(2, 2, 3, 3)],
        );
    }
}

#[test]
fn softmax_gradients() {
    check_layer(
        "softmax",
        &|| Box::new(NonLinearityLayer::new(NonLinearity::Softmax)),
        &[TensorShape::flat(2, 5)],
    );
}

/// `sum |out|` is constant for softmax, so its Jacobian needs a dedicated
/// check against a random linear loss `L = sum c_i out_i`.
#[test]
fn softmax_jacobian_matches_finite_differences() {
    let shape = TensorShape::flat(2, 6);
    let mut layer = NonLinearityLayer::new(NonLinearity::Softmax);
    let output_shapes = layer.create_outputs(&[shape]).unwrap();
    layer.connect(&[shape], &output_shapes).unwrap();

    let mut rng = StdRng::seed_from_u64(31);
    let mut input = CombinedTensor::new(shape);
    for value in input.data.as_slice_mut() {
        *value = rng.gen_range(-2.0..2.0);
    }
    let coefficients: Vec<f32> = (0..shape.elements())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();

    let mut outputs = vec![CombinedTensor::new(output_shapes[0])];
    let weighted_loss = |layer: &mut NonLinearityLayer,
                         input: &CombinedTensor,
                         outputs: &mut Vec<CombinedTensor>,
                         coefficients: &[f32]| {
        layer
            .forward(&[input], outputs, &Default::default())
            .unwrap();
        outputs[0]
            .data
            .as_slice()
            .iter()
            .zip(coefficients)
            .map(|(&y, &c)| (y * c) as f64)
            .sum::<f64>()
    };

    weighted_loss(&mut layer, &input, &mut outputs, &coefficients);
    outputs[0]
        .delta
        .as_slice_mut()
        .copy_from_slice(&coefficients);
    {
        let mut refs = [InputRef {
            buffer: &mut input,
            backprop: true,
        }];
        layer
            .backward(&mut refs, &outputs, &Default::default())
            .unwrap();
    }
    let analytic = input.delta.as_slice().to_vec();

    for element in 0..shape.elements() {
        let original = input.data.as_slice()[element];
        input.data.as_slice_mut()[element] = original + EPSILON;
        let plus = weighted_loss(&mut layer, &input, &mut outputs, &coefficients);
        input.data.as_slice_mut()[element] = original - EPSILON;
        let minus = weighted_loss(&mut layer, &input, &mut outputs, &coefficients);
        input.data.as_slice_mut()[element] = original;

        let numeric = (plus - minus) / (2.0 * EPSILON as f64);
        assert!(
            (analytic[element] as f64 - numeric).abs() < 2e-3,
            "element {element}: analytic {} vs numeric {numeric}",
            analytic[element]
        );
    }
}

#[test]
fn lrn_gradients() {
    check_layer(
        "lrn across",
        &|| {
            Box::new(LocalResponseNormalizationLayer::new(
                3,
                0.5,
                0.75,
                NormalizationMethod::AcrossChannels,
            ))
        },
        &[TensorShape::new(1, 5, 3, 3)],
    );
    check_layer(
        "lrn within",
        &|| {
            Box::new(LocalResponseNormalizationLayer::new(
                3,
                0.5,
                0.75,
                NormalizationMethod::WithinChannel,
            ))
        },
        &[TensorShape::new(1, 2, 4, 4)],
    );
}

#[test]
fn resize_gradients() {
    check_layer(
        "resize",
        &|| Box::new(ResizeLayer::new(2, 2)),
        &[TensorShape::new(1, 2, 3, 3)],
    );
}

#[test]
fn upscale_gradients() {
    check_layer(
        "upscale",
        &|| Box::new(UpscaleLayer::new(2, 2)),
        &[TensorShape::new(1, 2, 3, 3)],
    );
}

#[test]
fn spatial_prior_gradients() {
    check_layer(
        "spatialprior",
        &|| Box::new(SpatialPriorLayer::new()),
        &[TensorShape::new(1, 2, 3, 3)],
    );
}

#[test]
fn flatten_gradients() {
    check_layer(
        "flatten",
        &|| Box::new(FlattenLayer),
        &[TensorShape::new(2, 2, 3, 3)],
    );
}

#[test]
fn sum_gradients() {
    check_layer(
        "sum",
        &|| Box::new(SumLayer),
        &[TensorShape::new(2, 2, 3, 3), TensorShape::new(2, 2, 3, 3)],
    );
}

#[test]
fn concat_gradients() {
    check_layer(
        "concat",
        &|| Box::new(ConcatLayer::new()),
        &[TensorShape::flat(2, 5), TensorShape::flat(2, 3)],
    );
}

#[test]
fn concatenation_gradients() {
    check_layer(
        "concatenation",
        &|| Box::new(ConcatenationLayer::new()),
        &[TensorShape::new(1, 2, 3, 3), TensorShape::new(1, 3, 3, 3)],
    );
}

#[test]
fn sparsity_relu_gradients() {
    // Gradient-safe configuration: the KL term is off and the activation-sum
    // regularizer has weight one, so the (a, b) gradient coincides with the
    // gradient of the sum loss (the activation is strictly positive).
    check_layer(
        "sparsityrelu",
        &|| Box::new(SparsityReLULayer::new(0.5, 0.5, 0.0, 1.0)),
        &[TensorShape::new(2, 2, 3, 3)],
    );
}

#[test]
fn gradient_accumulation_gradients() {
    check_layer(
        "gradientaccumulation",
        &|| Box::new(GradientAccumulationLayer::new(2)),
        &[TensorShape::new(1, 2, 2, 2)],
    );
}

/// The square-error loss reports its scalar through `loss()`, so it gets a
/// dedicated harness comparing the analytic input delta against central
/// differences of that scalar.
#[test]
fn square_error_loss_gradients() {
    let shape = TensorShape::flat(3, 4);
    let mut rng = StdRng::seed_from_u64(7);

    let mut prediction = CombinedTensor::new(shape);
    let mut label = CombinedTensor::new(shape);
    let mut weight = CombinedTensor::from_dims(3, 1, 1, 1);
    for value in prediction.data.as_slice_mut() {
        *value = rng.gen_range(-1.0..1.0);
    }
    for value in label.data.as_slice_mut() {
        *value = rng.gen_range(-1.0..1.0);
    }
    weight.data.as_slice_mut().copy_from_slice(&[1.0, 0.5, 2.0]);

    let shapes = [shape, shape, weight.shape()];
    let mut layer = SquareErrorLayer::new();
    let out_shapes = layer.create_outputs(&shapes).unwrap();
    layer.connect(&shapes, &out_shapes).unwrap();

    let forward_loss = |layer: &mut SquareErrorLayer,
                        prediction: &CombinedTensor,
                        label: &CombinedTensor,
                        weight: &CombinedTensor| {
        layer
            .forward(&[prediction, label, weight], &mut [], &Default::default())
            .unwrap();
        layer.loss().unwrap() as f64
    };

    forward_loss(&mut layer, &prediction, &label, &weight);
    {
        let mut refs = [
            InputRef {
                buffer: &mut prediction,
                backprop: true,
            },
            InputRef {
                buffer: &mut label,
                backprop: false,
            },
            InputRef {
                buffer: &mut weight,
                backprop: false,
            },
        ];
        layer.backward(&mut refs, &[], &Default::default()).unwrap();
    }
    let analytic = prediction.delta.as_slice().to_vec();

    for element in 0..shape.elements() {
        let original = prediction.data.as_slice()[element];
        prediction.data.as_slice_mut()[element] = original + EPSILON;
        let plus = forward_loss(&mut layer, &prediction, &label, &weight);
        prediction.data.as_slice_mut()[element] = original - EPSILON;
        let minus = forward_loss(&mut layer, &prediction, &label, &weight);
        prediction.data.as_slice_mut()[element] = original;

        let numeric = (plus - minus) / (2.0 * EPSILON as f64);
        assert!(
            (analytic[element] as f64 - numeric).abs() < 1e-3,
            "element {element}: analytic {} vs numeric {numeric}",
            analytic[element]
        );
    }

    // The label and weight buffers were never written.
    assert!(label.delta.as_slice().iter().all(|&v| v == 0.0));
    assert!(weight.delta.as_slice().iter().all(|&v| v == 0.0));
}
