use approx::assert_abs_diff_eq;
use oxidenet::graph::{Connection, NetGraph, NetGraphNode};
use oxidenet::layers::{
    DropoutLayer, FlattenLayer, InputDownSamplingLayer, InputLayer, InputRef, Layer, NetStatus,
    SpatialPriorLayer,
};
use oxidenet::tensor::CombinedTensor;
use oxidenet::types::{Task, TensorShape};
use oxidenet::NetError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn connect_simple(layer: &mut dyn Layer, shape: TensorShape) -> Vec<CombinedTensor> {
    let out_shapes = layer.create_outputs(&[shape]).unwrap();
    layer.connect(&[shape], &out_shapes).unwrap();
    out_shapes.iter().map(|&s| CombinedTensor::new(s)).collect()
}

fn random_input(shape: TensorShape, seed: u64) -> CombinedTensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buffer = CombinedTensor::new(shape);
    for value in buffer.data.as_slice_mut() {
        *value = rng.gen_range(-1.0..1.0);
    }
    buffer
}

#[test]
fn dropout_is_identity_while_testing() {
    let shape = TensorShape::new(2, 2, 4, 4);
    let mut layer = DropoutLayer::new(0.5, 9).unwrap();
    let mut outputs = connect_simple(&mut layer, shape);
    let input = random_input(shape, 1);

    let status = NetStatus { is_testing: true };
    layer.forward(&[&input], &mut outputs, &status).unwrap();
    assert_eq!(outputs[0].data.as_slice(), input.data.as_slice());
}

#[test]
fn dropout_zeroes_and_rescales_while_training() {
    let shape = TensorShape::new(1, 1, 32, 32);
    let fraction = 0.5;
    let mut layer = DropoutLayer::new(fraction, 9).unwrap();
    let mut outputs = connect_simple(&mut layer, shape);
    let mut input = CombinedTensor::new(shape);
    input.data.clear(1.0);

    let status = NetStatus { is_testing: false };
    layer.forward(&[&input], &mut outputs, &status).unwrap();

    let scale = 1.0 / (1.0 - fraction);
    let values = outputs[0].data.as_slice();
    let kept = values.iter().filter(|&&v| v != 0.0).count();
    assert!(values.iter().all(|&v| v == 0.0 || (v - scale).abs() < 1e-6));
    // Expectation preserved: roughly half survive at double strength.
    let kept_fraction = kept as f32 / values.len() as f32;
    assert!((kept_fraction - 0.5).abs() < 0.1, "kept {kept_fraction}");
}

#[test]
fn dropout_backward_uses_the_stored_mask() {
    let shape = TensorShape::new(1, 1, 8, 8);
    let mut layer = DropoutLayer::new(0.3, 4).unwrap();
    let mut outputs = connect_simple(&mut layer, shape);
    let mut input = random_input(shape, 2);

    let status = NetStatus { is_testing: false };
    layer.forward(&[&input], &mut outputs, &status).unwrap();
    let forwarded = outputs[0].data.as_slice().to_vec();
    outputs[0].delta.clear(1.0);

    let mut refs = [InputRef {
        buffer: &mut input,
        backprop: true,
    }];
    layer.backward(&mut refs, &outputs, &status).unwrap();

    // Exactly the surviving positions receive gradient, at mask strength.
    for (d, (&y, &x)) in input
        .delta
        .as_slice()
        .iter()
        .zip(forwarded.iter().zip(input.data.as_slice()))
    {
        if y == 0.0 && x != 0.0 {
            assert_eq!(*d, 0.0);
        }
    }
}

#[test]
fn deterministic_dropout_for_equal_seeds() {
    let shape = TensorShape::new(1, 1, 16, 16);
    let input = random_input(shape, 3);
    let status = NetStatus { is_testing: false };

    let mut first = DropoutLayer::new(0.4, 123).unwrap();
    let mut first_out = connect_simple(&mut first, shape);
    first.forward(&[&input], &mut first_out, &status).unwrap();

    let mut second = DropoutLayer::new(0.4, 123).unwrap();
    let mut second_out = connect_simple(&mut second, shape);
    second.forward(&[&input], &mut second_out, &status).unwrap();

    assert_eq!(
        first_out[0].data.as_slice(),
        second_out[0].data.as_slice()
    );
}

#[test]
fn input_downsampling_averages_blocks() {
    let shape = TensorShape::new(1, 1, 4, 4);
    let mut layer = InputDownSamplingLayer::new(2, 2);
    let mut outputs = connect_simple(&mut layer, shape);

    let mut input = CombinedTensor::new(shape);
    for (i, v) in input.data.as_slice_mut().iter_mut().enumerate() {
        *v = i as f32;
    }
    let status = NetStatus::default();
    layer.forward(&[&input], &mut outputs, &status).unwrap();
    // Top-left block is (0, 1, 4, 5) -> mean 2.5.
    assert_abs_diff_eq!(outputs[0].data.as_slice()[0], 2.5);
}

#[test]
fn input_downsampling_rejects_backprop() {
    let shape = TensorShape::new(1, 1, 4, 4);
    let mut layer = InputDownSamplingLayer::new(2, 2);
    let outputs = connect_simple(&mut layer, shape);
    let mut input = CombinedTensor::new(shape);

    let mut refs = [InputRef {
        buffer: &mut input,
        backprop: true,
    }];
    let result = layer.backward(&mut refs, &outputs, &NetStatus::default());
    assert!(matches!(result, Err(NetError::State(_))));

    let mut refs = [InputRef {
        buffer: &mut input,
        backprop: false,
    }];
    assert!(layer
        .backward(&mut refs, &outputs, &NetStatus::default())
        .is_ok());
}

#[test]
fn spatial_prior_prepends_normalized_coordinates() {
    let shape = TensorShape::new(1, 1, 4, 8);
    let mut layer = SpatialPriorLayer::new();
    let mut outputs = connect_simple(&mut layer, shape);
    let input = random_input(shape, 6);

    layer
        .forward(&[&input], &mut outputs, &NetStatus::default())
        .unwrap();

    let output = &outputs[0].data;
    assert_eq!(output.maps(), 3);
    for y in 0..4 {
        for x in 0..8 {
            assert_abs_diff_eq!(output.get(0, 0, y, x), x as f32 / 8.0);
            assert_abs_diff_eq!(output.get(0, 1, y, x), y as f32 / 4.0);
            assert_abs_diff_eq!(output.get(0, 2, y, x), input.data.get(0, 0, y, x));
        }
    }
}

#[test]
fn graph_reconnects_when_upstream_shapes_change() {
    let mut graph = NetGraph::new();
    let input = graph.add_node(
        NetGraphNode::new(
            "input",
            Box::new(InputLayer::new(1, 1, 2, 3, Task::Classification, 2)),
        )
        .as_input(),
    );
    let flat = graph.add_node(
        NetGraphNode::new("flatten", Box::new(FlattenLayer))
            .with_input(Connection::new(input, 0)),
    );
    graph.initialize().unwrap();
    graph.feed_forward().unwrap();
    assert_eq!(
        graph.buffers(flat)[0].shape(),
        TensorShape::flat(1, 6)
    );

    // Grow the input buffer; the next pass must re-derive the chain.
    graph.buffers_mut(input)[0].resize(TensorShape::new(1, 1, 4, 3));
    graph.buffers_mut(input)[0].is_dynamic = true;
    graph.feed_forward().unwrap();
    assert_eq!(
        graph.buffers(flat)[0].shape(),
        TensorShape::flat(1, 12)
    );
}
