use approx::assert_abs_diff_eq;
use oxidenet::layers::yolo::{YOLOConfiguration, YOLODetectionLayer, YOLOLossLayer};
use oxidenet::layers::{InputRef, Layer, NetStatus};
use oxidenet::tensor::{CombinedTensor, PerSampleMeta};
use oxidenet::types::{TensorShape, UNKNOWN_CLASS};
use oxidenet::util::bbox::BoundingBox;

const CELLS: usize = 2; // 2x2 grid
const BOXES: usize = 1;
const CLASSES: usize = 3;

fn config() -> YOLOConfiguration {
    YOLOConfiguration {
        horizontal_cells: CELLS,
        vertical_cells: CELLS,
        boxes_per_cell: BOXES,
    }
}

fn prediction_elements() -> usize {
    CELLS * CELLS * (5 * BOXES + CLASSES)
}

fn box_offset(cell_id: usize) -> usize {
    5 * cell_id * BOXES
}

fn class_index(cell_id: usize, class: usize) -> usize {
    CELLS * CELLS * BOXES * 5 + class * CELLS * CELLS + cell_id
}

fn make_io(samples: usize) -> (CombinedTensor, Vec<CombinedTensor>) {
    let shape = TensorShape::flat(samples, prediction_elements());
    (CombinedTensor::new(shape), vec![CombinedTensor::new(shape)])
}

#[test]
fn decodes_a_single_confident_cell() {
    let mut layer = YOLODetectionLayer::new(config(), 0.5, true);
    let (mut input, mut outputs) = make_io(1);
    let shapes = [input.shape()];
    let out_shapes = layer.create_outputs(&shapes).unwrap();
    layer.connect(&shapes, &out_shapes).unwrap();

    // Cell 3 (bottom right): offset (0.5, 0.5) in-cell, size 0.25 x 0.25,
    // confidence 0.9, class 0 probability 1.
    let cell = 3;
    let values = input.data.as_slice_mut();
    let offset = box_offset(cell);
    values[offset] = 0.5;
    values[offset + 1] = 0.5;
    values[offset + 2] = 0.5;
    values[offset + 3] = 0.5;
    values[offset + 4] = 0.9;
    values[class_index(cell, 0)] = 1.0;

    let status = NetStatus::default();
    layer
        .forward(&[&input], &mut outputs, &status)
        .unwrap();

    let boxes = outputs[0].meta[0].boxes().unwrap();
    assert_eq!(boxes.len(), 1);
    let detected = &boxes[0];
    assert_eq!(detected.class_id, 0);
    assert!(detected.score >= 0.5);
    // Cell (1,1) of a 2x2 grid with in-cell offset 0.5 decodes to (0.75, 0.75).
    assert_abs_diff_eq!(detected.x, 0.75, epsilon = 1e-6);
    assert_abs_diff_eq!(detected.y, 0.75, epsilon = 1e-6);
    assert_abs_diff_eq!(detected.w, 0.25, epsilon = 1e-6);
    assert_abs_diff_eq!(detected.h, 0.25, epsilon = 1e-6);
}

#[test]
fn below_threshold_boxes_are_dropped() {
    let mut layer = YOLODetectionLayer::new(config(), 0.5, false);
    let (mut input, mut outputs) = make_io(1);
    let shapes = [input.shape()];
    let out_shapes = layer.create_outputs(&shapes).unwrap();
    layer.connect(&shapes, &out_shapes).unwrap();

    input.data.as_slice_mut()[box_offset(0) + 4] = 0.4;
    input.data.as_slice_mut()[class_index(0, 1)] = 1.0;

    let status = NetStatus::default();
    layer.forward(&[&input], &mut outputs, &status).unwrap();
    assert!(outputs[0].meta[0].boxes().unwrap().is_empty());
}

#[test]
fn confident_box_without_class_is_emitted_as_unknown() {
    let mut layer = YOLODetectionLayer::new(config(), 0.5, false);
    let (mut input, mut outputs) = make_io(1);
    let shapes = [input.shape()];
    let out_shapes = layer.create_outputs(&shapes).unwrap();
    layer.connect(&shapes, &out_shapes).unwrap();

    input.data.as_slice_mut()[box_offset(2) + 4] = 0.8;

    let status = NetStatus::default();
    layer.forward(&[&input], &mut outputs, &status).unwrap();
    let boxes = outputs[0].meta[0].boxes().unwrap();
    assert_eq!(boxes.len(), 1);
    assert!(boxes[0].unknown);
    assert_eq!(boxes[0].class_id, UNKNOWN_CLASS);
    assert_abs_diff_eq!(boxes[0].score, 0.8);
}

#[test]
fn detection_backward_passes_gradients_through() {
    let mut layer = YOLODetectionLayer::new(config(), 0.5, false);
    let (mut input, mut outputs) = make_io(1);
    let shapes = [input.shape()];
    let out_shapes = layer.create_outputs(&shapes).unwrap();
    layer.connect(&shapes, &out_shapes).unwrap();

    for (i, v) in outputs[0].delta.as_slice_mut().iter_mut().enumerate() {
        *v = i as f32;
    }
    let expected = outputs[0].delta.as_slice().to_vec();

    let status = NetStatus::default();
    let mut inputs = [InputRef {
        buffer: &mut input,
        backprop: true,
    }];
    layer.backward(&mut inputs, &outputs, &status).unwrap();
    assert_eq!(input.delta.as_slice(), expected.as_slice());
}

/// Encodes one ground-truth box exactly into the prediction tensor.
fn encode_perfect(values: &mut [f32], truth: &BoundingBox) {
    let hcell = (truth.x * CELLS as f32) as usize;
    let vcell = (truth.y * CELLS as f32) as usize;
    let cell = vcell * CELLS + hcell;
    let offset = box_offset(cell);
    values[offset] = truth.x * CELLS as f32 - hcell as f32;
    values[offset + 1] = truth.y * CELLS as f32 - vcell as f32;
    values[offset + 2] = truth.w.sqrt();
    values[offset + 3] = truth.h.sqrt();
    values[offset + 4] = 1.0;
    values[class_index(cell, truth.class_id)] = 1.0;
}

#[test]
fn perfect_prediction_has_zero_loss_and_zero_gradient() {
    let mut layer = YOLOLossLayer::new(config());
    let (mut prediction, _) = make_io(1);
    let mut label = CombinedTensor::new(TensorShape::flat(1, 1));

    let mut truth = BoundingBox::new(0.25, 0.75, 0.2, 0.4);
    truth.class_id = 1;
    encode_perfect(prediction.data.as_slice_mut(), &truth);
    label.meta[0] = PerSampleMeta::Boxes(vec![truth]);

    let shapes = [prediction.shape(), label.shape()];
    let out_shapes = layer.create_outputs(&shapes).unwrap();
    layer.connect(&shapes, &out_shapes).unwrap();

    let status = NetStatus::default();
    layer.forward(&[&prediction, &label], &mut [], &status).unwrap();
    assert_abs_diff_eq!(layer.loss().unwrap(), 0.0, epsilon = 1e-5);

    let mut inputs = [
        InputRef {
            buffer: &mut prediction,
            backprop: true,
        },
        InputRef {
            buffer: &mut label,
            backprop: false,
        },
    ];
    layer.backward(&mut inputs, &[], &status).unwrap();
    for &d in prediction.delta.as_slice() {
        assert_abs_diff_eq!(d, 0.0, epsilon = 1e-5);
    }
}

#[test]
fn imperfect_prediction_gets_pushed_towards_the_truth() {
    let mut layer = YOLOLossLayer::new(config());
    let (mut prediction, _) = make_io(1);
    let mut label = CombinedTensor::new(TensorShape::flat(1, 1));

    let mut truth = BoundingBox::new(0.25, 0.25, 0.2, 0.2);
    truth.class_id = 0;
    label.meta[0] = PerSampleMeta::Boxes(vec![truth]);

    // Predictor in the right cell but with wrong geometry and confidence.
    let values = prediction.data.as_slice_mut();
    values[box_offset(0)] = 0.9;
    values[box_offset(0) + 4] = 0.3;
    // A spurious confident predictor elsewhere.
    values[box_offset(3) + 4] = 0.7;

    let shapes = [prediction.shape(), label.shape()];
    let out_shapes = layer.create_outputs(&shapes).unwrap();
    layer.connect(&shapes, &out_shapes).unwrap();

    let status = NetStatus::default();
    layer.forward(&[&prediction, &label], &mut [], &status).unwrap();
    let loss = layer.loss().unwrap();
    assert!(loss > 0.0);

    let mut inputs = [
        InputRef {
            buffer: &mut prediction,
            backprop: true,
        },
        InputRef {
            buffer: &mut label,
            backprop: false,
        },
    ];
    layer.backward(&mut inputs, &[], &status).unwrap();

    // x offset predicted too large: gradient positive. Assigned confidence
    // too low: gradient negative. Unassigned confidence: positive.
    let delta = prediction.delta.as_slice();
    assert!(delta[box_offset(0)] > 0.0);
    assert!(delta[box_offset(0) + 4] < 0.0);
    assert!(delta[box_offset(3) + 4] > 0.0);
}
