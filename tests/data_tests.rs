use oxidenet::data::{BatchBuffers, Bundle, BundleInputLayer, ClassManager, Sample, Segment};
use oxidenet::tensor::{CombinedTensor, PerSampleMeta, Tensor};
use oxidenet::types::{Task, TensorShape, UNKNOWN_CLASS};
use serde_json::json;

fn sample(name: &str, class: &str) -> Sample {
    Sample::new(json!({ "image_filename": name, "class": class })).unwrap()
}

fn segment_with(name: &str, count: usize, class: &str) -> Segment {
    let mut segment = Segment::new(name);
    for i in 0..count {
        segment.add_sample(sample(&format!("{name}_{i}.png"), class));
    }
    segment
}

#[test]
fn sample_requires_image_filename() {
    assert!(Sample::new(json!({ "class": "cat" })).is_err());
    assert!(Sample::new(json!("not an object")).is_err());
    let s = sample("img.png", "cat");
    assert_eq!(s.image_filename(), "img.png");
    assert_eq!(s.class_name(), Some("cat"));
}

#[test]
fn bundle_counts_aggregate_over_segments() {
    let mut bundle = Bundle::new("train");
    bundle.add_segment(segment_with("a", 3, "cat"));
    bundle.add_segment(segment_with("b", 5, "dog"));
    assert_eq!(bundle.segment_count(), 2);
    assert_eq!(bundle.sample_count(), 8);
}

#[test]
fn moving_a_segment_transfers_ownership_and_counts() {
    let mut a = Bundle::new("a");
    a.add_segment(segment_with("keep", 4, "cat"));
    a.add_segment(segment_with("move", 6, "dog"));
    let mut b = Bundle::new("b");
    b.add_segment(segment_with("existing", 2, "cat"));

    let a_before = a.sample_count();
    let b_before = b.sample_count();
    a.move_segment("move", &mut b).unwrap();

    assert_eq!(a.sample_count(), a_before - 6);
    assert_eq!(b.sample_count(), b_before + 6);
    assert!(a.segment_by_name("move").is_none());
    assert!(b.segment_by_name("move").is_some());

    // The segment is reachable from exactly one bundle.
    assert!(a.move_segment("move", &mut b).is_err());
}

#[test]
fn bundle_json_roundtrip() {
    let mut bundle = Bundle::new("roundtrip");
    let mut segment = segment_with("s1", 2, "cat");
    segment.score = 0.25;
    bundle.add_segment(segment);

    let reread = Bundle::from_json(&bundle.to_json()).unwrap();
    assert_eq!(reread, bundle);
}

#[test]
fn class_manager_assigns_dense_ids_and_persists() {
    let names = ["Test", "Test1", "Test2", "Test3", "Test4"];
    let mut manager = ClassManager::new();
    assert_eq!(manager.class_count(), 0);
    assert_eq!(manager.max_class_id(), 0);

    for name in names {
        assert!(manager.register(name, 1, 2.0));
    }
    let mut max_id = 0;
    for name in names {
        let id = manager.id_by_name(name);
        assert_ne!(id, UNKNOWN_CLASS);
        max_id = max_id.max(id);
        assert_eq!(manager.name_by_id(id), Some(name));
    }
    assert_eq!(max_id, manager.max_class_id());

    let reloaded = ClassManager::from_json(&manager.to_json()).unwrap();
    for name in names {
        assert_eq!(reloaded.id_by_name(name), manager.id_by_name(name));
        assert_eq!(
            reloaded.info_by_name(name).unwrap().color,
            manager.info_by_name(name).unwrap().color
        );
        assert_eq!(
            reloaded.info_by_name(name).unwrap().weight,
            manager.info_by_name(name).unwrap().weight
        );
    }
    assert_eq!(reloaded, manager);
}

#[test]
fn class_manager_matches_colors_by_distance() {
    let mut manager = ClassManager::new();
    manager.register("red", 0xff0000, 1.0);
    manager.register("green", 0x00ff00, 1.0);
    assert_eq!(manager.id_by_color(250, 10, 10), manager.id_by_name("red"));
    assert_eq!(manager.id_by_color(0, 200, 30), manager.id_by_name("green"));
}

struct Buffers {
    data: CombinedTensor,
    label: CombinedTensor,
    helper: CombinedTensor,
    weight: CombinedTensor,
}

impl Buffers {
    fn new(batch: usize, data_shape: TensorShape, label_shape: TensorShape) -> Self {
        Self {
            data: CombinedTensor::new(data_shape),
            label: CombinedTensor::new(label_shape),
            helper: CombinedTensor::from_dims(batch, 2, 1, 1),
            weight: CombinedTensor::from_dims(batch, 1, 1, 1),
        }
    }

    fn as_batch(&mut self) -> BatchBuffers<'_> {
        BatchBuffers {
            data: &mut self.data,
            label: &mut self.label,
            helper: &mut self.helper,
            weight: &mut self.weight,
        }
    }
}

/// Loader that derives a constant image from the filename's trailing index.
fn synthetic_loader(shape: TensorShape) -> oxidenet::data::ImageLoader {
    Box::new(move |filename: &str, _folder: Option<&str>| {
        let digits: String = filename
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        let value = digits.parse::<u32>().unwrap_or(0) as f32;
        let mut tensor = Tensor::new(TensorShape::new(1, shape.maps, shape.height, shape.width));
        tensor.clear(value);
        Ok(tensor)
    })
}

fn two_class_manager() -> ClassManager {
    let mut classes = ClassManager::new();
    classes.register("cat", 0x102030, 1.0);
    classes.register("dog", 0x405060, 3.0);
    classes
}

#[test]
fn classification_batches_carry_one_hot_labels_and_class_weights() {
    let data_shape = TensorShape::new(2, 1, 2, 2);
    let label_shape = TensorShape::flat(2, 2);
    let mut buffers = Buffers::new(2, data_shape, label_shape);

    let mut input = BundleInputLayer::new(Task::Classification, two_class_manager(), 99);
    input.set_loader(synthetic_loader(data_shape));

    let mut bundle = Bundle::new("train");
    bundle.add_segment(segment_with("dogs", 4, "dog"));
    input.add_training_bundle(bundle, 1.0);

    let mut batch = buffers.as_batch();
    let served = input.select_and_load(&mut batch, false).unwrap();
    assert_eq!(served, 2);

    for slot in 0..2 {
        let label = buffers.label.data.sample_slice(slot);
        assert_eq!(label, &[0.0, 1.0]);
        // Class weight for "dog" is 3.
        assert_eq!(buffers.weight.data.sample_slice(slot)[0], 3.0);
    }
}

#[test]
fn testing_sweep_serves_every_sample_exactly_once() {
    let data_shape = TensorShape::new(3, 1, 1, 1);
    let label_shape = TensorShape::flat(3, 2);
    let mut buffers = Buffers::new(3, data_shape, label_shape);

    let mut input = BundleInputLayer::new(Task::Classification, two_class_manager(), 1);
    input.set_loader(synthetic_loader(data_shape));

    let mut bundle = Bundle::new("test");
    let mut segment = Segment::new("s");
    for i in 0..7 {
        segment.add_sample(sample(&format!("img{i}.png"), "cat"));
    }
    bundle.add_segment(segment);
    input.add_testing_bundle(bundle);
    assert_eq!(input.testing_sample_count(), 7);

    input.begin_testing_epoch();
    let mut seen = Vec::new();
    loop {
        let mut batch = buffers.as_batch();
        let served = input.select_and_load(&mut batch, true).unwrap();
        if served == 0 {
            break;
        }
        for slot in 0..served {
            seen.push(buffers.data.data.sample_slice(slot)[0] as u32);
        }
        // Padded slots are weighted out.
        for slot in served..3 {
            assert_eq!(buffers.weight.data.sample_slice(slot)[0], 0.0);
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6]);

    // The sweep is deterministic: a second epoch yields the same order.
    input.begin_testing_epoch();
    let mut batch = buffers.as_batch();
    let served = input.select_and_load(&mut batch, true).unwrap();
    assert_eq!(served, 3);
    assert_eq!(buffers.data.data.sample_slice(0)[0], 0.0);
}

#[test]
fn staged_bundles_can_be_promoted() {
    let mut input = BundleInputLayer::new(Task::Classification, two_class_manager(), 0);
    let mut staged = Bundle::new("fresh");
    staged.add_segment(segment_with("s", 3, "cat"));
    input.add_staging_bundle(staged);
    input.add_staging_bundle(Bundle::new("other"));
    assert_eq!(input.staging_bundles().len(), 2);

    input.promote_staged("fresh", false, 2.0).unwrap();
    assert_eq!(input.staging_bundles().len(), 1);
    assert_eq!(input.training_bundles().len(), 1);
    assert_eq!(input.training_bundles()[0].1, 2.0);
    assert_eq!(input.training_sample_count(), 3);

    input.promote_staged("other", true, 1.0).unwrap();
    assert_eq!(input.testing_bundles().len(), 1);
    assert!(input.promote_staged("ghost", false, 1.0).is_err());
}

#[test]
fn detection_batches_fill_the_metadata_slot() {
    let data_shape = TensorShape::new(1, 1, 2, 2);
    let label_shape = TensorShape::flat(1, 1);
    let mut buffers = Buffers::new(1, data_shape, label_shape);

    let mut input = BundleInputLayer::new(Task::Detection, two_class_manager(), 5);
    input.set_loader(synthetic_loader(data_shape));

    let mut bundle = Bundle::new("train");
    let mut segment = Segment::new("s");
    segment.add_sample(
        Sample::new(json!({
            "image_filename": "img0.png",
            "boxes": [ { "x": 0.5, "y": 0.25, "w": 0.2, "h": 0.1, "class_id": 1 } ]
        }))
        .unwrap(),
    );
    bundle.add_segment(segment);
    input.add_training_bundle(bundle, 1.0);

    let mut batch = buffers.as_batch();
    input.select_and_load(&mut batch, false).unwrap();

    match &buffers.label.meta[0] {
        PerSampleMeta::Boxes(boxes) => {
            assert_eq!(boxes.len(), 1);
            assert_eq!(boxes[0].class_id, 1);
            assert!((boxes[0].x - 0.5).abs() < 1e-6);
        }
        other => panic!("expected boxes in metadata, got {other:?}"),
    }
}

#[test]
fn force_load_overrides_the_sampling_policy() {
    let data_shape = TensorShape::new(1, 1, 1, 1);
    let label_shape = TensorShape::flat(1, 2);
    let mut buffers = Buffers::new(1, data_shape, label_shape);

    let mut input = BundleInputLayer::new(Task::Classification, two_class_manager(), 5);
    input.set_loader(synthetic_loader(data_shape));

    // No training bundles at all: only the forced sample can be served.
    input
        .force_load_classification(
            json!({ "image_filename": "img42.png", "class": "cat" }),
            0,
        )
        .unwrap();
    let mut batch = buffers.as_batch();
    input.select_and_load(&mut batch, false).unwrap();
    assert_eq!(buffers.data.data.sample_slice(0)[0], 42.0);
    assert_eq!(buffers.label.data.sample_slice(0), &[1.0, 0.0]);

    // The override is consumed: the next load has nothing to draw from.
    let mut batch = buffers.as_batch();
    assert!(input.select_and_load(&mut batch, false).is_err());
}
