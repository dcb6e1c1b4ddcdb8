use std::fs::File;
use std::io::{BufReader, BufWriter};

use approx::assert_abs_diff_eq;
use oxidenet::tensor::serialize::{read_tensor_stream, rl_compress, rl_decompress};
use oxidenet::tensor::Tensor;
use oxidenet::types::TensorShape;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tensor(shape: TensorShape, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensor = Tensor::new(shape);
    for value in tensor.as_slice_mut() {
        *value = rng.gen_range(-1.0..1.0);
    }
    tensor
}

#[test]
fn binary_serialization_roundtrip_is_bit_identical() {
    let a = random_tensor(TensorShape::new(2, 3, 4, 5), 12345);

    let mut bytes = Vec::new();
    a.serialize(&mut bytes).unwrap();

    let mut b = Tensor::from_dims(0, 0, 0, 0);
    b.deserialize(&mut bytes.as_slice()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn serialization_roundtrip_through_disk() {
    let a = random_tensor(TensorShape::new(4, 1, 8, 8), 7);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tensor.bin");

    {
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        a.serialize(&mut writer).unwrap();
    }
    let mut reader = BufReader::new(File::open(&path).unwrap());
    let b = Tensor::read_from(&mut reader).unwrap();
    assert_eq!(a, b);
}

#[test]
fn deserialization_rejects_bad_magic() {
    let bytes = vec![0u8; 64];
    let mut t = Tensor::from_dims(0, 0, 0, 0);
    assert!(t.deserialize(&mut bytes.as_slice()).is_err());
}

#[test]
fn base64_roundtrip_whole_tensor() {
    let a = random_tensor(TensorShape::new(2, 1, 1, 50), 12345);
    let mut b = Tensor::from_dims(0, 0, 0, 0);
    b.from_base64(&a.to_base64().unwrap()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn base64_roundtrip_per_sample() {
    let a = random_tensor(TensorShape::new(2, 1, 1, 50), 999);
    let mut b = Tensor::new(a.shape());
    b.sample_from_base64(&a.sample_to_base64(0), 0).unwrap();
    b.sample_from_base64(&a.sample_to_base64(1), 1).unwrap();
    assert_eq!(a, b);
}

#[test]
fn tensor_stream_reads_until_eof() {
    let tensors = vec![
        random_tensor(TensorShape::new(1, 2, 3, 3), 1),
        random_tensor(TensorShape::new(2, 1, 4, 4), 2),
        random_tensor(TensorShape::new(1, 1, 1, 7), 3),
    ];
    let mut bytes = Vec::new();
    for tensor in &tensors {
        tensor.serialize(&mut bytes).unwrap();
    }
    let read = read_tensor_stream(&mut bytes.as_slice()).unwrap();
    assert_eq!(read, tensors);
}

#[test]
fn rl_compression_roundtrip() {
    let mut data = Vec::new();
    data.extend(std::iter::repeat(0u8).take(100));
    data.extend_from_slice(b"XXXXhello worldXX");
    data.extend(std::iter::repeat(0x58u8).take(20));
    data.extend((0..=255u8).cycle().take(400));

    let compressed = rl_compress(&data);
    let decompressed = rl_decompress(&compressed).unwrap();
    assert_eq!(data, decompressed);
}

#[test]
fn rl_compression_shrinks_runs() {
    let data = vec![0u8; 4096];
    let compressed = rl_compress(&data);
    assert!(compressed.len() < 32);
    assert_eq!(rl_decompress(&compressed).unwrap(), data);
}

#[test]
fn bilinear_read_stays_within_enclosing_samples() {
    let tensor = random_tensor(TensorShape::new(1, 1, 6, 6), 4242);
    let mut rng = StdRng::seed_from_u64(77);
    for _ in 0..500 {
        let x: f32 = rng.gen_range(0.0..5.0);
        let y: f32 = rng.gen_range(0.0..5.0);
        let value = tensor.get_smooth(0, 0, y, x);
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        let corners = [
            tensor.get(0, 0, y0, x0),
            tensor.get(0, 0, y0, x0 + 1),
            tensor.get(0, 0, y0 + 1, x0),
            tensor.get(0, 0, y0 + 1, x0 + 1),
        ];
        let min = corners.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = corners.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!(value >= min - 1e-6 && value <= max + 1e-6);
    }
}

#[test]
fn bilinear_read_matches_grid_points() {
    let tensor = random_tensor(TensorShape::new(1, 2, 4, 4), 8);
    for y in 0..4 {
        for x in 0..4 {
            assert_abs_diff_eq!(
                tensor.get_smooth(0, 1, y as f32, x as f32),
                tensor.get(0, 1, y, x),
                epsilon = 1e-6
            );
        }
    }
}

#[test]
fn pixel_maximum_finds_channel_argmax() {
    let mut tensor = Tensor::from_dims(2, 4, 3, 3);
    tensor.set(0, 2, 1, 1, 5.0);
    tensor.set(0, 3, 1, 1, 4.0);
    tensor.set(1, 0, 2, 2, 1.0);
    assert_eq!(tensor.pixel_maximum(0, 1, 1), 2);
    assert_eq!(tensor.pixel_maximum(1, 2, 2), 0);
    assert_eq!(tensor.pixel_maximum(1, 0, 0), 0);
}

#[test]
fn copy_sample_requires_matching_geometry() {
    let source = random_tensor(TensorShape::new(2, 3, 4, 4), 5);
    let mut target = Tensor::from_dims(3, 3, 5, 5);
    assert!(Tensor::copy_sample(&source, 0, &mut target, 0, false).is_err());

    let mut exact = Tensor::from_dims(1, 3, 4, 4);
    Tensor::copy_sample(&source, 1, &mut exact, 0, false).unwrap();
    assert_eq!(exact.sample_slice(0), source.sample_slice(1));
}

#[test]
fn copy_sample_with_rescale_resamples() {
    let mut source = Tensor::from_dims(1, 1, 2, 2);
    source.clear(3.0);
    let mut target = Tensor::from_dims(1, 1, 4, 4);
    Tensor::copy_sample(&source, 0, &mut target, 0, true).unwrap();
    for &v in target.sample_slice(0) {
        assert_abs_diff_eq!(v, 3.0, epsilon = 1e-6);
    }
}

#[test]
fn copy_map_moves_one_plane() {
    let source = random_tensor(TensorShape::new(1, 3, 4, 4), 6);
    let mut target = Tensor::from_dims(2, 5, 4, 4);
    Tensor::copy_map(&source, 0, 2, &mut target, 1, 4).unwrap();
    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(target.get(1, 4, y, x), source.get(0, 2, y, x));
        }
    }
}

#[test]
fn reshape_preserves_contents() {
    let tensor = random_tensor(TensorShape::new(2, 3, 4, 5), 11);
    let original = tensor.as_slice().to_vec();
    let reshaped = tensor
        .reshaped(TensorShape::new(2, 1, 1, 60))
        .unwrap();
    assert_eq!(reshaped.as_slice(), original.as_slice());
    assert_eq!(reshaped.shape(), TensorShape::new(2, 1, 1, 60));
}
