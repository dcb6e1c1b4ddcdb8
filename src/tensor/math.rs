//! Dense kernels shared by the layer implementations.
//!
//! Everything here operates on plain views so the layers stay free of
//! indexing arithmetic. GEMM is the single seam to the underlying BLAS-style
//! implementation.

use ndarray::{linalg::general_mat_mul, Array2, ArrayView2, ArrayViewMut2, Zip};
use rayon::prelude::*;

use crate::errors::{NetError, NetResult};
use crate::tensor::Tensor;

/// C = alpha * op(A) * op(B) + beta * C
#[tracing::instrument(skip_all, name = "kernel_gemm")]
pub fn gemm(
    alpha: f32,
    a: ArrayView2<f32>,
    trans_a: bool,
    b: ArrayView2<f32>,
    trans_b: bool,
    beta: f32,
    mut c: ArrayViewMut2<f32>,
) {
    let lhs = if trans_a { a.reversed_axes() } else { a };
    let rhs = if trans_b { b.reversed_axes() } else { b };
    general_mat_mul(alpha, &lhs, &rhs, beta, &mut c);
}

/// Geometry of a convolution lowering.
#[derive(Debug, Clone, Copy)]
pub struct Im2ColParams {
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub stride_width: usize,
    pub stride_height: usize,
    pub pad_width: usize,
    pub pad_height: usize,
}

impl Im2ColParams {
    pub fn output_width(&self, input_width: usize) -> usize {
        (input_width + 2 * self.pad_width - self.kernel_width) / self.stride_width + 1
    }

    pub fn output_height(&self, input_height: usize) -> usize {
        (input_height + 2 * self.pad_height - self.kernel_height) / self.stride_height + 1
    }
}

/// Lowers a (S, C, H, W) input into a column matrix of shape
/// (C * kH * kW) x (S * H_out * W_out). Out-of-bounds positions (padding)
/// contribute zeros. Column index is ((s * H_out + oy) * W_out + ox), row
/// index ((c * kH + ky) * kW + kx).
#[tracing::instrument(skip_all, name = "kernel_im2col")]
pub fn im2col(input: &Tensor, params: &Im2ColParams, columns: &mut Array2<f32>) {
    let shape = input.shape();
    let out_w = params.output_width(shape.width);
    let out_h = params.output_height(shape.height);
    let rows = shape.maps * params.kernel_height * params.kernel_width;
    let cols = shape.samples * out_h * out_w;
    debug_assert_eq!(columns.dim(), (rows, cols));

    let input_view = input.view();
    let columns_per_sample = out_h * out_w;

    // Parallel over rows: each row is an independent gather.
    columns
        .axis_iter_mut(ndarray::Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut row_values)| {
            let kx = row % params.kernel_width;
            let ky = (row / params.kernel_width) % params.kernel_height;
            let map = row / (params.kernel_width * params.kernel_height);
            for sample in 0..shape.samples {
                for oy in 0..out_h {
                    let iy = (oy * params.stride_height + ky) as isize - params.pad_height as isize;
                    for ox in 0..out_w {
                        let ix =
                            (ox * params.stride_width + kx) as isize - params.pad_width as isize;
                        let col = sample * columns_per_sample + oy * out_w + ox;
                        row_values[col] = if iy >= 0
                            && (iy as usize) < shape.height
                            && ix >= 0
                            && (ix as usize) < shape.width
                        {
                            input_view[[sample, map, iy as usize, ix as usize]]
                        } else {
                            0.0
                        };
                    }
                }
            }
        });
}

/// Adjoint of [`im2col`]: scatter-adds a column matrix back into the
/// (S, C, H, W) buffer. The target is cleared first.
#[tracing::instrument(skip_all, name = "kernel_col2im")]
pub fn col2im(columns: &Array2<f32>, params: &Im2ColParams, output: &mut Tensor) {
    let shape = output.shape();
    let out_w = params.output_width(shape.width);
    let out_h = params.output_height(shape.height);
    let columns_per_sample = out_h * out_w;

    output.clear(0.0);
    let mut target = output.view_mut();
    for row in 0..columns.dim().0 {
        let kx = row % params.kernel_width;
        let ky = (row / params.kernel_width) % params.kernel_height;
        let map = row / (params.kernel_width * params.kernel_height);
        for sample in 0..shape.samples {
            for oy in 0..out_h {
                let iy = (oy * params.stride_height + ky) as isize - params.pad_height as isize;
                if iy < 0 || iy as usize >= shape.height {
                    continue;
                }
                for ox in 0..out_w {
                    let ix = (ox * params.stride_width + kx) as isize - params.pad_width as isize;
                    if ix < 0 || ix as usize >= shape.width {
                        continue;
                    }
                    let col = sample * columns_per_sample + oy * out_w + ox;
                    target[[sample, map, iy as usize, ix as usize]] += columns[[row, col]];
                }
            }
        }
    }
}

/// Block-average downsampling by (region_width, region_height), scaled.
/// Output spatial dimensions must be exactly input / region.
#[tracing::instrument(skip_all, name = "kernel_down")]
pub fn down(input: &Tensor, output: &mut Tensor, region_width: usize, region_height: usize, scale: f32) {
    let in_shape = input.shape();
    let out_shape = output.shape();
    debug_assert_eq!(out_shape.width * region_width, in_shape.width);
    debug_assert_eq!(out_shape.height * region_height, in_shape.height);

    let source = input.view();
    let mut target = output.view_mut();
    Zip::indexed(&mut target).par_for_each(|(s, m, oy, ox), value| {
        let mut sum = 0.0;
        for iy in oy * region_height..(oy + 1) * region_height {
            for ix in ox * region_width..(ox + 1) * region_width {
                sum += source[[s, m, iy, ix]];
            }
        }
        *value = sum * scale;
    });
}

/// Nearest-neighbour upsampling by (region_width, region_height), scaled.
#[tracing::instrument(skip_all, name = "kernel_up")]
pub fn up(input: &Tensor, output: &mut Tensor, region_width: usize, region_height: usize, scale: f32) {
    let in_shape = input.shape();
    let out_shape = output.shape();
    debug_assert_eq!(in_shape.width * region_width, out_shape.width);
    debug_assert_eq!(in_shape.height * region_height, out_shape.height);

    let source = input.view();
    let mut target = output.view_mut();
    Zip::indexed(&mut target).par_for_each(|(s, m, oy, ox), value| {
        *value = source[[s, m, oy / region_height, ox / region_width]] * scale;
    });
}

/// Elementwise out = a + b across identical shapes.
pub fn add(a: &Tensor, b: &Tensor, out: &mut Tensor) -> NetResult<()> {
    if a.shape() != b.shape() || a.shape() != out.shape() {
        return Err(NetError::shape("add", a.shape(), b.shape()));
    }
    Zip::from(out.array_mut())
        .and(a.array())
        .and(b.array())
        .par_for_each(|o, &x, &y| *o = x + y);
    Ok(())
}

/// Fills one sample (or, with `None`, the whole tensor) with a constant.
pub fn set_sample(tensor: &mut Tensor, sample: Option<usize>, value: f32) {
    match sample {
        Some(s) => tensor.sample_slice_mut(s).fill(value),
        None => tensor.clear(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TensorShape;
    use ndarray::array;

    #[test]
    fn gemm_matches_hand_computation() {
        let a = array![[1.0f32, 2.0], [3.0, 4.0]];
        let b = array![[5.0f32, 6.0], [7.0, 8.0]];
        let mut c = Array2::zeros((2, 2));
        gemm(1.0, a.view(), false, b.view(), false, 0.0, c.view_mut());
        assert_eq!(c, array![[19.0, 22.0], [43.0, 50.0]]);

        // With transposes: C = A^T * B^T.
        let mut c = Array2::zeros((2, 2));
        gemm(1.0, a.view(), true, b.view(), true, 0.0, c.view_mut());
        assert_eq!(c, array![[23.0, 31.0], [34.0, 46.0]]);

        // Beta accumulates.
        let mut c = array![[1.0f32, 1.0], [1.0, 1.0]];
        gemm(2.0, a.view(), false, b.view(), false, 1.0, c.view_mut());
        assert_eq!(c, array![[39.0, 45.0], [87.0, 101.0]]);
    }

    #[test]
    fn add_rejects_mismatched_shapes() {
        let a = Tensor::from_dims(1, 1, 2, 2);
        let b = Tensor::from_dims(1, 1, 2, 3);
        let mut out = Tensor::from_dims(1, 1, 2, 2);
        assert!(add(&a, &b, &mut out).is_err());
    }

    #[test]
    fn add_and_set_sample() {
        let mut a = Tensor::from_dims(2, 1, 1, 3);
        let mut b = Tensor::from_dims(2, 1, 1, 3);
        a.clear(1.5);
        b.clear(2.0);
        let mut out = Tensor::from_dims(2, 1, 1, 3);
        add(&a, &b, &mut out).unwrap();
        assert!(out.as_slice().iter().all(|&v| v == 3.5));

        set_sample(&mut out, Some(1), -1.0);
        assert!(out.sample_slice(0).iter().all(|&v| v == 3.5));
        assert!(out.sample_slice(1).iter().all(|&v| v == -1.0));
        set_sample(&mut out, None, 0.0);
        assert!(out.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn down_then_up_preserves_constants() {
        let mut input = Tensor::from_dims(1, 2, 4, 4);
        input.clear(3.0);
        let mut small = Tensor::from_dims(1, 2, 2, 2);
        down(&input, &mut small, 2, 2, 0.25);
        assert!(small.as_slice().iter().all(|&v| v == 3.0));

        let mut restored = Tensor::from_dims(1, 2, 4, 4);
        up(&small, &mut restored, 2, 2, 1.0);
        assert_eq!(restored.as_slice(), input.as_slice());
    }

    #[test]
    fn im2col_lowers_a_known_input() {
        // 1x1x2x2 input, 2x2 kernel, no padding: one column holding the
        // whole patch in row-major kernel order.
        let mut input = Tensor::from_dims(1, 1, 2, 2);
        input.as_slice_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let params = Im2ColParams {
            kernel_width: 2,
            kernel_height: 2,
            stride_width: 1,
            stride_height: 1,
            pad_width: 0,
            pad_height: 0,
        };
        let mut columns = Array2::zeros((4, 1));
        im2col(&input, &params, &mut columns);
        assert_eq!(
            columns.as_slice().unwrap(),
            &[1.0, 2.0, 3.0, 4.0]
        );
    }

    /// col2im is the adjoint of im2col: <im2col(x), y> == <x, col2im(y)>.
    #[test]
    fn col2im_is_the_adjoint_of_im2col() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(17);

        let shape = TensorShape::new(2, 2, 4, 4);
        let params = Im2ColParams {
            kernel_width: 3,
            kernel_height: 3,
            stride_width: 1,
            stride_height: 1,
            pad_width: 1,
            pad_height: 1,
        };
        let rows = shape.maps * 9;
        let cols = shape.samples * 16;

        let mut x = Tensor::new(shape);
        for v in x.as_slice_mut() {
            *v = rng.gen_range(-1.0..1.0);
        }
        let mut y = Array2::zeros((rows, cols));
        for v in y.iter_mut() {
            *v = rng.gen_range(-1.0f32..1.0);
        }

        let mut lowered = Array2::zeros((rows, cols));
        im2col(&x, &params, &mut lowered);
        let lhs: f64 = lowered
            .iter()
            .zip(y.iter())
            .map(|(&a, &b)| (a * b) as f64)
            .sum();

        let mut scattered = Tensor::new(shape);
        col2im(&y, &params, &mut scattered);
        let rhs: f64 = x
            .as_slice()
            .iter()
            .zip(scattered.as_slice())
            .map(|(&a, &b)| (a * b) as f64)
            .sum();

        assert!((lhs - rhs).abs() < 1e-3, "{lhs} != {rhs}");
    }
}
