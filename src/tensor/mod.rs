pub mod combined;
pub mod math;
pub mod serialize;

pub use combined::{CombinedTensor, PerSampleMeta};

use ndarray::{Array4, ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Ix4};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;

use crate::errors::{NetError, NetResult};
use crate::types::TensorShape;

/// A dense four-dimensional buffer of f32 values, laid out as
/// (samples, maps, height, width).
///
/// This is the only numeric container in the crate; activations, gradients,
/// weights and masks are all `Tensor`s.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Array4<f32>,
}

impl Tensor {
    /// Allocates a zero-filled tensor.
    pub fn new(shape: TensorShape) -> Self {
        Self {
            data: Array4::zeros((shape.samples, shape.maps, shape.height, shape.width)),
        }
    }

    pub fn from_dims(samples: usize, maps: usize, height: usize, width: usize) -> Self {
        Self::new(TensorShape::new(samples, maps, height, width))
    }

    pub fn from_array(data: Array4<f32>) -> Self {
        Self { data }
    }

    /// Uniform random fill on [-bound, bound] using the supplied generator.
    pub fn random<R: Rng>(shape: TensorShape, bound: f32, rng: &mut R) -> Self {
        let dist = Uniform::new_inclusive(-bound, bound);
        Self {
            data: Array4::random_using(
                (shape.samples, shape.maps, shape.height, shape.width),
                dist,
                rng,
            ),
        }
    }

    pub fn shape(&self) -> TensorShape {
        let (s, m, h, w) = self.data.dim();
        TensorShape::new(s, m, h, w)
    }

    pub fn samples(&self) -> usize {
        self.data.dim().0
    }

    pub fn maps(&self) -> usize {
        self.data.dim().1
    }

    pub fn height(&self) -> usize {
        self.data.dim().2
    }

    pub fn width(&self) -> usize {
        self.data.dim().3
    }

    pub fn elements(&self) -> usize {
        self.data.len()
    }

    /// Fills the whole buffer with a constant.
    pub fn clear(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Reallocates to a new shape, discarding contents, unless the shape
    /// already matches.
    pub fn resize(&mut self, shape: TensorShape) {
        if self.shape() != shape {
            self.data = Array4::zeros((shape.samples, shape.maps, shape.height, shape.width));
        }
    }

    /// Re-views the owned buffer under a different shape with the same
    /// element count. This is the safe stand-in for the aliasing "shadow"
    /// construction: the storage moves, it is never shared.
    pub fn reshaped(self, shape: TensorShape) -> NetResult<Tensor> {
        if self.elements() != shape.elements() {
            return Err(NetError::shape("reshape", shape, self.shape()));
        }
        let reshaped = self
            .data
            .into_shape((shape.samples, shape.maps, shape.height, shape.width))
            .map_err(|_| NetError::ShapeMsg("non-contiguous tensor cannot be re-viewed".into()))?;
        Ok(Tensor { data: reshaped })
    }

    pub fn get(&self, sample: usize, map: usize, y: usize, x: usize) -> f32 {
        self.data[[sample, map, y, x]]
    }

    pub fn set(&mut self, sample: usize, map: usize, y: usize, x: usize, value: f32) {
        self.data[[sample, map, y, x]] = value;
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut4<'_, f32> {
        self.data.view_mut()
    }

    pub fn array(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn array_mut(&mut self) -> &mut Array4<f32> {
        &mut self.data
    }

    /// Contiguous row-major storage.
    pub fn as_slice(&self) -> &[f32] {
        self.data
            .as_slice()
            .expect("tensor storage is always standard layout")
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        self.data
            .as_slice_mut()
            .expect("tensor storage is always standard layout")
    }

    pub fn sample_slice(&self, sample: usize) -> &[f32] {
        let per_sample = self.shape().elements_per_sample();
        &self.as_slice()[sample * per_sample..(sample + 1) * per_sample]
    }

    pub fn sample_slice_mut(&mut self, sample: usize) -> &mut [f32] {
        let per_sample = self.shape().elements_per_sample();
        &mut self.as_slice_mut()[sample * per_sample..(sample + 1) * per_sample]
    }

    /// One sample viewed as a (maps, height * width) matrix.
    pub fn sample_matrix(&self, sample: usize) -> ArrayView2<'_, f32> {
        let (maps, spatial) = (self.maps(), self.height() * self.width());
        ArrayView2::from_shape((maps, spatial), self.sample_slice(sample))
            .expect("sample slice is contiguous")
    }

    pub fn sample_matrix_mut(&mut self, sample: usize) -> ArrayViewMut2<'_, f32> {
        let (maps, spatial) = (self.maps(), self.height() * self.width());
        ArrayViewMut2::from_shape((maps, spatial), self.sample_slice_mut(sample))
            .expect("sample slice is contiguous")
    }

    /// The whole tensor viewed as a (samples, maps * height * width) matrix.
    pub fn batch_matrix(&self) -> ArrayView2<'_, f32> {
        let shape = self.shape();
        ArrayView2::from_shape(
            (shape.samples, shape.elements_per_sample()),
            self.as_slice(),
        )
        .expect("tensor storage is contiguous")
    }

    pub fn batch_matrix_mut(&mut self) -> ArrayViewMut2<'_, f32> {
        let shape = self.shape();
        ArrayViewMut2::from_shape(
            (shape.samples, shape.elements_per_sample()),
            self.as_slice_mut(),
        )
        .expect("tensor storage is contiguous")
    }

    /// Copies one sample between tensors. Without `rescale` the per-sample
    /// geometry must match exactly; with it the spatial plane is resampled
    /// bilinearly (map counts must still match).
    pub fn copy_sample(
        source: &Tensor,
        source_sample: usize,
        target: &mut Tensor,
        target_sample: usize,
        rescale: bool,
    ) -> NetResult<()> {
        if source.maps() != target.maps() {
            return Err(NetError::shape(
                "copy_sample",
                source.shape(),
                target.shape(),
            ));
        }
        if !rescale {
            if source.height() != target.height() || source.width() != target.width() {
                return Err(NetError::shape(
                    "copy_sample",
                    source.shape(),
                    target.shape(),
                ));
            }
            target
                .sample_slice_mut(target_sample)
                .copy_from_slice(source.sample_slice(source_sample));
            return Ok(());
        }

        let (th, tw) = (target.height(), target.width());
        let (sh, sw) = (source.height(), source.width());
        for map in 0..source.maps() {
            for ty in 0..th {
                for tx in 0..tw {
                    let sx = (tx as f32) * (sw as f32) / (tw as f32);
                    let sy = (ty as f32) * (sh as f32) / (th as f32);
                    let value = source.get_smooth(source_sample, map, sy, sx);
                    target.set(target_sample, map, ty, tx, value);
                }
            }
        }
        Ok(())
    }

    /// Copies a single map between tensors with identical spatial dimensions.
    pub fn copy_map(
        source: &Tensor,
        source_sample: usize,
        source_map: usize,
        target: &mut Tensor,
        target_sample: usize,
        target_map: usize,
    ) -> NetResult<()> {
        if source.height() != target.height() || source.width() != target.width() {
            return Err(NetError::shape("copy_map", source.shape(), target.shape()));
        }
        let plane = source
            .data
            .index_axis(ndarray::Axis(0), source_sample)
            .index_axis_move(ndarray::Axis(0), source_map)
            .to_owned();
        target
            .data
            .index_axis_mut(ndarray::Axis(0), target_sample)
            .index_axis_move(ndarray::Axis(0), target_map)
            .assign(&plane);
        Ok(())
    }

    /// Map index with the maximum value at a pixel (argmax over the channel
    /// dimension).
    pub fn pixel_maximum(&self, sample: usize, y: usize, x: usize) -> usize {
        let mut best = 0;
        let mut best_value = f32::NEG_INFINITY;
        for map in 0..self.maps() {
            let value = self.get(sample, map, y, x);
            if value > best_value {
                best_value = value;
                best = map;
            }
        }
        best
    }

    /// Bilinear read at a fractional position. Coordinates are clamped to the
    /// valid grid so the result always lies between the minimum and maximum of
    /// the enclosing samples.
    pub fn get_smooth(&self, sample: usize, map: usize, y: f32, x: f32) -> f32 {
        let max_x = (self.width() - 1) as f32;
        let max_y = (self.height() - 1) as f32;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width() - 1);
        let y1 = (y0 + 1).min(self.height() - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let top = self.get(sample, map, y0, x0) * (1.0 - fx) + self.get(sample, map, y0, x1) * fx;
        let bottom =
            self.get(sample, map, y1, x0) * (1.0 - fx) + self.get(sample, map, y1, x1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Counts non-finite values, for the verbose numeric scan.
    pub fn count_non_finite(&self) -> (usize, usize) {
        let mut nan = 0;
        let mut inf = 0;
        for &v in self.as_slice() {
            if v.is_nan() {
                nan += 1;
            } else if v.is_infinite() {
                inf += 1;
            }
        }
        (nan, inf)
    }
}

impl From<Array4<f32>> for Tensor {
    fn from(data: Array4<f32>) -> Self {
        Self::from_array(data)
    }
}

impl From<ndarray::ArrayD<f32>> for Tensor {
    fn from(data: ndarray::ArrayD<f32>) -> Self {
        let fixed = data
            .into_dimensionality::<Ix4>()
            .expect("tensor construction requires four dimensions");
        Self::from_array(fixed)
    }
}
