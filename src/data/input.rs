use rand::distributions::{Distribution, Uniform, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::data::{Bundle, ClassManager, Sample};
use crate::errors::{NetError, NetResult};
use crate::tensor::{CombinedTensor, PerSampleMeta, Tensor};
use crate::types::{Task, UNKNOWN_CLASS};

/// Decodes an image file into a tensor with one sample. Image codecs are
/// outside this crate, so the decoder is injected.
pub type ImageLoader = Box<dyn FnMut(&str, Option<&str>) -> NetResult<Tensor> + Send>;

/// The four graph buffers a batch is assembled into.
pub struct BatchBuffers<'a> {
    pub data: &'a mut CombinedTensor,
    pub label: &'a mut CombinedTensor,
    pub helper: &'a mut CombinedTensor,
    pub weight: &'a mut CombinedTensor,
}

/// Holds the training, staging and testing bundles and assembles batches:
/// weighted-random sampling with augmentation while training, a
/// deterministic exhaustive sweep of the active testing bundle while
/// testing.
pub struct BundleInputLayer {
    task: Task,
    classes: ClassManager,
    rng: StdRng,
    training: Vec<(Bundle, f32)>,
    staging: Vec<Bundle>,
    testing: Vec<Bundle>,
    active_testing: usize,
    testing_queue: Vec<(usize, usize)>,
    testing_cursor: usize,
    augment_flip: bool,
    noise_amplitude: f32,
    forced: Vec<(usize, Sample)>,
    loader: ImageLoader,
}

impl BundleInputLayer {
    pub fn new(task: Task, classes: ClassManager, seed: u64) -> Self {
        Self {
            task,
            classes,
            rng: StdRng::seed_from_u64(seed),
            training: Vec::new(),
            staging: Vec::new(),
            testing: Vec::new(),
            active_testing: 0,
            testing_queue: Vec::new(),
            testing_cursor: 0,
            augment_flip: false,
            noise_amplitude: 0.0,
            forced: Vec::new(),
            loader: Box::new(|filename, _| {
                Err(NetError::State(format!(
                    "no image loader installed, cannot load '{filename}'"
                )))
            }),
        }
    }

    pub fn set_loader(&mut self, loader: ImageLoader) {
        self.loader = loader;
    }

    pub fn set_augmentation(&mut self, flip: bool, noise_amplitude: f32) {
        self.augment_flip = flip;
        self.noise_amplitude = noise_amplitude;
    }

    pub fn add_training_bundle(&mut self, bundle: Bundle, weight: f32) {
        self.training.push((bundle, weight));
    }

    pub fn add_staging_bundle(&mut self, bundle: Bundle) {
        self.staging.push(bundle);
    }

    pub fn add_testing_bundle(&mut self, bundle: Bundle) {
        self.testing.push(bundle);
    }

    pub fn training_bundles(&self) -> &[(Bundle, f32)] {
        &self.training
    }

    pub fn staging_bundles(&self) -> &[Bundle] {
        &self.staging
    }

    pub fn testing_bundles(&self) -> &[Bundle] {
        &self.testing
    }

    /// Moves a bundle out of the staging area into the training set (with a
    /// sampling weight) or the testing set.
    pub fn promote_staged(
        &mut self,
        name: &str,
        to_testing: bool,
        weight: f32,
    ) -> NetResult<()> {
        let index = self
            .staging
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| NetError::State(format!("no staged bundle named '{name}'")))?;
        let bundle = self.staging.remove(index);
        if to_testing {
            self.testing.push(bundle);
        } else {
            self.training.push((bundle, weight));
        }
        Ok(())
    }

    pub fn training_sample_count(&self) -> usize {
        self.training.iter().map(|(b, _)| b.sample_count()).sum()
    }

    /// Selects the testing bundle the deterministic sweep walks over.
    pub fn set_active_testing_bundle(&mut self, index: usize) -> NetResult<()> {
        if index >= self.testing.len() {
            return Err(NetError::State(format!(
                "no testing bundle with index {index}"
            )));
        }
        self.active_testing = index;
        self.testing_queue.clear();
        self.testing_cursor = 0;
        Ok(())
    }

    pub fn active_testing_bundle(&self) -> Option<&Bundle> {
        self.testing.get(self.active_testing)
    }

    pub fn testing_sample_count(&self) -> usize {
        self.active_testing_bundle()
            .map(Bundle::sample_count)
            .unwrap_or(0)
    }

    /// Restarts the deterministic testing sweep.
    pub fn begin_testing_epoch(&mut self) {
        self.testing_queue = self
            .active_testing_bundle()
            .map(Bundle::sample_indices)
            .unwrap_or_default();
        self.testing_cursor = 0;
    }

    /// Injects a specific classification sample at a batch slot, overriding
    /// the sampling policy on the next training load.
    pub fn force_load_classification(&mut self, json: Value, batch_index: usize) -> NetResult<()> {
        self.force_load(json, batch_index)
    }

    pub fn force_load_binary_segmentation(
        &mut self,
        json: Value,
        batch_index: usize,
    ) -> NetResult<()> {
        self.force_load(json, batch_index)
    }

    pub fn force_load_detection(&mut self, json: Value, batch_index: usize) -> NetResult<()> {
        self.force_load(json, batch_index)
    }

    fn force_load(&mut self, json: Value, batch_index: usize) -> NetResult<()> {
        let sample = Sample::new(json)?;
        self.forced.retain(|(i, _)| *i != batch_index);
        self.forced.push((batch_index, sample));
        Ok(())
    }

    /// Fills a batch. In training mode every slot is drawn bundle-weighted /
    /// segment-uniform / sample-uniform; in testing mode slots are served
    /// from the deterministic queue and the return value is how many were
    /// filled (0 once the sweep is exhausted).
    pub fn select_and_load(
        &mut self,
        batch: &mut BatchBuffers<'_>,
        is_testing: bool,
    ) -> NetResult<usize> {
        let batch_size = batch.data.data.samples();
        if is_testing {
            return self.load_testing_batch(batch, batch_size);
        }

        if self.training.is_empty() && self.forced.is_empty() {
            return Err(NetError::State("no training bundles loaded".into()));
        }

        let forced = std::mem::take(&mut self.forced);
        for slot in 0..batch_size {
            if let Some((_, sample)) = forced.iter().find(|(i, _)| *i == slot) {
                let sample = sample.clone();
                self.load_sample(batch, slot, &sample, None, false)?;
                continue;
            }
            let (sample, folder) = self.draw_training_sample()?;
            let flip = self.augment_flip && self.rng.gen_bool(0.5);
            self.load_sample(batch, slot, &sample, folder.as_deref(), flip)?;
            if self.noise_amplitude > 0.0 {
                let dist = Uniform::new_inclusive(-self.noise_amplitude, self.noise_amplitude);
                for value in batch.data.data.sample_slice_mut(slot) {
                    *value += dist.sample(&mut self.rng);
                }
            }
        }
        Ok(batch_size)
    }

    fn draw_training_sample(&mut self) -> NetResult<(Sample, Option<String>)> {
        let weights: Vec<f32> = self.training.iter().map(|(_, w)| *w).collect();
        let bundle_index = WeightedIndex::new(&weights)
            .map_err(|e| NetError::State(format!("invalid bundle weights: {e}")))?
            .sample(&mut self.rng);
        let bundle = &self.training[bundle_index].0;
        if bundle.segment_count() == 0 {
            return Err(NetError::State(format!(
                "training bundle '{}' has no segments",
                bundle.name
            )));
        }
        let segment = bundle.segment(self.rng.gen_range(0..bundle.segment_count()));
        if segment.sample_count() == 0 {
            return Err(NetError::State(format!(
                "segment '{}' has no samples",
                segment.name
            )));
        }
        let sample = segment.sample(self.rng.gen_range(0..segment.sample_count()));
        Ok((sample.clone(), segment.folder_hint.clone()))
    }

    fn load_testing_batch(
        &mut self,
        batch: &mut BatchBuffers<'_>,
        batch_size: usize,
    ) -> NetResult<usize> {
        let mut served = 0;
        for slot in 0..batch_size {
            if self.testing_cursor >= self.testing_queue.len() {
                // Pad the remainder so stat layers ignore it.
                batch.weight.data.sample_slice_mut(slot).fill(0.0);
                batch.data.data.sample_slice_mut(slot).fill(0.0);
                batch.label.data.sample_slice_mut(slot).fill(0.0);
                batch.label.meta[slot] = PerSampleMeta::None;
                continue;
            }
            let (segment_index, sample_index) = self.testing_queue[self.testing_cursor];
            self.testing_cursor += 1;
            let bundle = self
                .active_testing_bundle()
                .ok_or_else(|| NetError::State("no active testing bundle".into()))?;
            let segment = bundle.segment(segment_index);
            let sample = segment.sample(sample_index).clone();
            let folder = segment.folder_hint.clone();
            self.load_sample(batch, slot, &sample, folder.as_deref(), false)?;
            served += 1;
        }
        Ok(served)
    }

    fn load_sample(
        &mut self,
        batch: &mut BatchBuffers<'_>,
        slot: usize,
        sample: &Sample,
        folder_hint: Option<&str>,
        flip: bool,
    ) -> NetResult<()> {
        let image = (self.loader)(sample.image_filename(), folder_hint)?;
        Tensor::copy_sample(&image, 0, &mut batch.data.data, slot, true)?;
        if flip {
            flip_sample_horizontal(&mut batch.data.data, slot);
        }
        batch.helper.data.sample_slice_mut(slot).fill(0.0);
        batch.weight.data.sample_slice_mut(slot).fill(1.0);
        batch.label.meta[slot] = PerSampleMeta::None;

        match self.task {
            Task::Classification => self.encode_classification(batch, slot, sample)?,
            Task::Segmentation => self.encode_segmentation(batch, slot, sample, folder_hint, flip)?,
            Task::BinarySegmentation => {
                self.encode_binary_segmentation(batch, slot, sample, folder_hint, flip)?
            }
            Task::Detection => self.encode_detection(batch, slot, sample, flip)?,
        }
        Ok(())
    }

    fn resolve_class(&self, sample: &Sample) -> NetResult<usize> {
        if let Some(id) = sample.class_id() {
            return Ok(id);
        }
        if let Some(name) = sample.class_name() {
            let id = self.classes.id_by_name(name);
            if id == UNKNOWN_CLASS {
                return Err(NetError::Config(format!("unregistered class '{name}'")));
            }
            return Ok(id);
        }
        Err(NetError::Config(format!(
            "sample '{}' carries no class",
            sample.image_filename()
        )))
    }

    fn encode_classification(
        &mut self,
        batch: &mut BatchBuffers<'_>,
        slot: usize,
        sample: &Sample,
    ) -> NetResult<()> {
        let class = self.resolve_class(sample)?;
        let label = batch.label.data.sample_slice_mut(slot);
        label.fill(0.0);
        if class >= label.len() {
            return Err(NetError::Config(format!(
                "class id {class} exceeds label width {}",
                label.len()
            )));
        }
        label[class] = 1.0;
        let weight = self
            .classes
            .name_by_id(class)
            .and_then(|n| self.classes.info_by_name(n))
            .map(|info| info.weight)
            .unwrap_or(1.0);
        batch.weight.data.sample_slice_mut(slot).fill(weight);
        Ok(())
    }

    fn load_label_image(
        &mut self,
        sample: &Sample,
        folder_hint: Option<&str>,
    ) -> NetResult<Tensor> {
        let filename = sample.label_filename().ok_or_else(|| {
            NetError::Config(format!(
                "sample '{}' carries no label_filename",
                sample.image_filename()
            ))
        })?;
        (self.loader)(filename, folder_hint)
    }

    fn encode_segmentation(
        &mut self,
        batch: &mut BatchBuffers<'_>,
        slot: usize,
        sample: &Sample,
        folder_hint: Option<&str>,
        flip: bool,
    ) -> NetResult<()> {
        let mut label_image = self.load_label_image(sample, folder_hint)?;
        if flip {
            flip_sample_horizontal(&mut label_image, 0);
        }
        let label_shape = batch.label.data.shape();
        batch.label.data.sample_slice_mut(slot).fill(0.0);
        let mut label = batch.label.data.view_mut();

        for y in 0..label_shape.height {
            for x in 0..label_shape.width {
                let class = if label_image.maps() >= 3 {
                    // RGB label files are matched to registered class colors.
                    let r = (label_image.get(0, 0, y, x) * 255.0).round() as u8;
                    let g = (label_image.get(0, 1, y, x) * 255.0).round() as u8;
                    let b = (label_image.get(0, 2, y, x) * 255.0).round() as u8;
                    self.classes.id_by_color(r, g, b)
                } else {
                    label_image.get(0, 0, y, x).round() as usize
                };
                if class != UNKNOWN_CLASS && class < label_shape.maps {
                    label[[slot, class, y, x]] = 1.0;
                }
            }
        }
        Ok(())
    }

    fn encode_binary_segmentation(
        &mut self,
        batch: &mut BatchBuffers<'_>,
        slot: usize,
        sample: &Sample,
        folder_hint: Option<&str>,
        flip: bool,
    ) -> NetResult<()> {
        let mut label_image = self.load_label_image(sample, folder_hint)?;
        if flip {
            flip_sample_horizontal(&mut label_image, 0);
        }
        let label_shape = batch.label.data.shape();
        let mut label = batch.label.data.view_mut();
        for y in 0..label_shape.height {
            for x in 0..label_shape.width {
                let foreground = label_image.get(0, 0, y, x) > 0.5;
                label[[slot, 0, y, x]] = if foreground { 1.0 } else { -1.0 };
            }
        }
        Ok(())
    }

    fn encode_detection(
        &mut self,
        batch: &mut BatchBuffers<'_>,
        slot: usize,
        sample: &Sample,
        flip: bool,
    ) -> NetResult<()> {
        let mut boxes = sample.boxes()?;
        if flip {
            for b in &mut boxes {
                b.x = 1.0 - b.x;
            }
        }
        batch.label.data.sample_slice_mut(slot).fill(0.0);
        batch.label.meta[slot] = PerSampleMeta::Boxes(boxes);
        Ok(())
    }
}

fn flip_sample_horizontal(tensor: &mut Tensor, sample: usize) {
    let shape = tensor.shape();
    let mut view = tensor.view_mut();
    for map in 0..shape.maps {
        for y in 0..shape.height {
            for x in 0..shape.width / 2 {
                let mirror = shape.width - 1 - x;
                let a = view[[sample, map, y, x]];
                let b = view[[sample, map, y, mirror]];
                view[[sample, map, y, x]] = b;
                view[[sample, map, y, mirror]] = a;
            }
        }
    }
}
