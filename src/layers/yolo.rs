use crate::errors::{NetError, NetResult};
use crate::layers::{expect_input_count, expect_output_match, InputRef, Layer, LayerCaps, NetStatus};
use crate::tensor::{CombinedTensor, PerSampleMeta};
use crate::types::{TensorShape, UNKNOWN_CLASS};
use crate::util::bbox::{non_maximum_suppression, BoundingBox};

/// Grid geometry shared by the detection and loss layers.
///
/// Each sample is a flat vector: per cell and predictor box five values
/// (dx, dy, sqrt-w, sqrt-h, confidence) packed first, then per class a full
/// grid of class scores.
#[derive(Debug, Clone, Copy)]
pub struct YOLOConfiguration {
    pub horizontal_cells: usize,
    pub vertical_cells: usize,
    pub boxes_per_cell: usize,
}

impl YOLOConfiguration {
    fn cells(&self) -> usize {
        self.horizontal_cells * self.vertical_cells
    }

    fn class_offset(&self) -> usize {
        self.cells() * self.boxes_per_cell * 5
    }

    /// Infers the class count from the total per-sample element count.
    fn classes_for(&self, elements_per_sample: usize) -> NetResult<usize> {
        let cells = self.cells();
        if elements_per_sample % cells != 0 {
            return Err(NetError::ShapeMsg(format!(
                "{elements_per_sample} prediction elements do not divide into {cells} cells"
            )));
        }
        let maps_per_cell = elements_per_sample / cells;
        let box_maps = 5 * self.boxes_per_cell;
        if maps_per_cell < box_maps {
            return Err(NetError::ShapeMsg(format!(
                "{maps_per_cell} maps per cell cannot hold {} predictor boxes",
                self.boxes_per_cell
            )));
        }
        Ok(maps_per_cell - box_maps)
    }

    fn box_offset(&self, cell_id: usize, b: usize) -> usize {
        5 * (cell_id * self.boxes_per_cell + b)
    }

    fn class_index(&self, cell_id: usize, class: usize) -> usize {
        self.class_offset() + class * self.cells() + cell_id
    }

    /// Decodes one predictor box into absolute image coordinates.
    fn decode_box(&self, sample: &[f32], cell_id: usize, b: usize) -> BoundingBox {
        let hcell = cell_id % self.horizontal_cells;
        let vcell = cell_id / self.horizontal_cells;
        let offset = self.box_offset(cell_id, b);
        let x = (hcell as f32 + sample[offset]) / self.horizontal_cells as f32;
        let y = (vcell as f32 + sample[offset + 1]) / self.vertical_cells as f32;
        let w = sample[offset + 2] * sample[offset + 2];
        let h = sample[offset + 3] * sample[offset + 3];
        let mut decoded = BoundingBox::new(x, y, w, h);
        decoded.cell_id = cell_id;
        decoded
    }
}

/// Decodes the network's final tensor into per-sample bounding boxes with
/// objectness and class scores, writing them into the output metadata slot.
/// Gradients pass through untouched; training runs through
/// [`YOLOLossLayer`].
pub struct YOLODetectionLayer {
    config: YOLOConfiguration,
    confidence_threshold: f32,
    do_nms: bool,
    classes: usize,
    input_shape: TensorShape,
}

impl YOLODetectionLayer {
    pub fn new(config: YOLOConfiguration, confidence_threshold: f32, do_nms: bool) -> Self {
        Self {
            config,
            confidence_threshold,
            do_nms,
            classes: 0,
            input_shape: TensorShape::new(0, 0, 0, 0),
        }
    }
}

impl Layer for YOLODetectionLayer {
    fn kind(&self) -> &'static str {
        "yolo_output"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: true,
            is_loss: false,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 1)?;
        self.config.classes_for(inputs[0].elements_per_sample())?;
        Ok(vec![inputs[0]])
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.input_shape = inputs[0];
        self.classes = self
            .config
            .classes_for(inputs[0].elements_per_sample())?;
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let input = inputs[0];
        let output = &mut outputs[0];
        output
            .data
            .as_slice_mut()
            .copy_from_slice(input.data.as_slice());

        let classes = self
            .config
            .classes_for(input.data.shape().elements_per_sample())?;
        if classes != self.classes {
            tracing::debug!("class count changed from {} to {}", self.classes, classes);
            self.classes = classes;
        }

        for sample_index in 0..input.data.samples() {
            let sample = input.data.sample_slice(sample_index);
            let mut boxes = Vec::new();

            for cell_id in 0..self.config.cells() {
                for b in 0..self.config.boxes_per_cell {
                    let confidence = sample[self.config.box_offset(cell_id, b) + 4];
                    // Boxes below the threshold cannot clear it after class
                    // scaling either.
                    if confidence <= self.confidence_threshold {
                        continue;
                    }
                    let decoded = self.config.decode_box(sample, cell_id, b);
                    let mut found_class = false;
                    for class in 0..self.classes {
                        let score = sample[self.config.class_index(cell_id, class)] * confidence;
                        if score >= self.confidence_threshold {
                            let mut candidate = decoded.clone();
                            candidate.class_id = class;
                            candidate.score = score;
                            boxes.push(candidate);
                            found_class = true;
                        }
                    }
                    if !found_class {
                        let mut candidate = decoded.clone();
                        candidate.class_id = UNKNOWN_CLASS;
                        candidate.unknown = true;
                        candidate.score = confidence;
                        boxes.push(candidate);
                    }
                }
            }

            if self.do_nms {
                non_maximum_suppression(&mut boxes);
            }
            output.meta[sample_index] = PerSampleMeta::Boxes(boxes);
        }
        Ok(())
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let input = &mut inputs[0];
        if input.backprop {
            input
                .buffer
                .delta
                .as_slice_mut()
                .copy_from_slice(outputs[0].delta.as_slice());
        }
        Ok(())
    }
}

/// Training loss for YOLO-style detection.
///
/// Inputs: the prediction tensor and the label buffer whose metadata slot
/// carries the ground-truth boxes (normalized coordinates).
pub struct YOLOLossLayer {
    config: YOLOConfiguration,
    coord_weight: f32,
    obj_weight: f32,
    noobj_weight: f32,
    classes: usize,
    input_shape: TensorShape,
    last_loss: f32,
}

impl YOLOLossLayer {
    pub fn new(config: YOLOConfiguration) -> Self {
        Self {
            config,
            coord_weight: 5.0,
            obj_weight: 1.0,
            noobj_weight: 0.5,
            classes: 0,
            input_shape: TensorShape::new(0, 0, 0, 0),
            last_loss: 0.0,
        }
    }

    pub fn with_weights(mut self, coord: f32, obj: f32, noobj: f32) -> Self {
        self.coord_weight = coord;
        self.obj_weight = obj;
        self.noobj_weight = noobj;
        self
    }

    /// Cell containing a ground-truth box's center, and the in-cell offset
    /// targets.
    fn assignment(&self, truth: &BoundingBox) -> (usize, f32, f32) {
        let hcell = ((truth.x * self.config.horizontal_cells as f32) as usize)
            .min(self.config.horizontal_cells - 1);
        let vcell = ((truth.y * self.config.vertical_cells as f32) as usize)
            .min(self.config.vertical_cells - 1);
        let tx = truth.x * self.config.horizontal_cells as f32 - hcell as f32;
        let ty = truth.y * self.config.vertical_cells as f32 - vcell as f32;
        (vcell * self.config.horizontal_cells + hcell, tx, ty)
    }
}

impl Layer for YOLOLossLayer {
    fn kind(&self) -> &'static str {
        "yolo_loss"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: false,
            is_loss: true,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 2)?;
        self.config.classes_for(inputs[0].elements_per_sample())?;
        Ok(Vec::new())
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)?;
        self.input_shape = inputs[0];
        self.classes = self
            .config
            .classes_for(inputs[0].elements_per_sample())?;
        Ok(())
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        _outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let prediction = inputs[0];
        let labels = inputs[1];
        let mut loss = 0.0f32;

        for sample_index in 0..prediction.data.samples() {
            let sample = prediction.data.sample_slice(sample_index);
            let truths = labels.meta[sample_index].boxes().unwrap_or(&[]);
            let mut assigned = vec![false; self.config.cells() * self.config.boxes_per_cell];

            for truth in truths {
                let (cell_id, tx, ty) = self.assignment(truth);
                let mut best = 0;
                let mut best_iou = f32::NEG_INFINITY;
                for b in 0..self.config.boxes_per_cell {
                    let decoded = self.config.decode_box(sample, cell_id, b);
                    let iou = decoded.iou(truth);
                    if iou > best_iou {
                        best_iou = iou;
                        best = b;
                    }
                }
                assigned[cell_id * self.config.boxes_per_cell + best] = true;

                let offset = self.config.box_offset(cell_id, best);
                let dx = sample[offset] - tx;
                let dy = sample[offset + 1] - ty;
                let dw = sample[offset + 2] - truth.w.max(0.0).sqrt();
                let dh = sample[offset + 3] - truth.h.max(0.0).sqrt();
                loss += self.coord_weight * (dx * dx + dy * dy + dw * dw + dh * dh);

                let confidence = sample[offset + 4];
                loss += self.obj_weight * (1.0 - confidence) * (1.0 - confidence);

                for class in 0..self.classes {
                    let target = if truth.class_id == class { 1.0 } else { 0.0 };
                    let p = sample[self.config.class_index(cell_id, class)];
                    loss += (p - target) * (p - target);
                }
            }

            for cell_id in 0..self.config.cells() {
                for b in 0..self.config.boxes_per_cell {
                    if !assigned[cell_id * self.config.boxes_per_cell + b] {
                        let confidence = sample[self.config.box_offset(cell_id, b) + 4];
                        loss += self.noobj_weight * confidence * confidence;
                    }
                }
            }
        }

        self.last_loss = loss;
        Ok(())
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let truths_per_sample: Vec<Vec<BoundingBox>> = {
            let labels = &inputs[1];
            (0..labels.buffer.meta.len())
                .map(|s| labels.buffer.meta[s].boxes().unwrap_or(&[]).to_vec())
                .collect()
        };

        let prediction = &mut inputs[0];
        if !prediction.backprop {
            return Ok(());
        }
        prediction.buffer.delta.clear(0.0);

        for sample_index in 0..prediction.buffer.data.samples() {
            let sample = prediction.buffer.data.sample_slice(sample_index).to_vec();
            let delta = prediction.buffer.delta.sample_slice_mut(sample_index);
            let truths = &truths_per_sample[sample_index];
            let mut assigned = vec![false; self.config.cells() * self.config.boxes_per_cell];

            for truth in truths {
                let (cell_id, tx, ty) = self.assignment(truth);
                let mut best = 0;
                let mut best_iou = f32::NEG_INFINITY;
                for b in 0..self.config.boxes_per_cell {
                    let decoded = self.config.decode_box(&sample, cell_id, b);
                    let iou = decoded.iou(truth);
                    if iou > best_iou {
                        best_iou = iou;
                        best = b;
                    }
                }
                assigned[cell_id * self.config.boxes_per_cell + best] = true;

                let offset = self.config.box_offset(cell_id, best);
                delta[offset] += 2.0 * self.coord_weight * (sample[offset] - tx);
                delta[offset + 1] += 2.0 * self.coord_weight * (sample[offset + 1] - ty);
                delta[offset + 2] +=
                    2.0 * self.coord_weight * (sample[offset + 2] - truth.w.max(0.0).sqrt());
                delta[offset + 3] +=
                    2.0 * self.coord_weight * (sample[offset + 3] - truth.h.max(0.0).sqrt());
                delta[offset + 4] += 2.0 * self.obj_weight * (sample[offset + 4] - 1.0);

                for class in 0..self.classes {
                    let target = if truth.class_id == class { 1.0 } else { 0.0 };
                    let index = self.config.class_index(cell_id, class);
                    delta[index] += 2.0 * (sample[index] - target);
                }
            }

            for cell_id in 0..self.config.cells() {
                for b in 0..self.config.boxes_per_cell {
                    if !assigned[cell_id * self.config.boxes_per_cell + b] {
                        let offset = self.config.box_offset(cell_id, b);
                        delta[offset + 4] += 2.0 * self.noobj_weight * sample[offset + 4];
                    }
                }
            }
        }
        Ok(())
    }

    fn loss(&self) -> Option<f32> {
        Some(self.last_loss)
    }
}
