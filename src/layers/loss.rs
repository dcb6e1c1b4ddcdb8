use crate::errors::{NetError, NetResult};
use crate::layers::{expect_input_count, expect_output_match, InputRef, Layer, LayerCaps, NetStatus};
use crate::stats::{StatAggregator, StatDescriptor, StatId, StatOutput};
use crate::tensor::{CombinedTensor, Tensor};
use crate::types::TensorShape;

fn check_loss_inputs(kind: &'static str, inputs: &[TensorShape]) -> NetResult<()> {
    if inputs.len() != 2 && inputs.len() != 3 {
        return Err(NetError::ShapeMsg(format!(
            "{kind} expects prediction, label and optional weight inputs, got {}",
            inputs.len()
        )));
    }
    if inputs[0] != inputs[1] {
        return Err(NetError::shape(kind, inputs[0], inputs[1]));
    }
    if inputs.len() == 3 && inputs[2].samples != inputs[0].samples {
        return Err(NetError::shape(kind, inputs[0], inputs[2]));
    }
    Ok(())
}

fn sample_weight(inputs: &[&CombinedTensor], sample: usize) -> f32 {
    inputs
        .get(2)
        .map(|w| w.data.sample_slice(sample)[0])
        .unwrap_or(1.0)
}

/// Weighted squared-error loss, normalized by the total sample weight:
/// `0.5 * sum_s w_s * |p_s - l_s|^2 / sum_s w_s`. Padding slots carry
/// weight zero and drop out of both the loss and the gradient.
pub struct SquareErrorLayer {
    last_loss: f32,
}

impl SquareErrorLayer {
    pub fn new() -> Self {
        Self { last_loss: 0.0 }
    }
}

impl Default for SquareErrorLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for SquareErrorLayer {
    fn kind(&self) -> &'static str {
        "square_error"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps::LOSS
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        check_loss_inputs(self.kind(), inputs)?;
        Ok(Vec::new())
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        _outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let prediction = &inputs[0].data;
        let label = &inputs[1].data;
        let mut loss = 0.0f64;
        let mut weight_sum = 0.0f64;
        for sample in 0..prediction.samples() {
            let weight = sample_weight(inputs, sample) as f64;
            weight_sum += weight;
            let mut sample_loss = 0.0f64;
            for (&p, &l) in prediction
                .sample_slice(sample)
                .iter()
                .zip(label.sample_slice(sample))
            {
                let diff = (p - l) as f64;
                sample_loss += diff * diff;
            }
            loss += 0.5 * weight * sample_loss;
        }
        self.last_loss = if weight_sum > 0.0 {
            (loss / weight_sum) as f32
        } else {
            0.0
        };
        Ok(())
    }

    fn backward(
        &mut self,
        inputs: &mut [InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let weights: Vec<f32> = {
            let samples = inputs[0].buffer.data.samples();
            (0..samples)
                .map(|s| {
                    inputs
                        .get(2)
                        .map(|w| w.buffer.data.sample_slice(s)[0])
                        .unwrap_or(1.0)
                })
                .collect()
        };
        let weight_sum: f32 = weights.iter().sum();
        if weight_sum <= 0.0 {
            return Ok(());
        }
        let labels = inputs[1].buffer.data.clone();
        let prediction = &mut inputs[0];
        if !prediction.backprop {
            return Ok(());
        }
        for sample in 0..prediction.buffer.data.samples() {
            let weight = weights[sample] / weight_sum;
            let buffer = &mut *prediction.buffer;
            let data = buffer.data.sample_slice(sample).to_vec();
            let delta = buffer.delta.sample_slice_mut(sample);
            for ((d, &p), &l) in delta.iter_mut().zip(&data).zip(labels.sample_slice(sample)) {
                *d = weight * (p - l);
            }
        }
        Ok(())
    }

    fn loss(&self) -> Option<f32> {
        Some(self.last_loss)
    }
}

/// Returns the predicted class of a sample (channel argmax per pixel for
/// spatial tensors, flat argmax otherwise).
fn flat_argmax(slice: &[f32]) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in slice.iter().enumerate() {
        if v > best_value {
            best_value = v;
            best = i;
        }
    }
    best
}

/// Counts per-sample (or per-pixel) argmax mismatches between prediction and
/// label.
pub struct MultiClassErrorLayer {
    errors: u64,
    total: u64,
    stat: Option<StatId>,
}

impl MultiClassErrorLayer {
    pub fn new() -> Self {
        Self {
            errors: 0,
            total: 0,
            stat: None,
        }
    }

    fn accumulate(&mut self, prediction: &Tensor, label: &Tensor) {
        if prediction.maps() > 1 {
            for sample in 0..prediction.samples() {
                for y in 0..prediction.height() {
                    for x in 0..prediction.width() {
                        let predicted = prediction.pixel_maximum(sample, y, x);
                        let expected = label.pixel_maximum(sample, y, x);
                        if predicted != expected {
                            self.errors += 1;
                        }
                        self.total += 1;
                    }
                }
            }
        } else {
            for sample in 0..prediction.samples() {
                let predicted = flat_argmax(prediction.sample_slice(sample));
                let expected = flat_argmax(label.sample_slice(sample));
                if predicted != expected {
                    self.errors += 1;
                }
                self.total += 1;
            }
        }
    }
}

impl Default for MultiClassErrorLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for MultiClassErrorLayer {
    fn kind(&self) -> &'static str {
        "multiclass_error"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: false,
            is_loss: false,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        check_loss_inputs(self.kind(), inputs)?;
        Ok(Vec::new())
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        _outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        self.accumulate(&inputs[0].data, &inputs[1].data);
        Ok(())
    }

    fn backward(
        &mut self,
        _inputs: &mut [InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        Ok(())
    }

    fn register_stats(&mut self, stats: &mut StatAggregator) -> NetResult<()> {
        self.stat = Some(stats.register_stat(
            StatDescriptor::new("multiclass_error", "%", StatOutput::Sum).nullable(),
        )?);
        Ok(())
    }

    fn publish_stats(&mut self, stats: &mut StatAggregator) {
        if let Some(id) = self.stat {
            if self.total > 0 {
                stats.set(id, 100.0 * self.errors as f64 / self.total as f64);
            }
        }
        self.errors = 0;
        self.total = 0;
    }
}

/// Full class-confusion counts plus overall accuracy.
pub struct ConfusionMatrixLayer {
    classes: usize,
    /// Row: expected class, column: predicted class.
    matrix: Vec<u64>,
    stat: Option<StatId>,
}

impl ConfusionMatrixLayer {
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            matrix: vec![0; classes * classes],
            stat: None,
        }
    }

    pub fn matrix(&self) -> &[u64] {
        &self.matrix
    }

    pub fn count(&self, expected: usize, predicted: usize) -> u64 {
        self.matrix[expected * self.classes + predicted]
    }
}

impl Layer for ConfusionMatrixLayer {
    fn kind(&self) -> &'static str {
        "confusion_matrix"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: false,
            is_loss: false,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        check_loss_inputs(self.kind(), inputs)?;
        Ok(Vec::new())
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        _outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        let prediction = &inputs[0].data;
        let label = &inputs[1].data;
        if prediction.maps() > 1 {
            for sample in 0..prediction.samples() {
                for y in 0..prediction.height() {
                    for x in 0..prediction.width() {
                        let predicted = prediction.pixel_maximum(sample, y, x);
                        let expected = label.pixel_maximum(sample, y, x);
                        self.matrix[expected * self.classes + predicted] += 1;
                    }
                }
            }
        } else {
            for sample in 0..prediction.samples() {
                let predicted = flat_argmax(prediction.sample_slice(sample));
                let expected = flat_argmax(label.sample_slice(sample));
                self.matrix[expected * self.classes + predicted] += 1;
            }
        }
        Ok(())
    }

    fn backward(
        &mut self,
        _inputs: &mut [InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        Ok(())
    }

    fn register_stats(&mut self, stats: &mut StatAggregator) -> NetResult<()> {
        self.stat = Some(stats.register_stat(
            StatDescriptor::new("accuracy", "%", StatOutput::Sum).nullable(),
        )?);
        Ok(())
    }

    fn publish_stats(&mut self, stats: &mut StatAggregator) {
        let total: u64 = self.matrix.iter().sum();
        if total > 0 {
            let correct: u64 = (0..self.classes).map(|c| self.count(c, c)).sum();
            if let Some(id) = self.stat {
                stats.set(id, 100.0 * correct as f64 / total as f64);
            }
        }
        self.matrix.fill(0);
    }
}

/// Binary segmentation statistics over a +1/-1 labelling.
pub struct BinaryStatLayer {
    true_positive: u64,
    false_positive: u64,
    true_negative: u64,
    false_negative: u64,
    f1_stat: Option<StatId>,
    precision_stat: Option<StatId>,
    recall_stat: Option<StatId>,
}

impl BinaryStatLayer {
    pub fn new() -> Self {
        Self {
            true_positive: 0,
            false_positive: 0,
            true_negative: 0,
            false_negative: 0,
            f1_stat: None,
            precision_stat: None,
            recall_stat: None,
        }
    }

    pub fn counts(&self) -> (u64, u64, u64, u64) {
        (
            self.true_positive,
            self.false_positive,
            self.true_negative,
            self.false_negative,
        )
    }
}

impl Default for BinaryStatLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for BinaryStatLayer {
    fn kind(&self) -> &'static str {
        "binary_stat"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: false,
            is_loss: false,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        check_loss_inputs(self.kind(), inputs)?;
        Ok(Vec::new())
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        _outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        for (&p, &l) in inputs[0]
            .data
            .as_slice()
            .iter()
            .zip(inputs[1].data.as_slice())
        {
            match (p > 0.0, l > 0.0) {
                (true, true) => self.true_positive += 1,
                (true, false) => self.false_positive += 1,
                (false, false) => self.true_negative += 1,
                (false, true) => self.false_negative += 1,
            }
        }
        Ok(())
    }

    fn backward(
        &mut self,
        _inputs: &mut [InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        Ok(())
    }

    fn register_stats(&mut self, stats: &mut StatAggregator) -> NetResult<()> {
        self.f1_stat =
            Some(stats.register_stat(StatDescriptor::new("f1", "1", StatOutput::Sum).nullable())?);
        self.precision_stat = Some(
            stats.register_stat(StatDescriptor::new("precision", "1", StatOutput::Sum).nullable())?,
        );
        self.recall_stat = Some(
            stats.register_stat(StatDescriptor::new("recall", "1", StatOutput::Sum).nullable())?,
        );
        Ok(())
    }

    fn publish_stats(&mut self, stats: &mut StatAggregator) {
        let tp = self.true_positive as f64;
        let fp = self.false_positive as f64;
        let fne = self.false_negative as f64;
        if tp + fp > 0.0 {
            if let Some(id) = self.precision_stat {
                stats.set(id, tp / (tp + fp));
            }
        }
        if tp + fne > 0.0 {
            if let Some(id) = self.recall_stat {
                stats.set(id, tp / (tp + fne));
            }
        }
        if 2.0 * tp + fp + fne > 0.0 {
            if let Some(id) = self.f1_stat {
                stats.set(id, 2.0 * tp / (2.0 * tp + fp + fne));
            }
        }
        self.true_positive = 0;
        self.false_positive = 0;
        self.true_negative = 0;
        self.false_negative = 0;
    }
}

/// Detection quality: greedy matching of predicted boxes against ground
/// truth of the same class at IoU >= 0.5.
pub struct DetectionStatLayer {
    true_positive: u64,
    false_positive: u64,
    false_negative: u64,
    precision_stat: Option<StatId>,
    recall_stat: Option<StatId>,
}

impl DetectionStatLayer {
    pub fn new() -> Self {
        Self {
            true_positive: 0,
            false_positive: 0,
            false_negative: 0,
            precision_stat: None,
            recall_stat: None,
        }
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        (self.true_positive, self.false_positive, self.false_negative)
    }
}

impl Default for DetectionStatLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for DetectionStatLayer {
    fn kind(&self) -> &'static str {
        "detection_stat"
    }

    fn caps(&self) -> LayerCaps {
        LayerCaps {
            gradient_safe: false,
            dynamic_aware: true,
            is_loss: false,
        }
    }

    fn create_outputs(&self, inputs: &[TensorShape]) -> NetResult<Vec<TensorShape>> {
        expect_input_count(self.kind(), inputs, 2)?;
        Ok(Vec::new())
    }

    fn connect(&mut self, inputs: &[TensorShape], outputs: &[TensorShape]) -> NetResult<()> {
        let expected = self.create_outputs(inputs)?;
        expect_output_match(self.kind(), &expected, outputs)
    }

    fn forward(
        &mut self,
        inputs: &[&CombinedTensor],
        _outputs: &mut [CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        for sample in 0..inputs[0].meta.len() {
            let detections = inputs[0].meta[sample].boxes().unwrap_or(&[]);
            let truths = inputs[1].meta[sample].boxes().unwrap_or(&[]);
            let mut matched = vec![false; truths.len()];
            for detection in detections {
                let mut hit = false;
                for (i, truth) in truths.iter().enumerate() {
                    if !matched[i]
                        && truth.class_id == detection.class_id
                        && detection.iou(truth) >= 0.5
                    {
                        matched[i] = true;
                        hit = true;
                        break;
                    }
                }
                if hit {
                    self.true_positive += 1;
                } else {
                    self.false_positive += 1;
                }
            }
            self.false_negative += matched.iter().filter(|&&m| !m).count() as u64;
        }
        Ok(())
    }

    fn backward(
        &mut self,
        _inputs: &mut [InputRef<'_>],
        _outputs: &[CombinedTensor],
        _status: &NetStatus,
    ) -> NetResult<()> {
        Ok(())
    }

    fn register_stats(&mut self, stats: &mut StatAggregator) -> NetResult<()> {
        self.precision_stat = Some(stats.register_stat(
            StatDescriptor::new("detection_precision", "1", StatOutput::Sum).nullable(),
        )?);
        self.recall_stat = Some(stats.register_stat(
            StatDescriptor::new("detection_recall", "1", StatOutput::Sum).nullable(),
        )?);
        Ok(())
    }

    fn publish_stats(&mut self, stats: &mut StatAggregator) {
        let tp = self.true_positive as f64;
        let fp = self.false_positive as f64;
        let fne = self.false_negative as f64;
        if tp + fp > 0.0 {
            if let Some(id) = self.precision_stat {
                stats.set(id, tp / (tp + fp));
            }
        }
        if tp + fne > 0.0 {
            if let Some(id) = self.recall_stat {
                stats.set(id, tp / (tp + fne));
            }
        }
        self.true_positive = 0;
        self.false_positive = 0;
        self.false_negative = 0;
    }
}
