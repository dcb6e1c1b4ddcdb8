pub mod class_manager;
pub mod input;

pub use class_manager::{ClassInfo, ClassManager};
pub use input::{BatchBuffers, BundleInputLayer, ImageLoader};

use serde_json::{json, Value};

use crate::errors::{NetError, NetResult};
use crate::util::bbox::BoundingBox;

/// One labeled instance: a JSON object with a required `image_filename` and
/// task-specific keys (`class`, `boxes`, `label_filename`). The graph never
/// looks inside; the batch assembler turns samples into label tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    json: Value,
}

impl Sample {
    pub fn new(json: Value) -> NetResult<Self> {
        if !json.is_object() {
            return Err(NetError::Config("sample descriptor must be an object".into()));
        }
        if json.get("image_filename").and_then(Value::as_str).is_none() {
            return Err(NetError::Config(
                "sample descriptor lacks 'image_filename'".into(),
            ));
        }
        Ok(Self { json })
    }

    pub fn image_filename(&self) -> &str {
        self.json
            .get("image_filename")
            .and_then(Value::as_str)
            .expect("validated at construction")
    }

    pub fn class_name(&self) -> Option<&str> {
        self.json.get("class").and_then(Value::as_str)
    }

    pub fn class_id(&self) -> Option<usize> {
        self.json
            .get("class")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }

    pub fn label_filename(&self) -> Option<&str> {
        self.json.get("label_filename").and_then(Value::as_str)
    }

    /// Ground-truth boxes with normalized coordinates, for detection.
    pub fn boxes(&self) -> NetResult<Vec<BoundingBox>> {
        match self.json.get("boxes") {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| NetError::Config(format!("invalid boxes in sample: {e}"))),
        }
    }

    pub fn json(&self) -> &Value {
        &self.json
    }
}

/// A named, ordered run of samples; the unit of move and split operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segment {
    pub name: String,
    pub score: f32,
    samples: Vec<Sample>,
    /// Directory the samples' image files are resolved against.
    pub folder_hint: Option<String>,
}

impl Segment {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            score: 1.0,
            samples: Vec::new(),
            folder_hint: None,
        }
    }

    pub fn add_sample(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn sample(&self, index: usize) -> &Sample {
        &self.samples[index]
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn from_json(value: &Value) -> NetResult<Self> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| NetError::Config("segment lacks a name".into()))?;
        let mut segment = Segment::new(name);
        segment.score = value.get("score").and_then(Value::as_f64).unwrap_or(1.0) as f32;
        if let Some(samples) = value.get("samples").and_then(Value::as_array) {
            for sample in samples {
                segment.add_sample(Sample::new(sample.clone())?);
            }
        }
        Ok(segment)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "score": self.score,
            "samples": self.samples.iter().map(|s| s.json.clone()).collect::<Vec<_>>(),
        })
    }
}

/// A named, ordered list of segments; the granularity of train/stage/test
/// assignment. A segment belongs to at most one bundle at a time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    pub name: String,
    segments: Vec<Segment>,
}

impl Bundle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            segments: Vec::new(),
        }
    }

    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_by_name(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name == name)
    }

    /// Total sample count across all segments.
    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(Segment::sample_count).sum()
    }

    /// Removes a segment, transferring ownership to the caller.
    pub fn take_segment(&mut self, index: usize) -> NetResult<Segment> {
        if index >= self.segments.len() {
            return Err(NetError::State(format!(
                "bundle '{}' has no segment {index}",
                self.name
            )));
        }
        Ok(self.segments.remove(index))
    }

    /// Moves a named segment from this bundle into another. Sample counts
    /// follow the segment.
    pub fn move_segment(&mut self, name: &str, target: &mut Bundle) -> NetResult<()> {
        let index = self.segment_by_name(name).ok_or_else(|| {
            NetError::State(format!("bundle '{}' has no segment '{name}'", self.name))
        })?;
        let segment = self.take_segment(index)?;
        target.add_segment(segment);
        Ok(())
    }

    /// Flat view of (segment index, sample index) pairs in order.
    pub fn sample_indices(&self) -> Vec<(usize, usize)> {
        let mut indices = Vec::with_capacity(self.sample_count());
        for (si, segment) in self.segments.iter().enumerate() {
            for i in 0..segment.sample_count() {
                indices.push((si, i));
            }
        }
        indices
    }

    pub fn from_json(value: &Value) -> NetResult<Self> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| NetError::Config("bundle lacks a name".into()))?;
        let mut bundle = Bundle::new(name);
        if let Some(segments) = value.get("segments").and_then(Value::as_array) {
            for segment in segments {
                bundle.add_segment(Segment::from_json(segment)?);
            }
        }
        Ok(bundle)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "segments": self.segments.iter().map(Segment::to_json).collect::<Vec<_>>(),
        })
    }
}
