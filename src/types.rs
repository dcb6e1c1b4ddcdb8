use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Shape of a four-dimensional tensor buffer.
///
/// Memory is row-major with index order (sample, map, row, column), so the
/// flat offset of an element is `((s * maps + m) * height + y) * width + x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub samples: usize,
    pub maps: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorShape {
    pub fn new(samples: usize, maps: usize, height: usize, width: usize) -> Self {
        Self {
            samples,
            maps,
            height,
            width,
        }
    }

    /// Shape of a flat per-sample vector, the convention fully-connected
    /// layers produce.
    pub fn flat(samples: usize, width: usize) -> Self {
        Self::new(samples, 1, 1, width)
    }

    pub fn elements(&self) -> usize {
        self.samples * self.maps * self.height * self.width
    }

    pub fn elements_per_sample(&self) -> usize {
        self.maps * self.height * self.width
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}s x {}m x {}h x {}w)",
            self.samples, self.maps, self.height, self.width
        )
    }
}

/// The learning task a network is assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Classification,
    Segmentation,
    Detection,
    BinarySegmentation,
}

impl Task {
    pub fn parse(s: &str) -> Option<Task> {
        match s {
            "classification" => Some(Task::Classification),
            "segmentation" => Some(Task::Segmentation),
            "detection" => Some(Task::Detection),
            "binary_segmentation" => Some(Task::BinarySegmentation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Classification => "classification",
            Task::Segmentation => "segmentation",
            Task::Detection => "detection",
            Task::BinarySegmentation => "binary_segmentation",
        }
    }
}

/// Sentinel class id for pixels/boxes that match no registered class.
pub const UNKNOWN_CLASS: usize = usize::MAX;
