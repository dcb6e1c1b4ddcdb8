//! Computation-graph core for convolutional networks.
//!
//! The crate builds directed acyclic graphs of typed tensor buffers and
//! differentiable layers, runs them forward and backward, manages parameter
//! lifecycles, and feeds them from a bundle/segment/sample data pipeline.
//! Training supports classification, semantic segmentation (patch-based and
//! fully convolutional) and YOLO-style detection.

pub mod data;
pub mod errors;
pub mod factory;
pub mod graph;
pub mod layers;
pub mod optim;
pub mod stats;
pub mod tensor;
pub mod trainer;
pub mod types;
pub mod util;

pub use errors::{NetError, NetResult};
pub use graph::{Connection, NetGraph, NetGraphNode};
pub use layers::Layer;
pub use tensor::{CombinedTensor, Tensor};
pub use types::{NodeId, Task, TensorShape};

/// Installs a `tracing` subscriber writing to stderr, for binaries and
/// examples that have no logging set up of their own.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
