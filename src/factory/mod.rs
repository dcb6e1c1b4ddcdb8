//! Construction of layers and whole graphs from JSON descriptors.
//!
//! A layer descriptor is `{"layer": {"type": "<kind>", ...}}` or the bare
//! form `{"layer": "<kind>"}`. An architecture file is a single object with
//! `net`, `hyperparameters`, `data_input` and `task` keys.

use serde_json::{json, Map, Value};

use crate::data::ClassManager;
use crate::errors::{NetError, NetResult};
use crate::graph::{Connection, NetGraph, NetGraphNode};
use crate::layers::input::{INPUT_LABEL, INPUT_WEIGHT};
use crate::layers::{
    AdvancedMaxPoolingLayer, BinaryStatLayer, ConcatLayer, ConcatenationLayer,
    ConfusionMatrixLayer, ConvolutionLayer, DetectionStatLayer, DropoutLayer, FlattenLayer,
    FullyConnectedLayer, GradientAccumulationLayer, InputDownSamplingLayer, InputLayer, Layer,
    LocalResponseNormalizationLayer, MaxPoolingLayer, MultiClassErrorLayer, NonLinearity,
    NonLinearityLayer, NormalizationMethod, ResizeLayer, SparsityReLULayer, SpatialPriorLayer,
    SquareErrorLayer, SumLayer, UpscaleLayer, YOLODetectionLayer, YOLOLossLayer,
};
use crate::layers::yolo::YOLOConfiguration;
use crate::optim::{optimizer_from_json, Optimizer};
use crate::types::{NodeId, Task};

/// Layer kinds whose construction consumes a PRNG seed.
const STOCHASTIC_KINDS: &[&str] = &["convolution", "fullyconnected", "dropout"];

/// Permitted configuration keys per layer kind.
fn permitted_keys(kind: &str) -> Option<&'static [&'static str]> {
    Some(match kind {
        "convolution" => &["size", "kernels", "stride", "pad", "group", "seed", "llr"],
        "fullyconnected" => &["neurons", "seed", "llr"],
        "maxpooling" => &["size"],
        "amaxpooling" => &["size", "stride"],
        "tanh" | "sigm" | "relu" | "leaky" | "softmax" => &[],
        "flatten" | "spatialprior" | "concat" | "concatenation" | "sum" => &[],
        "resize" => &["border"],
        "upscale" | "downsampling" => &["size"],
        "gradientaccumulation" => &["outputs"],
        "lrn" => &["size", "alpha", "beta", "method"],
        "dropout" => &["fraction", "seed"],
        "sparsityrelu" => &["lambda", "alpha", "kl_weight", "other_weight", "llr"],
        "yolo_output" => &["yolo_configuration"],
        "yolo_loss" => &["yolo_configuration", "coord_weight", "obj_weight", "noobj_weight"],
        "square_error" | "multiclass_error" | "binary_stat" | "detection_stat" => &[],
        "confusion_matrix" => &["classes"],
        _ => return None,
    })
}

pub struct LayerFactory;

impl LayerFactory {
    /// Splits a descriptor into its kind and configuration object,
    /// validating both forms and the per-kind key schema.
    pub fn validate(descriptor: &Value) -> NetResult<(String, Map<String, Value>)> {
        let object = descriptor
            .as_object()
            .ok_or_else(|| NetError::Config("layer descriptor must be an object".into()))?;
        if object.len() != 1 || !object.contains_key("layer") {
            return Err(NetError::Config(
                "layer descriptor must have exactly the key 'layer'".into(),
            ));
        }
        let inner = &object["layer"];
        let (kind, configuration) = match inner {
            Value::String(kind) => (kind.clone(), Map::new()),
            Value::Object(configuration) => {
                let kind = configuration
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        NetError::Config("layer descriptor object lacks a string 'type'".into())
                    })?
                    .to_string();
                let mut configuration = configuration.clone();
                configuration.remove("type");
                (kind, configuration)
            }
            _ => {
                return Err(NetError::Config(
                    "the 'layer' value must be a string or an object".into(),
                ))
            }
        };

        let permitted = permitted_keys(&kind).ok_or_else(|| NetError::UnknownLayer(kind.clone()))?;
        for key in configuration.keys() {
            if !permitted.contains(&key.as_str()) {
                return Err(NetError::Config(format!(
                    "layer kind '{kind}' does not accept key '{key}'"
                )));
            }
        }
        Ok((kind, configuration))
    }

    pub fn extract_kind(descriptor: &Value) -> NetResult<String> {
        Self::validate(descriptor).map(|(kind, _)| kind)
    }

    /// Sets the descriptor's seed, normalizing the bare string form into the
    /// object form first. Existing seeds are overwritten so graph
    /// reconstruction stays reproducible.
    pub fn inject_seed(descriptor: &Value, seed: u64) -> NetResult<Value> {
        let (kind, mut configuration) = Self::validate(descriptor)?;
        configuration.insert("seed".to_string(), json!(seed));
        configuration.insert("type".to_string(), json!(kind));
        Ok(json!({ "layer": configuration }))
    }

    pub fn construct(descriptor: &Value) -> NetResult<Box<dyn Layer>> {
        let (kind, configuration) = Self::validate(descriptor)?;
        construct_kind(&kind, &configuration)
    }
}

fn usize_pair(configuration: &Map<String, Value>, key: &str) -> NetResult<Option<(usize, usize)>> {
    match configuration.get(key) {
        None => Ok(None),
        Some(Value::Array(values)) if values.len() == 2 => {
            let a = values[0]
                .as_u64()
                .ok_or_else(|| NetError::Config(format!("'{key}' entries must be integers")))?;
            let b = values[1]
                .as_u64()
                .ok_or_else(|| NetError::Config(format!("'{key}' entries must be integers")))?;
            Ok(Some((a as usize, b as usize)))
        }
        Some(_) => Err(NetError::Config(format!(
            "'{key}' must be a two-element array"
        ))),
    }
}

fn required_usize(configuration: &Map<String, Value>, key: &str, kind: &str) -> NetResult<usize> {
    configuration
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| NetError::Config(format!("layer '{kind}' requires integer '{key}'")))
}

fn optional_f32(configuration: &Map<String, Value>, key: &str, default: f32) -> f32 {
    configuration
        .get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .unwrap_or(default)
}

fn optional_u64(configuration: &Map<String, Value>, key: &str, default: u64) -> u64 {
    configuration
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or(default)
}

fn yolo_configuration(configuration: &Map<String, Value>) -> NetResult<YOLOConfiguration> {
    let yolo = configuration
        .get("yolo_configuration")
        .and_then(Value::as_object)
        .ok_or_else(|| NetError::Config("missing 'yolo_configuration'".into()))?;
    let get = |key: &str| -> NetResult<usize> {
        yolo.get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .ok_or_else(|| NetError::Config(format!("yolo_configuration lacks integer '{key}'")))
    };
    Ok(YOLOConfiguration {
        horizontal_cells: get("horizontal_cells")?,
        vertical_cells: get("vertical_cells")?,
        boxes_per_cell: get("boxes_per_cell")?,
    })
}

fn construct_kind(kind: &str, configuration: &Map<String, Value>) -> NetResult<Box<dyn Layer>> {
    let layer: Box<dyn Layer> = match kind {
        "convolution" => {
            let (kernel_width, kernel_height) = usize_pair(configuration, "size")?
                .ok_or_else(|| NetError::Config("convolution requires 'size'".into()))?;
            let kernels = required_usize(configuration, "kernels", kind)?;
            let (stride_width, stride_height) =
                usize_pair(configuration, "stride")?.unwrap_or((1, 1));
            let (pad_width, pad_height) = usize_pair(configuration, "pad")?.unwrap_or((0, 0));
            let group = optional_u64(configuration, "group", 1) as usize;
            let seed = optional_u64(configuration, "seed", 0);
            let layer = ConvolutionLayer::new(
                kernel_width,
                kernel_height,
                kernels,
                stride_width,
                stride_height,
                pad_width,
                pad_height,
                group,
                seed,
            )
            .with_local_lr(optional_f32(configuration, "llr", 1.0));
            Box::new(layer)
        }
        "fullyconnected" => {
            let neurons = required_usize(configuration, "neurons", kind)?;
            let seed = optional_u64(configuration, "seed", 0);
            Box::new(
                FullyConnectedLayer::new(neurons, seed)
                    .with_local_lr(optional_f32(configuration, "llr", 1.0)),
            )
        }
        "maxpooling" => {
            let (width, height) = usize_pair(configuration, "size")?
                .ok_or_else(|| NetError::Config("maxpooling requires 'size'".into()))?;
            Box::new(MaxPoolingLayer::new(width, height))
        }
        "amaxpooling" => {
            let (width, height) = usize_pair(configuration, "size")?
                .ok_or_else(|| NetError::Config("amaxpooling requires 'size'".into()))?;
            let (stride_width, stride_height) =
                usize_pair(configuration, "stride")?.unwrap_or((width, height));
            Box::new(AdvancedMaxPoolingLayer::new(
                width,
                height,
                stride_width,
                stride_height,
            ))
        }
        "tanh" => Box::new(NonLinearityLayer::new(NonLinearity::Tanh)),
        "sigm" => Box::new(NonLinearityLayer::new(NonLinearity::Sigmoid)),
        "relu" => Box::new(NonLinearityLayer::new(NonLinearity::ReLU)),
        "leaky" => Box::new(NonLinearityLayer::new(NonLinearity::LeakyReLU)),
        "softmax" => Box::new(NonLinearityLayer::new(NonLinearity::Softmax)),
        "flatten" => Box::new(FlattenLayer),
        "resize" => {
            let (border_x, border_y) = usize_pair(configuration, "border")?.unwrap_or((0, 0));
            Box::new(ResizeLayer::new(border_x, border_y))
        }
        "upscale" => {
            let (width, height) = usize_pair(configuration, "size")?
                .ok_or_else(|| NetError::Config("upscale requires 'size'".into()))?;
            Box::new(UpscaleLayer::new(width, height))
        }
        "downsampling" => {
            let (width, height) = usize_pair(configuration, "size")?
                .ok_or_else(|| NetError::Config("downsampling requires 'size'".into()))?;
            Box::new(InputDownSamplingLayer::new(width, height))
        }
        "spatialprior" => Box::new(SpatialPriorLayer::new()),
        "concat" => Box::new(ConcatLayer::new()),
        "concatenation" => Box::new(ConcatenationLayer::new()),
        "sum" => Box::new(SumLayer),
        "gradientaccumulation" => {
            let outputs = required_usize(configuration, "outputs", kind)?;
            Box::new(GradientAccumulationLayer::new(outputs))
        }
        "lrn" => {
            let size = optional_u64(configuration, "size", 5) as usize;
            let alpha = optional_f32(configuration, "alpha", 1e-4);
            let beta = optional_f32(configuration, "beta", 0.75);
            let method = match configuration.get("method").and_then(Value::as_str) {
                Some("within_channel") => NormalizationMethod::WithinChannel,
                Some("across_channels") | None => NormalizationMethod::AcrossChannels,
                Some(other) => {
                    return Err(NetError::Config(format!(
                        "unknown normalization method '{other}'"
                    )))
                }
            };
            Box::new(LocalResponseNormalizationLayer::new(size, alpha, beta, method))
        }
        "dropout" => {
            let fraction = optional_f32(configuration, "fraction", 0.5);
            let seed = optional_u64(configuration, "seed", 0);
            Box::new(DropoutLayer::new(fraction, seed)?)
        }
        "sparsityrelu" => {
            let layer = SparsityReLULayer::new(
                optional_f32(configuration, "lambda", 1.0),
                optional_f32(configuration, "alpha", 0.5),
                optional_f32(configuration, "kl_weight", 0.0),
                optional_f32(configuration, "other_weight", 0.0),
            );
            let layer = match configuration.get("llr").and_then(Value::as_f64) {
                Some(llr) => layer.with_local_lr(llr as f32),
                None => layer,
            };
            Box::new(layer)
        }
        "yolo_output" => {
            let yolo = configuration
                .get("yolo_configuration")
                .and_then(Value::as_object);
            let confidence_threshold = yolo
                .and_then(|y| y.get("confidence_threshold"))
                .and_then(Value::as_f64)
                .unwrap_or(0.2) as f32;
            let do_nms = yolo
                .and_then(|y| y.get("do_nms"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            Box::new(YOLODetectionLayer::new(
                yolo_configuration(configuration)?,
                confidence_threshold,
                do_nms,
            ))
        }
        "yolo_loss" => Box::new(
            YOLOLossLayer::new(yolo_configuration(configuration)?).with_weights(
                optional_f32(configuration, "coord_weight", 5.0),
                optional_f32(configuration, "obj_weight", 1.0),
                optional_f32(configuration, "noobj_weight", 0.5),
            ),
        ),
        "square_error" => Box::new(SquareErrorLayer::new()),
        "multiclass_error" => Box::new(MultiClassErrorLayer::new()),
        "binary_stat" => Box::new(BinaryStatLayer::new()),
        "detection_stat" => Box::new(DetectionStatLayer::new()),
        "confusion_matrix" => {
            let classes = required_usize(configuration, "classes", kind)?;
            Box::new(ConfusionMatrixLayer::new(classes))
        }
        other => return Err(NetError::UnknownLayer(other.to_string())),
    };
    Ok(layer)
}

/// Trainer-facing settings parsed from the `hyperparameters` object.
#[derive(Debug, Clone)]
pub struct Hyperparameters {
    pub learning_rate: f32,
    pub iterations: usize,
    pub batch_size_parallel: usize,
    pub batch_size_sequential: usize,
    pub optimization_method: String,
    pub raw: Value,
}

impl Hyperparameters {
    pub fn from_json(value: &Value) -> Self {
        let get_usize = |key: &str, default: usize| -> usize {
            value
                .get(key)
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(default)
        };
        Self {
            learning_rate: value
                .get("learning_rate")
                .and_then(Value::as_f64)
                .unwrap_or(0.01) as f32,
            iterations: get_usize("iterations", 100),
            batch_size_parallel: get_usize("batch_size_parallel", 1),
            batch_size_sequential: get_usize("batch_size_sequential", 1),
            optimization_method: value
                .get("optimization_method")
                .and_then(Value::as_str)
                .unwrap_or("gd")
                .to_string(),
            raw: value.clone(),
        }
    }

    pub fn build_optimizer(&self) -> NetResult<Box<dyn Optimizer>> {
        optimizer_from_json(&self.raw)
    }

    pub fn trainer_settings(
        &self,
        experiment_name: &str,
        architecture_name: &str,
    ) -> crate::trainer::TrainerSettings {
        crate::trainer::TrainerSettings {
            experiment_name: experiment_name.to_string(),
            architecture_name: architecture_name.to_string(),
            iterations_per_epoch: self.iterations,
            sequential_batches: self.batch_size_sequential.max(1),
            ..Default::default()
        }
    }
}

/// A fully assembled network plus the settings needed to train it.
pub struct ParsedNet {
    pub graph: NetGraph,
    pub task: Task,
    pub input_node: NodeId,
    pub hyperparameters: Hyperparameters,
}

pub struct NetGraphFactory;

impl NetGraphFactory {
    /// Builds an initialized graph from an architecture file.
    ///
    /// The factory adds an input node named "input" whose buffers are
    /// (data, label, helper, weight); node descriptors reference it as
    /// "input", "input.label" or "input.weight". When `net.error_layer` is
    /// "yes" (the default) the task's loss and stat layers are wired to the
    /// default output automatically.
    pub fn parse(architecture: &Value, classes: &ClassManager) -> NetResult<ParsedNet> {
        let task = architecture
            .get("task")
            .and_then(Value::as_str)
            .and_then(Task::parse)
            .ok_or_else(|| NetError::Config("architecture lacks a valid 'task'".into()))?;

        let hyperparameters = Hyperparameters::from_json(
            architecture
                .get("hyperparameters")
                .unwrap_or(&Value::Null),
        );

        let data_input = architecture
            .get("data_input")
            .and_then(Value::as_object)
            .ok_or_else(|| NetError::Config("architecture lacks 'data_input'".into()))?;
        let get_dim = |key: &str| -> NetResult<usize> {
            data_input
                .get(key)
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .ok_or_else(|| NetError::Config(format!("data_input lacks integer '{key}'")))
        };
        let (width, height, maps) = (get_dim("width")?, get_dim("height")?, get_dim("maps")?);

        let net = architecture
            .get("net")
            .and_then(Value::as_object)
            .ok_or_else(|| NetError::Config("architecture lacks 'net'".into()))?;
        let nodes_json = net
            .get("nodes")
            .and_then(Value::as_object)
            .ok_or_else(|| NetError::Config("net lacks 'nodes'".into()))?;
        if nodes_json.is_empty() {
            return Err(NetError::Wiring("net has no nodes".into()));
        }
        let wire_error_layer = match net.get("error_layer").and_then(Value::as_str) {
            None | Some("yes") => true,
            Some("no") => false,
            Some(other) => {
                return Err(NetError::Config(format!(
                    "net.error_layer must be \"yes\" or \"no\", got \"{other}\""
                )))
            }
        };

        let parent_seed = architecture
            .get("seed")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut graph = NetGraph::new();
        let input_node = graph.add_node(
            NetGraphNode::new(
                "input",
                Box::new(InputLayer::new(
                    hyperparameters.batch_size_parallel,
                    maps,
                    height,
                    width,
                    task,
                    classes.class_count(),
                )),
            )
            .as_input(),
        );

        // First pass: construct every layer with a deterministically
        // injected seed, so reconstruction is reproducible.
        let mut ids: Vec<(String, NodeId)> = vec![("input".to_string(), input_node)];
        for (index, (name, entry)) in nodes_json.iter().enumerate() {
            let descriptor = entry
                .get("layer")
                .map(|l| json!({ "layer": l }))
                .ok_or_else(|| {
                    NetError::Config(format!("node '{name}' lacks a layer descriptor"))
                })?;
            let kind = LayerFactory::extract_kind(&descriptor)?;
            let descriptor = if STOCHASTIC_KINDS.contains(&kind.as_str()) {
                LayerFactory::inject_seed(&descriptor, parent_seed + index as u64 + 1)?
            } else {
                descriptor
            };
            let layer = LayerFactory::construct(&descriptor)?;
            let mut node = NetGraphNode::new(name, layer);
            node.is_output = entry
                .get("output")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let id = graph.add_node(node);
            ids.push((name.clone(), id));
        }

        let resolve = |reference: &str| -> NetResult<Connection> {
            let (name, output) = match reference {
                "input.label" => ("input", INPUT_LABEL),
                "input.weight" => ("input", INPUT_WEIGHT),
                "input.helper" => ("input", crate::layers::input::INPUT_HELPER),
                other => (other, 0),
            };
            let id = ids
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .ok_or_else(|| {
                    NetError::Wiring(format!("reference to undefined node '{reference}'"))
                })?;
            Ok(Connection::new(id, output))
        };

        // Second pass: wire the connections.
        for (name, entry) in nodes_json.iter() {
            let id = ids
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .expect("added above");
            let mut connections = Vec::new();
            match entry.get("inputs") {
                None => {}
                Some(Value::Array(inputs)) => {
                    for input in inputs {
                        let connection = match input {
                            Value::String(reference) => resolve(reference)?,
                            Value::Object(object) => {
                                let reference = object
                                    .get("node")
                                    .and_then(Value::as_str)
                                    .ok_or_else(|| {
                                        NetError::Config(format!(
                                            "input of node '{name}' lacks 'node'"
                                        ))
                                    })?;
                                let mut connection = resolve(reference)?;
                                if let Some(output) =
                                    object.get("output_index").and_then(Value::as_u64)
                                {
                                    connection.output = output as usize;
                                }
                                if object.get("backprop").and_then(Value::as_bool) == Some(false) {
                                    connection = connection.without_backprop();
                                }
                                connection
                            }
                            _ => {
                                return Err(NetError::Config(format!(
                                    "invalid input reference in node '{name}'"
                                )))
                            }
                        };
                        connections.push(connection);
                    }
                }
                Some(_) => {
                    return Err(NetError::Config(format!(
                        "'inputs' of node '{name}' must be an array"
                    )))
                }
            }
            graph.node_mut(id).connections = connections;
        }

        // Optional loss/stat wiring against the default output.
        if wire_error_layer {
            let consumed: std::collections::BTreeSet<usize> = ids
                .iter()
                .map(|(_, id)| *id)
                .flat_map(|id| {
                    graph
                        .node(id)
                        .connections
                        .iter()
                        .map(|c| c.node.0)
                        .collect::<Vec<_>>()
                })
                .collect();
            let terminal = ids
                .iter()
                .rev()
                .find(|(_, id)| *id != input_node && !consumed.contains(&id.0))
                .map(|(_, id)| *id)
                .ok_or_else(|| NetError::Wiring("net has no terminal node".into()))?;

            let yolo = architecture
                .get("yolo_configuration")
                .map(|_| {
                    yolo_configuration(
                        architecture
                            .as_object()
                            .expect("architecture is an object"),
                    )
                })
                .transpose()?;
            Self::wire_loss_layers(&mut graph, task, terminal, input_node, classes, yolo)?;
        }

        graph.initialize()?;
        graph.initialize_weights()?;
        Ok(ParsedNet {
            graph,
            task,
            input_node,
            hyperparameters,
        })
    }

    fn wire_loss_layers(
        graph: &mut NetGraph,
        task: Task,
        terminal: NodeId,
        input_node: NodeId,
        classes: &ClassManager,
        yolo: Option<YOLOConfiguration>,
    ) -> NetResult<()> {
        let prediction = Connection::new(terminal, 0);
        let label = Connection::new(input_node, INPUT_LABEL).without_backprop();
        let weight = Connection::new(input_node, INPUT_WEIGHT).without_backprop();
        graph.node_mut(terminal).is_output = true;

        match task {
            Task::Classification | Task::Segmentation => {
                graph.add_node(
                    NetGraphNode::new("loss", Box::new(SquareErrorLayer::new()))
                        .with_input(prediction)
                        .with_input(label)
                        .with_input(weight),
                );
                graph.add_node(
                    NetGraphNode::new(
                        "confusion_matrix",
                        Box::new(ConfusionMatrixLayer::new(classes.class_count().max(2))),
                    )
                    .with_input(prediction.without_backprop())
                    .with_input(label)
                    .with_input(weight),
                );
            }
            Task::BinarySegmentation => {
                graph.add_node(
                    NetGraphNode::new("loss", Box::new(SquareErrorLayer::new()))
                        .with_input(prediction)
                        .with_input(label)
                        .with_input(weight),
                );
                graph.add_node(
                    NetGraphNode::new("binary_stat", Box::new(BinaryStatLayer::new()))
                        .with_input(prediction.without_backprop())
                        .with_input(label)
                        .with_input(weight),
                );
            }
            Task::Detection => {
                // The terminal node is expected to be the YOLO detection
                // layer; the loss reads the raw prediction it passes through.
                let configuration = yolo.unwrap_or(YOLOConfiguration {
                    horizontal_cells: 7,
                    vertical_cells: 7,
                    boxes_per_cell: 2,
                });
                graph.add_node(
                    NetGraphNode::new("loss", Box::new(YOLOLossLayer::new(configuration)))
                        .with_input(prediction)
                        .with_input(label),
                );
                graph.add_node(
                    NetGraphNode::new("detection_stat", Box::new(DetectionStatLayer::new()))
                        .with_input(prediction.without_backprop())
                        .with_input(label),
                );
            }
        }
        Ok(())
    }
}
