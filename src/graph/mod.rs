pub mod serialize;

use std::collections::BTreeSet;

use crate::errors::{NetError, NetResult};
use crate::layers::{InputRef, Layer, NetStatus};
use crate::stats::StatAggregator;
use crate::tensor::CombinedTensor;
use crate::types::{NodeId, TensorShape};

/// One wiring edge: which buffer of which node feeds this input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub node: NodeId,
    pub output: usize,
    /// When false this edge is a gradient barrier: the consumer never writes
    /// the producer's delta.
    pub backprop: bool,
}

impl Connection {
    pub fn new(node: NodeId, output: usize) -> Self {
        Self {
            node,
            output,
            backprop: true,
        }
    }

    pub fn without_backprop(mut self) -> Self {
        self.backprop = false;
        self
    }
}

/// A graph vertex: a unique name, the layer it runs, and its input edges.
pub struct NetGraphNode {
    pub name: String,
    pub layer: Box<dyn Layer>,
    pub connections: Vec<Connection>,
    pub is_input: bool,
    pub is_output: bool,
}

impl NetGraphNode {
    pub fn new(name: &str, layer: Box<dyn Layer>) -> Self {
        Self {
            name: name.to_string(),
            layer,
            connections: Vec::new(),
            is_input: false,
            is_output: false,
        }
    }

    pub fn with_input(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn as_input(mut self) -> Self {
        self.is_input = true;
        self
    }

    pub fn as_output(mut self) -> Self {
        self.is_output = true;
        self
    }
}

/// The directed acyclic computation graph.
///
/// The graph owns every node and every activation buffer; buffers live in a
/// store parallel to the node list and are looked up per edge, so nodes
/// never hold references into each other.
pub struct NetGraph {
    nodes: Vec<NetGraphNode>,
    buffers: Vec<Vec<CombinedTensor>>,
    cached_input_shapes: Vec<Vec<TensorShape>>,
    order: Vec<usize>,
    initialized: bool,
    is_testing: bool,
}

impl Default for NetGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NetGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            buffers: Vec::new(),
            cached_input_shapes: Vec::new(),
            order: Vec::new(),
            initialized: false,
            is_testing: false,
        }
    }

    pub fn add_node(&mut self, node: NetGraphNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.buffers.push(Vec::new());
        self.cached_input_shapes.push(Vec::new());
        self.initialized = false;
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &NetGraphNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut NetGraphNode {
        &mut self.nodes[id.0]
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn buffers(&self, id: NodeId) -> &[CombinedTensor] {
        &self.buffers[id.0]
    }

    pub fn buffers_mut(&mut self, id: NodeId) -> &mut [CombinedTensor] {
        &mut self.buffers[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NetGraphNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn input_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.is_input)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn output_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.is_output)
            .map(|(id, _)| id)
            .collect()
    }

    /// The first output node, the conventional prediction source.
    pub fn default_output_node(&self) -> Option<NodeId> {
        self.output_nodes().first().copied()
    }

    pub fn set_is_testing(&mut self, is_testing: bool) {
        self.is_testing = is_testing;
    }

    pub fn is_testing(&self) -> bool {
        self.is_testing
    }

    /// Stable topological order: among ready nodes, insertion order wins.
    fn topological_sort(&self) -> NetResult<Vec<usize>> {
        let count = self.nodes.len();
        let mut in_degree = vec![0usize; count];
        for (i, node) in self.nodes.iter().enumerate() {
            for connection in &node.connections {
                if connection.node.0 >= count {
                    return Err(NetError::Wiring(format!(
                        "node '{}' references undefined node {}",
                        node.name, connection.node.0
                    )));
                }
            }
            in_degree[i] = node.connections.len();
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(&index) = ready.iter().next() {
            ready.remove(&index);
            order.push(index);
            for (i, node) in self.nodes.iter().enumerate() {
                if node.connections.iter().any(|c| c.node.0 == index) {
                    let incoming = node.connections.iter().filter(|c| c.node.0 == index).count();
                    in_degree[i] -= incoming;
                    if in_degree[i] == 0 {
                        ready.insert(i);
                    }
                }
            }
        }

        if order.len() != count {
            return Err(NetError::Wiring("graph contains a cycle".into()));
        }
        Ok(order)
    }

    fn validate_connections(&self) -> NetResult<()> {
        for node in &self.nodes {
            let mut seen = BTreeSet::new();
            for connection in &node.connections {
                if connection.node.0 >= self.nodes.len() {
                    return Err(NetError::Wiring(format!(
                        "node '{}' references undefined node {}",
                        node.name, connection.node.0
                    )));
                }
                if !seen.insert((connection.node.0, connection.output)) {
                    return Err(NetError::Wiring(format!(
                        "node '{}' references buffer {} of node {} more than once",
                        node.name, connection.output, connection.node.0
                    )));
                }
            }
        }

        // A producer buffer written by several backpropagating consumers
        // gets its delta overwritten, not accumulated.
        let mut consumer_counts: std::collections::BTreeMap<(usize, usize), usize> =
            std::collections::BTreeMap::new();
        for node in &self.nodes {
            for connection in node.connections.iter().filter(|c| c.backprop) {
                *consumer_counts
                    .entry((connection.node.0, connection.output))
                    .or_insert(0) += 1;
            }
        }
        for ((source, output), consumers) in consumer_counts {
            if consumers > 1 {
                tracing::warn!(
                    "buffer {} of node '{}' feeds {} backpropagating consumers; \
                     insert a gradient accumulation layer to sum their deltas",
                    output,
                    self.nodes[source].name,
                    consumers
                );
            }
        }
        Ok(())
    }

    fn gather_input_shapes(&self, index: usize) -> NetResult<Vec<TensorShape>> {
        let node = &self.nodes[index];
        let mut shapes = Vec::with_capacity(node.connections.len());
        for connection in &node.connections {
            let source = self.buffers.get(connection.node.0).ok_or_else(|| {
                NetError::Wiring(format!(
                    "node '{}' references undefined node {}",
                    node.name, connection.node.0
                ))
            })?;
            let buffer = source.get(connection.output).ok_or_else(|| {
                NetError::Wiring(format!(
                    "node '{}' references missing buffer {} of node {}",
                    node.name, connection.output, connection.node.0
                ))
            })?;
            shapes.push(buffer.shape());
        }
        Ok(shapes)
    }

    /// Validates the wiring, sorts the graph, creates every output buffer,
    /// connects every layer and propagates weight-initialization hints.
    pub fn initialize(&mut self) -> NetResult<()> {
        self.validate_connections()?;
        let order = self.topological_sort()?;

        // Derive boundary flags when the caller didn't set them.
        if !self.nodes.iter().any(|n| n.is_input) {
            for node in &mut self.nodes {
                if node.connections.is_empty() {
                    node.is_input = true;
                }
            }
        }
        if !self.nodes.iter().any(|n| n.is_output) {
            let consumed: BTreeSet<usize> = self
                .nodes
                .iter()
                .flat_map(|n| n.connections.iter().map(|c| c.node.0))
                .collect();
            for (i, node) in self.nodes.iter_mut().enumerate() {
                if !consumed.contains(&i) && !node.layer.caps().is_loss {
                    node.is_output = true;
                }
            }
        }
        if !self.nodes.iter().any(|n| n.is_input) {
            return Err(NetError::Wiring("graph has no input node".into()));
        }

        // Phase 1: create outputs in topological order.
        for &index in &order {
            let input_shapes = self.gather_input_shapes(index)?;
            let output_shapes = self.nodes[index].layer.create_outputs(&input_shapes)?;
            self.buffers[index] = output_shapes
                .iter()
                .map(|&shape| CombinedTensor::new(shape))
                .collect();
            self.cached_input_shapes[index] = input_shapes;
        }

        // Phase 2: connect in the same order.
        for &index in &order {
            let input_shapes = self.cached_input_shapes[index].clone();
            let output_shapes: Vec<TensorShape> =
                self.buffers[index].iter().map(|b| b.shape()).collect();
            self.nodes[index]
                .layer
                .connect(&input_shapes, &output_shapes)?;
        }

        // Phase 3: let downstream activations influence upstream init.
        for index in 0..self.nodes.len() {
            if let Some(hint) = self.nodes[index].layer.activation_hint() {
                let sources: Vec<usize> = self.nodes[index]
                    .connections
                    .iter()
                    .map(|c| c.node.0)
                    .collect();
                for source in sources {
                    self.nodes[source].layer.receive_init_hint(hint);
                }
            }
        }

        self.order = order;
        self.initialized = true;
        tracing::debug!("graph initialized with {} nodes", self.nodes.len());
        Ok(())
    }

    /// Re-runs per-layer weight initialization (after hints have been
    /// propagated by `initialize`).
    pub fn initialize_weights(&mut self) -> NetResult<()> {
        if !self.initialized {
            return Err(NetError::State("graph is not initialized".into()));
        }
        for node in &mut self.nodes {
            node.layer.init_weights();
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> NetResult<()> {
        if !self.initialized {
            return Err(NetError::State("graph is not initialized".into()));
        }
        Ok(())
    }

    /// Reconnects one node whose upstream shapes changed since the last
    /// pass, resizing its output buffers.
    fn reconnect(&mut self, index: usize, input_shapes: Vec<TensorShape>) -> NetResult<()> {
        let output_shapes = self.nodes[index].layer.create_outputs(&input_shapes)?;
        if self.buffers[index].len() != output_shapes.len() {
            self.buffers[index] = output_shapes
                .iter()
                .map(|&shape| CombinedTensor::new(shape))
                .collect();
        } else {
            for (buffer, &shape) in self.buffers[index].iter_mut().zip(&output_shapes) {
                buffer.resize(shape);
                buffer.is_dynamic = true;
            }
        }
        self.nodes[index]
            .layer
            .connect(&input_shapes, &output_shapes)?;
        self.cached_input_shapes[index] = input_shapes;
        Ok(())
    }

    pub fn feed_forward(&mut self) -> NetResult<()> {
        self.ensure_initialized()?;
        let order = self.order.clone();
        self.feed_forward_nodes(&order)
    }

    /// Runs forward on a subset of nodes, in topological order.
    pub fn feed_forward_subset(&mut self, subset: &[NodeId]) -> NetResult<()> {
        self.ensure_initialized()?;
        let wanted: BTreeSet<usize> = subset.iter().map(|id| id.0).collect();
        let order: Vec<usize> = self
            .order
            .clone()
            .into_iter()
            .filter(|i| wanted.contains(i))
            .collect();
        self.feed_forward_nodes(&order)
    }

    fn feed_forward_nodes(&mut self, order: &[usize]) -> NetResult<()> {
        let status = NetStatus {
            is_testing: self.is_testing,
        };
        for &index in order {
            // Upstream shapes may have changed for dynamic buffers.
            let input_shapes = self.gather_input_shapes(index)?;
            if input_shapes != self.cached_input_shapes[index] {
                tracing::debug!(
                    "input shapes of node '{}' changed, reconnecting",
                    self.nodes[index].name
                );
                self.reconnect(index, input_shapes)?;
            }

            let mut outputs = std::mem::take(&mut self.buffers[index]);
            let connections = self.nodes[index].connections.clone();
            let result = {
                let buffers = &self.buffers;
                let inputs: Vec<&CombinedTensor> = connections
                    .iter()
                    .map(|c| &buffers[c.node.0][c.output])
                    .collect();
                self.nodes[index].layer.forward(&inputs, &mut outputs, &status)
            };
            self.buffers[index] = outputs;
            result?;
        }
        Ok(())
    }

    pub fn back_propagate(&mut self) -> NetResult<()> {
        self.ensure_initialized()?;
        let status = NetStatus {
            is_testing: self.is_testing,
        };
        let order = self.order.clone();
        for &index in order.iter().rev() {
            let connections = self.nodes[index].connections.clone();
            if connections.is_empty() {
                continue;
            }

            // Take each upstream buffer store out, hand the layer mutable
            // references, then put everything back.
            let mut taken: Vec<(usize, Vec<CombinedTensor>)> = Vec::new();
            for connection in &connections {
                if !taken.iter().any(|(n, _)| *n == connection.node.0) {
                    taken.push((
                        connection.node.0,
                        std::mem::take(&mut self.buffers[connection.node.0]),
                    ));
                }
            }

            let result = {
                let mut slots: Vec<(usize, Vec<Option<&mut CombinedTensor>>)> = taken
                    .iter_mut()
                    .map(|(n, v)| (*n, v.iter_mut().map(Some).collect()))
                    .collect();
                let mut input_refs: Vec<InputRef<'_>> = Vec::with_capacity(connections.len());
                for connection in &connections {
                    let slot = slots
                        .iter_mut()
                        .find(|(n, _)| *n == connection.node.0)
                        .expect("taken above");
                    let buffer = slot.1[connection.output]
                        .take()
                        .expect("duplicate connections are rejected at initialize");
                    input_refs.push(InputRef {
                        buffer,
                        backprop: connection.backprop,
                    });
                }
                let outputs = &self.buffers[index];
                self.nodes[index]
                    .layer
                    .backward(&mut input_refs, outputs, &status)
            };

            for (node, buffers) in taken {
                self.buffers[node] = buffers;
            }
            result?;
        }
        Ok(())
    }

    /// Sum of the scalar losses reported by loss layers after the last
    /// forward pass.
    pub fn loss(&self) -> f32 {
        self.nodes
            .iter()
            .filter_map(|n| n.layer.loss())
            .sum()
    }

    /// Scans all buffers for non-finite values. Returns a `Numeric` error
    /// describing the counts when any are present.
    pub fn check_numerics(&self) -> NetResult<()> {
        let mut nan_count = 0;
        let mut inf_count = 0;
        for buffers in &self.buffers {
            for buffer in buffers {
                let (nan, inf) = buffer.data.count_non_finite();
                nan_count += nan;
                inf_count += inf;
            }
        }
        if nan_count > 0 || inf_count > 0 {
            return Err(NetError::Numeric {
                context: "forward pass".into(),
                nan_count,
                inf_count,
            });
        }
        Ok(())
    }

    /// Pushes every layer's accumulated metrics into the aggregator.
    pub fn publish_stats(&mut self, stats: &mut StatAggregator) {
        for node in &mut self.nodes {
            node.layer.publish_stats(stats);
        }
    }

    /// Parameter lists in stable node order, paired with each layer's local
    /// learning rate. This is the optimizer's view of the graph.
    pub fn trainable_parameters(&mut self) -> Vec<(&mut CombinedTensor, f32)> {
        let mut parameters = Vec::new();
        for node in &mut self.nodes {
            let local_lr = node.layer.local_learning_rate();
            for parameter in node.layer.parameters_mut() {
                parameters.push((parameter, local_lr));
            }
        }
        parameters
    }

    pub(crate) fn topological_order(&self) -> &[usize] {
        &self.order
    }
}
