//! The outer training loop: batches, epochs, testing sweeps and snapshots.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::data::{BatchBuffers, BundleInputLayer};
use crate::errors::{NetError, NetResult};
use crate::graph::NetGraph;
use crate::optim::{Optimizer, ParamRef};
use crate::stats::{StatAggregator, StatDescriptor, StatId, StatOutput};
use crate::types::NodeId;

#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub experiment_name: String,
    pub architecture_name: String,
    pub iterations_per_epoch: usize,
    /// Number of batches whose gradients are accumulated before each
    /// optimizer step (the sequential batch size).
    pub sequential_batches: usize,
    /// Compute the full stat set during training, not just the loss.
    pub stats_during_training: bool,
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            experiment_name: "experiment".into(),
            architecture_name: "net".into(),
            iterations_per_epoch: 100,
            sequential_batches: 1,
            stats_during_training: false,
            snapshot_dir: None,
        }
    }
}

/// Snapshot naming: `snap<arch>_<DD.MM>_<HH.MM>_<mode>_<epoch>.Tensor`.
pub fn snapshot_file_name(
    architecture_name: &str,
    when: DateTime<Local>,
    mode: &str,
    epoch: usize,
) -> String {
    format!(
        "snap{}_{}_{}_{}_{}.Tensor",
        architecture_name,
        when.format("%d.%m"),
        when.format("%H.%M"),
        mode,
        epoch
    )
}

/// Drives the epoch loop: each iteration selects and loads a batch, runs
/// forward and backward, applies the optimizer and updates statistics. A
/// testing pass runs forward only. Stop requests take effect at batch
/// boundaries.
pub struct Trainer {
    graph: NetGraph,
    input: BundleInputLayer,
    input_node: NodeId,
    optimizer: Box<dyn Optimizer>,
    stats: StatAggregator,
    settings: TrainerSettings,
    epoch: usize,
    global_step: u64,
    stop_requested: Arc<AtomicBool>,
    training_loss_stat: StatId,
    testing_loss_stat: StatId,
}

impl Trainer {
    pub fn new(
        mut graph: NetGraph,
        input_node: NodeId,
        input: BundleInputLayer,
        optimizer: Box<dyn Optimizer>,
        mut stats: StatAggregator,
        settings: TrainerSettings,
    ) -> NetResult<Self> {
        let training_loss_stat = stats.register_stat(StatDescriptor::new(
            "training_loss",
            "1/sample",
            StatOutput::PerIteration,
        ))?;
        let testing_loss_stat = stats.register_stat(
            StatDescriptor::new("testing_loss", "1/sample", StatOutput::Sum).nullable(),
        )?;
        for index in 0..graph.len() {
            graph
                .node_mut(NodeId(index))
                .layer
                .register_stats(&mut stats)?;
        }
        stats.experiment_name = settings.experiment_name.clone();
        stats.initialize();
        Ok(Self {
            graph,
            input,
            input_node,
            optimizer,
            stats,
            settings,
            epoch: 0,
            global_step: 0,
            stop_requested: Arc::new(AtomicBool::new(false)),
            training_loss_stat,
            testing_loss_stat,
        })
    }

    pub fn graph(&self) -> &NetGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut NetGraph {
        &mut self.graph
    }

    pub fn input_layer_mut(&mut self) -> &mut BundleInputLayer {
        &mut self.input
    }

    pub fn stats(&self) -> &StatAggregator {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut StatAggregator {
        &mut self.stats
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Handle for requesting a stop; honored after the current batch.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    fn load_batch(&mut self, is_testing: bool) -> NetResult<usize> {
        let buffers = self.graph.buffers_mut(self.input_node);
        if buffers.len() < 4 {
            return Err(NetError::State(
                "input node does not expose data/label/helper/weight buffers".into(),
            ));
        }
        let (data, rest) = buffers.split_at_mut(1);
        let (label, rest) = rest.split_at_mut(1);
        let (helper, weight) = rest.split_at_mut(1);
        let mut batch = BatchBuffers {
            data: &mut data[0],
            label: &mut label[0],
            helper: &mut helper[0],
            weight: &mut weight[0],
        };
        self.input.select_and_load(&mut batch, is_testing)
    }

    fn optimizer_step(&mut self) -> NetResult<()> {
        let mut parameters: Vec<ParamRef<'_>> = self
            .graph
            .trainable_parameters()
            .into_iter()
            .map(|(tensor, local_lr)| ParamRef { tensor, local_lr })
            .collect();
        self.optimizer.step(&mut parameters, self.global_step)?;
        self.global_step += 1;
        Ok(())
    }

    /// Trains for `epochs` epochs. With `snapshots` enabled the parameters
    /// are serialized after every epoch, otherwise only at the end.
    pub fn train(&mut self, epochs: usize, snapshots: bool) -> NetResult<()> {
        self.stats.start_recording();
        for _ in 0..epochs {
            self.train_epoch()?;
            if snapshots {
                self.write_snapshot()?;
            }
            if !self.input.testing_bundles().is_empty() {
                self.test()?;
            }
            self.stats.epoch = self.epoch;
            self.stats.generate()?;
            self.stats.reset();
            if self.stop_requested.load(Ordering::Relaxed) {
                tracing::info!("stop requested, ending training after epoch {}", self.epoch);
                break;
            }
        }
        if !snapshots {
            self.write_snapshot()?;
        }
        self.stats.stop_recording();
        Ok(())
    }

    fn train_epoch(&mut self) -> NetResult<()> {
        self.graph.set_is_testing(false);
        for iteration in 0..self.settings.iterations_per_epoch {
            if self.stop_requested.load(Ordering::Relaxed) {
                tracing::info!("stop requested, ending epoch early at iteration {iteration}");
                break;
            }
            // Parameter deltas accumulate across sequential batches; the
            // optimizer consumes and zeroes them in one step.
            for _ in 0..self.settings.sequential_batches.max(1) {
                self.load_batch(false)?;
                self.graph.feed_forward()?;
                // Numeric trouble is reported but training continues.
                if let Err(error) = self.graph.check_numerics() {
                    tracing::warn!("{error}");
                }
                // Loss layers report per-sample averages already.
                let loss = self.graph.loss();
                self.stats.update(self.training_loss_stat, loss as f64);
                self.graph.back_propagate()?;
                self.stats.count_iteration();
            }
            self.optimizer_step()?;
        }
        if self.settings.stats_during_training {
            self.graph.publish_stats(&mut self.stats);
        }
        self.epoch += 1;
        Ok(())
    }

    /// Runs the deterministic testing sweep: forward passes and stat
    /// updates only. Returns the average per-sample loss.
    pub fn test(&mut self) -> NetResult<f32> {
        if self.input.testing_bundles().is_empty() {
            return Err(NetError::State("no testing bundles loaded".into()));
        }
        self.graph.set_is_testing(true);
        self.input.begin_testing_epoch();

        let mut loss_sum = 0.0f64;
        let mut samples_seen = 0usize;
        loop {
            let served = self.load_batch(true)?;
            if served == 0 {
                break;
            }
            self.graph.feed_forward()?;
            loss_sum += self.graph.loss() as f64 * served as f64;
            samples_seen += served;
        }
        self.graph.set_is_testing(false);

        let average = if samples_seen > 0 {
            (loss_sum / samples_seen as f64) as f32
        } else {
            0.0
        };
        self.stats.set(self.testing_loss_stat, average as f64);
        self.graph.publish_stats(&mut self.stats);
        tracing::info!(
            epoch = self.epoch,
            "testing pass over {samples_seen} samples, loss {average:.6}"
        );
        Ok(average)
    }

    fn write_snapshot(&mut self) -> NetResult<()> {
        let Some(directory) = self.settings.snapshot_dir.clone() else {
            return Ok(());
        };
        let name = snapshot_file_name(
            &self.settings.architecture_name,
            Local::now(),
            "train",
            self.epoch,
        );
        let path = directory.join(name);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        self.graph.serialize_parameters(&mut writer, &[])?;
        tracing::info!("snapshot written to {}", path.display());
        Ok(())
    }
}
