//! Metric registration and aggregation for the training loop.
//!
//! The aggregator is an explicit handle owned by the trainer; layers and the
//! epoch loop push updates into registered slots, and `generate` turns the
//! accumulators into reportable values for the attached sinks.

use std::io::Write;
use std::time::Instant;

use crate::errors::{NetError, NetResult};

/// How a recorded accumulator becomes a reportable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOutput {
    /// Report the raw accumulated value.
    Sum,
    /// Divide by the number of recorded iterations.
    PerIteration,
    /// Divide by elapsed recording time in seconds.
    PerSecond,
}

/// Describes one registered statistic.
pub struct StatDescriptor {
    pub description: String,
    pub unit: String,
    /// Nullable stats report nothing when no update arrived.
    pub nullable: bool,
    pub initial: f64,
    pub output: StatOutput,
}

impl StatDescriptor {
    pub fn new(description: &str, unit: &str, output: StatOutput) -> Self {
        Self {
            description: description.to_string(),
            unit: unit.to_string(),
            nullable: false,
            initial: 0.0,
            output,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatId(usize);

/// One generated report, handed to every sink.
#[derive(Debug, Clone)]
pub struct StatSnapshot {
    pub experiment_name: String,
    pub testing_dataset: String,
    pub epoch: usize,
    pub is_testing: bool,
    pub iterations: u64,
    pub seconds_elapsed: f64,
    /// (description, unit, value) per registered stat; `None` for nullable
    /// stats that never received an update.
    pub values: Vec<(String, String, Option<f64>)>,
}

pub trait StatSink: Send {
    fn consume(&mut self, snapshot: &StatSnapshot) -> NetResult<()>;
}

/// Writes snapshots through `tracing`.
pub struct ConsoleSink;

impl StatSink for ConsoleSink {
    fn consume(&mut self, snapshot: &StatSnapshot) -> NetResult<()> {
        let mode = if snapshot.is_testing { "test" } else { "train" };
        for (description, unit, value) in &snapshot.values {
            match value {
                Some(v) => tracing::info!(
                    epoch = snapshot.epoch,
                    mode,
                    "{}: {:.6} {}",
                    description,
                    v,
                    unit
                ),
                None => tracing::debug!(epoch = snapshot.epoch, mode, "{}: -", description),
            }
        }
        Ok(())
    }
}

/// Appends snapshots as CSV rows; the header row carries
/// `experiment_name, epoch, <description (unit)>...`.
pub struct CsvSink<W: Write + Send> {
    writer: csv::Writer<W>,
    wrote_header: bool,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            wrote_header: false,
        }
    }
}

impl<W: Write + Send> StatSink for CsvSink<W> {
    fn consume(&mut self, snapshot: &StatSnapshot) -> NetResult<()> {
        if !self.wrote_header {
            let mut header = vec!["experiment_name".to_string(), "epoch".to_string()];
            for (description, unit, _) in &snapshot.values {
                header.push(format!("{description} ({unit})"));
            }
            self.writer
                .write_record(&header)
                .map_err(|e| NetError::Serialization(e.to_string()))?;
            self.wrote_header = true;
        }
        let mut row = vec![
            snapshot.experiment_name.clone(),
            snapshot.epoch.to_string(),
        ];
        for (_, _, value) in &snapshot.values {
            row.push(value.map(|v| format!("{v}")).unwrap_or_default());
        }
        self.writer
            .write_record(&row)
            .map_err(|e| NetError::Serialization(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| NetError::Serialization(e.to_string()))?;
        Ok(())
    }
}

struct Slot {
    descriptor: StatDescriptor,
    value: f64,
    updated: bool,
}

/// Lifecycle: `register_stat`* -> `initialize` -> (`start_recording` ->
/// updates -> `stop_recording` -> `generate` -> `reset`)*.
pub struct StatAggregator {
    slots: Vec<Slot>,
    sinks: Vec<Box<dyn StatSink>>,
    initialized: bool,
    recording_since: Option<Instant>,
    accumulated_seconds: f64,
    iterations: u64,
    pub experiment_name: String,
    pub testing_dataset: String,
    pub epoch: usize,
    pub is_testing: bool,
}

impl Default for StatAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatAggregator {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            sinks: Vec::new(),
            initialized: false,
            recording_since: None,
            accumulated_seconds: 0.0,
            iterations: 0,
            experiment_name: String::new(),
            testing_dataset: String::new(),
            epoch: 0,
            is_testing: false,
        }
    }

    pub fn register_stat(&mut self, descriptor: StatDescriptor) -> NetResult<StatId> {
        if self.initialized {
            return Err(NetError::State(
                "stats cannot be registered after initialize".into(),
            ));
        }
        let initial = descriptor.initial;
        self.slots.push(Slot {
            descriptor,
            value: initial,
            updated: false,
        });
        Ok(StatId(self.slots.len() - 1))
    }

    /// Finds a registered stat by description, for layers that share slots.
    pub fn lookup(&self, description: &str) -> Option<StatId> {
        self.slots
            .iter()
            .position(|s| s.descriptor.description == description)
            .map(StatId)
    }

    pub fn add_sink(&mut self, sink: Box<dyn StatSink>) {
        self.sinks.push(sink);
    }

    pub fn initialize(&mut self) {
        self.initialized = true;
    }

    pub fn start_recording(&mut self) {
        if self.recording_since.is_none() {
            self.recording_since = Some(Instant::now());
        }
    }

    pub fn stop_recording(&mut self) {
        if let Some(since) = self.recording_since.take() {
            self.accumulated_seconds += since.elapsed().as_secs_f64();
        }
    }

    pub fn update(&mut self, id: StatId, value: f64) {
        let slot = &mut self.slots[id.0];
        slot.value += value;
        slot.updated = true;
    }

    pub fn set(&mut self, id: StatId, value: f64) {
        let slot = &mut self.slots[id.0];
        slot.value = value;
        slot.updated = true;
    }

    pub fn count_iteration(&mut self) {
        self.iterations += 1;
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    fn snapshot(&self) -> StatSnapshot {
        let seconds = self.accumulated_seconds
            + self
                .recording_since
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or(0.0);
        let mut values = Vec::with_capacity(self.slots.len() + 3);
        values.push((
            "iterations".to_string(),
            "1".to_string(),
            Some(self.iterations as f64),
        ));
        values.push((
            "seconds_elapsed".to_string(),
            "s".to_string(),
            Some(seconds),
        ));
        for slot in &self.slots {
            let value = if slot.descriptor.nullable && !slot.updated {
                None
            } else {
                Some(match slot.descriptor.output {
                    StatOutput::Sum => slot.value,
                    StatOutput::PerIteration => {
                        if self.iterations == 0 {
                            slot.value
                        } else {
                            slot.value / self.iterations as f64
                        }
                    }
                    StatOutput::PerSecond => {
                        if seconds > 0.0 {
                            slot.value / seconds
                        } else {
                            slot.value
                        }
                    }
                })
            };
            values.push((
                slot.descriptor.description.clone(),
                slot.descriptor.unit.clone(),
                value,
            ));
        }
        StatSnapshot {
            experiment_name: self.experiment_name.clone(),
            testing_dataset: self.testing_dataset.clone(),
            epoch: self.epoch,
            is_testing: self.is_testing,
            iterations: self.iterations,
            seconds_elapsed: seconds,
            values,
        }
    }

    /// Produces a snapshot and feeds every sink.
    pub fn generate(&mut self) -> NetResult<StatSnapshot> {
        let snapshot = self.snapshot();
        for sink in &mut self.sinks {
            sink.consume(&snapshot)?;
        }
        Ok(snapshot)
    }

    /// Clears accumulators and timers for the next recording window.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.value = slot.descriptor.initial;
            slot.updated = false;
        }
        self.iterations = 0;
        self.accumulated_seconds = 0.0;
        self.recording_since = None;
    }
}
