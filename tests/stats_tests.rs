use oxidenet::stats::{CsvSink, StatAggregator, StatDescriptor, StatOutput};

#[test]
fn lifecycle_accumulates_and_resets() {
    let mut stats = StatAggregator::new();
    let loss = stats
        .register_stat(StatDescriptor::new("loss", "1", StatOutput::PerIteration))
        .unwrap();
    let untouched = stats
        .register_stat(StatDescriptor::new("silent", "1", StatOutput::Sum).nullable())
        .unwrap();
    stats.initialize();

    // No more registration after initialize.
    assert!(stats
        .register_stat(StatDescriptor::new("late", "1", StatOutput::Sum))
        .is_err());

    stats.start_recording();
    stats.update(loss, 2.0);
    stats.update(loss, 4.0);
    stats.count_iteration();
    stats.count_iteration();
    stats.stop_recording();

    let snapshot = stats.generate().unwrap();
    assert_eq!(snapshot.iterations, 2);
    let loss_value = snapshot
        .values
        .iter()
        .find(|(d, _, _)| d == "loss")
        .unwrap()
        .2
        .unwrap();
    assert_eq!(loss_value, 3.0);

    // Nullable and never updated: reported as absent.
    let silent = snapshot
        .values
        .iter()
        .find(|(d, _, _)| d == "silent")
        .unwrap();
    assert!(silent.2.is_none());
    let _ = untouched;

    stats.reset();
    let empty = stats.generate().unwrap();
    assert_eq!(empty.iterations, 0);
}

#[test]
fn csv_sink_writes_header_and_rows() {
    let mut stats = StatAggregator::new();
    let loss = stats
        .register_stat(StatDescriptor::new("loss", "1/sample", StatOutput::Sum))
        .unwrap();
    let buffer = SharedBuffer::default();
    stats.add_sink(Box::new(CsvSink::new(buffer.clone())));
    stats.experiment_name = "exp1".into();
    stats.initialize();

    stats.set(loss, 0.5);
    stats.epoch = 1;
    stats.generate().unwrap();
    stats.reset();
    stats.set(loss, 0.25);
    stats.epoch = 2;
    stats.generate().unwrap();

    let written = buffer.contents();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("experiment_name,epoch,"));
    assert!(lines[0].contains("loss (1/sample)"));
    assert!(lines[1].starts_with("exp1,1,"));
    assert!(lines[2].starts_with("exp1,2,"));
    assert!(lines[1].contains("0.5"));
    assert!(lines[2].contains("0.25"));
}

use std::io::Write;
use std::sync::{Arc, Mutex};

/// An in-memory sink target the test can read back after generation.
#[derive(Clone, Default)]
struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.inner.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
