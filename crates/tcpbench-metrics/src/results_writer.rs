//! Results persistence, grounded on `app/common/results_writer.hpp`/`.cpp`: writes
//! `metadata.json` (the `RunMetadata`), `metrics.json` (final `CounterSnapshot` plus summary
//! quantiles), and a raw `<worker-index>.hdr` HDR-interval-log per worker histogram into an
//! output directory created if absent.

use hdrhistogram::serialization::{Serializer, V2Serializer};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tcpbench_core::{BenchError, CounterSnapshot, Result};

use crate::run_metadata::RunMetadata;

#[derive(Debug, Serialize)]
struct MetricsFile {
    counters: CounterSnapshot,
    p50_ns: u64,
    p99_ns: u64,
    p999_ns: u64,
    max_ns: u64,
}

pub struct ResultsWriter {
    dir: PathBuf,
}

impl ResultsWriter {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| BenchError::Setup(format!("create_dir_all({dir:?}): {e}")))?;
        Ok(Self { dir })
    }

    pub fn write_metadata(&self, metadata: &RunMetadata) -> Result<()> {
        self.write_json("metadata.json", metadata)
    }

    pub fn write_metrics(&self, counters: CounterSnapshot, histogram: &Histogram<u64>) -> Result<()> {
        let metrics = MetricsFile {
            counters,
            p50_ns: histogram.value_at_quantile(0.50),
            p99_ns: histogram.value_at_quantile(0.99),
            p999_ns: histogram.value_at_quantile(0.999),
            max_ns: histogram.max(),
        };
        self.write_json("metrics.json", &metrics)
    }

    pub fn write_histogram(&self, worker_index: usize, histogram: &Histogram<u64>) -> Result<()> {
        let path = self.dir.join(format!("{worker_index}.hdr"));
        let file = File::create(&path)
            .map_err(|e| BenchError::Setup(format!("create({path:?}): {e}")))?;
        let mut writer = BufWriter::new(file);
        V2Serializer::new()
            .serialize(histogram, &mut writer)
            .map_err(|e| BenchError::Setup(format!("hdr serialize: {e}")))?;
        writer
            .flush()
            .map_err(|e| BenchError::Setup(format!("flush {path:?}: {e}")))
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let file = File::create(&path)
            .map_err(|e| BenchError::Setup(format!("create({path:?}): {e}")))?;
        serde_json::to_writer_pretty(file, value)
            .map_err(|e| BenchError::Setup(format!("write {path:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_metadata::MachineInfo;

    #[test]
    fn writes_metadata_and_metrics_to_temp_dir() {
        let dir = std::env::temp_dir().join(format!("tcpbench-results-writer-test-{}", std::process::id()));
        let writer = ResultsWriter::new(&dir).unwrap();

        let metadata = RunMetadata {
            backend: "uring".into(),
            mode: "echo".into(),
            worker_count: 4,
            message_size: 256,
            duration_secs: 10,
            started_at_unix_ns: 0,
            machine: MachineInfo::collect(),
            tags: vec!["smoke".into()],
        };
        writer.write_metadata(&metadata).unwrap();

        let histogram = Histogram::<u64>::new_with_bounds(1, 1_000_000_000, 3).unwrap();
        writer
            .write_metrics(CounterSnapshot::default(), &histogram)
            .unwrap();
        writer.write_histogram(0, &histogram).unwrap();

        assert!(dir.join("metadata.json").exists());
        assert!(dir.join("metrics.json").exists());
        assert!(dir.join("0.hdr").exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
