use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::JobConfiguration;
use crate::workspace::done_marker;

const BENCHMARK_FILES: [&str; 3] = ["benchmark.yaml", "benchmark.yml", "benchmark.json"];

/// Indexed list of job configurations plus the completion query the
/// orchestrator consults before constructing a job.
pub trait BenchmarkSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Option<&JobConfiguration>;

    /// True when `index` already finished in an earlier batch.
    fn is_finished(&self, index: usize) -> bool;
}

type RawEntry = BTreeMap<String, serde_yaml::Value>;

#[derive(Deserialize)]
#[serde(untagged)]
enum BenchmarkDoc {
    List(Vec<RawEntry>),
    Jobs { jobs: Vec<RawEntry> },
}

/// Benchmark list read from `benchmark.{yaml,yml,json}` in the work path.
#[derive(Debug, Clone)]
pub struct BenchmarkFile {
    work_path: PathBuf,
    jobs: Vec<JobConfiguration>,
}

impl BenchmarkFile {
    pub fn locate(work_path: &Path) -> Option<PathBuf> {
        BENCHMARK_FILES
            .iter()
            .map(|name| work_path.join(name))
            .find(|p| p.is_file())
    }

    pub fn open(work_path: &Path) -> Result<Self> {
        let path = Self::locate(work_path).ok_or_else(|| {
            anyhow!(
                "no benchmark file ({}) in {}",
                BENCHMARK_FILES.join(", "),
                work_path.display()
            )
        })?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading benchmark {}", path.display()))?;
        Self::from_yaml_str(work_path, &raw)
            .with_context(|| format!("parsing benchmark {}", path.display()))
    }

    /// Parses a benchmark document. JSON is accepted as a YAML subset.
    pub fn from_yaml_str(work_path: &Path, raw: &str) -> Result<Self> {
        let entries = match serde_yaml::from_str::<BenchmarkDoc>(raw)? {
            BenchmarkDoc::List(entries) | BenchmarkDoc::Jobs { jobs: entries } => entries,
        };
        let jobs = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                JobConfiguration::from_entries(entry.iter())
                    .with_context(|| format!("benchmark entry {}", i))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            work_path: work_path.to_path_buf(),
            jobs,
        })
    }
}

impl BenchmarkSource for BenchmarkFile {
    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn get(&self, index: usize) -> Option<&JobConfiguration> {
        self.jobs.get(index)
    }

    fn is_finished(&self, index: usize) -> bool {
        done_marker(&self.work_path, index).exists()
    }
}
