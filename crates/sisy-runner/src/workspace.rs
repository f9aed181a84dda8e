use anyhow::{anyhow, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

pub const REFLECTION_EXT: &str = "hkl";
pub const MODEL_EXT: &str = "ins";
pub const REPORT_EXT: &str = "cif";

const LOG_FILE: &str = "out.log";
const RESULTS_FILE: &str = "results.txt";
const DONE_FILE: &str = "done";
const HEADER_BAR: &str = "===========================";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("work path {0} has no parent data directory")]
    NoDataDir(PathBuf),
    #[error("no *.{ext} file in {dir}")]
    MissingInput { ext: &'static str, dir: PathBuf },
    #[error("{count} *.{ext} files in {dir}, expected exactly one")]
    AmbiguousInput {
        ext: &'static str,
        dir: PathBuf,
        count: usize,
    },
    #[error("workspace i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> SetupError + '_ {
    move |source| SetupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn job_dir(base_work_path: &Path, id: usize) -> PathBuf {
    base_work_path.join(format!("job_{}", id))
}

pub fn done_marker(base_work_path: &Path, id: usize) -> PathBuf {
    job_dir(base_work_path, id).join(DONE_FILE)
}

fn files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, SetupError> {
    let mut found = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| SetupError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|s| s.to_str()) == Some(ext)
        {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

fn unique_input(dir: &Path, ext: &'static str) -> Result<PathBuf, SetupError> {
    let mut found = files_with_ext(dir, ext)?;
    match found.len() {
        0 => Err(SetupError::MissingInput {
            ext,
            dir: dir.to_path_buf(),
        }),
        1 => Ok(found.remove(0)),
        count => Err(SetupError::AmbiguousInput {
            ext,
            dir: dir.to_path_buf(),
            count,
        }),
    }
}

/// A job's private directory: staged inputs plus the log, results and done
/// marker it produces.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    dir: PathBuf,
    model_file: PathBuf,
}

impl JobWorkspace {
    /// Recreates `job_<id>` under `base_work_path` and stages the single
    /// reflection file and model file found in the data directory one level
    /// above it.
    pub fn setup(base_work_path: &Path, id: usize) -> Result<Self, SetupError> {
        let data_dir = base_work_path
            .parent()
            .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
            .ok_or_else(|| SetupError::NoDataDir(base_work_path.to_path_buf()))?;
        let reflections = unique_input(data_dir, REFLECTION_EXT)?;
        let model = unique_input(data_dir, MODEL_EXT)?;

        let dir = job_dir(base_work_path, id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(io_at(&dir))?;
        }
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;

        let mut staged = Vec::with_capacity(2);
        for src in [&reflections, &model] {
            let name = src
                .file_name()
                .ok_or_else(|| SetupError::NoDataDir(src.clone()))?;
            let dst = dir.join(name);
            fs::copy(src, &dst).map_err(io_at(&dst))?;
            staged.push(dst);
        }
        debug!(job_id = id, dir = %dir.display(), "workspace staged");
        Ok(Self {
            dir,
            model_file: staged.remove(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_file(&self) -> &Path {
        &self.model_file
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    pub fn done_path(&self) -> PathBuf {
        self.dir.join(DONE_FILE)
    }

    /// The report the engine wrote next to the model.
    pub fn find_report(&self) -> Result<PathBuf> {
        files_with_ext(&self.dir, REPORT_EXT)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no *.{} report in {}", REPORT_EXT, self.dir.display()))
    }

    pub fn mark_done(&self) -> Result<()> {
        fs::File::create(self.done_path())?;
        Ok(())
    }
}

/// Append-only job log. Every line is synced to disk before returning.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
    job_id: usize,
}

impl JobLog {
    pub fn new(path: PathBuf, job_id: usize) -> Self {
        Self { path, job_id }
    }

    fn append(&self, text: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()
    }

    pub fn line(&self, text: &str) {
        debug!(job_id = self.job_id, "{}", text);
        if let Err(e) = self.append(text) {
            error!(
                job_id = self.job_id,
                path = %self.path.display(),
                error = %e,
                "job log write failed"
            );
        }
    }

    pub fn header(&self, text: &str) {
        self.line(&format!("{} {} {}", HEADER_BAR, text, HEADER_BAR));
    }
}
