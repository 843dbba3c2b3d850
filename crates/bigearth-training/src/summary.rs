//! Per-epoch scalar summaries written as JSON lines.
//!
//! Layout: `<log_dir>/<YYYYmmdd-HHMMSS>/train.jsonl` and `validation.jsonl`,
//! one object per evaluated epoch.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bigearth_core::{EpochRecord, Result};
use chrono::Local;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStream {
    Train,
    Validation,
}

impl SummaryStream {
    fn file_name(self) -> &'static str {
        match self {
            SummaryStream::Train => "train.jsonl",
            SummaryStream::Validation => "validation.jsonl",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummaryWriter {
    dir: PathBuf,
}

impl SummaryWriter {
    /// Creates a timestamped run directory under `log_dir`
    pub fn create(log_dir: &Path) -> Result<Self> {
        let dir = log_dir.join(Local::now().format("%Y%m%d-%H%M%S").to_string());
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, stream: SummaryStream) -> PathBuf {
        self.dir.join(stream.file_name())
    }

    /// Appends one line of named scalars for an epoch
    pub fn write_scalars(
        &self,
        stream: SummaryStream,
        epoch: usize,
        scalars: &[(&str, f64)],
    ) -> Result<()> {
        let mut line = Map::new();
        line.insert("epoch".into(), Value::from(epoch));
        for (name, value) in scalars {
            line.insert((*name).to_string(), Value::from(*value));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(stream))?;
        serde_json::to_writer(&mut file, &Value::Object(line))?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Writes the train and validation lines of an evaluated epoch
    pub fn write_epoch(&self, record: &EpochRecord) -> Result<()> {
        let mut train = vec![
            ("loss", record.train_loss),
            ("learning_rate", record.learning_rate),
        ];
        if let Some(metrics) = &record.train {
            train.extend(metrics.scalars());
        }
        self.write_scalars(SummaryStream::Train, record.epoch, &train)?;

        if let Some(metrics) = &record.validation {
            let mut validation = metrics.scalars();
            if let Some(loss) = record.validation_loss {
                validation.insert(0, ("loss", loss));
            }
            self.write_scalars(SummaryStream::Validation, record.epoch, &validation)?;
        }
        Ok(())
    }
}
