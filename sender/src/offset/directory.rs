use super::{Store, ZERO};
use crate::Error;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Configuration for a [Directory] store.
#[derive(Clone)]
pub struct Config {
    /// Directory holding one `<id>.txt` record per node.
    pub directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("offset"),
        }
    }
}

impl Config {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

/// Offset store backed by one text file per node.
///
/// Each record is named after the node identifier (`<id>.txt`) and holds a single decimal
/// number of seconds followed by a newline. Reading returns the first whitespace-delimited
/// token, so an empty record reads as the empty string.
#[derive(Clone)]
pub struct Directory {
    cfg: Config,
}

impl Directory {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Directory holding the records.
    pub fn path(&self) -> &Path {
        &self.cfg.directory
    }

    fn record(&self, id: u32) -> PathBuf {
        self.cfg.directory.join(format!("{id}.txt"))
    }

    /// Overwrite the record for node `id` with `raw`, creating the directory if needed.
    pub fn write(&self, id: u32, raw: &str) -> Result<(), Error> {
        fs::create_dir_all(&self.cfg.directory).map_err(|e| Error::OffsetWriteFailed(id, e))?;
        fs::write(self.record(id), format!("{raw}\n")).map_err(|e| Error::OffsetWriteFailed(id, e))
    }
}

impl Store for Directory {
    fn read(&mut self, id: u32) -> Result<Option<String>, Error> {
        let content = match fs::read_to_string(self.record(id)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::OffsetReadFailed(id, e)),
        };
        let token = content.split_whitespace().next().unwrap_or_default();
        Ok(Some(token.to_string()))
    }

    fn init(&mut self, id: u32) -> Result<(), Error> {
        self.write(id, ZERO)
    }
}
