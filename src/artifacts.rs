//! Local artifact store.
//!
//! Files live at `{root}/{run_id}/{task_seq}/{round_seq}/{file}`. Logs are
//! append-or-create; mid-round and final artifacts are written whole. A missing
//! file is reported as `Ok(None)` because "nothing produced yet" is a normal
//! state for every round.

use crate::errors::ArtifactError;
use fedrun_common::Run;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOGS_FILE: &str = "logs.txt";
pub const MID_ARTIFACTS_FILE: &str = "mid-artifacts.txt";
pub const ARTIFACTS_FILE: &str = "artifacts.txt";

/// The three kinds of file kept per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Logs,
    MidArtifacts,
    Artifacts,
}

impl ArtifactKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Logs => LOGS_FILE,
            ArtifactKind::MidArtifacts => MID_ARTIFACTS_FILE,
            ArtifactKind::Artifacts => ARTIFACTS_FILE,
        }
    }

    /// Multipart field name used when uploading to the router.
    pub fn upload_field(self) -> &'static str {
        match self {
            ArtifactKind::Logs => "logs",
            ArtifactKind::MidArtifacts => "mid_artifacts",
            ArtifactKind::Artifacts => "artifacts",
        }
    }
}

/// Coordinates of one round's artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactAddress {
    pub run_id: String,
    pub task_seq: usize,
    pub round_seq: u64,
}

impl ArtifactAddress {
    pub fn new(run_id: impl Into<String>, task_seq: usize, round_seq: u64) -> Self {
        Self {
            run_id: run_id.into(),
            task_seq,
            round_seq,
        }
    }

    /// Address of the round `run` is currently in.
    pub fn for_run(run: &Run) -> Self {
        Self::new(run.id.clone(), run.cur_seq, run.round_seq())
    }

    fn validate(&self) -> Result<(), ArtifactError> {
        let safe_id = !self.run_id.is_empty()
            && !self.run_id.contains(['/', '\\'])
            && self.run_id != "."
            && self.run_id != "..";
        if !safe_id || self.task_seq == 0 || self.round_seq == 0 {
            return Err(ArtifactError::InvalidAddress {
                run_id: self.run_id.clone(),
                task_seq: self.task_seq,
                round_seq: self.round_seq,
            });
        }
        Ok(())
    }
}

/// File-backed artifact store rooted at one directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every file for one round.
    pub fn round_dir(&self, address: &ArtifactAddress) -> Result<PathBuf, ArtifactError> {
        address.validate()?;
        Ok(self
            .root
            .join(&address.run_id)
            .join(address.task_seq.to_string())
            .join(address.round_seq.to_string()))
    }

    pub fn path(
        &self,
        address: &ArtifactAddress,
        kind: ArtifactKind,
    ) -> Result<PathBuf, ArtifactError> {
        Ok(self.round_dir(address)?.join(kind.file_name()))
    }

    /// Append one line to the round's log, creating it if needed.
    pub fn append_log(&self, address: &ArtifactAddress, line: &str) -> Result<(), ArtifactError> {
        let path = self.path(address, ArtifactKind::Logs)?;
        ensure_parent(&path)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ArtifactError::Write {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{}", line).map_err(|source| ArtifactError::Write { path, source })
    }

    /// Replace the content of a mid-round or final artifact.
    pub fn write(
        &self,
        address: &ArtifactAddress,
        kind: ArtifactKind,
        content: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.path(address, kind)?;
        ensure_parent(&path)?;
        fs::write(&path, content).map_err(|source| ArtifactError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Read an artifact. `Ok(None)` when nothing has been produced yet.
    pub fn read(
        &self,
        address: &ArtifactAddress,
        kind: ArtifactKind,
    ) -> Result<Option<Vec<u8>>, ArtifactError> {
        let path = self.path(address, kind)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ArtifactError::Read { path, source }),
        }
    }

    pub fn exists(&self, address: &ArtifactAddress, kind: ArtifactKind) -> bool {
        self.path(address, kind).is_ok_and(|path| path.is_file())
    }
}

fn ensure_parent(path: &Path) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ArtifactError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
