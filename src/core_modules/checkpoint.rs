// THEORY:
// Checkpoints are the one piece of on-disk state shared between runs. Each is the
// full-precision parameter record of the generator for one epoch, stored as
// `model_epoch_<epoch>.pkl` with the epoch zero-padded to five digits so names
// sort in epoch order. Loading a missing checkpoint is always an error: a run
// that asked to resume never silently starts from fresh weights.

use crate::error::{PipelineError, Result};
use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use std::path::PathBuf;

pub const EPOCH_WIDTH: usize = 5;
const MAX_EPOCH: usize = 99_999;
const CHECKPOINT_PREFIX: &str = "model_epoch_";
const CHECKPOINT_SUFFIX: &str = ".pkl";

type CheckpointRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// An epoch rendered at the fixed checkpoint width.
pub fn padded_epoch(epoch: usize) -> Result<String> {
    if epoch > MAX_EPOCH {
        return Err(PipelineError::EpochOutOfRange(epoch));
    }
    Ok(format!("{:0width$}", epoch, width = EPOCH_WIDTH))
}

/// Saves and loads generator snapshots under one models directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn file_name(epoch: usize) -> Result<String> {
        Ok(format!(
            "{}{}{}",
            CHECKPOINT_PREFIX,
            padded_epoch(epoch)?,
            CHECKPOINT_SUFFIX
        ))
    }

    pub fn path(&self, epoch: usize) -> Result<PathBuf> {
        Ok(self.dir.join(Self::file_name(epoch)?))
    }

    /// Writes the parameters of `model` as the checkpoint of `epoch`.
    pub fn save<B: Backend, M: Module<B>>(&self, model: &M, epoch: usize) -> Result<PathBuf> {
        let path = self.path(epoch)?;
        let recorder = CheckpointRecorder::default();
        let record = model.clone().into_record();
        let bytes = <CheckpointRecorder as Recorder<B>>::record(&recorder, record, ())
            .map_err(|err| PipelineError::Recorder(format!("{:?}", err)))?;
        std::fs::write(&path, bytes)?;
        tracing::info!(path = %path.display(), epoch, "generator saved");
        Ok(path)
    }

    /// Loads the checkpoint of `epoch` into `model`.
    pub fn load<B: Backend, M: Module<B>>(
        &self,
        model: M,
        epoch: usize,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.path(epoch)?;
        if !path.exists() {
            return Err(PipelineError::MissingCheckpoint { path });
        }
        let bytes = std::fs::read(&path)?;
        let recorder = CheckpointRecorder::default();
        let record = <CheckpointRecorder as Recorder<B>>::load(&recorder, bytes, device)
            .map_err(|err| PipelineError::Recorder(format!("{:?}", err)))?;
        tracing::info!(path = %path.display(), epoch, "generator loaded");
        Ok(model.load_record(record))
    }

    /// The highest epoch with a checkpoint on disk.
    pub fn latest_epoch(&self) -> Result<Option<usize>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let epoch = name
                .strip_prefix(CHECKPOINT_PREFIX)
                .and_then(|rest| rest.strip_suffix(CHECKPOINT_SUFFIX))
                .filter(|digits| digits.len() == EPOCH_WIDTH)
                .and_then(|digits| digits.parse::<usize>().ok());
            if let Some(epoch) = epoch {
                latest = latest.max(Some(epoch));
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::models::TinyGeneratorConfig;

    type TestBackend = burn::backend::NdArray<f32>;

    #[test]
    fn names_are_zero_padded() {
        assert_eq!(CheckpointManager::file_name(7).unwrap(), "model_epoch_00007.pkl");
        assert_eq!(CheckpointManager::file_name(0).unwrap(), "model_epoch_00000.pkl");
        assert_eq!(CheckpointManager::file_name(99_999).unwrap(), "model_epoch_99999.pkl");
    }

    #[test]
    fn epochs_beyond_the_width_are_rejected() {
        assert!(matches!(
            CheckpointManager::file_name(100_000),
            Err(PipelineError::EpochOutOfRange(100_000))
        ));
    }

    #[test]
    fn save_then_load_restores_identical_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let device = Default::default();
        let config = TinyGeneratorConfig::new(1);

        let saved = config.init::<TestBackend>(&device);
        let path = manager.save(&saved, 3).unwrap();
        assert!(path.ends_with("model_epoch_00003.pkl"));

        let fresh = config.init::<TestBackend>(&device);
        let loaded = manager.load(fresh, 3, &device).unwrap();

        let bytes = |model: &crate::core_modules::models::TinyGenerator<TestBackend>| {
            <CheckpointRecorder as Recorder<TestBackend>>::record(
                &CheckpointRecorder::default(),
                model.clone().into_record(),
                (),
            )
            .unwrap()
        };
        assert_eq!(bytes(&saved), bytes(&loaded));
    }

    #[test]
    fn missing_checkpoint_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let model = TinyGeneratorConfig::new(1).init::<TestBackend>(&Default::default());
        match manager.load(model, 12, &Default::default()) {
            Err(PipelineError::MissingCheckpoint { path }) => {
                assert!(path.ends_with("model_epoch_00012.pkl"));
            }
            other => panic!("expected a missing checkpoint error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn latest_epoch_scans_checkpoint_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        assert_eq!(manager.latest_epoch().unwrap(), None);

        for name in [
            "model_epoch_00002.pkl",
            "model_epoch_00010.pkl",
            "model_epoch_7.pkl",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(manager.latest_epoch().unwrap(), Some(10));
    }
}
