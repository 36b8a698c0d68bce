//! Calibration anchor persistence
//!
//! Population writes the first and last simulated timestamps once it is done;
//! the execute phase reads them back to continue the same timeline.
//! Layout: `key=value` lines followed by a `checksum=` line holding the CRC32
//! of everything before it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name inside the anchor directory
pub const ANCHOR_FILE_NAME: &str = "calibration_anchor";

pub const START_KEY: &str = "startLoadTimestamp";
pub const LAST_KEY: &str = "lastLoadTimestamp";
pub const CHECKSUM_KEY: &str = "checksum";

/// First and last timestamps produced by the population phase (epoch ms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchors {
    pub start_load: i64,
    pub last_load: i64,
}

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("cannot access anchor file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("anchor file {path} has no `{field}` entry")]
    MissingField { path: PathBuf, field: &'static str },
    #[error("anchor file {path} has an invalid `{field}` value: {value:?}")]
    InvalidValue {
        path: PathBuf,
        field: &'static str,
        value: String,
    },
    #[error("anchor file {path} is corrupt: checksum {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },
}

/// Path-scoped store for the two calibration anchors
pub trait AnchorStore {
    fn write(&self, dir: &Path, anchors: Anchors) -> Result<(), AnchorError>;
    fn read(&self, dir: &Path) -> Result<Anchors, AnchorError>;
}

/// Text file store, one file per anchor directory
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAnchorStore;

impl FileAnchorStore {
    pub fn new() -> Self {
        Self
    }

    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(ANCHOR_FILE_NAME)
    }

    /// Render anchors in the on-disk layout.
    pub fn encode(anchors: Anchors) -> String {
        let body = format!(
            "# simulated clock anchors\n{}={}\n{}={}\n",
            START_KEY, anchors.start_load, LAST_KEY, anchors.last_load
        );
        let crc = crc32fast::hash(body.as_bytes());
        format!("{}{}={:08x}\n", body, CHECKSUM_KEY, crc)
    }

    /// Parse the on-disk layout; `path` is only used in error messages.
    pub fn decode(path: &Path, text: &str) -> Result<Anchors, AnchorError> {
        let marker = format!("\n{}=", CHECKSUM_KEY);
        let split = text.rfind(&marker).ok_or_else(|| AnchorError::MissingField {
            path: path.to_path_buf(),
            field: CHECKSUM_KEY,
        })?;

        let (body, trailer) = text.split_at(split + 1);
        let raw_crc = trailer[CHECKSUM_KEY.len() + 1..].trim();
        let expected =
            u32::from_str_radix(raw_crc, 16).map_err(|_| AnchorError::InvalidValue {
                path: path.to_path_buf(),
                field: CHECKSUM_KEY,
                value: raw_crc.to_string(),
            })?;
        let actual = crc32fast::hash(body.as_bytes());
        if actual != expected {
            return Err(AnchorError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }

        let mut start_load = None;
        let mut last_load = None;
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                START_KEY => start_load = Some(parse_field(path, START_KEY, value)?),
                LAST_KEY => last_load = Some(parse_field(path, LAST_KEY, value)?),
                _ => {}
            }
        }

        Ok(Anchors {
            start_load: start_load.ok_or_else(|| AnchorError::MissingField {
                path: path.to_path_buf(),
                field: START_KEY,
            })?,
            last_load: last_load.ok_or_else(|| AnchorError::MissingField {
                path: path.to_path_buf(),
                field: LAST_KEY,
            })?,
        })
    }
}

fn parse_field(path: &Path, field: &'static str, value: &str) -> Result<i64, AnchorError> {
    value.trim().parse().map_err(|_| AnchorError::InvalidValue {
        path: path.to_path_buf(),
        field,
        value: value.trim().to_string(),
    })
}

impl AnchorStore for FileAnchorStore {
    fn write(&self, dir: &Path, anchors: Anchors) -> Result<(), AnchorError> {
        let path = Self::file_path(dir);
        fs::write(&path, Self::encode(anchors)).map_err(|source| AnchorError::Io {
            path: path.clone(),
            source,
        })?;
        log::info!(
            "wrote anchors {}..{} to {}",
            anchors.start_load,
            anchors.last_load,
            path.display()
        );
        Ok(())
    }

    fn read(&self, dir: &Path) -> Result<Anchors, AnchorError> {
        let path = Self::file_path(dir);
        let text = fs::read_to_string(&path).map_err(|source| AnchorError::Io {
            path: path.clone(),
            source,
        })?;
        Self::decode(&path, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DensityParameters, SimulatedClock};

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAnchorStore::new();
        let anchors = Anchors {
            start_load: 1_700_000_000_000,
            last_load: 1_700_000_360_000,
        };

        store.write(dir.path(), anchors).unwrap();
        assert_eq!(store.read(dir.path()).unwrap(), anchors);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileAnchorStore::new().read(dir.path()).unwrap_err();
        assert!(matches!(err, AnchorError::Io { .. }));
    }

    #[test]
    fn test_tampered_value_fails_checksum() {
        let text = FileAnchorStore::encode(Anchors {
            start_load: 10,
            last_load: 20,
        });
        let tampered = text.replace("lastLoadTimestamp=20", "lastLoadTimestamp=21");
        let err = FileAnchorStore::decode(Path::new("x"), &tampered).unwrap_err();
        assert!(matches!(err, AnchorError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_missing_checksum_is_error() {
        let text = "startLoadTimestamp=1\nlastLoadTimestamp=2\n";
        let err = FileAnchorStore::decode(Path::new("x"), text).unwrap_err();
        assert!(matches!(
            err,
            AnchorError::MissingField {
                field: CHECKSUM_KEY,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_field_detected() {
        let body = "# anchors\nstartLoadTimestamp=1\n";
        let text = format!("{}checksum={:08x}\n", body, crc32fast::hash(body.as_bytes()));
        let err = FileAnchorStore::decode(Path::new("x"), &text).unwrap_err();
        assert!(matches!(
            err,
            AnchorError::MissingField { field: LAST_KEY, .. }
        ));
    }

    #[test]
    fn test_unparsable_value_detected() {
        let body = "# anchors\nstartLoadTimestamp=abc\nlastLoadTimestamp=2\n";
        let text = format!("{}checksum={:08x}\n", body, crc32fast::hash(body.as_bytes()));
        let err = FileAnchorStore::decode(Path::new("x"), &text).unwrap_err();
        assert!(matches!(
            err,
            AnchorError::InvalidValue { field: START_KEY, .. }
        ));
    }

    #[test]
    fn test_population_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAnchorStore::new();
        let params = DensityParameters::new(50.0).unwrap();

        let loader = SimulatedClock::populating_from(&params, 1, 1_000);
        for _ in 0..100 {
            loader.tick();
        }
        store.write(dir.path(), loader.population_anchors()).unwrap();

        let runner =
            SimulatedClock::resume_from_store(&params, 1, true, &store, dir.path()).unwrap();
        assert_eq!(runner.populate_start_timestamp(), 1_000);
        assert_eq!(runner.start_timestamp(), loader.current_value());
        assert_eq!(runner.current_value(), loader.current_value());
    }
}
