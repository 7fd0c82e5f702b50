//! Spot-check verification of migrated files.
//!
//! Only the files sampled at assessment time are checked. A passing result
//! means the sample matched, not that every file in the tree did.

use crate::model::FileIntegritySample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const READ_CHUNK: usize = 64 * 1024;

/// Result of checking a sample set against a target tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub samples_checked: usize,
    pub errors: Vec<String>,
}

/// SHA-256 of a file's contents as lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Where a sampled source file should live on the target.
pub fn target_path_for(sample: &FileIntegritySample, source_root: &Path, target_root: &Path) -> PathBuf {
    match sample.path.strip_prefix(source_root) {
        Ok(relative) => target_root.join(relative),
        Err(_) => target_root.join(sample.path.strip_prefix("/").unwrap_or(&sample.path)),
    }
}

/// Check every sample against its copy under `target_root`.
///
/// Missing files, size mismatches and checksum mismatches are errors.
/// Samples recorded without a checksum (large files) fall back to comparing
/// modification time at one-second resolution. Reads only; calling this twice
/// on an unchanged target gives the same outcome.
pub fn verify_samples(
    source_root: &Path,
    target_root: &Path,
    samples: &[FileIntegritySample],
) -> VerificationOutcome {
    let mut errors = Vec::new();

    for sample in samples {
        let target = target_path_for(sample, source_root, target_root);
        if let Some(error) = check_sample(sample, &target) {
            errors.push(error);
        }
    }

    VerificationOutcome {
        passed: errors.is_empty(),
        samples_checked: samples.len(),
        errors,
    }
}

fn check_sample(sample: &FileIntegritySample, target: &Path) -> Option<String> {
    let metadata = match std::fs::metadata(target) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Some(format!("{}: not a regular file on target", target.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Some(format!("{}: missing on target", target.display()))
        }
        Err(e) => return Some(format!("{}: cannot read metadata: {}", target.display(), e)),
    };

    if metadata.len() != sample.size {
        return Some(format!(
            "{}: size mismatch (expected {}, found {})",
            target.display(),
            sample.size,
            metadata.len()
        ));
    }

    if sample.has_checksum() {
        return match sha256_file(target) {
            Ok(actual) if actual == sample.checksum => None,
            Ok(_) => Some(format!("{}: checksum mismatch", target.display())),
            Err(e) => Some(format!("{}: cannot read contents: {}", target.display(), e)),
        };
    }

    match metadata.modified() {
        Ok(modified) => {
            let modified: DateTime<Utc> = modified.into();
            if modified.timestamp() != sample.modified.timestamp() {
                Some(format!(
                    "{}: modification time changed ({} vs {})",
                    target.display(),
                    sample.modified.to_rfc3339(),
                    modified.to_rfc3339()
                ))
            } else {
                None
            }
        }
        Err(e) => Some(format!("{}: cannot read modification time: {}", target.display(), e)),
    }
}
