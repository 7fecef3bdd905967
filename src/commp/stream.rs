//! Commitment calculation through the external `stream-commp` helper

use super::{convert::piece_cid_v2_from_v1, CommitmentCalculator, PieceCidInfo};
use crate::config::{ClientConfig, COMMP_HELPER_ENV};
use crate::error::{Result, StorageError};
use log::debug;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Name searched for on `PATH` when no explicit helper is configured
pub const HELPER_BINARY: &str = "stream-commp";

/// Runs the helper once per payload, feeding it on stdin
#[derive(Debug, Clone, Default)]
pub struct StreamCommp {
    helper: Option<PathBuf>,
}

impl StreamCommp {
    /// Resolve the helper from the config, then `PDP_STORAGE_COMMP_HELPER`, then `PATH`
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            helper: config.commp_helper.clone(),
        }
    }

    pub fn with_helper(path: impl Into<PathBuf>) -> Self {
        Self {
            helper: Some(path.into()),
        }
    }

    /// Locate the helper binary
    pub fn resolve_helper(&self) -> Result<PathBuf> {
        if let Some(path) = &self.helper {
            return Ok(path.clone());
        }

        if let Some(path) = std::env::var_os(COMMP_HELPER_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }

        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(HELPER_BINARY))
                    .find(|candidate| candidate.is_file())
            })
            .ok_or_else(|| {
                StorageError::commitment(format!(
                    "{} not found; install it or set {}",
                    HELPER_BINARY, COMMP_HELPER_ENV
                ))
            })
    }

    fn run(&self, helper: &Path, data: &[u8]) -> Result<String> {
        debug!("Computing commitment for {} bytes with {}", data.len(), helper.display());

        let mut child = Command::new(helper)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                StorageError::commitment(format!("failed to start {}: {}", helper.display(), e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StorageError::commitment("helper stdin is not available"))?;

        // stdout and stderr are drained while the payload is still being written
        let (written, output) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(data));
            let output = child.wait_with_output();
            (writer.join(), output)
        });
        let output = output?;
        let mut report = String::from_utf8_lossy(&output.stderr).into_owned();
        report.push('\n');
        report.push_str(&String::from_utf8_lossy(&output.stdout));

        if !output.status.success() {
            return Err(StorageError::commitment(format!(
                "{} exited with {}: {}",
                helper.display(),
                output.status,
                report.trim()
            )));
        }
        match written {
            Ok(Ok(())) => Ok(report),
            Ok(Err(e)) => Err(StorageError::commitment(format!(
                "failed to stream payload to helper: {}",
                e
            ))),
            Err(_) => Err(StorageError::commitment("payload writer panicked")),
        }
    }
}

impl CommitmentCalculator for StreamCommp {
    fn compute(&self, data: &[u8]) -> Result<PieceCidInfo> {
        let helper = self.resolve_helper()?;
        let report = self.run(&helper, data)?;
        let parsed = HelperReport::parse(&report)?;

        if parsed.payload_size != data.len() as u64 {
            return Err(StorageError::commitment(format!(
                "helper reported {} payload bytes, sent {}",
                parsed.payload_size,
                data.len()
            )));
        }

        let piece_cid =
            piece_cid_v2_from_v1(&parsed.legacy_cid, parsed.payload_size, parsed.padded_size)?;

        Ok(PieceCidInfo {
            piece_cid,
            piece_cid_v1: Some(parsed.legacy_cid),
            payload_size: parsed.payload_size,
            unpadded_piece_size: parsed.unpadded_size,
            padded_piece_size: parsed.padded_size,
        })
    }
}

/// Values printed by the helper as `Label: value` lines
#[derive(Debug, PartialEq, Eq)]
struct HelperReport {
    legacy_cid: String,
    payload_size: u64,
    unpadded_size: u64,
    padded_size: u64,
}

impl HelperReport {
    fn parse(report: &str) -> Result<Self> {
        let mut legacy_cid = None;
        let mut payload_size = None;
        let mut unpadded_size = None;
        let mut padded_size = None;

        for line in report.lines() {
            let Some((label, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match label.trim() {
                "CommPCid" => legacy_cid = Some(value.to_string()),
                "Payload" => payload_size = leading_number(value),
                "Unpadded piece" => unpadded_size = leading_number(value),
                "Padded piece" => padded_size = leading_number(value),
                _ => {}
            }
        }

        let missing = |field: &str| {
            StorageError::commitment(format!("helper output is missing {}", field))
        };
        Ok(Self {
            legacy_cid: legacy_cid.ok_or_else(|| missing("CommPCid"))?,
            payload_size: payload_size.ok_or_else(|| missing("Payload"))?,
            unpadded_size: unpadded_size.ok_or_else(|| missing("Unpadded piece"))?,
            padded_size: padded_size.ok_or_else(|| missing("Padded piece"))?,
        })
    }
}

fn leading_number(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}
