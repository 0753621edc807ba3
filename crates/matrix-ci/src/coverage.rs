//! Coverage aggregation: union of covered lines across per-category test runs.
//!
//! Accepted inputs:
//! - JSON `{"files": {"<path>": [1, 2, 5]}}`, or coverage.py's
//!   `{"files": {"<path>": {"executed_lines": [...]}}}`
//! - LCOV tracefiles (`.info` / `.lcov`): `SF:` records with `DA:<line>,<hits>`
//!
//! The merged report is always written as the JSON form.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::obs;

/// Errors reading or writing a coverage artifact.
#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("coverage file {path} is missing")]
    Missing { path: PathBuf },

    #[error("failed to access coverage file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("coverage file {path} is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },
}

/// Covered line numbers per source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub files: BTreeMap<String, BTreeSet<u32>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileLines {
    Lines(Vec<u32>),
    Detailed { executed_lines: Vec<u32> },
}

#[derive(Deserialize)]
struct RawReport {
    files: BTreeMap<String, FileLines>,
}

impl CoverageReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `lines` of `file` as covered.
    pub fn add(&mut self, file: impl Into<String>, lines: impl IntoIterator<Item = u32>) {
        self.files.entry(file.into()).or_default().extend(lines);
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: CoverageReport) {
        for (file, lines) in other.files {
            self.files.entry(file).or_default().extend(lines);
        }
    }

    pub fn is_covered(&self, file: &str, line: u32) -> bool {
        self.files.get(file).is_some_and(|l| l.contains(&line))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn line_count(&self) -> usize {
        self.files.values().map(BTreeSet::len).sum()
    }

    pub fn from_json(text: &str) -> Result<Self, String> {
        let raw: RawReport = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let mut report = Self::new();
        for (file, lines) in raw.files {
            let lines = match lines {
                FileLines::Lines(lines) => lines,
                FileLines::Detailed { executed_lines } => executed_lines,
            };
            report.add(file, lines);
        }
        Ok(report)
    }

    /// Lines with a non-zero hit count are covered.
    pub fn from_lcov(text: &str) -> Result<Self, String> {
        let mut report = Self::new();
        let mut current: Option<String> = None;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if let Some(file) = line.strip_prefix("SF:") {
                current = Some(file.to_string());
                report.files.entry(file.to_string()).or_default();
            } else if let Some(data) = line.strip_prefix("DA:") {
                let file = current
                    .as_ref()
                    .ok_or_else(|| format!("line {}: DA record outside SF block", idx + 1))?;
                let mut fields = data.split(',');
                let number = fields.next().and_then(|n| n.trim().parse::<u32>().ok());
                let hits = fields.next().and_then(|h| h.trim().parse::<u64>().ok());
                match (number, hits) {
                    (Some(number), Some(hits)) => {
                        if hits > 0 {
                            report.add(file.clone(), [number]);
                        }
                    }
                    _ => return Err(format!("line {}: bad DA record '{line}'", idx + 1)),
                }
            } else if line == "end_of_record" {
                current = None;
            }
        }
        Ok(report)
    }

    /// Read a coverage artifact; the format follows the file extension.
    pub fn load(path: &Path) -> Result<Self, CoverageError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoverageError::Missing {
                    path: path.to_path_buf(),
                }
            } else {
                CoverageError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let lcov = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("info") | Some("lcov")
        );
        let parsed = if lcov {
            Self::from_lcov(&text)
        } else {
            Self::from_json(&text)
        };
        parsed.map_err(|detail| CoverageError::Malformed {
            path: path.to_path_buf(),
            detail,
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), CoverageError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| CoverageError::Malformed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        std::fs::write(path, json).map_err(|e| CoverageError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// What went into a merged report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub output: PathBuf,
    pub inputs_merged: usize,
    pub inputs_skipped: usize,
    pub files: usize,
    pub lines: usize,
}

/// Merges per-category coverage artifacts into one report per job.
pub struct CoverageAggregator;

impl CoverageAggregator {
    /// Union every readable input into `output`.
    ///
    /// Missing or corrupt inputs are logged and skipped. Returns `None`
    /// when no input was usable, in which case nothing is written.
    pub fn aggregate(inputs: &[PathBuf], output: &Path) -> Option<CoverageSummary> {
        let mut merged = CoverageReport::new();
        let mut used = 0;
        let mut skipped = 0;

        for input in inputs {
            match CoverageReport::load(input) {
                Ok(report) => {
                    debug!(path = %input.display(), files = report.file_count(), "Loaded coverage");
                    merged.merge(report);
                    used += 1;
                }
                Err(e) => {
                    obs::coverage_skipped(input, &e.to_string());
                    skipped += 1;
                }
            }
        }

        if used == 0 {
            return None;
        }
        if let Err(e) = merged.write(output) {
            warn!(path = %output.display(), error = %e, "Failed to write merged coverage");
            return None;
        }

        Some(CoverageSummary {
            output: output.to_path_buf(),
            inputs_merged: used,
            inputs_skipped: skipped,
            files: merged.file_count(),
            lines: merged.line_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_union() {
        let mut a = CoverageReport::new();
        a.add("pkg/core.py", [1, 2, 3]);
        let mut b = CoverageReport::new();
        b.add("pkg/core.py", [3, 4]);
        b.add("pkg/io.py", [10]);

        a.merge(b);
        assert_eq!(a.line_count(), 5);
        assert!(a.is_covered("pkg/core.py", 4));
        assert!(a.is_covered("pkg/io.py", 10));
        assert!(!a.is_covered("pkg/io.py", 11));
    }

    #[test]
    fn test_json_both_shapes() {
        let plain = CoverageReport::from_json(r#"{"files": {"a.py": [3, 1, 1]}}"#).unwrap();
        assert_eq!(plain.files["a.py"], BTreeSet::from([1, 3]));

        let detailed = CoverageReport::from_json(
            r#"{"meta": {"version": "7"}, "files": {"a.py": {"executed_lines": [5], "missing_lines": [6]}}}"#,
        )
        .unwrap();
        assert!(detailed.is_covered("a.py", 5));
        assert!(!detailed.is_covered("a.py", 6));
    }

    #[test]
    fn test_lcov_counts_only_hit_lines() {
        let text = "TN:\nSF:src/lib.c\nDA:1,4\nDA:2,0\nDA:7,1\nend_of_record\nSF:src/util.c\nDA:3,2\nend_of_record\n";
        let report = CoverageReport::from_lcov(text).unwrap();
        assert_eq!(report.files["src/lib.c"], BTreeSet::from([1, 7]));
        assert!(report.is_covered("src/util.c", 3));
    }

    #[test]
    fn test_lcov_rejects_orphan_data() {
        assert!(CoverageReport::from_lcov("DA:1,1\n").is_err());
        assert!(CoverageReport::from_lcov("SF:a\nDA:x,1\n").is_err());
    }

    #[test]
    fn test_aggregate_skips_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let fast = dir.path().join("fast.json");
        let serial = dir.path().join("serial.info");
        let corrupt = dir.path().join("broken.json");
        let missing = dir.path().join("extended.json");
        std::fs::write(&fast, r#"{"files": {"m.py": [1, 2]}}"#).unwrap();
        std::fs::write(&serial, "SF:m.py\nDA:2,1\nDA:9,1\nend_of_record\n").unwrap();
        std::fs::write(&corrupt, "{not json").unwrap();

        let output = dir.path().join("merged.json");
        let summary = CoverageAggregator::aggregate(
            &[fast, missing, serial, corrupt],
            &output,
        )
        .unwrap();

        assert_eq!(summary.inputs_merged, 2);
        assert_eq!(summary.inputs_skipped, 2);
        assert_eq!(summary.lines, 3);

        let merged = CoverageReport::load(&output).unwrap();
        assert_eq!(merged.files["m.py"], BTreeSet::from([1, 2, 9]));
    }

    #[test]
    fn test_aggregate_with_nothing_usable_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("merged.json");
        assert!(CoverageAggregator::aggregate(&[dir.path().join("nope.json")], &output).is_none());
        assert!(!output.exists());
    }

    #[test]
    fn test_load_missing_is_distinct_error() {
        let err = CoverageReport::load(Path::new("/nonexistent/cov.json")).unwrap_err();
        assert!(matches!(err, CoverageError::Missing { .. }));
    }
}
