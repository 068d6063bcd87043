//! Directory/file scanner.
//!
//! Matches a root against a primary glob, resolves secondary patterns
//! per match, and yields per-match file sets with required/optional
//! semantics. The scan call itself fails only for a malformed or
//! zero-match primary pattern; everything per-match is recorded as a
//! skip reason or warning instead.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SubmitError};
use crate::events::{Event, EventBus};

/// A secondary pattern resolved per primary match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryPattern {
    /// Wildcard (`*.mesh`) or literal (`settings.cfg`) pattern,
    /// resolved relative to the primary file's directory. Parent
    /// segments (`../common/run.cfg`) are allowed.
    pub pattern: String,

    /// Required patterns skip the whole match when the file is absent;
    /// optional ones only warn.
    pub required: bool,
}

impl SecondaryPattern {
    pub fn required(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            required: true,
        }
    }

    pub fn optional(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            required: false,
        }
    }
}

/// Inputs to one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Root directory the primary pattern is expanded under.
    pub root: PathBuf,

    /// Primary glob, relative to the root (e.g. `Run_*/model.inp`).
    pub primary: String,

    /// Secondary patterns resolved per match.
    pub secondary: Vec<SecondaryPattern>,

    /// Include filters on the primary file name (empty = include all).
    pub include: Vec<String>,

    /// Exclude filters on the primary file name.
    pub exclude: Vec<String>,
}

/// One successful primary match with its resolved file set.
#[derive(Debug, Clone)]
pub struct ScanMatch {
    /// The primary file itself.
    pub primary_path: PathBuf,

    /// Directory containing the primary file.
    pub directory: PathBuf,

    /// Primary file name without extension.
    pub stem: String,

    /// Ordered input files: the primary first, then resolved
    /// secondaries.
    pub input_files: Vec<PathBuf>,

    /// Warnings recorded for this match (missing optional files).
    pub warnings: Vec<String>,
}

/// A primary match skipped because a required secondary was absent.
#[derive(Debug, Clone)]
pub struct SkippedMatch {
    pub primary_path: PathBuf,
    pub reason: String,
}

/// Scan result: matches, skips, warnings and totals.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub matches: Vec<ScanMatch>,
    pub skipped: Vec<SkippedMatch>,
    pub warnings: Vec<String>,

    /// Primary files found (after include/exclude filtering). Always
    /// equals `matches.len() + skipped.len()`.
    pub files_found: usize,
}

impl ScanOutcome {
    /// Matches passing all requirements.
    pub fn matched(&self) -> usize {
        self.matches.len()
    }
}

/// Expand the primary pattern and resolve secondaries for each match.
pub fn scan(request: &ScanRequest) -> Result<ScanOutcome> {
    scan_inner(request, None)
}

/// Like [`scan`], but run on a blocking thread under a timeout so one
/// hung mount cannot stall the caller, publishing `ScanProgress` events
/// as matches are processed.
pub async fn scan_with_timeout(
    request: ScanRequest,
    timeout: Duration,
    bus: Option<Arc<EventBus>>,
) -> Result<ScanOutcome> {
    let handle =
        tokio::task::spawn_blocking(move || scan_inner(&request, bus.as_deref()));

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SubmitError::Scan(format!("scan task failed: {}", join_err))),
        Err(_) => Err(SubmitError::timeout("directory scan")),
    }
}

fn scan_inner(request: &ScanRequest, bus: Option<&EventBus>) -> Result<ScanOutcome> {
    let pattern = request.root.join(&request.primary);
    let pattern_str = pattern
        .to_str()
        .ok_or_else(|| SubmitError::Scan(format!("non-UTF8 scan pattern: {:?}", pattern)))?;

    let entries = glob::glob(pattern_str)
        .map_err(|e| SubmitError::Scan(format!("malformed primary pattern '{}': {}", request.primary, e)))?;

    let include = compile_filters(&request.include)?;
    let exclude = compile_filters(&request.exclude)?;

    let mut primaries: Vec<PathBuf> = Vec::new();
    let mut scanned = 0usize;
    for entry in entries {
        scanned += 1;
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("unreadable path during scan: {}", e);
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        if !passes_filters(&path, &include, &exclude) {
            debug!("filtered out primary match {:?}", path);
            continue;
        }
        primaries.push(path);
    }
    primaries.sort();

    if primaries.is_empty() {
        return Err(SubmitError::Scan(format!(
            "no files match primary pattern '{}' under {:?}",
            request.primary, request.root
        )));
    }

    let mut outcome = ScanOutcome {
        files_found: primaries.len(),
        ..Default::default()
    };

    for primary_path in primaries {
        if let Some(bus) = bus {
            bus.publish(Event::ScanProgress {
                at: chrono::Utc::now(),
                scanned,
                matched: outcome.matches.len(),
                current: Some(primary_path.display().to_string()),
            });
        }

        let directory = primary_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| request.root.clone());
        let stem = primary_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut input_files = vec![primary_path.clone()];
        let mut match_warnings = Vec::new();
        let mut skip_reason = None;

        for secondary in &request.secondary {
            let resolved = resolve_secondary(&directory, &stem, &secondary.pattern);
            if resolved.is_file() {
                input_files.push(resolved);
            } else if secondary.required {
                skip_reason = Some(format!(
                    "required file {} not found for {}",
                    resolved.display(),
                    primary_path.display()
                ));
                break;
            } else {
                let message = format!(
                    "optional file {} not found for {}",
                    resolved.display(),
                    primary_path.display()
                );
                warn!("{}", message);
                match_warnings.push(message.clone());
                outcome.warnings.push(message);
            }
        }

        match skip_reason {
            Some(reason) => {
                debug!("skipping {:?}: {}", primary_path, reason);
                outcome.skipped.push(SkippedMatch {
                    primary_path,
                    reason,
                });
            }
            None => outcome.matches.push(ScanMatch {
                primary_path,
                directory,
                stem,
                input_files,
                warnings: match_warnings,
            }),
        }
    }

    if let Some(bus) = bus {
        bus.publish(Event::ScanProgress {
            at: chrono::Utc::now(),
            scanned,
            matched: outcome.matches.len(),
            current: None,
        });
    }

    Ok(outcome)
}

/// Resolve one secondary pattern against a match's directory and stem.
///
/// A wildcard pattern has its `*` replaced with the primary's stem;
/// anything else is taken literally. The result is joined to the
/// primary's directory and lexically normalized, so patterns may reach
/// sibling directories via `..`.
fn resolve_secondary(directory: &Path, stem: &str, pattern: &str) -> PathBuf {
    let name = if pattern.contains('*') {
        pattern.replace('*', stem)
    } else {
        pattern.to_string()
    };
    normalize(&directory.join(name))
}

/// Lexically normalize `.` and `..` segments without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                } else {
                    parts.push(component);
                }
            }
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

fn compile_filters(patterns: &[String]) -> Result<Vec<glob::Pattern>> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| SubmitError::Scan(format!("invalid filter pattern '{}': {}", p, e)))
        })
        .collect()
}

fn passes_filters(path: &Path, include: &[glob::Pattern], exclude: &[glob::Pattern]) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    if !include.is_empty() && !include.iter().any(|p| p.matches(name)) {
        return false;
    }
    !exclude.iter().any(|p| p.matches(name))
}
