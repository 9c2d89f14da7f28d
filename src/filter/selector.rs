//! Filter file auto-selection.
//!
//! Filters follow the naming convention
//! `filter_<family>k_<ratio>x_<taps>_<phase>_phase.json`, e.g.
//! `filter_44k_2x_80000_min_phase.json`. The literal tap token `2m`
//! stands for 640000 taps.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, UpsamplerError};

const TWO_M_TAPS: u64 = 640_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseType {
    Minimum,
    Linear,
}

impl PhaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseType::Minimum => "min",
            PhaseType::Linear => "linear",
        }
    }
}

impl FromStr for PhaseType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "min" | "minimum" => Ok(PhaseType::Minimum),
            "linear" => Ok(PhaseType::Linear),
            other => Err(format!("invalid phase type: {}", other)),
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Family number used in filenames: 44 or 48.
pub fn family_token(input_rate: u32) -> Result<u32> {
    if input_rate == 0 {
        return Err(UpsamplerError::Negotiation(
            "input rate is zero".to_string(),
        ));
    }
    if input_rate % 44_100 == 0 {
        Ok(44)
    } else if input_rate % 48_000 == 0 {
        Ok(48)
    } else {
        Err(UpsamplerError::Negotiation(format!(
            "unsupported input rate family: {}",
            input_rate
        )))
    }
}

/// "min" -> "min_phase", "linear" -> "linear_phase", anything else verbatim.
pub fn phase_suffix(phase: &str) -> String {
    match phase {
        "min" => "min_phase".to_string(),
        "linear" => "linear_phase".to_string(),
        other => other.to_string(),
    }
}

fn parse_tap_token(token: &str) -> Option<u64> {
    if token == "2m" {
        return Some(TWO_M_TAPS);
    }
    match token.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(taps) => Some(taps),
    }
}

/// Resolves which filter sidecar to load.
///
/// An explicit path wins and must exist. Without one, `dir` is scanned for
/// files matching family/ratio/phase and the highest tap count is returned.
/// `Ok(None)` means no explicit path and no directory: run unfiltered.
pub fn resolve_filter_path(
    explicit: Option<&Path>,
    dir: Option<&Path>,
    phase: &str,
    ratio: u32,
    input_rate: u32,
) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(UpsamplerError::FilterNotFound(format!(
                "filter file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let dir = match dir {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => return Ok(None),
    };

    let family = family_token(input_rate)?;
    let prefix = format!("filter_{}k_{}x_", family, ratio);
    let suffix = format!("_{}.json", phase_suffix(phase));

    let entries = fs::read_dir(dir).map_err(|e| UpsamplerError::io(dir, e))?;
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.len() <= prefix.len() + suffix.len() {
            continue;
        }
        let Some(token) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
        else {
            continue;
        };
        let Some(taps) = parse_tap_token(token) else {
            continue;
        };
        if best.as_ref().is_none_or(|(best_taps, _)| taps > *best_taps) {
            best = Some((taps, entry.path()));
        }
    }

    match best {
        Some((taps, path)) => {
            log::info!("Selected filter {} ({} taps)", path.display(), taps);
            Ok(Some(path))
        }
        None => Err(UpsamplerError::FilterNotFound(format!(
            "{}/{}*{}",
            dir.display(),
            prefix,
            suffix
        ))),
    }
}
