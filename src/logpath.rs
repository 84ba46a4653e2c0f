use std::{
    fs, io,
    path::{MAIN_SEPARATOR, Path, PathBuf},
    sync::OnceLock,
};

use chrono::{DateTime, Utc};
use hyper::Uri;
use regex::Regex;

use crate::error::{Error, Result};

const LOG_EXTENSION: &str = "jsonl";

fn sequence_prefix_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(\d{3})_").expect("sequence prefix regex should compile"))
}

/// Path to record into. Directory-like paths are created and get a fresh
/// numbered file name; anything else is returned unchanged.
pub fn resolve_record_path(
    path: &Path,
    listen_addr: &str,
    target: Option<&Uri>,
) -> Result<PathBuf> {
    if !is_dir_path(path) {
        return Ok(path.to_path_buf());
    }
    fs::create_dir_all(path)?;
    let sequence = next_sequence(path)?;
    let name = log_filename(sequence, Utc::now(), listen_addr, target);
    tracing::debug!(dir = %path.display(), %name, "allocated new log file");
    Ok(path.join(name))
}

/// Path to replay from. Directory-like paths resolve to their highest
/// numbered log file.
pub fn resolve_replay_path(path: &Path) -> Result<PathBuf> {
    if !is_dir_path(path) {
        return Ok(path.to_path_buf());
    }
    Ok(path.join(latest_log_file(path)?))
}

/// One past the highest sequence prefix in `dir`, or 1 when there is none.
pub fn next_sequence(dir: &Path) -> Result<u32> {
    let highest = numbered_files(dir)?
        .into_iter()
        .map(|(sequence, _)| sequence)
        .max()
        .unwrap_or(0);
    Ok(highest + 1)
}

/// File name in `dir` carrying the highest sequence prefix.
pub fn latest_log_file(dir: &Path) -> Result<String> {
    numbered_files(dir)?
        .into_iter()
        .max_by_key(|(sequence, _)| *sequence)
        .map(|(_, name)| name)
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no log files found in {}", dir.display()),
            ))
        })
}

/// Lower-cases `value` and collapses every run of non-alphanumeric characters
/// into a single `-`, trimming them from both ends.
pub fn sanitize_filename_part(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_dash = false;
    for ch in value.trim().to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_owned()
}

fn log_filename(
    sequence: u32,
    now: DateTime<Utc>,
    listen_addr: &str,
    target: Option<&Uri>,
) -> String {
    let stamp = now.format("%Y%m%dT%H%M%SZ");
    let listen = sanitize_filename_part(listen_addr);
    let target = target.map(target_label).unwrap_or_default();
    if target.is_empty() {
        format!("{sequence:03}_{stamp}_listen-{listen}.{LOG_EXTENSION}")
    } else {
        format!("{sequence:03}_{stamp}_listen-{listen}_target-{target}.{LOG_EXTENSION}")
    }
}

fn target_label(target: &Uri) -> String {
    let host = match (target.host(), target.port_u16()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    };
    let label = sanitize_filename_part(&host);
    if label.is_empty() {
        sanitize_filename_part(&target.to_string())
    } else {
        label
    }
}

fn is_dir_path(path: &Path) -> bool {
    if path.as_os_str().to_string_lossy().ends_with(MAIN_SEPARATOR) {
        return true;
    }
    if path.is_dir() {
        return true;
    }
    path.extension().is_none()
}

fn numbered_files(dir: &Path) -> Result<Vec<(u32, String)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(sequence) = sequence_prefix_regex()
            .captures(&name)
            .and_then(|captures| captures[1].parse::<u32>().ok())
        else {
            continue;
        };
        files.push((sequence, name));
    }
    Ok(files)
}
