//! utils/atomic.rs
//!
//! Crash-safe file primitives shared by the log, init and audit writers.
//! - `write_atomic`: write a sibling `.tmp`, fsync, then rename over the target.
//! - `append_lines`: append whole lines, repairing a torn tail first.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Atomically replace `path` with `bytes`.
/// Readers see either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create_dir_all({:?})", parent))?;
    }
    let tmp = tmp_path(path);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .with_context(|| format!("open temp file {:?}", tmp))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))?;
    Ok(())
}

/// Append each entry of `lines` as its own `\n`-terminated line and fsync.
///
/// If the file does not currently end in a newline (a previous writer died
/// mid-line), a newline is written first so the torn fragment stays on its
/// own line and cannot swallow the records appended now.
pub fn append_lines(path: &Path, lines: &[Vec<u8>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create_dir_all({:?})", parent))?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open for append {:?}", path))?;

    if has_torn_tail(&mut f)? {
        f.write_all(b"\n")?;
    }
    for line in lines {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        // one write per record keeps each line an independent unit
        f.write_all(&buf)?;
    }
    f.sync_data()
        .with_context(|| format!("fsync {:?}", path))?;
    Ok(())
}

fn has_torn_tail(f: &mut File) -> Result<bool> {
    let len = f.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    f.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
