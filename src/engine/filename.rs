//! Database file naming.
//!
//! Everything under the database directory follows a fixed scheme:
//!
//! | File            | Pattern            |
//! |-----------------|--------------------|
//! | Write-ahead log | `<n>.log`          |
//! | Table file      | `<n>.ldb` (legacy `<n>.sst` accepted) |
//! | Descriptor      | `MANIFEST-<n>`     |
//! | Current pointer | `CURRENT`          |
//! | Lock file       | `LOCK`             |
//! | Scratch         | `<n>.dbtmp`        |
//!
//! Numbers are zero-padded to six digits and allocated from the version
//! set's single counter, so a number never refers to two live files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Kinds of files that may appear in a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log(u64),
    Table(u64),
    Manifest(u64),
    Current,
    Lock,
    Temp(u64),
}

pub fn log_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{number:06}.log"))
}

pub fn table_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{number:06}.ldb"))
}

/// Legacy table name accepted for reading.
pub fn sst_table_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{number:06}.sst"))
}

pub fn manifest_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("MANIFEST-{number:06}"))
}

pub fn current_file_name(db_path: &Path) -> PathBuf {
    db_path.join("CURRENT")
}

pub fn lock_file_name(db_path: &Path) -> PathBuf {
    db_path.join("LOCK")
}

pub fn temp_file_name(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{number:06}.dbtmp"))
}

/// Classify a directory entry by its basename.
pub fn parse_file_name(name: &str) -> Option<FileType> {
    match name {
        "CURRENT" => return Some(FileType::Current),
        "LOCK" => return Some(FileType::Lock),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(FileType::Manifest);
    }
    let (stem, extension) = name.rsplit_once('.')?;
    let number: u64 = stem.parse().ok()?;
    match extension {
        "log" => Some(FileType::Log(number)),
        "ldb" | "sst" => Some(FileType::Table(number)),
        "dbtmp" => Some(FileType::Temp(number)),
        _ => None,
    }
}

/// Point `CURRENT` at `MANIFEST-<number>` crash-safely: write the new
/// contents to a scratch file, sync it, then rename over `CURRENT`.
pub fn set_current_file(db_path: &Path, manifest_number: u64) -> io::Result<()> {
    let contents = format!("MANIFEST-{manifest_number:06}\n");
    let tmp = temp_file_name(db_path, manifest_number);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    match fs::rename(&tmp, current_file_name(db_path)) {
        Ok(()) => Ok(()),
        Err(err) => {
            // Best effort: don't leave the scratch file behind.
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}

/// Read `CURRENT` and return the active manifest's basename.
pub fn read_current_file(db_path: &Path) -> io::Result<String> {
    let contents = fs::read_to_string(current_file_name(db_path))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || contents == name {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "CURRENT file is malformed",
        ));
    }
    Ok(name.to_string())
}

/// Open a table file for reading, preferring `.ldb` and falling back to
/// the legacy `.sst` name.
pub fn open_table_file(db_path: &Path, number: u64) -> io::Result<File> {
    match File::open(table_file_name(db_path, number)) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            File::open(sst_table_file_name(db_path, number))
        }
        Err(err) => Err(err),
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
