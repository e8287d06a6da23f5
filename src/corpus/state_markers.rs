//! On-disk state markers under `<out>/queue/.state/`.
//!
//! Grounded in `mark_as_det_done`/`mark_as_variable`/`mark_as_redundant` in
//! `afl-fuzz-queue.c`: three sibling directories, each holding one
//! zero-byte file (a symlink for `variable_behavior`, falling back to a
//! plain file when the platform or filesystem won't symlink) per seed
//! whose flag is currently set. Creation and removal are kept atomic with
//! the in-memory flag they mirror — the flag only flips after the
//! filesystem operation succeeds, and I/O failure here is fatal rather
//! than logged and ignored, since a marker that silently fails to persist
//! would make a resumed run repeat work or lose the redundant-edges
//! annotation.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::corpus::queue::SeedRecord;
use crate::error::Error;
use crate::fatal;

fn base_name(file_name: &Path) -> &std::ffi::OsStr {
    file_name
        .file_name()
        .expect("seed file name has a base component")
}

fn marker_path(queue_dir: &Path, subdir: &str, file_name: &Path) -> PathBuf {
    queue_dir.join(".state").join(subdir).join(base_name(file_name))
}

fn create_marker_file(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::QueueStateIo(format!("mkdir {}", parent.display()), e))?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::QueueStateIo(format!("create {}", path.display()), e)),
    }
}

fn remove_marker_file(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::QueueStateIo(format!("remove {}", path.display()), e)),
    }
}

#[cfg(unix)]
fn create_variable_marker(path: &Path, base: &std::ffi::OsStr) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::QueueStateIo(format!("mkdir {}", parent.display()), e))?;
    }
    let target = Path::new("../..").join(base);
    match std::os::unix::fs::symlink(&target, path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(_) => create_marker_file(path),
    }
}

#[cfg(not(unix))]
fn create_variable_marker(path: &Path, _base: &std::ffi::OsStr) -> Result<(), Error> {
    create_marker_file(path)
}

/// Marks `seed` as having completed deterministic fuzzing, creating
/// `deterministic_done/<base name>` the first time. A no-op if already
/// marked. Aborts the process on I/O failure.
pub fn mark_det_done(queue_dir: &Path, seed: &mut SeedRecord) {
    if seed.passed_det {
        return;
    }
    let path = marker_path(queue_dir, "deterministic_done", &seed.file_name);
    if let Err(e) = create_marker_file(&path) {
        fatal!("{e}");
    }
    seed.passed_det = true;
}

/// Marks `seed` as exhibiting variable behavior, creating
/// `variable_behavior/<base name>` (a symlink back to the seed file where
/// the platform supports it) the first time. A no-op if already marked.
/// Aborts the process on I/O failure.
pub fn mark_variable(queue_dir: &Path, seed: &mut SeedRecord) {
    if seed.variable_behavior {
        return;
    }
    let base = base_name(&seed.file_name).to_os_string();
    let path = marker_path(queue_dir, "variable_behavior", &seed.file_name);
    if let Err(e) = create_variable_marker(&path, &base) {
        fatal!("{e}");
    }
    seed.variable_behavior = true;
}

/// Sets `seed.fs_redundant` to `state`, creating or removing
/// `redundant_edges/<base name>` to match. A no-op if the flag already
/// matches `state`. Aborts the process on I/O failure.
pub fn mark_redundant(queue_dir: &Path, seed: &mut SeedRecord, state: bool) {
    if seed.fs_redundant == state {
        return;
    }
    let path = marker_path(queue_dir, "redundant_edges", &seed.file_name);
    let result = if state {
        create_marker_file(&path)
    } else {
        remove_marker_file(&path)
    };
    if let Err(e) = result {
        fatal!("{e}");
    }
    seed.fs_redundant = state;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn seed(name: &str) -> SeedRecord {
        SeedRecord::new(PathBuf::from(name), 10, 0, None)
    }

    #[test]
    fn det_done_creates_marker_once_and_sets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = seed("id:000000");
        mark_det_done(dir.path(), &mut s);
        assert!(s.passed_det);
        assert!(dir.path().join(".state/deterministic_done/id:000000").exists());
        // Calling again must not error even though the file already exists.
        mark_det_done(dir.path(), &mut s);
    }

    #[test]
    fn redundant_marker_created_and_removed_with_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = seed("id:000001");
        let marker = dir.path().join(".state/redundant_edges/id:000001");

        mark_redundant(dir.path(), &mut s, true);
        assert!(s.fs_redundant);
        assert!(marker.exists());

        mark_redundant(dir.path(), &mut s, false);
        assert!(!s.fs_redundant);
        assert!(!marker.exists());
    }

    #[test]
    fn variable_marker_targets_the_seed_file_one_level_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = seed("id:000002");
        mark_variable(dir.path(), &mut s);
        assert!(s.variable_behavior);
        let marker = dir.path().join(".state/variable_behavior/id:000002");
        assert!(marker.exists() || marker.symlink_metadata().is_ok());
    }
}
