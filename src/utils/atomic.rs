//! Atomic file operations
//!
//! Slot files are replaced with the classic pattern:
//!
//! 1. Write to a temporary file (.tmp)
//! 2. Call sync_all() to flush to disk
//! 3. Rename temp file to final path (atomic on most filesystems)
//!
//! A reader therefore sees either the old slot or the new one, never a
//! partially written file.

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Atomically write content using a writer function
///
/// # Arguments
///
/// * `path` - The final destination path
/// * `write_fn` - A function that writes content to the file
///
/// # Example
///
/// ```ignore
/// atomic_write_with("slots/notes.slot", |file| {
///     file.write_all(header.as_bytes())?;
///     file.write_all(&bytes)
/// })?;
/// ```
pub fn atomic_write_with<P, F>(path: P, write_fn: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let path = path.as_ref();
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        write_fn(&mut file)?;
        file.sync_all()
    })();

    if let Err(e) = result {
        // Leave the previous file untouched
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, path)?;

    // Persist the rename itself
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Clean up any leftover temp files from interrupted operations
///
/// Call this on startup to clean up .tmp files that may have been
/// left behind from crashes.
pub fn cleanup_temp_files<P: AsRef<Path>>(dir: P) -> io::Result<usize> {
    let dir = dir.as_ref();
    let mut cleaned = 0;

    if !dir.exists() {
        return Ok(0);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().map(|e| e == "tmp").unwrap_or(false) {
            fs::remove_file(&path)?;
            cleaned += 1;
        }
    }

    Ok(cleaned)
}

/// Remove a database file together with its `-wal` and `-shm` companions
///
/// Missing files are not an error.
pub fn remove_with_sidecars<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        targets.push(name.into());
    }

    for target in targets {
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
