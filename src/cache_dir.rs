//! Process-scoped disk cache directory (§6.3).
//!
//! Holds `img-<image_id:03>-<frame_index:03>` files. Recreated on demand if
//! it vanishes out from under us (e.g. `/tmp` cleanup); removed wholesale on
//! `Drop`.

use crate::error::CoreError;
use std::fs::File;
use std::path::PathBuf;

pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    /// Create a fresh mkdtemp-style cache directory under `base` (or the
    /// system temp dir if `base` is `None`).
    pub fn new(base: Option<&std::path::Path>) -> Result<Self, CoreError> {
        let base = base.map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
        let root = mkdtemp(&base)?;
        Ok(CacheDir { root })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.root
    }

    /// Re-create the directory if it has vanished (checked before every
    /// upload per §5).
    fn ensure_exists(&self) -> Result<(), CoreError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)?;
            log::debug!("recreated cache directory at {}", self.root.display());
        }
        Ok(())
    }

    fn frame_path(&self, image_id: u32, frame_index: u32) -> PathBuf {
        self.root.join(format!("img-{:03}-{:03}", image_id, frame_index))
    }

    /// Open (creating if needed) the file backing a given frame, for writing.
    pub fn open_for_write(&self, image_id: u32, frame_index: u32) -> Result<File, CoreError> {
        self.ensure_exists()?;
        let path = self.frame_path(image_id, frame_index);
        File::create(&path).map_err(|e| CoreError::io(format!("cannot open cache file: {e}")))
    }

    pub fn open_for_read(&self, image_id: u32, frame_index: u32) -> Result<File, CoreError> {
        let path = self.frame_path(image_id, frame_index);
        File::open(&path).map_err(|e| CoreError::bad_file(format!("cannot reopen frame file: {e}")))
    }

    /// Remove the backing file for one frame (upload abort, or frame free).
    pub fn remove_frame(&self, image_id: u32, frame_index: u32) {
        let path = self.frame_path(image_id, frame_index);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::error!("failed to remove cache file {}: {e}", path.display());
            }
        }
    }
}

impl Drop for CacheDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::error!("failed to remove cache directory {}: {e}", self.root.display());
            }
        }
    }
}

/// mkdtemp-style unique directory creation under `base`.
fn mkdtemp(base: &std::path::Path) -> Result<PathBuf, CoreError> {
    use rand::Rng;

    std::fs::create_dir_all(base)?;
    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        let suffix: u64 = rng.gen();
        let candidate = base.join(format!("kitty-gfx-{:016x}", suffix));
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(CoreError::io(format!("cannot create cache directory: {e}"))),
        }
    }
    Err(CoreError::io("exhausted retries creating a unique cache directory"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn creates_and_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path;
        {
            let cache = CacheDir::new(Some(tmp.path())).unwrap();
            path = cache.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn write_then_read_frame_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(Some(tmp.path())).unwrap();
        {
            let mut f = cache.open_for_write(7, 1).unwrap();
            f.write_all(b"pixels").unwrap();
        }
        let mut f = cache.open_for_read(7, 1).unwrap();
        let mut out = String::new();
        f.read_to_string(&mut out).unwrap();
        assert_eq!(out, "pixels");
    }

    #[test]
    fn recreates_directory_if_vanished() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(Some(tmp.path())).unwrap();
        std::fs::remove_dir_all(cache.path()).unwrap();
        assert!(!cache.path().exists());
        cache.open_for_write(1, 1).unwrap();
        assert!(cache.path().exists());
    }
}
