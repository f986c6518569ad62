//! Hand-off of finished live capture files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Receives each capture file the live driver finishes. Retries are the
/// caller's business.
pub trait Uploader: Send + Sync {
    fn upload(&self, path: &Path) -> io::Result<()>;
}

/// Moves finished files into a spool directory, typically the watch
/// directory of a server instance.
#[derive(Debug, Clone)]
pub struct SpoolUploader {
    dir: PathBuf,
}

impl SpoolUploader {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SpoolUploader { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Uploader for SpoolUploader {
    fn upload(&self, path: &Path) -> io::Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "capture path has no file name"))?;
        let target = self.dir.join(name);

        if fs::rename(path, &target).is_err() {
            // Different filesystem: copy under a name the watcher ignores,
            // then move it into place.
            let mut partial = target.clone().into_os_string();
            partial.push(".part");
            let partial = PathBuf::from(partial);
            fs::copy(path, &partial)?;
            fs::rename(&partial, &target)?;
            fs::remove_file(path)?;
        }

        tracing::info!(file = %target.display(), "capture file spooled");
        Ok(())
    }
}

/// Leaves files where the live driver wrote them.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepLocal;

impl Uploader for KeepLocal {
    fn upload(&self, path: &Path) -> io::Result<()> {
        tracing::info!(file = %path.display(), "capture file kept");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spool_moves_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("eth0-1.pcap");
        fs::write(&src, b"pcap bytes").unwrap();

        let spool = SpoolUploader::new(dir.path().join("spool")).unwrap();
        spool.upload(&src).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(spool.dir().join("eth0-1.pcap")).unwrap(), b"pcap bytes");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolUploader::new(dir.path().join("spool")).unwrap();
        assert!(spool.upload(&dir.path().join("gone.pcap")).is_err());
    }
}
