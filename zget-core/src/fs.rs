use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Download target that only becomes visible once complete.
///
/// Bytes go to a hidden temporary file next to the destination.
/// [`commit`](Self::commit) atomically renames it into place; dropping the
/// value without committing deletes the temporary file, so a failed or
/// unauthenticated transfer never leaves output behind.
pub struct PartialFile {
    file: File,
    temp: TempPath,
    dest: PathBuf,
    written: u64,
}

impl PartialFile {
    /// Creates the temporary file in `dest`'s directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is not writable.
    pub fn create(dest: &Path) -> io::Result<Self> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let (file, temp) = tempfile::Builder::new()
            .prefix(".zget-")
            .suffix(".part")
            .tempfile_in(dir)?
            .into_parts();
        debug!(temp = %temp.display(), dest = %dest.display(), "Created partial file");
        Ok(Self {
            file: File::from_std(file),
            temp,
            dest: dest.to_path_buf(),
            written: 0,
        })
    }

    /// Appends `data`.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes, syncs and renames the file onto its destination, replacing
    /// any existing file there.
    ///
    /// # Errors
    ///
    /// Returns an error if syncing or renaming fails; the temporary file is
    /// removed in that case.
    pub async fn commit(self) -> io::Result<PathBuf> {
        let Self {
            mut file,
            temp,
            dest,
            written,
        } = self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        temp.persist(&dest).map_err(|e| e.error)?;
        debug!(dest = %dest.display(), bytes = written, "Committed partial file");
        Ok(dest)
    }
}
