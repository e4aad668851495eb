use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use crate::{
    error::disk::{NewTorrentError, ReadError, WriteError},
    storage_info::{FileInfo, FileSlice},
};

pub struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens the file in create, read, and write modes at the path of
    /// combining download directory and the path defined in the file info.
    ///
    /// Creates the file's parent directories if they don't exist yet, which
    /// is necessary for multi-file torrents whose paths include
    /// subdirectories.
    pub fn new(download_dir: &Path, info: FileInfo) -> Result<Self, NewTorrentError> {
        log::trace!(
            "Opening and creating file {:?}, in dir {:?}",
            info,
            download_dir
        );

        let path = download_dir.join(&info.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(NewTorrentError::Io)?;
        }

        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                NewTorrentError::Io(e)
            })?;

        debug_assert!(path.exists());
        Ok(Self { info, handle })
    }

    /// Writes `buf` at `slice`'s offset within the file.
    pub fn write_at(&self, slice: FileSlice, buf: &[u8]) -> Result<(), WriteError> {
        debug_assert_eq!(slice.len as usize, buf.len());
        self.handle.write_at(buf, slice.offset)?;
        Ok(())
    }

    /// Reads `buf.len()` bytes at `slice`'s offset within the file.
    pub fn read_at(&self, slice: FileSlice, buf: &mut [u8]) -> Result<(), ReadError> {
        debug_assert_eq!(slice.len as usize, buf.len());
        self.handle.read_exact_at(buf, slice.offset)?;
        Ok(())
    }
}
