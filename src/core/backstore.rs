//! Backing file I/O for switchcrypt devices

use crate::error::{Result, SwitchCryptError};
use crate::header::HeaderType;
use crate::layout::Layout;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk-backed storage for one device
///
/// All reads and writes are raw and unauthenticated; they are bounds-checked
/// against the file size fixed at creation.
pub struct Backstore {
    file: File,
    path: PathBuf,
    layout: Layout,
}

impl Backstore {
    /// Create a new zero-filled backing file of exactly `total_size` bytes
    pub fn create<P: AsRef<Path>>(path: P, total_size: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(SwitchCryptError::FileAlreadyExists(
                path.display().to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(total_size)?;

        tracing::debug!("Created backstore {} ({} bytes)", path.display(), total_size);

        Ok(Backstore {
            file,
            path: path.to_path_buf(),
            layout: Layout::unconfigured(total_size),
        })
    }

    /// Open an existing backing file and recover its geometry from the headers
    ///
    /// The body offset is not known until [`Backstore::finish_setup`] runs.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SwitchCryptError::FileDoesNotExist(
                path.display().to_string(),
            ));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        let mut backstore = Backstore {
            file,
            path: path.to_path_buf(),
            layout: Layout::unconfigured(file_size),
        };

        let num_nuggets = backstore.read_u32_field(HeaderType::NumNuggets)?;
        let flakes_per_nugget = backstore.read_u32_field(HeaderType::FlakesPerNugget)?;
        let flake_size = backstore.read_u32_field(HeaderType::FlakeSize)?;

        backstore.layout =
            Layout::from_geometry(num_nuggets, flakes_per_nugget, flake_size, file_size);

        Ok(backstore)
    }

    /// Derive the body offset once the per-nugget metadata width is known
    pub fn finish_setup(&mut self, md_bytes_per_nugget: u32) {
        self.layout.finish(md_bytes_per_nugget);
    }

    /// Install the layout computed for a new device
    pub fn apply_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }

    /// Current region offsets
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Read `buf.len()` bytes at an absolute file offset
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_bounds(offset, buf.len() as u64)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write `buf` at an absolute file offset
    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_bounds(offset, buf.len() as u64)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Read relative to the start of the body region
    pub fn read_body(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let absolute = self.body_absolute(offset, buf.len() as u64)?;
        self.read(buf, absolute)
    }

    /// Write relative to the start of the body region
    pub fn write_body(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let absolute = self.body_absolute(offset, buf.len() as u64)?;
        self.write(buf, absolute)
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn body_absolute(&self, offset: u64, len: u64) -> Result<u64> {
        let body_size = self.layout.writeable_size();
        match offset.checked_add(len) {
            Some(end) if end <= body_size => Ok(self.layout.body_offset + offset),
            _ => Err(SwitchCryptError::OutOfBounds {
                offset,
                len,
                size: body_size,
            }),
        }
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.layout.file_size => Ok(()),
            _ => Err(SwitchCryptError::OutOfBounds {
                offset,
                len,
                size: self.layout.file_size,
            }),
        }
    }

    fn read_u32_field(&mut self, kind: HeaderType) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read(&mut bytes, kind.offset())?;
        Ok(u32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_zeroed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backstore.bin");

        let backstore = Backstore::create(&path, 4096).unwrap();
        let layout = backstore.layout();

        assert_eq!(layout.file_size, 4096);
        assert_eq!(layout.kcs_offset, 0);
        assert_eq!(layout.tj_offset, 0);
        assert_eq!(layout.md_offset, 0);
        assert_eq!(layout.body_offset, 0);
        assert_eq!(layout.md_bytes_per_nugget, 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backstore.bin");
        std::fs::write(&path, b"occupied").unwrap();

        assert!(matches!(
            Backstore::create(&path, 4096),
            Err(SwitchCryptError::FileAlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.bin");

        assert!(matches!(
            Backstore::open(&path),
            Err(SwitchCryptError::FileDoesNotExist(_))
        ));
    }

    #[test]
    fn test_open_recovers_geometry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backstore.bin");

        {
            let mut backstore = Backstore::create(&path, 204).unwrap();
            backstore
                .write(&3u32.to_le_bytes(), HeaderType::NumNuggets.offset())
                .unwrap();
            backstore
                .write(&2u32.to_le_bytes(), HeaderType::FlakesPerNugget.offset())
                .unwrap();
            backstore
                .write(&8u32.to_le_bytes(), HeaderType::FlakeSize.offset())
                .unwrap();
        }

        let mut backstore = Backstore::open(&path).unwrap();
        assert_eq!(backstore.layout().num_nuggets, 3);
        assert_eq!(backstore.layout().kcs_offset, 105);
        assert_eq!(backstore.layout().tj_offset, 129);
        assert_eq!(backstore.layout().md_offset, 132);
        assert_eq!(backstore.layout().body_offset, 0);

        backstore.finish_setup(8);
        assert_eq!(backstore.layout().body_offset, 156);
    }

    #[test]
    fn test_body_io_and_bounds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backstore.bin");

        let mut backstore = Backstore::create(&path, 204).unwrap();
        backstore.apply_layout(Layout::compute(204, 2, 8, 8).unwrap());

        backstore.write_body(b"flake", 40).unwrap();
        let mut raw = [0u8; 5];
        backstore.read(&mut raw, 156 + 40).unwrap();
        assert_eq!(&raw, b"flake");

        let mut buf = [0u8; 9];
        assert!(matches!(
            backstore.read_body(&mut buf, 40),
            Err(SwitchCryptError::OutOfBounds { .. })
        ));
        assert!(matches!(
            backstore.write(&[0u8; 2], 203),
            Err(SwitchCryptError::OutOfBounds { .. })
        ));
    }
}
