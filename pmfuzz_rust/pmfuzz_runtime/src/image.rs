use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;

use pmfuzz_common::naming::crash_image_path;

/// The PM pool under test.
#[derive(Debug, Clone)]
pub struct PoolDescriptor {
    address: usize,
    size: usize,
    path: PathBuf,
}

impl PoolDescriptor {
    /// Describe a pool that is mapped at `address` and backed by the file at `path`.
    ///
    /// # Safety
    ///
    /// If crash images are captured with `Capture::RawDump`, `address` must be valid for reads of
    /// `size` bytes for as long as the descriptor is used.
    pub unsafe fn new(address: *const u8, size: usize, path: impl Into<PathBuf>) -> Self {
        PoolDescriptor {
            address: address as usize,
            size,
            path: path.into(),
        }
    }

    /// A pool that is only known by its file. Only usable with `Capture::FileCopy`.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        PoolDescriptor {
            address: 0,
            size: 0,
            path: path.into(),
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// How the content of the pool is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Dump the mapped pool memory.
    RawDump,
    /// Copy the pool file.
    FileCopy,
}

/// Writes crash images of a pool.
pub struct CrashImageWriter {
    pool: PoolDescriptor,
    suffix: String,
    capture: Capture,
}

impl CrashImageWriter {
    pub fn new(pool: PoolDescriptor, suffix: impl Into<String>, capture: Capture) -> Self {
        CrashImageWriter {
            pool,
            suffix: suffix.into(),
            capture,
        }
    }

    pub fn pool(&self) -> &PoolDescriptor {
        &self.pool
    }

    /// Path of the crash image for failure id `id`.
    pub fn image_path(&self, id: u32) -> PathBuf {
        crash_image_path(&self.pool.path, &self.suffix, id)
    }

    /// Write the crash image for failure id `id`. The image only appears under its final name
    /// once it is complete.
    pub fn write(&self, id: u32) -> Result<PathBuf> {
        let path = self.image_path(id);
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        let mut tmpfile = NamedTempFile::new_in(&dir).with_context(|| {
            format!("could not create crash image in {}", dir.display())
        })?;
        match self.capture {
            Capture::RawDump => {
                if self.pool.address == 0 {
                    bail!("pool address is unknown, cannot dump pool memory");
                }
                // safety: guaranteed by the caller of PoolDescriptor::new()
                let content = unsafe {
                    std::slice::from_raw_parts(self.pool.address as *const u8, self.pool.size)
                };
                tmpfile
                    .write_all(content)
                    .context("could not write crash image")?;
            }
            Capture::FileCopy => {
                let source = File::open(&self.pool.path).with_context(|| {
                    format!("could not open pool file {}", self.pool.path.display())
                })?;
                reflink_or_copy(&source, tmpfile.as_file_mut())
                    .context("could not copy pool file")?;
            }
        }
        tmpfile
            .persist(&path)
            .with_context(|| format!("could not save crash image {}", path.display()))?;
        Ok(path)
    }
}

static REFLINK_WARNING: Once = Once::new();

/// Try to reflink source to target, fall back to a normal copy if not supported.
fn reflink_or_copy(source: &File, target: &mut File) -> Result<()> {
    use linux_raw_sys::ioctl;
    use std::os::unix::io::AsRawFd;

    let ret = unsafe {
        // see ioctl_ficlone(2)
        libc::ioctl(
            target.as_raw_fd(),
            ioctl::FICLONE.into(),
            source.as_raw_fd(),
        )
    };
    if ret == -1 {
        REFLINK_WARNING.call_once(|| {
            log::warn!(
                "reflink failed, errno = {} (run on XFS or btrfs for more efficiency)",
                std::io::Error::last_os_error()
            );
        });
        // the clone shares the file position, rewind it first
        use std::io::{Seek, SeekFrom};
        let mut source = source.try_clone()?;
        source.seek(SeekFrom::Start(0))?;
        std::io::copy(&mut source, target)?;
    }
    Ok(())
}
