//! Virtual file system seam.
//!
//! The resolver needs exactly three things from the surrounding
//! application's VFS: a file's length, its full contents, and the entry
//! names of a zip archive. `LocalVfs` covers the plain-filesystem case;
//! hosts with their own VFS stack implement the trait themselves.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use zip::ZipArchive;

use crate::strategy::GameFile;

/// Narrow read-only view of the host file system.
pub trait Vfs: Send + Sync {
    /// Length of the file in bytes, without reading it.
    fn len(&self, file: &GameFile) -> Result<u64>;

    /// Read the whole file into memory.
    fn read(&self, file: &GameFile) -> Result<Vec<u8>>;

    /// Entry names of a zip archive, in archive order.
    fn list_archive(&self, archive: &Path) -> Result<Vec<String>>;
}

/// `Vfs` over the local filesystem, with zip members served through the
/// zip crate.
#[derive(Debug, Default)]
pub struct LocalVfs;

impl Vfs for LocalVfs {
    fn len(&self, file: &GameFile) -> Result<u64> {
        match file {
            GameFile::Local { path } => {
                let meta = std::fs::metadata(path)
                    .with_context(|| format!("stat failed for {}", path.display()))?;
                Ok(meta.len())
            }
            GameFile::ArchiveMember { archive, inner } => {
                let mut zip = open_archive(archive)?;
                let entry = zip
                    .by_name(inner)
                    .with_context(|| format!("no entry '{inner}' in {}", archive.display()))?;
                Ok(entry.size())
            }
            GameFile::Remote { url } => bail!("no local access to remote file {url}"),
        }
    }

    fn read(&self, file: &GameFile) -> Result<Vec<u8>> {
        match file {
            GameFile::Local { path } => {
                let mut data = Vec::new();
                File::open(path)
                    .with_context(|| format!("open failed for {}", path.display()))?
                    .read_to_end(&mut data)?;
                Ok(data)
            }
            GameFile::ArchiveMember { archive, inner } => {
                let mut zip = open_archive(archive)?;
                let mut entry = zip
                    .by_name(inner)
                    .with_context(|| format!("no entry '{inner}' in {}", archive.display()))?;
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                Ok(data)
            }
            GameFile::Remote { url } => bail!("no local access to remote file {url}"),
        }
    }

    fn list_archive(&self, archive: &Path) -> Result<Vec<String>> {
        let zip = open_archive(archive)?;
        Ok(zip.file_names().map(str::to_owned).collect())
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file =
        File::open(path).with_context(|| format!("open failed for {}", path.display()))?;
    ZipArchive::new(file).with_context(|| format!("not a readable zip: {}", path.display()))
}
