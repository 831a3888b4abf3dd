//! Deciding how a game file is presented to a core.
//!
//! A core may demand a real filesystem path, tolerate an in-memory buffer,
//! want a whole archive handed over untouched, or want the host to reach
//! inside an archive for it. Each option is a [`LoadStrategy`]; the
//! resolver tries them in order and a file counts as unloadable only after
//! every applicable strategy has been offered to the core and refused.

use std::path::{Path, PathBuf};

use crate::binding::{Core, CoreInfo};
use crate::vfs::Vfs;

/// A game file as the enclosing application refers to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameFile {
    /// A plain file on the local filesystem.
    Local { path: PathBuf },
    /// A member of a local zip archive.
    ArchiveMember {
        /// Path of the containing archive on the local filesystem.
        archive: PathBuf,
        /// Entry name inside the archive, using `/` separators.
        inner: String,
    },
    /// A file behind some remote scheme; only reachable through the VFS.
    Remote { url: String },
}

impl GameFile {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Lowercased extension including the dot, of the innermost name.
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            Self::Local { path } => path.file_name()?.to_str()?,
            Self::ArchiveMember { inner, .. } => inner.rsplit('/').next()?,
            Self::Remote { url } => url.rsplit('/').next()?,
        };
        let dot = name.rfind('.')?;
        Some(name[dot..].to_lowercase())
    }

    /// Human-readable location for log lines.
    pub fn display(&self) -> String {
        match self {
            Self::Local { path } => path.display().to_string(),
            Self::ArchiveMember { archive, inner } => {
                format!("{}#{inner}", archive.display())
            }
            Self::Remote { url } => url.clone(),
        }
    }
}

/// The form in which a game is handed to a core, consumed by `load_game`.
pub enum GameData {
    /// A filesystem path the core opens itself.
    Path(PathBuf),
    /// The file contents, read by the host.
    Buffer(Vec<u8>),
}

/// One way of presenting a game file to a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Hand the raw local path to the core.
    LocalPath,
    /// Hand the path of the containing archive to the core, for cores
    /// that extract themselves (`block_extract`).
    ParentArchive,
    /// Read the file through the VFS and hand the core a buffer.
    InMemory,
    /// The file is itself an archive; read the first acceptable entry and
    /// hand the core a buffer.
    EnterArchive,
}

impl LoadStrategy {
    /// Strategy order. With `prefer_vfs` the two buffer-producing
    /// strategies move to the front, keeping relative order within each
    /// pair.
    pub fn order(prefer_vfs: bool) -> [LoadStrategy; 4] {
        if prefer_vfs {
            [
                Self::InMemory,
                Self::EnterArchive,
                Self::LocalPath,
                Self::ParentArchive,
            ]
        } else {
            [
                Self::LocalPath,
                Self::ParentArchive,
                Self::InMemory,
                Self::EnterArchive,
            ]
        }
    }

    /// Test applicability and produce the presentation, or None when this
    /// strategy cannot serve the file for this core.
    pub fn plan(&self, file: &GameFile, core: &CoreInfo, vfs: &dyn Vfs) -> Option<GameData> {
        match self {
            Self::LocalPath => plan_local_path(file, core),
            Self::ParentArchive => plan_parent_archive(file, core),
            Self::InMemory => plan_in_memory(file, core, vfs),
            Self::EnterArchive => plan_enter_archive(file, core, vfs),
        }
    }
}

fn accepts_file_extension(core: &CoreInfo, file: &GameFile) -> bool {
    match file.extension() {
        Some(ext) => core.accepts_extension(&ext),
        // No extension at all only passes the optimistic empty set.
        None => core.accepts_extension(""),
    }
}

fn plan_local_path(file: &GameFile, core: &CoreInfo) -> Option<GameData> {
    let GameFile::Local { path } = file else {
        tracing::debug!("local-path: file is not a plain local file");
        return None;
    };
    if !accepts_file_extension(core, file) {
        tracing::debug!("local-path: extension not accepted by {}", core.name);
        return None;
    }
    Some(GameData::Path(path.clone()))
}

fn plan_parent_archive(file: &GameFile, core: &CoreInfo) -> Option<GameData> {
    let GameFile::ArchiveMember { archive, inner } = file else {
        tracing::debug!("parent-archive: file is not inside an archive");
        return None;
    };
    if !core.accepts_extension(".zip") {
        tracing::debug!("parent-archive: {} does not take zip files", core.name);
        return None;
    }
    // The member must sit at the archive root; cores that unpack archives
    // themselves expect flat layouts.
    if inner.contains('/') {
        tracing::debug!("parent-archive: {inner} is not at the archive root");
        return None;
    }
    if !is_zip_path(archive) {
        tracing::debug!("parent-archive: container {} is not a zip", archive.display());
        return None;
    }
    Some(GameData::Path(archive.clone()))
}

fn plan_in_memory(file: &GameFile, core: &CoreInfo, vfs: &dyn Vfs) -> Option<GameData> {
    if core.needs_full_path {
        tracing::debug!("in-memory: {} insists on a real path", core.name);
        return None;
    }
    if !accepts_file_extension(core, file) {
        tracing::debug!("in-memory: extension not accepted by {}", core.name);
        return None;
    }
    let length = match vfs.len(file) {
        Ok(length) => length,
        Err(e) => {
            tracing::error!("in-memory: cannot stat {}: {e:#}", file.display());
            return None;
        }
    };
    // The core receives the size as a machine word.
    if length == 0 || length >= usize::MAX as u64 {
        tracing::error!("in-memory: invalid file size {length} for {}", file.display());
        return None;
    }
    match vfs.read(file) {
        Ok(bytes) => Some(GameData::Buffer(bytes)),
        Err(e) => {
            tracing::error!("in-memory: read failed for {}: {e:#}", file.display());
            None
        }
    }
}

fn plan_enter_archive(file: &GameFile, core: &CoreInfo, vfs: &dyn Vfs) -> Option<GameData> {
    let GameFile::Local { path } = file else {
        tracing::debug!("enter-archive: file is not a local archive");
        return None;
    };
    if !is_zip_path(path) {
        tracing::debug!("enter-archive: {} is not a zip", path.display());
        return None;
    }
    if core.needs_full_path {
        tracing::debug!("enter-archive: {} insists on a real path", core.name);
        return None;
    }
    let entries = match vfs.list_archive(path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("enter-archive: cannot enumerate {}: {e:#}", path.display());
            return None;
        }
    };
    // First acceptable entry wins.
    let inner = entries.into_iter().find(|name| {
        name.rfind('.')
            .is_some_and(|dot| core.accepts_extension(&name[dot..].to_lowercase()))
    })?;
    let member = GameFile::ArchiveMember {
        archive: path.clone(),
        inner,
    };
    match vfs.read(&member) {
        Ok(bytes) if !bytes.is_empty() => Some(GameData::Buffer(bytes)),
        Ok(_) => {
            tracing::error!("enter-archive: {} entry is empty", member.display());
            None
        }
        Err(e) => {
            tracing::error!("enter-archive: read failed for {}: {e:#}", member.display());
            None
        }
    }
}

fn is_zip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// Offer `file` to `core` under each applicable strategy until one both
/// produces a presentation and is accepted by the core's `load_game`.
///
/// Returns the winning strategy, or None when the file is unloadable by
/// this core.
pub fn load_with_strategies(
    core: &mut dyn Core,
    file: &GameFile,
    vfs: &dyn Vfs,
    prefer_vfs: bool,
) -> Option<LoadStrategy> {
    for strategy in LoadStrategy::order(prefer_vfs) {
        let Some(game) = strategy.plan(file, core.info(), vfs) else {
            continue;
        };
        tracing::info!("loading {} via {strategy:?}", file.display());
        if core.load_game(&game) {
            tracing::info!("core accepted {} via {strategy:?}", file.display());
            return Some(strategy);
        }
        tracing::info!("core refused {} via {strategy:?}", file.display());
    }
    tracing::error!("no strategy could load {}", file.display());
    None
}
