//! On-disk cache of compiled objects.
//!
//! An entry is the object file plus a JSON sidecar next to it describing
//! exactly what produced it. An entry is only reused when the sidecar matches
//! the request in full and the object still hashes to what the sidecar says.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{
    backend::Flags,
    error::Error,
    object::{ObjectKind, RelocModel},
    source::{sha256_hex, LoadedSource},
};

/// Bumped whenever the sidecar layout changes.
pub const FORMAT_VERSION: u32 = 1;

pub const NOCACHE_ENV: &str = "SCRIPTCC_NOCACHE";

/// Directory and base name an entry lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheLocation {
    pub dir: PathBuf,
    pub name: String,
}

impl CacheLocation {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn paths(&self, kind: ObjectKind) -> Option<CachePaths> {
        CachePaths::derive(&self.dir, &self.name, kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub object: PathBuf,
    pub info: PathBuf,
}

impl CachePaths {
    pub fn derive(dir: &Path, name: &str, kind: ObjectKind) -> Option<Self> {
        let ext = match kind {
            ObjectKind::Relocatable | ObjectKind::Executable => "o",
            ObjectKind::SharedObject => "so",
            ObjectKind::Unknown => return None,
        };
        // Appended rather than replaced: names may contain dots.
        let object = dir.join(format!("{name}.{ext}"));
        let info = dir.join(format!("{name}.{ext}.info"));
        Some(Self { object, info })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub slot: usize,
    pub name: String,
    pub flags: Flags,
    pub sha256: String,
}

/// Everything that determines the bytes of a compiled object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub format_version: u32,
    pub backend: String,
    pub kind: ObjectKind,
    pub reloc_model: RelocModel,
    pub flags: Flags,
    pub sources: Vec<SourceRecord>,
    pub preserved_symbols: Vec<String>,
}

impl CacheKey {
    /// Returns `None` when some source has no byte representation.
    pub fn new(
        backend: &str,
        kind: ObjectKind,
        reloc_model: RelocModel,
        flags: Flags,
        sources: &[LoadedSource],
        preserved_symbols: &[String],
    ) -> Option<Self> {
        let sources = sources
            .iter()
            .map(|s| {
                Some(SourceRecord {
                    slot: s.slot.into(),
                    name: s.name.clone(),
                    flags: s.flags,
                    sha256: s.fingerprint()?,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            format_version: FORMAT_VERSION,
            backend: backend.to_owned(),
            kind,
            reloc_model,
            flags,
            sources,
            preserved_symbols: preserved_symbols.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub size: u64,
    pub sha256: String,
}

/// Contents of a `.info` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub key: CacheKey,
    pub object: ObjectRecord,
}

#[derive(Debug)]
pub struct CacheHit {
    pub info: CacheInfo,
    /// Absent when only validity was checked.
    pub bytes: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
enum Miss {
    #[error("no usable entry: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Corrupt(Error),
    #[error("entry was built from different inputs")]
    Stale,
    #[error("object does not match its sidecar")]
    ObjectMismatch,
}

/// Looks for a valid entry. Every failure is a miss; the reason is only
/// logged.
pub fn try_load(
    location: &CacheLocation,
    key: &CacheKey,
    check_only: bool,
) -> Option<CacheHit> {
    let paths = location.paths(key.kind)?;
    match validate(&paths, key, check_only) {
        Ok((info, bytes)) => {
            debug!(path = %paths.object.display(), "cache hit");
            Some(CacheHit { info, bytes })
        }
        Err(miss) => {
            debug!(path = %paths.object.display(), reason = %miss, "cache miss");
            None
        }
    }
}

fn validate(
    paths: &CachePaths,
    key: &CacheKey,
    check_only: bool,
) -> Result<(CacheInfo, Option<Vec<u8>>), Miss> {
    let text = fs::read_to_string(&paths.info)?;
    let info: CacheInfo = serde_json::from_str(&text).map_err(|e| {
        Miss::Corrupt(Error::CacheCorrupt {
            path: paths.info.clone(),
            reason: e.to_string(),
        })
    })?;
    if info.key != *key {
        return Err(Miss::Stale);
    }

    let bytes = fs::read(&paths.object)?;
    if bytes.is_empty()
        || bytes.len() as u64 != info.object.size
        || sha256_hex(&bytes) != info.object.sha256
    {
        return Err(Miss::ObjectMismatch);
    }
    Ok((info, (!check_only).then_some(bytes)))
}

/// Stores `bytes` under `location`. The sidecar goes last so that a reader
/// never validates against a half-written object.
pub fn write(location: &CacheLocation, key: &CacheKey, bytes: &[u8]) -> Result<CachePaths, Error> {
    let Some(paths) = location.paths(key.kind) else {
        return Err(Error::NoCacheLocation);
    };
    let info = CacheInfo {
        key: key.clone(),
        object: ObjectRecord {
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
        },
    };
    let sidecar = serde_json::to_vec_pretty(&info).map_err(|e| Error::CacheWrite {
        path: paths.info.clone(),
        source: e.into(),
    })?;

    fs::create_dir_all(&location.dir).map_err(|e| Error::CacheWrite {
        path: location.dir.clone(),
        source: e,
    })?;
    write_atomic(&paths.object, bytes).map_err(|e| Error::CacheWrite {
        path: paths.object.clone(),
        source: e,
    })?;
    write_atomic(&paths.info, &sidecar).map_err(|e| Error::CacheWrite {
        path: paths.info.clone(),
        source: e,
    })?;
    info!(path = %paths.object.display(), size = bytes.len(), "wrote cache entry");
    Ok(paths)
}

/// Writes through a temporary file in the destination directory, then
/// renames over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Whether `SCRIPTCC_NOCACHE` turns caching off for this process.
pub fn caching_disabled() -> bool {
    nocache_value_disables(std::env::var(NOCACHE_ENV).ok().as_deref())
}

fn nocache_value_disables(value: Option<&str>) -> bool {
    !matches!(value.map(str::trim), None | Some("") | Some("0"))
}
