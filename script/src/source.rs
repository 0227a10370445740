use std::{path::PathBuf, sync::Arc};

use derive_more::derive::{From, Into};
use sha2::{Digest, Sha256};
use typed_index_collections::TiVec;

use crate::{backend::Flags, error::Error, ir::Module};

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceIndex(usize);

impl SourceIndex {
    pub const MAIN: Self = SourceIndex(0);
    pub const LIBRARY: Self = SourceIndex(1);
}

pub const MAX_SOURCES: usize = 2;

#[derive(Debug, Clone)]
pub enum Payload {
    Bitcode { name: String, bytes: Vec<u8> },
    Module(Arc<Module>),
    File(PathBuf),
}

impl Payload {
    pub fn name(&self) -> String {
        match self {
            Payload::Bitcode { name, .. } => name.clone(),
            Payload::Module(_) => "<module>".to_owned(),
            Payload::File(path) => path.display().to_string(),
        }
    }

    /// In-memory modules have no byte representation to hash.
    pub fn is_fingerprintable(&self) -> bool {
        !matches!(self, Payload::Module(_))
    }
}

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub payload: Payload,
    pub flags: Flags,
}

impl SourceInfo {
    pub fn load(&self, slot: SourceIndex) -> Result<LoadedSource, Error> {
        let content = match &self.payload {
            Payload::Bitcode { bytes, .. } => Content::Bytes(bytes.clone()),
            Payload::Module(module) => Content::Module(module.clone()),
            Payload::File(path) => {
                Content::Bytes(std::fs::read(path).map_err(|e| Error::SourceUnreadable {
                    path: path.clone(),
                    source: e,
                })?)
            }
        };
        Ok(LoadedSource {
            slot,
            name: self.payload.name(),
            flags: self.flags,
            content,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Content {
    Bytes(Vec<u8>),
    Module(Arc<Module>),
}

/// A source whose bytes have been read and are ready for the backend.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub slot: SourceIndex,
    pub name: String,
    pub flags: Flags,
    pub content: Content,
}

impl LoadedSource {
    pub fn fingerprint(&self) -> Option<String> {
        match &self.content {
            Content::Bytes(bytes) => Some(sha256_hex(bytes)),
            Content::Module(_) => None,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    All,
    MainOnly,
}

#[derive(Debug)]
pub struct SourceList {
    slots: TiVec<SourceIndex, Option<SourceInfo>>,
}

impl Default for SourceList {
    fn default() -> Self {
        Self {
            slots: (0..MAX_SOURCES).map(|_| None).collect(),
        }
    }
}

impl SourceList {
    pub fn add(&mut self, slot: usize, payload: Payload, flags: Flags) -> Result<(), Error> {
        let Some(entry) = self.slots.get_mut(SourceIndex::from(slot)) else {
            return Err(Error::InvalidSlot {
                slot,
                max: MAX_SOURCES,
            });
        };
        if let Some(existing) = entry {
            return Err(Error::SlotOccupied {
                slot,
                name: existing.payload.name(),
            });
        }
        *entry = Some(SourceInfo { payload, flags });
        Ok(())
    }

    pub fn get(&self, slot: SourceIndex) -> Option<&SourceInfo> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SourceIndex, &SourceInfo)> {
        self.slots
            .iter_enumerated()
            .filter_map(|(idx, s)| s.as_ref().map(|s| (idx, s)))
    }

    pub fn is_fingerprintable(&self) -> bool {
        !self.is_empty() && self.iter().all(|(_, s)| s.payload.is_fingerprintable())
    }

    /// Reads the selected sources. The main slot must be filled.
    pub fn load(&self, selection: Selection) -> Result<Vec<LoadedSource>, Error> {
        if self.get(SourceIndex::MAIN).is_none() {
            return Err(Error::NoSource);
        }
        self.iter()
            .filter(|(idx, _)| selection == Selection::All || *idx == SourceIndex::MAIN)
            .map(|(idx, s)| s.load(idx))
            .collect()
    }
}
