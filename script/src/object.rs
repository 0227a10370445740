//! On-disk object image produced by the text backend.
//!
//! Layout: four magic bytes, a little-endian `u32` header length, the
//! `bincode` header, then the section bytes. Symbol offsets are relative to
//! the first section byte.

use derive_more::derive::{From, Into};
use serde::{Deserialize, Serialize};
use typed_index_collections::TiVec;

pub const MAGIC: [u8; 4] = *b"\x7fSCO";
const PREAMBLE_LEN: usize = 8;
/// Bytes patched at each relocation: a little-endian `u64` target offset.
pub const RELOCATION_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ObjectKind {
    #[default]
    Unknown,
    Relocatable,
    SharedObject,
    Executable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RelocModel {
    #[default]
    Default,
    Static,
    Pic,
    DynamicNoPic,
}

#[derive(From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolIndex(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Variable,
    Function,
    ForEach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub offset: usize,
    pub size: usize,
    /// Object-typed variable.
    pub object: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// A call site whose target address is not yet known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    pub offset: usize,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForEachExport {
    pub symbol: SymbolIndex,
    pub signature: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub kind: ObjectKind,
    pub reloc_model: RelocModel,
    pub sections: Vec<Section>,
    pub symbols: TiVec<SymbolIndex, Symbol>,
    pub export_vars: Vec<SymbolIndex>,
    pub export_funcs: Vec<SymbolIndex>,
    pub export_for_each: Vec<ForEachExport>,
    pub pragmas: Vec<(String, String)>,
    pub object_slots: Vec<u32>,
    pub relocations: Vec<Relocation>,
    pub imports: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct HeaderSerde {
    kind: ObjectKind,
    reloc_model: RelocModel,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
    export_vars: Vec<SymbolIndex>,
    export_funcs: Vec<SymbolIndex>,
    export_for_each: Vec<ForEachExport>,
    pragmas: Vec<(String, String)>,
    object_slots: Vec<u32>,
    relocations: Vec<Relocation>,
    imports: Vec<String>,
}

impl Serialize for Header {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let serde_repr = HeaderSerde {
            kind: self.kind,
            reloc_model: self.reloc_model,
            sections: self.sections.clone(),
            symbols: self.symbols.iter().cloned().collect(),
            export_vars: self.export_vars.clone(),
            export_funcs: self.export_funcs.clone(),
            export_for_each: self.export_for_each.clone(),
            pragmas: self.pragmas.clone(),
            object_slots: self.object_slots.clone(),
            relocations: self.relocations.clone(),
            imports: self.imports.clone(),
        };
        serde_repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Header {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let serde_repr = HeaderSerde::deserialize(deserializer)?;
        Ok(Header {
            kind: serde_repr.kind,
            reloc_model: serde_repr.reloc_model,
            sections: serde_repr.sections,
            symbols: serde_repr.symbols.into_iter().collect(),
            export_vars: serde_repr.export_vars,
            export_funcs: serde_repr.export_funcs,
            export_for_each: serde_repr.export_for_each,
            pragmas: serde_repr.pragmas,
            object_slots: serde_repr.object_slots,
            relocations: serde_repr.relocations,
            imports: serde_repr.imports,
        })
    }
}

impl Header {
    pub fn find_symbol(&self, name: &str) -> Option<SymbolIndex> {
        self.symbols
            .iter_enumerated()
            .find_map(|(i, s)| if s.name == name { Some(i) } else { None })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("bad magic number")]
    BadMagic,
    #[error("truncated image: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },
    #[error("bad header: {0}")]
    Header(#[from] bincode::error::DecodeError),
    #[error("section {name} lies outside the image")]
    SectionOutOfBounds { name: String },
    #[error("symbol {name} lies outside the image")]
    SymbolOutOfBounds { name: String },
    #[error("relocation at {offset:#x} against {target} lies outside the image")]
    RelocationOutOfBounds { offset: usize, target: String },
    #[error("export refers to missing symbol {0:?}")]
    DanglingExport(SymbolIndex),
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EncodeError(#[from] bincode::error::EncodeError);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Image {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let header = bincode::serde::encode_to_vec(&self.header, bincode::config::standard())?;
        let mut out = Vec::with_capacity(PREAMBLE_LEN + header.len() + self.body.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Image, DecodeError> {
        let (header, body_offset) = Self::decode_header(bytes)?;
        Ok(Image {
            header,
            body: bytes[body_offset..].to_vec(),
        })
    }

    /// Decodes and validates the header, returning it with the offset of the
    /// first section byte.
    pub fn decode_header(bytes: &[u8]) -> Result<(Header, usize), DecodeError> {
        if bytes.len() < PREAMBLE_LEN {
            return Err(DecodeError::Truncated {
                needed: PREAMBLE_LEN,
                len: bytes.len(),
            });
        }
        if bytes[..4] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[4..PREAMBLE_LEN]);
        let header_len = u32::from_le_bytes(len) as usize;
        let body_offset = PREAMBLE_LEN + header_len;
        if bytes.len() < body_offset {
            return Err(DecodeError::Truncated {
                needed: body_offset,
                len: bytes.len(),
            });
        }
        let (header, _): (Header, usize) = bincode::serde::decode_from_slice(
            &bytes[PREAMBLE_LEN..body_offset],
            bincode::config::standard(),
        )?;
        let body_len = bytes.len() - body_offset;
        validate(&header, body_len)?;
        Ok((header, body_offset))
    }
}

fn fits(offset: usize, size: usize, body_len: usize) -> bool {
    offset.checked_add(size).is_some_and(|end| end <= body_len)
}

fn validate(header: &Header, body_len: usize) -> Result<(), DecodeError> {
    for section in &header.sections {
        if !fits(section.offset, section.size, body_len) {
            return Err(DecodeError::SectionOutOfBounds {
                name: section.name.clone(),
            });
        }
    }
    for symbol in &header.symbols {
        if !fits(symbol.offset, symbol.size, body_len) {
            return Err(DecodeError::SymbolOutOfBounds {
                name: symbol.name.clone(),
            });
        }
    }
    for reloc in &header.relocations {
        if !fits(reloc.offset, RELOCATION_SIZE, body_len) {
            return Err(DecodeError::RelocationOutOfBounds {
                offset: reloc.offset,
                target: reloc.target.clone(),
            });
        }
    }
    let exports = header
        .export_vars
        .iter()
        .chain(&header.export_funcs)
        .chain(header.export_for_each.iter().map(|f| &f.symbol));
    for idx in exports {
        if header.symbols.get(*idx).is_none() {
            return Err(DecodeError::DanglingExport(*idx));
        }
    }
    Ok(())
}
