use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    backend::BackendError,
    error::Error,
    export::ExportTable,
    object::{Header, Image, ObjectKind},
    symbol::SymbolResolver,
};

/// Compiled bytes held in memory together with their decoded tables.
///
/// Addresses handed out are positions inside `bytes`, which is never
/// reallocated once loaded.
#[derive(Debug)]
pub struct LoadedObject {
    bytes: Box<[u8]>,
    header: Header,
    body_offset: usize,
    exports: ExportTable,
    imports: BTreeMap<String, usize>,
}

impl LoadedObject {
    /// Decodes `bytes`. Executables additionally get every import bound
    /// through `resolver`.
    pub fn load(bytes: Vec<u8>, resolver: &SymbolResolver) -> Result<Self, Error> {
        let (header, body_offset) =
            Image::decode_header(&bytes).map_err(|e| Error::Compile(BackendError::Object(e)))?;

        let mut imports = BTreeMap::new();
        if header.kind == ObjectKind::Executable {
            for name in &header.imports {
                let address = resolver
                    .resolve_external(name)
                    .ok_or_else(|| Error::UnresolvedSymbol { name: name.clone() })?;
                debug!(symbol = %name, address = format_args!("{address:#x}"), "bound import");
                imports.insert(name.clone(), address);
            }
        }

        Ok(Self {
            exports: ExportTable::from_header(&header),
            bytes: bytes.into_boxed_slice(),
            header,
            body_offset,
            imports,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> ObjectKind {
        self.header.kind
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn imports(&self) -> &BTreeMap<String, usize> {
        &self.imports
    }

    pub fn address(&self, offset: usize) -> usize {
        self.bytes.as_ptr() as usize + self.body_offset + offset
    }

    /// Address of a symbol this object defines.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.header
            .find_symbol(name)
            .map(|idx| self.address(self.header.symbols[idx].offset))
    }
}
