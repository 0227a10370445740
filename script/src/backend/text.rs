//! Backend for the textual module format in [`crate::ir`].
//!
//! Output is deterministic: the same request always produces the same bytes.

use std::collections::{BTreeSet, HashMap, VecDeque};

use itertools::Itertools;

use super::{Backend, BackendError, CompileOutput, CompileRequest, Flags};
use crate::{
    ir::Module,
    object::{
        ForEachExport, Header, Image, ObjectKind, RelocModel, Relocation, Section, Symbol,
        SymbolKind, RELOCATION_SIZE,
    },
    source::{Content, LoadedSource},
};

pub const VERSION: &str = concat!("scriptcc-text/", env!("CARGO_PKG_VERSION"));

/// Keep every definition, reachable or not.
pub const FLAG_NO_DCE: Flags = Flags(1 << 0);
/// Append a `.debug` section naming every symbol.
pub const FLAG_DEBUG_INFO: Flags = Flags(1 << 1);

/// Largest image body the backend lays out. Declared sizes that would grow the
/// body past this fail the compile.
pub const MAX_IMAGE_SIZE: usize = 1 << 28;

const CALL_SLOT: usize = RELOCATION_SIZE;

#[derive(Debug, Default, Clone, Copy)]
pub struct TextBackend;

impl Backend for TextBackend {
    fn version(&self) -> &str {
        VERSION
    }

    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, BackendError> {
        match request.kind {
            ObjectKind::Relocatable | ObjectKind::Executable => {}
            ObjectKind::SharedObject => {
                let relocatable = self.compile(&CompileRequest {
                    kind: ObjectKind::Relocatable,
                    ..*request
                })?;
                return Ok(CompileOutput {
                    object: self.link_shared(&relocatable.object, request.flags)?,
                    messages: relocatable.messages,
                });
            }
            ObjectKind::Unknown => return Err(BackendError::UnsupportedKind(request.kind)),
        }

        let module = link_sources(request.sources)?;
        let mut messages = vec![];
        let image = emit(&module, request, &mut messages)?;
        Ok(CompileOutput {
            object: image.encode()?,
            messages,
        })
    }

    fn link_shared(&self, object: &[u8], _flags: Flags) -> Result<Vec<u8>, BackendError> {
        let mut image = Image::decode(object)?;
        let header = &image.header;
        if header.kind != ObjectKind::Relocatable || header.reloc_model != RelocModel::Pic {
            return Err(BackendError::NotLinkable {
                kind: header.kind,
                reloc_model: header.reloc_model,
            });
        }
        apply_relocations(&mut image.header, &mut image.body);
        image.header.kind = ObjectKind::SharedObject;
        Ok(image.encode()?)
    }
}

fn load_module(source: &LoadedSource) -> Result<Module, BackendError> {
    match &source.content {
        Content::Module(module) => Ok(Module::clone(module)),
        Content::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| BackendError::Encoding {
                name: source.name.clone(),
            })?;
            Module::parse(text).map_err(|error| BackendError::Module {
                name: source.name.clone(),
                error,
            })
        }
    }
}

fn link_sources(sources: &[LoadedSource]) -> Result<Module, BackendError> {
    let mut modules = sources.iter().map(load_module);
    let Some(main) = modules.next() else {
        return Ok(Module::default());
    };
    modules.fold(main, |linked, library| {
        linked?.link(library?).map_err(BackendError::Link)
    })
}

/// Names reachable from the exported surface, the kernels and the preserved
/// names.
fn live_symbols<'m>(module: &'m Module, preserved: &BTreeSet<&str>) -> BTreeSet<&'m str> {
    let callees: HashMap<&str, &[String]> = module
        .functions
        .iter()
        .map(|f| (f.name.as_str(), f.calls.as_slice()))
        .chain(
            module
                .kernels
                .iter()
                .map(|k| (k.name.as_str(), k.calls.as_slice())),
        )
        .collect();

    let mut queue: VecDeque<&str> = module
        .variables
        .iter()
        .filter(|v| v.exported)
        .map(|v| v.name.as_str())
        .chain(
            module
                .functions
                .iter()
                .filter(|f| f.exported)
                .map(|f| f.name.as_str()),
        )
        .chain(module.kernels.iter().map(|k| k.name.as_str()))
        .chain(module.symbol_names().filter(|n| preserved.contains(n)))
        .collect();

    let mut live = BTreeSet::new();
    while let Some(name) = queue.pop_front() {
        if !live.insert(name) {
            continue;
        }
        if let Some(calls) = callees.get(name) {
            queue.extend(
                calls
                    .iter()
                    .filter_map(|c| callees.get_key_value(c.as_str()).map(|(k, _)| *k)),
            );
        }
    }
    live
}

/// Grows the body by `size` bytes on behalf of `name`, returning the new end.
fn extent(start: usize, size: usize, name: &str) -> Result<usize, BackendError> {
    start
        .checked_add(size)
        .filter(|end| *end <= MAX_IMAGE_SIZE)
        .ok_or_else(|| BackendError::TooLarge {
            name: name.to_owned(),
        })
}

fn emit(
    module: &Module,
    request: &CompileRequest,
    messages: &mut Vec<String>,
) -> Result<Image, BackendError> {
    let preserved: BTreeSet<&str> = request
        .preserved_symbols
        .iter()
        .map(String::as_str)
        .collect();
    for name in &preserved {
        if !module.defines(name) {
            messages.push(format!("warning: preserved symbol {name} is not defined"));
        }
    }

    let keep_all = request.flags.contains(FLAG_NO_DCE);
    let live = live_symbols(module, &preserved);
    let is_kept = |name: &str| keep_all || live.contains(name);

    let mut header = Header {
        kind: request.kind,
        reloc_model: request.reloc_model,
        ..Default::default()
    };
    let mut body = vec![];

    for func in &module.functions {
        if !is_kept(func.name.as_str()) {
            messages.push(format!("removed unused function {}", func.name));
            continue;
        }
        let (offset, size) = emit_code(
            &mut body,
            &mut header.relocations,
            &func.name,
            func.size,
            &func.calls,
        )?;
        let idx = header.symbols.push_and_get_key(Symbol {
            name: func.name.clone(),
            kind: SymbolKind::Function,
            offset,
            size,
            object: false,
        });
        if func.exported || preserved.contains(func.name.as_str()) {
            header.export_funcs.push(idx);
        }
    }
    for kernel in &module.kernels {
        let (offset, size) = emit_code(
            &mut body,
            &mut header.relocations,
            &kernel.name,
            kernel.size,
            &kernel.calls,
        )?;
        let idx = header.symbols.push_and_get_key(Symbol {
            name: kernel.name.clone(),
            kind: SymbolKind::ForEach,
            offset,
            size,
            object: false,
        });
        header.export_for_each.push(ForEachExport {
            symbol: idx,
            signature: kernel.signature,
        });
    }
    let text_size = body.len();

    for var in &module.variables {
        if !is_kept(var.name.as_str()) {
            messages.push(format!("removed unused variable {}", var.name));
            continue;
        }
        let offset = body.len();
        let size = var.ty.size();
        body.resize(extent(offset, size, &var.name)?, 0);
        let object = matches!(var.ty, crate::ir::VarType::Object);
        let idx = header.symbols.push_and_get_key(Symbol {
            name: var.name.clone(),
            kind: SymbolKind::Variable,
            offset,
            size,
            object,
        });
        if var.exported || preserved.contains(var.name.as_str()) {
            if object {
                header.object_slots.push(header.export_vars.len() as u32);
            }
            header.export_vars.push(idx);
        }
    }

    header.sections.push(Section {
        name: ".text".to_owned(),
        offset: 0,
        size: text_size,
    });
    header.sections.push(Section {
        name: ".data".to_owned(),
        offset: text_size,
        size: body.len() - text_size,
    });
    if request.flags.contains(FLAG_DEBUG_INFO) {
        let debug = header.symbols.iter().map(|s| s.name.as_str()).join("\n");
        extent(body.len(), debug.len(), ".debug")?;
        header.sections.push(Section {
            name: ".debug".to_owned(),
            offset: body.len(),
            size: debug.len(),
        });
        body.extend_from_slice(debug.as_bytes());
    }
    header.pragmas = module.pragmas.clone();

    match request.kind {
        ObjectKind::Relocatable => {
            header.imports = header
                .relocations
                .iter()
                .filter(|r| header.find_symbol(&r.target).is_none())
                .map(|r| r.target.clone())
                .unique()
                .collect();
        }
        _ => apply_relocations(&mut header, &mut body),
    }

    Ok(Image { header, body })
}

/// Lays out one function: a call slot per call site, then filler up to the
/// declared size.
fn emit_code(
    body: &mut Vec<u8>,
    relocations: &mut Vec<Relocation>,
    name: &str,
    size: usize,
    calls: &[String],
) -> Result<(usize, usize), BackendError> {
    let offset = body.len();
    let slots = calls
        .len()
        .checked_mul(CALL_SLOT)
        .ok_or_else(|| BackendError::TooLarge {
            name: name.to_owned(),
        })?;
    let size = size.max(slots);
    extent(offset, size, name)?;
    for (i, target) in calls.iter().enumerate() {
        relocations.push(Relocation {
            offset: offset + i * CALL_SLOT,
            target: target.clone(),
        });
        body.extend_from_slice(&[0; CALL_SLOT]);
    }
    let pattern: &[u8] = if name.is_empty() { &[0xcc] } else { name.as_bytes() };
    body.extend(pattern.iter().cycle().take(size - slots));
    Ok((offset, size))
}

/// Patches call slots whose target is defined in the image. Calls to
/// anything else become imports. Every relocation must lie inside `body`,
/// which [`Image::decode`] checks for objects read back from bytes.
fn apply_relocations(header: &mut Header, body: &mut [u8]) {
    let relocations = std::mem::take(&mut header.relocations);
    let mut imports = vec![];
    for reloc in relocations {
        match header.find_symbol(&reloc.target) {
            Some(idx) => {
                let target = header.symbols[idx].offset as u64;
                body[reloc.offset..reloc.offset + CALL_SLOT]
                    .copy_from_slice(&target.to_le_bytes());
            }
            None => imports.push(reloc.target),
        }
    }
    header.imports = imports.into_iter().unique().collect();
}
