use crate::object::{Header, SymbolIndex, SymbolKind};

/// A named entry at an offset into the image's sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDescriptor {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Function descriptor with a resolved address, as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncInfo {
    pub name: String,
    pub address: usize,
    pub size: usize,
}

/// Everything a compiled unit advertises to its runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportTable {
    pub vars: Vec<Export>,
    pub funcs: Vec<Export>,
    pub for_each: Vec<Export>,
    pub for_each_signatures: Vec<u32>,
    pub pragmas: Vec<(String, String)>,
    pub func_infos: Vec<FuncDescriptor>,
    pub object_slots: Vec<u32>,
}

impl ExportTable {
    pub fn from_header(header: &Header) -> Self {
        let export = |idx: SymbolIndex| {
            let symbol = &header.symbols[idx];
            Export {
                name: symbol.name.clone(),
                offset: symbol.offset,
            }
        };
        Self {
            vars: header.export_vars.iter().copied().map(export).collect(),
            funcs: header.export_funcs.iter().copied().map(export).collect(),
            for_each: header
                .export_for_each
                .iter()
                .map(|f| export(f.symbol))
                .collect(),
            for_each_signatures: header.export_for_each.iter().map(|f| f.signature).collect(),
            pragmas: header.pragmas.clone(),
            func_infos: header
                .symbols
                .iter()
                .filter(|s| s.kind != SymbolKind::Variable)
                .map(|s| FuncDescriptor {
                    name: s.name.clone(),
                    offset: s.offset,
                    size: s.size,
                })
                .collect(),
            object_slots: header.object_slots.clone(),
        }
    }
}

/// Copies as many items as fit into `out`, returning how many were written.
pub(crate) fn fill<T, U>(out: &mut [U], items: impl IntoIterator<Item = T>) -> usize
where
    T: Into<U>,
{
    let mut written = 0;
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.into();
        written += 1;
    }
    written
}
