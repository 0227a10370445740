use std::fmt::Debug;

/// Caller-supplied resolution for names a compiled unit does not define.
pub type SymbolLookupFn = dyn Fn(&str) -> Option<usize>;

#[derive(Default)]
pub struct SymbolResolver {
    preserved: Vec<String>,
    lookup: Option<Box<SymbolLookupFn>>,
}

impl Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("preserved", &self.preserved)
            .field("lookup", &self.lookup.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl SymbolResolver {
    pub fn mark_external_symbol(&mut self, name: impl Into<String>) {
        self.preserved.push(name.into());
    }

    /// Names the backend must keep defined and visible.
    pub fn preserved(&self) -> &[String] {
        &self.preserved
    }

    pub fn register(&mut self, lookup: impl Fn(&str) -> Option<usize> + 'static) {
        self.lookup = Some(Box::new(lookup));
    }

    pub fn resolve_external(&self, name: &str) -> Option<usize> {
        self.lookup.as_ref().and_then(|f| f(name))
    }
}
