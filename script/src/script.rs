use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info};

use crate::{
    backend::{self, Backend, CompileRequest, Flags, TextBackend},
    cache::{self, CacheHit, CacheInfo, CacheKey, CacheLocation},
    error::{Error, ErrorAccumulator, ErrorCode},
    export::{fill, FuncInfo},
    ir::Module,
    loader::LoadedObject,
    object::{ObjectKind, RelocModel},
    source::{LoadedSource, Payload, Selection, SourceList},
    symbol::SymbolResolver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScriptStatus {
    #[default]
    Unknown,
    Compiled,
    Cached,
}

#[derive(Debug, Default)]
enum Unit {
    #[default]
    Unknown,
    /// Built in this process. `key` is kept so the entry can be rewritten.
    Compiled {
        object: LoadedObject,
        key: Option<CacheKey>,
    },
    Cached {
        object: LoadedObject,
        info: CacheInfo,
    },
}

impl Unit {
    fn object(&self) -> Option<&LoadedObject> {
        match self {
            Unit::Unknown => None,
            Unit::Compiled { object, .. } | Unit::Cached { object, .. } => Some(object),
        }
    }
}

enum Origin {
    Compiled,
    Cached(CacheInfo),
}

/// Bytes for one object kind, and where they came from.
struct Built {
    bytes: Vec<u8>,
    key: Option<CacheKey>,
    origin: Origin,
}

/// One compilation unit: its sources, how it was built, and what it exports.
///
/// Every fallible call returns a `Result` and also records the error code,
/// so callers may instead check [`Script::take_error`] after a sequence of
/// calls.
pub struct Script {
    backend: Box<dyn Backend>,
    unit: Unit,
    cache: Option<CacheLocation>,
    sources: SourceList,
    resolver: SymbolResolver,
    error: ErrorAccumulator,
    compiler_message: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("backend", &self.backend.version())
            .field("unit", &self.unit)
            .field("cache", &self.cache)
            .field("sources", &self.sources)
            .field("resolver", &self.resolver)
            .field("error", &self.error)
            .finish()
    }
}

impl Script {
    pub fn new() -> Self {
        Self::with_backend(TextBackend)
    }

    pub fn with_backend(backend: impl Backend + 'static) -> Self {
        backend::initialize();
        Self {
            backend: Box::new(backend),
            unit: Unit::Unknown,
            cache: None,
            sources: SourceList::default(),
            resolver: SymbolResolver::default(),
            error: ErrorAccumulator::default(),
            compiler_message: None,
        }
    }

    pub fn add_source_bitcode(
        &mut self,
        slot: usize,
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        flags: Flags,
    ) -> Result<(), Error> {
        let payload = Payload::Bitcode {
            name: name.into(),
            bytes: bytes.into(),
        };
        self.add_source(slot, payload, flags)
    }

    pub fn add_source_module(
        &mut self,
        slot: usize,
        module: Arc<Module>,
        flags: Flags,
    ) -> Result<(), Error> {
        self.add_source(slot, Payload::Module(module), flags)
    }

    pub fn add_source_file(
        &mut self,
        slot: usize,
        path: impl Into<PathBuf>,
        flags: Flags,
    ) -> Result<(), Error> {
        self.add_source(slot, Payload::File(path.into()), flags)
    }

    fn add_source(&mut self, slot: usize, payload: Payload, flags: Flags) -> Result<(), Error> {
        debug!(slot, name = %payload.name(), "adding source");
        let result = self.sources.add(slot, payload, flags);
        self.error.record(result)
    }

    /// Keeps `name` defined and exported through dead-code elimination.
    pub fn mark_external_symbol(&mut self, name: impl Into<String>) {
        self.resolver.mark_external_symbol(name);
    }

    /// Resolves names the unit imports, and names [`Script::lookup`] cannot
    /// find in the unit itself. Replaces any earlier callback.
    pub fn register_symbol_callback(&mut self, lookup: impl Fn(&str) -> Option<usize> + 'static) {
        self.resolver.register(lookup);
    }

    pub fn prepare_relocatable(
        &mut self,
        cache: Option<&CacheLocation>,
        reloc_model: RelocModel,
        flags: Flags,
    ) -> Result<(), Error> {
        let result = self.prepare(cache, ObjectKind::Relocatable, reloc_model, flags);
        self.error.record(result)
    }

    pub fn prepare_executable(
        &mut self,
        cache: Option<&CacheLocation>,
        flags: Flags,
    ) -> Result<(), Error> {
        let result = self.prepare(cache, ObjectKind::Executable, RelocModel::Default, flags);
        self.error.record(result)
    }

    /// Produces a shared object and writes it to `dso_path`.
    ///
    /// With `obj_path` that relocatable object is linked as is; the registered
    /// sources and the cache are not consulted. Without it the main source is
    /// compiled position-independent first.
    pub fn prepare_shared_object(
        &mut self,
        cache: Option<&CacheLocation>,
        obj_path: Option<&Path>,
        dso_path: &Path,
        flags: Flags,
    ) -> Result<(), Error> {
        let result = self.shared_object(cache, obj_path, dso_path, flags);
        self.error.record(result)
    }

    fn prepare(
        &mut self,
        cache: Option<&CacheLocation>,
        kind: ObjectKind,
        reloc_model: RelocModel,
        flags: Flags,
    ) -> Result<(), Error> {
        self.ensure_unprepared()?;
        let cache = usable(cache);
        let built = self.obtain(
            cache,
            kind,
            reloc_model,
            flags,
            Selection::All,
            |script, sources| script.compile(sources, kind, reloc_model, flags),
        )?;
        self.commit(cache, built, |_| Ok(()))
    }

    fn shared_object(
        &mut self,
        cache: Option<&CacheLocation>,
        obj_path: Option<&Path>,
        dso_path: &Path,
        flags: Flags,
    ) -> Result<(), Error> {
        self.ensure_unprepared()?;
        // the relocatable a shared object was linked from, stored alongside it
        let mut staged = None;
        let (cache, built) = match obj_path {
            Some(path) => {
                let relocatable = fs::read(path).map_err(|e| Error::SourceUnreadable {
                    path: path.to_owned(),
                    source: e,
                })?;
                let built = Built {
                    bytes: self.link(&relocatable, flags)?,
                    key: None,
                    origin: Origin::Compiled,
                };
                (None, built)
            }
            None => {
                let cache = usable(cache);
                let built = self.obtain(
                    cache,
                    ObjectKind::SharedObject,
                    RelocModel::Pic,
                    flags,
                    Selection::MainOnly,
                    |script, _| {
                        let relocatable = script.obtain(
                            cache,
                            ObjectKind::Relocatable,
                            RelocModel::Pic,
                            flags,
                            Selection::MainOnly,
                            |script, sources| {
                                script.compile(
                                    sources,
                                    ObjectKind::Relocatable,
                                    RelocModel::Pic,
                                    flags,
                                )
                            },
                        )?;
                        let bytes = script.link(&relocatable.bytes, flags)?;
                        staged = Some(relocatable);
                        Ok(bytes)
                    },
                )?;
                (cache, built)
            }
        };

        self.commit(cache, built, |bytes| {
            if let Some(relocatable) = &staged {
                store(
                    cache,
                    relocatable.key.as_ref(),
                    &relocatable.origin,
                    &relocatable.bytes,
                )?;
            }
            cache::write_atomic(dso_path, bytes).map_err(|e| Error::OutputWrite {
                path: dso_path.to_owned(),
                source: e,
            })?;
            info!(path = %dso_path.display(), "wrote shared object");
            Ok(())
        })
    }

    /// Reuses a valid cache entry, or runs `produce`. Nothing is written;
    /// see [`Script::commit`].
    fn obtain(
        &mut self,
        cache: Option<&CacheLocation>,
        kind: ObjectKind,
        reloc_model: RelocModel,
        flags: Flags,
        selection: Selection,
        produce: impl FnOnce(&mut Self, &[LoadedSource]) -> Result<Vec<u8>, Error>,
    ) -> Result<Built, Error> {
        let sources = self.sources.load(selection)?;
        let key = cache.and_then(|_| {
            CacheKey::new(
                self.backend.version(),
                kind,
                reloc_model,
                flags,
                &sources,
                self.resolver.preserved(),
            )
        });

        if let (Some(location), Some(key)) = (cache, &key) {
            if let Some(CacheHit {
                info,
                bytes: Some(bytes),
            }) = cache::try_load(location, key, false)
            {
                info!(?kind, name = %location.name, "using cached object");
                return Ok(Built {
                    bytes,
                    key: Some(key.clone()),
                    origin: Origin::Cached(info),
                });
            }
        }

        let bytes = produce(self, &sources)?;
        Ok(Built {
            bytes,
            key,
            origin: Origin::Compiled,
        })
    }

    fn compile(
        &mut self,
        sources: &[LoadedSource],
        kind: ObjectKind,
        reloc_model: RelocModel,
        flags: Flags,
    ) -> Result<Vec<u8>, Error> {
        let request = CompileRequest {
            sources,
            kind,
            reloc_model,
            flags,
            preserved_symbols: self.resolver.preserved(),
        };
        match self.backend.compile(&request) {
            Ok(output) => {
                for message in &output.messages {
                    debug!(%message, "backend");
                }
                self.compiler_message =
                    (!output.messages.is_empty()).then(|| output.messages.join("\n"));
                info!(?kind, ?reloc_model, size = output.object.len(), "compiled");
                Ok(output.object)
            }
            Err(e) => {
                self.compiler_message = Some(e.to_string());
                Err(Error::Compile(e))
            }
        }
    }

    fn link(&mut self, relocatable: &[u8], flags: Flags) -> Result<Vec<u8>, Error> {
        match self.backend.link_shared(relocatable, flags) {
            Ok(bytes) => {
                info!(size = bytes.len(), "linked shared object");
                Ok(bytes)
            }
            Err(e) => {
                self.compiler_message = Some(e.to_string());
                Err(Error::Link(e))
            }
        }
    }

    /// Loads `built`, then stores it in the cache and hands its bytes to
    /// `persist`. The script changes only if all of that succeeds, so an
    /// object that fails to load never reaches the cache.
    fn commit(
        &mut self,
        cache: Option<&CacheLocation>,
        built: Built,
        persist: impl FnOnce(&[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let Built { bytes, key, origin } = built;
        let object = LoadedObject::load(bytes, &self.resolver)?;
        store(cache, key.as_ref(), &origin, object.bytes())?;
        persist(object.bytes())?;
        self.cache = key.as_ref().and(cache).cloned();
        self.unit = match origin {
            Origin::Compiled => Unit::Compiled { object, key },
            Origin::Cached(info) => Unit::Cached { object, info },
        };
        info!(status = ?self.status(), kind = ?self.object_kind(), "prepared script");
        Ok(())
    }

    fn ensure_unprepared(&self) -> Result<(), Error> {
        match self.unit.object() {
            Some(object) => Err(Error::AlreadyPrepared {
                kind: object.kind(),
            }),
            None => Ok(()),
        }
    }

    /// Rewrites the cache entry for a freshly compiled script.
    pub fn write_cache(&self) -> Result<(), Error> {
        let result = match (&self.unit, &self.cache) {
            (
                Unit::Compiled {
                    object,
                    key: Some(key),
                },
                Some(location),
            ) => cache::write(location, key, object.bytes()).map(|_| ()),
            (Unit::Compiled { .. }, _) => Err(Error::NoCacheLocation),
            _ => Err(Error::NotCompiled),
        };
        self.error.record(result)
    }

    /// Whether the registered sources could be cached at all.
    pub fn is_cacheable(&self) -> bool {
        self.sources.is_fingerprintable() && !cache::caching_disabled()
    }

    pub fn status(&self) -> ScriptStatus {
        match self.unit {
            Unit::Unknown => ScriptStatus::Unknown,
            Unit::Compiled { .. } => ScriptStatus::Compiled,
            Unit::Cached { .. } => ScriptStatus::Cached,
        }
    }

    pub fn object_kind(&self) -> ObjectKind {
        self.unit.object().map_or(ObjectKind::Unknown, LoadedObject::kind)
    }

    /// Set only when the script was prepared against a cache and its sources
    /// could be cached.
    pub fn cache_location(&self) -> Option<&CacheLocation> {
        self.cache.as_ref()
    }

    /// Sidecar of the entry this script was loaded from.
    pub fn cache_info(&self) -> Option<&CacheInfo> {
        match &self.unit {
            Unit::Cached { info, .. } => Some(info),
            _ => None,
        }
    }

    /// Diagnostics from the last backend invocation.
    pub fn compiler_error_message(&self) -> Option<&str> {
        self.compiler_message.as_deref()
    }

    pub fn take_error(&self) -> ErrorCode {
        self.error.take_error()
    }

    pub fn set_error(&self, code: ErrorCode) {
        self.error.set_error(code);
    }

    fn loaded(&self) -> Option<&LoadedObject> {
        let object = self.unit.object();
        if object.is_none() {
            self.error.set_error(ErrorCode::NotPrepared);
        }
        object
    }

    /// Finds `name` in the unit, falling back to the symbol callback.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        let object = self.loaded()?;
        object
            .find(name)
            .or_else(|| object.imports().get(name).copied())
            .or_else(|| self.resolver.resolve_external(name))
    }

    pub fn elf(&self) -> Option<&[u8]> {
        self.loaded().map(LoadedObject::bytes)
    }

    pub fn elf_size(&self) -> usize {
        self.elf().map_or(0, <[u8]>::len)
    }

    pub fn pragma_count(&self) -> usize {
        self.loaded().map_or(0, |o| o.exports().pragmas.len())
    }

    /// Fills matching key/value pairs, as many as both buffers hold.
    pub fn pragma_list<'a>(&'a self, keys: &mut [&'a str], values: &mut [&'a str]) -> usize {
        let Some(object) = self.loaded() else {
            return 0;
        };
        let mut written = 0;
        for ((key, value), (k, v)) in keys
            .iter_mut()
            .zip(values.iter_mut())
            .zip(&object.exports().pragmas)
        {
            *key = k.as_str();
            *value = v.as_str();
            written += 1;
        }
        written
    }

    pub fn func_count(&self) -> usize {
        self.loaded().map_or(0, |o| o.exports().func_infos.len())
    }

    pub fn func_info_list(&self, out: &mut [FuncInfo]) -> usize {
        let Some(object) = self.loaded() else {
            return 0;
        };
        fill(
            out,
            object.exports().func_infos.iter().map(|f| FuncInfo {
                name: f.name.clone(),
                address: object.address(f.offset),
                size: f.size,
            }),
        )
    }

    pub fn object_slot_count(&self) -> usize {
        self.loaded().map_or(0, |o| o.exports().object_slots.len())
    }

    pub fn object_slot_list(&self, out: &mut [u32]) -> usize {
        self.loaded()
            .map_or(0, |o| fill(out, o.exports().object_slots.iter().copied()))
    }

    pub fn export_for_each_signature_list(&self, out: &mut [u32]) -> usize {
        self.loaded().map_or(0, |o| {
            fill(out, o.exports().for_each_signatures.iter().copied())
        })
    }
}

/// Count, address list and name list for one export category.
macro_rules! export_accessors {
    {
        $(($field:ident, $count:ident, $list:ident, $names:ident),)*
    } => {
        impl Script {
            $(
                pub fn $count(&self) -> usize {
                    self.loaded().map_or(0, |o| o.exports().$field.len())
                }

                pub fn $list(&self, out: &mut [usize]) -> usize {
                    self.loaded().map_or(0, |o| {
                        fill(out, o.exports().$field.iter().map(|e| o.address(e.offset)))
                    })
                }

                /// Appends an owned copy of every name.
                pub fn $names(&self, out: &mut Vec<String>) -> usize {
                    self.loaded().map_or(0, |o| {
                        let names = &o.exports().$field;
                        out.extend(names.iter().map(|e| e.name.clone()));
                        names.len()
                    })
                }
            )*
        }
    };
}

export_accessors! {
    (vars, export_var_count, export_var_list, export_var_name_list),
    (funcs, export_func_count, export_func_list, export_func_name_list),
    (for_each, export_for_each_count, export_for_each_list, export_for_each_name_list),
}

/// Writes a freshly compiled object to its cache entry. Cached objects are
/// left alone.
fn store(
    cache: Option<&CacheLocation>,
    key: Option<&CacheKey>,
    origin: &Origin,
    bytes: &[u8],
) -> Result<(), Error> {
    if let (Origin::Compiled, Some(location), Some(key)) = (origin, cache, key) {
        cache::write(location, key, bytes)?;
    }
    Ok(())
}

fn usable(cache: Option<&CacheLocation>) -> Option<&CacheLocation> {
    if cache.is_some() && cache::caching_disabled() {
        debug!("caching disabled by {}", cache::NOCACHE_ENV);
        return None;
    }
    cache
}
