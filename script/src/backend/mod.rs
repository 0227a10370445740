use std::{ops::BitOr, sync::Once};

use derive_more::derive::{From, Into};
use serde::{Deserialize, Serialize};

use crate::{
    ir,
    object::{self, ObjectKind, RelocModel},
    source::LoadedSource,
};

pub mod text;

pub use text::TextBackend;

/// Opaque bitmask threaded from callers to the backend.
///
/// The driver never looks inside; only a backend assigns meaning to bits.
#[derive(
    From, Into, Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Flags(u64);

impl Flags {
    pub const NONE: Flags = Flags(0);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

pub struct CompileRequest<'a> {
    /// Main source first, then the library source if any.
    pub sources: &'a [LoadedSource],
    pub kind: ObjectKind,
    pub reloc_model: RelocModel,
    pub flags: Flags,
    /// Names that must stay defined and visible in the output.
    pub preserved_symbols: &'a [String],
}

#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub object: Vec<u8>,
    pub messages: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("in {name}: {error}")]
    Module { name: String, error: ir::Error },
    #[error("in {name}: bitcode is not valid UTF-8")]
    Encoding { name: String },
    #[error(transparent)]
    Link(ir::Error),
    #[error("invalid object: {0}")]
    Object(#[from] object::DecodeError),
    #[error("could not encode object: {0}")]
    Encode(#[from] object::EncodeError),
    #[error("{name} does not fit in an object image")]
    TooLarge { name: String },
    #[error("cannot produce {0:?} objects")]
    UnsupportedKind(ObjectKind),
    #[error("cannot link a {kind:?} object built with {reloc_model:?}, expected a position-independent relocatable")]
    NotLinkable {
        kind: ObjectKind,
        reloc_model: RelocModel,
    },
}

/// The code generator the driver delegates to.
pub trait Backend {
    /// Identifies the backend build; recorded in cache entries so that a
    /// different backend never reuses another's output.
    fn version(&self) -> &str;

    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, BackendError>;

    /// Links a relocatable object into a shared object.
    fn link_shared(&self, object: &[u8], flags: Flags) -> Result<Vec<u8>, BackendError>;
}

static INIT: Once = Once::new();

/// Process-wide backend setup. Safe to call any number of times; only the
/// first call does anything.
pub fn initialize() {
    INIT.call_once(|| {
        tracing::debug!(version = text::VERSION, "initializing code generation backend");
    });
}

/// Whether [`initialize`] has run in this process.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
