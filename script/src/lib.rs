pub mod backend;
pub mod cache;
pub mod error;
pub mod export;
pub mod ir;
pub mod loader;
pub mod object;
pub mod script;
pub mod source;
pub mod symbol;

pub use backend::{Backend, Flags, TextBackend};
pub use cache::CacheLocation;
pub use error::{Error, ErrorCode};
pub use export::FuncInfo;
pub use object::{ObjectKind, RelocModel};
pub use script::{Script, ScriptStatus};
