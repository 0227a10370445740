//! The portable module format accepted by the text backend.

use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use from_pest::FromPest;
use itertools::Itertools;
use pest::Parser as _;

mod ast;

pub use ast::Rule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

impl Location {
    fn of(span: pest::Span) -> Self {
        let (line, col) = span.start_pos().line_col();
        Location { line, col }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error:\n{0}")]
    Parse(#[from] Box<pest::error::Error<Rule>>),
    #[error("malformed syntax tree: {0}")]
    Ast(String),
    #[error("at {location}, {name:?} already defined")]
    AlreadyDefined { location: Location, name: String },
    #[error("at {location}, {text} is out of range")]
    OutOfRange { location: Location, text: String },
    #[error("{name:?} is defined by both the main and the library module")]
    DuplicateSymbol { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Bytes(usize),
    Object,
}

impl VarType {
    pub fn size(self) -> usize {
        match self {
            VarType::Bytes(n) => n,
            VarType::Object => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub ty: VarType,
    pub exported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub size: usize,
    pub calls: Vec<String>,
    pub exported: bool,
}

/// A per-element kernel. Kernels are always visible to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub name: String,
    pub signature: u32,
    pub size: usize,
    pub calls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Module {
    pub variables: Vec<Variable>,
    pub functions: Vec<Function>,
    pub kernels: Vec<Kernel>,
    pub pragmas: Vec<(String, String)>,
}

impl Module {
    pub fn parse(text: &str) -> Result<Module, Error> {
        let mut pairs = ast::ModuleParser::parse(Rule::file, text).map_err(Box::new)?;
        let file = ast::File::from_pest(&mut pairs).map_err(|e| Error::Ast(format!("{:?}", e)))?;

        let mut builder = Builder::default();
        for decl in file.decls {
            builder.decl(decl)?;
        }
        Ok(builder.module)
    }

    pub fn symbol_names(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .map(|v| v.name.as_str())
            .chain(self.functions.iter().map(|f| f.name.as_str()))
            .chain(self.kernels.iter().map(|k| k.name.as_str()))
    }

    pub fn defines(&self, name: &str) -> bool {
        self.symbol_names().any(|n| n == name)
    }

    /// Merges a library module into this one. Library symbols are internal to
    /// the result.
    pub fn link(mut self, library: Module) -> Result<Module, Error> {
        if let Some(name) = library.symbol_names().find(|n| self.defines(n)) {
            return Err(Error::DuplicateSymbol {
                name: name.to_owned(),
            });
        }
        self.variables
            .extend(library.variables.into_iter().map(|v| Variable {
                exported: false,
                ..v
            }));
        self.functions
            .extend(library.functions.into_iter().map(|f| Function {
                exported: false,
                ..f
            }));
        self.kernels.extend(library.kernels);
        self.pragmas.extend(library.pragmas);
        Ok(self)
    }
}

#[derive(Default)]
struct Builder {
    module: Module,
    names: BTreeSet<String>,
}

impl Builder {
    fn decl(&mut self, decl: ast::Decl) -> Result<(), Error> {
        match decl {
            ast::Decl::Var(var) => {
                let name = self.define(&var.name)?;
                let ty = match var.ty {
                    ast::VarType::Object(_) => VarType::Object,
                    ast::VarType::Bytes(size) => VarType::Bytes(int(&size)?),
                };
                self.module.variables.push(Variable {
                    name,
                    ty,
                    exported: var.exported.is_some(),
                });
            }
            ast::Decl::Func(func) => {
                let name = self.define(&func.name)?;
                self.module.functions.push(Function {
                    name,
                    size: int(&func.size)?,
                    calls: calls(func.calls),
                    exported: func.exported.is_some(),
                });
            }
            ast::Decl::ForEach(kernel) => {
                let name = self.define(&kernel.name)?;
                self.module.kernels.push(Kernel {
                    name,
                    signature: int(&kernel.signature)?,
                    size: int(&kernel.size)?,
                    calls: calls(kernel.calls),
                });
            }
            ast::Decl::Pragma(pragma) => {
                self.module
                    .pragmas
                    .push((pragma.key.value, pragma.value.value));
            }
        }
        Ok(())
    }

    fn define(&mut self, ident: &ast::Identifier) -> Result<String, Error> {
        let name = ident.as_str().to_owned();
        if !self.names.insert(name.clone()) {
            return Err(Error::AlreadyDefined {
                location: Location::of(ident.span),
                name,
            });
        }
        Ok(name)
    }
}

fn int<T: FromStr>(i: &ast::Int) -> Result<T, Error> {
    i.span.as_str().parse().map_err(|_| Error::OutOfRange {
        location: Location::of(i.span),
        text: i.span.as_str().to_owned(),
    })
}

fn calls(calls: Option<ast::Calls>) -> Vec<String> {
    calls
        .map(|c| c.targets.iter().map(|t| t.as_str().to_owned()).collect_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        // a small module
        pragma "version" = "1";
        pragma "java_package_name" = "com.example";
        export var counter : 4;
        export var alloc : object;
        var scratch : 16;
        export func root size 32 calls [helper, rsDebug];
        func helper size 16;
        foreach kernel signature 31 size 64 calls [helper];
    "#;

    #[test]
    fn parses_declarations() {
        let m = Module::parse(SAMPLE).unwrap();
        assert_eq!(
            m.pragmas,
            vec![
                ("version".to_owned(), "1".to_owned()),
                ("java_package_name".to_owned(), "com.example".to_owned()),
            ]
        );
        assert_eq!(m.variables.len(), 3);
        assert_eq!(m.variables[1].ty, VarType::Object);
        assert!(!m.variables[2].exported);
        assert_eq!(
            m.functions[0],
            Function {
                name: "root".into(),
                size: 32,
                calls: vec!["helper".into(), "rsDebug".into()],
                exported: true,
            }
        );
        assert!(m.functions[1].calls.is_empty());
        assert_eq!(m.kernels[0].signature, 31);
    }

    #[test]
    fn empty_module() {
        assert_eq!(Module::parse("").unwrap(), Module::default());
        assert_eq!(Module::parse("  // nothing\n").unwrap(), Module::default());
    }

    #[test]
    fn rejects_duplicates() {
        let err = Module::parse("func a size 1;\nvar a : 4;").unwrap_err();
        match err {
            Error::AlreadyDefined { location, name } => {
                assert_eq!(name, "a");
                assert_eq!(location, Location { line: 2, col: 5 });
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn rejects_syntax_errors() {
        assert!(matches!(
            Module::parse("func a;"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn rejects_huge_signature() {
        assert!(matches!(
            Module::parse("foreach k signature 99999999999 size 1;"),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn link_internalizes_library() {
        let main = Module::parse("export func root size 8 calls [util];").unwrap();
        let lib = Module::parse("export func util size 8; export var table : 4;").unwrap();
        let linked = main.link(lib).unwrap();
        assert_eq!(linked.functions.len(), 2);
        assert!(linked.functions[0].exported);
        assert!(!linked.functions[1].exported);
        assert!(!linked.variables[0].exported);
    }

    #[test]
    fn link_rejects_duplicates() {
        let main = Module::parse("func f size 8;").unwrap();
        let lib = Module::parse("var f : 4;").unwrap();
        assert!(matches!(
            main.link(lib),
            Err(Error::DuplicateSymbol { name }) if name == "f"
        ));
    }
}
