use pest_ast::FromPest;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "ir/module.pest"]
pub struct ModuleParser;

fn span_into_string_literal(span: pest::Span) -> String {
    let str = span.as_str();
    let str = &str[1..str.len() - 1];
    str.replace("\\n", "\n").replace("\\\"", "\"")
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::identifier))]
pub struct Identifier<'t> {
    #[pest_ast(outer())]
    pub span: pest::Span<'t>,
}

impl<'t> Identifier<'t> {
    pub fn as_str(&self) -> &'t str {
        self.span.as_str()
    }
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::int))]
pub struct Int<'t> {
    #[pest_ast(outer())]
    pub span: pest::Span<'t>,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::string))]
pub struct StringLiteral<'t> {
    #[pest_ast(outer())]
    pub span: pest::Span<'t>,

    #[pest_ast(outer(with(span_into_string_literal)))]
    pub value: String,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::exported))]
pub struct Exported;

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::object_type))]
pub struct ObjectType;

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::var_type))]
pub enum VarType<'t> {
    Object(ObjectType),
    Bytes(Int<'t>),
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::calls))]
pub struct Calls<'t> {
    pub targets: Vec<Identifier<'t>>,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::var_decl))]
pub struct VarDecl<'t> {
    #[pest_ast(outer())]
    pub span: pest::Span<'t>,
    pub exported: Option<Exported>,
    pub name: Identifier<'t>,
    pub ty: VarType<'t>,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::func_decl))]
pub struct FuncDecl<'t> {
    #[pest_ast(outer())]
    pub span: pest::Span<'t>,
    pub exported: Option<Exported>,
    pub name: Identifier<'t>,
    pub size: Int<'t>,
    pub calls: Option<Calls<'t>>,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::foreach_decl))]
pub struct ForEachDecl<'t> {
    #[pest_ast(outer())]
    pub span: pest::Span<'t>,
    pub name: Identifier<'t>,
    pub signature: Int<'t>,
    pub size: Int<'t>,
    pub calls: Option<Calls<'t>>,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::pragma_decl))]
pub struct PragmaDecl<'t> {
    pub key: StringLiteral<'t>,
    pub value: StringLiteral<'t>,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::decl))]
pub enum Decl<'t> {
    Var(VarDecl<'t>),
    Func(FuncDecl<'t>),
    ForEach(ForEachDecl<'t>),
    Pragma(PragmaDecl<'t>),
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::file))]
pub struct File<'t> {
    pub decls: Vec<Decl<'t>>,
    eoi: EOI,
}

#[derive(Debug, FromPest)]
#[pest_ast(rule(Rule::EOI))]
struct EOI;
