use la_arena::{Arena, Idx};
use smol_str::SmolStr;
pub use skink_lexer::Span;

// ── ID types ──────────────────────────────────────────────────────

pub type ExprId = Idx<Expr>;
pub type TypeExprId = Idx<TypeExpr>;
pub type DatumId = Idx<Datum>;

// ── Program ───────────────────────────────────────────────────────

/// A parsed compilation unit. All nodes live in the arenas below and are
/// dropped together with the `Program`; ids are dense and allocated in
/// creation order.
#[derive(Debug, Clone)]
pub struct Program {
    /// Top-level forms in source order.
    pub forms: Vec<ExprId>,
    pub exprs: Arena<Expr>,
    pub type_exprs: Arena<TypeExpr>,
    pub datums: Arena<Datum>,
}

impl Program {
    pub fn new() -> Self {
        Self {
            forms: Vec::new(),
            exprs: Arena::new(),
            type_exprs: Arena::new(),
            datums: Arena::new(),
        }
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

// ── Expressions ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(SmolStr),
    Char(char),
    /// Variable reference; resolved to a binding after name resolution.
    Ident(SmolStr),
    /// `(lambda (params...) body...)`
    Lambda {
        params: Vec<Param>,
        return_ann: Option<TypeExprId>,
        body: ExprId,
    },
    /// `(define name value)`; the `(define (f x) ...)` sugar is expanded
    /// into a lambda during parsing.
    Define {
        name: SmolStr,
        name_span: Span,
        value: ExprId,
    },
    /// `(if test then else?)`; a missing alternate means "unspecified".
    If {
        test: ExprId,
        then_branch: ExprId,
        else_branch: Option<ExprId>,
    },
    /// `(let ...)`, `(let* ...)` or `(letrec ...)`.
    Let {
        kind: LetKind,
        bindings: Vec<LetBinding>,
        body: ExprId,
    },
    /// `(set! name value)`
    Set {
        name: SmolStr,
        name_span: Span,
        value: ExprId,
    },
    /// `(begin exprs...)`
    Begin(Vec<ExprId>),
    /// `(quote datum)` or `'datum`. Quoted data is a separate tree; symbols
    /// inside it never resolve to bindings.
    Quote(DatumId),
    /// `(and exprs...)`, any arity.
    And(Vec<ExprId>),
    /// `(or exprs...)`, any arity.
    Or(Vec<ExprId>),
    /// Function application.
    Call { callee: ExprId, args: Vec<ExprId> },
    /// Standalone signature declaration: `(: name (-> args... ret))`.
    TypeDecl { name: SmolStr, ann: TypeExprId },
    /// Placeholder left behind by error recovery. Never elided; poisons
    /// every ancestor up to the enclosing top-level form.
    Erroneous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetKind {
    Let,
    Star,
    Rec,
}

/// Lambda parameter, optionally annotated: `x` or `[x : integer]`.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: SmolStr,
    pub name_span: Span,
    pub ann: Option<TypeExprId>,
    pub span: Span,
}

/// One binding of a let form: `(name value)` or `([name : type] value)`.
#[derive(Debug, Clone)]
pub struct LetBinding {
    pub name: SmolStr,
    pub name_span: Span,
    pub ann: Option<TypeExprId>,
    pub value: ExprId,
    pub span: Span,
}

// ── Type annotations ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypeExprKind {
    Int,
    Float,
    Bool,
    Str,
    Char,
    Symbol,
    Void,
    /// `any`: compatible with every type.
    Unknown,
    Pair(TypeExprId, TypeExprId),
    Vector(TypeExprId),
    Fn {
        params: Vec<TypeExprId>,
        ret: TypeExprId,
    },
}

// ── Quoted data ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Datum {
    pub kind: DatumKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum DatumKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(SmolStr),
    Char(char),
    Symbol(SmolStr),
    /// Proper list when `tail` is `None`, dotted pair chain otherwise.
    List {
        elems: Vec<DatumId>,
        tail: Option<DatumId>,
    },
}

/// Render a datum in its canonical external form.
pub fn render_datum(program: &Program, id: DatumId) -> String {
    let mut out = String::new();
    write_datum(program, id, &mut out);
    out
}

fn write_datum(program: &Program, id: DatumId, out: &mut String) {
    match &program.datums[id].kind {
        DatumKind::Int(n) => out.push_str(&n.to_string()),
        DatumKind::Float(f) => out.push_str(&format!("{:?}", f)),
        DatumKind::Bool(b) => out.push_str(if *b { "#t" } else { "#f" }),
        DatumKind::Str(s) => out.push_str(&format!("{:?}", s)),
        DatumKind::Char(c) => out.push_str(&render_char(*c)),
        DatumKind::Symbol(s) => out.push_str(s),
        DatumKind::List { elems, tail } => {
            out.push('(');
            for (i, &e) in elems.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_datum(program, e, out);
            }
            if let Some(t) = tail {
                out.push_str(" . ");
                write_datum(program, *t, out);
            }
            out.push(')');
        }
    }
}

fn render_char(c: char) -> String {
    match c {
        ' ' => "#\\space".into(),
        '\n' => "#\\newline".into(),
        '\t' => "#\\tab".into(),
        '\r' => "#\\return".into(),
        '\0' => "#\\null".into(),
        other => format!("#\\{}", other),
    }
}

// ── Pretty printer ────────────────────────────────────────────────

/// Render an expression back to a compact s-expression. Used for debug
/// logging and test assertions; not guaranteed to round-trip whitespace.
pub fn render_expr(program: &Program, id: ExprId) -> String {
    let mut out = String::new();
    write_expr(program, id, &mut out);
    out
}

/// Render every top-level form, one per line.
pub fn render_program(program: &Program) -> String {
    let mut out = String::new();
    for &form in &program.forms {
        write_expr(program, form, &mut out);
        out.push('\n');
    }
    out
}

fn write_expr(program: &Program, id: ExprId, out: &mut String) {
    match &program.exprs[id].kind {
        ExprKind::Int(n) => out.push_str(&n.to_string()),
        ExprKind::Float(f) => out.push_str(&format!("{:?}", f)),
        ExprKind::Bool(b) => out.push_str(if *b { "#t" } else { "#f" }),
        ExprKind::Str(s) => out.push_str(&format!("{:?}", s)),
        ExprKind::Char(c) => out.push_str(&render_char(*c)),
        ExprKind::Ident(name) => out.push_str(name),
        ExprKind::Lambda {
            params,
            return_ann,
            body,
        } => {
            out.push_str("(lambda (");
            for (i, p) in params.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                match p.ann {
                    Some(ann) => {
                        out.push('[');
                        out.push_str(&p.name);
                        out.push_str(" : ");
                        write_type_expr(program, ann, out);
                        out.push(']');
                    }
                    None => out.push_str(&p.name),
                }
            }
            out.push(')');
            if let Some(ret) = return_ann {
                out.push_str(" : ");
                write_type_expr(program, *ret, out);
            }
            out.push(' ');
            write_expr(program, *body, out);
            out.push(')');
        }
        ExprKind::Define { name, value, .. } => {
            out.push_str("(define ");
            out.push_str(name);
            out.push(' ');
            write_expr(program, *value, out);
            out.push(')');
        }
        ExprKind::If {
            test,
            then_branch,
            else_branch,
        } => {
            out.push_str("(if ");
            write_expr(program, *test, out);
            out.push(' ');
            write_expr(program, *then_branch, out);
            if let Some(e) = else_branch {
                out.push(' ');
                write_expr(program, *e, out);
            }
            out.push(')');
        }
        ExprKind::Let {
            kind,
            bindings,
            body,
        } => {
            out.push_str(match kind {
                LetKind::Let => "(let (",
                LetKind::Star => "(let* (",
                LetKind::Rec => "(letrec (",
            });
            for (i, b) in bindings.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push('(');
                out.push_str(&b.name);
                out.push(' ');
                write_expr(program, b.value, out);
                out.push(')');
            }
            out.push_str(") ");
            write_expr(program, *body, out);
            out.push(')');
        }
        ExprKind::Set { name, value, .. } => {
            out.push_str("(set! ");
            out.push_str(name);
            out.push(' ');
            write_expr(program, *value, out);
            out.push(')');
        }
        ExprKind::Begin(exprs) => {
            out.push_str("(begin");
            for &e in exprs {
                out.push(' ');
                write_expr(program, e, out);
            }
            out.push(')');
        }
        ExprKind::Quote(d) => {
            out.push_str("(quote ");
            write_datum(program, *d, out);
            out.push(')');
        }
        ExprKind::And(exprs) => {
            out.push_str("(and");
            for &e in exprs {
                out.push(' ');
                write_expr(program, e, out);
            }
            out.push(')');
        }
        ExprKind::Or(exprs) => {
            out.push_str("(or");
            for &e in exprs {
                out.push(' ');
                write_expr(program, e, out);
            }
            out.push(')');
        }
        ExprKind::Call { callee, args } => {
            out.push('(');
            write_expr(program, *callee, out);
            for &a in args {
                out.push(' ');
                write_expr(program, a, out);
            }
            out.push(')');
        }
        ExprKind::TypeDecl { name, ann } => {
            out.push_str("(: ");
            out.push_str(name);
            out.push(' ');
            write_type_expr(program, *ann, out);
            out.push(')');
        }
        ExprKind::Erroneous => out.push_str("#<error>"),
    }
}

fn write_type_expr(program: &Program, id: TypeExprId, out: &mut String) {
    match &program.type_exprs[id].kind {
        TypeExprKind::Int => out.push_str("integer"),
        TypeExprKind::Float => out.push_str("float"),
        TypeExprKind::Bool => out.push_str("boolean"),
        TypeExprKind::Str => out.push_str("string"),
        TypeExprKind::Char => out.push_str("char"),
        TypeExprKind::Symbol => out.push_str("symbol"),
        TypeExprKind::Void => out.push_str("void"),
        TypeExprKind::Unknown => out.push_str("any"),
        TypeExprKind::Pair(a, b) => {
            out.push_str("(pair ");
            write_type_expr(program, *a, out);
            out.push(' ');
            write_type_expr(program, *b, out);
            out.push(')');
        }
        TypeExprKind::Vector(t) => {
            out.push_str("(vector ");
            write_type_expr(program, *t, out);
            out.push(')');
        }
        TypeExprKind::Fn { params, ret } => {
            out.push_str("(->");
            for &p in params {
                out.push(' ');
                write_type_expr(program, p, out);
            }
            out.push(' ');
            write_type_expr(program, *ret, out);
            out.push(')');
        }
    }
}
