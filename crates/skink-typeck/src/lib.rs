//! Gradual type inference.
//!
//! Unification-based inference over the resolved tree, tempered by the
//! `any` type: `any` is compatible with every type and never produces a
//! mismatch, so statically-typed and dynamic regions coexist. Explicit
//! annotations and `(: name ...)` declarations seed the solver. After each
//! top-level definition is inferred, residual type variables in its
//! signature are widened to `any`, so later call sites never narrow it.

use std::collections::HashMap;
use std::fmt;

use la_arena::ArenaMap;
use log::info;
use smol_str::SmolStr;
use skink_ast::*;
use skink_diag::Diagnostics;
use skink_resolver::{BindingId, ResolveResult};

// ── Types ────────────────────────────────────────────────────────

pub type TyVarId = u32;

#[derive(Clone, Debug, PartialEq)]
pub enum Ty {
    Int,
    Float,
    Bool,
    Str,
    Char,
    Symbol,
    Void,
    /// The gradual type: compatible with everything, binds nothing.
    Unknown,
    Pair(Box<Ty>, Box<Ty>),
    Vector(Box<Ty>),
    Fn(Vec<Ty>, Box<Ty>),
    /// Unification variable.
    Var(TyVarId),
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Int => write!(f, "integer"),
            Ty::Float => write!(f, "float"),
            Ty::Bool => write!(f, "boolean"),
            Ty::Str => write!(f, "string"),
            Ty::Char => write!(f, "char"),
            Ty::Symbol => write!(f, "symbol"),
            Ty::Void => write!(f, "void"),
            Ty::Unknown => write!(f, "any"),
            Ty::Pair(a, b) => write!(f, "(pair {} {})", a, b),
            Ty::Vector(t) => write!(f, "(vector {})", t),
            Ty::Fn(params, ret) => {
                write!(f, "(->")?;
                for p in params {
                    write!(f, " {}", p)?;
                }
                write!(f, " {})", ret)
            }
            Ty::Var(id) => write!(f, "?{}", id),
        }
    }
}

impl Ty {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Float)
    }

    pub fn has_var(&self) -> bool {
        match self {
            Ty::Var(_) => true,
            Ty::Pair(a, b) => a.has_var() || b.has_var(),
            Ty::Vector(t) => t.has_var(),
            Ty::Fn(params, ret) => params.iter().any(Ty::has_var) || ret.has_var(),
            _ => false,
        }
    }
}

// ── Result ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TypeckResult {
    /// Every expression node has exactly one entry, with no variables left.
    pub expr_types: ArenaMap<ExprId, Ty>,
    /// Final type of every user binding.
    pub binding_types: ArenaMap<BindingId, Ty>,
}

impl TypeckResult {
    pub fn expr_ty(&self, id: ExprId) -> &Ty {
        self.expr_types.get(id).unwrap_or(&Ty::Unknown)
    }

    pub fn binding_ty(&self, id: BindingId) -> &Ty {
        self.binding_types.get(id).unwrap_or(&Ty::Unknown)
    }
}

pub fn infer(
    program: &Program,
    res: &ResolveResult,
    diags: &mut Diagnostics,
) -> TypeckResult {
    info!("beginning type inference");
    let mut inferencer = Inferencer::new(program, res, diags);
    inferencer.collect_declarations();
    for &form in &program.forms {
        inferencer.infer_expr(form);
        inferencer.flush_deferred();
        if let ExprKind::Define { .. } = &program.exprs[form].kind {
            inferencer.finalize_definition(form);
        }
    }
    inferencer.finish()
}

// ── Deferred constraints ─────────────────────────────────────────

/// Arithmetic is resolved after the enclosing top-level form, when operand
/// types are as concrete as they will get. Any float operand promotes the
/// result; operand variables left unconstrained default to float.
struct DeferredArith {
    result: TyVarId,
    operands: Vec<Ty>,
    span: Span,
}

/// Comparison operands are unified eagerly; the numeric requirement is
/// checked once the types have settled.
struct DeferredCompare {
    op: SmolStr,
    operand: Ty,
    span: Span,
}

// ── Inferencer ───────────────────────────────────────────────────

struct Inferencer<'a> {
    program: &'a Program,
    res: &'a ResolveResult,
    diags: &'a mut Diagnostics,

    // Substitution: index = TyVarId, value = resolved type (or None).
    subst: Vec<Option<Ty>>,

    expr_types: ArenaMap<ExprId, Ty>,
    binding_types: ArenaMap<BindingId, Ty>,

    /// Signatures from `(: name ...)` declarations, by name.
    declared: HashMap<SmolStr, Ty>,

    arith: Vec<DeferredArith>,
    compares: Vec<DeferredCompare>,
}

impl<'a> Inferencer<'a> {
    fn new(program: &'a Program, res: &'a ResolveResult, diags: &'a mut Diagnostics) -> Self {
        Self {
            program,
            res,
            diags,
            subst: Vec::new(),
            expr_types: ArenaMap::default(),
            binding_types: ArenaMap::default(),
            declared: HashMap::new(),
            arith: Vec::new(),
            compares: Vec::new(),
        }
    }

    // ── Variables and substitution ───────────────────────────────

    fn fresh_var(&mut self) -> Ty {
        let id = self.subst.len() as TyVarId;
        self.subst.push(None);
        Ty::Var(id)
    }

    fn apply(&self, ty: &Ty) -> Ty {
        match ty {
            Ty::Var(id) => {
                if let Some(Some(resolved)) = self.subst.get(*id as usize) {
                    self.apply(resolved)
                } else {
                    ty.clone()
                }
            }
            Ty::Pair(a, b) => Ty::Pair(Box::new(self.apply(a)), Box::new(self.apply(b))),
            Ty::Vector(t) => Ty::Vector(Box::new(self.apply(t))),
            Ty::Fn(params, ret) => Ty::Fn(
                params.iter().map(|p| self.apply(p)).collect(),
                Box::new(self.apply(ret)),
            ),
            _ => ty.clone(),
        }
    }

    // ── Unification ──────────────────────────────────────────────

    fn unify(&mut self, a: &Ty, b: &Ty, span: Span) {
        let a = self.apply(a);
        let b = self.apply(b);

        if a == b {
            return;
        }

        match (&a, &b) {
            // `any` absorbs mismatches without forcing the other side.
            (Ty::Unknown, _) | (_, Ty::Unknown) => {}

            // An integer coerces into an expected float; the narrowing
            // direction stays a mismatch.
            (Ty::Float, Ty::Int) => {}

            (Ty::Var(id), _) => {
                if self.occurs_in(*id, &b) {
                    let msg = format!("infinite type: ?{} = {}", id, b);
                    self.diags.error(msg, span);
                } else {
                    self.subst[*id as usize] = Some(b);
                }
            }

            (_, Ty::Var(id)) => {
                if self.occurs_in(*id, &a) {
                    let msg = format!("infinite type: ?{} = {}", id, a);
                    self.diags.error(msg, span);
                } else {
                    self.subst[*id as usize] = Some(a);
                }
            }

            (Ty::Pair(a1, b1), Ty::Pair(a2, b2)) => {
                self.unify(a1, a2, span);
                self.unify(b1, b2, span);
            }

            (Ty::Vector(e1), Ty::Vector(e2)) => self.unify(e1, e2, span),

            (Ty::Fn(p1, r1), Ty::Fn(p2, r2)) if p1.len() == p2.len() => {
                for (x, y) in p1.iter().zip(p2.iter()) {
                    self.unify(x, y, span);
                }
                self.unify(r1, r2, span);
            }

            _ => {
                let msg = format!("type mismatch: expected {}, got {}", a, b);
                self.diags.error(msg, span);
            }
        }
    }

    fn occurs_in(&self, var: TyVarId, ty: &Ty) -> bool {
        let ty = self.apply(ty);
        match &ty {
            Ty::Var(id) => *id == var,
            Ty::Pair(a, b) => self.occurs_in(var, a) || self.occurs_in(var, b),
            Ty::Vector(t) => self.occurs_in(var, t),
            Ty::Fn(params, ret) => {
                params.iter().any(|p| self.occurs_in(var, p)) || self.occurs_in(var, ret)
            }
            _ => false,
        }
    }

    // ── Annotations ──────────────────────────────────────────────

    fn lower_type(&self, id: TypeExprId) -> Ty {
        match &self.program.type_exprs[id].kind {
            TypeExprKind::Int => Ty::Int,
            TypeExprKind::Float => Ty::Float,
            TypeExprKind::Bool => Ty::Bool,
            TypeExprKind::Str => Ty::Str,
            TypeExprKind::Char => Ty::Char,
            TypeExprKind::Symbol => Ty::Symbol,
            TypeExprKind::Void => Ty::Void,
            TypeExprKind::Unknown => Ty::Unknown,
            TypeExprKind::Pair(a, b) => {
                Ty::Pair(Box::new(self.lower_type(*a)), Box::new(self.lower_type(*b)))
            }
            TypeExprKind::Vector(t) => Ty::Vector(Box::new(self.lower_type(*t))),
            TypeExprKind::Fn { params, ret } => Ty::Fn(
                params.iter().map(|&p| self.lower_type(p)).collect(),
                Box::new(self.lower_type(*ret)),
            ),
        }
    }

    /// First pass: record `(: name ...)` signatures, then seed every
    /// top-level definition's binding with its declared type or a variable,
    /// so forward references and mutual recursion constrain freely.
    fn collect_declarations(&mut self) {
        for &form in &self.program.forms {
            if let ExprKind::TypeDecl { name, ann } = &self.program.exprs[form].kind {
                let ty = self.lower_type(*ann);
                self.declared.insert(name.clone(), ty);
            }
        }
        for &form in &self.program.forms {
            if let ExprKind::Define { name, .. } = &self.program.exprs[form].kind {
                let name = name.clone();
                if let Some(ids) = self.res.introduced.get(form) {
                    let binding = ids[0];
                    if self.binding_types.get(binding).is_none() {
                        let ty = match self.declared.get(&name) {
                            Some(sig) => sig.clone(),
                            None => self.fresh_var(),
                        };
                        self.binding_types.insert(binding, ty);
                    }
                }
            }
        }
    }

    fn binding_ty(&mut self, id: BindingId) -> Ty {
        if let Some(ty) = self.binding_types.get(id) {
            return ty.clone();
        }
        if self.res.is_builtin(id) {
            return Ty::Unknown;
        }
        let ty = self.fresh_var();
        self.binding_types.insert(id, ty.clone());
        ty
    }

    // ── Expression inference ─────────────────────────────────────

    fn infer_expr(&mut self, expr: ExprId) -> Ty {
        let ty = self.infer_expr_inner(expr);
        self.expr_types.insert(expr, ty.clone());
        ty
    }

    fn infer_expr_inner(&mut self, expr: ExprId) -> Ty {
        let span = self.program.exprs[expr].span;
        match &self.program.exprs[expr].kind {
            ExprKind::Int(_) => Ty::Int,
            ExprKind::Float(_) => Ty::Float,
            ExprKind::Bool(_) => Ty::Bool,
            ExprKind::Str(_) => Ty::Str,
            ExprKind::Char(_) => Ty::Char,

            ExprKind::Ident(_) => match self.res.resolutions.get(expr).copied() {
                Some(binding) => self.binding_ty(binding),
                None => Ty::Unknown,
            },

            ExprKind::Lambda {
                params,
                return_ann,
                body,
            } => {
                let return_ann = *return_ann;
                let body = *body;
                let param_ids: Vec<BindingId> = self
                    .res
                    .lambdas
                    .get(expr)
                    .map(|info| info.params.clone())
                    .unwrap_or_default();
                let mut param_tys = Vec::with_capacity(params.len());
                for (i, param) in params.clone().iter().enumerate() {
                    let ty = match param.ann {
                        Some(ann) => self.lower_type(ann),
                        None => self.fresh_var(),
                    };
                    if let Some(&id) = param_ids.get(i) {
                        self.binding_types.insert(id, ty.clone());
                    }
                    param_tys.push(ty);
                }
                let body_ty = self.infer_expr(body);
                let ret = match return_ann {
                    Some(ann) => {
                        let declared = self.lower_type(ann);
                        self.unify(&body_ty, &declared, span);
                        declared
                    }
                    None => body_ty,
                };
                Ty::Fn(param_tys, Box::new(ret))
            }

            ExprKind::Define { value, .. } => {
                let value = *value;
                let target = match self.res.introduced.get(expr) {
                    Some(ids) => {
                        let id = ids[0];
                        self.binding_ty(id)
                    }
                    None => self.fresh_var(),
                };
                let value_ty = self.infer_expr(value);
                self.unify(&target, &value_ty, span);
                Ty::Void
            }

            ExprKind::If {
                test,
                then_branch,
                else_branch,
            } => {
                let (test, then_branch, else_branch) = (*test, *then_branch, *else_branch);
                let test_ty = self.infer_expr(test);
                self.unify(&test_ty, &Ty::Bool, self.program.exprs[test].span);
                let then_ty = self.infer_expr(then_branch);
                match else_branch {
                    Some(e) => {
                        let else_ty = self.infer_expr(e);
                        self.unify(&then_ty, &else_ty, span);
                        then_ty
                    }
                    // An if without an alternate is a statement.
                    None => Ty::Void,
                }
            }

            ExprKind::Let {
                kind,
                bindings,
                body,
            } => {
                let kind = *kind;
                let bindings = bindings.clone();
                let body = *body;
                let ids = self
                    .res
                    .introduced
                    .get(expr)
                    .cloned()
                    .unwrap_or_default();
                if kind == LetKind::Rec {
                    // Seed first so initializers see each other's types.
                    for (i, b) in bindings.iter().enumerate() {
                        let seed = match b.ann {
                            Some(ann) => self.lower_type(ann),
                            None => self.fresh_var(),
                        };
                        if let Some(&id) = ids.get(i) {
                            self.binding_types.insert(id, seed);
                        }
                    }
                    for (i, b) in bindings.iter().enumerate() {
                        let value_ty = self.infer_expr(b.value);
                        if let Some(&id) = ids.get(i) {
                            let seed = self.binding_ty(id);
                            self.unify(&seed, &value_ty, b.span);
                        }
                    }
                } else {
                    for (i, b) in bindings.iter().enumerate() {
                        let value_ty = self.infer_expr(b.value);
                        let ty = match b.ann {
                            Some(ann) => {
                                let declared = self.lower_type(ann);
                                self.unify(&value_ty, &declared, b.span);
                                declared
                            }
                            None => value_ty,
                        };
                        if let Some(&id) = ids.get(i) {
                            self.binding_types.insert(id, ty);
                        }
                    }
                }
                self.infer_expr(body)
            }

            ExprKind::Set { value, .. } => {
                let value = *value;
                let value_ty = self.infer_expr(value);
                if let Some(&binding) = self.res.resolutions.get(expr) {
                    // Assignment must preserve the binding's type.
                    let target = self.binding_ty(binding);
                    self.unify(&target, &value_ty, span);
                }
                Ty::Void
            }

            ExprKind::Begin(exprs) => {
                let exprs = exprs.clone();
                let mut last = Ty::Void;
                for &e in &exprs {
                    last = self.infer_expr(e);
                }
                last
            }

            ExprKind::Quote(datum) => self.datum_ty(*datum),

            ExprKind::And(exprs) | ExprKind::Or(exprs) => {
                let exprs = exprs.clone();
                if exprs.is_empty() {
                    return Ty::Bool;
                }
                let tys: Vec<Ty> = exprs.iter().map(|&e| self.infer_expr(e)).collect();
                let any_bool = tys.iter().any(|t| self.apply(t) == Ty::Bool);
                if any_bool {
                    Ty::Bool
                } else {
                    for pair in tys.windows(2) {
                        self.unify(&pair[0], &pair[1], span);
                    }
                    self.apply(&tys[0])
                }
            }

            ExprKind::Call { callee, args } => {
                let callee = *callee;
                let args = args.clone();
                if let Some(name) = self.intrinsic_callee(callee) {
                    // The callee itself is recorded as `any`: the operator
                    // table covers every arity it supports.
                    self.expr_types.insert(callee, Ty::Unknown);
                    return self.infer_intrinsic(&name, &args, span);
                }
                let callee_ty = self.infer_expr(callee);
                let arg_tys: Vec<Ty> = args.iter().map(|&a| self.infer_expr(a)).collect();
                match self.apply(&callee_ty) {
                    Ty::Fn(params, ret) => {
                        if params.len() != arg_tys.len() {
                            let msg = format!(
                                "expected {} arguments, got {}",
                                params.len(),
                                arg_tys.len()
                            );
                            self.diags.error(msg, span);
                            return Ty::Unknown;
                        }
                        for (param, arg) in params.iter().zip(arg_tys.iter()) {
                            self.unify(param, arg, span);
                        }
                        self.apply(&ret)
                    }
                    Ty::Unknown => Ty::Unknown,
                    Ty::Var(_) => {
                        let ret = self.fresh_var();
                        let fn_ty = Ty::Fn(arg_tys, Box::new(ret.clone()));
                        self.unify(&callee_ty, &fn_ty, span);
                        ret
                    }
                    other => {
                        let msg = format!("{} is not callable", other);
                        self.diags.error(msg, span);
                        Ty::Unknown
                    }
                }
            }

            ExprKind::TypeDecl { .. } => Ty::Void,
            ExprKind::Erroneous => Ty::Unknown,
        }
    }

    fn datum_ty(&self, datum: DatumId) -> Ty {
        match &self.program.datums[datum].kind {
            DatumKind::Int(_) => Ty::Int,
            DatumKind::Float(_) => Ty::Float,
            DatumKind::Bool(_) => Ty::Bool,
            DatumKind::Str(_) => Ty::Str,
            DatumKind::Char(_) => Ty::Char,
            DatumKind::Symbol(_) => Ty::Symbol,
            DatumKind::List { elems, tail } => {
                let mut acc = match tail {
                    Some(t) => self.datum_ty(*t),
                    None => Ty::Unknown,
                };
                for &e in elems.iter().rev() {
                    acc = Ty::Pair(Box::new(self.datum_ty(e)), Box::new(acc));
                }
                if elems.is_empty() && tail.is_none() {
                    Ty::Pair(Box::new(Ty::Unknown), Box::new(Ty::Unknown))
                } else {
                    acc
                }
            }
        }
    }

    // ── Built-in operators ───────────────────────────────────────

    /// The callee's name when it is an identifier resolving to a built-in
    /// operator binding. Shadowed operators take the generic call path.
    fn intrinsic_callee(&self, callee: ExprId) -> Option<SmolStr> {
        match &self.program.exprs[callee].kind {
            ExprKind::Ident(name) => {
                let binding = self.res.resolutions.get(callee)?;
                if self.res.is_builtin(*binding) {
                    Some(name.clone())
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn infer_intrinsic(&mut self, name: &str, args: &[ExprId], span: Span) -> Ty {
        let arg_tys: Vec<Ty> = args.iter().map(|&a| self.infer_expr(a)).collect();
        let vec_f = || Ty::Vector(Box::new(Ty::Float));

        match name {
            "+" | "*" => self.defer_arith(arg_tys, span),
            "-" | "/" => {
                if arg_tys.is_empty() {
                    let msg = format!("'{}' expects at least one argument", name);
                    self.diags.error(msg, span);
                    return Ty::Unknown;
                }
                self.defer_arith(arg_tys, span)
            }
            "<" | ">" | "<=" | ">=" | "=" => {
                if arg_tys.len() != 2 {
                    let msg = format!("'{}' expects two arguments", name);
                    self.diags.error(msg, span);
                    return Ty::Bool;
                }
                self.unify(&arg_tys[0], &arg_tys[1], span);
                self.compares.push(DeferredCompare {
                    op: SmolStr::new(name),
                    operand: arg_tys[0].clone(),
                    span,
                });
                Ty::Bool
            }
            "vector" => {
                for (i, ty) in arg_tys.iter().enumerate() {
                    self.unify(ty, &Ty::Float, self.program.exprs[args[i]].span);
                }
                vec_f()
            }
            "v+" | "v-" => {
                self.expect_args(name, 2, &arg_tys, span);
                for ty in &arg_tys {
                    self.unify(ty, &vec_f(), span);
                }
                vec_f()
            }
            "v*" => {
                self.expect_args(name, 2, &arg_tys, span);
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &vec_f(), span);
                }
                if let Some(t) = arg_tys.get(1) {
                    self.unify(t, &Ty::Float, span);
                }
                vec_f()
            }
            "dot" => {
                self.expect_args(name, 2, &arg_tys, span);
                for ty in &arg_tys {
                    self.unify(ty, &vec_f(), span);
                }
                Ty::Float
            }
            "cross" => {
                self.expect_args(name, 2, &arg_tys, span);
                for ty in &arg_tys {
                    self.unify(ty, &vec_f(), span);
                }
                vec_f()
            }
            "norm" => {
                self.expect_args(name, 1, &arg_tys, span);
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &vec_f(), span);
                }
                Ty::Float
            }
            "vector-ref" => {
                self.expect_args(name, 2, &arg_tys, span);
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &vec_f(), span);
                }
                if let Some(t) = arg_tys.get(1) {
                    self.unify(t, &Ty::Int, span);
                }
                Ty::Float
            }
            "gradient" | "laplacian" => {
                self.expect_args(name, 2, &arg_tys, span);
                let field = Ty::Fn(vec![vec_f()], Box::new(Ty::Float));
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &field, span);
                }
                if let Some(t) = arg_tys.get(1) {
                    self.unify(t, &vec_f(), span);
                }
                if name == "gradient" {
                    vec_f()
                } else {
                    Ty::Float
                }
            }
            "divergence" | "curl" => {
                self.expect_args(name, 2, &arg_tys, span);
                let field = Ty::Fn(vec![vec_f()], Box::new(vec_f()));
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &field, span);
                }
                if let Some(t) = arg_tys.get(1) {
                    self.unify(t, &vec_f(), span);
                }
                if name == "divergence" {
                    Ty::Float
                } else {
                    vec_f()
                }
            }
            "autodiff-forward" | "autodiff-reverse" | "derivative" => {
                self.expect_args(name, 2, &arg_tys, span);
                let f = Ty::Fn(vec![Ty::Float], Box::new(Ty::Float));
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &f, span);
                }
                if let Some(t) = arg_tys.get(1) {
                    self.unify(t, &Ty::Float, span);
                }
                Ty::Float
            }
            "autodiff-forward-gradient" | "autodiff-reverse-gradient" | "autodiff-hessian" => {
                self.expect_args(name, 2, &arg_tys, span);
                let f = Ty::Fn(vec![vec_f()], Box::new(Ty::Float));
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &f, span);
                }
                if let Some(t) = arg_tys.get(1) {
                    self.unify(t, &vec_f(), span);
                }
                vec_f()
            }
            "autodiff-jacobian" => {
                self.expect_args(name, 2, &arg_tys, span);
                let f = Ty::Fn(vec![vec_f()], Box::new(vec_f()));
                if let Some(t) = arg_tys.first() {
                    self.unify(t, &f, span);
                }
                if let Some(t) = arg_tys.get(1) {
                    self.unify(t, &vec_f(), span);
                }
                vec_f()
            }
            "display" => {
                self.expect_args(name, 1, &arg_tys, span);
                Ty::Void
            }
            "newline" => {
                self.expect_args(name, 0, &arg_tys, span);
                Ty::Void
            }
            "string-append" => {
                for (i, ty) in arg_tys.iter().enumerate() {
                    self.unify(ty, &Ty::Str, self.program.exprs[args[i]].span);
                }
                Ty::Str
            }
            "number->string" => {
                self.expect_args(name, 1, &arg_tys, span);
                if let Some(t) = arg_tys.first() {
                    self.compares.push(DeferredCompare {
                        op: SmolStr::new("number->string"),
                        operand: t.clone(),
                        span,
                    });
                }
                Ty::Str
            }
            "printf" => {
                if arg_tys.is_empty() {
                    self.diags.error("'printf' expects a format string", span);
                } else {
                    self.unify(&arg_tys[0], &Ty::Str, span);
                }
                Ty::Void
            }
            other => {
                let msg = format!("unknown built-in operator '{}'", other);
                self.diags.error(msg, span);
                Ty::Unknown
            }
        }
    }

    fn expect_args(&mut self, name: &str, want: usize, got: &[Ty], span: Span) {
        if got.len() != want {
            let msg = format!("'{}' expects {} arguments, got {}", name, want, got.len());
            self.diags.error(msg, span);
        }
    }

    fn defer_arith(&mut self, operands: Vec<Ty>, span: Span) -> Ty {
        let result = self.fresh_var();
        let id = match result {
            Ty::Var(id) => id,
            _ => unreachable!(),
        };
        self.arith.push(DeferredArith {
            result: id,
            operands,
            span,
        });
        result
    }

    // ── Deferred resolution ──────────────────────────────────────

    /// Settle arithmetic and comparison constraints collected while
    /// inferring the current top-level form.
    fn flush_deferred(&mut self) {
        let arith = std::mem::take(&mut self.arith);
        for d in arith {
            if d.operands.is_empty() {
                // (+) and (*) produce their integer identity element.
                self.unify(&Ty::Var(d.result), &Ty::Int, d.span);
                continue;
            }
            let tys: Vec<Ty> = d.operands.iter().map(|t| self.apply(t)).collect();
            let mut bad = None;
            for t in &tys {
                if !matches!(t, Ty::Int | Ty::Float | Ty::Unknown | Ty::Var(_)) {
                    bad = Some(t.clone());
                }
            }
            if let Some(t) = bad {
                let msg = format!("type mismatch: expected a number, got {}", t);
                self.diags.error(msg, d.span);
                self.unify(&Ty::Var(d.result), &Ty::Unknown, d.span);
                continue;
            }
            let any_float = tys.iter().any(|t| *t == Ty::Float);
            let any_unknown = tys.iter().any(|t| *t == Ty::Unknown);
            let any_int = tys.iter().any(|t| *t == Ty::Int);
            let result = if any_float {
                Ty::Float
            } else if any_unknown {
                Ty::Unknown
            } else if any_int {
                Ty::Int
            } else {
                // All operands are unconstrained variables; numbers default
                // to float in this language.
                Ty::Float
            };
            if result != Ty::Unknown {
                for t in &tys {
                    if matches!(t, Ty::Var(_)) {
                        self.unify(t, &result, d.span);
                    }
                }
            }
            self.unify(&Ty::Var(d.result), &result, d.span);
        }

        let compares = std::mem::take(&mut self.compares);
        for d in compares {
            let ty = self.apply(&d.operand);
            let ok = match d.op.as_str() {
                "=" => matches!(
                    ty,
                    Ty::Int | Ty::Float | Ty::Char | Ty::Bool | Ty::Symbol | Ty::Unknown | Ty::Var(_)
                ),
                _ => matches!(ty, Ty::Int | Ty::Float | Ty::Unknown | Ty::Var(_)),
            };
            if !ok {
                let msg = format!(
                    "type mismatch: '{}' cannot operate on values of type {}",
                    d.op, ty
                );
                self.diags.error(msg, d.span);
            }
        }
    }

    /// Freeze a definition's signature: apply the substitution and widen any
    /// residual variables to `any`, so later call sites never narrow it.
    fn finalize_definition(&mut self, form: ExprId) {
        let Some(ids) = self.res.introduced.get(form) else {
            return;
        };
        let binding = ids[0];
        let Some(ty) = self.binding_types.get(binding) else {
            return;
        };
        let ty = self.apply(&ty.clone());
        let name = self.res.bindings[binding].name.clone();
        let span = self.program.exprs[form].span;
        if ty.has_var() {
            let msg = format!(
                "could not fully infer the type of '{}'; unresolved parts widened to any",
                name
            );
            self.diags.verbose(msg, span);
        }
        let widened = widen(&ty);
        self.diags
            .note(format!("inferred '{}' : {}", name, widened), span);
        self.binding_types.insert(binding, widened);
    }

    /// Apply the final substitution everywhere and widen leftovers, so the
    /// type map is total and variable-free.
    fn finish(mut self) -> TypeckResult {
        self.flush_deferred();

        let mut expr_types = ArenaMap::default();
        let mut ambiguous = 0usize;
        for (id, ty) in self.expr_types.iter() {
            let ty = self.apply(ty);
            if ty.has_var() {
                ambiguous += 1;
                self.diags.verbose(
                    "expression type not fully inferred; assuming any",
                    self.program.exprs[id].span,
                );
            }
            expr_types.insert(id, widen(&ty));
        }
        // Nodes skipped by inference (inside erroneous subtrees) still get
        // an entry so the map is total.
        for (id, _) in self.program.exprs.iter() {
            if expr_types.get(id).is_none() {
                expr_types.insert(id, Ty::Unknown);
            }
        }

        let mut binding_types = ArenaMap::default();
        for (id, ty) in self.binding_types.iter() {
            binding_types.insert(id, widen(&self.apply(ty)));
        }

        info!("type inference done ({} ambiguous nodes)", ambiguous);
        TypeckResult {
            expr_types,
            binding_types,
        }
    }
}

fn widen(ty: &Ty) -> Ty {
    match ty {
        Ty::Var(_) => Ty::Unknown,
        Ty::Pair(a, b) => Ty::Pair(Box::new(widen(a)), Box::new(widen(b))),
        Ty::Vector(t) => Ty::Vector(Box::new(widen(t))),
        Ty::Fn(params, ret) => Ty::Fn(params.iter().map(widen).collect(), Box::new(widen(ret))),
        _ => ty.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skink_parser::parse;
    use skink_resolver::resolve;

    fn infer_ok(source: &str) -> (Program, ResolveResult, TypeckResult) {
        let mut diags = Diagnostics::new();
        let program = parse(source, &mut diags);
        let res = resolve(&program, &mut diags);
        let tyk = infer(&program, &res, &mut diags);
        assert!(
            !diags.has_errors(),
            "unexpected errors: {:?}",
            diags.iter().collect::<Vec<_>>()
        );
        (program, res, tyk)
    }

    fn infer_err(source: &str) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let program = parse(source, &mut diags);
        let res = resolve(&program, &mut diags);
        infer(&program, &res, &mut diags);
        assert!(diags.has_errors(), "expected errors for {:?}", source);
        diags
    }

    fn toplevel_ty<'t>(
        res: &ResolveResult,
        tyk: &'t TypeckResult,
        name: &str,
    ) -> &'t Ty {
        let (id, _) = res
            .bindings
            .iter()
            .find(|(_, b)| b.name == name && b.kind != skink_resolver::BindingKind::Builtin)
            .unwrap_or_else(|| panic!("no binding named {}", name));
        tyk.binding_ty(id)
    }

    #[test]
    fn factorial_infers_integer_signature() {
        let (_, res, tyk) =
            infer_ok("(define (f n) (if (= n 0) 1 (* n (f (- n 1)))))");
        assert_eq!(
            *toplevel_ty(&res, &tyk, "f"),
            Ty::Fn(vec![Ty::Int], Box::new(Ty::Int))
        );
    }

    #[test]
    fn unconstrained_identity_stays_gradual() {
        let (_, res, tyk) = infer_ok(
            "(define (id x) x) (display (id 5)) (display (id \"hi\"))",
        );
        assert_eq!(
            *toplevel_ty(&res, &tyk, "id"),
            Ty::Fn(vec![Ty::Unknown], Box::new(Ty::Unknown))
        );
    }

    #[test]
    fn declared_signature_is_enforced() {
        let (_, res, tyk) = infer_ok(
            "(: sq (-> integer integer)) (define (sq x) (* x x)) (display (sq 6))",
        );
        assert_eq!(
            *toplevel_ty(&res, &tyk, "sq"),
            Ty::Fn(vec![Ty::Int], Box::new(Ty::Int))
        );
    }

    #[test]
    fn declared_signature_rejects_bad_call() {
        let diags = infer_err(
            "(: sq (-> integer integer)) (define (sq x) (* x x)) (display (sq 1.5))",
        );
        assert!(diags.iter().any(|d| d.message.contains("type mismatch")));
    }

    #[test]
    fn mutual_recursion_infers_bool() {
        let (_, res, tyk) = infer_ok(
            "(define (even? n) (if (= n 0) #t (odd? (- n 1))))\
             (define (odd? n) (if (= n 0) #f (even? (- n 1))))",
        );
        assert_eq!(
            *toplevel_ty(&res, &tyk, "even?"),
            Ty::Fn(vec![Ty::Int], Box::new(Ty::Bool))
        );
        assert_eq!(
            *toplevel_ty(&res, &tyk, "odd?"),
            Ty::Fn(vec![Ty::Int], Box::new(Ty::Bool))
        );
    }

    #[test]
    fn arithmetic_promotes_to_float() {
        let (program, _, tyk) = infer_ok("(define r (+ 1 2.5))");
        let add = program
            .exprs
            .iter()
            .find(|(_, e)| matches!(e.kind, ExprKind::Call { .. }))
            .map(|(id, _)| id)
            .expect("call");
        assert_eq!(*tyk.expr_ty(add), Ty::Float);
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        let (program, _, tyk) = infer_ok("(define r (+ 1 2 3))");
        let add = program
            .exprs
            .iter()
            .find(|(_, e)| matches!(e.kind, ExprKind::Call { .. }))
            .map(|(id, _)| id)
            .expect("call");
        assert_eq!(*tyk.expr_ty(add), Ty::Int);
    }

    #[test]
    fn unconstrained_arithmetic_defaults_to_float() {
        let (_, res, tyk) = infer_ok("(define (sq x) (* x x))");
        assert_eq!(
            *toplevel_ty(&res, &tyk, "sq"),
            Ty::Fn(vec![Ty::Float], Box::new(Ty::Float))
        );
    }

    #[test]
    fn autodiff_accepts_float_function() {
        let (program, _, tyk) = infer_ok(
            "(define (f x) (* x x)) (display (autodiff-forward f 3.0))",
        );
        let call = program
            .exprs
            .iter()
            .filter(|(_, e)| matches!(e.kind, ExprKind::Call { .. }))
            .map(|(id, _)| id)
            .last()
            .expect("call");
        // Outermost call is display; its argument is the autodiff result.
        let _ = call;
        let floats = program
            .exprs
            .iter()
            .filter(|(id, _)| *tyk.expr_ty(*id) == Ty::Float)
            .count();
        assert!(floats >= 2);
    }

    #[test]
    fn set_must_preserve_the_inferred_type() {
        let diags = infer_err("(define (f) (let ((x 1)) (set! x 2.5) x))");
        assert!(diags.iter().any(|d| d.message.contains("type mismatch")));
    }

    #[test]
    fn comparison_requires_numbers() {
        let diags = infer_err("(define r (< \"a\" \"b\"))");
        assert!(diags.iter().any(|d| d.message.contains("cannot operate")));
    }

    #[test]
    fn unknown_unifies_without_mismatch() {
        // id's parameter widens to any; both calls then pass untouched.
        let (_, _, _) = infer_ok(
            "(define (id x) x) (define a (id 5)) (define b (id \"hi\"))",
        );
    }

    #[test]
    fn if_branches_must_agree() {
        let diags = infer_err("(define r (if #t 1 \"no\"))");
        assert!(diags.iter().any(|d| d.message.contains("type mismatch")));
    }

    #[test]
    fn type_map_is_total_and_variable_free() {
        let (program, _, tyk) = infer_ok(
            "(define (make-adder k) (lambda (x) (+ x k)))\
             (define add3 (make-adder 3))\
             (display (add3 4))",
        );
        for (id, _) in program.exprs.iter() {
            let ty = tyk.expr_ty(id);
            assert!(!ty.has_var(), "node {:?} kept a variable: {}", id, ty);
        }
    }

    #[test]
    fn vector_intrinsics() {
        let (program, _, tyk) = infer_ok(
            "(define v (vector 1.0 2.0 3.0)) (define n (norm v)) (define s (dot v v))",
        );
        let tys: Vec<&Ty> = program
            .forms
            .iter()
            .map(|&f| match &program.exprs[f].kind {
                ExprKind::Define { value, .. } => tyk.expr_ty(*value),
                _ => panic!("expected define"),
            })
            .collect();
        assert_eq!(*tys[0], Ty::Vector(Box::new(Ty::Float)));
        assert_eq!(*tys[1], Ty::Float);
        assert_eq!(*tys[2], Ty::Float);
    }

    #[test]
    fn quoted_data_types() {
        let (program, _, tyk) = infer_ok("(define s 'hello) (define l '(1 2))");
        match &program.exprs[program.forms[0]].kind {
            ExprKind::Define { value, .. } => {
                assert_eq!(*tyk.expr_ty(*value), Ty::Symbol);
            }
            _ => panic!("expected define"),
        }
        match &program.exprs[program.forms[1]].kind {
            ExprKind::Define { value, .. } => {
                assert!(matches!(tyk.expr_ty(*value), Ty::Pair(..)));
            }
            _ => panic!("expected define"),
        }
    }

    #[test]
    fn and_or_typing() {
        let (program, _, tyk) = infer_ok("(define a (and)) (define b (or #f #t))");
        for &form in &program.forms {
            match &program.exprs[form].kind {
                ExprKind::Define { value, .. } => {
                    assert_eq!(*tyk.expr_ty(*value), Ty::Bool);
                }
                _ => panic!("expected define"),
            }
        }
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let diags = infer_err("(define (f x) x) (define r (f 1 2))");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("expected 1 arguments, got 2")));
    }

    #[test]
    fn definitions_emit_debug_notes() {
        let mut diags = Diagnostics::new();
        let program = parse(
            "(define (f n) (if (= n 0) 1 (* n (f (- n 1)))))",
            &mut diags,
        );
        let res = resolve(&program, &mut diags);
        infer(&program, &res, &mut diags);
        assert!(diags.iter().any(|d| {
            d.severity == skink_diag::Severity::Debug
                && d.message.contains("inferred 'f' : (-> integer integer)")
        }));
    }
}
