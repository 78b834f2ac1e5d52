//! C code generation.
//!
//! Produces a single translation unit from the resolved, typed tree. Every
//! lambda is lifted to a top-level C function taking its environment as the
//! first parameter; closures pair the lifted function with an arena-allocated
//! environment struct typed from the type map. Value-position constructs are
//! lowered with GNU statement expressions, so the whole emitter is
//! expression-oriented.
//!
//! Dynamic (`any`-typed) regions use the runtime's tagged `SkValue`; the
//! emitter inserts box/unbox coercions wherever a static type meets a
//! dynamic slot.

use std::collections::HashMap;

use la_arena::Idx;
use log::{info, trace};
use skink_ast::*;
use skink_diag::Diagnostics;
use skink_resolver::{BindingId, BindingKind, ResolveResult};
use skink_typeck::{Ty, TypeckResult};

/// Emit the C translation unit. Returns `None`, with diagnostics, if any
/// construct cannot be lowered; no partial output is produced.
pub fn emit(
    program: &Program,
    res: &ResolveResult,
    tyk: &TypeckResult,
    diags: &mut Diagnostics,
) -> Option<String> {
    info!("beginning C emission");
    let mut emitter = Emitter::new(program, res, tyk, diags);
    emitter.classify();
    let out = emitter.build();
    if emitter.failed {
        None
    } else {
        trace!("emitted {} bytes of C", out.len());
        Some(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AdapterKind {
    /// Scalar field over a vector point: `double (*)(const VectorF *)`.
    FieldFromVec,
    /// The same shape, wrapping a function of one scalar.
    FieldFromScalar,
    /// Vector-valued map: `VectorF *(*)(const VectorF *)`.
    VecMap,
    /// Plain scalar function: `double (*)(double)`.
    ScalarFn,
}

struct Adapter {
    name: String,
    kind: AdapterKind,
    target: BindingId,
}

struct Emitter<'a> {
    program: &'a Program,
    res: &'a ResolveResult,
    tyk: &'a TypeckResult,
    diags: &'a mut Diagnostics,

    /// Top-level immutable function definitions: binding to its lambda.
    named_fns: HashMap<BindingId, ExprId>,
    /// Every lambda node to its lifted C function name.
    fn_names: HashMap<ExprId, String>,
    /// Top-level value definitions, in source order.
    globals: Vec<(BindingId, ExprId)>,
    /// Autodiff/field adapters, in discovery order.
    adapters: Vec<Adapter>,
    adapter_memo: HashMap<(BindingId, AdapterKind), String>,

    tmp: u32,
    failed: bool,
}

type Emit<T> = Result<T, ()>;

/// Per-function emission context: the free-binding list of the function
/// being emitted (empty at top level).
struct FnCtx<'f> {
    free: &'f [BindingId],
}

const TOPLEVEL: FnCtx<'static> = FnCtx { free: &[] };

impl<'a> Emitter<'a> {
    fn new(
        program: &'a Program,
        res: &'a ResolveResult,
        tyk: &'a TypeckResult,
        diags: &'a mut Diagnostics,
    ) -> Self {
        Self {
            program,
            res,
            tyk,
            diags,
            named_fns: HashMap::new(),
            fn_names: HashMap::new(),
            globals: Vec::new(),
            adapters: Vec::new(),
            adapter_memo: HashMap::new(),
            tmp: 0,
            failed: false,
        }
    }

    fn err(&mut self, message: impl Into<String>, span: Span) {
        self.failed = true;
        self.diags.error(message, span);
    }

    fn fresh_tmp(&mut self) -> String {
        let n = self.tmp;
        self.tmp += 1;
        format!("_t{}", n)
    }

    // ── Classification ────────────────────────────────────────────

    /// Split top-level defines into named C functions (immutable lambda
    /// values) and globals, then name every lambda in allocation order.
    fn classify(&mut self) {
        for &form in &self.program.forms {
            if let ExprKind::Define { value, .. } = &self.program.exprs[form].kind {
                let Some(ids) = self.res.introduced.get(form) else {
                    continue;
                };
                let binding = ids[0];
                let is_lambda = matches!(self.program.exprs[*value].kind, ExprKind::Lambda { .. });
                if is_lambda && !self.res.bindings[binding].mutable {
                    self.named_fns.insert(binding, *value);
                    self.fn_names.insert(*value, cname(self.res, binding));
                } else {
                    self.globals.push((binding, *value));
                }
            }
        }
        for (lambda, _) in self.res.lambdas.iter() {
            if !self.fn_names.contains_key(&lambda) {
                self.fn_names
                    .insert(lambda, format!("lambda_{}", raw(lambda)));
            }
        }
    }

    // ── Assembly ─────────────────────────────────────────────────

    fn build(&mut self) -> String {
        let lambda_ids: Vec<ExprId> = self.res.lambdas.iter().map(|(id, _)| id).collect();

        let mut defs = String::new();
        for &lambda in &lambda_ids {
            match self.emit_function(lambda) {
                Ok(text) => {
                    defs.push_str(&text);
                    defs.push('\n');
                }
                Err(()) => return String::new(),
            }
        }

        let toplevel = match self.emit_toplevel() {
            Ok(text) => text,
            Err(()) => return String::new(),
        };
        let main = self.emit_main();

        let mut out = String::new();
        out.push_str("/* Generated by the Skink compiler. */\n");
        out.push_str("#include \"skink_runtime.h\"\n\n");
        out.push_str("static Arena *arena;\n\n");

        // Environment struct for every closure, in allocation order.
        for &lambda in &lambda_ids {
            let free = self
                .res
                .lambdas
                .get(lambda)
                .map(|info| info.free.clone())
                .unwrap_or_default();
            if free.is_empty() {
                continue;
            }
            out.push_str(&format!("typedef struct env_{} {{\n", raw(lambda)));
            for &b in &free {
                let ty = self.binding_c_ty(b);
                if self.res.bindings[b].boxed {
                    out.push_str(&format!("    {} *{};\n", ty, cname(self.res, b)));
                } else {
                    out.push_str(&format!("    {} {};\n", ty, cname(self.res, b)));
                }
            }
            out.push_str(&format!("}} env_{};\n\n", raw(lambda)));
        }

        for &(binding, _) in &self.globals {
            let ty = self.binding_c_ty(binding);
            if self.res.bindings[binding].boxed {
                out.push_str(&format!("static {} *{};\n", ty, cname(self.res, binding)));
            } else {
                out.push_str(&format!("static {} {};\n", ty, cname(self.res, binding)));
            }
        }
        if !self.globals.is_empty() {
            out.push('\n');
        }

        for &lambda in &lambda_ids {
            if let Ok(sig) = self.fn_signature(lambda) {
                out.push_str(&sig);
                out.push_str(";\n");
            }
        }
        for adapter in &self.adapters {
            out.push_str(&adapter_signature(adapter));
            out.push_str(";\n");
        }
        out.push('\n');

        out.push_str(&defs);
        for i in 0..self.adapters.len() {
            let text = self.adapter_def(i);
            out.push_str(&text);
            out.push('\n');
        }
        out.push_str(&toplevel);
        out.push('\n');
        out.push_str(&main);
        out
    }

    // ── Functions ────────────────────────────────────────────────

    fn lambda_fn_ty(&mut self, lambda: ExprId) -> Emit<(Vec<Ty>, Ty)> {
        match self.tyk.expr_ty(lambda) {
            Ty::Fn(params, ret) => Ok((params.clone(), (**ret).clone())),
            other => {
                let msg = format!("cannot lower function of type {}", other);
                let span = self.program.exprs[lambda].span;
                self.err(msg, span);
                Err(())
            }
        }
    }

    fn fn_signature(&mut self, lambda: ExprId) -> Emit<String> {
        let (param_tys, ret) = self.lambda_fn_ty(lambda)?;
        let name = self.fn_names[&lambda].clone();
        let params = self
            .res
            .lambdas
            .get(lambda)
            .map(|info| info.params.clone())
            .unwrap_or_default();
        let mut sig = format!("static {} {}(void *env", c_type(&ret), name);
        for (i, &p) in params.iter().enumerate() {
            let ty = param_tys.get(i).cloned().unwrap_or(Ty::Unknown);
            sig.push_str(&format!(", {} {}", c_type(&ty), cname(self.res, p)));
        }
        sig.push(')');
        Ok(sig)
    }

    fn emit_function(&mut self, lambda: ExprId) -> Emit<String> {
        let sig = self.fn_signature(lambda)?;
        let (_, ret) = self.lambda_fn_ty(lambda)?;
        let info = self
            .res
            .lambdas
            .get(lambda)
            .expect("lambda info exists for every lambda");
        let free = info.free.clone();
        let body = match &self.program.exprs[lambda].kind {
            ExprKind::Lambda { body, .. } => *body,
            _ => unreachable!("fn_names only holds lambdas"),
        };

        let mut out = format!("{} {{\n", sig);
        if free.is_empty() {
            out.push_str("    (void) env;\n");
        } else {
            out.push_str(&format!(
                "    env_{} *_env = (env_{} *) env;\n",
                raw(lambda),
                raw(lambda)
            ));
        }

        let ctx = FnCtx { free: &free };
        let body_ty = self.tyk.expr_ty(body).clone();
        let value = self.expr(body, &ctx)?;
        if ret == Ty::Void {
            out.push_str(&format!("    {};\n", discard(&value, &body_ty)));
        } else {
            let value = self.coerce(value, &body_ty, &ret);
            out.push_str(&format!("    return {};\n", value));
        }
        out.push_str("}\n");
        Ok(out)
    }

    // ── Top level and main ────────────────────────────────────────

    fn emit_toplevel(&mut self) -> Emit<String> {
        let mut out = String::from("static void toplevel(void) {\n");
        for &form in &self.program.forms.clone() {
            match &self.program.exprs[form].kind {
                ExprKind::TypeDecl { .. } => {}
                ExprKind::Define { value, .. } => {
                    let value = *value;
                    let Some(ids) = self.res.introduced.get(form) else {
                        continue;
                    };
                    let binding = ids[0];
                    if self.named_fns.contains_key(&binding) {
                        continue;
                    }
                    let name = cname(self.res, binding);
                    let ty = self.tyk.binding_ty(binding).clone();
                    let value_ty = self.tyk.expr_ty(value).clone();
                    let init = self.expr(value, &TOPLEVEL)?;
                    let init = self.coerce(init, &value_ty, &ty);
                    if self.res.bindings[binding].boxed {
                        out.push_str(&format!(
                            "    {} = arena_alloc(arena, sizeof({}));\n",
                            name,
                            c_type(&ty)
                        ));
                        out.push_str(&format!("    *{} = {};\n", name, init));
                    } else {
                        out.push_str(&format!("    {} = {};\n", name, init));
                    }
                }
                _ => {
                    let ty = self.tyk.expr_ty(form).clone();
                    let value = self.expr(form, &TOPLEVEL)?;
                    out.push_str(&format!("    {};\n", discard(&value, &ty)));
                }
            }
        }
        out.push_str("}\n");
        Ok(out)
    }

    fn emit_main(&mut self) -> String {
        let mut out = String::from("int main(void) {\n");
        out.push_str("    arena = arena_create();\n");
        out.push_str("    toplevel();\n");

        // Call the program's own entry point when one is defined.
        let user_main = self
            .named_fns
            .iter()
            .find(|(b, _)| self.res.bindings[**b].name == "main")
            .map(|(b, l)| (*b, *l));
        if let Some((_, lambda)) = user_main {
            if let Ok((params, ret)) = self.lambda_fn_ty(lambda) {
                let name = self.fn_names[&lambda].clone();
                if !params.is_empty() {
                    let span = self.program.exprs[lambda].span;
                    self.diags
                        .warning("main takes parameters and is not run automatically", span);
                } else if ret == Ty::Int {
                    out.push_str(&format!("    int rc = (int) {}(NULL);\n", name));
                    out.push_str("    arena_destroy(arena);\n");
                    out.push_str("    return rc;\n");
                    out.push_str("}\n");
                    return out;
                } else {
                    out.push_str(&format!("    {};\n", discard(&format!("{}(NULL)", name), &ret)));
                }
            }
        }
        out.push_str("    arena_destroy(arena);\n");
        out.push_str("    return 0;\n");
        out.push_str("}\n");
        out
    }

    // ── Expressions ──────────────────────────────────────────────

    fn expr(&mut self, id: ExprId, ctx: &FnCtx) -> Emit<String> {
        let span = self.program.exprs[id].span;
        match &self.program.exprs[id].kind {
            ExprKind::Int(n) => Ok(format!("INT64_C({})", n)),
            ExprKind::Float(f) => Ok(format!("{:?}", f)),
            ExprKind::Bool(b) => Ok(if *b { "true" } else { "false" }.to_string()),
            ExprKind::Str(s) => Ok(c_string(s)),
            ExprKind::Char(c) => Ok(format!("{}", *c as u32)),

            ExprKind::Ident(_) => match self.res.resolutions.get(id).copied() {
                Some(binding) => self.access(binding, ctx, span),
                None => {
                    self.err("unresolved identifier reached code generation", span);
                    Err(())
                }
            },

            ExprKind::Lambda { .. } => self.closure_value(id, ctx),

            ExprKind::Define { .. } => {
                self.err("internal define is not supported; use let", span);
                Err(())
            }

            ExprKind::If {
                test,
                then_branch,
                else_branch,
            } => {
                let (test, then_branch, else_branch) = (*test, *then_branch, *else_branch);
                let node_ty = self.tyk.expr_ty(id).clone();
                let test_ty = self.tyk.expr_ty(test).clone();
                let test_s = self.expr(test, ctx)?;
                let test_s = self.truthy(test_s, &test_ty);
                if node_ty == Ty::Void {
                    let then_ty = self.tyk.expr_ty(then_branch).clone();
                    let then_s = self.expr(then_branch, ctx)?;
                    let mut s = format!(
                        "({{ if ({}) {{ {}; }}",
                        test_s,
                        discard(&then_s, &then_ty)
                    );
                    if let Some(e) = else_branch {
                        let else_ty = self.tyk.expr_ty(e).clone();
                        let else_s = self.expr(e, ctx)?;
                        s.push_str(&format!(" else {{ {}; }}", discard(&else_s, &else_ty)));
                    }
                    s.push_str(" })");
                    Ok(s)
                } else {
                    let then_ty = self.tyk.expr_ty(then_branch).clone();
                    let then_s = self.expr(then_branch, ctx)?;
                    let then_s = self.coerce(then_s, &then_ty, &node_ty);
                    let e = else_branch.expect("value-position if has an alternate");
                    let else_ty = self.tyk.expr_ty(e).clone();
                    let else_s = self.expr(e, ctx)?;
                    let else_s = self.coerce(else_s, &else_ty, &node_ty);
                    Ok(format!("(({}) ? ({}) : ({}))", test_s, then_s, else_s))
                }
            }

            ExprKind::Let {
                kind,
                bindings,
                body,
            } => self.let_expr(id, *kind, &bindings.clone(), *body, ctx),

            ExprKind::Set { value, .. } => {
                let value = *value;
                let Some(&binding) = self.res.resolutions.get(id) else {
                    self.err("unresolved assignment reached code generation", span);
                    return Err(());
                };
                let value_ty = self.tyk.expr_ty(value).clone();
                let target_ty = self.tyk.binding_ty(binding).clone();
                let v = self.expr(value, ctx)?;
                let v = self.coerce(v, &value_ty, &target_ty);
                let place = self.place(binding, ctx, span)?;
                Ok(format!("({{ {} = {}; }})", place, v))
            }

            ExprKind::Begin(exprs) => {
                let exprs = exprs.clone();
                if exprs.is_empty() {
                    return Ok("((void) 0)".to_string());
                }
                let mut parts = Vec::with_capacity(exprs.len());
                for &e in &exprs {
                    parts.push(self.expr(e, ctx)?);
                }
                if parts.len() == 1 {
                    Ok(parts.pop().expect("one element"))
                } else {
                    Ok(format!("({})", parts.join(", ")))
                }
            }

            ExprKind::Quote(datum) => self.quote_value(*datum),

            ExprKind::And(exprs) | ExprKind::Or(exprs) => {
                let and = matches!(self.program.exprs[id].kind, ExprKind::And(_));
                let exprs = exprs.clone();
                let node_ty = self.tyk.expr_ty(id).clone();
                if exprs.is_empty() {
                    return Ok(if and { "true" } else { "false" }.to_string());
                }
                let mut parts = Vec::with_capacity(exprs.len());
                for &e in &exprs {
                    let ty = self.tyk.expr_ty(e).clone();
                    let s = self.expr(e, ctx)?;
                    parts.push(self.truthy(s, &ty));
                }
                let joined = parts.join(if and { " && " } else { " || " });
                Ok(self.coerce(format!("({})", joined), &Ty::Bool, &node_ty))
            }

            ExprKind::Call { callee, args } => self.call(id, *callee, &args.clone(), ctx),

            ExprKind::TypeDecl { .. } => Ok("((void) 0)".to_string()),

            ExprKind::Erroneous => {
                self.err("erroneous node reached code generation", span);
                Err(())
            }
        }
    }

    // ── Variable access ──────────────────────────────────────────

    /// The C lvalue for a binding, without unboxing.
    fn place(&mut self, binding: BindingId, ctx: &FnCtx, span: Span) -> Emit<String> {
        let b = &self.res.bindings[binding];
        match b.kind {
            BindingKind::Builtin => {
                let msg = format!("operator '{}' cannot be used as a value", b.name);
                self.err(msg, span);
                Err(())
            }
            BindingKind::Toplevel => {
                if self.named_fns.contains_key(&binding) {
                    let msg = format!("function '{}' has no assignable location", b.name);
                    self.err(msg, span);
                    Err(())
                } else if b.boxed {
                    Ok(format!("(*{})", cname(self.res, binding)))
                } else {
                    Ok(cname(self.res, binding))
                }
            }
            BindingKind::Param | BindingKind::Local => {
                let name = cname(self.res, binding);
                let base = if ctx.free.contains(&binding) {
                    format!("_env->{}", name)
                } else {
                    name
                };
                if b.boxed {
                    Ok(format!("(*{})", base))
                } else {
                    Ok(base)
                }
            }
        }
    }

    /// The C rvalue for a binding reference.
    fn access(&mut self, binding: BindingId, ctx: &FnCtx, span: Span) -> Emit<String> {
        if let Some(&lambda) = self.named_fns.get(&binding) {
            let name = self.fn_names[&lambda].clone();
            return Ok(format!("(SkClosure){{ (void *) {}, NULL }}", name));
        }
        self.place(binding, ctx, span)
    }

    /// The value stored into a capturing environment: boxed bindings share
    /// the cell pointer, everything else copies the current value.
    fn capture_value(&mut self, binding: BindingId, ctx: &FnCtx, span: Span) -> Emit<String> {
        let b = &self.res.bindings[binding];
        if b.boxed {
            let name = cname(self.res, binding);
            if ctx.free.contains(&binding) {
                Ok(format!("_env->{}", name))
            } else {
                Ok(name)
            }
        } else {
            self.access(binding, ctx, span)
        }
    }

    // ── Closures ─────────────────────────────────────────────────

    fn closure_value(&mut self, lambda: ExprId, ctx: &FnCtx) -> Emit<String> {
        let span = self.program.exprs[lambda].span;
        let name = self.fn_names[&lambda].clone();
        let free = self
            .res
            .lambdas
            .get(lambda)
            .map(|info| info.free.clone())
            .unwrap_or_default();
        if free.is_empty() {
            return Ok(format!("(SkClosure){{ (void *) {}, NULL }}", name));
        }
        let tmp = self.fresh_tmp();
        let mut s = format!(
            "({{ env_{id} *{tmp} = arena_alloc(arena, sizeof(env_{id})); ",
            id = raw(lambda),
            tmp = tmp
        );
        for &b in &free {
            let value = self.capture_value(b, ctx, span)?;
            s.push_str(&format!("{}->{} = {}; ", tmp, cname(self.res, b), value));
        }
        s.push_str(&format!(
            "(SkClosure){{ (void *) {}, {} }}; }})",
            name, tmp
        ));
        Ok(s)
    }

    // ── Let forms ────────────────────────────────────────────────

    fn let_expr(
        &mut self,
        id: ExprId,
        kind: LetKind,
        bindings: &[LetBinding],
        body: ExprId,
        ctx: &FnCtx,
    ) -> Emit<String> {
        let ids = self
            .res
            .introduced
            .get(id)
            .cloned()
            .unwrap_or_default();
        let mut s = String::from("({ ");

        match kind {
            LetKind::Let | LetKind::Star => {
                for (i, b) in bindings.iter().enumerate() {
                    let Some(&binding) = ids.get(i) else { continue };
                    s.push_str(&self.binding_init(binding, b.value, ctx)?);
                }
            }
            LetKind::Rec => {
                // Declare (and allocate cells) first, then run the
                // initializers: sibling closures capture the cells before
                // any value exists, and the stores patch them.
                for &binding in ids.iter() {
                    let ty = self.binding_c_ty(binding);
                    let name = cname(self.res, binding);
                    if self.res.bindings[binding].boxed {
                        s.push_str(&format!(
                            "{} *{} = arena_alloc(arena, sizeof({})); ",
                            ty, name, ty
                        ));
                    } else {
                        s.push_str(&format!("{} {}; ", ty, name));
                    }
                }
                for (i, b) in bindings.iter().enumerate() {
                    let Some(&binding) = ids.get(i) else { continue };
                    let value_ty = self.tyk.expr_ty(b.value).clone();
                    let target_ty = self.tyk.binding_ty(binding).clone();
                    let init = self.expr(b.value, ctx)?;
                    let init = self.coerce(init, &value_ty, &target_ty);
                    let name = cname(self.res, binding);
                    if self.res.bindings[binding].boxed {
                        s.push_str(&format!("*{} = {}; ", name, init));
                    } else {
                        s.push_str(&format!("{} = {}; ", name, init));
                    }
                }
            }
        }

        let body_s = self.expr(body, ctx)?;
        s.push_str(&body_s);
        s.push_str("; })");
        Ok(s)
    }

    fn binding_init(&mut self, binding: BindingId, value: ExprId, ctx: &FnCtx) -> Emit<String> {
        let value_ty = self.tyk.expr_ty(value).clone();
        let target_ty = self.tyk.binding_ty(binding).clone();
        let init = self.expr(value, ctx)?;
        let init = self.coerce(init, &value_ty, &target_ty);
        let ty = self.binding_c_ty(binding);
        let name = cname(self.res, binding);
        if self.res.bindings[binding].boxed {
            Ok(format!(
                "{} *{} = arena_alloc(arena, sizeof({})); *{} = {}; ",
                ty, name, ty, name, init
            ))
        } else {
            Ok(format!("{} {} = {}; ", ty, name, init))
        }
    }

    // ── Calls ────────────────────────────────────────────────────

    fn call(&mut self, id: ExprId, callee: ExprId, args: &[ExprId], ctx: &FnCtx) -> Emit<String> {
        let span = self.program.exprs[id].span;

        if let Some(name) = self.builtin_callee(callee) {
            return self.intrinsic(id, &name, args, ctx, span);
        }

        // Direct call to a known top-level function.
        if let ExprKind::Ident(_) = self.program.exprs[callee].kind {
            if let Some(&binding) = self.res.resolutions.get(callee) {
                if let Some(&lambda) = self.named_fns.get(&binding) {
                    let (param_tys, _) = self.lambda_fn_ty(lambda)?;
                    let name = self.fn_names[&lambda].clone();
                    let mut s = format!("{}(NULL", name);
                    for (i, &arg) in args.iter().enumerate() {
                        let arg_ty = self.tyk.expr_ty(arg).clone();
                        let param_ty = param_tys.get(i).cloned().unwrap_or(Ty::Unknown);
                        let a = self.expr(arg, ctx)?;
                        s.push_str(", ");
                        s.push_str(&self.coerce(a, &arg_ty, &param_ty));
                    }
                    s.push(')');
                    return Ok(s);
                }
            }
        }

        // General call through a closure descriptor.
        let callee_ty = self.tyk.expr_ty(callee).clone();
        let callee_s = self.expr(callee, ctx)?;
        match callee_ty {
            Ty::Fn(param_tys, ret) => {
                let tmp = self.fresh_tmp();
                let mut cast = format!("{} (*)(void *", c_type(&ret));
                for p in &param_tys {
                    cast.push_str(", ");
                    cast.push_str(&c_type(p));
                }
                cast.push(')');
                let mut s = format!(
                    "({{ SkClosure {tmp} = {callee}; (({cast}) {tmp}.fn)({tmp}.env",
                    tmp = tmp,
                    callee = callee_s,
                    cast = cast
                );
                for (i, &arg) in args.iter().enumerate() {
                    let arg_ty = self.tyk.expr_ty(arg).clone();
                    let param_ty = param_tys.get(i).cloned().unwrap_or(Ty::Unknown);
                    let a = self.expr(arg, ctx)?;
                    s.push_str(", ");
                    s.push_str(&self.coerce(a, &arg_ty, &param_ty));
                }
                s.push_str("); })");
                Ok(s)
            }
            Ty::Unknown => {
                // Dynamic call: uniform SkValue signature.
                let tmp = self.fresh_tmp();
                let mut cast = String::from("SkValue (*)(void *");
                for _ in args {
                    cast.push_str(", SkValue");
                }
                cast.push(')');
                let mut s = format!(
                    "({{ SkClosure {tmp} = sk_unbox_closure({callee}); (({cast}) {tmp}.fn)({tmp}.env",
                    tmp = tmp,
                    callee = callee_s,
                    cast = cast
                );
                for &arg in args {
                    let arg_ty = self.tyk.expr_ty(arg).clone();
                    let a = self.expr(arg, ctx)?;
                    s.push_str(", ");
                    s.push_str(&self.coerce(a, &arg_ty, &Ty::Unknown));
                }
                s.push_str("); })");
                Ok(s)
            }
            other => {
                let msg = format!("cannot call a value of type {}", other);
                self.err(msg, span);
                Err(())
            }
        }
    }

    fn builtin_callee(&self, callee: ExprId) -> Option<smol_str::SmolStr> {
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

    // ── Intrinsics ───────────────────────────────────────────────

    fn intrinsic(
        &mut self,
        id: ExprId,
        name: &str,
        args: &[ExprId],
        ctx: &FnCtx,
        span: Span,
    ) -> Emit<String> {
        let node_ty = self.tyk.expr_ty(id).clone();
        match name {
            "+" | "-" | "*" | "/" => self.arith_op(name, args, &node_ty, ctx),
            "<" | ">" | "<=" | ">=" | "=" => self.compare_op(id, name, args, ctx, span),

            "vector" => {
                if args.is_empty() {
                    return Ok("vector_f_create_from_array(arena, NULL, 0)".to_string());
                }
                let mut s = String::from("vector_f_create_from_array(arena, (float[]){");
                for (i, &arg) in args.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    let a = self.numeric_operand(arg, ctx)?;
                    s.push_str(&format!("(float) ({})", a));
                }
                s.push_str(&format!("}}, {})", args.len()));
                Ok(s)
            }
            "v+" | "v-" => {
                let fun = if name == "v+" { "vector_f_add" } else { "vector_f_sub" };
                let a = self.vector_operand(args, 0, ctx)?;
                let b = self.vector_operand(args, 1, ctx)?;
                Ok(format!("{}(arena, {}, {})", fun, a, b))
            }
            "v*" => {
                let v = self.vector_operand(args, 0, ctx)?;
                let k = self.numeric_operand(args[1], ctx)?;
                Ok(format!(
                    "vector_f_mul_scalar(arena, {}, (float) ({}))",
                    v, k
                ))
            }
            "dot" => {
                let a = self.vector_operand(args, 0, ctx)?;
                let b = self.vector_operand(args, 1, ctx)?;
                Ok(format!("vector_f_dot({}, {})", a, b))
            }
            "cross" => {
                let a = self.vector_operand(args, 0, ctx)?;
                let b = self.vector_operand(args, 1, ctx)?;
                Ok(format!("vector_f_cross(arena, {}, {})", a, b))
            }
            "norm" => {
                let v = self.vector_operand(args, 0, ctx)?;
                Ok(format!("vector_f_magnitude({})", v))
            }
            "vector-ref" => {
                let v = self.vector_operand(args, 0, ctx)?;
                let i = self.numeric_operand(args[1], ctx)?;
                Ok(format!("vector_f_get({}, (size_t) ({}))", v, i))
            }

            "gradient" => self.field_call("compute_gradient", AdapterKind::FieldFromVec, args, ctx, span),
            "laplacian" => self.field_call("compute_laplacian", AdapterKind::FieldFromVec, args, ctx, span),
            "divergence" => self.field_call("compute_divergence", AdapterKind::VecMap, args, ctx, span),
            "curl" => self.field_call("compute_curl", AdapterKind::VecMap, args, ctx, span),
            "autodiff-forward-gradient" => {
                self.field_call("compute_gradient_autodiff", AdapterKind::FieldFromVec, args, ctx, span)
            }
            "autodiff-reverse-gradient" => {
                self.field_call("compute_gradient_reverse_mode", AdapterKind::FieldFromVec, args, ctx, span)
            }
            "autodiff-hessian" => {
                self.field_call("compute_hessian", AdapterKind::FieldFromVec, args, ctx, span)
            }
            "autodiff-jacobian" => {
                self.field_call("compute_jacobian", AdapterKind::VecMap, args, ctx, span)
            }

            "autodiff-forward" | "autodiff-reverse" => {
                let fun = if name == "autodiff-forward" {
                    "compute_gradient_autodiff"
                } else {
                    "compute_gradient_reverse_mode"
                };
                let adapter = self.adapter(args[0], AdapterKind::FieldFromScalar, span)?;
                let x = self.numeric_operand(args[1], ctx)?;
                Ok(format!(
                    "vector_f_get({}(arena, {}, vector_f_create_from_array(arena, (float[]){{(float) ({})}}, 1)), 0)",
                    fun, adapter, x
                ))
            }
            "derivative" => {
                let adapter = self.adapter(args[0], AdapterKind::ScalarFn, span)?;
                let x = self.numeric_operand(args[1], ctx)?;
                Ok(format!(
                    "compute_nth_derivative(arena, {}, (double) ({}), 1)",
                    adapter, x
                ))
            }

            "display" => self.display(args[0], ctx),
            "newline" => Ok("printf(\"\\n\")".to_string()),
            "string-append" => {
                if args.is_empty() {
                    return Ok("\"\"".to_string());
                }
                let mut parts = Vec::with_capacity(args.len());
                for &arg in args {
                    let ty = self.tyk.expr_ty(arg).clone();
                    let a = self.expr(arg, ctx)?;
                    parts.push(self.coerce(a, &ty, &Ty::Str));
                }
                Ok(format!(
                    "sk_string_append(arena, (const char *[]){{{}}}, {})",
                    parts.join(", "),
                    parts.len()
                ))
            }
            "number->string" => {
                let a = self.numeric_operand(args[0], ctx)?;
                Ok(format!("sk_number_to_string(arena, (double) ({}))", a))
            }
            "printf" => {
                let mut s = String::from("printf(");
                for (i, &arg) in args.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&self.expr(arg, ctx)?);
                }
                s.push(')');
                Ok(s)
            }

            other => {
                let msg = format!("no lowering for built-in operator '{}'", other);
                self.err(msg, span);
                Err(())
            }
        }
    }

    /// Left-fold arithmetic over the infix C operator, in the promoted type.
    fn arith_op(
        &mut self,
        name: &str,
        args: &[ExprId],
        node_ty: &Ty,
        ctx: &FnCtx,
    ) -> Emit<String> {
        // Dynamic operands compute in double and rebox.
        let work_ty = if *node_ty == Ty::Unknown { Ty::Float } else { node_ty.clone() };
        let mut parts = Vec::with_capacity(args.len());
        for &arg in args {
            let ty = self.tyk.expr_ty(arg).clone();
            let a = self.expr(arg, ctx)?;
            parts.push(self.coerce(a, &ty, &work_ty));
        }
        let s = match (name, parts.len()) {
            ("+", 0) => "INT64_C(0)".to_string(),
            ("*", 0) => "INT64_C(1)".to_string(),
            ("-", 1) => format!("(-({}))", parts[0]),
            ("/", 1) => {
                if work_ty == Ty::Int {
                    format!("(INT64_C(1) / ({}))", parts[0])
                } else {
                    format!("(1.0 / ({}))", parts[0])
                }
            }
            _ => {
                let joined = parts
                    .iter()
                    .map(|p| format!("({})", p))
                    .collect::<Vec<_>>()
                    .join(&format!(" {} ", name));
                format!("({})", joined)
            }
        };
        Ok(self.coerce(s, &work_ty, node_ty))
    }

    fn compare_op(
        &mut self,
        id: ExprId,
        name: &str,
        args: &[ExprId],
        ctx: &FnCtx,
        span: Span,
    ) -> Emit<String> {
        if args.len() != 2 {
            self.err(format!("'{}' expects two arguments", name), span);
            return Err(());
        }
        let node_ty = self.tyk.expr_ty(id).clone();
        let a_ty = self.tyk.expr_ty(args[0]).clone();
        let b_ty = self.tyk.expr_ty(args[1]).clone();
        let a = self.expr(args[0], ctx)?;
        let b = self.expr(args[1], ctx)?;

        let s = if name == "=" && (a_ty == Ty::Symbol || b_ty == Ty::Symbol) {
            format!("sk_symbol_eq({}, {})", a, b)
        } else if a_ty == Ty::Unknown || b_ty == Ty::Unknown {
            let a = self.coerce(a, &a_ty, &Ty::Float);
            let b = self.coerce(b, &b_ty, &Ty::Float);
            format!("(({}) {} ({}))", a, op_c(name), b)
        } else if a_ty == Ty::Float || b_ty == Ty::Float {
            let a = self.coerce(a, &a_ty, &Ty::Float);
            let b = self.coerce(b, &b_ty, &Ty::Float);
            format!("(({}) {} ({}))", a, op_c(name), b)
        } else {
            format!("(({}) {} ({}))", a, op_c(name), b)
        };
        Ok(self.coerce(s, &Ty::Bool, &node_ty))
    }

    fn numeric_operand(&mut self, arg: ExprId, ctx: &FnCtx) -> Emit<String> {
        let ty = self.tyk.expr_ty(arg).clone();
        let s = self.expr(arg, ctx)?;
        Ok(match ty {
            Ty::Unknown => format!("sk_unbox_double({})", s),
            _ => s,
        })
    }

    fn vector_operand(&mut self, args: &[ExprId], i: usize, ctx: &FnCtx) -> Emit<String> {
        let arg = args[i];
        let ty = self.tyk.expr_ty(arg).clone();
        let s = self.expr(arg, ctx)?;
        Ok(match ty {
            Ty::Unknown => format!("sk_unbox_vector({})", s),
            _ => s,
        })
    }

    // ── Field and autodiff adapters ──────────────────────────────

    fn field_call(
        &mut self,
        fun: &str,
        kind: AdapterKind,
        args: &[ExprId],
        ctx: &FnCtx,
        span: Span,
    ) -> Emit<String> {
        let adapter = self.adapter(args[0], kind, span)?;
        let x = self.vector_operand(args, 1, ctx)?;
        Ok(format!("{}(arena, {}, {})", fun, adapter, x))
    }

    /// The adapter wrapping a named top-level function in the C signature a
    /// runtime entry point expects. One adapter per (function, shape) pair.
    fn adapter(&mut self, callee: ExprId, kind: AdapterKind, span: Span) -> Emit<String> {
        let binding = match &self.program.exprs[callee].kind {
            ExprKind::Ident(_) => self.res.resolutions.get(callee).copied(),
            _ => None,
        };
        let Some(binding) = binding else {
            self.err(
                "differential operators need a named top-level function",
                span,
            );
            return Err(());
        };
        if !self.named_fns.contains_key(&binding) {
            self.err(
                "differential operators need a named top-level function",
                span,
            );
            return Err(());
        }
        if let Some(name) = self.adapter_memo.get(&(binding, kind)) {
            return Ok(name.clone());
        }
        let suffix = match kind {
            AdapterKind::FieldFromVec => "field",
            AdapterKind::FieldFromScalar => "sfield",
            AdapterKind::VecMap => "vmap",
            AdapterKind::ScalarFn => "dfun",
        };
        let name = format!("{}_{}", cname(self.res, binding), suffix);
        self.adapter_memo.insert((binding, kind), name.clone());
        self.adapters.push(Adapter {
            name: name.clone(),
            kind,
            target: binding,
        });
        Ok(name)
    }

    fn adapter_def(&mut self, index: usize) -> String {
        let adapter = &self.adapters[index];
        let name = adapter.name.clone();
        let kind = adapter.kind;
        let target = adapter.target;
        let lambda = self.named_fns[&target];
        let fn_name = self.fn_names[&lambda].clone();
        let (param_tys, ret) = match self.lambda_fn_ty(lambda) {
            Ok(sig) => sig,
            Err(()) => return String::new(),
        };
        if param_tys.len() != 1 {
            let span = self.program.exprs[lambda].span;
            self.err(
                "differential operators need a single-parameter function",
                span,
            );
            return String::new();
        }
        let param = &param_tys[0];

        let raw_arg = match kind {
            AdapterKind::FieldFromVec | AdapterKind::VecMap => "(VectorF *) x".to_string(),
            AdapterKind::FieldFromScalar => "(double) vector_f_get(x, 0)".to_string(),
            AdapterKind::ScalarFn => "x".to_string(),
        };
        let arg = match (kind, param) {
            (AdapterKind::FieldFromVec | AdapterKind::VecMap, Ty::Unknown) => {
                format!("sk_box_vector({})", raw_arg)
            }
            (AdapterKind::FieldFromVec | AdapterKind::VecMap, _) => raw_arg,
            (_, Ty::Int) => format!("(int64_t) ({})", raw_arg),
            (_, Ty::Unknown) => format!("sk_box_double({})", raw_arg),
            _ => raw_arg,
        };
        let call = format!("{}(NULL, {})", fn_name, arg);
        let body = match kind {
            AdapterKind::VecMap => match ret {
                Ty::Unknown => format!("return sk_unbox_vector({});", call),
                _ => format!("return {};", call),
            },
            _ => match ret {
                Ty::Unknown => format!("return sk_unbox_double({});", call),
                _ => format!("return (double) {};", call),
            },
        };
        let sig = adapter_signature(&Adapter {
            name,
            kind,
            target,
        });
        format!("{} {{\n    {}\n}}\n", sig, body)
    }

    // ── display ──────────────────────────────────────────────────

    fn display(&mut self, arg: ExprId, ctx: &FnCtx) -> Emit<String> {
        let ty = self.tyk.expr_ty(arg).clone();
        let span = self.program.exprs[arg].span;
        let a = self.expr(arg, ctx)?;
        Ok(match ty {
            Ty::Int => format!("printf(\"%lld\", (long long) ({}))", a),
            Ty::Float => format!("printf(\"%g\", (double) ({}))", a),
            Ty::Bool => format!("printf(\"%s\", ({}) ? \"#t\" : \"#f\")", a),
            Ty::Str | Ty::Symbol => format!("printf(\"%s\", {})", a),
            Ty::Char => format!("sk_display_char({})", a),
            Ty::Vector(_) => format!("vector_f_display({})", a),
            Ty::Pair(..) => format!("sk_display_pair({})", a),
            Ty::Fn(..) => "printf(\"#<procedure>\")".to_string(),
            Ty::Unknown => format!("sk_value_display({})", a),
            Ty::Void | Ty::Var(_) => {
                self.err("cannot display a void value", span);
                return Err(());
            }
        })
    }

    // ── Quoted data ──────────────────────────────────────────────

    fn quote_value(&mut self, datum: DatumId) -> Emit<String> {
        match &self.program.datums[datum].kind {
            DatumKind::Int(n) => Ok(format!("INT64_C({})", n)),
            DatumKind::Float(f) => Ok(format!("{:?}", f)),
            DatumKind::Bool(b) => Ok(if *b { "true" } else { "false" }.to_string()),
            DatumKind::Str(s) => Ok(c_string(s)),
            DatumKind::Char(c) => Ok(format!("{}", *c as u32)),
            DatumKind::Symbol(s) => Ok(c_string(s)),
            DatumKind::List { elems, tail } => {
                let (elems, tail) = (elems.clone(), *tail);
                let mut acc = match tail {
                    Some(t) => self.boxed_datum(t)?,
                    None => "sk_value_void()".to_string(),
                };
                let mut chain = String::new();
                for &e in elems.iter().rev() {
                    let head = self.boxed_datum(e)?;
                    chain = format!("sk_cons(arena, {}, {})", head, acc);
                    acc = format!("sk_box_pair({})", chain);
                }
                if elems.is_empty() {
                    Ok("((SkPair *) NULL)".to_string())
                } else {
                    Ok(chain)
                }
            }
        }
    }

    /// A datum as a tagged runtime value.
    fn boxed_datum(&mut self, datum: DatumId) -> Emit<String> {
        let kind = self.program.datums[datum].kind.clone();
        Ok(match kind {
            DatumKind::Int(n) => format!("sk_box_int(INT64_C({}))", n),
            DatumKind::Float(f) => format!("sk_box_double({:?})", f),
            DatumKind::Bool(b) => format!("sk_box_bool({})", b),
            DatumKind::Str(s) => format!("sk_box_string({})", c_string(&s)),
            DatumKind::Char(c) => format!("sk_box_char({})", c as u32),
            DatumKind::Symbol(s) => format!("sk_box_symbol({})", c_string(&s)),
            DatumKind::List { .. } => {
                let inner = self.quote_value(datum)?;
                format!("sk_box_pair({})", inner)
            }
        })
    }

    // ── Coercions ────────────────────────────────────────────────

    /// Bridge a value from one static type to another, boxing or unboxing
    /// at the `any` boundary.
    fn coerce(&mut self, s: String, from: &Ty, to: &Ty) -> String {
        if from == to {
            return s;
        }
        match (from, to) {
            (Ty::Unknown, Ty::Unknown) => s,
            (_, Ty::Unknown) => match from {
                Ty::Int => format!("sk_box_int({})", s),
                Ty::Float => format!("sk_box_double({})", s),
                Ty::Bool => format!("sk_box_bool({})", s),
                Ty::Char => format!("sk_box_char({})", s),
                Ty::Str => format!("sk_box_string({})", s),
                Ty::Symbol => format!("sk_box_symbol({})", s),
                Ty::Pair(..) => format!("sk_box_pair({})", s),
                Ty::Vector(_) => format!("sk_box_vector({})", s),
                Ty::Fn(..) => format!("sk_box_closure({})", s),
                Ty::Void => format!("({}, sk_value_void())", s),
                Ty::Unknown | Ty::Var(_) => s,
            },
            (Ty::Unknown, _) => match to {
                Ty::Int => format!("sk_unbox_int({})", s),
                Ty::Float => format!("sk_unbox_double({})", s),
                Ty::Bool => format!("sk_unbox_bool({})", s),
                Ty::Char => format!("sk_unbox_char({})", s),
                Ty::Str | Ty::Symbol => format!("sk_unbox_string({})", s),
                Ty::Pair(..) => format!("sk_unbox_pair({})", s),
                Ty::Vector(_) => format!("sk_unbox_vector({})", s),
                Ty::Fn(..) => format!("sk_unbox_closure({})", s),
                Ty::Void => format!("((void) ({}))", s),
                Ty::Unknown | Ty::Var(_) => s,
            },
            (Ty::Int, Ty::Float) => format!("(double) ({})", s),
            (Ty::Float, Ty::Int) => format!("(int64_t) ({})", s),
            (Ty::Bool, Ty::Int) => format!("(int64_t) ({})", s),
            (Ty::Bool, Ty::Float) => format!("(double) ({})", s),
            (Ty::Char, Ty::Int) => format!("(int64_t) ({})", s),
            _ => {
                if c_type(from) == c_type(to) {
                    s
                } else {
                    // Mismatches were already diagnosed; emit unchanged.
                    s
                }
            }
        }
    }

    fn truthy(&mut self, s: String, ty: &Ty) -> String {
        match ty {
            Ty::Bool | Ty::Int | Ty::Float | Ty::Char => s,
            Ty::Unknown => format!("sk_truthy({})", s),
            Ty::Str | Ty::Symbol => format!("(({}) != NULL)", s),
            Ty::Pair(..) | Ty::Vector(_) => format!("(({}) != NULL)", s),
            Ty::Fn(..) => format!("(({}).fn != NULL)", s),
            Ty::Void | Ty::Var(_) => "0".to_string(),
        }
    }

    fn binding_c_ty(&self, binding: BindingId) -> String {
        c_type(self.tyk.binding_ty(binding))
    }
}

// ── Helpers ───────────────────────────────────────────────────────

fn raw<T>(idx: Idx<T>) -> u32 {
    u32::from(idx.into_raw())
}

/// C identifier for a binding: the sanitized source name plus the binding id,
/// so shadowed names never collide.
fn cname(res: &ResolveResult, binding: BindingId) -> String {
    let b = &res.bindings[binding];
    let mut name = String::with_capacity(b.name.len() + 4);
    for ch in b.name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            name.push(ch);
        } else {
            name.push('_');
        }
    }
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, 'v');
    }
    format!("{}_{}", name, raw(binding))
}

fn c_type(ty: &Ty) -> String {
    match ty {
        Ty::Int => "int64_t".to_string(),
        Ty::Float => "double".to_string(),
        Ty::Bool => "bool".to_string(),
        Ty::Char => "int32_t".to_string(),
        Ty::Str | Ty::Symbol => "const char *".to_string(),
        Ty::Void => "void".to_string(),
        Ty::Unknown | Ty::Var(_) => "SkValue".to_string(),
        Ty::Pair(..) => "SkPair *".to_string(),
        Ty::Vector(_) => "VectorF *".to_string(),
        Ty::Fn(..) => "SkClosure".to_string(),
    }
}

fn op_c(name: &str) -> &'static str {
    match name {
        "=" => "==",
        "<" => "<",
        ">" => ">",
        "<=" => "<=",
        ">=" => ">=",
        _ => "==",
    }
}

fn adapter_signature(adapter: &Adapter) -> String {
    match adapter.kind {
        AdapterKind::FieldFromVec | AdapterKind::FieldFromScalar => {
            format!("static double {}(const VectorF *x)", adapter.name)
        }
        AdapterKind::VecMap => format!("static VectorF *{}(const VectorF *x)", adapter.name),
        AdapterKind::ScalarFn => format!("static double {}(double x)", adapter.name),
    }
}

/// Wrap an expression so it can stand as a C statement.
fn discard(s: &str, ty: &Ty) -> String {
    if *ty == Ty::Void {
        s.to_string()
    } else {
        format!("(void) ({})", s)
    }
}

fn c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skink_parser::parse;
    use skink_resolver::resolve;
    use skink_typeck::infer;

    fn emit_ok(source: &str) -> String {
        let mut diags = Diagnostics::new();
        let program = parse(source, &mut diags);
        let res = resolve(&program, &mut diags);
        let tyk = infer(&program, &res, &mut diags);
        assert!(
            !diags.has_errors(),
            "frontend errors: {:?}",
            diags.iter().collect::<Vec<_>>()
        );
        emit(&program, &res, &tyk, &mut diags).unwrap_or_else(|| {
            panic!(
                "emission failed: {:?}",
                diags.iter().collect::<Vec<_>>()
            )
        })
    }

    fn emit_err(source: &str) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let program = parse(source, &mut diags);
        let res = resolve(&program, &mut diags);
        let tyk = infer(&program, &res, &mut diags);
        assert!(!diags.has_errors(), "unexpected frontend errors");
        let out = emit(&program, &res, &tyk, &mut diags);
        assert!(out.is_none(), "expected emission failure");
        assert!(diags.has_errors());
        diags
    }

    #[test]
    fn factorial_emits_a_named_function() {
        let c = emit_ok(
            "(define (f n) (if (= n 0) 1 (* n (f (- n 1))))) (display (f 10))",
        );
        assert!(c.contains("static int64_t f_"), "{}", c);
        assert!(c.contains("printf(\"%lld\""), "{}", c);
        assert!(c.contains("int main(void)"), "{}", c);
        assert!(c.contains("toplevel();"), "{}", c);
    }

    #[test]
    fn emission_is_idempotent() {
        let source =
            "(define (make-adder k) (lambda (x) (+ x k))) (define add3 (make-adder 3)) (display (add3 4))";
        assert_eq!(emit_ok(source), emit_ok(source));
    }

    #[test]
    fn closures_get_typed_environment_structs() {
        let c = emit_ok(
            "(define (make-adder k) (lambda (x) (+ x k))) (define add3 (make-adder 3)) (display (add3 4))",
        );
        assert!(c.contains("typedef struct env_"), "{}", c);
        assert!(c.contains("double k_"), "{}", c);
        assert!(c.contains("arena_alloc(arena, sizeof(env_"), "{}", c);
        assert!(c.contains("(SkClosure){"), "{}", c);
    }

    #[test]
    fn plain_lambdas_have_null_environments() {
        let c = emit_ok("(display ((lambda (x) x) 5))");
        assert!(c.contains("(SkClosure){ (void *) lambda_"), "{}", c);
        assert!(c.contains(", NULL }"), "{}", c);
    }

    #[test]
    fn gradual_identity_uses_tagged_values() {
        let c = emit_ok(
            "(define (id x) x) (display (id 5)) (display (id \"hi\"))",
        );
        assert!(c.contains("SkValue id_"), "{}", c);
        assert!(c.contains("sk_box_int"), "{}", c);
        assert!(c.contains("sk_box_string"), "{}", c);
        assert!(c.contains("sk_value_display"), "{}", c);
    }

    #[test]
    fn mutable_captures_are_boxed() {
        let c = emit_ok(
            "(define (counter) (let ((n 0)) (lambda () (set! n (+ n 1)) n)))\
             (display 1)",
        );
        assert!(c.contains("arena_alloc(arena, sizeof(int64_t))"), "{}", c);
        assert!(c.contains("int64_t *n_"), "{}", c);
        assert!(c.contains("(*_env->n_"), "{}", c);
    }

    #[test]
    fn letrec_declares_before_initializing() {
        let c = emit_ok(
            "(define (go n)\
               (letrec ((even? (lambda (k) (if (= k 0) #t (odd? (- k 1)))))\
                        (odd? (lambda (k) (if (= k 0) #f (even? (- k 1))))))\
                 (even? n)))\
             (display (go 4))",
        );
        // Cells are allocated before either initializer runs.
        let alloc = c.find("SkClosure *even__").expect("cell decl");
        let assign = c.find("*even__").expect("store");
        assert!(alloc <= assign, "{}", c);
    }

    #[test]
    fn arithmetic_folds_left() {
        let c = emit_ok("(display (+ 1 2 3))");
        assert!(
            c.contains("(INT64_C(1)) + (INT64_C(2)) + (INT64_C(3))"),
            "{}",
            c
        );
    }

    #[test]
    fn vector_intrinsics_lower_to_runtime_calls() {
        let c = emit_ok(
            "(define v (vector 1.0 2.0 3.0)) (display (norm (v+ v v)))",
        );
        assert!(c.contains("vector_f_create_from_array(arena, (float[]){"), "{}", c);
        assert!(c.contains("vector_f_add(arena, "), "{}", c);
        assert!(c.contains("vector_f_magnitude("), "{}", c);
    }

    #[test]
    fn forward_autodiff_wraps_scalar_input() {
        let c = emit_ok(
            "(define (f x) (* x x)) (display (autodiff-forward f 3.0))",
        );
        assert!(c.contains("static double f_"), "{}", c);
        assert!(c.contains("_sfield(const VectorF *x)"), "{}", c);
        assert!(c.contains("compute_gradient_autodiff(arena, f_"), "{}", c);
        assert!(c.contains("vector_f_get("), "{}", c);
    }

    #[test]
    fn adapters_are_memoized() {
        let c = emit_ok(
            "(define (f x) (* x x))\
             (display (autodiff-forward f 1.0))\
             (display (autodiff-forward f 2.0))",
        );
        assert_eq!(c.matches("_sfield(const VectorF *x) {").count(), 1, "{}", c);
    }

    #[test]
    fn autodiff_of_anonymous_function_is_unsupported() {
        let diags = emit_err("(display (autodiff-forward (lambda (x) x) 1.0))");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("named top-level function")));
    }

    #[test]
    fn operator_as_value_is_unsupported() {
        let diags = emit_err("(define add +) (display 1)");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("cannot be used as a value")));
    }

    #[test]
    fn quoted_lists_build_pair_chains() {
        let c = emit_ok("(define l '(1 2)) (display l)");
        assert!(c.contains("sk_cons(arena, sk_box_int(INT64_C(1))"), "{}", c);
        assert!(c.contains("sk_display_pair("), "{}", c);
    }

    #[test]
    fn and_or_short_circuit() {
        let c = emit_ok("(display (and #t #f)) (display (or #f #t))");
        assert!(c.contains(" && "), "{}", c);
        assert!(c.contains(" || "), "{}", c);
    }

    #[test]
    fn user_main_is_called_and_returns() {
        let c = emit_ok("(define (main) 0)");
        assert!(c.contains("int rc = (int) main_"), "{}", c);
        assert!(c.contains("return rc;"), "{}", c);
    }

    #[test]
    fn no_output_after_failure() {
        let mut diags = Diagnostics::new();
        let program = parse("(define add +) (display 1)", &mut diags);
        let res = resolve(&program, &mut diags);
        let tyk = infer(&program, &res, &mut diags);
        assert_eq!(emit(&program, &res, &tyk, &mut diags), None);
    }
}
