//! Name resolution: scope construction, binding introduction, and closure
//! capture analysis.
//!
//! Runs in two passes. The first pass builds the scope forest, introduces a
//! binding for every definition site and resolves each identifier innermost
//! outward. The second pass computes the free-binding list of every lambda
//! and flags captured (and, where needed, boxed) bindings.

use std::collections::HashMap;

use la_arena::{Arena, ArenaMap, Idx};
use log::{debug, info, trace};
use smol_str::SmolStr;
use skink_ast::{ExprId, ExprKind, LetKind, Program};
use skink_diag::Diagnostics;

pub type BindingId = Idx<Binding>;
pub type ScopeId = Idx<Scope>;

/// Built-in operators pre-seeded in the module scope. Calls whose callee
/// resolves to one of these dispatch to specialized lowerings; shadowing a
/// name disables that dispatch for the shadowed name.
pub const BUILTINS: &[&str] = &[
    "+",
    "-",
    "*",
    "/",
    "<",
    ">",
    "<=",
    ">=",
    "=",
    "vector",
    "v+",
    "v-",
    "v*",
    "dot",
    "cross",
    "norm",
    "vector-ref",
    "gradient",
    "divergence",
    "curl",
    "laplacian",
    "autodiff-forward",
    "autodiff-reverse",
    "autodiff-forward-gradient",
    "autodiff-reverse-gradient",
    "autodiff-jacobian",
    "autodiff-hessian",
    "derivative",
    "display",
    "newline",
    "string-append",
    "number->string",
    "printf",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Lambda parameter.
    Param,
    /// Introduced by a let form or an internal define.
    Local,
    /// Top-level define.
    Toplevel,
    /// Pre-seeded operator.
    Builtin,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub name: SmolStr,
    pub scope: ScopeId,
    /// The define/let/lambda node that introduced this binding.
    pub node: Option<ExprId>,
    pub kind: BindingKind,
    /// Target of at least one `set!` (or redefined at top level).
    pub mutable: bool,
    /// Referenced from a lambda whose scope is a strict descendant of the
    /// binding's scope.
    pub captured: bool,
    /// Lowered as a heap cell: captured and either mutated or introduced by
    /// a letrec (closure cycles observe each other through the cell).
    pub boxed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Lambda,
    Let,
    LetRec,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    /// The form that introduced this scope; `None` for the module scope.
    pub node: Option<ExprId>,
    pub kind: ScopeKind,
}

/// Per-lambda annotation produced by capture analysis.
#[derive(Debug, Clone)]
pub struct LambdaInfo {
    pub scope: ScopeId,
    pub params: Vec<BindingId>,
    /// Outer bindings referenced from the body, in first-reference order.
    /// Non-empty means the lambda is a closure. Module-level bindings lower
    /// to file-scope C symbols and are never listed here.
    pub free: Vec<BindingId>,
}

#[derive(Debug)]
pub struct ResolveResult {
    pub scopes: Arena<Scope>,
    pub bindings: Arena<Binding>,
    pub module_scope: ScopeId,
    /// Identifier, `set!` and `define` nodes to the binding they refer to.
    pub resolutions: ArenaMap<ExprId, BindingId>,
    /// Define and let nodes to the bindings they introduce, in source order.
    pub introduced: ArenaMap<ExprId, Vec<BindingId>>,
    pub lambdas: ArenaMap<ExprId, LambdaInfo>,
}

impl ResolveResult {
    pub fn is_builtin(&self, id: BindingId) -> bool {
        self.bindings[id].kind == BindingKind::Builtin
    }
}

pub fn resolve(program: &Program, diags: &mut Diagnostics) -> ResolveResult {
    info!("beginning name resolution");
    let mut resolver = Resolver::new(program, diags);
    resolver.declare_toplevel();
    debug!("resolving {} top-level forms", program.forms.len());
    for &form in &program.forms {
        resolver.visit(form);
    }
    resolver.analyze_captures();
    trace!(
        "done resolving: {} bindings in {} scopes",
        resolver.bindings.len(),
        resolver.scopes.len()
    );
    ResolveResult {
        scopes: resolver.scopes,
        bindings: resolver.bindings,
        module_scope: resolver.module_scope,
        resolutions: resolver.resolutions,
        introduced: resolver.introduced,
        lambdas: resolver.lambdas,
    }
}

struct Resolver<'a> {
    program: &'a Program,
    diags: &'a mut Diagnostics,
    scopes: Arena<Scope>,
    bindings: Arena<Binding>,
    module_scope: ScopeId,
    /// Active scope chain; parallel name maps for lookup.
    scope_stack: Vec<ScopeId>,
    name_stack: Vec<HashMap<SmolStr, BindingId>>,
    resolutions: ArenaMap<ExprId, BindingId>,
    introduced: ArenaMap<ExprId, Vec<BindingId>>,
    lambdas: ArenaMap<ExprId, LambdaInfo>,
}

impl<'a> Resolver<'a> {
    fn new(program: &'a Program, diags: &'a mut Diagnostics) -> Self {
        let mut scopes = Arena::new();
        let module_scope = scopes.alloc(Scope {
            parent: None,
            node: None,
            kind: ScopeKind::Module,
        });
        let mut bindings = Arena::new();
        let mut module_names = HashMap::new();
        for name in BUILTINS {
            let name = SmolStr::new(*name);
            let id = bindings.alloc(Binding {
                name: name.clone(),
                scope: module_scope,
                node: None,
                kind: BindingKind::Builtin,
                mutable: false,
                captured: false,
                boxed: false,
            });
            module_names.insert(name, id);
        }
        Self {
            program,
            diags,
            scopes,
            bindings,
            module_scope,
            scope_stack: vec![module_scope],
            name_stack: vec![module_names],
            resolutions: ArenaMap::default(),
            introduced: ArenaMap::default(),
            lambdas: ArenaMap::default(),
        }
    }

    // ── Scope helpers ─────────────────────────────────────────────

    fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().expect("scope stack never empty")
    }

    fn push_scope(&mut self, kind: ScopeKind, node: ExprId) -> ScopeId {
        let scope = self.scopes.alloc(Scope {
            parent: Some(self.current_scope()),
            node: Some(node),
            kind,
        });
        self.scope_stack.push(scope);
        self.name_stack.push(HashMap::new());
        scope
    }

    fn pop_scope(&mut self) {
        self.scope_stack.pop();
        self.name_stack.pop();
    }

    fn declare(&mut self, name: &SmolStr, kind: BindingKind, node: ExprId) -> BindingId {
        let id = self.bindings.alloc(Binding {
            name: name.clone(),
            scope: self.current_scope(),
            node: Some(node),
            kind,
            mutable: false,
            captured: false,
            boxed: false,
        });
        self.name_stack
            .last_mut()
            .expect("scope stack never empty")
            .insert(name.clone(), id);
        id
    }

    fn lookup(&self, name: &str) -> Option<BindingId> {
        for map in self.name_stack.iter().rev() {
            if let Some(&id) = map.get(name) {
                return Some(id);
            }
        }
        None
    }

    // ── Pass 1: declaration and resolution ────────────────────────

    /// Hoist every top-level define into the module scope so definitions can
    /// refer to each other regardless of order.
    fn declare_toplevel(&mut self) {
        for &form in &self.program.forms {
            if let ExprKind::Define { name, .. } = &self.program.exprs[form].kind {
                match self.name_stack[0].get(name).copied() {
                    Some(existing) if self.bindings[existing].kind != BindingKind::Builtin => {
                        // Redefinition reuses the binding and acts as mutation.
                        self.bindings[existing].mutable = true;
                    }
                    _ => {
                        self.declare(&name.clone(), BindingKind::Toplevel, form);
                    }
                }
            }
        }
    }

    fn visit(&mut self, expr: ExprId) {
        match &self.program.exprs[expr].kind {
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Bool(_)
            | ExprKind::Str(_)
            | ExprKind::Char(_)
            | ExprKind::Quote(_)
            | ExprKind::TypeDecl { .. }
            | ExprKind::Erroneous => {}

            ExprKind::Ident(name) => {
                let span = self.program.exprs[expr].span;
                match self.lookup(name) {
                    Some(id) => {
                        self.resolutions.insert(expr, id);
                    }
                    None => {
                        let msg = format!("unresolved identifier '{}'", name);
                        self.diags.error(msg, span);
                    }
                }
            }

            ExprKind::Define { name, value, .. } => {
                let name = name.clone();
                let value = *value;
                let at_module = self.current_scope() == self.module_scope;
                let id = if at_module {
                    // Already hoisted by declare_toplevel.
                    self.name_stack[0]
                        .get(&name)
                        .copied()
                        .unwrap_or_else(|| self.declare(&name, BindingKind::Toplevel, expr))
                } else {
                    // Internal define: visible to its own value for recursion.
                    self.declare(&name, BindingKind::Local, expr)
                };
                self.resolutions.insert(expr, id);
                self.introduced.insert(expr, vec![id]);
                self.visit(value);
            }

            ExprKind::Set { name, value, .. } => {
                let span = self.program.exprs[expr].span;
                let name = name.clone();
                let value = *value;
                match self.lookup(&name) {
                    Some(id) => {
                        if self.bindings[id].kind == BindingKind::Builtin {
                            let msg = format!("cannot assign to built-in operator '{}'", name);
                            self.diags.error(msg, span);
                        } else {
                            self.bindings[id].mutable = true;
                            self.resolutions.insert(expr, id);
                        }
                    }
                    None => {
                        let msg = format!("unresolved identifier '{}'", name);
                        self.diags.error(msg, span);
                    }
                }
                self.visit(value);
            }

            ExprKind::Lambda { params, body, .. } => {
                let params = params.clone();
                let body = *body;
                let scope = self.push_scope(ScopeKind::Lambda, expr);
                let mut param_ids = Vec::with_capacity(params.len());
                for param in &params {
                    if self.name_stack.last().expect("scope").contains_key(&param.name) {
                        let msg = format!("duplicate parameter '{}'", param.name);
                        self.diags.error(msg, param.name_span);
                    }
                    param_ids.push(self.declare(&param.name, BindingKind::Param, expr));
                }
                self.lambdas.insert(
                    expr,
                    LambdaInfo {
                        scope,
                        params: param_ids,
                        free: Vec::new(),
                    },
                );
                self.visit(body);
                self.pop_scope();
            }

            ExprKind::Let {
                kind,
                bindings,
                body,
            } => {
                let kind = *kind;
                let bindings = bindings.clone();
                let body = *body;
                let mut ids = Vec::with_capacity(bindings.len());
                match kind {
                    LetKind::Let => {
                        // Initializers run in the enclosing scope.
                        for b in &bindings {
                            self.visit(b.value);
                        }
                        self.push_scope(ScopeKind::Let, expr);
                        for b in &bindings {
                            ids.push(self.declare(&b.name, BindingKind::Local, expr));
                        }
                        self.visit(body);
                        self.pop_scope();
                    }
                    LetKind::Star => {
                        // Each initializer sees all preceding bindings.
                        for b in &bindings {
                            self.visit(b.value);
                            self.push_scope(ScopeKind::Let, expr);
                            ids.push(self.declare(&b.name, BindingKind::Local, expr));
                        }
                        self.visit(body);
                        for _ in &bindings {
                            self.pop_scope();
                        }
                    }
                    LetKind::Rec => {
                        // All bindings are visible to every initializer.
                        self.push_scope(ScopeKind::LetRec, expr);
                        for b in &bindings {
                            ids.push(self.declare(&b.name, BindingKind::Local, expr));
                        }
                        for b in &bindings {
                            self.visit(b.value);
                        }
                        self.visit(body);
                        self.pop_scope();
                    }
                }
                self.introduced.insert(expr, ids);
            }

            ExprKind::If {
                test,
                then_branch,
                else_branch,
            } => {
                let (test, then_branch, else_branch) = (*test, *then_branch, *else_branch);
                self.visit(test);
                self.visit(then_branch);
                if let Some(e) = else_branch {
                    self.visit(e);
                }
            }

            ExprKind::Begin(exprs) | ExprKind::And(exprs) | ExprKind::Or(exprs) => {
                for &e in &exprs.clone() {
                    self.visit(e);
                }
            }

            ExprKind::Call { callee, args } => {
                let callee = *callee;
                let args = args.clone();
                self.visit(callee);
                for &a in &args {
                    self.visit(a);
                }
            }
        }
    }

    // ── Pass 2: capture analysis ──────────────────────────────────

    fn analyze_captures(&mut self) {
        debug!("analyzing captures for {} lambdas", self.lambdas.iter().count());
        let lambda_ids: Vec<ExprId> = self.lambdas.iter().map(|(id, _)| id).collect();
        for lambda in lambda_ids {
            let scope = match self.lambdas.get(lambda) {
                Some(info) => info.scope,
                None => continue,
            };
            let body = match &self.program.exprs[lambda].kind {
                ExprKind::Lambda { body, .. } => *body,
                _ => continue,
            };
            let mut free = Vec::new();
            self.collect_free(body, scope, &mut free);
            for &b in &free {
                self.bindings[b].captured = true;
            }
            if let Some(info) = self.lambdas.get_mut(lambda) {
                info.free = free;
            }
        }
        // A captured binding needs a heap cell when its value can change
        // after capture: explicit mutation, or letrec initialization where
        // sibling closures may be created before the store completes.
        for (_, binding) in self.bindings.iter_mut() {
            if binding.captured {
                let letrec = matches!(self.scopes[binding.scope].kind, ScopeKind::LetRec);
                if binding.mutable || letrec {
                    binding.boxed = true;
                }
            }
        }
    }

    /// Record every binding referenced under `expr` whose defining scope
    /// lies outside `scope`, skipping module-level bindings.
    fn collect_free(&self, expr: ExprId, scope: ScopeId, free: &mut Vec<BindingId>) {
        if let Some(&id) = self.resolutions.get(expr) {
            let binding = &self.bindings[id];
            let module_level =
                matches!(binding.kind, BindingKind::Toplevel | BindingKind::Builtin);
            if !module_level && !self.scope_is_within(binding.scope, scope) && !free.contains(&id)
            {
                free.push(id);
            }
        }
        match &self.program.exprs[expr].kind {
            ExprKind::Lambda { body, .. } => self.collect_free(*body, scope, free),
            ExprKind::Define { value, .. } | ExprKind::Set { value, .. } => {
                self.collect_free(*value, scope, free)
            }
            ExprKind::If {
                test,
                then_branch,
                else_branch,
            } => {
                self.collect_free(*test, scope, free);
                self.collect_free(*then_branch, scope, free);
                if let Some(e) = else_branch {
                    self.collect_free(*e, scope, free);
                }
            }
            ExprKind::Let { bindings, body, .. } => {
                for b in bindings {
                    self.collect_free(b.value, scope, free);
                }
                self.collect_free(*body, scope, free);
            }
            ExprKind::Begin(exprs) | ExprKind::And(exprs) | ExprKind::Or(exprs) => {
                for &e in exprs {
                    self.collect_free(e, scope, free);
                }
            }
            ExprKind::Call { callee, args } => {
                self.collect_free(*callee, scope, free);
                for &a in args {
                    self.collect_free(a, scope, free);
                }
            }
            _ => {}
        }
    }

    fn scope_is_within(&self, scope: ScopeId, ancestor: ScopeId) -> bool {
        let mut cursor = Some(scope);
        while let Some(s) = cursor {
            if s == ancestor {
                return true;
            }
            cursor = self.scopes[s].parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skink_parser::parse;

    fn resolve_ok(source: &str) -> (Program, ResolveResult) {
        let mut diags = Diagnostics::new();
        let program = parse(source, &mut diags);
        let result = resolve(&program, &mut diags);
        assert!(
            !diags.has_errors(),
            "unexpected errors: {:?}",
            diags.iter().collect::<Vec<_>>()
        );
        (program, result)
    }

    fn binding_named<'r>(result: &'r ResolveResult, name: &str) -> &'r Binding {
        result
            .bindings
            .iter()
            .map(|(_, b)| b)
            .find(|b| b.name == name && b.kind != BindingKind::Builtin)
            .unwrap_or_else(|| panic!("no binding named {}", name))
    }

    #[test]
    fn toplevel_define_supports_self_reference() {
        let (_, result) =
            resolve_ok("(define (f n) (if (= n 0) 1 (* n (f (- n 1)))))");
        let f = binding_named(&result, "f");
        assert_eq!(f.kind, BindingKind::Toplevel);
        assert!(!f.captured);
    }

    #[test]
    fn toplevel_defines_support_mutual_recursion() {
        let (_, result) = resolve_ok(
            "(define (even? n) (if (= n 0) #t (odd? (- n 1))))\
             (define (odd? n) (if (= n 0) #f (even? (- n 1))))",
        );
        assert_eq!(binding_named(&result, "even?").kind, BindingKind::Toplevel);
        assert_eq!(binding_named(&result, "odd?").kind, BindingKind::Toplevel);
    }

    #[test]
    fn unresolved_identifier_is_an_error() {
        let mut diags = Diagnostics::new();
        let program = parse("(display nope)", &mut diags);
        resolve(&program, &mut diags);
        assert!(diags.has_errors());
        assert!(diags
            .iter()
            .any(|d| d.message.contains("unresolved identifier 'nope'")));
    }

    #[test]
    fn lambda_parameter_capture() {
        let (program, result) =
            resolve_ok("(define (make-adder k) (lambda (x) (+ x k)))");
        let k = binding_named(&result, "k");
        assert!(k.captured);
        assert!(!k.boxed);
        let x = binding_named(&result, "x");
        assert!(!x.captured);

        // The inner lambda lists exactly one free binding.
        let inner = result
            .lambdas
            .iter()
            .filter(|(_, info)| info.params.len() == 1)
            .find(|(id, _)| {
                matches!(&program.exprs[*id].kind,
                    ExprKind::Lambda { params, .. } if params[0].name == "x")
            })
            .map(|(_, info)| info)
            .expect("inner lambda");
        assert_eq!(inner.free.len(), 1);
        assert_eq!(result.bindings[inner.free[0]].name, "k");
    }

    #[test]
    fn toplevel_references_are_not_captures() {
        let (_, result) = resolve_ok("(define base 10) (define (f x) (+ x base))");
        assert!(!binding_named(&result, "base").captured);
    }

    #[test]
    fn set_marks_mutable_and_captured_mutables_are_boxed() {
        let (_, result) = resolve_ok(
            "(define (counter) (let ((n 0)) (lambda () (set! n (+ n 1)) n)))",
        );
        let n = binding_named(&result, "n");
        assert!(n.mutable);
        assert!(n.captured);
        assert!(n.boxed);
    }

    #[test]
    fn letrec_sibling_closures_are_boxed() {
        let (_, result) = resolve_ok(
            "(define (go n)\
               (letrec ((even? (lambda (k) (if (= k 0) #t (odd? (- k 1)))))\
                        (odd? (lambda (k) (if (= k 0) #f (even? (- k 1))))))\
                 (even? n)))",
        );
        let even = binding_named(&result, "even?");
        assert!(even.captured);
        assert!(even.boxed);
    }

    #[test]
    fn let_initializers_run_in_enclosing_scope() {
        let mut diags = Diagnostics::new();
        let program = parse("(define (f) (let ((x 1) (y x)) y))", &mut diags);
        resolve(&program, &mut diags);
        // y's initializer must not see the x introduced by the same let.
        assert!(diags.has_errors());
    }

    #[test]
    fn let_star_initializers_see_preceding_bindings() {
        resolve_ok("(define (f) (let* ((x 1) (y x)) y))");
    }

    #[test]
    fn shadowing_is_permitted() {
        let (_, result) = resolve_ok("(define (f x) (let ((x 2)) x))");
        let locals: Vec<_> = result
            .bindings
            .iter()
            .map(|(_, b)| b)
            .filter(|b| b.name == "x" && b.kind != BindingKind::Builtin)
            .collect();
        assert_eq!(locals.len(), 2);
    }

    #[test]
    fn duplicate_parameters_are_an_error() {
        let mut diags = Diagnostics::new();
        let program = parse("(define (f x x) x)", &mut diags);
        resolve(&program, &mut diags);
        assert!(diags
            .iter()
            .any(|d| d.message.contains("duplicate parameter")));
    }

    #[test]
    fn builtins_resolve_without_declaration() {
        let (program, result) = resolve_ok("(display (+ 1 2))");
        let resolved = program
            .exprs
            .iter()
            .filter(|(id, e)| {
                matches!(e.kind, ExprKind::Ident(_)) && result.resolutions.get(*id).is_some()
            })
            .count();
        assert_eq!(resolved, 2);
    }

    #[test]
    fn assigning_a_builtin_is_an_error() {
        let mut diags = Diagnostics::new();
        let program = parse("(set! + 1)", &mut diags);
        resolve(&program, &mut diags);
        assert!(diags
            .iter()
            .any(|d| d.message.contains("cannot assign to built-in")));
    }

    #[test]
    fn nested_lambdas_capture_transitively() {
        let (program, result) = resolve_ok(
            "(define (f a) (lambda (b) (lambda (c) (+ a (+ b c)))))",
        );
        let a = binding_named(&result, "a");
        assert!(a.captured);
        // The middle lambda captures a; the innermost captures a and b.
        let mut frees: Vec<usize> = result
            .lambdas
            .iter()
            .filter(|(id, _)| !matches!(&program.exprs[*id].kind, ExprKind::Lambda { params, .. } if params[0].name == "a"))
            .map(|(_, info)| info.free.len())
            .collect();
        frees.sort_unstable();
        assert_eq!(frees, vec![1, 2]);
    }
}
