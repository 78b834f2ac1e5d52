use log::{info, trace};
use smol_str::SmolStr;
use skink_ast::*;
use skink_diag::Diagnostics;
use skink_lexer::{lex, Span, Token};

/// Parse source text into a [`Program`], pushing lexical and syntactic
/// diagnostics into the sink. A failed subtree becomes an `Erroneous` node
/// and parsing resumes at the matching close paren, so one pass can report
/// several independent errors.
pub fn parse(source: &str, diags: &mut Diagnostics) -> Program {
    info!("parsing {} bytes", source.len());
    let (tokens, lex_errors) = lex(source);
    for span in lex_errors {
        diags.error("ill-formed token", span);
    }
    let mut parser = Parser::new(tokens, diags);
    parser.parse_program();
    trace!(
        "parsed {} top-level forms, {} nodes",
        parser.program.forms.len(),
        parser.program.exprs.len()
    );
    parser.program
}

struct Parser<'a> {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    program: Program,
    diags: &'a mut Diagnostics,
    /// Counter for names introduced by the `case` and `do` rewrites.
    gensym: u32,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<(Token, Span)>, diags: &'a mut Diagnostics) -> Self {
        Self {
            tokens,
            pos: 0,
            program: Program::new(),
            diags,
            gensym: 0,
        }
    }

    // ── Token helpers ─────────────────────────────────────────────

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|(_, s)| Span::new(s.end, s.end))
                    .unwrap_or(Span::new(0, 0))
            })
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|(_, s)| *s)
            .unwrap_or(Span::new(0, 0))
    }

    fn advance(&mut self) -> (Token, Span) {
        let tok = self.tokens[self.pos].clone();
        self.pos += 1;
        tok
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn check_close(&self) -> bool {
        matches!(self.peek(), Some(Token::RParen | Token::RBracket))
    }

    fn check_ident(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.as_str() == name)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Option<(SmolStr, Span)> {
        if let Some(Token::Ident(_)) = self.peek() {
            let (tok, span) = self.advance();
            if let Token::Ident(s) = tok {
                return Some((s, span));
            }
        }
        let span = self.peek_span();
        self.error(
            format!("expected identifier, found {}", describe(self.peek())),
            span,
        );
        None
    }

    /// Consume the close delimiter matching `open`, diagnosing a mismatch or
    /// a missing close.
    fn expect_close(&mut self, open: &Token) -> Option<Span> {
        let want = close_for(open);
        if self.check(&want) {
            let (_, span) = self.advance();
            return Some(span);
        }
        let span = self.peek_span();
        self.error(
            format!("expected {}, found {}", describe(Some(&want)), describe(self.peek())),
            span,
        );
        None
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.diags.error(message, span);
    }

    /// Skip tokens until the list opened before this call is closed,
    /// consuming the close delimiter.
    fn recover_to_close(&mut self) {
        let mut depth = 1;
        while !self.at_end() && depth > 0 {
            match self.peek() {
                Some(Token::LParen | Token::LBracket) => {
                    depth += 1;
                    self.advance();
                }
                Some(Token::RParen | Token::RBracket) => {
                    depth -= 1;
                    self.advance();
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn fresh_name(&mut self, stem: &str) -> SmolStr {
        let n = self.gensym;
        self.gensym += 1;
        SmolStr::new(format!("{}${}", stem, n))
    }

    // ── Allocators ────────────────────────────────────────────────

    fn alloc(&mut self, kind: ExprKind, span: Span) -> ExprId {
        self.program.exprs.alloc(Expr { kind, span })
    }

    fn alloc_type(&mut self, kind: TypeExprKind, span: Span) -> TypeExprId {
        self.program.type_exprs.alloc(TypeExpr { kind, span })
    }

    fn alloc_datum(&mut self, kind: DatumKind, span: Span) -> DatumId {
        self.program.datums.alloc(Datum { kind, span })
    }

    fn erroneous(&mut self, span: Span) -> ExprId {
        self.alloc(ExprKind::Erroneous, span)
    }

    // ── Program ───────────────────────────────────────────────────

    fn parse_program(&mut self) {
        while !self.at_end() {
            if self.check_close() {
                let (_, span) = self.advance();
                self.error("unmatched close delimiter", span);
                continue;
            }
            let form = self.parse_expr();
            self.program.forms.push(form);
        }
    }

    // ── Expressions ───────────────────────────────────────────────

    fn parse_expr(&mut self) -> ExprId {
        let span = self.peek_span();
        match self.peek() {
            Some(Token::Int(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Int(n) => self.alloc(ExprKind::Int(n), span),
                    _ => unreachable!(),
                }
            }
            Some(Token::Float(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Float(f) => self.alloc(ExprKind::Float(f), span),
                    _ => unreachable!(),
                }
            }
            Some(Token::Bool(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Bool(b) => self.alloc(ExprKind::Bool(b), span),
                    _ => unreachable!(),
                }
            }
            Some(Token::Str(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Str(s) => self.alloc(ExprKind::Str(s), span),
                    _ => unreachable!(),
                }
            }
            Some(Token::Char(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Char(c) => self.alloc(ExprKind::Char(c), span),
                    _ => unreachable!(),
                }
            }
            Some(Token::Ident(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Ident(s) => self.alloc(ExprKind::Ident(s), span),
                    _ => unreachable!(),
                }
            }
            Some(Token::Quote) => {
                self.advance();
                let datum = self.parse_datum();
                let end = self.prev_span();
                match datum {
                    Some(d) => self.alloc(ExprKind::Quote(d), span.merge(end)),
                    None => self.erroneous(span),
                }
            }
            Some(Token::Backtick | Token::Comma | Token::CommaAt) => {
                self.advance();
                self.error("quasiquotation is not supported", span);
                // Consume the template so parsing stays in sync.
                if !self.at_end() && !self.check_close() {
                    self.parse_datum();
                }
                self.erroneous(span)
            }
            Some(Token::LParen | Token::LBracket) => self.parse_list(),
            Some(Token::RParen | Token::RBracket) => {
                // Left for the enclosing form's close check; do not consume.
                self.error("unexpected close delimiter", span);
                self.erroneous(span)
            }
            Some(other) => {
                let msg = format!("unexpected {}", describe(Some(other)));
                self.advance();
                self.error(msg, span);
                self.erroneous(span)
            }
            None => {
                self.error("unexpected end of input", span);
                self.erroneous(span)
            }
        }
    }

    /// Parse a parenthesized form, dispatching on the head token.
    fn parse_list(&mut self) -> ExprId {
        let (open, start) = self.advance();

        if self.check_close() {
            let (_, end) = self.advance();
            self.error("empty application", start.merge(end));
            return self.erroneous(start.merge(end));
        }

        if self.check(&Token::Colon) {
            self.advance();
            return match self.parse_type_decl(&open, start) {
                Some(id) => id,
                None => {
                    self.recover_to_close();
                    self.erroneous(start.merge(self.prev_span()))
                }
            };
        }

        let head = match self.peek() {
            Some(Token::Ident(s)) => Some(s.clone()),
            _ => None,
        };

        let result = match head.as_deref() {
            Some("define") => {
                self.advance();
                self.parse_define(&open, start)
            }
            Some("lambda") => {
                self.advance();
                self.parse_lambda(&open, start)
            }
            Some("if") => {
                self.advance();
                self.parse_if(&open, start)
            }
            Some("let") => {
                self.advance();
                self.parse_let(LetKind::Let, &open, start)
            }
            Some("let*") => {
                self.advance();
                self.parse_let(LetKind::Star, &open, start)
            }
            Some("letrec") => {
                self.advance();
                self.parse_let(LetKind::Rec, &open, start)
            }
            Some("set!") => {
                self.advance();
                self.parse_set(&open, start)
            }
            Some("begin") => {
                self.advance();
                self.parse_begin(&open, start)
            }
            Some("quote") => {
                self.advance();
                self.parse_quote(&open, start)
            }
            Some("quasiquote") => {
                self.advance();
                self.error("quasiquotation is not supported", start);
                self.recover_to_close();
                Some(self.erroneous(start))
            }
            Some("and") => {
                self.advance();
                self.parse_and_or(true, &open, start)
            }
            Some("or") => {
                self.advance();
                self.parse_and_or(false, &open, start)
            }
            Some("cond") => {
                self.advance();
                self.parse_cond(&open, start)
            }
            Some("case") => {
                self.advance();
                self.parse_case(&open, start)
            }
            Some("when") => {
                self.advance();
                self.parse_when_unless(true, &open, start)
            }
            Some("unless") => {
                self.advance();
                self.parse_when_unless(false, &open, start)
            }
            Some("do") => {
                self.advance();
                self.parse_do(&open, start)
            }
            _ => self.parse_call(&open, start),
        };

        match result {
            Some(id) => id,
            None => {
                self.recover_to_close();
                self.erroneous(start.merge(self.prev_span()))
            }
        }
    }

    fn parse_call(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let callee = self.parse_expr();
        let mut args = Vec::new();
        while !self.at_end() && !self.check_close() {
            args.push(self.parse_expr());
        }
        let end = self.expect_close(open)?;
        Some(self.alloc(ExprKind::Call { callee, args }, start.merge(end)))
    }

    // ── define ────────────────────────────────────────────────────

    fn parse_define(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        match self.peek() {
            Some(Token::Ident(_)) => {
                let (name, name_span) = self.expect_ident()?;
                let value = self.parse_expr();
                let end = self.expect_close(open)?;
                Some(self.alloc(
                    ExprKind::Define {
                        name,
                        name_span,
                        value,
                    },
                    start.merge(end),
                ))
            }
            Some(Token::LParen | Token::LBracket) => {
                // (define (name params...) body...) expands to a lambda.
                let (inner_open, _) = self.advance();
                let (name, name_span) = self.expect_ident()?;
                let params = self.parse_params_until_close(&inner_open)?;
                let return_ann = if self.eat(&Token::Colon) {
                    Some(self.parse_type_expr()?)
                } else {
                    None
                };
                let body = self.parse_body("define", start)?;
                let end = self.expect_close(open)?;
                let lambda = self.alloc(
                    ExprKind::Lambda {
                        params,
                        return_ann,
                        body,
                    },
                    start.merge(end),
                );
                Some(self.alloc(
                    ExprKind::Define {
                        name,
                        name_span,
                        value: lambda,
                    },
                    start.merge(end),
                ))
            }
            _ => {
                let span = self.peek_span();
                self.error(
                    format!(
                        "define expects a name or (name params...), found {}",
                        describe(self.peek())
                    ),
                    span,
                );
                None
            }
        }
    }

    // ── lambda ────────────────────────────────────────────────────

    fn parse_lambda(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let params = self.parse_param_list()?;
        let return_ann = if self.eat(&Token::Colon) {
            Some(self.parse_type_expr()?)
        } else {
            None
        };
        let body = self.parse_body("lambda", start)?;
        let end = self.expect_close(open)?;
        Some(self.alloc(
            ExprKind::Lambda {
                params,
                return_ann,
                body,
            },
            start.merge(end),
        ))
    }

    fn parse_param_list(&mut self) -> Option<Vec<Param>> {
        if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
            let span = self.peek_span();
            self.error("expected parameter list", span);
            return None;
        }
        let (open, _) = self.advance();
        self.parse_params_until_close(&open)
    }

    fn parse_params_until_close(&mut self, open: &Token) -> Option<Vec<Param>> {
        let mut params = Vec::new();
        while !self.at_end() && !self.check_close() {
            params.push(self.parse_param()?);
        }
        self.expect_close(open)?;
        Some(params)
    }

    fn parse_param(&mut self) -> Option<Param> {
        let start = self.peek_span();
        match self.peek() {
            Some(Token::Ident(_)) => {
                let (name, name_span) = self.expect_ident()?;
                Some(Param {
                    name,
                    name_span,
                    ann: None,
                    span: name_span,
                })
            }
            Some(Token::LBracket | Token::LParen) => {
                // Annotated parameter: [name : type]
                let (open, _) = self.advance();
                let (name, name_span) = self.expect_ident()?;
                if !self.eat(&Token::Colon) {
                    let span = self.peek_span();
                    self.error("expected ':' in parameter annotation", span);
                    return None;
                }
                let ann = self.parse_type_expr()?;
                let end = self.expect_close(&open)?;
                Some(Param {
                    name,
                    name_span,
                    ann: Some(ann),
                    span: start.merge(end),
                })
            }
            other => {
                let msg = format!("expected parameter, found {}", describe(other));
                self.error(msg, start);
                None
            }
        }
    }

    // ── if / cond / when / unless / case ──────────────────────────

    fn parse_if(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let test = self.parse_expr();
        let then_branch = self.parse_expr();
        let else_branch = if self.check_close() {
            None
        } else {
            Some(self.parse_expr())
        };
        let end = self.expect_close(open)?;
        Some(self.alloc(
            ExprKind::If {
                test,
                then_branch,
                else_branch,
            },
            start.merge(end),
        ))
    }

    /// `cond` rewrites to right-nested `if`s; an `else` clause becomes the
    /// innermost alternate.
    fn parse_cond(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let mut clauses: Vec<(Option<ExprId>, ExprId)> = Vec::new();
        while !self.at_end() && !self.check_close() {
            if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
                let span = self.peek_span();
                self.error("expected cond clause", span);
                return None;
            }
            let (clause_open, clause_start) = self.advance();
            if self.check_ident("else") {
                self.advance();
                let body = self.parse_body("cond clause", clause_start)?;
                self.expect_close(&clause_open)?;
                clauses.push((None, body));
                if !self.check_close() {
                    let span = self.peek_span();
                    self.error("else must be the last cond clause", span);
                    return None;
                }
            } else {
                let test = self.parse_expr();
                let body = self.parse_body("cond clause", clause_start)?;
                self.expect_close(&clause_open)?;
                clauses.push((Some(test), body));
            }
        }
        let end = self.expect_close(open)?;
        if clauses.is_empty() {
            // The form is already fully consumed; recover in place.
            self.error("cond needs at least one clause", start.merge(end));
            return Some(self.erroneous(start.merge(end)));
        }
        let span = start.merge(end);
        let mut acc: Option<ExprId> = None;
        for (test, body) in clauses.into_iter().rev() {
            acc = Some(match test {
                None => body,
                Some(test) => self.alloc(
                    ExprKind::If {
                        test,
                        then_branch: body,
                        else_branch: acc,
                    },
                    span,
                ),
            });
        }
        acc
    }

    fn parse_when_unless(&mut self, when: bool, open: &Token, start: Span) -> Option<ExprId> {
        let test = self.parse_expr();
        let body = self.parse_body(if when { "when" } else { "unless" }, start)?;
        let end = self.expect_close(open)?;
        let span = start.merge(end);
        // (when t body) => (if t body); (unless t body) => (if t <void> body)
        let kind = if when {
            ExprKind::If {
                test,
                then_branch: body,
                else_branch: None,
            }
        } else {
            let unspecified = self.alloc(ExprKind::Begin(Vec::new()), span);
            ExprKind::If {
                test,
                then_branch: unspecified,
                else_branch: Some(body),
            }
        };
        Some(self.alloc(kind, span))
    }

    /// `case` rewrites to a `let` that binds the key once, then nested `if`s
    /// comparing the key against each clause's datums with `=`.
    fn parse_case(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let key = self.parse_expr();
        let key_name = self.fresh_name("case-key");
        let key_span = self.program.exprs[key].span;

        struct Clause {
            datums: Option<Vec<ExprId>>,
            body: ExprId,
        }

        let mut clauses = Vec::new();
        while !self.at_end() && !self.check_close() {
            if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
                let span = self.peek_span();
                self.error("expected case clause", span);
                return None;
            }
            let (clause_open, clause_start) = self.advance();
            if self.check_ident("else") {
                self.advance();
                let body = self.parse_body("case clause", clause_start)?;
                self.expect_close(&clause_open)?;
                clauses.push(Clause { datums: None, body });
                if !self.check_close() {
                    let span = self.peek_span();
                    self.error("else must be the last case clause", span);
                    return None;
                }
            } else {
                if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
                    let span = self.peek_span();
                    self.error("expected datum list in case clause", span);
                    return None;
                }
                let (datums_open, _) = self.advance();
                let mut datums = Vec::new();
                while !self.at_end() && !self.check_close() {
                    datums.push(self.parse_case_datum()?);
                }
                self.expect_close(&datums_open)?;
                let body = self.parse_body("case clause", clause_start)?;
                self.expect_close(&clause_open)?;
                clauses.push(Clause {
                    datums: Some(datums),
                    body,
                });
            }
        }
        let end = self.expect_close(open)?;
        let span = start.merge(end);

        let mut acc: Option<ExprId> = None;
        for clause in clauses.into_iter().rev() {
            acc = Some(match clause.datums {
                None => clause.body,
                Some(datums) => {
                    let mut tests = Vec::new();
                    for datum in datums {
                        let key_ref =
                            self.alloc(ExprKind::Ident(key_name.clone()), key_span);
                        let eq = self.alloc(ExprKind::Ident(SmolStr::new("=")), key_span);
                        tests.push(self.alloc(
                            ExprKind::Call {
                                callee: eq,
                                args: vec![key_ref, datum],
                            },
                            span,
                        ));
                    }
                    let test = if tests.len() == 1 {
                        tests[0]
                    } else {
                        self.alloc(ExprKind::Or(tests), span)
                    };
                    self.alloc(
                        ExprKind::If {
                            test,
                            then_branch: clause.body,
                            else_branch: acc,
                        },
                        span,
                    )
                }
            });
        }

        let body = match acc {
            Some(body) => body,
            None => {
                // The form is already fully consumed; recover in place.
                self.error("case needs at least one clause", span);
                return Some(self.erroneous(span));
            }
        };
        Some(self.alloc(
            ExprKind::Let {
                kind: LetKind::Let,
                bindings: vec![LetBinding {
                    name: key_name,
                    name_span: key_span,
                    ann: None,
                    value: key,
                    span: key_span,
                }],
                body,
            },
            span,
        ))
    }

    /// A datum in a case clause, as a comparable expression.
    fn parse_case_datum(&mut self) -> Option<ExprId> {
        let span = self.peek_span();
        match self.peek() {
            Some(Token::Int(_) | Token::Float(_) | Token::Bool(_) | Token::Char(_)) => {
                Some(self.parse_expr())
            }
            Some(Token::Ident(_)) => {
                // A bare symbol compares against quoted-symbol values.
                let (name, span) = self.expect_ident()?;
                let d = self.alloc_datum(DatumKind::Symbol(name), span);
                Some(self.alloc(ExprKind::Quote(d), span))
            }
            other => {
                let msg = format!("unsupported case datum: {}", describe(other));
                self.error(msg, span);
                None
            }
        }
    }

    // ── let family ────────────────────────────────────────────────

    fn parse_let(&mut self, kind: LetKind, open: &Token, start: Span) -> Option<ExprId> {
        if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
            let span = self.peek_span();
            self.error("expected binding list", span);
            return None;
        }
        let (bindings_open, _) = self.advance();
        let mut bindings = Vec::new();
        while !self.at_end() && !self.check_close() {
            bindings.push(self.parse_let_binding()?);
        }
        self.expect_close(&bindings_open)?;
        let body = self.parse_body("let", start)?;
        let end = self.expect_close(open)?;
        Some(self.alloc(
            ExprKind::Let {
                kind,
                bindings,
                body,
            },
            start.merge(end),
        ))
    }

    fn parse_let_binding(&mut self) -> Option<LetBinding> {
        let start = self.peek_span();
        if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
            self.error("expected (name value) binding", start);
            return None;
        }
        let (open, _) = self.advance();
        let (name, name_span) = self.expect_ident()?;
        let ann = if self.eat(&Token::Colon) {
            Some(self.parse_type_expr()?)
        } else {
            None
        };
        let value = self.parse_expr();
        let end = self.expect_close(&open)?;
        Some(LetBinding {
            name,
            name_span,
            ann,
            value,
            span: start.merge(end),
        })
    }

    // ── set! / begin / and / or ───────────────────────────────────

    fn parse_set(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let (name, name_span) = self.expect_ident()?;
        let value = self.parse_expr();
        let end = self.expect_close(open)?;
        Some(self.alloc(
            ExprKind::Set {
                name,
                name_span,
                value,
            },
            start.merge(end),
        ))
    }

    fn parse_begin(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let mut exprs = Vec::new();
        while !self.at_end() && !self.check_close() {
            exprs.push(self.parse_expr());
        }
        let end = self.expect_close(open)?;
        Some(self.alloc(ExprKind::Begin(exprs), start.merge(end)))
    }

    fn parse_and_or(&mut self, and: bool, open: &Token, start: Span) -> Option<ExprId> {
        let mut exprs = Vec::new();
        while !self.at_end() && !self.check_close() {
            exprs.push(self.parse_expr());
        }
        let end = self.expect_close(open)?;
        let kind = if and {
            ExprKind::And(exprs)
        } else {
            ExprKind::Or(exprs)
        };
        Some(self.alloc(kind, start.merge(end)))
    }

    // ── do ────────────────────────────────────────────────────────

    /// `(do ((var init step)...) (test result) body...)` rewrites to a
    /// letrec'd loop lambda called with the inits; each iteration tail-calls
    /// the loop with the step expressions.
    fn parse_do(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
            let span = self.peek_span();
            self.error("expected do variable list", span);
            return None;
        }
        let (vars_open, _) = self.advance();
        let mut names = Vec::new();
        let mut inits = Vec::new();
        let mut steps = Vec::new();
        while !self.at_end() && !self.check_close() {
            if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
                let span = self.peek_span();
                self.error("expected (var init step) specification", span);
                return None;
            }
            let (spec_open, _) = self.advance();
            let (name, name_span) = self.expect_ident()?;
            let init = self.parse_expr();
            let step = if self.check_close() {
                // A variable without a step carries its value forward.
                self.alloc(ExprKind::Ident(name.clone()), name_span)
            } else {
                self.parse_expr()
            };
            self.expect_close(&spec_open)?;
            names.push((name, name_span));
            inits.push(init);
            steps.push(step);
        }
        self.expect_close(&vars_open)?;

        if !matches!(self.peek(), Some(Token::LParen | Token::LBracket)) {
            let span = self.peek_span();
            self.error("expected do test clause", span);
            return None;
        }
        let (test_open, _) = self.advance();
        let test = self.parse_expr();
        let result = if self.check_close() {
            None
        } else {
            Some(self.parse_expr())
        };
        self.expect_close(&test_open)?;

        let mut body = Vec::new();
        while !self.at_end() && !self.check_close() {
            body.push(self.parse_expr());
        }
        let end = self.expect_close(open)?;
        let span = start.merge(end);

        let loop_name = self.fresh_name("do-loop");
        let loop_ref = self.alloc(ExprKind::Ident(loop_name.clone()), span);
        let next = self.alloc(
            ExprKind::Call {
                callee: loop_ref,
                args: steps,
            },
            span,
        );
        body.push(next);
        let else_branch = if body.len() == 1 {
            body[0]
        } else {
            self.alloc(ExprKind::Begin(body), span)
        };
        let then_branch = match result {
            Some(r) => r,
            None => self.alloc(ExprKind::Begin(Vec::new()), span),
        };
        let loop_body = self.alloc(
            ExprKind::If {
                test,
                then_branch,
                else_branch: Some(else_branch),
            },
            span,
        );
        let params = names
            .into_iter()
            .map(|(name, name_span)| Param {
                name,
                name_span,
                ann: None,
                span: name_span,
            })
            .collect();
        let lambda = self.alloc(
            ExprKind::Lambda {
                params,
                return_ann: None,
                body: loop_body,
            },
            span,
        );
        let entry_ref = self.alloc(ExprKind::Ident(loop_name.clone()), span);
        let entry = self.alloc(
            ExprKind::Call {
                callee: entry_ref,
                args: inits,
            },
            span,
        );
        Some(self.alloc(
            ExprKind::Let {
                kind: LetKind::Rec,
                bindings: vec![LetBinding {
                    name: loop_name,
                    name_span: span,
                    ann: None,
                    value: lambda,
                    span,
                }],
                body: entry,
            },
            span,
        ))
    }

    // ── quote ─────────────────────────────────────────────────────

    fn parse_quote(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let datum = self.parse_datum()?;
        let end = self.expect_close(open)?;
        Some(self.alloc(ExprKind::Quote(datum), start.merge(end)))
    }

    fn parse_datum(&mut self) -> Option<DatumId> {
        let span = self.peek_span();
        match self.peek() {
            Some(Token::Int(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Int(n) => Some(self.alloc_datum(DatumKind::Int(n), span)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Float(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Float(f) => Some(self.alloc_datum(DatumKind::Float(f), span)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Bool(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Bool(b) => Some(self.alloc_datum(DatumKind::Bool(b), span)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Str(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Str(s) => Some(self.alloc_datum(DatumKind::Str(s), span)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Char(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Char(c) => Some(self.alloc_datum(DatumKind::Char(c), span)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Ident(_)) => {
                let (tok, span) = self.advance();
                match tok {
                    Token::Ident(s) => Some(self.alloc_datum(DatumKind::Symbol(s), span)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Quote) => {
                // 'x inside a datum is (quote x).
                self.advance();
                let quote_sym = self.alloc_datum(DatumKind::Symbol(SmolStr::new("quote")), span);
                let inner = self.parse_datum()?;
                let end = self.prev_span();
                Some(self.alloc_datum(
                    DatumKind::List {
                        elems: vec![quote_sym, inner],
                        tail: None,
                    },
                    span.merge(end),
                ))
            }
            Some(Token::LParen | Token::LBracket) => {
                let (open, start) = self.advance();
                let mut elems = Vec::new();
                let mut tail = None;
                while !self.at_end() && !self.check_close() {
                    if self.check(&Token::Dot) {
                        let (_, dot_span) = self.advance();
                        if elems.is_empty() {
                            self.error("dotted pair needs a head element", dot_span);
                            return None;
                        }
                        tail = Some(self.parse_datum()?);
                        break;
                    }
                    elems.push(self.parse_datum()?);
                }
                let end = self.expect_close(&open)?;
                Some(self.alloc_datum(DatumKind::List { elems, tail }, start.merge(end)))
            }
            other => {
                let msg = format!("expected datum, found {}", describe(other));
                self.error(msg, span);
                None
            }
        }
    }

    // ── type declarations and annotations ─────────────────────────

    fn parse_type_decl(&mut self, open: &Token, start: Span) -> Option<ExprId> {
        let (name, _) = self.expect_ident()?;
        let ann = self.parse_type_expr()?;
        let end = self.expect_close(open)?;
        Some(self.alloc(ExprKind::TypeDecl { name, ann }, start.merge(end)))
    }

    fn parse_type_expr(&mut self) -> Option<TypeExprId> {
        let span = self.peek_span();
        match self.peek() {
            Some(Token::Ident(_)) => {
                let (name, span) = self.expect_ident()?;
                let kind = match name.as_str() {
                    "integer" | "int" => TypeExprKind::Int,
                    "float" | "real" | "number" => TypeExprKind::Float,
                    "boolean" | "bool" => TypeExprKind::Bool,
                    "string" => TypeExprKind::Str,
                    "char" => TypeExprKind::Char,
                    "symbol" => TypeExprKind::Symbol,
                    "void" | "unit" => TypeExprKind::Void,
                    "any" | "unknown" => TypeExprKind::Unknown,
                    other => {
                        let msg = format!("unknown type name '{}'", other);
                        self.error(msg, span);
                        return None;
                    }
                };
                Some(self.alloc_type(kind, span))
            }
            Some(Token::LParen | Token::LBracket) => {
                let (open, start) = self.advance();
                if self.eat(&Token::Arrow) {
                    let mut types = Vec::new();
                    while !self.at_end() && !self.check_close() {
                        types.push(self.parse_type_expr()?);
                    }
                    let end = self.expect_close(&open)?;
                    let span = start.merge(end);
                    let ret = match types.pop() {
                        Some(ret) => ret,
                        None => {
                            self.error("function type needs a return type", span);
                            return None;
                        }
                    };
                    return Some(self.alloc_type(
                        TypeExprKind::Fn { params: types, ret },
                        span,
                    ));
                }
                let (head, head_span) = self.expect_ident()?;
                match head.as_str() {
                    "pair" => {
                        let a = self.parse_type_expr()?;
                        let b = self.parse_type_expr()?;
                        let end = self.expect_close(&open)?;
                        Some(self.alloc_type(TypeExprKind::Pair(a, b), start.merge(end)))
                    }
                    "vector" => {
                        let t = self.parse_type_expr()?;
                        let end = self.expect_close(&open)?;
                        Some(self.alloc_type(TypeExprKind::Vector(t), start.merge(end)))
                    }
                    "list" => {
                        // (list t) is sugar for a pair chain ending in void.
                        let t = self.parse_type_expr()?;
                        let end = self.expect_close(&open)?;
                        let span = start.merge(end);
                        let nil = self.alloc_type(TypeExprKind::Void, span);
                        Some(self.alloc_type(TypeExprKind::Pair(t, nil), span))
                    }
                    other => {
                        let msg = format!("unknown type constructor '{}'", other);
                        self.error(msg, head_span);
                        None
                    }
                }
            }
            other => {
                let msg = format!("expected type, found {}", describe(other));
                self.error(msg, span);
                None
            }
        }
    }

    // ── bodies ────────────────────────────────────────────────────

    /// Parse expressions up to the enclosing close paren, wrapping multiple
    /// expressions in an implicit `begin`.
    fn parse_body(&mut self, form: &str, start: Span) -> Option<ExprId> {
        let mut exprs = Vec::new();
        while !self.at_end() && !self.check_close() {
            exprs.push(self.parse_expr());
        }
        match exprs.len() {
            0 => {
                let span = self.peek_span();
                self.error(
                    format!("{} needs at least one body expression", form),
                    span,
                );
                None
            }
            1 => Some(exprs[0]),
            _ => Some(self.alloc(ExprKind::Begin(exprs), start.merge(self.peek_span()))),
        }
    }
}

fn close_for(open: &Token) -> Token {
    match open {
        Token::LBracket => Token::RBracket,
        _ => Token::RParen,
    }
}

fn describe(token: Option<&Token>) -> String {
    match token {
        None => "end of input".into(),
        Some(Token::LParen) => "'('".into(),
        Some(Token::RParen) => "')'".into(),
        Some(Token::LBracket) => "'['".into(),
        Some(Token::RBracket) => "']'".into(),
        Some(Token::Quote) => "'''".into(),
        Some(Token::Backtick) => "'`'".into(),
        Some(Token::Comma) => "','".into(),
        Some(Token::CommaAt) => "',@'".into(),
        Some(Token::Dot) => "'.'".into(),
        Some(Token::Colon) => "':'".into(),
        Some(Token::Arrow) => "'->'".into(),
        Some(Token::Int(n)) => format!("integer {}", n),
        Some(Token::Float(f)) => format!("float {}", f),
        Some(Token::Str(_)) => "string".into(),
        Some(Token::Char(c)) => format!("character '{}'", c),
        Some(Token::Bool(b)) => (if *b { "#t" } else { "#f" }).into(),
        Some(Token::Ident(s)) => format!("'{}'", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        let mut diags = Diagnostics::new();
        let program = parse(source, &mut diags);
        assert!(
            !diags.has_errors(),
            "unexpected errors: {:?}",
            diags.iter().collect::<Vec<_>>()
        );
        program
    }

    fn parse_err(source: &str) -> (Program, Diagnostics) {
        let mut diags = Diagnostics::new();
        let program = parse(source, &mut diags);
        assert!(diags.has_errors(), "expected errors for {:?}", source);
        (program, diags)
    }

    fn top(program: &Program, i: usize) -> &ExprKind {
        &program.exprs[program.forms[i]].kind
    }

    #[test]
    fn parses_literals() {
        let p = parse_ok("1 2.5 #t \"hi\" #\\a x");
        assert!(matches!(top(&p, 0), ExprKind::Int(1)));
        assert!(matches!(top(&p, 1), ExprKind::Float(f) if *f == 2.5));
        assert!(matches!(top(&p, 2), ExprKind::Bool(true)));
        assert!(matches!(top(&p, 3), ExprKind::Str(s) if s == "hi"));
        assert!(matches!(top(&p, 4), ExprKind::Char('a')));
        assert!(matches!(top(&p, 5), ExprKind::Ident(s) if s == "x"));
    }

    #[test]
    fn parses_call() {
        let p = parse_ok("(+ 1 2)");
        match top(&p, 0) {
            ExprKind::Call { callee, args } => {
                assert!(matches!(&p.exprs[*callee].kind, ExprKind::Ident(s) if s == "+"));
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn define_sugar_expands_to_lambda() {
        let p = parse_ok("(define (f n) (* n n))");
        match top(&p, 0) {
            ExprKind::Define { name, value, .. } => {
                assert_eq!(name, "f");
                match &p.exprs[*value].kind {
                    ExprKind::Lambda { params, .. } => {
                        assert_eq!(params.len(), 1);
                        assert_eq!(params[0].name, "n");
                    }
                    other => panic!("expected lambda, got {:?}", other),
                }
            }
            other => panic!("expected define, got {:?}", other),
        }
    }

    #[test]
    fn multi_expression_body_wraps_in_begin() {
        let p = parse_ok("(lambda (x) (display x) x)");
        match top(&p, 0) {
            ExprKind::Lambda { body, .. } => {
                assert!(matches!(&p.exprs[*body].kind, ExprKind::Begin(exprs) if exprs.len() == 2));
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn single_expression_body_is_not_wrapped() {
        let p = parse_ok("(lambda (x) x)");
        match top(&p, 0) {
            ExprKind::Lambda { body, .. } => {
                assert!(matches!(&p.exprs[*body].kind, ExprKind::Ident(_)));
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn let_kinds() {
        let p = parse_ok("(let ((x 1)) x) (let* ((x 1)) x) (letrec ((x 1)) x)");
        assert!(matches!(top(&p, 0), ExprKind::Let { kind: LetKind::Let, .. }));
        assert!(matches!(top(&p, 1), ExprKind::Let { kind: LetKind::Star, .. }));
        assert!(matches!(top(&p, 2), ExprKind::Let { kind: LetKind::Rec, .. }));
    }

    #[test]
    fn if_without_alternate() {
        let p = parse_ok("(if #t 1)");
        assert!(matches!(
            top(&p, 0),
            ExprKind::If {
                else_branch: None,
                ..
            }
        ));
    }

    #[test]
    fn annotated_parameter() {
        let p = parse_ok("(define (sq [x : integer]) (* x x))");
        match top(&p, 0) {
            ExprKind::Define { value, .. } => match &p.exprs[*value].kind {
                ExprKind::Lambda { params, .. } => {
                    let ann = params[0].ann.expect("annotation");
                    assert!(matches!(p.type_exprs[ann].kind, TypeExprKind::Int));
                }
                other => panic!("expected lambda, got {:?}", other),
            },
            other => panic!("expected define, got {:?}", other),
        }
    }

    #[test]
    fn toplevel_type_declaration() {
        let p = parse_ok("(: sq (-> integer integer))");
        match top(&p, 0) {
            ExprKind::TypeDecl { name, ann } => {
                assert_eq!(name, "sq");
                match &p.type_exprs[*ann].kind {
                    TypeExprKind::Fn { params, .. } => assert_eq!(params.len(), 1),
                    other => panic!("expected fn type, got {:?}", other),
                }
            }
            other => panic!("expected type decl, got {:?}", other),
        }
    }

    #[test]
    fn quote_datum_round_trips() {
        for (src, expected) in [
            ("(quote (1 2 3))", "(1 2 3)"),
            ("(quote (a . 2))", "(a . 2)"),
            ("(quote (1 (2 3) x))", "(1 (2 3) x)"),
            ("'sym", "sym"),
            ("'(#t #\\a \"s\" 2.5)", "(#t #\\a \"s\" 2.5)"),
            ("'()", "()"),
        ] {
            let p = parse_ok(src);
            match top(&p, 0) {
                ExprKind::Quote(d) => assert_eq!(render_datum(&p, *d), expected, "{}", src),
                other => panic!("expected quote for {}, got {:?}", src, other),
            }
        }
    }

    #[test]
    fn and_or_accept_zero_operands() {
        let p = parse_ok("(and) (or)");
        assert!(matches!(top(&p, 0), ExprKind::And(exprs) if exprs.is_empty()));
        assert!(matches!(top(&p, 1), ExprKind::Or(exprs) if exprs.is_empty()));
    }

    #[test]
    fn cond_desugars_to_nested_ifs() {
        let p = parse_ok("(cond ((< x 1) 1) ((< x 2) 2) (else 3))");
        match top(&p, 0) {
            ExprKind::If { else_branch, .. } => {
                let inner = else_branch.expect("second clause");
                match &p.exprs[inner].kind {
                    ExprKind::If { else_branch, .. } => {
                        let last = else_branch.expect("else clause");
                        assert!(matches!(&p.exprs[last].kind, ExprKind::Int(3)));
                    }
                    other => panic!("expected nested if, got {:?}", other),
                }
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn when_and_unless_desugar_to_if() {
        let p = parse_ok("(when t 1 2) (unless t 1)");
        match top(&p, 0) {
            ExprKind::If {
                then_branch,
                else_branch: None,
                ..
            } => {
                assert!(matches!(&p.exprs[*then_branch].kind, ExprKind::Begin(_)));
            }
            other => panic!("expected if from when, got {:?}", other),
        }
        match top(&p, 1) {
            ExprKind::If {
                then_branch,
                else_branch: Some(e),
                ..
            } => {
                assert!(matches!(&p.exprs[*then_branch].kind, ExprKind::Begin(v) if v.is_empty()));
                assert!(matches!(&p.exprs[*e].kind, ExprKind::Int(1)));
            }
            other => panic!("expected if from unless, got {:?}", other),
        }
    }

    #[test]
    fn case_desugars_to_let_over_ifs() {
        let p = parse_ok("(case (+ 1 2) ((1 2) 10) ((3) 30) (else 0))");
        match top(&p, 0) {
            ExprKind::Let { kind, bindings, body } => {
                assert_eq!(*kind, LetKind::Let);
                assert_eq!(bindings.len(), 1);
                assert!(matches!(&p.exprs[*body].kind, ExprKind::If { .. }));
            }
            other => panic!("expected let from case, got {:?}", other),
        }
    }

    #[test]
    fn do_desugars_to_letrec_loop() {
        let p = parse_ok("(do ((i 0 (+ i 1)) (acc 1)) ((= i 3) acc) (display i))");
        match top(&p, 0) {
            ExprKind::Let { kind, bindings, body } => {
                assert_eq!(*kind, LetKind::Rec);
                assert_eq!(bindings.len(), 1);
                assert!(matches!(
                    &p.exprs[bindings[0].value].kind,
                    ExprKind::Lambda { params, .. } if params.len() == 2
                ));
                assert!(matches!(&p.exprs[*body].kind, ExprKind::Call { .. }));
            }
            other => panic!("expected letrec from do, got {:?}", other),
        }
    }

    #[test]
    fn quasiquote_is_rejected() {
        let (_, diags) = parse_err("`(1 ,x)");
        assert!(diags
            .iter()
            .any(|d| d.message.contains("quasiquotation is not supported")));
    }

    #[test]
    fn unresolved_forms_become_erroneous_but_parsing_continues() {
        let (p, diags) = parse_err("(define) (display 1) (if)");
        // Both bad forms report; the good one still parses.
        assert!(diags.error_count() >= 2);
        assert_eq!(p.forms.len(), 3);
        assert!(matches!(top(&p, 0), ExprKind::Erroneous));
        assert!(matches!(top(&p, 1), ExprKind::Call { .. }));
    }

    #[test]
    fn empty_application_is_an_error() {
        let (_, diags) = parse_err("()");
        assert!(diags.iter().any(|d| d.message.contains("empty application")));
    }

    #[test]
    fn unknown_type_name_is_an_error() {
        let (_, diags) = parse_err("(: f (-> widget integer))");
        assert!(diags.iter().any(|d| d.message.contains("unknown type name")));
    }

    #[test]
    fn lambda_return_annotation() {
        let p = parse_ok("(lambda (x) : integer x)");
        match top(&p, 0) {
            ExprKind::Lambda { return_ann, .. } => {
                let ann = return_ann.expect("return annotation");
                assert!(matches!(p.type_exprs[ann].kind, TypeExprKind::Int));
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }
}
