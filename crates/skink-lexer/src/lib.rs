use logos::Logos;
use smol_str::SmolStr;

/// Source span as byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

fn parse_string(lex: &mut logos::Lexer<Token>) -> Option<SmolStr> {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1];
    let mut result = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                'n' => result.push('\n'),
                't' => result.push('\t'),
                'r' => result.push('\r'),
                '\\' => result.push('\\'),
                '"' => result.push('"'),
                '0' => result.push('\0'),
                other => {
                    result.push('\\');
                    result.push(other);
                }
            }
        } else {
            result.push(c);
        }
    }
    Some(SmolStr::new(result))
}

fn parse_char(lex: &mut logos::Lexer<Token>) -> Result<char, ()> {
    let name = &lex.slice()[2..];
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => match name {
            "space" => Ok(' '),
            "newline" => Ok('\n'),
            "tab" => Ok('\t'),
            "return" => Ok('\r'),
            "null" => Ok('\0'),
            _ => Err(()),
        },
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r";[^\n]*")]
pub enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("'")]
    Quote,
    #[token("`")]
    Backtick,
    #[token(",@", priority = 4)]
    CommaAt,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(":")]
    Colon,
    #[token("->", priority = 4)]
    Arrow,

    #[regex(r"[+-]?[0-9]+\.[0-9]+", priority = 3, callback = |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[+-]?[0-9]+", priority = 2, callback = |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    /// A terminated string literal. The second pattern catches a string that
    /// runs to the end of the line or file and reports it as one error.
    #[regex(r#""([^"\\]|\\.)*""#, priority = 2, callback = parse_string)]
    #[regex(r#""([^"\\\n]|\\.)*"#, priority = 1, callback = |_| Err(()))]
    Str(SmolStr),

    #[token("#t", |_| true)]
    #[token("#f", |_| false)]
    Bool(bool),

    /// Character literal: `#\a`, `#\space`, `#\newline`.
    #[regex(r"#\\[a-zA-Z0-9]+", priority = 3, callback = parse_char)]
    #[regex(r"#\\.", priority = 2, callback = |lex| lex.slice().chars().nth(2).ok_or(()))]
    Char(char),

    /// Identifiers and operators: `foo`, `+`, `set!`, `number->string`.
    #[regex(r"[a-zA-Z_!$%&*+\-/<>=?^~@][a-zA-Z0-9_!$%&*+\-/<>=?^~@.]*", priority = 1, callback = |lex| SmolStr::new(lex.slice()))]
    Ident(SmolStr),
}

/// Lex source text into a list of (token, span) pairs plus the spans of any
/// byte runs that matched no rule.
pub fn lex(source: &str) -> (Vec<(Token, Span)>, Vec<Span>) {
    let mut tokens = Vec::new();
    let mut errors: Vec<Span> = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span::new(range.start as u32, range.end as u32);
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(_) => {
                // Fold adjacent garbage into one span so a bad run reports once.
                match errors.last_mut() {
                    Some(last) if last.end == span.start => last.end = span.end,
                    _ => errors.push(span),
                }
            }
        }
    }

    (tokens, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_tokens(source: &str) -> Vec<Token> {
        let (tokens, errors) = lex(source);
        assert!(errors.is_empty(), "unexpected lex errors: {:?}", errors);
        tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_delimiters() {
        assert_eq!(
            lex_tokens("( ) [ ]"),
            vec![
                Token::LParen,
                Token::RParen,
                Token::LBracket,
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn test_integers() {
        assert_eq!(lex_tokens("42"), vec![Token::Int(42)]);
        assert_eq!(lex_tokens("0"), vec![Token::Int(0)]);
        assert_eq!(lex_tokens("-7"), vec![Token::Int(-7)]);
        assert_eq!(lex_tokens("+13"), vec![Token::Int(13)]);
    }

    #[test]
    fn test_floats() {
        assert_eq!(lex_tokens("3.25"), vec![Token::Float(3.25)]);
        assert_eq!(lex_tokens("-0.5"), vec![Token::Float(-0.5)]);
    }

    #[test]
    fn test_strings() {
        assert_eq!(lex_tokens(r#""hello""#), vec![Token::Str("hello".into())]);
        assert_eq!(
            lex_tokens(r#""a\nb\t\"c\"""#),
            vec![Token::Str("a\nb\t\"c\"".into())]
        );
        assert_eq!(lex_tokens(r#""""#), vec![Token::Str("".into())]);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let (tokens, errors) = lex("\"oops");
        assert!(tokens.is_empty());
        assert_eq!(errors, vec![Span::new(0, 5)]);
    }

    #[test]
    fn test_booleans() {
        assert_eq!(
            lex_tokens("#t #f"),
            vec![Token::Bool(true), Token::Bool(false)]
        );
    }

    #[test]
    fn test_characters() {
        assert_eq!(lex_tokens(r"#\a"), vec![Token::Char('a')]);
        assert_eq!(lex_tokens(r"#\space"), vec![Token::Char(' ')]);
        assert_eq!(lex_tokens(r"#\newline"), vec![Token::Char('\n')]);
        assert_eq!(lex_tokens(r"#\null"), vec![Token::Char('\0')]);
        assert_eq!(lex_tokens(r"#\("), vec![Token::Char('(')]);
        assert_eq!(lex_tokens(r"#\0"), vec![Token::Char('0')]);
    }

    #[test]
    fn test_bad_character_name_is_error() {
        let (_, errors) = lex(r"#\bogus");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(
            lex_tokens("foo set! even? number->string v+"),
            vec![
                Token::Ident("foo".into()),
                Token::Ident("set!".into()),
                Token::Ident("even?".into()),
                Token::Ident("number->string".into()),
                Token::Ident("v+".into()),
            ]
        );
    }

    #[test]
    fn test_operators_are_identifiers() {
        assert_eq!(
            lex_tokens("+ - * / < > = <= >= let*"),
            vec![
                Token::Ident("+".into()),
                Token::Ident("-".into()),
                Token::Ident("*".into()),
                Token::Ident("/".into()),
                Token::Ident("<".into()),
                Token::Ident(">".into()),
                Token::Ident("=".into()),
                Token::Ident("<=".into()),
                Token::Ident(">=".into()),
                Token::Ident("let*".into()),
            ]
        );
    }

    #[test]
    fn test_arrow_and_colon_standalone() {
        assert_eq!(
            lex_tokens("x : -> ->string"),
            vec![
                Token::Ident("x".into()),
                Token::Colon,
                Token::Arrow,
                Token::Ident("->string".into()),
            ]
        );
    }

    #[test]
    fn test_quote_family() {
        assert_eq!(
            lex_tokens("' ` , ,@"),
            vec![
                Token::Quote,
                Token::Backtick,
                Token::Comma,
                Token::CommaAt,
            ]
        );
        assert_eq!(
            lex_tokens(",@rest"),
            vec![Token::CommaAt, Token::Ident("rest".into())]
        );
    }

    #[test]
    fn test_dotted_pair_tokens() {
        assert_eq!(
            lex_tokens("(1 . 2)"),
            vec![
                Token::LParen,
                Token::Int(1),
                Token::Dot,
                Token::Int(2),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(lex_tokens("; a comment\n42"), vec![Token::Int(42)]);
        assert_eq!(lex_tokens("42 ; trailing"), vec![Token::Int(42)]);
    }

    #[test]
    fn test_simple_expression() {
        assert_eq!(
            lex_tokens("(+ 1 2)"),
            vec![
                Token::LParen,
                Token::Ident("+".into()),
                Token::Int(1),
                Token::Int(2),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_define_with_annotation() {
        let tokens = lex_tokens("(define (sq [x : integer]) (* x x))");
        assert_eq!(tokens[0], Token::LParen);
        assert_eq!(tokens[1], Token::Ident("define".into()));
        assert!(tokens.contains(&Token::LBracket));
        assert!(tokens.contains(&Token::Colon));
    }

    #[test]
    fn test_spans() {
        let (tokens, _) = lex("(+ 1 2)");
        assert_eq!(tokens[0], (Token::LParen, Span::new(0, 1)));
        assert_eq!(tokens[1], (Token::Ident("+".into()), Span::new(1, 2)));
        assert_eq!(tokens[2], (Token::Int(1), Span::new(3, 4)));
        assert_eq!(tokens[3], (Token::Int(2), Span::new(5, 6)));
        assert_eq!(tokens[4], (Token::RParen, Span::new(6, 7)));
    }

    #[test]
    fn test_garbage_bytes_fold_into_one_error() {
        let (tokens, errors) = lex("\x01\x02 42");
        assert_eq!(tokens, vec![(Token::Int(42), Span::new(3, 5))]);
        assert_eq!(errors, vec![Span::new(0, 2)]);
    }
}
