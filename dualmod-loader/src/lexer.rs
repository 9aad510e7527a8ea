//! Lexer for module sources using logos
//!
//! Only the tokens the static scans care about are distinguished; all
//! other punctuation collapses into [`Token::Operator`]. A `/` is either
//! a comment opener, a regular expression literal or division; the first
//! is decided by the lexer callback, the other two by [`tokenize`] from
//! the preceding token.

use logos::{Filter, Lexer, Logos};
use std::ops::Range;

#[derive(Logos, Debug, PartialEq, Clone, Copy)]
#[logos(skip r"[ \t\r\n\f\u{feff}]+")]
#[logos(skip r"#![^\n]*")]
pub enum Token<'a> {
    // Module keywords
    #[token("import")]
    Import,
    #[token("export")]
    Export,
    #[token("from")]
    From,
    #[token("as")]
    As,
    #[token("default")]
    Default,
    #[token("require")]
    Require,
    #[token("module")]
    Module,
    #[token("exports")]
    Exports,

    // Declarations
    #[token("function")]
    Function,
    #[token("class")]
    Class,
    #[token("const")]
    Const,
    #[token("let")]
    Let,
    #[token("var")]
    Var,
    #[token("async")]
    Async,
    #[token("await")]
    Await,

    // Keywords whose parenthesized head or block is not a function body
    #[token("if", |lex| lex.slice())]
    #[token("for", |lex| lex.slice())]
    #[token("while", |lex| lex.slice())]
    #[token("switch", |lex| lex.slice())]
    #[token("catch", |lex| lex.slice())]
    #[token("with", |lex| lex.slice())]
    #[token("else", |lex| lex.slice())]
    #[token("try", |lex| lex.slice())]
    #[token("finally", |lex| lex.slice())]
    #[token("do", |lex| lex.slice())]
    Control(&'a str),

    // Delimiters
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    // Punctuation
    #[token(".")]
    Dot,
    #[token("...")]
    Ellipsis,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token("=")]
    Assign,
    #[token("=>")]
    Arrow,
    #[token("*")]
    Star,
    #[token("/", slash)]
    Slash,
    #[regex(r"[-+*%&|^<>!?~=]+")]
    Operator,

    // Literals
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| { let s = lex.slice(); &s[1..s.len() - 1] })]
    #[regex(r#"'([^'\\\n]|\\.)*'"#, |lex| { let s = lex.slice(); &s[1..s.len() - 1] })]
    Str(&'a str),
    #[regex(r"`([^`\\]|\\.)*`")]
    Template,
    #[regex(r"[0-9][0-9a-zA-Z_.]*")]
    Number,
    /// Regular expression literal, produced by [`tokenize`]
    Regex,

    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice())]
    Ident(&'a str),
    #[regex(r"#[A-Za-z_$][A-Za-z0-9_$]*")]
    PrivateName,
}

impl<'a> Token<'a> {
    /// Text usable as a property or binding name, for identifiers and keywords
    pub fn name(&self) -> Option<&'a str> {
        match self {
            Token::Ident(name) | Token::Control(name) => Some(name),
            Token::Import => Some("import"),
            Token::Export => Some("export"),
            Token::From => Some("from"),
            Token::As => Some("as"),
            Token::Default => Some("default"),
            Token::Require => Some("require"),
            Token::Module => Some("module"),
            Token::Exports => Some("exports"),
            Token::Function => Some("function"),
            Token::Class => Some("class"),
            Token::Const => Some("const"),
            Token::Let => Some("let"),
            Token::Var => Some("var"),
            Token::Async => Some("async"),
            Token::Await => Some("await"),
            _ => None,
        }
    }

    /// Whether a `/` following this token opens a regular expression
    fn allows_regex(&self) -> bool {
        match self {
            Token::Ident(name) => matches!(
                *name,
                "return" | "typeof" | "instanceof" | "in" | "of" | "new" | "delete" | "void"
                    | "throw" | "case" | "yield"
            ),
            Token::RParen
            | Token::RBracket
            | Token::Str(_)
            | Token::Template
            | Token::Number
            | Token::Regex
            | Token::PrivateName => false,
            _ => true,
        }
    }

    /// Whether this token typically begins a new statement
    pub fn starts_statement(&self) -> bool {
        matches!(
            self,
            Token::Import
                | Token::Export
                | Token::Module
                | Token::Exports
                | Token::Function
                | Token::Class
                | Token::Const
                | Token::Let
                | Token::Var
                | Token::Control(_)
        )
    }
}

/// Skip comments; any other `/` is emitted for [`tokenize`] to classify
fn slash<'a>(lex: &mut Lexer<'a, Token<'a>>) -> Filter<()> {
    let rest = lex.remainder();
    if rest.starts_with('/') {
        lex.bump(rest.find('\n').unwrap_or(rest.len()));
        Filter::Skip
    } else if let Some(body) = rest.strip_prefix('*') {
        // an unterminated comment runs to the end of the source
        lex.bump(body.find("*/").map_or(rest.len(), |end| end + 3));
        Filter::Skip
    } else {
        Filter::Emit(())
    }
}

/// Length of a regular expression literal's body, flags and closing `/`,
/// or `None` when the line ends first
fn regex_len(rest: &str) -> Option<usize> {
    let mut in_class = false;
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\n' | '\r' => return None,
            '\\' => {
                chars.next();
            }
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => {
                let flags = rest[i + 1..]
                    .find(|c: char| !c.is_ascii_alphanumeric())
                    .unwrap_or(rest.len() - i - 1);
                return Some(i + 1 + flags);
            }
            _ => {}
        }
    }
    None
}

/// Tokenize a source, dropping unrecognized input
pub fn tokenize(source: &str) -> Vec<(Token<'_>, Range<usize>)> {
    let mut lexer = Token::lexer(source);
    let mut tokens: Vec<(Token<'_>, Range<usize>)> = Vec::new();
    while let Some(token) = lexer.next() {
        let Ok(mut token) = token else { continue };
        if token == Token::Slash && tokens.last().map_or(true, |(prev, _)| prev.allows_regex()) {
            if let Some(len) = regex_len(lexer.remainder()) {
                lexer.bump(len);
                token = Token::Regex;
            }
        }
        tokens.push((token, lexer.span()));
    }
    tokens
}
