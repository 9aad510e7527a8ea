//! Static export detection for legacy modules
//!
//! Finds the names a legacy module will very likely put on its exports
//! object, by looking at top-level assignment patterns only. A name
//! assigned in some other way is simply not detected; the detector never
//! fails.

use crate::analysis::{scope_tokens, ScopedToken};
use crate::lexer::Token;
use std::collections::BTreeSet;

/// Names detected on a legacy module's exports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedExports {
    /// Detected property names; never contains `default`
    pub names: BTreeSet<String>,
    /// Specifiers of `module.exports = require('x')` re-exports
    pub reexports: Vec<String>,
}

impl DetectedExports {
    /// Scan a legacy module source
    pub fn detect(source: &str) -> Self {
        Self::from_tokens(&scope_tokens(source))
    }

    /// Scan an already scoped token stream
    pub fn from_tokens(tokens: &[ScopedToken<'_>]) -> Self {
        let mut detected = Self::default();

        for (i, current) in tokens.iter().enumerate() {
            if current.deferred || (i > 0 && tokens[i - 1].token == Token::Dot) {
                continue;
            }
            match current.token {
                Token::Exports => detected.property_assignment(tokens, i + 1),
                Token::Module
                    if token_at(tokens, i + 1) == Some(Token::Dot)
                        && token_at(tokens, i + 2) == Some(Token::Exports) =>
                {
                    if token_at(tokens, i + 3) == Some(Token::Assign) {
                        detected.whole_assignment(tokens, i + 4);
                    } else {
                        detected.property_assignment(tokens, i + 3);
                    }
                }
                Token::Ident("Object")
                    if token_at(tokens, i + 1) == Some(Token::Dot)
                        && token_at(tokens, i + 2) == Some(Token::Ident("defineProperty"))
                        && token_at(tokens, i + 3) == Some(Token::LParen) =>
                {
                    detected.define_property(tokens, i + 4);
                }
                _ => {}
            }
        }

        detected
    }

    /// Merge names detected on a re-exported module
    pub fn merge(&mut self, other: &DetectedExports) {
        self.names.extend(other.names.iter().cloned());
    }

    fn insert(&mut self, name: &str) {
        if name != "default" {
            self.names.insert(name.to_string());
        }
    }

    /// `.NAME = ` or `['NAME'] = ` after an exports reference
    fn property_assignment(&mut self, tokens: &[ScopedToken<'_>], k: usize) {
        match token_at(tokens, k) {
            Some(Token::Dot) => {
                if let (Some(name), Some(Token::Assign)) = (
                    token_at(tokens, k + 1).and_then(|t| t.name()),
                    token_at(tokens, k + 2),
                ) {
                    self.insert(name);
                }
            }
            Some(Token::LBracket) => {
                if let (Some(Token::Str(name)), Some(Token::RBracket), Some(Token::Assign)) = (
                    token_at(tokens, k + 1),
                    token_at(tokens, k + 2),
                    token_at(tokens, k + 3),
                ) {
                    self.insert(name);
                }
            }
            _ => {}
        }
    }

    /// Right-hand side of `module.exports = `
    fn whole_assignment(&mut self, tokens: &[ScopedToken<'_>], k: usize) {
        match token_at(tokens, k) {
            Some(Token::Require) => {
                if let (Some(Token::LParen), Some(Token::Str(specifier)), Some(Token::RParen)) = (
                    token_at(tokens, k + 1),
                    token_at(tokens, k + 2),
                    token_at(tokens, k + 3),
                ) {
                    self.reexports.push(specifier.to_string());
                }
            }
            Some(Token::LBrace) => self.object_literal(tokens, k),
            _ => {}
        }
    }

    /// Direct members of an object literal starting at `open`
    fn object_literal(&mut self, tokens: &[ScopedToken<'_>], open: usize) {
        let inner = tokens[open].depth + 1;
        let close = tokens[open + 1..]
            .iter()
            .position(|t| t.depth == inner && t.token == Token::RBrace)
            .map_or(tokens.len(), |offset| open + 1 + offset);

        let body = &tokens[open + 1..close];
        for member in body.split(|t| t.depth == inner && t.token == Token::Comma) {
            let shape: Vec<Token<'_>> = member.iter().take(4).map(|t| t.token).collect();
            match shape.as_slice() {
                [Token::Ellipsis, Token::Require, Token::LParen, Token::Str(specifier)] => {
                    self.reexports.push(specifier.to_string());
                }
                [Token::Ellipsis, ..] | [Token::LBracket, ..] => {}
                [Token::Str(name), Token::Colon, ..] => self.insert(name),
                [Token::Ident("get" | "set"), name, Token::LParen, ..] => {
                    if let Some(name) = export_key(*name) {
                        self.insert(name);
                    }
                }
                [Token::Async | Token::Star, name, Token::LParen, ..] => {
                    if let Some(name) = export_key(*name) {
                        self.insert(name);
                    }
                }
                [name] | [name, Token::Colon, ..] | [name, Token::LParen, ..] => {
                    if let Some(name) = name.name() {
                        self.insert(name);
                    }
                }
                _ => {}
            }
        }
    }

    /// `exports|module.exports, 'NAME'` inside `Object.defineProperty(`
    fn define_property(&mut self, tokens: &[ScopedToken<'_>], k: usize) {
        let after_target = match token_at(tokens, k) {
            Some(Token::Exports) => k + 1,
            Some(Token::Module)
                if token_at(tokens, k + 1) == Some(Token::Dot)
                    && token_at(tokens, k + 2) == Some(Token::Exports) =>
            {
                k + 3
            }
            _ => return,
        };
        if let (Some(Token::Comma), Some(Token::Str(name))) =
            (token_at(tokens, after_target), token_at(tokens, after_target + 1))
        {
            self.insert(name);
        }
    }
}

fn token_at<'a>(tokens: &[ScopedToken<'a>], index: usize) -> Option<Token<'a>> {
    tokens.get(index).map(|t| t.token)
}

fn export_key(token: Token<'_>) -> Option<&str> {
    match token {
        Token::Str(name) => Some(name),
        other => other.name(),
    }
}
