//! Static analysis of module sources
//!
//! One pass over the token stream tags each token with its bracket depth
//! and whether it sits inside a function body, class body or concise arrow
//! body ("deferred": it cannot run during the module's top-level
//! evaluation). Declarative import/export declarations, `require('x')`
//! and `import('x')` calls, and top-level `await` are then read from the
//! tagged tokens. Nothing is executed.

use crate::lexer::{tokenize, Token};

/// A token annotated with its lexical context
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopedToken<'a> {
    /// The token itself
    pub token: Token<'a>,
    /// Number of open brackets enclosing the token
    pub depth: usize,
    /// Inside a function body, class body or concise arrow body
    pub deferred: bool,
    /// A line break separates this token from the previous one
    pub newline_before: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Block,
    Body,
    Paren { control: bool },
    Bracket,
}

/// Tokenize `source` and tag every token with its scope
pub fn scope_tokens(source: &str) -> Vec<ScopedToken<'_>> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut bodies = 0usize;
    let mut concise: Vec<usize> = Vec::new();
    let mut prev: Option<Token<'_>> = None;
    let mut closed_control = false;
    let mut class_pending = false;
    let mut last_end = 0;
    let mut scoped = Vec::new();

    for (token, span) in tokenize(source) {
        let newline_before = source
            .get(last_end..span.start)
            .map_or(false, |gap| gap.contains('\n'));
        last_end = span.end;

        // A concise arrow body ends at the first comma or semicolon at its
        // own depth, when its enclosing bracket closes, or at a new statement.
        while let Some(&start) = concise.last() {
            let ended = frames.len() < start
                || (frames.len() == start
                    && (matches!(token, Token::Comma | Token::Semi)
                        || (newline_before && token.starts_statement())));
            if !ended {
                break;
            }
            concise.pop();
        }
        if prev == Some(Token::Arrow) && token != Token::LBrace {
            concise.push(frames.len());
        }

        scoped.push(ScopedToken {
            token,
            depth: frames.len(),
            deferred: bodies > 0 || !concise.is_empty(),
            newline_before,
        });

        match token {
            Token::LBrace => {
                let body = class_pending
                    || prev == Some(Token::Arrow)
                    || (prev == Some(Token::RParen) && !closed_control);
                class_pending = false;
                if body {
                    bodies += 1;
                    frames.push(Frame::Body);
                } else {
                    frames.push(Frame::Block);
                }
            }
            Token::LParen => frames.push(Frame::Paren {
                control: matches!(prev, Some(Token::Control(_))),
            }),
            Token::LBracket => frames.push(Frame::Bracket),
            Token::RBrace | Token::RParen | Token::RBracket => match frames.pop() {
                Some(Frame::Body) => bodies = bodies.saturating_sub(1),
                Some(Frame::Paren { control }) => closed_control = control,
                _ => {}
            },
            Token::Class => class_pending = true,
            _ => {}
        }
        prev = Some(token);
    }

    scoped
}

/// A binding introduced by an import or re-export declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportBinding {
    /// `import { imported as local }`, `import local` (imported = `default`)
    Named { imported: String, local: String },
    /// `import * as local`
    Namespace { local: String },
    /// `export { imported as exported } from`
    Reexport { imported: String, exported: String },
    /// `export * from` (`exported` = None) or `export * as exported from`
    ReexportAll { exported: Option<String> },
}

/// One `import ... from 'x'` or `export ... from 'x'` declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecl {
    pub specifier: String,
    pub bindings: Vec<ImportBinding>,
}

/// A binding exported from the module's own scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExport {
    /// Name in the module's scope
    pub local: String,
    /// Name seen by importers
    pub exported: String,
}

impl LocalExport {
    fn same(name: &str) -> Self {
        Self {
            local: name.to_string(),
            exported: name.to_string(),
        }
    }
}

/// A `require('x')` call with a literal specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireCall {
    pub specifier: String,
    pub deferred: bool,
}

/// An `import('x')` call with a literal specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicImport {
    pub specifier: String,
    pub deferred: bool,
}

/// Everything the linker needs to know about a module source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAnalysis {
    /// Import and re-export declarations in source order
    pub imports: Vec<ImportDecl>,
    /// Local exports in source order
    pub local_exports: Vec<LocalExport>,
    /// Literal `require` calls
    pub requires: Vec<RequireCall>,
    /// Literal `import()` calls
    pub dynamic_imports: Vec<DynamicImport>,
    /// Import/export declarations or `import.meta` present
    pub has_module_syntax: bool,
    /// `await` outside any function body
    pub has_top_level_await: bool,
}

impl ModuleAnalysis {
    /// Analyze a module source
    pub fn analyze(source: &str) -> Self {
        Self::from_tokens(&scope_tokens(source))
    }

    /// Analyze an already scoped token stream
    pub fn from_tokens(tokens: &[ScopedToken<'_>]) -> Self {
        let mut analysis = Self::default();
        let mut i = 0;

        while i < tokens.len() {
            let current = tokens[i];
            let after_dot = i > 0 && tokens[i - 1].token == Token::Dot;

            match current.token {
                Token::Import if !after_dot => match token_at(tokens, i + 1) {
                    Some(Token::LParen) => {
                        if let (Some(Token::Str(specifier)), Some(Token::RParen | Token::Comma)) =
                            (token_at(tokens, i + 2), token_at(tokens, i + 3))
                        {
                            analysis.dynamic_imports.push(DynamicImport {
                                specifier: specifier.to_string(),
                                deferred: current.deferred,
                            });
                        }
                    }
                    Some(Token::Dot) => analysis.has_module_syntax = true,
                    _ if current.depth == 0 && !current.deferred => {
                        if let Some((decl, next)) = parse_import(tokens, i + 1) {
                            analysis.imports.push(decl);
                            analysis.has_module_syntax = true;
                            i = next;
                            continue;
                        }
                    }
                    _ => {}
                },
                Token::Export if !after_dot && current.depth == 0 && !current.deferred => {
                    if let Some(next) = analysis.parse_export(tokens, i + 1) {
                        analysis.has_module_syntax = true;
                        i = next;
                        continue;
                    }
                }
                Token::Require if !after_dot => {
                    let defining = i > 0 && tokens[i - 1].token == Token::Function;
                    if let (false, Some(Token::LParen), Some(Token::Str(specifier)), Some(Token::RParen)) = (
                        defining,
                        token_at(tokens, i + 1),
                        token_at(tokens, i + 2),
                        token_at(tokens, i + 3),
                    ) {
                        analysis.requires.push(RequireCall {
                            specifier: specifier.to_string(),
                            deferred: current.deferred,
                        });
                    }
                }
                Token::Await if !after_dot && !current.deferred => {
                    analysis.has_top_level_await = true;
                }
                _ => {}
            }
            i += 1;
        }

        analysis
    }

    fn parse_export(&mut self, tokens: &[ScopedToken<'_>], j: usize) -> Option<usize> {
        match token_at(tokens, j)? {
            Token::Default => {
                self.local_exports.push(LocalExport {
                    local: "*default*".to_string(),
                    exported: "default".to_string(),
                });
                Some(j + 1)
            }
            Token::Const | Token::Let | Token::Var => {
                let (names, next) = declared_names(tokens, j + 1);
                self.local_exports
                    .extend(names.iter().map(|name| LocalExport::same(name)));
                Some(next)
            }
            Token::Async | Token::Function => {
                let mut k = j;
                if token_at(tokens, k)? == Token::Async {
                    k += 1;
                    if token_at(tokens, k)? != Token::Function {
                        return None;
                    }
                }
                k += 1;
                if token_at(tokens, k)? == Token::Star {
                    k += 1;
                }
                let name = token_at(tokens, k)?.name()?;
                self.local_exports.push(LocalExport::same(name));
                Some(k + 1)
            }
            Token::Class => {
                let name = token_at(tokens, j + 1)?.name()?;
                self.local_exports.push(LocalExport::same(name));
                Some(j + 2)
            }
            Token::Star => {
                let (exported, k) = if token_at(tokens, j + 1) == Some(Token::As) {
                    (Some(export_name(token_at(tokens, j + 2)?)?.to_string()), j + 3)
                } else {
                    (None, j + 1)
                };
                let (specifier, next) = from_clause(tokens, k)?;
                self.imports.push(ImportDecl {
                    specifier,
                    bindings: vec![ImportBinding::ReexportAll { exported }],
                });
                Some(next)
            }
            Token::LBrace => {
                let (names, k) = specifier_list(tokens, j)?;
                if let Some((specifier, next)) = from_clause(tokens, k) {
                    self.imports.push(ImportDecl {
                        specifier,
                        bindings: names
                            .into_iter()
                            .map(|(imported, exported)| ImportBinding::Reexport { imported, exported })
                            .collect(),
                    });
                    Some(next)
                } else {
                    self.local_exports.extend(
                        names
                            .into_iter()
                            .map(|(local, exported)| LocalExport { local, exported }),
                    );
                    Some(k)
                }
            }
            _ => None,
        }
    }
}

fn token_at<'a>(tokens: &[ScopedToken<'a>], index: usize) -> Option<Token<'a>> {
    tokens.get(index).map(|t| t.token)
}

/// Identifier, keyword or string literal usable as an import/export name
fn export_name<'a>(token: Token<'a>) -> Option<&'a str> {
    match token {
        Token::Str(name) => Some(name),
        other => other.name(),
    }
}

/// `from 'x'` starting at `j`
fn from_clause(tokens: &[ScopedToken<'_>], j: usize) -> Option<(String, usize)> {
    match (token_at(tokens, j)?, token_at(tokens, j + 1)?) {
        (Token::From, Token::Str(specifier)) => Some((specifier.to_string(), j + 2)),
        _ => None,
    }
}

/// `{ a, b as c, 'd' as e }` starting at the opening brace; yields `(name, alias)`
fn specifier_list(tokens: &[ScopedToken<'_>], open: usize) -> Option<(Vec<(String, String)>, usize)> {
    let mut names = Vec::new();
    let mut j = open + 1;
    loop {
        match token_at(tokens, j)? {
            Token::RBrace => return Some((names, j + 1)),
            Token::Comma => j += 1,
            token => {
                let name = export_name(token)?;
                j += 1;
                let alias = if token_at(tokens, j) == Some(Token::As) {
                    let alias = export_name(token_at(tokens, j + 1)?)?;
                    j += 2;
                    alias
                } else {
                    name
                };
                names.push((name.to_string(), alias.to_string()));
            }
        }
    }
}

/// Import clause after `import`, up to and including the specifier
fn parse_import(tokens: &[ScopedToken<'_>], mut j: usize) -> Option<(ImportDecl, usize)> {
    if let Token::Str(specifier) = token_at(tokens, j)? {
        let decl = ImportDecl {
            specifier: specifier.to_string(),
            bindings: Vec::new(),
        };
        return Some((decl, j + 1));
    }

    let mut bindings = Vec::new();
    loop {
        match token_at(tokens, j)? {
            Token::Star => {
                if token_at(tokens, j + 1)? != Token::As {
                    return None;
                }
                let local = token_at(tokens, j + 2)?.name()?;
                bindings.push(ImportBinding::Namespace {
                    local: local.to_string(),
                });
                j += 3;
            }
            Token::LBrace => {
                let (names, next) = specifier_list(tokens, j)?;
                bindings.extend(
                    names
                        .into_iter()
                        .map(|(imported, local)| ImportBinding::Named { imported, local }),
                );
                j = next;
            }
            token => {
                let local = token.name()?;
                bindings.push(ImportBinding::Named {
                    imported: "default".to_string(),
                    local: local.to_string(),
                });
                j += 1;
            }
        }

        match token_at(tokens, j)? {
            Token::Comma => j += 1,
            Token::From => break,
            _ => return None,
        }
    }

    let (specifier, next) = from_clause(tokens, j)?;
    Some((ImportDecl { specifier, bindings }, next))
}

/// Names bound by a `const`/`let`/`var` declaration starting at `start`
fn declared_names(tokens: &[ScopedToken<'_>], start: usize) -> (Vec<String>, usize) {
    let base = tokens.get(start).map_or(0, |t| t.depth);
    let mut names = Vec::new();
    let mut expect_binding = true;
    let mut k = start;

    while let Some(current) = tokens.get(k) {
        if current.depth < base {
            break;
        }
        if current.depth == base {
            match current.token {
                Token::Semi => return (names, k + 1),
                Token::Comma => expect_binding = true,
                token if k > start && current.newline_before && token.starts_statement() => break,
                Token::LBrace | Token::LBracket if expect_binding => {
                    k = pattern_names(tokens, k, &mut names);
                    expect_binding = false;
                    continue;
                }
                token if expect_binding => {
                    if let Some(name) = token.name() {
                        names.push(name.to_string());
                    }
                    expect_binding = false;
                }
                _ => {}
            }
        }
        k += 1;
    }

    (names, k)
}

/// Names bound by a destructuring pattern; returns the index after it
fn pattern_names(tokens: &[ScopedToken<'_>], open: usize, names: &mut Vec<String>) -> usize {
    let inner = tokens[open].depth + 1;
    let mut k = open + 1;

    while let Some(current) = tokens.get(k) {
        if current.depth == inner {
            match current.token {
                Token::RBrace | Token::RBracket => return k + 1,
                token => {
                    if let Some(name) = token.name() {
                        let key = token_at(tokens, k + 1) == Some(Token::Colon);
                        let default_value = tokens[k - 1].token == Token::Assign;
                        if !key && !default_value {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        }
        k += 1;
    }

    k
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(imported: &str, local: &str) -> ImportBinding {
        ImportBinding::Named {
            imported: imported.to_string(),
            local: local.to_string(),
        }
    }

    #[test]
    fn test_import_forms() {
        let analysis = ModuleAnalysis::analyze(
            r#"
            import logger, { Logger, format as fmt } from 'my-logger';
            import * as utils from './utils.mjs';
            import './side-effect.mjs';
            import { 'module.exports' as raw } from './raw.mjs';
            "#,
        );

        assert!(analysis.has_module_syntax);
        assert_eq!(analysis.imports.len(), 4);
        assert_eq!(
            analysis.imports[0].bindings,
            vec![named("default", "logger"), named("Logger", "Logger"), named("format", "fmt")]
        );
        assert_eq!(
            analysis.imports[1].bindings,
            vec![ImportBinding::Namespace { local: "utils".to_string() }]
        );
        assert!(analysis.imports[2].bindings.is_empty());
        assert_eq!(analysis.imports[3].bindings, vec![named("module.exports", "raw")]);
        let specifiers: Vec<_> = analysis.imports.iter().map(|d| d.specifier.as_str()).collect();
        assert_eq!(specifiers, vec!["my-logger", "./utils.mjs", "./side-effect.mjs", "./raw.mjs"]);
    }

    #[test]
    fn test_export_forms() {
        let analysis = ModuleAnalysis::analyze(
            r#"
            export const a = 1, b = f(1, 2);
            export let { c, d: e, f = 3 } = obj;
            export function g() { return 1; }
            export async function h() {}
            export class Klass {}
            export default 42;
            const local = 1;
            export { local as renamed, local as 'module.exports' };
            export { x as y } from './x.mjs';
            export * from './star.mjs';
            export * as ns from './ns.mjs';
            "#,
        );

        let exported: Vec<_> = analysis
            .local_exports
            .iter()
            .map(|e| e.exported.as_str())
            .collect();
        assert_eq!(
            exported,
            vec!["a", "b", "c", "e", "f", "g", "h", "Klass", "default", "renamed", "module.exports"]
        );
        assert_eq!(
            analysis.imports[0].bindings,
            vec![ImportBinding::Reexport { imported: "x".to_string(), exported: "y".to_string() }]
        );
        assert_eq!(analysis.imports[1].bindings, vec![ImportBinding::ReexportAll { exported: None }]);
        assert_eq!(
            analysis.imports[2].bindings,
            vec![ImportBinding::ReexportAll { exported: Some("ns".to_string()) }]
        );
    }

    #[test]
    fn test_require_calls_are_tagged_deferred() {
        let analysis = ModuleAnalysis::analyze(
            r#"
            const a = require('./a.js');
            if (flag) { require('./b.js'); }
            function later() { return require('./c.js'); }
            const lazy = () => require('./d.js');
            const e = require('./e.js')
            obj.require('./not-a-require.js');
            class K { m() { require('./f.js'); } }
            "#,
        );

        let calls: Vec<_> = analysis
            .requires
            .iter()
            .map(|r| (r.specifier.as_str(), r.deferred))
            .collect();
        assert_eq!(
            calls,
            vec![
                ("./a.js", false),
                ("./b.js", false),
                ("./c.js", true),
                ("./d.js", true),
                ("./e.js", false),
                ("./f.js", true),
            ]
        );
        assert!(!analysis.has_module_syntax);
    }

    #[test]
    fn test_top_level_await_and_dynamic_import() {
        let analysis = ModuleAnalysis::analyze(
            r#"
            const mod = await import('./a.mjs');
            async function f() { await import('./b.mjs'); }
            "#,
        );
        assert!(analysis.has_top_level_await);
        assert_eq!(analysis.dynamic_imports.len(), 2);
        assert!(!analysis.dynamic_imports[0].deferred);
        assert!(analysis.dynamic_imports[1].deferred);
        // `import(...)` alone is not module syntax
        assert!(!analysis.has_module_syntax);

        let nested = ModuleAnalysis::analyze("async function f() { await g(); }");
        assert!(!nested.has_top_level_await);
    }

    #[test]
    fn test_regex_literal_does_not_hide_declarations() {
        let analysis = ModuleAnalysis::analyze(
            "const re = /'/; import { x } from './dep.mjs'; export { x };",
        );
        assert!(analysis.has_module_syntax);
        assert_eq!(analysis.imports.len(), 1);
        assert_eq!(analysis.imports[0].specifier, "./dep.mjs");
        assert_eq!(analysis.local_exports.len(), 1);
    }

    #[test]
    fn test_import_meta_is_module_syntax() {
        assert!(ModuleAnalysis::analyze("console.log(import.meta.url)").has_module_syntax);
        assert!(!ModuleAnalysis::analyze("// import x from 'y'").has_module_syntax);
    }
}
