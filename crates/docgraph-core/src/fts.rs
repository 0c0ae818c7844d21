//! Full-text query language.
//!
//! A small, strict grammar that maps onto SQLite FTS5 and can also be
//! evaluated directly against tokenized node text:
//!
//! ```text
//! query   := or
//! or      := and ("OR" and)*
//! and     := not (["AND"] not)*        -- juxtaposition is AND
//! not     := primary ("NOT" primary)*
//! primary := term | term* | "phrase" | "(" or ")"
//! ```
//!
//! Operators are upper-case, as in FTS5. Anything outside the grammar
//! (column filters, `^`, `NEAR`, `+`, stray `*`, unbalanced quotes or
//! parentheses, dangling operators) is a [`GraphError::QuerySyntax`]
//! naming the offending token. A query is never partially applied.
//!
//! Terms are normalised with [`tokenize`] so both backends see the same
//! tokens: a bare word that splits into several tokens (`don't`,
//! `state-of-the-art`) becomes a phrase.

use crate::error::{GraphError, Result};

/// Maximum parenthesis nesting accepted by the parser.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtsQuery {
    Term { text: String, prefix: bool },
    Phrase(Vec<String>),
    And(Box<FtsQuery>, Box<FtsQuery>),
    Or(Box<FtsQuery>, Box<FtsQuery>),
    /// `left NOT right`: rows matching `left` but not `right`.
    Not(Box<FtsQuery>, Box<FtsQuery>),
}

/// Lowercased alphanumeric runs. Mirrors the `unicode61` tokenizer with
/// diacritics kept, which is how the FTS table is declared.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Word(String),
    Phrase(String),
    LParen,
    RParen,
    And,
    Or,
    Not,
}

impl Lexeme {
    fn display(&self) -> String {
        match self {
            Lexeme::Word(w) => w.clone(),
            Lexeme::Phrase(p) => format!("\"{}\"", p),
            Lexeme::LParen => "(".into(),
            Lexeme::RParen => ")".into(),
            Lexeme::And => "AND".into(),
            Lexeme::Or => "OR".into(),
            Lexeme::Not => "NOT".into(),
        }
    }
}

fn syntax(token: impl Into<String>, reason: &str) -> GraphError {
    GraphError::QuerySyntax {
        token: token.into(),
        reason: reason.to_string(),
    }
}

fn lex(input: &str) -> Result<Vec<Lexeme>> {
    let mut out = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        match ch {
            '(' => {
                chars.next();
                out.push(Lexeme::LParen);
            }
            ')' => {
                chars.next();
                out.push(Lexeme::RParen);
            }
            '"' => {
                chars.next();
                let body_start = start + 1;
                let close = input[body_start..].find('"');
                match close {
                    Some(len) => {
                        out.push(Lexeme::Phrase(input[body_start..body_start + len].to_string()));
                        while let Some(&(i, _)) = chars.peek() {
                            if i > body_start + len {
                                break;
                            }
                            chars.next();
                        }
                    }
                    None => return Err(syntax(&input[start..], "unterminated phrase")),
                }
            }
            _ => {
                let mut end = input.len();
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        end = i;
                        break;
                    }
                    chars.next();
                }
                let word = &input[start..end];
                out.push(match word {
                    "AND" => Lexeme::And,
                    "OR" => Lexeme::Or,
                    "NOT" => Lexeme::Not,
                    "NEAR" => return Err(syntax(word, "NEAR queries are not supported")),
                    _ => Lexeme::Word(word.to_string()),
                });
            }
        }
    }
    Ok(out)
}

struct QueryParser {
    lexemes: Vec<Lexeme>,
    pos: usize,
    depth: usize,
}

impl QueryParser {
    fn peek(&self) -> Option<&Lexeme> {
        self.lexemes.get(self.pos)
    }

    fn next(&mut self) -> Option<Lexeme> {
        let lexeme = self.lexemes.get(self.pos).cloned();
        self.pos += 1;
        lexeme
    }

    fn parse_or(&mut self) -> Result<FtsQuery> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Lexeme::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = FtsQuery::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FtsQuery> {
        let mut left = self.parse_not()?;
        loop {
            match self.peek() {
                Some(Lexeme::And) => self.pos += 1,
                Some(Lexeme::Word(_)) | Some(Lexeme::Phrase(_)) | Some(Lexeme::LParen) => {}
                _ => break,
            }
            let right = self.parse_not()?;
            left = FtsQuery::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<FtsQuery> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Lexeme::Not) {
            self.pos += 1;
            let right = self.parse_primary()?;
            left = FtsQuery::Not(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<FtsQuery> {
        match self.next() {
            Some(Lexeme::Word(word)) => word_query(&word),
            Some(Lexeme::Phrase(body)) => {
                let tokens = tokenize(&body);
                if tokens.is_empty() {
                    return Err(syntax(format!("\"{}\"", body), "phrase has no searchable terms"));
                }
                Ok(FtsQuery::Phrase(tokens))
            }
            Some(Lexeme::LParen) => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(syntax("(", "parentheses nested too deeply"));
                }
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Lexeme::RParen) => {
                        self.depth -= 1;
                        Ok(inner)
                    }
                    _ => Err(syntax("(", "unbalanced parenthesis")),
                }
            }
            Some(Lexeme::RParen) => Err(syntax(")", "unbalanced parenthesis")),
            Some(op) => Err(syntax(op.display(), "operator is missing an operand")),
            None => {
                let last = self
                    .lexemes
                    .last()
                    .map(|l| l.display())
                    .unwrap_or_default();
                Err(syntax(last, "query ends where a term was expected"))
            }
        }
    }
}

fn word_query(word: &str) -> Result<FtsQuery> {
    if let Some(bad) = word.chars().find(|c| matches!(c, ':' | '^' | '+' | '{' | '}')) {
        let reason = match bad {
            ':' => "column filters are not supported",
            '^' => "initial-token queries are not supported",
            _ => "unsupported operator character",
        };
        return Err(syntax(word, reason));
    }

    let (base, prefix) = match word.strip_suffix('*') {
        Some(base) => (base, true),
        None => (word, false),
    };
    if base.contains('*') {
        return Err(syntax(word, "'*' is only allowed at the end of a term"));
    }
    let tokens = tokenize(base);
    match tokens.len() {
        0 if prefix => Err(syntax(word, "prefix marker without a term")),
        0 => Err(syntax(word, "term has no searchable characters")),
        1 => Ok(FtsQuery::Term {
            text: tokens.into_iter().next().unwrap_or_default(),
            prefix,
        }),
        _ if prefix => Err(syntax(word, "prefix must apply to a single token")),
        _ => Ok(FtsQuery::Phrase(tokens)),
    }
}

impl FtsQuery {
    /// Parse a query string.
    pub fn parse(input: &str) -> Result<Self> {
        let lexemes = lex(input)?;
        if lexemes.is_empty() {
            return Err(syntax("", "empty query"));
        }
        let mut parser = QueryParser {
            lexemes,
            pos: 0,
            depth: 0,
        };
        let query = parser.parse_or()?;
        match parser.next() {
            None => Ok(query),
            Some(Lexeme::RParen) => Err(syntax(")", "unbalanced parenthesis")),
            Some(other) => Err(syntax(other.display(), "unexpected token")),
        }
    }

    /// Render as an FTS5 `MATCH` expression. Every term is quoted, so no
    /// user text reaches FTS5 unescaped.
    pub fn to_fts5(&self) -> String {
        match self {
            FtsQuery::Term { text, prefix } => {
                format!("{}{}", quote(text), if *prefix { "*" } else { "" })
            }
            FtsQuery::Phrase(tokens) => quote(&tokens.join(" ")),
            FtsQuery::And(l, r) => format!("({} AND {})", l.to_fts5(), r.to_fts5()),
            FtsQuery::Or(l, r) => format!("({} OR {})", l.to_fts5(), r.to_fts5()),
            FtsQuery::Not(l, r) => format!("({} NOT {})", l.to_fts5(), r.to_fts5()),
        }
    }

    /// Whether a tokenized text satisfies the query.
    pub fn matches(&self, tokens: &[String]) -> bool {
        match self {
            FtsQuery::Term { .. } | FtsQuery::Phrase(_) => self.occurrences(tokens) > 0,
            FtsQuery::And(l, r) => l.matches(tokens) && r.matches(tokens),
            FtsQuery::Or(l, r) => l.matches(tokens) || r.matches(tokens),
            FtsQuery::Not(l, r) => l.matches(tokens) && !r.matches(tokens),
        }
    }

    /// Term-frequency score over the positive side of the query, or
    /// `None` when the text does not match.
    pub fn score(&self, tokens: &[String]) -> Option<f64> {
        if self.matches(tokens) {
            Some(self.occurrences(tokens) as f64)
        } else {
            None
        }
    }

    fn occurrences(&self, tokens: &[String]) -> usize {
        match self {
            FtsQuery::Term { text, prefix: true } => {
                tokens.iter().filter(|t| t.starts_with(text.as_str())).count()
            }
            FtsQuery::Term { text, prefix: false } => tokens.iter().filter(|t| *t == text).count(),
            FtsQuery::Phrase(words) => {
                if words.is_empty() || tokens.len() < words.len() {
                    0
                } else {
                    tokens.windows(words.len()).filter(|w| *w == words.as_slice()).count()
                }
            }
            FtsQuery::And(l, r) | FtsQuery::Or(l, r) => l.occurrences(tokens) + r.occurrences(tokens),
            FtsQuery::Not(l, _) => l.occurrences(tokens),
        }
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(t: &str) -> FtsQuery {
        FtsQuery::Term {
            text: t.into(),
            prefix: false,
        }
    }

    fn err_token(q: &str) -> String {
        match FtsQuery::parse(q).unwrap_err() {
            GraphError::QuerySyntax { token, .. } => token,
            other => panic!("expected QuerySyntax for {:?}, got {:?}", q, other),
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World! x2"), vec!["hello", "world", "x2"]);
        assert!(tokenize("  --  ").is_empty());
    }

    #[test]
    fn test_implicit_and_and_precedence() {
        let q = FtsQuery::parse("a b OR c").unwrap();
        assert_eq!(
            q,
            FtsQuery::Or(
                Box::new(FtsQuery::And(Box::new(term("a")), Box::new(term("b")))),
                Box::new(term("c"))
            )
        );
        let q = FtsQuery::parse("a NOT b c").unwrap();
        assert_eq!(
            q,
            FtsQuery::And(
                Box::new(FtsQuery::Not(Box::new(term("a")), Box::new(term("b")))),
                Box::new(term("c"))
            )
        );
    }

    #[test]
    fn test_prefix_phrase_and_groups() {
        let q = FtsQuery::parse("(Rust OR go) \"Borrow Checker\" lifet*").unwrap();
        assert_eq!(
            q.to_fts5(),
            "(((\"rust\" OR \"go\") AND \"borrow checker\") AND \"lifet\"*)"
        );
    }

    #[test]
    fn test_punctuated_word_becomes_phrase() {
        assert_eq!(
            FtsQuery::parse("state-of-the-art").unwrap(),
            FtsQuery::Phrase(vec!["state".into(), "of".into(), "the".into(), "art".into()])
        );
    }

    #[test]
    fn test_syntax_errors_name_the_token() {
        assert_eq!(err_token("title:rust"), "title:rust");
        assert_eq!(err_token("^start"), "^start");
        assert_eq!(err_token("a NEAR b"), "NEAR");
        assert_eq!(err_token("+must"), "+must");
        assert_eq!(err_token("\"open phrase"), "\"open phrase");
        assert_eq!(err_token("(a OR b"), "(");
        assert_eq!(err_token("a b)"), ")");
        assert_eq!(err_token("a OR"), "OR");
        assert_eq!(err_token("AND a"), "AND");
        assert_eq!(err_token("*"), "*");
        assert_eq!(err_token("a*b"), "a*b");
        assert_eq!(err_token("\"  \""), "\"  \"");
        assert_eq!(err_token("   "), "");
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}a{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(err_token(&deep), "(");
        let ok = format!("{}a{}", "(".repeat(5), ")".repeat(5));
        assert_eq!(FtsQuery::parse(&ok).unwrap(), term("a"));
    }

    #[test]
    fn test_evaluation() {
        let tokens = tokenize("The quick brown fox jumps over the lazy dog. The end.");
        assert!(FtsQuery::parse("quick fox").unwrap().matches(&tokens));
        assert!(FtsQuery::parse("\"brown fox\"").unwrap().matches(&tokens));
        assert!(!FtsQuery::parse("\"fox brown\"").unwrap().matches(&tokens));
        assert!(FtsQuery::parse("jum*").unwrap().matches(&tokens));
        assert!(FtsQuery::parse("cat OR dog").unwrap().matches(&tokens));
        assert!(!FtsQuery::parse("fox NOT dog").unwrap().matches(&tokens));
        assert_eq!(FtsQuery::parse("the").unwrap().score(&tokens), Some(3.0));
        assert_eq!(FtsQuery::parse("cat").unwrap().score(&tokens), None);
    }
}
