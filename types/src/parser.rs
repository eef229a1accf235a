//! Inline reference parser.
//!
//! Grammar: `@[<tag>:<value>]`. The tag is a run of ASCII lowercase letters
//! ending at the first colon; the value runs to the first unescaped `]`.
//! Inside a value `\]` and `\\` are escapes. References do not nest: an `@[`
//! inside an open value abandons the outer token and scanning restarts at the
//! inner one. Anything that does not form a valid token stays literal text.

use std::collections::HashMap;
use std::ops::Range;

use crate::reference::{GitHubIssueRef, Reference, ReferenceKind, Signature};

const OPEN: &str = "@[";

/// One reference occurrence with its byte span in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub reference: Reference,
    pub span: Range<usize>,
}

/// All occurrences of one distinct reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceGroup {
    pub signature: Signature,
    /// First occurrence; later occurrences may differ only in formatting.
    pub reference: Reference,
    pub spans: Vec<Range<usize>>,
}

enum Scan {
    Token { end: usize, tag: String, value: String },
    Literal { resume: usize },
}

/// Extract every well-formed reference, in source order.
#[must_use]
pub fn parse_references(text: &str) -> Vec<ParsedToken> {
    let mut tokens = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(OPEN) {
        let start = cursor + offset;
        match scan_token(text, start) {
            Scan::Token { end, tag, value } => {
                if let Some(reference) = build_reference(&tag, value, &text[start..end]) {
                    tokens.push(ParsedToken {
                        reference,
                        span: start..end,
                    });
                }
                cursor = end;
            }
            Scan::Literal { resume } => cursor = resume,
        }
    }

    tokens
}

/// Parse and collapse occurrences by signature, keeping first-seen order.
#[must_use]
pub fn group_references(text: &str) -> Vec<ReferenceGroup> {
    let mut groups: Vec<ReferenceGroup> = Vec::new();
    let mut index: HashMap<Signature, usize> = HashMap::new();

    for token in parse_references(text) {
        let signature = token.reference.signature();
        if let Some(&idx) = index.get(&signature) {
            groups[idx].spans.push(token.span);
        } else {
            index.insert(signature.clone(), groups.len());
            groups.push(ReferenceGroup {
                signature,
                reference: token.reference,
                spans: vec![token.span],
            });
        }
    }

    groups
}

/// True if the text still contains at least one well-formed reference.
#[must_use]
pub fn contains_references(text: &str) -> bool {
    !parse_references(text).is_empty()
}

fn scan_token(text: &str, start: usize) -> Scan {
    let body = start + OPEN.len();
    let literal = Scan::Literal { resume: start + 1 };

    let Some(colon_rel) = text[body..].find(':') else {
        return literal;
    };
    let tag = &text[body..body + colon_rel];
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_lowercase()) {
        return literal;
    }

    let value_start = body + colon_rel + 1;
    let mut value = String::new();
    let mut chars = text[value_start..].char_indices().peekable();

    while let Some((rel, ch)) = chars.next() {
        let pos = value_start + rel;
        match ch {
            ']' => {
                return Scan::Token {
                    end: pos + 1,
                    tag: tag.to_string(),
                    value,
                };
            }
            '\\' => match chars.peek() {
                Some(&(_, next @ (']' | '\\'))) => {
                    value.push(next);
                    chars.next();
                }
                _ => value.push('\\'),
            },
            '@' if text[pos..].starts_with(OPEN) => return Scan::Literal { resume: pos },
            '\n' | '\r' => return literal,
            other => value.push(other),
        }
    }

    literal
}

fn build_reference(tag: &str, value: String, raw: &str) -> Option<Reference> {
    let kind = ReferenceKind::from_tag(tag)?;
    let acceptable = match kind {
        ReferenceKind::GitHubIssue => GitHubIssueRef::parse(&value).is_some(),
        // An empty api value is kept so the resolver can apply the default endpoint rule.
        ReferenceKind::Api => true,
        ReferenceKind::File | ReferenceKind::Variable => !value.trim().is_empty(),
    };
    acceptable.then(|| Reference::new(kind, raw, value))
}
