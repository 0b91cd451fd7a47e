//! Minimal Turtle reader/writer for the bundle vocabulary.
//!
//! Covers exactly what session and preset files use: prefixed names, IRIs,
//! plain and `^^`-typed string literals, blank-node property lists and
//! object lists.  Triples survive a write/parse round-trip modulo order.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};

/// One RDF term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Iri(String),
    /// Document-scoped blank node id.
    Blank(usize),
    Literal {
        value: String,
        datatype: Option<String>,
    },
}

impl Term {
    pub fn iri(s: impl Into<String>) -> Term {
        Term::Iri(s.into())
    }

    pub fn plain(s: impl Into<String>) -> Term {
        Term::Literal {
            value: s.into(),
            datatype: None,
        }
    }

    pub fn typed(s: impl Into<String>, datatype: impl Into<String>) -> Term {
        Term::Literal {
            value: s.into(),
            datatype: Some(datatype.into()),
        }
    }

    pub fn as_iri(&self) -> Option<&str> {
        match self {
            Term::Iri(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Literal { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        self.as_str()?.parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_str()?.parse().ok()
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_str()?.parse().ok()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_str()? {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }
}

/// A parsed document: triples plus enough structure to query.
#[derive(Debug, Default)]
pub struct Doc {
    pub triples: Vec<(Term, String, Term)>,
}

impl Doc {
    /// All objects of (subject, predicate).
    pub fn objects<'a>(&'a self, subject: &'a Term, predicate: &str) -> impl Iterator<Item = &'a Term> {
        self.triples
            .iter()
            .filter(move |(s, p, _)| s == subject && p == predicate)
            .map(|(_, _, o)| o)
    }

    pub fn object<'a>(&'a self, subject: &'a Term, predicate: &str) -> Option<&'a Term> {
        self.objects(subject, predicate).next()
    }

    /// All subjects carrying rdf:type `type_iri`.
    pub fn subjects_of_type(&self, type_iri: &str) -> Vec<&Term> {
        self.triples
            .iter()
            .filter(|(_, p, o)| {
                p == "http://www.w3.org/1999/02/22-rdf-syntax-ns#type"
                    && o.as_iri() == Some(type_iri)
            })
            .map(|(s, _, _)| s)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Serialises triples with prefix abbreviation and blank-node nesting.
pub struct Writer {
    prefixes: Vec<(String, String)>,
    out: String,
}

impl Writer {
    pub fn new() -> Self {
        Writer {
            prefixes: Vec::new(),
            out: String::new(),
        }
    }

    pub fn prefix(mut self, name: &str, iri: &str) -> Self {
        self.prefixes.push((name.to_string(), iri.to_string()));
        self
    }

    fn abbrev(&self, iri: &str) -> String {
        for (name, base) in &self.prefixes {
            if let Some(local) = iri.strip_prefix(base.as_str())
                && !local.is_empty()
                && local
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return format!("{name}:{local}");
            }
        }
        format!("<{iri}>")
    }

    fn escape(value: &str) -> String {
        let mut s = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '"' => s.push_str("\\\""),
                '\\' => s.push_str("\\\\"),
                '\n' => s.push_str("\\n"),
                '\t' => s.push_str("\\t"),
                '\r' => s.push_str("\\r"),
                _ => s.push(c),
            }
        }
        s
    }

    fn term(&self, t: &Term) -> String {
        match t {
            Term::Iri(iri) => self.abbrev(iri),
            Term::Blank(id) => format!("_:b{id}"),
            Term::Literal { value, datatype } => match datatype {
                Some(dt) => format!("\"{}\"^^{}", Self::escape(value), self.abbrev(dt)),
                None => format!("\"{}\"", Self::escape(value)),
            },
        }
    }

    /// Begin a subject block.
    pub fn subject(&mut self, subject: &Term) -> SubjectWriter<'_> {
        let head = self.term(subject);
        SubjectWriter {
            w: self,
            head,
            props: Vec::new(),
        }
    }

    pub fn finish(mut self) -> String {
        let mut head = String::new();
        for (name, iri) in &self.prefixes {
            let _ = writeln!(head, "@prefix {name}: <{iri}> .");
        }
        head.push('\n');
        head.push_str(&self.out);
        self.out = String::new();
        head
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Object of a property being written: a term or a nested blank node.
pub enum Obj {
    Term(Term),
    Nested(Vec<(String, Obj)>),
}

impl Obj {
    pub fn iri(s: impl Into<String>) -> Obj {
        Obj::Term(Term::iri(s))
    }

    pub fn plain(s: impl Into<String>) -> Obj {
        Obj::Term(Term::plain(s))
    }

    pub fn typed(s: impl Into<String>, dt: impl Into<String>) -> Obj {
        Obj::Term(Term::typed(s, dt))
    }

    pub fn node(props: Vec<(String, Obj)>) -> Obj {
        Obj::Nested(props)
    }
}

pub struct SubjectWriter<'w> {
    w: &'w mut Writer,
    head: String,
    props: Vec<(String, Obj)>,
}

impl<'w> SubjectWriter<'w> {
    pub fn prop(mut self, predicate: &str, obj: Obj) -> Self {
        self.props.push((predicate.to_string(), obj));
        self
    }

    pub fn type_(self, type_iri: &str) -> Self {
        self.prop(
            "http://www.w3.org/1999/02/22-rdf-syntax-ns#type",
            Obj::iri(type_iri),
        )
    }

    pub fn end(self) {
        let SubjectWriter { w, head, props } = self;
        if props.is_empty() {
            return;
        }
        let mut block = String::new();
        block.push_str(&head);
        block.push('\n');
        let body = render_props(w, &props, 1);
        block.push_str(&body);
        block.push_str(" .\n\n");
        w.out.push_str(&block);
    }
}

fn render_props(w: &Writer, props: &[(String, Obj)], depth: usize) -> String {
    let indent = "\t".repeat(depth);
    let mut lines = Vec::new();
    for (pred, obj) in props {
        let p = if pred == "http://www.w3.org/1999/02/22-rdf-syntax-ns#type" {
            "a".to_string()
        } else {
            w.abbrev(pred)
        };
        let o = render_obj(w, obj, depth);
        lines.push(format!("{indent}{p} {o}"));
    }
    lines.join(" ;\n")
}

fn render_obj(w: &Writer, obj: &Obj, depth: usize) -> String {
    match obj {
        Obj::Term(t) => w.term(t),
        Obj::Nested(props) => {
            let body = render_props(w, props, depth + 1);
            let indent = "\t".repeat(depth);
            format!("[\n{body}\n{indent}]")
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Iri(String),
    Pname(String, String),
    BlankLabel(String),
    Literal(String),
    A,
    Semicolon,
    Comma,
    Dot,
    OpenBracket,
    CloseBracket,
    DoubleCaret,
    PrefixDecl,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if c == b'#' {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn next(&mut self) -> Result<Option<Tok>> {
        self.skip_ws();
        if self.pos >= self.src.len() {
            return Ok(None);
        }
        let c = self.src[self.pos];
        let tok = match c {
            b'<' => {
                let start = self.pos + 1;
                let end = start
                    + self.src[start..]
                        .iter()
                        .position(|&b| b == b'>')
                        .ok_or_else(|| Error::protocol("unterminated IRI"))?;
                self.pos = end + 1;
                Tok::Iri(String::from_utf8_lossy(&self.src[start..end]).into_owned())
            }
            b'"' => {
                let mut s = String::new();
                self.pos += 1;
                loop {
                    if self.pos >= self.src.len() {
                        return Err(Error::protocol("unterminated string literal"));
                    }
                    match self.src[self.pos] {
                        b'"' => {
                            self.pos += 1;
                            break;
                        }
                        b'\\' => {
                            self.pos += 1;
                            let esc = *self
                                .src
                                .get(self.pos)
                                .ok_or_else(|| Error::protocol("dangling escape"))?;
                            s.push(match esc {
                                b'n' => '\n',
                                b't' => '\t',
                                b'r' => '\r',
                                other => other as char,
                            });
                            self.pos += 1;
                        }
                        other => {
                            s.push(other as char);
                            self.pos += 1;
                        }
                    }
                }
                Tok::Literal(s)
            }
            b';' => {
                self.pos += 1;
                Tok::Semicolon
            }
            b',' => {
                self.pos += 1;
                Tok::Comma
            }
            b'.' => {
                self.pos += 1;
                Tok::Dot
            }
            b'[' => {
                self.pos += 1;
                Tok::OpenBracket
            }
            b']' => {
                self.pos += 1;
                Tok::CloseBracket
            }
            b'^' => {
                if self.src.get(self.pos + 1) == Some(&b'^') {
                    self.pos += 2;
                    Tok::DoubleCaret
                } else {
                    return Err(Error::protocol("stray '^'"));
                }
            }
            b'@' => {
                let start = self.pos;
                while self.pos < self.src.len() && !self.src[self.pos].is_ascii_whitespace() {
                    self.pos += 1;
                }
                let word = &self.src[start..self.pos];
                if word == b"@prefix" {
                    Tok::PrefixDecl
                } else {
                    return Err(Error::protocol("unsupported @-directive"));
                }
            }
            b'_' if self.src.get(self.pos + 1) == Some(&b':') => {
                let start = self.pos + 2;
                let mut end = start;
                while end < self.src.len() && is_name_byte(self.src[end]) {
                    end += 1;
                }
                self.pos = end;
                Tok::BlankLabel(String::from_utf8_lossy(&self.src[start..end]).into_owned())
            }
            _ => {
                // pname or the keyword 'a'
                let start = self.pos;
                let mut end = start;
                while end < self.src.len()
                    && (is_name_byte(self.src[end]) || self.src[end] == b':')
                {
                    end += 1;
                }
                if end == start {
                    return Err(Error::protocol(format!(
                        "unexpected character '{}'",
                        c as char
                    )));
                }
                self.pos = end;
                let word = String::from_utf8_lossy(&self.src[start..end]).into_owned();
                if word == "a" {
                    Tok::A
                } else if let Some(colon) = word.find(':') {
                    Tok::Pname(word[..colon].to_string(), word[colon + 1..].to_string())
                } else {
                    return Err(Error::protocol(format!("bare word '{word}'")));
                }
            }
        };
        Ok(Some(tok))
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.'
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    prefixes: HashMap<String, String>,
    doc: Doc,
    next_blank: usize,
    blank_labels: HashMap<String, usize>,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Result<Tok> {
        let t = self
            .toks
            .get(self.pos)
            .cloned()
            .ok_or_else(|| Error::protocol("unexpected end of turtle document"))?;
        self.pos += 1;
        Ok(t)
    }

    fn expect(&mut self, tok: Tok) -> Result<()> {
        let got = self.bump()?;
        if got != tok {
            return Err(Error::protocol(format!("expected {tok:?}, got {got:?}")));
        }
        Ok(())
    }

    fn expand(&self, prefix: &str, local: &str) -> Result<String> {
        let base = self
            .prefixes
            .get(prefix)
            .ok_or_else(|| Error::protocol(format!("unknown prefix '{prefix}:'")))?;
        Ok(format!("{base}{local}"))
    }

    fn fresh_blank(&mut self) -> usize {
        self.next_blank += 1;
        self.next_blank - 1
    }

    fn parse(&mut self) -> Result<()> {
        while self.peek().is_some() {
            if self.peek() == Some(&Tok::PrefixDecl) {
                self.bump()?;
                let (name, empty) = match self.bump()? {
                    Tok::Pname(name, local) if local.is_empty() => (name, true),
                    other => {
                        return Err(Error::protocol(format!(
                            "bad prefix declaration: {other:?}"
                        )));
                    }
                };
                debug_assert!(empty);
                let iri = match self.bump()? {
                    Tok::Iri(iri) => iri,
                    other => return Err(Error::protocol(format!("bad prefix IRI: {other:?}"))),
                };
                self.expect(Tok::Dot)?;
                self.prefixes.insert(name, iri);
                continue;
            }

            let subject = self.parse_term_as_subject()?;
            self.parse_predicate_object_list(&subject)?;
            self.expect(Tok::Dot)?;
        }
        Ok(())
    }

    fn parse_term_as_subject(&mut self) -> Result<Term> {
        match self.bump()? {
            Tok::Iri(iri) => Ok(Term::Iri(iri)),
            Tok::Pname(p, l) => Ok(Term::Iri(self.expand(&p, &l)?)),
            Tok::BlankLabel(label) => {
                let id = *self
                    .blank_labels
                    .entry(label)
                    .or_insert_with(|| self.doc.triples.len() + 100_000);
                Ok(Term::Blank(id))
            }
            Tok::OpenBracket => {
                let id = self.fresh_blank();
                let node = Term::Blank(id);
                if self.peek() != Some(&Tok::CloseBracket) {
                    self.parse_predicate_object_list(&node)?;
                }
                self.expect(Tok::CloseBracket)?;
                Ok(node)
            }
            other => Err(Error::protocol(format!("bad subject: {other:?}"))),
        }
    }

    fn parse_predicate_object_list(&mut self, subject: &Term) -> Result<()> {
        loop {
            let predicate = match self.bump()? {
                Tok::A => "http://www.w3.org/1999/02/22-rdf-syntax-ns#type".to_string(),
                Tok::Iri(iri) => iri,
                Tok::Pname(p, l) => self.expand(&p, &l)?,
                other => return Err(Error::protocol(format!("bad predicate: {other:?}"))),
            };

            loop {
                let object = self.parse_object()?;
                self.doc
                    .triples
                    .push((subject.clone(), predicate.clone(), object));
                if self.peek() == Some(&Tok::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }

            if self.peek() == Some(&Tok::Semicolon) {
                self.bump()?;
                // Trailing semicolon before '.' or ']' is legal.
                if matches!(self.peek(), Some(&Tok::Dot) | Some(&Tok::CloseBracket)) {
                    break;
                }
                continue;
            }
            break;
        }
        Ok(())
    }

    fn parse_object(&mut self) -> Result<Term> {
        match self.bump()? {
            Tok::Iri(iri) => Ok(Term::Iri(iri)),
            Tok::Pname(p, l) => Ok(Term::Iri(self.expand(&p, &l)?)),
            Tok::BlankLabel(label) => {
                let id = *self
                    .blank_labels
                    .entry(label)
                    .or_insert_with(|| self.doc.triples.len() + 100_000);
                Ok(Term::Blank(id))
            }
            Tok::Literal(value) => {
                if self.peek() == Some(&Tok::DoubleCaret) {
                    self.bump()?;
                    let dt = match self.bump()? {
                        Tok::Iri(iri) => iri,
                        Tok::Pname(p, l) => self.expand(&p, &l)?,
                        other => {
                            return Err(Error::protocol(format!("bad datatype: {other:?}")));
                        }
                    };
                    Ok(Term::Literal {
                        value,
                        datatype: Some(dt),
                    })
                } else {
                    Ok(Term::Literal {
                        value,
                        datatype: None,
                    })
                }
            }
            Tok::OpenBracket => {
                let id = self.fresh_blank();
                let node = Term::Blank(id);
                if self.peek() != Some(&Tok::CloseBracket) {
                    self.parse_predicate_object_list(&node)?;
                }
                self.expect(Tok::CloseBracket)?;
                Ok(node)
            }
            other => Err(Error::protocol(format!("bad object: {other:?}"))),
        }
    }
}

/// Parse a Turtle document into triples.
pub fn parse(src: &str) -> Result<Doc> {
    let mut lexer = Lexer::new(src);
    let mut toks = Vec::new();
    while let Some(t) = lexer.next()? {
        toks.push(t);
    }
    let mut parser = Parser {
        toks,
        pos: 0,
        prefixes: HashMap::new(),
        doc: Doc::default(),
        next_blank: 0,
        blank_labels: HashMap::new(),
    };
    parser.parse()?;
    Ok(parser.doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub const XSD: &str = "http://www.w3.org/2001/XMLSchema#";

    #[test]
    fn writer_and_parser_roundtrip() {
        let mut w = Writer::new()
            .prefix("spod", "http://open-music-kontrollers.ch/lv2/synthpod#")
            .prefix("xsd", XSD);
        w.subject(&Term::iri("urn:uuid:abc"))
            .type_("http://open-music-kontrollers.ch/lv2/synthpod#graph")
            .prop(
                "http://open-music-kontrollers.ch/lv2/synthpod#modulePositionX",
                Obj::typed("12.5", format!("{XSD}float")),
            )
            .prop(
                "http://open-music-kontrollers.ch/lv2/synthpod#moduleAlias",
                Obj::plain("my \"favourite\" amp"),
            )
            .prop(
                "http://open-music-kontrollers.ch/lv2/synthpod#connectionList",
                Obj::node(vec![
                    (
                        "http://open-music-kontrollers.ch/lv2/synthpod#sourceSymbol".into(),
                        Obj::plain("audio_out_1"),
                    ),
                    (
                        "http://open-music-kontrollers.ch/lv2/synthpod#sinkSymbol".into(),
                        Obj::plain("audio_in_1"),
                    ),
                ]),
            )
            .end();
        let text = w.finish();

        let doc = parse(&text).unwrap();
        let subject = Term::iri("urn:uuid:abc");
        assert_eq!(
            doc.object(
                &subject,
                "http://open-music-kontrollers.ch/lv2/synthpod#modulePositionX"
            )
            .and_then(|t| t.as_f32()),
            Some(12.5)
        );
        assert_eq!(
            doc.object(
                &subject,
                "http://open-music-kontrollers.ch/lv2/synthpod#moduleAlias"
            )
            .and_then(|t| t.as_str()),
            Some("my \"favourite\" amp")
        );

        // The nested node is reachable through the connectionList property.
        let node = doc
            .object(
                &subject,
                "http://open-music-kontrollers.ch/lv2/synthpod#connectionList",
            )
            .unwrap()
            .clone();
        assert_eq!(
            doc.object(
                &node,
                "http://open-music-kontrollers.ch/lv2/synthpod#sourceSymbol"
            )
            .and_then(|t| t.as_str()),
            Some("audio_out_1")
        );
    }

    #[test]
    fn parses_comments_and_multiple_objects() {
        let src = r#"
@prefix ex: <http://example.org/> .
# a comment
ex:s ex:p ex:o1 , ex:o2 ;
     ex:q "plain" .
"#;
        let doc = parse(src).unwrap();
        let s = Term::iri("http://example.org/s");
        let objs: Vec<_> = doc.objects(&s, "http://example.org/p").collect();
        assert_eq!(objs.len(), 2);
        assert_eq!(
            doc.object(&s, "http://example.org/q").and_then(|t| t.as_str()),
            Some("plain")
        );
    }

    #[test]
    fn unknown_prefix_is_an_error() {
        assert!(parse("nope:s nope:p nope:o .").is_err());
    }
}
