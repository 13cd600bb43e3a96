//! Byte-level regular-expression constraints.
//!
//! Patterns compile to a Thompson NFA over UTF-8 bytes, so a token that ends in the
//! middle of a multi-byte character is still matched correctly. The whole output must
//! match the pattern (implicitly anchored at both ends).
//!
//! Supported syntax: literals, `\`-escapes, `.`, `\d \w \s \D \W \S`, classes with
//! ranges and negation, groups (`(...)`, `(?:...)`), `|`, `*`, `+`, `?`, `{n}`, `{n,}`,
//! `{n,m}`. `choice` constraints are an alternation of JSON-listed literals.

use std::sync::Arc;

use super::constraint::{ConstraintCompiler, ConstraintEngine, TokenizerEnv};
use crate::errors::{GenError, Result};
use crate::kernels::TokenMask;

const MAX_REPEAT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteSet([u64; 4]);

impl ByteSet {
    const EMPTY: ByteSet = ByteSet([0; 4]);

    fn single(b: u8) -> Self {
        let mut set = Self::EMPTY;
        set.insert(b);
        set
    }

    fn range(lo: u8, hi: u8) -> Self {
        let mut set = Self::EMPTY;
        for b in lo..=hi {
            set.insert(b);
        }
        set
    }

    fn insert(&mut self, b: u8) {
        self.0[(b >> 6) as usize] |= 1 << (b & 63);
    }

    fn contains(&self, b: u8) -> bool {
        (self.0[(b >> 6) as usize] >> (b & 63)) & 1 == 1
    }

    fn union(mut self, other: ByteSet) -> Self {
        for (a, b) in self.0.iter_mut().zip(other.0) {
            *a |= b;
        }
        self
    }

    /// Complement within ASCII (`0x00..=0x7F`).
    fn ascii_complement(self) -> Self {
        ByteSet([!self.0[0], !self.0[1], 0, 0])
    }

    fn is_empty(&self) -> bool {
        self.0 == [0; 4]
    }
}

#[derive(Debug, Clone)]
enum Node {
    Empty,
    Set(ByteSet),
    Seq(Vec<Node>),
    Alt(Vec<Node>),
    Star(Box<Node>),
    Plus(Box<Node>),
    Opt(Box<Node>),
}

fn literal(c: char) -> Node {
    let mut buf = [0u8; 4];
    Node::Seq(
        c.encode_utf8(&mut buf)
            .bytes()
            .map(|b| Node::Set(ByteSet::single(b)))
            .collect(),
    )
}

fn literal_str(s: &str) -> Node {
    Node::Seq(s.bytes().map(|b| Node::Set(ByteSet::single(b))).collect())
}

/// Any well-formed multi-byte UTF-8 character.
fn multibyte_char() -> Node {
    let cont = || Node::Set(ByteSet::range(0x80, 0xBF));
    Node::Alt(vec![
        Node::Seq(vec![Node::Set(ByteSet::range(0xC2, 0xDF)), cont()]),
        Node::Seq(vec![Node::Set(ByteSet::range(0xE0, 0xEF)), cont(), cont()]),
        Node::Seq(vec![Node::Set(ByteSet::range(0xF0, 0xF4)), cont(), cont(), cont()]),
    ])
}

/// An ASCII set, or any character outside it when `negated`.
fn ascii_class(set: ByteSet, negated: bool) -> Node {
    if negated {
        Node::Alt(vec![Node::Set(set.ascii_complement()), multibyte_char()])
    } else {
        Node::Set(set)
    }
}

fn digit() -> ByteSet {
    ByteSet::range(b'0', b'9')
}

fn word() -> ByteSet {
    digit()
        .union(ByteSet::range(b'a', b'z'))
        .union(ByteSet::range(b'A', b'Z'))
        .union(ByteSet::single(b'_'))
}

fn space() -> ByteSet {
    [b' ', b'\t', b'\n', b'\r', 0x0B, 0x0C]
        .into_iter()
        .fold(ByteSet::EMPTY, |s, b| s.union(ByteSet::single(b)))
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn parse(pattern: &str) -> Result<Node> {
        let mut parser = Parser {
            chars: pattern.chars().collect(),
            pos: 0,
        };
        let node = parser.alternation()?;
        if parser.pos < parser.chars.len() {
            return Err(parser.error("unbalanced ')'"));
        }
        Ok(node)
    }

    fn error(&self, msg: &str) -> GenError {
        GenError::InvalidArgument(format!("regex error at {}: {}", self.pos, msg))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next(&mut self) -> Result<char> {
        let c = self.peek().ok_or_else(|| self.error("unexpected end of pattern"))?;
        self.pos += 1;
        Ok(c)
    }

    fn alternation(&mut self) -> Result<Node> {
        let mut branches = vec![self.concat()?];
        while self.eat('|') {
            branches.push(self.concat()?);
        }
        Ok(if branches.len() == 1 {
            branches.pop().unwrap_or(Node::Empty)
        } else {
            Node::Alt(branches)
        })
    }

    fn concat(&mut self) -> Result<Node> {
        let mut items = Vec::new();
        while let Some(c) = self.peek() {
            if c == '|' || c == ')' {
                break;
            }
            items.push(self.repeat()?);
        }
        Ok(match items.len() {
            0 => Node::Empty,
            1 => items.pop().unwrap_or(Node::Empty),
            _ => Node::Seq(items),
        })
    }

    fn repeat(&mut self) -> Result<Node> {
        let mut node = self.atom()?;
        loop {
            node = match self.peek() {
                Some('*') => Node::Star(Box::new(node)),
                Some('+') => Node::Plus(Box::new(node)),
                Some('?') => Node::Opt(Box::new(node)),
                Some('{') => {
                    self.pos += 1;
                    let (min, max) = self.bounds()?;
                    node = bounded(node, min, max);
                    continue;
                }
                _ => return Ok(node),
            };
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Result<Option<usize>> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map(Some)
            .map_err(|_| self.error("repeat count too large"))
    }

    /// `{n}`, `{n,}` or `{n,m}` after the opening brace.
    fn bounds(&mut self) -> Result<(usize, Option<usize>)> {
        let min = self.number()?.ok_or_else(|| self.error("expected repeat count"))?;
        let max = if self.eat(',') { self.number()? } else { Some(min) };
        if !self.eat('}') {
            return Err(self.error("expected '}'"));
        }
        if max.is_some_and(|m| m < min) || min.max(max.unwrap_or(0)) > MAX_REPEAT {
            return Err(self.error("invalid repeat bounds"));
        }
        Ok((min, max))
    }

    fn atom(&mut self) -> Result<Node> {
        match self.next()? {
            '(' => {
                if self.eat('?') && !self.eat(':') {
                    return Err(self.error("only (?:...) groups are supported"));
                }
                let inner = self.alternation()?;
                if !self.eat(')') {
                    return Err(self.error("missing ')'"));
                }
                Ok(inner)
            }
            '[' => self.class(),
            '.' => Ok(Node::Alt(vec![
                Node::Set(ByteSet::single(b'\n').ascii_complement()),
                multibyte_char(),
            ])),
            '^' | '$' => Ok(Node::Empty),
            '\\' => self.escape(),
            c @ ('*' | '+' | '?' | '{' | ')') => {
                Err(self.error(&format!("'{}' has nothing to repeat", c)))
            }
            c => Ok(literal(c)),
        }
    }

    fn escape(&mut self) -> Result<Node> {
        Ok(match self.next()? {
            'd' => Node::Set(digit()),
            'w' => Node::Set(word()),
            's' => Node::Set(space()),
            'D' => ascii_class(digit(), true),
            'W' => ascii_class(word(), true),
            'S' => ascii_class(space(), true),
            c => literal(escaped_char(c)),
        })
    }

    fn class(&mut self) -> Result<Node> {
        let negated = self.eat('^');
        let mut ascii = ByteSet::EMPTY;
        let mut wide: Vec<char> = Vec::new();
        let mut first = true;
        loop {
            let c = self.next()?;
            if c == ']' && !first {
                break;
            }
            first = false;
            let lo = if c == '\\' {
                match self.next()? {
                    'd' => {
                        ascii = ascii.union(digit());
                        continue;
                    }
                    'w' => {
                        ascii = ascii.union(word());
                        continue;
                    }
                    's' => {
                        ascii = ascii.union(space());
                        continue;
                    }
                    e => escaped_char(e),
                }
            } else {
                c
            };
            let hi = if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']') {
                self.pos += 1;
                match self.next()? {
                    '\\' => escaped_char(self.next()?),
                    h => h,
                }
            } else {
                lo
            };
            if lo > hi {
                return Err(self.error("class range out of order"));
            }
            if hi.is_ascii() {
                ascii = ascii.union(ByteSet::range(lo as u8, hi as u8));
            } else if lo == hi {
                wide.push(lo);
            } else {
                return Err(self.error("non-ASCII class ranges are not supported"));
            }
        }

        if negated {
            if !wide.is_empty() {
                return Err(self.error("negated classes must be ASCII"));
            }
            return Ok(ascii_class(ascii, true));
        }
        let mut branches = Vec::with_capacity(wide.len() + 1);
        if !ascii.is_empty() {
            branches.push(Node::Set(ascii));
        }
        branches.extend(wide.into_iter().map(literal));
        Ok(Node::Alt(branches))
    }
}

fn escaped_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    }
}

fn bounded(node: Node, min: usize, max: Option<usize>) -> Node {
    let mut items: Vec<Node> = std::iter::repeat(node.clone()).take(min).collect();
    match max {
        None => items.push(Node::Star(Box::new(node))),
        Some(max) => {
            items.extend(std::iter::repeat(Node::Opt(Box::new(node))).take(max - min));
        }
    }
    Node::Seq(items)
}

#[derive(Debug)]
enum State {
    Byte(ByteSet, usize),
    Split(Vec<usize>),
    Match,
}

const MATCH: usize = 0;

/// Thompson NFA over bytes. State sets are sorted lists of byte and match states.
#[derive(Debug)]
pub struct Nfa {
    states: Vec<State>,
    start: Vec<usize>,
}

impl Nfa {
    pub fn from_regex(pattern: &str) -> Result<Self> {
        Ok(Self::from_node(&Parser::parse(pattern)?))
    }

    /// Matches exactly one of `choices`.
    pub fn from_choices<S: AsRef<str>>(choices: &[S]) -> Result<Self> {
        if choices.is_empty() {
            return Err(GenError::invalid_argument("choice list is empty"));
        }
        Ok(Self::from_node(&Node::Alt(
            choices.iter().map(|c| literal_str(c.as_ref())).collect(),
        )))
    }

    fn from_node(node: &Node) -> Self {
        let mut nfa = Nfa {
            states: vec![State::Match],
            start: Vec::new(),
        };
        let entry = nfa.compile(node, MATCH);
        nfa.start = nfa.closure([entry]);
        nfa
    }

    fn push(&mut self, state: State) -> usize {
        self.states.push(state);
        self.states.len() - 1
    }

    /// Compile `node` so that matching it continues at `next`; returns the entry state.
    fn compile(&mut self, node: &Node, next: usize) -> usize {
        match node {
            Node::Empty => next,
            Node::Set(set) => self.push(State::Byte(*set, next)),
            Node::Seq(items) => items
                .iter()
                .rev()
                .fold(next, |cont, item| self.compile(item, cont)),
            Node::Alt(branches) => {
                let entries = branches.iter().map(|b| self.compile(b, next)).collect();
                self.push(State::Split(entries))
            }
            Node::Opt(inner) => {
                let entry = self.compile(inner, next);
                self.push(State::Split(vec![entry, next]))
            }
            Node::Star(inner) => {
                let loop_state = self.push(State::Split(Vec::new()));
                let entry = self.compile(inner, loop_state);
                self.states[loop_state] = State::Split(vec![entry, next]);
                loop_state
            }
            Node::Plus(inner) => {
                let loop_state = self.push(State::Split(Vec::new()));
                let entry = self.compile(inner, loop_state);
                self.states[loop_state] = State::Split(vec![entry, next]);
                entry
            }
        }
    }

    fn closure(&self, seeds: impl IntoIterator<Item = usize>) -> Vec<usize> {
        let mut seen = vec![false; self.states.len()];
        let mut stack: Vec<usize> = seeds.into_iter().collect();
        let mut out = Vec::new();
        while let Some(s) = stack.pop() {
            if std::mem::replace(&mut seen[s], true) {
                continue;
            }
            match &self.states[s] {
                State::Split(targets) => stack.extend(targets.iter().copied()),
                _ => out.push(s),
            }
        }
        out.sort_unstable();
        out
    }

    pub fn start(&self) -> &[usize] {
        &self.start
    }

    /// States reachable from `set` by consuming `byte`; empty when the byte is rejected.
    pub fn step(&self, set: &[usize], byte: u8) -> Vec<usize> {
        self.closure(set.iter().filter_map(|&s| match &self.states[s] {
            State::Byte(bytes, next) if bytes.contains(byte) => Some(*next),
            _ => None,
        }))
    }

    pub fn is_accepting(&self, set: &[usize]) -> bool {
        set.binary_search(&MATCH).is_ok()
    }

    /// True when `set` can consume at least one more byte.
    pub fn can_continue(&self, set: &[usize]) -> bool {
        set.iter()
            .any(|&s| matches!(self.states[s], State::Byte(..)))
    }

    pub fn matches(&self, input: &[u8]) -> bool {
        let mut set = self.start.clone();
        for &b in input {
            set = self.step(&set, b);
            if set.is_empty() {
                return false;
            }
        }
        self.is_accepting(&set)
    }
}

/// One row's regex matcher over token byte strings.
pub struct RegexConstraint {
    nfa: Arc<Nfa>,
    env: Arc<TokenizerEnv>,
    current: Vec<usize>,
    stopped: bool,
}

impl RegexConstraint {
    pub fn new(nfa: Arc<Nfa>, env: Arc<TokenizerEnv>) -> Self {
        let current = nfa.start().to_vec();
        Self {
            nfa,
            env,
            current,
            stopped: false,
        }
    }
}

impl ConstraintEngine for RegexConstraint {
    fn compute_mask(&mut self) -> Result<TokenMask> {
        let eos = self.env.eos_token();
        let mut mask = TokenMask::block_all(self.env.vocab_size());
        if self.stopped {
            mask.allow(eos);
            return Ok(mask);
        }
        let nfa = &self.nfa;
        self.env.trie().walk(
            self.current.clone(),
            |set, b| {
                let next = nfa.step(set, b);
                (!next.is_empty()).then_some(next)
            },
            |t| mask.allow(t),
        );
        if nfa.is_accepting(&self.current) || mask.num_allowed() == 0 {
            mask.allow(eos);
        }
        Ok(mask)
    }

    fn commit_token(&mut self, token: u32) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        if token == self.env.eos_token() {
            if !self.nfa.is_accepting(&self.current) && self.nfa.can_continue(&self.current) {
                return Err(GenError::InvalidArgument(
                    "end of sequence before the pattern is complete".into(),
                ));
            }
            self.stopped = true;
            return Ok(());
        }
        let bytes = self.env.token_bytes(token);
        if bytes.is_empty() {
            return Err(GenError::InvalidArgument(format!(
                "token {} has no bytes to match",
                token
            )));
        }
        let mut set = self.current.clone();
        for &b in bytes {
            set = self.nfa.step(&set, b);
            if set.is_empty() {
                return Err(GenError::InvalidArgument(format!(
                    "token {} violates the constraint",
                    token
                )));
            }
        }
        self.current = set;
        Ok(())
    }

    fn reset(&mut self) {
        self.current = self.nfa.start().to_vec();
        self.stopped = false;
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// `regex` guidance type.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexCompiler;

impl ConstraintCompiler for RegexCompiler {
    fn compile(&self, data: &str, env: &Arc<TokenizerEnv>) -> Result<Box<dyn ConstraintEngine>> {
        let nfa = Arc::new(Nfa::from_regex(data)?);
        Ok(Box::new(RegexConstraint::new(nfa, Arc::clone(env))))
    }
}

/// `choice` guidance type: data is a JSON array of strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChoiceCompiler;

impl ConstraintCompiler for ChoiceCompiler {
    fn compile(&self, data: &str, env: &Arc<TokenizerEnv>) -> Result<Box<dyn ConstraintEngine>> {
        let choices: Vec<String> = serde_json::from_str(data)
            .map_err(|e| GenError::InvalidArgument(format!("choice list: {}", e)))?;
        let nfa = Arc::new(Nfa::from_choices(&choices)?);
        Ok(Box::new(RegexConstraint::new(nfa, Arc::clone(env))))
    }
}
