//! Byte content matcher
//!
//! A [`ByteSignature`] is a conjunction of [`BytePattern`]s. Patterns are
//! anchored to the beginning of file, to the end of file, or float freely
//! anywhere in the content. Floating patterns of every signature are compiled
//! into a single Aho-Corasick automaton so the content is walked once per
//! scan.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use aho_corasick::AhoCorasick;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::{Hit, Matcher, MatcherType, SignatureSet};
use crate::error::{FormidError, FormidResult, PersistError};
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::source::Buffer;

/// Where a pattern is positioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    /// Offset counted from the first byte.
    #[default]
    Bof,
    /// Offset counted back from the last byte to the end of the pattern.
    Eof,
    /// Anywhere in the content.
    Var,
}

impl Anchor {
    fn tag(self) -> u8 {
        match self {
            Anchor::Bof => 0,
            Anchor::Eof => 1,
            Anchor::Var => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Anchor::Bof),
            1 => Some(Anchor::Eof),
            2 => Some(Anchor::Var),
            _ => None,
        }
    }
}

/// A byte sequence with optional wildcards (`None`) at a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern {
    pub anchor: Anchor,
    /// Minimum distance from the anchor.
    pub offset: usize,
    /// Additional slack: the pattern may start anywhere in
    /// `offset..=offset + range`.
    pub range: usize,
    pub sequence: Vec<Option<u8>>,
}

impl BytePattern {
    pub fn new(anchor: Anchor, offset: usize, bytes: &[u8]) -> Self {
        Self {
            anchor,
            offset,
            range: 0,
            sequence: bytes.iter().copied().map(Some).collect(),
        }
    }

    pub fn bof(offset: usize, bytes: &[u8]) -> Self {
        Self::new(Anchor::Bof, offset, bytes)
    }

    pub fn eof(offset: usize, bytes: &[u8]) -> Self {
        Self::new(Anchor::Eof, offset, bytes)
    }

    pub fn var(bytes: &[u8]) -> Self {
        Self::new(Anchor::Var, 0, bytes)
    }

    pub fn with_range(mut self, range: usize) -> Self {
        self.range = range;
        self
    }

    /// Parse a hex sequence such as `"25 50 44 46 ?? 2D"`; `??` is a
    /// single-byte wildcard.
    pub fn from_hex(anchor: Anchor, offset: usize, hex: &str) -> FormidResult<Self> {
        let digits: Vec<char> = hex.chars().filter(|c| !c.is_whitespace()).collect();
        if digits.is_empty() || digits.len() % 2 != 0 {
            return Err(FormidError::signature_data(format!(
                "hex sequence {:?} must hold a whole number of bytes",
                hex
            )));
        }
        let mut sequence = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let pair: String = pair.iter().collect();
            if pair == "??" {
                sequence.push(None);
            } else {
                sequence.push(Some(hex::decode(&pair)?[0]));
            }
        }
        Ok(Self {
            anchor,
            offset,
            range: 0,
            sequence,
        })
    }

    fn literal(&self) -> Option<Vec<u8>> {
        self.sequence.iter().copied().collect()
    }

    fn matches_at(&self, window: &[u8], start: usize) -> bool {
        start
            .checked_add(self.sequence.len())
            .and_then(|end| window.get(start..end))
            .is_some_and(|slice| {
                slice
                    .iter()
                    .zip(&self.sequence)
                    .all(|(byte, want)| want.map_or(true, |want| *byte == want))
            })
    }

    /// Start offset (relative to the whole source) of the first placement
    /// that matches, for anchored patterns.
    fn find_anchored(&self, source: &Buffer, bof_window: usize, eof_window: usize) -> Option<usize> {
        let len = self.sequence.len();
        match self.anchor {
            Anchor::Bof => {
                let window = source.bof(bof_window);
                (self.offset..=self.offset.saturating_add(self.range))
                    .take_while(|&start| fits(start, len, window.len()))
                    .find(|&start| self.matches_at(window, start))
            }
            Anchor::Eof => {
                let window = source.eof(eof_window);
                let base = source.len() - window.len();
                (self.offset..=self.offset.saturating_add(self.range))
                    .take_while(|&distance| fits(distance, len, window.len()))
                    .map(|distance| window.len() - distance - len)
                    .find(|&start| self.matches_at(window, start))
                    .map(|start| base + start)
            }
            Anchor::Var => None,
        }
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_byte(self.anchor.tag());
        ls.save_usize(self.offset);
        ls.save_usize(self.range);
        let bytes: Vec<u8> = self.sequence.iter().map(|b| b.unwrap_or(0)).collect();
        let mask: Vec<u8> = self.sequence.iter().map(|b| u8::from(b.is_some())).collect();
        ls.save_bytes(&bytes);
        ls.save_bytes(&mask);
    }

    fn load(ls: &mut LoadSaver) -> Self {
        let tag = ls.load_byte();
        let anchor = Anchor::from_tag(tag).unwrap_or_else(|| {
            ls.set_err(PersistError::BadSignatureFile {
                message: format!("unknown byte pattern anchor {}", tag),
            });
            Anchor::Bof
        });
        let offset = ls.load_usize();
        let range = ls.load_usize();
        let bytes = ls.load_bytes();
        let mask = ls.load_bytes();
        if bytes.len() != mask.len() {
            ls.set_err(PersistError::BadSignatureFile {
                message: "byte pattern mask length mismatch".to_string(),
            });
        }
        let sequence = bytes
            .iter()
            .zip(&mask)
            .map(|(&b, &m)| (m != 0).then_some(b))
            .collect();
        Self {
            anchor,
            offset,
            range,
            sequence,
        }
    }
}

/// Whether `len` bytes starting `at` bytes in fit inside `available`.
fn fits(at: usize, len: usize, available: usize) -> bool {
    at.checked_add(len).is_some_and(|end| end <= available)
}

/// All patterns must match for the signature to match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ByteSignature {
    pub patterns: Vec<BytePattern>,
}

impl ByteSignature {
    pub fn new(patterns: Vec<BytePattern>) -> Self {
        Self { patterns }
    }

    fn validate(&self) -> FormidResult<()> {
        if self.patterns.is_empty() {
            return Err(FormidError::signature_data("byte signature without patterns"));
        }
        for pattern in &self.patterns {
            if pattern.sequence.is_empty() {
                return Err(FormidError::signature_data("empty byte pattern"));
            }
            if pattern.anchor == Anchor::Var && pattern.literal().is_none() {
                return Err(FormidError::signature_data(
                    "floating byte patterns cannot contain wildcards",
                ));
            }
        }
        Ok(())
    }
}

/// Compiled, read-only table shared by every scan.
#[derive(Debug, Clone, Default)]
struct Compiled {
    signatures: Vec<ByteSignature>,
    /// Automaton pattern id -> (signature, pattern) it belongs to.
    floating: Vec<(usize, usize)>,
    automaton: Option<AhoCorasick>,
    priorities: PriorityList,
}

impl Compiled {
    fn rebuild_automaton(&mut self) -> FormidResult<()> {
        let mut floating = Vec::new();
        let mut literals = Vec::new();
        for (s, signature) in self.signatures.iter().enumerate() {
            for (p, pattern) in signature.patterns.iter().enumerate() {
                if pattern.anchor != Anchor::Var {
                    continue;
                }
                if let Some(literal) = pattern.literal() {
                    floating.push((s, p));
                    literals.push(literal);
                }
            }
        }
        self.automaton = if literals.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::new(&literals)
                    .map_err(|e| FormidError::signature_data(e.to_string()))?,
            )
        };
        self.floating = floating;
        Ok(())
    }

    /// First start offset of every floating pattern, keyed by automaton id.
    fn floating_offsets(&self, data: &[u8]) -> Vec<Option<usize>> {
        let mut offsets = vec![None; self.floating.len()];
        if let Some(automaton) = &self.automaton {
            for found in automaton.find_overlapping_iter(data) {
                let slot = &mut offsets[found.pattern().as_usize()];
                if slot.is_none() {
                    *slot = Some(found.start());
                }
            }
        }
        offsets
    }

    fn scan(&self, source: &Buffer, bof_window: usize, eof_window: usize) -> Vec<Hit> {
        let floating = self.floating_offsets(source.as_slice());
        let mut hits = Vec::new();
        for (s, signature) in self.signatures.iter().enumerate() {
            let mut spans = Vec::with_capacity(signature.patterns.len());
            let matched = signature.patterns.iter().enumerate().all(|(p, pattern)| {
                let start = match pattern.anchor {
                    Anchor::Var => self
                        .floating
                        .iter()
                        .position(|&key| key == (s, p))
                        .and_then(|id| floating[id]),
                    _ => pattern.find_anchored(source, bof_window, eof_window),
                };
                if let Some(start) = start {
                    spans.push(format!("{}..{}", start, start + pattern.sequence.len()));
                }
                start.is_some()
            });
            if matched {
                hits.push(Hit::new(s, format!("byte match at {}", spans.join(", "))));
            }
        }
        self.priorities.retain_hits(hits)
    }
}

/// Matches byte signatures against file content on a worker thread.
#[derive(Debug, Clone)]
pub struct ByteMatcher {
    compiled: Arc<Compiled>,
    bof_window: usize,
    eof_window: usize,
    result_buffer: usize,
}

impl ByteMatcher {
    pub fn new(bof_window: usize, eof_window: usize) -> Self {
        Self {
            compiled: Arc::new(Compiled::default()),
            bof_window,
            eof_window,
            result_buffer: 16,
        }
    }

    /// Capacity of the hit channel returned by `identify`.
    pub fn with_result_buffer(mut self, result_buffer: usize) -> Self {
        self.result_buffer = result_buffer.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.compiled.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.signatures.is_empty()
    }

    pub fn load(ls: &mut LoadSaver) -> Self {
        let bof_window = ls.load_usize();
        let eof_window = ls.load_usize();
        let mut compiled = Compiled::default();
        let len = ls.load_int();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let count = ls.load_int();
            let mut patterns = Vec::new();
            for _ in 0..count {
                if ls.err().is_some() {
                    break;
                }
                patterns.push(BytePattern::load(ls));
            }
            compiled.signatures.push(ByteSignature::new(patterns));
        }
        compiled.priorities = PriorityList::load(ls);
        if ls.err().is_none() {
            if let Err(err) = compiled.rebuild_automaton() {
                ls.set_err(PersistError::BadSignatureFile {
                    message: err.to_string(),
                });
            }
        }
        Self {
            compiled: Arc::new(compiled),
            bof_window,
            eof_window,
            result_buffer: 16,
        }
    }
}

impl ByteMatcher {
    /// Start a scan. The worker is `None` when there is nothing to scan.
    fn spawn_scan(
        &self,
        source: &Buffer,
    ) -> FormidResult<(Receiver<Hit>, Option<JoinHandle<usize>>)> {
        let (tx, rx) = bounded(self.result_buffer);
        if source.is_empty() || self.compiled.signatures.is_empty() {
            return Ok((rx, None));
        }
        let compiled = Arc::clone(&self.compiled);
        let source = source.clone();
        let (bof_window, eof_window) = (self.bof_window, self.eof_window);
        let worker = thread::Builder::new()
            .name("formid-byte".to_string())
            .spawn(move || send_hits(compiled.scan(&source, bof_window, eof_window), &tx))?;
        Ok((rx, Some(worker)))
    }
}

/// Send hits until the receiver goes away, returning how many were delivered.
fn send_hits(hits: Vec<Hit>, tx: &Sender<Hit>) -> usize {
    let mut delivered = 0;
    for hit in hits {
        if tx.send(hit).is_err() {
            trace!(delivered, "byte matcher receiver dropped");
            break;
        }
        delivered += 1;
    }
    delivered
}

impl Matcher for ByteMatcher {
    fn matcher_type(&self) -> MatcherType {
        MatcherType::Byte
    }

    fn identify(&self, _hint: &str, source: &Buffer) -> FormidResult<Receiver<Hit>> {
        let (rx, _worker) = self.spawn_scan(source)?;
        Ok(rx)
    }

    fn add(&mut self, set: SignatureSet, priorities: &PriorityList) -> FormidResult<usize> {
        let SignatureSet::Bytes(signatures) = set else {
            return Err(FormidError::IncompatibleSignatureSet {
                matcher: "byte",
                found: set.kind(),
            });
        };
        for signature in &signatures {
            signature.validate()?;
        }
        let compiled = Arc::make_mut(&mut self.compiled);
        let offset = compiled.signatures.len();
        compiled.signatures.extend(signatures);
        compiled.priorities.extend(&priorities.rebase(offset));
        compiled.rebuild_automaton()?;
        Ok(compiled.signatures.len())
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_usize(self.bof_window);
        ls.save_usize(self.eof_window);
        ls.save_int(self.compiled.signatures.len() as u32);
        for signature in &self.compiled.signatures {
            ls.save_int(signature.patterns.len() as u32);
            for pattern in &signature.patterns {
                pattern.save(ls);
            }
        }
        self.compiled.priorities.save(ls);
    }
}

impl fmt::Display for ByteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "byte matcher: {} signatures, {} floating patterns",
            self.compiled.signatures.len(),
            self.compiled.floating.len()
        )
    }
}
