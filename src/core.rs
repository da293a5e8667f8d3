//! Identification protocol: the contracts binding identifiers, recorders and
//! matchers.
//!
//! An [`Identifier`] is a loaded format registry. For every identification
//! session it hands out a fresh [`Recorder`], which accumulates [`Hit`]s
//! produced by each [`Matcher`] and finally reports [`Identification`]s.

use std::fmt;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::bytematcher::ByteSignature;
use crate::containermatcher::ContainerSignature;
use crate::error::FormidResult;
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::source::Buffer;
use crate::textmatcher::TextClass;
use crate::xmlmatcher::XmlSignature;

/// Which technique produced a hit.
///
/// The declaration order is the default execution order: cheap, name based
/// signals first, content scans last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MatcherType {
    Extension = 0,
    Mime = 1,
    Container = 2,
    Byte = 3,
    Text = 4,
    Xml = 5,
}

impl MatcherType {
    /// All matcher types in execution order.
    pub const ALL: [MatcherType; 6] = [
        MatcherType::Extension,
        MatcherType::Mime,
        MatcherType::Container,
        MatcherType::Byte,
        MatcherType::Text,
        MatcherType::Xml,
    ];

    /// Number of matcher types.
    pub const COUNT: usize = Self::ALL.len();

    /// Position of this type in [`MatcherType::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Persistence tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            MatcherType::Extension => "extension",
            MatcherType::Mime => "mime",
            MatcherType::Container => "container",
            MatcherType::Byte => "byte",
            MatcherType::Text => "text",
            MatcherType::Xml => "xml",
        }
    }

    /// True for the types that inspect file content rather than the name or
    /// MIME hint.
    pub fn is_content(self) -> bool {
        !matches!(self, MatcherType::Extension | MatcherType::Mime)
    }
}

impl fmt::Display for MatcherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A raw hit passed from a matcher to the recorders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    index: usize,
    basis: String,
}

impl Hit {
    pub fn new(index: usize, basis: impl Into<String>) -> Self {
        Self {
            index,
            basis: basis.into(),
        }
    }

    /// Index of the signature that fired, in the owning matcher's table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Human readable explanation of the match.
    pub fn basis(&self) -> &str {
        &self.basis
    }
}

/// Archive classification of an identified format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Archive {
    #[default]
    None,
    Zip,
    Gzip,
    Tar,
    Arc,
    Warc,
}

impl Archive {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Archive::Zip,
            2 => Archive::Gzip,
            3 => Archive::Tar,
            4 => Archive::Arc,
            5 => Archive::Warc,
            _ => Archive::None,
        }
    }

    pub fn is_archive(self) -> bool {
        self != Archive::None
    }
}

/// A compiled signature bundle handed to a matcher at build time.
///
/// Each matcher accepts exactly one shape; any other shape is rejected with
/// [`FormidError::IncompatibleSignatureSet`](crate::FormidError::IncompatibleSignatureSet).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SignatureSet {
    /// File extensions (`pdf`) or base name globs (`*.tar.gz`).
    Names(Vec<String>),
    Mimes(Vec<String>),
    Containers(Vec<ContainerSignature>),
    Bytes(Vec<ByteSignature>),
    Text(Vec<TextClass>),
    Xml(Vec<XmlSignature>),
}

impl SignatureSet {
    pub fn kind(&self) -> &'static str {
        match self {
            SignatureSet::Names(_) => "name",
            SignatureSet::Mimes(_) => "mime",
            SignatureSet::Containers(_) => "container",
            SignatureSet::Bytes(_) => "byte",
            SignatureSet::Text(_) => "text",
            SignatureSet::Xml(_) => "xml",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SignatureSet::Names(v) | SignatureSet::Mimes(v) => v.len(),
            SignatureSet::Containers(v) => v.len(),
            SignatureSet::Bytes(v) => v.len(),
            SignatureSet::Text(v) => v.len(),
            SignatureSet::Xml(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Final verdict of one recorder in one session.
pub trait Identification: fmt::Display + fmt::Debug + Send {
    /// Whether the identifier produced a match.
    fn known(&self) -> bool;

    /// Warning message, empty when there is none.
    fn warn(&self) -> &str;

    /// Long form suitable for YAML reports.
    fn yaml(&self) -> String;

    fn json(&self) -> String;

    fn csv(&self) -> Vec<String>;

    /// Archive classification of the matched format.
    fn archive(&self) -> Archive;
}

/// Channel half recorders report into.
pub type IdentificationSender = Sender<Box<dyn Identification>>;

/// Per-session, per-identifier evidence accumulator.
///
/// The engine calls [`Recorder::satisfied`] for a matcher type before that
/// type becomes active, then [`Recorder::active`], then zero or more
/// [`Recorder::record`] calls for that type. [`Recorder::report`] is called
/// once after every type has run or been skipped.
pub trait Recorder: Send {
    /// Record a hit. Returning true claims it: no later identifier in the
    /// session sees this hit.
    fn record(&mut self, mt: MatcherType, hit: &Hit) -> bool;

    /// Whether this recorder needs no results from `mt`.
    fn satisfied(&self, mt: MatcherType) -> bool;

    /// Send identifications. Returning marks this recorder's contribution as
    /// complete.
    fn report(&mut self, out: &IdentificationSender);

    /// Announce that results of type `mt` may follow.
    fn active(&mut self, mt: MatcherType);
}

/// A loaded format registry.
pub trait Identifier: fmt::Display + fmt::Debug + Send + Sync {
    /// Fresh recorder with independent state.
    fn recorder(&self) -> Box<dyn Recorder>;

    /// Name and details.
    fn describe(&self) -> [String; 2];

    /// Persist the identifier, starting with its registry tag.
    fn save(&self, ls: &mut LoadSaver);

    /// Does this identifier recognise result `index` from matcher `mt`?
    fn recognise(&self, mt: MatcherType, index: usize) -> (bool, String);
}

/// A pluggable matching technique.
///
/// `identify` may be called concurrently from many sessions once all `add`
/// calls are complete; the compiled table is read only from then on.
pub trait Matcher: fmt::Display + fmt::Debug + Send + Sync {
    fn matcher_type(&self) -> MatcherType;

    /// Start a scan and return the stream of hits. The stream closes when the
    /// scan is done; an empty closed stream means no match. Dropping the
    /// receiver early must stop the scan.
    fn identify(&self, hint: &str, source: &Buffer) -> FormidResult<Receiver<Hit>>;

    /// Add a signature set, returning the new total number of signatures.
    fn add(&mut self, set: SignatureSet, priorities: &PriorityList) -> FormidResult<usize>;

    fn save(&self, ls: &mut LoadSaver);
}

/// Stream of hits that were all found up front.
pub(crate) fn collected(hits: Vec<Hit>) -> Receiver<Hit> {
    let (tx, rx) = crossbeam_channel::bounded(hits.len().max(1));
    for hit in hits {
        // Capacity matches the number of hits, so this never blocks.
        let _ = tx.send(hit);
    }
    rx
}
