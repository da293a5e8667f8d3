//! Container matcher: identifies formats by the entries inside a ZIP archive
//!
//! A [`ContainerSignature`] lists entries that must be present, optionally
//! with a content prefix. A signature with no entries matches any readable
//! ZIP, which lets a generic ZIP format be outranked (through the priority
//! list) by the more specific formats built on it.

use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use tracing::trace;
use zip::ZipArchive;

use crate::core::{Hit, Matcher, MatcherType, SignatureSet};
use crate::error::{FormidError, FormidResult, PersistError};
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::source::Buffer;

/// Container structure understood by the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    #[default]
    Zip,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Zip => f.write_str("zip"),
        }
    }
}

/// A required entry. Names ending in `/` match any entry below that
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub name: String,
    pub content: Option<Vec<u8>>,
}

impl ContainerEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
        }
    }

    pub fn with_content(name: impl Into<String>, content: &[u8]) -> Self {
        Self {
            name: name.into(),
            content: Some(content.to_vec()),
        }
    }

    /// Archive names this entry may refer to, in sorted order. `names` must
    /// be sorted.
    fn candidates<'a>(&self, names: &'a [String]) -> &'a [String] {
        let start = names.partition_point(|n| n.as_str() < self.name.as_str());
        let rest = &names[start..];
        let len = if self.name.ends_with('/') {
            rest.partition_point(|n| n.starts_with(&self.name))
        } else {
            usize::from(rest.first().is_some_and(|n| *n == self.name))
        };
        &rest[..len]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSignature {
    pub kind: ContainerKind,
    pub entries: Vec<ContainerEntry>,
}

impl ContainerSignature {
    pub fn zip(entries: Vec<ContainerEntry>) -> Self {
        Self {
            kind: ContainerKind::Zip,
            entries,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Compiled {
    signatures: Vec<ContainerSignature>,
    priorities: PriorityList,
}

impl Compiled {
    fn scan(&self, data: &[u8]) -> Vec<Hit> {
        let mut archive = match ZipArchive::new(Cursor::new(data)) {
            Ok(archive) => archive,
            Err(err) => {
                trace!(error = %err, "not a zip container");
                return Vec::new();
            }
        };
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        let mut hits = Vec::new();
        for (index, signature) in self.signatures.iter().enumerate() {
            if let Some(basis) = Self::evaluate(signature, &mut archive, &names) {
                hits.push(Hit::new(index, basis));
            }
        }
        self.priorities.retain_hits(hits)
    }

    fn evaluate(
        signature: &ContainerSignature,
        archive: &mut ZipArchive<Cursor<&[u8]>>,
        names: &[String],
    ) -> Option<String> {
        if signature.entries.is_empty() {
            return Some(format!("container match {} structure", signature.kind));
        }
        let mut matched = Vec::with_capacity(signature.entries.len());
        for entry in &signature.entries {
            let mut candidates = entry.candidates(names).iter();
            let name = match &entry.content {
                None => candidates.next()?,
                Some(prefix) => candidates.find(|name| starts_with(archive, name, prefix))?,
            };
            matched.push(name.as_str());
        }
        Some(format!(
            "container match {} entries {}",
            signature.kind,
            matched.join(", ")
        ))
    }
}

/// Whether the named entry's content begins with `prefix`. Unreadable
/// entries never match.
fn starts_with(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str, prefix: &[u8]) -> bool {
    let file = match archive.by_name(name) {
        Ok(file) => file,
        Err(err) => {
            trace!(entry = name, error = %err, "unreadable container entry");
            return false;
        }
    };
    let mut head = Vec::with_capacity(prefix.len());
    match file.take(prefix.len() as u64).read_to_end(&mut head) {
        Ok(_) => head == prefix,
        Err(err) => {
            trace!(entry = name, error = %err, "unreadable container entry");
            false
        }
    }
}

/// Introspects ZIP containers on a worker thread.
#[derive(Debug, Clone)]
pub struct ContainerMatcher {
    compiled: Arc<Compiled>,
    result_buffer: usize,
}

impl Default for ContainerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerMatcher {
    /// Create an empty matcher
    pub fn new() -> Self {
        Self {
            compiled: Arc::new(Compiled::default()),
            result_buffer: 16,
        }
    }

    pub fn with_result_buffer(mut self, result_buffer: usize) -> Self {
        self.result_buffer = result_buffer.max(1);
        self
    }

    pub fn load(ls: &mut LoadSaver) -> Self {
        let mut compiled = Compiled::default();
        let len = ls.load_int();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let kind = match ls.load_byte() {
                0 => ContainerKind::Zip,
                tag => {
                    ls.set_err(PersistError::BadSignatureFile {
                        message: format!("unknown container kind {}", tag),
                    });
                    ContainerKind::Zip
                }
            };
            let count = ls.load_int();
            let mut entries = Vec::new();
            for _ in 0..count {
                if ls.err().is_some() {
                    break;
                }
                let name = ls.load_string();
                let content = ls.load_bool().then(|| ls.load_bytes());
                entries.push(ContainerEntry { name, content });
            }
            compiled.signatures.push(ContainerSignature { kind, entries });
        }
        compiled.priorities = PriorityList::load(ls);
        Self {
            compiled: Arc::new(compiled),
            result_buffer: 16,
        }
    }
}

impl Matcher for ContainerMatcher {
    fn matcher_type(&self) -> MatcherType {
        MatcherType::Container
    }

    fn identify(&self, _hint: &str, source: &Buffer) -> FormidResult<Receiver<Hit>> {
        let (tx, rx) = bounded(self.result_buffer);
        if source.is_empty() || self.compiled.signatures.is_empty() {
            return Ok(rx);
        }
        let compiled = Arc::clone(&self.compiled);
        let source = source.clone();
        thread::Builder::new()
            .name("formid-container".to_string())
            .spawn(move || {
                for hit in compiled.scan(source.as_slice()) {
                    if tx.send(hit).is_err() {
                        trace!("container matcher receiver dropped");
                        return;
                    }
                }
            })?;
        Ok(rx)
    }

    fn add(&mut self, set: SignatureSet, priorities: &PriorityList) -> FormidResult<usize> {
        let SignatureSet::Containers(signatures) = set else {
            return Err(FormidError::IncompatibleSignatureSet {
                matcher: "container",
                found: set.kind(),
            });
        };
        if signatures
            .iter()
            .flat_map(|s| &s.entries)
            .any(|e| e.name.is_empty())
        {
            return Err(FormidError::signature_data("container entry without a name"));
        }
        let compiled = Arc::make_mut(&mut self.compiled);
        let offset = compiled.signatures.len();
        compiled.signatures.extend(signatures);
        compiled.priorities.extend(&priorities.rebase(offset));
        Ok(compiled.signatures.len())
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_int(self.compiled.signatures.len() as u32);
        for signature in &self.compiled.signatures {
            ls.save_byte(match signature.kind {
                ContainerKind::Zip => 0,
            });
            ls.save_int(signature.entries.len() as u32);
            for entry in &signature.entries {
                ls.save_string(&entry.name);
                ls.save_bool(entry.content.is_some());
                if let Some(content) = &entry.content {
                    ls.save_bytes(content);
                }
            }
        }
        self.compiled.priorities.save(ls);
    }
}

impl fmt::Display for ContainerMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container matcher: {} signatures",
            self.compiled.signatures.len()
        )
    }
}

/// Build an in-memory ZIP with stored entries.
#[cfg(test)]
pub(crate) fn zip_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
