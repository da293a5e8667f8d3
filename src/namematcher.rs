//! Name based matchers: file extensions, filename globs and MIME strings

use std::collections::HashMap;
use std::fmt;

use crossbeam_channel::Receiver;
use regex::Regex;

use crate::core::{collected, Hit, Matcher, MatcherType, SignatureSet};
use crate::error::{FormidError, FormidResult, PersistError};
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::source::Buffer;

/// Matches the base name of a file against extensions and glob patterns.
#[derive(Debug, Default, Clone)]
pub struct ExtensionMatcher {
    extensions: HashMap<String, Vec<usize>>,
    globs: Vec<Glob>,
    priorities: PriorityList,
    total: usize,
}

#[derive(Debug, Clone)]
struct Glob {
    pattern: String,
    regex: Regex,
    index: usize,
}

impl Glob {
    fn compile(pattern: &str, index: usize) -> FormidResult<Self> {
        let mut source = String::from("(?i)^");
        for c in pattern.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                c => source.push_str(&regex::escape(&c.to_string())),
            }
        }
        source.push('$');
        Ok(Glob {
            pattern: pattern.to_string(),
            regex: Regex::new(&source)?,
            index,
        })
    }
}

/// Base name of a path, accepting both separators.
fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Lowercase extension of a base name, if any.
fn extension(base: &str) -> Option<String> {
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}

/// A validated name signature, ready to insert.
enum NameEntry {
    Extension(String, usize),
    Glob(Glob),
}

impl NameEntry {
    fn compile(name: &str, index: usize) -> FormidResult<Self> {
        let name = name.trim();
        let plain = name
            .strip_prefix("*.")
            .filter(|rest| !rest.contains(['*', '?', '.']))
            .or_else(|| name.strip_prefix('.'))
            .unwrap_or(name);
        if plain.is_empty() {
            return Err(FormidError::signature_data("empty extension signature"));
        }
        if plain.contains(['*', '?']) {
            Ok(NameEntry::Glob(Glob::compile(plain, index)?))
        } else if plain.contains('.') {
            // Compound extensions never equal the last dotted component.
            Ok(NameEntry::Glob(Glob::compile(&format!("*.{}", plain), index)?))
        } else {
            Ok(NameEntry::Extension(plain.to_lowercase(), index))
        }
    }
}

impl ExtensionMatcher {
    /// Create an empty matcher
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, entry: NameEntry) {
        match entry {
            NameEntry::Extension(ext, index) => self.extensions.entry(ext).or_default().push(index),
            NameEntry::Glob(glob) => self.globs.push(glob),
        }
    }

    fn matches(&self, name: &str) -> Vec<Hit> {
        let base = base_name(name);
        if base.is_empty() {
            return Vec::new();
        }
        let mut hits = Vec::new();
        if let Some(ext) = extension(base) {
            if let Some(indexes) = self.extensions.get(&ext) {
                hits.extend(
                    indexes
                        .iter()
                        .map(|&index| Hit::new(index, format!("extension match {}", ext))),
                );
            }
        }
        for glob in &self.globs {
            if glob.regex.is_match(base) {
                hits.push(Hit::new(glob.index, format!("glob match {}", glob.pattern)));
            }
        }
        self.priorities.retain_hits(hits)
    }

    pub fn load(ls: &mut LoadSaver) -> Self {
        let mut matcher = ExtensionMatcher::new();
        matcher.total = ls.load_usize();
        let len = ls.load_int();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let ext = ls.load_string();
            matcher.extensions.insert(ext, ls.load_ints());
        }
        let len = ls.load_int();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let pattern = ls.load_string();
            let index = ls.load_usize();
            match Glob::compile(&pattern, index) {
                Ok(glob) => matcher.globs.push(glob),
                Err(err) => ls.set_err(PersistError::BadSignatureFile {
                    message: err.to_string(),
                }),
            }
        }
        matcher.priorities = PriorityList::load(ls);
        matcher
    }
}

impl Matcher for ExtensionMatcher {
    fn matcher_type(&self) -> MatcherType {
        MatcherType::Extension
    }

    fn identify(&self, hint: &str, _source: &Buffer) -> FormidResult<Receiver<Hit>> {
        Ok(collected(self.matches(hint)))
    }

    fn add(&mut self, set: SignatureSet, priorities: &PriorityList) -> FormidResult<usize> {
        let SignatureSet::Names(names) = set else {
            return Err(FormidError::IncompatibleSignatureSet {
                matcher: "extension",
                found: set.kind(),
            });
        };
        let offset = self.total;
        let entries = names
            .iter()
            .enumerate()
            .map(|(i, name)| NameEntry::compile(name, offset + i))
            .collect::<FormidResult<Vec<_>>>()?;
        for entry in entries {
            self.insert(entry);
        }
        self.priorities.extend(&priorities.rebase(offset));
        self.total += names.len();
        Ok(self.total)
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_usize(self.total);
        let mut extensions: Vec<_> = self.extensions.iter().collect();
        extensions.sort();
        ls.save_int(extensions.len() as u32);
        for (ext, indexes) in extensions {
            ls.save_string(ext);
            ls.save_ints(indexes);
        }
        ls.save_int(self.globs.len() as u32);
        for glob in &self.globs {
            ls.save_string(&glob.pattern);
            ls.save_usize(glob.index);
        }
        self.priorities.save(ls);
    }
}

impl fmt::Display for ExtensionMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "extension matcher: {} signatures ({} extensions, {} globs)",
            self.total,
            self.extensions.len(),
            self.globs.len()
        )
    }
}

/// Matches a MIME hint, ignoring case and parameters.
#[derive(Debug, Default, Clone)]
pub struct MimeMatcher {
    mimes: HashMap<String, Vec<usize>>,
    priorities: PriorityList,
    total: usize,
}

fn normalise_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_lowercase()
}

impl MimeMatcher {
    /// Create an empty matcher
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self, mime: &str) -> Vec<Hit> {
        let mime = normalise_mime(mime);
        if mime.is_empty() {
            return Vec::new();
        }
        let hits = self
            .mimes
            .get(&mime)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&index| Hit::new(index, format!("mime match {}", mime)))
                    .collect()
            })
            .unwrap_or_default();
        self.priorities.retain_hits(hits)
    }

    pub fn load(ls: &mut LoadSaver) -> Self {
        let mut matcher = MimeMatcher::new();
        matcher.total = ls.load_usize();
        let len = ls.load_int();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let mime = ls.load_string();
            matcher.mimes.insert(mime, ls.load_ints());
        }
        matcher.priorities = PriorityList::load(ls);
        matcher
    }
}

impl Matcher for MimeMatcher {
    fn matcher_type(&self) -> MatcherType {
        MatcherType::Mime
    }

    fn identify(&self, hint: &str, _source: &Buffer) -> FormidResult<Receiver<Hit>> {
        Ok(collected(self.matches(hint)))
    }

    fn add(&mut self, set: SignatureSet, priorities: &PriorityList) -> FormidResult<usize> {
        let SignatureSet::Mimes(mimes) = set else {
            return Err(FormidError::IncompatibleSignatureSet {
                matcher: "mime",
                found: set.kind(),
            });
        };
        let offset = self.total;
        let normalised = mimes
            .iter()
            .map(|mime| match normalise_mime(mime) {
                mime if mime.is_empty() => {
                    Err(FormidError::signature_data("empty MIME signature"))
                }
                mime => Ok(mime),
            })
            .collect::<FormidResult<Vec<_>>>()?;
        for (i, mime) in normalised.into_iter().enumerate() {
            self.mimes.entry(mime).or_default().push(offset + i);
        }
        self.priorities.extend(&priorities.rebase(offset));
        self.total += mimes.len();
        Ok(self.total)
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_usize(self.total);
        let mut mimes: Vec<_> = self.mimes.iter().collect();
        mimes.sort();
        ls.save_int(mimes.len() as u32);
        for (mime, indexes) in mimes {
            ls.save_string(mime);
            ls.save_ints(indexes);
        }
        self.priorities.save(ls);
    }
}

impl fmt::Display for MimeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mime matcher: {} signatures", self.total)
    }
}
