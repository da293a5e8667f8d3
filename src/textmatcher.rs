//! Text matcher: classifies the leading window of a file as text
//!
//! The window is inspected for a byte order mark first. Without one, the
//! content counts as text when it decodes as UTF-8 and carries no control
//! bytes other than the usual whitespace. Pure ASCII content satisfies the
//! `utf8` and `any` classes as well.

use std::fmt;
use std::str::FromStr;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::core::{collected, Hit, Matcher, MatcherType, SignatureSet};
use crate::error::{FormidError, FormidResult, PersistError};
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::source::Buffer;

/// Detected or requested text encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextClass {
    /// Any text encoding.
    Any,
    Ascii,
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl TextClass {
    fn tag(self) -> u8 {
        match self {
            TextClass::Any => 0,
            TextClass::Ascii => 1,
            TextClass::Utf8 => 2,
            TextClass::Utf16Le => 3,
            TextClass::Utf16Be => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(TextClass::Any),
            1 => Some(TextClass::Ascii),
            2 => Some(TextClass::Utf8),
            3 => Some(TextClass::Utf16Le),
            4 => Some(TextClass::Utf16Be),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TextClass::Any => "any",
            TextClass::Ascii => "ascii",
            TextClass::Utf8 => "utf8",
            TextClass::Utf16Le => "utf16le",
            TextClass::Utf16Be => "utf16be",
        }
    }

    /// Whether content detected as `detected` satisfies a signature asking
    /// for `self`.
    pub fn accepts(self, detected: TextClass) -> bool {
        match self {
            TextClass::Any => true,
            TextClass::Utf8 => matches!(detected, TextClass::Utf8 | TextClass::Ascii),
            other => other == detected,
        }
    }
}

impl fmt::Display for TextClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextClass {
    type Err = FormidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "any" | "text" => Ok(TextClass::Any),
            "ascii" => Ok(TextClass::Ascii),
            "utf8" => Ok(TextClass::Utf8),
            "utf16le" => Ok(TextClass::Utf16Le),
            "utf16be" => Ok(TextClass::Utf16Be),
            _ => Err(FormidError::signature_data(format!(
                "unknown text class {:?}",
                s
            ))),
        }
    }
}

fn is_text_control(byte: u8) -> bool {
    matches!(byte, b'\t' | b'\n' | b'\r' | 0x0c)
}

/// Classify a window of content, returning `None` for binary data.
pub fn classify(window: &[u8]) -> Option<TextClass> {
    if window.is_empty() {
        return None;
    }
    if window.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Some(TextClass::Utf8);
    }
    if window.starts_with(&[0xFF, 0xFE]) {
        return Some(TextClass::Utf16Le);
    }
    if window.starts_with(&[0xFE, 0xFF]) {
        return Some(TextClass::Utf16Be);
    }
    if window
        .iter()
        .any(|&b| (b < 0x20 && !is_text_control(b)) || b == 0x7f)
    {
        return None;
    }
    if window.is_ascii() {
        return Some(TextClass::Ascii);
    }
    match std::str::from_utf8(window) {
        Ok(_) => Some(TextClass::Utf8),
        // A multi-byte sequence cut off by the window boundary is fine.
        Err(err) if err.error_len().is_none() => Some(TextClass::Utf8),
        Err(_) => None,
    }
}

#[derive(Debug, Clone)]
pub struct TextMatcher {
    classes: Vec<TextClass>,
    priorities: PriorityList,
    window: usize,
}

impl TextMatcher {
    pub fn new(window: usize) -> Self {
        Self {
            classes: Vec::new(),
            priorities: PriorityList::new(),
            window: window.max(1),
        }
    }

    pub fn load(ls: &mut LoadSaver) -> Self {
        let window = ls.load_usize();
        let len = ls.load_int();
        let mut classes = Vec::new();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let tag = ls.load_byte();
            match TextClass::from_tag(tag) {
                Some(class) => classes.push(class),
                None => ls.set_err(PersistError::BadSignatureFile {
                    message: format!("unknown text class {}", tag),
                }),
            }
        }
        let priorities = PriorityList::load(ls);
        Self {
            classes,
            priorities,
            window: window.max(1),
        }
    }
}

impl Matcher for TextMatcher {
    fn matcher_type(&self) -> MatcherType {
        MatcherType::Text
    }

    fn identify(&self, _hint: &str, source: &Buffer) -> FormidResult<Receiver<Hit>> {
        let Some(detected) = classify(source.bof(self.window)) else {
            return Ok(collected(Vec::new()));
        };
        let hits = self
            .classes
            .iter()
            .enumerate()
            .filter(|(_, class)| class.accepts(detected))
            .map(|(index, _)| Hit::new(index, format!("text match {}", detected)))
            .collect();
        Ok(collected(self.priorities.retain_hits(hits)))
    }

    fn add(&mut self, set: SignatureSet, priorities: &PriorityList) -> FormidResult<usize> {
        let SignatureSet::Text(classes) = set else {
            return Err(FormidError::IncompatibleSignatureSet {
                matcher: "text",
                found: set.kind(),
            });
        };
        self.priorities
            .extend(&priorities.rebase(self.classes.len()));
        self.classes.extend(classes);
        Ok(self.classes.len())
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_usize(self.window);
        ls.save_int(self.classes.len() as u32);
        for class in &self.classes {
            ls.save_byte(class.tag());
        }
        self.priorities.save(ls);
    }
}

impl fmt::Display for TextMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "text matcher: {} signatures", self.classes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(b"plain text\n"), Some(TextClass::Ascii));
        assert_eq!(classify("caf\u{e9}".as_bytes()), Some(TextClass::Utf8));
        assert_eq!(classify(b"\xEF\xBB\xBFhello"), Some(TextClass::Utf8));
        assert_eq!(classify(b"\xFF\xFEh\0i\0"), Some(TextClass::Utf16Le));
        assert_eq!(classify(b"\xFE\xFF\0h\0i"), Some(TextClass::Utf16Be));
        assert_eq!(classify(b"GIF89a\x01\x00"), None);
        assert_eq!(classify(b"\xC3\x28 invalid"), None);
        assert_eq!(classify(b""), None);
    }

    #[test]
    fn test_truncated_multibyte_at_window_edge() {
        let mut data = "text ".as_bytes().to_vec();
        data.extend_from_slice(&"\u{20ac}".as_bytes()[..2]);
        assert_eq!(classify(&data), Some(TextClass::Utf8));
    }

    #[test]
    fn test_accepts() {
        assert!(TextClass::Any.accepts(TextClass::Utf16Be));
        assert!(TextClass::Utf8.accepts(TextClass::Ascii));
        assert!(!TextClass::Ascii.accepts(TextClass::Utf8));
        assert_eq!("UTF-8".parse::<TextClass>().unwrap(), TextClass::Utf8);
        assert!("ebcdic".parse::<TextClass>().is_err());
    }

    #[test]
    fn test_identify() {
        let mut matcher = TextMatcher::new(4096);
        matcher
            .add(
                SignatureSet::Text(vec![TextClass::Any, TextClass::Utf16Le]),
                &PriorityList::new(),
            )
            .unwrap();

        let rx = matcher
            .identify("", &Buffer::from_bytes(b"hello world".to_vec()))
            .unwrap();
        let hits: Vec<Hit> = rx.iter().collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index(), 0);
        assert_eq!(hits[0].basis(), "text match ascii");

        let rx = matcher
            .identify("", &Buffer::from_bytes(b"\x00\x01\x02".to_vec()))
            .unwrap();
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_window_limits_classification() {
        let mut data = b"text header ".to_vec();
        data.extend_from_slice(&[0u8; 16]);
        let mut matcher = TextMatcher::new(8);
        matcher
            .add(SignatureSet::Text(vec![TextClass::Ascii]), &PriorityList::new())
            .unwrap();
        let rx = matcher.identify("", &Buffer::from_bytes(data)).unwrap();
        assert_eq!(rx.iter().count(), 1);
    }

    #[test]
    fn test_save_load() {
        let mut matcher = TextMatcher::new(512);
        matcher
            .add(
                SignatureSet::Text(vec![TextClass::Utf8, TextClass::Utf16Be]),
                &PriorityList::new(),
            )
            .unwrap();
        let mut ls = LoadSaver::saver();
        matcher.save(&mut ls);
        let mut ls = LoadSaver::loader(ls.into_bytes().unwrap());
        let loaded = TextMatcher::load(&mut ls);
        assert!(ls.err().is_none());
        assert_eq!(loaded.classes, matcher.classes);
        assert_eq!(loaded.window, 512);
    }
}
