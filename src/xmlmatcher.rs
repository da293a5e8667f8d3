//! XML matcher: identifies formats by the root element and its namespace
//!
//! Only the leading window of the content is parsed. The first start (or
//! empty) element is the root; its namespace is resolved from the `xmlns`
//! declarations carried on the element itself.

use std::fmt;

use crossbeam_channel::Receiver;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::{collected, Hit, Matcher, MatcherType, SignatureSet};
use crate::error::{FormidError, FormidResult};
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::source::Buffer;

/// Root element requirements. At least one of the fields must be set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XmlSignature {
    /// Local name of the root element.
    pub root: Option<String>,
    pub namespace: Option<String>,
}

impl XmlSignature {
    pub fn root(root: impl Into<String>) -> Self {
        Self {
            root: Some(root.into()),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn matches(&self, root: &RootElement) -> bool {
        self.root.as_ref().map_or(true, |want| *want == root.local)
            && self
                .namespace
                .as_ref()
                .map_or(true, |want| root.namespace.as_ref() == Some(want))
    }

    fn basis(&self) -> String {
        let mut parts = Vec::new();
        if let Some(root) = &self.root {
            parts.push(format!("root {}", root));
        }
        if let Some(namespace) = &self.namespace {
            parts.push(format!("ns {}", namespace));
        }
        format!("xml match {}", parts.join(", "))
    }
}

/// The root element found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootElement {
    pub local: String,
    pub namespace: Option<String>,
}

impl RootElement {
    fn from_start(start: &BytesStart<'_>) -> Self {
        let name = start.name();
        let local = String::from_utf8_lossy(name.local_name().as_ref()).into_owned();
        let wanted = match name.prefix() {
            Some(prefix) => {
                let mut key = b"xmlns:".to_vec();
                key.extend_from_slice(prefix.as_ref());
                key
            }
            None => b"xmlns".to_vec(),
        };
        let namespace = start
            .attributes()
            .flatten()
            .find(|attr| attr.key.as_ref() == wanted.as_slice())
            .map(|attr| String::from_utf8_lossy(&attr.value).into_owned());
        Self { local, namespace }
    }
}

/// Parse the root element out of `window`, or `None` if it holds no
/// well-formed element start.
pub fn root_element(window: &[u8]) -> Option<RootElement> {
    let mut reader = Reader::from_reader(window);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                return Some(RootElement::from_start(&start));
            }
            Ok(Event::Eof) => return None,
            Ok(Event::Text(text)) if !text.is_empty() => {
                trace!("text before root element");
                return None;
            }
            Ok(_) => {}
            Err(err) => {
                trace!(error = %err, "not an xml document");
                return None;
            }
        }
        buf.clear();
    }
}

#[derive(Debug, Clone)]
pub struct XmlMatcher {
    signatures: Vec<XmlSignature>,
    priorities: PriorityList,
    window: usize,
}

impl XmlMatcher {
    pub fn new(window: usize) -> Self {
        Self {
            signatures: Vec::new(),
            priorities: PriorityList::new(),
            window: window.max(1),
        }
    }

    pub fn load(ls: &mut LoadSaver) -> Self {
        let window = ls.load_usize();
        let len = ls.load_int();
        let mut signatures = Vec::new();
        for _ in 0..len {
            if ls.err().is_some() {
                break;
            }
            let root = ls.load_bool().then(|| ls.load_string());
            let namespace = ls.load_bool().then(|| ls.load_string());
            signatures.push(XmlSignature { root, namespace });
        }
        let priorities = PriorityList::load(ls);
        Self {
            signatures,
            priorities,
            window: window.max(1),
        }
    }
}

impl Matcher for XmlMatcher {
    fn matcher_type(&self) -> MatcherType {
        MatcherType::Xml
    }

    fn identify(&self, _hint: &str, source: &Buffer) -> FormidResult<Receiver<Hit>> {
        if self.signatures.is_empty() {
            return Ok(collected(Vec::new()));
        }
        let Some(root) = root_element(source.bof(self.window)) else {
            return Ok(collected(Vec::new()));
        };
        let hits = self
            .signatures
            .iter()
            .enumerate()
            .filter(|(_, signature)| signature.matches(&root))
            .map(|(index, signature)| Hit::new(index, signature.basis()))
            .collect();
        Ok(collected(self.priorities.retain_hits(hits)))
    }

    fn add(&mut self, set: SignatureSet, priorities: &PriorityList) -> FormidResult<usize> {
        let SignatureSet::Xml(signatures) = set else {
            return Err(FormidError::IncompatibleSignatureSet {
                matcher: "xml",
                found: set.kind(),
            });
        };
        if signatures
            .iter()
            .any(|s| s.root.is_none() && s.namespace.is_none())
        {
            return Err(FormidError::signature_data(
                "xml signature needs a root or a namespace",
            ));
        }
        self.priorities
            .extend(&priorities.rebase(self.signatures.len()));
        self.signatures.extend(signatures);
        Ok(self.signatures.len())
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_usize(self.window);
        ls.save_int(self.signatures.len() as u32);
        for signature in &self.signatures {
            for field in [&signature.root, &signature.namespace] {
                ls.save_bool(field.is_some());
                if let Some(value) = field {
                    ls.save_string(value);
                }
            }
        }
        self.priorities.save(ls);
    }
}

impl fmt::Display for XmlMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xml matcher: {} signatures", self.signatures.len())
    }
}
