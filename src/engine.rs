//! Identification engine
//!
//! The engine owns one matcher per [`MatcherType`] and an ordered list of
//! identifiers. A session runs the matcher stages in type order, skipping a
//! stage when every recorder is already satisfied for it, and hands each hit
//! to the recorders in identifier order until one claims it.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver};
use tracing::{debug, trace, warn};

use crate::bytematcher::ByteMatcher;
use crate::config::Config;
use crate::containermatcher::ContainerMatcher;
use crate::core::{
    Identification, IdentificationSender, Identifier, Matcher, MatcherType, Recorder,
    SignatureSet,
};
use crate::error::{FormidError, FormidResult, PersistError};
use crate::format::FormatDatabase;
use crate::identifier::FormatIdentifier;
use crate::namematcher::{ExtensionMatcher, MimeMatcher};
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::registry::Registry;
use crate::source::Buffer;
use crate::textmatcher::TextMatcher;
use crate::xmlmatcher::XmlMatcher;

/// Leading bytes of a saved signature file.
pub const SIGNATURE_MAGIC: &[u8; 4] = b"FMID";
/// Signature file layout version.
pub const SIGNATURE_VERSION: u8 = 1;

/// One matcher slot per matcher type.
#[derive(Debug, Default)]
pub struct Matchers {
    slots: [Option<Box<dyn Matcher>>; MatcherType::COUNT],
}

impl Matchers {
    /// Create a collection with no matchers
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in matcher for every type, sized from `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut matchers = Self::new();
        matchers.insert(Box::new(ExtensionMatcher::new()));
        matchers.insert(Box::new(MimeMatcher::new()));
        matchers.insert(Box::new(
            ContainerMatcher::new().with_result_buffer(config.result_buffer),
        ));
        matchers.insert(Box::new(
            ByteMatcher::new(config.bof_window, config.eof_window)
                .with_result_buffer(config.result_buffer),
        ));
        matchers.insert(Box::new(TextMatcher::new(config.text_window)));
        matchers.insert(Box::new(XmlMatcher::new(config.xml_window)));
        matchers
    }

    /// Put `matcher` in the slot for its type, returning the previous one.
    pub fn insert(&mut self, matcher: Box<dyn Matcher>) -> Option<Box<dyn Matcher>> {
        let slot = matcher.matcher_type().index();
        self.slots[slot].replace(matcher)
    }

    pub fn get(&self, mt: MatcherType) -> Option<&dyn Matcher> {
        self.slots[mt.index()].as_deref()
    }

    pub fn contains(&self, mt: MatcherType) -> bool {
        self.slots[mt.index()].is_some()
    }

    /// Add a signature set to the matcher for `mt`.
    pub fn add(
        &mut self,
        mt: MatcherType,
        set: SignatureSet,
        priorities: &PriorityList,
    ) -> FormidResult<usize> {
        match self.slots[mt.index()].as_mut() {
            Some(matcher) => matcher.add(set, priorities),
            None => Err(FormidError::configuration(format!(
                "no {} matcher to add signatures to",
                mt
            ))),
        }
    }

    pub fn save(&self, ls: &mut LoadSaver) {
        let present: Vec<&dyn Matcher> = self.slots.iter().flatten().map(Box::as_ref).collect();
        ls.save_byte(present.len() as u8);
        for matcher in present {
            ls.save_byte(matcher.matcher_type().tag());
            ls.save_nested(|child| matcher.save(child));
        }
    }

    /// Load the matchers saved by [`Matchers::save`]. Any error is left on
    /// `ls`.
    pub fn load(ls: &mut LoadSaver, config: &Config) -> Self {
        let mut matchers = Self::new();
        let count = ls.load_byte();
        for _ in 0..count {
            if ls.err().is_some() {
                break;
            }
            let tag = ls.load_byte();
            let mut child = ls.load_nested();
            let matcher: Box<dyn Matcher> = match MatcherType::from_tag(tag) {
                Some(MatcherType::Extension) => Box::new(ExtensionMatcher::load(&mut child)),
                Some(MatcherType::Mime) => Box::new(MimeMatcher::load(&mut child)),
                Some(MatcherType::Container) => Box::new(
                    ContainerMatcher::load(&mut child).with_result_buffer(config.result_buffer),
                ),
                Some(MatcherType::Byte) => Box::new(
                    ByteMatcher::load(&mut child).with_result_buffer(config.result_buffer),
                ),
                Some(MatcherType::Text) => Box::new(TextMatcher::load(&mut child)),
                Some(MatcherType::Xml) => Box::new(XmlMatcher::load(&mut child)),
                None => {
                    ls.set_err(PersistError::BadMatcherType { tag });
                    break;
                }
            };
            if let Some(err) = child.err() {
                ls.set_err(err.clone());
                break;
            }
            matchers.insert(matcher);
        }
        matchers
    }
}

impl fmt::Display for Matchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for matcher in self.slots.iter().flatten() {
            writeln!(f, "{}", matcher)?;
        }
        Ok(())
    }
}

/// What happened to each stage of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Stages whose matcher was invoked.
    pub ran: Vec<MatcherType>,
    /// Stages skipped because every recorder was satisfied or no matcher
    /// was loaded.
    pub skipped: Vec<MatcherType>,
    /// Stages whose matcher failed to start, with the error text.
    pub degraded: Vec<(MatcherType, String)>,
    /// Hits no identifier claimed.
    pub unclaimed: usize,
}

impl SessionSummary {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Result of a collected session.
#[derive(Debug)]
pub struct Identified {
    pub identifications: Vec<Box<dyn Identification>>,
    pub summary: SessionSummary,
}

/// A session running on its own thread.
#[derive(Debug)]
pub struct IdentificationStream {
    receiver: Receiver<Box<dyn Identification>>,
    handle: JoinHandle<SessionSummary>,
}

impl IdentificationStream {
    /// Identifications in report order. Iteration ends when the session has
    /// reported.
    pub fn receiver(&self) -> &Receiver<Box<dyn Identification>> {
        &self.receiver
    }

    /// Wait for the session to finish. Identifications not yet received are
    /// dropped.
    pub fn summary(self) -> FormidResult<SessionSummary> {
        drop(self.receiver);
        self.handle
            .join()
            .map_err(|_| FormidError::custom("identification session panicked"))
    }
}

#[derive(Debug)]
struct EngineInner {
    config: Config,
    matchers: Matchers,
    identifiers: Vec<Box<dyn Identifier>>,
}

/// Builds an [`Engine`] from format databases.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: Config,
    databases: Vec<FormatDatabase>,
    matchers: Vec<Box<dyn Matcher>>,
    identifiers: Vec<Box<dyn Identifier>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Compile `db` into its own identifier.
    pub fn with_database(mut self, db: FormatDatabase) -> Self {
        self.databases.push(db);
        self
    }

    /// Replace the built-in matcher for the matcher's type.
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Add an identifier built elsewhere, after the database identifiers.
    pub fn with_identifier(mut self, identifier: Box<dyn Identifier>) -> Self {
        self.identifiers.push(identifier);
        self
    }

    pub fn build(self) -> FormidResult<Engine> {
        self.config.validate()?;
        let mut matchers = Matchers::from_config(&self.config);
        for matcher in self.matchers {
            matchers.insert(matcher);
        }
        let mut identifiers: Vec<Box<dyn Identifier>> = Vec::new();
        for db in &self.databases {
            let identifier = FormatIdentifier::new(db, &mut matchers, &self.config)?;
            debug!(identifier = %identifier, "compiled format database");
            identifiers.push(Box::new(identifier));
        }
        identifiers.extend(self.identifiers);
        Ok(Engine::assemble(self.config, matchers, identifiers))
    }
}

/// Shared, read-only identification engine. Cheap to clone; sessions may
/// run concurrently from many threads.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn assemble(
        config: Config,
        matchers: Matchers,
        mut identifiers: Vec<Box<dyn Identifier>>,
    ) -> Self {
        order_identifiers(&mut identifiers, &config.identifier_order);
        Self {
            inner: Arc::new(EngineInner {
                config,
                matchers,
                identifiers,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn matchers(&self) -> &Matchers {
        &self.inner.matchers
    }

    /// Identifier names in first-claim order.
    pub fn identifier_names(&self) -> Vec<String> {
        self.inner
            .identifiers
            .iter()
            .map(|identifier| identifier_name(identifier.as_ref()))
            .collect()
    }

    /// Run one session, streaming identifications into `out`. Blocks while
    /// `out` is full.
    pub fn identify_into(
        &self,
        name: &str,
        mime: &str,
        source: &Buffer,
        out: &IdentificationSender,
    ) -> SessionSummary {
        let inner = &self.inner;
        let mut recorders: Vec<Box<dyn Recorder>> = inner
            .identifiers
            .iter()
            .map(|identifier| identifier.recorder())
            .collect();
        let mut summary = SessionSummary::default();

        for mt in MatcherType::ALL {
            let Some(matcher) = inner.matchers.get(mt) else {
                summary.skipped.push(mt);
                continue;
            };
            if recorders.iter().all(|recorder| recorder.satisfied(mt)) {
                debug!(matcher = %mt, "all recorders satisfied, stage skipped");
                summary.skipped.push(mt);
                continue;
            }
            for recorder in recorders.iter_mut() {
                recorder.active(mt);
            }
            let hint = match mt {
                MatcherType::Mime => mime,
                _ => name,
            };
            let hits = match matcher.identify(hint, source) {
                Ok(hits) => hits,
                Err(err) => {
                    warn!(matcher = %mt, error = %err, "matcher failed to start, stage degraded");
                    summary.degraded.push((mt, err.to_string()));
                    continue;
                }
            };
            summary.ran.push(mt);
            for hit in hits.iter() {
                let claimed = recorders
                    .iter_mut()
                    .any(|recorder| recorder.record(mt, &hit));
                if !claimed {
                    debug!(
                        matcher = %mt,
                        index = hit.index(),
                        basis = hit.basis(),
                        "unclaimed hit"
                    );
                    summary.unclaimed += 1;
                }
            }
        }

        for recorder in recorders.iter_mut() {
            recorder.report(out);
        }
        trace!(
            name,
            ran = summary.ran.len(),
            skipped = summary.skipped.len(),
            degraded = summary.degraded.len(),
            unclaimed = summary.unclaimed,
            "session complete"
        );
        summary
    }

    /// Run one session and collect every identification.
    pub fn identify(&self, name: &str, mime: &str, source: &Buffer) -> Identified {
        let (tx, rx) = unbounded();
        let summary = self.identify_into(name, mime, source, &tx);
        drop(tx);
        Identified {
            identifications: rx.iter().collect(),
            summary,
        }
    }

    /// Run one session on a worker thread. The returned stream holds at most
    /// `result_buffer` pending identifications; dropping it abandons the
    /// session.
    pub fn identify_stream(
        &self,
        name: impl Into<String>,
        mime: impl Into<String>,
        source: Buffer,
    ) -> FormidResult<IdentificationStream> {
        let (tx, rx) = bounded(self.inner.config.result_buffer);
        let engine = self.clone();
        let (name, mime) = (name.into(), mime.into());
        let handle = thread::Builder::new()
            .name("formid-session".to_string())
            .spawn(move || engine.identify_into(&name, &mime, &source, &tx))?;
        Ok(IdentificationStream {
            receiver: rx,
            handle,
        })
    }

    /// Ask each identifier in turn whether it recognises a hit, returning the
    /// first identifier's name and description.
    pub fn recognise(&self, mt: MatcherType, index: usize) -> Option<(String, String)> {
        self.inner.identifiers.iter().find_map(|identifier| {
            let (ok, description) = identifier.recognise(mt, index);
            ok.then(|| (identifier_name(identifier.as_ref()), description))
        })
    }

    /// Serialise matchers and identifiers into a signature file.
    pub fn save(&self) -> FormidResult<Vec<u8>> {
        let mut ls = LoadSaver::saver();
        for &b in SIGNATURE_MAGIC {
            ls.save_byte(b);
        }
        ls.save_byte(SIGNATURE_VERSION);
        ls.save_nested(|child| self.inner.matchers.save(child));
        ls.save_int(self.inner.identifiers.len() as u32);
        for identifier in &self.inner.identifiers {
            ls.save_nested(|child| identifier.save(child));
        }
        Ok(ls.into_bytes()?)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> FormidResult<()> {
        fs::write(path, self.save()?)?;
        Ok(())
    }

    /// Rebuild an engine from a signature file. Identifiers whose loader is
    /// missing or whose data is corrupt are skipped; a corrupt header or
    /// matcher section fails the whole load.
    pub fn load(bytes: &[u8], registry: &Registry, config: Config) -> FormidResult<Engine> {
        config.validate()?;
        let mut ls = LoadSaver::loader(bytes);
        let magic = [ls.load_byte(), ls.load_byte(), ls.load_byte(), ls.load_byte()];
        if ls.err().is_none() && &magic != SIGNATURE_MAGIC {
            ls.set_err(PersistError::BadSignatureFile {
                message: "missing FMID header".to_string(),
            });
        }
        let version = ls.load_byte();
        if ls.err().is_none() && version != SIGNATURE_VERSION {
            ls.set_err(PersistError::BadSignatureFile {
                message: format!("unsupported signature file version {}", version),
            });
        }
        let mut child = ls.load_nested();
        let matchers = Matchers::load(&mut child, &config);
        if let Some(err) = child.err() {
            return Err(err.clone().into());
        }

        let count = ls.load_int();
        let mut identifiers = Vec::new();
        for position in 0..count {
            if ls.err().is_some() {
                break;
            }
            let mut child = ls.load_nested();
            match registry.load(&mut child) {
                Ok(identifier) => identifiers.push(identifier),
                Err(err) => {
                    warn!(position, error = %err, "skipping identifier that failed to load")
                }
            }
        }
        if let Some(err) = ls.err() {
            return Err(err.clone().into());
        }
        Ok(Engine::assemble(config, matchers, identifiers))
    }

    pub fn load_file<P: AsRef<Path>>(
        path: P,
        registry: &Registry,
        config: Config,
    ) -> FormidResult<Engine> {
        let bytes = fs::read(path)?;
        Engine::load(&bytes, registry, config)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for identifier in &self.inner.identifiers {
            writeln!(f, "identifier {}", identifier)?;
        }
        write!(f, "{}", self.inner.matchers)
    }
}

fn identifier_name(identifier: &dyn Identifier) -> String {
    let [name, _] = identifier.describe();
    name
}

/// Stable sort: identifiers named in `order` first, in that order, then the
/// rest in their current order.
fn order_identifiers(identifiers: &mut [Box<dyn Identifier>], order: &[String]) {
    if order.is_empty() {
        return;
    }
    identifiers.sort_by_cached_key(|identifier| {
        let name = identifier_name(identifier.as_ref());
        order
            .iter()
            .position(|wanted| *wanted == name)
            .unwrap_or(usize::MAX)
    });
}
