//! Format identifier: a compiled [`FormatDatabase`] and its recorders
//!
//! Compiling a database adds one signature set per matcher type to the
//! engine's [`Matchers`] and remembers which slice of each matcher's table
//! belongs to this identifier, and which format owns each signature in it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::{Config, Multi};
use crate::core::{
    Archive, Hit, Identification, IdentificationSender, Identifier, MatcherType, Recorder,
    SignatureSet,
};
use crate::engine::Matchers;
use crate::error::{FormidResult, PersistError};
use crate::format::{Format, FormatDatabase};
use crate::persist::LoadSaver;
use crate::priority::PriorityList;
use crate::registry::FORMAT_REGISTRY;

/// Evidence tiers, strongest first.
const TIERS: [MatcherType; MatcherType::COUNT] = [
    MatcherType::Container,
    MatcherType::Byte,
    MatcherType::Xml,
    MatcherType::Text,
    MatcherType::Mime,
    MatcherType::Extension,
];

/// The part of one matcher's table owned by an identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Range {
    start: usize,
    /// Format position for each signature, relative to `start`.
    owners: Vec<usize>,
}

impl Range {
    fn owner(&self, index: usize) -> Option<usize> {
        index
            .checked_sub(self.start)
            .and_then(|offset| self.owners.get(offset))
            .copied()
    }
}

/// What an identification reports about a format.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct FormatInfo {
    id: String,
    name: String,
    version: String,
    mime: String,
    archive: Archive,
}

impl FormatInfo {
    fn from_format(format: &Format) -> Self {
        Self {
            id: format.id.clone(),
            name: format.name.clone(),
            version: format.version.clone(),
            mime: format.mime.clone().unwrap_or_default(),
            archive: format.archive,
        }
    }

    fn label(&self) -> String {
        if self.version.is_empty() {
            format!("{} ({})", self.id, self.name)
        } else {
            format!("{} ({} {})", self.id, self.name, self.version)
        }
    }
}

#[derive(Debug)]
struct FormatTable {
    name: String,
    details: String,
    trust_extension: bool,
    multi: Multi,
    formats: Vec<FormatInfo>,
    ranges: [Range; MatcherType::COUNT],
}

impl FormatTable {
    fn owner(&self, mt: MatcherType, index: usize) -> Option<usize> {
        self.ranges[mt.index()].owner(index)
    }

    fn has_signatures(&self, mt: MatcherType) -> bool {
        !self.ranges[mt.index()].owners.is_empty()
    }
}

/// Identifier for one compiled format database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FormatIdentifier {
    table: Arc<FormatTable>,
}

/// Signatures of one matcher type, with the owning format of each.
fn gather<T, F>(db: &FormatDatabase, owners: &mut Vec<usize>, pick: F) -> Vec<T>
where
    F: Fn(&Format) -> Vec<T>,
{
    let mut out = Vec::new();
    for (position, format) in db.formats.iter().enumerate() {
        for signature in pick(format) {
            owners.push(position);
            out.push(signature);
        }
    }
    out
}

fn signature_set(db: &FormatDatabase, mt: MatcherType) -> (SignatureSet, Vec<usize>) {
    let mut owners = Vec::new();
    let set = match mt {
        MatcherType::Extension => {
            SignatureSet::Names(gather(db, &mut owners, |f| f.extensions.clone()))
        }
        MatcherType::Mime => {
            SignatureSet::Mimes(gather(db, &mut owners, |f| f.mime.iter().cloned().collect()))
        }
        MatcherType::Container => {
            SignatureSet::Containers(gather(db, &mut owners, |f| f.containers.clone()))
        }
        MatcherType::Byte => SignatureSet::Bytes(gather(db, &mut owners, |f| f.magic.clone())),
        MatcherType::Text => {
            SignatureSet::Text(gather(db, &mut owners, |f| f.text.into_iter().collect()))
        }
        MatcherType::Xml => SignatureSet::Xml(gather(db, &mut owners, |f| f.xml.clone())),
    };
    (set, owners)
}

/// Translate format level priorities into signature level priorities for
/// one signature set.
fn signature_priorities(owners: &[usize], pairs: &[(usize, usize)]) -> PriorityList {
    let mut by_format: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (signature, &format) in owners.iter().enumerate() {
        by_format.entry(format).or_default().push(signature);
    }
    let mut priorities = PriorityList::new();
    for (winner, loser) in pairs {
        let (Some(winners), Some(losers)) = (by_format.get(winner), by_format.get(loser)) else {
            continue;
        };
        for &w in winners {
            for &l in losers {
                priorities.add(w, l);
            }
        }
    }
    priorities
}

impl FormatIdentifier {
    /// Compile `db` into `matchers`.
    pub fn new(db: &FormatDatabase, matchers: &mut Matchers, config: &Config) -> FormidResult<Self> {
        db.validate()?;
        let pairs = db.priority_pairs()?;
        let mut ranges: [Range; MatcherType::COUNT] = Default::default();
        for mt in MatcherType::ALL {
            let (set, owners) = signature_set(db, mt);
            if owners.is_empty() {
                continue;
            }
            let priorities = signature_priorities(&owners, &pairs);
            let added = set.len();
            let total = matchers.add(mt, set, &priorities)?;
            debug!(identifier = %db.name(), matcher = %mt, signatures = added, "added signatures");
            ranges[mt.index()] = Range {
                start: total - added,
                owners,
            };
        }
        Ok(Self {
            table: Arc::new(FormatTable {
                name: db.name().to_string(),
                details: db.details().to_string(),
                trust_extension: config.trust_extension,
                multi: config.multi,
                formats: db.formats.iter().map(FormatInfo::from_format).collect(),
                ranges,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.table.name
    }

    /// Number of formats in the compiled database.
    pub fn len(&self) -> usize {
        self.table.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.formats.is_empty()
    }

    /// Registry loader for [`FORMAT_REGISTRY`]. The tag byte has already been
    /// consumed.
    pub fn load(ls: &mut LoadSaver) -> Box<dyn Identifier> {
        let name = ls.load_string();
        let details = ls.load_string();
        let trust_extension = ls.load_bool();
        let multi = Multi::from_tag(ls.load_byte());
        let count = ls.load_int();
        let mut formats = Vec::new();
        for _ in 0..count {
            if ls.err().is_some() {
                break;
            }
            formats.push(FormatInfo {
                id: ls.load_string(),
                name: ls.load_string(),
                version: ls.load_string(),
                mime: ls.load_string(),
                archive: Archive::from_tag(ls.load_byte()),
            });
        }
        let mut ranges: [Range; MatcherType::COUNT] = Default::default();
        for range in ranges.iter_mut() {
            range.start = ls.load_usize();
            range.owners = ls.load_ints();
            if range.owners.iter().any(|&owner| owner >= formats.len()) {
                ls.set_err(PersistError::BadSignatureFile {
                    message: format!("signature owner outside {} formats", formats.len()),
                });
                range.owners.clear();
            }
        }
        Box::new(Self {
            table: Arc::new(FormatTable {
                name,
                details,
                trust_extension,
                multi,
                formats,
                ranges,
            }),
        })
    }
}

impl Identifier for FormatIdentifier {
    fn recorder(&self) -> Box<dyn Recorder> {
        Box::new(FormatRecorder::new(Arc::clone(&self.table)))
    }

    fn describe(&self) -> [String; 2] {
        [self.table.name.clone(), self.table.details.clone()]
    }

    fn save(&self, ls: &mut LoadSaver) {
        let table = &self.table;
        ls.save_byte(FORMAT_REGISTRY);
        ls.save_string(&table.name);
        ls.save_string(&table.details);
        ls.save_bool(table.trust_extension);
        ls.save_byte(table.multi.tag());
        ls.save_int(table.formats.len() as u32);
        for info in &table.formats {
            ls.save_string(&info.id);
            ls.save_string(&info.name);
            ls.save_string(&info.version);
            ls.save_string(&info.mime);
            ls.save_byte(info.archive.tag());
        }
        for range in &table.ranges {
            ls.save_usize(range.start);
            ls.save_ints(&range.owners);
        }
    }

    fn recognise(&self, mt: MatcherType, index: usize) -> (bool, String) {
        match self.table.owner(mt, index) {
            Some(format) => (true, self.table.formats[format].label()),
            None => (false, String::new()),
        }
    }
}

impl fmt::Display for FormatIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} formats)", self.table.name, self.table.formats.len())?;
        if !self.table.details.is_empty() {
            write!(f, ": {}", self.table.details)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Evidence {
    format: usize,
    basis: String,
}

/// Per-session evidence for one [`FormatIdentifier`].
#[derive(Debug)]
pub struct FormatRecorder {
    table: Arc<FormatTable>,
    active: [bool; MatcherType::COUNT],
    evidence: [Vec<Evidence>; MatcherType::COUNT],
    reported: bool,
}

impl FormatRecorder {
    fn new(table: Arc<FormatTable>) -> Self {
        Self {
            table,
            active: [false; MatcherType::COUNT],
            evidence: Default::default(),
            reported: false,
        }
    }

    fn has(&self, mt: MatcherType) -> bool {
        !self.evidence[mt.index()].is_empty()
    }

    fn matched(&self, mt: MatcherType, format: usize) -> bool {
        self.evidence[mt.index()].iter().any(|e| e.format == format)
    }

    /// Candidates of the strongest tier holding evidence, best first.
    fn candidates(&self) -> Option<(MatcherType, Vec<usize>)> {
        let tier = TIERS.into_iter().find(|&mt| self.has(mt))?;
        let mut formats: Vec<usize> = Vec::new();
        for evidence in &self.evidence[tier.index()] {
            if !formats.contains(&evidence.format) {
                formats.push(evidence.format);
            }
        }
        formats.sort_by_key(|&format| {
            let named = self.matched(MatcherType::Extension, format)
                || self.matched(MatcherType::Mime, format);
            (!named, format)
        });
        Some((tier, formats))
    }

    fn warnings(&self, tier: MatcherType, format: usize) -> Vec<String> {
        let mut warnings = Vec::new();
        match tier {
            MatcherType::Extension if !self.table.trust_extension => {
                warnings.push("match on extension only".to_string())
            }
            MatcherType::Mime => warnings.push("match on MIME only".to_string()),
            _ => {}
        }
        if tier.is_content()
            && self.has(MatcherType::Extension)
            && !self.matched(MatcherType::Extension, format)
        {
            warnings.push("extension mismatch".to_string());
        }
        warnings
    }

    fn identification(&self, format: usize, warnings: Vec<String>) -> FormatIdentification {
        let info = &self.table.formats[format];
        let basis = MatcherType::ALL
            .into_iter()
            .flat_map(|mt| &self.evidence[mt.index()])
            .filter(|e| e.format == format)
            .map(|e| e.basis.clone())
            .collect();
        FormatIdentification {
            namespace: self.table.name.clone(),
            id: info.id.clone(),
            format: info.name.clone(),
            version: info.version.clone(),
            mime: info.mime.clone(),
            basis,
            warning: warnings.join("; "),
            archive: info.archive,
            known: true,
        }
    }

    fn verdicts(&self) -> Vec<FormatIdentification> {
        let Some((tier, candidates)) = self.candidates() else {
            return vec![FormatIdentification::unknown(&self.table.name, "no match")];
        };
        match self.table.multi {
            Multi::Exhaustive => candidates
                .iter()
                .map(|&format| self.identification(format, self.warnings(tier, format)))
                .collect(),
            Multi::Single => {
                let best = candidates[0];
                let mut warnings = self.warnings(tier, best);
                if candidates.len() > 1 {
                    let ids: Vec<&str> = candidates
                        .iter()
                        .map(|&format| self.table.formats[format].id.as_str())
                        .collect();
                    warnings.push(format!("multiple candidates: {}", ids.join(", ")));
                }
                vec![self.identification(best, warnings)]
            }
        }
    }
}

impl Recorder for FormatRecorder {
    fn record(&mut self, mt: MatcherType, hit: &Hit) -> bool {
        if !self.active[mt.index()] {
            warn!(
                identifier = %self.table.name,
                matcher = %mt,
                index = hit.index(),
                "hit recorded before its matcher type was active"
            );
            return false;
        }
        match self.table.owner(mt, hit.index()) {
            Some(format) => {
                trace!(
                    identifier = %self.table.name,
                    matcher = %mt,
                    index = hit.index(),
                    "hit claimed"
                );
                self.evidence[mt.index()].push(Evidence {
                    format,
                    basis: hit.basis().to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn satisfied(&self, mt: MatcherType) -> bool {
        if !self.table.has_signatures(mt) {
            return true;
        }
        match mt {
            MatcherType::Extension | MatcherType::Mime => false,
            _ if self.table.trust_extension && self.has(MatcherType::Extension) => true,
            MatcherType::Container => false,
            MatcherType::Byte => self.has(MatcherType::Container),
            MatcherType::Text | MatcherType::Xml => {
                self.has(MatcherType::Container) || self.has(MatcherType::Byte)
            }
        }
    }

    fn report(&mut self, out: &IdentificationSender) {
        if self.reported {
            warn!(identifier = %self.table.name, "recorder already reported");
            return;
        }
        self.reported = true;
        for identification in self.verdicts() {
            if out.send(Box::new(identification)).is_err() {
                trace!(identifier = %self.table.name, "identification receiver dropped");
                return;
            }
        }
    }

    fn active(&mut self, mt: MatcherType) {
        self.active[mt.index()] = true;
    }
}

/// Verdict of a [`FormatRecorder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatIdentification {
    pub namespace: String,
    pub id: String,
    pub format: String,
    pub version: String,
    pub mime: String,
    pub basis: Vec<String>,
    pub warning: String,
    pub archive: Archive,
    #[serde(skip)]
    known: bool,
}

impl FormatIdentification {
    /// Identification for content no format matched.
    pub fn unknown(namespace: &str, warning: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: "UNKNOWN".to_string(),
            format: String::new(),
            version: String::new(),
            mime: String::new(),
            basis: Vec::new(),
            warning: warning.to_string(),
            archive: Archive::None,
            known: false,
        }
    }
}

impl fmt::Display for FormatIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.known {
            return f.write_str(&self.id);
        }
        write!(f, "{} ({}", self.id, self.format)?;
        if !self.version.is_empty() {
            write!(f, " {}", self.version)?;
        }
        f.write_str(")")
    }
}

impl Identification for FormatIdentification {
    fn known(&self) -> bool {
        self.known
    }

    fn warn(&self) -> &str {
        &self.warning
    }

    fn yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn csv(&self) -> Vec<String> {
        vec![
            self.namespace.clone(),
            self.id.clone(),
            self.format.clone(),
            self.version.clone(),
            self.mime.clone(),
            self.basis.join("; "),
            self.warning.clone(),
        ]
    }

    fn archive(&self) -> Archive {
        self.archive
    }
}
