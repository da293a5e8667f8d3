//! Comprehensive tests for the Formid library
//!
//! End-to-end identification sessions over a small format registry, plus the
//! protocol guarantees that hold across identifiers, recorders and matchers.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{Config, Multi};
use crate::containermatcher::zip_fixture;
use crate::core::{Hit, IdentificationSender, Identifier, MatcherType, Recorder};
use crate::engine::Engine;
use crate::format::FormatDatabase;
use crate::loader::load_database_from_xml;
use crate::persist::LoadSaver;
use crate::registry::Registry;
use crate::source::Buffer;

const FORMATS: &str = r#"
    <formats name="formid" details="end to end registry">
        <format id="fmt/276" name="Acrobat PDF" version="1.7" mime="application/pdf">
            <extension>pdf</extension>
            <magic>
                <pattern anchor="bof" hex="25 50 44 46 2D"/>
                <pattern anchor="eof" range="16" value="%%EOF"/>
            </magic>
        </format>
        <format id="x-fmt/263" name="ZIP Format" mime="application/zip" archive="zip">
            <extension>zip</extension>
            <magic><pattern anchor="bof" hex="50 4B 03 04"/></magic>
            <container type="zip"/>
        </format>
        <format id="fmt/483" name="ePub" mime="application/epub+zip">
            <extension>epub</extension>
            <container type="zip">
                <entry name="mimetype" value="application/epub+zip"/>
                <entry name="META-INF/container.xml"/>
            </container>
            <priority over="x-fmt/263"/>
        </format>
        <format id="fmt/92" name="Scalable Vector Graphics" version="1.1" mime="image/svg+xml">
            <glob>*.svg</glob>
            <xml root="svg" ns="http://www.w3.org/2000/svg"/>
        </format>
        <format id="x-fmt/111" name="Plain Text File" mime="text/plain">
            <extension>txt</extension>
            <text class="utf8"/>
        </format>
    </formats>
"#;

const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<< /Type /Catalog >>\nendobj\n%%EOF\n";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn database() -> FormatDatabase {
    load_database_from_xml(FORMATS).unwrap()
}

fn engine(config: Config) -> Engine {
    init_tracing();
    Engine::builder(config)
        .with_database(database())
        .build()
        .unwrap()
}

/// Identifier with no signatures that claims every hit it is shown.
#[derive(Debug)]
struct GreedyIdentifier {
    name: String,
    records: Arc<AtomicUsize>,
}

const GREEDY_TAG: u8 = 5;

impl GreedyIdentifier {
    fn new(name: &str) -> (Self, Arc<AtomicUsize>) {
        let records = Arc::new(AtomicUsize::new(0));
        let identifier = GreedyIdentifier {
            name: name.to_string(),
            records: Arc::clone(&records),
        };
        (identifier, records)
    }

    fn load(ls: &mut LoadSaver) -> Box<dyn Identifier> {
        Box::new(GreedyIdentifier {
            name: ls.load_string(),
            records: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl fmt::Display for GreedyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "greedy {}", self.name)
    }
}

struct GreedyRecorder {
    records: Arc<AtomicUsize>,
    active: [bool; MatcherType::COUNT],
}

impl Recorder for GreedyRecorder {
    fn record(&mut self, mt: MatcherType, _hit: &Hit) -> bool {
        assert!(self.active[mt.index()], "record before active for {}", mt);
        self.records.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn satisfied(&self, mt: MatcherType) -> bool {
        assert!(!self.active[mt.index()], "satisfied asked after active for {}", mt);
        false
    }

    fn report(&mut self, _out: &IdentificationSender) {}

    fn active(&mut self, mt: MatcherType) {
        self.active[mt.index()] = true;
    }
}

impl Identifier for GreedyIdentifier {
    fn recorder(&self) -> Box<dyn Recorder> {
        Box::new(GreedyRecorder {
            records: Arc::clone(&self.records),
            active: [false; MatcherType::COUNT],
        })
    }

    fn describe(&self) -> [String; 2] {
        [self.name.clone(), "claims everything".to_string()]
    }

    fn save(&self, ls: &mut LoadSaver) {
        ls.save_byte(GREEDY_TAG);
        ls.save_string(&self.name);
    }

    fn recognise(&self, _mt: MatcherType, _index: usize) -> (bool, String) {
        (false, String::new())
    }
}

/// A file named `report.pdf` with PDF content, trusting the extension:
/// content stages are skipped and the extension decides.
#[test]
fn test_scenario_trusted_extension() {
    let engine = engine(Config::default().with_trust_extension(true));
    let identified = engine.identify("docs/report.pdf", "", &Buffer::from_bytes(PDF.to_vec()));

    assert_eq!(identified.identifications.len(), 1);
    let pdf = &identified.identifications[0];
    assert!(pdf.known());
    assert_eq!(pdf.to_string(), "fmt/276 (Acrobat PDF 1.7)");
    assert_eq!(pdf.warn(), "");
    assert_eq!(pdf.csv()[5], "extension match pdf");

    let summary = &identified.summary;
    assert!(summary.ran.contains(&MatcherType::Extension));
    for mt in [
        MatcherType::Container,
        MatcherType::Byte,
        MatcherType::Text,
        MatcherType::Xml,
    ] {
        assert!(summary.skipped.contains(&mt), "{} should be skipped", mt);
    }
}

/// A `.txt` name over ZIP content: the container stage overrides the
/// extension, and the byte stage is no longer needed.
#[test]
fn test_scenario_container_overrides_extension() {
    let engine = engine(Config::default());
    let data = zip_fixture(&[("readme.md", b"# hello")]);
    let identified = engine.identify("notes.txt", "", &Buffer::from_bytes(data));

    assert_eq!(identified.identifications.len(), 1);
    let zip = &identified.identifications[0];
    assert!(zip.known());
    assert_eq!(zip.to_string(), "x-fmt/263 (ZIP Format)");
    assert_eq!(zip.warn(), "extension mismatch");
    assert!(zip.archive().is_archive());

    let summary = &identified.summary;
    assert!(summary.ran.contains(&MatcherType::Extension));
    assert!(summary.ran.contains(&MatcherType::Container));
    assert!(summary.skipped.contains(&MatcherType::Byte));
    assert!(summary.skipped.contains(&MatcherType::Text));
}

/// Empty content yields an explicit unknown identification.
#[test]
fn test_scenario_empty_source() {
    let engine = engine(Config::default());
    let identified = engine.identify("", "", &Buffer::empty());

    assert_eq!(identified.identifications.len(), 1);
    let unknown = &identified.identifications[0];
    assert!(!unknown.known());
    assert_eq!(unknown.to_string(), "UNKNOWN");
    assert_eq!(unknown.warn(), "no match");
    assert!(!unknown.archive().is_archive());
    assert_eq!(identified.summary.unclaimed, 0);
    assert!(!identified.summary.is_degraded());
    for mt in [MatcherType::Container, MatcherType::Byte, MatcherType::Text] {
        assert!(identified.summary.ran.contains(&mt));
    }
}

#[test]
fn test_specific_container_beats_generic_zip() {
    let engine = engine(Config::default());
    let data = zip_fixture(&[
        ("mimetype", b"application/epub+zip"),
        ("META-INF/container.xml", b"<container/>"),
        ("OEBPS/content.opf", b"<package/>"),
    ]);
    let identified = engine.identify("book.epub", "", &Buffer::from_bytes(data));
    let epub = &identified.identifications[0];
    assert_eq!(epub.to_string(), "fmt/483 (ePub)");
    assert_eq!(epub.warn(), "");
    assert!(!epub.archive().is_archive());
}

#[test]
fn test_xml_outranks_text() {
    let engine = engine(Config::default());
    let svg = br#"<?xml version="1.0"?><svg xmlns="http://www.w3.org/2000/svg"/>"#;
    let identified = engine.identify("drawing.svg", "", &Buffer::from_bytes(svg.to_vec()));
    let found = &identified.identifications[0];
    assert_eq!(found.to_string(), "fmt/92 (Scalable Vector Graphics 1.1)");
    assert_eq!(found.warn(), "");
    assert!(identified.summary.ran.contains(&MatcherType::Xml));

    let json: serde_json::Value = serde_json::from_str(&found.json()).unwrap();
    assert_eq!(json["basis"][0], "glob match *.svg");
    assert_eq!(json["mime"], "image/svg+xml");
}

#[test]
fn test_mime_hint_without_content() {
    let engine = engine(Config::default());
    let identified = engine.identify(
        "upload",
        "Application/PDF; charset=binary",
        &Buffer::from_bytes(b"\x00\x01\x02\x03".to_vec()),
    );
    let found = &identified.identifications[0];
    assert_eq!(found.to_string(), "fmt/276 (Acrobat PDF 1.7)");
    assert_eq!(found.warn(), "match on MIME only");
}

#[test]
fn test_exhaustive_reports_every_candidate() {
    let engine = engine(Config::default().with_multi(Multi::Exhaustive));
    let identified = engine.identify("readme.txt", "", &Buffer::from_bytes(b"hello\n".to_vec()));
    assert_eq!(identified.identifications.len(), 1);
    assert_eq!(identified.identifications[0].to_string(), "x-fmt/111 (Plain Text File)");
}

#[test]
fn test_first_claim_wins_in_identifier_order() {
    init_tracing();
    let (first, first_records) = GreedyIdentifier::new("greedy-a");
    let (second, second_records) = GreedyIdentifier::new("greedy-b");
    let engine = Engine::builder(Config::default())
        .with_database(database())
        .with_identifier(Box::new(first))
        .with_identifier(Box::new(second))
        .build()
        .unwrap();

    // the format identifier comes first and claims its own hits
    let identified = engine.identify("report.pdf", "", &Buffer::from_bytes(PDF.to_vec()));
    assert_eq!(first_records.load(Ordering::SeqCst), 0);
    assert_eq!(second_records.load(Ordering::SeqCst), 0);
    assert!(identified.identifications[0].known());

    let (first, first_records) = GreedyIdentifier::new("greedy-a");
    let (second, second_records) = GreedyIdentifier::new("greedy-b");
    let config = Config::default().with_identifier_order(["greedy-a", "greedy-b"]);
    let engine = Engine::builder(config)
        .with_database(database())
        .with_identifier(Box::new(first))
        .with_identifier(Box::new(second))
        .build()
        .unwrap();
    assert_eq!(
        engine.identifier_names(),
        vec!["greedy-a", "greedy-b", "formid"]
    );

    let identified = engine.identify("report.pdf", "", &Buffer::from_bytes(PDF.to_vec()));
    assert!(first_records.load(Ordering::SeqCst) >= 2);
    assert_eq!(second_records.load(Ordering::SeqCst), 0);
    assert_eq!(identified.identifications.len(), 1);
    assert!(!identified.identifications[0].known());
}

#[test]
fn test_identifier_round_trip_through_registry() {
    let config = Config::default();
    let engine = engine(config.clone());
    let bytes = engine.save().unwrap();
    let loaded = Engine::load(&bytes, &Registry::with_defaults(), config).unwrap();

    assert_eq!(loaded.identifier_names(), engine.identifier_names());
    for mt in MatcherType::ALL {
        for index in 0..8 {
            assert_eq!(loaded.recognise(mt, index), engine.recognise(mt, index));
        }
    }

    let data = zip_fixture(&[("readme.md", b"# hello")]);
    let source = Buffer::from_bytes(data);
    let before = engine.identify("notes.txt", "", &source);
    let after = loaded.identify("notes.txt", "", &source);
    assert_eq!(
        before.identifications[0].yaml(),
        after.identifications[0].yaml()
    );
    assert_eq!(before.summary, after.summary);
}

#[test]
fn test_unloadable_identifier_is_skipped() {
    init_tracing();
    let (greedy, _) = GreedyIdentifier::new("greedy");
    let engine = Engine::builder(Config::default())
        .with_database(database())
        .with_identifier(Box::new(greedy))
        .build()
        .unwrap();
    let bytes = engine.save().unwrap();

    let loaded = Engine::load(&bytes, &Registry::with_defaults(), Config::default()).unwrap();
    assert_eq!(loaded.identifier_names(), vec!["formid"]);

    let mut registry = Registry::with_defaults();
    registry.register(GREEDY_TAG, GreedyIdentifier::load).unwrap();
    let loaded = Engine::load(&bytes, &registry, Config::default()).unwrap();
    assert_eq!(loaded.identifier_names(), vec!["formid", "greedy"]);
}

#[test]
fn test_truncated_signature_file() {
    let bytes = engine(Config::default()).save().unwrap();
    for cut in [3, 5, 12, bytes.len() / 2] {
        assert!(
            Engine::load(&bytes[..cut], &Registry::with_defaults(), Config::default()).is_err(),
            "cut at {} should fail",
            cut
        );
    }
}

#[test]
fn test_concurrent_sessions() {
    let engine = engine(Config::default());
    let source = Buffer::from_bytes(PDF.to_vec());
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                let source = source.clone();
                scope.spawn(move || {
                    let name = format!("file{}.bin", i);
                    engine.identify(&name, "", &source).identifications[0].to_string()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "fmt/276 (Acrobat PDF 1.7)");
        }
    });
}

#[test]
fn test_abandoned_stream_finishes() {
    init_tracing();
    let mut config = Config::default();
    config.result_buffer = 1;
    let mut copy = database();
    copy.info.name = "copy".to_string();
    let engine = Engine::builder(config)
        .with_database(database())
        .with_database(copy)
        .build()
        .unwrap();
    let stream = engine
        .identify_stream("report.pdf", "", Buffer::from_bytes(PDF.to_vec()))
        .unwrap();
    let summary = stream.summary().unwrap();
    assert!(summary.ran.contains(&MatcherType::Extension));
}

#[test]
fn test_identify_mapped_file() {
    let engine = engine(Config::default());
    let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
    file.write_all(PDF).unwrap();
    file.flush().unwrap();

    let source = Buffer::open(file.path()).unwrap();
    assert_eq!(source.len(), PDF.len());
    let name = file.path().to_string_lossy().into_owned();
    let identified = engine.identify(&name, "", &source);
    assert_eq!(identified.identifications[0].to_string(), "fmt/276 (Acrobat PDF 1.7)");
    assert_eq!(identified.identifications[0].warn(), "");
}

#[test]
fn test_config_file_drives_engine() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(br#"{"trust_extension": true, "result_buffer": 4}"#)
        .unwrap();
    let config = Config::from_file(file.path()).unwrap();
    assert!(config.trust_extension);
    let engine = engine(config);
    let identified = engine.identify("report.pdf", "", &Buffer::from_bytes(b"junk".to_vec()));
    assert!(identified.summary.skipped.contains(&MatcherType::Byte));
    assert_eq!(identified.identifications[0].to_string(), "fmt/276 (Acrobat PDF 1.7)");
}
