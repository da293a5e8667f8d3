//! Performance benchmarks for identification sessions
//!
//! Sessions run against a small format database covering every matcher
//! stage, and against a large generated database of byte signatures.

use std::io::{Cursor, Write};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use formid::{load_database_from_xml, Buffer, Config, Engine, FormatDatabase};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

fn create_test_database() -> FormatDatabase {
    let xml = r#"
        <formats name="bench">
            <format id="fmt/276" name="Acrobat PDF" version="1.7" mime="application/pdf">
                <extension>pdf</extension>
                <magic><pattern anchor="bof" hex="25504446 2D"/></magic>
            </format>
            <format id="x-fmt/263" name="ZIP Format" archive="zip">
                <extension>zip</extension>
                <magic><pattern anchor="bof" hex="504B0304"/></magic>
                <container type="zip"/>
            </format>
            <format id="fmt/483" name="ePub">
                <extension>epub</extension>
                <container type="zip">
                    <entry name="mimetype" value="application/epub+zip"/>
                </container>
                <priority over="x-fmt/263"/>
            </format>
            <format id="fmt/92" name="Scalable Vector Graphics">
                <extension>svg</extension>
                <xml root="svg" ns="http://www.w3.org/2000/svg"/>
            </format>
            <format id="x-fmt/111" name="Plain Text File">
                <extension>txt</extension>
                <text class="utf8"/>
            </format>
        </formats>
    "#;

    load_database_from_xml(xml).unwrap()
}

/// 1000 formats, each with a distinct four byte magic number
fn create_large_database() -> FormatDatabase {
    let mut xml = String::from(r#"<formats name="large">"#);
    for i in 0..1000u32 {
        xml.push_str(&format!(
            r#"
            <format id="bench/{}" name="Format {}">
                <extension>f{}</extension>
                <magic><pattern anchor="bof" offset="{}" hex="{:08x}"/></magic>
            </format>
        "#,
            i,
            i,
            i,
            i % 16,
            0x7f00_0000 | i
        ));
    }
    xml.push_str("</formats>");

    load_database_from_xml(&xml).unwrap()
}

fn epub_archive() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    writer.start_file("mimetype", options).unwrap();
    writer.write_all(b"application/epub+zip").unwrap();
    writer.start_file("OEBPS/chapter1.xhtml", options).unwrap();
    writer.write_all(&b"<p>lorem ipsum</p>".repeat(64)).unwrap();
    writer.finish().unwrap().into_inner()
}

fn benchmark_single_sessions(c: &mut Criterion) {
    let engine = Engine::builder(Config::default())
        .with_database(create_test_database())
        .build()
        .unwrap();

    let samples = [
        ("report.pdf", Buffer::from_bytes(b"%PDF-1.7\n%%EOF\n".to_vec())),
        ("book.epub", Buffer::from_bytes(epub_archive())),
        (
            "drawing.svg",
            Buffer::from_bytes(br#"<svg xmlns="http://www.w3.org/2000/svg"/>"#.to_vec()),
        ),
        ("notes.txt", Buffer::from_bytes("plain text ".repeat(512))),
        ("unknown.bin", Buffer::from_bytes(vec![0u8; 4096])),
    ];

    for (name, source) in &samples {
        c.bench_function(&format!("identify_{}", name), |b| {
            b.iter(|| black_box(engine.identify(black_box(name), "", source)));
        });
    }
}

fn benchmark_trusted_extension(c: &mut Criterion) {
    let engine = Engine::builder(Config::default().with_trust_extension(true))
        .with_database(create_test_database())
        .build()
        .unwrap();
    let source = Buffer::from_bytes(epub_archive());

    c.bench_function("identify_trusted_extension", |b| {
        b.iter(|| black_box(engine.identify("book.epub", "", &source)));
    });
}

fn benchmark_large_database(c: &mut Criterion) {
    let engine = Engine::builder(Config::default())
        .with_database(create_large_database())
        .build()
        .unwrap();
    // format 999 sits at offset 999 % 16
    let mut content = vec![0u8; 7];
    content.extend_from_slice(&0x7f00_03e7u32.to_be_bytes());
    content.resize(8192, 0x20);
    let source = Buffer::from_bytes(content);

    c.bench_function("identify_large_database", |b| {
        b.iter(|| black_box(engine.identify("sample.bin", "", &source)));
    });
}

fn benchmark_streamed_session(c: &mut Criterion) {
    let engine = Engine::builder(Config::default())
        .with_database(create_test_database())
        .build()
        .unwrap();
    let source = Buffer::from_bytes(b"%PDF-1.7\n%%EOF\n".to_vec());

    c.bench_function("identify_stream", |b| {
        b.iter(|| {
            let stream = engine
                .identify_stream("report.pdf", "", source.clone())
                .unwrap();
            let count = stream.receiver().iter().count();
            black_box(count);
            stream.summary().unwrap()
        });
    });
}

criterion_group!(
    benches,
    benchmark_single_sessions,
    benchmark_trusted_extension,
    benchmark_large_database,
    benchmark_streamed_session
);
criterion_main!(benches);
