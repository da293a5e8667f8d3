use crate::bytematcher::{Anchor, BytePattern, ByteSignature};
use crate::containermatcher::{ContainerEntry, ContainerKind, ContainerSignature};
use crate::core::Archive;
use crate::error::{FormidError, FormidResult};
use crate::format::{Format, FormatDatabase};
use crate::textmatcher::TextClass;
use crate::xmlmatcher::XmlSignature;
use base64::{engine::general_purpose, Engine as _};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// XML parsing structures for deserialization
#[derive(Debug, Deserialize)]
pub(crate) struct XmlFormats {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@details", default)]
    details: String,
    #[serde(rename = "format", default)]
    formats: Vec<XmlFormat>,
}

#[derive(Debug, Deserialize)]
struct XmlFormat {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@version", default)]
    version: String,
    #[serde(rename = "@mime")]
    mime: Option<String>,
    #[serde(rename = "@archive")]
    archive: Option<String>,
    #[serde(rename = "extension", default)]
    extensions: Vec<String>,
    #[serde(rename = "glob", default)]
    globs: Vec<String>,
    #[serde(rename = "magic", default)]
    magic: Vec<XmlMagic>,
    #[serde(rename = "container", default)]
    containers: Vec<XmlContainer>,
    #[serde(rename = "xml", default)]
    xml: Vec<XmlRoot>,
    #[serde(rename = "text")]
    text: Option<XmlText>,
    #[serde(rename = "priority", default)]
    priorities: Vec<XmlPriority>,
}

#[derive(Debug, Deserialize)]
struct XmlMagic {
    #[serde(rename = "pattern", default)]
    patterns: Vec<XmlPattern>,
}

#[derive(Debug, Deserialize)]
struct XmlPattern {
    #[serde(rename = "@anchor")]
    anchor: Option<String>,
    #[serde(rename = "@offset", default)]
    offset: usize,
    #[serde(rename = "@range", default)]
    range: usize,
    #[serde(rename = "@hex")]
    hex: Option<String>,
    #[serde(rename = "@value")]
    value: Option<String>,
    #[serde(rename = "@encoding")]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlContainer {
    #[serde(rename = "@type")]
    kind: Option<String>,
    #[serde(rename = "entry", default)]
    entries: Vec<XmlEntry>,
}

#[derive(Debug, Deserialize)]
struct XmlEntry {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@hex")]
    hex: Option<String>,
    #[serde(rename = "@value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlRoot {
    #[serde(rename = "@root")]
    root: Option<String>,
    #[serde(rename = "@ns")]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlText {
    #[serde(rename = "@class")]
    class: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlPriority {
    #[serde(rename = "@over")]
    over: String,
}

fn parse_anchor(anchor: Option<&str>) -> FormidResult<Anchor> {
    match anchor.map(str::to_ascii_lowercase).as_deref() {
        None | Some("bof") => Ok(Anchor::Bof),
        Some("eof") => Ok(Anchor::Eof),
        Some("var") | Some("variable") => Ok(Anchor::Var),
        Some(other) => Err(FormidError::signature_data(format!(
            "unknown pattern anchor {:?}",
            other
        ))),
    }
}

fn parse_archive(archive: Option<&str>) -> FormidResult<Archive> {
    match archive.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") | Some("none") => Ok(Archive::None),
        Some("zip") => Ok(Archive::Zip),
        Some("gzip") | Some("gz") => Ok(Archive::Gzip),
        Some("tar") => Ok(Archive::Tar),
        Some("arc") => Ok(Archive::Arc),
        Some("warc") => Ok(Archive::Warc),
        Some(other) => Err(FormidError::signature_data(format!(
            "unknown archive type {:?}",
            other
        ))),
    }
}

impl XmlPattern {
    fn into_pattern(self) -> FormidResult<BytePattern> {
        let anchor = parse_anchor(self.anchor.as_deref())?;
        let pattern = match (self.hex, self.value) {
            (Some(hex), None) => BytePattern::from_hex(anchor, self.offset, &hex)?,
            (None, Some(value)) => {
                let bytes = if self.encoding.as_deref() == Some("base64") {
                    general_purpose::STANDARD.decode(value.trim())?
                } else {
                    value.into_bytes()
                };
                BytePattern::new(anchor, self.offset, &bytes)
            }
            _ => {
                return Err(FormidError::signature_data(
                    "Pattern must have exactly one of hex or value attributes",
                ))
            }
        };
        Ok(pattern.with_range(self.range))
    }
}

impl XmlContainer {
    fn into_signature(self) -> FormidResult<ContainerSignature> {
        let kind = match self.kind.as_deref() {
            None | Some("zip") => ContainerKind::Zip,
            Some(other) => {
                return Err(FormidError::signature_data(format!(
                    "unsupported container type {:?}",
                    other
                )))
            }
        };
        let mut entries = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let content = match (entry.hex, entry.value) {
                (Some(hex), _) => Some(hex::decode(hex.replace(' ', ""))?),
                (None, Some(value)) => Some(value.into_bytes()),
                (None, None) => None,
            };
            entries.push(ContainerEntry {
                name: entry.name,
                content,
            });
        }
        Ok(ContainerSignature { kind, entries })
    }
}

impl XmlFormat {
    fn into_format(self) -> FormidResult<Format> {
        let mut format = Format::new(self.id, self.name).with_version(self.version);
        format.mime = self.mime.filter(|mime| !mime.is_empty());
        format.archive = parse_archive(self.archive.as_deref())?;

        for extension in self.extensions.into_iter().chain(self.globs) {
            let extension = extension.trim().to_string();
            if !extension.is_empty() {
                format.extensions.push(extension);
            }
        }

        for magic in self.magic {
            let patterns = magic
                .patterns
                .into_iter()
                .map(XmlPattern::into_pattern)
                .collect::<FormidResult<Vec<_>>>()?;
            format.magic.push(ByteSignature::new(patterns));
        }

        for container in self.containers {
            format.containers.push(container.into_signature()?);
        }

        for root in self.xml {
            format.xml.push(XmlSignature {
                root: root.root,
                namespace: root.namespace,
            });
        }

        if let Some(text) = self.text {
            format.text = Some(match text.class {
                Some(class) => class.parse::<TextClass>()?,
                None => TextClass::Any,
            });
        }

        format.priority_over = self.priorities.into_iter().map(|p| p.over).collect();
        Ok(format)
    }
}

impl XmlFormats {
    pub(crate) fn into_database(self) -> FormidResult<FormatDatabase> {
        let mut db = FormatDatabase::new(self.name, self.details);
        for xml_format in self.formats {
            db.add_format(xml_format.into_format()?);
        }
        db.validate()?;
        Ok(db)
    }
}

/// Load a format database from XML content
pub fn load_database_from_xml(xml_content: &str) -> FormidResult<FormatDatabase> {
    let xml_formats: XmlFormats = from_str(xml_content)?;
    xml_formats.into_database()
}

/// Load a format database from an XML file
pub fn load_database_from_file<P: AsRef<Path>>(path: P) -> FormidResult<FormatDatabase> {
    let xml_content = fs::read_to_string(path)?;
    load_database_from_xml(&xml_content)
}
