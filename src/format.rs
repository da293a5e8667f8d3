//! Format records and format databases
//!
//! A [`FormatDatabase`] is the uncompiled form of a format registry: the list
//! of formats with every signature that identifies them. It is turned into a
//! [`FormatIdentifier`](crate::identifier::FormatIdentifier) by compiling its
//! signatures into the engine's matchers.

use serde::{Deserialize, Serialize};

use crate::bytematcher::ByteSignature;
use crate::containermatcher::ContainerSignature;
use crate::core::Archive;
use crate::error::{FormidError, FormidResult};
use crate::textmatcher::TextClass;
use crate::xmlmatcher::XmlSignature;

/// One file format and the signatures that identify it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Format {
    /// Registry identifier, such as `fmt/276`.
    pub id: String,
    /// Human readable format name
    pub name: String,
    pub version: String,
    pub mime: Option<String>,
    /// Extensions (`pdf`) or base name globs (`*.tar.gz`).
    pub extensions: Vec<String>,
    pub magic: Vec<ByteSignature>,
    pub containers: Vec<ContainerSignature>,
    pub xml: Vec<XmlSignature>,
    pub text: Option<TextClass>,
    pub archive: Archive,
    /// Ids of formats whose signatures this format's signatures suppress.
    pub priority_over: Vec<String>,
}

impl Format {
    /// Create a format with no signatures
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Format {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extensions.push(extension.into());
        self
    }

    pub fn with_magic(mut self, signature: ByteSignature) -> Self {
        self.magic.push(signature);
        self
    }

    pub fn with_container(mut self, signature: ContainerSignature) -> Self {
        self.containers.push(signature);
        self
    }

    pub fn with_xml(mut self, signature: XmlSignature) -> Self {
        self.xml.push(signature);
        self
    }

    pub fn with_text(mut self, class: TextClass) -> Self {
        self.text = Some(class);
        self
    }

    pub fn with_archive(mut self, archive: Archive) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_priority_over(mut self, id: impl Into<String>) -> Self {
        self.priority_over.push(id.into());
        self
    }
}

/// Metadata describing where a database came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub details: String,
}

/// Collection of formats loaded from a signature file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormatDatabase {
    pub info: DatabaseInfo,
    pub formats: Vec<Format>,
}

impl FormatDatabase {
    /// Create a new empty database
    pub fn new(name: impl Into<String>, details: impl Into<String>) -> Self {
        FormatDatabase {
            info: DatabaseInfo {
                name: name.into(),
                details: details.into(),
            },
            formats: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn details(&self) -> &str {
        &self.info.details
    }

    /// Add a format to the database
    pub fn add_format(&mut self, format: Format) {
        self.formats.push(format);
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.add_format(format);
        self
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Position of the format with `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.formats.iter().position(|format| format.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Format> {
        self.position(id).map(|index| &self.formats[index])
    }

    /// Resolve every `priority_over` reference to `(winner, loser)` format
    /// positions.
    pub fn priority_pairs(&self) -> FormidResult<Vec<(usize, usize)>> {
        let mut pairs = Vec::new();
        for (winner, format) in self.formats.iter().enumerate() {
            for id in &format.priority_over {
                let loser = self.position(id).ok_or_else(|| {
                    FormidError::signature_data(format!(
                        "format {} takes priority over unknown format {}",
                        format.id, id
                    ))
                })?;
                pairs.push((winner, loser));
            }
        }
        Ok(pairs)
    }

    /// Check for duplicate format ids and dangling priorities.
    pub fn validate(&self) -> FormidResult<()> {
        for (index, format) in self.formats.iter().enumerate() {
            if format.id.is_empty() {
                return Err(FormidError::signature_data(format!(
                    "format at position {} has no id",
                    index
                )));
            }
            if self.position(&format.id) != Some(index) {
                return Err(FormidError::signature_data(format!(
                    "duplicate format id {}",
                    format.id
                )));
            }
        }
        self.priority_pairs().map(|_| ())
    }
}
