//! Engine and identifier configuration
//!
//! Configuration is plain data deserialised from JSON. Every field has a
//! default, so an empty object (or no file at all) is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FormidError, FormidResult};

/// How many identifications a recorder reports per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multi {
    /// The single best candidate.
    #[default]
    Single,
    /// Every candidate in the strongest evidence tier.
    Exhaustive,
}

impl Multi {
    pub fn tag(self) -> u8 {
        match self {
            Multi::Single => 0,
            Multi::Exhaustive => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        if tag == 1 {
            Multi::Exhaustive
        } else {
            Multi::Single
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Treat an extension match as conclusive: content matchers are skipped
    /// for a recorder once it holds an extension hit.
    pub trust_extension: bool,
    pub multi: Multi,
    /// Capacity of the bounded channels carrying hits and identifications.
    pub result_buffer: usize,
    /// Bytes from the beginning of file searched by BOF anchored patterns.
    pub bof_window: usize,
    /// Bytes from the end of file searched by EOF anchored patterns.
    pub eof_window: usize,
    /// Bytes inspected by the text classifier.
    pub text_window: usize,
    /// Bytes scanned for the root element of XML documents.
    pub xml_window: usize,
    /// First-claim order of identifiers, by name. Identifiers that are not
    /// listed follow the listed ones in the order they were added.
    pub identifier_order: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust_extension: false,
            multi: Multi::Single,
            result_buffer: 16,
            bof_window: 64 * 1024,
            eof_window: 64 * 1024,
            text_window: 4096,
            xml_window: 64 * 1024,
            identifier_order: Vec::new(),
        }
    }
}

impl Config {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> FormidResult<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> FormidResult<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> FormidResult<()> {
        if self.result_buffer == 0 {
            return Err(FormidError::configuration(
                "result_buffer must be at least 1",
            ));
        }
        if self.text_window == 0 {
            return Err(FormidError::configuration("text_window must be at least 1"));
        }
        Ok(())
    }

    /// Builder-style toggle for strict extension trust.
    pub fn with_trust_extension(mut self, trust: bool) -> Self {
        self.trust_extension = trust;
        self
    }

    pub fn with_multi(mut self, multi: Multi) -> Self {
        self.multi = multi;
        self
    }

    pub fn with_identifier_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identifier_order = order.into_iter().map(Into::into).collect();
        self
    }
}
