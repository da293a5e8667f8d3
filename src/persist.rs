//! Sequential persistence cursor for compiled signature state
//!
//! A [`LoadSaver`] is either writing (appending to an internal buffer) or
//! reading (advancing through a byte slice). The first error is sticky: once
//! set, every later read returns a default value and every write is dropped,
//! so callers can run a long sequence of operations and check [`LoadSaver::err`]
//! once at the end.

use crate::error::PersistError;

/// Read/write cursor with a sticky first error.
#[derive(Debug, Default, Clone)]
pub struct LoadSaver {
    buf: Vec<u8>,
    pos: usize,
    err: Option<PersistError>,
}

impl LoadSaver {
    /// Create an empty cursor for saving.
    pub fn saver() -> Self {
        Self::default()
    }

    /// Create a cursor positioned at the start of `bytes` for loading.
    pub fn loader(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: bytes.into(),
            pos: 0,
            err: None,
        }
    }

    /// First error recorded on this cursor, if any.
    pub fn err(&self) -> Option<&PersistError> {
        self.err.as_ref()
    }

    /// Record an error unless one is already set.
    pub fn set_err(&mut self, err: PersistError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Consume the cursor, returning the saved bytes or the first error.
    pub fn into_bytes(self) -> Result<Vec<u8>, PersistError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.buf),
        }
    }

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if self.err.is_some() {
            return None;
        }
        if self.remaining() < n {
            let offset = self.pos;
            self.set_err(PersistError::UnexpectedEof { offset });
            return None;
        }
        let start = self.pos;
        self.pos += n;
        Some(&self.buf[start..start + n])
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.err.is_none() {
            self.buf.extend_from_slice(bytes);
        }
    }

    pub fn save_byte(&mut self, b: u8) {
        self.put(&[b]);
    }

    pub fn load_byte(&mut self) -> u8 {
        self.take(1).map(|b| b[0]).unwrap_or_default()
    }

    pub fn save_bool(&mut self, b: bool) {
        self.save_byte(u8::from(b));
    }

    pub fn load_bool(&mut self) -> bool {
        self.load_byte() != 0
    }

    pub fn save_small_int(&mut self, i: u16) {
        self.put(&i.to_le_bytes());
    }

    pub fn load_small_int(&mut self) -> u16 {
        self.take(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .unwrap_or_default()
    }

    pub fn save_int(&mut self, i: u32) {
        self.put(&i.to_le_bytes());
    }

    pub fn load_int(&mut self) -> u32 {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or_default()
    }

    /// Save a length or index. Values are written as 64-bit little endian.
    pub fn save_usize(&mut self, i: usize) {
        self.put(&(i as u64).to_le_bytes());
    }

    pub fn load_usize(&mut self) -> usize {
        let mut raw = [0u8; 8];
        match self.take(8) {
            Some(b) => raw.copy_from_slice(b),
            None => return 0,
        }
        usize::try_from(u64::from_le_bytes(raw)).unwrap_or(usize::MAX)
    }

    pub fn save_bytes(&mut self, bytes: &[u8]) {
        self.save_int(bytes.len() as u32);
        self.put(bytes);
    }

    pub fn load_bytes(&mut self) -> Vec<u8> {
        let len = self.load_int() as usize;
        self.take(len).map(<[u8]>::to_vec).unwrap_or_default()
    }

    pub fn save_string(&mut self, s: &str) {
        self.save_bytes(s.as_bytes());
    }

    pub fn load_string(&mut self) -> String {
        let offset = self.pos;
        let bytes = self.load_bytes();
        match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => {
                self.set_err(PersistError::InvalidUtf8 { offset });
                String::new()
            }
        }
    }

    pub fn save_strings(&mut self, items: &[String]) {
        self.save_int(items.len() as u32);
        for item in items {
            self.save_string(item);
        }
    }

    pub fn load_strings(&mut self) -> Vec<String> {
        let len = self.load_int() as usize;
        let mut out = Vec::new();
        for _ in 0..len {
            if self.err.is_some() {
                break;
            }
            out.push(self.load_string());
        }
        out
    }

    pub fn save_ints(&mut self, items: &[usize]) {
        self.save_int(items.len() as u32);
        for &item in items {
            self.save_usize(item);
        }
    }

    pub fn load_ints(&mut self) -> Vec<usize> {
        let len = self.load_int() as usize;
        let mut out = Vec::new();
        for _ in 0..len {
            if self.err.is_some() {
                break;
            }
            out.push(self.load_usize());
        }
        out
    }

    /// Save a nested structure as a length-prefixed child cursor.
    ///
    /// An error raised inside `f` is copied onto this cursor.
    pub fn save_nested<F>(&mut self, f: F)
    where
        F: FnOnce(&mut LoadSaver),
    {
        let mut child = LoadSaver::saver();
        f(&mut child);
        match child.into_bytes() {
            Ok(bytes) => self.save_bytes(&bytes),
            Err(err) => self.set_err(err),
        }
    }

    /// Split off the next nested structure as an independent cursor.
    ///
    /// Errors raised while reading the child stay on the child, so a caller
    /// may skip one malformed nested record and continue with the parent.
    /// If this cursor is already in error the child inherits that error.
    pub fn load_nested(&mut self) -> LoadSaver {
        let bytes = self.load_bytes();
        let mut child = LoadSaver::loader(bytes);
        if let Some(err) = &self.err {
            child.set_err(err.clone());
        }
        child
    }
}
