//! Identifier loader registry
//!
//! Persisted identifiers start with a one byte type tag. A [`Registry`] maps
//! each tag to the loader that reconstructs that identifier type. Callers
//! assemble a registry once at startup and pass it to
//! [`Engine::load`](crate::Engine::load); after that it is only read, so it
//! can be shared across threads without locking.

use std::fmt;

use tracing::debug;

use crate::core::Identifier;
use crate::error::{FormidError, FormidResult, PersistError};
use crate::identifier::FormatIdentifier;
use crate::persist::LoadSaver;

/// Tag of the built-in [`FormatIdentifier`].
pub const FORMAT_REGISTRY: u8 = 0;

/// Number of loader slots. Tags are a small, manually coordinated namespace.
pub const REGISTRY_CAPACITY: usize = 8;

/// Reconstructs an identifier from a cursor positioned just after its tag.
///
/// Loaders report failures on the cursor; the registry turns a set error
/// into a load error.
pub type IdentifierLoader = fn(&mut LoadSaver) -> Box<dyn Identifier>;

/// Fixed-capacity table of identifier loaders.
#[derive(Clone, Default)]
pub struct Registry {
    loaders: [Option<IdentifierLoader>; REGISTRY_CAPACITY],
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every identifier type shipped in this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.loaders[usize::from(FORMAT_REGISTRY)] = Some(FormatIdentifier::load);
        registry
    }

    /// Register a loader at `tag`, replacing any loader already there.
    pub fn register(&mut self, tag: u8, loader: IdentifierLoader) -> FormidResult<()> {
        let slot = self
            .loaders
            .get_mut(usize::from(tag))
            .ok_or(FormidError::Registry { tag })?;
        if slot.is_some() {
            debug!(tag, "replacing identifier loader");
        }
        *slot = Some(loader);
        Ok(())
    }

    /// Whether a loader is registered at `tag`.
    pub fn contains(&self, tag: u8) -> bool {
        self.loaders
            .get(usize::from(tag))
            .is_some_and(Option::is_some)
    }

    /// Read a tag byte and dispatch to its loader.
    ///
    /// Fails if the cursor is already in error, if no loader is registered
    /// for the tag (the cursor's error is then set), or if the loader leaves
    /// an error on the cursor.
    pub fn load(&self, ls: &mut LoadSaver) -> FormidResult<Box<dyn Identifier>> {
        if let Some(err) = ls.err() {
            return Err(err.clone().into());
        }
        let tag = ls.load_byte();
        if let Some(err) = ls.err() {
            return Err(err.clone().into());
        }
        let Some(loader) = self.loaders.get(usize::from(tag)).copied().flatten() else {
            ls.set_err(PersistError::BadIdentifierLoader { tag });
            return Err(PersistError::BadIdentifierLoader { tag }.into());
        };
        let identifier = loader(ls);
        match ls.err() {
            Some(err) => Err(err.clone().into()),
            None => Ok(identifier),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<usize> = self
            .loaders
            .iter()
            .enumerate()
            .filter_map(|(tag, l)| l.map(|_| tag))
            .collect();
        f.debug_struct("Registry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Hit, IdentificationSender, MatcherType, Recorder};

    #[derive(Debug)]
    struct Stub(String);

    impl fmt::Display for Stub {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    struct NullRecorder;

    impl Recorder for NullRecorder {
        fn record(&mut self, _: MatcherType, _: &Hit) -> bool {
            false
        }
        fn satisfied(&self, _: MatcherType) -> bool {
            true
        }
        fn report(&mut self, _: &IdentificationSender) {}
        fn active(&mut self, _: MatcherType) {}
    }

    impl Identifier for Stub {
        fn recorder(&self) -> Box<dyn Recorder> {
            Box::new(NullRecorder)
        }
        fn describe(&self) -> [String; 2] {
            [self.0.clone(), String::new()]
        }
        fn save(&self, ls: &mut LoadSaver) {
            ls.save_byte(5);
            ls.save_string(&self.0);
        }
        fn recognise(&self, _: MatcherType, _: usize) -> (bool, String) {
            (false, String::new())
        }
    }

    fn load_stub(ls: &mut LoadSaver) -> Box<dyn Identifier> {
        Box::new(Stub(ls.load_string()))
    }

    fn load_other(ls: &mut LoadSaver) -> Box<dyn Identifier> {
        let _ = ls.load_string();
        Box::new(Stub("other".to_string()))
    }

    #[test]
    fn test_dispatch_by_tag() {
        let mut registry = Registry::new();
        registry.register(5, load_stub).unwrap();
        assert!(registry.contains(5));
        assert!(!registry.contains(4));

        let mut ls = LoadSaver::saver();
        Stub("stub".to_string()).save(&mut ls);
        let mut ls = LoadSaver::loader(ls.into_bytes().unwrap());
        let identifier = registry.load(&mut ls).unwrap();
        assert_eq!(identifier.describe()[0], "stub");
    }

    #[test]
    fn test_register_overwrites() {
        let mut registry = Registry::new();
        registry.register(5, load_stub).unwrap();
        registry.register(5, load_other).unwrap();

        let mut ls = LoadSaver::saver();
        Stub("stub".to_string()).save(&mut ls);
        let mut ls = LoadSaver::loader(ls.into_bytes().unwrap());
        assert_eq!(registry.load(&mut ls).unwrap().describe()[0], "other");
    }

    #[test]
    fn test_register_out_of_range() {
        let mut registry = Registry::new();
        let result = registry.register(8, load_stub);
        assert!(matches!(result, Err(FormidError::Registry { tag: 8 })));
    }

    #[test]
    fn test_unregistered_tag_sets_cursor_error() {
        let registry = Registry::new();
        let mut ls = LoadSaver::loader(vec![3u8, 0, 0]);
        let result = registry.load(&mut ls);
        assert!(matches!(
            result,
            Err(FormidError::Load(PersistError::BadIdentifierLoader { tag: 3 }))
        ));
        assert_eq!(ls.err(), Some(&PersistError::BadIdentifierLoader { tag: 3 }));
    }

    #[test]
    fn test_cursor_already_in_error() {
        let mut registry = Registry::new();
        registry.register(0, load_stub).unwrap();
        let mut ls = LoadSaver::loader(vec![0u8]);
        ls.set_err(PersistError::UnexpectedEof { offset: 0 });
        assert!(registry.load(&mut ls).is_err());
        assert_eq!(ls.position(), 0);
    }

    #[test]
    fn test_defaults_hold_format_loader() {
        let registry = Registry::with_defaults();
        assert!(registry.contains(FORMAT_REGISTRY));
        assert_eq!(format!("{:?}", registry), "Registry { tags: [0] }");
    }
}
