//! Scheme-based dialer discovery
//!
//! Process-wide discovery is an explicit [`Registry`] object rather than an
//! import side effect: embedding applications call
//! [`register_connect_schemes`] once at startup, then resolve dialers by
//! relay URL scheme.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use url::Url;

use crate::error::{Error, Result};
use crate::proxy::Dialer;

/// Builds a [`Dialer`] from a relay URL of a registered scheme.
pub type DialerFactory = Arc<dyn Fn(&Url) -> Result<Dialer> + Send + Sync>;

/// Maps relay URL schemes to dialer factories. Intended lifecycle:
/// populated once at application start, read thereafter.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<String, DialerFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Install `factory` for `scheme`, replacing any previous registration.
    /// Registering the same factory twice is a no-op in effect, which makes
    /// startup registration idempotent.
    pub fn register(&self, scheme: &str, factory: DialerFactory) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scheme.to_ascii_lowercase(), factory);
    }

    /// Look up the factory registered for `scheme`, if any.
    pub fn resolve(&self, scheme: &str) -> Option<DialerFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scheme.to_ascii_lowercase())
            .cloned()
    }

    /// Build a dialer for `relay` from its scheme's registered factory.
    pub fn dialer_for(&self, relay: &Url) -> Result<Dialer> {
        match self.resolve(relay.scheme()) {
            Some(factory) => factory(relay),
            None => Err(Error::UnsupportedScheme(relay.scheme().to_string())),
        }
    }
}

/// Register the CONNECT dialer for the `http` and `https` schemes.
///
/// Not automatic: an embedding application must call this before relying on
/// scheme-based discovery. Safe to call more than once.
pub fn register_connect_schemes(registry: &Registry) {
    let factory: DialerFactory = Arc::new(|relay: &Url| Dialer::new(relay.clone()));
    registry.register("http", Arc::clone(&factory));
    registry.register("https", factory);
}

/// The process-wide registry instance.
pub fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}
