//! Handler registry and dynamic loading
//!
//! Path-based handlers live in compiled libraries that export a
//! [`HandlerCtor`](crate::handler::HandlerCtor) under the configured
//! symbol name. The registry keys loaded libraries by canonical path and
//! content fingerprint: a lookup with an unchanged fingerprint reuses the
//! resident library, while a changed file drops the stale instance and
//! loads fresh, so edits are observed on the next invocation and
//! module-level state does not leak across reloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose, Engine};
use dashmap::DashMap;
use libloading::Library;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::handler::{BoxError, Handler, HandlerCtor, HandlerOutcome};
use crate::context::InvocationContext;
use funcsim_core::InvokeError;

struct RegisteredLibrary {
    fingerprint: String,
    library: Arc<Library>,
}

/// Registry of loaded handler libraries
#[derive(Default)]
pub struct HandlerRegistry {
    entries: DashMap<PathBuf, RegisteredLibrary>,
}

/// A handler resolved from a library, holding the library alive
pub struct LoadedHandler {
    handler: Box<dyn Handler>,
    _library: Arc<Library>,
}

impl Handler for LoadedHandler {
    fn invoke(
        &self,
        event: Value,
        ctx: Arc<InvocationContext>,
    ) -> Result<HandlerOutcome, BoxError> {
        self.handler.invoke(event, ctx)
    }
}

fn fingerprint(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    general_purpose::STANDARD.encode(hasher.finalize())
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Resolve a handler from `path`, reloading the library when its
    /// contents changed since the previous load.
    pub fn load(&self, path: &Path, export: &str) -> Result<LoadedHandler, InvokeError> {
        let canonical = path
            .canonicalize()
            .map_err(|e| InvokeError::Load(format!("{}: {}", path.display(), e)))?;
        let contents = std::fs::read(&canonical)
            .map_err(|e| InvokeError::Load(format!("{}: {}", canonical.display(), e)))?;
        let fingerprint = fingerprint(&contents);

        let resident = self.entries.get(&canonical).and_then(|entry| {
            (entry.fingerprint == fingerprint).then(|| Arc::clone(&entry.library))
        });

        let library = match resident {
            Some(library) => {
                debug!(path = %canonical.display(), "Reusing resident handler library");
                library
            }
            None => {
                // Drop the stale instance before loading fresh.
                self.entries.remove(&canonical);

                let library = unsafe { Library::new(&canonical) }
                    .map_err(|e| InvokeError::Load(format!("{}: {}", canonical.display(), e)))?;
                let library = Arc::new(library);

                info!(
                    path = %canonical.display(),
                    fingerprint = %fingerprint,
                    "Loaded handler library"
                );

                self.entries.insert(
                    canonical.clone(),
                    RegisteredLibrary {
                        fingerprint,
                        library: Arc::clone(&library),
                    },
                );
                library
            }
        };

        let ctor: HandlerCtor = *unsafe { library.get::<HandlerCtor>(export.as_bytes()) }
            .map_err(|_| {
                InvokeError::Load(format!(
                    "Export '{}' not found in {}",
                    export,
                    canonical.display()
                ))
            })?;

        let handler = ctor();

        Ok(LoadedHandler {
            handler,
            _library: library,
        })
    }

    /// Explicit reload trigger: forget a resident library so the next
    /// load starts fresh regardless of fingerprint.
    pub fn evict(&self, path: &Path) {
        if let Ok(canonical) = path.canonicalize() {
            self.entries.remove(&canonical);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
