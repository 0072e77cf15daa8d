//! Process-wide broker/VM bootstrap.
//!
//! The broker task and the default VM belong to a process-wide registry:
//! the first [`RuntimeBuilder::start`] for a URL spins them up, later
//! starts attach to the same substrate, and the whole thing tears down
//! when the last [`RuntimeHandle`] drops.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};

use tracing::debug;

use ailoy_broker::{BrokerError, BrokerHandle, Runtime};
use ailoy_vm::{ModuleRegistry, VmHandle};

/// Default in-process endpoint.
pub const DEFAULT_URL: &str = "inproc://ailoy";

struct Substrate {
    url: String,
    _broker: BrokerHandle,
    _vm: VmHandle,
}

impl Drop for Substrate {
    fn drop(&mut self) {
        debug!(url = %self.url, "tearing down runtime substrate");
        if let Some(registry) = SUBSTRATES.get() {
            let mut registry = registry.lock().expect("substrate registry poisoned");
            // Only clear a dead entry; a racing start may have replaced it.
            let dead = registry
                .get(&self.url)
                .map(|w| w.upgrade().is_none())
                .unwrap_or(false);
            if dead {
                registry.remove(&self.url);
            }
        }
    }
}

static SUBSTRATES: OnceLock<StdMutex<HashMap<String, Weak<Substrate>>>> = OnceLock::new();

fn substrates() -> &'static StdMutex<HashMap<String, Weak<Substrate>>> {
    SUBSTRATES.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// A connected runtime client plus a keep-alive on its substrate.
///
/// Cheap to clone through `Runtime`'s own `Clone`; the broker and VM stay
/// up while any handle (or clone of its inner runtime) is alive.
pub struct RuntimeHandle {
    runtime: Runtime,
    _substrate: Arc<Substrate>,
}

impl RuntimeHandle {
    /// The underlying client.
    pub fn runtime(&self) -> Runtime {
        self.runtime.clone()
    }
}

impl Deref for RuntimeHandle {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.runtime
    }
}

/// Builds the default substrate: broker + one VM serving the chosen
/// modules.
pub struct RuntimeBuilder {
    url: String,
    modules: ModuleRegistry,
}

impl RuntimeBuilder {
    /// A builder for the default URL, preloaded with the VM builtins
    /// (and the remote provider components when that feature is on).
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut modules = ailoy_vm::builtins();
        #[cfg(feature = "provider-openai")]
        modules
            .merge(ailoy_provider_openai::remote_model_module())
            .expect("builtin modules are disjoint");
        Self {
            url: DEFAULT_URL.to_owned(),
            modules,
        }
    }

    /// Bind to a different endpoint URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Add modules to the VM (e.g. `language_model_module`).
    ///
    /// # Errors
    ///
    /// `already_exists` through the broker error on name collisions.
    pub fn with_modules(mut self, modules: ModuleRegistry) -> Result<Self, BrokerError> {
        self.modules
            .merge(modules)
            .map_err(ailoy_broker::BrokerError::Component)?;
        Ok(self)
    }

    /// Start (or attach to) the substrate and connect a client.
    ///
    /// When the URL already has a live substrate, its modules are used
    /// as-is and this builder's module additions are ignored.
    pub fn start(self) -> Result<RuntimeHandle, BrokerError> {
        let substrate = {
            let mut registry = substrates().lock().expect("substrate registry poisoned");
            match registry.get(&self.url).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    debug!(url = %self.url, "starting runtime substrate");
                    let broker = ailoy_broker::spawn(&self.url)?;
                    let vm = ailoy_vm::spawn(&self.url, self.modules)?;
                    let substrate = Arc::new(Substrate {
                        url: self.url.clone(),
                        _broker: broker,
                        _vm: vm,
                    });
                    registry.insert(self.url.clone(), Arc::downgrade(&substrate));
                    substrate
                }
            }
        };

        let runtime = Runtime::connect(&substrate.url)?;
        Ok(RuntimeHandle {
            runtime,
            _substrate: substrate,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
