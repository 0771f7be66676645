// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Builtin module registry
//!
//! Builtin modules announce themselves while the host loader runs their
//! initializers, which can be long before the runtime is ready to receive
//! them. Registrations made before a callback exists wait here; installing
//! the callback delivers them in registration order with the main executable
//! last. Afterwards every registration is synthesized and delivered at once.

use crate::config::BridgeConfig;
use crate::host::{HostLoader, NativeHandle, PageMapper, ViewRegistrar};
use crate::image::{ModuleTemplate, Synthesizer, SyntheticImage};
use crate::resolver::NameResolver;
use crate::segments::SegmentLocator;
use crate::{BridgeError, Result};
use tracing::{debug, warn};

/// Receives each synthesized image with the filename it was registered under
///
/// A module whose image could not be synthesized is delivered as `None`.
/// The main executable is delivered with an empty filename.
pub type ImageCallback = Box<dyn FnMut(Option<SyntheticImage>, &str) + Send>;

/// Host primitives the registry drives
pub struct HostServices {
    pub mapper: Box<dyn PageMapper + Send>,
    pub locator: Box<dyn SegmentLocator + Send>,
    pub views: Box<dyn ViewRegistrar + Send>,
    pub loader: Box<dyn HostLoader + Send>,
}

/// Result of [`BuiltinRegistry::load_by_name`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedModule {
    /// A pending builtin was synthesized and handed to the callback
    Delivered,
    /// The module was opened through the host loader
    Native(NativeHandle),
}

#[derive(Debug)]
struct PendingModule {
    template: &'static ModuleTemplate,
    filename: String,
}

/// Registry of builtin modules
pub struct BuiltinRegistry {
    host: HostServices,
    resolver: NameResolver,
    capacity: usize,
    pending: Vec<PendingModule>,
    main_executable: Option<&'static ModuleTemplate>,
    callback: Option<ImageCallback>,
}

impl BuiltinRegistry {
    /// Empty registry over `host`
    pub fn new(host: HostServices, config: &BridgeConfig) -> Self {
        Self {
            host,
            resolver: NameResolver::new(config),
            capacity: config.registry_capacity,
            pending: Vec::new(),
            main_executable: None,
            callback: None,
        }
    }

    /// Replace the resolver, e.g. with one carrying a fixed search path
    pub fn with_resolver(mut self, resolver: NameResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    /// Number of library registrations waiting for a callback
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a main executable registration is waiting for a callback
    pub fn has_pending_main_executable(&self) -> bool {
        self.main_executable.is_some()
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Register a builtin module
    ///
    /// With a callback installed the module is delivered immediately.
    /// Otherwise a library joins the pending list and the main executable
    /// takes the single main-executable slot, replacing any earlier one.
    pub fn register(&mut self, template: &'static ModuleTemplate, filename: &str) -> Result<()> {
        if self.callback.is_some() {
            self.deliver(template, filename);
            return Ok(());
        }

        if template.is_main_executable() {
            if self.main_executable.replace(template).is_some() {
                debug!("main executable registration replaced");
            }
            return Ok(());
        }

        if self.pending.len() >= self.capacity {
            return Err(BridgeError::RegistryFull {
                capacity: self.capacity,
            });
        }
        debug!("builtin {filename} pending");
        self.pending.push(PendingModule {
            template,
            filename: filename.to_string(),
        });
        Ok(())
    }

    /// Install the delivery callback and drain everything pending
    ///
    /// # Panics
    /// Panics if a callback is already installed.
    pub fn install_callback<F>(&mut self, callback: F)
    where
        F: FnMut(Option<SyntheticImage>, &str) + Send + 'static,
    {
        assert!(
            self.callback.is_none(),
            "builtin module callback installed twice"
        );
        self.callback = Some(Box::new(callback));

        for module in std::mem::take(&mut self.pending) {
            self.deliver(module.template, &module.filename);
        }
        if let Some(main) = self.main_executable.take() {
            self.deliver(main, "");
        }
    }

    /// Load a module by its Windows filename
    ///
    /// A pending builtin with that name is delivered through the callback.
    /// Names are compared ignoring ASCII case, as Windows compares module
    /// names, so `Shell32.dll` matches a registration as `SHELL32.DLL`.
    /// Anything else goes through the resolver and the host loader.
    ///
    /// # Panics
    /// Panics if no callback is installed.
    pub fn load_by_name(&mut self, filename: &str) -> Result<LoadedModule> {
        assert!(
            self.callback.is_some(),
            "load_by_name called before a builtin module callback was installed"
        );

        if let Some(index) = self
            .pending
            .iter()
            .position(|module| module.filename.eq_ignore_ascii_case(filename))
        {
            let module = self.pending.remove(index);
            self.deliver(module.template, &module.filename);
            return Ok(LoadedModule::Delivered);
        }

        self.resolver
            .open(filename, self.host.loader.as_ref())
            .map(LoadedModule::Native)
    }

    /// Open the main executable by its literal name through the host loader
    pub fn open_main_executable(&self, name: &str, search_path: bool) -> Result<NativeHandle> {
        self.resolver
            .open_main_executable(name, search_path, self.host.loader.as_ref())
    }

    /// Release a module returned by [`BuiltinRegistry::load_by_name`]
    pub fn unload(&self, module: LoadedModule) {
        match module {
            LoadedModule::Delivered => {}
            LoadedModule::Native(handle) => self.host.loader.close(handle),
        }
    }

    /// Synthesize an image for `template` with this registry's host services
    pub fn synthesize(&self, template: &ModuleTemplate) -> Result<SyntheticImage> {
        Synthesizer::new(
            self.host.mapper.as_ref(),
            self.host.locator.as_ref(),
            self.host.views.as_ref(),
        )
        .synthesize(template)
    }

    fn deliver(&mut self, template: &ModuleTemplate, filename: &str) {
        let image = match self.synthesize(template) {
            Ok(image) => {
                debug!("delivering builtin {filename:?} at {:#x}", image.base());
                Some(image)
            }
            Err(err) => {
                warn!("cannot synthesize builtin {filename:?}: {err}");
                None
            }
        };
        if let Some(callback) = self.callback.as_mut() {
            callback(image, filename);
        }
    }
}
