// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bridge configuration

/// Environment variable holding the builtin DLL search path
pub const DEFAULT_SEARCH_PATH_VAR: &str = "BUILTIN_DLL_PATH";

/// Environment variable searched for the main executable
pub const DEFAULT_EXE_SEARCH_VAR: &str = "PATH";

/// Environment variable overriding the pending registry capacity
pub const REGISTRY_CAPACITY_VAR: &str = "BUILTIN_REGISTRY_CAPACITY";

/// Maximum number of builtin modules waiting for a callback
pub const DEFAULT_REGISTRY_CAPACITY: usize = 100;

/// How the host names shared libraries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeNaming {
    /// Prepended to every translated module name
    pub prefix: String,
    /// Native shared-library suffix, including the dot
    pub suffix: String,
}

impl NativeNaming {
    /// Naming convention of the platform this crate was built for
    pub fn host() -> Self {
        let suffix = if cfg!(target_vendor = "apple") {
            ".dylib"
        } else {
            ".so"
        };
        Self::new("lib", suffix)
    }

    /// Create a naming convention from an explicit prefix and suffix
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

impl Default for NativeNaming {
    fn default() -> Self {
        Self::host()
    }
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Variable the DLL search path is read from
    pub search_path_var: String,
    /// PATH-style variable used to find the main executable
    pub exe_search_var: String,
    /// How many modules may wait for a callback
    pub registry_capacity: usize,
    /// Library naming convention
    pub naming: NativeNaming,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            search_path_var: DEFAULT_SEARCH_PATH_VAR.to_string(),
            exe_search_var: DEFAULT_EXE_SEARCH_VAR.to_string(),
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
            naming: NativeNaming::host(),
        }
    }
}

impl BridgeConfig {
    /// Default configuration with overrides taken from the environment
    ///
    /// Only [`REGISTRY_CAPACITY_VAR`] is consulted here; the search path
    /// itself is read lazily by the resolver.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(REGISTRY_CAPACITY_VAR) {
            Ok(value) => match value.trim().parse() {
                Ok(capacity) => config.with_registry_capacity(capacity),
                Err(_) => {
                    tracing::warn!("ignoring {REGISTRY_CAPACITY_VAR}={value}: not a number");
                    config
                }
            },
            Err(_) => config,
        }
    }

    /// Set the search path variable name
    pub fn with_search_path_var(mut self, var: impl Into<String>) -> Self {
        self.search_path_var = var.into();
        self
    }

    /// Set the executable search variable name
    pub fn with_exe_search_var(mut self, var: impl Into<String>) -> Self {
        self.exe_search_var = var.into();
        self
    }

    /// Set the pending registry capacity
    pub fn with_registry_capacity(mut self, capacity: usize) -> Self {
        self.registry_capacity = capacity;
        self
    }

    /// Set the library naming convention
    pub fn with_naming(mut self, naming: NativeNaming) -> Self {
        self.naming = naming;
        self
    }
}
