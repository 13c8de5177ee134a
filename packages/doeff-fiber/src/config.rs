//! Runtime configuration.
//!
//! Loaded from a TOML document. Every field has a default, so an empty
//! document (or no file at all) yields [`RuntimeConfig::default`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How frames on a stack are laid out, which decides how roots are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    /// Interpreted frames: every used word is a potential reference.
    #[default]
    Bytecode,
    /// Compiled frames described by a frame-descriptor table.
    Native,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Capacity of each domain's main stack, in words.
    #[serde(default = "default_init_stack_words")]
    pub init_stack_words: usize,

    /// Initial capacity of a freshly allocated fiber, excluding the fixed
    /// context footprint.
    #[serde(default = "default_fiber_stack_words")]
    pub fiber_stack_words: usize,

    /// A stack never grows beyond this many words.
    #[serde(default = "default_max_stack_words")]
    pub max_stack_words: usize,

    /// Headroom kept free for native code before `maybe_expand_stack` grows.
    #[serde(default = "default_stack_threshold_words")]
    pub stack_threshold_words: usize,

    /// Young allocation volume after which a minor collection is requested.
    #[serde(default = "default_minor_heap_words")]
    pub minor_heap_words: usize,

    /// Total live words the heap may hold before allocation fails.
    #[serde(default = "default_max_heap_words")]
    pub max_heap_words: usize,

    #[serde(default)]
    pub layout: LayoutKind,
}

fn default_init_stack_words() -> usize {
    4096
}

fn default_fiber_stack_words() -> usize {
    64
}

fn default_max_stack_words() -> usize {
    1024 * 1024
}

fn default_stack_threshold_words() -> usize {
    32
}

fn default_minor_heap_words() -> usize {
    256 * 1024
}

fn default_max_heap_words() -> usize {
    64 * 1024 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            init_stack_words: default_init_stack_words(),
            fiber_stack_words: default_fiber_stack_words(),
            max_stack_words: default_max_stack_words(),
            stack_threshold_words: default_stack_threshold_words(),
            minor_heap_words: default_minor_heap_words(),
            max_heap_words: default_max_heap_words(),
            layout: LayoutKind::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init_stack_words == 0 {
            return Err(ConfigError::Invalid(
                "init_stack_words must be positive".to_string(),
            ));
        }
        if self.max_stack_words < self.init_stack_words {
            return Err(ConfigError::Invalid(format!(
                "max_stack_words ({}) is smaller than init_stack_words ({})",
                self.max_stack_words, self.init_stack_words
            )));
        }
        if self.max_heap_words < self.init_stack_words {
            return Err(ConfigError::Invalid(format!(
                "max_heap_words ({}) cannot hold the main stack ({} words)",
                self.max_heap_words, self.init_stack_words
            )));
        }
        Ok(())
    }
}
