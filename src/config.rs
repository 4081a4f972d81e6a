//! CPU core configuration
//!
//! Settings are plain TOML:
//!
//! ```toml
//! execution_mode = "recompiler"       # interpreter | cached_interpreter | recompiler
//! fastmem_mode = "mmap"               # disabled | lut | mmap
//! icache_emulation = false
//! memory_exceptions = false
//! code_buffer_size = 33554432
//! max_block_instructions = 128
//! ```
//!
//! Missing keys take their default value. The user file lives at
//! `<config dir>/rustation-cpu/cpu.toml`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PsxError, Result};

/// Engine executing guest code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Interpreter,
    CachedInterpreter,
    Recompiler,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Interpreter => "interpreter",
            ExecutionMode::CachedInterpreter => "cached interpreter",
            ExecutionMode::Recompiler => "recompiler",
        })
    }
}

/// Fast path used for guest memory accesses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastmemMode {
    Disabled,
    Lut,
    Mmap,
}

pub const DEFAULT_CODE_BUFFER_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAX_BLOCK_INSTRUCTIONS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub execution_mode: ExecutionMode,
    pub fastmem_mode: FastmemMode,
    /// Model ICache hits and fill latency
    pub icache_emulation: bool,
    /// Recompiled code checks bus errors on every access. When off, bus
    /// errors are delivered at the end of the block. Misaligned accesses
    /// always raise their address error at the faulting instruction.
    pub memory_exceptions: bool,
    /// Bytes of host code the recompiler may emit before it resets
    pub code_buffer_size: usize,
    pub max_block_instructions: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            execution_mode: ExecutionMode::Recompiler,
            fastmem_mode: FastmemMode::Lut,
            icache_emulation: false,
            memory_exceptions: false,
            code_buffer_size: DEFAULT_CODE_BUFFER_SIZE,
            max_block_instructions: DEFAULT_MAX_BLOCK_INSTRUCTIONS,
        }
    }
}

impl CpuConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CpuConfig =
            toml::from_str(content).map_err(|e| PsxError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded CPU config from {}", path.display());
        Ok(config)
    }

    /// Load the user config file, or the defaults if there is none
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| PsxError::ConfigError(e.to_string()))
    }

    /// Path to the user config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("rustation-cpu").join("cpu.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_block_instructions == 0 {
            return Err(PsxError::ConfigError(
                "max_block_instructions must be at least 1".to_string(),
            ));
        }
        if self.code_buffer_size < 64 * 1024 {
            return Err(PsxError::ConfigError(format!(
                "code_buffer_size {} is below the 64KiB minimum",
                self.code_buffer_size
            )));
        }
        Ok(())
    }
}
