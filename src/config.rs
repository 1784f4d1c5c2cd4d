//! Shim-side configuration: where the real plugin lives and how to start the
//! helper process.
//!
//! A deployed shim library carries these paths baked in at build time (the
//! bridge maker compiles one shim per plugin with the template variables
//! set); environment variables override them at load time, which is also how
//! development and the test suite point a generic shim at a plugin.

use std::env;
use std::path::PathBuf;

// Filled in by the bridge maker at build time, one shim per bridged plugin.
const TEMPLATE_PLUGIN_PATH: Option<&str> = option_env!("VST2_BRIDGE_PLUGIN_PATH");
const TEMPLATE_HOST_PATH: Option<&str> = option_env!("VST2_BRIDGE_HOST_PATH");
const TEMPLATE_LAUNCHER_PATH: Option<&str> = option_env!("VST2_BRIDGE_LAUNCHER_PATH");

/// `env(1)` resolves the host agent through `PATH` when no explicit launcher
/// is configured.
const DEFAULT_LAUNCHER: &str = "/usr/bin/env";
const DEFAULT_HOST_AGENT: &str = "vst2-bridge-host";

/// Everything the shim needs to spawn the helper: the launcher to go
/// through (typically the foreign-ABI compatibility layer's entry script),
/// the host agent binary, and the real plugin library.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub launcher: PathBuf,
    pub host_agent: PathBuf,
    pub plugin: PathBuf,
}

impl BridgeConfig {
    /// Resolve the configuration from the environment, falling back to the
    /// baked-in template values. Returns `None` when no plugin path is known
    /// at all, in which case the shim cannot come up.
    pub fn from_environment() -> Option<Self> {
        let plugin = env::var("VST2_BRIDGE_PLUGIN")
            .ok()
            .or_else(|| TEMPLATE_PLUGIN_PATH.map(String::from))?;
        let host_agent = env::var("VST2_BRIDGE_HOST")
            .ok()
            .or_else(|| TEMPLATE_HOST_PATH.map(String::from))
            .unwrap_or_else(|| DEFAULT_HOST_AGENT.to_owned());
        let launcher = env::var("VST2_BRIDGE_LAUNCHER")
            .ok()
            .or_else(|| TEMPLATE_LAUNCHER_PATH.map(String::from))
            .unwrap_or_else(|| DEFAULT_LAUNCHER.to_owned());

        Some(Self {
            launcher: PathBuf::from(launcher),
            host_agent: PathBuf::from(host_agent),
            plugin: PathBuf::from(plugin),
        })
    }
}
