//! Process context - the one place holding process-wide mutable state.
//!
//! Built once per process and handed to components as `Arc<EngineContext>`.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::core::{Config, Error, Result};

pub struct EngineContext {
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    instance_id: String,
    client_order_seq: AtomicU64,
    internal_reject_seq: AtomicI64,
}

impl EngineContext {
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    /// Context whose config can later be re-read with [`EngineContext::reload`].
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load(&path)?;
        Ok(Self::build(config, Some(path)))
    }

    fn build(config: Config, config_path: Option<PathBuf>) -> Self {
        let instance_id = config
            .engine
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());
        Self {
            config: RwLock::new(config),
            config_path,
            instance_id,
            client_order_seq: AtomicU64::new(0),
            internal_reject_seq: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Re-read the config file. The instance id and counters are kept.
    pub fn reload(&self) -> Result<Config> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| Error::Config("context was not built from a file".into()))?;
        let fresh = Config::load(path)?;
        *self.config.write() = fresh.clone();
        tracing::info!("🔄 Reloaded config from {}", path.display());
        Ok(fresh)
    }

    /// Replace the config in place (sibling-service pushes, tests).
    pub fn replace_config(&self, config: Config) {
        *self.config.write() = config;
    }

    pub(crate) fn next_client_order_seq(&self) -> u64 {
        self.client_order_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// -1, -2, -3, ...
    pub(crate) fn next_internal_reject_seq(&self) -> i64 {
        self.internal_reject_seq.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_counters_are_monotonic() {
        let ctx = EngineContext::new(Config::default());
        assert_eq!(ctx.next_client_order_seq(), 1);
        assert_eq!(ctx.next_client_order_seq(), 2);
        assert_eq!(ctx.next_internal_reject_seq(), -1);
        assert_eq!(ctx.next_internal_reject_seq(), -2);
        assert_eq!(ctx.instance_id().len(), 8);
    }

    #[test]
    fn test_reload_is_explicit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ninstance_id = \"ctx-1\"\n[kill_switch]\nis_kill_switch_enabled = false").unwrap();
        let ctx = EngineContext::from_file(file.path()).unwrap();
        assert!(!ctx.config().kill_switch.is_kill_switch_enabled);

        std::fs::write(
            file.path(),
            "[engine]\ninstance_id = \"ctx-2\"\n[kill_switch]\nis_kill_switch_enabled = true\n",
        )
        .unwrap();
        // edits are invisible until reload
        assert!(!ctx.config().kill_switch.is_kill_switch_enabled);

        let fresh = ctx.reload().unwrap();
        assert!(fresh.kill_switch.is_kill_switch_enabled);
        assert!(ctx.config().kill_switch.is_kill_switch_enabled);
        assert_eq!(ctx.instance_id(), "ctx-1");
    }

    #[test]
    fn test_reload_without_file_fails() {
        let ctx = EngineContext::new(Config::default());
        assert!(matches!(ctx.reload(), Err(Error::Config(_))));
    }
}
