//! Application context — durable project facts plus per-request facts.
//!
//! Two stores with separate authority:
//!
//! 1. **Persistent** — project root and project rules. Rebuilt only when the
//!    caller's `projectRoot` changes.
//! 2. **Volatile** — replaced wholesale on every request, then overlaid with
//!    server facts (`cwd` and anything added via [`AppContextService::with_server_fact`])
//!    that the caller cannot override.

use layerflow_config::ContextConfig;
use layerflow_core::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::store::{ContextSnapshot, ContextStore};

pub const PROJECT_ROOT_KEY: &str = "projectRoot";
pub const PROJECT_RULES_KEY: &str = "projectRules";
pub const CWD_KEY: &str = "cwd";

/// Where project rules come from.
pub trait RulesSource: Send + Sync {
    /// Rules text for a project, or `None` when the project has none.
    fn load_rules(&self, project_root: &Path) -> Option<String>;
}

/// Reads `<root>/<rules_dir>/<rules_file>`, by default `.layerflow/RULES.md`.
pub struct FileRulesSource {
    rules_dir: String,
    rules_file: String,
}

impl FileRulesSource {
    pub fn new(rules_dir: impl Into<String>, rules_file: impl Into<String>) -> Self {
        Self {
            rules_dir: rules_dir.into(),
            rules_file: rules_file.into(),
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(&config.rules_dir, &config.rules_file)
    }

    fn rules_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.rules_dir).join(&self.rules_file)
    }
}

impl Default for FileRulesSource {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl RulesSource for FileRulesSource {
    fn load_rules(&self, project_root: &Path) -> Option<String> {
        let path = self.rules_path(project_root);
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => {
                debug!(path = %path.display(), "Loaded project rules");
                Some(content.trim().to_string())
            }
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read project rules");
                None
            }
        }
    }
}

/// Owns the persistent and volatile context stores.
pub struct AppContextService {
    persistent: ContextStore,
    volatile: ContextStore,
    rules: Arc<dyn RulesSource>,
    server_facts: BTreeMap<String, Value>,
    refreshes: AtomicU64,
    /// Serializes request application so root comparison and refresh are atomic.
    apply_lock: Mutex<()>,
}

impl AppContextService {
    /// Create a service. `cwd` is registered as a server fact when known.
    pub fn new(rules: Arc<dyn RulesSource>) -> Self {
        let mut server_facts = BTreeMap::new();
        if let Ok(cwd) = std::env::current_dir() {
            server_facts.insert(CWD_KEY.to_string(), Value::text(cwd.display().to_string()));
        }
        Self {
            persistent: ContextStore::new(),
            volatile: ContextStore::new(),
            rules,
            server_facts,
            refreshes: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
        }
    }

    /// Add a fact that is injected into every request and wins over the caller.
    pub fn with_server_fact(mut self, key: impl Into<String>, value: Value) -> Self {
        self.server_facts.insert(key.into(), value);
        self
    }

    /// Install a request's context. Returns `true` when the persistent store
    /// was refreshed because `projectRoot` changed.
    pub fn apply_request(&self, request: BTreeMap<String, Value>) -> bool {
        let _guard = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());

        let requested_root = request
            .get(PROJECT_ROOT_KEY)
            .map(|v| v.to_string())
            .filter(|root| !root.is_empty());
        let current_root = self.persistent.get(PROJECT_ROOT_KEY).map(|v| v.to_string());

        let refreshed = match requested_root {
            Some(root) if current_root.as_deref() != Some(root.as_str()) => {
                self.refresh_persistent(&root);
                true
            }
            _ => false,
        };

        self.volatile.replace_all(request);
        for (key, value) in &self.server_facts {
            self.volatile.set(key.clone(), value.clone());
        }

        refreshed
    }

    fn refresh_persistent(&self, root: &str) {
        let mut entries = BTreeMap::new();
        entries.insert(PROJECT_ROOT_KEY.to_string(), Value::text(root));
        if let Some(rules) = self.rules.load_rules(Path::new(root)) {
            entries.insert(PROJECT_RULES_KEY.to_string(), Value::text(rules));
        }
        self.persistent.replace_all(entries);
        let count = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        info!(project_root = %root, refreshes = count, "Refreshed persistent context");
    }

    pub fn persistent(&self) -> ContextSnapshot {
        self.persistent.snapshot()
    }

    pub fn volatile(&self) -> ContextSnapshot {
        self.volatile.snapshot()
    }

    /// How many times the persistent store has been rebuilt.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}
