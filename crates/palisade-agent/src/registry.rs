use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use palisade_instance::{
    InstanceDefinition, InstanceState, InstanceStateView, OperationKind, OperationResult,
    StatusSnapshot,
};

use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::session::SessionHandle;
use crate::support::CancelFlag;

/// Keep instance names safe for filesystem paths and display.
pub(crate) fn validate_instance_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("instance name must be non-empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::Validation(format!("invalid instance name: {name}")));
    }
    if name.starts_with('.') {
        return Err(Error::Validation(format!("invalid instance name: {name}")));
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct RuntimeState {
    pub state: InstanceState,
    pub session: Option<SessionHandle>,
    pub last_status: Option<StatusSnapshot>,
    pub last_result: Option<OperationResult>,
    pub orphaned: bool,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            state: InstanceState::Down,
            session: None,
            last_status: None,
            last_result: None,
            orphaned: false,
        }
    }
}

/// Mutable runtime of one instance. The lifecycle engine is the only writer
/// of `state`; status reads take the short inner mutex, never the operation
/// lock.
#[derive(Debug)]
pub(crate) struct InstanceRuntime {
    pub name: String,
    /// Exclusive gate for state-changing operations, held for the full
    /// duration of a call. `try_lock` only; contention is rejected, not
    /// queued.
    pub op_lock: Arc<tokio::sync::Mutex<()>>,
    /// Which operation currently holds the lock, for rejection messages.
    pub in_flight: Mutex<Option<OperationKind>>,
    pub state: Mutex<RuntimeState>,
    pub events: EventLog,
    pub cancel: CancelFlag,
}

impl InstanceRuntime {
    fn new(name: String) -> Self {
        Self {
            name,
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: Mutex::new(None),
            state: Mutex::new(RuntimeState::default()),
            events: EventLog::default(),
            cancel: CancelFlag::default(),
        }
    }

    pub fn lock_state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn view(&self) -> InstanceStateView {
        let state = self.lock_state();
        InstanceStateView {
            name: self.name.clone(),
            state: state.state,
            session_pid: state.session.as_ref().map(|s| s.pid()),
            last_status: state.last_status.clone(),
            last_result: state.last_result.clone(),
            orphaned: state.orphaned,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Definition source order; `list` is stable across calls.
    order: Vec<String>,
    defs: HashMap<String, InstanceDefinition>,
    runtime: HashMap<String, Arc<InstanceRuntime>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub retained: Vec<String>,
    pub orphaned: Vec<String>,
}

/// The explicitly constructed, passed-by-reference registry of all
/// instances: ordered definitions plus each instance's runtime state and
/// event history. Definitions are immutable between reloads.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    inner: Mutex<RegistryInner>,
}

impl InstanceRegistry {
    pub fn new(defs: Vec<InstanceDefinition>) -> Result<Self> {
        let registry = Self::default();
        registry.reload(defs)?;
        Ok(registry)
    }

    /// Definitions in source order.
    pub fn list(&self) -> Vec<InstanceDefinition> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter_map(|name| inner.defs.get(name).cloned())
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<InstanceDefinition> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .defs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Replace the definition set.
    ///
    /// Runtime state survives for names that persist; removed instances are
    /// marked orphaned (state retained, no further operations accepted)
    /// rather than dropped while an operation may be in flight. A name that
    /// reappears is un-orphaned.
    pub fn reload(&self, defs: Vec<InstanceDefinition>) -> Result<ReloadReport> {
        let mut order = Vec::with_capacity(defs.len());
        let mut new_defs = HashMap::with_capacity(defs.len());
        for def in defs {
            validate_instance_name(&def.name)?;
            if new_defs.contains_key(&def.name) {
                return Err(Error::Validation(format!(
                    "duplicate instance name: {}",
                    def.name
                )));
            }
            order.push(def.name.clone());
            new_defs.insert(def.name.clone(), def);
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = ReloadReport {
            added: Vec::new(),
            retained: Vec::new(),
            orphaned: Vec::new(),
        };

        for name in &order {
            if let Some(runtime) = inner.runtime.get(name) {
                let mut state = runtime.state.lock().unwrap_or_else(|e| e.into_inner());
                state.orphaned = false;
                report.retained.push(name.clone());
            } else {
                inner
                    .runtime
                    .insert(name.clone(), Arc::new(InstanceRuntime::new(name.clone())));
                report.added.push(name.clone());
            }
        }

        for (name, runtime) in &inner.runtime {
            if !new_defs.contains_key(name) {
                let mut state = runtime.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.orphaned {
                    state.orphaned = true;
                    report.orphaned.push(name.clone());
                }
            }
        }

        inner.order = order;
        inner.defs = new_defs;
        tracing::info!(
            added = report.added.len(),
            retained = report.retained.len(),
            orphaned = report.orphaned.len(),
            "registry reloaded"
        );
        Ok(report)
    }

    /// Runtime entry for a known or orphaned instance.
    pub(crate) fn runtime(&self, name: &str) -> Result<Arc<InstanceRuntime>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .runtime
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn views(&self) -> Vec<InstanceStateView> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter_map(|name| inner.runtime.get(name).map(|r| r.view()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn def(name: &str) -> InstanceDefinition {
        InstanceDefinition {
            name: name.to_string(),
            data_dir: PathBuf::from(format!("/srv/{name}")),
            command: "java".to_string(),
            args: vec![],
            memory_mb: Some(2048),
            query_host: "127.0.0.1".to_string(),
            query_port: 25565,
            stop_command: "stop".to_string(),
            graceful_timeout_ms: 30_000,
            startup_confirm_ms: 2_000,
            pause_writes_on_live_backup: true,
        }
    }

    #[test]
    fn list_preserves_source_order() {
        let registry =
            InstanceRegistry::new(vec![def("zeta"), def("alpha"), def("mid")]).unwrap();
        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let registry = InstanceRegistry::new(vec![def("survival1")]).unwrap();
        assert!(registry.get("survival1").is_ok());
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn rejects_duplicate_and_invalid_names() {
        let err = InstanceRegistry::new(vec![def("a"), def("a")]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = InstanceRegistry::new(vec![def("bad/name")]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(validate_instance_name("survival1").is_ok());
        assert!(validate_instance_name("with space").is_err());
        assert!(validate_instance_name(".hidden").is_err());
        assert!(validate_instance_name("").is_err());
    }

    #[test]
    fn reload_preserves_runtime_and_orphans_removed() {
        let registry = InstanceRegistry::new(vec![def("keep"), def("drop")]).unwrap();

        {
            let runtime = registry.runtime("keep").unwrap();
            let mut state = runtime.state.lock().unwrap();
            state.state = InstanceState::Up;
        }

        let report = registry.reload(vec![def("keep"), def("fresh")]).unwrap();
        assert_eq!(report.retained, vec!["keep"]);
        assert_eq!(report.added, vec!["fresh"]);
        assert_eq!(report.orphaned, vec!["drop"]);

        // Runtime for the persisting name is untouched.
        let runtime = registry.runtime("keep").unwrap();
        assert_eq!(runtime.view().state, InstanceState::Up);

        // Orphan keeps its runtime but is flagged.
        let dropped = registry.runtime("drop").unwrap();
        assert!(dropped.view().orphaned);
        assert!(registry.get("drop").is_err());

        // Re-adding the name clears the orphan flag.
        registry.reload(vec![def("keep"), def("fresh"), def("drop")]).unwrap();
        assert!(!registry.runtime("drop").unwrap().view().orphaned);
    }
}
