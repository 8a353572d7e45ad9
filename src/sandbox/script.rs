//! Scripted in-memory sandbox for deterministic tests.
//!
//! Holds snapshots as file maps and answers commands from registered
//! responders, so validator and solve-loop behavior can be exercised without
//! a Docker daemon. Patch application is interpreted for real: a command of
//! the form `patch -p1 < some.diff` applies the named diff (using
//! [`crate::diff`]) to the snapshot's files, which keeps the round-trip
//! semantics honest.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExecOutput, Sandbox};
use crate::diff;
use crate::error::SandboxError;

/// Context a responder sees for one exec call.
pub struct ScriptCtx {
    pub snapshot: String,
    pub command: String,
    /// Snapshot file contents at call time.
    pub files: HashMap<String, String>,
}

type Responder = Box<dyn Fn(&ScriptCtx) -> Result<ExecOutput, SandboxError> + Send + Sync>;

#[derive(Default)]
struct State {
    snapshots: HashMap<String, HashMap<String, String>>,
    responders: Vec<(String, Responder)>,
    exec_log: Vec<(String, String)>,
}

/// Deterministic, fully in-memory [`Sandbox`] implementation.
#[derive(Default)]
pub struct ScriptedSandbox {
    state: Mutex<State>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sandbox whose `clean` snapshot holds the given files.
    pub fn with_clean_files(files: &[(&str, &str)]) -> Self {
        let sandbox = Self::new();
        {
            let mut state = sandbox.state.lock().expect("sandbox lock");
            let map = files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect();
            state.snapshots.insert(super::snapshots::CLEAN.to_string(), map);
        }
        sandbox
    }

    /// Register a responder for commands containing `pattern`.
    ///
    /// Responders are consulted in registration order; the first match wins.
    pub fn on_command<F>(&self, pattern: impl Into<String>, responder: F)
    where
        F: Fn(&ScriptCtx) -> Result<ExecOutput, SandboxError> + Send + Sync + 'static,
    {
        let mut state = self.state.lock().expect("sandbox lock");
        state.responders.push((pattern.into(), Box::new(responder)));
    }

    /// Commands executed so far, as (snapshot, command) pairs.
    pub fn exec_log(&self) -> Vec<(String, String)> {
        self.state.lock().expect("sandbox lock").exec_log.clone()
    }

    /// Current content of a file in a snapshot, if present.
    pub fn file_content(&self, snapshot: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .expect("sandbox lock")
            .snapshots
            .get(snapshot)
            .and_then(|files| files.get(path).cloned())
    }

    /// Names of currently existing snapshots.
    pub fn snapshot_names(&self) -> Vec<String> {
        let state = self.state.lock().expect("sandbox lock");
        let mut names: Vec<String> = state.snapshots.keys().cloned().collect();
        names.sort();
        names
    }

    /// Interpret `patch -p1 [-R] < file.diff` against the snapshot files.
    fn interpret_patch(
        files: &mut HashMap<String, String>,
        command: &str,
    ) -> Option<ExecOutput> {
        if !command.starts_with("patch -p1") {
            return None;
        }
        let reverse = command.contains(" -R ") || command.contains(" -R<");
        let diff_file = command.split('<').nth(1)?.trim().to_string();
        let Some(diff_text) = files.get(&diff_file).cloned() else {
            return Some(ExecOutput::completed(
                2,
                "",
                format!("{diff_file}: No such file"),
            ));
        };
        let patches = match diff::parse(&diff_text) {
            Ok(p) => p,
            Err(e) => return Some(ExecOutput::completed(1, "", format!("malformed patch: {e}"))),
        };
        // Stage all files first so a mid-diff conflict leaves nothing applied.
        let mut staged: Vec<(String, String)> = Vec::new();
        for patch in &patches {
            let original = files.get(&patch.path).cloned().unwrap_or_default();
            let result = if reverse {
                patch.revert(&original)
            } else {
                patch.apply(&original)
            };
            match result {
                Ok(updated) => staged.push((patch.path.clone(), updated)),
                Err(e) => {
                    return Some(ExecOutput::completed(
                        1,
                        "",
                        format!("patch failed for {}: {e}", patch.path),
                    ))
                }
            }
        }
        for (path, content) in staged {
            files.insert(path, content);
        }
        Some(ExecOutput::completed(0, "", ""))
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn exec(
        &self,
        snapshot: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let mut state = self.state.lock().expect("sandbox lock");
        state
            .exec_log
            .push((snapshot.to_string(), command.to_string()));

        if !state.snapshots.contains_key(snapshot) {
            return Err(SandboxError::SnapshotNotFound(snapshot.to_string()));
        }

        // Patch interpretation mutates the snapshot in place.
        {
            let files = state
                .snapshots
                .get_mut(snapshot)
                .expect("snapshot checked above");
            if let Some(output) = Self::interpret_patch(files, command) {
                return Ok(output);
            }
        }

        let ctx = ScriptCtx {
            snapshot: snapshot.to_string(),
            command: command.to_string(),
            files: state.snapshots[snapshot].clone(),
        };
        for (pattern, responder) in &state.responders {
            if command.contains(pattern.as_str()) {
                return responder(&ctx);
            }
        }
        Ok(ExecOutput::completed(0, "", ""))
    }

    async fn write_file(
        &self,
        snapshot: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let mut state = self.state.lock().expect("sandbox lock");
        let files = state
            .snapshots
            .get_mut(snapshot)
            .ok_or_else(|| SandboxError::SnapshotNotFound(snapshot.to_string()))?;
        files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn file_exists(&self, snapshot: &str, path: &str) -> Result<bool, SandboxError> {
        let state = self.state.lock().expect("sandbox lock");
        let files = state
            .snapshots
            .get(snapshot)
            .ok_or_else(|| SandboxError::SnapshotNotFound(snapshot.to_string()))?;
        Ok(files.contains_key(path))
    }

    async fn fork(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().expect("sandbox lock");
        let files = state
            .snapshots
            .get(from)
            .ok_or_else(|| SandboxError::SnapshotNotFound(from.to_string()))?
            .clone();
        state.snapshots.insert(to.to_string(), files);
        Ok(())
    }

    async fn remove(&self, snapshot: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().expect("sandbox lock");
        state.snapshots.remove(snapshot);
        Ok(())
    }
}
