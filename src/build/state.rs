//! Accumulated modifier state during step execution.

use std::collections::BTreeMap;

use crate::recipe::Step;

/// Default shell used for run steps when no shell modifier has been set.
const DEFAULT_SHELL: &str = "/bin/sh";

/// Tracks accumulated modifiers during step execution.
///
/// State flows linearly through the step list. Standalone modifiers update
/// the state permanently via [`StepState::apply`]. Operations read the
/// effective values for a single step via [`StepState::resolve`] without
/// modifying the persistent state.
#[derive(Debug, Clone)]
pub(crate) struct StepState {
    pub(crate) shell: String,
    pub(crate) workdir: String,
    pub(crate) env: BTreeMap<String, String>,
}

impl StepState {
    pub(crate) fn new() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            workdir: String::new(),
            env: BTreeMap::new(),
        }
    }

    /// Persists modifier fields from a step into the state.
    ///
    /// Called for standalone modifier steps and groups. The state is
    /// mutated permanently, affecting all subsequent steps.
    pub(crate) fn apply(&mut self, step: &Step) {
        if !step.shell.is_empty() {
            self.shell = step.shell.clone();
        }
        if !step.workdir.is_empty() {
            self.workdir = step.workdir.clone();
        }
        self.env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Returns a new state with step-level modifiers overlaid on the
    /// persistent state. The receiver is not modified.
    pub(crate) fn resolve(&self, step: &Step) -> Self {
        let mut resolved = self.clone();
        resolved.apply(step);
        resolved
    }

    /// Formats the environment as `KEY=VALUE` strings for container exec.
    pub(crate) fn environ(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(shell: &str, workdir: &str, env: &[(&str, &str)]) -> Step {
        Step {
            shell: shell.to_string(),
            workdir: workdir.to_string(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Step::default()
        }
    }

    #[test]
    fn new_state_defaults() {
        let s = StepState::new();
        assert_eq!(s.shell, DEFAULT_SHELL);
        assert!(s.workdir.is_empty());
        assert!(s.env.is_empty());
    }

    #[test]
    fn apply_sets_nonempty_fields() {
        let mut s = StepState::new();

        s.apply(&step("/bin/bash", "", &[]));
        assert_eq!(s.shell, "/bin/bash");

        s.apply(&step("", "/app", &[]));
        assert_eq!(s.workdir, "/app");
        assert_eq!(s.shell, "/bin/bash");

        s.apply(&step("", "", &[("A", "1"), ("B", "2")]));
        assert_eq!(s.env["A"], "1");
        assert_eq!(s.env["B"], "2");

        s.apply(&step("", "", &[("A", "override")]));
        assert_eq!(s.env["A"], "override");
        assert_eq!(s.env["B"], "2");
    }

    #[test]
    fn apply_empty_step_is_noop() {
        let mut s = StepState::new();
        s.apply(&step("/bin/zsh", "/opt", &[]));
        s.apply(&Step::default());
        assert_eq!(s.shell, "/bin/zsh");
        assert_eq!(s.workdir, "/opt");
    }

    #[test]
    fn resolve_overlays_without_mutating() {
        let mut s = StepState::new();
        s.apply(&step("/bin/bash", "/app", &[("A", "1")]));

        let resolved = s.resolve(&step("/bin/zsh", "/tmp", &[("B", "2")]));
        assert_eq!(resolved.shell, "/bin/zsh");
        assert_eq!(resolved.workdir, "/tmp");
        assert_eq!(resolved.env["A"], "1");
        assert_eq!(resolved.env["B"], "2");

        assert_eq!(s.shell, "/bin/bash");
        assert_eq!(s.workdir, "/app");
        assert!(!s.env.contains_key("B"));
    }

    #[test]
    fn resolve_inherits_state() {
        let mut s = StepState::new();
        s.apply(&step("/bin/bash", "/app", &[]));

        let resolved = s.resolve(&Step::default());
        assert_eq!(resolved.shell, "/bin/bash");
        assert_eq!(resolved.workdir, "/app");
    }

    #[test]
    fn resolve_env_override_does_not_leak_back() {
        let mut s = StepState::new();
        s.apply(&step("", "", &[("K", "base")]));

        let resolved = s.resolve(&step("", "", &[("K", "override")]));
        assert_eq!(resolved.env["K"], "override");
        assert_eq!(s.env["K"], "base");
    }

    #[test]
    fn environ_formats_pairs() {
        let mut s = StepState::new();
        assert!(s.environ().is_empty());

        s.apply(&step("", "", &[("PATH", "/usr/bin"), ("HOME", "/root")]));
        let mut env = s.environ();
        env.sort();
        assert_eq!(env, vec!["HOME=/root", "PATH=/usr/bin"]);
    }
}
