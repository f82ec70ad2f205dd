//! Mock transport layer for testing.
//!
//! Provides a scripted, process-global stand-in for SSH and SCP so the
//! orchestration engine can be exercised deterministically without real
//! network dependencies.
//!
//! Enable mock mode by setting `PUV_MOCK_SSH=1`, by using a `mock://` host,
//! or by holding a [`MockScope`] in tests. Scripts are keyed by host; each
//! script maps command substrings to a *sequence* of responses so that,
//! for example, repeated size polls of a growing bundle can return
//! different values on successive calls.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tracing::debug;

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Canned result for one mocked command execution.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    /// Successful command with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed command with the given exit code and stderr.
    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

struct MockRule {
    /// Substring matched against the remote command.
    pattern: String,
    responses: Vec<MockResponse>,
    /// Index of the next response; the last response repeats once the
    /// sequence is exhausted.
    cursor: usize,
}

/// Scripted behavior for one mocked host.
#[derive(Default)]
pub struct MockScript {
    rules: Vec<MockRule>,
    /// Simulate a connection failure for every operation on this host.
    fail_connect: bool,
    /// Remote path -> file content served to `copy_from`.
    files: HashMap<String, String>,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation against this host fails as unreachable.
    pub fn unreachable() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    /// Respond to commands containing `pattern` with a fixed response.
    pub fn on(self, pattern: &str, response: MockResponse) -> Self {
        self.on_sequence(pattern, vec![response])
    }

    /// Respond to commands containing `pattern` with successive responses;
    /// the last one repeats.
    pub fn on_sequence(mut self, pattern: &str, responses: Vec<MockResponse>) -> Self {
        assert!(!responses.is_empty(), "mock rule needs >= 1 response");
        self.rules.push(MockRule {
            pattern: pattern.to_string(),
            responses,
            cursor: 0,
        });
        self
    }

    /// Serve `content` when the orchestrator fetches `remote_path`.
    pub fn with_file(mut self, remote_path: &str, content: &str) -> Self {
        self.files
            .insert(remote_path.to_string(), content.to_string());
        self
    }
}

/// Recorded invocation for mock verification.
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub host: String,
    pub command: String,
}

#[derive(Default)]
struct Registry {
    scripts: HashMap<String, MockScript>,
    invocations: Vec<MockInvocation>,
    /// Active test scopes; mock mode stays on while any scope is alive so
    /// parallel tests cannot disable each other mid-run.
    active_scopes: usize,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

/// Check if mock mode is enabled via scope or environment variable.
pub fn is_mock_enabled() -> bool {
    if registry().lock().unwrap().active_scopes > 0 {
        return true;
    }
    env_flag("PUV_MOCK_SSH")
}

/// Check if a host string indicates mock mode (`mock://`).
pub fn is_mock_host(host: &str) -> bool {
    host.starts_with("mock://")
}

/// Install (or replace) the script for a host.
pub fn install_script(host: &str, script: MockScript) {
    registry()
        .lock()
        .unwrap()
        .scripts
        .insert(host.to_string(), script);
}

/// Snapshot of commands recorded against a host.
pub fn invocations_for(host: &str) -> Vec<String> {
    registry()
        .lock()
        .unwrap()
        .invocations
        .iter()
        .filter(|i| i.host == host)
        .map(|i| i.command.clone())
        .collect()
}

/// Whether the host's script simulates an unreachable node.
pub fn connect_fails(host: &str) -> bool {
    registry()
        .lock()
        .unwrap()
        .scripts
        .get(host)
        .map(|s| s.fail_connect)
        .unwrap_or(false)
}

/// Produce the scripted response for a command on a host.
///
/// Unscripted commands succeed with empty output, mirroring the permissive
/// default of real nodes answering trivial shell commands.
pub fn respond(host: &str, command: &str) -> MockResponse {
    let mut guard = registry().lock().unwrap();
    guard.invocations.push(MockInvocation {
        host: host.to_string(),
        command: command.to_string(),
    });

    let Some(script) = guard.scripts.get_mut(host) else {
        debug!(host, command, "mock: no script, default ok");
        return MockResponse::ok("");
    };

    for rule in &mut script.rules {
        if command.contains(&rule.pattern) {
            let idx = rule.cursor.min(rule.responses.len() - 1);
            rule.cursor += 1;
            let response = rule.responses[idx].clone();
            debug!(
                host,
                command,
                pattern = %rule.pattern,
                exit_code = response.exit_code,
                "mock: scripted response"
            );
            return response;
        }
    }

    debug!(host, command, "mock: unmatched command, default ok");
    MockResponse::ok("")
}

/// Content served for a remote file fetch, if scripted.
pub fn file_content(host: &str, remote_path: &str) -> Option<String> {
    registry()
        .lock()
        .unwrap()
        .scripts
        .get(host)
        .and_then(|s| s.files.get(remote_path).cloned())
}

/// RAII guard enabling mock mode for the duration of a test.
///
/// Dropping the last live scope clears all scripts and invocation logs.
pub struct MockScope;

impl MockScope {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        registry().lock().unwrap().active_scopes += 1;
        Self
    }
}

impl Drop for MockScope {
    fn drop(&mut self) {
        let mut guard = registry().lock().unwrap();
        guard.active_scopes = guard.active_scopes.saturating_sub(1);
        if guard.active_scopes == 0 {
            guard.scripts.clear();
            guard.invocations.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_advances_and_last_repeats() {
        let _scope = MockScope::new();
        install_script(
            "mock://seq-host",
            MockScript::new().on_sequence(
                "stat -c %s",
                vec![
                    MockResponse::ok("100"),
                    MockResponse::ok("200"),
                    MockResponse::ok("200"),
                ],
            ),
        );

        let sizes: Vec<String> = (0..4)
            .map(|_| respond("mock://seq-host", "stat -c %s /techsupport/x.tgz").stdout)
            .collect();
        assert_eq!(sizes, vec!["100", "200", "200", "200"]);
    }

    #[test]
    fn unscripted_command_defaults_to_ok() {
        let _scope = MockScope::new();
        let response = respond("mock://nobody-home", "hostname");
        assert_eq!(response.exit_code, 0);
        assert!(response.stdout.is_empty());
    }

    #[test]
    fn unreachable_script_reports_connect_failure() {
        let _scope = MockScope::new();
        install_script("mock://down", MockScript::unreachable());
        assert!(connect_fails("mock://down"));
        assert!(!connect_fails("mock://other"));
    }

    #[test]
    fn file_content_is_served_by_path() {
        let _scope = MockScope::new();
        install_script(
            "mock://files",
            MockScript::new().with_file("/tmp/puv-precheck/n1_results.json", "{}"),
        );
        assert_eq!(
            file_content("mock://files", "/tmp/puv-precheck/n1_results.json").as_deref(),
            Some("{}")
        );
        assert!(file_content("mock://files", "/tmp/other").is_none());
    }
}
