use tracing::warn;

use crate::config::HooksConfig;
use crate::error::BatonError;

/// Identifies the handoff a hook fires for.
#[derive(Debug, Clone)]
pub struct HandoffHookInfo {
    pub task_id: String,
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub attempt: u32,
}

/// In-process lifecycle callbacks around each handoff attempt.
pub trait HandoffHooks: Send + Sync + 'static {
    fn on_handoff_start(&self, info: &HandoffHookInfo) {
        let _ = info;
    }

    fn on_handoff_complete(&self, info: &HandoffHookInfo, duration_ms: u64) {
        let _ = (info, duration_ms);
    }

    fn on_handoff_error(&self, info: &HandoffHookInfo, error: &BatonError) {
        let _ = (info, error);
    }
}

/// Hooks that run the shell commands from `[hooks]` config.
pub struct ShellHooks {
    config: HooksConfig,
}

impl ShellHooks {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    fn spawn(commands: &[String], info: &HandoffHookInfo, extra: Vec<(&'static str, String)>) {
        if commands.is_empty() {
            return;
        }
        let commands = commands.to_vec();
        let mut env = vec![
            ("BATON_TASK_ID", info.task_id.clone()),
            ("BATON_SOURCE_AGENT", info.source_agent_id.clone()),
            ("BATON_TARGET_AGENT", info.target_agent_id.clone()),
            ("BATON_ATTEMPT", info.attempt.to_string()),
        ];
        env.extend(extra);
        tokio::spawn(async move {
            let vars: Vec<(&str, &str)> = env.iter().map(|(k, v)| (*k, v.as_str())).collect();
            run_hooks(&commands, &vars).await;
        });
    }
}

impl HandoffHooks for ShellHooks {
    fn on_handoff_start(&self, info: &HandoffHookInfo) {
        Self::spawn(&self.config.on_handoff_start, info, vec![]);
    }

    fn on_handoff_complete(&self, info: &HandoffHookInfo, duration_ms: u64) {
        Self::spawn(
            &self.config.on_handoff_complete,
            info,
            vec![("BATON_DURATION_MS", duration_ms.to_string())],
        );
    }

    fn on_handoff_error(&self, info: &HandoffHookInfo, error: &BatonError) {
        Self::spawn(
            &self.config.on_handoff_error,
            info,
            vec![("BATON_ERROR", error.to_string())],
        );
    }
}

/// Execute hook commands with environment variables.
/// Fire-and-forget: errors are logged, not propagated.
pub async fn run_hooks(commands: &[String], env_vars: &[(&str, &str)]) {
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hook_receives_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        let cmd = format!("echo \"$BATON_TASK_ID:$BATON_ATTEMPT\" > {}", out.display());

        run_hooks(&[cmd], &[("BATON_TASK_ID", "t-42"), ("BATON_ATTEMPT", "2")]).await;

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "t-42:2");
    }

    #[tokio::test]
    async fn failing_hook_does_not_propagate() {
        run_hooks(&["exit 3".to_string()], &[]).await;
    }

    #[test]
    fn default_hooks_are_noops() {
        struct Quiet;
        impl HandoffHooks for Quiet {}

        let info = HandoffHookInfo {
            task_id: "t".into(),
            source_agent_id: "a".into(),
            target_agent_id: "b".into(),
            attempt: 1,
        };
        Quiet.on_handoff_start(&info);
        Quiet.on_handoff_complete(&info, 5);
        Quiet.on_handoff_error(&info, &BatonError::Compression("x".into()));
    }
}
