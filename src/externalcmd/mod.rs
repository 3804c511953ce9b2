//! External command execution.
//!
//! Paths bracket their lifecycle with hook commands (`run_on_init`,
//! `run_on_ready`, `run_on_read`, ...). The core talks to an executor
//! through the [`CommandExecutor`] trait so embedders can substitute
//! their own; [`ProcessExecutor`] is the stock implementation over
//! `tokio::process`, and [`NoopExecutor`] disables hooks entirely.
//!
//! A spawned command receives the hook environment both as process
//! environment variables and expanded into the command line (`$MTX_PATH`
//! and friends), and is respawned after exit when `restart` is set,
//! until its handle is closed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Environment exposed to hook commands.
pub type Environment = HashMap<String, String>;

/// Pause between respawns of a restartable command.
const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Handle of a spawned command. Closing it (or dropping it) terminates
/// the command and stops any restart loop.
#[derive(Debug)]
pub struct CommandHandle {
    token: CancellationToken,
}

impl CommandHandle {
    /// Builds a handle around the cancellation token watched by the
    /// executor's worker.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Terminates the command.
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns hook commands on behalf of paths.
pub trait CommandExecutor: Send + Sync + 'static {
    /// Starts `cmdline` with the given environment. When `restart` is
    /// set the command is respawned after exit until the returned handle
    /// is closed.
    fn spawn(&self, cmdline: &str, env: Environment, restart: bool) -> CommandHandle;
}

/// Expands `$KEY` references in the command line from the environment.
/// Longer keys are substituted first so `$G10` wins over `$G1`.
pub fn expand_cmdline(cmdline: &str, env: &Environment) -> String {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

    let mut out = cmdline.to_string();
    for key in keys {
        out = out.replace(&format!("${}", key), &env[key]);
    }
    out
}

/// Stock executor: runs commands through the system shell.
#[derive(Debug, Default)]
pub struct ProcessExecutor;

impl CommandExecutor for ProcessExecutor {
    fn spawn(&self, cmdline: &str, env: Environment, restart: bool) -> CommandHandle {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let cmdline = expand_cmdline(cmdline, &env);

        tokio::spawn(async move {
            loop {
                let mut cmd = shell_command(&cmdline);
                cmd.envs(&env).kill_on_drop(true);

                match cmd.spawn() {
                    Ok(mut child) => {
                        tokio::select! {
                            status = child.wait() => {
                                tracing::debug!(
                                    cmd = %cmdline,
                                    status = ?status.ok().and_then(|s| s.code()),
                                    "command exited"
                                );
                            }
                            _ = worker_token.cancelled() => {
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(cmd = %cmdline, error = %err, "command failed to start");
                    }
                }

                if !restart || worker_token.is_cancelled() {
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(RESTART_PAUSE) => {}
                    _ = worker_token.cancelled() => return,
                }
            }
        });

        CommandHandle::new(token)
    }
}

fn shell_command(cmdline: &str) -> Command {
    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/c").arg(cmdline);
        cmd
    }
    #[cfg(not(target_os = "windows"))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(cmdline);
        cmd
    }
}

/// Executor that discards every command. Useful when hooks are disabled.
#[derive(Debug, Default)]
pub struct NoopExecutor;

impl CommandExecutor for NoopExecutor {
    fn spawn(&self, _cmdline: &str, _env: Environment, _restart: bool) -> CommandHandle {
        CommandHandle::new(CancellationToken::new())
    }
}
