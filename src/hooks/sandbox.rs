use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Result, ShannonError};

const DANGEROUS_PATTERNS: &[&str] = &[
    "sudo", "su ", "chmod +s", "setuid", "setgid", "/etc/passwd", "/etc/shadow", "../..", "~/.ssh", "rm -rf /",
    ":(){ :|:& };:", "> /dev/sda",
];

const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "echo", "cat", "grep", "sed", "awk", "sort", "uniq", "head", "tail", "wc", "find", "ls", "cp", "mv", "rm", "mkdir",
    "touch", "chmod", "chown", "tar", "gzip", "python", "python3", "node", "npm", "git", "curl", "wget",
];

const DEFAULT_ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TZ", "PYTHONPATH", "NODE_PATH", "GIT_AUTHOR_NAME", "GIT_AUTHOR_EMAIL",
    "HOOK_CONTEXT",
];

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_time_secs: u64,
    pub max_file_size_bytes: u64,
    pub max_processes: u64,
    pub max_open_files: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Isolates hook command/script execution: validates against a dangerous-pattern
/// and command allow-list, scrubs the environment, runs in a throwaway working
/// directory, and applies kernel rlimits to the child before exec.
pub struct HookSandbox {
    root: PathBuf,
    limits: SandboxLimits,
    allowed_commands: HashSet<String>,
    allowed_env_vars: HashSet<String>,
}

impl HookSandbox {
    pub fn new(root: PathBuf, limits: SandboxLimits) -> Self {
        Self {
            root,
            limits,
            allowed_commands: DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            allowed_env_vars: DEFAULT_ALLOWED_ENV_VARS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("creating sandbox root: {e}")))?;
        Ok(())
    }

    pub fn add_allowed_command(&mut self, command: &str) {
        self.allowed_commands.insert(command.to_string());
    }

    pub fn add_allowed_env_var(&mut self, var: &str) {
        self.allowed_env_vars.insert(var.to_string());
    }

    fn validate_command(&self, command: &str) -> Result<()> {
        let lower = command.to_lowercase();
        for pattern in DANGEROUS_PATTERNS {
            if lower.contains(&pattern.to_lowercase()) {
                return Err(ShannonError::Security(format!("dangerous pattern detected: {pattern}")));
            }
        }

        let name = command
            .split_whitespace()
            .next()
            .ok_or_else(|| ShannonError::Security("empty command".into()))?;
        let base = Path::new(name).file_name().and_then(|f| f.to_str()).unwrap_or(name);
        if !self.allowed_commands.contains(name) && !self.allowed_commands.contains(base) {
            return Err(ShannonError::Security(format!("command not allowed: {name}")));
        }
        Ok(())
    }

    fn validate_script(&self, content: &str) -> Result<()> {
        let lower = content.to_lowercase();
        for pattern in DANGEROUS_PATTERNS {
            if lower.contains(&pattern.to_lowercase()) {
                return Err(ShannonError::Security(format!("dangerous pattern in script: {pattern}")));
            }
        }
        Ok(())
    }

    fn scrub_env(&self, extra: &std::collections::HashMap<String, String>) -> std::collections::HashMap<String, String> {
        let mut env = std::collections::HashMap::new();
        for var in &self.allowed_env_vars {
            if let Ok(value) = std::env::var(var) {
                env.insert(var.clone(), value);
            }
        }
        for (key, value) in extra {
            if self.allowed_env_vars.contains(key) || key.starts_with("HOOK_") {
                env.insert(key.clone(), value.clone());
            }
        }
        env.insert("HOOK_SANDBOX".into(), "1".into());
        env
    }

    async fn setup_files(&self, sandbox_dir: &Path, allowed_paths: &[PathBuf]) -> Result<()> {
        for path in allowed_paths {
            if !path.exists() {
                continue;
            }
            let dest = sandbox_dir.join(path.file_name().unwrap_or_default());
            if path.is_file() {
                tokio::fs::copy(path, &dest)
                    .await
                    .map_err(|e| ShannonError::Storage(anyhow::anyhow!("copying sandbox input {}: {e}", path.display())))?;
            } else if path.is_dir() {
                copy_dir_recursive(path, &dest)
                    .map_err(|e| ShannonError::Storage(anyhow::anyhow!("copying sandbox input dir {}: {e}", path.display())))?;
            }
        }
        Ok(())
    }

    pub async fn execute_command(
        &self,
        command: &str,
        env: &std::collections::HashMap<String, String>,
        allowed_paths: &[PathBuf],
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome> {
        self.validate_command(command)?;
        let sandbox_env = self.scrub_env(env);

        let sandbox_dir = self.root.join(format!("cmd_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&sandbox_dir)
            .await
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("creating sandbox dir: {e}")))?;

        self.setup_files(&sandbox_dir, allowed_paths).await?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&sandbox_dir).env_clear().envs(&sandbox_env);
        cmd.env("TMPDIR", &sandbox_dir);
        apply_rlimits(&mut cmd, &self.limits);

        let outcome = run_with_timeout(cmd, timeout.unwrap_or(Duration::from_secs(self.limits.max_cpu_time_secs))).await;

        let _ = tokio::fs::remove_dir_all(&sandbox_dir).await;
        outcome
    }

    pub async fn execute_script(
        &self,
        script_path: &Path,
        env: &std::collections::HashMap<String, String>,
        allowed_paths: &[PathBuf],
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome> {
        if !script_path.exists() {
            return Err(ShannonError::Validation(format!("script not found: {}", script_path.display())));
        }

        let content = tokio::fs::read_to_string(script_path)
            .await
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("reading script {}: {e}", script_path.display())))?;
        self.validate_script(&content)?;

        let sandbox_env = self.scrub_env(env);
        let sandbox_dir = self.root.join(format!("script_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&sandbox_dir)
            .await
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("creating sandbox dir: {e}")))?;

        let script_name = script_path.file_name().unwrap_or_default();
        let sandbox_script = sandbox_dir.join(script_name);
        tokio::fs::copy(script_path, &sandbox_script)
            .await
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("copying script: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&sandbox_script, std::fs::Permissions::from_mode(0o755)).await;
        }

        self.setup_files(&sandbox_dir, allowed_paths).await?;

        let interpreter = match script_path.extension().and_then(|e| e.to_str()) {
            Some("py") => Some("python3"),
            Some("sh") => Some("bash"),
            Some("js") => Some("node"),
            _ => None,
        };

        let mut cmd = match interpreter {
            Some(bin) => {
                let mut c = Command::new(bin);
                c.arg(&sandbox_script);
                c
            }
            None => Command::new(&sandbox_script),
        };
        cmd.current_dir(&sandbox_dir).env_clear().envs(&sandbox_env);
        cmd.env("TMPDIR", &sandbox_dir);
        apply_rlimits(&mut cmd, &self.limits);

        let outcome = run_with_timeout(cmd, timeout.unwrap_or(Duration::from_secs(self.limits.max_cpu_time_secs))).await;
        let _ = tokio::fs::remove_dir_all(&sandbox_dir).await;
        outcome
    }
}

#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, limits: &SandboxLimits) {
    use std::os::unix::process::CommandExt;
    let limits = limits.clone();
    unsafe {
        cmd.pre_exec(move || {
            let _ = rlimit::setrlimit(rlimit::Resource::AS, limits.max_memory_bytes, limits.max_memory_bytes);
            let _ = rlimit::setrlimit(rlimit::Resource::CPU, limits.max_cpu_time_secs, limits.max_cpu_time_secs);
            let _ = rlimit::setrlimit(rlimit::Resource::FSIZE, limits.max_file_size_bytes, limits.max_file_size_bytes);
            let _ = rlimit::setrlimit(rlimit::Resource::NPROC, limits.max_processes, limits.max_processes);
            let _ = rlimit::setrlimit(rlimit::Resource::NOFILE, limits.max_open_files, limits.max_open_files);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_cmd: &mut Command, _limits: &SandboxLimits) {}

async fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ExecutionOutcome> {
    cmd.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| ShannonError::Os(anyhow::anyhow!("spawning sandboxed process: {e}")))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ExecutionOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(ShannonError::Os(anyhow::anyhow!("waiting on sandboxed process: {e}"))),
        Err(_) => Err(ShannonError::Timeout("sandboxed execution exceeded its deadline".into())),
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            max_memory_bytes: 512 * 1024 * 1024,
            max_cpu_time_secs: 60,
            max_file_size_bytes: 100 * 1024 * 1024,
            max_processes: 10,
            max_open_files: 100,
        }
    }

    #[tokio::test]
    async fn rejects_dangerous_pattern() {
        let dir = tempfile::TempDir::new().unwrap();
        let sandbox = HookSandbox::new(dir.path().to_path_buf(), limits());
        let result = sandbox
            .execute_command("rm -rf /", &Default::default(), &[], None)
            .await;
        assert!(matches!(result, Err(ShannonError::Security(_))));
    }

    #[tokio::test]
    async fn rejects_disallowed_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let sandbox = HookSandbox::new(dir.path().to_path_buf(), limits());
        let result = sandbox
            .execute_command("nc -l 1234", &Default::default(), &[], None)
            .await;
        assert!(matches!(result, Err(ShannonError::Security(_))));
    }

    #[tokio::test]
    async fn allows_and_runs_whitelisted_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let sandbox = HookSandbox::new(dir.path().to_path_buf(), limits());
        let result = sandbox
            .execute_command("echo hello", &Default::default(), &[], Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }
}
