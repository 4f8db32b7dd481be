use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{Result, ShannonError};
use crate::notify::NotificationCenter;

use super::config::{Hook, HookAction, HookActionType, HookTrigger};
use super::registry::HookRegistry;
use super::sandbox::HookSandbox;

pub type CustomFunction =
    Arc<dyn Fn(&Hook, &HookAction, &serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub hook_name: String,
    pub success: bool,
    pub outputs: Vec<serde_json::Value>,
    pub error: Option<String>,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// Substitutes `${var}` placeholders in `template` against a flattened view
/// of `context` (nested objects joined with `_`). Unknown placeholders are
/// left untouched, matching a "safe substitute" policy.
fn substitute(template: &str, flat: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = template[i + 2..].find('}') {
                let key = &template[i + 2..i + 2 + end];
                match flat.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&template[i..i + 3 + end]),
                }
                i += 3 + end;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn flatten(value: &serde_json::Value, parent: &str, out: &mut HashMap<String, String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if parent.is_empty() { k.clone() } else { format!("{parent}_{k}") };
                flatten(v, &key, out);
            }
        }
        serde_json::Value::String(s) => {
            out.insert(parent.to_string(), s.clone());
        }
        other => {
            out.insert(parent.to_string(), other.to_string());
        }
    }
}

fn flatten_context(context: &serde_json::Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    flatten(context, "", &mut out);
    out
}

/// Drives hook execution: rate limiting, condition evaluation, retries,
/// per-action-type dispatch (sandboxed where requested), and a bounded
/// execution history.
pub struct HookEngine {
    registry: Arc<HookRegistry>,
    sandbox: Arc<HookSandbox>,
    notifications: Arc<NotificationCenter>,
    custom_functions: HashMap<String, CustomFunction>,
    running: Mutex<HashSet<String>>,
    history: Mutex<Vec<ExecutionResult>>,
    max_history: usize,
    http: reqwest::Client,
}

impl HookEngine {
    pub fn new(
        registry: Arc<HookRegistry>,
        sandbox: Arc<HookSandbox>,
        notifications: Arc<NotificationCenter>,
        custom_functions: HashMap<String, CustomFunction>,
        max_history: usize,
    ) -> Self {
        Self {
            registry,
            sandbox,
            notifications,
            custom_functions,
            running: Mutex::new(HashSet::new()),
            history: Mutex::new(Vec::new()),
            max_history,
            http: reqwest::Client::new(),
        }
    }

    pub async fn trigger(&self, trigger: HookTrigger, context: serde_json::Value) -> Result<Vec<ExecutionResult>> {
        let hooks = self.registry.get_hooks_for_trigger(trigger, Some(&context)).await?;
        if hooks.is_empty() {
            return Ok(Vec::new());
        }
        log::info!("triggered {:?}: {} matching hooks", trigger, hooks.len());

        let mut results = Vec::with_capacity(hooks.len());
        let mut async_tasks = Vec::new();

        for hook in hooks {
            if !self.registry.check_rate_limit(&hook).await {
                log::warn!("hook {} rate limited for trigger {:?}", hook.name, trigger);
                continue;
            }
            self.registry.record_execution(&hook).await;

            if hook.async_execution {
                let context = context.clone();
                async_tasks.push(self.execute_hook_owned(hook, context));
            } else {
                results.push(self.execute_hook(&hook, &context).await);
            }
        }

        for task in async_tasks {
            results.push(task.await);
        }

        Ok(results)
    }

    async fn execute_hook_owned(&self, hook: Hook, context: serde_json::Value) -> ExecutionResult {
        self.execute_hook(&hook, &context).await
    }

    pub async fn execute_hook_by_name(&self, name: &str, context: serde_json::Value) -> ExecutionResult {
        match self.registry.get_hook(name).await {
            Some(hook) => self.execute_hook(&hook, &context).await,
            None => ExecutionResult {
                hook_name: name.to_string(),
                success: false,
                outputs: vec![],
                error: Some(format!("hook not found: {name}")),
                duration_secs: 0.0,
                timestamp: Utc::now(),
            },
        }
    }

    async fn execute_hook(&self, hook: &Hook, context: &serde_json::Value) -> ExecutionResult {
        {
            let mut running = self.running.lock().await;
            if !running.insert(hook.name.clone()) {
                return ExecutionResult {
                    hook_name: hook.name.clone(),
                    success: false,
                    outputs: vec![],
                    error: Some("hook already running".into()),
                    duration_secs: 0.0,
                    timestamp: Utc::now(),
                };
            }
        }

        let started = std::time::Instant::now();
        let mut last_error = None;
        let mut result = None;

        for attempt in 0..=hook.retry_count {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs_f64(hook.retry_delay)).await;
                log::info!("retrying hook {} (attempt {})", hook.name, attempt + 1);
            }

            match self.run_actions(hook, context).await {
                Ok(outputs) => {
                    result = Some(ExecutionResult {
                        hook_name: hook.name.clone(),
                        success: true,
                        outputs,
                        error: None,
                        duration_secs: started.elapsed().as_secs_f64(),
                        timestamp: Utc::now(),
                    });
                    break;
                }
                Err(e) => {
                    log::error!("hook execution failed: {} ({e})", hook.name);
                    last_error = Some(e.to_string());
                }
            }
        }

        let result = result.unwrap_or_else(|| ExecutionResult {
            hook_name: hook.name.clone(),
            success: false,
            outputs: vec![],
            error: last_error,
            duration_secs: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        });

        self.add_to_history(result.clone()).await;
        self.notifications.notify(
            if result.success { "hook" } else { "hook_error" },
            &format!("hook {}: {}", hook.name, if result.success { "executed" } else { "failed" }),
            serde_json::json!({"hook_name": hook.name, "success": result.success, "duration_secs": result.duration_secs}),
        );

        self.running.lock().await.remove(&hook.name);
        result
    }

    async fn run_actions(&self, hook: &Hook, context: &serde_json::Value) -> Result<Vec<serde_json::Value>> {
        let mut outputs = Vec::with_capacity(hook.actions.len());
        for action in &hook.actions {
            outputs.push(self.execute_action(action, hook, context).await?);
        }
        Ok(outputs)
    }

    async fn execute_action(&self, action: &HookAction, hook: &Hook, context: &serde_json::Value) -> Result<serde_json::Value> {
        let flat = flatten_context(context);
        match action.kind {
            HookActionType::Command => self.execute_command(action, hook, &flat).await,
            HookActionType::Script => self.execute_script(action, hook, context, &flat).await,
            HookActionType::Webhook => self.execute_webhook(action, hook, context, &flat).await,
            HookActionType::Function => self.execute_function(action, hook, context),
            HookActionType::Notification => self.execute_notification(action, hook, &flat),
            HookActionType::Log => self.execute_log(action, hook, &flat),
            HookActionType::Transform => self.execute_transform(action, context),
        }
    }

    async fn execute_command(&self, action: &HookAction, hook: &Hook, flat: &HashMap<String, String>) -> Result<serde_json::Value> {
        let mut command = action.command.clone().ok_or_else(|| ShannonError::Validation("no command specified".into()))?;
        if let Some(template) = &action.template {
            command = substitute(template, flat);
        } else {
            command = substitute(&command, flat);
        }

        let timeout = hook.timeout.map(Duration::from_secs_f64);
        let outcome = if hook.sandbox {
            self.sandbox.execute_command(&command, &hook.environment, &hook.allowed_paths, timeout).await?
        } else {
            run_unsandboxed(&command, &hook.environment, timeout).await?
        };

        if outcome.exit_code != 0 {
            return Err(ShannonError::Os(anyhow::anyhow!("command failed: {command}\n{}", outcome.stderr)));
        }
        Ok(serde_json::json!({"exit_code": outcome.exit_code, "stdout": outcome.stdout, "stderr": outcome.stderr}))
    }

    async fn execute_script(
        &self,
        action: &HookAction,
        hook: &Hook,
        context: &serde_json::Value,
        flat: &HashMap<String, String>,
    ) -> Result<serde_json::Value> {
        let path = action.script_path.clone().ok_or_else(|| ShannonError::Validation("no script_path specified".into()))?;
        let mut env = hook.environment.clone();
        env.insert("HOOK_CONTEXT".into(), context.to_string());
        let _ = flat;

        let timeout = hook.timeout.map(Duration::from_secs_f64);
        let outcome = if hook.sandbox {
            self.sandbox.execute_script(&path, &env, &hook.allowed_paths, timeout).await?
        } else {
            run_script_unsandboxed(&path, &env, timeout).await?
        };

        if outcome.exit_code != 0 {
            return Err(ShannonError::Os(anyhow::anyhow!("script failed: {}\n{}", path.display(), outcome.stderr)));
        }
        Ok(serde_json::json!({"exit_code": outcome.exit_code, "stdout": outcome.stdout, "stderr": outcome.stderr}))
    }

    async fn execute_webhook(
        &self,
        action: &HookAction,
        hook: &Hook,
        context: &serde_json::Value,
        flat: &HashMap<String, String>,
    ) -> Result<serde_json::Value> {
        let raw_url = action.url.clone().ok_or_else(|| ShannonError::Validation("no webhook url specified".into()))?;
        let url = match &action.template {
            Some(t) => substitute(t, flat),
            None => substitute(&raw_url, flat),
        };

        let method = action.config.get("method").and_then(|v| v.as_str()).unwrap_or("POST").to_uppercase();
        let payload = serde_json::json!({
            "hook_name": hook.name,
            "timestamp": Utc::now(),
            "context": context,
        });

        let timeout = hook.timeout.map(Duration::from_secs_f64).unwrap_or(Duration::from_secs(30));
        let request = match method.as_str() {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url).json(&payload),
            other => return Err(ShannonError::Validation(format!("unsupported http method: {other}"))),
        };

        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ShannonError::Os(anyhow::anyhow!("webhook request failed: {url} - {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.as_u16() >= 400 {
            return Err(ShannonError::Os(anyhow::anyhow!("webhook returned error: {status} - {body}")));
        }

        Ok(serde_json::json!({"status": status.as_u16(), "body": body}))
    }

    fn execute_function(&self, action: &HookAction, hook: &Hook, context: &serde_json::Value) -> Result<serde_json::Value> {
        let name = action.function_name.as_deref().ok_or_else(|| ShannonError::Validation("no function_name specified".into()))?;
        let func = self
            .custom_functions
            .get(name)
            .ok_or_else(|| ShannonError::Validation(format!("function not found: {name}")))?;
        func(hook, action, context)
    }

    fn execute_notification(&self, action: &HookAction, hook: &Hook, flat: &HashMap<String, String>) -> Result<serde_json::Value> {
        let title = action.config.get("title").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| format!("Hook: {}", hook.name));
        let mut message = action.config.get("message").and_then(|v| v.as_str()).unwrap_or("Hook triggered").to_string();
        if let Some(template) = &action.template {
            message = substitute(template, flat);
        }
        self.notifications.notify("hook_notification", &title, serde_json::json!({"message": message, "hook_name": hook.name}));
        Ok(serde_json::json!({"notification_sent": true, "title": title, "message": message}))
    }

    fn execute_log(&self, action: &HookAction, hook: &Hook, flat: &HashMap<String, String>) -> Result<serde_json::Value> {
        let level = action.config.get("level").and_then(|v| v.as_str()).unwrap_or("info").to_lowercase();
        let mut message = action.config.get("message").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| format!("hook {} triggered", hook.name));
        if let Some(template) = &action.template {
            message = substitute(template, flat);
        }
        match level.as_str() {
            "error" => log::error!("{message}"),
            "warn" | "warning" => log::warn!("{message}"),
            "debug" => log::debug!("{message}"),
            _ => log::info!("{message}"),
        }
        Ok(serde_json::json!({"logged": true, "level": level, "message": message}))
    }

    fn execute_transform(&self, action: &HookAction, context: &serde_json::Value) -> Result<serde_json::Value> {
        let expression = action
            .config
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ShannonError::Validation("no transform expression specified".into()))?;

        let matches = jsonpath_lib::select(context, expression)
            .map_err(|e| ShannonError::Validation(format!("invalid jsonpath expression {expression}: {e}")))?;
        Ok(serde_json::json!(matches))
    }

    async fn add_to_history(&self, result: ExecutionResult) {
        let mut history = self.history.lock().await;
        history.push(result);
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(0..excess);
        }
    }

    pub async fn execution_history(&self, hook_name: Option<&str>, limit: Option<usize>) -> Vec<ExecutionResult> {
        let history = self.history.lock().await;
        let mut results: Vec<ExecutionResult> = match hook_name {
            Some(name) => history.iter().filter(|r| r.hook_name == name).cloned().collect(),
            None => history.clone(),
        };
        if let Some(limit) = limit {
            let len = results.len();
            if len > limit {
                results = results.split_off(len - limit);
            }
        }
        results
    }

    pub async fn stats(&self) -> serde_json::Value {
        let history = self.history.lock().await;
        let success = history.iter().filter(|r| r.success).count();
        let total = history.len();
        let avg_duration = if total > 0 {
            history.iter().map(|r| r.duration_secs).sum::<f64>() / total as f64
        } else {
            0.0
        };
        serde_json::json!({
            "total_executions": total,
            "success_count": success,
            "failure_count": total - success,
            "success_rate": if total > 0 { success as f64 / total as f64 } else { 0.0 },
            "average_duration_secs": avg_duration,
        })
    }
}

async fn run_unsandboxed(
    command: &str,
    env: &HashMap<String, String>,
    timeout: Option<Duration>,
) -> Result<super::sandbox::ExecutionOutcome> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).envs(env);
    run_child(cmd, timeout).await
}

async fn run_script_unsandboxed(
    path: &std::path::Path,
    env: &HashMap<String, String>,
    timeout: Option<Duration>,
) -> Result<super::sandbox::ExecutionOutcome> {
    let interpreter = match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("sh") => Some("bash"),
        Some("js") => Some("node"),
        _ => None,
    };
    let mut cmd = match interpreter {
        Some(bin) => {
            let mut c = tokio::process::Command::new(bin);
            c.arg(path);
            c
        }
        None => tokio::process::Command::new(path),
    };
    cmd.envs(env);
    run_child(cmd, timeout).await
}

async fn run_child(mut cmd: tokio::process::Command, timeout: Option<Duration>) -> Result<super::sandbox::ExecutionOutcome> {
    cmd.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());
    let child = cmd.spawn().map_err(|e| ShannonError::Os(anyhow::anyhow!("spawning process: {e}")))?;
    let wait = child.wait_with_output();

    let output = match timeout {
        Some(d) => tokio::time::timeout(d, wait)
            .await
            .map_err(|_| ShannonError::Timeout("process exceeded its deadline".into()))?
            .map_err(|e| ShannonError::Os(anyhow::anyhow!("waiting on process: {e}")))?,
        None => wait.await.map_err(|e| ShannonError::Os(anyhow::anyhow!("waiting on process: {e}")))?,
    };

    Ok(super::sandbox::ExecutionOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_known_and_leaves_unknown() {
        let mut flat = HashMap::new();
        flat.insert("name".to_string(), "world".to_string());
        assert_eq!(substitute("hello ${name}, ${missing}", &flat), "hello world, ${missing}");
    }

    #[test]
    fn flatten_context_joins_nested_keys() {
        let ctx = serde_json::json!({"file": {"path": "a.rs"}, "count": 3});
        let flat = flatten_context(&ctx);
        assert_eq!(flat.get("file_path"), Some(&"a.rs".to_string()));
        assert_eq!(flat.get("count"), Some(&"3".to_string()));
    }

    #[tokio::test]
    async fn transform_selects_via_jsonpath() {
        let registry = Arc::new(HookRegistry::new(None));
        let dir = tempfile::TempDir::new().unwrap();
        let sandbox = Arc::new(HookSandbox::new(
            dir.path().to_path_buf(),
            super::super::sandbox::SandboxLimits {
                max_memory_bytes: 1 << 20,
                max_cpu_time_secs: 5,
                max_file_size_bytes: 1 << 20,
                max_processes: 4,
                max_open_files: 32,
            },
        ));
        let engine = HookEngine::new(registry, sandbox, Arc::new(NotificationCenter::new()), HashMap::new(), 10);

        let action = HookAction {
            kind: HookActionType::Transform,
            config: serde_json::json!({"expression": "$.items[*].name"}).as_object().unwrap().clone(),
            ..Default::default()
        };
        let context = serde_json::json!({"items": [{"name": "a"}, {"name": "b"}]});
        let result = engine.execute_transform(&action, &context).unwrap();
        assert_eq!(result, serde_json::json!(["a", "b"]));
    }
}
