use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Result, ShannonError};

use super::config::{Hook, HookAction, HookActionType, HookTrigger};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

/// A reusable hook pattern: a set of action skeletons with `${var}` placeholders,
/// concretized into a validated [`Hook`] by [`HookTemplate::create_hook`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookTemplate {
    pub name: String,
    pub description: String,
    pub category: String,
    pub triggers: Vec<HookTrigger>,
    pub action_templates: Vec<Value>,
    #[serde(default)]
    pub default_config: Value,
    #[serde(default)]
    pub variables: HashMap<String, VariableDef>,
    #[serde(default = "default_author")]
    pub author: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_author() -> String {
    "system".into()
}

fn default_version() -> String {
    "1.0.0".into()
}

fn substitute_value(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, vars)),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute_value(v, vars))).collect()),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| substitute_value(v, vars)).collect()),
        other => other.clone(),
    }
}

fn substitute_str(template: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '$' && template[i..].starts_with("${") {
            if let Some(end) = template[i + 2..].find('}') {
                let key = &template[i + 2..i + 2 + end];
                match vars.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => out.push_str(&template[i..i + 3 + end]),
                }
                for _ in 0..(2 + end) {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

impl HookTemplate {
    fn validate_variables(&self, variables: &HashMap<String, Value>) -> Result<()> {
        for (name, def) in &self.variables {
            if def.required && !variables.contains_key(name) {
                return Err(ShannonError::Validation(format!("required variable '{name}' not provided")));
            }
            if let Some(value) = variables.get(name) {
                let ok = match def.kind.as_str() {
                    "string" => value.is_string(),
                    "number" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    _ => true,
                };
                if !ok {
                    return Err(ShannonError::Validation(format!("variable '{name}' expected {}, got {value}", def.kind)));
                }
            }
        }
        Ok(())
    }

    pub fn create_hook(&self, name: &str, variables: Option<HashMap<String, Value>>, overrides: Option<Value>) -> Result<Hook> {
        let mut vars = variables.unwrap_or_default();
        self.validate_variables(&vars)?;
        for (var_name, def) in &self.variables {
            if !vars.contains_key(var_name) {
                if let Some(default) = &def.default {
                    vars.insert(var_name.clone(), default.clone());
                }
            }
        }

        let actions: Vec<HookAction> = self
            .action_templates
            .iter()
            .map(|t| {
                let substituted = substitute_value(t, &vars);
                serde_json::from_value(substituted)
            })
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ShannonError::Validation(format!("invalid action template: {e}")))?;

        let mut hook = Hook {
            name: name.to_string(),
            description: substitute_str(&self.description, &vars),
            triggers: self.triggers.clone(),
            actions,
            enabled: true,
            priority: 0,
            conditions: vec![],
            async_execution: false,
            timeout: None,
            retry_count: 0,
            retry_delay: 1.0,
            sandbox: true,
            allowed_paths: vec![],
            environment: HashMap::new(),
            rate_limit: None,
            cooldown: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags: vec![],
        };

        apply_overrides(&mut hook, &self.default_config)?;
        if let Some(overrides) = overrides {
            apply_overrides(&mut hook, &overrides)?;
        }

        hook.validate()?;
        Ok(hook)
    }
}

fn apply_overrides(hook: &mut Hook, overrides: &Value) -> Result<()> {
    let Some(map) = overrides.as_object() else { return Ok(()) };
    if let Some(v) = map.get("priority").and_then(Value::as_i64) {
        hook.priority = v as i32;
    }
    if let Some(v) = map.get("timeout").and_then(Value::as_f64) {
        hook.timeout = Some(v);
    }
    if let Some(v) = map.get("retry_count").and_then(Value::as_u64) {
        hook.retry_count = v as u32;
    }
    if let Some(v) = map.get("async_execution").and_then(Value::as_bool) {
        hook.async_execution = v;
    }
    if let Some(v) = map.get("sandbox").and_then(Value::as_bool) {
        hook.sandbox = v;
    }
    Ok(())
}

fn action(kind: HookActionType, fields: Value) -> Value {
    let mut obj = fields.as_object().cloned().unwrap_or_default();
    obj.insert("type".into(), Value::String(match kind {
        HookActionType::Command => "command",
        HookActionType::Script => "script",
        HookActionType::Webhook => "webhook",
        HookActionType::Function => "function",
        HookActionType::Notification => "notification",
        HookActionType::Log => "log",
        HookActionType::Transform => "transform",
    }.to_string()));
    Value::Object(obj)
}

fn builtin_templates() -> HashMap<String, HookTemplate> {
    let mut templates = HashMap::new();

    templates.insert(
        "git_commit".to_string(),
        HookTemplate {
            name: "git_commit".into(),
            description: "Run actions on git commit".into(),
            category: "vcs".into(),
            triggers: vec![HookTrigger::Custom],
            action_templates: vec![action(
                HookActionType::Command,
                serde_json::json!({"command": "git add -A && git commit -m '${message}'", "template": "Commit message: ${message}"}),
            )],
            default_config: Value::Null,
            variables: HashMap::from([(
                "message".to_string(),
                VariableDef { kind: "string".into(), required: true, default: None, description: "Commit message".into() },
            )]),
            author: default_author(),
            version: default_version(),
            tags: vec![],
        },
    );

    templates.insert(
        "code_format".to_string(),
        HookTemplate {
            name: "code_format".into(),
            description: "Format code on file save".into(),
            category: "development".into(),
            triggers: vec![HookTrigger::FileModify],
            action_templates: vec![action(HookActionType::Command, serde_json::json!({"command": "${formatter} ${file_path}"}))],
            default_config: serde_json::json!({"priority": 10, "timeout": 30.0}),
            variables: HashMap::from([
                ("formatter".to_string(), VariableDef { kind: "string".into(), required: true, default: None, description: "Formatter command (e.g. black, prettier)".into() }),
                ("file_pattern".to_string(), VariableDef { kind: "string".into(), required: false, default: Some(Value::String(r".*\.(py|js|ts)$".into())), description: "File pattern to match".into() }),
            ]),
            author: default_author(),
            version: default_version(),
            tags: vec![],
        },
    );

    templates.insert(
        "test_runner".to_string(),
        HookTemplate {
            name: "test_runner".into(),
            description: "Run tests on code changes".into(),
            category: "testing".into(),
            triggers: vec![HookTrigger::FileModify, HookTrigger::CheckpointCreate],
            action_templates: vec![
                action(HookActionType::Command, serde_json::json!({"command": "${test_command}"})),
                action(HookActionType::Notification, serde_json::json!({"config": {"title": "Test Results", "message": "Tests completed for ${file_path}", "type": "info"}})),
            ],
            default_config: Value::Null,
            variables: HashMap::from([
                ("test_command".to_string(), VariableDef { kind: "string".into(), required: true, default: None, description: "Test command (e.g. pytest, cargo test)".into() }),
                ("project_root".to_string(), VariableDef { kind: "string".into(), required: false, default: Some(Value::String(".".into())), description: "Project root directory".into() }),
            ]),
            author: default_author(),
            version: default_version(),
            tags: vec![],
        },
    );

    templates.insert(
        "deployment".to_string(),
        HookTemplate {
            name: "deployment".into(),
            description: "Deploy application on tag".into(),
            category: "deployment".into(),
            triggers: vec![HookTrigger::Custom],
            action_templates: vec![
                action(HookActionType::Script, serde_json::json!({"script_path": "${deploy_script}"})),
                action(HookActionType::Webhook, serde_json::json!({"url": "${notification_url}", "config": {"method": "POST", "headers": {"Content-Type": "application/json"}}})),
            ],
            default_config: serde_json::json!({"timeout": 300.0, "retry_count": 2, "async_execution": true}),
            variables: HashMap::from([
                ("deploy_script".to_string(), VariableDef { kind: "string".into(), required: true, default: None, description: "Path to deployment script".into() }),
                ("environment".to_string(), VariableDef { kind: "string".into(), required: true, default: None, description: "Deployment environment (e.g. staging, production)".into() }),
                ("tag".to_string(), VariableDef { kind: "string".into(), required: true, default: None, description: "Deployment tag/version".into() }),
                ("notification_url".to_string(), VariableDef { kind: "string".into(), required: false, default: Some(Value::String(String::new())), description: "Webhook URL for notifications".into() }),
            ]),
            author: default_author(),
            version: default_version(),
            tags: vec![],
        },
    );

    templates.insert(
        "backup".to_string(),
        HookTemplate {
            name: "backup".into(),
            description: "Create backup on checkpoint".into(),
            category: "backup".into(),
            triggers: vec![HookTrigger::CheckpointCreate],
            action_templates: vec![
                action(HookActionType::Command, serde_json::json!({"command": "tar -czf ${backup_dir}/backup-${timestamp}.tar.gz ${source_dir}", "template": "Creating backup of ${source_dir}"})),
                action(HookActionType::Log, serde_json::json!({"config": {"level": "info", "message": "Backup created: ${backup_dir}/backup-${timestamp}.tar.gz"}})),
            ],
            default_config: Value::Null,
            variables: HashMap::from([
                ("source_dir".to_string(), VariableDef { kind: "string".into(), required: true, default: None, description: "Directory to back up".into() }),
                ("backup_dir".to_string(), VariableDef { kind: "string".into(), required: true, default: None, description: "Backup destination directory".into() }),
                ("timestamp".to_string(), VariableDef { kind: "string".into(), required: false, default: Some(Value::String("${context_timestamp}".into())), description: "Timestamp for backup filename".into() }),
            ]),
            author: default_author(),
            version: default_version(),
            tags: vec![],
        },
    );

    templates
}

/// Holds the built-in hook templates plus any JSON templates loaded from a directory.
pub struct TemplateManager {
    templates: RwLock<HashMap<String, HookTemplate>>,
}

impl TemplateManager {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(builtin_templates()),
        }
    }

    pub async fn initialize(&self, templates_dir: Option<&Path>) -> Result<()> {
        if let Some(dir) = templates_dir {
            let loaded = self.load_from_directory(dir).await?;
            log::info!("template manager initialized with {loaded} templates from {}", dir.display());
        }
        Ok(())
    }

    pub async fn load_from_directory(&self, directory: &Path) -> Result<usize> {
        if !directory.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        let entries = std::fs::read_dir(directory)
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("reading templates dir: {e}")))?;

        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path).ok().and_then(|s| serde_json::from_str::<HookTemplate>(&s).ok()) {
                Some(template) => {
                    self.templates.write().await.insert(template.name.clone(), template);
                    loaded += 1;
                }
                None => log::error!("failed to load template from {}", path.display()),
            }
        }
        Ok(loaded)
    }

    pub async fn get_template(&self, name: &str) -> Option<HookTemplate> {
        self.templates.read().await.get(name).cloned()
    }

    pub async fn list_templates(&self, category: Option<&str>, tags: Option<&[String]>) -> Vec<HookTemplate> {
        let templates = self.templates.read().await;
        templates
            .values()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .filter(|t| tags.map_or(true, |tags| tags.iter().any(|tag| t.tags.contains(tag))))
            .cloned()
            .collect()
    }

    pub async fn categories(&self) -> Vec<String> {
        let templates = self.templates.read().await;
        let mut cats: Vec<String> = templates.values().map(|t| t.category.clone()).collect::<std::collections::BTreeSet<_>>().into_iter().collect();
        cats.sort();
        cats
    }

    pub async fn create_hook_from_template(
        &self,
        template_name: &str,
        hook_name: &str,
        variables: Option<HashMap<String, Value>>,
        overrides: Option<Value>,
    ) -> Result<Hook> {
        let template = self
            .get_template(template_name)
            .await
            .ok_or_else(|| ShannonError::Validation(format!("template not found: {template_name}")))?;
        template.create_hook(hook_name, variables, overrides)
    }

    pub async fn export_template(&self, name: &str, path: &Path) -> Result<()> {
        let template = self.get_template(name).await.ok_or_else(|| ShannonError::Validation(format!("template not found: {name}")))?;
        let data = serde_json::to_string_pretty(&template).map_err(|e| ShannonError::Validation(e.to_string()))?;
        std::fs::write(path, data).map_err(|e| ShannonError::Storage(anyhow::anyhow!("writing template export: {e}")))?;
        Ok(())
    }
}

impl Default for TemplateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtin_templates_are_loaded() {
        let manager = TemplateManager::new();
        let categories = manager.categories().await;
        assert!(categories.contains(&"vcs".to_string()));
        assert!(categories.contains(&"testing".to_string()));
    }

    #[tokio::test]
    async fn git_commit_template_requires_message() {
        let manager = TemplateManager::new();
        let result = manager.create_hook_from_template("git_commit", "my-commit-hook", None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn git_commit_template_substitutes_message() {
        let manager = TemplateManager::new();
        let vars = HashMap::from([("message".to_string(), Value::String("fix bug".into()))]);
        let hook = manager.create_hook_from_template("git_commit", "my-commit-hook", Some(vars), None).await.unwrap();
        assert_eq!(hook.actions[0].command.as_deref(), Some("git add -A && git commit -m 'fix bug'"));
    }
}
