use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Result, ShannonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTrigger {
    SessionStart,
    SessionEnd,
    SessionError,
    CheckpointCreate,
    CheckpointRestore,
    CheckpointDelete,
    FileCreate,
    FileModify,
    FileDelete,
    FileRead,
    AgentSpawn,
    AgentComplete,
    AgentError,
    MessageReceived,
    MessageSent,
    Notification,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookActionType {
    Command,
    Script,
    Webhook,
    Function,
    Notification,
    Log,
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

impl HookCondition {
    pub fn evaluate(&self, context: &serde_json::Value) -> Result<bool> {
        let field_value = get_field_value(context, &self.field);

        Ok(match self.operator {
            ConditionOperator::Eq => field_value == Some(&self.value),
            ConditionOperator::Ne => field_value != Some(&self.value),
            ConditionOperator::Gt => match (field_value.and_then(|v| v.as_f64()), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOperator::Lt => match (field_value.and_then(|v| v.as_f64()), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            ConditionOperator::Contains => {
                let haystack = field_value.map(value_to_string).unwrap_or_default();
                let needle = value_to_string(&self.value);
                haystack.contains(&needle)
            }
            ConditionOperator::Regex => {
                let haystack = field_value.map(value_to_string).unwrap_or_default();
                let pattern = self
                    .value
                    .as_str()
                    .ok_or_else(|| ShannonError::Validation("regex condition value must be a string".into()))?;
                let re = regex::Regex::new(pattern)
                    .map_err(|e| ShannonError::Validation(format!("invalid regex {pattern}: {e}")))?;
                re.is_match(&haystack)
            }
        })
    }
}

fn value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn get_field_value<'a>(context: &'a serde_json::Value, field: &str) -> Option<&'a serde_json::Value> {
    let mut value = context;
    for part in field.split('.') {
        value = value.as_object()?.get(part)?;
    }
    Some(value)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookAction {
    #[serde(rename = "type")]
    pub kind: HookActionType,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    pub command: Option<String>,
    pub script_path: Option<PathBuf>,
    pub url: Option<String>,
    pub function_name: Option<String>,
    pub template: Option<String>,
}

impl Default for HookActionType {
    fn default() -> Self {
        Self::Log
    }
}

impl HookAction {
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            HookActionType::Command if self.command.is_none() => {
                Err(ShannonError::Validation("command required for command action".into()))
            }
            HookActionType::Script => match &self.script_path {
                None => Err(ShannonError::Validation("script_path required for script action".into())),
                Some(p) if !p.exists() => Err(ShannonError::Validation(format!("script file not found: {}", p.display()))),
                Some(_) => Ok(()),
            },
            HookActionType::Webhook if self.url.is_none() => {
                Err(ShannonError::Validation("url required for webhook action".into()))
            }
            HookActionType::Function if self.function_name.is_none() => {
                Err(ShannonError::Validation("function_name required for function action".into()))
            }
            _ => Ok(()),
        }
    }
}

/// A configured hook: what to trigger on, what to run, and under what constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub triggers: Vec<HookTrigger>,
    pub actions: Vec<HookAction>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<HookCondition>,
    #[serde(default)]
    pub async_execution: bool,
    pub timeout: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_true")]
    pub sandbox: bool,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub rate_limit: Option<u32>,
    pub cooldown: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> f64 {
    1.0
}

impl Hook {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ShannonError::Validation("hook name required".into()));
        }
        if self.triggers.is_empty() {
            return Err(ShannonError::Validation("at least one trigger required".into()));
        }
        if self.actions.is_empty() {
            return Err(ShannonError::Validation("at least one action required".into()));
        }
        for action in &self.actions {
            action.validate()?;
        }
        Ok(())
    }

    pub fn matches_trigger(&self, trigger: HookTrigger) -> bool {
        self.triggers.contains(&trigger) || self.triggers.contains(&HookTrigger::Custom)
    }

    pub fn evaluate_conditions(&self, context: &serde_json::Value) -> Result<bool> {
        for condition in &self.conditions {
            if !condition.evaluate(context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("reading hook file {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| ShannonError::Validation(format!("parsing hook file {}: {e}", path.display())))
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| ShannonError::Validation(format!("serializing hook {}: {e}", self.name)))?;
        std::fs::write(path, data)
            .map_err(|e| ShannonError::Storage(anyhow::anyhow!("writing hook file {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_evaluates_nested_field() {
        let context = serde_json::json!({"file": {"path": "src/main.rs"}});
        let cond = HookCondition {
            field: "file.path".into(),
            operator: ConditionOperator::Contains,
            value: serde_json::json!("main"),
        };
        assert!(cond.evaluate(&context).unwrap());
    }

    #[test]
    fn custom_trigger_matches_everything() {
        let hook = Hook {
            name: "h".into(),
            description: String::new(),
            triggers: vec![HookTrigger::Custom],
            actions: vec![HookAction {
                kind: HookActionType::Log,
                ..Default::default()
            }],
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
        assert!(hook.matches_trigger(HookTrigger::FileModify));
    }

    #[test]
    fn validate_rejects_command_action_without_command() {
        let action = HookAction {
            kind: HookActionType::Command,
            ..Default::default()
        };
        assert!(action.validate().is_err());
    }
}
