use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS, SLOT_COMMANDS,
};
use crate::layers::{capacity_of, Category};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }

    fn invalid(raw: &str, command: &str, reason: String) -> Self {
        let mut intent = Intent::new("invalid", raw);
        intent
            .command_args
            .insert("command".to_string(), Value::String(command.to_string()));
        intent
            .command_args
            .insert("reason".to_string(), Value::String(reason));
        intent
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args.get(key).and_then(Value::as_str)
    }

    pub fn arg_index(&self) -> Option<usize> {
        self.command_args
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|value| usize::try_from(value).ok())
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn parse_slot_command(command: &str, action: &str, arg: &str, raw: &str) -> Intent {
    let parts = parse_path_args(arg);
    let wants_source = action == "replace_slot";
    let usage = if wants_source {
        "usage: /replace <category> <index> <path|url>"
    } else {
        "usage: /remove <category> <index>"
    };
    if parts.len() < 2 || (wants_source && parts.len() < 3) {
        return Intent::invalid(raw, command, usage.to_string());
    }

    let category = match parts[0].parse::<Category>() {
        Ok(category) => category,
        Err(err) => return Intent::invalid(raw, command, err),
    };
    let index = match parts[1].parse::<usize>() {
        Ok(index) if index < capacity_of(category) => index,
        _ => {
            return Intent::invalid(
                raw,
                command,
                format!(
                    "index for {category} must be between 0 and {}",
                    capacity_of(category) - 1
                ),
            )
        }
    };

    let mut intent = Intent::new(action, raw);
    intent.command_args.insert(
        "category".to_string(),
        Value::String(category.as_str().to_string()),
    );
    intent
        .command_args
        .insert("index".to_string(), Value::from(index as u64));
    if wants_source {
        intent
            .command_args
            .insert("source".to_string(), Value::String(parts[2..].join(" ")));
    }
    intent
}

/// Parses one line of chat input. Slash commands map onto session
/// operations; any other non-empty text becomes the free-text prompt.
pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.prompt = Some(arg.to_string());
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let path = parse_single_path_arg(arg);
                if path.is_empty() {
                    return Intent::invalid(text, &command, format!("usage: /{command} <path>"));
                }
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("path".to_string(), Value::String(path));
                return intent;
            }

            if let Some(action) = find_action(&command, SLOT_COMMANDS) {
                return parse_slot_command(&command, action, arg, text);
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("set_prompt", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
