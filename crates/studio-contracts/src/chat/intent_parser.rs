use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{find_command, ArgShape};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    pub fn arg_str(&self, key: &str) -> &str {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn arg_index(&self) -> Option<usize> {
        self.command_args
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|value| usize::try_from(value).ok())
    }

    pub fn arg_list(&self, key: &str) -> Vec<String> {
        self.command_args
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn arg_numbers(&self) -> Vec<f64> {
        self.command_args
            .get("values")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default()
    }
}

fn split_args(arg: &str) -> Vec<String> {
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
    let parts = split_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn parse_numbers(arg: &str) -> Vec<Value> {
    arg.replace(',', " ")
        .split_whitespace()
        .filter_map(|part| part.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .filter_map(|value| serde_json::Number::from_f64(value).map(Value::Number))
        .collect()
}

fn apply_args(intent: &mut Intent, shape: ArgShape, arg: &str) {
    match shape {
        ArgShape::None => {}
        ArgShape::Raw(key) => {
            intent
                .command_args
                .insert(key.to_string(), Value::String(arg.to_string()));
        }
        ArgShape::Setting(key) => {
            intent
                .settings_update
                .insert(key.to_string(), Value::String(arg.to_string()));
        }
        ArgShape::Path => {
            intent.command_args.insert(
                "path".to_string(),
                Value::String(parse_single_path_arg(arg)),
            );
        }
        ArgShape::Index => {
            let index = arg
                .split_whitespace()
                .next()
                .and_then(|head| head.parse::<u64>().ok())
                .map(|value| Value::Number(value.into()))
                .unwrap_or(Value::Null);
            intent.command_args.insert("index".to_string(), index);
        }
        ArgShape::IdAndTags => {
            let mut parts = split_args(arg).into_iter();
            let id = parts.next().unwrap_or_default();
            intent
                .command_args
                .insert("id".to_string(), Value::String(id));
            intent.command_args.insert(
                "tags".to_string(),
                Value::Array(parts.map(Value::String).collect()),
            );
        }
        ArgShape::Numbers => {
            intent
                .command_args
                .insert("values".to_string(), Value::Array(parse_numbers(arg)));
        }
    }
}

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

            if let Some(spec) = find_command(&command) {
                let mut intent = Intent::new(spec.action, text);
                apply_args(&mut intent, spec.args, arg);
                if spec.action == "generate" || spec.action == "video" {
                    intent.prompt = Some(arg.to_string()).filter(|value| !value.is_empty());
                }
                return intent;
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

    let mut intent = Intent::new("generate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
