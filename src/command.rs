use std::fmt;

use camino::Utf8Path;
use serde::Serialize;
use tracing::info;

use crate::config::{BIDS_APP_ARGS, PipelineArgs, WrapperNamespace};
use crate::domain::ConfigValue;
use crate::error::Diagnostics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BidsAppCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl BidsAppCommand {
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for BidsAppCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Builds the command for `program`: the positional arguments, then the
/// tokens of each pipeline argument in insertion order.
///
/// - `k: v` becomes `-k v`, or a bare `-k` when `v` is empty
/// - `key: true` becomes `--key`, `key: false` is left out
/// - `key: ""` becomes `--key`
/// - `key: "a b"` becomes `--key a b`
/// - anything else becomes `--key=value`
///
/// Wrapper keys are skipped and the words of `bids_app_args` pass through.
pub fn compile(
    args: &PipelineArgs,
    program: &str,
    bids_path: &Utf8Path,
    output_path: &Utf8Path,
    run_mode: &str,
    diagnostics: &mut Diagnostics,
) -> BidsAppCommand {
    let mut tokens = Vec::new();

    for (key, value) in args {
        if WrapperNamespace::classify(key).is_some() {
            continue;
        }
        if key == BIDS_APP_ARGS {
            tokens.extend(value.to_string().split_whitespace().map(str::to_string));
            continue;
        }
        if key.trim().is_empty() || key.chars().any(char::is_whitespace) {
            diagnostics.warn(format!(
                "config key {key:?} is not a valid option name, passing it anyway"
            ));
        }
        encode_flag(key, value, &mut tokens);
    }

    let mut command_args = vec![
        bids_path.to_string(),
        output_path.to_string(),
        run_mode.to_string(),
    ];
    command_args.extend(normalize(tokens));
    let command = BidsAppCommand {
        program: program.to_string(),
        args: command_args,
    };
    info!("command is: {command}");
    command
}

fn encode_flag(key: &str, value: &ConfigValue, tokens: &mut Vec<String>) {
    if key.chars().count() == 1 {
        tokens.push(format!("-{key}"));
        let text = value.to_string();
        if !text.is_empty() {
            tokens.push(text);
        }
        return;
    }

    match value {
        ConfigValue::Bool(true) => tokens.push(format!("--{key}")),
        ConfigValue::Bool(false) => {}
        ConfigValue::Text(text) if text.is_empty() => tokens.push(format!("--{key}")),
        ConfigValue::Text(text) if text.split_whitespace().nth(1).is_some() => {
            tokens.push(format!("--{key}"));
            tokens.extend(text.split_whitespace().map(str::to_string));
        }
        other => tokens.push(format!("--{key}={other}")),
    }
}

// `--verbose=vv` becomes `-vv`; a token still holding whitespace is split
// after every `=` turns into a space.
fn normalize(tokens: Vec<String>) -> Vec<String> {
    let mut normalized = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(count) = verbose_count(&token) {
            normalized.push(format!("-{count}"));
            continue;
        }
        if token.split_whitespace().nth(1).is_some() {
            normalized.extend(
                token
                    .replace('=', " ")
                    .split_whitespace()
                    .map(str::to_string),
            );
            continue;
        }
        normalized.push(token);
    }
    normalized
}

fn verbose_count(token: &str) -> Option<&str> {
    let (flag, value) = token.split_once('=')?;
    (flag == "--verbose" && !value.is_empty()).then_some(value)
}
