//! CLI command definitions

use crate::core::record::Vars;
use crate::core::value::Value;
use clap::Args;
use regex::Regex;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the run file (YAML, rendered with the vars first)
    pub file: String,

    /// Directory holding the `.sql` query templates
    #[arg(long, default_value = ".")]
    pub template_path: String,

    /// Template variables (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub vars: Vec<(String, Value)>,
}

/// Render every query template, for inspection
#[derive(Debug, Args, Clone)]
pub struct RenderCommand {
    /// Path to the run file; its init output is not available here
    pub file: String,

    /// Directory holding the `.sql` query templates
    #[arg(long, default_value = ".")]
    pub template_path: String,

    /// Only render templates whose name matches this glob (`*`, `?`, `[a-z]`)
    #[arg(long, value_parser = parse_glob)]
    pub filter: Option<Regex>,

    /// Template variables (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub vars: Vec<(String, Value)>,
}

/// Validate a run file
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the run file
    pub file: String,

    /// Template variables (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub vars: Vec<(String, Value)>,
}

impl RunCommand {
    pub fn vars(&self) -> Vars {
        self.vars.iter().cloned().collect()
    }
}

impl RenderCommand {
    pub fn vars(&self) -> Vars {
        self.vars.iter().cloned().collect()
    }
}

impl ValidateCommand {
    pub fn vars(&self) -> Vars {
        self.vars.iter().cloned().collect()
    }
}

/// Parse key=value pairs; numbers and booleans keep their type
pub fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    if key.is_empty() {
        return Err(format!("Empty key in: {}", s));
    }
    Ok((key.to_string(), parse_value(value)))
}

/// Compile a file-name glob into an anchored regex
pub fn parse_glob(glob: &str) -> Result<Regex, String> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            '[' => {
                pattern.push('[');
                if chars.next_if(|&c| c == '!' || c == '^').is_some() {
                    pattern.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' || c == '[' {
                        pattern.push('\\');
                    }
                    pattern.push(c);
                }
                if !closed {
                    return Err(format!("Unclosed character class in: {}", glob));
                }
                pattern.push(']');
            }
            '\\' => match chars.next() {
                Some(escaped) => pattern.push_str(&regex::escape(&escaped.to_string())),
                None => return Err(format!("Trailing escape in: {}", glob)),
            },
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| format!("Invalid glob {}: {}", glob, e))
}

fn parse_value(s: &str) -> Value {
    if let Ok(v) = s.parse::<u64>() {
        return Value::UInt(v);
    }
    if let Ok(v) = s.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = s.parse::<f64>() {
        return Value::Float(v);
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}
