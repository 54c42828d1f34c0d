//! Query templates
//!
//! Templates are `.sql` files with `{{ NAME }}` placeholders. A placeholder
//! may select a nested field (`{{ LEFT.total }}`) and apply one filter,
//! either piped (`{{ NAME | toCH }}`) or called (`{{ toCH .NAME }}`):
//!
//! - `{{ NAME }}` raw text (strings unquoted)
//! - `{{ NAME | literal }}` (alias `toCH`) ClickHouse SQL literal
//! - `{{ NAME | json }}` JSON encoding
//!
//! Any other `{{ ... }}` block is a render error.

use crate::core::record::Vars;
use crate::core::value::Value;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("undefined variable '{0}'")]
    MissingVariable(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("unsupported placeholder '{0}'")]
    Unsupported(String),

    #[error("invalid placeholder pattern: {0}")]
    Pattern(regex::Error),

    #[error("failed to load templates from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Renders named templates with a variable binding
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, vars: &Vars) -> Result<String, TemplateError>;

    /// Every template name, sorted
    fn names(&self) -> Vec<String>;
}

/// In-memory set of SQL templates keyed by file name
#[derive(Debug, Clone, Default)]
pub struct SqlTemplates {
    templates: BTreeMap<String, String>,
}

impl SqlTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.sql` file of `dir` (not recursive)
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self, TemplateError> {
        let dir = dir.as_ref();
        let load_err = |source| TemplateError::Load {
            path: dir.display().to_string(),
            source,
        };

        let mut templates = BTreeMap::new();
        for entry in std::fs::read_dir(dir).map_err(load_err)? {
            let path = entry.map_err(load_err)?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path).map_err(load_err)?;
            templates.insert(name.to_string(), content);
        }

        Ok(Self { templates })
    }

    pub fn with_template(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(name.into(), text.into());
        self
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SqlTemplates {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            templates: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl TemplateRenderer for SqlTemplates {
    fn render(&self, name: &str, vars: &Vars) -> Result<String, TemplateError> {
        let text = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;
        render_str(text, vars)
    }

    fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }
}

fn placeholder_re() -> Result<&'static Regex, TemplateError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\{\{\s*(?:([A-Za-z_]+)\s+)?\.?([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*(?:\|\s*([A-Za-z_]+)\s*)?\}\}",
        )
    })
    .as_ref()
    .map_err(|e| TemplateError::Pattern(e.clone()))
}

/// Render template text with `vars`
pub fn render_str(text: &str, vars: &Vars) -> Result<String, TemplateError> {
    let re = placeholder_re()?;
    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        check_plain(&text[last..whole.start()])?;
        rendered.push_str(&text[last..whole.start()]);
        rendered.push_str(&render_placeholder(&caps, vars)?);
        last = whole.end();
    }
    check_plain(&text[last..])?;
    rendered.push_str(&text[last..]);

    Ok(rendered)
}

/// Text between placeholders must not open another one
fn check_plain(text: &str) -> Result<(), TemplateError> {
    let Some(pos) = text.find("{{") else {
        return Ok(());
    };
    let snippet = match text[pos..].find("}}") {
        Some(end) => &text[pos..pos + end + 2],
        None => &text[pos..],
    };
    Err(TemplateError::Unsupported(snippet.trim().to_string()))
}

fn render_placeholder(caps: &Captures, vars: &Vars) -> Result<String, TemplateError> {
    let filter = match (caps.get(1), caps.get(3)) {
        (Some(_), Some(_)) => return Err(TemplateError::Unsupported(caps[0].to_string())),
        (called, piped) => called.or(piped).map(|m| m.as_str()),
    };

    let path = &caps[2];
    let value = lookup(vars, path).ok_or_else(|| TemplateError::MissingVariable(path.to_string()))?;

    match filter {
        None => Ok(value.to_string()),
        Some("literal") | Some("toCH") => Ok(value.to_sql_literal()),
        Some("json") => Ok(value.to_json().to_string()),
        Some(other) => Err(TemplateError::UnknownFilter(other.to_string())),
    }
}

fn lookup<'a>(vars: &'a Vars, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}
