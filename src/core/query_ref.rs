//! Query references: a template name plus its failure policy
//!
//! The policy travels in the URL fragment of the reference string:
//!
//! ```text
//! insert_blocks.sql#ignore-failure=true&ignore-error-codes=60,81
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid query reference '{reference}': {reason}")]
pub struct InvalidQueryRef {
    pub reference: String,
    pub reason: String,
}

/// A named query together with its execution policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueryRef {
    /// Template name (path without fragment)
    pub name: String,

    /// Treat any execution error as an empty result
    pub ignore_failure: bool,

    /// Engine error codes tolerated even when `ignore_failure` is false
    pub ignore_error_codes: Vec<i32>,

    /// Do not let this query's rows become the new vars
    pub ignore_output: bool,
}

impl QueryRef {
    /// Reference with default policy (fail on any error)
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ignore_failure: false,
            ignore_error_codes: Vec::new(),
            ignore_output: false,
        }
    }

    /// Parse `name#flag=value&...`
    ///
    /// Flags that fail to parse keep their default; unknown flags are ignored.
    pub fn parse(s: &str) -> Result<Self, InvalidQueryRef> {
        let (name, fragment) = match s.split_once('#') {
            Some((name, fragment)) => (name, fragment),
            None => (s, ""),
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(InvalidQueryRef {
                reference: s.to_string(),
                reason: "empty query name".to_string(),
            });
        }

        let mut query_ref = QueryRef::named(name);

        for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
            match key.as_ref() {
                "ignore-failure" => {
                    if let Some(b) = parse_bool(&value) {
                        query_ref.ignore_failure = b;
                    }
                }
                "ignore-output" => {
                    if let Some(b) = parse_bool(&value) {
                        query_ref.ignore_output = b;
                    }
                }
                "ignore-error-codes" => {
                    query_ref.ignore_error_codes.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .filter_map(|c| c.parse::<i32>().ok()),
                    );
                }
                _ => {}
            }
        }

        Ok(query_ref)
    }

    /// Whether an engine error with this code is tolerated
    pub fn tolerates_code(&self, code: i32) -> bool {
        self.ignore_error_codes.contains(&code)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

impl TryFrom<String> for QueryRef {
    type Error = InvalidQueryRef;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        QueryRef::parse(&s)
    }
}

impl From<QueryRef> for String {
    fn from(q: QueryRef) -> Self {
        q.to_string()
    }
}

impl fmt::Display for QueryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;

        let mut flags = Vec::new();
        if self.ignore_failure {
            flags.push("ignore-failure=true".to_string());
        }
        if !self.ignore_error_codes.is_empty() {
            let codes: Vec<String> = self.ignore_error_codes.iter().map(|c| c.to_string()).collect();
            flags.push(format!("ignore-error-codes={}", codes.join(",")));
        }
        if self.ignore_output {
            flags.push("ignore-output=true".to_string());
        }

        if !flags.is_empty() {
            write!(f, "#{}", flags.join("&"))?;
        }
        Ok(())
    }
}
