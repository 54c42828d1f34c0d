//! ClickHouse HTTP interface client

use crate::core::config::Settings;
use crate::core::metadata::QueryMetadata;
use crate::engine::decode::decode_rows;
use crate::engine::{EngineError, QueryOutput};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::trace;
use url::Url;

const OUTPUT_FORMAT: &str = "JSONCompactEachRowWithNamesAndTypes";

/// `DateTime` columns are printed as UTC instants (`...Z`) whatever their zone
const DATE_TIME_OUTPUT_FORMAT: &str = "iso";

/// HTTP connection to one ClickHouse server
///
/// The underlying `reqwest::Client` pools connections and is safe to share
/// between concurrent callers.
#[derive(Debug, Clone)]
pub struct ClickHouseClient {
    http: reqwest::Client,
    endpoint: Url,
    database: String,
    user: Option<String>,
    password: Option<String>,
    settings: Settings,
}

impl ClickHouseClient {
    /// Build a client from `http://[user[:password]@]host:port[/database][?setting=value...]`
    ///
    /// Query parameters of the DSN become default settings; `settings` override them.
    pub fn from_dsn(dsn: &str, settings: Settings) -> Result<Self, EngineError> {
        let url = Url::parse(dsn).map_err(|e| EngineError::Config(format!("invalid dsn '{}': {}", dsn, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(EngineError::Config(format!(
                "unsupported dsn scheme '{}' (expected http or https)",
                url.scheme()
            )));
        }

        let database = match url.path().trim_matches('/') {
            "" => "default".to_string(),
            db => db.to_string(),
        };
        let user = match url.username() {
            "" => None,
            u => Some(u.to_string()),
        };
        let password = url.password().map(str::to_string);

        let mut merged: Settings = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        merged.extend(settings);

        let mut endpoint = url.clone();
        endpoint.set_path("/");
        endpoint.set_query(None);
        let _ = endpoint.set_username("");
        let _ = endpoint.set_password(None);

        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            database,
            user,
            password,
            settings: merged,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `GET /ping`
    pub async fn ping(&self) -> Result<(), EngineError> {
        let mut url = self.endpoint.clone();
        url.set_path("/ping");

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_exception(None, &body));
        }
        Ok(())
    }

    /// URL parameters of one query; later entries override earlier ones
    fn query_params<'a>(&'a self, settings: &'a Settings) -> Vec<(&'a str, &'a str)> {
        let mut params: Vec<(&str, &str)> = vec![
            ("database", self.database.as_str()),
            ("default_format", OUTPUT_FORMAT),
            ("date_time_output_format", DATE_TIME_OUTPUT_FORMAT),
            ("output_format_json_quote_64bit_integers", "0"),
            ("wait_end_of_query", "1"),
        ];
        for (k, v) in self.settings.iter().chain(settings.iter()) {
            params.push((k.as_str(), v.as_str()));
        }
        params
    }

    /// Execute a query and decode its rows
    pub async fn query(&self, query: &str, settings: &Settings) -> Result<QueryOutput, EngineError> {
        let params = self.query_params(settings);

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .query(&params)
            .body(query.to_string());
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let started = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        let wall_time = started.elapsed();

        let exception_code = headers
            .get("X-ClickHouse-Exception-Code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i32>().ok());

        if !status.is_success() || exception_code.is_some() {
            return Err(parse_exception(exception_code, &body));
        }

        let summary = headers
            .get("X-ClickHouse-Summary")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str::<Summary>(v).ok())
            .unwrap_or_default();

        trace!(bytes = body.len(), "received response");

        Ok(QueryOutput {
            rows: decode_rows(&body)?,
            metadata: summary.into_metadata(wall_time),
        })
    }
}

/// Build an exception from the error body (`Code: 60. DB::Exception: ...`)
pub fn parse_exception(code: Option<i32>, body: &str) -> EngineError {
    static CODE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CODE_RE.get_or_init(|| Regex::new(r"Code:\s*(\d+)").ok());

    let code = code.or_else(|| {
        re.as_ref()
            .and_then(|re| re.captures(body))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    });

    let message = body.trim().to_string();
    match code {
        Some(code) => EngineError::Exception { code, message },
        None => EngineError::Decode(format!("unexpected server response: {}", message)),
    }
}

/// `X-ClickHouse-Summary` header; values are JSON strings
#[derive(Debug, Default, Deserialize)]
struct Summary {
    #[serde(default)]
    read_rows: Option<String>,
    #[serde(default)]
    read_bytes: Option<String>,
    #[serde(default)]
    written_rows: Option<String>,
    #[serde(default)]
    written_bytes: Option<String>,
    #[serde(default)]
    total_rows_to_read: Option<String>,
    #[serde(default)]
    elapsed_ns: Option<String>,
    #[serde(default)]
    peak_memory_usage: Option<String>,
    #[serde(default)]
    memory_usage: Option<String>,
}

impl Summary {
    fn into_metadata(self, wall_time: Duration) -> QueryMetadata {
        let num = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<u64>().ok());

        QueryMetadata {
            rows: num(&self.read_rows).unwrap_or(0),
            bytes: num(&self.read_bytes).unwrap_or(0),
            total_rows: num(&self.total_rows_to_read).unwrap_or(0),
            wrote_rows: num(&self.written_rows).unwrap_or(0),
            wrote_bytes: num(&self.written_bytes).unwrap_or(0),
            elapsed: num(&self.elapsed_ns)
                .map(Duration::from_nanos)
                .unwrap_or(wall_time),
            memory_peak_usage: num(&self.peak_memory_usage)
                .or_else(|| num(&self.memory_usage))
                .unwrap_or(0),
        }
    }
}
