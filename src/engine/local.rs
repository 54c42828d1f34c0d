//! Engine backed by a `clickhouse server` subprocess
//!
//! The engine owns the subprocess and its working directory. Construction
//! prepares everything (port, config file, bundles); `start` spawns the
//! process; `stop` asks it to shut down; `wait` reaps it and cleans up.

use crate::core::config::{
    normalize_settings, to_screaming_snake_case, to_snake_case, Settings, SettingsConfig,
};
use crate::core::record::Vars;
use crate::engine::bundle::provision_bundles;
use crate::engine::{ClickHouseClient, ComputeEngine, EngineError, QueryOutput};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};
use url::Url;

const CONFIG_FILE: &str = "config.yaml";
const SIGTERM_EXIT_CODE: i32 = 143;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_TAIL_BYTES: usize = 4096;

/// Low-memory defaults for an embedded server; user `server_settings` win
const DEFAULT_SERVER_SETTINGS: &str = r#"
path: "./"
user_defined_executable_functions_config: "*_function.*ml"
profiles:
  default: {}
users:
  default:
    password: ""
    access_management: 1
    named_collection_control: 1
shutdown_wait_unfinished_queries: 0
cache_size_to_ram_max_ratio: 0.1
cgroup_memory_watcher_soft_limit_ratio: 0.25
mysql_port: { "@remove": remove }
postgresql_port: { "@remove": remove }
query_thread_log: { "@remove": remove }
opentelemetry_span_log: { "@remove": remove }
processors_profile_log: { "@remove": remove }
asynchronous_metric_log: { "@remove": remove }
backup_log: { "@remove": remove }
metric_log: { "@remove": remove }
query_log: { "@remove": remove }
query_views_log: { "@remove": remove }
part_log: { "@remove": remove }
session_log: { "@remove": remove }
text_log: { "@remove": remove }
trace_log: { "@remove": remove }
zookeeper_log: { "@remove": remove }
mlock_executable: false
mark_cache_size: 268435456
index_mark_cache_size: 67108864
uncompressed_cache_size: 16777216
max_thread_pool_size: 2000
max_server_memory_usage_to_ram_ratio: 0.75
max_server_memory_usage: 0
background_pool_size: 2
background_merges_mutations_concurrency_ratio: 2
merge_tree:
  merge_max_block_size: 4096
  max_bytes_to_merge_at_max_space_in_pool: 1073741824
  number_of_free_entries_in_pool_to_lower_max_size_of_merge: 2
  number_of_free_entries_in_pool_to_execute_mutation: 2
  number_of_free_entries_in_pool_to_execute_optimize_entire_partition: 2
background_buffer_flush_schedule_pool_size: 1
background_merges_mutations_scheduling_policy: round_robin
background_move_pool_size: 1
background_fetches_pool_size: 1
background_common_pool_size: 2
background_schedule_pool_size: 2
background_message_broker_schedule_pool_size: 0
background_distributed_schedule_pool_size: 0
"#;

/// Configuration for the local engine
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalEngineConfig {
    /// Path to the clickhouse binary; looked up in `PATH` when relative
    #[serde(default)]
    pub binary_path: Option<String>,

    /// Working directory; a fresh temp dir when unset
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment for the server process (keys are SCREAMING_SNAKE_CASEd)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Bundle references (`https://`, `file://` or plain paths)
    #[serde(default)]
    pub bundles: Vec<String>,

    /// Bundle cache; defaults to `<user cache dir>/sqlflow/bundles`
    #[serde(default)]
    pub bundles_path: Option<PathBuf>,

    /// Keep the working directory after the server exits
    #[serde(default)]
    pub disable_cleanup: bool,

    /// Server configuration overrides written to `config.yaml`
    #[serde(default)]
    pub server_settings: HashMap<String, serde_yaml::Value>,

    /// Connection DSN; a free port on 127.0.0.1 when unset
    #[serde(default)]
    pub dsn: Option<String>,

    /// Settings applied to every query
    #[serde(default)]
    pub settings: SettingsConfig,
}

impl LocalEngineConfig {
    pub fn with_binary_path(mut self, path: impl Into<String>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_disable_cleanup(mut self, disable: bool) -> Self {
        self.disable_cleanup = disable;
        self
    }
}

/// A locally spawned `clickhouse server`
pub struct LocalEngine {
    binary_path: PathBuf,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    dsn: String,
    settings: Settings,
    disable_cleanup: bool,
    client: OnceCell<ClickHouseClient>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    stopping: AtomicBool,
}

impl LocalEngine {
    /// Prepare the working directory, config file and bundles
    pub async fn new(conf: LocalEngineConfig, vars: &Vars) -> Result<Self, EngineError> {
        let binary_path = resolve_binary(conf.binary_path.as_deref().unwrap_or("clickhouse"))?;

        let working_dir = match conf.working_dir {
            Some(dir) => {
                create_private_dir(&dir)?;
                dir
            }
            None => {
                let dir = std::env::temp_dir().join(format!("sqlflow-{}", uuid::Uuid::new_v4()));
                create_private_dir(&dir)?;
                debug!(path = %dir.display(), "created temporary working dir");
                dir
            }
        };

        let dsn = match conf.dsn {
            Some(dsn) => dsn,
            None => format!("http://127.0.0.1:{}", find_free_port()?),
        };
        let url = Url::parse(&dsn)
            .map_err(|e| EngineError::Config(format!("invalid dsn '{}': {}", dsn, e)))?;
        let host = url.host_str().unwrap_or("127.0.0.1").to_string();
        let http_port = url
            .port_or_known_default()
            .ok_or_else(|| EngineError::Config(format!("dsn '{}' has no port", dsn)))?;

        info!(host = %host, port = http_port, "local server network config");

        let mut server_settings = default_server_settings(&host, http_port, find_free_port()?)?;
        for (k, v) in &conf.server_settings {
            server_settings.insert(serde_yaml::Value::String(to_snake_case(k)), v.clone());
        }
        let config_yaml = serde_yaml::to_string(&server_settings)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        tokio::fs::write(working_dir.join(CONFIG_FILE), config_yaml).await?;

        if !conf.bundles.is_empty() {
            let bundles_path = match conf.bundles_path {
                Some(p) => p,
                None => dirs::cache_dir()
                    .ok_or_else(|| EngineError::Config("cannot determine user cache dir".to_string()))?
                    .join("sqlflow/bundles"),
            };
            let bundle_vars: Vars = vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .chain(vars.iter().map(|(k, v)| (to_screaming_snake_case(k), v.clone())))
                .collect();
            provision_bundles(&conf.bundles, &bundles_path, &working_dir, &bundle_vars).await?;
        }

        let env = conf
            .env
            .iter()
            .map(|(k, v)| (to_screaming_snake_case(k), v.clone()))
            .collect();

        Ok(Self {
            binary_path,
            working_dir,
            env,
            dsn,
            settings: normalize_settings(&conf.settings),
            disable_cleanup: conf.disable_cleanup,
            client: OnceCell::new(),
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// The shared client, created on first use
    async fn client(&self) -> Result<&ClickHouseClient, EngineError> {
        self.client
            .get_or_try_init(|| async { ClickHouseClient::from_dsn(&self.dsn, self.settings.clone()) })
            .await
    }

    async fn clean_shutdown(&self) -> Result<(), EngineError> {
        info!("sending SYSTEM SHUTDOWN to local server");
        let client = self.client().await?;
        tokio::time::timeout(SHUTDOWN_TIMEOUT, client.query("SYSTEM SHUTDOWN", &Settings::new()))
            .await
            .map_err(|_| EngineError::Config("SYSTEM SHUTDOWN timed out".to_string()))??;
        Ok(())
    }

    fn send_sigterm(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }

        info!(pid, "sending SIGTERM to local server");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to signal local server");
        }
    }

    async fn cleanup(&self) {
        if self.disable_cleanup {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.working_dir).await {
            warn!(path = %self.working_dir.display(), error = %e, "failed to remove working dir");
        }
    }
}

#[async_trait]
impl ComputeEngine for LocalEngine {
    async fn start(&self) -> Result<(), EngineError> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        info!(binary = %self.binary_path.display(), "starting local server");

        let child = Command::new(&self.binary_path)
            .arg("server")
            .arg(format!("--config-file={}", CONFIG_FILE))
            .arg("--log-file=clickhouse-server.log")
            .arg("--errorlog-file=clickhouse-server-error.log")
            .current_dir(&self.working_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::SeqCst);
        }
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.clean_shutdown().await {
            debug!(error = %e, "clean shutdown failed");
            self.send_sigterm();
        }
    }

    async fn wait(&self) -> Result<(), EngineError> {
        let child = self.child.lock().await.take();
        let Some(child) = child else {
            return Err(EngineError::NotStarted);
        };

        info!("waiting for local server to stop");
        let result = child.wait_with_output().await;
        // reaped; the pid may now belong to another process
        self.pid.store(0, Ordering::SeqCst);
        self.cleanup().await;

        let output = result?;
        if exited_cleanly(output.status) {
            info!("local server stopped");
            return Ok(());
        }

        let stderr = stderr_tail(&output.stderr);
        error!(status = %output.status, stderr = %stderr, "local server error");
        Err(EngineError::Exited {
            status: output.status.to_string(),
            stderr,
        })
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.client().await?.ping().await
    }

    async fn query(&self, query: &str, settings: &Settings) -> Result<QueryOutput, EngineError> {
        self.client().await?.query(query, settings).await
    }
}

/// Exit 0, exit 143 (shell-style SIGTERM) or death by SIGTERM
pub fn exited_cleanly(status: ExitStatus) -> bool {
    status.success()
        || status.code() == Some(SIGTERM_EXIT_CODE)
        || status.signal() == Some(Signal::SIGTERM as i32)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn default_server_settings(
    host: &str,
    http_port: u16,
    tcp_port: u16,
) -> Result<serde_yaml::Mapping, EngineError> {
    let mut settings: serde_yaml::Mapping = serde_yaml::from_str(DEFAULT_SERVER_SETTINGS)
        .map_err(|e| EngineError::Config(e.to_string()))?;
    settings.insert("listen_host".into(), serde_yaml::Value::from(host));
    settings.insert("http_port".into(), serde_yaml::Value::from(u64::from(http_port)));
    settings.insert("tcp_port".into(), serde_yaml::Value::from(u64::from(tcp_port)));
    Ok(settings)
}

fn resolve_binary(name: &str) -> Result<PathBuf, EngineError> {
    let path = Path::new(name);
    if path.is_absolute() || name.contains('/') {
        return Ok(path.to_path_buf());
    }

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| EngineError::Config(format!("'{}' not found in PATH", name)))
}

fn create_private_dir(dir: &Path) -> Result<(), EngineError> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

/// Ask the OS for a free port on the loopback interface
fn find_free_port() -> Result<u16, EngineError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_settings() {
        let settings = default_server_settings("127.0.0.1", 18123, 19000).unwrap();
        assert_eq!(
            settings.get("listen_host"),
            Some(&serde_yaml::Value::from("127.0.0.1"))
        );
        assert_eq!(settings.get("http_port"), Some(&serde_yaml::Value::from(18123u64)));
        assert_eq!(settings.get("tcp_port"), Some(&serde_yaml::Value::from(19000u64)));
        assert!(settings.contains_key("merge_tree"));
        assert!(settings.contains_key("query_log"));
    }

    #[test]
    fn test_exited_cleanly() {
        assert!(exited_cleanly(ExitStatus::from_raw(0)));
        // Raw wait status: exit code in the high byte, signal in the low bits
        assert!(exited_cleanly(ExitStatus::from_raw(143 << 8)));
        assert!(exited_cleanly(ExitStatus::from_raw(15)));
        assert!(!exited_cleanly(ExitStatus::from_raw(1 << 8)));
        assert!(!exited_cleanly(ExitStatus::from_raw(9)));
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = vec![b'x'; STDERR_TAIL_BYTES * 2];
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL_BYTES);
    }

    #[test]
    fn test_resolve_binary_missing() {
        assert!(resolve_binary("definitely-not-a-clickhouse-binary").is_err());
    }

    #[tokio::test]
    async fn test_new_writes_config_and_wait_requires_start() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("wd");

        let mut conf = LocalEngineConfig::default()
            .with_binary_path("/bin/true")
            .with_working_dir(&wd)
            .with_disable_cleanup(true);
        conf.server_settings
            .insert("maxConcurrentQueries".to_string(), serde_yaml::Value::from(4u64));

        let engine = LocalEngine::new(conf, &Vars::new()).await.unwrap();
        assert!(engine.dsn().starts_with("http://127.0.0.1:"));

        let written = std::fs::read_to_string(wd.join(CONFIG_FILE)).unwrap();
        let parsed: serde_yaml::Mapping = serde_yaml::from_str(&written).unwrap();
        assert_eq!(
            parsed.get("max_concurrent_queries"),
            Some(&serde_yaml::Value::from(4u64))
        );

        assert!(matches!(engine.wait().await, Err(EngineError::NotStarted)));
    }

    #[tokio::test]
    async fn test_stop_after_exit_does_not_signal_reaped_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let conf = LocalEngineConfig::default()
            .with_binary_path("/bin/true")
            .with_working_dir(tmp.path().join("wd"))
            .with_disable_cleanup(true);
        let engine = LocalEngine::new(conf, &Vars::new()).await.unwrap();

        engine.start().await.unwrap();
        assert_ne!(engine.pid.load(Ordering::SeqCst), 0);

        engine.wait().await.unwrap();
        assert_eq!(engine.pid.load(Ordering::SeqCst), 0);

        // Nothing listens on the dsn, so this falls back to SIGTERM
        engine.stop().await;
        assert_eq!(engine.pid.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[ignore] // Requires clickhouse to be installed
    async fn test_local_server_lifecycle() {
        let engine = LocalEngine::new(LocalEngineConfig::default(), &Vars::new())
            .await
            .unwrap();
        let wd = engine.working_dir().to_path_buf();

        engine.start().await.unwrap();
        crate::engine::run_startup_probe(
            &engine,
            &crate::engine::StartupProbeConfig::default(),
            &tokio_util::sync::CancellationToken::new(),
        )
        .await
        .unwrap();

        let out = engine.query("SELECT 1 AS one", &Settings::new()).await.unwrap();
        assert_eq!(out.rows.len(), 1);

        engine.stop().await;
        engine.wait().await.unwrap();
        assert!(!wd.exists());
    }
}
