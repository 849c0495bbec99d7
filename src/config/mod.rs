//! Hierarchical application config.
//!
//! One document configures every domain. It may be TOML, YAML or JSON, and
//! optionally encrypted with `openssl enc -aes-256-cbc -pbkdf2`.

pub mod crypt;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Code, Error, Forward, Result};
use crate::ingest::LoadMode;

pub const DEFAULT_ENV_KEY: &str = "PROPLINE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// Relational store file. Relative paths resolve against `data_dir`.
    pub database: PathBuf,
    /// Lease table file, kept apart from the relational store.
    pub coordination_database: PathBuf,
    pub worker: WorkerConfig,
    pub partners: BTreeMap<String, PartnerConfig>,
    pub search: SearchConfig,
    pub server: ServerConfig,
    pub tokens: TokenConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database: PathBuf::from("propline.db"),
            coordination_database: PathBuf::from("coordination.db"),
            worker: WorkerConfig::default(),
            partners: BTreeMap::new(),
            search: SearchConfig::default(),
            server: ServerConfig::default(),
            tokens: TokenConfig::default(),
        }
    }
}

impl AppConfig {
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }

    #[must_use]
    pub fn coordination_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.coordination_database)
    }

    pub fn partner(&self, name: &str) -> Result<&PartnerConfig> {
        self.partners.get(name).ok_or_else(|| {
            Error::new("e3d056ad-547b-44c7-930a-f9e355712795", Code::NotFound, "Unknown partner.").with_meta("partner", name)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generated per process when unset.
    pub worker_id: Option<Uuid>,
    pub poll_interval_ms: u64,
    pub lock_ttl_secs: u64,
    pub acquire_timeout_secs: u64,
    pub file_buffer_size: usize,
    /// Rows leased per dispatch round. Defaults to `file_buffer_size`.
    pub dispatch_limit: Option<usize>,
    pub max_idle_polls: u32,
    /// Rclone parallelism for fetch.
    pub fetch_parallelism: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval_ms: 1000,
            lock_ttl_secs: 60,
            acquire_timeout_secs: 60,
            file_buffer_size: 4,
            dispatch_limit: None,
            max_idle_polls: 2400,
            fetch_parallelism: 8,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartnerConfig {
    /// Required for partners not built in.
    pub id: Option<Uuid>,
    pub root: PathBuf,
    pub field_separator: String,
    pub rules: Vec<FileRuleConfig>,
}

impl Default for PartnerConfig {
    fn default() -> Self {
        Self {
            id: None,
            root: PathBuf::from("."),
            field_separator: "|".to_string(),
            rules: Vec::new(),
        }
    }
}

/// Maps backend paths matching `pattern` to a catalog entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileRuleConfig {
    pub pattern: String,
    pub file_type: i32,
    pub priorities: Vec<i32>,
    /// Appends the first number in the entry name to `priorities`.
    pub release_priority: bool,
    /// Appended after the release number.
    pub priority_suffix: Vec<i32>,
    pub ignore: bool,
    pub enter_directory: bool,
    pub ignore_sub_dirs: bool,
    pub table: Option<String>,
    pub columns: Vec<String>,
    pub mode: LoadMode,
    pub field_separator: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Registry name of the cluster. `memory` or an http(s) base url.
    pub cluster: String,
    pub index: String,
    pub batch_size: usize,
    pub file_buffer_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cluster: "memory".to_string(),
            index: "addresses".to_string(),
            batch_size: 1000,
            file_buffer_size: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Standard base64 of a 32-byte symmetric key.
    pub key: Option<String>,
}

impl TokenConfig {
    pub fn symmetric_key(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = self.key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };

        let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
            Error::new("34599808-e138-466e-a119-92cdfd488997", Code::FailedPrecondition, "Invalid token key.").with_cause(e)
        })?;

        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::new(
                "41505e3c-658a-41e5-90fb-6b56ff95fc84",
                Code::FailedPrecondition,
                "Token key must be 32 bytes.",
            )
        })?;

        Ok(Some(key))
    }
}

/// Resolves and parses the config document.
///
/// `path` wins over the environment variable `env_key`. A path of `-` means
/// the config is supplied elsewhere and yields the defaults.
pub fn load(path: Option<&Path>, env_key: &str) -> Result<AppConfig> {
    load_with(path, env_key, |name| std::env::var(name).ok())
}

pub fn load_with(
    path: Option<&Path>,
    env_key: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig> {
    let path = match path {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => {
            let env_key = env_key.trim();
            if env_key.is_empty() {
                return Err(Error::new(
                    "330d8a14-6622-4196-9252-bc0a9617b5bc",
                    Code::InvalidArgument,
                    "Failed to resolve config file path.",
                ));
            }
            match env(env_key).filter(|v| !v.trim().is_empty()) {
                Some(v) => PathBuf::from(v.trim()),
                None => {
                    return Err(Error::new(
                        "b8359699-f98f-4031-9aa8-868f8c093dfe",
                        Code::FailedPrecondition,
                        "Missing config file path.",
                    )
                    .with_meta("env_key", env_key));
                }
            }
        }
    };

    if path.as_os_str() == "-" {
        return Ok(AppConfig::default());
    }

    let mut body = std::fs::read(&path).map_err(|e| {
        Error::new("440097c3-04d7-4b0e-b771-8ab6a3713114", Code::InvalidArgument, "Failed to read config file.")
            .with_cause(e)
            .with_meta("path", path.display().to_string())
    })?;

    if let Some(pass) = env(&format!("{env_key}_ENC_PASS")).filter(|p| !p.is_empty()) {
        let iter_str = env(&format!("{env_key}_ENC_ITER")).unwrap_or_default();
        let iter: u32 = iter_str.trim().parse().map_err(|e| {
            Error::new(
                "9f115669-3a13-4e64-a50c-f37d6c9f03af",
                Code::InvalidArgument,
                "Failed to parse iteration count.",
            )
            .with_cause(e)
            .with_meta("iter", iter_str.as_str())
        })?;

        body = crypt::decrypt(&body, &pass, iter).forward("5686a848-fc21-47f1-a506-e5a169deb2a7")?;
    }

    let text = String::from_utf8(body).map_err(|e| {
        Error::new("f7259da5-b39d-4f97-9ff5-c2a9b27e1bfc", Code::InvalidArgument, "Config file is not UTF-8.").with_cause(e)
    })?;
    let expanded = expand_env(&text, &env);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    parse(&expanded, &ext)
}

fn parse(body: &str, ext: &str) -> Result<AppConfig> {
    match ext {
        "json" => serde_json::from_str(body).map_err(|e| {
            Error::new("af967da0-0051-4966-957c-f51e1ad579ec", Code::InvalidArgument, "Failed to parse json config file.")
                .with_cause(e)
        }),
        "toml" => toml::from_str(body).map_err(|e| {
            Error::new("71485c37-bb2e-4a44-89bf-57999dc4a6b9", Code::InvalidArgument, "Failed to parse toml config file.")
                .with_cause(e)
        }),
        "yaml" | "yml" => serde_yaml::from_str(body).map_err(|e| {
            Error::new("9349efb5-0ba2-4643-8129-f1c82d5112fb", Code::InvalidArgument, "Failed to parse yaml config file.")
                .with_cause(e)
        }),
        _ => Err(
            Error::new("16ba170c-a55b-4310-9174-e43d6bee7186", Code::InvalidArgument, "Unsupported config format.")
                .with_meta("extension", ext),
        ),
    }
}

/// Replaces `$VAR` and `${VAR}` with the variable's value. Unset variables
/// expand to the empty string.
pub fn expand_env(body: &str, env: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&env(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
            out.push('$');
            rest = after;
            continue;
        }

        let len = after
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_alphanumeric() || *c == '_') || (*i == 0 && c.is_ascii_digit()))
            .map_or(after.len(), |(i, _)| i);

        if len == 0 {
            out.push('$');
        } else {
            out.push_str(&env(&after[..len]).unwrap_or_default());
        }
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_expand_env() {
        let env = env_of(&[("HOST", "db.local"), ("PORT", "5432")]);
        assert_eq!(expand_env("${HOST}:$PORT/x", &env), "db.local:5432/x");
        assert_eq!(expand_env("$MISSING-", &env), "-");
        assert_eq!(expand_env("cost $5 and $", &env), "cost $5 and $");
        assert_eq!(expand_env("${UNCLOSED", &env), "${UNCLOSED");
    }

    #[test]
    fn test_load_toml_with_env() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "$DATA"

[worker]
file_buffer_size = 2

[partners.acme]
id = "0196f3c0-0000-7000-8000-000000000001"
root = "/drops/acme"

[[partners.acme.rules]]
pattern = "*.zip"
file_type = 7
priorities = [1, 1]
table = "acme_rows"
columns = ["a", "b"]
"#,
        )
        .unwrap();

        let env = env_of(&[("DATA", "/srv/propline")]);
        let cfg = load_with(Some(&path), DEFAULT_ENV_KEY, env).unwrap();

        assert_eq!(cfg.data_dir, PathBuf::from("/srv/propline"));
        assert_eq!(cfg.worker.file_buffer_size, 2);
        assert_eq!(cfg.worker.max_idle_polls, 2400);
        let acme = cfg.partner("acme").unwrap();
        assert_eq!(acme.rules[0].mode, LoadMode::BatchInsert);
        assert_eq!(acme.field_separator, "|");
        assert!(cfg.partner("other").is_err());
    }

    #[test]
    fn test_load_from_env_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.yaml");
        std::fs::write(&path, "server:\n  port: 9000\n").unwrap();

        let env = env_of(&[("APP_CONFIG", path.to_str().unwrap())]);
        let cfg = load_with(None, "APP_CONFIG", env).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
    }

    #[test]
    fn test_dash_yields_defaults() {
        let cfg = load_with(Some(Path::new("-")), DEFAULT_ENV_KEY, env_of(&[])).unwrap();
        assert_eq!(cfg.search.batch_size, 1000);

        let err = load_with(None, DEFAULT_ENV_KEY, env_of(&[])).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_load_encrypted_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.json");
        let body = crypt::encrypt(br#"{"server": {"port": 7070}}"#, "pw", 5000).unwrap();
        std::fs::write(&path, body).unwrap();

        let env = env_of(&[("APP_ENC_PASS", "pw"), ("APP_ENC_ITER", "5000")]);
        let cfg = load_with(Some(&path), "APP", env).unwrap();
        assert_eq!(cfg.server.port, 7070);

        let env = env_of(&[("APP_ENC_PASS", "pw"), ("APP_ENC_ITER", "many")]);
        let err = load_with(Some(&path), "APP", env).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_token_key() {
        let cfg = TokenConfig {
            key: Some(STANDARD.encode([7u8; 32])),
        };
        assert_eq!(cfg.symmetric_key().unwrap(), Some([7u8; 32]));

        let short = TokenConfig {
            key: Some(STANDARD.encode([7u8; 5])),
        };
        assert_eq!(
            short.symmetric_key().unwrap_err().code(),
            Code::FailedPrecondition
        );
        assert_eq!(TokenConfig::default().symmetric_key().unwrap(), None);
    }
}
