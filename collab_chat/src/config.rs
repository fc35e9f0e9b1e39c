use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the chat server.
#[derive(Parser, Debug, Default)]
#[command(name = "collab_chat", about = "Realtime chat service")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print a bearer token for the given user id and exit.
    #[arg(long, value_name = "USER")]
    pub issue_token: Option<String>,
}

/// Cross-process fan-out settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleOut {
    pub redis_url: String,
    pub channel: String,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Shared HS256 secret used to verify bearer tokens.
    pub jwt_secret: String,
    /// Window during which repeated typing starts are collapsed.
    pub typing_debounce: Duration,
    /// Redis pub/sub; `None` means single-process delivery only.
    pub scale_out: Option<ScaleOut>,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("typing_debounce", &self.typing_debounce)
            .field("scale_out", &self.scale_out)
            .field("logging_enabled", &self.logging_enabled)
            .finish()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    server: FileServer,
    database: FileDatabase,
    auth: FileAuth,
    realtime: FileRealtime,
    scale_out: FileScaleOut,
    logging: FileLogging,
}

#[derive(Deserialize, Default)]
struct FileServer {
    port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct FileDatabase {
    path: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    jwt_secret: Option<String>,
}

#[derive(Deserialize, Default)]
struct FileRealtime {
    typing_debounce_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct FileScaleOut {
    redis_url: Option<String>,
    channel: Option<String>,
}

#[derive(Deserialize, Default)]
struct FileLogging {
    enabled: Option<bool>,
}

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_CHANNEL: &str = "collab_chat:rooms";
const DEFAULT_TYPING_DEBOUNCE_MS: u64 = 2000;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| env_nonempty("COLLAB_CHAT_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/collab_chat.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };

        let mut port = file_cfg.server.port.unwrap_or(DEFAULT_PORT);
        let mut logging = file_cfg.logging.enabled.unwrap_or(true);
        let mut database_path = file_cfg
            .database
            .path
            .unwrap_or_else(|| PathBuf::from("data/collab_chat.db"));
        let mut jwt_secret = file_cfg.auth.jwt_secret;
        let mut redis_url = file_cfg.scale_out.redis_url;

        // environment overrides
        if let Some(p) = env_nonempty("COLLAB_CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Some(l) = env_nonempty("COLLAB_CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Some(path) = env_nonempty("COLLAB_CHAT_DATABASE") {
            database_path = PathBuf::from(path);
        }
        if let Some(secret) = env_nonempty("COLLAB_CHAT_JWT_SECRET") {
            jwt_secret = Some(secret);
        }
        if let Some(url) = env_nonempty("COLLAB_CHAT_REDIS_URL") {
            redis_url = Some(url);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let jwt_secret = jwt_secret
            .filter(|s| !s.is_empty())
            .context("missing jwt secret: set [auth] jwt_secret or COLLAB_CHAT_JWT_SECRET")?;

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Some(b) = env_nonempty("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let scale_out = redis_url.filter(|u| !u.trim().is_empty()).map(|redis_url| ScaleOut {
            redis_url,
            channel: file_cfg
                .scale_out
                .channel
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
        });

        Ok(Self {
            bind,
            database_path,
            jwt_secret,
            typing_debounce: Duration::from_millis(
                file_cfg
                    .realtime
                    .typing_debounce_ms
                    .unwrap_or(DEFAULT_TYPING_DEBOUNCE_MS),
            ),
            scale_out,
            logging_enabled: logging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    const ENV_KEYS: &[&str] = &[
        "COLLAB_CHAT_CONFIG",
        "COLLAB_CHAT_PORT",
        "COLLAB_CHAT_LOGGING",
        "COLLAB_CHAT_DATABASE",
        "COLLAB_CHAT_JWT_SECRET",
        "COLLAB_CHAT_REDIS_URL",
        "BIND",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    fn load_with(contents: &str) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        Config::load(&cli)
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let cfg = load_with(
            "[server]\nport=5555\n[logging]\nenabled=false\n[auth]\njwt_secret=\"s\"\n\
             [database]\npath=\"/tmp/x.db\"\n[realtime]\ntyping_debounce_ms=500\n",
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert!(!cfg.logging_enabled);
        assert_eq!(cfg.jwt_secret, "s");
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.typing_debounce, Duration::from_millis(500));
        assert_eq!(cfg.scale_out, None);
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        assert!(load_with("[server]\nport=80\n[auth]\njwt_secret=\"s\"\n").is_err());
    }

    #[test]
    #[serial]
    fn missing_secret_fails() {
        clear_env();
        let err = load_with("").unwrap_err();
        assert!(err.to_string().contains("jwt secret"));
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        std::env::set_var("COLLAB_CHAT_JWT_SECRET", "env-secret");
        let cfg = load_with("").unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8787");
        assert!(cfg.logging_enabled);
        assert_eq!(cfg.jwt_secret, "env-secret");
        assert_eq!(cfg.typing_debounce, Duration::from_secs(2));
        assert_eq!(cfg.database_path, PathBuf::from("data/collab_chat.db"));
        clear_env();
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[server]\nport=1111\n[auth]\njwt_secret=\"s\"\n").unwrap();
        std::env::set_var("COLLAB_CHAT_PORT", "2222");
        let cli = Cli {
            config: Some(path.clone()),
            port: Some(3333),
            ..Default::default()
        };
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");

        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        assert_eq!(Config::load(&cli).unwrap().bind, "127.0.0.1:2222");
        clear_env();
    }

    #[test]
    #[serial]
    fn scale_out_from_file_and_env() {
        clear_env();
        let cfg = load_with(
            "[auth]\njwt_secret=\"s\"\n[scale_out]\nredis_url=\"redis://a\"\nchannel=\"rooms\"\n",
        )
        .unwrap();
        assert_eq!(
            cfg.scale_out,
            Some(ScaleOut {
                redis_url: "redis://a".into(),
                channel: "rooms".into()
            })
        );

        std::env::set_var("COLLAB_CHAT_REDIS_URL", "redis://b");
        let cfg = load_with("[auth]\njwt_secret=\"s\"\n").unwrap();
        assert_eq!(
            cfg.scale_out,
            Some(ScaleOut {
                redis_url: "redis://b".into(),
                channel: DEFAULT_CHANNEL.into()
            })
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn secret_is_redacted_in_debug() {
        clear_env();
        let cfg = load_with("[auth]\njwt_secret=\"hunter2\"\n").unwrap();
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
