mod auth;
mod client;
mod config;
mod consumer;
mod control;
mod daemon;
mod datasite_state;
mod fsops;
mod hash;
mod ignore;
mod local_state;
mod logging;
mod login;
mod manager;
mod permission;
mod producer;
mod queue;
mod rsync;
mod server;
mod sync_client;
mod telemetry;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{Config, ConfigOverrides};

#[derive(Parser, Debug)]
#[command(name = "syftbox", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Data directory override (takes precedence over env/config)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    /// Control plane URL override (takes precedence over env/config)
    #[arg(long = "client-url")]
    client_url: Option<String>,

    /// Control plane token override (takes precedence over env/config)
    #[arg(long = "client-token")]
    client_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Login to the syftbox datasite
    #[command(alias = "init")]
    Login {
        /// Disable output
        #[arg(short = 'q', long = "quiet", default_value_t = false)]
        quiet: bool,
    },

    /// Run the client daemon
    Daemon {
        /// Address to bind the local http control plane
        #[arg(short = 'a', long = "http-addr", default_value = "localhost:7938")]
        http_addr: String,

        /// Access token for the local http control plane
        #[arg(short = 't', long = "http-token", default_value = "")]
        http_token: String,
    },

    /// Run the cache server's `/sync/*` HTTP surface
    Serve {
        /// Address to bind the server to
        #[arg(short = 'a', long = "addr", default_value = "0.0.0.0:8080")]
        addr: String,

        /// Directory holding the server's file snapshots and metadata database
        #[arg(short = 'd', long = "state-dir")]
        state_dir: PathBuf,
    },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,

    /// Continuously poll local control plane /v1/status
    WatchStatus {
        /// Poll interval (e.g. 1s, 250ms)
        #[arg(long = "interval", default_value = "1s")]
        interval: String,

        /// Print raw json without pretty formatting
        #[arg(long = "raw", default_value_t = false)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        email,
        datadir,
        server,
        client_url,
        client_token,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());

    match command {
        Some(Commands::Login { quiet }) => {
            let requested_server = server
                .clone()
                .unwrap_or_else(|| Config::default_server_url().to_string());
            login::run_login(login::LoginArgs {
                config_path: resolved_config,
                server_url: requested_server,
                data_dir: datadir.unwrap_or_else(Config::default_data_dir),
                email,
                quiet,
            })
            .await
        }
        Some(Commands::Serve { addr, state_dir }) => run_serve(addr, state_dir).await,
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::WatchStatus { interval, raw }) => {
            run_watch_status(interval, raw, client_url, client_token, resolved_config).await
        }
        Some(Commands::Daemon {
            http_addr,
            http_token,
        }) => {
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg, http_addr, http_token).await
        }
        None => {
            // `syftbox` with no subcommand runs the daemon.
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            let http_addr = cfg
                .client_url
                .as_deref()
                .and_then(client_url_to_addr)
                .unwrap_or_else(|| "127.0.0.1:7938".to_string());
            run_daemon(cfg, http_addr, String::new()).await
        }
    }
}

async fn run_daemon(cfg: Config, http_addr: String, http_token: String) -> Result<()> {
    let opts = daemon::DaemonOptions {
        http_addr: Some(http_addr),
        http_token: if http_token.trim().is_empty() {
            None
        } else {
            Some(http_token)
        },
        healthz_max_attempts: Some(60),
        log_path: None,
    };
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_task = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_task.notify_waiters();
    });
    daemon::run_daemon_with_shutdown(cfg, opts, shutdown).await
}

async fn run_serve(addr: String, state_dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&state_dir)?;
    let db_path = state_dir.join("metadata.sqlite3");
    let snapshot_dir = state_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)?;

    let store = server::FileStore::open(&db_path, &snapshot_dir)?;
    let state = Arc::new(server::ServerState {
        store,
        datasites_root: snapshot_dir,
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    crate::logging::info_kv("cache server listening", &[("addr", addr.as_str())]);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn client_url_to_addr(client_url: &str) -> Option<String> {
    let u = client_url.trim();
    if u.is_empty() {
        return None;
    }
    let parsed = url::Url::parse(u).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port().unwrap_or(7938);
    Some(format!("{host}:{port}"))
}

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let revision = option_env!("SYFTBOX_REVISION").unwrap_or("HEAD");
    let build_date = option_env!("SYFTBOX_BUILD_DATE").unwrap_or("");
    format!(
        "{} ({}; rust; {}/{}; {})",
        version,
        revision,
        std::env::consts::OS,
        std::env::consts::ARCH,
        build_date
    )
}

#[cfg(test)]
mod control_plane_tests {
    use super::*;

    #[test]
    fn root_cli_allows_no_subcommand() {
        let cli = Cli::try_parse_from(["syftbox"]).unwrap();
        assert!(cli.command.is_none());
    }
}

async fn run_watch_status(
    interval: String,
    raw: bool,
    client_url: Option<String>,
    client_token: Option<String>,
    config_path: PathBuf,
) -> Result<()> {
    let overrides = ConfigOverrides {
        email: None,
        data_dir: None,
        server_url: None,
        client_url,
        client_token,
    };

    let (client_url, client_token) = Config::load_control_plane_settings(&config_path, &overrides)?;
    let client_url = client_url.unwrap_or_default();
    let client_token = client_token.unwrap_or_default();
    if client_url.trim().is_empty() || client_token.trim().is_empty() {
        anyhow::bail!("client control plane not configured; set --client-url/--client-token or SYFTBOX_CLIENT_URL/SYFTBOX_CLIENT_TOKEN");
    }

    let poll_every = parse_duration(&interval)?;
    let status_url = format!("{}/v1/status", client_url.trim_end_matches('/'));
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let mut ticker = tokio::time::interval(poll_every);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                let resp = http
                    .get(&status_url)
                    .header("Authorization", format!("Bearer {client_token}"))
                    .send()
                    .await;
                let resp = match resp {
                    Ok(r) => r,
                    Err(e) => {
                        eprintln!("{} ERROR {}", chrono::Utc::now().to_rfc3339(), e);
                        continue;
                    }
                };
                let body = match resp.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        eprintln!("{} ERROR {}", chrono::Utc::now().to_rfc3339(), e);
                        continue;
                    }
                };
                if raw {
                    println!("{}", String::from_utf8_lossy(&body));
                    continue;
                }
                let parsed: serde_json::Value = match serde_json::from_slice(&body) {
                    Ok(v) => v,
                    Err(_) => {
                        println!("{}", String::from_utf8_lossy(&body));
                        continue;
                    }
                };
                println!("{}", serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| String::from_utf8_lossy(&body).to_string()));
            }
        }
    }
}

fn parse_duration(raw: &str) -> Result<std::time::Duration> {
    let s = raw.trim();
    if s.is_empty() {
        anyhow::bail!("invalid duration: empty");
    }
    let (num, unit) = if let Some(v) = s.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = s.strip_suffix('s') {
        (v, "s")
    } else {
        // default seconds if no unit
        (s, "s")
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration: {raw}"))?;
    Ok(match unit {
        "ms" => std::time::Duration::from_millis(value),
        "s" => std::time::Duration::from_secs(value),
        _ => std::time::Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "syftbox",
            "-c",
            "config.json",
            "daemon",
            "-a",
            "127.0.0.1:7938",
            "-t",
            "token123",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Daemon {
                http_addr,
                http_token,
            }) => {
                assert_eq!(http_addr, "127.0.0.1:7938");
                assert_eq!(http_token, "token123");
            }
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn serve_cli_parses_flags() {
        let cli = Cli::try_parse_from(["syftbox", "serve", "-a", "0.0.0.0:9000", "-d", "/tmp/syftbox-server"])
            .unwrap();
        match cli.command {
            Some(Commands::Serve { addr, state_dir }) => {
                assert_eq!(addr, "0.0.0.0:9000");
                assert_eq!(state_dir, PathBuf::from("/tmp/syftbox-server"));
            }
            _ => panic!("expected serve command"),
        }
    }

    #[test]
    fn watch_status_cli_parses_flags() {
        let cli = Cli::try_parse_from(["syftbox", "watch-status", "--interval", "250ms", "--raw"])
            .unwrap();
        match cli.command {
            Some(Commands::WatchStatus { interval, raw }) => {
                assert_eq!(interval, "250ms");
                assert!(raw);
            }
            _ => panic!("expected watch-status"),
        }
    }

    #[test]
    fn login_cli_supports_init_alias() {
        let cli = Cli::try_parse_from(["syftbox", "init", "--quiet"]).unwrap();
        match cli.command {
            Some(Commands::Login { quiet }) => assert!(quiet),
            _ => panic!("expected login via init alias"),
        }
    }

    #[test]
    fn parse_duration_accepts_ms_and_s() {
        assert_eq!(
            parse_duration("250ms").unwrap(),
            std::time::Duration::from_millis(250)
        );
        assert_eq!(
            parse_duration("2s").unwrap(),
            std::time::Duration::from_secs(2)
        );
        assert_eq!(
            parse_duration("2").unwrap(),
            std::time::Duration::from_secs(2)
        );
        assert!(parse_duration("").is_err());
    }
}
