use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::{request_email_code, validate_token, verify_email_code};
use crate::config::{validate_email, validate_url, Config};

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    email: String,
    #[serde(default)]
    server_url: String,
    #[serde(default)]
    client_url: String,
    #[serde(default)]
    refresh_token: String,
}

pub struct LoginArgs {
    pub config_path: PathBuf,
    pub server_url: String,
    pub data_dir: PathBuf,
    pub email: Option<String>,
    pub quiet: bool,
}

pub async fn run_login(args: LoginArgs) -> Result<()> {
    if already_logged_in(&args.config_path, &args.server_url).is_ok() {
        if args.quiet {
            return Ok(());
        }
        let cfg = Config::load_file_only(&args.config_path)?;
        print!("{}", format_already_logged_in(&args.config_path, &cfg));
        return Ok(());
    }

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("build http client")?;

    let email = match args.email {
        Some(e) => e,
        None => prompt_line("Email: ")?,
    };
    validate_email(&email).context("email")?;
    validate_url(&args.server_url).context("server_url")?;

    if !args.quiet {
        eprintln!("Requesting one-time code...");
    }
    request_email_code(&http, &args.server_url, &email).await?;

    let code = prompt_line("Code: ")?;
    let tokens = verify_email_code(&http, &args.server_url, &email, &code).await?;

    validate_token(&tokens.refresh_token, "refresh", &email).context("refresh token")?;
    validate_token(&tokens.access_token, "access", &email).context("access token")?;

    let cfg = Config::new_for_save(
        &args.config_path,
        &args.data_dir,
        &email,
        &args.server_url,
        Some(Config::default_client_url().to_string()),
        None,
        Some(tokens.refresh_token),
    )?;
    cfg.save()?;

    if !args.quiet {
        println!("SyftBox datasite initialized");
        print!("{}", format_already_logged_in(&args.config_path, &cfg));
    }

    Ok(())
}

fn already_logged_in(config_path: &Path, requested_server: &str) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!("no config");
    }
    let data = std::fs::read_to_string(config_path)
        .with_context(|| format!("read {}", config_path.display()))?;
    let file: FileConfig = serde_json::from_str(&data).context("parse config")?;

    validate_email(&file.email).context("email")?;
    validate_url(&file.server_url).context("server_url")?;
    if !file.client_url.trim().is_empty() {
        validate_url(&file.client_url).context("client_url")?;
    }
    if file.refresh_token.trim().is_empty() {
        anyhow::bail!("no refresh token");
    }
    if file.server_url != requested_server {
        anyhow::bail!("server changed");
    }
    validate_token(&file.refresh_token, "refresh", &file.email)?;
    Ok(())
}

pub fn format_already_logged_in(config_path: &Path, cfg: &Config) -> String {
    let mut s = String::new();
    s.push_str("**Already logged in**\n");
    s.push('\n');
    s.push_str("SYFTBOX DATASITE CONFIG\n");
    s.push_str(&format!("Email\t{}\n", cfg.email));
    s.push_str(&format!("Data\t{}\n", cfg.data_dir.display()));
    s.push_str(&format!("Config\t{}\n", config_path.display()));
    s.push_str(&format!("Server\t{}\n", cfg.server_url));
    s.push_str(&format!(
        "Client\t{}\n",
        cfg.client_url.clone().unwrap_or_default()
    ));
    s.push('\n');
    s
}

fn prompt_line(prompt: &str) -> Result<String> {
    let mut out = io::stderr();
    let _ = out.write_all(prompt.as_bytes());
    let _ = out.flush();
    let mut buf = String::new();
    io::stdin().read_line(&mut buf).context("read stdin")?;
    Ok(buf.trim().to_string())
}
