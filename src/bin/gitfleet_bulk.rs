use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;

/// Thin CLI over the running gitfleet server. Every subcommand goes through
/// the same REST contracts as the browser client; nothing here talks to
/// GitLab directly.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gitfleet server URL
    #[arg(short = 's', long, default_value = "http://127.0.0.1:7700")]
    server: String,

    /// GitLab personal access token (kept server-side after login)
    #[arg(long, env = "GITFLEET_TOKEN", hide_env_values = true)]
    token: String,

    /// GitLab base URL; empty uses the server's configured default
    #[arg(long, env = "GITFLEET_BASE_URL", default_value = "")]
    base_url: String,

    /// Poll interval while waiting for a job, in seconds
    #[arg(long, default_value_t = 2)]
    poll_secs: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Submit a bulk import plan (JSON or TOML tree file)
    Import {
        file: PathBuf,
        /// Root group id to import under
        #[arg(long)]
        parent_id: Option<u64>,
    },
    /// Submit a bulk settings plan for one scope
    Settings { scope: String, file: PathBuf },
    /// Submit a bulk delete plan
    Delete {
        file: PathBuf,
        /// Required; the server refuses without it
        #[arg(long)]
        confirm: bool,
    },
    /// Submit a bulk members plan
    Members { file: PathBuf },
    /// Show a job and exit
    Job { id: String },
    /// Cancel a job
    Cancel { id: String },
}

struct FleetClient {
    client: Client,
    server: String,
    cookie: String,
}

impl FleetClient {
    async fn login(server: &str, base_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let response = client
            .post(format!("{}/api/auth/login", server))
            .json(&json!({ "base_url": base_url, "token": token }))
            .send()
            .await
            .context("Failed to reach the gitfleet server")?;

        if !response.status().is_success() {
            bail!(
                "Login failed: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }

        let cookie = response
            .headers()
            .get("set-cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.to_string())
            .context("Login response had no session cookie")?;

        let body: Value = response.json().await?;
        if let Some(username) = body.pointer("/user/username").and_then(|u| u.as_str()) {
            println!("Logged in as {}", username);
        }

        Ok(Self {
            client,
            server: server.to_string(),
            cookie,
        })
    }

    async fn submit(&self, method: reqwest::Method, path: &str, body: Value) -> Result<String> {
        let response = self
            .client
            .request(method, format!("{}{}", self.server, path))
            .header("Cookie", &self.cookie)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!("Server rejected the plan: {} - {}", status, body);
        }
        body.get("jobId")
            .and_then(|id| id.as_str())
            .map(|id| id.to_string())
            .context("Response had no jobId")
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/jobs/{}/cancel", self.server, id))
            .header("Cookie", &self.cookie)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("Cancel failed: {}", response.status());
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/api/jobs/{}", self.server, id))
            .header("Cookie", &self.cookie)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("Job lookup failed: {}", response.status());
        }
        Ok(response.json().await?)
    }

    async fn watch(&self, id: &str, poll: Duration) -> Result<i32> {
        println!("Job {} submitted, watching...", id);
        loop {
            let job = self.get_job(id).await?;
            let state = job.get("state").and_then(|s| s.as_str()).unwrap_or("?");
            let completed = job.get("completed").and_then(|v| v.as_u64()).unwrap_or(0);
            let failed = job.get("failed").and_then(|v| v.as_u64()).unwrap_or(0);
            let total = job.get("total").and_then(|v| v.as_u64()).unwrap_or(0);
            println!("  {} {}/{} done, {} failed", state, completed, total, failed);

            match state {
                "succeeded" => {
                    println!("Job finished successfully");
                    return Ok(0);
                }
                "failed" => {
                    if let Some(items) = job.get("items").and_then(|i| i.as_array()) {
                        for item in items.iter().filter(|i| {
                            i.get("action").and_then(|a| a.as_str()) == Some("failed")
                        }) {
                            println!(
                                "  failed: {} ({})",
                                item.get("source").and_then(|s| s.as_str()).unwrap_or("?"),
                                item.get("error").and_then(|e| e.as_str()).unwrap_or("?"),
                            );
                        }
                    }
                    return Ok(1);
                }
                "cancelled" => {
                    println!("Job was cancelled");
                    return Ok(2);
                }
                _ => sleep(poll).await,
            }
        }
    }
}

/// Plan files are JSON or TOML, decided by extension.
fn load_plan(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw).context("Failed to parse TOML plan"),
        _ => serde_json::from_str(&raw).context("Failed to parse JSON plan"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("warn"));

    let args = Args::parse();
    let poll = Duration::from_secs(args.poll_secs.max(1));
    let fleet = FleetClient::login(&args.server, &args.base_url, &args.token).await?;

    let exit = match args.command {
        Cmd::Import { file, parent_id } => {
            let mut plan = load_plan(&file)?;
            if let (Some(obj), Some(id)) = (plan.as_object_mut(), parent_id) {
                obj.insert("parent_id".to_string(), json!(id));
            }
            let job_id = fleet
                .submit(reqwest::Method::POST, "/api/gitlab/bulk/import", plan)
                .await?;
            fleet.watch(&job_id, poll).await?
        }
        Cmd::Settings { scope, file } => {
            let plan = load_plan(&file)?;
            let job_id = fleet
                .submit(
                    reqwest::Method::PUT,
                    &format!("/api/gitlab/bulk/settings/{}", scope),
                    plan,
                )
                .await?;
            fleet.watch(&job_id, poll).await?
        }
        Cmd::Delete { file, confirm } => {
            let mut plan = load_plan(&file)?;
            if let Some(obj) = plan.as_object_mut() {
                obj.insert("confirm".to_string(), json!(confirm));
            }
            let job_id = fleet
                .submit(reqwest::Method::DELETE, "/api/gitlab/bulk/delete", plan)
                .await?;
            fleet.watch(&job_id, poll).await?
        }
        Cmd::Members { file } => {
            let plan = load_plan(&file)?;
            let job_id = fleet
                .submit(reqwest::Method::POST, "/api/gitlab/bulk/members", plan)
                .await?;
            fleet.watch(&job_id, poll).await?
        }
        Cmd::Job { id } => {
            let job = fleet.get_job(&id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            0
        }
        Cmd::Cancel { id } => {
            fleet.cancel(&id).await?;
            println!("Cancel signalled for {}", id);
            0
        }
    };

    std::process::exit(exit);
}
