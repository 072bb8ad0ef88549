//! Feedhub CLI
//!
//! Command-line interface for Feedhub operations:
//! - Probe a connection config before saving it
//! - Check server and feed status
//! - Start and stop feeds
//! - Try filters against sample data offline

use anyhow::Context;
use clap::{Parser, Subcommand};
use feedhub::connector::{test_connection, AdapterOptions, DecoderRegistry};
use feedhub::feed::FeedConnectionConfig;
use feedhub::filter::{available_fields, CompiledFilter, FilterSet};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "feedhub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Feed connector and filter engine")]
#[command(long_about = "Feedhub connects to WebSocket, HTTP and protobuf feeds, normalizes\ntheir events and streams them to filtered subscribers.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:8090", global = true)]
    pub api_url: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Test a connection config locally
    Test {
        /// Path to a JSON connection config
        path: PathBuf,
        /// Deadline in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Show server and feed status
    Status,

    /// Start a stored feed
    Activate {
        /// Feed ID
        feed_id: String,
    },

    /// Stop a running feed
    Deactivate {
        /// Feed ID
        feed_id: String,
    },

    /// Evaluate a filter set against sample data
    Filter {
        /// Path to a JSON filter set
        filter: PathBuf,
        /// Path to a JSON payload
        data: PathBuf,
    },

    /// List the field paths of sample data
    Fields {
        /// Path to a JSON payload
        data: PathBuf,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Test { path, timeout } => {
            let config: FeedConnectionConfig = read_json(&path)?;

            let result = test_connection(
                &config,
                &DecoderRegistry::with_builtin(),
                &AdapterOptions::default(),
                Duration::from_secs(timeout),
            )
            .await;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("URL:        {}", result.diagnostics.url);
                println!("Protocol:   {}", result.diagnostics.protocol);
                println!("Connected:  {}", if result.success { "yes" } else { "no" });
                if let Some(ms) = result.connection_time {
                    println!("Time:       {}ms", ms);
                }
                if let Some(status) = result.diagnostics.status_code {
                    println!("Status:     {}", status);
                }
                if let Some(error) = &result.error {
                    println!("Error:      {}", error);
                }
                if let Some(sample) = &result.sample_data {
                    println!();
                    println!("Sample:");
                    println!("{}", serde_json::to_string_pretty(sample)?);
                } else if result.success {
                    println!();
                    println!("Connected, but no data arrived before the deadline.");
                }
            }

            if !result.success {
                std::process::exit(1);
            }
        }

        Commands::Status => {
            let response = client.get(format!("{}/health", cli.api_url)).send().await;

            let health: Value = match response {
                Ok(resp) if resp.status().is_success() => resp.json().await?,
                Ok(resp) => {
                    eprintln!("API returned error: {}", resp.status());
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Cannot connect to Feedhub API at {}", cli.api_url);
                    eprintln!("Error: {}", e);
                    eprintln!();
                    eprintln!("Make sure the Feedhub server is running:");
                    eprintln!("  cargo run --bin feedhub");
                    std::process::exit(1);
                }
            };

            let feeds: Value = client
                .get(format!("{}/api/v1/feeds", cli.api_url))
                .send()
                .await?
                .json()
                .await?;

            if cli.format == "json" {
                let combined = serde_json::json!({"health": health, "feeds": feeds["feeds"]});
                println!("{}", serde_json::to_string_pretty(&combined)?);
                return Ok(());
            }

            println!("Feedhub v{}", health["version"].as_str().unwrap_or("?"));
            println!();
            println!("API Status: {}", health["status"].as_str().unwrap_or("unknown"));
            if let Some(uptime) = health["uptimeSeconds"].as_u64() {
                println!("Uptime:     {}", format_duration(uptime));
            }

            let hub = &health["hub"];
            println!();
            println!("Hub:");
            println!("  Subscriptions: {}", hub["subscriptions"].as_u64().unwrap_or(0));
            println!("  Connected:     {}", hub["connectedSubscribers"].as_u64().unwrap_or(0));
            println!("  Delivered:     {}", hub["delivered"].as_u64().unwrap_or(0));
            println!("  Dropped:       {}", hub["dropped"].as_u64().unwrap_or(0));

            println!();
            print_feeds(&feeds);
        }

        Commands::Activate { feed_id } => {
            let state = post_feed_action(&client, &cli.api_url, &feed_id, "activate").await?;
            println!("Activated {} ({})", feed_id, state["phase"].as_str().unwrap_or("unknown"));
        }

        Commands::Deactivate { feed_id } => {
            post_feed_action(&client, &cli.api_url, &feed_id, "deactivate").await?;
            println!("Deactivated {}", feed_id);
        }

        Commands::Filter { filter, data } => {
            let set: FilterSet = read_json(&filter)?;
            let data: Value = read_json(&data)?;

            if let Err(e) = set.validate() {
                eprintln!("Invalid filter '{}': {}", set.name, e);
                std::process::exit(1);
            }

            let outcome = CompiledFilter::compile(&set).evaluate(&data);
            let match_count = outcome.match_count();
            let total_count = outcome.total_count();
            let passed = outcome.into_data();

            if cli.format == "json" {
                let report = serde_json::json!({
                    "passed": passed.is_some(),
                    "matchCount": match_count,
                    "totalCount": total_count,
                    "data": passed,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Filter:  {}", set.name);
                println!("Matched: {} of {}", match_count, total_count);
                if let Some(passed) = passed {
                    println!();
                    println!("{}", serde_json::to_string_pretty(&passed)?);
                }
            }
        }

        Commands::Fields { data } => {
            let data: Value = read_json(&data)?;
            let fields = available_fields(&data);

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&fields)?);
            } else if fields.is_empty() {
                println!("No fields found.");
            } else {
                println!("{:<32} {:<8} {}", "Path", "Type", "Sample");
                println!("{}", "-".repeat(60));
                for field in fields {
                    println!("{:<32} {:<8} {}", field.path, field.kind, field.sample);
                }
            }
        }

        Commands::Config { output } => {
            let config = feedhub::config::generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {:?}", path))
}

/// POST to `/feeds/:id/{action}`; returns the reported connection state
async fn post_feed_action(
    client: &reqwest::Client,
    api_url: &str,
    feed_id: &str,
    action: &str,
) -> anyhow::Result<Value> {
    let response = client
        .post(format!("{}/api/v1/feeds/{}/{}", api_url, feed_id, action))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        eprintln!(
            "Failed to {} {} ({}): {}",
            action,
            feed_id,
            status,
            body["error"]["message"].as_str().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;
    Ok(body["state"].clone())
}

fn print_feeds(data: &Value) {
    let feeds = match data["feeds"].as_array() {
        Some(f) if !f.is_empty() => f,
        _ => {
            println!("No feeds in the catalog.");
            return;
        }
    };

    println!(
        "{:<20} {:<14} {:<13} {:>8} {:>6} {:>5}",
        "Feed", "Protocol", "State", "Events", "Errors", "Subs"
    );
    println!("{}", "-".repeat(71));

    for feed in feeds {
        let stats = &feed["stats"];
        println!(
            "{:<20} {:<14} {:<13} {:>8} {:>6} {:>5}",
            feed["id"].as_str().unwrap_or("-"),
            feed["protocol"].as_str().unwrap_or("-"),
            feed["state"]["phase"].as_str().unwrap_or("-"),
            stats["eventsReceived"].as_u64().unwrap_or(0),
            stats["errors"].as_u64().unwrap_or(0),
            feed["subscribers"].as_u64().unwrap_or(0),
        );
        if let Some(error) = feed["state"]["lastError"].as_str() {
            println!("    last error: {}", error);
        }
    }
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}
