//! Client-side subcommands that talk to a running gateway over its HTTP API.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;

use mobyclaw_config::GatewayConfig;

use crate::ScheduleCommands;

fn base_url(config: &GatewayConfig) -> String {
    format!("http://localhost:{}", config.http.port)
}

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build http client")
}

pub async fn status(config: &GatewayConfig) -> Result<()> {
    let response = client()?
        .get(format!("{}/status", base_url(config)))
        .send()
        .await
        .context("is the gateway running? (mobyclaw start)")?;
    let body: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn schedule(config: &GatewayConfig, command: ScheduleCommands) -> Result<()> {
    let base = base_url(config);
    let client = client()?;

    match command {
        ScheduleCommands::List { status } => {
            let mut request = client.get(format!("{base}/api/schedules"));
            if let Some(status) = status {
                request = request.query(&[("status", status)]);
            }
            let body: serde_json::Value = request.send().await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        ScheduleCommands::Add {
            due,
            message,
            prompt,
            channel,
            repeat,
        } => {
            if message.is_none() && prompt.is_none() {
                bail!("one of --message or --prompt is required");
            }
            let response = client
                .post(format!("{base}/api/schedules"))
                .json(&json!({
                    "due": due,
                    "message": message,
                    "prompt": prompt,
                    "channel": channel,
                    "repeat": repeat,
                }))
                .send()
                .await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                bail!("gateway rejected the schedule: {body}");
            }
            println!("created {}", body["id"].as_str().unwrap_or("?"));
        }
        ScheduleCommands::Cancel { id } => {
            let response = client
                .delete(format!("{base}/api/schedules/{id}"))
                .send()
                .await?;
            if response.status().is_success() {
                println!("cancelled {id}");
            } else {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                bail!("cancel failed: {body}");
            }
        }
    }
    Ok(())
}

/// One line per external dependency: reachable or not.
pub async fn doctor(config: &GatewayConfig) -> Result<()> {
    let client = client()?;

    let agent_url = format!("{}/api/ping", config.upstream.base_url);
    report(
        "agent runtime",
        &agent_url,
        probe(&client, &agent_url).await,
    );

    if config.dashboard.base_url.is_empty() {
        println!("· dashboard       skipped (DASHBOARD_URL unset)");
    } else {
        let url = &config.dashboard.base_url;
        report("dashboard", url, probe(&client, url).await);
    }

    if config.telegram.enabled() {
        let url = format!(
            "https://api.telegram.org/bot{}/getMe",
            config.telegram.bot_token
        );
        let ok = probe(&client, &url).await;
        report("telegram", "api.telegram.org", ok);
    } else {
        println!("· telegram        skipped (TELEGRAM_BOT_TOKEN unset)");
    }

    let gateway_url = format!("{}/health", base_url(config));
    report("gateway", &gateway_url, probe(&client, &gateway_url).await);
    Ok(())
}

async fn probe(client: &reqwest::Client, url: &str) -> bool {
    client
        .get(url)
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

fn report(name: &str, target: &str, ok: bool) {
    let mark = if ok { "✓" } else { "✗" };
    println!("{mark} {name:<15} {target}");
}
