//! Subcommand handlers.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};

use void_core::buildinfo;

use crate::client::Client;

pub async fn block(client: &Client, domain: &str, duration: Option<&str>) -> Result<()> {
    let ttl = match duration {
        Some(text) => humantime::parse_duration(text)
            .with_context(|| format!("invalid duration {text:?}"))?,
        None => Duration::ZERO,
    };

    if ttl.is_zero() && !confirm_permanent(domain)? {
        anyhow::bail!("operation aborted");
    }

    client.block(domain, ttl).await?;

    if ttl.is_zero() {
        println!("Blocked {domain} permanently");
    } else {
        println!("Blocked {domain} for {}", humantime::format_duration(ttl));
    }
    Ok(())
}

pub async fn unblock(client: &Client, id: &str) -> Result<()> {
    client.unblock(id).await?;
    println!("Removed rule {id}");
    Ok(())
}

pub async fn list(client: &Client) -> Result<()> {
    let mut rules = client.rules().await?;
    if rules.is_empty() {
        println!("No active blocking rules");
        return Ok(());
    }
    rules.sort_by(|a, b| a.domain.cmp(&b.domain));

    println!(
        "{:<38} {:<30} {:<10} {}",
        "RULE ID", "DOMAIN", "PERMANENT", "EXPIRES"
    );
    for rule in rules {
        let expires = match rule.expires {
            Some(expires) => expires.to_rfc3339(),
            None => "never".to_string(),
        };
        println!(
            "{:<38} {:<30} {:<10} {}",
            rule.id,
            rule.domain,
            if rule.permanent { "yes" } else { "no" },
            expires
        );
    }
    Ok(())
}

pub async fn status(client: &Client) -> Result<()> {
    let status = client.status().await?;
    let uptime = Duration::from_secs(Duration::from_nanos(status.uptime).as_secs());

    println!("rules:   {}", status.rules);
    println!("uptime:  {}", humantime::format_duration(uptime));
    println!("version: {}", status.version);
    println!("commit:  {}", status.commit);
    Ok(())
}

pub fn version() {
    println!("version: {}", buildinfo::VERSION);
    println!("commit: {}", buildinfo::COMMIT);
}

/// Permanent blocks require an interactive yes.
fn confirm_permanent(domain: &str) -> Result<bool> {
    println!("WARNING: you are about to permanently block {domain}");
    println!("The domain stays blocked until it is explicitly unblocked.");
    print!("Are you sure you want to proceed? (y/yes/n/no): ");
    std::io::stdout().flush().context("failed to flush stdout")?;

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read input")?;

    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}
