//! Agent health command

use anyhow::Result;
use colored::Colorize;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, OutputFormat};

pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    if let OutputFormat::Json = format {
        return print_json(&health);
    }

    println!("{}", "Agent Health".bold());
    println!("{}", "=".repeat(50));
    println!("Status:    {}", color_status(&health.status));
    println!();

    let mut components: Vec<_> = health.components.iter().collect();
    components.sort_by(|a, b| a.0.cmp(b.0));
    for (name, component) in components {
        match &component.message {
            Some(message) => println!(
                "  {:<12}{}  {}",
                name,
                color_status(&component.status),
                message.dimmed()
            ),
            None => println!("  {:<12}{}", name, color_status(&component.status)),
        }
    }

    Ok(())
}
