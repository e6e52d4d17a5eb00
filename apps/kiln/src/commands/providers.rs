//! `kiln providers`: registered connectors and their health.

use crate::app::App;
use anyhow::Result;
use colored::Colorize;
use serde_json::json;

pub async fn execute(json_output: bool) -> Result<()> {
    let availability = App::registry().check_availability().await;

    if json_output {
        let out: Vec<_> = availability
            .iter()
            .map(|(name, health)| {
                json!({
                    "name": name,
                    "available": health.is_ok(),
                    "error": health.as_ref().err().map(ToString::to_string),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Providers ({})", availability.len()).bold().cyan());
    println!();
    for (name, health) in &availability {
        match health {
            Ok(()) => println!("  {} {}", "✓".green(), name),
            Err(e) => println!("  {} {} {}", "✗".red(), name, e.to_string().dimmed()),
        }
    }
    println!();
    Ok(())
}
