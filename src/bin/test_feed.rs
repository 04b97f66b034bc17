use anyhow::Result;
use colored::Colorize;
use std::env;
use std::process;
use tracing::Level;

use pressforward::logging::configure_cli_logging;
use pressforward::rss::{diagnose_feed, FeedStatus};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        return Ok(());
    }
    let verbose = args.iter().any(|arg| arg == "--verbose" || arg == "-v");
    configure_cli_logging(if verbose { Level::DEBUG } else { Level::WARN });

    let url = &args[1];
    println!("Testing feed: {}", url);
    let result = diagnose_feed(url).await;

    println!("\n{}", "═".repeat(100).bright_blue());
    println!("{}  {}", "FEED DIAGNOSTICS".bright_blue(), url.bright_yellow());
    println!("{}", "═".repeat(100).bright_blue());

    let status = format!("{:?}", result.status);
    let status = match result.status {
        FeedStatus::Success => status.bright_green(),
        FeedStatus::RequestFailed | FeedStatus::InvalidUrl => status.bright_red(),
        _ => status.bright_yellow(),
    };
    println!("{}: {}", "Status".bright_blue(), status);
    println!(
        "{}: {}",
        "Content-Type".bright_blue(),
        result.content_type.as_deref().unwrap_or("None")
    );
    println!(
        "{}: {}",
        "Encoding".bright_blue(),
        result.detected_encoding.as_deref().unwrap_or("Unknown")
    );

    if verbose && !result.headers.is_empty() {
        println!("\n{}", "HTTP Headers".bright_blue());
        println!("{}", "─".repeat(80).dimmed());
        for (name, value) in &result.headers {
            println!("{}: {}", name.cyan(), value);
        }
    }

    if let Some(preview) = &result.decoded_preview {
        println!("\n{}", "Preview".bright_blue());
        println!("{}", "─".repeat(80).dimmed());
        println!("{}", preview.dimmed());
    }

    for warning in &result.warnings {
        println!("{} {}", "warning:".bright_yellow(), warning);
    }
    for error in &result.errors {
        println!("{} {}", "error:".bright_red(), error);
    }

    println!("\n{} ({})", "Entries".bright_blue(), result.entries.len());
    println!("{}", "─".repeat(80).dimmed());
    for (i, entry) in result.entries.iter().enumerate() {
        println!(
            "{:>3}. {}\n     {} {}",
            i + 1,
            entry.title.bright_white(),
            entry.link.cyan(),
            entry.published.as_deref().unwrap_or("").dimmed()
        );
    }

    if result.status != FeedStatus::Success {
        process::exit(1);
    }
    Ok(())
}

fn print_usage(program: &str) {
    println!("Usage: {} <feed-url> [--verbose]", program);
    println!();
    println!("Fetches a feed the way retrieval does and reports what was found.");
}
