mod accounts;
mod farm;
mod maintenance;

use anyhow::Result;
use console::style;

use crate::core::config::{BotConfig, ResolvedPaths};
use crate::core::context::AppContext;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Farming")
        .command("run", "Start sessions for every account and supervise them")
        .command("status", "Show accounts, their status and last balance")
        .print();

    GuideSection::new("Accounts")
        .command("login <email>", "Authorize an account with Google")
        .command("remove <email>", "Forget an account and its credential")
        .print();

    GuideSection::new("Maintenance")
        .command("backup", "Snapshot the database and log file now")
        .command("rotate-key", "Replace the encryption key and re-encrypt credentials")
        .print();

    println!(
        "\n {} {} <command> [arguments]\n",
        style("Usage:").bold(),
        style("grassbot").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RunArgs {
    pub accounts: Vec<String>,
    pub quiet: bool,
}

pub(crate) fn parse_run_args(args: &[String], start: usize) -> RunArgs {
    let mut parsed = RunArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--account" | "-a" => {
                if i + 1 < args.len() {
                    parsed.accounts.push(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--quiet" | "-q" => {
                parsed.quiet = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    parsed
}

/// First positional argument after the subcommand.
pub(crate) fn positional(args: &[String], index: usize) -> Option<&str> {
    args.get(index)
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
}

/// Resolve the data directory, load config and start logging. Logging goes
/// to the log file; `echo` mirrors it to stdout.
async fn load_settings(echo: bool) -> Result<(BotConfig, ResolvedPaths)> {
    let data_dir = NativePlatform::data_dir();
    tokio::fs::create_dir_all(&data_dir).await?;
    NativePlatform::restrict_dir_permissions(&data_dir);

    let config = BotConfig::load(&data_dir).await?;
    let paths = config.resolve_paths(&data_dir);
    crate::logging::init(&paths.log_file, echo)?;
    Ok((config, paths))
}

async fn prepare(echo: bool) -> Result<AppContext> {
    let (config, paths) = load_settings(echo).await?;
    AppContext::bootstrap(config, paths).await
}

/// For commands that must not share the data directory with another
/// process.
async fn prepare_exclusive(echo: bool, purpose: &str) -> Result<AppContext> {
    let (config, paths) = load_settings(echo).await?;
    AppContext::bootstrap_exclusive(config, paths, purpose).await
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() <= 1 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    match cmd {
        "run" => {
            let run_args = parse_run_args(&args, 2);
            let ctx = prepare_exclusive(!run_args.quiet, "run").await?;
            farm::run_farm(ctx, run_args).await
        }
        "status" => {
            let ctx = prepare(false).await?;
            accounts::show_status(&ctx).await
        }
        "login" => {
            let Some(email) = positional(&args, 2) else {
                print_error("Usage: grassbot login <email>");
                return Ok(());
            };
            let ctx = prepare(false).await?;
            accounts::login(&ctx, email).await
        }
        "remove" | "rm" => {
            let Some(email) = positional(&args, 2) else {
                print_error("Usage: grassbot remove <email>");
                return Ok(());
            };
            let ctx = prepare(false).await?;
            accounts::remove(&ctx, email).await
        }
        "backup" => {
            let ctx = prepare(false).await?;
            maintenance::backup(&ctx).await
        }
        "rotate-key" => {
            let ctx = prepare_exclusive(false, "rotate-key").await?;
            maintenance::rotate_key(&ctx).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
