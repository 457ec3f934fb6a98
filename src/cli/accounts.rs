use anyhow::Result;
use std::sync::Arc;

use crate::core::context::AppContext;
use crate::core::oauth::GoogleIdentityProvider;
use crate::core::terminal::{
    self, print_accounts, print_info, print_status, print_success, print_warn,
};

pub async fn login(ctx: &AppContext, email: &str) -> Result<()> {
    let provider = Arc::new(GoogleIdentityProvider::from_config(&ctx.config.identity)?);
    let tokens = ctx.token_lifecycle(provider);
    tokens.enroll(email).await?;

    print_success(&format!("{} is authorized; its token is stored encrypted.", email));
    if !ctx.config.accounts.iter().any(|a| a == email) {
        print_info("Run `grassbot run` to start farming.");
    }
    Ok(())
}

pub async fn show_status(ctx: &AppContext) -> Result<()> {
    let records = ctx.store.list_all().await?;
    terminal::print_step("Accounts");
    print_accounts(&records);

    let missing: Vec<&String> = ctx
        .config
        .accounts
        .iter()
        .filter(|a| !records.iter().any(|r| &r.email == *a))
        .collect();
    if !missing.is_empty() {
        println!();
        for email in missing {
            print_warn(&format!("{} is configured but has never logged in", email));
        }
    }

    println!();
    print_status("Data directory", &ctx.paths.data_dir.display().to_string());
    print_status("Log file", &ctx.paths.log_file.display().to_string());
    Ok(())
}

pub async fn remove(ctx: &AppContext, email: &str) -> Result<()> {
    if ctx.store.remove(email).await? {
        print_success(&format!("Removed {}", email));
    } else {
        print_warn(&format!("No stored account named {}", email));
    }
    Ok(())
}
