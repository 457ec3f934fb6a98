use anyhow::Result;

use crate::core::context::AppContext;
use crate::core::terminal::{print_status, print_success};
use crate::core::vault::CipherVault;

pub async fn backup(ctx: &AppContext) -> Result<()> {
    let target = ctx.backup_task().backup_now().await?;
    print_success("Backup completed");
    print_status("Location", &target.display().to_string());
    Ok(())
}

pub async fn rotate_key(ctx: &AppContext) -> Result<()> {
    anyhow::ensure!(
        ctx.holds_lock(),
        "key rotation needs exclusive use of the data directory"
    );
    let mut vault = CipherVault::new(&ctx.paths.key_file);
    let rewritten = vault.rotate(&ctx.store).await?;
    print_success(&format!(
        "Encryption key rotated; {} credential(s) re-encrypted",
        rewritten
    ));
    print_status("Key file", &ctx.paths.key_file.display().to_string());
    Ok(())
}
