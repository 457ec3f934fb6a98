use console::{Emoji, StyledObject, style};

use crate::core::store::{AccountRecord, AccountStatus};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static SEEDLING: Emoji<'_, '_> = Emoji("🌱 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}


pub fn link(url: &str) -> String {
    style(url).underlined().cyan().to_string()
}

pub fn print_banner() {
    println!();
    println!(
        "{} {}",
        SEEDLING,
        style("grassbot").bold().green()
    );
    println!(
        "{}\n",
        style("Keeps farming sessions alive while you sleep.").dim()
    );
}

/// Boxed guide block: a titled section of commands, statuses and notes.
/// `print` closes the box; `open` leaves it open for a prompt that follows.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(text.to_string());
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines.push(format!(
            "{:<22} {}",
            style(name).green().bold(),
            style(description).dim()
        ));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("{}: {}", style(label).bold().cyan(), value));
        self
    }

    pub fn numbered(mut self, n: usize, text: &str) -> Self {
        self.lines.push(format!("{} {}", style(format!("{}.", n)).bold(), text));
        self
    }

    pub fn success(mut self, text: &str) -> Self {
        self.lines
            .push(format!("{}{}", SUCCESS_ICON, style(text).green()));
        self
    }

    pub fn open(self) {
        println!();
        println!("{} {}", style("┌").dim(), style(&self.title).bold());
        for line in &self.lines {
            if line.is_empty() {
                guide_bar();
            } else {
                println!("{}  {}", style("│").dim(), line);
            }
        }
    }

    pub fn print(self) {
        self.open();
        close_section();
    }
}

pub fn guide_bar() {
    println!("{}", style("│").dim());
}

pub fn close_section() {
    println!("{}", style("└").dim());
}

fn styled_status(status: AccountStatus) -> StyledObject<&'static str> {
    let label = style(status.as_str());
    match status {
        AccountStatus::Running | AccountStatus::Authenticated => label.green(),
        AccountStatus::Stalled | AccountStatus::Restarting | AccountStatus::Expired => {
            label.yellow()
        }
        AccountStatus::Failed => label.red().bold(),
        _ => label.dim(),
    }
}

/// One line per account: email, status, last metric and when it was taken.
pub fn print_accounts(records: &[AccountRecord]) {
    if records.is_empty() {
        print_info("No accounts registered yet. Run `grassbot login <email>` first.");
        return;
    }

    let width = records.iter().map(|r| r.email.len()).max().unwrap_or(0);
    println!(
        "  {:<width$}  {:<16}  {:>14}  {}",
        style("ACCOUNT").bold(),
        style("STATUS").bold(),
        style("POINTS").bold(),
        style("LAST CHECK").bold(),
        width = width
    );
    for record in records {
        let metric = record
            .last_metric
            .map(|m| format!("{:.2}", m))
            .unwrap_or_else(|| "-".to_string());
        let checked = record
            .last_check
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        let credential = if record.has_credential() { "" } else { " (no credential)" };
        println!(
            "  {:<width$}  {:<16}  {:>14}  {}{}",
            record.email,
            styled_status(record.status),
            metric,
            checked,
            style(credential).dim(),
            width = width
        );
    }
}

pub fn print_goodbye() {
    println!(
        "\n{} {}",
        SPARKLE,
        style("grassbot stopped. See you next time!").bold().cyan()
    );
}
