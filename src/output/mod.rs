use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
    {
        pb.set_style(spinner);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn step(num: usize, total: usize, msg: &str) {
    println!(
        "{} {}",
        style(format!("[{}/{}]", num, total)).bold().cyan(),
        msg
    );
}

pub fn success(msg: &str) {
    println!("{} {}", style("✓").bold().green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").bold().red(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", style("!").bold().yellow(), msg);
}

pub fn info(msg: &str) {
    println!("{} {}", style("→").bold().blue(), msg);
}

pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// A failed phase and what was done about it.
pub fn failure(phase: &str, action: &str) {
    error(&format!("Failed while {}", style(phase).bold()));
    eprintln!("  {} {}", style("↳").dim(), action);
}

/// `environment  declared  actual  verdict` row for sync/status reports.
pub fn report_row(environment: &str, declared: &str, actual: &str, verdict: &str) {
    let shown = |port: &str| {
        if port.is_empty() {
            "-".to_string()
        } else {
            port.to_string()
        }
    };
    println!(
        "  {:<16} {:>8} {:>8}  {}",
        style(environment).bold(),
        shown(declared),
        shown(actual),
        verdict
    );
}
