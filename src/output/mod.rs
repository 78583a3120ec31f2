use console::{style, StyledObject};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const SPINNER_FRAMES: &str = "◜◠◝◞◡◟";

/// Status badges are plain words, right-aligned to one column.
fn badge(label: &str) -> StyledObject<String> {
    style(format!("{:>5}", label))
}

pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.magenta} {wide_msg}")
            .unwrap()
            .tick_chars(SPINNER_FRAMES),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold());
    println!("{}", style("─".repeat(msg.chars().count().min(60))).dim());
}

pub fn step(num: usize, total: usize, msg: &str) {
    println!(
        "{} {}",
        style(format!("{:>5}", format!("{}/{}", num, total))).bold().cyan(),
        msg
    );
}

pub fn success(msg: &str) {
    println!("{} {}", badge("ok").bold().green(), msg);
}

pub fn info(msg: &str) {
    println!("{} {}", badge("--").bold().blue(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", badge("warn").bold().yellow(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", badge("error").bold().red(), msg);
}

/// One line of a rendered plan or table, indented to the badge column.
pub fn item(msg: &str) {
    println!("      {}", msg);
}

/// Dim supplementary detail (ids, durations, paths).
pub fn detail(msg: &str) {
    println!("      {}", style(msg).dim());
}
