//! Console styling for the tts-gateway binary

use owo_colors::OwoColorize;

use crate::config::GatewayConfig;
use crate::store::SweepReport;

/// Check if terminal supports colors
pub fn supports_color() -> bool {
    supports_color::on(supports_color::Stream::Stdout).is_some()
}

pub fn get_banner() -> &'static str {
    r#"
  ████████ ████████ ███████      ██████   █████  ████████ ███████ ██     ██  █████  ██    ██
     ██       ██    ██          ██       ██   ██    ██    ██      ██     ██ ██   ██  ██  ██
     ██       ██    ███████     ██   ███ ███████    ██    █████   ██  █  ██ ███████   ████
     ██       ██         ██     ██    ██ ██   ██    ██    ██      ██ ███ ██ ██   ██    ██
     ██       ██    ███████      ██████  ██   ██    ██    ███████  ███ ███  ██   ██    ██

                        Real-Time Text-to-Speech over WebSocket
"#
}

/// Print the banner with gradient colors
pub fn print_banner() {
    let banner = get_banner();

    if supports_color() {
        for (i, line) in banner.lines().enumerate() {
            match i % 4 {
                0 => println!("{}", line.bright_cyan()),
                1 => println!("{}", line.cyan()),
                2 => println!("{}", line.bright_blue()),
                _ => println!("{}", line.blue()),
            }
        }
    } else {
        println!("{}", banner);
    }
}

/// Print a boxed list of label/value pairs
pub fn print_box(title: &str, content: &[(&str, String)]) {
    let width: usize = 60;
    let title_width = title.len() + 4;
    let padding = width.saturating_sub(title_width) / 2;

    println!("╔{}╗", "═".repeat(width));
    if supports_color() {
        println!("║{}{}", " ".repeat(padding), title.bright_cyan().bold());
    } else {
        println!("║{}{}", " ".repeat(padding), title);
    }
    println!("╠{}╣", "═".repeat(width));

    for (label, value) in content {
        if supports_color() {
            println!("║  {}: {}", label.bright_blue(), value);
        } else {
            println!("║  {}: {}", label, value);
        }
    }

    println!("╚{}╝", "═".repeat(width));
}

/// Print a section header
pub fn print_section(title: &str) {
    if supports_color() {
        println!("\n{}", "━".repeat(60).bright_black());
        println!("  {}", title.bright_cyan().bold());
        println!("{}", "━".repeat(60).bright_black());
    } else {
        println!("\n{}", "━".repeat(60));
        println!("  {}", title);
        println!("{}", "━".repeat(60));
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    if supports_color() {
        println!("{} {}", "✓".bright_green().bold(), message.green());
    } else {
        println!("[OK] {}", message);
    }
}

/// Print an error message
pub fn print_error(message: &str) {
    if supports_color() {
        eprintln!("{} {}", "✗".bright_red().bold(), message.red());
    } else {
        eprintln!("[ERR] {}", message);
    }
}

/// Print a warning message
pub fn print_warning(message: &str) {
    if supports_color() {
        println!("{} {}", "⚠".bright_yellow().bold(), message.yellow());
    } else {
        println!("[WARN] {}", message);
    }
}

/// Print an info message
pub fn print_info(message: &str) {
    if supports_color() {
        println!("{} {}", "ℹ".bright_blue().bold(), message.bright_white());
    } else {
        println!("[INFO] {}", message);
    }
}

/// Label/value rows describing a server configuration
pub fn server_rows(config: &GatewayConfig) -> Vec<(&'static str, String)> {
    let mut rows = vec![
        ("Listen", config.bind_addr()),
        ("Audio dir", config.audio_dir.display().to_string()),
        ("Engine", config.engine.program.display().to_string()),
    ];
    if let Some(model) = &config.engine.model {
        rows.push(("Model", model.display().to_string()));
    }
    rows.push(("CUDA", config.engine.cuda.to_string()));
    rows.push(("Max jobs", config.max_concurrent_jobs.to_string()));
    rows.push((
        "Timeout",
        config
            .engine
            .timeout
            .map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "none".to_string()),
    ));
    rows.push((
        "Retention",
        format!(
            "sweep every {}s, keep {}s",
            config.retention.interval.as_secs(),
            config.retention.max_age.as_secs()
        ),
    ));
    rows
}

/// Print startup info for server
pub fn print_server_startup(config: &GatewayConfig) {
    print_banner();
    print_box("Gateway Configuration", &server_rows(config));

    println!();
    print_success(&format!(
        "Listening on ws://{}/ws/{{client_id}}",
        config.bind_addr()
    ));
    println!();

    if supports_color() {
        println!("{}", "Press Ctrl+C to stop".bright_black());
    } else {
        println!("Press Ctrl+C to stop");
    }
}

/// Print the outcome of a one-shot sweep
pub fn print_sweep_report(report: &SweepReport) {
    print_info(&format!(
        "Scanned {} file(s), deleted {}",
        report.scanned, report.deleted
    ));
    for failure in &report.failures {
        print_warning(&format!(
            "{}: {}",
            failure.path.display(),
            failure.error
        ));
    }
}
