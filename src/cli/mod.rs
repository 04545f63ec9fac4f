//! CLI command implementations
//!
//! Each command returns the process exit code, or an error that `main` maps
//! to one.

pub mod connect;
pub mod maintenance;

use colored::Colorize;

/// Print a success line
pub fn print_ok(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a failure line to stderr
pub fn print_failure(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}
