//! Terminal rendering for kiln commands.
//!
//! Every line printed by a command goes through [`status`] or [`print_stat`]
//! so that colors are only emitted when the stream supports them.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use kiln_lib::rulekey::RuleKey;
use kiln_lib::target::BuildTarget;

/// Hex digits of a rule key shown in human output.
const SHORT_KEY_LEN: usize = 10;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// Leading mark of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
  Built,
  Cached,
  Failed,
  Warn,
  Note,
}

impl Mark {
  fn glyph(self) -> &'static str {
    match self {
      Mark::Built => "✓",
      Mark::Cached => "◆",
      Mark::Failed => "✗",
      Mark::Warn => "⚠",
      Mark::Note => "•",
    }
  }

  fn stream(self) -> Stream {
    match self {
      Mark::Failed | Mark::Warn => Stream::Stderr,
      _ => Stream::Stdout,
    }
  }
}

/// Print `message` behind the glyph of `mark`. Failures and warnings go to
/// stderr and are colored as a whole.
pub fn status(mark: Mark, message: &str) {
  let stream = mark.stream();
  let glyph = mark.glyph();
  match mark {
    Mark::Built => println!("{} {}", glyph.if_supports_color(stream, |s| s.green()), message),
    Mark::Cached => println!("{} {}", glyph.if_supports_color(stream, |s| s.cyan()), message),
    Mark::Note => println!("{} {}", glyph.if_supports_color(stream, |s| s.blue()), message),
    Mark::Failed => eprintln!(
      "{} {}",
      glyph.if_supports_color(stream, |s| s.red()),
      message.if_supports_color(stream, |s| s.red())
    ),
    Mark::Warn => eprintln!(
      "{} {}",
      glyph.if_supports_color(stream, |s| s.yellow()),
      message.if_supports_color(stream, |s| s.yellow())
    ),
  }
}

pub fn print_success(message: &str) {
  status(Mark::Built, message);
}

pub fn print_error(message: &str) {
  status(Mark::Failed, message);
}

pub fn print_warning(message: &str) {
  status(Mark::Warn, message);
}

pub fn print_info(message: &str) {
  status(Mark::Note, message);
}

/// Indented `label: value` line.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// Abbreviated rule key for status lines.
pub fn short_key(key: &RuleKey) -> String {
  let mut hex = key.to_hex();
  hex.truncate(SHORT_KEY_LEN);
  hex
}

/// `//app:main → //lib:core → //lib:broken`
pub fn format_stack(stack: &[BuildTarget]) -> String {
  stack.iter().map(ToString::to_string).collect::<Vec<_>>().join(" → ")
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.1} {}", value, UNITS[unit])
}

/// Durations are rounded to milliseconds before display.
pub fn format_duration(duration: Duration) -> String {
  let rounded = Duration::from_millis(duration.as_millis() as u64);
  humantime::format_duration(rounded).to_string()
}
