//! Bridge from an external updater's progress callbacks onto a task

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};

use crate::blocking::{BlockingContext, InterruptFlag};
use crate::context::TaskContext;

const MAX_MESSAGE_LEN: usize = 50;
const PROCESSING: &str = "Processing...";

/// Callback surface of an external file updater
pub trait ProgressCallback: Send + Sync {
    fn update_title(&self, title: &str);

    fn update_label(&self, label: &str);

    /// `permille` is progress in thousandths, `0..=1000`
    fn update_progress(&self, text: &str, permille: u32);

    /// Polled by the updater between units of work
    fn should_interrupt(&self) -> bool;

    fn show_completion_message(&self, has_updates: bool);
}

/// [`ProgressCallback`] that publishes onto a running task
#[derive(Clone)]
pub struct TaskProgressCallback {
    cx: TaskContext,
    interrupt: InterruptFlag,
}

impl TaskProgressCallback {
    pub fn new(cx: TaskContext, interrupt: InterruptFlag) -> Self {
        Self { cx, interrupt }
    }

    pub fn from_blocking(bcx: &BlockingContext) -> Self {
        Self::new(bcx.task.clone(), bcx.interrupt.clone())
    }
}

impl ProgressCallback for TaskProgressCallback {
    fn update_title(&self, title: &str) {
        if self.should_interrupt() {
            return;
        }
        info!(task = %self.cx.id(), "updater title: {}", title);
        self.cx.update_message(title);
    }

    fn update_label(&self, label: &str) {
        if self.should_interrupt() {
            return;
        }
        info!(task = %self.cx.id(), "updater status: {}", label);
        self.cx.update_message(label);
    }

    fn update_progress(&self, text: &str, permille: u32) {
        if self.should_interrupt() {
            return;
        }
        self.cx.update_message(condense_progress_text(text));
        self.cx.update_progress(f64::from(permille.min(1000)) / 1000.0);
        if let Some(speed) = extract_speed(text) {
            self.cx.report_speed(parse_speed(speed));
        }
    }

    fn should_interrupt(&self) -> bool {
        self.interrupt.is_interrupted() || self.cx.is_cancelled()
    }

    fn show_completion_message(&self, has_updates: bool) {
        if self.should_interrupt() {
            return;
        }
        let message = if has_updates {
            "Files updated"
        } else {
            "Files are up to date"
        };
        info!(task = %self.cx.id(), "{}", message);
        self.cx.update_message(message);
        self.cx.report_speed(0);
    }
}

fn separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"\s+-\s+").expect("separator pattern is valid"))
}

/// Shorten an updater status line for display.
///
/// `"a - b - c"` keeps its first two parts; anything else longer than 50
/// characters is cut to 47 plus an ellipsis.
pub fn condense_progress_text(text: &str) -> String {
    if text.is_empty() {
        return PROCESSING.to_string();
    }
    let parts: Vec<&str> = separator().split(text).collect();
    if parts.len() >= 2 {
        return format!("{} - {}", parts[0], parts[1]);
    }
    if text.chars().count() > MAX_MESSAGE_LEN {
        let head: String = text.chars().take(MAX_MESSAGE_LEN - 3).collect();
        return format!("{head}...");
    }
    text.to_string()
}

/// The `" - "`-separated part of `text` that is a rate, like `"1.5 MiB/s"`
pub fn extract_speed(text: &str) -> Option<&str> {
    if !text.contains("/s") {
        return None;
    }
    separator()
        .split(text)
        .map(str::trim)
        .find(|part| part.ends_with("/s"))
}

/// Parse `"1.5 MiB/s"`, `"300 KB/s"` or `"20 B/s"` to bytes per second.
///
/// Unparseable input yields zero.
pub fn parse_speed(text: &str) -> u64 {
    let clean = text.replace("/s", "").trim().to_lowercase();
    let (number, multiplier) = if let Some(n) = strip_any(&clean, &["mib", "mb"]) {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = strip_any(&clean, &["kib", "kb"]) {
        (n, 1024.0)
    } else if let Some(n) = clean.strip_suffix('b') {
        (n, 1.0)
    } else {
        return 0;
    };
    match number.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => (value * multiplier) as u64,
        _ => {
            debug!(speed = text, "unparseable transfer speed");
            0
        }
    }
}

fn strip_any<'a>(text: &'a str, suffixes: &[&str]) -> Option<&'a str> {
    suffixes.iter().find_map(|s| text.strip_suffix(s))
}
