use std::{
    borrow::Cow,
    fmt::Display,
};

use colored::Colorize;
use indicatif::{
    ProgressBar,
    ProgressStyle,
};

/// Progress + diagnostics for the compile pipeline. A spinner carries the
/// current phase; log lines print above it so they survive the redraws.
pub struct Logger {
    bar: ProgressBar,
    running: bool,
    prefix: Option<String>,
}

const ANIMATION: &[&str; 2] = &["...", ""];

impl Logger {
    pub(crate) fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{prefix:.cyan} {msg} {spinner}")
                .unwrap()
                .tick_strings(ANIMATION),
        );
        bar.set_prefix("[ct]");

        Self {
            bar,
            running: false,
            prefix: None,
        }
    }

    /// A logger that never draws a spinner; used when stdout carries
    /// payload (`--in-mem`) or inside tests.
    pub(crate) fn quiet() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            running: false,
            prefix: None,
        }
    }

    pub(crate) fn set_prefix<S: Into<String>>(&mut self, prefix: S) {
        self.prefix = Some(prefix.into());
    }

    pub(crate) fn clear_prefix(&mut self) {
        self.prefix = None;
    }

    pub(crate) fn set_title(&mut self, title: impl Into<Cow<'static, str>>) {
        self.bar.set_message(title.into());
        self.running = true;
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.bar.finish_and_clear();
        }
    }

    fn emit<L: Display, S: AsRef<str>>(&self, level: L, msg: S) {
        if let Some(prefix) = &self.prefix {
            self.bar.println(format!(
                "{} {}{}{} {}",
                level,
                "(".bold(),
                prefix.bold(),
                ")".bold(),
                msg.as_ref()
            ))
        } else {
            self.bar.println(format!("{} {}", level, msg.as_ref()));
        }
    }

    pub fn info<S: AsRef<str>>(&self, msg: S) {
        self.emit("[ct::INFO]".blue().bold(), msg);
    }

    pub fn warning<S: AsRef<str>>(&self, msg: S) {
        self.emit("[ct::WARN]".yellow().bold(), msg);
    }

    pub fn debug<S: AsRef<str>>(&self, _msg: S) {
        #[cfg(debug_assertions)]
        {
            self.emit("[ct::DEBUG]".black().on_white(), _msg);
        }
    }

    pub fn error<S: AsRef<str>>(&self, msg: S) {
        self.emit("[ct::ERROR]".red().bold(), msg);
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore]
    fn test_style() {
        let mut logger = Logger::spinner();
        logger.set_title("TITLE HERE");
        logger.info("info");
        logger.warning("warning");
        logger.debug("debug");
        logger.error("error");

        std::thread::sleep(std::time::Duration::from_secs(2));
    }
}
