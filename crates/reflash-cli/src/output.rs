//! Console output helpers

use colored::Colorize;
use indicatif::ProgressBar;
use reflash_uds::event::{ClientEvent, LogLevel};

/// Console rendering state shared by all subcommands.
pub struct OutputContext {
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { quiet }
    }

    /// Green completion line, suppressed by `--quiet`.
    pub fn success(&self, msg: &str) {
        if self.quiet {
            return;
        }
        println!("{}", msg.green());
    }

    /// Plain line, suppressed by `--quiet`.
    pub fn info(&self, msg: &str) {
        if self.quiet {
            return;
        }
        println!("{}", msg);
    }

    /// Yellow line on stderr, printed even under `--quiet`.
    #[allow(dead_code)]
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Render a client event as a console line. With a progress bar
    /// attached, log lines go through it so they do not clobber the bar.
    pub fn render_event(&self, event: &ClientEvent, bar: Option<&ProgressBar>) {
        match event {
            ClientEvent::Progress { percent } => {
                if let Some(bar) = bar {
                    bar.set_position(*percent as u64);
                }
            }
            ClientEvent::Log { level, message } => {
                let line = match level {
                    LogLevel::Debug => return,
                    LogLevel::Info => {
                        if self.quiet {
                            return;
                        }
                        message.normal().to_string()
                    }
                    LogLevel::Warning => message.yellow().to_string(),
                    LogLevel::Error => message.red().to_string(),
                };
                match bar {
                    Some(bar) => bar.println(line),
                    None => println!("{}", line),
                }
            }
            ClientEvent::Frame { .. } => {}
        }
    }
}
