use anstyle::{AnsiColor, Style};
use is_terminal::IsTerminal;
use std::fmt::Display;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy)]
enum Level {
    Plain,
    Info,
    Warn,
    Error,
}

fn style_for(level: Level) -> Option<Style> {
    let style = Style::new().bold();
    match level {
        Level::Plain => None,
        Level::Info => Some(style.fg_color(Some(AnsiColor::Blue.into()))),
        Level::Warn => Some(style.fg_color(Some(AnsiColor::Yellow.into()))),
        Level::Error => Some(style.fg_color(Some(AnsiColor::Red.into()))),
    }
}

fn emit(level: Level, prefix: &str, message: &str) {
    let to_stderr = matches!(level, Level::Warn | Level::Error);

    let on_terminal = if to_stderr {
        io::stderr().is_terminal()
    } else {
        io::stdout().is_terminal()
    };
    let use_color = on_terminal && std::env::var_os("NO_COLOR").is_none();

    let (open, close) = match style_for(level) {
        Some(style) if use_color => (style.render().to_string(), style.render_reset().to_string()),
        _ => (String::new(), String::new()),
    };

    let line = if prefix.is_empty() {
        format!("{message}\n")
    } else {
        format!("{open}{prefix}{close}{message}\n")
    };

    if to_stderr {
        let _ = io::stderr().write_all(line.as_bytes());
    } else {
        let _ = io::stdout().write_all(line.as_bytes());
    }
}

/// Plain progress line on stdout.
pub fn status(message: impl Display) {
    emit(Level::Plain, "", &message.to_string());
}

pub fn info(message: impl Display) {
    emit(Level::Info, "Info: ", &message.to_string());
}

pub fn warn(message: impl Display) {
    emit(Level::Warn, "Warning: ", &message.to_string());
}

pub fn error(message: impl Display) {
    emit(Level::Error, "Error: ", &message.to_string());
}
