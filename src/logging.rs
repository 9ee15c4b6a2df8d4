/* This is part of smartblock-agent - which is under the MIT License **********/

use log::{Record, Level, Metadata, LevelFilter};
use snafu::{OptionExt};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use crate::error::Result;
use crate::error;
use std::io::Write;

struct Logger;

static LOGGER: Logger = Logger;

/// Label, color and destination of a log level. Warnings and errors go to
/// stderr so that the desktop shell can tell them apart.
fn style(level: Level) -> (&'static str, Color, bool) {
    match level {
        Level::Error => ("error", Color::Red, true),
        Level::Warn => ("warning", Color::Yellow, true),
        Level::Info => ("info", Color::Green, false),
        Level::Debug => ("debug", Color::Blue, false),
        Level::Trace => ("trace", Color::White, false),
    }
}

/// Print one record as "<level>: <message>", the level colored when the
/// stream is a terminal.
fn emit(stream: &mut StandardStream, colored: bool, level: Level, color: Color,
        record: &Record) -> std::io::Result<()> {
    if colored {
        stream.set_color(ColorSpec::new()
            .set_fg(Some(color))
            .set_intense(true)
            .set_bold(true))?;
    }
    write!(stream, "{}", label(level))?;
    if colored {
        stream.reset()?;
    }
    writeln!(stream, ": {}", record.args())
}

fn label(level: Level) -> &'static str {
    style(level).0
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if ! self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        let (_, color, to_stderr) = style(level);
        let (mut stream, colored) = if to_stderr {
            (StandardStream::stderr(ColorChoice::Auto), atty::is(atty::Stream::Stderr))
        } else {
            (StandardStream::stdout(ColorChoice::Auto), atty::is(atty::Stream::Stdout))
        };

        if emit(&mut stream, colored, level, color, record).is_err() {
            // Terminal attributes or the stream itself failed: plain text
            eprintln!("{}: {}", label(level), record.args());
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }
}

pub fn init(max_level: LevelFilter) -> Result<()> {
    log::set_logger(&LOGGER).map(|()| {
        log::set_max_level(max_level)
    }).ok().context(error::LogInitFailed{})
}
