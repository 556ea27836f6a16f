//! Status lines on stderr in the cargo style: a bold, colored, right-aligned tag followed by the message.

use error::Error;

use termcolor::*;

use std::fmt;
use std::io::{Result, Write};

/// Prints `tag` in `color`, then the message.
pub fn print_status(tag: &str, color: Color, message: fmt::Arguments) -> Result<()> {
    let stream = StandardStream::stderr(ColorChoice::Auto);
    let mut lock = stream.lock();
    lock.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    write!(lock, "{:>12} ", tag)?;
    lock.reset()?;
    writeln!(lock, "{}", message)
}

/// Prints a progress line with a green tag. A closed stderr is ignored.
macro_rules! progress {
    ($tag:expr, $($args:tt)*) => {
        let _ = ::ui::print_status($tag, ::termcolor::Color::Green, format_args!($($args)*));
    };
}

/// Prints an error on one line, then each cause indented below it.
pub fn print_error(error: &Error) -> Result<()> {
    let stream = StandardStream::stderr(ColorChoice::Auto);
    let mut lock = stream.lock();

    let mut chain = error.iter();
    if let Some(e) = chain.next() {
        lock.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_intense(true).set_bold(true))?;
        write!(lock, "error:")?;
        lock.reset()?;
        writeln!(lock, " {}", e)?;
    }
    for e in chain {
        lock.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
        write!(lock, "  -> ")?;
        lock.reset()?;
        writeln!(lock, "{}", e)?;
    }
    if let Some(backtrace) = error.backtrace() {
        writeln!(lock, "\n{:?}", backtrace)?;
    }
    Ok(())
}

#[test]
fn test_progress_after_partial_move() {
    struct Settings {
        descriptors: Vec<u32>,
        output: String,
    }
    let settings = Settings {
        descriptors: vec![1, 2],
        output: "out".to_owned(),
    };
    let output = settings.output;
    progress!("Testing", "{} listeners into {}", settings.descriptors.len(), output);
}
