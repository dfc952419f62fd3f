use std::{
    fs::{File, OpenOptions},
    io::Write,
    sync::Mutex,
};

use anyhow::{Context, Result};
use log::{LevelFilter, Log, Metadata, Record};

enum Sink {
    /// Records formatted before the destination is known.
    Buffered(Vec<String>),
    Stdout,
    File(File),
}

struct MountLogger {
    sink: Mutex<Sink>,
}

static LOGGER: MountLogger = MountLogger {
    sink: Mutex::new(Sink::Buffered(Vec::new())),
};

impl Log for MountLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{:<5} {}", record.level(), record.args());
        let mut sink = self.sink.lock().unwrap();
        match &mut *sink {
            Sink::Buffered(lines) => lines.push(line),
            Sink::Stdout => println!("{line}"),
            Sink::File(file) => {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(file) = &mut *self.sink.lock().unwrap() {
            let _ = file.flush();
        }
    }
}

pub fn init() {
    log::set_logger(&LOGGER).ok();
    log::set_max_level(LevelFilter::Info);
}

pub fn set_debug(debug: bool) {
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}

/// Route log output to its final destination (`-` for stdout, anything else
/// opened for append) and flush everything buffered so far.
pub fn set_file(path: &str) -> Result<()> {
    let mut new_sink = if path == "-" {
        Sink::Stdout
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {path}"))?;
        Sink::File(file)
    };

    let mut sink = LOGGER.sink.lock().unwrap();
    if let Sink::Buffered(lines) = &mut *sink {
        for line in lines.drain(..) {
            match &mut new_sink {
                Sink::Stdout => println!("{line}"),
                Sink::File(file) => {
                    let _ = writeln!(file, "{line}");
                }
                Sink::Buffered(_) => unreachable!(),
            }
        }
    }
    *sink = new_sink;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn buffered_records_flush_on_set_file() {
        init();
        set_debug(true);
        LOGGER.log(
            &Record::builder()
                .args(format_args!("early message"))
                .level(Level::Info)
                .build(),
        );

        let tmp = tempfile::NamedTempFile::new().unwrap();
        set_file(tmp.path().to_str().unwrap()).unwrap();
        LOGGER.log(
            &Record::builder()
                .args(format_args!("late message"))
                .level(Level::Warn)
                .build(),
        );
        LOGGER.flush();

        let content = std::fs::read_to_string(tmp.path()).unwrap();
        assert!(content.contains("early message"));
        assert!(content.contains("late message"));
    }
}
