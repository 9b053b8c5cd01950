use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::Local;
use env_logger::{Builder, Env, Target};
use log::LevelFilter;

/// Writes every log line to stderr and appends it to the log file.
struct Tee {
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            // A broken log file must not take console logging down with it.
            if file.write_all(buf).is_err() {
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global logger. `RUST_LOG` overrides the default Info level.
pub fn init(log_file: Option<&Path>) {
    let file = match log_file.map(open_log_file) {
        Some(Ok(f)) => Some(f),
        Some(Err(e)) => {
            eprintln!("Could not open log file: {}. Logging to console only.", e);
            None
        }
        None => None,
    };

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_module("html5ever", LevelFilter::Warn)
        .filter_module("selectors", LevelFilter::Warn)
        .target(Target::Pipe(Box::new(Tee { file })));

    if builder.try_init().is_err() {
        return;
    }

    match log_file {
        Some(path) => log::info!("Logger initialized, writing to {:?}", path),
        None => log::info!("Logger initialized."),
    }
}
