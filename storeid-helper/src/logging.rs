//! File/stderr logging with an optional syslog fan-out, re-applied on every
//! successful config reload.
//!
//! The file/stderr half generalizes `writer.rs`'s `env_logger::Builder`
//! pattern (buffered file target, fallback to stderr on open failure)
//! to a config-driven `logfile`/`loglevel` instead of a hardcoded path and
//! `RUST_LOG`. Python's `logging` level scale (`10`=DEBUG .. `50`=CRITICAL)
//! is what the rule files actually set via `loglevel`/`sysloglevel`, so
//! those integers are mapped onto `log::LevelFilter` rather than inventing
//! a new scale.
//!
//! `log::set_boxed_logger` only succeeds once per process, but the helper
//! needs to swap targets and levels across reloads, so the installed logger
//! is a thin forwarder reading from a `RwLock<Inner>` that `init` replaces
//! each time it runs.

use std::io::{BufWriter, Write};
use std::sync::{Mutex, OnceLock, RwLock};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::ConfigSnapshot;

fn level_filter(numeric: i64) -> LevelFilter {
    match numeric {
        n if n >= 40 => LevelFilter::Error,
        n if n >= 30 => LevelFilter::Warn,
        n if n >= 20 => LevelFilter::Info,
        n if n >= 10 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

type SyslogLogger = syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>;

struct Inner {
    file_logger: env_logger::Logger,
    syslog: Option<Mutex<SyslogLogger>>,
    syslog_level: LevelFilter,
}

static CURRENT: OnceLock<RwLock<Inner>> = OnceLock::new();

struct Forwarder;

impl Log for Forwarder {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let Some(lock) = CURRENT.get() else { return false };
        let inner = lock.read().unwrap();
        inner.file_logger.enabled(metadata) || metadata.level() <= inner.syslog_level
    }

    fn log(&self, record: &Record) {
        let Some(lock) = CURRENT.get() else { return };
        let inner = lock.read().unwrap();
        if inner.file_logger.enabled(record.metadata()) {
            inner.file_logger.log(record);
        }
        if record.level() <= inner.syslog_level {
            if let Some(sl) = &inner.syslog {
                let mut logger = sl.lock().unwrap();
                let message = record.args().to_string();
                let result = match record.level() {
                    Level::Error => logger.err(message),
                    Level::Warn => logger.warning(message),
                    Level::Info => logger.info(message),
                    Level::Debug | Level::Trace => logger.debug(message),
                };
                if let Err(e) = result {
                    eprintln!("syslog write failed: {e}");
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(lock) = CURRENT.get() {
            lock.read().unwrap().file_logger.flush();
        }
    }
}

fn open_target(log_file: &str) -> Box<dyn Write + Send> {
    if log_file == "-" {
        return Box::new(std::io::stderr());
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(f) => Box::new(BufWriter::with_capacity(64 * 1024, f)),
        Err(e) => {
            eprintln!("failed to open log file '{log_file}': {e}, falling back to stderr");
            Box::new(std::io::stderr())
        }
    }
}

fn build_syslog(level: LevelFilter) -> Option<Mutex<SyslogLogger>> {
    if level == LevelFilter::Off {
        return None;
    }
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "storeid-dedup".into(),
        pid: std::process::id() as i32,
    };
    match syslog::unix(formatter) {
        Ok(logger) => Some(Mutex::new(logger)),
        Err(e) => {
            eprintln!("failed to connect to syslog: {e}");
            None
        }
    }
}

/// Install (first call) or reconfigure (subsequent calls, e.g. after a
/// reload) the process-wide logger from a snapshot's `log_level`,
/// `log_file` and `syslog_level`.
pub fn init(snapshot: &ConfigSnapshot) {
    let file_level = level_filter(snapshot.log_level);
    let syslog_level = snapshot.syslog_level.map(level_filter).unwrap_or(LevelFilter::Off);

    let mut builder = env_logger::Builder::new();
    builder
        .target(env_logger::Target::Pipe(open_target(&snapshot.log_file)))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} [{}] {}",
                buf.timestamp(),
                record.level(),
                record.module_path().unwrap_or("-"),
                record.args()
            )
        })
        .filter_level(file_level);

    let inner = Inner { file_logger: builder.build(), syslog: build_syslog(syslog_level), syslog_level };
    let max_level = file_level.max(syslog_level);

    match CURRENT.get() {
        Some(lock) => *lock.write().unwrap() = inner,
        None => {
            let _ = CURRENT.set(RwLock::new(inner));
            if log::set_boxed_logger(Box::new(Forwarder)).is_err() {
                eprintln!("logger already installed, ignoring");
            }
        }
    }
    log::set_max_level(max_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_scale_matches_python_logging_module() {
        assert_eq!(level_filter(50), LevelFilter::Error);
        assert_eq!(level_filter(40), LevelFilter::Error);
        assert_eq!(level_filter(30), LevelFilter::Warn);
        assert_eq!(level_filter(20), LevelFilter::Info);
        assert_eq!(level_filter(10), LevelFilter::Debug);
        assert_eq!(level_filter(5), LevelFilter::Trace);
    }
}
