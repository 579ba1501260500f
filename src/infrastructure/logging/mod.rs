//! Logging setup using `log` + `log4rs`.
//!
//! External crates stay silent unless opted in: only the chorus logger is
//! wired at the requested level by default. A filter expression such as
//! `"debug"`, `"chorus_core=trace"` or `"root=warn"` adjusts the crate
//! level, individual modules, and the fallback for everything else.

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::threshold::ThresholdFilter;
use std::path::PathBuf;

const CONSOLE_APPENDER: &str = "stderr";
const LOG_FILE_APPENDER: &str = "log_file";
const ERR_LOG_FILE_APPENDER: &str = "err_log_file";

const LOG_FILE_NAME: &str = "chorus.log";
const ERR_LOG_FILE_NAME: &str = "chorus_err.log";
const LOG_LINE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {m}{n}";

const CRATE_LOGGER: &str = "chorus_core";

/// Parsed form of a filter expression.
#[derive(Debug, PartialEq, Eq)]
struct FilterSpec {
    crate_level: LevelFilter,
    fallback: LevelFilter,
    modules: Vec<(String, LevelFilter)>,
}

fn parse_filters(expression: &str) -> FilterSpec {
    let mut spec = FilterSpec { crate_level: LevelFilter::Info, fallback: LevelFilter::Off, modules: Vec::new() };
    for entry in expression.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        match entry.split_once('=') {
            None => {
                if let Ok(level) = entry.parse() {
                    spec.crate_level = level;
                }
            }
            Some((module, level)) => {
                let module = module.trim();
                let Ok(level) = level.trim().parse() else {
                    continue;
                };
                match module {
                    "" => {}
                    "root" => spec.fallback = level,
                    _ => spec.modules.push((module.to_string(), level)),
                }
            }
        }
    }
    spec
}

fn encoder() -> Box<PatternEncoder> {
    Box::new(PatternEncoder::new(LOG_LINE_PATTERN))
}

/// Initialize the global logger. Repeated calls are ignored.
///
/// With a `log_dir`, output also goes to `chorus.log` plus a
/// warn-and-above `chorus_err.log`; otherwise console only.
pub fn init_logger(log_dir: Option<&str>, filters: &str) {
    let spec = parse_filters(filters);

    let console = ConsoleAppender::builder().target(Target::Stderr).encoder(encoder()).build();
    let mut builder = Config::builder().appender(Appender::builder().build(CONSOLE_APPENDER, Box::new(console)));
    let mut sinks = vec![CONSOLE_APPENDER.to_string()];

    if let Some(dir) = log_dir.map(str::trim).filter(|dir| !dir.is_empty()) {
        let dir = PathBuf::from(dir);
        if let Ok(appender) = FileAppender::builder().encoder(encoder()).build(dir.join(LOG_FILE_NAME)) {
            builder = builder.appender(Appender::builder().build(LOG_FILE_APPENDER, Box::new(appender)));
            sinks.push(LOG_FILE_APPENDER.to_string());
        }
        if let Ok(appender) = FileAppender::builder().encoder(encoder()).build(dir.join(ERR_LOG_FILE_NAME)) {
            builder = builder.appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(LevelFilter::Warn)))
                    .build(ERR_LOG_FILE_APPENDER, Box::new(appender)),
            );
            sinks.push(ERR_LOG_FILE_APPENDER.to_string());
        }
    }

    // Explicit module entries win over the implicit crate logger.
    let mut loggers = spec.modules;
    if !loggers.iter().any(|(module, _)| module == CRATE_LOGGER) {
        loggers.push((CRATE_LOGGER.to_string(), spec.crate_level));
    }
    for (module, level) in loggers {
        builder = builder.logger(Logger::builder().appenders(sinks.clone()).additive(false).build(module, level));
    }

    let root = Root::builder().appenders(sinks).build(spec.fallback);
    if let Ok(config) = builder.build(root) {
        let _ = log4rs::init_config(config);
    }
}
