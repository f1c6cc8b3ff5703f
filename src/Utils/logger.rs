use crate::Utils::settings::EvaluationSettings;
use chrono::Local;
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Log file name stamped with the current date and time
pub fn timestamped_log_name(prefix: &str) -> String {
    let date_and_time = Local::now().format("%Y-%m-%d_%H-%M-%S");
    format!("{}_{}.txt", prefix, date_and_time)
}

fn build_loggers(
    level: LevelFilter,
    log_to_console: bool,
    log_file: Option<&Path>,
) -> Vec<Box<dyn SharedLogger>> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    // Console logger
    if log_to_console {
        loggers.push(TermLogger::new(
            level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    // File logger
    if let Some(path) = log_file {
        match File::create(path) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(e) => eprintln!("cannot create log file {}: {}", path.display(), e),
        }
    }
    loggers
}

/// Terminal logger plus an optional file logger. Returns false if a logger was already
/// installed (or nothing could be installed); that is not an error.
pub fn init_logger(level: LevelFilter, log_to_console: bool, log_file: Option<&Path>) -> bool {
    let loggers = build_loggers(level, log_to_console, log_file);
    if loggers.is_empty() {
        return false;
    }
    CombinedLogger::init(loggers).is_ok()
}

/// Terminal (and optional file) logger at the level of the evaluation settings
pub fn init_logger_from_settings(settings: &EvaluationSettings, log_file: Option<&Path>) -> bool {
    init_logger(settings.log_level, true, log_file)
}

/// `init_logger` writing to a time-stamped file in `directory` as well as the terminal
pub fn init_logger_with_file(level: LevelFilter, directory: &Path) -> Option<PathBuf> {
    let path = directory.join(timestamped_log_name("fields_log"));
    init_logger(level, true, Some(&path)).then_some(path)
}
