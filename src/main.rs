mod alarm_clock;
mod cli;
mod config;
mod database;
mod error;
mod notifications;
mod reminder_service;
mod scheduler;
mod schema;
mod tasks;
#[cfg(test)]
mod test_utils;
mod utils;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{debug, error};

fn main() {
    let project_dirs = match ProjectDirs::from("", "", "quicktodo") {
        Some(dirs) => dirs,
        None => {
            eprintln!("Could not determine project directories");
            std::process::exit(1);
        }
    };

    let config = Config::load_config(&project_dirs);
    let log_level = config.logging.quicktodo.clone();
    if CONFIG.set(config).is_err() {
        eprintln!("Configuration was already initialized");
    }

    // Held for the life of the process; dropping it stops file logging
    let _logger = setup_logging(&project_dirs, &log_level);
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    if let Err(err) = Cli::handle_command_line(&project_dirs) {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn setup_logging(project_dirs: &ProjectDirs, level: &str) -> Option<LoggerHandle> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    let spec = format!("warn, quicktodo={}", level);

    let result = Logger::try_with_str(&spec).and_then(|logger| {
        logger
            .log_to_file(FileSpec::default().directory(&log_dir).basename("quicktodo"))
            .duplicate_to_stderr(Duplicate::Warn)
            .rotate(
                Criterion::Size(10_000_000),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(5),
            )
            .start()
    });

    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to start logging in {}: {}", log_dir.display(), e);
            None
        }
    }
}
