use std::fs;
use std::path::{Path, PathBuf};

/// Installs the global logger: every record goes to stdout and to a fresh
/// `<app_name>_<timestamp>.log` file in `log_dir`.
///
/// Older log files of the same application are removed first, keeping only
/// the most recent one. Can only succeed once per process.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<PathBuf, fern::InitError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep the previous run's file, drop everything older.
    cleanup_old_logs(log_dir, app_name)?;

    let log_file_name = format!(
        "{}_{}.log",
        app_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

/// Unknown names fall back to `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Deletes all but the newest `<app_name>_*.log` file in `log_dir`.
///
/// File names carry a sortable timestamp, so the newest file is the one with
/// the greatest name. Returns the number of files removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> std::io::Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut logs: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix))
        })
        .collect();

    // Newest first.
    logs.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for path in logs.iter().skip(1) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
