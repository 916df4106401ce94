use crate::env::env_value;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "ADT_LOG_LEVEL";

/// Installs the global subscriber. Output goes to stdout and, when `log_dir`
/// is set, is also appended to `<log_dir>/<file_stem>.log`.
///
/// `RUST_LOG` wins over everything; otherwise `--debug`, then `ADT_LOG_LEVEL`,
/// then `info`. Returns the log file path when file output is active.
pub fn init_logging(file_stem: &str, debug: bool, log_dir: &str) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug, env_value(LOG_LEVEL_ENV))));
    let (writer, log_path) = match open_log_file(log_dir, file_stem) {
        Ok(Some((file, path))) => (
            BoxMakeWriter::new(io::stdout.and(Mutex::new(file))),
            Some(path),
        ),
        Ok(None) => (BoxMakeWriter::new(io::stdout), None),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            (BoxMakeWriter::new(io::stdout), None)
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .ok()?;
    log_path
}

fn default_directive(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level.unwrap_or_else(|| "info".to_string())
}

fn open_log_file(log_dir: &str, file_stem: &str) -> io::Result<Option<(File, PathBuf)>> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(log_dir)?;
    let path = PathBuf::from(log_dir).join(format!("{file_stem}.log"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((file, path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn debug_flag_beats_configured_level() {
        assert_eq!(default_directive(true, Some("warn".to_string())), "debug");
        assert_eq!(default_directive(false, Some("warn".to_string())), "warn");
        assert_eq!(default_directive(false, None), "info");
    }

    #[test]
    fn log_file_is_named_after_the_process_and_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("nested/logs");
        let log_dir = log_dir.to_str().expect("utf-8 path");

        let (mut file, path) = open_log_file(log_dir, "adt-agent")
            .expect("open")
            .expect("file output");
        assert!(path.ends_with("nested/logs/adt-agent.log"));
        file.write_all(b"first\n").expect("write");
        drop(file);

        let (mut file, _) = open_log_file(log_dir, "adt-agent")
            .expect("reopen")
            .expect("file output");
        file.write_all(b"second\n").expect("write");
        drop(file);
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "first\nsecond\n"
        );
    }

    #[test]
    fn blank_log_dir_disables_file_output() {
        assert!(open_log_file("  ", "adt-server").expect("open").is_none());
    }
}
