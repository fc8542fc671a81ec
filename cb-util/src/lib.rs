// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use simplelog as sl;
use std::collections::HashMap;
use std::fs;
use std::io::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod json_file;

pub use json_file::{JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave};

pub const STARTED_SENTINEL: &str = "clusterbuster-started";
pub const FINISHED_SENTINEL: &str = "clusterbuster-finished";
pub const DFL_SENTINEL_DIR: &str = "/tmp";

/// Retries are logged individually up to this many attempts, sparsely after.
pub const RETRY_LOG_CAP: u32 = 10;

/// Wall clock in seconds since the epoch with sub-microsecond resolution.
pub fn now() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Sleep for `secs` seconds. Non-positive and non-finite values are no-ops.
pub fn sleep_secs(secs: f64) {
    if secs.is_finite() && secs > 0.0 {
        sleep(Duration::from_secs_f64(secs));
    }
}

/// Whether a retry attempt should be logged. The first `RETRY_LOG_CAP`
/// attempts are, after that only every tenth.
pub fn should_log_attempt(attempt: u32) -> bool {
    attempt <= RETRY_LOG_CAP || attempt % RETRY_LOG_CAP == 0
}

/// Human readable duration with three significant digits, e.g. "4.5m".
pub fn format_duration(dur: f64) -> String {
    let format_nsecs_helper = |nsecs: u64, unit: u64, max: u64, suffix: &str| -> Option<String> {
        if nsecs == 0 {
            Some("0".to_string())
        } else if (nsecs as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (nsecs as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (nsecs as f64 / unit as f64) < max as f64 {
            Some(format!("{:.0}{}", nsecs as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let nsecs = (dur * 1_000_000_000.0).round() as u64;

    format_nsecs_helper(nsecs, 10_u64.pow(0), 1000, "n")
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(3), 1000, "u"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(6), 1000, "m"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9), 60, "s"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60, 60, "M"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60, 24, "H"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60 * 24, 365, "D"))
        .unwrap_or_else(|| "INF".into())
}

pub fn parse_duration(input: &str) -> Result<f64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, f64> = [
            ('n', 0.000_000_001),
            ('u', 0.000_001),
            ('m', 0.001),
            ('s', 1.0),
            ('M', 60.0),
            ('H', 3600.0),
            ('D', 3600.0 * 24.0),
        ]
            .iter()
            .cloned()
            .collect();
    }

    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += num
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("invalid duration {:?}", input))?
                    * UNITS[&ch];
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += num
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid duration {:?}", input))?;
    }
    if sum < 0.0 {
        bail!("duration {:?} is negative", input);
    }
    Ok(sum)
}

/// Create or update the mtime of `dir/name`.
pub fn touch_sentinel<P: AsRef<Path>>(dir: P, name: &str) -> Result<PathBuf> {
    let path = dir.as_ref().join(name);
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&path)
        .with_context(|| format!("failed to touch {:?}", &path))?;
    debug!("sentinel: touched {:?}", &path);
    Ok(path)
}

/// Block until `path` appears, checking every `interval` seconds.
pub fn wait_for_file<P: AsRef<Path>>(path: P, interval: f64) {
    let path = path.as_ref();
    let mut attempt = 0;
    while !path.exists() {
        attempt += 1;
        if should_log_attempt(attempt) {
            info!("Waiting for {:?} to appear (attempt {})", path, attempt);
        }
        sleep_secs(interval);
    }
}

/// Block until `path` is removed by someone else, checking every `interval`
/// seconds.
pub fn wait_for_removal<P: AsRef<Path>>(path: P, interval: f64) {
    let path = path.as_ref();
    let mut attempt = 0;
    loop {
        match fs::symlink_metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => warn!("Failed to stat {:?} ({})", path, &e),
            Ok(_) => {}
        }
        attempt += 1;
        if attempt == 1 {
            info!("Waiting for {:?} to be removed", path);
        }
        sleep_secs(interval);
    }
    debug!("{:?} removed", path);
}

/// Write `contents` to `tmp_path` and hard-link it into place at `path`. A
/// reader polling for `path` never observes a partial write.
pub fn write_and_link<P: AsRef<Path>, Q: AsRef<Path>>(
    tmp_path: P,
    path: Q,
    contents: &str,
) -> Result<()> {
    let (tmp_path, path) = (tmp_path.as_ref(), path.as_ref());
    let _ = fs::remove_file(tmp_path);
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)
        .with_context(|| format!("failed to create {:?}", tmp_path))?;
    f.write_all(contents.as_bytes())?;
    f.sync_all()?;
    drop(f);
    fs::hard_link(tmp_path, path)
        .with_context(|| format!("failed to link {:?} to {:?}", tmp_path, path))?;
    fs::remove_file(tmp_path)?;
    Ok(())
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            if let Err(e) = sl::SimpleLogger::init(sl_level, lcfg.build()) {
                eprintln!("Failed to initialize logging ({})", &e);
            }
        }
    }
}

/// Exit status of a child as reported to a shell: the exit code, or 128 plus
/// the signal number.
pub fn shell_status(code: Option<i32>, signal: Option<i32>) -> i32 {
    match (code, signal) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_format_duration() {
        for pair in &[
            (0.000003932, "3.9u"),
            (0.00448, "4.5m"),
            (0.3, "300m"),
            (2042.0, "34.0M"),
            (3456000.0, "40.0D"),
        ] {
            let result = super::format_duration(pair.0);
            assert_eq!(&result, pair.1);
            println!("{} -> {} ({})", pair.0, &result, pair.1);
        }
    }

    #[test]
    fn test_parse_duration() {
        for pair in &[
            (0.0000039, "3.9u"),
            (0.0044, "4.4m"),
            (0.3, "300m"),
            (2040.0, "34.0M"),
            (3456000.0, "40.0D"),
            (1.27, "1.27"),
            (1.37, "100m1.27"),
            (61.5, "1M_1.5s"),
        ] {
            let result = super::parse_duration(pair.1).unwrap();
            assert!((pair.0 - result).abs() < 1e-9);
            println!("{} -> {} ({})", pair.1, result, pair.0);
        }
        assert!(super::parse_duration("xyz").is_err());
        assert!(super::parse_duration("-1").is_err());
    }

    #[test]
    fn test_retry_log_cap() {
        let logged: Vec<u32> = (1..=40).filter(|a| super::should_log_attempt(*a)).collect();
        assert_eq!(logged, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30, 40]);
    }

    #[test]
    fn test_write_and_link() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("error-tmp");
        let path = dir.path().join("error");

        super::write_and_link(&tmp, &path, "disk full").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "disk full");
        assert!(!tmp.exists());

        // A second failure must not clobber the first.
        assert!(super::write_and_link(&tmp, &path, "again").is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "disk full");
    }

    #[test]
    fn test_wait_for_removal() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff");
        fs::write(&path, "x").unwrap();

        let remover = {
            let path = path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                fs::remove_file(&path).unwrap();
            })
        };
        super::wait_for_removal(&path, 0.01);
        assert!(!path.exists());
        remover.join().unwrap();
    }

    #[test]
    fn test_shell_status() {
        assert_eq!(super::shell_status(Some(3), None), 3);
        assert_eq!(super::shell_status(None, Some(9)), 137);
    }
}
