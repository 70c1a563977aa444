// SPDX-License-Identifier: GPL-2.0
//
// scx_flatcg — system-wide CPU utilization from /proc/stat

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;

pub const PROC_STAT: &str = "/proc/stat";

/// The aggregate "cpu" line is the first one. Field 0 is the label and
/// field 4 is idle time.
const IDLE_FIELD: usize = 4;

fn read_first_line(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .with_context(|| format!("Failed to read {:?}", path))?;
    if line.is_empty() {
        bail!("{:?} is empty", path);
    }
    Ok(line)
}

/// Sum of all time buckets and the idle bucket. Unparsable fields are
/// skipped.
fn parse_cpu_line(line: &str) -> (u64, u64) {
    let mut sum = 0u64;
    let mut idle = 0u64;

    for (idx, tok) in line.split_whitespace().enumerate().skip(1) {
        match tok.parse::<u64>() {
            Ok(v) => {
                sum = sum.wrapping_add(v);
                if idx == IDLE_FIELD {
                    idle = v;
                }
            }
            Err(_) => warn!("failed to parse {}th field of {} ({:?})", idx, PROC_STAT, tok),
        }
    }

    (sum, idle)
}

/// Last seen cumulative (total, idle) jiffies.
#[derive(Debug)]
pub struct CpuUtil {
    path: PathBuf,
    total: u64,
    idle: u64,
}

impl CpuUtil {
    pub fn new() -> Self {
        Self::with_path(PROC_STAT)
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            total: 0,
            idle: 0,
        }
    }

    /// Busy fraction since the previous call, in [0, 1]. Returns 0.0 if the
    /// source can't be read.
    pub fn sample(&mut self) -> f64 {
        match read_first_line(&self.path) {
            Ok(line) => self.update(&line),
            Err(e) => {
                warn!("{:#}", e);
                0.0
            }
        }
    }

    pub fn update(&mut self, line: &str) -> f64 {
        let (total, idle) = parse_cpu_line(line);
        let delta_total = total.wrapping_sub(self.total);
        let delta_idle = idle.wrapping_sub(self.idle);
        self.total = total;
        self.idle = idle;

        if delta_total == 0 {
            return 0.0;
        }
        (delta_total.saturating_sub(delta_idle) as f64 / delta_total as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // total=1000 idle=200, then total=1500 idle=250
    const FIRST: &str = "cpu  600 0 200 200 0 0 0 0 0 0\n";
    const SECOND: &str = "cpu  1000 0 250 250 0 0 0 0 0 0\n";

    #[test]
    fn test_parse_cpu_line() {
        assert_eq!(parse_cpu_line(FIRST), (1000, 200));
        assert_eq!(parse_cpu_line("cpu 1 2 3 4 5 6 7"), (28, 4));
    }

    #[test]
    fn test_parse_skips_bad_fields() {
        assert_eq!(parse_cpu_line("cpu 10 x 30 40 -5"), (80, 40));
        assert_eq!(parse_cpu_line(""), (0, 0));
    }

    #[test]
    fn test_util_between_samples() {
        let mut util = CpuUtil::with_path("/nonexistent");
        assert!((util.update(FIRST) - 0.8).abs() < 1e-9);
        assert!((util.update(SECOND) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_identical_samples_read_zero() {
        let mut util = CpuUtil::with_path("/nonexistent");
        util.update(SECOND);
        assert_eq!(util.update(SECOND), 0.0);
    }

    #[test]
    fn test_idle_running_ahead_clamps_to_zero() {
        let mut util = CpuUtil::with_path("/nonexistent");
        util.update("cpu 100 0 0 0");
        // Idle grew more than the total.
        assert_eq!(util.update("cpu 50 0 0 100"), 0.0);
    }

    #[test]
    fn test_sample_reads_first_line_of_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}cpu0 1 1 1 1\nintr 12345\n", FIRST).unwrap();
        file.flush().unwrap();

        let mut util = CpuUtil::with_path(file.path());
        assert!((util.sample() - 0.8).abs() < 1e-9);

        std::fs::write(file.path(), SECOND).unwrap();
        assert!((util.sample() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_unreadable_source_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut util = CpuUtil::with_path(dir.path().join("stat"));
        assert_eq!(util.sample(), 0.0);
        assert_eq!(util.sample(), 0.0);
    }
}
