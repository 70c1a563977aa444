// SPDX-License-Identifier: GPL-2.0
//
// scx_flatcg — flattened cgroup hierarchy sched_ext scheduler
//
// The BPF side flattens the cgroup hierarchy into a single level by
// compounding weights down the tree. This process configures and attaches it,
// then reports CPU utilization and the BPF counters every interval until it
// is interrupted or the BPF side exits.

#[cfg(feature = "bpf")]
mod bpf_skel;
#[cfg(feature = "bpf")]
pub use bpf_skel::*;
#[cfg(feature = "bpf")]
pub mod bpf_intf;
#[cfg(feature = "bpf")]
mod bpf;

// Only the BPF backend drives these outside of tests.
#[cfg_attr(not(feature = "bpf"), allow(dead_code))]
mod cpu_util;
#[cfg_attr(not(feature = "bpf"), allow(dead_code))]
mod policy;
#[cfg_attr(not(feature = "bpf"), allow(dead_code))]
mod scheduler;
#[cfg_attr(not(feature = "bpf"), allow(dead_code))]
mod stats;

#[cfg(test)]
mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
#[cfg(feature = "bpf")]
use scx_utils::libbpf_clap_opts::LibbpfOpts;

use policy::PolicyConfig;

const SCHEDULER_NAME: &str = "scx_flatcg";

fn parse_non_negative(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if !v.is_finite() || v < 0.0 {
        return Err(format!("{} is not a non-negative number", s));
    }
    Ok(v)
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let secs = parse_non_negative(s)?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{} seconds: {}", s, e))
}

/// scx_flatcg command-line options.
#[derive(Debug, Parser)]
#[command(
    name = SCHEDULER_NAME,
    about = "A flattened cgroup hierarchy sched_ext scheduler",
    long_about = "
scx_flatcg: a flattened cgroup hierarchy sched_ext scheduler

Each cgroup's hierarchical weight is compounded down the tree so that all
cgroups are scheduled as if they were on a single level. Per-interval
counters from the BPF side are printed until interrupted.
"
)]
struct Opts {
    /// Slice duration in microseconds (fractional allowed).
    #[clap(short = 's', long, default_value = "20000", value_parser = parse_non_negative)]
    slice_us: f64,

    /// Report interval in seconds (fractional allowed).
    #[clap(short = 'i', long, default_value = "2.0", value_parser = parse_interval)]
    interval: Duration,

    /// Use FIFO scheduling instead of weighted vtime scheduling.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    fifo_sched: bool,

    /// Switch only tasks on SCHED_EXT policy instead of all.
    #[clap(short = 'p', long, action = clap::ArgAction::SetTrue)]
    partial: bool,

    /// Verbose logging, including libbpf output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,

    #[cfg(feature = "bpf")]
    #[clap(flatten, next_help_heading = "Libbpf Options")]
    pub libbpf: LibbpfOpts,
}

impl Opts {
    fn policy_config(&self) -> PolicyConfig {
        PolicyConfig::new(
            (self.slice_us * 1000.0) as u64,
            self.fifo_sched,
            self.partial,
        )
    }
}

/// Help goes to stdout with status 0, usage errors to stderr with status 1.
fn parse_opts() -> Opts {
    match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let loglevel = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    if lcfg.set_time_offset_to_local().is_err() {
        eprintln!("{}: failed to set local time offset", SCHEDULER_NAME);
    }
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

#[cfg(feature = "bpf")]
fn run(opts: &Opts, shutdown: Arc<AtomicBool>) -> Result<()> {
    use std::mem::MaybeUninit;

    use bpf::BpfPolicy;
    use cpu_util::CpuUtil;
    use scheduler::{run_restarting, Scheduler};

    let mut open_object = MaybeUninit::uninit();
    run_restarting(&shutdown, || {
        let backend = BpfPolicy::new(&mut open_object, opts.libbpf.clone(), opts.verbose);
        let sched = Scheduler::init(backend, opts.policy_config(), opts.interval, CpuUtil::new())?;
        sched.run(shutdown.clone(), &mut std::io::stdout().lock())
    })
}

#[cfg(not(feature = "bpf"))]
fn run(opts: &Opts, _shutdown: Arc<AtomicBool>) -> Result<()> {
    log::debug!(
        "requested {:?} reporting every {:?}",
        opts.policy_config(),
        opts.interval
    );
    anyhow::bail!(
        "{} was built without BPF support, rebuild with `--features bpf`",
        SCHEDULER_NAME
    )
}

fn main() -> Result<()> {
    let opts = parse_opts();

    if opts.version {
        println!("{} {}", SCHEDULER_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging(opts.verbose)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    run(&opts, shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Opts::try_parse_from([SCHEDULER_NAME]).unwrap();
        assert_eq!(opts.interval, Duration::from_secs(2));
        assert_eq!(opts.policy_config(), PolicyConfig::default());
    }

    #[test]
    fn test_fractional_slice_converts_to_ns() {
        let opts = Opts::try_parse_from([SCHEDULER_NAME, "-s", "2.5", "-i", "0.5", "-f", "-p"])
            .unwrap();
        let config = opts.policy_config();
        assert_eq!(config.slice_ns, 2_500);
        assert!(config.fifo_sched);
        assert!(config.switch_partial);
        assert_eq!(opts.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Opts::try_parse_from([SCHEDULER_NAME, "-i", "-1"]).is_err());
        assert!(Opts::try_parse_from([SCHEDULER_NAME, "-s", "abc"]).is_err());
        assert!(Opts::try_parse_from([SCHEDULER_NAME, "-i", "inf"]).is_err());
        // Finite but too large for a Duration.
        assert!(Opts::try_parse_from([SCHEDULER_NAME, "-i", "1e20"]).is_err());
        assert!(Opts::try_parse_from([SCHEDULER_NAME, "--interval", "1e20"]).is_err());
        assert!(Opts::try_parse_from([SCHEDULER_NAME, "--bogus"]).is_err());
    }

    #[test]
    fn test_help_is_not_an_error_stream() {
        let err = Opts::try_parse_from([SCHEDULER_NAME, "-h"]).unwrap_err();
        assert!(!err.use_stderr());
        let err = Opts::try_parse_from([SCHEDULER_NAME, "-x"]).unwrap_err();
        assert!(err.use_stderr());
    }
}
