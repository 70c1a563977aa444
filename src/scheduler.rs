// SPDX-License-Identifier: GPL-2.0
//
// scx_flatcg — monitoring loop

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use crate::cpu_util::CpuUtil;
use crate::policy::{Policy, PolicyBackend, PolicyConfig, PolicyExit};
use crate::stats::{read_stats, Report, Stats};
use crate::SCHEDULER_NAME;

pub struct Scheduler<B: PolicyBackend> {
    policy: Policy<B>,
    cpu_util: CpuUtil,
    interval: Duration,
    prev_stats: Stats,
    seq: u64,
}

impl<B: PolicyBackend> Scheduler<B> {
    /// Open, configure, load and attach the policy. On error, whatever was
    /// set up is torn down when the policy is dropped.
    pub fn init(
        backend: B,
        config: PolicyConfig,
        interval: Duration,
        cpu_util: CpuUtil,
    ) -> Result<Self> {
        let mut policy = Policy::new(backend);

        policy.open()?;
        let config = policy.configure(config)?;
        info!(
            "slice={:.1}ms intv={:.1}s fifo={} partial={} nr_cpus={}",
            config.slice_ns as f64 / 1_000_000.0,
            interval.as_secs_f64(),
            config.fifo_sched,
            config.switch_partial,
            config.nr_cpus
        );

        policy.load()?;
        policy.attach()?;

        info!("{} running", SCHEDULER_NAME);

        Ok(Self {
            policy,
            cpu_util,
            interval,
            prev_stats: Stats::default(),
            seq: 0,
        })
    }

    pub fn exited(&mut self) -> bool {
        self.policy.exited()
    }

    fn report<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let cpu_util = self.cpu_util.sample();

        let nr_cpus = self.policy.nr_cpus() as usize;
        let stats = read_stats(nr_cpus, |idx| self.policy.read_stat(idx));
        for idx in stats.resets(&self.prev_stats) {
            warn!(
                "{} counter went backwards ({} -> {}), was the policy reloaded?",
                idx.name(),
                self.prev_stats[idx],
                stats[idx]
            );
        }
        let delta = stats.delta(&self.prev_stats);

        Report {
            seq: self.seq,
            cpu_util,
            hweight_gen: self.policy.hweight_gen(),
            delta: &delta,
            total: &stats,
        }
        .format(out)?;

        self.prev_stats = stats;
        self.seq += 1;
        Ok(())
    }

    /// Report once per interval until `shutdown` is set or the policy exits
    /// on its own, then tear the policy down.
    pub fn run<W: Write>(mut self, shutdown: Arc<AtomicBool>, out: &mut W) -> Result<PolicyExit> {
        while !shutdown.load(Ordering::Relaxed) && !self.exited() {
            self.report(out)?;
            std::thread::sleep(self.interval);
        }

        self.policy.teardown()
    }
}

/// Run `lifecycle` (init through teardown) again for as long as the policy
/// asks to be restarted. A shutdown request never restarts.
pub fn run_restarting<F>(shutdown: &AtomicBool, mut lifecycle: F) -> Result<()>
where
    F: FnMut() -> Result<PolicyExit>,
{
    loop {
        let exit = lifecycle()?;
        if shutdown.load(Ordering::Relaxed) || !exit.should_restart() {
            return Ok(());
        }
        info!("{} requested a restart", SCHEDULER_NAME);
    }
}
