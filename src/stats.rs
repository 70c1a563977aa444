// SPDX-License-Identifier: GPL-2.0
//
// scx_flatcg — counter aggregation and the per-interval report

use std::io::Write;
use std::ops::Index;

use anyhow::Result;
use log::warn;

/// Counters kept by the BPF side, in per-CPU array map order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatIdx {
    Act = 0,
    Deact,
    Local,
    Global,
    HwtUpdates,
    HwtCache,
    HwtSkip,
    HwtRace,
    EnqSkip,
    EnqRace,
    CnsKeep,
    CnsExpire,
    CnsEmpty,
    CnsGone,
    PncNoCgrp,
    PncNext,
    PncEmpty,
    PncGone,
    BadRemoval,
}

pub const NR_STATS: usize = 19;

impl StatIdx {
    pub const ALL: [StatIdx; NR_STATS] = [
        StatIdx::Act,
        StatIdx::Deact,
        StatIdx::Local,
        StatIdx::Global,
        StatIdx::HwtUpdates,
        StatIdx::HwtCache,
        StatIdx::HwtSkip,
        StatIdx::HwtRace,
        StatIdx::EnqSkip,
        StatIdx::EnqRace,
        StatIdx::CnsKeep,
        StatIdx::CnsExpire,
        StatIdx::CnsEmpty,
        StatIdx::CnsGone,
        StatIdx::PncNoCgrp,
        StatIdx::PncNext,
        StatIdx::PncEmpty,
        StatIdx::PncGone,
        StatIdx::BadRemoval,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StatIdx::Act => "act",
            StatIdx::Deact => "deact",
            StatIdx::Local => "local",
            StatIdx::Global => "global",
            StatIdx::HwtUpdates => "hwt_updates",
            StatIdx::HwtCache => "hwt_cache",
            StatIdx::HwtSkip => "hwt_skip",
            StatIdx::HwtRace => "hwt_race",
            StatIdx::EnqSkip => "enq_skip",
            StatIdx::EnqRace => "enq_race",
            StatIdx::CnsKeep => "cns_keep",
            StatIdx::CnsExpire => "cns_expire",
            StatIdx::CnsEmpty => "cns_empty",
            StatIdx::CnsGone => "cns_gone",
            StatIdx::PncNoCgrp => "pnc_nocgrp",
            StatIdx::PncNext => "pnc_next",
            StatIdx::PncEmpty => "pnc_empty",
            StatIdx::PncGone => "pnc_gone",
            StatIdx::BadRemoval => "bad_removal",
        }
    }
}

/// One value per counter, summed over all CPUs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats([u64; NR_STATS]);

impl Stats {
    #[cfg(test)]
    pub fn with(mut self, idx: StatIdx, val: u64) -> Self {
        self.0[idx as usize] = val;
        self
    }

    /// Per-interval change. Wraps instead of failing when a counter went
    /// backwards, e.g. after the BPF program was reloaded.
    pub fn delta(&self, prev: &Self) -> Self {
        let mut out = [0u64; NR_STATS];
        for (i, d) in out.iter_mut().enumerate() {
            *d = self.0[i].wrapping_sub(prev.0[i]);
        }
        Self(out)
    }

    /// Counters which went backwards since `prev`.
    pub fn resets<'a>(&'a self, prev: &'a Self) -> impl Iterator<Item = StatIdx> + 'a {
        StatIdx::ALL
            .into_iter()
            .filter(move |&idx| self[idx] < prev[idx])
    }
}

impl Index<StatIdx> for Stats {
    type Output = u64;

    fn index(&self, idx: StatIdx) -> &u64 {
        &self.0[idx as usize]
    }
}

/// Read every counter through `lookup` and sum the first `nr_cpus` slots.
/// A counter whose lookup fails reads as zero.
pub fn read_stats<F>(nr_cpus: usize, mut lookup: F) -> Stats
where
    F: FnMut(StatIdx) -> Result<Vec<u64>>,
{
    let mut stats = Stats::default();

    for idx in StatIdx::ALL {
        match lookup(idx) {
            Ok(cnts) => {
                stats.0[idx as usize] = cnts
                    .iter()
                    .take(nr_cpus)
                    .fold(0u64, |acc, v| acc.wrapping_add(*v));
            }
            Err(e) => warn!("failed to read {} counter: {:#}", idx.name(), e),
        }
    }

    stats
}

pub struct Report<'a> {
    pub seq: u64,
    pub cpu_util: f64,
    pub hweight_gen: u64,
    pub delta: &'a Stats,
    pub total: &'a Stats,
}

impl Report<'_> {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let s = self.delta;

        writeln!(w)?;
        writeln!(
            w,
            "[SEQ {:6} cpu={:5.1} hweight_gen={}]",
            self.seq,
            self.cpu_util * 100.0,
            self.hweight_gen
        )?;
        writeln!(
            w,
            "       act:{:6}  deact:{:6} local:{:6} global:{:6}",
            s[StatIdx::Act],
            s[StatIdx::Deact],
            s[StatIdx::Local],
            s[StatIdx::Global]
        )?;
        writeln!(
            w,
            "HWT   skip:{:6}   race:{:6} cache:{:6} update:{:6}",
            s[StatIdx::HwtSkip],
            s[StatIdx::HwtRace],
            s[StatIdx::HwtCache],
            s[StatIdx::HwtUpdates]
        )?;
        writeln!(
            w,
            "ENQ   skip:{:6}   race:{:6}",
            s[StatIdx::EnqSkip],
            s[StatIdx::EnqRace]
        )?;
        writeln!(
            w,
            "CNS   keep:{:6} expire:{:6} empty:{:6}   gone:{:6}",
            s[StatIdx::CnsKeep],
            s[StatIdx::CnsExpire],
            s[StatIdx::CnsEmpty],
            s[StatIdx::CnsGone]
        )?;
        writeln!(
            w,
            "PNC nocgrp:{:6}   next:{:6} empty:{:6}   gone:{:6}",
            s[StatIdx::PncNoCgrp],
            s[StatIdx::PncNext],
            s[StatIdx::PncEmpty],
            s[StatIdx::PncGone]
        )?;
        // Absolute count, not a delta.
        writeln!(w, "BAD remove:{:6}", self.total[StatIdx::BadRemoval])?;
        w.flush()?;
        Ok(())
    }
}
