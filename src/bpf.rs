// SPDX-License-Identifier: GPL-2.0
//
// scx_flatcg — libbpf skeleton backend

use std::mem::MaybeUninit;

use anyhow::{anyhow, Context, Result};
use libbpf_rs::{MapCore, MapFlags, OpenObject};
use log::debug;
use scx_utils::libbpf_clap_opts::LibbpfOpts;
use scx_utils::{
    scx_ops_attach, scx_ops_load, scx_ops_open, try_set_rlimit_infinity, uei_exited, uei_report,
};

use crate::bpf_intf;
use crate::bpf_skel::*;
use crate::policy::{PolicyBackend, PolicyConfig, PolicyExit};
use crate::stats::{StatIdx, NR_STATS};

const _: () = assert!(bpf_intf::fcg_stat_idx_FCG_NR_STATS as usize == NR_STATS);

pub struct BpfPolicy<'a> {
    open_object: Option<&'a mut MaybeUninit<OpenObject>>,
    libbpf: LibbpfOpts,
    verbose: bool,
    open_skel: Option<OpenBpfSkel<'a>>,
    skel: Option<BpfSkel<'a>>,
    struct_ops: Option<libbpf_rs::Link>,
}

impl<'a> BpfPolicy<'a> {
    pub fn new(
        open_object: &'a mut MaybeUninit<OpenObject>,
        libbpf: LibbpfOpts,
        verbose: bool,
    ) -> Self {
        Self {
            open_object: Some(open_object),
            libbpf,
            verbose,
            open_skel: None,
            skel: None,
            struct_ops: None,
        }
    }

    fn skel(&self) -> Result<&BpfSkel<'a>> {
        self.skel
            .as_ref()
            .ok_or_else(|| anyhow!("BPF skeleton is not loaded"))
    }
}

impl PolicyBackend for BpfPolicy<'_> {
    fn open(&mut self) -> Result<()> {
        try_set_rlimit_infinity();

        let open_object = self
            .open_object
            .take()
            .ok_or_else(|| anyhow!("BPF object was already opened"))?;

        let mut skel_builder = BpfSkelBuilder::default();
        skel_builder.obj_builder.debug(self.verbose);
        let open_opts = self.libbpf.clone().into_bpf_open_opts();
        let skel = scx_ops_open!(skel_builder, open_object, flatcg_ops, open_opts)?;
        self.open_skel = Some(skel);
        Ok(())
    }

    fn nr_possible_cpus(&self) -> Result<u32> {
        let nr = libbpf_rs::num_possible_cpus().context("Failed to count possible CPUs")?;
        Ok(nr as u32)
    }

    fn configure(&mut self, config: &PolicyConfig) -> Result<()> {
        let skel = self
            .open_skel
            .as_mut()
            .ok_or_else(|| anyhow!("BPF skeleton is not open"))?;
        let rodata = skel
            .maps
            .rodata_data
            .as_mut()
            .ok_or_else(|| anyhow!("BPF skeleton has no rodata"))?;

        rodata.nr_cpus = config.nr_cpus;
        rodata.cgrp_slice_ns = config.slice_ns;
        rodata.fifo_sched = config.fifo_sched;
        rodata.switch_partial = config.switch_partial;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let skel = self
            .open_skel
            .take()
            .ok_or_else(|| anyhow!("BPF skeleton is not open"))?;
        self.skel = Some(scx_ops_load!(skel, flatcg_ops, uei)?);
        Ok(())
    }

    fn attach(&mut self) -> Result<()> {
        let skel = self
            .skel
            .as_mut()
            .ok_or_else(|| anyhow!("BPF skeleton is not loaded"))?;
        self.struct_ops = Some(scx_ops_attach!(skel, flatcg_ops)?);
        Ok(())
    }

    fn detach(&mut self) {
        if self.struct_ops.take().is_some() {
            debug!("struct_ops link destroyed");
        }
    }

    fn destroy(&mut self) -> Result<PolicyExit> {
        self.open_skel = None;
        let Some(skel) = self.skel.take() else {
            return Ok(PolicyExit::default());
        };
        let uei = uei_report!(&skel, uei)?;
        Ok(PolicyExit {
            restart: uei.should_restart(),
        })
    }

    fn exited(&mut self) -> bool {
        match self.skel.as_ref() {
            Some(skel) => uei_exited!(skel, uei),
            None => false,
        }
    }

    fn read_stat(&self, idx: StatIdx) -> Result<Vec<u64>> {
        let key = (idx as u32).to_ne_bytes();
        let vals = self
            .skel()?
            .maps
            .stats
            .lookup_percpu(&key, MapFlags::ANY)
            .with_context(|| format!("Failed to look up {} counter", idx.name()))?
            .ok_or_else(|| anyhow!("{} counter is missing", idx.name()))?;

        vals.iter()
            .map(|val| {
                let bytes: [u8; 8] = val
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| anyhow!("short per-CPU value for {}", idx.name()))?;
                Ok(u64::from_ne_bytes(bytes))
            })
            .collect()
    }

    fn hweight_gen(&self) -> u64 {
        self.skel
            .as_ref()
            .and_then(|skel| skel.maps.data_data.as_ref())
            .map_or(0, |data| data.hweight_gen)
    }
}
