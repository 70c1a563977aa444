// SPDX-License-Identifier: GPL-2.0
//
// scx_flatcg — BPF policy lifecycle
//
// Unopened → Opened → Loaded → Attached → Detached → Destroyed. Every arrow is
// taken at most once. Once opened, the policy is released exactly once, either
// by an explicit teardown() or by Drop on an early-exit path.

use anyhow::Result;
use log::{debug, warn};
use thiserror::Error;

use crate::stats::StatIdx;

/// SCX_SLICE_DFL.
pub const DEFAULT_SLICE_NS: u64 = 20_000_000;

/// Tunables written into the BPF program before it is loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    pub slice_ns: u64,
    pub fifo_sched: bool,
    pub switch_partial: bool,
    /// Filled in from the host when the policy is configured.
    pub nr_cpus: u32,
}

impl PolicyConfig {
    pub fn new(slice_ns: u64, fifo_sched: bool, switch_partial: bool) -> Self {
        Self {
            slice_ns,
            fifo_sched,
            switch_partial,
            nr_cpus: 0,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SLICE_NS, false, false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyState {
    Unopened,
    Opened,
    Loaded,
    Attached,
    Detached,
    Destroyed,
}

/// What the BPF side reported when it was torn down.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyExit {
    pub restart: bool,
}

impl PolicyExit {
    pub fn should_restart(&self) -> bool {
        self.restart
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to open the BPF policy")]
    Open(#[source] anyhow::Error),
    #[error("failed to configure the BPF policy")]
    Configure(#[source] anyhow::Error),
    #[error("failed to load the BPF policy")]
    Load(#[source] anyhow::Error),
    #[error("failed to attach the BPF policy")]
    Attach(#[source] anyhow::Error),
    #[error("cannot {op} the BPF policy while {state:?}")]
    InvalidTransition {
        op: &'static str,
        state: PolicyState,
    },
}

/// The installation mechanism for the kernel-resident program.
///
/// Implementations only perform the raw operation; ordering is enforced by
/// [`Policy`].
pub trait PolicyBackend {
    fn open(&mut self) -> Result<()>;

    /// Number of per-CPU slots in each counter.
    fn nr_possible_cpus(&self) -> Result<u32>;

    fn configure(&mut self, config: &PolicyConfig) -> Result<()>;

    fn load(&mut self) -> Result<()>;

    fn attach(&mut self) -> Result<()>;

    fn detach(&mut self);

    /// Report the exit info and free the program object.
    fn destroy(&mut self) -> Result<PolicyExit>;

    /// True once the BPF side has exited on its own.
    fn exited(&mut self) -> bool;

    /// Per-CPU values of one counter.
    fn read_stat(&self, idx: StatIdx) -> Result<Vec<u64>>;

    fn hweight_gen(&self) -> u64;
}

/// Sole owner of a [`PolicyBackend`].
pub struct Policy<B: PolicyBackend> {
    backend: B,
    state: PolicyState,
    configured: bool,
    nr_cpus: u32,
}

impl<B: PolicyBackend> Policy<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: PolicyState::Unopened,
            configured: false,
            nr_cpus: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    fn expect_state(&self, op: &'static str, want: PolicyState) -> Result<(), LifecycleError> {
        if self.state != want {
            return Err(LifecycleError::InvalidTransition {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Open the program object and detect the number of possible CPUs.
    pub fn open(&mut self) -> Result<u32, LifecycleError> {
        self.expect_state("open", PolicyState::Unopened)?;
        self.backend.open().map_err(LifecycleError::Open)?;
        self.state = PolicyState::Opened;

        self.nr_cpus = self
            .backend
            .nr_possible_cpus()
            .map_err(LifecycleError::Open)?;
        debug!("policy opened, nr_cpus={}", self.nr_cpus);
        Ok(self.nr_cpus)
    }

    /// Write the tunables. The detected CPU count overrides `config.nr_cpus`.
    pub fn configure(&mut self, mut config: PolicyConfig) -> Result<PolicyConfig, LifecycleError> {
        self.expect_state("configure", PolicyState::Opened)?;
        config.nr_cpus = self.nr_cpus;
        self.backend
            .configure(&config)
            .map_err(LifecycleError::Configure)?;
        self.configured = true;
        Ok(config)
    }

    pub fn load(&mut self) -> Result<(), LifecycleError> {
        self.expect_state("load", PolicyState::Opened)?;
        if !self.configured {
            return Err(LifecycleError::InvalidTransition {
                op: "load unconfigured",
                state: self.state,
            });
        }
        self.backend.load().map_err(LifecycleError::Load)?;
        self.state = PolicyState::Loaded;
        Ok(())
    }

    pub fn attach(&mut self) -> Result<(), LifecycleError> {
        self.expect_state("attach", PolicyState::Loaded)?;
        self.backend.attach().map_err(LifecycleError::Attach)?;
        self.state = PolicyState::Attached;
        Ok(())
    }

    pub fn exited(&mut self) -> bool {
        match self.state {
            PolicyState::Loaded | PolicyState::Attached => self.backend.exited(),
            _ => false,
        }
    }

    pub fn read_stat(&self, idx: StatIdx) -> Result<Vec<u64>> {
        match self.state {
            PolicyState::Loaded | PolicyState::Attached => self.backend.read_stat(idx),
            state => Err(LifecycleError::InvalidTransition {
                op: "read counters of",
                state,
            }
            .into()),
        }
    }

    pub fn hweight_gen(&self) -> u64 {
        match self.state {
            PolicyState::Loaded | PolicyState::Attached => self.backend.hweight_gen(),
            _ => 0,
        }
    }

    /// Detach and destroy. Consumes the policy so it cannot run twice.
    pub fn teardown(mut self) -> Result<PolicyExit> {
        self.release()
    }

    fn release(&mut self) -> Result<PolicyExit> {
        match self.state {
            PolicyState::Unopened | PolicyState::Destroyed => return Ok(PolicyExit::default()),
            PolicyState::Attached => {
                self.backend.detach();
                self.state = PolicyState::Detached;
            }
            PolicyState::Opened | PolicyState::Loaded | PolicyState::Detached => {}
        }

        self.state = PolicyState::Destroyed;
        self.backend.destroy()
    }
}

impl<B: PolicyBackend> Drop for Policy<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("policy teardown failed: {:#}", e);
        }
    }
}
