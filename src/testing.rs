// SPDX-License-Identifier: GPL-2.0
//
// In-process stand-in for the BPF backend.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

use crate::policy::{PolicyBackend, PolicyConfig, PolicyExit};
use crate::stats::{StatIdx, NR_STATS};

pub type CallLog = Rc<RefCell<Vec<&'static str>>>;

/// Invoked at the start of every counter read round with the round number
/// and the per-CPU counter table, which it may modify.
pub type ReadHook = Box<dyn FnMut(usize, &mut Vec<Vec<u64>>)>;

pub struct FakePolicy {
    pub calls: CallLog,
    pub config: Rc<RefCell<Option<PolicyConfig>>>,
    pub nr_cpus: u32,
    pub fail_at: Option<&'static str>,
    /// `exited()` turns true after this many calls.
    pub exit_after: Option<usize>,
    pub missing: Option<StatIdx>,
    pub restart: bool,
    pub hweight_gen: u64,
    counters: RefCell<Vec<Vec<u64>>>,
    hook: RefCell<Option<ReadHook>>,
    rounds: RefCell<usize>,
    exited_calls: usize,
}

impl FakePolicy {
    pub fn new(nr_cpus: u32) -> Self {
        Self {
            calls: CallLog::default(),
            config: Rc::new(RefCell::new(None)),
            nr_cpus,
            fail_at: None,
            exit_after: None,
            missing: None,
            restart: false,
            hweight_gen: 1,
            counters: RefCell::new(vec![vec![0; nr_cpus as usize]; NR_STATS]),
            hook: RefCell::new(None),
            rounds: RefCell::new(0),
            exited_calls: 0,
        }
    }

    pub fn on_read(&mut self, hook: impl FnMut(usize, &mut Vec<Vec<u64>>) + 'static) {
        *self.hook.get_mut() = Some(Box::new(hook));
    }

    pub fn count(calls: &CallLog, name: &str) -> usize {
        calls.borrow().iter().filter(|c| **c == name).count()
    }

    fn step(&mut self, name: &'static str) -> Result<()> {
        self.calls.borrow_mut().push(name);
        if self.fail_at == Some(name) {
            bail!("injected {} failure", name);
        }
        Ok(())
    }
}

impl PolicyBackend for FakePolicy {
    fn open(&mut self) -> Result<()> {
        self.step("open")
    }

    fn nr_possible_cpus(&self) -> Result<u32> {
        Ok(self.nr_cpus)
    }

    fn configure(&mut self, config: &PolicyConfig) -> Result<()> {
        self.step("configure")?;
        *self.config.borrow_mut() = Some(config.clone());
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        self.step("load")
    }

    fn attach(&mut self) -> Result<()> {
        self.step("attach")
    }

    fn detach(&mut self) {
        self.calls.borrow_mut().push("detach");
    }

    fn destroy(&mut self) -> Result<PolicyExit> {
        self.step("destroy")?;
        Ok(PolicyExit {
            restart: self.restart,
        })
    }

    fn exited(&mut self) -> bool {
        self.exited_calls += 1;
        self.exit_after.is_some_and(|n| self.exited_calls > n)
    }

    fn read_stat(&self, idx: StatIdx) -> Result<Vec<u64>> {
        if idx == StatIdx::ALL[0] {
            let mut round = self.rounds.borrow_mut();
            if let Some(hook) = self.hook.borrow_mut().as_mut() {
                hook(*round, &mut *self.counters.borrow_mut());
            }
            *round += 1;
        }
        if self.missing == Some(idx) {
            return Err(anyhow!("no {} counter", idx.name()));
        }
        Ok(self.counters.borrow()[idx as usize].clone())
    }

    fn hweight_gen(&self) -> u64 {
        self.hweight_gen
    }
}
