//! Test doubles
//!
//! `ScriptedRunner` stands in for the filesystem tools: it records every argv,
//! keeps a simulated mount table, answers from scripted responses matched by
//! argv prefix and hands out supervised processes the test finishes by hand.
//! A `Gate` holds one matching command in flight so a test can interleave
//! another operation with it.

use crate::controlplane::Orchestrator;
use crate::domain::model::{Disk, EntityId, Pool, RedundancyLevel, Share};
use crate::domain::ports::{
    CommandOutput, CommandRequest, CommandRunner, ProcessExit, Repository, SupervisedProcess,
};
use crate::error::{Error, Result};
use crate::executor::check_output;
use crate::filesystem::BtrfsCommands;
use crate::maintenance::{BalanceOrchestrator, ScrubOrchestrator};
use crate::storage::{
    Layout, PoolManager, QuotaEngine, ShareManager, SnapshotManager, StorageContext,
};
use crate::store::Store;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// =============================================================================
// Scripted Runner
// =============================================================================

struct Rule {
    prefix: Vec<String>,
    /// Consumed front to back; the last response repeats
    responses: VecDeque<CommandOutput>,
}

/// Handle to a fake supervised process
#[derive(Clone, Default)]
pub struct ProcessControl {
    exit: Arc<Mutex<Option<ProcessExit>>>,
    terminated: Arc<AtomicBool>,
}

impl ProcessControl {
    pub fn finish(&self, return_code: i32, stderr_tail: &[&str]) {
        *self.exit.lock() = Some(ProcessExit {
            return_code,
            stderr_tail: stderr_tail.iter().map(|s| s.to_string()).collect(),
        });
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Pauses the next command matching a prefix until released
#[derive(Default)]
pub struct Gate {
    reached: Notify,
    released: Notify,
}

impl Gate {
    /// Wait until the gated command has been issued
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the gated command complete
    pub fn release(&self) {
        self.released.notify_one();
    }
}

struct FakeProcess {
    pid: u32,
    control: ProcessControl,
}

#[async_trait]
impl SupervisedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn try_exit(&mut self) -> Result<Option<ProcessExit>> {
        Ok(self.control.exit.lock().clone())
    }

    async fn terminate(&mut self) -> Result<()> {
        self.control.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedRunner {
    calls: Mutex<Vec<Vec<String>>>,
    rules: Mutex<Vec<Rule>>,
    mounted: Mutex<BTreeSet<String>>,
    processes: Mutex<Vec<ProcessControl>>,
    gates: Mutex<Vec<(Vec<String>, Arc<Gate>)>>,
    next_subvol: AtomicU64,
    next_pid: AtomicU64,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            mounted: Mutex::new(BTreeSet::new()),
            processes: Mutex::new(Vec::new()),
            gates: Mutex::new(Vec::new()),
            next_subvol: AtomicU64::new(257),
            next_pid: AtomicU64::new(4000),
        }
    }
}

/// argv with the program reduced to its file name
fn normalize(argv: &[String]) -> Vec<String> {
    argv.iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 {
                arg.rsplit('/').next().unwrap_or(arg).to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

fn has_prefix(argv: &[String], prefix: &[String]) -> bool {
    argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p)
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for commands starting with `prefix`
    pub fn on(&self, prefix: &[&str], output: CommandOutput) {
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        let mut rules = self.rules.lock();
        match rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.responses.push_back(output),
            None => rules.push(Rule {
                prefix,
                responses: VecDeque::from([output]),
            }),
        }
    }

    /// Replace whatever was scripted for `prefix` with a single response
    pub fn set(&self, prefix: &[&str], output: CommandOutput) {
        self.clear(prefix);
        self.on(prefix, output);
    }

    /// Make commands starting with `prefix` exit 1 with `stderr`
    pub fn fail(&self, prefix: &[&str], stderr: &str) {
        self.on(prefix, CommandOutput::with_code("", stderr, 1));
    }

    /// Drop every scripted response for `prefix`
    pub fn clear(&self, prefix: &[&str]) {
        self.rules
            .lock()
            .retain(|rule| rule.prefix.iter().map(String::as_str).ne(prefix.iter().copied()));
    }

    /// Hold the next command starting with `prefix` until the gate opens
    pub fn gate(&self, prefix: &[&str]) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        let prefix = prefix.iter().map(|s| s.to_string()).collect();
        self.gates.lock().push((prefix, gate.clone()));
        gate
    }

    fn take_gate(&self, argv: &[String]) -> Option<Arc<Gate>> {
        let mut gates = self.gates.lock();
        let index = gates
            .iter()
            .position(|(prefix, _)| has_prefix(argv, prefix))?;
        Some(gates.remove(index).1)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        self.calls
            .lock()
            .iter()
            .filter(|argv| has_prefix(argv, &prefix))
            .cloned()
            .collect()
    }

    /// Index of the first recorded call starting with `prefix`
    pub fn position(&self, prefix: &[&str]) -> Option<usize> {
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        self.calls
            .lock()
            .iter()
            .position(|argv| has_prefix(argv, &prefix))
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.mounted.lock().contains(target)
    }

    pub fn process(&self, index: usize) -> ProcessControl {
        self.processes.lock()[index].clone()
    }

    pub fn last_process(&self) -> ProcessControl {
        self.processes
            .lock()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    fn scripted(&self, argv: &[String]) -> Option<CommandOutput> {
        let mut rules = self.rules.lock();
        // Longest matching prefix wins
        let rule = rules
            .iter_mut()
            .filter(|rule| has_prefix(argv, &rule.prefix))
            .max_by_key(|rule| rule.prefix.len())?;
        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }

    fn simulated(&self, argv: &[String]) -> CommandOutput {
        let last = argv.last().map(String::as_str).unwrap_or("");
        match argv.first().map(String::as_str) {
            Some("findmnt") => {
                if self.is_mounted(last) {
                    CommandOutput::success(last)
                } else {
                    CommandOutput::with_code("", "", 1)
                }
            }
            Some("btrfs") => match argv.get(1..3) {
                Some([a, b]) if a == "subvolume" && b == "show" => {
                    let id = self.next_subvol.fetch_add(1, Ordering::SeqCst);
                    CommandOutput::success(&format!("{}\n\tSubvolume ID: \t\t{}\n", last, id))
                }
                Some([a, b]) if a == "filesystem" && b == "usage" => CommandOutput::success(
                    &usage_report(21_474_836_480, 4_370_464_768, 17_104_371_712),
                ),
                Some([a, b]) if a == "balance" && b == "status" => {
                    CommandOutput::success(&format!("No balance found on '{}'", last))
                }
                Some([a, b]) if a == "scrub" && b == "status" => CommandOutput::success(
                    "scrub status for 00000000-0000-0000-0000-000000000000\n\tno stats available",
                ),
                _ => CommandOutput::default(),
            },
            _ => CommandOutput::default(),
        }
    }

    fn apply_mount_effect(&self, argv: &[String]) {
        let Some(target) = argv.last() else {
            return;
        };
        match argv.first().map(String::as_str) {
            Some("mount") => {
                self.mounted.lock().insert(target.clone());
            }
            Some("umount") => {
                self.mounted.lock().remove(target);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput> {
        let argv = normalize(&request.argv);
        self.calls.lock().push(argv.clone());

        if let Some(gate) = self.take_gate(&argv) {
            gate.reached.notify_one();
            gate.released.notified().await;
        }

        let output = self
            .scripted(&argv)
            .unwrap_or_else(|| self.simulated(&argv));
        if output.return_code == 0 {
            self.apply_mount_effect(&argv);
        }
        check_output(&request, output)
    }

    async fn spawn(&self, argv: Vec<String>) -> Result<Box<dyn SupervisedProcess>> {
        let normalized = normalize(&argv);
        self.calls.lock().push(normalized.clone());

        if let Some(output) = self.scripted(&normalized) {
            if output.return_code != 0 {
                return Err(Error::CommandExecution {
                    argv,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    return_code: output.return_code,
                });
            }
        }

        let control = ProcessControl::default();
        self.processes.lock().push(control.clone());
        Ok(Box::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst) as u32,
            control,
        }))
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// Fully wired managers over a scripted runner and in-memory store
pub struct Fixture {
    pub runner: Arc<ScriptedRunner>,
    pub ctx: StorageContext,
    pub pools: Arc<PoolManager>,
    pub shares: Arc<ShareManager>,
    pub snapshots: Arc<SnapshotManager>,
    pub quota: Arc<QuotaEngine>,
    pub balance: Arc<BalanceOrchestrator>,
    pub scrub: Arc<ScrubOrchestrator>,
    pub orchestrator: Orchestrator,
    next_disk: AtomicUsize,
}

pub const POOL_UUID: &str = "3b4c2a1e-7d0f-4a53-9b1e-5c2d8e6f7a90";

/// `filesystem show --raw` report listing `devices` as members
pub fn show_report(label: &str, devices: &[&str]) -> String {
    let mut out = format!(
        "Label: '{}'  uuid: {}\n\tTotal devices {} FS bytes used 196608\n",
        label,
        POOL_UUID,
        devices.len()
    );
    for (i, device) in devices.iter().enumerate() {
        out.push_str(&format!(
            "\tdevid {:>4} size 10737418240 used 2185232384 path {}\n",
            i + 1,
            device
        ));
    }
    out
}

/// `filesystem usage -b` overall section
pub fn usage_report(size: u64, allocated: u64, free: u64) -> String {
    format!(
        "Overall:\n    Device size:\t\t{}\n    Device allocated:\t\t{}\n    Device unallocated:\t\t{}\n    Used:\t\t\t{}\n    Free (estimated):\t\t{}\t(min: {})\n",
        size,
        allocated,
        size - allocated,
        allocated,
        free,
        free
    )
}

/// `qgroup show --raw` listing `(qgroup, rfer, excl)`
pub fn qgroup_report(groups: &[(&str, u64, u64)]) -> String {
    let mut out = String::from("qgroupid         rfer         excl \n--------         ----         ---- \n");
    for (id, rfer, excl) in groups {
        out.push_str(&format!("{:<16} {:>12} {:>12}\n", id, rfer, excl));
    }
    out
}

impl Fixture {
    pub fn new() -> Self {
        let runner = ScriptedRunner::new();
        let ctx = StorageContext::new(
            Store::in_memory(),
            runner.clone(),
            BtrfsCommands::default(),
            Layout::default(),
        );
        let orchestrator = Orchestrator::new(ctx.clone());
        Self {
            runner,
            ctx,
            pools: orchestrator.pools.clone(),
            shares: orchestrator.shares.clone(),
            snapshots: orchestrator.snapshots.clone(),
            quota: orchestrator.quota.clone(),
            balance: orchestrator.balance.clone(),
            scrub: orchestrator.scrub.clone(),
            orchestrator,
            next_disk: AtomicUsize::new(0),
        }
    }

    /// Register `count` unowned disks named sdb, sdc, ... across calls
    pub async fn disks(&self, count: usize) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let i = self.next_disk.fetch_add(1, Ordering::SeqCst);
            let name = format!("sd{}", (b'b' + i as u8) as char);
            let disk = self
                .pools
                .register_disk(&name, &format!("SERIAL-{}", i))
                .await
                .unwrap();
            ids.push(disk.id);
        }
        ids
    }

    pub async fn disk(&self, id: EntityId) -> Disk {
        self.ctx.store.disks.require(id).await.unwrap()
    }

    /// Script the membership report of pool `name`
    pub fn script_members(&self, name: &str, devices: &[&str]) {
        let mnt = self.ctx.layout.pool_mount(name);
        self.runner.set(
            &["btrfs", "filesystem", "show", "--raw", &mnt],
            CommandOutput::success(&show_report(name, devices)),
        );
    }

    /// Create pool `name` over `count` fresh disks
    pub async fn pool(&self, name: &str, count: usize, level: RedundancyLevel) -> Pool {
        let ids = self.disks(count).await;
        let mut devices = Vec::new();
        for id in &ids {
            devices.push(self.disk(*id).await.device_path());
        }
        let devices: Vec<&str> = devices.iter().map(String::as_str).collect();
        self.script_members(name, &devices);
        self.pools.create_pool(name, &ids, level).await.unwrap()
    }

    pub async fn share(&self, pool: &Pool, name: &str) -> Share {
        self.shares.add_share(pool.id, name, None).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_scripted_responses_repeat_last() {
        let runner = ScriptedRunner::new();
        runner.on(&["btrfs", "balance", "status"], CommandOutput::success("first"));
        runner.on(&["btrfs", "balance", "status"], CommandOutput::success("second"));

        let request = || CommandRequest::new(["/usr/sbin/btrfs", "balance", "status", "/mnt"]);
        assert_eq!(runner.run(request()).await.unwrap().stdout, vec!["first"]);
        assert_eq!(runner.run(request()).await.unwrap().stdout, vec!["second"]);
        assert_eq!(runner.run(request()).await.unwrap().stdout, vec!["second"]);
        assert_eq!(runner.calls_matching(&["btrfs", "balance"]).len(), 3);
    }

    #[tokio::test]
    async fn test_gate_holds_one_command() {
        let runner = ScriptedRunner::new();
        let gate = runner.gate(&["btrfs", "qgroup", "show"]);
        let request = || CommandRequest::new(["/usr/sbin/btrfs", "qgroup", "show", "/mnt"]);

        let held = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(request()).await })
        };
        gate.reached().await;
        assert!(!held.is_finished());
        // Only the first matching command is held
        runner.run(request()).await.unwrap();

        gate.release();
        held.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection_and_mount_table() {
        let runner = ScriptedRunner::new();
        runner.fail(&["mount"], "mount: wrong fs type");
        let err = runner
            .run(CommandRequest::new(["/usr/bin/mount", "/dev/sdb", "/mnt"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::CommandExecution { return_code: 1, .. });
        assert!(!runner.is_mounted("/mnt"));

        runner.clear(&["mount"]);
        runner
            .run(CommandRequest::new(["/usr/bin/mount", "/dev/sdb", "/mnt"]))
            .await
            .unwrap();
        assert!(runner.is_mounted("/mnt"));
    }
}
