//! Per-worker resource tracking.

use std::collections::{BTreeMap, HashMap};

use proctor_core::WorkerStatus;
use serde::Serialize;

use super::executor::ExecutorId;
use crate::clock;
use crate::state::WorkUnitKey;

/// Pool-side view of one running executor.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHandle {
    pub id: Option<ExecutorId>,
    pub file: String,
    pub status: WorkerStatus,
    /// Bytes.
    pub memory: u64,
    pub cpu: f64,
    pub start_time: u64,
    pub last_activity: u64,
}

/// Aggregate over every worker the pool has seen.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub total_memory: u64,
    pub average_memory: u64,
    pub peak_memory: u64,
    pub worker_statuses: BTreeMap<WorkerStatus, usize>,
}

#[derive(Debug, Default)]
pub struct WorkerMetricsManager {
    workers: HashMap<WorkUnitKey, WorkerHandle>,
    peak_memory: u64,
}

impl WorkerMetricsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: WorkUnitKey) {
        let now = clock::now_ms();
        self.workers.insert(
            key.clone(),
            WorkerHandle {
                id: None,
                file: key.file,
                status: WorkerStatus::Starting,
                memory: 0,
                cpu: 0.0,
                start_time: now,
                last_activity: now,
            },
        );
    }

    /// The executor is up and has its unit.
    pub fn mark_running(&mut self, key: &WorkUnitKey, id: ExecutorId) {
        if let Some(worker) = self.workers.get_mut(key) {
            worker.id = Some(id);
            worker.status = WorkerStatus::Running;
            worker.last_activity = clock::now_ms();
        }
    }

    pub fn touch(&mut self, key: &WorkUnitKey) {
        if let Some(worker) = self.workers.get_mut(key) {
            worker.last_activity = clock::now_ms();
        }
    }

    /// Record a memory/cpu sample. Counts as activity when reported by the executor itself.
    pub fn update(&mut self, key: &WorkUnitKey, memory: u64, cpu: Option<f64>, activity: bool) {
        if let Some(worker) = self.workers.get_mut(key) {
            worker.memory = memory;
            if let Some(cpu) = cpu {
                worker.cpu = cpu;
            }
            if activity {
                worker.last_activity = clock::now_ms();
            }
            self.peak_memory = self.peak_memory.max(memory);
        }
    }

    pub fn finish(&mut self, key: &WorkUnitKey, status: WorkerStatus) {
        if let Some(worker) = self.workers.get_mut(key) {
            worker.status = status;
        }
    }

    pub fn get(&self, key: &WorkUnitKey) -> Option<&WorkerHandle> {
        self.workers.get(key)
    }

    /// Workers still starting or running.
    pub fn active(&self) -> impl Iterator<Item = (&WorkUnitKey, &WorkerHandle)> {
        self.workers
            .iter()
            .filter(|(_, w)| matches!(w.status, WorkerStatus::Starting | WorkerStatus::Running))
    }

    pub fn clear(&mut self) {
        self.workers.clear();
    }

    pub fn aggregate(&self) -> PoolMetrics {
        let total_memory: u64 = self.workers.values().map(|w| w.memory).sum();
        let count = self.workers.len() as u64;
        let mut worker_statuses = BTreeMap::new();
        for worker in self.workers.values() {
            *worker_statuses.entry(worker.status).or_insert(0) += 1;
        }
        PoolMetrics {
            total_memory,
            average_memory: if count == 0 { 0 } else { total_memory / count },
            peak_memory: self.peak_memory,
            worker_statuses,
        }
    }
}

/// Resident set size of `pid` in bytes, where the platform exposes it.
#[cfg(target_os = "linux")]
pub fn sample_rss(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
pub fn sample_rss(_pid: u32) -> Option<u64> {
    None
}

/// Combined resident set size of `root` and every live descendant.
#[cfg(target_os = "linux")]
pub fn sample_tree_rss(root: u32) -> Option<u64> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(ppid) = parse_ppid(&stat) {
                children.entry(ppid).or_default().push(pid);
            }
        }
    }

    let mut total = sample_rss(root)?;
    let mut pending = children.remove(&root).unwrap_or_default();
    while let Some(pid) = pending.pop() {
        // Processes that exit mid-walk simply contribute nothing.
        total += sample_rss(pid).unwrap_or(0);
        pending.extend(children.remove(&pid).unwrap_or_default());
    }
    Some(total)
}

#[cfg(not(target_os = "linux"))]
pub fn sample_tree_rss(_root: u32) -> Option<u64> {
    None
}

/// Parent pid from `/proc/<pid>/stat`. The command name may itself contain `)` and spaces.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ppid(stat: &str) -> Option<u32> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Parse the `VmRSS:  1234 kB` line of `/proc/<pid>/status`.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
