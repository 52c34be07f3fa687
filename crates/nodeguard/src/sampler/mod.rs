//! Out-of-band sampling of the launched process tree and of the machine.
//!
//! The watchdog only talks to the [`ProcessTreeSampler`] and [`SystemSampler`] traits;
//! the OS specific walking lives in the implementations.

use std::path::Path;

use crate::hwstats::{ResourceSample, SystemSample};
use crate::{Map, Pid, Set};

mod system;
mod tree;

pub use system::HwSampler;
pub use tree::PsutilTreeSampler;

pub trait ProcessTreeSampler {
    /// Samples `root` and all of its descendants, see [`task_processes`].
    ///
    /// Fails with [`crate::Error::ProcessUnavailable`] when `root` and every member of
    /// its process group are gone. Descendants that disappear during the walk
    /// contribute nothing.
    fn sample(&mut self, root: Pid) -> crate::Result<ResourceSample>;
}

pub trait SystemSampler {
    /// Samples machine-wide load. `disk_path` selects the disk whose usage is reported.
    fn sample(&mut self, disk_path: Option<&Path>) -> crate::Result<SystemSample>;
}

fn walk_tree(root: Pid, children: &Map<Pid, Vec<Pid>>) -> Vec<Pid> {
    let mut result = Vec::new();
    let mut visited = Set::default();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if !visited.insert(pid) {
            continue;
        }
        result.push(pid);
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids.iter().rev().copied());
        }
    }
    result
}

/// Process group of a live process, `None` when it is gone or a zombie.
#[cfg(target_os = "linux")]
fn live_group(pid: Pid) -> Option<Pid> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses, the fields start after the last ')'
    let (_, fields) = stat.rsplit_once(')')?;
    let mut fields = fields.split_whitespace();
    let state = fields.next()?;
    if matches!(state, "Z" | "X" | "x") {
        return None;
    }
    fields.nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn live_group(pid: Pid) -> Option<Pid> {
    use nix::unistd::{Pid as NixPid, getpgid};
    let pid = NixPid::from_raw(pid as i32);
    nix::sys::signal::kill(pid, None).ok()?;
    getpgid(Some(pid)).ok().map(|group| group.as_raw() as Pid)
}

/// The process exists and has not exited yet (zombies count as exited).
pub fn pid_running(pid: Pid) -> bool {
    live_group(pid).is_some()
}

/// Live members of the process group `pgid`.
pub fn process_group(pgid: Pid) -> crate::Result<Vec<Pid>> {
    Ok(psutil::process::processes()?
        .into_iter()
        .flatten()
        .map(|process| process.pid())
        .filter(|pid| live_group(*pid) == Some(pgid))
        .collect())
}

/// Every process belonging to the task started as `root`: the tree below `root` and
/// the members of its process group that were reparented after their parent exited.
///
/// `root` always comes first, even when it has already exited.
pub fn task_processes(root: Pid) -> crate::Result<Vec<Pid>> {
    let mut children: Map<Pid, Vec<Pid>> = Map::default();
    let mut members = Vec::new();
    for process in psutil::process::processes()?.into_iter().flatten() {
        let pid = process.pid();
        if let Ok(Some(ppid)) = process.ppid() {
            children.entry(ppid).or_default().push(pid);
        }
        if pid != root && live_group(pid) == Some(root) {
            members.push(pid);
        }
    }
    let mut result = walk_tree(root, &children);
    let mut seen: Set<Pid> = result.iter().copied().collect();
    for member in members {
        for pid in walk_tree(member, &children) {
            if seen.insert(pid) {
                result.push(pid);
            }
        }
    }
    Ok(result)
}

pub fn default_tree_sampler() -> Box<dyn ProcessTreeSampler> {
    Box::new(PsutilTreeSampler::new())
}

pub fn default_system_sampler() -> crate::Result<Box<dyn SystemSampler>> {
    Ok(Box::new(HwSampler::init()?))
}
