//! `/proc` readers for the process-lifecycle tests.

use std::path::Path;

/// One row of `/proc/<pid>/stat`.
pub struct ProcEntry {
    pub pid: u32,
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    pub pgrp: u32,
}

impl ProcEntry {
    pub fn is_live(&self) -> bool {
        self.state != 'Z'
    }
}

fn read_entry(pid: u32) -> Option<ProcEntry> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // "pid (comm) state ppid pgrp ..."; comm may contain spaces
    let open = stat.find('(')?;
    let (head, rest) = stat.rsplit_once(')')?;
    let comm = head[open + 1..].to_string();
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcEntry {
        pid,
        comm,
        state: fields.first()?.chars().next()?,
        ppid: fields.get(1)?.parse().ok()?,
        pgrp: fields.get(2)?.parse().ok()?,
    })
}

pub fn processes() -> Vec<ProcEntry> {
    std::fs::read_dir("/proc")
        .unwrap()
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse::<u32>().ok())
        .filter_map(read_entry)
        .collect()
}

/// True while `pid` exists and is not a zombie.
pub fn is_live(pid: u32) -> bool {
    read_entry(pid).is_some_and(|e| e.is_live())
}

/// Non-zombie processes whose process group is `pgid`.
pub fn live_group_members(pgid: u32) -> Vec<u32> {
    processes()
        .into_iter()
        .filter(|e| e.is_live() && e.pgrp == pgid)
        .map(|e| e.pid)
        .collect()
}

/// Non-zombie descendants of `root` (children, grandchildren, ...),
/// found through parent links regardless of their process group.
pub fn live_descendants(root: u32) -> Vec<ProcEntry> {
    let all = processes();
    let mut found: Vec<u32> = vec![root];
    let mut i = 0;
    while i < found.len() {
        let parent = found[i];
        for e in &all {
            if e.ppid == parent && !found.contains(&e.pid) {
                found.push(e.pid);
            }
        }
        i += 1;
    }
    all.into_iter()
        .filter(|e| e.pid != root && found.contains(&e.pid) && e.is_live())
        .collect()
}

/// Non-zombie processes with `arg` as one of their command-line arguments.
pub fn live_with_arg(arg: &str) -> Vec<u32> {
    processes()
        .into_iter()
        .filter(|e| e.is_live())
        .filter(|e| {
            std::fs::read(format!("/proc/{}/cmdline", e.pid))
                .map(|raw| raw.split(|b| *b == 0).any(|a| a == arg.as_bytes()))
                .unwrap_or(false)
        })
        .map(|e| e.pid)
        .collect()
}

/// Polls `done` every 50ms for up to `attempts` rounds.
pub async fn eventually(attempts: usize, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..attempts {
        if done() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    done()
}

pub fn bash_available() -> bool {
    Path::new("/bin/bash").exists()
}
