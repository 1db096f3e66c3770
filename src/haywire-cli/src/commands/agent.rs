//! Guest agent commands

use anyhow::{Context as _, Result};
use haywire::agent::ProcessCategory;
use haywire::protocol::PAGE_SIZE_U64;
use haywire::GuestProcess;

use crate::context::Context;
use crate::output::{human_size, truncate};

pub fn ping(ctx: &Context) -> Result<()> {
    let agent = ctx.agent()?;
    agent.handle.ping().context("Guest agent did not answer")?;
    println!("Guest agent is responding");
    Ok(())
}

/// Heaviest first; user applications ahead of everything else when
/// filtering is off
fn rank(mut processes: Vec<GuestProcess>, apps_only: bool) -> Vec<GuestProcess> {
    if apps_only {
        processes.retain(|p| p.category == ProcessCategory::UserApp);
    }
    processes.sort_by(|a, b| {
        a.category
            .cmp(&b.category)
            .then(b.mem.total_cmp(&a.mem))
            .then(a.pid.cmp(&b.pid))
    });
    processes
}

pub fn ps(ctx: &Context, limit: usize, apps_only: bool) -> Result<()> {
    let agent = ctx.agent()?;
    let processes = agent
        .handle
        .get_process_list()
        .context("Failed to list guest processes")?;
    let total = processes.len();
    let ranked = rank(processes, apps_only);

    println!(
        "{:>7} {:<10} {:>5} {:>5} {:<13} Command",
        "PID", "User", "%CPU", "%MEM", "Kind"
    );
    for p in ranked.iter().take(limit) {
        println!(
            "{:>7} {:<10} {:>5.1} {:>5.1} {:<13} {}",
            p.pid,
            truncate(&p.user, 10),
            p.cpu,
            p.mem,
            format!("{:?}", p.category),
            truncate(&p.command, 70)
        );
    }
    println!("Showing {} of {} processes", ranked.len().min(limit), total);
    Ok(())
}

pub fn maps(ctx: &Context, pid: u32) -> Result<()> {
    let agent = ctx.agent()?;
    let entries = agent
        .handle
        .get_memory_map(pid)
        .with_context(|| format!("Failed to read maps of PID {}", pid))?;

    let mut total = 0u64;
    for entry in &entries {
        total += entry.end - entry.start;
        println!(
            "{:016x}-{:016x} {} {:08x} {:>10}  {}",
            entry.start,
            entry.end,
            entry.perms,
            entry.offset,
            human_size(entry.end - entry.start),
            entry.pathname
        );
    }
    println!("{} mappings, {} total", entries.len(), human_size(total));
    Ok(())
}

pub fn pagemap(ctx: &Context, pid: u32, va: u64, pages: u64) -> Result<()> {
    let agent = ctx.agent()?;
    let start = va & !(PAGE_SIZE_U64 - 1);
    let entries = agent
        .handle
        .translate_range(pid, start, pages * PAGE_SIZE_U64)
        .with_context(|| format!("Failed to read pagemap of PID {}", pid))?;

    let mut present = 0;
    for entry in &entries {
        let state = if entry.present {
            present += 1;
            format!("PFN {:#x} -> PA {:#x}", entry.pfn, entry.phys_addr)
        } else if entry.swapped {
            "swapped".to_string()
        } else {
            "not present".to_string()
        };
        println!("{:016x}  {:016x}  {}", entry.va, entry.raw, state);
    }
    println!("{}/{} pages present", present, entries.len());
    if present > 0 && entries.iter().filter(|e| e.present).all(|e| e.pfn == 0) {
        println!("All PFNs are zero: the agent lacks CAP_SYS_ADMIN in the guest");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: u32, mem: f32, category: ProcessCategory) -> GuestProcess {
        GuestProcess {
            pid,
            user: "root".into(),
            cpu: 0.0,
            mem,
            command: format!("/usr/bin/p{pid}"),
            name: format!("p{pid}"),
            category,
        }
    }

    #[test]
    fn test_rank_orders_by_category_then_memory() {
        let ranked = rank(
            vec![
                process(1, 0.1, ProcessCategory::Service),
                process(2, 4.0, ProcessCategory::UserApp),
                process(3, 9.0, ProcessCategory::UserApp),
                process(4, 0.0, ProcessCategory::KernelThread),
            ],
            false,
        );
        let pids: Vec<u32> = ranked.iter().map(|p| p.pid).collect();
        assert_eq!(pids, [3, 2, 1, 4]);
    }

    #[test]
    fn test_rank_apps_only() {
        let ranked = rank(
            vec![
                process(1, 0.1, ProcessCategory::Service),
                process(2, 4.0, ProcessCategory::UserApp),
            ],
            true,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].pid, 2);
    }
}
