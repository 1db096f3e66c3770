//! Beacon inspection commands
//!
//! Everything here reads companion-published pages out of guest RAM.

use anyhow::{bail, Result};
use haywire::protocol::Category;
use haywire::BackgroundRefresher;
use std::thread;
use std::time::Duration;

use crate::context::Context;
use crate::output::{human_size, truncate};

fn check_camera(camera: u8) -> Result<()> {
    if Category::camera(camera).is_none() {
        bail!("Camera must be 1 or 2, got {}", camera);
    }
    Ok(())
}

pub fn discover(ctx: &Context) -> Result<()> {
    let reader = ctx.reader()?;
    let Some(snapshot) = reader.snapshot() else {
        bail!("Reader has no snapshot after refresh");
    };

    println!(
        "Session {:#x} (discovery at file offset {:#x}, version {})",
        snapshot.session_id, snapshot.discovery_offset, snapshot.discovery.version
    );
    println!();
    println!(
        "{:<12} {:>8} {:>8} {:>8} {:>6}  Layout",
        "Category", "Expected", "Found", "Valid", "Torn"
    );
    for category in Category::ALL {
        let stats = snapshot.stats(category);
        println!(
            "{:<12} {:>8} {:>8} {:>8} {:>6}  {}",
            category.to_string(),
            stats.expected,
            stats.found,
            stats.valid,
            stats.torn,
            if stats.contiguous { "contiguous" } else { "scattered" }
        );
    }

    for camera in [1u8, 2] {
        match snapshot.camera_control(camera) {
            Some(control) => println!(
                "Camera {}: {:?}, target {}, current {} (v{})",
                camera, control.status, control.target_pid, control.current_pid, control.version
            ),
            None => println!("Camera {}: no control page", camera),
        }
    }
    Ok(())
}

pub fn pids(ctx: &Context, generations: bool) -> Result<()> {
    let reader = ctx.reader()?;

    if generations {
        for generation in reader.pid_generations() {
            println!(
                "Generation {}: {}/{} PIDs over {} pages{}",
                generation.generation,
                generation.pids.len(),
                generation.total_pids,
                generation.pages,
                if generation.is_complete() { "" } else { " (incomplete)" }
            );
        }
        return Ok(());
    }

    let pids = reader.get_pid_list();
    println!("{} PIDs:", pids.len());
    for chunk in pids.chunks(10) {
        let line: Vec<String> = chunk.iter().map(|p| format!("{:>7}", p)).collect();
        println!("{}", line.join(""));
    }
    Ok(())
}

pub fn ps(ctx: &Context, json: bool) -> Result<()> {
    let reader = ctx.reader()?;
    let processes = reader.get_all_process_info();

    if json {
        let entries: Vec<_> = processes.values().collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!(
        "{:>7} {:>7} {:>5} {} {:>4} {:>10} {:>10} {:>5}  {}",
        "PID", "PPID", "UID", "S", "THR", "VSZ", "RSS", "SECT", "COMMAND"
    );
    for (pid, process) in &processes {
        println!(
            "{:>7} {:>7} {:>5} {} {:>4} {:>10} {:>10} {:>5}  {}",
            pid,
            process.ppid,
            process.uid,
            process.state_char(),
            process.num_threads,
            human_size(process.vsize),
            human_size(process.rss * 4096),
            process.num_sections,
            if process.exe_path.is_empty() {
                process.name().to_string()
            } else {
                format!("{} ({})", process.name(), process.exe_path)
            }
        );
    }
    println!("{} processes", processes.len());
    Ok(())
}

pub fn sections(ctx: &Context, pid: u32, json: bool) -> Result<()> {
    let reader = ctx.reader()?;
    let sections = reader.process_sections(pid);
    if sections.is_empty() {
        bail!("No published sections for PID {}", pid);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&sections)?);
        return Ok(());
    }

    for section in &sections {
        println!(
            "{:016x}-{:016x} {} {:08x} {:>10}  {}",
            section.start,
            section.end,
            section.perms,
            section.offset,
            human_size(section.size()),
            truncate(&section.pathname, 60)
        );
    }
    println!("{} sections", sections.len());
    Ok(())
}

pub fn ptes(ctx: &Context, camera: u8, pid: u32, limit: usize) -> Result<()> {
    check_camera(camera)?;
    let reader = ctx.reader()?;

    let Some(capture) = reader.camera_capture(camera) else {
        bail!("Camera {} has no capture", camera);
    };
    if capture.target_pid != pid {
        bail!(
            "Camera {} is capturing PID {}, not {} (use `haywire focus {} -c {}`)",
            camera,
            capture.target_pid,
            pid,
            pid,
            camera
        );
    }

    println!(
        "Camera {} capture v{}: {} sections, {} PTEs over {} pages{}",
        camera,
        capture.version,
        capture.sections.len(),
        capture.ptes.len(),
        capture.pages,
        if capture.complete { "" } else { " (incomplete)" }
    );
    for pte in capture.ptes.iter().take(limit) {
        println!(
            "{:016x} -> {:012x}{}",
            pte.va,
            pte.pa,
            if pte.flags.is_fabricated() { "  fabricated" } else { "" }
        );
    }
    if capture.ptes.len() > limit {
        println!("... {} more", capture.ptes.len() - limit);
    }
    Ok(())
}

pub fn focus(ctx: &Context, camera: u8, pid: u32, wait: bool) -> Result<()> {
    check_camera(camera)?;
    let reader = ctx.reader()?;

    reader.try_set_camera_focus(camera, pid)?;
    println!("Requested camera {} -> PID {}", camera, pid);
    if !wait {
        return Ok(());
    }

    if !reader.wait_for_focus(camera, pid) {
        bail!(
            "Companion did not capture PID {} on camera {}: {}",
            pid,
            camera,
            reader
                .last_diagnostic()
                .unwrap_or_else(|| "timed out".into())
        );
    }
    let sections = reader.get_camera_sections(camera, pid).len();
    let ptes = reader.get_camera_ptes(camera, pid).len();
    println!("Captured {} sections and {} trusted PTEs", sections, ptes);
    Ok(())
}

pub fn watch(ctx: &Context, interval: u64, count: Option<u64>) -> Result<()> {
    let reader = ctx.reader_unchecked()?;
    let interval = Duration::from_secs(interval.max(1));
    let refresher = BackgroundRefresher::with_interval(reader.clone(), interval)?;

    let mut printed = 0u64;
    loop {
        thread::sleep(interval);
        printed += 1;

        match reader.snapshot() {
            Some(snapshot) => {
                let cameras: Vec<String> = [1u8, 2]
                    .iter()
                    .map(|&cam| match snapshot.camera(cam) {
                        Some(c) => format!("cam{}=PID {} ({} PTEs)", cam, c.target_pid, c.ptes.len()),
                        None => format!("cam{}=idle", cam),
                    })
                    .collect();
                println!(
                    "[{}] session {:#x} epoch {}: {} PIDs, {} detailed, {}",
                    refresher.cycles(),
                    snapshot.session_id,
                    reader.epoch(),
                    snapshot.pid_list().len(),
                    snapshot.processes().len(),
                    cameras.join(", ")
                );
            }
            None => println!(
                "[{}] no beacon: {}",
                refresher.cycles(),
                reader
                    .last_diagnostic()
                    .unwrap_or_else(|| "waiting".into())
            ),
        }

        if count.is_some_and(|n| printed >= n) {
            break;
        }
    }
    Ok(())
}
