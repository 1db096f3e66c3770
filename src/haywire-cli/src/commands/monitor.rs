//! Hypervisor monitor commands

use anyhow::{bail, Result};
use haywire::monitor::parse_mtree_ram;

use crate::context::Context;
use crate::output::human_size;

pub fn mtree(ctx: &Context, raw: bool) -> Result<()> {
    let mut qmp = ctx.qmp()?;
    let output = qmp.mtree()?;
    if raw {
        println!("{}", output.trim_end());
        println!();
    }

    let ranges = parse_mtree_ram(&output);
    if ranges.is_empty() {
        bail!("No RAM ranges in the monitor's memory tree");
    }
    println!(
        "{:<18} {:<18} {:>10} {:>12}  Name",
        "GPA start", "GPA end", "Size", "File offset"
    );
    for range in &ranges {
        println!(
            "{:<#18x} {:<#18x} {:>10} {:>#12x}  {}",
            range.start,
            range.end,
            human_size(range.size()),
            range.file_offset,
            range.name
        );
    }
    if let Some(first) = ranges.first() {
        println!();
        println!("Use --ram-base {:#x} for a file backing the first range", first.start);
    }
    Ok(())
}

pub fn pmemsave(ctx: &Context, gpa: u64, size: u64, output: &str) -> Result<()> {
    if size == 0 {
        bail!("Size must be non-zero");
    }
    let mut qmp = ctx.qmp()?;
    qmp.pmemsave(gpa, size, output)?;
    println!(
        "Saved {} at {:#x} to {} (host path)",
        human_size(size),
        gpa,
        output
    );
    Ok(())
}
