//! Guest memory commands: physical reads, translation and flat views

use anyhow::{bail, Context as _, Result};
use haywire::CrunchedReader;

use crate::cli::Via;
use crate::context::{Context, ProcessView};
use crate::output::{hex_dump, human_size, truncate};

/// Largest single dump; bigger requests are almost always a typo
const MAX_DUMP: u64 = 1 << 20;

fn dump_len(size: u64) -> Result<usize> {
    if size == 0 || size > MAX_DUMP {
        bail!("Size must be between 1 and {:#x} bytes", MAX_DUMP);
    }
    Ok(size as usize)
}

pub fn read(ctx: &Context, address: u64, size: u64) -> Result<()> {
    let len = dump_len(size)?;
    let backend = ctx.backend()?;
    let data = backend
        .read_vec(address, len)
        .with_context(|| format!("Failed to read {} bytes at {:#x}", len, address))?;

    println!("Reading {} bytes at {:#x}:", len, address);
    print!("{}", hex_dump(address, &data));
    Ok(())
}

pub fn translate(ctx: &Context, pid: u32, va: u64, via: Via) -> Result<()> {
    let view = ProcessView::open(ctx, via, pid)?;
    let pa = view.translator.try_translate(pid, va)?;

    println!("PID {} VA {:#x} -> PA {:#x} ({})", pid, va, pa, view.translator.name());
    if let Some(region) = view.flattener.region_at_va(va) {
        println!(
            "  in {:#x}-{:#x} {} {}, flat offset {:#x}",
            region.va_start,
            region.va_end,
            region.perms,
            region.name,
            view.flattener.virtual_to_flat(va)
        );
    }
    Ok(())
}

pub fn crunch(ctx: &Context, pid: u32, offset: u64, size: u64, via: Via) -> Result<()> {
    let len = dump_len(size)?;
    let view = ProcessView::open(ctx, via, pid)?;
    if offset >= view.flattener.flat_size() {
        bail!(
            "Offset {:#x} is past the flat size {:#x}",
            offset,
            view.flattener.flat_size()
        );
    }

    let reader = CrunchedReader::new(ctx.backend()?, view.translator, view.flattener, pid);
    let data = reader.read_vec(offset, len);
    let va = reader.flattener().flat_to_virtual(offset);
    let pa = reader.physical_address(offset);

    println!(
        "PID {} flat {:#x} (VA {:#x}, PA {}), {} bytes:",
        pid,
        offset,
        va,
        if pa == 0 { "unmapped".to_string() } else { format!("{:#x}", pa) },
        data.len()
    );
    print!("{}", hex_dump(offset, &data));
    Ok(())
}

pub fn flat(ctx: &Context, pid: u32, via: Via) -> Result<()> {
    let view = ProcessView::open(ctx, via, pid)?;
    let flattener = &view.flattener;

    println!(
        "{:>12} {:>12}  {:<33} {:>10} {:<4}  Name",
        "Flat start", "Flat end", "VA range", "Size", "Perm"
    );
    for region in flattener.regions() {
        println!(
            "{:>12x} {:>12x}  {:016x}-{:016x} {:>10} {:<4}  {}",
            region.flat_start,
            region.flat_end,
            region.va_start,
            region.va_end,
            human_size(region.size()),
            region.perms,
            truncate(&region.name, 50)
        );
    }

    let hints = flattener.navigation_hints();
    if !hints.is_empty() {
        println!();
        println!("Navigation:");
        for hint in &hints {
            println!(
                "  {}{:<8} flat {:#x} (VA {:#x})",
                if hint.major { "*" } else { " " },
                hint.label,
                hint.flat_offset,
                hint.va
            );
        }
    }

    let stats = flattener.stats();
    println!();
    println!(
        "{} regions, {} mapped over a {} VA span ({:.1}x compression)",
        stats.regions,
        human_size(stats.mapped),
        human_size(stats.va_span),
        stats.ratio
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_len_bounds() {
        assert_eq!(dump_len(256).unwrap(), 256);
        assert_eq!(dump_len(MAX_DUMP).unwrap(), MAX_DUMP as usize);
        assert!(dump_len(0).is_err());
        assert!(dump_len(MAX_DUMP + 1).is_err());
    }
}
