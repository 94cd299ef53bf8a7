use bytesize::ByteSize;
use thousands::Separable;

use smpool::{round_up, ALIGN, DEFAULT_REFILL_BLOCKS, MAX_BYTES, NUM_FREELISTS};

fn conv(size: usize) -> String {
    ByteSize::b(size as u64).to_string_as(true) // binary units (KiB, MiB, ...)
}

fn class_table() {
    println!("size classes ({} of them, {}-byte grid, {}-byte ceiling)", NUM_FREELISTS, ALIGN, MAX_BYTES);
    println!("{:<7} {:<11} {:<7} {:<12} {:<12}", "class", "blocksize", "batch", "batchbytes", "growbytes");
    println!("{:<7} {:<11} {:<7} {:<12} {:<12}", "-----", "---------", "-----", "----------", "---------");

    for index in 0..NUM_FREELISTS {
        let blocksize = (index + 1) * ALIGN;
        let batchbytes = blocksize * DEFAULT_REFILL_BLOCKS;

        // What a refill of this class asks the system for when the
        // reserve is empty and nothing has been allocated yet.
        let growbytes = 2 * batchbytes;

        println!(
            "{:<7} {:<11} {:<7} {:<12} {:<12}",
            index,
            blocksize,
            DEFAULT_REFILL_BLOCKS,
            batchbytes.separate_with_commas(),
            growbytes.separate_with_commas(),
        );
    }
}

fn growth_schedule() {
    // Simulate a pool that keeps exhausting its reserve on one class and
    // show how the system requests grow: twice the batch, plus a slack
    // of one sixteenth of everything obtained so far.
    println!();
    println!("reserve growth schedule (class 0 refills, reserve always drained)");
    println!("{:<7} {:<14} {:<14} {:<12}", "round", "request", "total_used", "");
    println!("{:<7} {:<14} {:<14} {:<12}", "-----", "-------", "----------", "");

    let want = ALIGN * DEFAULT_REFILL_BLOCKS;
    let mut total_used = 0usize;

    for round in 0..16 {
        let bytes_to_alloc = 2 * want + round_up(total_used >> 4);
        total_used += bytes_to_alloc;

        println!(
            "{:<7} {:<14} {:<14} {:<12}",
            round,
            bytes_to_alloc.separate_with_commas(),
            total_used.separate_with_commas(),
            conv(total_used),
        );
    }
}

fn main() {
    class_table();
    growth_schedule();
}
