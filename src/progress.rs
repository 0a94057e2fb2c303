//! Coarse percent bar for the long batch passes. This writes straight to
//! stderr rather than going through tracing so reruns of the bar overwrite
//! themselves with `\r` instead of producing one log line per update.
use std::io::{self, Write};

/// Redraws the bar when the run has advanced by another 5%. Call once per
/// item with the item's index, the bar finishes itself on the last item.
pub fn progress_bar(item: usize, num_items: usize) {
    if num_items == 0 {
        return;
    }
    let percent = 100 * item / num_items;
    let prev_percent = (100 * item as i64 - 100).div_euclid(num_items as i64);
    if prev_percent.div_euclid(5) != (percent as i64).div_euclid(5) {
        eprint!("\r[{:<40}] {}%", "=".repeat(2 * percent / 5), percent);
        let _ = io::stderr().flush();
    }
    if item + 1 == num_items {
        eprintln!("\r[{:<40}] 100%", "=".repeat(40));
    }
}
