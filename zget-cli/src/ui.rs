use std::io::Write;

use zget_engine::{ProgressHook, TransferProgress};

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

const BAR_WIDTH: usize = 30;

/// Renders one progress line.  Without a known total only the byte count
/// is shown.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn render_progress(label: &str, progress: &TransferProgress) -> String {
    let done = format_size(progress.bytes_so_far);
    match progress.total_bytes {
        Some(total) if total > 0 => {
            let ratio = (progress.bytes_so_far as f64 / total as f64).min(1.0);
            let filled = (ratio * BAR_WIDTH as f64) as usize;
            format!(
                "  {label} [{}{}] {pct:>5.1}%  {done} / {total}",
                "█".repeat(filled),
                "░".repeat(BAR_WIDTH - filled),
                pct = ratio * 100.0,
                total = format_size(total),
            )
        }
        _ => format!("  {label} {done}"),
    }
}

/// Progress callback that redraws a bar on stdout, ending the line once
/// the announced total is reached.
pub fn progress_bar(label: &'static str) -> ProgressHook {
    Box::new(move |progress| {
        // Overwrite the same line with \r for a compact progress bar.
        print!("\r{}", render_progress(label, progress));
        if progress
            .total_bytes
            .is_some_and(|total| progress.bytes_so_far >= total)
        {
            println!();
        }
        let _ = std::io::stdout().flush();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_byte_counts_when_formatted_then_units_scale() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn given_half_done_when_rendered_then_bar_is_half_full() {
        let line = render_progress(
            "Downloading",
            &TransferProgress {
                chunk_index: 3,
                bytes_so_far: 512,
                total_bytes: Some(1024),
            },
        );
        assert!(line.contains(" 50.0%"));
        assert_eq!(line.matches('█').count(), BAR_WIDTH / 2);
        assert!(line.ends_with("512 B / 1.00 KiB"));
    }

    #[test]
    fn given_unknown_total_when_rendered_then_only_bytes_are_shown() {
        let line = render_progress(
            "Downloading",
            &TransferProgress {
                chunk_index: 0,
                bytes_so_far: 2048,
                total_bytes: None,
            },
        );
        assert_eq!(line, "  Downloading 2.00 KiB");
    }
}
