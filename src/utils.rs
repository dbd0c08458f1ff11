//! # Utility Functions
//!
//! Formatting helpers for the console reports and seed derivation for the
//! per-worker random number generators.

use std::time::Duration;

const BYTE_SUFFIXES: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Format a byte count with binary suffixes and at most one decimal.
///
/// ## Examples
///
/// ```rust
/// use stream_stress::utils::format_bytes;
///
/// assert_eq!(format_bytes(0), "0B");
/// assert_eq!(format_bytes(1536), "1.5KiB");
/// assert_eq!(format_bytes(1024 * 1024), "1MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return format!("0{}", BYTE_SUFFIXES[0]);
    }

    let mut position = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && position < BYTE_SUFFIXES.len() - 1 {
        value /= 1024.0;
        position += 1;
    }

    let rendered = format!("{:.1}", value);
    let rendered = rendered.strip_suffix(".0").unwrap_or(&rendered);
    format!("{}{}", rendered, BYTE_SUFFIXES[position])
}

/// Format an elapsed duration as `hh:mm:ss`
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Derive an independent seed for one stream from the run seed.
///
/// SplitMix64 finalizer, so neighbouring stream ids give unrelated seeds.
pub fn derive_seed(run_seed: u64, stream_id: u64) -> u64 {
    let mut z = run_seed ^ stream_id.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Fresh run seed when none was given on the command line
pub fn random_seed() -> u64 {
    rand::random()
}
