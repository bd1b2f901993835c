use rand::Rng;

use crate::model::{RotationMode, WallpaperConfig};

/// Outcome of picking the next wallpaper for one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection<'a> {
    pub config: &'a WallpaperConfig,
    /// Position of `config` within the eligible list.
    pub position: usize,
    /// Index to persist once the wallpaper is applied. `None` in random
    /// mode, which leaves the stored index untouched.
    pub next_index: Option<i64>,
}

/// Pick the next configuration out of `configs`.
///
/// Sequential mode advances `prior_index` by one modulo the list length, so
/// an index stored against a list of a different size is simply re-ranged.
/// Random mode draws uniformly from `rng` and ignores `prior_index`.
/// Returns `None` for an empty list.
pub fn select<'a, R: Rng>(
    configs: &[&'a WallpaperConfig],
    mode: RotationMode,
    prior_index: i64,
    rng: &mut R,
) -> Option<Selection<'a>> {
    if configs.is_empty() {
        return None;
    }

    match mode {
        RotationMode::Random => {
            let position = rng.gen_range(0..configs.len());
            Some(Selection {
                config: configs[position],
                position,
                next_index: None,
            })
        }
        RotationMode::Sequential => {
            let next = next_sequential_index(prior_index, configs.len());
            Some(Selection {
                config: configs[next as usize],
                position: next as usize,
                next_index: Some(next),
            })
        }
    }
}

/// `(prior + 1) mod len`, always in `0..len`.
pub fn next_sequential_index(prior_index: i64, len: usize) -> i64 {
    debug_assert!(len > 0);
    prior_index.wrapping_add(1).rem_euclid(len as i64)
}
