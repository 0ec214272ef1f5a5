//! Adaptive batch sizing
//!
//! Early in a job the queue is deep and batches sit at `max_per_dispatch`,
//! keeping protocol round trips rare. As the queue drains, batches shrink
//! toward `min_per_dispatch` so the tail is spread over every worker instead
//! of one worker holding a large final batch.

use batchdispatch_common::BatchConfig;

/// Number of tasks to hand out next
///
/// Returns 0 only when `num_left` is 0. `num_workers` must be at least 1.
pub fn size_for(num_left: usize, num_workers: usize, config: &BatchConfig) -> usize {
    let size = match config.exact_dispatch {
        Some(exact) if exact > 0 => exact,
        _ => num_left
            .div_ceil(num_workers.max(1))
            .clamp(config.min_per_dispatch, config.max_per_dispatch),
    };
    size.min(num_left)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_share_within_bounds() {
        let config = BatchConfig::new(5, 100);
        assert_eq!(size_for(23, 3, &config), 8);
        assert_eq!(size_for(300, 3, &config), 100);
        assert_eq!(size_for(1000, 3, &config), 100);
    }

    #[test]
    fn test_floor_then_remaining() {
        let config = BatchConfig::new(5, 100);
        // ceil(7/3) = 3, raised to the floor of 5
        assert_eq!(size_for(7, 3, &config), 5);
        // never more than what is left
        assert_eq!(size_for(2, 3, &config), 2);
        assert_eq!(size_for(0, 3, &config), 0);
    }

    #[test]
    fn test_exact_overrides_bounds() {
        let config = BatchConfig::exact(3);
        assert_eq!(size_for(10, 4, &config), 3);
        assert_eq!(size_for(1000, 4, &config), 3);
        assert_eq!(size_for(1, 4, &config), 1);
        assert_eq!(size_for(0, 4, &config), 0);
    }

    #[test]
    fn test_shrinks_as_queue_drains() {
        let config = BatchConfig::new(1, 50);
        let mut left = 400;
        let mut previous = usize::MAX;
        while left > 0 {
            let size = size_for(left, 4, &config);
            assert!(size >= 1 && size <= previous);
            previous = size;
            left -= size;
        }
    }
}
