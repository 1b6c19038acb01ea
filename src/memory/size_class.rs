/// Small-allocation size ladder. Requests above the last rung take the
/// large-block path.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

pub(crate) const SIZE_CLASS_COUNT: usize = SIZE_CLASSES.len();

/// Largest request served from a size class.
pub(crate) const MAX_SMALL_SIZE: usize = SIZE_CLASSES[SIZE_CLASS_COUNT - 1];

/// Smallest class index whose size covers `size`, or None for requests that
/// must take the large-block path. Zero-size requests are rejected upstream
/// and never reach this table.
#[inline]
#[must_use]
pub fn class_of(size: usize) -> Option<usize> {
    debug_assert!(size > 0, "zero-size requests are rejected by the facade");
    SIZE_CLASSES.iter().position(|&s| s >= size)
}

/// Block size of class `class`.
///
/// # Panics
///
/// Panics if `class` is out of range.
#[inline]
#[must_use]
pub fn class_size(class: usize) -> usize {
    SIZE_CLASSES[class]
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_is_strictly_increasing() {
        for w in SIZE_CLASSES.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_exact_sizes_map_to_their_class() {
        for (i, &s) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(class_of(s), Some(i));
            assert_eq!(class_size(i), s);
        }
    }

    #[test]
    fn test_one_past_a_class_rounds_up() {
        for i in 0..SIZE_CLASS_COUNT - 1 {
            assert_eq!(class_of(SIZE_CLASSES[i] + 1), Some(i + 1));
        }
    }

    #[test]
    fn test_one_past_the_ladder_is_large() {
        assert_eq!(class_of(MAX_SMALL_SIZE + 1), None);
        assert_eq!(class_of(usize::MAX), None);
    }

    #[test]
    fn test_tiny_requests_take_the_first_class() {
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(15), Some(0));
        assert_eq!(class_of(16), Some(0));
        assert_eq!(class_of(17), Some(1));
    }
}
