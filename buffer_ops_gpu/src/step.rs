/// Iterator over a geometric sequence of strides.
///
/// A work-efficient tree scan walks the lanes of a group twice: the up-sweep
/// doubles its stride from 1 until it reaches the lane count, the down-sweep
/// halves it back down to 1.
#[derive(Debug, Clone, Copy)]
pub struct Strides {
    next: usize,
    lanes: usize,
    doubling: bool,
}

impl Iterator for Strides {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let stride = self.next;
        if self.doubling {
            if stride >= self.lanes {
                return None;
            }
            self.next *= 2;
        } else {
            if stride == 0 {
                return None;
            }
            self.next /= 2;
        }
        Some(stride)
    }
}

/// Strides of the reduction phase: 1, 2, 4, ... while below `lanes`.
pub fn up_sweep(lanes: usize) -> Strides {
    Strides {
        next: 1,
        lanes,
        doubling: true,
    }
}

/// Strides of the distribution phase: `lanes / 2`, ..., 2, 1.
pub fn down_sweep(lanes: usize) -> Strides {
    Strides {
        next: lanes / 2,
        lanes,
        doubling: false,
    }
}

#[cfg(all(test, not(target_os = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn up_sweep_doubles_below_lane_count() {
        let strides: Vec<usize> = up_sweep(16).collect();
        assert_eq!(strides, vec![1, 2, 4, 8]);
    }

    #[test]
    fn down_sweep_halves_to_one() {
        let strides: Vec<usize> = down_sweep(16).collect();
        assert_eq!(strides, vec![8, 4, 2, 1]);
    }

    #[test]
    fn single_lane_has_no_strides() {
        assert_eq!(up_sweep(1).count(), 0);
        assert_eq!(down_sweep(1).count(), 0);
    }
}
