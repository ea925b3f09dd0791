//! bTag generation
//!
//! Every USBTMC bulk transfer carries a per-transaction identifier (bTag)
//! together with its bitwise complement. The device echoes the bTag in the
//! matching bulk-IN response, which is how replies are correlated with
//! requests. Zero is reserved, so valid bTags live in [1, 255].

/// Monotonic bTag counter constrained to [1, 255]
///
/// Wraps from 255 back to 1, skipping the reserved value 0.
#[derive(Debug, Clone)]
pub struct BTagGenerator {
    last: u8,
}

impl BTagGenerator {
    /// Create a generator whose first value will be 1
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Produce the next bTag
    pub fn next(&mut self) -> u8 {
        self.last = self.last.checked_add(1).unwrap_or(1);
        if self.last == 0 {
            self.last = 1;
        }
        self.last
    }

    /// The most recently produced bTag, or None before the first call
    pub fn current(&self) -> Option<u8> {
        if self.last == 0 {
            None
        } else {
            Some(self.last)
        }
    }
}

impl Default for BTagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitwise complement of a bTag, sent alongside it in every bulk header
pub fn btag_inverse(btag: u8) -> u8 {
    !btag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_btag_is_one() {
        let mut gen = BTagGenerator::new();
        assert_eq!(gen.current(), None);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.current(), Some(1));
    }

    #[test]
    fn test_wraps_from_255_to_1() {
        let mut gen = BTagGenerator::new();
        let mut last = 0u8;
        // Walk two full cycles; zero must never appear.
        for _ in 0..510 {
            last = gen.next();
            assert_ne!(last, 0);
        }
        assert_eq!(last, 255);
        assert_eq!(gen.next(), 1);
    }

    #[test]
    fn test_inverse_is_bitwise_complement() {
        let mut gen = BTagGenerator::new();
        for _ in 0..300 {
            let btag = gen.next();
            assert_eq!(btag_inverse(btag), !btag);
            assert_eq!(btag_inverse(btag_inverse(btag)), btag);
        }
    }
}
