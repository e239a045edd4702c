//! Majority arithmetic.

/// The number of members which constitutes a majority of the given group size.
pub fn majority_of(len: usize) -> usize {
    len / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_of() {
        assert_eq!(1, majority_of(1));
        assert_eq!(2, majority_of(2));
        assert_eq!(2, majority_of(3));
        assert_eq!(3, majority_of(4));
        assert_eq!(3, majority_of(5));
    }
}
