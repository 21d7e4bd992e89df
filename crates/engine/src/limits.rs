use crate::error::{ErrorKind, Result};

/// Capacity limits of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of slots in the cache store.
    pub max_cache: usize,
    /// Maximum number of entries awaiting upload.
    pub max_pending: usize,
    /// Length of the recently-mounted queue.
    pub max_recent: usize,
    /// Most mounted ids the live fetcher downloads per pass.
    pub max_mounted: usize,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            max_cache: 64,
            max_pending: 64,
            max_recent: 16,
            max_mounted: 16,
        }
    }
}
impl Limits {
    pub fn validate(&self) -> Result<()> {
        if self.max_cache == 0 {
            exn::bail!(ErrorKind::InvalidLimits("max_cache must be at least 1"));
        }
        if self.max_recent > self.max_cache {
            exn::bail!(ErrorKind::InvalidLimits("max_recent cannot exceed max_cache"));
        }
        Ok(())
    }

    /// Most candidates one refresh pass may fetch, leaving headroom for
    /// pending content to be promoted.
    pub fn refresh_budget(&self) -> usize {
        (self.max_cache * 3 / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1)]
    #[case(2, 1)]
    #[case(4, 3)]
    #[case(64, 48)]
    fn test_refresh_budget(#[case] max_cache: usize, #[case] expected: usize) {
        let limits = Limits {
            max_cache,
            max_recent: 0,
            ..Limits::default()
        };
        assert_eq!(limits.refresh_budget(), expected);
    }

    #[test]
    fn test_validate() {
        assert!(Limits::default().validate().is_ok());
        let err = Limits {
            max_cache: 0,
            max_recent: 0,
            ..Limits::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidLimits(_)));
        let err = Limits {
            max_cache: 4,
            max_recent: 5,
            ..Limits::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidLimits(_)));
    }
}
