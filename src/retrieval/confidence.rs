//! Confidence tiers, derived per query and never stored.

use crate::types::{ConfidenceTier, Source};

/// Access count above which a verified file chunk is considered well established.
pub const ESTABLISHED_ACCESS_COUNT: u32 = 5;

/// Derive the tier for one result.
///
/// Unverified chunks are always `None`. Verified chunks get a base tier from their
/// source (user-stated facts are `High`; file chunks become `High` once they have been
/// verified more than [`ESTABLISHED_ACCESS_COUNT`] times), capped by any declared
/// front-matter confidence, and lowered one step when the query ran lexical-only.
pub fn derive_tier(
    verified: bool,
    source: Source,
    access_count: u32,
    declared: Option<ConfidenceTier>,
    degraded: bool,
) -> ConfidenceTier {
    if !verified {
        return ConfidenceTier::None;
    }
    let base = match source {
        Source::UserStated => ConfidenceTier::High,
        Source::File if access_count > ESTABLISHED_ACCESS_COUNT => ConfidenceTier::High,
        Source::File => ConfidenceTier::Medium,
        Source::WebSearch | Source::HeartbeatDiscovery => ConfidenceTier::Medium,
    };
    let capped = declared.map_or(base, |cap| base.min(cap));
    if degraded {
        capped.lowered()
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unverified_is_always_none() {
        assert_eq!(
            derive_tier(false, Source::UserStated, 100, None, false),
            ConfidenceTier::None
        );
    }

    #[test]
    fn base_tiers_by_source() {
        assert_eq!(derive_tier(true, Source::UserStated, 0, None, false), ConfidenceTier::High);
        assert_eq!(derive_tier(true, Source::File, 0, None, false), ConfidenceTier::Medium);
        assert_eq!(derive_tier(true, Source::File, 6, None, false), ConfidenceTier::High);
        assert_eq!(derive_tier(true, Source::WebSearch, 50, None, false), ConfidenceTier::Medium);
        assert_eq!(
            derive_tier(true, Source::HeartbeatDiscovery, 0, None, false),
            ConfidenceTier::Medium
        );
    }

    #[test]
    fn declared_confidence_caps_but_never_raises() {
        assert_eq!(
            derive_tier(true, Source::UserStated, 0, Some(ConfidenceTier::Low), false),
            ConfidenceTier::Low
        );
        assert_eq!(
            derive_tier(true, Source::WebSearch, 0, Some(ConfidenceTier::High), false),
            ConfidenceTier::Medium
        );
    }

    #[test]
    fn degraded_lowers_one_step() {
        assert_eq!(derive_tier(true, Source::UserStated, 0, None, true), ConfidenceTier::Medium);
        assert_eq!(derive_tier(true, Source::File, 0, None, true), ConfidenceTier::Low);
    }
}
