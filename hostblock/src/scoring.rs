//! Scoring engine.
//!
//! Keeps the decaying per-address activity score up to date and owns the
//! single block predicate that decides whether a firewall rule is
//! required for an address at a given instant.
//!
//! With a multiplier configured the score doubles as "seconds of
//! remaining block time": it decays linearly with wall-clock time and
//! every match is amplified by the multiplier before being added.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::store::{BlacklistEntry, IpState};

/// Parameters the engine needs from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
    pub score_to_block: u32,
    pub multiplier: u32,
    /// Remote blacklist confidence needed before an entry gets a rule.
    pub reputation_block_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Suspicious,
    Refused,
}

/// Result of feeding one match into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    /// A record was created rather than updated.
    pub created: bool,
}

impl ScoringParams {
    /// Seconds of grace at the start of a score window (multiplier mode).
    fn grace(&self) -> u64 {
        self.score_to_block as u64 * self.multiplier as u64
    }
}

/// Feed one pattern match into the address table.
///
/// Suspicious matches create a record on first sight. Refused matches only
/// apply to addresses that are already known, either in the address table
/// or on the remote blacklist; an isolated refused event is dropped.
pub fn apply_match(
    ips: &mut BTreeMap<String, IpState>,
    blacklist: &BTreeMap<String, BlacklistEntry>,
    params: &ScoringParams,
    address: &str,
    kind: MatchKind,
    score: u32,
    now: u64,
) -> Option<MatchOutcome> {
    if let Some(state) = ips.get_mut(address) {
        if params.multiplier > 0 && state.activity_score > 0 {
            let elapsed = now.saturating_sub(state.last_activity);
            state.activity_score = decayed(state.activity_score, elapsed);
        }
        state.activity_score = state.activity_score.saturating_add(amplified(score, params));
        state.last_activity = now;
        match kind {
            MatchKind::Suspicious => {
                state.activity_count = state.activity_count.saturating_add(1);
            }
            MatchKind::Refused => {
                state.refused_count = state.refused_count.saturating_add(1);
            }
        }
        debug!(
            address,
            score = state.activity_score,
            count = state.activity_count,
            refused = state.refused_count,
            "activity updated"
        );
        return Some(MatchOutcome { created: false });
    }

    if kind == MatchKind::Refused && !blacklist.contains_key(address) {
        warn!("refused connection from unknown address {address}, dropped");
        return None;
    }

    let state = IpState {
        last_activity: now,
        activity_score: amplified(score, params),
        activity_count: if kind == MatchKind::Suspicious { 1 } else { 0 },
        refused_count: if kind == MatchKind::Refused { 1 } else { 0 },
        ..Default::default()
    };
    debug!(address, score = state.activity_score, "first activity");
    ips.insert(address.to_string(), state);
    Some(MatchOutcome { created: true })
}

/// The block predicate: does this address require a firewall rule right now?
pub fn requires_rule(state: &IpState, params: &ScoringParams, now: u64) -> bool {
    if state.whitelisted {
        return false;
    }
    if state.blacklisted {
        return true;
    }
    if params.multiplier > 0 {
        let window_end = state.last_activity.saturating_add(state.activity_score as u64);
        let grace = params.grace();
        state.activity_score > 0 && window_end > grace && now < window_end - grace
    } else {
        state.activity_score >= params.score_to_block
    }
}

/// The expiry predicate: should an installed rule be withdrawn?
///
/// Without a multiplier a rule stays until the score is reset to zero.
pub fn rule_expired(state: &IpState, params: &ScoringParams, now: u64) -> bool {
    if state.blacklisted {
        return false;
    }
    if state.whitelisted {
        return true;
    }
    if params.multiplier > 0 {
        now > state.last_activity.saturating_add(state.activity_score as u64)
    } else {
        state.activity_score == 0
    }
}

/// Rule decision for a remote blacklist entry.
pub fn blacklist_requires_rule(entry: &BlacklistEntry, params: &ScoringParams) -> bool {
    entry.confidence_score >= params.reputation_block_score
}

fn amplified(score: u32, params: &ScoringParams) -> u32 {
    if params.multiplier > 0 {
        score.saturating_mul(params.multiplier)
    } else {
        score
    }
}

fn decayed(score: u32, elapsed: u64) -> u32 {
    if elapsed >= score as u64 {
        0
    } else {
        score - elapsed as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(score_to_block: u32, multiplier: u32) -> ScoringParams {
        ScoringParams {
            score_to_block,
            multiplier,
            reputation_block_score: 90,
        }
    }

    fn suspicious(
        ips: &mut BTreeMap<String, IpState>,
        params: &ScoringParams,
        addr: &str,
        score: u32,
        now: u64,
    ) -> Option<MatchOutcome> {
        let blacklist = BTreeMap::new();
        apply_match(ips, &blacklist, params, addr, MatchKind::Suspicious, score, now)
    }

    #[test]
    fn test_first_match_creates_record() {
        let mut ips = BTreeMap::new();
        let p = params(10, 3600);
        let outcome = suspicious(&mut ips, &p, "203.0.113.7", 4, 1000).unwrap();
        assert!(outcome.created);
        let state = &ips["203.0.113.7"];
        assert_eq!(state.activity_score, 4 * 3600);
        assert_eq!(state.activity_count, 1);
        assert_eq!(state.refused_count, 0);
    }

    #[test]
    fn test_saturating_add_without_multiplier() {
        // Overflow saturates at the word-size maximum.
        let mut ips = BTreeMap::new();
        let p = params(10, 0);
        suspicious(&mut ips, &p, "10.0.0.1", u32::MAX - 5, 1000);
        suspicious(&mut ips, &p, "10.0.0.1", 100, 1000);
        assert_eq!(ips["10.0.0.1"].activity_score, u32::MAX);
    }

    #[test]
    fn test_repeated_matches_accumulate_with_multiplier() {
        // N matches of raw score 1 at the same instant yield N * M.
        let mut ips = BTreeMap::new();
        let p = params(10, 3600);
        for _ in 0..5 {
            suspicious(&mut ips, &p, "10.0.0.2", 1, 500);
        }
        assert_eq!(ips["10.0.0.2"].activity_score, 5 * 3600);
    }

    #[test]
    fn test_score_decays_between_matches() {
        let mut ips = BTreeMap::new();
        let p = params(10, 3600);
        suspicious(&mut ips, &p, "10.0.0.3", 1, 1000);
        // 600 seconds later the stored 3600 decays to 3000 before the new
        // 3600 is added.
        suspicious(&mut ips, &p, "10.0.0.3", 1, 1600);
        assert_eq!(ips["10.0.0.3"].activity_score, 3000 + 3600);
    }

    #[test]
    fn test_decay_bottoms_out_at_zero() {
        let mut ips = BTreeMap::new();
        let p = params(10, 2);
        suspicious(&mut ips, &p, "10.0.0.4", 1, 1000);
        suspicious(&mut ips, &p, "10.0.0.4", 1, 1000 + 100_000);
        assert_eq!(ips["10.0.0.4"].activity_score, 2);
    }

    #[test]
    fn test_refused_match_on_unknown_address_is_dropped() {
        let mut ips = BTreeMap::new();
        let blacklist = BTreeMap::new();
        let p = params(10, 3600);
        let outcome = apply_match(
            &mut ips,
            &blacklist,
            &p,
            "10.9.9.9",
            MatchKind::Refused,
            1,
            1000,
        );
        assert!(outcome.is_none());
        assert!(ips.is_empty());
    }

    #[test]
    fn test_refused_match_on_blacklisted_address_creates_record() {
        let mut ips = BTreeMap::new();
        let mut blacklist = BTreeMap::new();
        blacklist.insert(
            "10.9.9.9".to_string(),
            BlacklistEntry {
                total_reports: 10,
                confidence_score: 95,
                has_rule: false,
            },
        );
        let p = params(10, 3600);
        let outcome = apply_match(
            &mut ips,
            &blacklist,
            &p,
            "10.9.9.9",
            MatchKind::Refused,
            1,
            1000,
        )
        .unwrap();
        assert!(outcome.created);
        assert_eq!(ips["10.9.9.9"].refused_count, 1);
        assert_eq!(ips["10.9.9.9"].activity_count, 0);
    }

    #[test]
    fn test_block_predicate_with_multiplier() {
        // S=10, M=3600, three matches of score 4 at t, t+1, t+2.
        let mut ips = BTreeMap::new();
        let p = params(10, 3600);
        let t = 100_000;
        suspicious(&mut ips, &p, "203.0.113.7", 4, t);
        suspicious(&mut ips, &p, "203.0.113.7", 4, t + 1);
        suspicious(&mut ips, &p, "203.0.113.7", 4, t + 2);
        let state = &ips["203.0.113.7"];
        // Two decay steps of one second each, then three amplified adds.
        assert_eq!(state.activity_score, 3 * 4 * 3600 - 2);
        assert!(requires_rule(state, &p, t + 2));
        // After twelve hours the rule is no longer required.
        assert!(!requires_rule(state, &p, t + 12 * 3600));
    }

    #[test]
    fn test_block_predicate_flip_point() {
        let p = params(10, 3600);
        let state = IpState {
            last_activity: 50_000,
            activity_score: 4 * 3600 * 3,
            ..Default::default()
        };
        let window_end = 50_000 + 4 * 3600 * 3;
        let grace = 10 * 3600;
        assert!(requires_rule(&state, &p, window_end - grace - 1));
        assert!(!requires_rule(&state, &p, window_end - grace));
    }

    #[test]
    fn test_rule_expiry_flip_point_with_multiplier() {
        // An installed rule expires at exactly last_activity + s * M.
        let p = params(2, 3600);
        let state = IpState {
            last_activity: 10_000,
            activity_score: 4 * 3600,
            ..Default::default()
        };
        assert!(!rule_expired(&state, &p, 10_000 + 4 * 3600));
        assert!(rule_expired(&state, &p, 10_000 + 4 * 3600 + 1));
    }

    #[test]
    fn test_rule_expiry_without_multiplier_requires_zero_score() {
        let p = params(10, 0);
        let state = IpState {
            activity_score: 5,
            ..Default::default()
        };
        // Below the block threshold but not zero: the rule stays.
        assert!(!rule_expired(&state, &p, 999_999));
        let state = IpState {
            activity_score: 0,
            ..Default::default()
        };
        assert!(rule_expired(&state, &p, 999_999));
    }

    #[test]
    fn test_whitelist_and_blacklist_override_score() {
        let p = params(10, 0);
        let whitelisted = IpState {
            activity_score: 1_000_000,
            whitelisted: true,
            ..Default::default()
        };
        assert!(!requires_rule(&whitelisted, &p, 0));
        assert!(rule_expired(&whitelisted, &p, 0));
        let blacklisted = IpState {
            activity_score: 0,
            blacklisted: true,
            ..Default::default()
        };
        assert!(requires_rule(&blacklisted, &p, 0));
        assert!(!rule_expired(&blacklisted, &p, 0));
    }

    #[test]
    fn test_blacklist_entry_rule_decision() {
        let p = params(10, 0);
        let strong = BlacklistEntry {
            total_reports: 5,
            confidence_score: 92,
            has_rule: false,
        };
        let weak = BlacklistEntry {
            total_reports: 5,
            confidence_score: 70,
            has_rule: false,
        };
        assert!(blacklist_requires_rule(&strong, &p));
        assert!(!blacklist_requires_rule(&weak, &p));
    }
}
