//! Risk gate - stateless per-order checks.
//!
//! Every check returns [`RiskFlags::SUCCESS`] or exactly one [`RiskFlag`].
//! Callers union the results, so a blocked order reports every rule it broke.

use rand::Rng;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use tracing::warn;

use crate::core::{OrderLimits, Side, StratMode};

/// Named failure kinds. Each maps to its own bit in [`RiskFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RiskFlag {
    MinNotional,
    MaxNotional,
    MaxQty,
    PositionUnavailable,
    UnackedLeg,
    KillSwitch,
    SendFailed,
}

impl RiskFlag {
    pub const ALL: [RiskFlag; 7] = [
        RiskFlag::MinNotional,
        RiskFlag::MaxNotional,
        RiskFlag::MaxQty,
        RiskFlag::PositionUnavailable,
        RiskFlag::UnackedLeg,
        RiskFlag::KillSwitch,
        RiskFlag::SendFailed,
    ];

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RiskFlag::MinNotional => "MIN_NOTIONAL_FAIL",
            RiskFlag::MaxNotional => "MAX_NOTIONAL_FAIL",
            RiskFlag::MaxQty => "MAX_QTY_FAIL",
            RiskFlag::PositionUnavailable => "POSITION_UNAVAILABLE",
            RiskFlag::UnackedLeg => "UNACKED_LEG",
            RiskFlag::KillSwitch => "KILL_SWITCH",
            RiskFlag::SendFailed => "SEND_FAILED",
        }
    }
}

/// Union of failed checks; empty means every check passed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RiskFlags(u32);

impl RiskFlags {
    pub const SUCCESS: RiskFlags = RiskFlags(0);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, flag: RiskFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn insert(&mut self, flag: RiskFlag) {
        self.0 |= flag.bit();
    }

    pub fn iter(&self) -> impl Iterator<Item = RiskFlag> + '_ {
        RiskFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.is_success()
    }
}

impl From<RiskFlag> for RiskFlags {
    fn from(flag: RiskFlag) -> Self {
        RiskFlags(flag.bit())
    }
}

impl BitOr for RiskFlags {
    type Output = RiskFlags;
    fn bitor(self, rhs: RiskFlags) -> RiskFlags {
        RiskFlags(self.0 | rhs.0)
    }
}

impl BitOr<RiskFlag> for RiskFlags {
    type Output = RiskFlags;
    fn bitor(self, rhs: RiskFlag) -> RiskFlags {
        self | RiskFlags::from(rhs)
    }
}

impl BitOrAssign for RiskFlags {
    fn bitor_assign(&mut self, rhs: RiskFlags) {
        self.0 |= rhs.0;
    }
}

impl BitOrAssign<RiskFlag> for RiskFlags {
    fn bitor_assign(&mut self, rhs: RiskFlag) {
        self.insert(rhs);
    }
}

impl fmt::Display for RiskFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "SUCCESS");
        }
        let names: Vec<&str> = self.iter().map(|flag| flag.name()).collect();
        write!(f, "{}", names.join("|"))
    }
}

impl fmt::Debug for RiskFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RiskFlags({})", self)
    }
}

/// Key carried by every risk log line.
pub fn symbol_side_key(symbol: &str, side: Side) -> String {
    format!("%%symbol-side={}-{}%%", symbol, side)
}

pub fn check_min_chore_notional_normal(
    limits: &OrderLimits,
    notional: f64,
    symbol: &str,
    side: Side,
) -> RiskFlags {
    if notional < limits.min_chore_notional {
        warn!(
            "blocked {} order, chore notional: {:.2} < min_chore_notional: {:.2}, {}",
            side,
            notional,
            limits.min_chore_notional,
            symbol_side_key(symbol, side)
        );
        return RiskFlag::MinNotional.into();
    }
    RiskFlags::SUCCESS
}

/// Threshold drawn uniformly from `[min, min + allowance]`.
pub fn relaxed_min_notional_threshold<R: Rng>(limits: &OrderLimits, rng: &mut R) -> f64 {
    let low = limits.min_chore_notional;
    let high = low + limits.min_chore_notional_allowance.max(0.0);
    if !(low.is_finite() && high.is_finite()) {
        return low;
    }
    rng.random_range(low..=high)
}

/// Resamples its threshold on every call, so the same order can pass once and
/// fail the next time.
pub fn check_min_chore_notional_relaxed<R: Rng>(
    limits: &OrderLimits,
    notional: f64,
    symbol: &str,
    side: Side,
    rng: &mut R,
) -> RiskFlags {
    let threshold = relaxed_min_notional_threshold(limits, rng);
    if notional < threshold {
        warn!(
            "blocked {} order, chore notional: {:.2} < relaxed min_chore_notional: {:.2} \
             (min_chore_notional: {:.2}, allowance: {:.2}), {}",
            side,
            notional,
            threshold,
            limits.min_chore_notional,
            limits.min_chore_notional_allowance,
            symbol_side_key(symbol, side)
        );
        return RiskFlag::MinNotional.into();
    }
    RiskFlags::SUCCESS
}

// TODO: aggressive mode has no threshold rule of its own yet; it gates
// exactly like normal until one is defined.
pub fn check_min_chore_notional_aggressive(
    limits: &OrderLimits,
    notional: f64,
    symbol: &str,
    side: Side,
) -> RiskFlags {
    check_min_chore_notional_normal(limits, notional, symbol, side)
}

pub fn check_min_chore_notional<R: Rng>(
    mode: StratMode,
    limits: &OrderLimits,
    notional: f64,
    symbol: &str,
    side: Side,
    rng: &mut R,
) -> RiskFlags {
    match mode {
        StratMode::Normal => check_min_chore_notional_normal(limits, notional, symbol, side),
        StratMode::Relaxed => check_min_chore_notional_relaxed(limits, notional, symbol, side, rng),
        StratMode::Aggressive => check_min_chore_notional_aggressive(limits, notional, symbol, side),
    }
}

pub fn check_max_chore_notional(
    limits: &OrderLimits,
    notional: f64,
    symbol: &str,
    side: Side,
) -> RiskFlags {
    if notional > limits.max_chore_notional {
        warn!(
            "blocked {} order, chore notional: {:.2} > max_chore_notional: {:.2}, {}",
            side,
            notional,
            limits.max_chore_notional,
            symbol_side_key(symbol, side)
        );
        return RiskFlag::MaxNotional.into();
    }
    RiskFlags::SUCCESS
}

pub fn check_max_chore_qty(limits: &OrderLimits, qty: u64, symbol: &str, side: Side) -> RiskFlags {
    if qty > limits.max_chore_qty {
        warn!(
            "blocked {} order, chore qty: {} > max_chore_qty: {}, {}",
            side,
            qty,
            limits.max_chore_qty,
            symbol_side_key(symbol, side)
        );
        return RiskFlag::MaxQty.into();
    }
    RiskFlags::SUCCESS
}

/// Run every order check and union the failures.
pub fn check_order<R: Rng>(
    mode: StratMode,
    limits: &OrderLimits,
    px: f64,
    qty: u64,
    symbol: &str,
    side: Side,
    rng: &mut R,
) -> RiskFlags {
    let notional = px * qty as f64;
    check_min_chore_notional(mode, limits, notional, symbol, side, rng)
        | check_max_chore_notional(limits, notional, symbol, side)
        | check_max_chore_qty(limits, qty, symbol, side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::capture_logs;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn limits(min: f64) -> OrderLimits {
        OrderLimits {
            min_chore_notional: min,
            max_chore_notional: 100_000.0,
            min_chore_notional_allowance: 500.0,
            max_chore_qty: 5_000,
        }
    }

    #[test]
    fn test_normal_min_notional_boundary() {
        let l = limits(2000.0);
        assert_eq!(
            check_min_chore_notional_normal(&l, 1999.99, "SYM", Side::Buy),
            RiskFlags::from(RiskFlag::MinNotional)
        );
        assert!(check_min_chore_notional_normal(&l, 2000.0, "SYM", Side::Buy).is_success());
    }

    #[test]
    fn test_scenario_price_raise_clears_gate() {
        let l = limits(2000.0);
        let mut rng = StdRng::seed_from_u64(7);
        let blocked = check_min_chore_notional(StratMode::Normal, &l, 10.0 * 100.0, "SYM", Side::Buy, &mut rng);
        assert!(blocked.contains(RiskFlag::MinNotional));
        let passed = check_min_chore_notional(StratMode::Normal, &l, 25.0 * 100.0, "SYM", Side::Buy, &mut rng);
        assert_eq!(passed, RiskFlags::SUCCESS);
    }

    #[test]
    fn test_aggressive_matches_normal() {
        let l = limits(2000.0);
        let mut rng = StdRng::seed_from_u64(1);
        for notional in [0.0, 1999.0, 2000.0, 2500.0] {
            assert_eq!(
                check_min_chore_notional(StratMode::Aggressive, &l, notional, "S", Side::Sell, &mut rng),
                check_min_chore_notional_normal(&l, notional, "S", Side::Sell)
            );
        }
    }

    #[test]
    fn test_relaxed_decides_by_band() {
        let l = limits(2000.0);
        let mut rng = StdRng::seed_from_u64(3);
        // below the band always fails, above always passes
        assert!(!check_min_chore_notional_relaxed(&l, 1999.0, "S", Side::Buy, &mut rng).is_success());
        assert!(check_min_chore_notional_relaxed(&l, 2500.0, "S", Side::Buy, &mut rng).is_success());
    }

    #[test]
    fn test_max_checks() {
        let l = limits(0.0);
        assert_eq!(
            check_max_chore_notional(&l, 100_000.01, "S", Side::Buy),
            RiskFlags::from(RiskFlag::MaxNotional)
        );
        assert!(check_max_chore_notional(&l, 100_000.0, "S", Side::Buy).is_success());
        assert_eq!(check_max_chore_qty(&l, 5_001, "S", Side::Buy), RiskFlags::from(RiskFlag::MaxQty));
        assert!(check_max_chore_qty(&l, 5_000, "S", Side::Buy).is_success());
    }

    #[test]
    fn test_failures_are_not_exclusive() {
        let l = OrderLimits {
            min_chore_notional: 2000.0,
            max_chore_notional: 100_000.0,
            min_chore_notional_allowance: 0.0,
            max_chore_qty: 50,
        };
        let mut rng = StdRng::seed_from_u64(0);
        // 100 @ 1.0: below min notional and above max qty at once
        let flags = check_order(StratMode::Normal, &l, 1.0, 100, "S", Side::Sell, &mut rng);
        assert!(flags.contains(RiskFlag::MinNotional));
        assert!(flags.contains(RiskFlag::MaxQty));
        assert!(!flags.contains(RiskFlag::MaxNotional));
        assert_eq!(flags.len(), 2);
        assert_eq!(flags.to_string(), "MIN_NOTIONAL_FAIL|MAX_QTY_FAIL");
    }

    #[test]
    fn test_flag_bits_distinct() {
        let mut all = RiskFlags::SUCCESS;
        for flag in RiskFlag::ALL {
            assert!(!all.contains(flag));
            all |= flag;
        }
        assert_eq!(all.len(), RiskFlag::ALL.len());
        assert_eq!(RiskFlags::SUCCESS.to_string(), "SUCCESS");
    }

    #[test]
    fn test_failure_log_format() {
        let (_guard, logs) = capture_logs();
        check_min_chore_notional_normal(&limits(2000.0), 1000.0, "EQT_SEC_1", Side::Buy);
        let out = logs.contents();
        assert!(out.contains("blocked BUY order, chore notional: 1000.00 < min_chore_notional: 2000.00"));
        assert!(out.contains("%%symbol-side=EQT_SEC_1-BUY%%"));
    }

    proptest! {
        #[test]
        fn relaxed_threshold_stays_in_band(
            seed in any::<u64>(),
            min in 0.0f64..1_000_000.0,
            allowance in 0.0f64..100_000.0,
        ) {
            let l = OrderLimits {
                min_chore_notional: min,
                min_chore_notional_allowance: allowance,
                ..OrderLimits::default()
            };
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..32 {
                let t = relaxed_min_notional_threshold(&l, &mut rng);
                prop_assert!(t >= min && t <= min + allowance);
            }
        }
    }
}
