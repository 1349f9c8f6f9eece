//! Proptest suite for the curve market engine
//!
//! ## Running Tests
//! - Quick: `cargo test --features fuzz` (default proptest cases)
//! - Deep: `PROPTEST_CASES=1000 cargo test --features fuzz`
//!
//! ## Atomicity Model
//!
//! Every market operation either fully commits or leaves both the market and
//! the ledger untouched; quotes pre-validate the commit-phase arithmetic. The
//! suite exploits this by snapshotting state before each action and asserting
//! bit-equality after any Err.
//!
//! ## Invariant Definitions
//!
//! - Well-formed curve: `f > 0`, `c >= f` (strictly while supply exceeds the
//!   intercept), `p <= t`, ratio parameters ordered
//!   `min_target <= target < target_adjusted <= max_target_adjusted <= 10000`.
//! - Monotonic floor: `f` never decreases, across every operation including
//!   burns (a burn either keeps the floor or strictly raises it).
//! - Conservation: `w` matches the area under the curve at the live supply
//!   within a bounded slack (floor divisions bias the implied area low and
//!   each trade contributes bounded dust).

#![cfg(feature = "fuzz")]

use curvemarket::curve::{AdjustOptions, FeeOptions, MarketOptions};
use curvemarket::fixed::{BPS_SCALE, SCALE};
use curvemarket::{Market, MemoryLedger, StableMeta, TableRegistry, TokenId, TokenLedger};
use proptest::prelude::*;

const USD: TokenId = [1; 32];
const DEV: [u8; 32] = [9; 32];
const TRADER: [u8; 32] = [11; 32];

// ============================================================================
// FIXTURE
// ============================================================================

fn registry() -> TableRegistry {
    let mut reg = TableRegistry::new();
    reg.approve(
        USD,
        StableMeta {
            decimals: 18,
            buy_enabled: true,
            sell_enabled: true,
        },
    );
    reg
}

fn started_market(buy_fee_bps: u32, sell_fee_bps: u32) -> (Market, MemoryLedger, TableRegistry) {
    let reg = registry();
    let mut ledger = MemoryLedger::new();
    let mut market = Market::new(
        DEV,
        MarketOptions {
            slope: SCALE,
            target: 100,
            target_adjusted: 200,
        },
        AdjustOptions {
            min_target: 50,
            max_target_adjusted: 1_000,
            raise_step: 10,
            lower_step: 10,
            lower_interval: 3_600,
        },
        FeeOptions {
            buy_fee_bps,
            sell_fee_bps,
        },
    )
    .unwrap();
    market
        .startup(
            &mut ledger,
            &reg,
            &USD,
            1_000 * SCALE,
            1_000_000 * SCALE,
            &TRADER,
            0,
        )
        .unwrap();
    (market, ledger, reg)
}

// ============================================================================
// INVARIANT HELPERS
// ============================================================================

/// Assert all structural invariants. PURE: does not mutate the market.
fn assert_invariants(market: &Market, ledger: &MemoryLedger, ops: u128, context: &str) {
    let curve = market.curve();
    let ratio = market.ratio();
    let t = ledger.total_supply();

    check(!curve.floor_price.is_zero(), context, "floor is zero");
    check(curve.price >= curve.floor_price, context, "price below floor");
    if t > curve.floor_supply.get() {
        check(
            curve.price > curve.floor_price,
            context,
            "sloped region but price == floor",
        );
    }
    check(curve.floor_supply.get() <= t, context, "intercept beyond supply");
    check(
        ratio.min_target <= ratio.target
            && ratio.target < ratio.target_adjusted
            && ratio.target_adjusted <= ratio.max_target_adjusted
            && ratio.max_target_adjusted as u128 <= BPS_SCALE,
        context,
        "ratio ordering violated",
    );

    let slack = t / SCALE + ops * 256 + 256;
    check(
        market.engine().check_conservation(t, slack),
        context,
        "conservation violated",
    );
}

fn check(cond: bool, context: &str, msg: &str) {
    assert!(cond, "{}: {}", context, msg);
}

// ============================================================================
// ACTION-BASED STATE MACHINE
// ============================================================================

#[derive(Clone, Copy, Debug)]
enum Action {
    Buy { worth: u128 },
    SellBps { bps: u32 },
    Realize { amount: u128 },
    Burn { amount: u128 },
    Lower,
    Wait { dt: u64 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1u128..200_000).prop_map(|m| Action::Buy {
            worth: m * (SCALE / 1_000)
        }),
        (1u32..10_000).prop_map(|bps| Action::SellBps { bps }),
        (1u128..5_000).prop_map(|m| Action::Realize {
            amount: m * (SCALE / 1_000)
        }),
        (1u128..2_000).prop_map(|m| Action::Burn {
            amount: m * (SCALE / 1_000)
        }),
        Just(Action::Lower),
        (1u64..50_000).prop_map(|dt| Action::Wait { dt }),
    ]
}

proptest! {
    /// Adversarial trade sequences: every action either commits atomically
    /// (invariants re-checked) or leaves market and ledger bit-identical.
    /// The floor never regresses, burns included.
    #[test]
    fn market_survives_adversarial_sequences(
        actions in prop::collection::vec(action_strategy(), 1..60),
        buy_fee in 0u32..500,
        sell_fee in 0u32..500,
    ) {
        let (mut market, mut ledger, reg) = started_market(buy_fee, sell_fee);
        let mut now = 1u64;
        let mut ops = 1u128;
        let mut last_floor = market.curve().floor_price.get();

        for (i, action) in actions.iter().enumerate() {
            let market_before = market.clone();
            let ledger_before = ledger.clone();
            let context = format!("action {} ({:?})", i, action);

            let outcome: Result<(), curvemarket::MarketError> = match *action {
                Action::Buy { worth } => market
                    .buy(&mut ledger, &reg, &USD, worth, 0, &TRADER, now)
                    .map(|_| ()),
                Action::SellBps { bps } => {
                    let balance = ledger.balance_of(&TRADER);
                    let amount = (balance / BPS_SCALE) * bps as u128;
                    if amount == 0 {
                        continue;
                    }
                    market
                        .sell(&mut ledger, &reg, amount, &USD, 0, &TRADER, now)
                        .map(|_| ())
                }
                Action::Realize { amount } => {
                    ledger.credit_voucher(&TRADER, amount);
                    market
                        .realize(&mut ledger, &reg, amount, &USD, u128::MAX, &TRADER, now)
                        .map(|_| ())
                }
                Action::Burn { amount } => market.burn(&mut ledger, amount, &TRADER, now),
                Action::Lower => market.lower_and_adjust(&ledger, now),
                Action::Wait { dt } => {
                    now += dt;
                    continue;
                }
            };
            ops += 1;

            match outcome {
                Ok(()) => {
                    assert_invariants(&market, &ledger, ops, &context);
                    let floor = market.curve().floor_price.get();
                    prop_assert!(
                        floor >= last_floor,
                        "{}: floor regressed {} -> {}",
                        context,
                        last_floor,
                        floor
                    );
                    last_floor = floor;
                }
                Err(_) => {
                    // Rejected operations must leave no partial effects. The
                    // realize path pre-credits a voucher, which is external
                    // to the market and intentionally survives the failure.
                    prop_assert!(market == market_before, "{}: market mutated on Err", context);
                    prop_assert!(
                        ledger.total_supply() == ledger_before.total_supply()
                            && ledger.balance_of(&TRADER) == ledger_before.balance_of(&TRADER)
                            && ledger.balance_of(&DEV) == ledger_before.balance_of(&DEV),
                        "{}: ledger mutated on Err",
                        context
                    );
                }
            }
        }
    }

    /// Quote/apply agreement under arbitrary state: an immediately applied
    /// buy always produces exactly the quoted amount, fee, and price move.
    #[test]
    fn quote_buy_always_matches_apply(
        setup_worth in 1u128..100_000,
        worth in 1u128..100_000,
        buy_fee in 0u32..500,
    ) {
        let (mut market, mut ledger, reg) = started_market(buy_fee, 0);
        // Random prior state via one setup trade.
        let _ = market.buy(&mut ledger, &reg, &USD, setup_worth * (SCALE / 100), 0, &TRADER, 1);

        let quoted = market.quote_buy(&reg, &USD, worth * (SCALE / 100));
        let applied = market.buy(&mut ledger, &reg, &USD, worth * (SCALE / 100), 0, &TRADER, 2);
        match (quoted, applied) {
            (Ok(q), Ok((amount, fee))) => {
                prop_assert_eq!(q.amount, amount);
                prop_assert_eq!(q.fee, fee);
            }
            (Err(qe), Err(ae)) => prop_assert_eq!(qe, ae),
            (q, a) => prop_assert!(false, "quote {:?} disagrees with apply {:?}", q, a),
        }
    }

    /// Selling exactly the sloped width lands on the floor and resets the
    /// intercept, at any prior state the market can reach (the exact-boundary
    /// case of the sell segmentation).
    #[test]
    fn selling_exact_slope_width_lands_on_floor(
        setup_worth in 1u128..50_000,
    ) {
        let (mut market, mut ledger, reg) = started_market(0, 0);
        let _ = market.buy(&mut ledger, &reg, &USD, setup_worth * (SCALE / 100), 0, &TRADER, 1);

        let t = ledger.total_supply();
        let available = t - market.curve().floor_supply.get();
        prop_assume!(available > 0 && available <= ledger.balance_of(&TRADER));

        let f = market.curve().floor_price.get();
        market.sell(&mut ledger, &reg, available, &USD, 0, &TRADER, 2).unwrap();

        prop_assert_eq!(market.curve().price.get(), f);
        prop_assert_eq!(market.curve().floor_supply.get(), ledger.total_supply());
    }
}

// ============================================================================
// MATH PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn mul_div_brackets_the_exact_quotient(x in any::<u128>(), y in any::<u128>(), d in 1u128..) {
        use curvemarket::fixed::{mul_div_ceil, mul_div_floor};
        if let (Ok(lo), Ok(hi)) = (mul_div_floor(x, y, d), mul_div_ceil(x, y, d)) {
            prop_assert!(lo <= hi);
            prop_assert!(hi - lo <= 1);
        }
    }

    #[test]
    fn sqrt_is_exact_floor(y in any::<u128>()) {
        use curvemarket::fixed::{sqrt_u256, U256};
        let r = sqrt_u256(U256::from(y));
        prop_assert!(r * r <= U256::from(y));
        let r1 = r + U256::one();
        prop_assert!(r1 * r1 > U256::from(y));
    }

    #[test]
    fn decimal_conversion_round_trips_when_widening(value in any::<u64>(), src in 0u8..=18) {
        use curvemarket::fixed::convert_decimals;
        // Widening then narrowing is the identity.
        let wide = convert_decimals(value as u128, src, 18).unwrap();
        prop_assert_eq!(convert_decimals(wide, 18, src).unwrap(), value as u128);
    }
}
