//! Bonding-curve engine: piecewise-linear price curve with a floor.
//!
//! The engine owns four interdependent scalars — marginal price `c`, floor
//! price `f`, floor-supply intercept `p`, accumulated backing worth `w` —
//! plus the fixed slope constant `k`. Supply at or below `p` trades at `f`;
//! above `p` the marginal price is
//!
//! ```text
//! price(s) = f + (s - p) * 1e18 / k
//! ```
//!
//! so the price rises by one 1e18-unit for every `k` base units of supply
//! above the intercept. Circulating supply `t` is owned by the token ledger
//! and passed into every operation.
//!
//! Guarantees maintained across all successful operations:
//! 1. `c > f >= 0` and `p <= t` (the curve is always well-formed)
//! 2. `f` is non-decreasing over the engine's lifetime
//! 3. `w` moves by exactly the quoted worth of each trade
//! 4. every operation either fully commits or leaves state untouched
//!
//! The engine is pure state + arithmetic: no clock, no logging, no I/O.
//! Callers supply `now` (unix seconds) and must serialize access; two
//! operations must never interleave on one instance.

use crate::fixed::{
    add_u256, div_u256, mul_div_ceil, mul_div_floor, mul_u256, narrow_u256, sqrt_u256, Fixed18,
    MathError, BPS_SCALE, SCALE, U256,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurveError {
    /// Operation requires a started market (`f > 0`).
    NotStarted,

    /// Startup was already performed.
    AlreadyStarted,

    /// Configuration violates the ratio/fee ordering invariants.
    InvalidOptions,

    /// The requested operation resolves to a zero amount or worth.
    ZeroAmount,

    /// The curve has no solution for the requested supply/worth combination.
    Infeasible,

    /// A burn re-solve failed to strictly raise the floor.
    FloorRegression,

    /// Arithmetic overflow detected by a range check.
    Overflow,

    /// Division by zero detected by a range check.
    DivisionByZero,
}

pub type Result<T> = core::result::Result<T, CurveError>;

impl From<MathError> for CurveError {
    fn from(e: MathError) -> Self {
        match e {
            MathError::Overflow => CurveError::Overflow,
            MathError::DivisionByZero => CurveError::DivisionByZero,
        }
    }
}

// ============================================================================
// Core Data Structures
// ============================================================================

/// Curve scalars. All fields are 18-decimal fixed point.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable,
)]
pub struct CurveState {
    /// Current marginal price `c`. Invariant: `c > f` once started.
    pub price: Fixed18,

    /// Floor price `f`. Zero means "not started"; non-decreasing afterwards.
    pub floor_price: Fixed18,

    /// Floor-supply intercept `p`: supply at or below this trades at `f`.
    pub floor_supply: Fixed18,

    /// Cumulative backing worth `w` (net stablecoin value injected).
    pub worth: Fixed18,

    /// Slope constant `k`, fixed at startup. Price rises one 1e18-unit per
    /// `k` base units of supply above `p`.
    pub slope: Fixed18,
}

/// Funding-ratio controller state. Ratios are basis points (/10_000).
///
/// Invariant: `min_target <= target < target_adjusted <= max_target_adjusted
/// <= 10_000`.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable,
)]
pub struct RatioState {
    /// Funding-ratio target the solver re-solves against.
    pub target: u32,

    /// Upper threshold; crossing it triggers a curve re-solve.
    pub target_adjusted: u32,

    /// Lower bound for `target` under time-based lowering.
    pub min_target: u32,

    /// Upper bound for `target_adjusted` under buy-pressure raising.
    pub max_target_adjusted: u32,

    /// Step added to both targets when a triggered raise applies.
    pub raise_step: u32,

    /// Step removed from both targets per full `lower_interval` elapsed.
    pub lower_step: u32,

    /// Seconds per lowering step. Zero disables time-based lowering.
    pub lower_interval: u64,

    /// Unix seconds of the last ratio or curve mutation.
    pub latest_update_timestamp: u64,
}

/// Startup-time market configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarketOptions {
    pub slope: u128,
    pub target: u32,
    pub target_adjusted: u32,
}

/// Ratio-controller tuning, adjustable after startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustOptions {
    pub min_target: u32,
    pub max_target_adjusted: u32,
    pub raise_step: u32,
    pub lower_step: u32,
    pub lower_interval: u64,
}

/// Trade fees in basis points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeOptions {
    pub buy_fee_bps: u32,
    pub sell_fee_bps: u32,
}

// ============================================================================
// Quote / Outcome Structures
// ============================================================================

/// Result of a buy quote. `amount = gross - fee` is what the buyer receives;
/// the fee is minted to the dev account. Worth is 18-decimal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuyQuote {
    pub worth: u128,
    pub gross: u128,
    pub fee: u128,
    pub amount: u128,
    pub new_price: u128,
}

/// Result of a sell quote. `net = amount_in - fee` is priced by the curve;
/// `worth` is the 18-decimal payout. `hit_floor` records that the flat
/// segment was entered and the intercept must reset to the post-sale supply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SellQuote {
    pub fee: u128,
    pub net: u128,
    pub worth: u128,
    pub new_price: u128,
    pub hit_floor: bool,
}

/// Re-solved curve produced by a burn. `worth` is untouched by burns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BurnPlan {
    pub floor_price: u128,
    pub floor_supply: u128,
    pub price: u128,
}

/// Solver output: a consistent `(c, f, p)` for a given `(k, target, w, t)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Adjusted {
    pub price: u128,
    pub floor_price: u128,
    pub floor_supply: u128,
}

/// Off-engine estimate of the curve state a triggered raise would produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RaisePreview {
    /// Supply at which the current curve first reaches `target_adjusted`.
    pub supply: u128,
    /// Marginal price at that supply on the current curve.
    pub price: u128,
    /// Backing worth accumulated by buying up to that supply.
    pub worth: u128,
    /// Floor price a re-solve against `target` would set there.
    pub floor_price: u128,
}

// ============================================================================
// Adjustment Solver
// ============================================================================

/// Derive a consistent `(c, f, p)` so that the sloped region carries
/// `target_bps/10_000` of the total backing `worth` at supply `supply`:
///
/// ```text
/// f    = w * (1e18 - target*1e14) / t
/// temp = sqrt(2 * target * w * k / 10_000)      (= t - p)
/// p    = t - temp          (fails if t < temp)
/// c    = f + temp * 1e18 / k
/// ```
///
/// Fails with `Infeasible` when the supply cannot host the sloped region or
/// the derived state violates `f > 0`, `c > f`.
pub fn estimate_adjust(slope: u128, target_bps: u32, worth: u128, supply: u128) -> Result<Adjusted> {
    if slope == 0 || supply == 0 {
        return Err(CurveError::DivisionByZero);
    }
    let target = target_bps as u128;
    let remainder = SCALE
        .checked_sub(target.saturating_mul(SCALE / BPS_SCALE))
        .ok_or(CurveError::Infeasible)?;

    let floor_price = narrow_u256(div_u256(
        mul_u256(U256::from(worth), U256::from(remainder))?,
        U256::from(supply),
    )?)?;

    let temp_sq = div_u256(
        mul_u256(
            mul_u256(U256::from(2u8) * U256::from(target), U256::from(worth))?,
            U256::from(slope),
        )?,
        U256::from(BPS_SCALE),
    )?;
    let temp = sqrt_u256(temp_sq);

    if U256::from(supply) < temp {
        return Err(CurveError::Infeasible);
    }
    let temp = temp.low_u128();
    let floor_supply = supply - temp;

    let price = floor_price
        .checked_add(mul_div_floor(temp, SCALE, slope)?)
        .ok_or(CurveError::Overflow)?;

    if floor_price == 0 || price <= floor_price {
        return Err(CurveError::Infeasible);
    }

    Ok(Adjusted {
        price,
        floor_price,
        floor_supply,
    })
}

// ============================================================================
// Engine
// ============================================================================

/// The curve market engine: curve scalars, ratio controller and fee
/// parameters, plus lifetime telemetry. Field order keeps the struct free of
/// padding so hosts can snapshot it with bytemuck.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CurveEngine {
    pub curve: CurveState,
    pub ratio: RatioState,

    /// Buy fee in basis points, deducted from the minted amount.
    pub buy_fee_bps: u32,

    /// Sell fee in basis points, deducted from the amount before pricing.
    pub sell_fee_bps: u32,

    /// Lifetime stable worth traded into the market (18-decimal, saturating).
    pub total_volume: Fixed18,

    // Lifetime operation counters (telemetry).
    pub lifetime_buys: u64,
    pub lifetime_sells: u64,
    pub lifetime_realizes: u64,
    pub lifetime_burns: u64,
}

impl CurveEngine {
    pub fn new(market: MarketOptions, adjust: AdjustOptions, fees: FeeOptions) -> Result<Self> {
        validate_options(&market, &adjust, &fees)?;
        Ok(Self {
            curve: CurveState {
                price: Fixed18::ZERO,
                floor_price: Fixed18::ZERO,
                floor_supply: Fixed18::ZERO,
                worth: Fixed18::ZERO,
                slope: Fixed18::new(market.slope),
            },
            ratio: RatioState {
                target: market.target,
                target_adjusted: market.target_adjusted,
                min_target: adjust.min_target,
                max_target_adjusted: adjust.max_target_adjusted,
                raise_step: adjust.raise_step,
                lower_step: adjust.lower_step,
                lower_interval: adjust.lower_interval,
                latest_update_timestamp: 0,
            },
            buy_fee_bps: fees.buy_fee_bps,
            sell_fee_bps: fees.sell_fee_bps,
            total_volume: Fixed18::ZERO,
            lifetime_buys: 0,
            lifetime_sells: 0,
            lifetime_realizes: 0,
            lifetime_burns: 0,
        })
    }

    /// A market is started once the floor price is set. `f == 0` doubles as
    /// the "not started" sentinel.
    #[inline]
    pub fn is_started(&self) -> bool {
        !self.curve.floor_price.is_zero()
    }

    // ========================================
    // Configuration
    // ========================================

    /// Replace slope and ratio targets. Only valid before startup; the slope
    /// is immutable once the first curve is solved.
    pub fn set_market_options(&mut self, market: MarketOptions) -> Result<()> {
        if self.is_started() {
            return Err(CurveError::AlreadyStarted);
        }
        let adjust = self.adjust_options();
        let fees = self.fee_options();
        validate_options(&market, &adjust, &fees)?;
        self.curve.slope.set(market.slope);
        self.ratio.target = market.target;
        self.ratio.target_adjusted = market.target_adjusted;
        Ok(())
    }

    /// Replace the controller tuning. Valid any time, but the new bounds must
    /// be consistent with the current targets.
    pub fn set_adjust_options(&mut self, adjust: AdjustOptions) -> Result<()> {
        let market = MarketOptions {
            slope: self.curve.slope.get(),
            target: self.ratio.target,
            target_adjusted: self.ratio.target_adjusted,
        };
        let fees = self.fee_options();
        validate_options(&market, &adjust, &fees)?;
        self.ratio.min_target = adjust.min_target;
        self.ratio.max_target_adjusted = adjust.max_target_adjusted;
        self.ratio.raise_step = adjust.raise_step;
        self.ratio.lower_step = adjust.lower_step;
        self.ratio.lower_interval = adjust.lower_interval;
        Ok(())
    }

    pub fn set_fee_options(&mut self, fees: FeeOptions) -> Result<()> {
        if fees.buy_fee_bps as u128 >= BPS_SCALE || fees.sell_fee_bps as u128 >= BPS_SCALE {
            return Err(CurveError::InvalidOptions);
        }
        self.buy_fee_bps = fees.buy_fee_bps;
        self.sell_fee_bps = fees.sell_fee_bps;
        Ok(())
    }

    pub fn adjust_options(&self) -> AdjustOptions {
        AdjustOptions {
            min_target: self.ratio.min_target,
            max_target_adjusted: self.ratio.max_target_adjusted,
            raise_step: self.ratio.raise_step,
            lower_step: self.ratio.lower_step,
            lower_interval: self.ratio.lower_interval,
        }
    }

    pub fn fee_options(&self) -> FeeOptions {
        FeeOptions {
            buy_fee_bps: self.buy_fee_bps,
            sell_fee_bps: self.sell_fee_bps,
        }
    }

    // ========================================
    // Startup
    // ========================================

    /// One-shot initialization: seed `w` with the injected worth and solve
    /// the first curve against `target` at `initial_supply`.
    pub fn startup(&mut self, worth: u128, initial_supply: u128, now: u64) -> Result<()> {
        if self.is_started() {
            return Err(CurveError::AlreadyStarted);
        }
        if worth == 0 || initial_supply == 0 {
            return Err(CurveError::ZeroAmount);
        }
        let adj = estimate_adjust(self.curve.slope.get(), self.ratio.target, worth, initial_supply)?;
        self.curve.worth.set(worth);
        self.apply_adjusted(&adj);
        self.ratio.latest_update_timestamp = now;
        Ok(())
    }

    #[inline]
    fn apply_adjusted(&mut self, adj: &Adjusted) {
        self.curve.price.set(adj.price);
        self.curve.floor_price.set(adj.floor_price);
        self.curve.floor_supply.set(adj.floor_supply);
    }

    // ========================================
    // Buy
    // ========================================

    /// Quote a purchase of `worth` (18-decimal stable value). Solves
    ///
    /// ```text
    /// a      = sqrt(c²k² + 2 * worth * k * 1e36)
    /// gross  = (a - c*k) / 1e18
    /// c'     = a / k
    /// ```
    ///
    /// and deducts the buy fee from the gross amount.
    pub fn quote_buy(&self, worth: u128) -> Result<BuyQuote> {
        if !self.is_started() {
            return Err(CurveError::NotStarted);
        }
        if worth == 0 {
            return Err(CurveError::ZeroAmount);
        }
        let c = self.curve.price.get();
        let k = self.curve.slope.get();

        let ck = U256::from(c) * U256::from(k);
        let discriminant = add_u256(
            mul_u256(ck, ck)?,
            mul_u256(
                mul_u256(U256::from(2u8) * U256::from(worth), U256::from(k))?,
                U256::from(SCALE) * U256::from(SCALE),
            )?,
        )?;
        let a = sqrt_u256(discriminant);
        if a <= ck {
            return Err(CurveError::ZeroAmount);
        }

        let gross = narrow_u256((a - ck) / U256::from(SCALE))?;
        if gross == 0 {
            return Err(CurveError::ZeroAmount);
        }
        let new_price = narrow_u256(a / U256::from(k))?;

        let fee = mul_div_floor(gross, self.buy_fee_bps as u128, BPS_SCALE)?;
        let amount = gross - fee;
        if amount == 0 {
            return Err(CurveError::ZeroAmount);
        }
        // Pre-validate the commit so a quoted buy cannot fail mid-apply.
        self.curve.worth.checked_add(worth)?;

        Ok(BuyQuote {
            worth,
            gross,
            fee,
            amount,
            new_price,
        })
    }

    /// Commit a buy quoted against the current state. `t` is the circulating
    /// supply after the gross amount was minted.
    pub fn commit_buy(&mut self, quote: &BuyQuote, t: u128, now: u64) -> Result<()> {
        let new_worth = self.curve.worth.checked_add(quote.worth)?;
        self.curve.worth = new_worth;
        self.curve.price.set(quote.new_price);
        self.total_volume = self.total_volume.saturating_add(quote.worth);
        self.lifetime_buys += 1;
        debug_assert!(self.curve.price >= self.curve.floor_price);
        // Buys are the only trigger that may raise the targets.
        self.rebalance(t, now, true);
        Ok(())
    }

    // ========================================
    // Sell
    // ========================================

    /// Quote a sale of `amount` tokens against supply `t`. The fee is taken
    /// from the amount first; the net remainder is priced in two segments:
    /// the sloped region down to the intercept at the trapezoid average of
    /// entry and exit price, then any remainder flat at the floor. Entering
    /// the flat segment (including exactly exhausting the sloped region)
    /// exits at the floor price and later resets the intercept.
    pub fn quote_sell(&self, amount: u128, t: u128) -> Result<SellQuote> {
        if !self.is_started() {
            return Err(CurveError::NotStarted);
        }
        if amount == 0 {
            return Err(CurveError::ZeroAmount);
        }
        let fee = mul_div_floor(amount, self.sell_fee_bps as u128, BPS_SCALE)?;
        let net = amount - fee;
        if net == 0 {
            return Err(CurveError::ZeroAmount);
        }
        if net > t {
            return Err(CurveError::Infeasible);
        }

        let c = self.curve.price.get();
        let f = self.curve.floor_price.get();
        let p = self.curve.floor_supply.get();
        let k = self.curve.slope.get();

        let available = t.saturating_sub(p);
        let (worth, new_price, hit_floor) = if available > 0 && net < available {
            // Sloped segment only.
            let exit = c
                .checked_sub(mul_div_floor(net, SCALE, k)?)
                .ok_or(CurveError::Infeasible)?;
            let worth = trapezoid(c, exit, net)?;
            (worth, exit, false)
        } else if available > 0 {
            // Sloped segment down to the intercept, remainder at the floor.
            let exit = c
                .checked_sub(mul_div_floor(available, SCALE, k)?)
                .ok_or(CurveError::Infeasible)?;
            let sloped = trapezoid(c, exit, available)?;
            let flat = mul_div_floor(f, net - available, SCALE)?;
            let worth = sloped.checked_add(flat).ok_or(CurveError::Overflow)?;
            (worth, f, true)
        } else {
            // Supply already at or below the intercept: everything at floor.
            (mul_div_floor(f, net, SCALE)?, f, true)
        };

        if worth == 0 || new_price == 0 {
            return Err(CurveError::ZeroAmount);
        }
        // Pre-validate the commit so a quoted sell cannot fail mid-apply. The
        // systematic floor bias keeps quoted worth at or below `w` on any
        // curve the engine itself produced.
        if worth > self.curve.worth.get() {
            return Err(CurveError::Infeasible);
        }

        Ok(SellQuote {
            fee,
            net,
            worth,
            new_price,
            hit_floor,
        })
    }

    /// Commit a sell quoted against the current state. `t` is the circulating
    /// supply after the net amount left it. When the sale exited at the
    /// floor, the intercept catches up to the post-sale supply (the curve's
    /// left translation).
    pub fn commit_sell(&mut self, quote: &SellQuote, t: u128, now: u64) -> Result<()> {
        let new_worth = self.curve.worth.checked_sub(quote.worth)?;
        self.curve.worth = new_worth;
        self.curve.price.set(quote.new_price);
        if quote.hit_floor {
            self.curve.floor_supply.set(t);
        }
        self.lifetime_sells += 1;
        self.rebalance(t, now, false);
        Ok(())
    }

    // ========================================
    // Realize
    // ========================================

    /// Quote converting `amount` claim tokens into the priced asset at the
    /// floor price exactly: `worth = ceil(f * amount / 1e18)`. Never fails
    /// from curve shape; only from zero input.
    pub fn quote_realize(&self, amount: u128) -> Result<u128> {
        if !self.is_started() {
            return Err(CurveError::NotStarted);
        }
        if amount == 0 {
            return Err(CurveError::ZeroAmount);
        }
        let worth = mul_div_ceil(self.curve.floor_price.get(), amount, SCALE)?;
        // Pre-validate the commit so a quoted realize cannot fail mid-apply.
        self.curve.worth.checked_add(worth)?;
        self.curve.floor_supply.checked_add(amount)?;
        Ok(worth)
    }

    /// Commit a realize: backing grows by the charged worth and the floor
    /// segment extends right so the mint cannot move the price.
    pub fn commit_realize(&mut self, amount: u128, worth: u128, t: u128, now: u64) -> Result<()> {
        let new_worth = self.curve.worth.checked_add(worth)?;
        let new_intercept = self.curve.floor_supply.checked_add(amount)?;
        self.curve.worth = new_worth;
        self.curve.floor_supply = new_intercept;
        self.lifetime_realizes += 1;
        self.rebalance(t, now, false);
        Ok(())
    }

    // ========================================
    // Burn
    // ========================================

    /// Plan a supply burn of `amount` at supply `t`. Backing is preserved, so
    /// removing supply must either steepen the curve (same floor, narrower
    /// flat region) or, when the sloped region would swallow the whole
    /// remaining supply, raise the floor itself:
    ///
    /// ```text
    /// x = sqrt(2k * (w*1e18 - f*t') / 1e18)      t' = t - amount
    /// x < t'  : p = t' - x,  c = f + x*1e18/k    (floor unchanged)
    /// x >= t' : f' = (2kw - t'²)*1e18 / (2kt'),  p = 0,  c = f' + t'*1e18/k
    /// ```
    ///
    /// The floor-raising branch is rejected unless `f' > f` strictly.
    pub fn quote_burn(&self, amount: u128, t: u128) -> Result<BurnPlan> {
        if !self.is_started() {
            return Err(CurveError::NotStarted);
        }
        if amount == 0 {
            return Err(CurveError::ZeroAmount);
        }
        let t_after = t.checked_sub(amount).ok_or(CurveError::Infeasible)?;
        if t_after == 0 {
            return Err(CurveError::Infeasible);
        }

        let w = self.curve.worth.get();
        let f = self.curve.floor_price.get();
        let k = self.curve.slope.get();

        let backing = mul_u256(U256::from(w), U256::from(SCALE))?;
        let floor_claim = mul_u256(U256::from(f), U256::from(t_after))?;
        if backing <= floor_claim {
            return Err(CurveError::Infeasible);
        }
        let x = sqrt_u256(div_u256(
            mul_u256(U256::from(2u8) * U256::from(k), backing - floor_claim)?,
            U256::from(SCALE),
        )?);
        if x.is_zero() {
            return Err(CurveError::Infeasible);
        }

        if x < U256::from(t_after) {
            // Same floor, steeper curve: the flat region narrows.
            let x = x.low_u128();
            let price = f
                .checked_add(mul_div_floor(x, SCALE, k)?)
                .ok_or(CurveError::Overflow)?;
            if price <= f {
                return Err(CurveError::Infeasible);
            }
            Ok(BurnPlan {
                floor_price: f,
                floor_supply: t_after - x,
                price,
            })
        } else {
            // Sloped region spans all remaining supply: the floor must rise.
            let two_kw = mul_u256(U256::from(2u8) * U256::from(k), U256::from(w))?;
            let t_sq = U256::from(t_after) * U256::from(t_after);
            if two_kw <= t_sq {
                return Err(CurveError::Infeasible);
            }
            let new_floor = narrow_u256(div_u256(
                mul_u256(two_kw - t_sq, U256::from(SCALE))?,
                U256::from(2u8) * U256::from(k) * U256::from(t_after),
            )?)?;
            if new_floor <= f {
                return Err(CurveError::FloorRegression);
            }
            let price = new_floor
                .checked_add(mul_div_floor(t_after, SCALE, k)?)
                .ok_or(CurveError::Overflow)?;
            if price <= new_floor {
                return Err(CurveError::Infeasible);
            }
            Ok(BurnPlan {
                floor_price: new_floor,
                floor_supply: 0,
                price,
            })
        }
    }

    /// Commit a burn plan. `t` is the post-burn circulating supply; `w` is
    /// untouched since no value left the system.
    pub fn commit_burn(&mut self, plan: &BurnPlan, t: u128, now: u64) {
        self.curve.floor_price.set(plan.floor_price);
        self.curve.floor_supply.set(plan.floor_supply);
        self.curve.price.set(plan.price);
        self.lifetime_burns += 1;
        debug_assert!(self.curve.price > self.curve.floor_price);
        self.rebalance(t, now, false);
    }

    // ========================================
    // Funding Ratio
    // ========================================

    /// Funding ratio at supply `t` as an exact fraction: the sloped region's
    /// backing against total backing,
    ///
    /// ```text
    /// num = (t - p)²          den = num + 2*k*f*t/1e18
    /// ```
    ///
    /// `0/1` when supply sits at or below the intercept. A denominator
    /// overflow saturates, which can only under-report the ratio.
    pub fn current_funding_ratio(&self, t: u128) -> (U256, U256) {
        let p = self.curve.floor_supply.get();
        if t <= p {
            return (U256::zero(), U256::one());
        }
        let gap = U256::from(t - p);
        let num = gap * gap;

        let floor_term = mul_u256(
            U256::from(2u8) * U256::from(self.curve.slope.get()),
            U256::from(self.curve.floor_price.get()),
        )
        .and_then(|v| mul_u256(v, U256::from(t)))
        .map(|v| v / U256::from(SCALE));
        let den = match floor_term {
            Ok(term) => {
                let (den, overflow) = num.overflowing_add(term);
                if overflow {
                    U256::MAX
                } else {
                    den
                }
            }
            Err(_) => U256::MAX,
        };
        (num, den)
    }

    /// Whether the funding ratio at `t` exceeds `target_adjusted`.
    pub fn ratio_exceeded(&self, t: u128) -> bool {
        let (num, den) = self.current_funding_ratio(t);
        // num/den > ta/10000  <=>  num*10000 > den*ta, with overflow treated
        // as exceeded (a ratio that large is far past any bps threshold).
        let (lhs, lhs_over) = num.overflowing_mul(U256::from(BPS_SCALE));
        let (rhs, rhs_over) = den.overflowing_mul(U256::from(self.ratio.target_adjusted));
        match (lhs_over, rhs_over) {
            (false, false) => lhs > rhs,
            (true, false) => true,
            _ => false,
        }
    }

    // ========================================
    // Ratio Controller
    // ========================================

    /// Post-trade controller dispatch: re-solve upward when the ratio has
    /// overshot the adjusted target, otherwise relax the targets over time.
    fn rebalance(&mut self, t: u128, now: u64, triggered: bool) {
        if self.ratio_exceeded(t) {
            self.adjust_and_raise(t, now, triggered);
        } else {
            self.lower_and_adjust(t, now);
        }
    }

    /// Re-solve the curve at `target`. The result applies only when the
    /// solver succeeds and the floor would not regress; a failed solve is
    /// swallowed (the trade that invoked this has already committed). A
    /// triggered application also steps both targets up toward
    /// `max_target_adjusted`.
    fn adjust_and_raise(&mut self, t: u128, now: u64, triggered: bool) {
        let adj = match estimate_adjust(
            self.curve.slope.get(),
            self.ratio.target,
            self.curve.worth.get(),
            t,
        ) {
            Ok(adj) => adj,
            Err(_) => return,
        };
        if adj.floor_price < self.curve.floor_price.get() {
            return;
        }
        self.apply_adjusted(&adj);

        if triggered && self.ratio.target_adjusted < self.ratio.max_target_adjusted {
            let step = self
                .ratio
                .raise_step
                .min(self.ratio.max_target_adjusted - self.ratio.target_adjusted);
            self.ratio.target += step;
            self.ratio.target_adjusted += step;
        }
        self.ratio.latest_update_timestamp = now;
    }

    /// Time-proportional target lowering. Elapsed time below one
    /// `lower_interval` yields a zero step (a deliberate throttle); the
    /// elapsed seconds are truncated to u32, an accepted domain limit for
    /// gaps beyond ~136 years. If the lowered threshold is now exceeded, the
    /// curve immediately re-solves without stepping the targets up.
    pub fn lower_and_adjust(&mut self, t: u128, now: u64) {
        if !self.is_started() || self.ratio.lower_interval == 0 {
            return;
        }
        let elapsed = now.saturating_sub(self.ratio.latest_update_timestamp) as u32;
        let step = (self.ratio.lower_step as u64).saturating_mul(elapsed as u64)
            / self.ratio.lower_interval;
        let step = step.min((self.ratio.target - self.ratio.min_target) as u64) as u32;
        if step == 0 {
            return;
        }
        self.ratio.target -= step;
        self.ratio.target_adjusted -= step;
        self.ratio.latest_update_timestamp = now;

        if self.ratio_exceeded(t) {
            self.adjust_and_raise(t, now, false);
        }
    }

    // ========================================
    // Estimation (read-only)
    // ========================================

    /// Preview the floor price a buy-triggered raise would produce: find the
    /// supply `t*` at which the unchanged curve first reaches
    /// `target_adjusted`, accumulate the worth of buying up to it, and
    /// re-solve against `target` there. Pure; mutates nothing.
    pub fn estimate_raise_price(&self, t: u128) -> Result<RaisePreview> {
        if !self.is_started() {
            return Err(CurveError::NotStarted);
        }
        let ta = self.ratio.target_adjusted as u128;
        if ta == 0 || ta >= BPS_SCALE {
            return Err(CurveError::Infeasible);
        }
        let c = self.curve.price.get();
        let f = self.curve.floor_price.get();
        let p = self.curve.floor_supply.get();
        let k = self.curve.slope.get();
        let w = self.curve.worth.get();

        // On the fixed curve, the ratio reaches ta where (t*-p)² = B*t*:
        //   B = 2*ta*f*k / ((10000-ta)*1e18)
        let b = div_u256(
            mul_u256(
                mul_u256(U256::from(2u8) * U256::from(ta), U256::from(f))?,
                U256::from(k),
            )?,
            U256::from(BPS_SCALE - ta) * U256::from(SCALE),
        )?;

        // Larger root of t*² - (2p + B)t* + p² = 0.
        let discriminant = mul_u256(b, add_u256(b, U256::from(4u8) * U256::from(p))?)?;
        let t_star = narrow_u256(
            add_u256(
                U256::from(2u8) * U256::from(p) + b,
                sqrt_u256(discriminant),
            )? / U256::from(2u8),
        )?;

        if t_star <= t {
            // The current supply already meets the adjusted target; the
            // preview degenerates to a re-solve in place.
            let adj = estimate_adjust(k, self.ratio.target, w, t)?;
            return Ok(RaisePreview {
                supply: t,
                price: c,
                worth: w,
                floor_price: adj.floor_price,
            });
        }

        let price_star = f
            .checked_add(mul_div_floor(t_star - p, SCALE, k)?)
            .ok_or(CurveError::Overflow)?;
        let accrued = narrow_u256(div_u256(
            mul_u256(
                add_u256(U256::from(c), U256::from(price_star))?,
                U256::from(t_star - t),
            )?,
            U256::from(2u8) * U256::from(SCALE),
        )?)?;
        let worth_star = w.checked_add(accrued).ok_or(CurveError::Overflow)?;

        let adj = estimate_adjust(k, self.ratio.target, worth_star, t_star)?;
        Ok(RaisePreview {
            supply: t_star,
            price: price_star,
            worth: worth_star,
            floor_price: adj.floor_price,
        })
    }

    // ========================================
    // Invariant Checking (for tests)
    // ========================================

    /// Check that the backing worth matches the area under the curve at
    /// supply `t` within `slack` (floor divisions bias the implied area
    /// low, and quote rounding adds bounded dust per trade).
    pub fn check_conservation(&self, t: u128, slack: u128) -> bool {
        if !self.is_started() {
            return true;
        }
        let f = self.curve.floor_price.get();
        let p = self.curve.floor_supply.get();
        let k = self.curve.slope.get();

        let flat = U256::from(f) * U256::from(t) / U256::from(SCALE);
        let gap = U256::from(t.saturating_sub(p));
        let sloped = gap * gap / (U256::from(2u8) * U256::from(k));
        let implied = match add_u256(flat, sloped) {
            Ok(v) => v,
            Err(_) => return false,
        };

        let w = U256::from(self.curve.worth.get());
        let diff = if w > implied { w - implied } else { implied - w };
        diff <= U256::from(slack)
    }
}

/// Joint ordering checks for all configurable parameters:
/// `0 < min_target <= target < target_adjusted <= max_target_adjusted <=
/// 10000`, positive slope, fees below 100%.
fn validate_options(
    market: &MarketOptions,
    adjust: &AdjustOptions,
    fees: &FeeOptions,
) -> Result<()> {
    if market.slope == 0 {
        return Err(CurveError::InvalidOptions);
    }
    let ordered = adjust.min_target > 0
        && adjust.min_target <= market.target
        && market.target < market.target_adjusted
        && market.target_adjusted <= adjust.max_target_adjusted
        && adjust.max_target_adjusted as u128 <= BPS_SCALE;
    if !ordered {
        return Err(CurveError::InvalidOptions);
    }
    if fees.buy_fee_bps as u128 >= BPS_SCALE || fees.sell_fee_bps as u128 >= BPS_SCALE {
        return Err(CurveError::InvalidOptions);
    }
    Ok(())
}

/// Trapezoid-rule worth of a sloped segment: average of entry and exit price
/// times the amount, floored into 18-decimal worth.
#[inline]
fn trapezoid(entry: u128, exit: u128, amount: u128) -> Result<u128> {
    let sum = add_u256(U256::from(entry), U256::from(exit))?;
    Ok(narrow_u256(div_u256(
        mul_u256(sum, U256::from(amount))?,
        U256::from(2u8) * U256::from(SCALE),
    )?)?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn options_1pct() -> (MarketOptions, AdjustOptions, FeeOptions) {
        (
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
                buy_fee_bps: 0,
                sell_fee_bps: 0,
            },
        )
    }

    #[test]
    fn solver_one_percent_scenario() {
        // worth = 1_000e18, supply = 1_000_000e18, k = 1e18, target = 1%
        let worth = 1_000 * SCALE;
        let supply = 1_000_000 * SCALE;
        let adj = estimate_adjust(SCALE, 100, worth, supply).unwrap();

        // f = 0.99 * 1000 / 1e6 = 0.00099, 18-decimal
        assert_eq!(adj.floor_price, 990_000_000_000_000);
        assert!(adj.price > adj.floor_price);
        // temp = sqrt(2e37) ~ 4.4721e18, so p sits just below the supply
        assert!(adj.floor_supply < supply);
        assert!(supply - adj.floor_supply < 5 * SCALE);
    }

    #[test]
    fn solver_infeasible_when_supply_too_small() {
        // Tiny supply cannot host the sloped region for this worth/slope.
        let err = estimate_adjust(SCALE, 100, 1_000 * SCALE, SCALE).unwrap_err();
        assert_eq!(err, CurveError::Infeasible);
    }

    #[test]
    fn solver_rejects_zero_inputs() {
        assert_eq!(
            estimate_adjust(0, 100, SCALE, SCALE),
            Err(CurveError::DivisionByZero)
        );
        assert_eq!(
            estimate_adjust(SCALE, 100, SCALE, 0),
            Err(CurveError::DivisionByZero)
        );
    }

    #[test]
    fn funding_ratio_reconstructs_target() {
        let (market, adjust, fees) = options_1pct();
        let mut engine = CurveEngine::new(market, adjust, fees).unwrap();
        let supply = 1_000_000 * SCALE;
        engine.startup(1_000 * SCALE, supply, 0).unwrap();

        let (num, den) = engine.current_funding_ratio(supply);
        let bps = (num * U256::from(BPS_SCALE) / den).low_u128();
        // Floor rounding may lose at most one basis point.
        assert!((99..=100).contains(&bps), "ratio was {} bps", bps);
    }

    #[test]
    fn funding_ratio_zero_at_or_below_intercept() {
        let (market, adjust, fees) = options_1pct();
        let mut engine = CurveEngine::new(market, adjust, fees).unwrap();
        engine.startup(1_000 * SCALE, 1_000_000 * SCALE, 0).unwrap();
        let p = engine.curve.floor_supply.get();
        assert_eq!(engine.current_funding_ratio(p), (U256::zero(), U256::one()));
        assert_eq!(
            engine.current_funding_ratio(p / 2),
            (U256::zero(), U256::one())
        );
    }

    #[test]
    fn buy_formula_matches_closed_form() {
        // Fresh curve pinned at c = 1e18, k = 1e18: buying 100e18 worth mints
        // (sqrt(201) - 1)e18 up to flooring.
        let (market, adjust, fees) = options_1pct();
        let mut engine = CurveEngine::new(market, adjust, fees).unwrap();
        engine.curve.price.set(SCALE);
        engine.curve.floor_price.set(1); // started, floor negligible
        engine.curve.slope.set(SCALE);

        let q = engine.quote_buy(100 * SCALE).unwrap();

        // Closed form at k = 1e18: a = sqrt(201)*1e36, gross = (a - 1e36)/1e18
        let scale2 = U256::from(SCALE) * U256::from(SCALE);
        let a = sqrt_u256(U256::from(201u32) * scale2 * scale2).low_u128();
        assert_eq!(q.gross, (a - SCALE * SCALE) / SCALE);
        assert_eq!(q.new_price, a / SCALE);
        // sqrt(201) is 14.17744687..., so ~13.1774468 tokens minted
        assert!(q.gross > 13_177_446 * (SCALE / 10_000_000));
        assert!(q.gross < 13_177_447 * (SCALE / 10_000_000));
        assert!(q.new_price > SCALE);
        assert_eq!(q.fee, 0);
        assert_eq!(q.amount, q.gross);
    }

    #[test]
    fn options_ordering_is_enforced() {
        let (market, adjust, fees) = options_1pct();
        let mut bad = market;
        bad.target_adjusted = market.target; // target must be < target_adjusted
        assert_eq!(
            CurveEngine::new(bad, adjust, fees),
            Err(CurveError::InvalidOptions)
        );

        let mut bad = adjust;
        bad.max_target_adjusted = 20_000; // above 100%
        assert_eq!(
            CurveEngine::new(market, bad, fees),
            Err(CurveError::InvalidOptions)
        );

        let mut engine = CurveEngine::new(market, adjust, fees).unwrap();
        let mut bad = adjust;
        bad.min_target = 150; // above current target
        assert_eq!(engine.set_adjust_options(bad), Err(CurveError::InvalidOptions));
    }

    #[test]
    fn slope_is_frozen_after_startup() {
        let (market, adjust, fees) = options_1pct();
        let mut engine = CurveEngine::new(market, adjust, fees).unwrap();
        engine.startup(1_000 * SCALE, 1_000_000 * SCALE, 0).unwrap();
        assert_eq!(
            engine.set_market_options(market),
            Err(CurveError::AlreadyStarted)
        );
    }
}
