//! Curvemarket: a deterministic bonding-curve market engine.
//!
//! The library prices a single asset against a piecewise-linear supply curve
//! with a floor price, a dynamically adjusted funding-ratio target, and
//! exact-precision buy/sell/realize/burn operations. Token custody lives
//! behind the [`TokenLedger`] collaborator and stablecoin metadata behind
//! [`StableRegistry`]; the engine itself is pure state plus integer
//! arithmetic and never touches a clock, a lock, or the outside world.
//!
//! Hosts must serialize calls: every operation runs to completion against
//! the shared state before another may observe it. The library performs no
//! locking and no reentrancy detection of its own.

pub mod curve;
pub mod fixed;

use std::collections::BTreeMap;

use log::{debug, info};

use crate::curve::{BuyQuote, CurveEngine, CurveError, CurveState, RatioState, SellQuote};
use crate::fixed::{convert_decimals, convert_decimals_ceil, MathError, SCALE_DECIMALS, U256};

pub use crate::curve::{AdjustOptions, Adjusted, BurnPlan, FeeOptions, MarketOptions, RaisePreview};
pub use crate::fixed::Fixed18;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque 32-byte token identifier, assigned by the host.
pub type TokenId = [u8; 32];

/// Opaque 32-byte account identifier, assigned by the host.
pub type AccountId = [u8; 32];

// ============================================================================
// Errors
// ============================================================================

pub mod error {
    use num_derive::FromPrimitive;
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
    pub enum MarketError {
        #[error("market not started")]
        NotStarted,

        #[error("market already started")]
        AlreadyStarted,

        #[error("option ordering invalid")]
        InvalidOptions,

        #[error("stable token not approved for this operation")]
        TokenNotApproved,

        #[error("operation resolves to zero amount or worth")]
        ZeroAmount,

        #[error("slippage bound violated")]
        Slippage,

        #[error("curve has no solution for the requested state")]
        Infeasible,

        #[error("burn would not strictly raise the floor")]
        FloorRegression,

        #[error("ledger rejected the operation")]
        LedgerRejected,

        #[error("arithmetic overflow")]
        Overflow,

        #[error("division by zero")]
        DivisionByZero,
    }

    /// Stable wire codes for [`MarketError`], for hosts that surface errors
    /// as numeric codes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[repr(u32)]
    pub enum ErrorCode {
        NotStarted = 0,
        AlreadyStarted = 1,
        InvalidOptions = 2,
        TokenNotApproved = 3,
        ZeroAmount = 4,
        Slippage = 5,
        Infeasible = 6,
        FloorRegression = 7,
        LedgerRejected = 8,
        Overflow = 9,
        DivisionByZero = 10,
    }

    impl MarketError {
        pub fn code(&self) -> u32 {
            let code = match self {
                MarketError::NotStarted => ErrorCode::NotStarted,
                MarketError::AlreadyStarted => ErrorCode::AlreadyStarted,
                MarketError::InvalidOptions => ErrorCode::InvalidOptions,
                MarketError::TokenNotApproved => ErrorCode::TokenNotApproved,
                MarketError::ZeroAmount => ErrorCode::ZeroAmount,
                MarketError::Slippage => ErrorCode::Slippage,
                MarketError::Infeasible => ErrorCode::Infeasible,
                MarketError::FloorRegression => ErrorCode::FloorRegression,
                MarketError::LedgerRejected => ErrorCode::LedgerRejected,
                MarketError::Overflow => ErrorCode::Overflow,
                MarketError::DivisionByZero => ErrorCode::DivisionByZero,
            };
            code as u32
        }
    }

    /// Decode a wire code back into its [`ErrorCode`], if known.
    pub fn decode_error(code: u32) -> Option<ErrorCode> {
        num_traits::FromPrimitive::from_u32(code)
    }
}

pub use error::MarketError;

pub type Result<T> = core::result::Result<T, MarketError>;

impl From<CurveError> for MarketError {
    fn from(e: CurveError) -> Self {
        match e {
            CurveError::NotStarted => MarketError::NotStarted,
            CurveError::AlreadyStarted => MarketError::AlreadyStarted,
            CurveError::InvalidOptions => MarketError::InvalidOptions,
            CurveError::ZeroAmount => MarketError::ZeroAmount,
            CurveError::Infeasible => MarketError::Infeasible,
            CurveError::FloorRegression => MarketError::FloorRegression,
            CurveError::Overflow => MarketError::Overflow,
            CurveError::DivisionByZero => MarketError::DivisionByZero,
        }
    }
}

impl From<MathError> for MarketError {
    fn from(e: MathError) -> Self {
        match e {
            MathError::Overflow => MarketError::Overflow,
            MathError::DivisionByZero => MarketError::DivisionByZero,
        }
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Per-token stablecoin metadata. `decimals` drives worth conversion; the
/// enable flags gate which directions the token is approved for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StableMeta {
    pub decimals: u8,
    pub buy_enabled: bool,
    pub sell_enabled: bool,
}

/// Host-provided registry of approved stable tokens.
pub trait StableRegistry {
    fn stable(&self, token: &TokenId) -> Option<StableMeta>;
}

/// Host-provided ledger for the priced asset and its realize claim token.
///
/// The engine drives mints and burns through this trait and reads the
/// circulating supply back after each mutation; it never holds balances
/// itself. Implementations must apply each call atomically.
pub trait TokenLedger {
    /// Circulating supply of the priced asset (18-decimal base units).
    fn total_supply(&self) -> u128;

    /// Mint asset to an account.
    fn mint(&mut self, to: &AccountId, amount: u128) -> Result<()>;

    /// Burn asset from an account. Fails with `LedgerRejected` when the
    /// balance is insufficient.
    fn burn_from(&mut self, from: &AccountId, amount: u128) -> Result<()>;

    /// Burn realize claim tokens from an account.
    fn burn_voucher_from(&mut self, from: &AccountId, amount: u128) -> Result<()>;
}

// ============================================================================
// In-Memory Collaborators (for testing and simulation)
// ============================================================================

/// Simple balance-map ledger (for testing and simulation hosts).
#[derive(Clone, Debug, Default)]
pub struct MemoryLedger {
    balances: BTreeMap<AccountId, u128>,
    vouchers: BTreeMap<AccountId, u128>,
    supply: u128,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant claim tokens outside the market (the issuer collaborator).
    pub fn credit_voucher(&mut self, to: &AccountId, amount: u128) {
        *self.vouchers.entry(*to).or_insert(0) += amount;
    }

    pub fn balance_of(&self, who: &AccountId) -> u128 {
        self.balances.get(who).copied().unwrap_or(0)
    }

    pub fn voucher_balance_of(&self, who: &AccountId) -> u128 {
        self.vouchers.get(who).copied().unwrap_or(0)
    }
}

impl TokenLedger for MemoryLedger {
    fn total_supply(&self) -> u128 {
        self.supply
    }

    fn mint(&mut self, to: &AccountId, amount: u128) -> Result<()> {
        let supply = self
            .supply
            .checked_add(amount)
            .ok_or(MarketError::Overflow)?;
        *self.balances.entry(*to).or_insert(0) += amount;
        self.supply = supply;
        Ok(())
    }

    fn burn_from(&mut self, from: &AccountId, amount: u128) -> Result<()> {
        let balance = self.balances.entry(*from).or_insert(0);
        if *balance < amount {
            return Err(MarketError::LedgerRejected);
        }
        *balance -= amount;
        self.supply -= amount;
        Ok(())
    }

    fn burn_voucher_from(&mut self, from: &AccountId, amount: u128) -> Result<()> {
        let balance = self.vouchers.entry(*from).or_insert(0);
        if *balance < amount {
            return Err(MarketError::LedgerRejected);
        }
        *balance -= amount;
        Ok(())
    }
}

/// Map-backed stable registry (for testing and simulation hosts).
#[derive(Clone, Debug, Default)]
pub struct TableRegistry {
    stables: BTreeMap<TokenId, StableMeta>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&mut self, token: TokenId, meta: StableMeta) {
        self.stables.insert(token, meta);
    }

    pub fn revoke(&mut self, token: &TokenId) {
        self.stables.remove(token);
    }
}

impl StableRegistry for TableRegistry {
    fn stable(&self, token: &TokenId) -> Option<StableMeta> {
        self.stables.get(token).copied()
    }
}

// ============================================================================
// Market
// ============================================================================

/// Host-facing market: validation pipeline, decimal conversion, collaborator
/// orchestration and logging around the pure [`CurveEngine`].
///
/// Every method that mutates state takes `now` (unix seconds) from the host,
/// and every trade names its beneficiary explicitly; the library has no
/// ambient caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Market {
    engine: CurveEngine,
    dev: AccountId,
}

impl Market {
    pub fn new(
        dev: AccountId,
        market: MarketOptions,
        adjust: AdjustOptions,
        fees: FeeOptions,
    ) -> Result<Self> {
        let engine = CurveEngine::new(market, adjust, fees)?;
        Ok(Self { engine, dev })
    }

    // ========================================
    // Views
    // ========================================

    pub fn engine(&self) -> &CurveEngine {
        &self.engine
    }

    pub fn curve(&self) -> &CurveState {
        &self.engine.curve
    }

    pub fn ratio(&self) -> &RatioState {
        &self.engine.ratio
    }

    pub fn dev(&self) -> &AccountId {
        &self.dev
    }

    pub fn is_started(&self) -> bool {
        self.engine.is_started()
    }

    /// Lifetime stable worth bought into the market, 18-decimal.
    pub fn total_volume(&self) -> u128 {
        self.engine.total_volume.get()
    }

    /// Funding ratio at the ledger's current supply, as an exact fraction.
    pub fn funding_ratio<L: TokenLedger>(&self, ledger: &L) -> (U256, U256) {
        self.engine.current_funding_ratio(ledger.total_supply())
    }

    // ========================================
    // Configuration
    // ========================================

    pub fn set_market_options(&mut self, options: MarketOptions) -> Result<()> {
        self.engine.set_market_options(options)?;
        info!(
            "market options set: slope={} target={} target_adjusted={}",
            options.slope, options.target, options.target_adjusted
        );
        Ok(())
    }

    pub fn set_adjust_options(&mut self, options: AdjustOptions) -> Result<()> {
        self.engine.set_adjust_options(options)?;
        info!(
            "adjust options set: min_target={} max_target_adjusted={} raise_step={} lower_step={} lower_interval={}",
            options.min_target,
            options.max_target_adjusted,
            options.raise_step,
            options.lower_step,
            options.lower_interval
        );
        Ok(())
    }

    pub fn set_fee_options(&mut self, options: FeeOptions) -> Result<()> {
        self.engine.set_fee_options(options)?;
        info!(
            "fee options set: buy={}bps sell={}bps",
            options.buy_fee_bps, options.sell_fee_bps
        );
        Ok(())
    }

    pub fn set_dev(&mut self, dev: AccountId) {
        self.dev = dev;
    }

    // ========================================
    // Startup
    // ========================================

    /// One-shot market start: convert the injected stable worth, solve the
    /// first curve and mint the initial supply to `to`. The host transfers
    /// the stable amount into custody before calling.
    pub fn startup<L: TokenLedger, R: StableRegistry>(
        &mut self,
        ledger: &mut L,
        registry: &R,
        token: &TokenId,
        stable_amount: u128,
        initial_supply: u128,
        to: &AccountId,
        now: u64,
    ) -> Result<()> {
        let meta = self.buyable(registry, token)?;
        let worth = convert_decimals(stable_amount, meta.decimals, SCALE_DECIMALS)?;
        self.engine.startup(worth, initial_supply, now)?;
        ledger.mint(to, initial_supply)?;
        info!(
            "market started: worth={} supply={} floor={} price={}",
            worth,
            initial_supply,
            self.engine.curve.floor_price,
            self.engine.curve.price
        );
        Ok(())
    }

    // ========================================
    // Buy
    // ========================================

    /// Quote buying with `stable_amount` of `token`. Read-only.
    pub fn quote_buy<R: StableRegistry>(
        &self,
        registry: &R,
        token: &TokenId,
        stable_amount: u128,
    ) -> Result<BuyQuote> {
        let meta = self.buyable(registry, token)?;
        let worth = convert_decimals(stable_amount, meta.decimals, SCALE_DECIMALS)?;
        Ok(self.engine.quote_buy(worth)?)
    }

    /// Buy the asset with stable value, minting to `recipient` and the fee
    /// to the dev account. Returns `(amount, fee)` in asset base units.
    pub fn buy<L: TokenLedger, R: StableRegistry>(
        &mut self,
        ledger: &mut L,
        registry: &R,
        token: &TokenId,
        stable_amount: u128,
        min_out: u128,
        recipient: &AccountId,
        now: u64,
    ) -> Result<(u128, u128)> {
        let quote = self.quote_buy(registry, token, stable_amount)?;
        if quote.amount < min_out {
            return Err(MarketError::Slippage);
        }

        ledger.mint(recipient, quote.amount)?;
        if quote.fee > 0 {
            let dev = self.dev;
            ledger.mint(&dev, quote.fee)?;
        }
        self.engine
            .commit_buy(&quote, ledger.total_supply(), now)?;

        debug!(
            "buy: worth={} amount={} fee={} price={} floor={}",
            quote.worth,
            quote.amount,
            quote.fee,
            self.engine.curve.price,
            self.engine.curve.floor_price
        );
        Ok((quote.amount, quote.fee))
    }

    // ========================================
    // Sell
    // ========================================

    /// Quote selling `amount` of the asset for `token`. Returns the curve
    /// quote plus the payout in the token's native decimals (floored).
    /// Read-only.
    pub fn quote_sell<L: TokenLedger, R: StableRegistry>(
        &self,
        ledger: &L,
        registry: &R,
        amount: u128,
        token: &TokenId,
    ) -> Result<(SellQuote, u128)> {
        let meta = self.sellable(registry, token)?;
        let quote = self.engine.quote_sell(amount, ledger.total_supply())?;
        let native = convert_decimals(quote.worth, SCALE_DECIMALS, meta.decimals)?;
        Ok((quote, native))
    }

    /// Sell `amount` of the asset. The gross amount burns from `seller` and
    /// the fee re-mints to the dev account; the host pays out the returned
    /// native worth. Returns `(worth_native, fee)`.
    pub fn sell<L: TokenLedger, R: StableRegistry>(
        &mut self,
        ledger: &mut L,
        registry: &R,
        amount: u128,
        token: &TokenId,
        min_out: u128,
        seller: &AccountId,
        now: u64,
    ) -> Result<(u128, u128)> {
        let (quote, native) = self.quote_sell(ledger, registry, amount, token)?;
        if native < min_out {
            return Err(MarketError::Slippage);
        }

        ledger.burn_from(seller, amount)?;
        if quote.fee > 0 {
            let dev = self.dev;
            ledger.mint(&dev, quote.fee)?;
        }
        self.engine
            .commit_sell(&quote, ledger.total_supply(), now)?;

        debug!(
            "sell: net={} worth={} fee={} price={} floor={}",
            quote.net,
            quote.worth,
            quote.fee,
            self.engine.curve.price,
            self.engine.curve.floor_price
        );
        Ok((native, quote.fee))
    }

    // ========================================
    // Realize
    // ========================================

    /// Quote converting `amount` claim tokens at the floor price. Returns
    /// `(worth_18dec, worth_native)`, both rounded up. Read-only.
    pub fn quote_realize<R: StableRegistry>(
        &self,
        registry: &R,
        amount: u128,
        token: &TokenId,
    ) -> Result<(u128, u128)> {
        let meta = self.buyable(registry, token)?;
        let worth = self.engine.quote_realize(amount)?;
        let native = convert_decimals_ceil(worth, SCALE_DECIMALS, meta.decimals)?;
        Ok((worth, native))
    }

    /// Realize `amount` claim tokens into the asset at the floor price. The
    /// host collects the returned native worth from `account`. Fails when
    /// the charge exceeds `max_worth` (native units).
    pub fn realize<L: TokenLedger, R: StableRegistry>(
        &mut self,
        ledger: &mut L,
        registry: &R,
        amount: u128,
        token: &TokenId,
        max_worth: u128,
        account: &AccountId,
        now: u64,
    ) -> Result<u128> {
        let (worth, native) = self.quote_realize(registry, amount, token)?;
        if native == 0 {
            return Err(MarketError::ZeroAmount);
        }
        if native > max_worth {
            return Err(MarketError::Slippage);
        }

        ledger.burn_voucher_from(account, amount)?;
        ledger.mint(account, amount)?;
        self.engine
            .commit_realize(amount, worth, ledger.total_supply(), now)?;

        debug!(
            "realize: amount={} worth={} floor={}",
            amount, worth, self.engine.curve.floor_price
        );
        Ok(native)
    }

    // ========================================
    // Burn
    // ========================================

    /// Burn `amount` of the asset from `from` with no payout; the curve
    /// re-solves in place, concentrating backing into a higher floor or a
    /// steeper curve.
    pub fn burn<L: TokenLedger>(
        &mut self,
        ledger: &mut L,
        amount: u128,
        from: &AccountId,
        now: u64,
    ) -> Result<()> {
        let plan = self.engine.quote_burn(amount, ledger.total_supply())?;
        ledger.burn_from(from, amount)?;
        self.engine.commit_burn(&plan, ledger.total_supply(), now);

        debug!(
            "burn: amount={} price={} floor={}",
            amount, self.engine.curve.price, self.engine.curve.floor_price
        );
        Ok(())
    }

    // ========================================
    // Ratio Maintenance
    // ========================================

    /// Public entry for time-based target lowering; a no-op while the
    /// lowering interval has not elapsed.
    pub fn lower_and_adjust<L: TokenLedger>(&mut self, ledger: &L, now: u64) -> Result<()> {
        if !self.engine.is_started() {
            return Err(MarketError::NotStarted);
        }
        self.engine.lower_and_adjust(ledger.total_supply(), now);
        Ok(())
    }

    /// Preview the floor price a buy-triggered raise would produce at the
    /// supply where the current curve reaches `target_adjusted`. Read-only.
    pub fn estimate_raise_price<L: TokenLedger>(&self, ledger: &L) -> Result<RaisePreview> {
        Ok(self.engine.estimate_raise_price(ledger.total_supply())?)
    }

    // ========================================
    // Validation Helpers
    // ========================================

    fn buyable<R: StableRegistry>(&self, registry: &R, token: &TokenId) -> Result<StableMeta> {
        match registry.stable(token) {
            Some(meta) if meta.buy_enabled => Ok(meta),
            _ => Err(MarketError::TokenNotApproved),
        }
    }

    fn sellable<R: StableRegistry>(&self, registry: &R, token: &TokenId) -> Result<StableMeta> {
        match registry.stable(token) {
            Some(meta) if meta.sell_enabled => Ok(meta),
            _ => Err(MarketError::TokenNotApproved),
        }
    }
}
