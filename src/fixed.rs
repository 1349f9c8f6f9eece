// ============================================================================
// Fixed-Point Math for the Curve Engine
// ============================================================================
//
// All curve state is 18-decimal fixed point held in u128. Intermediate
// products routinely exceed 128 bits (the buy discriminant carries c²k²,
// which is 1e72-scale at unit price and unit slope), so every multi-term
// formula runs through U256 and narrows back down with an explicit range
// check. Overflow and division by zero are detected and reported as errors;
// nothing here wraps or saturates.

// The macro expansion refers to the unqualified `Result` type; isolate it in
// a submodule so the crate's `Result<T>` alias below does not shadow std's.
mod u256 {
    use uint::construct_uint;

    construct_uint! {
        /// Fixed-width 256-bit unsigned integer used for curve intermediates.
        pub struct U256(4);
    }
}
pub use u256::U256;

/// 18-decimal fixed-point scale (1e18).
pub const SCALE: u128 = 1_000_000_000_000_000_000;

/// Basis-point scale (10,000 bps = 100%).
pub const BPS_SCALE: u128 = 10_000;

/// Decimal count of the fixed-point scale.
pub const SCALE_DECIMALS: u8 = 18;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MathError {
    /// A product or narrowing exceeded the representable range.
    Overflow,

    /// A divisor was zero.
    DivisionByZero,
}

pub type Result<T> = core::result::Result<T, MathError>;

// ============================================================================
// Fixed18 - Scale-Typed 18-Decimal Quantity
// ============================================================================

/// An 18-decimal fixed-point quantity.
///
/// The newtype exists to keep 1e18-scaled state from mixing silently with
/// basis points, native token units, or raw counters. Arithmetic goes
/// through the checked helpers below; the wrapper itself only carries the
/// scale discipline.
#[repr(transparent)]
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
pub struct Fixed18(u128);

impl Fixed18 {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(SCALE);

    #[inline(always)]
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn get(self) -> u128 {
        self.0
    }

    #[inline(always)]
    pub fn set(&mut self, raw: u128) {
        self.0 = raw;
    }

    #[inline(always)]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn checked_add(self, rhs: u128) -> Result<Self> {
        self.0.checked_add(rhs).map(Self).ok_or(MathError::Overflow)
    }

    #[inline]
    pub fn checked_sub(self, rhs: u128) -> Result<Self> {
        self.0.checked_sub(rhs).map(Self).ok_or(MathError::Overflow)
    }

    /// Saturating add, for lifetime telemetry counters only.
    #[inline]
    pub fn saturating_add(self, rhs: u128) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl core::fmt::Display for Fixed18 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Checked U256 Helpers
// ============================================================================

#[inline]
pub fn mul_u256(a: U256, b: U256) -> Result<U256> {
    let (res, overflow) = a.overflowing_mul(b);
    if overflow {
        Err(MathError::Overflow)
    } else {
        Ok(res)
    }
}

#[inline]
pub fn add_u256(a: U256, b: U256) -> Result<U256> {
    let (res, overflow) = a.overflowing_add(b);
    if overflow {
        Err(MathError::Overflow)
    } else {
        Ok(res)
    }
}

#[inline]
pub fn div_u256(a: U256, b: U256) -> Result<U256> {
    if b.is_zero() {
        Err(MathError::DivisionByZero)
    } else {
        Ok(a / b)
    }
}

/// Narrow a U256 back to u128, erroring if the upper half is populated.
#[inline]
pub fn narrow_u256(value: U256) -> Result<u128> {
    if (value >> 128).is_zero() {
        Ok(value.low_u128())
    } else {
        Err(MathError::Overflow)
    }
}

// ============================================================================
// mulDiv - Full-Precision Multiply-Then-Divide
// ============================================================================

/// floor(x * y / d) with a 256-bit intermediate product.
pub fn mul_div_floor(x: u128, y: u128, d: u128) -> Result<u128> {
    if d == 0 {
        return Err(MathError::DivisionByZero);
    }
    let prod = U256::from(x) * U256::from(y); // 128x128 always fits in 256 bits
    narrow_u256(prod / U256::from(d))
}

/// ceil(x * y / d) with a 256-bit intermediate product.
pub fn mul_div_ceil(x: u128, y: u128, d: u128) -> Result<u128> {
    if d == 0 {
        return Err(MathError::DivisionByZero);
    }
    let prod = U256::from(x) * U256::from(y);
    let d = U256::from(d);
    let (q, r) = prod.div_mod(d);
    if r.is_zero() {
        narrow_u256(q)
    } else {
        narrow_u256(add_u256(q, U256::one())?)
    }
}

// ============================================================================
// Integer Square Root (Newton / Babylonian, floor)
// ============================================================================

/// floor(sqrt(y)) over the full 256-bit range. sqrt(0) == 0.
pub fn sqrt_u256(y: U256) -> U256 {
    if y.is_zero() {
        return U256::zero();
    }

    // Initial guess floor(y/2) + 1 >= sqrt(y) for all y >= 1, and cannot
    // overflow. Newton's iteration then descends monotonically to the floor.
    let mut z = (y >> 1) + U256::one();
    let mut x = y;
    while z < x {
        x = z;
        z = (y / z + z) >> 1;
    }
    x
}

/// floor(sqrt(y)) for u128 inputs.
pub fn sqrt(y: u128) -> u128 {
    sqrt_u256(U256::from(y)).low_u128()
}

// ============================================================================
// Decimal-Scale Conversion
// ============================================================================

fn pow10(exp: u32) -> Result<u128> {
    10u128.checked_pow(exp).ok_or(MathError::Overflow)
}

/// Rescale `value` from `src` decimals to `dst` decimals, flooring when the
/// conversion narrows. Identity when `src == dst`.
pub fn convert_decimals(value: u128, src: u8, dst: u8) -> Result<u128> {
    match dst.cmp(&src) {
        core::cmp::Ordering::Equal => Ok(value),
        core::cmp::Ordering::Greater => {
            let factor = pow10((dst - src) as u32)?;
            value.checked_mul(factor).ok_or(MathError::Overflow)
        }
        core::cmp::Ordering::Less => {
            let factor = pow10((src - dst) as u32)?;
            Ok(value / factor)
        }
    }
}

/// Rescale `value` from `src` decimals to `dst` decimals, rounding up when
/// the conversion narrows. Widening is exact and identical to the floor
/// variant.
pub fn convert_decimals_ceil(value: u128, src: u8, dst: u8) -> Result<u128> {
    match dst.cmp(&src) {
        core::cmp::Ordering::Equal => Ok(value),
        core::cmp::Ordering::Greater => convert_decimals(value, src, dst),
        core::cmp::Ordering::Less => {
            let factor = pow10((src - dst) as u32)?;
            let q = value / factor;
            if value % factor == 0 {
                Ok(q)
            } else {
                q.checked_add(1).ok_or(MathError::Overflow)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
