//! Money math. All amounts are integer cents; VAT is a flat configured rate
//! expressed in permille and rounded half-up, so the result is stable across
//! platforms and never subject to float drift.

/// The price a buyer is charged for one unit: the sale price when set and
/// actually lower than the list price.
pub fn effective_price(price: i64, sale_price: Option<i64>) -> i64 {
    match sale_price {
        Some(sale) if sale < price => sale,
        _ => price,
    }
}

/// VAT on a subtotal, rounded half-up.
pub fn vat_cents(subtotal: i64, vat_permille: i64) -> i64 {
    (subtotal * vat_permille + 500) / 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartTotals {
    pub subtotal: i64,
    pub vat: i64,
    pub shipping: i64,
    pub total: i64,
}

pub fn cart_totals(subtotal: i64, vat_permille: i64, shipping: i64) -> CartTotals {
    let vat = vat_cents(subtotal, vat_permille);
    CartTotals {
        subtotal,
        vat,
        shipping,
        total: subtotal + vat + shipping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_units_at_19_99() {
        // 3 x $19.99 = $59.97; 7.5% VAT rounds 449.775c up to $4.50.
        let totals = cart_totals(3 * 1999, 75, 0);
        assert_eq!(totals.subtotal, 5997);
        assert_eq!(totals.vat, 450);
        assert_eq!(totals.total, 6447);
    }

    #[test]
    fn vat_rounds_half_up() {
        // 1.00 at 7.5% = 7.5c, rounds up to 8c.
        assert_eq!(vat_cents(100, 75), 8);
        assert_eq!(vat_cents(0, 75), 0);
        assert_eq!(vat_cents(1000, 75), 75);
    }

    #[test]
    fn shipping_is_added_after_vat() {
        let totals = cart_totals(1000, 75, 500);
        assert_eq!(totals.total, 1000 + 75 + 500);
    }

    #[test]
    fn effective_price_ignores_higher_sale() {
        assert_eq!(effective_price(1999, None), 1999);
        assert_eq!(effective_price(1999, Some(1499)), 1499);
        assert_eq!(effective_price(1999, Some(1999)), 1999);
        assert_eq!(effective_price(1999, Some(2999)), 1999);
    }
}
