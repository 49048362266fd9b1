//! Market detection and symbol normalization.
//!
//! Single source of truth for mapping a ticker symbol to its market and
//! canonical form. Rules, in priority order: explicit exchange suffix,
//! 6-digit A-share prefix, commodity product whitelist, else US.

use super::types::MarketKind;

/// A-share code prefix to exchange suffix (for bare 6-digit codes).
const CN_PREFIX_RULES: [(&str, &str); 4] = [
    ("60", "SS"), // Shanghai main board
    ("68", "SS"), // Shanghai STAR market
    ("00", "SZ"), // Shenzhen main board
    ("30", "SZ"), // Shenzhen ChiNext
];

/// Commodity futures product codes.
const COMMODITY_PRODUCTS: [&str; 5] = ["au", "ag", "cu", "al", "m"];

/// Futures exchange prefixes that may precede a commodity contract.
const FUTURES_EXCHANGES: [&str; 4] = ["shfe", "dce", "czce", "ine"];

fn cn_exchange_for_prefix(prefix: &str) -> Option<&'static str> {
    CN_PREFIX_RULES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, e)| *e)
}

/// Whether a symbol names a commodity futures product.
///
/// Recognizes `au`, `au2604` and `SHFE.au2604` shapes.
pub fn is_commodity_symbol(symbol: &str) -> bool {
    let s = symbol.trim().to_lowercase();
    let body = match s.split_once('.') {
        Some((prefix, rest)) => {
            if FUTURES_EXCHANGES.contains(&prefix) {
                rest.to_string()
            } else {
                return false;
            }
        }
        None => s,
    };
    let product: String = body.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    !product.is_empty() && COMMODITY_PRODUCTS.contains(&product.as_str())
}

/// Detect which market a symbol belongs to.
pub fn detect_market(symbol: &str) -> MarketKind {
    let upper = symbol.trim().to_uppercase();

    // 1. Explicit suffix wins
    if upper.ends_with(".HK") {
        return MarketKind::Hk;
    }
    if upper.ends_with(".SS") || upper.ends_with(".SZ") || upper.ends_with(".SH") {
        return MarketKind::Cn;
    }

    // 2. Bare 6-digit A-share codes
    let base = upper.split('.').next().unwrap_or(&upper);
    if base.len() == 6 && base.chars().all(|c| c.is_ascii_digit()) {
        if cn_exchange_for_prefix(&base[..2]).is_some() {
            return MarketKind::Cn;
        }
    }

    // 3. Commodity futures before the US default
    if is_commodity_symbol(symbol) {
        return MarketKind::Commodity;
    }

    MarketKind::Us
}

/// Detect market plus the specific exchange code (SS/SZ/HK, None for US).
pub fn detect_market_with_exchange(symbol: &str) -> (MarketKind, Option<&'static str>) {
    let upper = symbol.trim().to_uppercase();

    if upper.ends_with(".HK") {
        return (MarketKind::Hk, Some("HK"));
    }
    if upper.ends_with(".SS") || upper.ends_with(".SH") {
        return (MarketKind::Cn, Some("SS"));
    }
    if upper.ends_with(".SZ") {
        return (MarketKind::Cn, Some("SZ"));
    }

    let base = upper.split('.').next().unwrap_or(&upper);
    if base.len() == 6 && base.chars().all(|c| c.is_ascii_digit()) {
        if let Some(exchange) = cn_exchange_for_prefix(&base[..2]) {
            return (MarketKind::Cn, Some(exchange));
        }
    }

    (MarketKind::Us, None)
}

/// Normalize a symbol to its canonical form.
///
/// Bare 6-digit A-share codes get `.SS`/`.SZ` appended; bare or
/// `.HK`-suffixed numeric codes are left-padded to 4 digits. The function
/// is idempotent.
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();

    if let Some(base) = upper.strip_suffix(".HK") {
        if !base.is_empty() && base.chars().all(|c| c.is_ascii_digit()) {
            let stripped = base.trim_start_matches('0');
            let stripped = if stripped.is_empty() { "0" } else { stripped };
            return format!("{:0>4}.HK", stripped);
        }
        return upper;
    }

    if upper.ends_with(".SS") || upper.ends_with(".SZ") || upper.ends_with(".SH") {
        return upper;
    }

    let base = upper.split('.').next().unwrap_or(&upper);
    if !base.is_empty() && base.chars().all(|c| c.is_ascii_digit()) {
        if base.len() == 6 {
            if let Some(exchange) = cn_exchange_for_prefix(&base[..2]) {
                return format!("{base}.{exchange}");
            }
        }
        // Numeric but not an A-share code: treat as HK board lot code
        let stripped = base.trim_start_matches('0');
        let stripped = if stripped.is_empty() { "0" } else { stripped };
        if stripped.len() <= 5 {
            return format!("{:0>4}.HK", stripped);
        }
    }

    upper
}

/// Indices, futures and macro tickers needing special handling upstream.
const MACRO_TICKERS: [&str; 14] = [
    "^GSPC", "^DJI", "^IXIC", "^RUT", "^VIX", "^TNX", "^TYX", "^FVX", "DX-Y.NYB", "GC=F", "CL=F",
    "SI=F", "^FTSE", "^HSI",
];

const INDEX_ETFS: [&str; 6] = ["SPY", "QQQ", "IWM", "DIA", "VOO", "VTI"];

pub fn is_macro_ticker(symbol: &str) -> bool {
    if MACRO_TICKERS.contains(&symbol) || symbol.starts_with('^') {
        return true;
    }
    symbol.ends_with("=F") || symbol.ends_with(".NYB")
}

pub fn is_index_etf(symbol: &str) -> bool {
    INDEX_ETFS.contains(&symbol.to_uppercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_suffix() {
        assert_eq!(detect_market("0700.HK"), MarketKind::Hk);
        assert_eq!(detect_market("600519.SS"), MarketKind::Cn);
        assert_eq!(detect_market("000001.SZ"), MarketKind::Cn);
        assert_eq!(detect_market("600000.SH"), MarketKind::Cn);
    }

    #[test]
    fn detects_bare_a_share_codes() {
        assert_eq!(detect_market("600519"), MarketKind::Cn);
        assert_eq!(detect_market("688981"), MarketKind::Cn);
        assert_eq!(detect_market("000001"), MarketKind::Cn);
        assert_eq!(detect_market("300750"), MarketKind::Cn);
    }

    #[test]
    fn detects_commodities() {
        assert_eq!(detect_market("au"), MarketKind::Commodity);
        assert_eq!(detect_market("au2604"), MarketKind::Commodity);
        assert_eq!(detect_market("SHFE.au2604"), MarketKind::Commodity);
        assert_eq!(detect_market("m2605"), MarketKind::Commodity);
        assert!(!is_commodity_symbol("AAPL"));
        assert!(!is_commodity_symbol("BRK.B"));
    }

    #[test]
    fn defaults_to_us() {
        assert_eq!(detect_market("AAPL"), MarketKind::Us);
        assert_eq!(detect_market("MSFT"), MarketKind::Us);
        // 6-digit code with unknown prefix is not an A-share
        assert_eq!(detect_market("123456"), MarketKind::Us);
    }

    #[test]
    fn exchange_detection() {
        assert_eq!(
            detect_market_with_exchange("600519"),
            (MarketKind::Cn, Some("SS"))
        );
        assert_eq!(
            detect_market_with_exchange("000001"),
            (MarketKind::Cn, Some("SZ"))
        );
        assert_eq!(
            detect_market_with_exchange("0700.HK"),
            (MarketKind::Hk, Some("HK"))
        );
        assert_eq!(detect_market_with_exchange("AAPL"), (MarketKind::Us, None));
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_symbol("600519"), "600519.SS");
        assert_eq!(normalize_symbol("000001"), "000001.SZ");
        assert_eq!(normalize_symbol("AAPL"), "AAPL");
        assert_eq!(normalize_symbol("aapl"), "AAPL");
        assert_eq!(normalize_symbol("0700.HK"), "0700.HK");
        assert_eq!(normalize_symbol("700"), "0700.HK");
        assert_eq!(normalize_symbol("179.HK"), "0179.HK");
        assert_eq!(normalize_symbol("00700.HK"), "0700.HK");
    }

    #[test]
    fn normalization_is_idempotent() {
        for symbol in [
            "AAPL", "600519", "000001", "700", "179.HK", "0700.HK", "au2604", "^VIX",
        ] {
            let once = normalize_symbol(symbol);
            assert_eq!(normalize_symbol(&once), once, "not idempotent for {symbol}");
        }
    }

    #[test]
    fn normalization_preserves_market() {
        for symbol in ["AAPL", "600519", "000001", "0700.HK", "au2604"] {
            assert_eq!(
                detect_market(&normalize_symbol(symbol)),
                detect_market(symbol),
                "market changed for {symbol}"
            );
        }
    }

    #[test]
    fn macro_and_etf_predicates() {
        assert!(is_macro_ticker("^VIX"));
        assert!(is_macro_ticker("GC=F"));
        assert!(is_macro_ticker("DX-Y.NYB"));
        assert!(!is_macro_ticker("AAPL"));
        assert!(is_index_etf("spy"));
        assert!(!is_index_etf("AAPL"));
    }
}
