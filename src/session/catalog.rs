//! Contract Catalog
//!
//! The in-memory contract catalog loaded at login. Read-only after login and
//! safe to share; symbol listings and lookups never need an upstream round
//! trip.
//!
//! Near-month and next-month pseudo-symbols (family prefix + `R1`/`R2`)
//! denote a role rather than a specific contract series; the quote pipeline
//! binds them to real exchange codes at runtime.

use std::collections::{BTreeMap, HashMap};

use crate::broker::ContractInfo;
use crate::models::{SymbolSummary, SymbolsResult};

/// Strip the pseudo-symbol role suffix, returning the family prefix.
///
/// `TMFR1` → `Some("TMF")`; a concrete symbol returns `None`.
#[must_use]
pub fn pseudo_family(symbol: &str) -> Option<&str> {
    let family = symbol.strip_suffix("R1").or_else(|| symbol.strip_suffix("R2"))?;
    if !family.is_empty() && family.chars().all(|c| c.is_ascii_uppercase()) {
        Some(family)
    } else {
        None
    }
}

/// Whether a symbol is a near-month/next-month pseudo-symbol.
#[must_use]
pub fn is_pseudo_symbol(symbol: &str) -> bool {
    pseudo_family(symbol).is_some()
}

/// Immutable lookup structure over the contract catalog.
#[derive(Debug, Default)]
pub struct ContractCatalog {
    by_symbol: HashMap<String, ContractInfo>,
    symbol_by_code: HashMap<String, String>,
    families: BTreeMap<String, Vec<String>>,
}

impl ContractCatalog {
    /// Index the contracts, keeping only the supported product families.
    /// An empty `supported` list keeps everything.
    #[must_use]
    pub fn new(contracts: Vec<ContractInfo>, supported: &[String]) -> Self {
        let mut by_symbol = HashMap::new();
        let mut symbol_by_code = HashMap::new();
        let mut families: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for contract in contracts {
            if !supported.is_empty() && !supported.contains(&contract.category) {
                continue;
            }
            symbol_by_code
                .insert(contract.code.clone(), contract.symbol.clone());
            families
                .entry(contract.category.clone())
                .or_default()
                .push(contract.symbol.clone());
            by_symbol.insert(contract.symbol.clone(), contract);
        }
        for symbols in families.values_mut() {
            symbols.sort();
        }

        Self {
            by_symbol,
            symbol_by_code,
            families,
        }
    }

    /// Look up a contract by client-facing symbol.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<&ContractInfo> {
        self.by_symbol.get(symbol)
    }

    /// Look up a contract by exchange code.
    #[must_use]
    pub fn by_code(&self, code: &str) -> Option<&ContractInfo> {
        self.symbol_by_code
            .get(code)
            .and_then(|symbol| self.by_symbol.get(symbol))
    }

    /// Number of contracts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    /// Symbol listing grouped by product family.
    #[must_use]
    pub fn grouped(&self) -> SymbolsResult {
        let families: BTreeMap<String, Vec<SymbolSummary>> = self
            .families
            .iter()
            .map(|(family, symbols)| {
                let summaries = symbols
                    .iter()
                    .filter_map(|symbol| self.by_symbol.get(symbol))
                    .map(|contract| SymbolSummary {
                        symbol: contract.symbol.clone(),
                        code: contract.code.clone(),
                        name: contract.name.clone(),
                    })
                    .collect();
                (family.clone(), summaries)
            })
            .collect();
        let count = self.by_symbol.len();
        SymbolsResult { families, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    use crate::broker::ProductKind;

    fn contract(symbol: &str, code: &str, family: &str) -> ContractInfo {
        ContractInfo {
            symbol: symbol.to_string(),
            code: code.to_string(),
            name: symbol.to_string(),
            category: family.to_string(),
            delivery_month: "202602".to_string(),
            product: ProductKind::Futures,
            unit: 1,
            limit_up: Decimal::new(1, 0),
            limit_down: Decimal::new(1, 0),
            reference: Decimal::new(1, 0),
        }
    }

    #[test]
    fn pseudo_symbol_detection() {
        assert_eq!(pseudo_family("TMFR1"), Some("TMF"));
        assert_eq!(pseudo_family("MXFR2"), Some("MXF"));
        assert_eq!(pseudo_family("TMF202602"), None);
        assert_eq!(pseudo_family("R1"), None);
        assert!(is_pseudo_symbol("TXFR1"));
        assert!(!is_pseudo_symbol("TXFB6"));
    }

    #[test]
    fn lookups_by_symbol_and_code() {
        let catalog = ContractCatalog::new(
            vec![
                contract("TMF202602", "TMFB6", "TMF"),
                contract("TMFR1", "TMFR1", "TMF"),
            ],
            &[],
        );
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("TMF202602").unwrap().code, "TMFB6");
        assert_eq!(catalog.by_code("TMFB6").unwrap().symbol, "TMF202602");
        assert!(catalog.get("XXX").is_none());
    }

    #[test]
    fn unsupported_families_are_dropped() {
        let catalog = ContractCatalog::new(
            vec![
                contract("TMF202602", "TMFB6", "TMF"),
                contract("GDF202602", "GDFB6", "GDF"),
            ],
            &["TMF".to_string()],
        );
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("GDF202602").is_none());
    }

    #[test]
    fn grouped_listing_sorts_within_family() {
        let catalog = ContractCatalog::new(
            vec![
                contract("TMFR1", "TMFR1", "TMF"),
                contract("TMF202602", "TMFB6", "TMF"),
                contract("MXF202602", "MXFB6", "MXF"),
            ],
            &[],
        );
        let result = catalog.grouped();
        assert_eq!(result.count, 3);
        let tmf = &result.families["TMF"];
        assert_eq!(tmf[0].symbol, "TMF202602");
        assert_eq!(tmf[1].symbol, "TMFR1");
        assert!(result.families.contains_key("MXF"));
    }
}
