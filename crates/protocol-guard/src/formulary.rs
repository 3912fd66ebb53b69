//! Formulary: permitted substances and their safe dose ranges
//!
//! Ranges are keyed by substance and route, with separate adult and
//! weight-based pediatric ranges. Mass units (mcg, mg, g) are comparable with
//! each other; every other unit only compares with itself.
//!
//! The built-in table can be replaced by a TOML, YAML or JSON file with the
//! same shape:
//!
//! ```yaml
//! substances:
//!   - name: epinephrine
//!     routes:
//!       - routes: [iv, io]
//!         adult: { min: 0.01, max: 1, unit: mg }
//!         pediatric_per_kg: { min: 0.01, max: 0.01, unit: mg }
//! unauthorized: [ketamine]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::Result;
use crate::extract::DoseMention;

const EPSILON: f64 = 1e-9;

/// Unit a dose is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseUnit {
    Mcg,
    Mg,
    G,
    #[serde(rename = "ml")]
    Ml,
    Units,
    #[serde(rename = "meq")]
    MEq,
}

impl DoseUnit {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mcg" | "ug" | "µg" | "microgram" | "micrograms" => Some(DoseUnit::Mcg),
            "mg" | "milligram" | "milligrams" => Some(DoseUnit::Mg),
            "g" | "gm" | "gram" | "grams" => Some(DoseUnit::G),
            "ml" | "cc" => Some(DoseUnit::Ml),
            "unit" | "units" | "u" => Some(DoseUnit::Units),
            "meq" => Some(DoseUnit::MEq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DoseUnit::Mcg => "mcg",
            DoseUnit::Mg => "mg",
            DoseUnit::G => "g",
            DoseUnit::Ml => "mL",
            DoseUnit::Units => "units",
            DoseUnit::MEq => "mEq",
        }
    }

    /// Milligrams per unit, for mass units only
    fn mg_factor(&self) -> Option<f64> {
        match self {
            DoseUnit::Mcg => Some(0.001),
            DoseUnit::Mg => Some(1.0),
            DoseUnit::G => Some(1_000.0),
            _ => None,
        }
    }

    /// Express `amount` of this unit in `target`, if the units are comparable
    pub fn convert(&self, amount: f64, target: DoseUnit) -> Option<f64> {
        if *self == target {
            return Some(amount);
        }
        let from = self.mg_factor()?;
        let to = target.mg_factor()?;
        Some(amount * from / to)
    }
}

impl fmt::Display for DoseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Administration route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Iv,
    Io,
    Im,
    In,
    Po,
    Sl,
    Et,
    Neb,
    #[serde(rename = "subq")]
    SubQ,
}

impl Route {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "iv" | "ivp" | "iv/io" | "intravenous" | "intravenously" => Some(Route::Iv),
            "io" | "intraosseous" => Some(Route::Io),
            "im" | "intramuscular" | "intramuscularly" => Some(Route::Im),
            "in" | "intranasal" | "intranasally" => Some(Route::In),
            "po" | "oral" | "orally" => Some(Route::Po),
            "sl" | "sublingual" | "sublingually" => Some(Route::Sl),
            "et" | "endotracheal" => Some(Route::Et),
            "neb" | "nebulized" | "nebulizer" | "inhaled" => Some(Route::Neb),
            "sq" | "subq" | "sc" | "subcutaneous" => Some(Route::SubQ),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Iv => "IV",
            Route::Io => "IO",
            Route::Im => "IM",
            Route::In => "IN",
            Route::Po => "PO",
            Route::Sl => "SL",
            Route::Et => "ET",
            Route::Neb => "NEB",
            Route::SubQ => "SQ",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive dose range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoseRange {
    pub min: f64,
    pub max: f64,
    pub unit: DoseUnit,
}

impl DoseRange {
    pub fn new(min: f64, max: f64, unit: DoseUnit) -> Self {
        Self { min, max, unit }
    }

    pub fn contains(&self, amount: f64) -> bool {
        amount >= self.min - EPSILON && amount <= self.max + EPSILON
    }

    /// Same range expressed in `unit`
    pub fn to_unit(&self, unit: DoseUnit) -> Option<DoseRange> {
        Some(DoseRange {
            min: self.unit.convert(self.min, unit)?,
            max: self.unit.convert(self.max, unit)?,
            unit,
        })
    }

    /// Human-readable form, `"0.01-1 mg"` or `"0.1-0.2 mg/kg"`
    pub fn describe(&self, per_kg: bool) -> String {
        if per_kg {
            format!("{}-{} {}/kg", self.min, self.max, self.unit)
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for DoseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} {}", self.min, self.max, self.unit)
    }
}

/// Ranges for one or more equivalent routes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRange {
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adult: Option<DoseRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pediatric_per_kg: Option<DoseRange>,
}

/// One permitted substance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormularyEntry {
    pub name: String,
    pub routes: Vec<RouteRange>,
}

impl FormularyEntry {
    pub fn ranges_for(&self, route: Option<Route>) -> Vec<&RouteRange> {
        match route {
            Some(route) => self
                .routes
                .iter()
                .filter(|r| r.routes.contains(&route))
                .collect(),
            None => self.routes.iter().collect(),
        }
    }
}

/// Outcome of checking a dose against the formulary
#[derive(Debug, Clone, PartialEq)]
pub enum DoseCheck {
    InRange { range: String },
    OutOfRange { range: String },
    /// Known substance that is not permitted
    Unauthorized,
    /// Substance the formulary does not list at all
    Unlisted,
    /// No comparable range exists; not a reason to block
    Unknown { reason: String },
}

/// The authoritative list of permitted substances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formulary {
    pub substances: Vec<FormularyEntry>,
    /// Recognised substances that are outside the permitted list
    #[serde(default)]
    pub unauthorized: Vec<String>,
}

impl Default for Formulary {
    fn default() -> Self {
        use DoseUnit::{Mcg, Mg, G, MEq};
        use Route::*;

        let entry = |name: &str, routes: Vec<RouteRange>| FormularyEntry {
            name: name.to_string(),
            routes,
        };
        let range = |routes: &[Route], adult: Option<(f64, f64, DoseUnit)>, peds: Option<(f64, f64, DoseUnit)>| {
            RouteRange {
                routes: routes.to_vec(),
                adult: adult.map(|(min, max, unit)| DoseRange::new(min, max, unit)),
                pediatric_per_kg: peds.map(|(min, max, unit)| DoseRange::new(min, max, unit)),
            }
        };

        Self {
            substances: vec![
                entry(
                    "epinephrine",
                    vec![
                        range(&[Iv, Io], Some((0.01, 1.0, Mg)), Some((0.01, 0.01, Mg))),
                        range(&[Im], Some((0.3, 0.5, Mg)), Some((0.01, 0.01, Mg))),
                    ],
                ),
                entry(
                    "amiodarone",
                    vec![range(&[Iv, Io], Some((150.0, 300.0, Mg)), Some((5.0, 5.0, Mg)))],
                ),
                entry(
                    "adenosine",
                    vec![range(&[Iv, Io], Some((6.0, 12.0, Mg)), Some((0.1, 0.2, Mg)))],
                ),
                entry(
                    "atropine",
                    vec![range(&[Iv, Io], Some((0.5, 1.0, Mg)), Some((0.02, 0.02, Mg)))],
                ),
                entry(
                    "midazolam",
                    vec![
                        range(&[Iv, Io], Some((2.0, 5.0, Mg)), Some((0.1, 0.2, Mg))),
                        range(&[Im, In], Some((5.0, 10.0, Mg)), Some((0.1, 0.2, Mg))),
                    ],
                ),
                entry(
                    "naloxone",
                    vec![
                        range(&[Iv, Io, Im], Some((0.4, 2.0, Mg)), Some((0.1, 0.1, Mg))),
                        range(&[In], Some((2.0, 4.0, Mg)), Some((0.1, 0.1, Mg))),
                    ],
                ),
                entry("nitroglycerin", vec![range(&[Sl], Some((0.4, 0.8, Mg)), None)]),
                entry("aspirin", vec![range(&[Po], Some((162.0, 325.0, Mg)), None)]),
                entry(
                    "fentanyl",
                    vec![range(&[Iv, Io, Im, In], Some((25.0, 100.0, Mcg)), Some((1.0, 1.5, Mcg)))],
                ),
                entry(
                    "ondansetron",
                    vec![range(&[Iv, Io, Im, Po], Some((4.0, 8.0, Mg)), Some((0.1, 0.15, Mg)))],
                ),
                entry(
                    "diphenhydramine",
                    vec![range(&[Iv, Io, Im], Some((25.0, 50.0, Mg)), Some((1.0, 1.0, Mg)))],
                ),
                entry(
                    "dextrose",
                    vec![range(&[Iv, Io], Some((12.5, 25.0, G)), Some((0.5, 1.0, G)))],
                ),
                entry("albuterol", vec![range(&[Neb], Some((2.5, 5.0, Mg)), None)]),
                entry("glucagon", vec![range(&[Im], Some((1.0, 1.0, Mg)), None)]),
                entry(
                    "calcium chloride",
                    vec![range(&[Iv, Io], Some((1.0, 1.0, G)), Some((20.0, 20.0, Mg)))],
                ),
                entry(
                    "sodium bicarbonate",
                    vec![range(&[Iv, Io], Some((50.0, 50.0, MEq)), Some((1.0, 1.0, MEq)))],
                ),
            ],
            unauthorized: [
                "ketamine",
                "propofol",
                "etomidate",
                "succinylcholine",
                "rocuronium",
                "vecuronium",
                "lorazepam",
                "diazepam",
                "haloperidol",
                "hydromorphone",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Formulary {
    /// Load a formulary table from a TOML, YAML or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let formulary: Formulary = protocol_guard_core::config::load_file(path)?;
        tracing::info!(
            substances = formulary.substances.len(),
            unauthorized = formulary.unauthorized.len(),
            "Loaded formulary"
        );
        Ok(formulary)
    }

    pub fn entry(&self, substance: &str) -> Option<&FormularyEntry> {
        self.substances
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(substance))
    }

    pub fn is_authorized(&self, substance: &str) -> bool {
        self.entry(substance).is_some()
    }

    pub fn is_unauthorized(&self, substance: &str) -> bool {
        self.unauthorized
            .iter()
            .any(|s| s.eq_ignore_ascii_case(substance))
    }

    /// Every substance name the extractor should recognise
    pub fn known_substances(&self) -> impl Iterator<Item = &str> {
        self.substances
            .iter()
            .map(|e| e.name.as_str())
            .chain(self.unauthorized.iter().map(String::as_str))
    }

    /// Check a dose mention
    ///
    /// With no route the dose is compared with the envelope of every route;
    /// per-kg doses use the pediatric ranges.
    pub fn check(&self, dose: &DoseMention) -> DoseCheck {
        if self.is_unauthorized(&dose.substance) {
            return DoseCheck::Unauthorized;
        }
        let Some(entry) = self.entry(&dose.substance) else {
            return DoseCheck::Unlisted;
        };

        let candidates = entry.ranges_for(dose.route);
        if candidates.is_empty() {
            return DoseCheck::Unknown {
                reason: format!(
                    "no range for {} via {}",
                    dose.substance,
                    dose.route.map(|r| r.as_str()).unwrap_or("any route")
                ),
            };
        }

        let ranges: Vec<DoseRange> = candidates
            .iter()
            .filter_map(|r| {
                if dose.per_kg {
                    r.pediatric_per_kg
                } else {
                    r.adult
                }
            })
            .collect();

        let Some(envelope) = envelope(&ranges) else {
            return DoseCheck::Unknown {
                reason: format!(
                    "no {} range for {}",
                    if dose.per_kg { "weight-based" } else { "adult" },
                    dose.substance
                ),
            };
        };

        let mut in_range = true;
        for amount in dose.amounts() {
            match dose.unit.convert(amount, envelope.unit) {
                Some(converted) => in_range &= envelope.contains(converted),
                None => {
                    return DoseCheck::Unknown {
                        reason: format!(
                            "{} is not comparable with {}",
                            dose.unit, envelope.unit
                        ),
                    }
                }
            }
        }

        let range = envelope.describe(dose.per_kg);
        if in_range {
            DoseCheck::InRange { range }
        } else {
            DoseCheck::OutOfRange { range }
        }
    }
}

/// Smallest range covering all comparable ranges, in the first range's unit
fn envelope(ranges: &[DoseRange]) -> Option<DoseRange> {
    let first = ranges.first()?;
    let mut result = *first;
    for range in &ranges[1..] {
        if let Some(converted) = range.to_unit(first.unit) {
            result.min = result.min.min(converted.min);
            result.max = result.max.max(converted.max);
        }
    }
    Some(result)
}
