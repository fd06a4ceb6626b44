// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Which baselines, correlations and parameters take part in an operation.

mod error;

pub use error::SelectionError;

use std::{collections::BTreeSet, str::FromStr};

use glob::Pattern;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::store::{Baseline, Correlation};

/// Restricts a baseline selection to auto- or cross-correlations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum BaselineFilter {
    #[strum(serialize = "AUTO")]
    Auto,
    #[strum(serialize = "CROSS")]
    Cross,
    #[strum(serialize = "ALL")]
    All,
}

impl BaselineFilter {
    pub fn admits(self, baseline: Baseline) -> bool {
        match self {
            BaselineFilter::Auto => baseline.is_auto(),
            BaselineFilter::Cross => !baseline.is_auto(),
            BaselineFilter::All => true,
        }
    }
}

/// A baseline selection as given in a command. `station1[i]` and
/// `station2[i]` are regular expressions (matching whole station names) that
/// together select baselines. If both lists are empty, every station pair is
/// a candidate. `filter` is one of "AUTO", "CROSS" or "ALL".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineSelection {
    pub station1: Vec<String>,
    pub station2: Vec<String>,
    pub filter: String,
}

impl Default for BaselineSelection {
    fn default() -> Self {
        Self {
            station1: vec![],
            station2: vec![],
            filter: BaselineFilter::Cross.to_string(),
        }
    }
}

/// A set of selected baselines. Baselines are stored with the lower station
/// index first; lookups don't care about the order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineMask {
    pairs: BTreeSet<Baseline>,
}

impl BaselineMask {
    pub fn contains(&self, baseline: Baseline) -> bool {
        self.pairs.contains(&baseline.normalised())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Baseline> {
        self.pairs.iter()
    }

    /// The baselines of `available` that are selected, in their original
    /// order.
    pub fn apply(&self, available: &[Baseline]) -> Vec<Baseline> {
        available
            .iter()
            .copied()
            .filter(|&b| self.contains(b))
            .collect()
    }
}

fn anchored(pattern: &str) -> Result<Regex, SelectionError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| SelectionError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

/// Turn a [`BaselineSelection`] into a mask over the given stations.
///
/// # Errors
///
/// Fails if the filter isn't recognised, if the pattern lists have different
/// lengths, if a pattern isn't a valid regular expression or if nothing is
/// selected.
pub fn make_baseline_mask(
    selection: &BaselineSelection,
    stations: &[String],
) -> Result<BaselineMask, SelectionError> {
    let filter = BaselineFilter::from_str(&selection.filter)
        .map_err(|_| SelectionError::UnknownFilter(selection.filter.clone()))?;
    if selection.station1.len() != selection.station2.len() {
        return Err(SelectionError::PatternCountMismatch {
            station1: selection.station1.len(),
            station2: selection.station2.len(),
        });
    }

    let mut pairs = BTreeSet::new();
    if selection.station1.is_empty() {
        for p in 0..stations.len() {
            for q in p..stations.len() {
                if filter.admits(Baseline(p, q)) {
                    pairs.insert(Baseline(p, q));
                }
            }
        }
    } else {
        for (pattern1, pattern2) in selection.station1.iter().zip(&selection.station2) {
            let (re1, re2) = (anchored(pattern1)?, anchored(pattern2)?);
            for (p, name1) in stations.iter().enumerate() {
                if !re1.is_match(name1) {
                    continue;
                }
                for (q, name2) in stations.iter().enumerate() {
                    let baseline = Baseline(p, q);
                    if re2.is_match(name2) && filter.admits(baseline) {
                        pairs.insert(baseline.normalised());
                    }
                }
            }
        }
    }

    if pairs.is_empty() {
        return Err(SelectionError::EmptyBaselineSelection);
    }
    debug!("Selected {} baselines (filter {filter})", pairs.len());
    Ok(BaselineMask { pairs })
}

/// A set of selected correlations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationMask {
    set: BTreeSet<Correlation>,
}

impl CorrelationMask {
    pub fn contains(&self, corr: Correlation) -> bool {
        self.set.contains(&corr)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// The correlations of `available` that are selected, in their original
    /// order.
    pub fn apply(&self, available: &[Correlation]) -> Vec<Correlation> {
        available
            .iter()
            .copied()
            .filter(|&c| self.contains(c))
            .collect()
    }
}

/// Intersect the requested correlations with the available ones. An empty
/// request selects everything available.
///
/// # Errors
///
/// Fails if a requested name isn't a correlation, or if the intersection is
/// empty.
pub fn make_correlation_mask(
    requested: &[String],
    available: &[Correlation],
) -> Result<CorrelationMask, SelectionError> {
    let set: BTreeSet<Correlation> = if requested.is_empty() {
        available.iter().copied().collect()
    } else {
        let mut wanted = BTreeSet::new();
        for name in requested {
            let corr = Correlation::from_str(name.trim())
                .map_err(|_| SelectionError::UnknownCorrelation(name.clone()))?;
            wanted.insert(corr);
        }
        available
            .iter()
            .copied()
            .filter(|c| wanted.contains(c))
            .collect()
    };

    if set.is_empty() {
        return Err(SelectionError::EmptyCorrelationSelection {
            requested: requested.to_vec(),
        });
    }
    Ok(CorrelationMask { set })
}

/// Pair up equal items of `data` and `model`, as `(data index, model index)`,
/// in data order. Items only present on one side are left out.
pub fn make_correspondence<T: PartialEq>(data: &[T], model: &[T]) -> Vec<(usize, usize)> {
    data.iter()
        .enumerate()
        .filter_map(|(i, d)| model.iter().position(|m| m == d).map(|j| (i, j)))
        .collect()
}

/// The parameter names matching any of the `include` glob patterns and none
/// of the `exclude` patterns, in the order of `names`.
///
/// # Examples
///
/// ```
/// # use selfcal_kernel::selection::*;
/// # fn main() -> Result<(), SelectionError> {
/// let names = ["Gain:X:Real:CS001", "Gain:X:Imag:CS001", "Gain:Y:Real:CS001"];
/// let selected = select_parameters(&names, &["Gain:X:*".to_string()], &[])?;
/// assert_eq!(selected, vec!["Gain:X:Real:CS001", "Gain:X:Imag:CS001"]);
/// # Ok(())
/// # }
/// ```
pub fn select_parameters<S: AsRef<str>>(
    names: &[S],
    include: &[String],
    exclude: &[String],
) -> Result<Vec<String>, SelectionError> {
    let compile = |patterns: &[String]| {
        patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| SelectionError::InvalidGlob {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()
    };
    let include = compile(include)?;
    let exclude = compile(exclude)?;
    Ok(names
        .iter()
        .map(|n| n.as_ref())
        .filter(|n| include.iter().any(|p| p.matches(n)))
        .filter(|n| !exclude.iter().any(|p| p.matches(n)))
        .map(|n| n.to_string())
        .collect())
}
