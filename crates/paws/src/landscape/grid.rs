//! Hypothesis grids parsed from parameter expressions such as
//! `m1=100_500_50,m2=300,mu=(0.0,0.01,0.05)`.
//!
//! Each comma-separated term names one parameter and its values:
//! - `name=min_max_step`: inclusive range
//! - `name=value`: a single value
//! - `name=(v1,v2,...)`: an explicit list
//!
//! Points are the Cartesian product of the axes in declaration order, the
//! last axis varying fastest.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{PawsError, Result};
use crate::result::ParameterEstimates;

/// A physical parameter a grid can fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridParam {
    M1,
    M2,
    Mu,
    Alpha,
}

impl GridParam {
    pub fn name(self) -> &'static str {
        match self {
            Self::M1 => "m1",
            Self::M2 => "m2",
            Self::Mu => "mu",
            Self::Alpha => "alpha",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "m1" => Ok(Self::M1),
            "m2" => Ok(Self::M2),
            "mu" => Ok(Self::Mu),
            "alpha" => Ok(Self::Alpha),
            other => Err(PawsError::config(format!(
                "unknown grid parameter '{other}' (expected m1, m2, mu or alpha)"
            ))),
        }
    }

    /// Mass component index for `m1` / `m2`.
    fn mass_index(self) -> Option<usize> {
        match self {
            Self::M1 => Some(0),
            Self::M2 => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for GridParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One named axis of a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridAxis {
    pub param: GridParam,
    pub values: Vec<f64>,
}

/// Parsed parameter expression. Serialized as the expression itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    expr: String,
    axes: Vec<GridAxis>,
}

/// One point of a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridPoint {
    /// Position in the grid's point order.
    pub index: usize,
    pub values: Vec<(GridParam, f64)>,
}

fn round_grid_value(v: f64) -> f64 {
    (v * 1e9).round() / 1e9
}

fn parse_number(s: &str, term: &str) -> Result<f64> {
    let v: f64 = s.trim().parse().map_err(|_| {
        PawsError::config(format!("invalid number '{s}' in grid term '{term}'"))
    })?;
    if !v.is_finite() {
        return Err(PawsError::config(format!(
            "non-finite value in grid term '{term}'"
        )));
    }
    Ok(v)
}

/// Split at commas outside parentheses.
fn split_terms(expr: &str) -> Result<Vec<&str>> {
    let mut terms = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(PawsError::config(format!("unbalanced ')' in '{expr}'")));
                }
            }
            ',' if depth == 0 => {
                terms.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PawsError::config(format!("unbalanced '(' in '{expr}'")));
    }
    terms.push(&expr[start..]);
    Ok(terms)
}

fn parse_values(rhs: &str, term: &str) -> Result<Vec<f64>> {
    if let Some(inner) = rhs.strip_prefix('(') {
        let inner = inner.strip_suffix(')').ok_or_else(|| {
            PawsError::config(format!("missing ')' in grid term '{term}'"))
        })?;
        let values = inner
            .split(',')
            .map(|v| parse_number(v, term))
            .collect::<Result<Vec<_>>>()?;
        return Ok(values);
    }

    let parts: Vec<&str> = rhs.split('_').collect();
    match parts.as_slice() {
        [value] => Ok(vec![parse_number(value, term)?]),
        [min, max, step] => {
            let (min, max, step) = (
                parse_number(min, term)?,
                parse_number(max, term)?,
                parse_number(step, term)?,
            );
            if step <= 0.0 {
                return Err(PawsError::config(format!(
                    "grid step must be > 0 in '{term}'"
                )));
            }
            if max < min {
                return Err(PawsError::config(format!(
                    "grid range max < min in '{term}'"
                )));
            }
            let n = ((max - min) / step + 1e-9).floor() as usize;
            Ok((0..=n)
                .map(|i| round_grid_value(min + i as f64 * step))
                .collect())
        }
        _ => Err(PawsError::config(format!(
            "grid term '{term}' must be name=value, name=min_max_step or name=(v1,v2,...)"
        ))),
    }
}

impl Grid {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(PawsError::config("empty parameter expression"));
        }
        let mut axes: Vec<GridAxis> = Vec::new();
        for term in split_terms(expr)? {
            let term = term.trim();
            let (name, rhs) = term.split_once('=').ok_or_else(|| {
                PawsError::config(format!("grid term '{term}' has no '='"))
            })?;
            let param = GridParam::parse(name.trim())?;
            if axes.iter().any(|a| a.param == param) {
                return Err(PawsError::config(format!(
                    "grid parameter '{param}' given twice"
                )));
            }
            let values = parse_values(rhs.trim(), term)?;
            axes.push(GridAxis { param, values });
        }
        Ok(Self {
            expr: expr.to_string(),
            axes,
        })
    }

    pub fn axes(&self) -> &[GridAxis] {
        &self.axes
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, param: GridParam) -> bool {
        self.axes.iter().any(|a| a.param == param)
    }

    /// Every point, last axis fastest.
    pub fn points(&self) -> Vec<GridPoint> {
        let total = self.len();
        (0..total)
            .map(|index| {
                let mut rest = index;
                let mut values = vec![(GridParam::M1, 0.0); self.axes.len()];
                for (slot, axis) in self.axes.iter().enumerate().rev() {
                    let n = axis.values.len();
                    values[slot] = (axis.param, axis.values[rest % n]);
                    rest /= n;
                }
                GridPoint { index, values }
            })
            .collect()
    }
}

impl FromStr for Grid {
    type Err = PawsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl Serialize for Grid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expr)
    }
}

impl<'de> Deserialize<'de> for Grid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let expr = String::deserialize(deserializer)?;
        Self::parse(&expr).map_err(serde::de::Error::custom)
    }
}

impl GridPoint {
    /// Named coordinate, e.g. `{"m1": 300.0, "mu": 0.01}`.
    pub fn coordinate(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .map(|(p, v)| (p.name().to_string(), *v))
            .collect()
    }

    /// Run configuration with every named parameter fixed at this point's
    /// value. Parameters the grid does not name keep the base mask.
    pub fn apply(&self, base: &RunConfig) -> Result<RunConfig> {
        let mut config = base.clone();
        let h = &mut config.hypothesis;
        for &(param, value) in &self.values {
            match param {
                GridParam::M1 | GridParam::M2 => {
                    let i = param.mass_index().unwrap_or_default();
                    let n = h.masses.len();
                    let mass = h.masses.get_mut(i).ok_or_else(|| {
                        PawsError::config(format!("grid names {param} but the hypothesis has {n} masses"))
                    })?;
                    *mass = value;
                    if !h.fixed_mass_components.contains(&i) {
                        h.fixed_mass_components.push(i);
                    }
                }
                GridParam::Mu => {
                    h.mu = value;
                    config.training.train_mu = Some(false);
                }
                GridParam::Alpha => {
                    if !h.has_alpha() {
                        return Err(PawsError::config(
                            "grid names alpha but only one decay mode is configured",
                        ));
                    }
                    h.alpha = value;
                    config.training.train_alpha = Some(false);
                }
            }
        }
        h.fixed_mass_components.sort_unstable();
        if h.fixed_mass_components.len() == h.masses.len() {
            config.training.train_mass = Some(false);
        }
        Ok(config)
    }

    /// Parameter values with this point's values substituted.
    pub fn apply_estimates(&self, base: &ParameterEstimates) -> Result<ParameterEstimates> {
        let mut estimates = base.clone();
        for &(param, value) in &self.values {
            match param {
                GridParam::M1 | GridParam::M2 => {
                    let i = param.mass_index().unwrap_or_default();
                    let n = estimates.masses.len();
                    let mass = estimates.masses.get_mut(i).ok_or_else(|| {
                        PawsError::config(format!("grid names {param} but the model has {n} masses"))
                    })?;
                    *mass = value;
                }
                GridParam::Mu => estimates.mu = value,
                GridParam::Alpha => {
                    let alpha = estimates.alpha.as_mut().ok_or_else(|| {
                        PawsError::config("grid names alpha but the model has one decay mode")
                    })?;
                    *alpha = value;
                }
            }
        }
        Ok(estimates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::DecayMode;

    #[test]
    fn test_parse_all_term_forms() {
        let grid = Grid::parse("m1=100_200_50, m2=300,mu=(0.0,0.01,0.05)").unwrap();
        assert_eq!(grid.axes().len(), 3);
        assert_eq!(grid.axes()[0].values, vec![100.0, 150.0, 200.0]);
        assert_eq!(grid.axes()[1].values, vec![300.0]);
        assert_eq!(grid.axes()[2].values, vec![0.0, 0.01, 0.05]);
        assert_eq!(grid.len(), 9);
    }

    #[test]
    fn test_fractional_range_is_inclusive() {
        let grid = Grid::parse("mu=0.1_0.3_0.1").unwrap();
        assert_eq!(grid.axes()[0].values, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_points_last_axis_fastest() {
        let grid = Grid::parse("m1=(100,200),mu=(0.0,0.5)").unwrap();
        let coords: Vec<(f64, f64)> = grid
            .points()
            .iter()
            .map(|p| (p.values[0].1, p.values[1].1))
            .collect();
        assert_eq!(
            coords,
            vec![(100.0, 0.0), (100.0, 0.5), (200.0, 0.0), (200.0, 0.5)]
        );
        assert_eq!(grid.points()[3].index, 3);
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "m3=100",
            "m1=100,m1=200",
            "m1=100_200_0",
            "m1=200_100_10",
            "m1=(100,200",
            "m1",
            "mu=abc",
            "m1=1_2",
        ] {
            assert!(Grid::parse(bad).is_err(), "'{bad}' should fail");
        }
    }

    #[test]
    fn test_serde_as_expression() {
        let grid = Grid::parse("m1=300,mu=(0.0,0.01)").unwrap();
        let json = serde_json::to_string(&grid).unwrap();
        assert_eq!(json, "\"m1=300,mu=(0.0,0.01)\"");
        let back: Grid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, grid);
        assert!(serde_json::from_str::<Grid>("\"q=1\"").is_err());
    }

    #[test]
    fn test_apply_fixes_named_parameters() {
        let grid = Grid::parse("m1=250,mu=0.05").unwrap();
        let point = &grid.points()[0];
        let config = point.apply(&RunConfig::default()).unwrap();
        assert_eq!(config.hypothesis.masses, vec![250.0, 300.0]);
        assert_eq!(config.hypothesis.fixed_mass_components, vec![0]);
        assert_eq!(config.hypothesis.mu, 0.05);
        let mask = config.mask();
        assert!(!mask.mu);
        assert!(mask.mass, "m2 still trains");

        let coordinate = point.coordinate();
        assert_eq!(coordinate["m1"], 250.0);
        assert_eq!(coordinate["mu"], 0.05);
    }

    #[test]
    fn test_apply_all_masses_freezes_mass_group() {
        let grid = Grid::parse("m1=250,m2=350").unwrap();
        let config = grid.points()[0].apply(&RunConfig::default()).unwrap();
        assert!(!config.mask().mass);
        assert_eq!(config.hypothesis.fixed_mass_components, vec![0, 1]);
    }

    #[test]
    fn test_alpha_needs_two_modes() {
        let grid = Grid::parse("alpha=0.3").unwrap();
        let point = &grid.points()[0];
        assert!(point.apply(&RunConfig::default()).is_err());

        let mut base = RunConfig::default();
        base.hypothesis.decay_modes = vec![DecayMode::TwoProng, DecayMode::ThreeProng];
        let config = point.apply(&base).unwrap();
        assert_eq!(config.hypothesis.alpha, 0.3);
        assert!(!config.mask().alpha);

        let estimates = ParameterEstimates::from_hypothesis(&base.hypothesis);
        assert_eq!(point.apply_estimates(&estimates).unwrap().alpha, Some(0.3));
    }

    #[test]
    fn test_apply_estimates() {
        let grid = Grid::parse("m2=(400),mu=0.0").unwrap();
        let base = ParameterEstimates {
            masses: vec![300.0, 300.0],
            mu: 0.2,
            alpha: None,
        };
        let p = grid.points()[0].apply_estimates(&base).unwrap();
        assert_eq!(p.masses, vec![300.0, 400.0]);
        assert_eq!(p.mu, 0.0);
    }
}
