//! Shape polymorphism descriptors.
//!
//! A descriptor such as `"(b, 4)"` marks input dimensions as symbolic so a
//! single traced function serves many concrete shapes. Entries are:
//!
//! - a symbol (`b`, `batch`): a dimension bound at call time; equal symbols
//!   must bind equal sizes
//! - `_`: take the known dimension from the signature
//! - an integer: a fixed size, which must agree with the signature

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::graph::Dim;
use crate::signature::TensorSpec;

/// One entry of a [`PolyShape`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolyDim {
    /// Named dimension variable.
    Symbol(String),
    /// Known size taken from the signature.
    Wildcard,
    /// Fixed size.
    Known(usize),
}

/// A parsed shape-polymorphism descriptor.
///
/// # Example
///
/// ```
/// use ml_export::{PolyDim, PolyShape};
///
/// let poly = PolyShape::parse("(batch, _)").unwrap();
/// assert_eq!(poly.dims()[0], PolyDim::Symbol("batch".into()));
/// assert_eq!(poly.dims()[1], PolyDim::Wildcard);
/// assert_eq!(poly.to_string(), "(batch, _)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PolyShape {
    dims: Vec<PolyDim>,
}

impl PolyShape {
    /// Parses a descriptor.
    ///
    /// Parentheses are optional and a trailing comma is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidPolyShape`] for unbalanced parentheses
    /// or entries that are neither symbols, `_`, nor integers.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let inner = match (trimmed.strip_prefix('('), trimmed.strip_suffix(')')) {
            (Some(_), Some(_)) if trimmed.len() >= 2 => &trimmed[1..trimmed.len() - 1],
            (None, None) => trimmed,
            _ => {
                return Err(ExportError::invalid_poly_shape(text, "unbalanced parentheses"));
            }
        };

        let mut parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        if parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }

        let dims = parts
            .into_iter()
            .map(|part| parse_dim(text, part))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dims })
    }

    /// Returns the entries.
    #[must_use]
    pub fn dims(&self) -> &[PolyDim] {
        &self.dims
    }

    /// Returns the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Resolves traced dims for `spec` under this descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidPolyShape`] if the rank differs, an
    /// integer disagrees with a known dim, a symbol is placed on a known
    /// dim, or `_` is placed on an unspecified dim.
    pub fn resolve(&self, spec: &TensorSpec) -> Result<Vec<Dim>> {
        if self.rank() != spec.rank() {
            return Err(ExportError::invalid_poly_shape(
                self.to_string(),
                format!("rank {} does not match signature {spec}", self.rank()),
            ));
        }
        self.dims
            .iter()
            .zip(&spec.shape)
            .enumerate()
            .map(|(axis, (poly, known))| match (poly, known) {
                (PolyDim::Wildcard, Some(n)) => Ok(Dim::Fixed(*n)),
                (PolyDim::Wildcard, None) => Err(ExportError::invalid_poly_shape(
                    self.to_string(),
                    format!("'_' in axis {axis} needs a known dimension in {spec}"),
                )),
                (PolyDim::Known(n), None) => Ok(Dim::Fixed(*n)),
                (PolyDim::Known(n), Some(m)) if n == m => Ok(Dim::Fixed(*n)),
                (PolyDim::Known(n), Some(m)) => Err(ExportError::invalid_poly_shape(
                    self.to_string(),
                    format!("axis {axis} is {n} but signature {spec} has {m}"),
                )),
                (PolyDim::Symbol(name), None) => Ok(Dim::Sym(name.clone())),
                (PolyDim::Symbol(name), Some(m)) => Err(ExportError::invalid_poly_shape(
                    self.to_string(),
                    format!("symbol '{name}' in axis {axis} corresponds to known size {m}"),
                )),
            })
            .collect()
    }
}

fn parse_dim(text: &str, part: &str) -> Result<PolyDim> {
    if part == "_" {
        return Ok(PolyDim::Wildcard);
    }
    if let Ok(n) = part.parse::<usize>() {
        return Ok(PolyDim::Known(n));
    }
    let mut chars = part.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(PolyDim::Symbol(part.to_string()))
    } else {
        Err(ExportError::invalid_poly_shape(
            text,
            format!("'{part}' is not a symbol, '_' or an integer"),
        ))
    }
}

impl std::fmt::Display for PolyShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .dims
            .iter()
            .map(|d| match d {
                PolyDim::Symbol(name) => name.clone(),
                PolyDim::Wildcard => "_".to_string(),
                PolyDim::Known(n) => n.to_string(),
            })
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

impl std::str::FromStr for PolyShape {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PolyShape {
    type Error = ExportError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PolyShape> for String {
    fn from(value: PolyShape) -> Self {
        value.to_string()
    }
}

/// Per-argument polymorphism: one optional descriptor for the parameters
/// and one for the inputs.
///
/// A descriptor applies to every leaf of its argument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArgShapes {
    /// Descriptor checked against every parameter leaf. Parameters always
    /// trace with their concrete shapes, so only `_` and matching integers
    /// pass.
    pub params: Option<PolyShape>,
    /// Descriptor for the input argument.
    pub inputs: Option<PolyShape>,
}

impl ArgShapes {
    /// No constraint on the parameters, `inputs` on the inputs.
    #[must_use]
    pub const fn for_inputs(inputs: Option<PolyShape>) -> Self {
        Self {
            params: None,
            inputs,
        }
    }

    /// Returns `true` if any argument is polymorphic.
    #[must_use]
    pub const fn is_polymorphic(&self) -> bool {
        self.params.is_some() || self.inputs.is_some()
    }
}

/// Resolves traced dims for one leaf.
///
/// Without a descriptor, known dims become fixed and unspecified dims get a
/// fresh anonymous symbol from `fresh`.
///
/// # Errors
///
/// See [`PolyShape::resolve`].
pub fn resolve_dims(
    poly: Option<&PolyShape>,
    spec: &TensorSpec,
    fresh: &mut impl FnMut() -> String,
) -> Result<Vec<Dim>> {
    match poly {
        Some(poly) => poly.resolve(spec),
        None => Ok(spec
            .shape
            .iter()
            .map(|d| d.map_or_else(|| Dim::Sym(fresh()), Dim::Fixed))
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let a = PolyShape::parse("(b, 4)").unwrap();
        let b = PolyShape::parse("b, 4").unwrap();
        let c = PolyShape::parse("(b, 4,)").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.dims(), &[PolyDim::Symbol("b".into()), PolyDim::Known(4)]);

        let scalar = PolyShape::parse("()").unwrap();
        assert_eq!(scalar.rank(), 0);
    }

    #[test]
    fn parse_errors() {
        assert!(PolyShape::parse("(b, 4").is_err());
        assert!(PolyShape::parse("b, 4)").is_err());
        assert!(PolyShape::parse("(b + 1)").is_err());
        assert!(PolyShape::parse("(1b)").is_err());
        assert!("(batch, _)".parse::<PolyShape>().is_ok());
    }

    #[test]
    fn resolve_against_spec() {
        let spec = TensorSpec::f32([None, Some(4)]);

        let dims = PolyShape::parse("(b, _)").unwrap().resolve(&spec).unwrap();
        assert_eq!(dims, vec![Dim::Sym("b".into()), Dim::Fixed(4)]);

        let dims = PolyShape::parse("(b, 4)").unwrap().resolve(&spec).unwrap();
        assert_eq!(dims, vec![Dim::Sym("b".into()), Dim::Fixed(4)]);

        let dims = PolyShape::parse("(8, 4)").unwrap().resolve(&spec).unwrap();
        assert_eq!(dims, vec![Dim::Fixed(8), Dim::Fixed(4)]);
    }

    #[test]
    fn resolve_errors() {
        let spec = TensorSpec::f32([None, Some(4)]);
        for bad in ["(b)", "(_, 4)", "(b, 5)", "(b, c)"] {
            let poly = PolyShape::parse(bad).unwrap();
            assert!(
                matches!(poly.resolve(&spec), Err(ExportError::InvalidPolyShape { .. })),
                "{bad} should not resolve"
            );
        }
    }

    #[test]
    fn resolve_without_descriptor() {
        let spec = TensorSpec::f32([None, Some(4), None]);
        let mut counter = 0;
        let mut fresh = || {
            counter += 1;
            format!("_d{counter}")
        };
        let dims = resolve_dims(None, &spec, &mut fresh).unwrap();
        assert_eq!(
            dims,
            vec![Dim::Sym("_d1".into()), Dim::Fixed(4), Dim::Sym("_d2".into())]
        );
    }

    #[test]
    fn arg_shapes() {
        let poly = PolyShape::parse("(b, _)").unwrap();
        let args = ArgShapes::for_inputs(Some(poly));
        assert!(args.params.is_none());
        assert!(args.is_polymorphic());
        assert!(!ArgShapes::default().is_polymorphic());
    }

    #[test]
    fn poly_serialization() {
        let poly = PolyShape::parse("(batch, 4)").unwrap();
        let json = serde_json::to_string(&poly).unwrap();
        assert_eq!(json, "\"(batch, 4)\"");
        let parsed: PolyShape = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, poly);
    }
}
