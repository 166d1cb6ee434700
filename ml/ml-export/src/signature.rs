//! Input signatures: shape and dtype descriptions used to specialize a function.

use serde::{Deserialize, Serialize};

use crate::array::{Array, DType, MAX_RANK};
use crate::error::{ExportError, Result};
use crate::tree::Tree;

/// Shape and dtype of one input leaf.
///
/// A `None` dimension is unspecified and matches any size.
///
/// # Example
///
/// ```
/// use ml_export::{Array, TensorSpec};
///
/// let spec = TensorSpec::f32([None, Some(4)]);
/// let x = Array::from_f32(vec![3, 4], vec![0.0; 12]).unwrap();
/// assert!(spec.is_compatible_with(&x));
/// assert_eq!(spec.to_string(), "f32[?,4]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Dimensions; `None` means unspecified.
    pub shape: Vec<Option<usize>>,

    /// Element type.
    pub dtype: DType,

    /// Optional argument name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TensorSpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(shape: impl IntoIterator<Item = Option<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into_iter().collect(),
            dtype,
            name: None,
        }
    }

    /// Creates an `f32` spec.
    #[must_use]
    pub fn f32(shape: impl IntoIterator<Item = Option<usize>>) -> Self {
        Self::new(shape, DType::F32)
    }

    /// Creates a fully known spec describing `array`.
    #[must_use]
    pub fn of(array: &Array) -> Self {
        Self::new(array.shape().iter().copied().map(Some), array.dtype())
    }

    /// Sets the argument name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns `true` if every dimension is known.
    #[must_use]
    pub fn is_fully_defined(&self) -> bool {
        self.shape.iter().all(Option::is_some)
    }

    /// Returns `true` if `array` has this dtype, rank and known dims.
    #[must_use]
    pub fn is_compatible_with(&self, array: &Array) -> bool {
        self.dtype == array.dtype()
            && self.rank() == array.rank()
            && self
                .shape
                .iter()
                .zip(array.shape())
                .all(|(dim, &actual)| dim.is_none_or(|d| d == actual))
    }

    /// Checks the rank limit.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidArgument`] if the rank exceeds [`MAX_RANK`].
    pub fn validate(&self) -> Result<()> {
        if self.rank() > MAX_RANK {
            return Err(ExportError::invalid_argument(format!(
                "signature {self} has rank {}, maximum is {MAX_RANK}",
                self.rank()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims: Vec<String> = self
            .shape
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |n| n.to_string()))
            .collect();
        write!(f, "{}[{}]", self.dtype, dims.join(","))
    }
}

/// The signature of a function's input argument: a tree of specs.
pub type InputSignature = Tree<TensorSpec>;

/// Canonical text key for a signature, used to index traced functions.
///
/// Names are ignored; structure, dtypes and dims are not.
#[must_use]
pub fn signature_key(signature: &InputSignature) -> String {
    match signature {
        Tree::Leaf(spec) => spec.to_string(),
        Tree::Seq(items) => {
            let parts: Vec<String> = items.iter().map(signature_key).collect();
            format!("({})", parts.join(","))
        }
        Tree::Map(entries) => {
            let parts: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{k}:{}", signature_key(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

/// Returns `true` if `inputs` has the signature's structure and every leaf
/// is compatible with its spec.
#[must_use]
pub fn signature_accepts(signature: &InputSignature, inputs: &Tree<Array>) -> bool {
    signature.same_structure(inputs)
        && signature
            .leaves()
            .into_iter()
            .zip(inputs.leaves())
            .all(|(spec, array)| spec.is_compatible_with(array))
}

/// Describes a tree of arrays for error messages, e.g. `(f32[2, 4])`.
#[must_use]
pub fn describe_inputs(inputs: &Tree<Array>) -> String {
    signature_key(&inputs.map_leaves(TensorSpec::of))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_display() {
        assert_eq!(TensorSpec::f32([None, Some(4)]).to_string(), "f32[?,4]");
        assert_eq!(TensorSpec::new([], DType::F64).to_string(), "f64[]");
    }

    #[test]
    fn spec_compatibility() {
        let spec = TensorSpec::f32([None, Some(4)]);
        let ok = Array::zeros(vec![7, 4], DType::F32).unwrap();
        let wrong_dim = Array::zeros(vec![7, 3], DType::F32).unwrap();
        let wrong_rank = Array::zeros(vec![4], DType::F32).unwrap();
        let wrong_dtype = Array::zeros(vec![7, 4], DType::F64).unwrap();

        assert!(spec.is_compatible_with(&ok));
        assert!(!spec.is_compatible_with(&wrong_dim));
        assert!(!spec.is_compatible_with(&wrong_rank));
        assert!(!spec.is_compatible_with(&wrong_dtype));
    }

    #[test]
    fn spec_of_array() {
        let a = Array::zeros(vec![2, 3], DType::F32).unwrap();
        let spec = TensorSpec::of(&a);
        assert!(spec.is_fully_defined());
        assert_eq!(spec.shape, vec![Some(2), Some(3)]);
    }

    #[test]
    fn spec_rank_validation() {
        assert!(TensorSpec::f32([Some(1); 4]).validate().is_ok());
        assert!(TensorSpec::f32([Some(1); 5]).validate().is_err());
    }

    #[test]
    fn signature_keys_are_canonical() {
        let sig = Tree::map([
            ("x", Tree::leaf(TensorSpec::f32([None, Some(4)]).with_name("x"))),
            ("mask", Tree::leaf(TensorSpec::f32([Some(4)]))),
        ]);
        assert_eq!(signature_key(&sig), "{mask:f32[4],x:f32[?,4]}");

        let seq = Tree::seq([Tree::leaf(TensorSpec::f32([Some(1)]))]);
        assert_eq!(signature_key(&seq), "(f32[1])");
    }

    #[test]
    fn signature_accepts_inputs() {
        let sig = Tree::leaf(TensorSpec::f32([None, Some(2)]));
        let good = Tree::leaf(Array::zeros(vec![5, 2], DType::F32).unwrap());
        let bad = Tree::seq([Tree::leaf(Array::zeros(vec![5, 2], DType::F32).unwrap())]);
        assert!(signature_accepts(&sig, &good));
        assert!(!signature_accepts(&sig, &bad));
        assert_eq!(describe_inputs(&good), "f32[5,2]");
    }

    #[test]
    fn spec_serialization() {
        let spec = TensorSpec::f32([None, Some(4)]);
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: TensorSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, spec);
    }
}
