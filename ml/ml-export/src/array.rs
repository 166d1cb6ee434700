//! Dense numeric arrays used for parameters, inputs and outputs.

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// Maximum array rank supported by traced graphs.
pub const MAX_RANK: usize = 4;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DType {
    /// 32-bit float.
    #[default]
    F32,
    /// 64-bit float.
    F64,
}

impl DType {
    /// Returns the dtype name as a string.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Result dtype of a binary operation.
    #[must_use]
    pub const fn promote(self, other: Self) -> Self {
        match (self, other) {
            (Self::F32, Self::F32) => Self::F32,
            _ => Self::F64,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Array element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    /// 32-bit float values.
    F32(Vec<f32>),
    /// 64-bit float values.
    F64(Vec<f64>),
}

/// Number of elements in `shape`.
///
/// # Errors
///
/// Returns [`ExportError::InvalidArgument`] if the product overflows.
pub(crate) fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1_usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            ExportError::invalid_argument(format!("element count of shape {shape:?} overflows"))
        })
}

impl ArrayData {
    fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }
}

/// A dense, row-major array.
///
/// # Example
///
/// ```
/// use ml_export::{Array, DType};
///
/// let a = Array::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
/// assert_eq!(a.shape(), &[2, 2]);
/// assert_eq!(a.dtype(), DType::F32);
/// assert_eq!(a.len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawArray")]
pub struct Array {
    shape: Vec<usize>,
    data: ArrayData,
}

/// Unchecked wire form; deserialization validates through [`Array::new`].
#[derive(Deserialize)]
struct RawArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl TryFrom<RawArray> for Array {
    type Error = ExportError;

    fn try_from(raw: RawArray) -> Result<Self> {
        Self::new(raw.shape, raw.data)
    }
}

impl Array {
    /// Creates an array, checking that the element count matches the shape.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if the element count differs
    /// from the product of `shape`, or [`ExportError::InvalidArgument`] if
    /// the rank exceeds [`MAX_RANK`] or the product overflows.
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        if shape.len() > MAX_RANK {
            return Err(ExportError::invalid_argument(format!(
                "rank {} exceeds maximum rank {MAX_RANK}",
                shape.len()
            )));
        }
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(ExportError::shape_mismatch(
                format!("{expected} elements for shape {shape:?}"),
                format!("{} elements", data.len()),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Creates an `f32` array.
    ///
    /// # Errors
    ///
    /// See [`Array::new`].
    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(shape, ArrayData::F32(values))
    }

    /// Creates an `f64` array.
    ///
    /// # Errors
    ///
    /// See [`Array::new`].
    pub fn from_f64(shape: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        Self::new(shape, ArrayData::F64(values))
    }

    /// Creates a rank-0 `f32` array.
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: ArrayData::F32(vec![value]),
        }
    }

    /// Creates a zero-filled array.
    ///
    /// # Errors
    ///
    /// See [`Array::new`].
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let n = element_count(&shape)?;
        let data = match dtype {
            DType::F32 => ArrayData::F32(vec![0.0; n]),
            DType::F64 => ArrayData::F64(vec![0.0; n]),
        };
        Self::new(shape, data)
    }

    /// Builds an array of `dtype` from `f32` values, widening if needed.
    ///
    /// # Errors
    ///
    /// See [`Array::new`].
    pub fn from_f32_as(shape: Vec<usize>, values: Vec<f32>, dtype: DType) -> Result<Self> {
        match dtype {
            DType::F32 => Self::from_f32(shape, values),
            DType::F64 => Self::from_f64(shape, values.into_iter().map(f64::from).collect()),
        }
    }

    /// Returns the shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns the element type.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        match self.data {
            ArrayData::F32(_) => DType::F32,
            ArrayData::F64(_) => DType::F64,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Returns the storage.
    #[must_use]
    pub const fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Returns the values as `f32`, narrowing `f64` storage.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            ArrayData::F32(v) => v.clone(),
            ArrayData::F64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Returns the values as `f64`.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            ArrayData::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ArrayData::F64(v) => v.clone(),
        }
    }

    /// Short description such as `f32[2, 4]`.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{}{:?}", self.dtype(), self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_new_checks_len() {
        assert!(Array::from_f32(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Array::from_f32(vec![2, 3], vec![0.0; 5]),
            Err(ExportError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn array_rank_limit() {
        assert!(Array::zeros(vec![1, 1, 1, 1], DType::F32).is_ok());
        assert!(matches!(
            Array::zeros(vec![1, 1, 1, 1, 1], DType::F32),
            Err(ExportError::InvalidArgument(_))
        ));
    }

    #[test]
    fn array_scalar() {
        let s = Array::scalar(3.5);
        assert_eq!(s.rank(), 0);
        assert_eq!(s.len(), 1);
        assert_eq!(s.to_f32_vec(), vec![3.5]);
    }

    #[test]
    fn array_dtype_conversion() {
        let a = Array::from_f32_as(vec![2], vec![1.5, -2.0], DType::F64).unwrap();
        assert_eq!(a.dtype(), DType::F64);
        assert_eq!(a.to_f64_vec(), vec![1.5, -2.0]);
        assert_eq!(a.to_f32_vec(), vec![1.5, -2.0]);
        assert_eq!(a.describe(), "f64[2]");
    }

    #[test]
    fn dtype_promotion() {
        assert_eq!(DType::F32.promote(DType::F32), DType::F32);
        assert_eq!(DType::F32.promote(DType::F64), DType::F64);
        assert_eq!(DType::F64.promote(DType::F32), DType::F64);
        assert_eq!(format!("{}", DType::F64), "f64");
    }

    #[test]
    fn array_serialization() {
        let a = Array::from_f32(vec![2], vec![1.0, 2.0]).unwrap();
        let json = serde_json::to_string(&a).unwrap();
        let parsed: Array = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, a);

        let bad = r#"{"shape":[3],"data":{"F32":[1.0]}}"#;
        assert!(serde_json::from_str::<Array>(bad).is_err());
    }

    #[test]
    fn overflowing_shapes_are_rejected() {
        let huge = r#"{"shape":[4294967296,4294967296,2],"data":{"F32":[1.0]}}"#;
        assert!(serde_json::from_str::<Array>(huge).is_err());

        let wrapping = vec![usize::MAX, 2, 0];
        assert!(matches!(
            Array::zeros(wrapping, DType::F32),
            Err(ExportError::InvalidArgument(_))
        ));
        assert!(element_count(&[usize::MAX, 2]).is_err());
        assert_eq!(element_count(&[]).unwrap(), 1);
    }
}
