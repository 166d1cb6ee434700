//! Named, shared parameter storage.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::array::{Array, DType};
use crate::error::{ExportError, Result};
use crate::tree::Tree;

/// Name given to a parameter tree that is a single leaf.
pub const ROOT_VARIABLE_NAME: &str = "param";

#[derive(Debug)]
struct Inner {
    name: String,
    trainable: bool,
    value: RwLock<Array>,
}

/// A named storage cell holding one parameter array.
///
/// Clones share storage: an assignment through one handle is visible to
/// every graph and wrapper holding another.
#[derive(Debug, Clone)]
pub struct Variable {
    inner: Arc<Inner>,
}

impl Variable {
    /// Creates a variable.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Array, trainable: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                trainable,
                value: RwLock::new(value),
            }),
        }
    }

    /// Variable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether gradients are taken with respect to this variable.
    #[must_use]
    pub fn trainable(&self) -> bool {
        self.inner.trainable
    }

    /// Borrows the current value.
    pub fn read(&self) -> RwLockReadGuard<'_, Array> {
        self.inner.value.read()
    }

    /// Returns a copy of the current value.
    #[must_use]
    pub fn value(&self) -> Array {
        self.inner.value.read().clone()
    }

    /// Shape of the current value.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.inner.value.read().shape().to_vec()
    }

    /// Element type of the current value.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.inner.value.read().dtype()
    }

    /// Replaces the value.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if `value` has a different
    /// shape or dtype; traced graphs depend on both.
    pub fn assign(&self, value: Array) -> Result<()> {
        let mut current = self.inner.value.write();
        if current.shape() != value.shape() || current.dtype() != value.dtype() {
            return Err(ExportError::shape_mismatch(
                format!("{} for variable {}", current.describe(), self.inner.name),
                value.describe(),
            ));
        }
        *current = value;
        Ok(())
    }

    /// Returns `true` if both handles share storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Serializable description of this variable.
    #[must_use]
    pub fn spec(&self) -> VariableSpec {
        let value = self.read();
        VariableSpec {
            name: self.inner.name.clone(),
            shape: value.shape().to_vec(),
            dtype: value.dtype(),
            trainable: self.inner.trainable,
        }
    }
}

/// Name, shape, dtype and trainable flag of a saved variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Variable name.
    pub name: String,
    /// Shape.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
    /// Trainable flag.
    pub trainable: bool,
}

/// Wraps every parameter leaf in a [`Variable`], preserving the tree
/// structure.
///
/// Variables are named by their `/`-joined path; a root leaf is named
/// [`ROOT_VARIABLE_NAME`].
///
/// # Example
///
/// ```
/// use ml_export::{Array, Tree, variables_from_params};
///
/// let params = Tree::map([("w", Tree::leaf(Array::scalar(1.0)))]);
/// let vars = variables_from_params(&params, true);
/// assert_eq!(vars.leaves()[0].name(), "w");
/// ```
#[must_use]
pub fn variables_from_params(params: &Tree<Array>, trainable: bool) -> Tree<Variable> {
    let named = params.try_map_with_path(|path, value| {
        let name = if path.is_empty() {
            ROOT_VARIABLE_NAME
        } else {
            path
        };
        Ok::<_, std::convert::Infallible>(Variable::new(name, value.clone(), trainable))
    });
    match named {
        Ok(tree) => tree,
        Err(never) => match never {},
    }
}
