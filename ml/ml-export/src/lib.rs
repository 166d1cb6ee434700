//! Packaging trained models as portable serialized-model directories.
//!
//! A model is a parameter tree plus a prediction function
//! `(params, inputs) -> outputs` written against a symbolic tracing API.
//! [`convert_and_save_model`] traces the function once per input
//! signature, binds the parameters as shared variables, and writes a
//! directory that [`load`] restores and serves without the original
//! function.
//!
//! # Pipeline
//!
//! 1. Validate the [`ExportConfig`]
//! 2. [`convert`] the function, with gradient, optimizer and polymorphism
//!    settings
//! 3. Wrap every parameter leaf in a [`Variable`]
//! 4. Build a [`GraphFunction`] closed over the variables
//! 5. Trace the default signature, then every other signature into the
//!    [`TraceCache`]
//! 6. Wrap it all in a [`ReusableWrapper`]
//! 7. [`save`] the wrapper with its signature map
//!
//! # Execution
//!
//! Traced graphs run on the Burn `NdArray` CPU backend. Values are
//! computed in `f32`; `f64` arrays are narrowed on entry and widened on
//! output.
//!
//! # Example
//!
//! ```no_run
//! use ml_export::prelude::*;
//!
//! fn linear(g: &mut GraphBuilder, p: &Tree<Traced>, x: &Tree<Traced>) -> Result<Tree<Traced>> {
//!     let leaves = p.leaves();
//!     let (b, w) = (*leaves[0], *leaves[1]);
//!     let x = *x.as_leaf().ok_or_else(|| ExportError::trace("expected one input"))?;
//!     let xw = g.matmul(x, w)?;
//!     Ok(Tree::leaf(g.add(xw, b)?))
//! }
//!
//! let params = Tree::map([
//!     ("w", Tree::leaf(Array::zeros(vec![4, 3], DType::F32)?)),
//!     ("b", Tree::leaf(Array::zeros(vec![3], DType::F32)?)),
//! ]);
//! let config = ExportConfig::new(vec![Tree::leaf(TensorSpec::f32([None, Some(4)]))]);
//! convert_and_save_model(linear, &params, "exported/linear", &config, None)?;
//!
//! let model = load(std::path::Path::new("exported/linear"))?;
//! let x = Tree::leaf(Array::zeros(vec![8, 4], DType::F32)?);
//! let y = model.call(&x)?;
//! assert_eq!(y.leaf_count(), 1);
//! # Ok::<(), ExportError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod array;
mod builder;
mod checkpoint;
mod convert;
mod error;
mod exec;
mod export;
mod function;
mod grad;
mod graph;
mod optimize;
mod poly;
mod saved_model;
mod signature;
mod tree;
mod variable;
mod wrapper;

// Data model
pub use array::{Array, ArrayData, DType, MAX_RANK};
pub use signature::{InputSignature, TensorSpec, signature_accepts, signature_key};
pub use tree::Tree;
pub use variable::{ROOT_VARIABLE_NAME, Variable, VariableSpec, variables_from_params};

// Tracing
pub use builder::{GraphBuilder, Traced};
pub use convert::{ConvertOptions, ConvertedFn, ModelFn, TracedGraphs, convert};
pub use grad::{INPUTS_KEY, VARIABLES_KEY, build_gradient};
pub use graph::{Dim, Graph, GraphInput, Node, NodeId, Op, VariableSlot};
pub use optimize::{OptimizeStats, optimize};
pub use poly::{ArgShapes, PolyDim, PolyShape};

// Execution
pub use exec::{ExecutionPlan, execute};
pub use function::{ConcreteFunction, FunctionConfig, GraphFunction, TraceCache};

// Export and persistence
pub use checkpoint::{
    CheckpointFormat, VariableRecord, load_variables, read_variables, save_variables,
    write_variables,
};
pub use export::{ExportConfig, ExportOutcome, convert_and_save_model};
pub use saved_model::{
    DEFAULT_SERVING_SIGNATURE_DEF_KEY, LoadedModel, SaveOptions, SchemaVersion, load, save,
};
pub use wrapper::{RegularizationLoss, ReusableModel, ReusableWrapper};

// Errors
pub use error::{ExportError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        Array, CheckpointFormat, DType, ExportConfig, ExportError, GraphBuilder, LoadedModel,
        PolyShape, Result, ReusableModel, SaveOptions, TensorSpec, Traced, Tree,
        convert_and_save_model, load,
    };
}
