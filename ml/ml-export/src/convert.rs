//! Conversion of a prediction function into traceable form.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::builder::{GraphBuilder, Traced};
use crate::error::{ExportError, Result};
use crate::grad::build_gradient;
use crate::graph::{Graph, VariableSlot};
use crate::optimize::optimize;
use crate::poly::{ArgShapes, resolve_dims};
use crate::signature::{InputSignature, TensorSpec, signature_key};
use crate::tree::Tree;
use crate::variable::Variable;

/// A two-argument prediction function `(params, inputs) -> outputs`,
/// written against the tracing API.
///
/// Implemented for every closure with the matching signature.
pub trait ModelFn {
    /// Records the computation into `g`.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the tracing operations.
    fn apply(
        &self,
        g: &mut GraphBuilder,
        params: &Tree<Traced>,
        inputs: &Tree<Traced>,
    ) -> Result<Tree<Traced>>;
}

impl<F> ModelFn for F
where
    F: Fn(&mut GraphBuilder, &Tree<Traced>, &Tree<Traced>) -> Result<Tree<Traced>>,
{
    fn apply(
        &self,
        g: &mut GraphBuilder,
        params: &Tree<Traced>,
        inputs: &Tree<Traced>,
    ) -> Result<Tree<Traced>> {
        self(g, params, inputs)
    }
}

/// Options for [`convert`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Build a gradient graph for every trace.
    pub with_gradient: bool,
    /// Run constant folding and dead-node elimination on traced graphs.
    pub enable_optimizer: bool,
    /// Shape polymorphism for each argument.
    pub polymorphic_shapes: ArgShapes,
}

impl ConvertOptions {
    /// Sets gradient construction.
    #[must_use]
    pub const fn with_gradient(mut self, with_gradient: bool) -> Self {
        self.with_gradient = with_gradient;
        self
    }

    /// Sets the optimizer flag.
    #[must_use]
    pub const fn with_optimizer(mut self, enable_optimizer: bool) -> Self {
        self.enable_optimizer = enable_optimizer;
        self
    }

    /// Sets argument polymorphism.
    #[must_use]
    pub fn with_polymorphic_shapes(mut self, shapes: ArgShapes) -> Self {
        self.polymorphic_shapes = shapes;
        self
    }
}

/// Graphs produced by one trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedGraphs {
    /// Forward graph.
    pub graph: Graph,
    /// Gradient graph, if requested.
    pub gradient: Option<Graph>,
}

/// A converted, traceable function.
#[derive(Clone)]
pub struct ConvertedFn {
    model: Arc<dyn ModelFn>,
    options: ConvertOptions,
}

impl std::fmt::Debug for ConvertedFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertedFn")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Converts `model` into a function that can be traced per signature.
pub fn convert(model: impl ModelFn + 'static, options: ConvertOptions) -> ConvertedFn {
    ConvertedFn {
        model: Arc::new(model),
        options,
    }
}

impl ConvertedFn {
    /// Conversion options.
    #[must_use]
    pub const fn options(&self) -> &ConvertOptions {
        &self.options
    }

    /// Traces against `params` and an input `signature`.
    ///
    /// Parameters enter the graph as variable reads indexed by their
    /// position in the flattened tree. Unspecified signature dims become
    /// symbols, named by the input descriptor if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature or a descriptor is invalid, or if
    /// the function fails to trace.
    pub fn trace(&self, params: &Tree<Variable>, signature: &InputSignature) -> Result<TracedGraphs> {
        let key = signature_key(signature);
        for spec in signature.leaves() {
            spec.validate()?;
        }

        let shapes = &self.options.polymorphic_shapes;
        if let Some(poly) = &shapes.params {
            for variable in params.leaves() {
                let spec = TensorSpec::new(variable.shape().into_iter().map(Some), variable.dtype());
                poly.resolve(&spec)?;
            }
        }

        let mut g = GraphBuilder::new();
        let mut counter = 0_usize;
        let mut fresh = || {
            counter += 1;
            format!("_d{counter}")
        };
        let inputs = signature.try_map_leaves(|spec| {
            let dims = resolve_dims(shapes.inputs.as_ref(), spec, &mut fresh)?;
            Ok::<_, ExportError>(g.input(dims, spec.dtype))
        })?;

        let mut index = 0;
        let traced_params = params.map_leaves(|variable| {
            let traced = g.variable(index, &variable.shape(), variable.dtype());
            index += 1;
            traced
        });

        let outputs = self.model.apply(&mut g, &traced_params, &inputs)?;
        let graph = g.finish(&outputs);
        graph.validate(index)?;

        let gradient = if self.options.with_gradient {
            let wrt: Vec<VariableSlot> = params
                .leaves()
                .into_iter()
                .enumerate()
                .filter(|(_, v)| v.trainable())
                .map(|(i, v)| VariableSlot {
                    index: i,
                    shape: v.shape(),
                    dtype: v.dtype(),
                })
                .collect();
            Some(build_gradient(&graph, &signature.structure(), &wrt)?)
        } else {
            None
        };

        let traced = if self.options.enable_optimizer {
            let (graph, _) = optimize(&graph)?;
            let gradient = match gradient {
                Some(gradient) => Some(optimize(&gradient)?.0),
                None => None,
            };
            TracedGraphs { graph, gradient }
        } else {
            TracedGraphs { graph, gradient }
        };

        debug!(
            signature = %key,
            nodes = traced.graph.len(),
            gradient_nodes = traced.gradient.as_ref().map_or(0, Graph::len),
            polymorphic = shapes.is_polymorphic(),
            "traced function"
        );
        Ok(traced)
    }
}
