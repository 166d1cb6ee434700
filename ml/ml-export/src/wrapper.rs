//! Reusable model adapter.
//!
//! Model loaders generally look for four capabilities on a saved object:
//! the variables, the trainable subset, regularization losses, and a call
//! entry point. [`ReusableWrapper`] supplies them for a converted function
//! and [`ReusableModel`] names them as a trait.

use std::sync::Arc;

use tracing::debug;

use crate::array::Array;
use crate::builder::{GraphBuilder, Traced};
use crate::error::{ExportError, Result};
use crate::exec::execute;
use crate::function::GraphFunction;
use crate::graph::{Graph, shape_to_string};
use crate::tree::Tree;
use crate::variable::Variable;

/// A zero-argument loss term over the model variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationLoss {
    /// Term name.
    pub name: String,
    /// Graph with no inputs and one scalar output.
    pub graph: Arc<Graph>,
}

impl RegularizationLoss {
    /// Traces `term` over `params`.
    ///
    /// # Errors
    ///
    /// Returns any tracing error, or [`ExportError::ShapeMismatch`] if the
    /// term is not a scalar.
    pub fn trace(
        name: impl Into<String>,
        params: &Tree<Variable>,
        term: impl FnOnce(&mut GraphBuilder, &Tree<Traced>) -> Result<Traced>,
    ) -> Result<Self> {
        let name = name.into();
        let mut g = GraphBuilder::new();
        let mut index = 0;
        let traced = params.map_leaves(|variable| {
            let t = g.variable(index, &variable.shape(), variable.dtype());
            index += 1;
            t
        });
        let out = term(&mut g, &traced)?;
        if g.rank(out) != 0 {
            return Err(ExportError::shape_mismatch(
                format!("scalar regularization loss '{name}'"),
                shape_to_string(g.shape(out)),
            ));
        }
        let graph = g.finish(&Tree::leaf(out));
        graph.validate(index)?;
        Ok(Self {
            name,
            graph: Arc::new(graph),
        })
    }

    /// Evaluates the term against the current variable values.
    ///
    /// # Errors
    ///
    /// Returns an execution error.
    pub fn evaluate(&self, variables: &[Variable]) -> Result<Array> {
        execute(&self.graph, &[], variables, None)?
            .into_leaves()
            .into_iter()
            .next()
            .ok_or_else(|| ExportError::execution(format!("loss '{}' produced no value", self.name)))
    }
}

/// The capabilities a reusable saved model exposes.
pub trait ReusableModel {
    /// Every variable, in flattened parameter order.
    fn variables(&self) -> &[Variable];

    /// The trainable subset of [`ReusableModel::variables`], same order.
    fn trainable_variables(&self) -> &[Variable];

    /// Regularization terms.
    fn regularization_losses(&self) -> &[RegularizationLoss];

    /// Runs the default entry point.
    ///
    /// # Errors
    ///
    /// Returns an error if no traced function accepts `inputs`, or an
    /// execution error.
    fn call(&self, inputs: &Tree<Array>) -> Result<Tree<Array>>;

    /// Evaluates every regularization term.
    ///
    /// # Errors
    ///
    /// Returns the first evaluation error.
    fn evaluate_regularization_losses(&self) -> Result<Vec<Array>> {
        self.regularization_losses()
            .iter()
            .map(|loss| loss.evaluate(self.variables()))
            .collect()
    }
}

/// Adapter exposing a [`GraphFunction`] and its variables as a reusable
/// model.
#[derive(Debug, Clone)]
pub struct ReusableWrapper {
    /// Every variable, in flattened parameter order.
    pub variables: Vec<Variable>,
    /// Variables with the trainable flag set, in the same order.
    pub trainable_variables: Vec<Variable>,
    /// Regularization terms. Empty unless added.
    pub regularization_losses: Vec<RegularizationLoss>,
    /// The graph function serving calls.
    pub call: GraphFunction,
}

impl ReusableWrapper {
    /// Builds the adapter from a graph function and its parameter
    /// variables.
    #[must_use]
    pub fn new(call: GraphFunction, params: &Tree<Variable>) -> Self {
        let variables: Vec<Variable> = params.leaves().into_iter().cloned().collect();
        let trainable_variables: Vec<Variable> = variables
            .iter()
            .filter(|v| v.trainable())
            .cloned()
            .collect();
        debug!(
            variables = variables.len(),
            trainable = trainable_variables.len(),
            "built reusable wrapper"
        );
        Self {
            variables,
            trainable_variables,
            regularization_losses: Vec::new(),
            call,
        }
    }

    /// Adds a regularization term traced over the parameters.
    ///
    /// # Errors
    ///
    /// See [`RegularizationLoss::trace`].
    pub fn add_regularization_loss(
        &mut self,
        name: impl Into<String>,
        term: impl FnOnce(&mut GraphBuilder, &Tree<Traced>) -> Result<Traced>,
    ) -> Result<()> {
        let loss = RegularizationLoss::trace(name, self.call.params(), term)?;
        self.regularization_losses.push(loss);
        Ok(())
    }
}

impl ReusableModel for ReusableWrapper {
    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn trainable_variables(&self) -> &[Variable] {
        &self.trainable_variables
    }

    fn regularization_losses(&self) -> &[RegularizationLoss] {
        &self.regularization_losses
    }

    fn call(&self, inputs: &Tree<Array>) -> Result<Tree<Array>> {
        self.call.call(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{ConvertOptions, convert};
    use crate::function::FunctionConfig;
    use crate::signature::TensorSpec;
    use crate::variable::variables_from_params;

    fn identity(_g: &mut GraphBuilder, _p: &Tree<Traced>, x: &Tree<Traced>) -> Result<Tree<Traced>> {
        Ok(x.clone())
    }

    fn wrapper(trainable: bool) -> ReusableWrapper {
        let params = Tree::map([
            ("a", Tree::leaf(Array::from_f32(vec![2], vec![1.0, -2.0]).unwrap())),
            ("b", Tree::leaf(Array::scalar(3.0))),
        ]);
        let vars = variables_from_params(&params, trainable);
        let f = GraphFunction::new(
            convert(identity, ConvertOptions::default()),
            vars.clone(),
            FunctionConfig::default(),
        );
        ReusableWrapper::new(f, &vars)
    }

    #[test]
    fn trainable_subset_follows_flags() {
        let w = wrapper(true);
        assert_eq!(w.variables.len(), 2);
        assert_eq!(w.trainable_variables.len(), 2);
        assert!(w.regularization_losses.is_empty());
        for (v, t) in w.variables.iter().zip(&w.trainable_variables) {
            assert!(v.ptr_eq(t));
        }

        let frozen = wrapper(false);
        assert!(frozen.trainable_variables.is_empty());
    }

    #[test]
    fn call_goes_through_traced_functions() {
        let mut w = wrapper(false);
        let x = Tree::leaf(Array::from_f32(vec![2], vec![5.0, 6.0]).unwrap());
        assert!(matches!(
            ReusableModel::call(&w, &x),
            Err(ExportError::NoMatchingSignature(_))
        ));

        w.call
            .get_concrete_function(&Tree::leaf(TensorSpec::f32([Some(2)])))
            .unwrap();
        assert_eq!(ReusableModel::call(&w, &x).unwrap(), x);
    }

    #[test]
    fn regularization_losses_evaluate_over_variables() {
        let mut w = wrapper(true);
        w.add_regularization_loss("l2", |g, p| {
            let a = *p.leaves()[0];
            let sq = g.mul(a, a)?;
            g.sum(sq, 0)
        })
        .unwrap();

        let losses = w.evaluate_regularization_losses().unwrap();
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].to_f32_vec(), vec![5.0]);

        let not_scalar = w.add_regularization_loss("bad", |_g, p| Ok(*p.leaves()[0]));
        assert!(matches!(not_scalar, Err(ExportError::ShapeMismatch { .. })));
    }
}
