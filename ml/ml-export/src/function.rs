//! Graph functions, their concrete traces, and the trace cache.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::array::Array;
use crate::convert::ConvertedFn;
use crate::error::{ExportError, Result};
use crate::exec::{ExecutionPlan, execute};
use crate::graph::Graph;
use crate::signature::{InputSignature, describe_inputs, signature_accepts, signature_key};
use crate::tree::Tree;
use crate::variable::Variable;

/// Compilation settings for a [`GraphFunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Precompute an execution plan for every concrete function.
    pub jit_compile: bool,
}

impl FunctionConfig {
    /// Sets the jit flag.
    #[must_use]
    pub const fn with_jit_compile(mut self, jit_compile: bool) -> Self {
        self.jit_compile = jit_compile;
        self
    }
}

/// One graph specialized for one input signature.
///
/// Cloning is cheap; clones share graphs and variables.
#[derive(Debug, Clone)]
pub struct ConcreteFunction {
    key: String,
    signature: InputSignature,
    graph: Arc<Graph>,
    gradient: Option<Arc<Graph>>,
    variables: Arc<[Variable]>,
    plans: Option<(Arc<ExecutionPlan>, Option<Arc<ExecutionPlan>>)>,
}

impl ConcreteFunction {
    pub(crate) fn new(
        signature: InputSignature,
        graph: Graph,
        gradient: Option<Graph>,
        variables: Arc<[Variable]>,
        jit_compile: bool,
    ) -> Self {
        let plans = jit_compile.then(|| {
            (
                Arc::new(ExecutionPlan::new(&graph)),
                gradient.as_ref().map(|g| Arc::new(ExecutionPlan::new(g))),
            )
        });
        Self {
            key: signature_key(&signature),
            signature,
            graph: Arc::new(graph),
            gradient: gradient.map(Arc::new),
            variables,
            plans,
        }
    }

    /// Canonical signature key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Input signature this function was traced for.
    #[must_use]
    pub const fn signature(&self) -> &InputSignature {
        &self.signature
    }

    /// Forward graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Gradient graph, if one was built.
    #[must_use]
    pub fn gradient_graph(&self) -> Option<&Graph> {
        self.gradient.as_deref()
    }

    /// Returns `true` if a gradient graph is attached.
    #[must_use]
    pub const fn has_gradient(&self) -> bool {
        self.gradient.is_some()
    }

    /// Returns `true` if execution plans were precomputed.
    #[must_use]
    pub const fn jit_compile(&self) -> bool {
        self.plans.is_some()
    }

    /// Variables this function reads.
    #[must_use]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Returns a copy with the gradient graph removed.
    #[must_use]
    pub fn without_gradient(&self) -> Self {
        Self {
            gradient: None,
            plans: self.plans.as_ref().map(|(forward, _)| (Arc::clone(forward), None)),
            ..self.clone()
        }
    }

    /// Returns `true` if `inputs` matches the signature.
    #[must_use]
    pub fn accepts(&self, inputs: &Tree<Array>) -> bool {
        signature_accepts(&self.signature, inputs)
    }

    /// Runs the forward graph.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if `inputs` does not match the
    /// signature, or an execution error.
    pub fn call(&self, inputs: &Tree<Array>) -> Result<Tree<Array>> {
        if !self.accepts(inputs) {
            return Err(ExportError::shape_mismatch(
                self.key.clone(),
                describe_inputs(inputs),
            ));
        }
        let flat = inputs.leaves();
        let plan = self.plans.as_ref().map(|(forward, _)| forward.as_ref());
        execute(&self.graph, &flat, &self.variables, plan)
    }

    /// Runs the gradient graph: vector-Jacobian products of the outputs
    /// against `cotangents`, with respect to the inputs and the trainable
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidArgument`] if no gradient graph is
    /// attached, a structure or shape error for mismatched arguments, or an
    /// execution error.
    pub fn gradient(&self, inputs: &Tree<Array>, cotangents: &Tree<Array>) -> Result<Tree<Array>> {
        let Some(gradient) = &self.gradient else {
            return Err(ExportError::invalid_argument(format!(
                "function {} has no gradient graph",
                self.key
            )));
        };
        if !self.accepts(inputs) {
            return Err(ExportError::shape_mismatch(
                self.key.clone(),
                describe_inputs(inputs),
            ));
        }
        if !self.graph.outputs.same_structure(cotangents) {
            return Err(ExportError::structure_mismatch(
                "cotangents must have the structure of the outputs",
            ));
        }
        let mut flat = inputs.leaves();
        flat.extend(cotangents.leaves());
        let plan = self
            .plans
            .as_ref()
            .and_then(|(_, gradient)| gradient.as_deref());
        execute(gradient, &flat, &self.variables, plan)
    }
}

/// Concrete functions keyed by signature, in trace order.
#[derive(Debug, Clone, Default)]
pub struct TraceCache {
    functions: Vec<ConcreteFunction>,
}

impl TraceCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a function by signature key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConcreteFunction> {
        self.functions.iter().find(|f| f.key == key)
    }

    /// Adds a function. Returns `false` and keeps the existing entry if
    /// the key is already cached.
    pub fn insert(&mut self, function: ConcreteFunction) -> bool {
        if self.get(&function.key).is_some() {
            return false;
        }
        self.functions.push(function);
        true
    }

    /// First cached function that accepts `inputs`.
    #[must_use]
    pub fn find(&self, inputs: &Tree<Array>) -> Option<&ConcreteFunction> {
        self.functions.iter().find(|f| f.accepts(inputs))
    }

    /// Cached functions in trace order.
    #[must_use]
    pub fn functions(&self) -> &[ConcreteFunction] {
        &self.functions
    }

    /// Number of cached functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns `true` if nothing has been traced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// A converted function closed over its parameter variables.
///
/// Tracing happens only through [`GraphFunction::get_concrete_function`];
/// [`GraphFunction::call`] dispatches to an already traced function.
#[derive(Debug, Clone)]
pub struct GraphFunction {
    converted: ConvertedFn,
    params: Tree<Variable>,
    variables: Arc<[Variable]>,
    config: FunctionConfig,
    cache: TraceCache,
}

impl GraphFunction {
    /// Closes `converted` over `params`.
    #[must_use]
    pub fn new(converted: ConvertedFn, params: Tree<Variable>, config: FunctionConfig) -> Self {
        let variables: Arc<[Variable]> = params.leaves().into_iter().cloned().collect();
        Self {
            converted,
            params,
            variables,
            config,
            cache: TraceCache::new(),
        }
    }

    /// Returns the function traced for `signature`, tracing on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns any tracing error.
    pub fn get_concrete_function(&mut self, signature: &InputSignature) -> Result<ConcreteFunction> {
        let key = signature_key(signature);
        if let Some(function) = self.cache.get(&key) {
            debug!(signature = %key, "trace cache hit");
            return Ok(function.clone());
        }
        let traced = self.converted.trace(&self.params, signature)?;
        let function = ConcreteFunction::new(
            signature.clone(),
            traced.graph,
            traced.gradient,
            Arc::clone(&self.variables),
            self.config.jit_compile,
        );
        self.cache.insert(function.clone());
        Ok(function)
    }

    /// Runs the first traced function that accepts `inputs`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::NoMatchingSignature`] if no traced function
    /// accepts `inputs`, or an execution error.
    pub fn call(&self, inputs: &Tree<Array>) -> Result<Tree<Array>> {
        self.cache
            .find(inputs)
            .ok_or_else(|| ExportError::no_matching_signature(describe_inputs(inputs)))?
            .call(inputs)
    }

    /// Traced functions in trace order.
    #[must_use]
    pub fn concrete_functions(&self) -> &[ConcreteFunction] {
        self.cache.functions()
    }

    /// The trace cache.
    #[must_use]
    pub const fn cache(&self) -> &TraceCache {
        &self.cache
    }

    /// Parameter variables, flattened.
    #[must_use]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Parameter variables, in tree form.
    #[must_use]
    pub const fn params(&self) -> &Tree<Variable> {
        &self.params
    }

    /// Compilation settings.
    #[must_use]
    pub const fn config(&self) -> FunctionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;
    use crate::builder::{GraphBuilder, Traced};
    use crate::convert::{ConvertOptions, convert};
    use crate::signature::TensorSpec;
    use crate::variable::variables_from_params;
    use approx::assert_relative_eq;

    fn affine(g: &mut GraphBuilder, p: &Tree<Traced>, x: &Tree<Traced>) -> Result<Tree<Traced>> {
        let leaves = p.leaves();
        let (b, w) = (*leaves[0], *leaves[1]);
        let x = *x.as_leaf().ok_or_else(|| ExportError::trace("one input"))?;
        let xw = g.matmul(x, w)?;
        Ok(Tree::leaf(g.add(xw, b)?))
    }

    fn function(options: ConvertOptions, config: FunctionConfig) -> GraphFunction {
        let params = Tree::map([
            (
                "w",
                Tree::leaf(Array::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
            ),
            ("b", Tree::leaf(Array::from_f32(vec![2], vec![1.0, -1.0]).unwrap())),
        ]);
        let vars = variables_from_params(&params, options.with_gradient);
        GraphFunction::new(convert(affine, options), vars, config)
    }

    fn batch(rows: usize) -> Tree<Array> {
        #[allow(clippy::cast_precision_loss)]
        let values = (0..rows * 2).map(|v| v as f32).collect();
        Tree::leaf(Array::from_f32(vec![rows, 2], values).unwrap())
    }

    #[test]
    fn cache_hits_do_not_retrace() {
        let mut f = function(ConvertOptions::default(), FunctionConfig::default());
        let sig = Tree::leaf(TensorSpec::f32([Some(3), Some(2)]));
        let first = f.get_concrete_function(&sig).unwrap();
        let second = f.get_concrete_function(&sig).unwrap();
        assert_eq!(f.cache().len(), 1);
        assert!(Arc::ptr_eq(&first.graph, &second.graph));
    }

    #[test]
    fn call_dispatches_to_traced_shapes() {
        let mut f = function(ConvertOptions::default(), FunctionConfig::default());
        f.get_concrete_function(&Tree::leaf(TensorSpec::f32([Some(1), Some(2)])))
            .unwrap();
        f.get_concrete_function(&Tree::leaf(TensorSpec::f32([Some(3), Some(2)])))
            .unwrap();

        let out = f.call(&batch(1)).unwrap().into_leaves().remove(0);
        // [0, 1] . [[1, 2], [3, 4]] + [1, -1]
        assert_eq!(out.to_f32_vec(), vec![4.0, 3.0]);
        assert!(f.call(&batch(3)).is_ok());
        assert!(matches!(
            f.call(&batch(2)),
            Err(ExportError::NoMatchingSignature(_))
        ));
    }

    #[test]
    fn jit_plan_gives_identical_outputs() {
        let sig = Tree::leaf(TensorSpec::f32([None, Some(2)]));
        let mut plain = function(ConvertOptions::default(), FunctionConfig::default());
        let mut jit = function(
            ConvertOptions::default(),
            FunctionConfig::default().with_jit_compile(true),
        );
        let a = plain.get_concrete_function(&sig).unwrap();
        let b = jit.get_concrete_function(&sig).unwrap();
        assert!(!a.jit_compile());
        assert!(b.jit_compile());
        assert_eq!(a.call(&batch(4)).unwrap(), b.call(&batch(4)).unwrap());
    }

    #[test]
    fn gradient_of_affine_map() {
        let mut f = function(
            ConvertOptions::default().with_gradient(true),
            FunctionConfig::default().with_jit_compile(true),
        );
        let sig = Tree::leaf(TensorSpec::f32([None, Some(2)]));
        let concrete = f.get_concrete_function(&sig).unwrap();
        assert!(concrete.has_gradient());

        let x = Tree::leaf(Array::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        let ones = Tree::leaf(Array::from_f32(vec![2, 2], vec![1.0; 4]).unwrap());
        let grads = concrete.gradient(&x, &ones).unwrap();
        let Tree::Map(grads) = grads else {
            panic!("gradient outputs must be a map");
        };

        // d/dx = ones . w^T
        let gx = grads["inputs"].as_leaf().unwrap().to_f32_vec();
        assert_eq!(gx, vec![3.0, 7.0, 3.0, 7.0]);

        // variables in flatten order: b, w
        let gv: Vec<Vec<f32>> = grads["variables"]
            .leaves()
            .into_iter()
            .map(Array::to_f32_vec)
            .collect();
        assert_eq!(gv[0], vec![2.0, 2.0]);
        for (got, want) in gv[1].iter().zip([4.0, 4.0, 6.0, 6.0]) {
            assert_relative_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn without_gradient_drops_graph() {
        let mut f = function(
            ConvertOptions::default().with_gradient(true),
            FunctionConfig::default(),
        );
        let concrete = f
            .get_concrete_function(&Tree::leaf(TensorSpec::new([Some(1), Some(2)], DType::F32)))
            .unwrap();
        let stripped = concrete.without_gradient();
        assert!(!stripped.has_gradient());
        assert!(stripped.gradient(&batch(1), &batch(1)).is_err());
        assert_eq!(stripped.call(&batch(1)).unwrap(), concrete.call(&batch(1)).unwrap());
    }

    #[test]
    fn variables_are_shared_across_traces() {
        let mut f = function(ConvertOptions::default(), FunctionConfig::default());
        let concrete = f
            .get_concrete_function(&Tree::leaf(TensorSpec::f32([Some(1), Some(2)])))
            .unwrap();
        f.variables()[0]
            .assign(Array::from_f32(vec![2], vec![0.0, 0.0]).unwrap())
            .unwrap();
        let out = concrete.call(&batch(1)).unwrap().into_leaves().remove(0);
        assert_eq!(out.to_f32_vec(), vec![3.0, 4.0]);
    }
}
