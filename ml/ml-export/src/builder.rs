//! Symbolic tracing API.
//!
//! Model functions are written against [`GraphBuilder`]: every operation
//! records a node, infers its shape, and returns a [`Traced`] handle.
//! Tracing a function once per signature yields the graphs that are
//! saved in the model artifact.

use crate::array::{Array, DType, MAX_RANK};
use crate::error::{ExportError, Result};
use crate::graph::{
    Dim, Graph, GraphInput, Node, NodeId, Op, VariableSlot, broadcast_shapes, shape_to_string,
};
use crate::tree::Tree;

/// Handle to a value recorded by a [`GraphBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Traced(NodeId);

impl Traced {
    /// Node id within the graph being built.
    #[must_use]
    pub const fn id(self) -> NodeId {
        self.0
    }
}

/// Records operations into a [`Graph`].
///
/// # Example
///
/// ```
/// use ml_export::{Array, GraphBuilder};
///
/// let mut g = GraphBuilder::new();
/// let w = g.constant(Array::from_f32(vec![2, 1], vec![1.0, 2.0]).unwrap());
/// let x = g.constant(Array::from_f32(vec![3, 2], vec![0.0; 6]).unwrap());
/// let y = g.matmul(x, w).unwrap();
/// assert_eq!(g.shape(y).len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    inputs: Vec<GraphInput>,
    variables: Vec<VariableSlot>,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues building on top of an existing graph. Node ids of `graph`
    /// stay valid.
    pub(crate) fn extend(graph: &Graph) -> Self {
        Self {
            inputs: graph.inputs.clone(),
            variables: graph.variables.clone(),
            nodes: graph.nodes.clone(),
        }
    }

    /// Handle for an existing node id.
    pub(crate) const fn handle(id: NodeId) -> Traced {
        Traced(id)
    }

    /// Adds an input placeholder.
    pub(crate) fn input(&mut self, shape: Vec<Dim>, dtype: DType) -> Traced {
        let index = self.inputs.len();
        self.inputs.push(GraphInput {
            shape: shape.clone(),
            dtype,
        });
        self.push(Op::Input(index), shape, dtype)
    }

    /// Adds a read of model variable `index`.
    pub(crate) fn variable(&mut self, index: usize, shape: &[usize], dtype: DType) -> Traced {
        if !self.variables.iter().any(|v| v.index == index) {
            self.variables.push(VariableSlot {
                index,
                shape: shape.to_vec(),
                dtype,
            });
        }
        self.push(
            Op::Variable(index),
            shape.iter().copied().map(Dim::Fixed).collect(),
            dtype,
        )
    }

    /// Finishes the graph with the given outputs.
    pub(crate) fn finish(self, outputs: &Tree<Traced>) -> Graph {
        Graph {
            inputs: self.inputs,
            variables: self.variables,
            nodes: self.nodes,
            outputs: outputs.map_leaves(|t| t.0),
        }
    }

    /// Number of recorded nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Traced shape of a value.
    ///
    /// Handles from another builder return an empty shape.
    #[must_use]
    pub fn shape(&self, t: Traced) -> &[Dim] {
        self.nodes
            .get(t.0)
            .map(|n| n.shape.as_slice())
            .unwrap_or(&[])
    }

    /// Element type of a value.
    #[must_use]
    pub fn dtype(&self, t: Traced) -> DType {
        self.nodes.get(t.0).map_or(DType::F32, |n| n.dtype)
    }

    /// Rank of a value.
    #[must_use]
    pub fn rank(&self, t: Traced) -> usize {
        self.shape(t).len()
    }

    fn push(&mut self, op: Op, shape: Vec<Dim>, dtype: DType) -> Traced {
        self.nodes.push(Node { op, shape, dtype });
        Traced(self.nodes.len() - 1)
    }

    fn node(&self, t: Traced) -> Result<&Node> {
        self.nodes
            .get(t.0)
            .ok_or_else(|| ExportError::trace(format!("value {} was not recorded here", t.0)))
    }

    fn check_axis(&self, t: Traced, axis: usize) -> Result<()> {
        let rank = self.node(t)?.shape.len();
        if axis >= rank {
            return Err(ExportError::trace(format!(
                "axis {axis} out of range for rank {rank}"
            )));
        }
        Ok(())
    }

    /// Embeds a constant.
    pub fn constant(&mut self, array: Array) -> Traced {
        let shape = array.shape().iter().copied().map(Dim::Fixed).collect();
        let dtype = array.dtype();
        self.push(Op::Constant(array), shape, dtype)
    }

    /// Embeds a scalar constant.
    pub fn scalar(&mut self, value: f32) -> Traced {
        self.constant(Array::scalar(value))
    }

    /// Matrix product over the last two dims, broadcasting leading dims.
    ///
    /// # Errors
    ///
    /// Returns an error if either rank is below 2 or the inner dims differ.
    pub fn matmul(&mut self, a: Traced, b: Traced) -> Result<Traced> {
        let (na, nb) = (self.node(a)?, self.node(b)?);
        let (sa, sb) = (&na.shape, &nb.shape);
        if sa.len() < 2 || sb.len() < 2 {
            return Err(ExportError::shape_mismatch(
                "rank >= 2 operands for matmul",
                format!("{} and {}", shape_to_string(sa), shape_to_string(sb)),
            ));
        }
        let (ra, rb) = (sa.len(), sb.len());
        if sa[ra - 1] != sb[rb - 2] {
            return Err(ExportError::shape_mismatch(
                format!("inner dim {} for matmul", sa[ra - 1]),
                format!("{} and {}", shape_to_string(sa), shape_to_string(sb)),
            ));
        }
        let mut shape = broadcast_shapes(&sa[..ra - 2], &sb[..rb - 2])?;
        shape.push(sa[ra - 2].clone());
        shape.push(sb[rb - 1].clone());
        let dtype = na.dtype.promote(nb.dtype);
        Ok(self.push(Op::MatMul(a.0, b.0), shape, dtype))
    }

    fn binary(&mut self, a: Traced, b: Traced, op: Op) -> Result<Traced> {
        let (na, nb) = (self.node(a)?, self.node(b)?);
        let shape = broadcast_shapes(&na.shape, &nb.shape)?;
        let dtype = na.dtype.promote(nb.dtype);
        Ok(self.push(op, shape, dtype))
    }

    /// Elementwise `a + b` with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn add(&mut self, a: Traced, b: Traced) -> Result<Traced> {
        self.binary(a, b, Op::Add(a.0, b.0))
    }

    /// Elementwise `a - b` with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn sub(&mut self, a: Traced, b: Traced) -> Result<Traced> {
        self.binary(a, b, Op::Sub(a.0, b.0))
    }

    /// Elementwise `a * b` with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn mul(&mut self, a: Traced, b: Traced) -> Result<Traced> {
        self.binary(a, b, Op::Mul(a.0, b.0))
    }

    /// Elementwise `a / b` with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if the shapes do not broadcast.
    pub fn div(&mut self, a: Traced, b: Traced) -> Result<Traced> {
        self.binary(a, b, Op::Div(a.0, b.0))
    }

    fn unary(&mut self, a: Traced, op: Op) -> Result<Traced> {
        let node = self.node(a)?;
        let (shape, dtype) = (node.shape.clone(), node.dtype);
        Ok(self.push(op, shape, dtype))
    }

    /// Elementwise negation.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] for a foreign handle.
    pub fn neg(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::Neg(a.0))
    }

    /// Elementwise exponential.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] for a foreign handle.
    pub fn exp(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::Exp(a.0))
    }

    /// Elementwise natural logarithm.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] for a foreign handle.
    pub fn log(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::Log(a.0))
    }

    /// Elementwise hyperbolic tangent.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] for a foreign handle.
    pub fn tanh(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::Tanh(a.0))
    }

    /// Elementwise logistic sigmoid.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] for a foreign handle.
    pub fn sigmoid(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::Sigmoid(a.0))
    }

    /// Elementwise rectified linear unit.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] for a foreign handle.
    pub fn relu(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::Relu(a.0))
    }

    /// Multiplies by a constant factor.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] for a foreign handle.
    pub fn scale(&mut self, a: Traced, factor: f32) -> Result<Traced> {
        self.unary(a, Op::Scale(a.0, factor))
    }

    /// Softmax along `axis`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] if `axis` is out of range.
    pub fn softmax(&mut self, a: Traced, axis: usize) -> Result<Traced> {
        self.check_axis(a, axis)?;
        self.unary(a, Op::Softmax { input: a.0, axis })
    }

    fn reduce(&mut self, a: Traced, axis: usize, op: Op) -> Result<Traced> {
        self.check_axis(a, axis)?;
        let node = self.node(a)?;
        let mut shape = node.shape.clone();
        shape.remove(axis);
        let dtype = node.dtype;
        Ok(self.push(op, shape, dtype))
    }

    /// Sum along `axis`, removing it.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] if `axis` is out of range.
    pub fn sum(&mut self, a: Traced, axis: usize) -> Result<Traced> {
        self.reduce(a, axis, Op::Sum { input: a.0, axis })
    }

    /// Mean along `axis`, removing it.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] if `axis` is out of range.
    pub fn mean(&mut self, a: Traced, axis: usize) -> Result<Traced> {
        self.reduce(a, axis, Op::Mean { input: a.0, axis })
    }

    /// Swaps the last two axes.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if the rank is below 2.
    pub fn transpose(&mut self, a: Traced) -> Result<Traced> {
        let node = self.node(a)?;
        let rank = node.shape.len();
        if rank < 2 {
            return Err(ExportError::shape_mismatch(
                "rank >= 2 for transpose",
                shape_to_string(&node.shape),
            ));
        }
        let mut shape = node.shape.clone();
        shape.swap(rank - 2, rank - 1);
        let dtype = node.dtype;
        Ok(self.push(Op::Transpose(a.0), shape, dtype))
    }

    /// Inserts a size-one axis at `axis`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] if `axis` exceeds the rank or the
    /// result would exceed [`MAX_RANK`].
    pub fn unsqueeze(&mut self, a: Traced, axis: usize) -> Result<Traced> {
        let node = self.node(a)?;
        if axis > node.shape.len() || node.shape.len() >= MAX_RANK {
            return Err(ExportError::trace(format!(
                "cannot insert axis {axis} into {}",
                shape_to_string(&node.shape)
            )));
        }
        let mut shape = node.shape.clone();
        shape.insert(axis, Dim::Fixed(1));
        let dtype = node.dtype;
        Ok(self.push(Op::Unsqueeze { input: a.0, axis }, shape, dtype))
    }

    pub(crate) fn step(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::Step(a.0))
    }

    pub(crate) fn sum_like(&mut self, a: Traced, like: Traced) -> Result<Traced> {
        let target = self.node(like)?.shape.clone();
        let dtype = self.node(a)?.dtype;
        Ok(self.push(Op::SumLike { input: a.0, like: like.0 }, target, dtype))
    }

    pub(crate) fn broadcast_like(&mut self, a: Traced, like: Traced) -> Result<Traced> {
        let target = self.node(like)?.shape.clone();
        let dtype = self.node(a)?.dtype;
        Ok(self.push(Op::BroadcastLike { input: a.0, like: like.0 }, target, dtype))
    }

    pub(crate) fn zeros_like(&mut self, a: Traced) -> Result<Traced> {
        self.unary(a, Op::ZerosLike(a.0))
    }

    pub(crate) fn dim_size(&mut self, a: Traced, axis: usize) -> Result<Traced> {
        self.check_axis(a, axis)?;
        Ok(self.push(Op::DimSize { of: a.0, axis }, Vec::new(), DType::F32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Dim {
        Dim::Sym(name.to_string())
    }

    #[test]
    fn matmul_shapes() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![sym("b"), Dim::Fixed(4)], DType::F32);
        let w = g.variable(0, &[4, 3], DType::F32);
        let y = g.matmul(x, w).unwrap();
        assert_eq!(g.shape(y), &[sym("b"), Dim::Fixed(3)]);

        let bad = g.variable(1, &[5, 3], DType::F32);
        assert!(matches!(g.matmul(x, bad), Err(ExportError::ShapeMismatch { .. })));
    }

    #[test]
    fn batched_matmul_broadcasts_batch_dims() {
        let mut g = GraphBuilder::new();
        let a = g.input(vec![Dim::Fixed(2), Dim::Fixed(1), Dim::Fixed(3), Dim::Fixed(4)], DType::F32);
        let b = g.input(vec![Dim::Fixed(5), Dim::Fixed(4), Dim::Fixed(6)], DType::F32);
        let c = g.matmul(a, b).unwrap();
        let fixed: Vec<Option<usize>> = g.shape(c).iter().map(Dim::fixed).collect();
        assert_eq!(fixed, vec![Some(2), Some(5), Some(3), Some(6)]);
    }

    #[test]
    fn binary_broadcast_and_dtype() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![sym("b"), Dim::Fixed(3)], DType::F32);
        let bias = g.variable(0, &[3], DType::F64);
        let y = g.add(x, bias).unwrap();
        assert_eq!(g.shape(y), &[sym("b"), Dim::Fixed(3)]);
        assert_eq!(g.dtype(y), DType::F64);
    }

    #[test]
    fn reductions_remove_axis() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![sym("b"), Dim::Fixed(3)], DType::F32);
        let s = g.sum(x, 1).unwrap();
        assert_eq!(g.shape(s), &[sym("b")]);
        let m = g.mean(x, 0).unwrap();
        assert_eq!(g.shape(m), &[Dim::Fixed(3)]);
        assert!(g.sum(x, 2).is_err());
        assert!(g.softmax(x, 5).is_err());
    }

    #[test]
    fn transpose_and_unsqueeze() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![sym("b"), Dim::Fixed(3)], DType::F32);
        let t = g.transpose(x).unwrap();
        assert_eq!(g.shape(t), &[Dim::Fixed(3), sym("b")]);
        let u = g.unsqueeze(x, 1).unwrap();
        assert_eq!(g.shape(u), &[sym("b"), Dim::Fixed(1), Dim::Fixed(3)]);

        let s = g.scalar(1.0);
        assert!(g.transpose(s).is_err());
    }

    #[test]
    fn variables_are_recorded_once() {
        let mut g = GraphBuilder::new();
        g.variable(0, &[2], DType::F32);
        g.variable(0, &[2], DType::F32);
        let v = g.variable(1, &[3], DType::F32);
        let graph = g.finish(&Tree::leaf(v));
        assert_eq!(graph.variables.len(), 2);
        assert!(graph.validate(2).is_ok());
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut g = GraphBuilder::new();
        let stray = GraphBuilder::handle(42);
        assert!(g.neg(stray).is_err());
        assert!(g.shape(stray).is_empty());
    }
}
