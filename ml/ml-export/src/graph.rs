//! Traced graph representation.
//!
//! A [`Graph`] is a straight-line program over arrays. Nodes are stored in
//! topological order and refer to earlier nodes by [`NodeId`]. Parameters
//! are referenced by index into the model's variable list, so every graph
//! traced from the same model shares one set of variables.

use serde::{Deserialize, Serialize};

use crate::array::{Array, DType};
use crate::error::{ExportError, Result};
use crate::tree::Tree;

/// Index of a node within its graph.
pub type NodeId = usize;

/// One dimension of a traced shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// Known size.
    Fixed(usize),
    /// Size bound at call time. Equal names must bind equal sizes.
    Sym(String),
}

impl Dim {
    /// Returns the size if known.
    #[must_use]
    pub const fn fixed(&self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Sym(_) => None,
        }
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Sym(name) => write!(f, "{name}"),
        }
    }
}

/// Formats a traced shape as `[b, 4]`.
#[must_use]
pub fn shape_to_string(shape: &[Dim]) -> String {
    let dims: Vec<String> = shape.iter().map(ToString::to_string).collect();
    format!("[{}]", dims.join(", "))
}

/// Broadcasts two traced shapes with numpy rules.
///
/// # Errors
///
/// Returns [`ExportError::ShapeMismatch`] when a pair of dims cannot be
/// unified. A symbolic dim only unifies with itself or with `1`.
pub fn broadcast_shapes(a: &[Dim], b: &[Dim]) -> Result<Vec<Dim>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = (i + a.len()).checked_sub(rank).map(|j| &a[j]);
        let db = (i + b.len()).checked_sub(rank).map(|j| &b[j]);
        let dim = match (da, db) {
            (Some(x), None) | (None, Some(x)) => x.clone(),
            (Some(x), Some(y)) if x == y => x.clone(),
            (Some(Dim::Fixed(1)), Some(y)) => y.clone(),
            (Some(x), Some(Dim::Fixed(1))) => x.clone(),
            _ => {
                return Err(ExportError::shape_mismatch(
                    shape_to_string(a),
                    shape_to_string(b),
                ));
            }
        };
        out.push(dim);
    }
    Ok(out)
}

/// A graph operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Flattened input argument.
    Input(usize),
    /// Model variable, by index into the variable list.
    Variable(usize),
    /// Embedded constant.
    Constant(Array),
    /// Batched matrix product over the last two dims.
    MatMul(NodeId, NodeId),
    /// Broadcasting addition.
    Add(NodeId, NodeId),
    /// Broadcasting subtraction.
    Sub(NodeId, NodeId),
    /// Broadcasting multiplication.
    Mul(NodeId, NodeId),
    /// Broadcasting division.
    Div(NodeId, NodeId),
    /// Negation.
    Neg(NodeId),
    /// Natural exponential.
    Exp(NodeId),
    /// Natural logarithm.
    Log(NodeId),
    /// Hyperbolic tangent.
    Tanh(NodeId),
    /// Logistic sigmoid.
    Sigmoid(NodeId),
    /// Rectified linear unit.
    Relu(NodeId),
    /// `1` where the input is positive, `0` elsewhere.
    Step(NodeId),
    /// Multiplication by a constant factor.
    Scale(NodeId, f32),
    /// Softmax along an axis.
    Softmax {
        /// Operand.
        input: NodeId,
        /// Axis.
        axis: usize,
    },
    /// Sum along an axis, removing it.
    Sum {
        /// Operand.
        input: NodeId,
        /// Axis.
        axis: usize,
    },
    /// Mean along an axis, removing it.
    Mean {
        /// Operand.
        input: NodeId,
        /// Axis.
        axis: usize,
    },
    /// Inserts a size-one axis.
    Unsqueeze {
        /// Operand.
        input: NodeId,
        /// Position of the new axis.
        axis: usize,
    },
    /// Swaps the last two axes.
    Transpose(NodeId),
    /// Sums broadcast axes away so the result has the shape of `like`.
    SumLike {
        /// Operand.
        input: NodeId,
        /// Node whose runtime shape is the target.
        like: NodeId,
    },
    /// Broadcasts the input to the runtime shape of `like`.
    BroadcastLike {
        /// Operand.
        input: NodeId,
        /// Node whose runtime shape is the target.
        like: NodeId,
    },
    /// Zeros with the runtime shape of the operand.
    ZerosLike(NodeId),
    /// Runtime size of one axis of the operand, as a scalar.
    DimSize {
        /// Operand.
        of: NodeId,
        /// Axis.
        axis: usize,
    },
}

impl Op {
    /// Node ids this operation reads.
    #[must_use]
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            Self::Input(_) | Self::Variable(_) | Self::Constant(_) => Vec::new(),
            Self::MatMul(a, b)
            | Self::Add(a, b)
            | Self::Sub(a, b)
            | Self::Mul(a, b)
            | Self::Div(a, b) => vec![*a, *b],
            Self::Neg(a)
            | Self::Exp(a)
            | Self::Log(a)
            | Self::Tanh(a)
            | Self::Sigmoid(a)
            | Self::Relu(a)
            | Self::Step(a)
            | Self::Scale(a, _)
            | Self::Transpose(a)
            | Self::ZerosLike(a) => vec![*a],
            Self::Softmax { input, .. }
            | Self::Sum { input, .. }
            | Self::Mean { input, .. }
            | Self::Unsqueeze { input, .. } => vec![*input],
            Self::SumLike { input, like } | Self::BroadcastLike { input, like } => {
                vec![*input, *like]
            }
            Self::DimSize { of, .. } => vec![*of],
        }
    }

    /// Returns a copy with every operand passed through `f`.
    #[must_use]
    pub fn remap(&self, f: impl Fn(NodeId) -> NodeId) -> Self {
        match self.clone() {
            op @ (Self::Input(_) | Self::Variable(_) | Self::Constant(_)) => op,
            Self::MatMul(a, b) => Self::MatMul(f(a), f(b)),
            Self::Add(a, b) => Self::Add(f(a), f(b)),
            Self::Sub(a, b) => Self::Sub(f(a), f(b)),
            Self::Mul(a, b) => Self::Mul(f(a), f(b)),
            Self::Div(a, b) => Self::Div(f(a), f(b)),
            Self::Neg(a) => Self::Neg(f(a)),
            Self::Exp(a) => Self::Exp(f(a)),
            Self::Log(a) => Self::Log(f(a)),
            Self::Tanh(a) => Self::Tanh(f(a)),
            Self::Sigmoid(a) => Self::Sigmoid(f(a)),
            Self::Relu(a) => Self::Relu(f(a)),
            Self::Step(a) => Self::Step(f(a)),
            Self::Scale(a, k) => Self::Scale(f(a), k),
            Self::Transpose(a) => Self::Transpose(f(a)),
            Self::ZerosLike(a) => Self::ZerosLike(f(a)),
            Self::Softmax { input, axis } => Self::Softmax {
                input: f(input),
                axis,
            },
            Self::Sum { input, axis } => Self::Sum {
                input: f(input),
                axis,
            },
            Self::Mean { input, axis } => Self::Mean {
                input: f(input),
                axis,
            },
            Self::Unsqueeze { input, axis } => Self::Unsqueeze {
                input: f(input),
                axis,
            },
            Self::SumLike { input, like } => Self::SumLike {
                input: f(input),
                like: f(like),
            },
            Self::BroadcastLike { input, like } => Self::BroadcastLike {
                input: f(input),
                like: f(like),
            },
            Self::DimSize { of, axis } => Self::DimSize { of: f(of), axis },
        }
    }

    /// Returns `true` for operations that read no runtime values.
    #[must_use]
    pub const fn is_source(&self) -> bool {
        matches!(self, Self::Input(_) | Self::Variable(_) | Self::Constant(_))
    }
}

/// A node: an operation plus its traced result shape and dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Operation.
    pub op: Op,
    /// Result shape.
    pub shape: Vec<Dim>,
    /// Result dtype.
    pub dtype: DType,
}

/// A traced input slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInput {
    /// Traced shape.
    pub shape: Vec<Dim>,
    /// Element type.
    pub dtype: DType,
}

/// A traced variable reference: the shape the graph was traced against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSlot {
    /// Index into the model's variable list.
    pub index: usize,
    /// Traced shape.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
}

/// A straight-line program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Flattened inputs, in input-tree order.
    pub inputs: Vec<GraphInput>,
    /// Variables read by this graph.
    pub variables: Vec<VariableSlot>,
    /// Nodes in topological order.
    pub nodes: Vec<Node>,
    /// Output nodes.
    pub outputs: Tree<NodeId>,
}

impl Graph {
    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Checks that every operand and output refers to an earlier node and
    /// every input/variable index is in range.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Trace`] describing the first broken reference.
    pub fn validate(&self, variable_count: usize) -> Result<()> {
        for (id, node) in self.nodes.iter().enumerate() {
            if let Some(bad) = node.op.operands().into_iter().find(|&o| o >= id) {
                return Err(ExportError::trace(format!(
                    "node {id} reads node {bad}, which is not earlier"
                )));
            }
            match node.op {
                Op::Input(i) if i >= self.inputs.len() => {
                    return Err(ExportError::trace(format!(
                        "node {id} reads input {i}, graph has {}",
                        self.inputs.len()
                    )));
                }
                Op::Variable(v) if v >= variable_count => {
                    return Err(ExportError::trace(format!(
                        "node {id} reads variable {v}, model has {variable_count}"
                    )));
                }
                _ => {}
            }
        }
        if let Some(&bad) = self
            .outputs
            .leaves()
            .into_iter()
            .find(|&&o| o >= self.nodes.len())
        {
            return Err(ExportError::trace(format!("output refers to missing node {bad}")));
        }
        Ok(())
    }

    /// For each node, the index of the last node that reads it.
    ///
    /// Outputs are treated as read at the end of the program.
    #[must_use]
    pub fn last_uses(&self) -> Vec<usize> {
        let end = self.nodes.len();
        let mut last = (0..end).collect::<Vec<_>>();
        for (id, node) in self.nodes.iter().enumerate() {
            for operand in node.op.operands() {
                last[operand] = last[operand].max(id);
            }
        }
        for &out in self.outputs.leaves() {
            if out < end {
                last[out] = end;
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(dims: &[usize]) -> Vec<Dim> {
        dims.iter().map(|&d| Dim::Fixed(d)).collect()
    }

    #[test]
    fn broadcast_fixed() {
        assert_eq!(broadcast_shapes(&fixed(&[2, 3]), &fixed(&[3])).unwrap(), fixed(&[2, 3]));
        assert_eq!(broadcast_shapes(&fixed(&[2, 1]), &fixed(&[1, 3])).unwrap(), fixed(&[2, 3]));
        assert!(broadcast_shapes(&fixed(&[2, 3]), &fixed(&[4])).is_err());
    }

    #[test]
    fn broadcast_symbolic() {
        let b = Dim::Sym("b".into());
        let x = vec![b.clone(), Dim::Fixed(3)];
        assert_eq!(broadcast_shapes(&x, &fixed(&[3])).unwrap(), x);
        assert_eq!(broadcast_shapes(&x, &fixed(&[1, 3])).unwrap(), x);
        assert_eq!(broadcast_shapes(&x, &x).unwrap(), x);

        let other = vec![Dim::Sym("c".into()), Dim::Fixed(3)];
        assert!(broadcast_shapes(&x, &other).is_err());
        assert!(broadcast_shapes(&x, &fixed(&[5, 3])).is_err());
    }

    #[test]
    fn shape_formatting() {
        let shape = vec![Dim::Sym("b".into()), Dim::Fixed(4)];
        assert_eq!(shape_to_string(&shape), "[b, 4]");
    }

    #[test]
    fn op_operands_and_remap() {
        let op = Op::SumLike { input: 3, like: 1 };
        assert_eq!(op.operands(), vec![3, 1]);
        assert_eq!(op.remap(|i| i + 10), Op::SumLike { input: 13, like: 11 });
        assert!(Op::Variable(0).is_source());
        assert!(!Op::Neg(0).is_source());
    }

    fn tiny_graph() -> Graph {
        Graph {
            inputs: vec![GraphInput {
                shape: fixed(&[2]),
                dtype: DType::F32,
            }],
            variables: Vec::new(),
            nodes: vec![
                Node {
                    op: Op::Input(0),
                    shape: fixed(&[2]),
                    dtype: DType::F32,
                },
                Node {
                    op: Op::Neg(0),
                    shape: fixed(&[2]),
                    dtype: DType::F32,
                },
                Node {
                    op: Op::Exp(1),
                    shape: fixed(&[2]),
                    dtype: DType::F32,
                },
            ],
            outputs: Tree::leaf(2),
        }
    }

    #[test]
    fn graph_validate() {
        let graph = tiny_graph();
        assert!(graph.validate(0).is_ok());

        let mut broken = graph.clone();
        broken.nodes[1].op = Op::Neg(2);
        assert!(broken.validate(0).is_err());

        let mut broken = graph;
        broken.nodes[0].op = Op::Variable(0);
        assert!(broken.validate(0).is_err());
    }

    #[test]
    fn graph_last_uses() {
        let graph = tiny_graph();
        assert_eq!(graph.last_uses(), vec![1, 2, 3]);
    }
}
