//! Reverse-mode gradient graphs.
//!
//! The gradient of a forward graph is itself a graph: it takes the forward
//! inputs followed by one cotangent per forward output, and returns
//! `{"inputs": [..], "variables": [..]}`, the vector-Jacobian products for
//! every flattened input and every requested variable.

use tracing::debug;

use crate::builder::{GraphBuilder, Traced};
use crate::error::Result;
use crate::graph::{Graph, NodeId, Op, VariableSlot};
use crate::tree::Tree;

/// Output key holding input gradients.
pub const INPUTS_KEY: &str = "inputs";

/// Output key holding variable gradients.
pub const VARIABLES_KEY: &str = "variables";

struct Grads {
    slots: Vec<Option<Traced>>,
}

impl Grads {
    fn accumulate(&mut self, g: &mut GraphBuilder, id: NodeId, value: Traced) -> Result<()> {
        let next = match self.slots[id] {
            Some(prev) => g.add(prev, value)?,
            None => value,
        };
        self.slots[id] = Some(next);
        Ok(())
    }
}

/// Builds the gradient graph of `forward` with respect to its inputs and
/// the variables in `wrt`.
///
/// Input gradients are arranged like `inputs`, whose leaf count must equal
/// the number of forward inputs.
///
/// # Errors
///
/// Propagates shape errors from building the backward nodes, or
/// [`ExportError::StructureMismatch`](crate::ExportError::StructureMismatch)
/// if `inputs` does not describe the forward inputs.
pub fn build_gradient(
    forward: &Graph,
    inputs: &Tree<()>,
    wrt: &[VariableSlot],
) -> Result<Graph> {
    let mut g = GraphBuilder::extend(forward);
    let mut grads = Grads {
        slots: vec![None; forward.nodes.len()],
    };

    for &out in forward.outputs.leaves() {
        let node = &forward.nodes[out];
        let cotangent = g.input(node.shape.clone(), node.dtype);
        grads.accumulate(&mut g, out, cotangent)?;
    }

    for id in (0..forward.nodes.len()).rev() {
        let Some(gy) = grads.slots[id] else {
            continue;
        };
        let y = GraphBuilder::handle(id);
        backprop(&mut g, &mut grads, &forward.nodes[id].op, y, gy)?;
    }

    let input_grads = (0..forward.inputs.len())
        .map(|i| {
            let node = forward
                .nodes
                .iter()
                .position(|n| n.op == Op::Input(i))
                .map(GraphBuilder::handle);
            match node {
                Some(x) => match grads.slots[x.id()] {
                    Some(gx) => Ok(gx),
                    None => g.zeros_like(x),
                },
                None => {
                    let shape = forward.inputs[i].shape.clone();
                    let placeholder = g.input(shape, forward.inputs[i].dtype);
                    g.zeros_like(placeholder)
                }
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let variable_grads = wrt
        .iter()
        .map(|slot| {
            let mut total: Option<Traced> = None;
            for (id, node) in forward.nodes.iter().enumerate() {
                if node.op != Op::Variable(slot.index) {
                    continue;
                }
                if let Some(gv) = grads.slots[id] {
                    total = Some(match total {
                        Some(prev) => g.add(prev, gv)?,
                        None => gv,
                    });
                }
            }
            match total {
                Some(gv) => Ok(gv),
                None => {
                    let v = g.variable(slot.index, &slot.shape, slot.dtype);
                    g.zeros_like(v)
                }
            }
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        forward_nodes = forward.nodes.len(),
        inputs = input_grads.len(),
        variables = variable_grads.len(),
        "built gradient graph"
    );

    let outputs = Tree::map([
        (INPUTS_KEY, inputs.unflatten(input_grads)?),
        (VARIABLES_KEY, Tree::seq(variable_grads.into_iter().map(Tree::leaf))),
    ]);
    Ok(g.finish(&outputs))
}

fn backprop(g: &mut GraphBuilder, grads: &mut Grads, op: &Op, y: Traced, gy: Traced) -> Result<()> {
    let h = GraphBuilder::handle;
    match *op {
        Op::Input(_)
        | Op::Variable(_)
        | Op::Constant(_)
        | Op::Step(_)
        | Op::ZerosLike(_)
        | Op::DimSize { .. } => {}
        Op::Add(a, b) => {
            let ga = g.sum_like(gy, h(a))?;
            let gb = g.sum_like(gy, h(b))?;
            grads.accumulate(g, a, ga)?;
            grads.accumulate(g, b, gb)?;
        }
        Op::Sub(a, b) => {
            let ga = g.sum_like(gy, h(a))?;
            let neg = g.neg(gy)?;
            let gb = g.sum_like(neg, h(b))?;
            grads.accumulate(g, a, ga)?;
            grads.accumulate(g, b, gb)?;
        }
        Op::Mul(a, b) => {
            let ta = g.mul(gy, h(b))?;
            let ga = g.sum_like(ta, h(a))?;
            let tb = g.mul(gy, h(a))?;
            let gb = g.sum_like(tb, h(b))?;
            grads.accumulate(g, a, ga)?;
            grads.accumulate(g, b, gb)?;
        }
        Op::Div(a, b) => {
            // d(a/b)/db = -y/b
            let ta = g.div(gy, h(b))?;
            let ga = g.sum_like(ta, h(a))?;
            let gy_y = g.mul(gy, y)?;
            let q = g.div(gy_y, h(b))?;
            let tb = g.neg(q)?;
            let gb = g.sum_like(tb, h(b))?;
            grads.accumulate(g, a, ga)?;
            grads.accumulate(g, b, gb)?;
        }
        Op::MatMul(a, b) => {
            let bt = g.transpose(h(b))?;
            let ta = g.matmul(gy, bt)?;
            let ga = g.sum_like(ta, h(a))?;
            let at = g.transpose(h(a))?;
            let tb = g.matmul(at, gy)?;
            let gb = g.sum_like(tb, h(b))?;
            grads.accumulate(g, a, ga)?;
            grads.accumulate(g, b, gb)?;
        }
        Op::Neg(a) => {
            let ga = g.neg(gy)?;
            grads.accumulate(g, a, ga)?;
        }
        Op::Exp(a) => {
            let ga = g.mul(gy, y)?;
            grads.accumulate(g, a, ga)?;
        }
        Op::Log(a) => {
            let ga = g.div(gy, h(a))?;
            grads.accumulate(g, a, ga)?;
        }
        Op::Tanh(a) => {
            let one = g.scalar(1.0);
            let y2 = g.mul(y, y)?;
            let d = g.sub(one, y2)?;
            let ga = g.mul(gy, d)?;
            grads.accumulate(g, a, ga)?;
        }
        Op::Sigmoid(a) => {
            let one = g.scalar(1.0);
            let c = g.sub(one, y)?;
            let d = g.mul(y, c)?;
            let ga = g.mul(gy, d)?;
            grads.accumulate(g, a, ga)?;
        }
        Op::Relu(a) => {
            let mask = g.step(h(a))?;
            let ga = g.mul(gy, mask)?;
            grads.accumulate(g, a, ga)?;
        }
        Op::Scale(a, k) => {
            let ga = g.scale(gy, k)?;
            grads.accumulate(g, a, ga)?;
        }
        Op::Softmax { input, axis } => {
            let gy_y = g.mul(gy, y)?;
            let s = g.sum(gy_y, axis)?;
            let s = g.unsqueeze(s, axis)?;
            let centered = g.sub(gy, s)?;
            let ga = g.mul(y, centered)?;
            grads.accumulate(g, input, ga)?;
        }
        Op::Sum { input, axis } => {
            let u = g.unsqueeze(gy, axis)?;
            let ga = g.broadcast_like(u, h(input))?;
            grads.accumulate(g, input, ga)?;
        }
        Op::Mean { input, axis } => {
            let u = g.unsqueeze(gy, axis)?;
            let b = g.broadcast_like(u, h(input))?;
            let n = g.dim_size(h(input), axis)?;
            let ga = g.div(b, n)?;
            grads.accumulate(g, input, ga)?;
        }
        Op::Unsqueeze { input, axis } => {
            let ga = g.sum(gy, axis)?;
            grads.accumulate(g, input, ga)?;
        }
        Op::Transpose(a) => {
            let ga = g.transpose(gy)?;
            grads.accumulate(g, a, ga)?;
        }
        Op::SumLike { input, .. } => {
            let ga = g.broadcast_like(gy, h(input))?;
            grads.accumulate(g, input, ga)?;
        }
        Op::BroadcastLike { input, .. } => {
            let ga = g.sum_like(gy, h(input))?;
            grads.accumulate(g, input, ga)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;
    use crate::graph::Dim;

    #[test]
    fn gradient_graph_layout() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![Dim::Sym("b".into()), Dim::Fixed(4)], DType::F32);
        let w = g.variable(0, &[4, 3], DType::F32);
        let y = g.matmul(x, w).unwrap();
        let forward = g.finish(&Tree::leaf(y));

        let wrt = vec![VariableSlot {
            index: 0,
            shape: vec![4, 3],
            dtype: DType::F32,
        }];
        let grad = build_gradient(&forward, &Tree::leaf(()), &wrt).unwrap();

        // forward input + one cotangent
        assert_eq!(grad.inputs.len(), 2);
        assert!(grad.validate(1).is_ok());

        let Tree::Map(outputs) = &grad.outputs else {
            panic!("gradient outputs must be a map");
        };
        assert_eq!(outputs[INPUTS_KEY].leaf_count(), 1);
        assert_eq!(outputs[VARIABLES_KEY].leaf_count(), 1);

        let gw = *outputs[VARIABLES_KEY].leaves()[0];
        let fixed: Vec<Option<usize>> = grad.nodes[gw].shape.iter().map(Dim::fixed).collect();
        assert_eq!(fixed, vec![Some(4), Some(3)]);
    }

    #[test]
    fn unused_variable_gets_zeros() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![Dim::Fixed(2)], DType::F32);
        let y = g.exp(x).unwrap();
        let forward = g.finish(&Tree::leaf(y));

        let wrt = vec![VariableSlot {
            index: 3,
            shape: vec![5],
            dtype: DType::F32,
        }];
        let grad = build_gradient(&forward, &Tree::leaf(()), &wrt).unwrap();
        let Tree::Map(outputs) = &grad.outputs else {
            panic!("gradient outputs must be a map");
        };
        let gv = *outputs[VARIABLES_KEY].leaves()[0];
        assert!(matches!(grad.nodes[gv].op, Op::ZerosLike(_)));
        assert!(grad.validate(4).is_ok());
    }
}
