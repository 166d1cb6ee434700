//! Graph simplification passes.

use tracing::debug;

use crate::error::Result;
use crate::exec::eval_constant;
use crate::graph::{Dim, Graph, Node, NodeId, Op};

/// Counts reported by [`optimize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptimizeStats {
    /// Nodes replaced by a precomputed constant.
    pub folded: usize,
    /// Nodes removed because no output depends on them.
    pub removed: usize,
}

/// Runs constant folding followed by dead-node elimination.
///
/// # Errors
///
/// Returns an error if evaluating a constant subgraph fails.
pub fn optimize(graph: &Graph) -> Result<(Graph, OptimizeStats)> {
    let (folded_graph, folded) = fold_constants(graph)?;
    let (pruned, removed) = eliminate_dead_nodes(&folded_graph);
    let stats = OptimizeStats { folded, removed };
    debug!(
        nodes_before = graph.len(),
        nodes_after = pruned.len(),
        folded = stats.folded,
        removed = stats.removed,
        "optimized graph"
    );
    Ok((pruned, stats))
}

/// Replaces every operation whose operands are all constants with its
/// value.
///
/// # Errors
///
/// Returns an error if evaluating a constant operation fails.
pub fn fold_constants(graph: &Graph) -> Result<(Graph, usize)> {
    let mut nodes: Vec<Node> = Vec::with_capacity(graph.nodes.len());
    let mut folded = 0;

    for node in &graph.nodes {
        let operands = node.op.operands();
        let constants: Option<Vec<_>> = operands
            .iter()
            .map(|&o| match &nodes[o].op {
                Op::Constant(array) => Some(array),
                _ => None,
            })
            .collect();

        let shape: Option<Vec<usize>> = node.shape.iter().map(Dim::fixed).collect();
        let op = match (constants, shape) {
            (Some(arrays), Some(shape)) if !node.op.is_source() => {
                folded += 1;
                Op::Constant(eval_constant(&node.op, &shape, node.dtype, &arrays)?)
            }
            _ => node.op.clone(),
        };
        nodes.push(Node {
            op,
            shape: node.shape.clone(),
            dtype: node.dtype,
        });
    }

    let out = Graph {
        inputs: graph.inputs.clone(),
        variables: graph.variables.clone(),
        nodes,
        outputs: graph.outputs.clone(),
    };
    Ok((out, folded))
}

/// Removes nodes that no output depends on. Input nodes are always kept.
#[must_use]
pub fn eliminate_dead_nodes(graph: &Graph) -> (Graph, usize) {
    let n = graph.nodes.len();
    let mut live = vec![false; n];
    for &out in graph.outputs.leaves() {
        live[out] = true;
    }
    for id in (0..n).rev() {
        if matches!(graph.nodes[id].op, Op::Input(_)) {
            live[id] = true;
        }
        if live[id] {
            for operand in graph.nodes[id].op.operands() {
                live[operand] = true;
            }
        }
    }

    let mut remap: Vec<Option<NodeId>> = vec![None; n];
    let mut nodes = Vec::new();
    for (id, node) in graph.nodes.iter().enumerate() {
        if !live[id] {
            continue;
        }
        remap[id] = Some(nodes.len());
        let op = node.op.remap(|o| remap[o].unwrap_or(o));
        nodes.push(Node {
            op,
            shape: node.shape.clone(),
            dtype: node.dtype,
        });
    }

    let read: Vec<usize> = nodes
        .iter()
        .filter_map(|node| match node.op {
            Op::Variable(v) => Some(v),
            _ => None,
        })
        .collect();
    let variables = graph
        .variables
        .iter()
        .filter(|slot| read.contains(&slot.index))
        .cloned()
        .collect();

    let removed = n - nodes.len();
    let out = Graph {
        inputs: graph.inputs.clone(),
        variables,
        nodes,
        outputs: graph.outputs.map_leaves(|&o| remap[o].unwrap_or(o)),
    };
    (out, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Array, DType};
    use crate::builder::GraphBuilder;
    use crate::exec::execute;
    use crate::tree::Tree;

    #[test]
    fn folds_constant_subgraphs() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![Dim::Fixed(2)], DType::F32);
        let a = g.scalar(2.0);
        let b = g.scalar(3.0);
        let ab = g.mul(a, b).unwrap();
        let y = g.mul(x, ab).unwrap();
        let graph = g.finish(&Tree::leaf(y));

        let (folded, count) = fold_constants(&graph).unwrap();
        assert_eq!(count, 1);
        match &folded.nodes[ab.id()].op {
            Op::Constant(c) => assert_eq!(c.to_f32_vec(), vec![6.0]),
            other => panic!("expected a constant, got {other:?}"),
        }
    }

    #[test]
    fn removes_dead_nodes_and_remaps() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![Dim::Fixed(2)], DType::F32);
        let _unused = g.exp(x).unwrap();
        let w = g.variable(0, &[2], DType::F32);
        let _unused_var = g.variable(1, &[2], DType::F32);
        let y = g.add(x, w).unwrap();
        let graph = g.finish(&Tree::leaf(y));

        let (pruned, removed) = eliminate_dead_nodes(&graph);
        assert_eq!(removed, 2);
        assert_eq!(pruned.len(), 3);
        assert_eq!(pruned.variables.len(), 1);
        assert!(pruned.validate(2).is_ok());
        assert_eq!(pruned.outputs, Tree::leaf(2));
    }

    #[test]
    fn optimized_graph_computes_the_same() {
        let mut g = GraphBuilder::new();
        let x = g.input(vec![Dim::Sym("n".into())], DType::F32);
        let one = g.scalar(1.0);
        let two = g.scalar(2.0);
        let three = g.add(one, two).unwrap();
        let _dead = g.neg(x).unwrap();
        let y = g.mul(x, three).unwrap();
        let graph = g.finish(&Tree::leaf(y));

        let (optimized, stats) = optimize(&graph).unwrap();
        assert_eq!(stats.folded, 1);
        assert_eq!(stats.removed, 3);

        let input = Array::from_f32(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let before = execute(&graph, &[&input], &[], None).unwrap();
        let after = execute(&optimized, &[&input], &[], None).unwrap();
        assert_eq!(before, after);
    }
}
