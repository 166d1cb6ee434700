//! Graph execution on the Burn `NdArray` backend.
//!
//! Every value is held as a rank-4 Burn tensor with leading size-one axes,
//! alongside its logical shape. Broadcasting is made explicit with
//! `expand` before each binary operation.

use std::collections::BTreeMap;

use burn::tensor::activation::{relu, sigmoid, softmax};
use burn::tensor::{Shape, Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};

use crate::array::{Array, DType, MAX_RANK, element_count};
use crate::error::{ExportError, Result};
use crate::graph::{Dim, Graph, NodeId, Op};
use crate::tree::Tree;
use crate::variable::Variable;

type Backend = NdArray<f32>;

/// Precomputed buffer release points for a graph.
///
/// After node `i` runs, every node in `release[i]` has no remaining
/// readers and its buffer is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    release: Vec<Vec<NodeId>>,
}

impl ExecutionPlan {
    /// Builds the plan for `graph`.
    #[must_use]
    pub fn new(graph: &Graph) -> Self {
        let end = graph.nodes.len();
        let mut release = vec![Vec::new(); end];
        for (node, last) in graph.last_uses().into_iter().enumerate() {
            if last < end {
                release[last].push(node);
            }
        }
        Self { release }
    }

    /// Number of buffers released before the end of the program.
    #[must_use]
    pub fn released_count(&self) -> usize {
        self.release.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
struct Value {
    tensor: Tensor<Backend, 4>,
    shape: Vec<usize>,
}

fn pad(shape: &[usize]) -> [usize; MAX_RANK] {
    let mut padded = [1; MAX_RANK];
    padded[MAX_RANK - shape.len()..].copy_from_slice(shape);
    padded
}

fn broadcast(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|i| {
            let da = (i + a.len()).checked_sub(rank).map_or(1, |j| a[j]);
            let db = (i + b.len()).checked_sub(rank).map_or(1, |j| b[j]);
            match (da, db) {
                (x, y) if x == y => Ok(x),
                (1, y) => Ok(y),
                (x, 1) => Ok(x),
                _ => Err(ExportError::shape_mismatch(format!("{a:?}"), format!("{b:?}"))),
            }
        })
        .collect()
}

impl Value {
    fn from_array(array: &Array, device: &NdArrayDevice) -> Self {
        let shape = array.shape().to_vec();
        let data = TensorData::new(array.to_f32_vec(), pad(&shape).to_vec());
        Self {
            tensor: Tensor::from_data(data, device),
            shape,
        }
    }

    fn new(tensor: Tensor<Backend, 4>, shape: Vec<usize>) -> Self {
        Self { tensor, shape }
    }

    fn reshaped(self, shape: Vec<usize>) -> Self {
        let tensor = self.tensor.reshape(Shape::new(pad(&shape)));
        Self::new(tensor, shape)
    }

    fn expanded(&self, shape: &[usize]) -> Tensor<Backend, 4> {
        self.tensor.clone().expand(Shape::new(pad(shape)))
    }

    fn is_empty(&self) -> bool {
        self.shape.contains(&0)
    }

    fn padded_axis(&self, axis: usize) -> Result<usize> {
        if axis >= self.shape.len() {
            return Err(ExportError::execution(format!(
                "axis {axis} out of range for shape {:?}",
                self.shape
            )));
        }
        Ok(axis + MAX_RANK - self.shape.len())
    }

    fn to_array(&self, dtype: DType) -> Result<Array> {
        let values = self
            .tensor
            .clone()
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ExportError::execution(format!("reading tensor: {e:?}")))?;
        Array::from_f32_as(self.shape.clone(), values, dtype)
    }
}

fn binary(
    a: &Value,
    b: &Value,
    f: impl FnOnce(Tensor<Backend, 4>, Tensor<Backend, 4>) -> Tensor<Backend, 4>,
) -> Result<Value> {
    let shape = broadcast(&a.shape, &b.shape)?;
    let tensor = f(a.expanded(&shape), b.expanded(&shape));
    Ok(Value::new(tensor, shape))
}

fn unary(a: &Value, f: impl FnOnce(Tensor<Backend, 4>) -> Tensor<Backend, 4>) -> Value {
    Value::new(f(a.tensor.clone()), a.shape.clone())
}

fn matmul(a: &Value, b: &Value) -> Result<Value> {
    let (sa, sb) = (&a.shape, &b.shape);
    if sa.len() < 2 || sb.len() < 2 || sa[sa.len() - 1] != sb[sb.len() - 2] {
        return Err(ExportError::shape_mismatch(
            format!("matmul-compatible operands, got {sa:?}"),
            format!("{sb:?}"),
        ));
    }
    let (m, k, n) = (sa[sa.len() - 2], sa[sa.len() - 1], sb[sb.len() - 1]);
    let batch = broadcast(&sa[..sa.len() - 2], &sb[..sb.len() - 2])?;

    let mut lhs = batch.clone();
    lhs.extend([m, k]);
    let mut rhs = batch.clone();
    rhs.extend([k, n]);
    let mut out = batch;
    out.extend([m, n]);

    let tensor = a.expanded(&lhs).matmul(b.expanded(&rhs));
    Ok(Value::new(tensor, out))
}

fn sum_like(a: &Value, target: &[usize]) -> Result<Value> {
    let (pa, pt) = (pad(&a.shape), pad(target));
    let mut tensor = a.tensor.clone();
    for i in 0..MAX_RANK {
        if pt[i] == pa[i] {
            continue;
        }
        if pt[i] != 1 {
            return Err(ExportError::shape_mismatch(
                format!("{target:?}"),
                format!("{:?}", a.shape),
            ));
        }
        tensor = tensor.sum_dim(i);
    }
    Ok(Value::new(tensor, target.to_vec()))
}

/// Result of `op` when an operand or the result holds no elements.
///
/// The NdArray kernels are not called on empty tensors. Such results are
/// zeros, except a mean over an empty axis, which is NaN.
fn eval_empty(
    op: &Op,
    operands: &[&Value],
    out: &[usize],
    device: &NdArrayDevice,
) -> Result<Option<Value>> {
    if op.is_source() || matches!(op, Op::DimSize { .. }) {
        return Ok(None);
    }
    let out_len = element_count(out)?;
    if out_len > 0 && !operands.iter().any(|v| v.is_empty()) {
        return Ok(None);
    }
    if out.len() > MAX_RANK {
        return Err(ExportError::execution(format!(
            "result shape {out:?} exceeds rank {MAX_RANK}"
        )));
    }
    let shape = Shape::new(pad(out));
    let tensor = if out_len > 0 && matches!(op, Op::Mean { .. }) {
        Tensor::full(shape, f32::NAN, device)
    } else {
        Tensor::zeros(shape, device)
    };
    Ok(Some(Value::new(tensor, out.to_vec())))
}

fn eval(op: &Op, operands: &[&Value], out: &[usize], device: &NdArrayDevice) -> Result<Value> {
    if let Some(value) = eval_empty(op, operands, out, device)? {
        return Ok(value);
    }
    let arg = |i: usize| -> Result<&Value> {
        operands
            .get(i)
            .copied()
            .ok_or_else(|| ExportError::execution(format!("missing operand {i}")))
    };
    let value = match op {
        Op::Input(_) | Op::Variable(_) => {
            return Err(ExportError::execution("sources are bound by the caller"));
        }
        Op::Constant(array) => Value::from_array(array, device),
        Op::MatMul(..) => matmul(arg(0)?, arg(1)?)?,
        Op::Add(..) => binary(arg(0)?, arg(1)?, Tensor::add)?,
        Op::Sub(..) => binary(arg(0)?, arg(1)?, Tensor::sub)?,
        Op::Mul(..) => binary(arg(0)?, arg(1)?, Tensor::mul)?,
        Op::Div(..) => binary(arg(0)?, arg(1)?, Tensor::div)?,
        Op::Neg(_) => unary(arg(0)?, Tensor::neg),
        Op::Exp(_) => unary(arg(0)?, Tensor::exp),
        Op::Log(_) => unary(arg(0)?, Tensor::log),
        Op::Tanh(_) => unary(arg(0)?, Tensor::tanh),
        Op::Sigmoid(_) => unary(arg(0)?, sigmoid),
        Op::Relu(_) => unary(arg(0)?, relu),
        Op::Step(_) => unary(arg(0)?, |t| t.greater_elem(0.0).float()),
        Op::Scale(_, k) => unary(arg(0)?, |t| t.mul_scalar(*k)),
        Op::Softmax { axis, .. } => {
            let a = arg(0)?;
            let dim = a.padded_axis(*axis)?;
            unary(a, |t| softmax(t, dim))
        }
        Op::Sum { axis, .. } | Op::Mean { axis, .. } => {
            let a = arg(0)?;
            let dim = a.padded_axis(*axis)?;
            let reduced = if matches!(op, Op::Sum { .. }) {
                a.tensor.clone().sum_dim(dim)
            } else {
                a.tensor.clone().mean_dim(dim)
            };
            let mut shape = a.shape.clone();
            shape.remove(*axis);
            Value::new(reduced, a.shape.clone()).reshaped(shape)
        }
        Op::Unsqueeze { axis, .. } => {
            let a = arg(0)?;
            if *axis > a.shape.len() || a.shape.len() >= MAX_RANK {
                return Err(ExportError::execution(format!(
                    "cannot insert axis {axis} into {:?}",
                    a.shape
                )));
            }
            let mut shape = a.shape.clone();
            shape.insert(*axis, 1);
            a.clone().reshaped(shape)
        }
        Op::Transpose(_) => {
            let a = arg(0)?;
            let rank = a.shape.len();
            if rank < 2 {
                return Err(ExportError::execution("transpose needs rank >= 2"));
            }
            let mut shape = a.shape.clone();
            shape.swap(rank - 2, rank - 1);
            Value::new(a.tensor.clone().swap_dims(2, 3), shape)
        }
        Op::SumLike { .. } => sum_like(arg(0)?, &arg(1)?.shape)?,
        Op::BroadcastLike { .. } => {
            let (a, like) = (arg(0)?, arg(1)?);
            if broadcast(&a.shape, &like.shape)? != like.shape {
                return Err(ExportError::shape_mismatch(
                    format!("{:?}", like.shape),
                    format!("{:?}", a.shape),
                ));
            }
            Value::new(a.expanded(&like.shape), like.shape.clone())
        }
        Op::ZerosLike(_) => {
            let a = arg(0)?;
            Value::new(
                Tensor::zeros(Shape::new(pad(&a.shape)), device),
                a.shape.clone(),
            )
        }
        Op::DimSize { axis, .. } => {
            let a = arg(0)?;
            let size = a.shape.get(*axis).copied().ok_or_else(|| {
                ExportError::execution(format!("axis {axis} out of range for {:?}", a.shape))
            })?;
            #[allow(clippy::cast_precision_loss)]
            let scalar = Array::scalar(size as f32);
            Value::from_array(&scalar, device)
        }
    };
    Ok(value)
}

fn concrete_shape(shape: &[Dim], bindings: &BTreeMap<String, usize>) -> Result<Vec<usize>> {
    shape
        .iter()
        .map(|dim| match dim {
            Dim::Fixed(n) => Ok(*n),
            Dim::Sym(name) => bindings.get(name).copied().ok_or_else(|| {
                ExportError::execution(format!("symbol {name} is not bound by any input"))
            }),
        })
        .collect()
}

/// Checks inputs against the traced input slots and binds symbolic dims.
///
/// # Errors
///
/// Returns [`ExportError::ShapeMismatch`] for a rank, dtype or fixed-dim
/// disagreement, or when one symbol would bind two different sizes.
pub fn bind_inputs(graph: &Graph, inputs: &[&Array]) -> Result<BTreeMap<String, usize>> {
    if inputs.len() != graph.inputs.len() {
        return Err(ExportError::structure_mismatch(format!(
            "graph takes {} inputs, got {}",
            graph.inputs.len(),
            inputs.len()
        )));
    }
    let mut bindings = BTreeMap::new();
    for (slot, array) in graph.inputs.iter().zip(inputs) {
        let traced = crate::graph::shape_to_string(&slot.shape);
        if slot.dtype != array.dtype() || slot.shape.len() != array.rank() {
            return Err(ExportError::shape_mismatch(
                format!("{}{traced}", slot.dtype),
                array.describe(),
            ));
        }
        for (dim, &actual) in slot.shape.iter().zip(array.shape()) {
            match dim {
                Dim::Fixed(n) if *n != actual => {
                    return Err(ExportError::shape_mismatch(traced, array.describe()));
                }
                Dim::Fixed(_) => {}
                Dim::Sym(name) => {
                    let bound = *bindings.entry(name.clone()).or_insert(actual);
                    if bound != actual {
                        return Err(ExportError::shape_mismatch(
                            format!("{name} = {bound} in {traced}"),
                            array.describe(),
                        ));
                    }
                }
            }
        }
    }
    Ok(bindings)
}

/// Evaluates one operation on constant operands, producing `shape`.
///
/// # Errors
///
/// Returns an execution or shape error from the operation.
pub fn eval_constant(op: &Op, shape: &[usize], dtype: DType, operands: &[&Array]) -> Result<Array> {
    let device = NdArrayDevice::default();
    let values: Vec<Value> = operands
        .iter()
        .map(|a| Value::from_array(a, &device))
        .collect();
    let refs: Vec<&Value> = values.iter().collect();
    eval(op, &refs, shape, &device)?.to_array(dtype)
}

/// Runs `graph` on flattened `inputs`, reading parameters from `variables`.
///
/// With a plan, intermediate buffers are dropped after their last reader.
///
/// # Errors
///
/// Returns an error if inputs do not bind, a variable is missing or has a
/// different shape than traced, or an operation fails.
pub fn execute(
    graph: &Graph,
    inputs: &[&Array],
    variables: &[Variable],
    plan: Option<&ExecutionPlan>,
) -> Result<Tree<Array>> {
    let bindings = bind_inputs(graph, inputs)?;
    let device = NdArrayDevice::default();
    let mut values: Vec<Option<Value>> = (0..graph.nodes.len()).map(|_| None).collect();

    for (id, node) in graph.nodes.iter().enumerate() {
        let value = match &node.op {
            Op::Input(i) => Value::from_array(inputs[*i], &device),
            Op::Variable(v) => {
                let variable = variables.get(*v).ok_or_else(|| {
                    ExportError::execution(format!(
                        "graph reads variable {v}, only {} available",
                        variables.len()
                    ))
                })?;
                let array = variable.read();
                let traced: Vec<Option<usize>> = node.shape.iter().map(Dim::fixed).collect();
                let actual: Vec<Option<usize>> = array.shape().iter().copied().map(Some).collect();
                if traced != actual {
                    return Err(ExportError::shape_mismatch(
                        format!("variable {} with shape {traced:?}", variable.name()),
                        array.describe(),
                    ));
                }
                Value::from_array(&array, &device)
            }
            op => {
                let operands = op
                    .operands()
                    .into_iter()
                    .map(|o| {
                        values[o].as_ref().ok_or_else(|| {
                            ExportError::execution(format!("node {id} reads released node {o}"))
                        })
                    })
                    .collect::<Result<Vec<&Value>>>()?;
                let out = concrete_shape(&node.shape, &bindings)?;
                eval(op, &operands, &out, &device)?
            }
        };
        values[id] = Some(value);

        if let Some(plan) = plan {
            for &dead in plan.release.get(id).map_or(&[][..], Vec::as_slice) {
                values[dead] = None;
            }
        }
    }

    graph.outputs.try_map_leaves(|&out| {
        values
            .get(out)
            .and_then(Option::as_ref)
            .ok_or_else(|| ExportError::execution(format!("output node {out} was not computed")))?
            .to_array(graph.nodes[out].dtype)
    })
}
