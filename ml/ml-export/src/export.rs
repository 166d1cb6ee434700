//! Converting a model and saving it as a serialized-model directory.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::array::Array;
use crate::convert::{ConvertOptions, ModelFn, convert};
use crate::error::{ExportError, Result};
use crate::function::{FunctionConfig, GraphFunction};
use crate::poly::{ArgShapes, PolyShape};
use crate::saved_model::{DEFAULT_SERVING_SIGNATURE_DEF_KEY, SaveOptions, save};
use crate::signature::{InputSignature, signature_key};
use crate::tree::Tree;
use crate::variable::variables_from_params;
use crate::wrapper::ReusableWrapper;

/// Configuration for [`convert_and_save_model`].
///
/// # Example
///
/// ```
/// use ml_export::{ExportConfig, TensorSpec, Tree};
///
/// let config = ExportConfig::new(vec![Tree::leaf(TensorSpec::f32([None, Some(4)]))])
///     .with_gradient(true);
/// assert!(config.enable_optimizer);
/// assert!(config.compile_model);
/// assert!(config.is_valid());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Input signatures. The first is the default serving signature.
    pub input_signatures: Vec<InputSignature>,

    /// Shape polymorphism for the inputs. Requires exactly one signature.
    pub polymorphic_shapes: Option<PolyShape>,

    /// Mark variables trainable and build gradient graphs.
    pub with_gradient: bool,

    /// Run the graph optimizer on traced functions.
    pub enable_optimizer: bool,

    /// Precompute execution plans for saved functions.
    pub compile_model: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            input_signatures: Vec::new(),
            polymorphic_shapes: None,
            with_gradient: false,
            enable_optimizer: true,
            compile_model: true,
        }
    }
}

impl ExportConfig {
    /// Creates a config for the given signatures.
    #[must_use]
    pub fn new(input_signatures: Vec<InputSignature>) -> Self {
        Self {
            input_signatures,
            ..Self::default()
        }
    }

    /// Appends a signature.
    #[must_use]
    pub fn with_signature(mut self, signature: InputSignature) -> Self {
        self.input_signatures.push(signature);
        self
    }

    /// Sets the input polymorphism descriptor.
    #[must_use]
    pub fn with_polymorphic_shapes(mut self, shapes: PolyShape) -> Self {
        self.polymorphic_shapes = Some(shapes);
        self
    }

    /// Sets gradient exposure.
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

    /// Sets the jit flag.
    #[must_use]
    pub const fn with_compile_model(mut self, compile_model: bool) -> Self {
        self.compile_model = compile_model;
        self
    }

    /// Checks signature count against the polymorphism descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidArgument`] if there are no signatures,
    /// or a polymorphism descriptor is combined with more than one.
    pub fn validate(&self) -> Result<()> {
        if self.input_signatures.is_empty() {
            return Err(ExportError::invalid_argument(
                "input_signatures must be a non-empty list",
            ));
        }
        if self.polymorphic_shapes.is_some() && self.input_signatures.len() > 1 {
            return Err(ExportError::invalid_argument(format!(
                "polymorphic_shapes requires exactly one input signature, got {}",
                self.input_signatures.len()
            )));
        }
        Ok(())
    }

    /// Returns `true` if [`ExportConfig::validate`] passes.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Summary of a completed export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOutcome {
    /// Options the model was saved with.
    pub save_options: SaveOptions,
    /// Names in the saved signature map.
    pub signature_keys: Vec<String>,
    /// Number of concrete functions saved.
    pub traced_signatures: usize,
    /// Number of variables.
    pub variable_count: usize,
    /// Number of trainable variables.
    pub trainable_count: usize,
}

/// Converts `model_fn` with `params` and saves it to `model_dir`.
///
/// The default serving signature is traced from the first input signature;
/// every other signature is traced too so the saved model serves it
/// without retracing. With `with_gradient`, the effective save options have
/// `custom_gradients` set; they are returned in the outcome and the
/// caller's value is left untouched.
///
/// # Errors
///
/// Returns [`ExportError::InvalidArgument`] for an invalid config before
/// any conversion or I/O. Tracing, execution and I/O errors propagate
/// unchanged.
pub fn convert_and_save_model(
    model_fn: impl ModelFn + 'static,
    params: &Tree<Array>,
    model_dir: impl AsRef<Path>,
    config: &ExportConfig,
    save_options: Option<SaveOptions>,
) -> Result<ExportOutcome> {
    config.validate()?;
    let model_dir = model_dir.as_ref();

    let options = ConvertOptions {
        with_gradient: config.with_gradient,
        enable_optimizer: config.enable_optimizer,
        polymorphic_shapes: ArgShapes::for_inputs(config.polymorphic_shapes.clone()),
    };
    let converted = convert(model_fn, options);

    let param_vars = variables_from_params(params, config.with_gradient);
    let function_config = FunctionConfig::default().with_jit_compile(config.compile_model);
    let mut graph_function = GraphFunction::new(converted, param_vars.clone(), function_config);

    let Some((default_signature, other_signatures)) = config.input_signatures.split_first() else {
        return Err(ExportError::invalid_argument("input_signatures must be non-empty"));
    };
    let default = graph_function.get_concrete_function(default_signature)?;
    debug!(signature = %default.key(), "traced default signature");
    for signature in other_signatures {
        graph_function.get_concrete_function(signature)?;
        debug!(signature = %signature_key(signature), "traced additional signature");
    }

    let wrapper = ReusableWrapper::new(graph_function, &param_vars);

    let save_options = if config.with_gradient {
        save_options.unwrap_or_default().with_custom_gradients(true)
    } else {
        save_options.unwrap_or_default()
    };

    let signatures = BTreeMap::from([(DEFAULT_SERVING_SIGNATURE_DEF_KEY.to_string(), default)]);
    save(&wrapper, model_dir, &signatures, &save_options)?;

    let outcome = ExportOutcome {
        save_options,
        signature_keys: signatures.into_keys().collect(),
        traced_signatures: wrapper.call.concrete_functions().len(),
        variable_count: wrapper.variables.len(),
        trainable_count: wrapper.trainable_variables.len(),
    };
    info!(
        path = %model_dir.display(),
        traced = outcome.traced_signatures,
        variables = outcome.variable_count,
        trainable = outcome.trainable_count,
        with_gradient = config.with_gradient,
        "converted and saved model"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{GraphBuilder, Traced};
    use crate::signature::TensorSpec;

    fn sig(batch: Option<usize>) -> InputSignature {
        Tree::leaf(TensorSpec::f32([batch, Some(4)]))
    }

    #[test]
    fn default_config() {
        let config = ExportConfig::default();
        assert!(config.input_signatures.is_empty());
        assert!(config.enable_optimizer);
        assert!(config.compile_model);
        assert!(!config.with_gradient);
        assert!(!config.is_valid());
    }

    #[test]
    fn validation_rules() {
        assert!(ExportConfig::new(vec![sig(None)]).validate().is_ok());

        let err = ExportConfig::new(Vec::new()).validate().unwrap_err();
        assert!(err.is_invalid_argument());

        let poly = PolyShape::parse("(b, 4)").unwrap();
        let single = ExportConfig::new(vec![sig(None)]).with_polymorphic_shapes(poly);
        assert!(single.validate().is_ok());

        let multi = single.with_signature(sig(Some(2)));
        assert!(multi.validate().unwrap_err().is_invalid_argument());

        let no_poly = ExportConfig::new(vec![sig(None), sig(Some(2))]);
        assert!(no_poly.is_valid());
    }

    #[test]
    fn config_serialization() {
        let config = ExportConfig::new(vec![sig(None)])
            .with_polymorphic_shapes(PolyShape::parse("(b, _)").unwrap())
            .with_gradient(true)
            .with_compile_model(false);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ExportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn invalid_config_touches_nothing() {
        let dir = std::env::temp_dir().join("ml-export-never-created");
        let model = |_g: &mut GraphBuilder, _p: &Tree<Traced>, x: &Tree<Traced>| -> Result<Tree<Traced>> {
            Ok(x.clone())
        };
        let err = convert_and_save_model(
            model,
            &Tree::seq([]),
            &dir,
            &ExportConfig::default(),
            None,
        )
        .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(!dir.exists());
    }
}
