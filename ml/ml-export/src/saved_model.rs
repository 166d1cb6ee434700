//! Serialized-model directories.
//!
//! Layout:
//!
//! ```text
//! <dir>/saved_model.json         schema version, functions, signature map,
//!                                variable specs, regularization terms
//! <dir>/variables/variables.bin  variable values (or variables.json)
//! ```
//!
//! A loaded model serves exactly the functions that were traced before
//! saving; it never retraces.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::array::Array;
use crate::checkpoint::{CheckpointFormat, load_variables, save_variables};
use crate::error::{ExportError, Result};
use crate::function::ConcreteFunction;
use crate::graph::Graph;
use crate::signature::{InputSignature, describe_inputs};
use crate::tree::Tree;
use crate::variable::{Variable, VariableSpec};
use crate::wrapper::{RegularizationLoss, ReusableModel, ReusableWrapper};

/// Signature name under which the default entry point is saved.
pub const DEFAULT_SERVING_SIGNATURE_DEF_KEY: &str = "serving_default";

/// Model description file inside a saved-model directory.
pub const SAVED_MODEL_FILE: &str = "saved_model.json";

/// Variables subdirectory inside a saved-model directory.
pub const VARIABLES_DIR: &str = "variables";

/// Version of the saved-model description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl SchemaVersion {
    /// Current schema version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Creates a new schema version.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Compatible means same major version.
    #[must_use]
    pub const fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Options controlling how a model is persisted.
///
/// # Example
///
/// ```
/// use ml_export::{CheckpointFormat, SaveOptions};
///
/// let options = SaveOptions::default()
///     .with_custom_gradients(true)
///     .with_variable_format(CheckpointFormat::Json);
/// assert!(options.custom_gradients);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaveOptions {
    /// Persist gradient graphs alongside forward graphs.
    pub custom_gradients: bool,
    /// Variable checkpoint format.
    pub variable_format: CheckpointFormat,
}

impl SaveOptions {
    /// Sets whether gradient graphs are persisted.
    #[must_use]
    pub const fn with_custom_gradients(mut self, custom_gradients: bool) -> Self {
        self.custom_gradients = custom_gradients;
        self
    }

    /// Sets the variable checkpoint format.
    #[must_use]
    pub const fn with_variable_format(mut self, format: CheckpointFormat) -> Self {
        self.variable_format = format;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionRecord {
    signature: InputSignature,
    graph: Graph,
    gradient: Option<Graph>,
    jit_compile: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct LossRecord {
    name: String,
    graph: Graph,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedModelFile {
    schema_version: SchemaVersion,
    custom_gradients: bool,
    variable_format: CheckpointFormat,
    variables: Vec<VariableSpec>,
    functions: Vec<FunctionRecord>,
    signatures: BTreeMap<String, usize>,
    regularization_losses: Vec<LossRecord>,
}

/// Saves `model` to `dir`.
///
/// Every concrete function cached by the model's graph function is saved,
/// plus any in `signatures` that is not cached. `signatures` names the
/// entry points, usually just [`DEFAULT_SERVING_SIGNATURE_DEF_KEY`].
/// Gradient graphs are kept only if `options.custom_gradients` is set.
///
/// # Errors
///
/// Returns [`ExportError::SaveArtifact`] if a file cannot be written. A
/// failed save may leave a partially written directory.
pub fn save(
    model: &ReusableWrapper,
    dir: &Path,
    signatures: &BTreeMap<String, ConcreteFunction>,
    options: &SaveOptions,
) -> Result<()> {
    let fail = |reason: String| ExportError::save_artifact(dir.display().to_string(), reason);

    let mut functions: Vec<ConcreteFunction> = model.call.concrete_functions().to_vec();
    for function in signatures.values() {
        if !functions.iter().any(|f| f.key() == function.key()) {
            functions.push(function.clone());
        }
    }

    let with_gradients = functions.iter().filter(|f| f.has_gradient()).count();
    if with_gradients > 0 && !options.custom_gradients {
        warn!(
            functions = with_gradients,
            "dropping gradient graphs; custom gradients are disabled in save options"
        );
        functions = functions.iter().map(ConcreteFunction::without_gradient).collect();
    }

    let signature_map = signatures
        .iter()
        .map(|(name, function)| {
            functions
                .iter()
                .position(|f| f.key() == function.key())
                .map(|index| (name.clone(), index))
                .ok_or_else(|| fail(format!("signature '{name}' has no saved function")))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    let variables_dir = dir.join(VARIABLES_DIR);
    fs::create_dir_all(&variables_dir).map_err(|e| fail(e.to_string()))?;
    save_variables(&model.variables, &variables_dir, options.variable_format)?;

    let file = SavedModelFile {
        schema_version: SchemaVersion::CURRENT,
        custom_gradients: options.custom_gradients,
        variable_format: options.variable_format,
        variables: model.variables.iter().map(Variable::spec).collect(),
        functions: functions
            .iter()
            .map(|f| FunctionRecord {
                signature: f.signature().clone(),
                graph: f.graph().clone(),
                gradient: f.gradient_graph().cloned(),
                jit_compile: f.jit_compile(),
            })
            .collect(),
        signatures: signature_map,
        regularization_losses: model
            .regularization_losses
            .iter()
            .map(|loss| LossRecord {
                name: loss.name.clone(),
                graph: loss.graph.as_ref().clone(),
            })
            .collect(),
    };

    let path = dir.join(SAVED_MODEL_FILE);
    let writer = File::create(&path).map_err(|e| fail(e.to_string()))?;
    let mut writer = BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, &file).map_err(|e| fail(e.to_string()))?;
    writer.flush().map_err(|e| fail(e.to_string()))?;

    info!(
        path = %dir.display(),
        functions = file.functions.len(),
        signatures = file.signatures.len(),
        variables = file.variables.len(),
        custom_gradients = options.custom_gradients,
        "saved model"
    );
    Ok(())
}

/// A model restored from a saved-model directory.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    schema_version: SchemaVersion,
    variables: Vec<Variable>,
    trainable_variables: Vec<Variable>,
    regularization_losses: Vec<RegularizationLoss>,
    functions: Vec<ConcreteFunction>,
    signatures: BTreeMap<String, usize>,
}

impl LoadedModel {
    /// Schema version the model was saved with.
    #[must_use]
    pub const fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    /// Names of the saved signatures.
    #[must_use]
    pub fn signature_keys(&self) -> Vec<&str> {
        self.signatures.keys().map(String::as_str).collect()
    }

    /// The function saved under signature `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::SignatureNotFound`] for an unknown name.
    pub fn signature(&self, name: &str) -> Result<&ConcreteFunction> {
        self.signatures
            .get(name)
            .and_then(|&i| self.functions.get(i))
            .ok_or_else(|| ExportError::signature_not_found(name))
    }

    /// Every saved concrete function.
    #[must_use]
    pub fn concrete_functions(&self) -> &[ConcreteFunction] {
        &self.functions
    }

    /// Looks up a variable by name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name() == name)
    }

    /// Returns `true` if any saved function carries a gradient graph.
    #[must_use]
    pub fn has_gradients(&self) -> bool {
        self.functions.iter().any(ConcreteFunction::has_gradient)
    }

    fn dispatch(&self, inputs: &Tree<Array>) -> Result<&ConcreteFunction> {
        let default = self
            .signature(DEFAULT_SERVING_SIGNATURE_DEF_KEY)
            .ok()
            .filter(|f| f.accepts(inputs));
        default
            .or_else(|| self.functions.iter().find(|f| f.accepts(inputs)))
            .ok_or_else(|| ExportError::no_matching_signature(describe_inputs(inputs)))
    }

    /// Runs the gradient graph of the saved function matching `inputs`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::NoMatchingSignature`] if no function accepts
    /// `inputs`, or [`ExportError::InvalidArgument`] if that function was
    /// saved without gradients.
    pub fn gradient(&self, inputs: &Tree<Array>, cotangents: &Tree<Array>) -> Result<Tree<Array>> {
        self.dispatch(inputs)?.gradient(inputs, cotangents)
    }
}

impl ReusableModel for LoadedModel {
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
        self.dispatch(inputs)?.call(inputs)
    }
}

/// Loads a model saved with [`save`].
///
/// # Errors
///
/// Returns [`ExportError::LoadArtifact`] if the directory is missing,
/// malformed, written by an incompatible schema, or its variables disagree
/// with the model description.
pub fn load(dir: &Path) -> Result<LoadedModel> {
    let fail = |reason: String| ExportError::load_artifact(dir.display().to_string(), reason);

    let reader = File::open(dir.join(SAVED_MODEL_FILE)).map_err(|e| fail(e.to_string()))?;
    let file: SavedModelFile =
        serde_json::from_reader(BufReader::new(reader)).map_err(|e| fail(e.to_string()))?;
    if !file.schema_version.is_compatible(&SchemaVersion::CURRENT) {
        return Err(fail(format!(
            "schema {} is not compatible with {}",
            file.schema_version,
            SchemaVersion::CURRENT
        )));
    }

    let checkpoint = dir.join(VARIABLES_DIR).join(file.variable_format.file_name());
    let variables = load_variables(&checkpoint)?;
    let specs: Vec<VariableSpec> = variables.iter().map(Variable::spec).collect();
    if specs != file.variables {
        return Err(fail("variable checkpoint does not match the model description".into()));
    }

    let shared: Arc<[Variable]> = variables.iter().cloned().collect();
    let functions = file
        .functions
        .into_iter()
        .map(|record| {
            record.graph.validate(shared.len())?;
            if let Some(gradient) = &record.gradient {
                gradient.validate(shared.len())?;
            }
            Ok(ConcreteFunction::new(
                record.signature,
                record.graph,
                record.gradient,
                Arc::clone(&shared),
                record.jit_compile,
            ))
        })
        .collect::<Result<Vec<_>>>()
        .map_err(|e| fail(e.to_string()))?;

    if let Some((name, _)) = file.signatures.iter().find(|&(_, &i)| i >= functions.len()) {
        return Err(fail(format!("signature '{name}' refers to a missing function")));
    }

    let regularization_losses = file
        .regularization_losses
        .into_iter()
        .map(|record| {
            record.graph.validate(shared.len())?;
            Ok(RegularizationLoss {
                name: record.name,
                graph: Arc::new(record.graph),
            })
        })
        .collect::<Result<Vec<_>>>()
        .map_err(|e| fail(e.to_string()))?;

    let trainable_variables = variables.iter().filter(|v| v.trainable()).cloned().collect();
    debug!(
        functions = functions.len(),
        losses = regularization_losses.len(),
        "restored functions"
    );
    info!(
        path = %dir.display(),
        schema = %file.schema_version,
        signatures = file.signatures.len(),
        "loaded model"
    );

    Ok(LoadedModel {
        schema_version: file.schema_version,
        variables,
        trainable_variables,
        regularization_losses,
        functions,
        signatures: file.signatures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_version_compatibility() {
        assert!(SchemaVersion::new(1, 3).is_compatible(&SchemaVersion::CURRENT));
        assert!(!SchemaVersion::new(2, 0).is_compatible(&SchemaVersion::CURRENT));
        assert_eq!(SchemaVersion::CURRENT.to_string(), "1.0");
    }

    #[test]
    fn save_options_builders() {
        let options = SaveOptions::default();
        assert!(!options.custom_gradients);
        assert_eq!(options.variable_format, CheckpointFormat::Binary);

        let options = options
            .with_custom_gradients(true)
            .with_variable_format(CheckpointFormat::Json);
        let json = serde_json::to_string(&options).unwrap();
        let parsed: SaveOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn load_missing_directory_fails() {
        let err = load(Path::new("/nonexistent/model")).unwrap_err();
        assert!(matches!(err, ExportError::LoadArtifact { .. }));
    }
}
