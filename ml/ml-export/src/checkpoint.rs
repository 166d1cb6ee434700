//! Variable checkpoints.
//!
//! Variable values are stored next to the model description in one of two
//! formats:
//!
//! - **Binary** (`variables.bin`): magic `MXV1` (4 bytes), version (`u32`
//!   little-endian), flags (`u32` little-endian, reserved), then the
//!   bincode-encoded records.
//! - **JSON** (`variables.json`): the same records, pretty-printed, for
//!   inspection.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::array::Array;
use crate::error::{ExportError, Result};
use crate::variable::{Variable, VariableSpec};

/// File stem of the variable checkpoint inside the variables directory.
pub const VARIABLES_FILE_STEM: &str = "variables";

/// Magic bytes identifying a binary variable checkpoint.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"MXV1";

/// Current checkpoint version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Supported checkpoint file formats.
///
/// # Example
///
/// ```
/// use ml_export::CheckpointFormat;
///
/// assert_eq!(CheckpointFormat::from_extension("bin"), Some(CheckpointFormat::Binary));
/// assert_eq!(CheckpointFormat::Json.extension(), "json");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CheckpointFormat {
    /// Header plus bincode payload. Compact.
    #[default]
    Binary,
    /// Pretty-printed JSON. Human-readable.
    Json,
}

impl CheckpointFormat {
    /// Determines format from file extension.
    ///
    /// - `.bin` -> Binary
    /// - `.json` -> Json
    /// - Other -> None
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "bin" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Determines format from file path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Returns the file extension for this format.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Binary => "bin",
            Self::Json => "json",
        }
    }

    /// Returns the format name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }

    /// Checkpoint file name for this format.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{VARIABLES_FILE_STEM}.{}", self.extension())
    }
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Binary checkpoint header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Magic bytes (must be `MXV1`).
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// Reserved flags.
    pub flags: u32,
}

impl CheckpointHeader {
    /// Header for the current version.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            magic: CHECKPOINT_MAGIC,
            version: CHECKPOINT_VERSION,
            flags: 0,
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        let mut version_bytes = [0u8; 4];
        reader.read_exact(&mut version_bytes)?;

        let mut flags_bytes = [0u8; 4];
        reader.read_exact(&mut flags_bytes)?;

        Ok(Self {
            magic,
            version: u32::from_le_bytes(version_bytes),
            flags: u32::from_le_bytes(flags_bytes),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.magic != CHECKPOINT_MAGIC {
            return Err(ExportError::InvalidCheckpointMagic(self.magic));
        }
        if self.version != CHECKPOINT_VERSION {
            return Err(ExportError::UnsupportedCheckpointVersion(self.version));
        }
        Ok(())
    }
}

impl Default for CheckpointHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// One saved variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    /// Name, shape, dtype and trainable flag.
    pub spec: VariableSpec,
    /// Value at save time.
    pub value: Array,
}

impl VariableRecord {
    /// Snapshots a variable.
    #[must_use]
    pub fn of(variable: &Variable) -> Self {
        Self {
            spec: variable.spec(),
            value: variable.value(),
        }
    }

    /// Recreates the variable.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::ShapeMismatch`] if the value disagrees with
    /// the recorded spec.
    pub fn into_variable(self) -> Result<Variable> {
        if self.value.shape() != self.spec.shape.as_slice() || self.value.dtype() != self.spec.dtype {
            return Err(ExportError::shape_mismatch(
                format!("{}{:?} for variable {}", self.spec.dtype, self.spec.shape, self.spec.name),
                self.value.describe(),
            ));
        }
        Ok(Variable::new(self.spec.name, self.value, self.spec.trainable))
    }
}

#[derive(Serialize, Deserialize)]
struct JsonCheckpoint {
    version: u32,
    variables: Vec<VariableRecord>,
}

/// Writes a binary checkpoint.
///
/// # Errors
///
/// Returns [`ExportError::Serialization`] if writing fails.
pub fn write_variables<W: Write>(records: &[VariableRecord], writer: &mut W) -> Result<()> {
    CheckpointHeader::new()
        .write_to(writer)
        .map_err(|e| ExportError::serialization(e.to_string()))?;
    bincode::serialize_into(writer, records).map_err(|e| ExportError::serialization(e.to_string()))
}

/// Reads a binary checkpoint.
///
/// # Errors
///
/// Returns [`ExportError::InvalidCheckpointMagic`] or
/// [`ExportError::UnsupportedCheckpointVersion`] for a bad header, or
/// [`ExportError::Serialization`] if decoding fails.
pub fn read_variables<R: Read>(reader: &mut R) -> Result<Vec<VariableRecord>> {
    let header = CheckpointHeader::read_from(reader)
        .map_err(|e| ExportError::serialization(format!("reading checkpoint header: {e}")))?;
    header.validate()?;
    bincode::deserialize_from(reader).map_err(|e| ExportError::serialization(e.to_string()))
}

/// Saves `variables` into `dir` and returns the checkpoint path.
///
/// # Errors
///
/// Returns [`ExportError::SaveArtifact`] if the file cannot be written.
pub fn save_variables(variables: &[Variable], dir: &Path, format: CheckpointFormat) -> Result<PathBuf> {
    let path = dir.join(format.file_name());
    let records: Vec<VariableRecord> = variables.iter().map(VariableRecord::of).collect();
    let fail = |e: ExportError| ExportError::save_artifact(path.display().to_string(), e.to_string());

    let file = File::create(&path).map_err(|e| fail(e.into()))?;
    let mut writer = BufWriter::new(file);
    match format {
        CheckpointFormat::Binary => write_variables(&records, &mut writer).map_err(fail)?,
        CheckpointFormat::Json => {
            let checkpoint = JsonCheckpoint {
                version: CHECKPOINT_VERSION,
                variables: records,
            };
            serde_json::to_writer_pretty(&mut writer, &checkpoint).map_err(|e| fail(e.into()))?;
        }
    }
    writer.flush().map_err(|e| fail(e.into()))?;

    debug!(path = %path.display(), format = %format, count = variables.len(), "saved variables");
    Ok(path)
}

/// Loads variables from a checkpoint file, choosing the format from its
/// extension.
///
/// # Errors
///
/// Returns [`ExportError::LoadArtifact`] if the file is missing, has an
/// unknown extension, or cannot be decoded.
pub fn load_variables(path: &Path) -> Result<Vec<Variable>> {
    let fail = |reason: String| ExportError::load_artifact(path.display().to_string(), reason);
    let format = CheckpointFormat::from_path(path)
        .ok_or_else(|| fail("unknown checkpoint extension".to_string()))?;

    let file = File::open(path).map_err(|e| fail(e.to_string()))?;
    let mut reader = BufReader::new(file);
    let records = match format {
        CheckpointFormat::Binary => read_variables(&mut reader).map_err(|e| fail(e.to_string()))?,
        CheckpointFormat::Json => {
            let checkpoint: JsonCheckpoint =
                serde_json::from_reader(reader).map_err(|e| fail(e.to_string()))?;
            if checkpoint.version != CHECKPOINT_VERSION {
                return Err(ExportError::UnsupportedCheckpointVersion(checkpoint.version));
            }
            checkpoint.variables
        }
    };

    let variables = records
        .into_iter()
        .map(VariableRecord::into_variable)
        .collect::<Result<Vec<_>>>()?;
    debug!(path = %path.display(), format = %format, count = variables.len(), "loaded variables");
    Ok(variables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;

    fn sample() -> Vec<Variable> {
        vec![
            Variable::new(
                "dense/kernel",
                Array::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
                true,
            ),
            Variable::new("dense/bias", Array::from_f64(vec![2], vec![0.5, -0.5]).unwrap(), false),
        ]
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(CheckpointFormat::from_extension("BIN"), Some(CheckpointFormat::Binary));
        assert_eq!(CheckpointFormat::from_extension("json"), Some(CheckpointFormat::Json));
        assert_eq!(CheckpointFormat::from_extension("txt"), None);
        assert_eq!(
            CheckpointFormat::from_path(Path::new("a/variables.json")),
            Some(CheckpointFormat::Json)
        );
        assert_eq!(CheckpointFormat::default().to_string(), "binary");
        assert_eq!(CheckpointFormat::Binary.file_name(), "variables.bin");
    }

    #[test]
    fn binary_header_layout() {
        let records: Vec<VariableRecord> = sample().iter().map(VariableRecord::of).collect();
        let mut bytes = Vec::new();
        write_variables(&records, &mut bytes).unwrap();
        assert_eq!(&bytes[..4], b"MXV1");
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), CHECKPOINT_VERSION);

        let decoded = read_variables(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn bad_magic_and_version() {
        let mut bytes = Vec::new();
        write_variables(&[], &mut bytes).unwrap();

        let mut wrong_magic = bytes.clone();
        wrong_magic[..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            read_variables(&mut wrong_magic.as_slice()),
            Err(ExportError::InvalidCheckpointMagic(_))
        ));

        let mut wrong_version = bytes;
        wrong_version[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            read_variables(&mut wrong_version.as_slice()),
            Err(ExportError::UnsupportedCheckpointVersion(7))
        ));
    }

    #[test]
    fn record_rejects_inconsistent_spec() {
        let mut record = VariableRecord::of(&sample()[0]);
        record.spec.shape = vec![4];
        assert!(record.into_variable().is_err());

        let mut record = VariableRecord::of(&sample()[1]);
        record.spec.dtype = DType::F32;
        assert!(record.into_variable().is_err());
    }
}
