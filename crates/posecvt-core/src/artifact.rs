//! Model artifacts and their representations.
//!
//! A [`ModelArtifact`] is an immutable handle on model data in one
//! representation. Converting to another representation always yields a new
//! artifact; nothing in the crate mutates an artifact after construction.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::PathsConfig;
use crate::error::IoResultExt;
use crate::{ConvertError, Result};

/// Serialized form a model is held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Framework-native trained checkpoint (`.pt`).
    Native,
    /// Portable computation graph (`.onnx`).
    IntermediateGraph,
    /// Runnable bundle in the second framework (SavedModel directory).
    GraphBundle,
    /// Compact on-device format (`.tflite`).
    Mobile,
}

impl Representation {
    pub const ALL: [Representation; 4] = [
        Representation::Native,
        Representation::IntermediateGraph,
        Representation::GraphBundle,
        Representation::Mobile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Representation::Native => "native",
            Representation::IntermediateGraph => "intermediate_graph",
            Representation::GraphBundle => "graph_bundle",
            Representation::Mobile => "mobile",
        }
    }

    /// Whether artifacts of this representation are directories.
    pub fn is_directory(&self) -> bool {
        matches!(self, Representation::GraphBundle)
    }

    /// File (or directory) name used for `name` in a store.
    pub fn file_name(&self, name: &str) -> String {
        match self {
            Representation::Native => format!("{name}.{}", PathsConfig::NATIVE_EXTENSION),
            Representation::IntermediateGraph => {
                format!("{name}.{}", PathsConfig::INTERMEDIATE_EXTENSION)
            }
            Representation::GraphBundle => format!("{name}{}", PathsConfig::BUNDLE_DIR_SUFFIX),
            Representation::Mobile => format!("{name}.{}", PathsConfig::MOBILE_EXTENSION),
        }
    }

    /// Position in the conversion chain, native first.
    fn rank(&self) -> u8 {
        match self {
            Representation::Native => 0,
            Representation::IntermediateGraph => 1,
            Representation::GraphBundle => 2,
            Representation::Mobile => 3,
        }
    }

    /// True when `self` comes strictly before `other` in the conversion chain.
    pub fn is_upstream_of(&self, other: Representation) -> bool {
        self.rank() < other.rank()
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Representation {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "native" | "pt" => Ok(Representation::Native),
            "intermediate_graph" | "onnx" => Ok(Representation::IntermediateGraph),
            "graph_bundle" | "saved_model" => Ok(Representation::GraphBundle),
            "mobile" | "tflite" => Ok(Representation::Mobile),
            other => Err(ConvertError::Validation {
                field: "representation".into(),
                message: format!("unknown representation '{other}'"),
            }),
        }
    }
}

/// Where an artifact's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Path(PathBuf),
    Memory(Bytes),
}

/// A typed, immutable unit of model data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    representation: Representation,
    location: ArtifactLocation,
    size_bytes: u64,
}

impl ModelArtifact {
    /// Wrap a file or directory already on disk.
    pub fn from_path(representation: Representation, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(ConvertError::ArtifactNotFound {
                name: path.display().to_string(),
                representation: representation.to_string(),
            });
        }
        let size_bytes = path_size(&path)?;
        Ok(Self {
            representation,
            location: ArtifactLocation::Path(path),
            size_bytes,
        })
    }

    /// Wrap an in-memory buffer. Directory representations cannot live in memory.
    pub fn from_bytes(representation: Representation, data: impl Into<Bytes>) -> Result<Self> {
        if representation.is_directory() {
            return Err(ConvertError::Validation {
                field: "representation".into(),
                message: format!("{representation} artifacts must be directories on disk"),
            });
        }
        let data = data.into();
        Ok(Self {
            representation,
            size_bytes: data.len() as u64,
            location: ArtifactLocation::Memory(data),
        })
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn location(&self) -> &ArtifactLocation {
        &self.location
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            ArtifactLocation::Path(p) => Some(p),
            ArtifactLocation::Memory(_) => None,
        }
    }

    /// Full contents of a file artifact.
    pub fn read_bytes(&self) -> Result<Bytes> {
        match &self.location {
            ArtifactLocation::Memory(data) => Ok(data.clone()),
            ArtifactLocation::Path(path) if path.is_dir() => Err(ConvertError::Validation {
                field: "location".into(),
                message: format!("{} is a directory", path.display()),
            }),
            ArtifactLocation::Path(path) => Ok(Bytes::from(std::fs::read(path).with_path(path)?)),
        }
    }

    /// Structural check of the artifact against its representation.
    ///
    /// Only headers and layout are inspected; the weights themselves are not.
    pub fn validate(&self) -> Result<()> {
        if self.size_bytes == 0 {
            return Err(self.malformed("artifact is empty"));
        }

        if self.representation.is_directory() {
            let Some(dir) = self.path().filter(|p| p.is_dir()) else {
                return Err(self.malformed("expected a directory"));
            };
            if !dir.join(PathsConfig::BUNDLE_GRAPH_FILE).is_file() {
                return Err(self.malformed(&format!(
                    "missing {} in {}",
                    PathsConfig::BUNDLE_GRAPH_FILE,
                    dir.display()
                )));
            }
            return Ok(());
        }

        let header = self.header()?;
        let ok = match self.representation {
            Representation::Native => is_torch_checkpoint(&header),
            Representation::IntermediateGraph => is_onnx_model(&header),
            Representation::Mobile => is_tflite_model(&header),
            Representation::GraphBundle => unreachable!("directory handled above"),
        };
        if ok {
            Ok(())
        } else {
            Err(self.malformed("unrecognized file header"))
        }
    }

    fn header(&self) -> Result<Vec<u8>> {
        match &self.location {
            ArtifactLocation::Memory(data) => Ok(data.iter().take(16).copied().collect()),
            ArtifactLocation::Path(path) => {
                let mut file = std::fs::File::open(path).with_path(path)?;
                let mut header = vec![0u8; 16];
                let n = file.read(&mut header).with_path(path)?;
                header.truncate(n);
                Ok(header)
            }
        }
    }

    fn malformed(&self, reason: &str) -> ConvertError {
        let at = match &self.location {
            ArtifactLocation::Path(p) => p.display().to_string(),
            ArtifactLocation::Memory(_) => "<memory>".to_string(),
        };
        ConvertError::MalformedInputArtifact {
            message: format!("{} artifact at {at}: {reason}", self.representation),
        }
    }
}

/// Header markers for the supported file representations.
mod magic {
    /// PyTorch zip checkpoints.
    pub const ZIP: &[u8; 4] = &[0x50, 0x4B, 0x03, 0x04];
    /// Legacy pickle checkpoints.
    pub const PICKLE: u8 = 0x80;
    pub const PICKLE_PROTO_MIN: u8 = 2;
    pub const PICKLE_PROTO_MAX: u8 = 5;
    /// TFLite flatbuffer file identifier at offset 4.
    pub const TFLITE: &[u8; 4] = b"TFL3";
    /// ModelProto field 1 (`ir_version`, varint).
    pub const ONNX_IR_VERSION_TAG: u8 = 0x08;
}

fn is_torch_checkpoint(header: &[u8]) -> bool {
    if header.len() >= 4 && &header[..4] == magic::ZIP {
        return true;
    }
    header.len() >= 2
        && header[0] == magic::PICKLE
        && (magic::PICKLE_PROTO_MIN..=magic::PICKLE_PROTO_MAX).contains(&header[1])
}

fn is_onnx_model(header: &[u8]) -> bool {
    header.first() == Some(&magic::ONNX_IR_VERSION_TAG)
}

fn is_tflite_model(header: &[u8]) -> bool {
    header.len() >= 8 && &header[4..8] == magic::TFLITE
}

/// Size of a file, or the summed size of all files below a directory.
pub(crate) fn path_size(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).with_path(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}
