use crate::writer::blob_path::FileFormat;
use crate::writer::codec::{decode_binary, CodecError, Frame};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("'{0}' has no .bin or .json extension")]
    UnknownFormat(PathBuf),

    #[error("decode failed: {0}")]
    Codec(#[from] CodecError),
}

/// Print a readable listing of a written blob.
pub fn inspect(path: &Path) -> Result<(), InspectError> {
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(FileFormat::from_extension)
        .ok_or_else(|| InspectError::UnknownFormat(path.to_path_buf()))?;
    let bytes = std::fs::read(path).map_err(|source| InspectError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    for line in describe(format, &bytes)? {
        println!("{}", line);
    }
    Ok(())
}

/// One line per record: headers and block checkpoints are shown in full, events by
/// their payload text.
pub fn describe(format: FileFormat, bytes: &[u8]) -> Result<Vec<String>, InspectError> {
    match format {
        FileFormat::Binary => {
            let mut lines = Vec::new();
            for frame in decode_binary(bytes)? {
                lines.push(match frame {
                    Frame::Magic => "magic".to_string(),
                    Frame::Header(header) => {
                        format!("header {}", serde_json::to_string(&header).map_err(CodecError::from)?)
                    }
                    Frame::CheckpointInfo(info) => {
                        format!("checkpoint {}", serde_json::to_string(&info).map_err(CodecError::from)?)
                    }
                    Frame::Event(payload) => format!("event {}", String::from_utf8_lossy(&payload)),
                });
            }
            Ok(lines)
        }
        FileFormat::Json => Ok(String::from_utf8_lossy(bytes)
            .lines()
            .map(|line| {
                if line.starts_with("{\"_header\"") {
                    format!("header {}", line)
                } else if line.starts_with("{\"_checkpoint\"") {
                    format!("checkpoint {}", line)
                } else {
                    format!("event {}", line)
                }
            })
            .collect()),
    }
}
