use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// On-disk encoding of a log blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FileFormat {
    #[default]
    #[serde(alias = "binary")]
    Binary,
    /// One record per line. Payloads are expected to be JSON documents: a line break
    /// inside one is written as a space, which keeps the document's meaning and the
    /// measured length.
    #[serde(alias = "json")]
    Json,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Binary => "bin",
            FileFormat::Json => "json",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "bin" => Some(FileFormat::Binary),
            "json" => Some(FileFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Binary => write!(f, "Binary"),
            FileFormat::Json => write!(f, "Json"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobPathError {
    #[error("malformed blob path '{path}': {reason}")]
    Malformed { path: String, reason: &'static str },
}

/// Structured blob name:
/// `{epoch_marker}/{sub_path}/{yyyy}/{mm}/{dd}_{index:010}[_{hour:02}].{ext}`.
///
/// `sub_path` may contain `/` or be empty, in which case its segment is omitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobPath {
    pub epoch_marker: String,
    pub sub_path: String,
    pub date: NaiveDate,
    pub index: u64,
    pub hour: Option<u32>,
    pub format: FileFormat,
}

impl BlobPath {
    pub fn new(
        epoch_marker: impl Into<String>,
        sub_path: impl Into<String>,
        date: NaiveDate,
        index: u64,
        hour: Option<u32>,
        format: FileFormat,
    ) -> Self {
        Self {
            epoch_marker: epoch_marker.into(),
            sub_path: sub_path.into(),
            date,
            index,
            hour,
            format,
        }
    }

    /// Same date, hour and format, next index.
    pub fn with_index(&self, index: u64) -> Self {
        Self {
            index,
            ..self.clone()
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.epoch_marker)?;
        if !self.sub_path.is_empty() {
            write!(f, "{}/", self.sub_path)?;
        }
        write!(
            f,
            "{:04}/{:02}/{:02}_{:010}",
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.index
        )?;
        if let Some(hour) = self.hour {
            write!(f, "_{:02}", hour)?;
        }
        write!(f, ".{}", self.format.extension())
    }
}

impl FromStr for BlobPath {
    type Err = BlobPathError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| BlobPathError::Malformed {
            path: path.to_string(),
            reason,
        };

        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 4 {
            return Err(malformed("expected at least 4 segments"));
        }

        let file = segments[segments.len() - 1];
        let month = segments[segments.len() - 2];
        let year = segments[segments.len() - 3];
        let epoch_marker = segments[0];
        let sub_path = segments[1..segments.len() - 3].join("/");
        if epoch_marker.is_empty() {
            return Err(malformed("empty epoch marker"));
        }

        let (stem, ext) = file.rsplit_once('.').ok_or_else(|| malformed("missing extension"))?;
        let format = FileFormat::from_extension(ext).ok_or_else(|| malformed("unknown extension"))?;

        let mut parts = stem.split('_');
        let day = parts.next().ok_or_else(|| malformed("missing day"))?;
        let index = parts.next().ok_or_else(|| malformed("missing index"))?;
        let hour = parts.next();
        if parts.next().is_some() {
            return Err(malformed("too many name parts"));
        }

        if year.len() != 4 || month.len() != 2 || day.len() != 2 || index.len() != 10 {
            return Err(malformed("wrong field width"));
        }

        let year: i32 = year.parse().map_err(|_| malformed("bad year"))?;
        let month: u32 = month.parse().map_err(|_| malformed("bad month"))?;
        let day: u32 = day.parse().map_err(|_| malformed("bad day"))?;
        let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| malformed("invalid date"))?;
        let index: u64 = index.parse().map_err(|_| malformed("bad index"))?;

        let hour = match hour {
            Some(h) if h.len() == 2 => {
                let h: u32 = h.parse().map_err(|_| malformed("bad hour"))?;
                if h > 23 {
                    return Err(malformed("hour out of range"));
                }
                Some(h)
            }
            Some(_) => return Err(malformed("wrong field width")),
            None => None,
        };

        Ok(BlobPath {
            epoch_marker: epoch_marker.to_string(),
            sub_path,
            date,
            index,
            hour,
            format,
        })
    }
}
