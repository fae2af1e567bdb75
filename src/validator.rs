//! Upload validation.
//!
//! A pure predicate over the declared filename and payload size. Nothing here
//! touches the filesystem, so a rejected upload never leaves a trace in the
//! scratch directory.

use std::collections::BTreeSet;

/// Why an upload was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("unsupported file extension '{extension}'")]
    UnsupportedExtension { extension: String },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("no file payload provided")]
    MissingPayload,
}

impl Rejection {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedExtension { .. } => "unsupported_extension",
            Self::TooLarge { .. } => "payload_too_large",
            Self::MissingPayload => "missing_payload",
        }
    }
}

/// Lowercase suffix of `name` starting at its final `.`, or `""` if there is none.
///
/// `extension("Model.STL") == ".stl"`, `extension("noext") == ""`.
pub fn extension(name: &str) -> String {
    match name.rfind('.') {
        Some(pos) => name[pos..].to_lowercase(),
        None => String::new(),
    }
}

/// Normalize an allow-list entry: lowercase, with exactly one leading dot.
fn normalize_extension(entry: &str) -> Option<String> {
    let trimmed = entry.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!(".{}", trimmed.to_lowercase()))
    }
}

/// Checks uploads against an extension allow-list and a size limit.
#[derive(Debug, Clone)]
pub struct InputValidator {
    allowed: BTreeSet<String>,
    max_bytes: u64,
}

impl InputValidator {
    /// Create a validator. Entries may be given with or without a leading dot.
    pub fn new<I, S>(allowed: I, max_bytes: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .filter_map(|e| normalize_extension(e.as_ref()))
            .collect();
        Self { allowed, max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn allowed_extensions(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// Accept or reject the filename alone. Returns the normalized extension.
    pub fn check_name(&self, name: &str) -> Result<String, Rejection> {
        let ext = extension(name);
        if ext.is_empty() || !self.allowed.contains(&ext) {
            return Err(Rejection::UnsupportedExtension { extension: ext });
        }
        Ok(ext)
    }

    /// Accept or reject a payload size.
    pub fn check_size(&self, size: u64) -> Result<(), Rejection> {
        if size == 0 {
            return Err(Rejection::MissingPayload);
        }
        if size > self.max_bytes {
            return Err(Rejection::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Full check: extension first, then size.
    pub fn check(&self, name: &str, size: u64) -> Result<String, Rejection> {
        let ext = self.check_name(name)?;
        self.check_size(size)?;
        Ok(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> InputValidator {
        InputValidator::new([".stl", "3mf", ".AMF", ".obj", ".step", ".stp"], 1024)
    }

    #[test]
    fn test_extension_lowercases_final_suffix() {
        assert_eq!(extension("Model.STL"), ".stl");
        assert_eq!(extension("part.v2.Step"), ".step");
        assert_eq!(extension("noext"), "");
        assert_eq!(extension(""), "");
        assert_eq!(extension("trailing."), ".");
    }

    #[test]
    fn test_allow_list_normalization() {
        let v = validator();
        let allowed: Vec<&str> = v.allowed_extensions().collect();
        assert_eq!(allowed, vec![".3mf", ".amf", ".obj", ".step", ".stl", ".stp"]);
    }

    #[test]
    fn test_accepts_every_allowed_extension() {
        let v = validator();
        for name in ["a.stl", "b.3MF", "c.amf", "d.obj", "e.step", "f.STP"] {
            assert!(v.check(name, 10).is_ok(), "{name} should be accepted");
        }
        assert_eq!(v.check("Model.STL", 10).unwrap(), ".stl");
    }

    #[test]
    fn test_rejects_unknown_and_missing_extensions() {
        let v = validator();
        for name in ["notes.txt", "noext", "model.stl.exe", "trailing.", ""] {
            let err = v.check(name, 10).unwrap_err();
            assert_eq!(err.code(), "unsupported_extension", "{name}");
        }
    }

    #[test]
    fn test_size_limit_is_distinct_rejection() {
        let v = validator();
        assert!(v.check("a.stl", 1024).is_ok());

        let err = v.check("a.stl", 1025).unwrap_err();
        assert_eq!(err, Rejection::TooLarge { size: 1025, max: 1024 });
        assert_ne!(
            err.code(),
            Rejection::UnsupportedExtension {
                extension: ".txt".to_string()
            }
            .code()
        );
    }

    #[test]
    fn test_empty_payload_is_missing() {
        let v = validator();
        assert_eq!(v.check("a.stl", 0).unwrap_err(), Rejection::MissingPayload);
    }

    #[test]
    fn test_empty_allow_list_rejects_everything() {
        let v = InputValidator::new(Vec::<String>::new(), 1024);
        assert!(v.check("a.stl", 1).is_err());
    }
}
