//! Filesystem path resolver confined to one storage root.

use std::fs;
use std::path::{Path, PathBuf};

use crate::ports::{PathResolver, PathSecurityError};

const MAX_COMPONENT_LEN: usize = 255;

/// Resolves `root/project[/subdir]/filename`, creating directories on the way.
#[derive(Debug, Clone)]
pub struct FsPathResolver {
    root: PathBuf,
}

impl FsPathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Project and subdirectory names: `[A-Za-z0-9_-]+`.
fn validate_dir_component<'a>(
    component: &'static str,
    value: &'a str,
) -> Result<&'a str, PathSecurityError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_COMPONENT_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(value)
    } else {
        Err(PathSecurityError::InvalidComponent {
            component,
            value: value.to_string(),
        })
    }
}

/// File names additionally allow dots, but never a leading dot or `..`.
fn validate_filename(value: &str) -> Result<&str, PathSecurityError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_COMPONENT_LEN
        && !value.starts_with('.')
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(value)
    } else {
        Err(PathSecurityError::InvalidComponent {
            component: "filename",
            value: value.to_string(),
        })
    }
}

/// Replace every character a resolver would reject with `_`.
///
/// Used to derive default file names from operation names.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PathSecurityError + '_ {
    move |source| PathSecurityError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl PathResolver for FsPathResolver {
    fn resolve(
        &self,
        project: &str,
        subdir: Option<&str>,
        filename: &str,
    ) -> Result<PathBuf, PathSecurityError> {
        let project = validate_dir_component("project", project)?;
        let subdir = subdir
            .map(|s| validate_dir_component("subdir", s))
            .transpose()?;
        let filename = validate_filename(filename)?;

        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
        let root = fs::canonicalize(&self.root).map_err(io_err(&self.root))?;

        let mut dir = root.join(project);
        if let Some(subdir) = subdir {
            dir.push(subdir);
        }
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        // Symlinked components could still point elsewhere.
        let dir = fs::canonicalize(&dir).map_err(io_err(&dir))?;
        if !dir.starts_with(&root) {
            return Err(PathSecurityError::OutsideRoot(dir));
        }

        let metadata = fs::metadata(&dir).map_err(io_err(&dir))?;
        if metadata.permissions().readonly() {
            return Err(PathSecurityError::NotWritable(dir));
        }

        Ok(dir.join(filename))
    }
}
