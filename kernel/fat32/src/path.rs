//! Absolute `/`-separated paths within a volume.

use alloc::vec::Vec;

use kernel_api_types::ErrorCode;

use crate::short_name::validate_name;

/// Splits `path` into validated components. Repeated separators collapse, so
/// `/` and `//` both name the root and yield no components.
pub fn components(path: &str) -> Result<Vec<&str>, ErrorCode> {
    let rest = path.strip_prefix('/').ok_or(ErrorCode::BadPath)?;

    let mut components = Vec::new();
    for component in rest.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." {
            return Err(ErrorCode::BadPath);
        }
        validate_name(component)?;
        components.push(component);
    }

    Ok(components)
}

/// Splits off the last component: `(parent components, leaf)`.
pub fn split_leaf(path: &str) -> Result<(Vec<&str>, &str), ErrorCode> {
    let mut components = components(path)?;
    let leaf = components.pop().ok_or(ErrorCode::BadPath)?;
    Ok((components, leaf))
}
