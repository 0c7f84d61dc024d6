use std::path::{Component, Path};

use crate::TransferError;

/// Validates a peer-supplied file name before it is used inside a
/// downloads directory.
///
/// Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Anything with more than one component (`sub/file`, `..`, `.`)
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidName(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        (Some(Component::ParentDir), _) | (_, Some(Component::ParentDir)) => {
            return Err(TransferError::InvalidName(format!(
                "parent directory traversal not allowed: {name}"
            )));
        }
        (Some(Component::Prefix(_)), _) | (Some(Component::RootDir), _) => {
            return Err(TransferError::InvalidName(format!(
                "absolute path not allowed: {name}"
            )));
        }
        _ => {
            return Err(TransferError::InvalidName(format!(
                "name must be a single path component: {name}"
            )));
        }
    }

    // `Path` drops trailing `/` and treats `\` as ordinary on Unix.
    if name.contains(['/', '\\']) {
        return Err(TransferError::InvalidName(format!(
            "path separator not allowed: {name}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("   ").is_err());
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../passwd").is_err());
    }

    #[test]
    fn rejects_absolute_path() {
        assert!(validate_file_name("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_subdirectory() {
        assert!(validate_file_name("sub/file.txt").is_err());
    }

    #[test]
    fn rejects_backslash() {
        assert!(validate_file_name("C:\\Windows\\evil").is_err());
        assert!(validate_file_name("dir\\file").is_err());
    }

    #[test]
    fn rejects_current_dir() {
        assert!(validate_file_name(".").is_err());
    }

    #[test]
    fn accepts_simple_name() {
        assert!(validate_file_name("photo.png").is_ok());
    }

    #[test]
    fn accepts_dotfile() {
        assert!(validate_file_name(".profile").is_ok());
    }

    #[test]
    fn rejection_is_typed() {
        assert!(matches!(
            validate_file_name("../x"),
            Err(TransferError::InvalidName(_))
        ));
    }
}
