//! Input validation utilities
//!
//! Stack names and paths end up interpolated into remote shell commands, so
//! they are checked before any command is built.

use crate::HostDescriptor;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validation result
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Validate a stack (Compose project) name
///
/// # Examples
/// ```
/// # use stackshift_common::validation::validate_stack_name;
/// assert!(validate_stack_name("media-server").is_ok());
/// assert!(validate_stack_name("web_1").is_ok());
/// assert!(validate_stack_name("").is_err());
/// assert!(validate_stack_name("../etc").is_err());
/// assert!(validate_stack_name("-rf").is_err());
/// ```
pub fn validate_stack_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Stack name cannot be empty".to_string());
    }

    if name.len() > 128 {
        return Err("Stack name too long (max 128 characters)".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(
            "Stack name can only contain letters, numbers, dashes, and underscores".to_string(),
        );
    }

    if name.starts_with('-') || name.starts_with('.') {
        return Err("Stack name cannot start with '-' or '.'".to_string());
    }

    Ok(())
}

/// Validate a path on a remote host
///
/// Requires an absolute path without `..` segments or null bytes
pub fn validate_remote_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Path cannot be empty".to_string());
    }

    if !path.starts_with('/') {
        return Err(format!("Path must be absolute: {path}"));
    }

    if path.contains('\0') {
        return Err("Path cannot contain null bytes".to_string());
    }

    if path.split('/').any(|segment| segment == "..") {
        return Err(format!("Path cannot contain '..': {path}"));
    }

    Ok(())
}

/// Validate a host descriptor, collecting every problem
pub fn validate_host(host: &HostDescriptor) -> ValidationResult {
    let mut errors = Vec::new();

    if host.id.trim().is_empty() {
        errors.push(ValidationError::new("name", "Host name cannot be empty"));
    }

    if host.hostname.trim().is_empty() {
        errors.push(ValidationError::new("hostname", "Hostname cannot be empty"));
    } else if host.hostname.starts_with('-') || host.hostname.contains(char::is_whitespace) {
        errors.push(ValidationError::new(
            "hostname",
            format!("Invalid hostname '{}'", host.hostname),
        ));
    }

    if host.user.trim().is_empty() {
        errors.push(ValidationError::new("user", "SSH user cannot be empty"));
    }

    if host.port == 0 {
        errors.push(ValidationError::new("port", "Port must be between 1 and 65535"));
    }

    if let Some(appdata) = &host.appdata_path {
        if let Err(e) = validate_remote_path(appdata) {
            errors.push(ValidationError::new("appdata_path", e));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Join validation errors into one line
pub fn describe_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_names() {
        assert!(validate_stack_name("plex").is_ok());
        assert!(validate_stack_name("home-assistant_2").is_ok());
        assert!(validate_stack_name("a b").is_err());
        assert!(validate_stack_name("stack;rm").is_err());
        assert!(validate_stack_name(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_remote_paths() {
        assert!(validate_remote_path("/opt/appdata").is_ok());
        assert!(validate_remote_path("/var/lib/docker/volumes/data/_data").is_ok());
        assert!(validate_remote_path("relative/path").is_err());
        assert!(validate_remote_path("/opt/../etc").is_err());
        assert!(validate_remote_path("").is_err());
        // Dots inside a name are fine
        assert!(validate_remote_path("/opt/app..data").is_ok());
    }

    #[test]
    fn test_host_validation_collects_errors() {
        let mut host = HostDescriptor::new("", "", "");
        host.port = 0;
        host.appdata_path = Some("appdata".to_string());

        let errors = validate_host(&host).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "hostname", "user", "port", "appdata_path"]);
    }

    #[test]
    fn test_valid_host() {
        let host = HostDescriptor::new("alpha", "10.0.0.5", "deploy");
        assert!(validate_host(&host).is_ok());
    }
}
