use crate::error::Error;

const MAX_NAME_LEN: usize = 64;
const MAX_BUILD_ID_LEN: usize = 128;
const MAX_EXTENSION_LEN: usize = 16;

fn is_valid_name_char(c: char, allow_period: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || (allow_period && c == '.')
}

fn validate_name(
    name: &str,
    entity: &str,
    max_len: usize,
    allow_period: bool,
) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{entity} cannot be empty"));
    }
    if name.len() > max_len {
        return Err(format!("{entity} cannot exceed {max_len} characters"));
    }
    if !name.chars().all(|c| is_valid_name_char(c, allow_period)) {
        let mut allowed = "alphanumeric characters, hyphens, and underscores".to_string();
        if allow_period {
            allowed.push_str(", and periods");
        }
        return Err(format!("{entity} can only contain {allowed}"));
    }
    if name.starts_with(['-', '_', '.']) {
        return Err(format!(
            "{entity} cannot start with a hyphen, underscore or period"
        ));
    }
    Ok(())
}

/// Tenant and user names.
pub fn validate_slug(name: &str, entity: &str) -> Result<(), Error> {
    validate_name(name, entity, MAX_NAME_LEN, false).map_err(Error::Validation)
}

/// Build ids end up in object keys, so they stay path-safe.
pub fn validate_build_id(id: &str) -> Result<(), Error> {
    validate_name(id, "buildId", MAX_BUILD_ID_LEN, true).map_err(Error::Validation)
}

pub fn validate_extension(ext: &str) -> Result<(), Error> {
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(Error::Validation(format!(
            "extension must be 1-{MAX_EXTENSION_LEN} alphanumeric characters"
        )));
    }
    Ok(())
}

/// Artifact keys handed to a tenant must live under `<tenant_id>/`.
pub fn require_tenant_key(tenant_id: &str, key: &str) -> Result<(), Error> {
    let in_scope = key
        .strip_prefix(tenant_id)
        .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1);
    if !in_scope {
        return Err(Error::Unauthorized(format!(
            "artifact key must live under '{tenant_id}/'"
        )));
    }
    Ok(())
}
