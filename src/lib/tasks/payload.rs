use serde::Serialize;

use super::types::Payload;

/// One problem found in a task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaError {
    pub field: String,
    pub message: String,
}

impl SchemaError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Parse and check `task.payload`, collecting every problem found.
pub fn validate_payload(
    raw: &serde_json::Value,
    max_run_time_ceiling: u64,
) -> Result<Payload, Vec<SchemaError>> {
    if !raw.is_object() {
        return Err(vec![SchemaError::new("payload", "must be an object")]);
    }

    let payload: Payload = serde_json::from_value(raw.clone())
        .map_err(|e| vec![SchemaError::new("payload", e.to_string())])?;

    let mut errors = Vec::new();

    if payload.image.name().trim().is_empty() {
        errors.push(SchemaError::new("image", "must not be empty"));
    }
    if let super::types::ImageSpec::Typed { kind, .. } = &payload.image {
        if kind != "docker-image" {
            errors.push(SchemaError::new(
                "image.type",
                format!("unsupported image type {kind:?}"),
            ));
        }
    }
    if payload.max_run_time == 0 {
        errors.push(SchemaError::new("maxRunTime", "must be at least 1 second"));
    }
    if payload.max_run_time > max_run_time_ceiling {
        errors.push(SchemaError::new(
            "maxRunTime",
            format!("must not exceed {max_run_time_ceiling} seconds"),
        ));
    }
    for (name, mount) in &payload.cache {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            errors.push(SchemaError::new(
                format!("cache.{name}"),
                "cache names must be non-empty path segments",
            ));
        }
        if !mount.starts_with('/') {
            errors.push(SchemaError::new(
                format!("cache.{name}"),
                "mount point must be an absolute path",
            ));
        }
    }
    for (name, artifact) in &payload.artifacts {
        if artifact.path.is_empty() {
            errors.push(SchemaError::new(
                format!("artifacts.{name}.path"),
                "must not be empty",
            ));
        }
    }
    for (i, service) in payload.services.iter().enumerate() {
        if service.alias.is_empty() {
            errors.push(SchemaError::new(
                format!("services[{i}].alias"),
                "must not be empty",
            ));
        }
    }

    if errors.is_empty() {
        Ok(payload)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CEILING: u64 = 24 * 60 * 60;

    #[test]
    fn minimal_payload_is_valid() {
        let payload = validate_payload(
            &json!({ "image": "ubuntu", "command": ["true"], "maxRunTime": 60 }),
            CEILING,
        )
        .unwrap();
        assert_eq!(payload.image.name(), "ubuntu");
        assert_eq!(payload.max_run_time, 60);
        assert!(payload.cache.is_empty());
    }

    #[test]
    fn missing_max_run_time_is_rejected() {
        let errors = validate_payload(&json!({ "image": "ubuntu" }), CEILING).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("maxRunTime"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let errors = validate_payload(
            &json!({ "image": "ubuntu", "maxRunTime": 5, "bogus": true }),
            CEILING,
        )
        .unwrap_err();
        assert!(errors[0].message.contains("bogus"));
    }

    #[test]
    fn semantic_errors_are_collected() {
        let errors = validate_payload(
            &json!({
                "image": "",
                "maxRunTime": CEILING + 1,
                "cache": { "../escape": "relative" }
            }),
            CEILING,
        )
        .unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"image"));
        assert!(fields.contains(&"maxRunTime"));
        assert_eq!(fields.iter().filter(|f| **f == "cache.../escape").count(), 2);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(validate_payload(&json!("nope"), CEILING).is_err());
    }
}
