//! Workflow document loading.
//!
//! Parses YAML into a [`Workflow`], auto-fills missing step ids, checks
//! the schema-level rules, and runs the data-flow validation from
//! [`crate::validate`]. A workflow returned from here is ready to execute.

use std::path::Path;

use tracing::debug;

use crate::error::LoadError;
use crate::validate;
use crate::workflow::{Service, Step, Workflow};

/// Load and validate a workflow from a YAML file.
pub fn load_file(path: &Path) -> Result<Workflow, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_str(&text)
}

/// Load and validate a workflow from YAML text.
pub fn load_str(text: &str) -> Result<Workflow, LoadError> {
    let mut workflow: Workflow = serde_yaml::from_str(text)?;

    let mut counter = 0usize;
    assign_step_ids(&mut workflow.steps, &mut counter);

    validate_workflow(&workflow)?;
    validate::validate_dag(&workflow)?;

    debug!(
        workflow = %workflow.name,
        version = %workflow.version,
        steps = workflow.steps.len(),
        "workflow document loaded"
    );
    Ok(workflow)
}

/// Fill in `step_<n>` ids for leaves that omit one. `n` counts leaves in
/// document order across the whole tree, so generated ids never collide.
fn assign_step_ids(steps: &mut [Step], counter: &mut usize) {
    for step in steps {
        if step.is_parallel() {
            assign_step_ids(&mut step.parallel, counter);
        } else {
            if step.id.is_empty() {
                step.id = format!("step_{counter}");
            }
            *counter += 1;
        }
    }
}

fn validate_workflow(workflow: &Workflow) -> Result<(), LoadError> {
    if workflow.name.is_empty() {
        return Err(LoadError::invalid("name", "is required"));
    }
    if workflow.version.is_empty() {
        return Err(LoadError::invalid("version", "is required"));
    }
    if workflow.steps.is_empty() {
        return Err(LoadError::invalid("steps", "workflow must have at least one step"));
    }

    for (name, service) in &workflow.services {
        validate_service(name, service)?;
    }

    for (index, step) in workflow.steps.iter().enumerate() {
        validate_step(step, workflow, &format!("steps[{index}]"))?;
    }

    Ok(())
}

fn validate_service(name: &str, service: &Service) -> Result<(), LoadError> {
    let path = format!("services.{name}");
    if service.endpoint.is_empty() {
        return Err(LoadError::invalid(path, "endpoint is required"));
    }
    if let Some(retry) = &service.retry {
        if retry.attempts == 0 {
            return Err(LoadError::invalid(
                format!("{path}.retry"),
                "attempts must be at least 1",
            ));
        }
    }
    Ok(())
}

fn validate_step(step: &Step, workflow: &Workflow, path: &str) -> Result<(), LoadError> {
    if step.is_parallel() {
        // Exactly one shape may be populated: a group carries no leaf
        // fields of its own.
        if !step.service.is_empty() || !step.method.is_empty() || step.compensate.is_some() {
            return Err(LoadError::invalid(
                path,
                "a parallel group cannot also declare service, method, or compensate",
            ));
        }
        for (index, child) in step.parallel.iter().enumerate() {
            validate_step(child, workflow, &format!("{path}.parallel[{index}]"))?;
        }
        return Ok(());
    }

    if step.service.is_empty() {
        return Err(LoadError::invalid(path, "service is required"));
    }
    if !workflow.services.contains_key(&step.service) {
        return Err(LoadError::invalid(
            path,
            format!("unknown service {:?}", step.service),
        ));
    }
    if step.method.is_empty() {
        return Err(LoadError::invalid(path, "method is required"));
    }
    if let Some(compensate) = &step.compensate {
        if compensate.method.is_empty() {
            return Err(LoadError::invalid(
                format!("{path}.compensate"),
                "method is required",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
name: order_processing
version: "1.0"
timeout: 2m
services:
  inventory:
    type: grpc
    endpoint: localhost:50051
    timeout: 5s
    retry:
      attempts: 3
      backoff: exponential
  notify:
    type: http
    endpoint: http://localhost:8080
steps:
  - id: reserve
    service: inventory
    method: reserve_stock
    input:
      sku: "{{ input.sku }}"
      count: 2
    output: reservation
    compensate:
      method: release_stock
      input:
        reservation_id: "{{ reservation.id }}"
  - service: notify
    method: "POST /notify"
    input:
      reservation: "{{ reservation.id }}"
output:
  summary: "{{ reservation.id }}"
"#;

    #[test]
    fn loads_a_valid_document() {
        let workflow = load_str(VALID).unwrap();
        assert_eq!(workflow.name, "order_processing");
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.steps[0].id, "reserve");
        // Second leaf had no id: filled from its document-order position.
        assert_eq!(workflow.steps[1].id, "step_1");
        assert_eq!(workflow.services.len(), 2);
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();
        let workflow = load_file(file.path()).unwrap();
        assert_eq!(workflow.name, "order_processing");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_file(Path::new("/nonexistent/workflow.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/workflow.yaml"));
    }

    #[test]
    fn rejects_missing_name_and_version() {
        let err = load_str("version: '1'\nsteps: [{id: a, service: s, method: m}]").unwrap_err();
        assert!(matches!(err, LoadError::Invalid { ref path, .. } if path == "name"));

        let err = load_str("name: x\nsteps: [{id: a, service: s, method: m}]").unwrap_err();
        assert!(matches!(err, LoadError::Invalid { ref path, .. } if path == "version"));
    }

    #[test]
    fn rejects_empty_steps() {
        let err = load_str("name: x\nversion: '1'\nsteps: []").unwrap_err();
        assert!(matches!(err, LoadError::Invalid { ref path, .. } if path == "steps"));
    }

    #[test]
    fn rejects_unknown_service_reference() {
        let yaml = r#"
name: x
version: "1"
steps:
  - id: a
    service: ghost
    method: do
"#;
        let err = load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown service"));
        assert!(err.to_string().contains("steps[0]"));
    }

    #[test]
    fn rejects_service_without_endpoint() {
        let yaml = r#"
name: x
version: "1"
services:
  broken:
    type: http
    endpoint: ""
steps:
  - id: a
    service: broken
    method: do
"#;
        let err = load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("services.broken"));
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        let yaml = r#"
name: x
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
    retry:
      attempts: 0
steps:
  - id: a
    service: svc
    method: do
"#;
        let err = load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("attempts must be at least 1"));
    }

    #[test]
    fn rejects_compensation_without_method() {
        let yaml = r#"
name: x
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: a
    service: svc
    method: do
    compensate:
      method: ""
"#;
        let err = load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("steps[0].compensate"));
    }

    #[test]
    fn rejects_parallel_group_with_leaf_fields() {
        let yaml = r#"
name: x
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - service: svc
    method: also_a_leaf
    parallel:
      - id: a
        service: svc
        method: do
"#;
        let err = load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("parallel group cannot also declare"));
        assert!(err.to_string().contains("steps[0]"));
    }

    #[test]
    fn validates_parallel_children_with_nested_paths() {
        let yaml = r#"
name: x
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - parallel:
      - id: a
        service: svc
        method: do
      - id: b
        service: missing
        method: do
"#;
        let err = load_str(yaml).unwrap_err();
        assert!(err.to_string().contains("steps[0].parallel[1]"));
    }

    #[test]
    fn ignores_unknown_top_level_keys() {
        let yaml = r#"
name: x
version: "1"
description: free-form text the engine does not interpret
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - id: a
    service: svc
    method: do
"#;
        assert!(load_str(yaml).is_ok());
    }

    #[test]
    fn auto_ids_do_not_collide_across_groups() {
        let yaml = r#"
name: x
version: "1"
services:
  svc:
    type: http
    endpoint: http://localhost:1
steps:
  - service: svc
    method: one
  - parallel:
      - service: svc
        method: two
      - service: svc
        method: three
  - service: svc
    method: four
"#;
        let workflow = load_str(yaml).unwrap();
        assert_eq!(workflow.steps[0].id, "step_0");
        assert_eq!(workflow.steps[1].parallel[0].id, "step_1");
        assert_eq!(workflow.steps[1].parallel[1].id, "step_2");
        assert_eq!(workflow.steps[2].id, "step_3");
    }
}
