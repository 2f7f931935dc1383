//! Data-flow validation for workflow documents.
//!
//! Checks the rules the scheduler relies on at runtime: step ids are
//! unique, output names are unique and do not shadow the reserved scope
//! roots, and every template reference points at an output recorded by a
//! strictly earlier step. Parallel siblings may not reference each other;
//! their reference barrier is the last step before the group. Because
//! steps execute in declaration order, the no-early-reference rule also
//! rules out every cycle.

use std::collections::HashSet;

use serde_json::Value as JsonValue;

use crate::error::LoadError;
use crate::workflow::{is_template, Step, Workflow};

/// Scope roots that are always present and never step outputs.
const RESERVED: [&str; 2] = ["input", "variables"];

/// Keywords and literals that can appear inside template expressions.
const EXPR_WORDS: [&str; 8] = ["true", "false", "and", "or", "not", "in", "is", "as"];

pub fn validate_dag(workflow: &Workflow) -> Result<(), LoadError> {
    let mut leaves = Vec::new();
    collect_leaves(&workflow.steps, &mut leaves);

    let mut ids = HashSet::new();
    let mut outputs = HashSet::new();
    for leaf in &leaves {
        if !ids.insert(leaf.id.as_str()) {
            return Err(LoadError::DuplicateStepId(leaf.id.clone()));
        }
        if let Some(name) = &leaf.output {
            if RESERVED.contains(&name.as_str()) {
                return Err(LoadError::invalid(
                    format!("step {}", leaf.id),
                    format!("output name {name:?} is reserved"),
                ));
            }
            if !outputs.insert(name.as_str()) {
                return Err(LoadError::DuplicateOutput(name.clone()));
            }
        }
    }

    let mut available = HashSet::new();
    check_steps(&workflow.steps, &mut available, &outputs)?;
    Ok(())
}

fn collect_leaves<'a>(steps: &'a [Step], leaves: &mut Vec<&'a Step>) {
    for step in steps {
        if step.is_parallel() {
            collect_leaves(&step.parallel, leaves);
        } else {
            leaves.push(step);
        }
    }
}

fn check_steps(
    steps: &[Step],
    available: &mut HashSet<String>,
    all_outputs: &HashSet<&str>,
) -> Result<(), LoadError> {
    for step in steps {
        if step.is_parallel() {
            // Siblings all validate against the pre-group barrier.
            let barrier = available.clone();
            check_group(&step.parallel, &barrier, available, all_outputs)?;
        } else {
            check_leaf(step, available, all_outputs)?;
            if let Some(name) = &step.output {
                available.insert(name.clone());
            }
        }
    }
    Ok(())
}

fn check_group(
    steps: &[Step],
    barrier: &HashSet<String>,
    available: &mut HashSet<String>,
    all_outputs: &HashSet<&str>,
) -> Result<(), LoadError> {
    for step in steps {
        if step.is_parallel() {
            check_group(&step.parallel, barrier, available, all_outputs)?;
        } else {
            check_leaf(step, barrier, all_outputs)?;
            if let Some(name) = &step.output {
                available.insert(name.clone());
            }
        }
    }
    Ok(())
}

fn check_leaf(
    step: &Step,
    available: &HashSet<String>,
    all_outputs: &HashSet<&str>,
) -> Result<(), LoadError> {
    let mut refs = Vec::new();
    for value in step.input.values() {
        if let JsonValue::String(text) = value {
            if is_template(text) {
                extract_refs(text, &mut refs);
            }
        }
    }
    if let Some(guard) = &step.when {
        extract_refs(guard, &mut refs);
    }

    for reference in refs {
        // Only names that some step actually produces create edges; other
        // unknown names fail at render time as resolution errors.
        if all_outputs.contains(reference.as_str()) && !available.contains(&reference) {
            return Err(LoadError::EarlyReference {
                step_id: step.id.clone(),
                reference,
            });
        }
    }
    Ok(())
}

/// Collect the root identifiers referenced by a template's expressions.
pub(crate) fn extract_refs(template: &str, refs: &mut Vec<String>) {
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            return;
        };
        scan_idents(&rest[open + 2..open + 2 + close], refs);
        rest = &rest[open + 2 + close + 2..];
    }
}

fn scan_idents(expr: &str, refs: &mut Vec<String>) {
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '"' || c == '\'' {
            // Skip string literals.
            let quote = c;
            i += 1;
            while i < bytes.len() && bytes[i] as char != quote {
                i += 1;
            }
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_ascii_alphanumeric() || c == '_' {
                    i += 1;
                } else {
                    break;
                }
            }
            let ident = &expr[start..i];
            // Drop the rest of a dotted path.
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                    i += 1;
                } else {
                    break;
                }
            }
            let is_call = i < bytes.len() && bytes[i] as char == '(';
            if !is_call
                && !RESERVED.contains(&ident)
                && !EXPR_WORDS.contains(&ident)
                && !refs.iter().any(|r| r == ident)
            {
                refs.push(ident.to_string());
            }
        } else if c == '|' {
            // Everything after a filter pipe is a filter name, not data.
            return;
        } else {
            i += 1;
        }
    }
}
