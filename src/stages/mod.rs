use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;

use crate::pipeline::{StageParameters, StageRegistry};

pub mod build;
pub mod package;
pub mod provision;

use build::{BuildParams, BuildStage};
use package::{PackageParams, PackageStage};
use provision::{HostToolchainResolver, ProvisionParams, ProvisionStage, ToolchainResolver};

pub fn register_defaults(registry: &mut StageRegistry) {
    register_with_resolver(registry, Arc::new(HostToolchainResolver));
}

/// Register the built-in stages, resolving toolchains through `resolver`.
pub fn register_with_resolver(registry: &mut StageRegistry, resolver: Arc<dyn ToolchainResolver>) {
    registry.register("provision", move |params| {
        Ok(Box::new(ProvisionStage::new(
            ProvisionParams::from_params(params)?,
            resolver.clone(),
        )))
    });
    registry.register("build", |params| {
        Ok(Box::new(BuildStage::new(BuildParams::from_params(params)?)))
    });
    registry.register("package", |params| {
        Ok(Box::new(PackageStage::new(PackageParams::from_params(
            params,
        )?)))
    });
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Option<Vec<String>>> {
    let Some(value) = params.remove(key) else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(vec![s])),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(anyhow!("'{key}' entries must be strings, found {other}")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        other => bail!("'{key}' must be a string or a list of strings, found {other}"),
    }
}

fn take_string_map(params: &mut StageParameters, key: &str) -> Result<BTreeMap<String, String>> {
    let Some(value) = params.remove(key) else {
        return Ok(BTreeMap::new());
    };
    match value {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(s) => Ok((name, s)),
                Value::Number(_) | Value::Bool(_) => Ok((name, value.to_string())),
                other => Err(anyhow!("'{key}.{name}' must be a scalar, found {other}")),
            })
            .collect(),
        other => bail!("'{key}' must be a mapping, found {other}"),
    }
}

fn ensure_consumed(params: &StageParameters, stage: &str) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut unknown: Vec<_> = params.keys().map(String::as_str).collect();
    unknown.sort_unstable();
    bail!(
        "{stage} stage does not accept parameter(s): {}",
        unknown.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> StageParameters {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn string_lists_accept_scalars_and_arrays() {
        let mut p = params(json!({"command": ["cargo", "build", 1], "probe": "rustc"}));
        assert_eq!(
            take_string_list(&mut p, "command").unwrap(),
            Some(vec!["cargo".into(), "build".into(), "1".into()])
        );
        assert_eq!(
            take_string_list(&mut p, "probe").unwrap(),
            Some(vec!["rustc".into()])
        );
        assert!(p.is_empty());
    }

    #[test]
    fn string_maps_reject_nested_values() {
        let mut p = params(json!({"env": {"A": "1", "B": 2, "C": {"x": 1}}}));
        assert!(take_string_map(&mut p, "env").is_err());

        let mut p = params(json!({"env": {"A": "1", "B": 2}}));
        let env = take_string_map(&mut p, "env").unwrap();
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn leftover_parameters_are_reported() {
        let p = params(json!({"colour": "blue", "size": 3}));
        let err = ensure_consumed(&p, "package").unwrap_err().to_string();
        assert!(err.contains("colour, size"), "{err}");
    }

    #[test]
    fn registry_lists_builtin_stages() {
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry);
        assert_eq!(registry.known_stages(), vec!["build", "package", "provision"]);
    }
}
