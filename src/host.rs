//! Cluster hosts.
//!
//! A host entry in the cluster file is either a bare hostname or a mapping of a `hostname` list
//! plus parameter lists. Mappings expand to the cartesian product of their values, and each
//! hostname is itself a Handlebars template over its parameters, so
//! `{hostname: ["gpu{{rack}}-{{slot}}"], rack: [a, b], slot: ["1", "2"]}` yields four hosts.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use colored::*;
use colourado::Color;
use handlebars::Handlebars;
use itertools::sorted;
use serde::Deserialize;
use void::Void;

use crate::error::FabricError;
use crate::serde::{string_or_mapping, ScalarList};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// SSH hostname to connect to.
    pub hostname: String,
    /// Parameters used to fill in per-host command templates.
    pub params: HashMap<String, String>,
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            params: HashMap::new(),
        }
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given palette color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("[{}]", self.hostname).truecolor(r, g, b)
    }

    /// Renders `template` with this host's parameters and `{{hostname}}`.
    pub fn render(&self, registry: &mut Handlebars, template: &str) -> Result<String, FabricError> {
        let mut params = self.params.clone();
        params.insert("hostname".to_owned(), self.hostname.clone());
        render_with(registry, template, &params)
    }
}

/// A Handlebars registry for shell commands: misc helpers registered, no HTML escaping.
pub fn template_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    handlebars_misc_helpers::register(&mut registry);
    registry
}

fn render_with(
    registry: &mut Handlebars,
    template: &str,
    params: &HashMap<String, String>,
) -> Result<String, FabricError> {
    if !registry.has_template(template) {
        registry
            .register_template_string(template, template)
            .map_err(|e| FabricError::Template(e.to_string()))?;
    }
    registry
        .render(template, params)
        .map_err(|e| FabricError::Template(format!("'{}': {}", template, e)))
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "[{}]", self.hostname)?;
        } else {
            write!(f, "[{} (", self.hostname)?;
            for (i, (key, value)) in sorted(self.params.iter()).enumerate() {
                if i == 0 {
                    write!(f, "{}={}", key, value)?;
                } else {
                    write!(f, ",{}={}", key, value)?;
                }
            }
            write!(f, ")]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostSpec(#[serde(deserialize_with = "string_or_mapping")] HostSpecInner);

#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
struct HostSpecInner(HashMap<String, ScalarList>);

impl FromStr for HostSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = HashMap::new();
        map.insert("hostname".to_string(), ScalarList(vec![s.to_string()]));
        Ok(Self(map))
    }
}

/// Expands host entries into the ordered host list.
pub fn expand_hosts(specs: &[HostSpec]) -> Result<Vec<Host>, FabricError> {
    let mut registry = template_registry();

    let mut hosts = Vec::with_capacity(specs.len());
    for (index, HostSpec(HostSpecInner(spec))) in specs.iter().enumerate() {
        let mut spec = spec.clone();
        let ScalarList(hostnames) = spec.remove("hostname").ok_or_else(|| {
            FabricError::Config(format!("host entry {} is missing the 'hostname' key", index))
        })?;
        let mut expanded: Vec<Host> = hostnames.into_iter().map(Host::new).collect();
        // Iterate parameters in key order so expansion is deterministic.
        for (key, ScalarList(values)) in sorted(spec) {
            let mut part_expanded = Vec::with_capacity(expanded.len() * values.len());
            for host in expanded {
                for value in values.iter() {
                    let mut host = host.clone();
                    host.params.insert(key.clone(), value.clone());
                    part_expanded.push(host);
                }
            }
            expanded = part_expanded;
        }
        for host in expanded.iter_mut() {
            host.hostname = render_with(&mut registry, &host.hostname, &host.params)?
                .trim()
                .to_owned();
        }
        hosts.extend(expanded);
    }

    if let Some(empty) = hosts.iter().position(|h| h.hostname.is_empty()) {
        return Err(FabricError::Config(format!(
            "host {} renders to an empty hostname",
            empty
        )));
    }
    tracing::debug!(hosts = hosts.len(), "Hosts detected.");
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Vec<Host>, FabricError> {
        let specs: Vec<HostSpec> = serde_yaml::from_str(yaml).unwrap();
        expand_hosts(&specs)
    }

    #[test]
    fn bare_hostnames() {
        let hosts = parse("- node1\n- node2").unwrap();
        let names: Vec<_> = hosts.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, vec!["node1", "node2"]);
        assert!(hosts[0].params.is_empty());
    }

    #[test]
    fn parametrized_hosts_expand_and_render() {
        let hosts = parse(
            r#"
- hostname:
    - "gpu{{rack}}"
  rack:
    - "1"
    - "2"
"#,
        )
        .unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].hostname, "gpu1");
        assert_eq!(hosts[1].hostname, "gpu2");
        assert_eq!(hosts[1].params.get("rack"), Some(&"2".to_string()));
    }

    #[test]
    fn cartesian_product_over_params() {
        let hosts = parse(
            r#"
- hostname: [a, b]
  nic: [ib0, ib1]
  slots: ["8"]
"#,
        )
        .unwrap();
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts[0].to_string(), "[a (nic=ib0,slots=8)]");
        assert_eq!(hosts[3].to_string(), "[b (nic=ib1,slots=8)]");
    }

    #[test]
    fn scalar_values_need_no_list() {
        let hosts = parse("- hostname: node1\n  slots: 8").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].params.get("slots"), Some(&"8".to_string()));
    }

    #[test]
    fn mapping_without_hostname_is_rejected() {
        assert!(matches!(
            parse("- rack: [\"1\"]"),
            Err(FabricError::Config(_))
        ));
    }

    #[test]
    fn render_fills_params_and_hostname() {
        let mut host = Host::new("node1");
        host.params.insert("dev".into(), "mlx5_0".into());
        let mut registry = template_registry();
        let rendered = host
            .render(&mut registry, "ibstat {{dev}} # {{hostname}}")
            .unwrap();
        assert_eq!(rendered, "ibstat mlx5_0 # node1");
    }
}
