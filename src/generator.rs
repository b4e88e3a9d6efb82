//! Named generators that turn key=value arguments into text, such as hostfiles for MPI launches
//! or per-host command scripts.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;

use crate::error::FabricError;
use crate::host::{template_registry, Host};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<&'static str>,
}

impl ArgSpec {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
            default: None,
        }
    }

    pub const fn optional(
        name: &'static str,
        description: &'static str,
        default: &'static str,
    ) -> Self {
        Self {
            name,
            description,
            required: false,
            default: Some(default),
        }
    }
}

pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn args(&self) -> &[ArgSpec];
    /// `args` holds every declared argument, defaults filled in.
    fn generate(&self, args: &HashMap<String, String>) -> Result<String, FabricError>;
}

#[derive(Default)]
pub struct Registry {
    generators: BTreeMap<&'static str, Box<dyn Generator>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let builtins: [Box<dyn Generator>; 2] = [Box::new(Hostfile), Box::new(Broadcast)];
        Self {
            generators: builtins.into_iter().map(|g| (g.name(), g)).collect(),
        }
    }

    pub fn register(&mut self, generator: Box<dyn Generator>) -> Result<(), FabricError> {
        let name = generator.name();
        if self.generators.contains_key(name) {
            return Err(FabricError::Config(format!(
                "generator '{}' is already registered",
                name
            )));
        }
        self.generators.insert(name, generator);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Generator> {
        self.generators.get(name).map(|g| g.as_ref())
    }

    /// Generators in name order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Generator> {
        self.generators.values().map(|g| g.as_ref())
    }

    /// Parses `key=value` arguments, checks them against the generator's declaration and runs it.
    pub fn run(&self, name: &str, raw_args: &[String]) -> Result<String, FabricError> {
        let generator = self
            .get(name)
            .ok_or_else(|| FabricError::Config(format!("unknown generator '{}'", name)))?;

        let mut args = HashMap::new();
        for raw in raw_args {
            let (key, value) = raw.split_once('=').ok_or_else(|| {
                FabricError::Config(format!("argument '{}' is not of the form key=value", raw))
            })?;
            if !generator.args().iter().any(|spec| spec.name == key) {
                return Err(FabricError::Config(format!(
                    "generator '{}' takes no argument '{}'",
                    name, key
                )));
            }
            args.insert(key.to_owned(), value.to_owned());
        }
        for spec in generator.args() {
            if args.contains_key(spec.name) {
                continue;
            }
            match spec.default {
                Some(default) => {
                    args.insert(spec.name.to_owned(), default.to_owned());
                }
                None if spec.required => {
                    return Err(FabricError::Config(format!(
                        "generator '{}' requires argument '{}'",
                        name, spec.name
                    )))
                }
                None => {}
            }
        }

        tracing::debug!(generator = name, "Running generator.");
        generator.generate(&args)
    }
}

fn split_hosts(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .collect()
}

/// An MPI-style hostfile, one `<host> slots=<n>` line per host.
pub struct Hostfile;

const HOSTFILE_ARGS: &[ArgSpec] = &[
    ArgSpec::required("hosts", "Comma-separated host list"),
    ArgSpec::optional("slots", "Slots per host", "8"),
];

impl Generator for Hostfile {
    fn name(&self) -> &'static str {
        "hostfile"
    }

    fn description(&self) -> &'static str {
        "MPI hostfile with a fixed slot count per host"
    }

    fn args(&self) -> &[ArgSpec] {
        HOSTFILE_ARGS
    }

    fn generate(&self, args: &HashMap<String, String>) -> Result<String, FabricError> {
        let hosts = split_hosts(args.get("hosts").map(String::as_str).unwrap_or_default());
        let slots = args.get("slots").map(String::as_str).unwrap_or("8");
        let slots: u32 = slots
            .parse()
            .map_err(|_| FabricError::Config(format!("slots must be a number, got '{}'", slots)))?;
        Ok(hosts
            .iter()
            .map(|host| format!("{} slots={}\n", host, slots))
            .join(""))
    }
}

/// Renders one command template per host, with `{{hostname}}` and `{{index}}` filled in.
pub struct Broadcast;

const BROADCAST_ARGS: &[ArgSpec] = &[
    ArgSpec::required("hosts", "Comma-separated host list"),
    ArgSpec::required("template", "Handlebars template rendered per host"),
];

impl Generator for Broadcast {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn description(&self) -> &'static str {
        "One rendered command line per host"
    }

    fn args(&self) -> &[ArgSpec] {
        BROADCAST_ARGS
    }

    fn generate(&self, args: &HashMap<String, String>) -> Result<String, FabricError> {
        let hosts = split_hosts(args.get("hosts").map(String::as_str).unwrap_or_default());
        let template = args.get("template").map(String::as_str).unwrap_or_default();
        let mut registry = template_registry();
        let mut out = String::new();
        for (index, hostname) in hosts.into_iter().enumerate() {
            let mut host = Host::new(hostname);
            host.params.insert("index".to_owned(), index.to_string());
            out.push_str(&host.render(&mut registry, template)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtins_are_listed_in_name_order() {
        let registry = Registry::with_builtins();
        let names: Vec<_> = registry.iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["broadcast", "hostfile"]);
    }

    #[test]
    fn hostfile_uses_default_slots() {
        let registry = Registry::with_builtins();
        let out = registry.run("hostfile", &args(&["hosts=a, b"])).unwrap();
        assert_eq!(out, "a slots=8\nb slots=8\n");
    }

    #[test]
    fn hostfile_rejects_bad_slots() {
        let registry = Registry::with_builtins();
        assert!(registry
            .run("hostfile", &args(&["hosts=a", "slots=many"]))
            .is_err());
    }

    #[test]
    fn broadcast_renders_per_host() {
        let registry = Registry::with_builtins();
        let out = registry
            .run(
                "broadcast",
                &args(&["hosts=n1,n2", "template=ping -c1 {{hostname}} # {{index}}"]),
            )
            .unwrap();
        assert_eq!(out, "ping -c1 n1 # 0\nping -c1 n2 # 1\n");
    }

    #[test]
    fn missing_required_argument() {
        let registry = Registry::with_builtins();
        let err = registry.run("broadcast", &args(&["hosts=a"])).unwrap_err();
        assert!(err.to_string().contains("template"));
    }

    #[test]
    fn unknown_argument_and_generator() {
        let registry = Registry::with_builtins();
        assert!(registry.run("hostfile", &args(&["hosts=a", "x=1"])).is_err());
        assert!(registry.run("hostfile", &args(&["hosts"])).is_err());
        assert!(registry.run("nope", &[]).is_err());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = Registry::with_builtins();
        assert!(registry.register(Box::new(Hostfile)).is_err());
    }
}
