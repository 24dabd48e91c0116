//! Scraper definitions, entrypoint routing and the module registry.
//!
//! A [`ScraperModule`] pairs a [`ScraperDefinition`] with an
//! [`EntrypointTable`]: an ordered list of `(patterns, handler)` routes.
//! Inputs are matched in registration order and the first matching route
//! wins; named capture groups become the handler's `vars`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::queue::ThrottleConfig;
use crate::sandbox::ScrapeContext;

/// Declared identity and capabilities of a scraper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScraperDefinition {
    pub name: String,

    /// Folder name under the controller's download folder; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,

    /// Network allow-list. `None` inherits the controller's access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConfig>,

    /// Default headers for every fetch the scraper makes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl ScraperDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_permissions<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(crate::models::normalize_header_name(name), value.into());
        self
    }

    pub fn folder_name(&self) -> &str {
        self.folder.as_deref().unwrap_or(&self.name)
    }
}

pub type EntrypointFuture = BoxFuture<'static, Result<(), AppError>>;

/// `(context, input, vars)`.
pub type Entrypoint =
    Arc<dyn Fn(ScrapeContext, String, HashMap<String, String>) -> EntrypointFuture + Send + Sync>;

struct Route {
    patterns: Vec<Regex>,
    handler: Entrypoint,
}

/// The outcome of routing an input.
#[derive(Clone)]
pub struct EntrypointMatch {
    /// Position of the route in its table, sent as `entrypoint_ref`.
    pub index: usize,
    pub handler: Entrypoint,
    pub vars: HashMap<String, String>,
}

impl std::fmt::Debug for EntrypointMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntrypointMatch")
            .field("index", &self.index)
            .field("vars", &self.vars)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct EntrypointTable {
    routes: Vec<Arc<Route>>,
}

impl EntrypointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route. Earlier routes take precedence.
    pub fn route<F, Fut>(mut self, patterns: &[&str], handler: F) -> Result<Self, AppError>
    where
        F: Fn(ScrapeContext, String, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    AppError::ConfigError(format!("invalid entrypoint pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let handler: Entrypoint = Arc::new(
            move |ctx: ScrapeContext,
                  input: String,
                  vars: HashMap<String, String>|
                  -> EntrypointFuture { Box::pin(handler(ctx, input, vars)) },
        );
        self.routes.push(Arc::new(Route { patterns, handler }));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route with a pattern matching `input`.
    pub fn match_input(&self, input: &str) -> Option<EntrypointMatch> {
        self.routes.iter().enumerate().find_map(|(index, route)| {
            route.patterns.iter().find_map(|pattern| {
                let captures = pattern.captures(input)?;
                let vars = pattern
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.to_string(), m.as_str().to_string()))
                    })
                    .collect();
                Some(EntrypointMatch {
                    index,
                    handler: Arc::clone(&route.handler),
                    vars,
                })
            })
        })
    }
}

/// A definition plus the entrypoints it exposes.
#[derive(Clone)]
pub struct ScraperModule {
    pub definition: ScraperDefinition,
    pub entrypoints: EntrypointTable,
}

impl ScraperModule {
    pub fn new(definition: ScraperDefinition, entrypoints: EntrypointTable) -> Self {
        Self {
            definition,
            entrypoints,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn match_input(&self, input: &str) -> Result<EntrypointMatch, AppError> {
        self.entrypoints
            .match_input(input)
            .ok_or_else(|| AppError::NoMatchingEntrypoint {
                scraper: self.definition.name.clone(),
                input: input.to_string(),
            })
    }
}

struct Registration {
    source: String,
    module: Arc<ScraperModule>,
}

/// Registered scraper modules, in registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: Vec<Registration>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` as coming from `source` (a path or URL, for
    /// diagnostics). Re-registering a name from the same source replaces it.
    pub fn register(
        &mut self,
        source: impl Into<String>,
        module: ScraperModule,
    ) -> Result<Arc<ScraperModule>, AppError> {
        let source = source.into();
        let module = Arc::new(module);
        match self.entries.iter_mut().find(|e| e.module.name() == module.name()) {
            Some(existing) if existing.source != source => Err(AppError::DuplicateRegistration {
                name: module.name().to_string(),
                existing_source: existing.source.clone(),
            }),
            Some(existing) => {
                existing.module = Arc::clone(&module);
                Ok(module)
            }
            None => {
                tracing::info!(name = %module.name(), source = %source, "Registered scraper");
                self.entries.push(Registration {
                    source,
                    module: Arc::clone(&module),
                });
                Ok(module)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScraperModule>> {
        self.entries
            .iter()
            .find(|e| e.module.name() == name)
            .map(|e| Arc::clone(&e.module))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.module.name().to_string()).collect()
    }

    /// The first module, in registration order, with a route for `input`.
    pub fn resolve(&self, input: &str) -> Result<(Arc<ScraperModule>, EntrypointMatch), AppError> {
        self.entries
            .iter()
            .find_map(|e| {
                e.module
                    .entrypoints
                    .match_input(input)
                    .map(|m| (Arc::clone(&e.module), m))
            })
            .ok_or_else(|| AppError::NoMatchingEntrypoint {
                scraper: "*".to_string(),
                input: input.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_table(patterns: &[&[&str]]) -> EntrypointTable {
        patterns.iter().fold(EntrypointTable::new(), |table, p| {
            table.route(p, |_, _, _| async { Ok::<_, AppError>(()) }).unwrap()
        })
    }

    #[test]
    fn first_registered_route_wins() {
        let table = noop_table(&[&[r"^https://example\.com/a"], &[r"^https://example\.com"]]);
        assert_eq!(table.match_input("https://example.com/a/1").unwrap().index, 0);
        assert_eq!(table.match_input("https://example.com/b").unwrap().index, 1);
        assert!(table.match_input("https://other.com").is_none());
    }

    #[test]
    fn named_captures_become_vars() {
        let table = noop_table(&[&[
            r"^https://shop\.example\.com/item/(?P<id>\d+)$",
            r"^item:(?P<id>\d+)$",
        ]]);
        let matched = table.match_input("item:42").unwrap();
        assert_eq!(matched.vars["id"], "42");
        let matched = table.match_input("https://shop.example.com/item/7").unwrap();
        assert_eq!(matched.vars.get("id").map(String::as_str), Some("7"));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let result =
            EntrypointTable::new().route(&["("], |_, _, _| async { Ok::<_, AppError>(()) });
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn duplicate_names_from_different_sources_conflict() {
        let mut registry = ModuleRegistry::new();
        let module =
            || ScraperModule::new(ScraperDefinition::new("brave"), noop_table(&[&["brave"]]));

        registry.register("/scrapers/brave/grob.yml", module()).unwrap();
        registry.register("/scrapers/brave/grob.yml", module()).unwrap();
        assert_eq!(registry.names(), vec!["brave"]);

        match registry.register("https://example.com/brave.yml", module()) {
            Err(AppError::DuplicateRegistration {
                name,
                existing_source,
            }) => {
                assert_eq!(name, "brave");
                assert_eq!(existing_source, "/scrapers/brave/grob.yml");
            }
            _ => panic!("expected DuplicateRegistration"),
        }
    }

    #[test]
    fn registry_resolves_in_registration_order() {
        let mut registry = ModuleRegistry::new();
        registry
            .register("a", ScraperModule::new(ScraperDefinition::new("a"), noop_table(&[&["^x"]])))
            .unwrap();
        registry
            .register("b", ScraperModule::new(ScraperDefinition::new("b"), noop_table(&[&["x"]])))
            .unwrap();

        let (module, _) = registry.resolve("xyz").unwrap();
        assert_eq!(module.name(), "a");
        let (module, _) = registry.resolve("yx").unwrap();
        assert_eq!(module.name(), "b");
        assert!(matches!(
            registry.resolve("nothing"),
            Err(AppError::NoMatchingEntrypoint { .. })
        ));
    }

    #[test]
    fn definition_deserializes_with_optional_fields() {
        let definition: ScraperDefinition = serde_json::from_str(
            concat!(
                r#"{"name":"brave","permissions":["search.brave.com"],"#,
                r#""throttle":{"rate_per_second":2}}"#,
            ),
        )
        .unwrap();
        assert_eq!(definition.folder_name(), "brave");
        assert_eq!(definition.throttle.unwrap().rate_per_second, Some(2));
        assert!(definition.headers.is_none());
    }
}
