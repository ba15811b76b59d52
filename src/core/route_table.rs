//! Route table: compiles service route templates into typed segment matchers and
//! resolves `(method, path)` to the first matching route in declaration order.
//!
//! Template syntax:
//! * `/users/:id` binds the `id` parameter to exactly one non-empty path segment
//! * `/files/*` matches `/files/` followed by anything, including further `/`
//! * `/static*` matches any path starting with `/static`
//! * `*` on its own matches every path
//!
//! Open segments may also sit inside a template: `/tenants/*/reports/:id`
//! accepts any non-empty run of segments between `tenants` and `reports`.
//!
//! Matching is case-sensitive and anchored at both ends (apart from wildcards).
//! Parameters are taken positionally from the raw path segments, so values are
//! still percent-encoded as the client sent them.
use std::{collections::HashMap, str::FromStr};

use http::Method;
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::models::{GlobalDefaults, RouteDefinition, ServiceConfig},
    core::backend::{BackendError, BackendUrl},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteTableError {
    #[error("service '{service}' route {index}: missing path")]
    MissingPath { service: String, index: usize },

    #[error("service '{service}' route '{path}': no methods listed")]
    MissingMethods { service: String, path: String },

    #[error("service '{service}' route '{path}': invalid method '{method}'")]
    InvalidMethod {
        service: String,
        path: String,
        method: String,
    },

    #[error("service '{service}' route '{path}': {message}")]
    InvalidTemplate {
        service: String,
        path: String,
        message: String,
    },

    #[error("service '{service}': {source}")]
    InvalidBackend {
        service: String,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    /// `prefix*`: the segment starts with `prefix`, then anything until the end
    Prefix(String),
    /// bare `*`: the rest of the path, possibly empty
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoutePattern {
    Any,
    Segments(Vec<Segment>),
}

impl RoutePattern {
    fn parse(template: &str) -> Result<Self, String> {
        if template == "*" {
            return Ok(RoutePattern::Any);
        }
        let rest = template
            .strip_prefix('/')
            .ok_or_else(|| "template must start with '/' or be '*'".to_string())?;

        let raw: Vec<&str> = rest.split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());

        for (i, part) in raw.iter().enumerate() {
            let segment = if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(format!("segment {} has an empty parameter name", i + 1));
                }
                Segment::Param(name.to_string())
            } else if *part == "*" {
                Segment::Wildcard
            } else if let Some(prefix) = part.strip_suffix('*') {
                Segment::Prefix(prefix.to_string())
            } else {
                Segment::Literal(part.to_string())
            };

            if part.trim_end_matches('*').contains('*') {
                return Err(format!(
                    "segment {} may only end with '*', not contain it",
                    i + 1
                ));
            }
            segments.push(segment);
        }

        Ok(RoutePattern::Segments(segments))
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let segments = match self {
            RoutePattern::Any => return Some(HashMap::new()),
            RoutePattern::Segments(segments) => segments,
        };

        let rest = path.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        match_segments(segments, &parts).map(|pairs| pairs.into_iter().collect())
    }
}

/// Match `segments` against the path `parts`, backtracking over open segments.
///
/// `*` consumes one or more path segments and `prefix*` consumes a segment
/// starting with `prefix` plus any that follow, so both may sit mid-template.
fn match_segments(segments: &[Segment], parts: &[&str]) -> Option<Vec<(String, String)>> {
    let Some((segment, rest)) = segments.split_first() else {
        return parts.is_empty().then(Vec::new);
    };
    let (first, remaining) = parts.split_first()?;

    match segment {
        Segment::Literal(literal) => {
            if first != literal {
                return None;
            }
            match_segments(rest, remaining)
        }
        Segment::Param(name) => {
            if first.is_empty() {
                return None;
            }
            let mut params = match_segments(rest, remaining)?;
            params.push((name.clone(), (*first).to_string()));
            Some(params)
        }
        Segment::Wildcard => open_tail(rest, remaining),
        Segment::Prefix(prefix) => {
            if !first.starts_with(prefix.as_str()) {
                return None;
            }
            open_tail(rest, remaining)
        }
    }
}

/// After an open segment took its first path segment, let it swallow as many
/// more as needed for `rest` to match what is left.
fn open_tail(rest: &[Segment], remaining: &[&str]) -> Option<Vec<(String, String)>> {
    if rest.is_empty() {
        return Some(Vec::new());
    }
    (0..remaining.len()).find_map(|skip| match_segments(rest, &remaining[skip..]))
}

/// A route with its matcher and fully resolved policy flags.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub service: String,
    pub backend: BackendUrl,
    pub template: String,
    pub methods: Vec<Method>,
    pub requires_auth: bool,
    pub cache: bool,
    pub rate_limit: bool,
    pattern: RoutePattern,
}

impl CompiledRoute {
    fn compile(
        service: &ServiceConfig,
        backend: &BackendUrl,
        index: usize,
        def: &RouteDefinition,
        defaults: &GlobalDefaults,
    ) -> Result<Self, RouteTableError> {
        if def.path.trim().is_empty() {
            return Err(RouteTableError::MissingPath {
                service: service.name.clone(),
                index: index + 1,
            });
        }
        if def.methods.is_empty() {
            return Err(RouteTableError::MissingMethods {
                service: service.name.clone(),
                path: def.path.clone(),
            });
        }

        let methods = def
            .methods
            .iter()
            .map(|m| {
                Method::from_str(&m.trim().to_ascii_uppercase()).map_err(|_| {
                    RouteTableError::InvalidMethod {
                        service: service.name.clone(),
                        path: def.path.clone(),
                        method: m.clone(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pattern =
            RoutePattern::parse(&def.path).map_err(|message| RouteTableError::InvalidTemplate {
                service: service.name.clone(),
                path: def.path.clone(),
                message,
            })?;

        Ok(Self {
            service: service.name.clone(),
            backend: backend.clone(),
            template: def.path.clone(),
            methods,
            requires_auth: def.requires_auth.unwrap_or(true),
            cache: def.cache.unwrap_or(false),
            rate_limit: def
                .rate_limit
                .or(service.rate_limit)
                .unwrap_or(defaults.default_rate_limit),
            pattern,
        })
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct MatchedRoute<'a> {
    pub route: &'a CompiledRoute,
    pub params: HashMap<String, String>,
}

impl MatchedRoute<'_> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub path: String,
    pub methods: Vec<String>,
    pub requires_auth: bool,
    pub cache: bool,
    pub rate_limit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub base_url: String,
    pub routes: Vec<RouteSummary>,
}

/// Ordered, immutable set of compiled routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
    services: Vec<(String, BackendUrl)>,
}

impl RouteTable {
    /// Compile every service's routes, failing on the first malformed definition.
    pub fn compile(
        services: &[ServiceConfig],
        defaults: &GlobalDefaults,
    ) -> Result<Self, RouteTableError> {
        let mut table = RouteTable::default();

        for service in services {
            let backend =
                BackendUrl::new(&service.base_url).map_err(|source| {
                    RouteTableError::InvalidBackend {
                        service: service.name.clone(),
                        source,
                    }
                })?;

            for (index, def) in service.routes.iter().enumerate() {
                let route = CompiledRoute::compile(service, &backend, index, def, defaults)?;
                tracing::debug!(
                    service = %route.service,
                    template = %route.template,
                    methods = ?route.methods,
                    requires_auth = route.requires_auth,
                    cache = route.cache,
                    rate_limit = route.rate_limit,
                    "Compiled route"
                );
                table.routes.push(route);
            }
            table.services.push((service.name.clone(), backend));
        }

        Ok(table)
    }

    /// First route, in declaration order, whose methods include `method` and whose
    /// template matches `path` (the path only, without query string).
    pub fn match_route(&self, method: &Method, path: &str) -> Option<MatchedRoute<'_>> {
        self.routes.iter().find_map(|route| {
            if !route.allows(method) {
                return None;
            }
            route
                .pattern
                .matches(path)
                .map(|params| MatchedRoute { route, params })
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn summary(&self) -> Vec<ServiceSummary> {
        self.services
            .iter()
            .map(|(name, backend)| ServiceSummary {
                name: name.clone(),
                base_url: backend.to_string(),
                routes: self
                    .routes
                    .iter()
                    .filter(|r| &r.service == name)
                    .map(|r| RouteSummary {
                        path: r.template.clone(),
                        methods: r.methods.iter().map(|m| m.to_string()).collect(),
                        requires_auth: r.requires_auth,
                        cache: r.cache,
                        rate_limit: r.rate_limit,
                    })
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, methods: &[&str]) -> RouteDefinition {
        RouteDefinition {
            path: path.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    fn service(name: &str, routes: Vec<RouteDefinition>) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            base_url: format!("http://{name}:3000"),
            rate_limit: None,
            routes,
        }
    }

    fn table(services: Vec<ServiceConfig>) -> RouteTable {
        RouteTable::compile(&services, &GlobalDefaults::default()).unwrap()
    }

    #[test]
    fn test_param_and_literal_segments() {
        let table = table(vec![service("users", vec![route("/users/:id", &["GET"])])]);

        let matched = table.match_route(&Method::GET, "/users/42").unwrap();
        assert_eq!(matched.route.service, "users");
        assert_eq!(matched.param("id"), Some("42"));

        assert!(table.match_route(&Method::GET, "/users").is_none());
        assert!(table.match_route(&Method::GET, "/users/").is_none());
        assert!(table.match_route(&Method::GET, "/users/42/orders").is_none());
        assert!(table.match_route(&Method::GET, "/Users/42").is_none());
        assert!(table.match_route(&Method::POST, "/users/42").is_none());
    }

    #[test]
    fn test_first_declared_match_wins() {
        let table = table(vec![
            service("users", vec![route("/users/:id", &["GET"])]),
            service("admin", vec![route("/users/me", &["GET"])]),
        ]);
        let matched = table.match_route(&Method::GET, "/users/me").unwrap();
        assert_eq!(matched.route.service, "users");
        assert_eq!(matched.param("id"), Some("me"));
    }

    #[test]
    fn test_method_filter_falls_through_to_later_route() {
        let table = table(vec![
            service("reads", vec![route("/items/:id", &["GET"])]),
            service("writes", vec![route("/items/:id", &["PUT", "delete"])]),
        ]);
        assert_eq!(
            table.match_route(&Method::PUT, "/items/1").unwrap().route.service,
            "writes"
        );
        assert_eq!(
            table.match_route(&Method::DELETE, "/items/1").unwrap().route.service,
            "writes"
        );
    }

    #[test]
    fn test_wildcards() {
        let table = table(vec![
            service("files", vec![route("/files/*", &["GET"])]),
            service("assets", vec![route("/static*", &["GET"])]),
            service("fallback", vec![route("*", &["GET"])]),
        ]);

        let svc = |path: &str| table.match_route(&Method::GET, path).unwrap().route.service.clone();
        assert_eq!(svc("/files/"), "files");
        assert_eq!(svc("/files/a/b/c.txt"), "files");
        assert_eq!(svc("/static"), "assets");
        assert_eq!(svc("/static-v2/app.js"), "assets");
        assert_eq!(svc("/files"), "fallback");
        assert_eq!(svc("/anything/else"), "fallback");
    }

    #[test]
    fn test_wildcard_inside_template() {
        let table = table(vec![
            service("reports", vec![route("/tenants/*/reports/:id", &["GET"])]),
            service("assets", vec![route("/v*/assets/:name", &["GET"])]),
        ]);

        let matched = table
            .match_route(&Method::GET, "/tenants/acme/eu/reports/42")
            .unwrap();
        assert_eq!(matched.route.service, "reports");
        assert_eq!(matched.param("id"), Some("42"));

        assert!(table.match_route(&Method::GET, "/tenants/acme/reports/42").is_some());
        assert!(table.match_route(&Method::GET, "/tenants/reports/42").is_none());
        assert!(table.match_route(&Method::GET, "/tenants/acme/reports/42/x").is_none());

        let matched = table
            .match_route(&Method::GET, "/v2/beta/assets/logo.png")
            .unwrap();
        assert_eq!(matched.route.service, "assets");
        assert_eq!(matched.param("name"), Some("logo.png"));
        assert!(table.match_route(&Method::GET, "/x2/assets/logo.png").is_none());
    }

    #[test]
    fn test_params_are_raw_positional_segments() {
        let table = table(vec![service(
            "orders",
            vec![route("/users/:userId/orders/:orderId", &["GET"])],
        )]);
        let matched = table
            .match_route(&Method::GET, "/users/john%20doe/orders/7")
            .unwrap();
        assert_eq!(matched.param("userId"), Some("john%20doe"));
        assert_eq!(matched.param("orderId"), Some("7"));
    }

    #[test]
    fn test_policy_flag_resolution() {
        let mut open = route("/open", &["GET"]);
        open.requires_auth = Some(false);
        let mut limited = route("/limited", &["GET"]);
        limited.rate_limit = Some(true);
        let mut svc = service("svc", vec![route("/plain", &["GET"]), open, limited]);
        svc.rate_limit = Some(false);

        let defaults = GlobalDefaults {
            default_rate_limit: true,
            ..Default::default()
        };
        let table = RouteTable::compile(&[svc], &defaults).unwrap();
        let routes = table.routes();

        assert!(routes[0].requires_auth);
        assert!(!routes[0].cache);
        assert!(!routes[0].rate_limit, "service default overrides global");
        assert!(!routes[1].requires_auth);
        assert!(routes[2].rate_limit, "route flag overrides service default");
    }

    #[test]
    fn test_compile_fails_fast_on_malformed_routes() {
        let defaults = GlobalDefaults::default();

        let err = RouteTable::compile(&[service("a", vec![route("", &["GET"])])], &defaults)
            .unwrap_err();
        assert!(matches!(err, RouteTableError::MissingPath { index: 1, .. }));

        let err = RouteTable::compile(&[service("a", vec![route("/x", &[])])], &defaults)
            .unwrap_err();
        assert!(matches!(err, RouteTableError::MissingMethods { .. }));

        let err = RouteTable::compile(&[service("a", vec![route("/x/a*b", &["GET"])])], &defaults)
            .unwrap_err();
        assert!(matches!(err, RouteTableError::InvalidTemplate { .. }));

        let err = RouteTable::compile(&[service("a", vec![route("/x/:", &["GET"])])], &defaults)
            .unwrap_err();
        assert!(matches!(err, RouteTableError::InvalidTemplate { .. }));

        let mut bad_backend = service("a", vec![route("/x", &["GET"])]);
        bad_backend.base_url = "localhost:3000".to_string();
        let err = RouteTable::compile(&[bad_backend], &defaults).unwrap_err();
        assert!(matches!(err, RouteTableError::InvalidBackend { .. }));
    }

    #[test]
    fn test_summary_keeps_declaration_order() {
        let table = table(vec![
            service("users", vec![route("/users", &["GET", "POST"])]),
            service("orders", vec![route("/orders/:id", &["GET"])]),
        ]);
        let summary = table.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].name, "users");
        assert_eq!(summary[0].base_url, "http://users:3000");
        assert_eq!(summary[0].routes[0].methods, vec!["GET", "POST"]);
        assert_eq!(summary[1].routes[0].path, "/orders/:id");
    }
}
