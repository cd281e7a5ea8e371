use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

/// A single backend route. Immutable for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    /// Leading-slash path prefix matched byte-exactly against request paths.
    pub path_prefix: String,
    /// Absolute base URL of the backend, no trailing slash.
    pub target: String,
    /// Whether to remove `path_prefix` before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
    /// Total per-request forward budget, including dial and body transfer.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RoutesFile {
    routes: Vec<Route>,
}

/// Ordered route table with longest-first semantics left to file order:
/// the first prefix match wins.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Build a table from already-decoded routes, validating each entry.
    pub fn new(mut routes: Vec<Route>) -> Result<Self> {
        if routes.is_empty() {
            bail!("route table is empty");
        }
        for route in &mut routes {
            if route.path_prefix.is_empty() || !route.path_prefix.starts_with('/') {
                bail!(
                    "route prefix {:?} must be non-empty and start with '/'",
                    route.path_prefix
                );
            }
            if route.target.is_empty() {
                bail!("route {:?} has an empty target", route.path_prefix);
            }
            while route.target.ends_with('/') {
                route.target.pop();
            }
            if route.timeout.is_zero() {
                bail!("route {:?} has a zero timeout", route.path_prefix);
            }
        }
        Ok(Self { routes })
    }

    /// Load the route table from a YAML file of shape
    /// `{routes: [{path_prefix, target, strip_prefix, timeout}]}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read routes file {}", path.display()))?;
        let file: RoutesFile = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse routes file {}", path.display()))?;
        Self::new(file.routes)
    }

    /// First route whose prefix matches the request path. No normalization
    /// is applied; comparison is byte-exact on leading characters.
    pub fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| path.starts_with(&r.path_prefix))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Build the outbound URL for a matched route:
/// `/service-a/users` + strip -> `http://service-a:6000/users`.
/// An empty remainder after stripping becomes `/`; the raw query is appended
/// unchanged.
pub fn build_target_url(route: &Route, path: &str, query: Option<&str>) -> String {
    let mut target_path = path;
    if route.strip_prefix {
        target_path = path.strip_prefix(route.path_prefix.as_str()).unwrap_or(path);
        if target_path.is_empty() {
            target_path = "/";
        }
    }
    match query {
        Some(q) if !q.is_empty() => format!("{}{}?{}", route.target, target_path, q),
        _ => format!("{}{}", route.target, target_path),
    }
}

/// Parse a human duration such as "250ms", "5s", "2m" or "1h".
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("duration {:?} is missing a unit", s))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .with_context(|| format!("duration {:?} has an invalid number", s))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => bail!("duration {:?} has unknown unit {:?}", s, unit),
    };
    Ok(duration)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}
