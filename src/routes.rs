//! URI template routing for the federation endpoints.
//!
//! Templates use the RFC 6570 Level 4 subset the protocol surface needs:
//! literal segments plus `{var}`, `{+var}`, `{/var}`, `{?var,…}` and
//! `{#var}` expressions, with `*` explode and `:N` prefix modifiers.
//! The router is a pure data structure: [`Router::add`] registers a named
//! template, [`Router::route`] matches an incoming path and binds variables,
//! and [`Router::build`] renders a path back from a route name and values.

use std::collections::{BTreeSet, HashMap};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use thiserror::Error;

/// Everything outside RFC 3986 `unreserved` is escaped in simple expansion.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Reserved expansion (`{+var}`, `{#var}`) lets reserved characters through.
const RESERVED_PASSTHROUGH: &AsciiSet = &UNRESERVED
    .remove(b':')
    .remove(b'/')
    .remove(b'?')
    .remove(b'#')
    .remove(b'[')
    .remove(b']')
    .remove(b'@')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=');

/// Errors raised by router operations.
///
/// All variants are returned synchronously; the router performs no I/O.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The template does not begin with `/`.
    #[error("route template must begin with a slash: {template:?}")]
    MissingLeadingSlash {
        /// The offending template.
        template: String,
    },

    /// The template failed to parse.
    #[error("malformed route template {template:?}: {reason}")]
    MalformedTemplate {
        /// The offending template.
        template: String,
        /// What the parser objected to.
        reason: String,
    },

    /// `build` was called with a route name that was never registered.
    #[error("unknown route name: {name}")]
    UnknownRoute {
        /// The unregistered name.
        name: String,
    },

    /// `build` was called without a value for a required variable.
    #[error("route {name} requires variable {variable}")]
    MissingVariable {
        /// The route being built.
        name: String,
        /// The variable with no value.
        variable: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Slash,
    Query,
    Fragment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VarSpec {
    name: String,
    explode: bool,
    prefix: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expr { op: Operator, specs: Vec<VarSpec> },
}

#[derive(Debug, Clone)]
struct CompiledTemplate {
    raw: String,
    parts: Vec<Part>,
    variables: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Route {
    name: String,
    template: CompiledTemplate,
}

/// A successful path match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Name the template was registered under.
    pub name: String,
    /// The registered template string.
    pub template: String,
    /// Variables bound by the match, percent-decoded.
    pub variables: HashMap<String, String>,
}

/// Named URI template router.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
    trailing_slash_insensitive: bool,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty router that treats `/users/alice` and
    /// `/users/alice/` as the same path.
    ///
    /// Both registered templates and incoming paths are normalized by
    /// appending a trailing slash before matching and building.
    #[must_use]
    pub fn trailing_slash_insensitive() -> Self {
        Self {
            routes: Vec::new(),
            trailing_slash_insensitive: true,
        }
    }

    /// Registers `template` under `name`, returning the set of variable
    /// names the template binds.
    ///
    /// Adding a route with an existing name replaces its template.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::MissingLeadingSlash`] when the template does
    /// not begin with `/`, and [`RouterError::MalformedTemplate`] when it
    /// does not parse.
    pub fn add(&mut self, template: &str, name: &str) -> Result<BTreeSet<String>, RouterError> {
        if !template.starts_with('/') {
            return Err(RouterError::MissingLeadingSlash {
                template: template.to_owned(),
            });
        }
        let normalized = self.normalize_template(template);
        let compiled = parse_template(&normalized)?;
        let variables = compiled.variables.clone();
        let route = Route {
            name: name.to_owned(),
            template: compiled,
        };
        match self.routes.iter_mut().find(|r| r.name == name) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
        Ok(variables)
    }

    /// Whether a route is registered under `name`.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.routes.iter().any(|r| r.name == name)
    }

    /// Matches `path` against the registered templates in registration
    /// order, returning the first match.
    #[must_use]
    pub fn route(&self, path: &str) -> Option<RouteMatch> {
        let path = self.normalize_path(path);
        for route in &self.routes {
            let mut variables = HashMap::new();
            if match_parts(&route.template.parts, &path, &mut variables) {
                return Some(RouteMatch {
                    name: route.name.clone(),
                    template: route.template.raw.clone(),
                    variables,
                });
            }
        }
        None
    }

    /// Renders the path for the route registered under `name` with the
    /// given variable values.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownRoute`] for an unregistered name and
    /// [`RouterError::MissingVariable`] when a required variable has no
    /// value.
    pub fn build(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String, RouterError> {
        let route = self
            .routes
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| RouterError::UnknownRoute {
                name: name.to_owned(),
            })?;
        expand_parts(&route.template.parts, name, variables)
    }

    fn normalize_template(&self, template: &str) -> String {
        if self.trailing_slash_insensitive && !template.ends_with('/') {
            format!("{template}/")
        } else {
            template.to_owned()
        }
    }

    fn normalize_path(&self, path: &str) -> String {
        if self.trailing_slash_insensitive && !path.ends_with('/') {
            format!("{path}/")
        } else {
            path.to_owned()
        }
    }
}

fn malformed(template: &str, reason: impl Into<String>) -> RouterError {
    RouterError::MalformedTemplate {
        template: template.to_owned(),
        reason: reason.into(),
    }
}

fn parse_template(raw: &str) -> Result<CompiledTemplate, RouterError> {
    let mut parts = Vec::new();
    let mut variables = BTreeSet::new();
    let mut literal = String::new();
    let mut rest = raw;

    while let Some(open) = rest.find('{') {
        literal.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let close = after_open
            .find('}')
            .ok_or_else(|| malformed(raw, "unterminated expression"))?;
        let body = &after_open[..close];
        if body.contains('{') {
            return Err(malformed(raw, "nested expression"));
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(std::mem::take(&mut literal)));
        }
        let expr = parse_expression(raw, body)?;
        for spec in match &expr {
            Part::Expr { specs, .. } => specs,
            Part::Literal(_) => unreachable!(),
        } {
            variables.insert(spec.name.clone());
        }
        parts.push(expr);
        rest = &after_open[close + 1..];
    }
    if rest.contains('}') {
        return Err(malformed(raw, "unmatched closing brace"));
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }

    Ok(CompiledTemplate {
        raw: raw.to_owned(),
        parts,
        variables,
    })
}

fn parse_expression(raw: &str, body: &str) -> Result<Part, RouterError> {
    if body.is_empty() {
        return Err(malformed(raw, "empty expression"));
    }
    let (op, spec_list) = match body.as_bytes()[0] {
        b'+' => (Operator::Reserved, &body[1..]),
        b'/' => (Operator::Slash, &body[1..]),
        b'?' => (Operator::Query, &body[1..]),
        b'#' => (Operator::Fragment, &body[1..]),
        b'.' | b';' | b'&' | b'=' | b',' | b'!' | b'@' | b'|' => {
            return Err(malformed(
                raw,
                format!("unsupported operator {:?}", &body[..1]),
            ));
        }
        _ => (Operator::Simple, body),
    };
    if spec_list.is_empty() {
        return Err(malformed(raw, "expression lists no variables"));
    }
    let mut specs = Vec::new();
    for piece in spec_list.split(',') {
        specs.push(parse_varspec(raw, piece)?);
    }
    Ok(Part::Expr { op, specs })
}

fn parse_varspec(raw: &str, piece: &str) -> Result<VarSpec, RouterError> {
    let (name_part, explode, prefix) = if let Some(stripped) = piece.strip_suffix('*') {
        (stripped, true, None)
    } else if let Some((name, digits)) = piece.split_once(':') {
        let n: usize = digits
            .parse()
            .map_err(|_| malformed(raw, format!("bad prefix length in {piece:?}")))?;
        if n == 0 || n > 10_000 {
            return Err(malformed(raw, format!("prefix length out of range in {piece:?}")));
        }
        (name, false, Some(n))
    } else {
        (piece, false, None)
    };
    if name_part.is_empty()
        || !name_part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(malformed(raw, format!("bad variable name {piece:?}")));
    }
    Ok(VarSpec {
        name: name_part.to_owned(),
        explode,
        prefix,
    })
}

/// Matches `path` against `parts`, binding variables into `bound`.
///
/// Expressions are greedy up to the next literal: when several positions for
/// the following literal exist, the rightmost admissible one is tried first,
/// backtracking leftward on failure.
fn match_parts(parts: &[Part], path: &str, bound: &mut HashMap<String, String>) -> bool {
    let Some(part) = parts.first() else {
        return path.is_empty();
    };
    match part {
        Part::Literal(lit) => path
            .strip_prefix(lit.as_str())
            .is_some_and(|rest| match_parts(&parts[1..], rest, bound)),
        Part::Expr { op, specs } => match op {
            // Query and fragment expansions never appear in a request path.
            Operator::Query | Operator::Fragment => match_parts(&parts[1..], path, bound),
            Operator::Simple => match_value_expr(parts, path, specs, false, b',', bound),
            Operator::Reserved => match_value_expr(parts, path, specs, true, b',', bound),
            Operator::Slash => {
                let Some(rest) = path.strip_prefix('/') else {
                    return false;
                };
                let crosses = specs.len() > 1 || specs.iter().any(|s| s.explode);
                match_value_expr(parts, rest, specs, crosses, b'/', bound)
            }
        },
    }
}

fn match_value_expr(
    parts: &[Part],
    path: &str,
    specs: &[VarSpec],
    crosses_segments: bool,
    separator: u8,
    bound: &mut HashMap<String, String>,
) -> bool {
    let segment_end = if crosses_segments {
        path.len()
    } else {
        path.find('/').unwrap_or(path.len())
    };

    // Candidate end positions for the region this expression consumes,
    // rightmost (greedy) first.
    let candidates: Vec<usize> = match parts.get(1) {
        Some(Part::Literal(lit)) => path
            .match_indices(lit.as_str())
            .map(|(idx, _)| idx)
            .filter(|idx| *idx <= segment_end)
            .collect(),
        _ => vec![segment_end],
    };

    for end in candidates.into_iter().rev() {
        let region = &path[..end];
        let mut trial = bound.clone();
        if bind_region(region, specs, separator, &mut trial)
            && match_parts(&parts[1..], &path[end..], &mut trial)
        {
            *bound = trial;
            return true;
        }
    }
    false
}

fn bind_region(
    region: &str,
    specs: &[VarSpec],
    separator: u8,
    bound: &mut HashMap<String, String>,
) -> bool {
    if region.is_empty() {
        return false;
    }
    let values: Vec<&str> = if specs.len() == 1 {
        vec![region]
    } else {
        region.split(separator as char).collect()
    };
    if values.len() != specs.len() {
        return false;
    }
    for (spec, value) in specs.iter().zip(values) {
        if value.is_empty() {
            return false;
        }
        let Ok(decoded) = percent_decode_str(value).decode_utf8() else {
            return false;
        };
        bound.insert(spec.name.clone(), decoded.into_owned());
    }
    true
}

fn expand_parts(
    parts: &[Part],
    route_name: &str,
    variables: &HashMap<String, String>,
) -> Result<String, RouterError> {
    let mut out = String::new();
    for part in parts {
        match part {
            Part::Literal(lit) => out.push_str(lit),
            Part::Expr { op, specs } => {
                let mut rendered = Vec::with_capacity(specs.len());
                for spec in specs {
                    let value = variables.get(&spec.name).ok_or_else(|| {
                        RouterError::MissingVariable {
                            name: route_name.to_owned(),
                            variable: spec.name.clone(),
                        }
                    })?;
                    let truncated = match spec.prefix {
                        Some(n) => value.chars().take(n).collect::<String>(),
                        None => value.clone(),
                    };
                    rendered.push((spec, truncated));
                }
                match op {
                    Operator::Simple => {
                        let joined = rendered
                            .iter()
                            .map(|(_, v)| utf8_percent_encode(v, UNRESERVED).to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        out.push_str(&joined);
                    }
                    Operator::Reserved => {
                        let joined = rendered
                            .iter()
                            .map(|(_, v)| utf8_percent_encode(v, RESERVED_PASSTHROUGH).to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        out.push_str(&joined);
                    }
                    Operator::Slash => {
                        for (spec, value) in &rendered {
                            out.push('/');
                            let set = if spec.explode {
                                RESERVED_PASSTHROUGH
                            } else {
                                UNRESERVED
                            };
                            out.push_str(&utf8_percent_encode(value, set).to_string());
                        }
                    }
                    Operator::Query => {
                        for (i, (spec, value)) in rendered.iter().enumerate() {
                            out.push(if i == 0 { '?' } else { '&' });
                            out.push_str(&spec.name);
                            out.push('=');
                            out.push_str(&utf8_percent_encode(value, UNRESERVED).to_string());
                        }
                    }
                    Operator::Fragment => {
                        out.push('#');
                        let joined = rendered
                            .iter()
                            .map(|(_, v)| utf8_percent_encode(v, RESERVED_PASSTHROUGH).to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        out.push_str(&joined);
                    }
                }
            }
        }
    }
    Ok(out)
}
