//! Route context and route templates.
//!
//! Handlers receive a [`RouteContext`] describing the request they serve:
//! the full route, its `/`-separated segments, any variables bound by a
//! template such as `greeting/{name}`, and the stream it arrived on.
//!
//! # Example
//!
//! ```
//! use rsocket_mux::handler::RouteTemplate;
//!
//! let template = RouteTemplate::parse("greeting/{name}").unwrap();
//! let bound = template.matches("greeting/Jeff").unwrap();
//! assert_eq!(bound.get("name").map(String::as_str), Some("Jeff"));
//! assert!(template.matches("greeting/a/b").is_none());
//! ```

use std::collections::HashMap;

use crate::error::{RSocketError, Result};
use crate::stream::InteractionModel;

/// Information about the request a handler is serving.
#[derive(Debug, Clone)]
pub struct RouteContext {
    route: String,
    variables: HashMap<String, String>,
    stream_id: u32,
    model: InteractionModel,
}

impl RouteContext {
    pub fn new(route: impl Into<String>, stream_id: u32, model: InteractionModel) -> Self {
        Self {
            route: route.into(),
            variables: HashMap::new(),
            stream_id,
            model,
        }
    }

    pub(crate) fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    #[inline]
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Route split on `/`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.route.split('/')
    }

    /// Value bound to `{name}` by the matching template.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Interaction model the requester used.
    #[inline]
    pub fn model(&self) -> InteractionModel {
        self.model
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// Route pattern with `{name}` placeholders, each matching one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate {
    pattern: String,
    segments: Vec<Segment>,
}

impl RouteTemplate {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut names = Vec::new();
        let segments = pattern
            .split('/')
            .map(|part| {
                match part
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(name) if !name.is_empty() && !name.contains(&['{', '}'][..]) => {
                        if names.contains(&name) {
                            return Err(RSocketError::Protocol(format!(
                                "variable {{{}}} repeated in {}",
                                name, pattern
                            )));
                        }
                        names.push(name);
                        Ok(Segment::Variable(name.to_string()))
                    }
                    _ if part.contains(&['{', '}'][..]) => Err(RSocketError::Protocol(format!(
                        "malformed segment {:?} in {}",
                        part, pattern
                    ))),
                    _ => Ok(Segment::Literal(part.to_string())),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    /// Whether the pattern has any `{name}` segment.
    pub fn is_template(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Variable(_)))
    }

    #[inline]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Bind variables against `route`, `None` when it doesn't match.
    pub fn matches(&self, route: &str) -> Option<HashMap<String, String>> {
        let mut bound = HashMap::new();
        let mut parts = route.split('/');
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Variable(_) if part.is_empty() => return None,
                Segment::Variable(name) => {
                    bound.insert(name.clone(), part.to_string());
                }
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(bound)
    }
}
