//! Policy authorization: route, scope, model, and tool checks.
//!
//! Runs after identity resolution and before any enforcement that costs
//! money. Admins skip route, scope, and model checks; tool allow-lists are
//! enforced for everyone, because a tool restriction on a key or team is a
//! blast-radius control, not a privilege tier.

use crate::auth::principal::Principal;
use crate::auth::tools::extract_tool_names;
use crate::auth::Role;
use crate::errors::{DenyReason, Error, Result};
use serde_json::Value;

/// One ordered routing rule. The first rule whose pattern matches the
/// request route decides; later rules are not consulted.
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// Exact route, or a prefix with a trailing `*`
    pub pattern: String,
    /// Roles admitted by this rule. Empty admits any authenticated caller.
    pub roles: Vec<Role>,
    /// Scope additionally required by this rule
    pub required_scope: Option<String>,
}

impl RouteRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            roles: Vec::new(),
            required_scope: None,
        }
    }

    pub fn roles(mut self, roles: Vec<Role>) -> Self {
        self.roles = roles;
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scope = Some(scope.into());
        self
    }
}

/// Everything the authorizer needs to know about one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestDescriptor<'a> {
    pub route: &'a str,
    pub model: Option<&'a str>,
    pub body: Option<&'a Value>,
}

/// Exact match, or prefix match when the pattern has a trailing `*`.
fn pattern_matches(pattern: &str, target: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => target.starts_with(prefix),
        None => pattern == target,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    rules: Vec<RouteRule>,
    /// Admit routes no rule matches. Off by default.
    default_allow: bool,
}

impl Authorizer {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self {
            rules,
            default_allow: false,
        }
    }

    pub fn with_default_allow(mut self) -> Self {
        self.default_allow = true;
        self
    }

    /// Apply the full policy. Returns the first failing check as a
    /// [`DenyReason`]-coded error.
    pub fn authorize(&self, principal: &Principal, request: &RequestDescriptor<'_>) -> Result<()> {
        if !principal.is_admin() {
            self.check_route(principal, request.route)?;
            self.check_model(principal, request.model)?;
        }
        // Always, admins included
        self.check_tools(principal, request.body)?;
        Ok(())
    }

    fn check_route(&self, principal: &Principal, route: &str) -> Result<()> {
        let Some(rule) = self.rules.iter().find(|r| pattern_matches(&r.pattern, route)) else {
            if self.default_allow {
                return Ok(());
            }
            return Err(Error::PermissionDenied {
                reason: DenyReason::RouteAccessDenied,
                detail: format!("no policy admits route {route}"),
            });
        };

        if !rule.roles.is_empty() && !rule.roles.iter().any(|r| principal.has_role(*r)) {
            return Err(Error::PermissionDenied {
                reason: DenyReason::RouteAccessDenied,
                detail: format!("caller roles do not admit route {route}"),
            });
        }

        if let Some(scope) = &rule.required_scope {
            if !principal.has_scope(scope) {
                return Err(Error::PermissionDenied {
                    reason: DenyReason::ScopeAccessDenied,
                    detail: format!("route {route} requires scope {scope}"),
                });
            }
        }

        Ok(())
    }

    fn check_model(&self, principal: &Principal, model: Option<&str>) -> Result<()> {
        let (Some(allowed), Some(model)) = (&principal.allowed_models, model) else {
            return Ok(());
        };
        if allowed.iter().any(|p| pattern_matches(p, model)) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                reason: DenyReason::ModelAccessDenied,
                detail: format!("model {model} is not on this key's allow-list"),
            })
        }
    }

    fn check_tools(&self, principal: &Principal, body: Option<&Value>) -> Result<()> {
        let Some(body) = body else { return Ok(()) };
        let requested = extract_tool_names(body);
        if requested.is_empty() {
            return Ok(());
        }

        // A tool must pass every allow-list that exists on the ancestry.
        for (list, level) in [
            (principal.key_allowed_tools.as_ref(), "key"),
            (principal.team_allowed_tools.as_ref(), "team"),
        ] {
            let Some(allowed) = list else { continue };
            if let Some(denied) = requested.iter().find(|t| !allowed.contains(t)) {
                return Err(Error::PermissionDenied {
                    reason: DenyReason::ToolAccessDenied,
                    detail: format!("tool {denied} is not on the {level} allow-list"),
                });
            }
        }
        Ok(())
    }
}
