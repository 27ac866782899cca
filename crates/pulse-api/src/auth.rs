//! Caller resolution for the streaming endpoint.
//!
//! Authentication itself happens upstream. The server only needs to know who
//! the caller is and which organizations they belong to, which it learns
//! through a [`CallerResolver`].

use std::collections::HashSet;

use async_trait::async_trait;
use axum::http::HeaderMap;
use tracing::debug;

use pulse_core::{Error, Result};

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the caller's organizations, comma separated.
pub const ORGANIZATIONS_HEADER: &str = "x-organization-ids";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub organizations: HashSet<String>,
}

impl CallerIdentity {
    pub fn new<I, S>(user_id: impl Into<String>, organizations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            organizations: organizations.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_member(&self, organization_id: &str) -> bool {
        self.organizations.contains(organization_id)
    }

    /// `Forbidden` unless the caller belongs to the organization.
    pub fn require_member(&self, organization_id: &str) -> Result<()> {
        if self.is_member(organization_id) {
            Ok(())
        } else {
            debug!(
                subsystem = "api",
                component = "auth",
                user_id = %self.user_id,
                org_id = organization_id,
                "Caller is not a member of the organization"
            );
            Err(Error::Forbidden(format!(
                "no access to organization '{}'",
                organization_id
            )))
        }
    }
}

/// Resolves the caller of a request. Fails with `Unauthorized` when the
/// request carries no valid identity.
#[async_trait]
pub trait CallerResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Result<CallerIdentity>;
}

/// Trusts identity headers set by an authenticating reverse proxy.
///
/// Only deploy behind a proxy that strips these headers from client requests.
#[derive(Debug, Clone, Default)]
pub struct GatewayHeaderResolver;

impl GatewayHeaderResolver {
    pub fn new() -> Self {
        Self
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl CallerResolver for GatewayHeaderResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<CallerIdentity> {
        let user_id = header_str(headers, USER_ID_HEADER)
            .ok_or_else(|| Error::Unauthorized("missing caller identity".to_string()))?;

        let organizations = header_str(headers, ORGANIZATIONS_HEADER)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|org| !org.is_empty())
                    .map(str::to_string)
                    .collect::<HashSet<_>>()
            })
            .unwrap_or_default();

        Ok(CallerIdentity {
            user_id: user_id.to_string(),
            organizations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[tokio::test]
    async fn test_gateway_headers_resolve() {
        let caller = GatewayHeaderResolver::new()
            .resolve(&headers(&[
                (USER_ID_HEADER, "user-7"),
                (ORGANIZATIONS_HEADER, "org-1, org-2,,"),
            ]))
            .await
            .unwrap();
        assert_eq!(caller.user_id, "user-7");
        assert!(caller.is_member("org-1"));
        assert!(caller.is_member("org-2"));
        assert_eq!(caller.organizations.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthorized() {
        let result = GatewayHeaderResolver::new()
            .resolve(&headers(&[(ORGANIZATIONS_HEADER, "org-1")]))
            .await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_require_member() {
        let caller = CallerIdentity::new("u", ["org-1"]);
        assert!(caller.require_member("org-1").is_ok());
        assert!(matches!(
            caller.require_member("org-2"),
            Err(Error::Forbidden(_))
        ));
    }
}
