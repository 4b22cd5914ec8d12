//! Request-scoped tenancy context.
//!
//! Every public engine operation receives a [`Context`] carrying the two
//! coordinates that scope all billing data: the tenant and the app. Values
//! travel under the stable string keys `tenant_id` and `app_id` so that
//! contexts built by any framework layer (or another language writing the
//! same store) stay interoperable; the typed accessors are wrappers over
//! that string-keyed contract.

use std::collections::HashMap;

/// Well-known context key for the tenant identifier.
pub const TENANT_ID_KEY: &str = "tenant_id";

/// Well-known context key for the app identifier.
pub const APP_ID_KEY: &str = "app_id";

/// A request-scoped bag of string values.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<String, String>,
}

impl Context {
    /// An empty context. Operations that need tenancy will refuse it.
    pub fn new() -> Context {
        Context::default()
    }

    /// A context scoped to one `(tenant, app)` pair.
    pub fn for_tenant(tenant_id: &str, app_id: &str) -> Context {
        Context::new().with_value(TENANT_ID_KEY, tenant_id).with_value(APP_ID_KEY, app_id)
    }

    /// Adds an arbitrary string value under `key`.
    pub fn with_value(mut self, key: &str, value: &str) -> Context {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    /// Reads a value by key.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The tenant identifier, if present and non-empty.
    pub fn tenant_id(&self) -> Option<&str> {
        self.value(TENANT_ID_KEY).filter(|v| !v.is_empty())
    }

    /// The app identifier, if present and non-empty.
    pub fn app_id(&self) -> Option<&str> {
        self.value(APP_ID_KEY).filter(|v| !v.is_empty())
    }

    /// Both coordinates at once; `None` unless both are present.
    pub fn tenancy(&self) -> Option<(&str, &str)> {
        Some((self.tenant_id()?, self.app_id()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_read_the_string_keys() {
        let ctx = Context::for_tenant("t1", "a1");
        assert_eq!(ctx.value("tenant_id"), Some("t1"));
        assert_eq!(ctx.value("app_id"), Some("a1"));
        assert_eq!(ctx.tenancy(), Some(("t1", "a1")));
    }

    #[test]
    fn missing_or_empty_values_are_absent() {
        assert_eq!(Context::new().tenancy(), None);
        let partial = Context::new().with_value(TENANT_ID_KEY, "t1");
        assert_eq!(partial.tenancy(), None);
        let empty = Context::for_tenant("", "a1");
        assert_eq!(empty.tenant_id(), None);
    }
}
