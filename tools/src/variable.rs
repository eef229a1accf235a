//! `@[var:<name>]` handler.

use std::time::Duration;

use fenceref_types::{PersistentVariable, Reference, ReferenceKind, ResolveError};

use crate::{HandlerFut, ReferenceHandler, Resolved, Snapshot, fingerprint_of};

#[derive(Debug, Clone)]
pub struct VariableHandler {
    ttl: Duration,
}

impl VariableHandler {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl ReferenceHandler for VariableHandler {
    fn kind(&self) -> ReferenceKind {
        ReferenceKind::Variable
    }

    fn validate(&self, reference: &Reference, _snapshot: &Snapshot) -> Result<(), ResolveError> {
        let name = reference.value.trim();
        if PersistentVariable::is_valid_name(name) {
            Ok(())
        } else {
            Err(ResolveError::validation(format!(
                "'{name}' is not a valid variable name"
            )))
        }
    }

    /// Hash of the current value, so an edited variable misses the cache.
    fn fingerprint(&self, reference: &Reference, snapshot: &Snapshot) -> Result<String, ResolveError> {
        self.validate(reference, snapshot)?;
        let name = reference.value.trim();
        let value = snapshot.variables.get(name).ok_or_else(|| ResolveError::NotFound {
            what: "variable",
            name: name.to_string(),
        })?;
        Ok(fingerprint_of([name, value.as_str()]))
    }

    fn resolve<'a>(&'a self, reference: &'a Reference, snapshot: &'a Snapshot) -> HandlerFut<'a> {
        Box::pin(async move {
            let name = reference.value.trim();
            snapshot
                .variables
                .get(name)
                .map(|value| Resolved::text(value, "text/plain"))
                .ok_or_else(|| ResolveError::NotFound {
                    what: "variable",
                    name: name.to_string(),
                })
        })
    }

    fn cache_ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use fenceref_types::ErrorKind;

    fn snapshot() -> Snapshot {
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), "World".to_string());
        Snapshot::default().with_variables(Arc::new(vars))
    }

    fn var_ref(name: &str) -> Reference {
        Reference::new(ReferenceKind::Variable, format!("@[var:{name}]"), name)
    }

    #[tokio::test]
    async fn resolves_known_variable() {
        let handler = VariableHandler::new(Duration::from_secs(60));
        let resolved = handler.resolve(&var_ref(" name "), &snapshot()).await.unwrap();
        assert_eq!(resolved.content, "World");
    }

    #[tokio::test]
    async fn unknown_variable_is_not_found() {
        let handler = VariableHandler::new(Duration::from_secs(60));
        let err = handler.resolve(&var_ref("missing"), &snapshot()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "variable not found: missing");
    }

    #[test]
    fn invalid_names_fail_validation() {
        let handler = VariableHandler::new(Duration::from_secs(60));
        assert!(handler.validate(&var_ref("ok_name"), &snapshot()).is_ok());
        let err = handler.validate(&var_ref("bad-name"), &snapshot()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn fingerprint_follows_the_value() {
        let handler = VariableHandler::new(Duration::from_secs(60));
        let before = handler.fingerprint(&var_ref("name"), &snapshot()).unwrap();

        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), "Bob".to_string());
        let changed = Snapshot::default().with_variables(Arc::new(vars));
        assert_ne!(before, handler.fingerprint(&var_ref("name"), &changed).unwrap());

        let err = handler
            .fingerprint(&var_ref("name"), &Snapshot::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
