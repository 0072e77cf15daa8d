//! Module registry: stateless operators and component factories.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;

use ailoy_types::{ComponentError, Value};

use crate::component::Component;

/// Boxed future returned by operators and factories.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A stateless VM-registered function.
pub type OperatorFn =
    Arc<dyn Fn(Value) -> BoxFuture<Result<Value, ComponentError>> + Send + Sync>;

/// Constructs a component from its `define` attributes.
pub type ComponentFactory =
    Arc<dyn Fn(Value) -> BoxFuture<Result<Box<dyn Component>, ComponentError>> + Send + Sync>;

/// What one VM serves: operators by name, component factories by type.
///
/// Registration order is preserved so advertised capability lists are
/// stable.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    operators: IndexMap<String, OperatorFn>,
    factories: IndexMap<String, ComponentFactory>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stateless operator from an async closure.
    ///
    /// # Errors
    ///
    /// `already_exists` when the name is taken.
    pub fn register_operator<F, Fut>(&mut self, name: &str, f: F) -> Result<(), ComponentError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ComponentError>> + Send + 'static,
    {
        if self.operators.contains_key(name) {
            return Err(ComponentError::already_exists(format!(
                "operator {name} already registered"
            )));
        }
        self.operators
            .insert(name.to_owned(), Arc::new(move |inputs| Box::pin(f(inputs))));
        Ok(())
    }

    /// Register a component factory for a type name.
    ///
    /// # Errors
    ///
    /// `already_exists` when the type is taken.
    pub fn register_component<F, Fut>(&mut self, type_name: &str, f: F) -> Result<(), ComponentError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Component>, ComponentError>> + Send + 'static,
    {
        if self.factories.contains_key(type_name) {
            return Err(ComponentError::already_exists(format!(
                "component type {type_name} already registered"
            )));
        }
        self.factories
            .insert(type_name.to_owned(), Arc::new(move |attrs| Box::pin(f(attrs))));
        Ok(())
    }

    /// Fold another registry into this one.
    ///
    /// # Errors
    ///
    /// `already_exists` on the first name collision.
    pub fn merge(&mut self, other: ModuleRegistry) -> Result<(), ComponentError> {
        for (name, op) in other.operators {
            if self.operators.contains_key(&name) {
                return Err(ComponentError::already_exists(format!(
                    "operator {name} already registered"
                )));
            }
            self.operators.insert(name, op);
        }
        for (name, factory) in other.factories {
            if self.factories.contains_key(&name) {
                return Err(ComponentError::already_exists(format!(
                    "component type {name} already registered"
                )));
            }
            self.factories.insert(name, factory);
        }
        Ok(())
    }

    /// Look up an operator.
    pub fn operator(&self, name: &str) -> Option<OperatorFn> {
        self.operators.get(name).cloned()
    }

    /// Look up a component factory.
    pub fn factory(&self, type_name: &str) -> Option<ComponentFactory> {
        self.factories.get(type_name).cloned()
    }

    /// Advertised operator names, in registration order.
    pub fn operator_names(&self) -> Vec<String> {
        self.operators.keys().cloned().collect()
    }

    /// Advertised component types, in registration order.
    pub fn component_types(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_operator_rejected() {
        let mut registry = ModuleRegistry::new();
        registry
            .register_operator("echo", |v| async move { Ok(v) })
            .unwrap();
        let err = registry
            .register_operator("echo", |v| async move { Ok(v) })
            .unwrap_err();
        assert_eq!(err.kind, ailoy_types::ErrorKind::AlreadyExists);
    }

    #[test]
    fn names_keep_registration_order() {
        let mut registry = ModuleRegistry::new();
        registry
            .register_operator("zeta", |v| async move { Ok(v) })
            .unwrap();
        registry
            .register_operator("alpha", |v| async move { Ok(v) })
            .unwrap();
        assert_eq!(registry.operator_names(), vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn merge_carries_operators() {
        let mut base = ModuleRegistry::new();
        let mut extra = ModuleRegistry::new();
        extra
            .register_operator("double", |v| async move {
                Ok(Value::Int(v.try_i64()? * 2))
            })
            .unwrap();
        base.merge(extra).unwrap();
        let op = base.operator("double").unwrap();
        assert_eq!(op(Value::Int(4)).await.unwrap(), Value::Int(8));
    }
}
