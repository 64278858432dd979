//! Error types for module loading and component registration.

use tether_types::TetherError;
use thiserror::Error;

/// Errors raised while loading modules or registering components.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// A runtime error from the communication layer or a component.
    #[error(transparent)]
    Tether(#[from] TetherError),

    /// Module metadata is unusable.
    #[error("Invalid module: {0}")]
    InvalidModule(String),

    /// Component metadata is unusable.
    #[error("Invalid component: {0}")]
    InvalidComponent(String),

    /// Two modules with one name in the same batch.
    #[error("Module with name \"{0}\" is already registered.")]
    DuplicateModule(String),

    /// A component id is already taken.
    #[error("Component name, \"{0}\", has already been registered.")]
    ComponentConflict(String),

    /// A module is already loaded at another version.
    #[error("A different version of module {name}@{loaded} already registered. (Module to register: {name}@{requested}).")]
    VersionConflict {
        name: String,
        loaded: String,
        requested: String,
    },

    /// A declared dependency is neither loaded nor part of the batch.
    #[error("Required dependent module \"{dependency}\" by module \"{module}\" cannot be found.")]
    DependencyNotFound { module: String, dependency: String },

    /// Modules that wait on each other.
    #[error("There are circular references among the following modules: {}", .0.join(", "))]
    CircularDependency(Vec<String>),
}

/// Result alias for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = ModuleError::CircularDependency(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            err.to_string(),
            "There are circular references among the following modules: a, b"
        );

        let err: ModuleError = TetherError::Disposed("ModuleManager".to_string()).into();
        assert_eq!(err.to_string(), "ModuleManager already disposed.");
    }
}
