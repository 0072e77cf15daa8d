//! # ailoy-vm — component-hosting VM
//!
//! A VM attaches to a broker endpoint as a worker, advertising the
//! operators and component types its [`ModuleRegistry`] serves. Packets fan
//! out to per-request tasks; methods on one component are serialized, and
//! iterative methods stream `partial` frames until a `final` or `error`.

#![deny(missing_docs)]

pub mod builtin;
pub mod component;
pub mod module;
pub mod vm;

pub use builtin::builtins;
pub use component::{Component, MethodStream};
pub use module::{ComponentFactory, ModuleRegistry, OperatorFn};
pub use vm::{VmHandle, spawn};
