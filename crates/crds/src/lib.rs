//! Sample Controller CRD Definitions
//!
//! Kubernetes Custom Resource Definitions reconciled by the Foo controller.

pub mod foo;

pub use foo::*;
