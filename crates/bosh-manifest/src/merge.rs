//! Field-level merging of partially specified configuration.
//!
//! Instance groups may override parts of the global update policy. Unset fields are then
//! filled from the global block, while everything set on the instance group takes precedence.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// A type that can be merged with itself
///
/// # Example
///
/// ```
/// # use bosh_manifest::merge::Merge;
/// #[derive(Debug, PartialEq, Eq)]
/// struct Foo {
///     bar: Option<bool>,
///     baz: Option<bool>,
/// }
///
/// impl Merge for Foo {
///     fn merge(&mut self, defaults: &Self) {
///         self.bar.merge(&defaults.bar);
///         self.baz.merge(&defaults.baz);
///     }
/// }
///
/// let mut config = Foo {
///     bar: Some(false),
///     baz: None,
/// };
/// config.merge(&Foo {
///     bar: Some(true),
///     baz: Some(true),
/// });
/// assert_eq!(config, Foo {
///     bar: Some(false), // Overridden by `bar: Some(false)` above
///     baz: Some(true), // Fallback is used
/// });
/// ```
pub trait Merge {
    /// Merge with `defaults`, preferring values from `self` if they are set there
    fn merge(&mut self, defaults: &Self);
}

/// A marker trait for types that are merged atomically (as one single value) rather than
/// trying to merge each field individually
pub trait Atomic: Clone {}
impl Atomic for bool {}
impl Atomic for IntOrString {}

impl<T: Atomic> Merge for Option<T> {
    fn merge(&mut self, defaults: &Self) {
        if self.is_none() {
            self.clone_from(defaults);
        }
    }
}
