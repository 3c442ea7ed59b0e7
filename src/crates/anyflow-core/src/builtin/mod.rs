//! Builtin operators: thin processors over the core API.
//!
//! These cover the recurring wiring patterns of serving graphs — renaming a
//! slot, injecting a constant, choosing between sources by condition —
//! without copying data: all of them publish through the zero-copy
//! `forward`/reference pathways.

mod alias;
mod const_value;
mod select;

pub use alias::AliasProcessor;
pub use const_value::ConstProcessor;
pub use select::SelectProcessor;
