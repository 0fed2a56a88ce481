//! Transport-agnostic leaves shared by the aggregating MCP proxy: the tag
//! query engine (L1), the template expander (L2), the bounded parallel
//! executor (L4), and the closed error taxonomy (§7).

pub mod error;
pub mod parallel;
pub mod tagquery;
pub mod template;

pub use error::ProxyError;
pub use parallel::{BatchAccumulator, BatchResult, ItemOutcome, run_bounded};
pub use tagquery::{TagFilter, TagQueryError, TagSelector};
pub use template::{ContextData, ExpansionResult, TemplateError, VariableBinding, expand};
