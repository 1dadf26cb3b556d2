//! Per-identifier override limits.

mod records;
mod resolver;

pub use records::{
    spawn_reloader, Namespace, NamespaceEntry, Override, OverrideEntry, OverrideFile,
    OverrideRecords, OverrideSource,
};
pub use resolver::{EffectiveLimit, LimitSource, OverrideResolver};
