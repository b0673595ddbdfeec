mod conditions;
mod descriptor;
mod expander;
pub mod names;
mod package;
mod status;
mod store;

pub use conditions::{Condition, ConditionProbe, ConditionStore};
pub use descriptor::{ActionRecord, Descriptor, Stage};
pub use expander::ArgumentExpander;
pub use package::{BackupStore, NullLoader, Package, ResourceLoader};
pub use status::Status;
pub use store::{PackageFactory, PackageStore};
