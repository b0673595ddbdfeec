mod discovery;
mod sources;
mod user_state;

pub use discovery::{discover_packages, DiscoveredPackage};
pub use sources::{source_list_path, SourceEntry, SourceList, SourceMap, SOURCE_LIST_FILE};
pub use user_state::{UserState, LOCK_FILE, STATE_FILE};
