//! Stage execution for packages: the prepare/install/uninstall operations,
//! step transformers, generated-uninstall recording, package archives, and
//! the orchestration of whole install and uninstall queues.

pub mod archive;
mod dispatch;
mod fsops;
mod install;
mod lifecycle;
mod orchestrator;
mod prepare;
mod recorder;
mod session;
mod shell;
mod superuser;
mod transform;
mod uninstall;

pub use install::InstallExecutor;
pub use lifecycle::StageRunner;
pub use orchestrator::{Orchestrator, Outcome, PackageReport};
pub use prepare::{ConsolePrompt, PrepareExecutor, UserPrompt};
pub use recorder::{UninstallOp, UninstallRecorder, UninstallSink};
pub use session::SessionContext;
pub use superuser::{assess_superuser_needs, check_superuser, SudoProbe, SuperuserNeeds};
pub use transform::{TransformerPipeline, COPIES_AS_SYMLINKS};
pub use uninstall::UninstallExecutor;
