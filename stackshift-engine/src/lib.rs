// Migration engine for moving Compose stacks and their data between hosts

pub mod archive;
pub mod compose;
pub mod containers;
pub mod error;
pub mod migration;
pub mod remote;
pub mod stats;
pub mod sync;
pub mod target;
pub mod transfer;

pub use compose::{ComposeVolumes, parse_compose_volumes};
pub use containers::verify_containers_stopped;
pub use error::{FilesystemSyncError, MigrationError, Result};
pub use migration::{MigrationManager, MigrationOptions, MigrationReport, MigrationRequest};
pub use remote::{CommandOutput, CommandRunner, ProcessRunner, RemoteExec, ssh_prefix};
pub use stats::parse_rsync_stats;
pub use sync::SyncVerifier;
pub use target::{prepare_target_directories, update_compose_for_migration};
pub use transfer::{TransferCoordinator, TransferOptions};
