mod backup;
mod connection;
mod daemon;
mod jobs;
mod schedule;

// Backup commands
pub use backup::{
    run_backup, run_backup_stats, run_delete_backup, run_list_backups, run_verify_backup,
};

// Connection and status commands
pub use connection::{run_status, run_test_connection};

// Daemon
pub use daemon::run_daemon;

// Job ledger commands
pub use jobs::handle_jobs_command;

// Schedule commands
pub use schedule::handle_schedule_command;
