//! Assembly of the backup process command line.
//!
//! The transports stage `br-backup-maker` into the target environment and
//! then run it with arguments derived from the backup definition. Keeping the
//! assembly in one place lets every transport share it, and lets tests swap
//! it out for an arbitrary command through [`CommandFactory`].

use crate::{
    definition::BackupDefinition,
    settings::{BACKUP_MAKER_BINARY, GPG_PRIVATE_KEY_PATH, GPG_PUBLIC_KEY_PATH},
};

/// Direction of a scheduled transfer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    pub fn is_backup(self) -> bool {
        matches!(self, Operation::Backup)
    }
}

/// Produces the argv executed in the target environment.
///
/// Transports hold one of these so tests can substitute the real assembly
/// with a fixed command.
pub type CommandFactory =
    fn(&str, &BackupDefinition, Operation, &str, &str) -> Vec<String>;

/// Assemble the argv that runs `br-backup-maker` in the target environment.
///
/// `command` is the adapter-specific shell command whose output is backed up
/// (or which consumes the restored stream); `version` tags the snapshot to
/// restore and is ignored for backups. `bin_path` is where the staged
/// binaries live in the target environment.
pub fn create_backup_maker_command(
    command: &str,
    definition: &BackupDefinition,
    operation: Operation,
    version: &str,
    bin_path: &str,
) -> Vec<String> {
    let encryption = definition.encryption();
    let mut argv = vec![
        format!("{bin_path}/{BACKUP_MAKER_BINARY}"),
        match operation {
            Operation::Backup => "make".to_string(),
            Operation::Restore => "restore".to_string(),
        },
        "--url".to_string(),
        definition.access().url().to_string(),
        "--collection-id".to_string(),
        definition.collection_id().to_string(),
        "--auth-token".to_string(),
        definition.access().token().to_string(),
    ];

    if !encryption.recipient().is_empty() {
        argv.push("--recipient".to_string());
        argv.push(encryption.recipient().to_string());
    }

    match operation {
        Operation::Backup => {
            if !encryption.public_key_path().is_empty() {
                argv.push("--public-key-path".to_string());
                argv.push(GPG_PUBLIC_KEY_PATH.to_string());
            }
        }
        Operation::Restore => {
            if !encryption.private_key_path().is_empty() {
                argv.push("--private-key-path".to_string());
                argv.push(GPG_PRIVATE_KEY_PATH.to_string());
            }
            if !encryption.passphrase().is_empty() {
                argv.push("--passphrase".to_string());
                argv.push(encryption.passphrase().to_string());
            }
            if !version.is_empty() {
                argv.push("--version".to_string());
                argv.push(version.to_string());
            }
        }
    }

    argv.push("--command".to_string());
    argv.push(command.to_string());
    argv
}
