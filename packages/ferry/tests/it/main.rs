use ferry::definition::{BackupDefinition, Encryption, ServerAccess};

pub mod fs;
pub mod shell;

/// An example filesystem-backup definition, close to what the configuration
/// loader would produce.
pub fn example_definition() -> BackupDefinition {
    BackupDefinition::new(
        "fs",
        ServerAccess::new("http://localhost:8080", "test"),
        "1111-2222-3333-4444",
        Encryption::new("riotkit", "test@riotkit.org", "", ""),
    )
}
