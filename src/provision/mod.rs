//! Secret resolution and file provisioning for sandboxes.
//!
//! Both halves attempt every declared item and return the failures alongside
//! the successes, so a user sees every problem in one pass.

mod files;
mod secrets;

pub use files::provision_files;
pub use secrets::{
    generate_secrets_file, resolve_all_secrets, resolve_secret, SecretRef, SecretResolver,
    SecretSource, VaultCli, SECRETS_FILE,
};

use thiserror::Error;

/// A provisioning failure carrying a user-actionable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// A secret reference could not be resolved.
    #[error("{message}")]
    SecretResolution {
        var_name: String,
        reference: String,
        message: String,
    },

    /// A declared file could not be copied into the worktree.
    #[error("{message}")]
    FileProvision {
        destination: String,
        source_path: String,
        message: String,
    },
}

impl ProvisioningError {
    /// The remediation message shown to the user.
    pub fn message(&self) -> &str {
        match self {
            ProvisioningError::SecretResolution { message, .. }
            | ProvisioningError::FileProvision { message, .. } => message,
        }
    }
}
