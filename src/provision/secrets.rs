//! Secret resolution for sandbox env files.
//!
//! A reference is one of three shapes, classified by prefix:
//! - `op://vault/item/field` is read through the 1Password CLI
//! - `$NAME` is read from the host environment
//! - anything else is a literal value

use std::collections::BTreeMap;
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::error::Result;

use super::ProvisioningError;

/// File name of the generated secrets env file inside a slot directory.
pub const SECRETS_FILE: &str = ".env.secrets";

const VAULT_PREFIX: &str = "op://";
const ENV_SIGIL: char = '$';

/// Where a secret value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SecretSource {
    /// Used as-is.
    Literal(String),
    /// Read from a host environment variable (name without the sigil).
    EnvVar(String),
    /// Read through the vault CLI.
    Vault(String),
}

impl SecretSource {
    /// Classifies a raw reference string by its prefix.
    pub fn classify(reference: &str) -> Self {
        if reference.starts_with(VAULT_PREFIX) {
            SecretSource::Vault(reference.to_string())
        } else if let Some(name) = reference.strip_prefix(ENV_SIGIL) {
            SecretSource::EnvVar(name.to_string())
        } else {
            SecretSource::Literal(reference.to_string())
        }
    }
}

/// A declared secret: the variable it populates and where it comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    /// Name of the variable written to the secrets file.
    pub name: String,
    /// The reference as written in the config.
    pub reference: String,
    pub source: SecretSource,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, reference: impl Into<String>) -> Self {
        let reference = reference.into();
        Self {
            name: name.into(),
            source: SecretSource::classify(&reference),
            reference,
        }
    }

    fn error(&self, message: String) -> ProvisioningError {
        ProvisioningError::SecretResolution {
            var_name: self.name.clone(),
            reference: self.reference.clone(),
            message,
        }
    }
}

/// The 1Password CLI, invoked once per secret.
#[derive(Debug, Clone)]
pub struct VaultCli {
    cli_path: String,
    timeout: Duration,
}

impl Default for VaultCli {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultCli {
    /// Uses the `op` command from PATH.
    pub fn new() -> Self {
        Self {
            cli_path: "op".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Uses a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            ..Self::new()
        }
    }

    /// Sets the per-read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns true if the CLI can be found.
    pub fn is_available(&self) -> bool {
        which::which(&self.cli_path).is_ok()
    }

    async fn read(
        &self,
        secret: &SecretRef,
        reference: &str,
    ) -> std::result::Result<String, ProvisioningError> {
        if !self.is_available() {
            return Err(secret.error(format!(
                "{}: 1Password CLI (op) not found. Install: brew install 1password-cli, \
                 or use $VAR references instead.",
                secret.name
            )));
        }

        tracing::debug!(var = %secret.name, cli = %self.cli_path, "reading secret from vault");

        let output = Command::new(&self.cli_path)
            .args(["read", "--no-newline", reference])
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(secret.error(format!(
                    "{}: failed to run 1Password CLI: {}",
                    secret.name, e
                )))
            }
            Err(_) => {
                return Err(secret.error(format!(
                    "{}: 1Password CLI timed out. Try: eval $(op signin)",
                    secret.name
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("sign") || stderr.contains("auth") {
                return Err(secret.error(format!(
                    "{}: 1Password not authenticated. Run: eval $(op signin)",
                    secret.name
                )));
            }
            return Err(secret.error(format!(
                "{}: secret not found in 1Password: {}. Check the reference in infra.toml.",
                secret.name, reference
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Resolves secret references to values.
#[derive(Debug, Clone, Default)]
pub struct SecretResolver {
    vault: VaultCli,
}

impl SecretResolver {
    /// Creates a resolver using the given vault CLI.
    pub fn new(vault: VaultCli) -> Self {
        Self { vault }
    }

    /// Resolves a single secret.
    pub async fn resolve(
        &self,
        secret: &SecretRef,
    ) -> std::result::Result<String, ProvisioningError> {
        match &secret.source {
            SecretSource::Literal(value) => Ok(value.clone()),
            SecretSource::EnvVar(name) => env::var(name).map_err(|_| {
                secret.error(format!(
                    "{}: environment variable {} not set. Export it or change to a \
                     different source in infra.toml.",
                    secret.name, name
                ))
            }),
            SecretSource::Vault(reference) => self.vault.read(secret, reference).await,
        }
    }

    /// Resolves every declared secret without stopping at the first failure.
    pub async fn resolve_all(
        &self,
        secrets: &BTreeMap<String, String>,
    ) -> (BTreeMap<String, String>, Vec<ProvisioningError>) {
        let mut resolved = BTreeMap::new();
        let mut errors = Vec::new();

        for (name, reference) in secrets {
            let secret = SecretRef::new(name, reference);
            match self.resolve(&secret).await {
                Ok(value) => {
                    resolved.insert(name.clone(), value);
                }
                Err(e) => errors.push(e),
            }
        }

        tracing::debug!(
            resolved = resolved.len(),
            failed = errors.len(),
            "resolved secrets"
        );
        (resolved, errors)
    }
}

/// Resolves one reference with the default vault CLI.
pub async fn resolve_secret(
    var_name: &str,
    reference: &str,
) -> std::result::Result<String, ProvisioningError> {
    SecretResolver::default()
        .resolve(&SecretRef::new(var_name, reference))
        .await
}

/// Resolves every reference with the default vault CLI.
pub async fn resolve_all_secrets(
    secrets: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, Vec<ProvisioningError>) {
    SecretResolver::default().resolve_all(secrets).await
}

/// Writes resolved secrets to `<slot_dir>/.env.secrets` as sorted `KEY=VALUE` lines.
///
/// Fails without writing if any key or value contains a newline, carriage
/// return or null byte. On unix the file is owner-only (0600) before any
/// content is written.
pub fn generate_secrets_file(
    resolved: &BTreeMap<String, String>,
    slot_dir: &Path,
) -> Result<PathBuf> {
    let content =
        crate::dotenv::render(resolved.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    let path = slot_dir.join(SECRETS_FILE);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path)?;

    // `mode` only applies on creation; tighten a file left by an older run.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[cfg(unix)]
    fn fake_op(dir: &Path, script: &str) -> VaultCli {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("op");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        VaultCli::with_cli_path(path.to_string_lossy())
    }

    fn resolver_without_vault() -> SecretResolver {
        SecretResolver::new(VaultCli::with_cli_path("/nonexistent/bin/op"))
    }

    #[test]
    fn classify_dispatches_on_prefix() {
        assert_eq!(
            SecretSource::classify("op://dev/db/password"),
            SecretSource::Vault("op://dev/db/password".to_string())
        );
        assert_eq!(
            SecretSource::classify("$HOME_TOKEN"),
            SecretSource::EnvVar("HOME_TOKEN".to_string())
        );
        assert_eq!(
            SecretSource::classify("plain-value"),
            SecretSource::Literal("plain-value".to_string())
        );
        assert_eq!(SecretSource::classify(""), SecretSource::Literal(String::new()));
    }

    #[tokio::test]
    async fn literal_is_returned_unchanged() {
        let value = resolver_without_vault()
            .resolve(&SecretRef::new("MODE", "dev"))
            .await
            .unwrap();
        assert_eq!(value, "dev");
    }

    #[tokio::test]
    async fn env_reference_reads_environment() {
        env::set_var("KINFRA_TEST_SECRET_PRESENT", "env-secret-value");

        let value = resolve_secret("MY_SECRET", "$KINFRA_TEST_SECRET_PRESENT")
            .await
            .unwrap();
        assert_eq!(value, "env-secret-value");

        env::remove_var("KINFRA_TEST_SECRET_PRESENT");
    }

    #[tokio::test]
    async fn unset_env_reference_names_the_variable() {
        let err = resolve_secret("API_KEY", "$KINFRA_DEFINITELY_NOT_SET_12345")
            .await
            .unwrap_err();

        match &err {
            ProvisioningError::SecretResolution { var_name, reference, .. } => {
                assert_eq!(var_name, "API_KEY");
                assert_eq!(reference, "$KINFRA_DEFINITELY_NOT_SET_12345");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.message().contains("Export it"));
    }

    #[tokio::test]
    async fn missing_vault_cli_is_reported() {
        let err = resolver_without_vault()
            .resolve(&SecretRef::new("DB_PASSWORD", "op://dev/db/password"))
            .await
            .unwrap_err();
        assert!(err.message().contains("not found. Install"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn vault_success_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SecretResolver::new(fake_op(dir.path(), "printf 's3cret'"));

        let value = resolver
            .resolve(&SecretRef::new("DB_PASSWORD", "op://dev/db/password"))
            .await
            .unwrap();
        assert_eq!(value, "s3cret");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn vault_auth_failure_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SecretResolver::new(fake_op(
            dir.path(),
            "echo '[ERROR] You are not currently signed in.' >&2; exit 1",
        ));

        let err = resolver
            .resolve(&SecretRef::new("DB_PASSWORD", "op://dev/db/password"))
            .await
            .unwrap_err();
        assert!(err.message().contains("not authenticated"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn vault_missing_item_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SecretResolver::new(fake_op(
            dir.path(),
            "echo '[ERROR] could not find item db in vault dev' >&2; exit 1",
        ));

        let err = resolver
            .resolve(&SecretRef::new("DB_PASSWORD", "op://dev/db/password"))
            .await
            .unwrap_err();
        assert!(err.message().contains("secret not found"));
        assert!(err.message().contains("op://dev/db/password"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn vault_timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let vault = fake_op(dir.path(), "sleep 5").with_timeout(Duration::from_millis(100));

        let err = SecretResolver::new(vault)
            .resolve(&SecretRef::new("TOKEN", "op://dev/t/token"))
            .await
            .unwrap_err();
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn resolve_all_collects_every_failure() {
        let secrets = BTreeMap::from([
            ("A_OK".to_string(), "literal".to_string()),
            ("B_MISSING".to_string(), "$KINFRA_UNSET_B_12345".to_string()),
            ("C_MISSING".to_string(), "$KINFRA_UNSET_C_12345".to_string()),
            ("D_VAULT".to_string(), "op://x/y/z".to_string()),
        ]);

        let (resolved, errors) = resolver_without_vault().resolve_all(&secrets).await;

        assert_eq!(resolved, BTreeMap::from([("A_OK".to_string(), "literal".to_string())]));
        assert_eq!(errors.len(), 3);
        let names: Vec<_> = errors
            .iter()
            .map(|e| match e {
                ProvisioningError::SecretResolution { var_name, .. } => var_name.as_str(),
                ProvisioningError::FileProvision { .. } => "",
            })
            .collect();
        assert_eq!(names, vec!["B_MISSING", "C_MISSING", "D_VAULT"]);
    }

    #[tokio::test]
    async fn resolve_all_of_nothing_is_empty() {
        let (resolved, errors) = resolve_all_secrets(&BTreeMap::new()).await;
        assert!(resolved.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn secrets_file_is_sorted_key_value_lines() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = BTreeMap::from([
            ("ZED".to_string(), "last".to_string()),
            ("ALPHA".to_string(), "first".to_string()),
        ]);

        let path = generate_secrets_file(&resolved, dir.path()).unwrap();

        assert_eq!(path, dir.path().join(SECRETS_FILE));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ALPHA=first\nZED=last\n");
    }

    #[cfg(unix)]
    #[test]
    fn secrets_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let resolved = BTreeMap::from([("TOKEN".to_string(), "s3cret".to_string())]);

        let path = generate_secrets_file(&resolved, dir.path()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn secrets_file_tightens_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SECRETS_FILE);
        std::fs::write(&path, "OLD=value\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let resolved = BTreeMap::from([("TOKEN".to_string(), "s3cret".to_string())]);

        generate_secrets_file(&resolved, dir.path()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "TOKEN=s3cret\n");
    }

    #[test]
    fn secrets_file_rejects_injection() {
        let dir = tempfile::tempdir().unwrap();
        for (key, value) in [("K", "a\nEVIL=1"), ("K", "a\rb"), ("K\0", "v")] {
            let resolved = BTreeMap::from([(key.to_string(), value.to_string())]);
            let err = generate_secrets_file(&resolved, dir.path()).unwrap_err();
            assert!(matches!(err, Error::InvalidEnvEntry { .. }));
        }
        assert!(!dir.path().join(SECRETS_FILE).exists());
    }
}
