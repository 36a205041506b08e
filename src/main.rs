//! kinfra CLI
//!
//! Manages sandbox slots for the git worktree in the current directory.

use std::path::{Path, PathBuf};

use kinfra::config::{find_project_root, load_config};
use kinfra::registry::{default_registry_path, RegistryStore};
use kinfra::sandbox::default_slots_dir;
use kinfra::{worktree, DockerCompose, Error, InfraConfig, Result, SandboxManager};

const USAGE: &str = "Usage:
  kinfra sandbox up [WORKTREE]             Claim a slot, provision and start containers
  kinfra sandbox start [WORKTREE]          Restart containers for an existing slot
  kinfra sandbox stop [WORKTREE]           Stop containers, keep the slot
  kinfra sandbox down [--force] [WORKTREE] Stop containers and release the slot
  kinfra status                            List claimed slots";

enum Command {
    Up(Option<PathBuf>),
    Start(Option<PathBuf>),
    Stop(Option<PathBuf>),
    Down { worktree: Option<PathBuf>, force: bool },
    Status,
}

fn parse_args(args: &[String]) -> Option<Command> {
    match args {
        [cmd] if cmd == "status" => Some(Command::Status),
        [group, action, rest @ ..] if group == "sandbox" => {
            let force = rest.iter().any(|a| a == "--force" || a == "-f");
            let mut paths = rest.iter().filter(|a| !a.starts_with('-'));
            let worktree = paths.next().map(PathBuf::from);
            if paths.next().is_some() {
                return None;
            }
            match action.as_str() {
                "up" => Some(Command::Up(worktree)),
                "start" => Some(Command::Start(worktree)),
                "stop" => Some(Command::Stop(worktree)),
                "down" => Some(Command::Down { worktree, force }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Resolves the worktree top level, defaulting to the current directory.
///
/// A deleted worktree resolves to its absolute path so its slot can still
/// be stopped or released.
fn resolve_worktree(arg: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match arg {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let dir = match dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(std::path::absolute(&dir)?);
        }
        Err(e) => return Err(e.into()),
    };
    Ok(worktree::toplevel(&dir)
        .and_then(|top| Ok(top.canonicalize()?))
        .unwrap_or(dir))
}

/// Loads `infra.toml` from the worktree, falling back to the main checkout.
fn load_project(worktree: &Path, main_root: &Path) -> Result<InfraConfig> {
    for start in [worktree, main_root] {
        if let Some(root) = find_project_root(start) {
            if let Some(config) = load_config(&root)? {
                return Ok(config);
            }
        }
    }
    Err(Error::Config(format!(
        "no .devops-ai/infra.toml found from {}",
        worktree.display()
    )))
}

/// Resolves the worktree, its main checkout, and the project config.
fn locate(arg: Option<PathBuf>) -> Result<(PathBuf, PathBuf, InfraConfig)> {
    let wt = resolve_worktree(arg)?;
    let main_root = match worktree::find_main_repo_root(&wt) {
        Ok(root) => root,
        Err(e) => {
            tracing::debug!(error = %e, "not a linked worktree, using it as source root");
            wt.clone()
        }
    };
    let config = load_project(&wt, &main_root)?;
    Ok((wt, main_root, config))
}

async fn run(command: Command) -> Result<()> {
    let manager = SandboxManager::new(
        RegistryStore::new(default_registry_path()),
        DockerCompose::new(),
        default_slots_dir(),
    );

    match command {
        Command::Up(arg) => {
            let (wt, main_root, config) = locate(arg)?;
            print!("{}", manager.up(&config, &wt, &main_root).await?);
        }
        Command::Start(arg) => {
            let (wt, main_root, config) = locate(arg)?;
            print!("{}", manager.start(&config, &wt, &main_root).await?);
        }
        Command::Stop(arg) => {
            let wt = resolve_worktree(arg)?;
            let slot = manager.stop(&wt).await?;
            println!("Stopped sandbox slot {} ({})", slot.slot_id, slot.project);
        }
        Command::Down { worktree: arg, force } => {
            let wt = resolve_worktree(arg)?;
            let slot = manager.down(&wt, force).await?;
            println!("Released sandbox slot {} ({})", slot.slot_id, slot.project);
        }
        Command::Status => {
            let overview = manager.status().await;
            if overview.is_empty() {
                println!("No sandbox slots claimed.");
            }
            for entry in overview {
                let slot = &entry.slot;
                println!(
                    "slot {:>3}  {:<20} {:<12} {}",
                    slot.slot_id,
                    slot.project,
                    slot.status,
                    slot.worktree_path.display()
                );
                for service in &entry.services {
                    println!("           {:<20} {} ({})", service.service, service.state, service.detail);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = parse_args(&args) else {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    };

    if let Err(e) = run(command).await {
        match e {
            Error::Provisioning(errors) => {
                eprintln!("Provisioning failed:");
                for error in &errors {
                    eprintln!("  {}", error);
                }
                eprintln!("\nSandbox not started. Fix the issues above, then run: kinfra sandbox start");
            }
            other => eprintln!("Error: {}", other),
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn deleted_worktree_resolves_to_absolute_path() {
        let dir = TempDir::new().unwrap();
        let wt = dir.path().canonicalize().unwrap().join("feature");
        std::fs::create_dir(&wt).unwrap();
        std::fs::remove_dir(&wt).unwrap();

        assert_eq!(resolve_worktree(Some(wt.clone())).unwrap(), wt);
    }

    #[test]
    fn existing_dir_outside_git_resolves_to_itself() {
        let dir = TempDir::new().unwrap();
        let wt = dir.path().canonicalize().unwrap();

        assert_eq!(resolve_worktree(Some(wt.clone())).unwrap(), wt);
    }

    #[test]
    fn parses_down_with_force() {
        let args = ["sandbox", "down", "--force", "/wt"].map(String::from);
        match parse_args(&args) {
            Some(Command::Down { worktree, force }) => {
                assert!(force);
                assert_eq!(worktree, Some(PathBuf::from("/wt")));
            }
            _ => panic!("expected down command"),
        }
    }
}
