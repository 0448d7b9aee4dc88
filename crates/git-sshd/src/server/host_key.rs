//! Host key provisioning

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::process::Command;

/// Load the host key at `path`, generating an RSA key there first if absent
///
/// Generation writes to a temporary file and hard-links it into place, so
/// concurrent daemons racing on the same path all end up with one key.
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if !path.exists() {
        generate_host_key(path).await?;
    }

    tracing::info!("Loading host key from {:?}", path);
    let key = russh_keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key from {:?}", path))?;
    Ok(key)
}

async fn generate_host_key(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let tmp = temp_key_path(path);
    tracing::info!("Generating new host key at {:?}", path);

    let result = run_keygen(&tmp).await.and_then(|()| match std::fs::hard_link(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::debug!("Host key {:?} was created concurrently", path);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to install host key at {:?}", path)),
    });

    let _ = tokio::fs::remove_file(&tmp).await;
    let _ = tokio::fs::remove_file(tmp.with_extension("tmp.pub")).await;

    result
}

fn temp_key_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "host_key".to_string());
    path.with_file_name(format!(".{}.{:016x}.tmp", name, rand::random::<u64>()))
}

async fn run_keygen(out: &Path) -> Result<()> {
    let status = Command::new("ssh-keygen")
        .arg("-t")
        .arg("rsa")
        .arg("-b")
        .arg("3072")
        .arg("-N")
        .arg("")
        .arg("-q")
        .arg("-f")
        .arg(out)
        .status()
        .await
        .context("Failed to run ssh-keygen")?;

    if !status.success() {
        anyhow::bail!("ssh-keygen failed with status: {}", status);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn have_keygen() -> bool {
        crate::command::resolve_executable("ssh-keygen").await.is_ok()
    }

    #[tokio::test]
    async fn test_generates_then_reuses_key() {
        if !have_keygen().await {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("git-sshd_9393.rsa");

        let first = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());
        let second = load_or_generate_host_key(&path).await.unwrap();

        assert_eq!(
            first.clone_public_key().unwrap().fingerprint(),
            second.clone_public_key().unwrap().fingerprint()
        );

        // Only the key itself is left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, [std::ffi::OsString::from("git-sshd_9393.rsa")]);
    }

    #[tokio::test]
    async fn test_concurrent_generation_converges() {
        if !have_keygen().await {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.rsa");

        let (a, b) = tokio::join!(
            load_or_generate_host_key(&path),
            load_or_generate_host_key(&path)
        );

        assert_eq!(
            a.unwrap().clone_public_key().unwrap().fingerprint(),
            b.unwrap().clone_public_key().unwrap().fingerprint()
        );
    }

    #[tokio::test]
    async fn test_unreadable_key_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.rsa");
        std::fs::write(&path, "not a key").unwrap();

        assert!(load_or_generate_host_key(&path).await.is_err());
    }
}
