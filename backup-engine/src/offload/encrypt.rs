//! Symmetric passphrase encryption of finished chunks.

use crate::utils::{EngineError, Result};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Environment variable holding the passphrase unless a job names another.
pub const DEFAULT_PASSPHRASE_ENV: &str = "BACKUP_ENCRYPT_PASSPHRASE";

pub const ENCRYPTED_EXTENSION: &str = "gpg";

/// Encryption passphrase. Never printed.
#[derive(Clone)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(EngineError::Config("encryption passphrase is empty".to_string()));
        }
        Ok(Self(secret))
    }

    /// Read the passphrase from `var`; unset and empty are both errors.
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(Self(value)),
            _ => Err(EngineError::Config(format!(
                "encryption requested but {} is not set",
                var
            ))),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

/// Something that can encrypt one file into another and back.
pub trait Cipher {
    fn encrypt(&self, input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()>;

    fn decrypt(&self, input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()>;
}

/// AES256 symmetric encryption through the `gpg` binary.
#[derive(Debug, Clone)]
pub struct GpgCipher {
    program: PathBuf,
}

impl Default for GpgCipher {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gpg"),
        }
    }
}

impl GpgCipher {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl GpgCipher {
    fn run(&self, mode: &[&str], input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(["--batch", "--yes", "--pinentry-mode", "loopback", "--passphrase-fd", "0"])
            .args(mode)
            .arg("-o")
            .arg(output)
            .arg(input)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Encryption(format!("failed to start {}: {}", self.program.display(), e)))?;

        // passphrase goes over stdin only, never argv
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", passphrase.expose()).as_bytes())
                .map_err(|e| EngineError::Encryption(format!("failed to pass passphrase to gpg: {}", e)))?;
        }

        let output_status = child.wait_with_output()?;
        if !output_status.status.success() {
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            return Err(EngineError::Encryption(format!(
                "gpg exited with {} for {}: {}",
                output_status.status,
                input.display(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Cipher for GpgCipher {
    fn encrypt(&self, input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()> {
        self.run(&["--symmetric", "--cipher-algo", "AES256"], input, output, passphrase)
    }

    fn decrypt(&self, input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()> {
        self.run(&["--decrypt"], input, output, passphrase)
    }
}

/// Name a chunk gets once encrypted.
pub fn encrypted_path(chunk: &Path) -> PathBuf {
    let mut name = OsString::from(chunk.as_os_str());
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}

/// Encrypt every chunk in place: `x.tar.zst` becomes `x.tar.zst.gpg` and the
/// plaintext is removed once a non-empty ciphertext exists.
pub fn encrypt_chunks(chunks: &[PathBuf], passphrase: &Passphrase, cipher: &dyn Cipher) -> Result<Vec<PathBuf>> {
    let mut encrypted = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let target = encrypted_path(chunk);
        cipher.encrypt(chunk, &target, passphrase)?;

        let size = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(EngineError::Encryption(format!(
                "encrypted output for {} is missing or empty",
                chunk.display()
            )));
        }
        fs::remove_file(chunk)?;
        tracing::debug!(chunk = %target.display(), bytes = size, "chunk encrypted");
        encrypted.push(target);
    }
    Ok(encrypted)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Reverses the bytes; enough to tell ciphertext from plaintext.
    pub(crate) struct ReverseCipher;

    impl Cipher for ReverseCipher {
        fn encrypt(&self, input: &Path, output: &Path, _passphrase: &Passphrase) -> Result<()> {
            let mut data = fs::read(input)?;
            data.reverse();
            fs::write(output, data)?;
            Ok(())
        }

        fn decrypt(&self, input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()> {
            self.encrypt(input, output, passphrase)
        }
    }

    struct EmptyCipher;

    impl Cipher for EmptyCipher {
        fn encrypt(&self, _input: &Path, output: &Path, _passphrase: &Passphrase) -> Result<()> {
            fs::write(output, b"")?;
            Ok(())
        }

        fn decrypt(&self, _input: &Path, output: &Path, _passphrase: &Passphrase) -> Result<()> {
            fs::write(output, b"")?;
            Ok(())
        }
    }

    #[test]
    fn test_encrypt_chunks_replaces_plaintext() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let chunk = dir.path().join("full_part_1_20240101_000000.tar.zst");
        fs::write(&chunk, b"abc")?;

        let pass = Passphrase::new("secret").unwrap();
        let out = encrypt_chunks(&[chunk.clone()], &pass, &ReverseCipher).unwrap();

        assert_eq!(out, vec![dir.path().join("full_part_1_20240101_000000.tar.zst.gpg")]);
        assert!(!chunk.exists());
        assert_eq!(fs::read(&out[0])?, b"cba");
        Ok(())
    }

    #[test]
    fn test_empty_ciphertext_keeps_plaintext() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let chunk = dir.path().join("c.tar.zst");
        fs::write(&chunk, b"abc")?;

        let pass = Passphrase::new("secret").unwrap();
        let result = encrypt_chunks(&[chunk.clone()], &pass, &EmptyCipher);
        assert!(matches!(result, Err(EngineError::Encryption(_))));
        assert!(chunk.exists());
        Ok(())
    }

    #[test]
    fn test_passphrase_from_env() {
        std::env::set_var("BACKUP_ENGINE_TEST_PASSPHRASE_SET", "hunter2");
        std::env::set_var("BACKUP_ENGINE_TEST_PASSPHRASE_EMPTY", "");

        let pass = Passphrase::from_env("BACKUP_ENGINE_TEST_PASSPHRASE_SET").unwrap();
        assert_eq!(pass.expose(), "hunter2");
        assert_eq!(format!("{:?}", pass), "Passphrase(***)");

        assert!(matches!(
            Passphrase::from_env("BACKUP_ENGINE_TEST_PASSPHRASE_EMPTY"),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            Passphrase::from_env("BACKUP_ENGINE_TEST_PASSPHRASE_UNSET"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_missing_gpg_binary_is_encryption_error() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let chunk = dir.path().join("c.tar.zst");
        fs::write(&chunk, b"abc")?;

        let cipher = GpgCipher::with_program("/nonexistent/gpg-binary");
        let pass = Passphrase::new("secret").unwrap();
        let result = cipher.encrypt(&chunk, &encrypted_path(&chunk), &pass);
        assert!(matches!(result, Err(EngineError::Encryption(_))));
        let result = cipher.decrypt(&encrypted_path(&chunk), &chunk, &pass);
        assert!(matches!(result, Err(EngineError::Encryption(_))));
        Ok(())
    }
}
