//! Post-processing of finished sets: encryption and remote mirroring.

pub mod encrypt;
pub mod remote;

pub use encrypt::{encrypt_chunks, encrypted_path, Cipher, GpgCipher, Passphrase, DEFAULT_PASSPHRASE_ENV};
pub use remote::{AwsCliStore, RemoteStore, RemoteTarget};
