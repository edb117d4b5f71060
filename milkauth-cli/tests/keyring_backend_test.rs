//! The OS keyring backend selected for Linux builds must keep credentials
//! across reboots, not only for the lifetime of the kernel keyring.

#![cfg(target_os = "linux")]

use keyring::credential::{CredentialBuilderApi, CredentialPersistence};

#[test]
fn test_default_linux_keyring_persists_until_deleted() {
    let builder = keyring::default::default_credential_builder();
    assert!(matches!(builder.persistence(), CredentialPersistence::UntilDelete));
}
