//! Full init/mount round trips through the config record, reserved-name
//! behaviour per mode, and end-to-end tamper detection.

use secrecy::SecretString;
use std::path::Path;
use tempfile::TempDir;
use veil_core::{AeadBackend, FsError, MountOptions};
use veil_crypto::{conffile, KeyStore, ScryptParams, CONF_NAME};
use veil_fs::{diriv, CryptFs};

fn fast_params() -> ScryptParams {
    ScryptParams::with_log_n(10).unwrap()
}

fn opts(plaintext_names: bool) -> MountOptions {
    MountOptions {
        plaintext_names,
        reverse: false,
        backend: AeadBackend::RustCrypto,
    }
}

/// Initialise a cipher dir the way `veilfs init` does: config record plus,
/// with encrypted names, the root IV.
fn init(cipher: &Path, pass: &SecretString, plaintext_names: bool) {
    conffile::create_conf(
        &cipher.join(CONF_NAME),
        pass,
        plaintext_names,
        &fast_params(),
        "veilfs test",
    )
    .unwrap();
    if !plaintext_names {
        diriv::init_dir_iv(cipher).unwrap();
    }
}

/// Mount: load the record, derive keys, build the facade.
fn mount(cipher: &Path, pass: &SecretString) -> Result<CryptFs, FsError> {
    let (master, conf) = conffile::load_conf(&cipher.join(CONF_NAME), pass)?;
    let plaintext_names = conf.has_flag(conffile::FeatureFlag::PlaintextNames);
    let keys = KeyStore::new(master)?;
    CryptFs::new(cipher.to_path_buf(), &keys, &opts(plaintext_names))
}

#[test]
fn remount_sees_previous_files() {
    let dir = TempDir::new().unwrap();
    let pass = SecretString::from("the mount passphrase");
    init(dir.path(), &pass, false);

    {
        let fs = mount(dir.path(), &pass).unwrap();
        let f = fs.create(Path::new("kept.txt")).unwrap();
        f.write_at(0, b"survives remount").unwrap();
        fs.mkdir(Path::new("subdir"), 0o755).unwrap();
        let g = fs.create(Path::new("subdir/inner")).unwrap();
        g.write_at(0, &vec![0xA5u8; 9000]).unwrap();
    }

    let fs = mount(dir.path(), &pass).unwrap();
    let f = fs.open(Path::new("kept.txt")).unwrap();
    assert_eq!(f.read_at(0, 100).unwrap(), b"survives remount");

    let g = fs.open(Path::new("subdir/inner")).unwrap();
    assert_eq!(g.size().unwrap(), 9000);
    assert_eq!(g.read_at(0, 9000).unwrap(), vec![0xA5u8; 9000]);
}

#[test]
fn wrong_passphrase_refuses_mount() {
    let dir = TempDir::new().unwrap();
    init(dir.path(), &SecretString::from("right"), false);

    assert!(matches!(
        mount(dir.path(), &SecretString::from("wrong")),
        Err(FsError::BadPassword)
    ));
}

#[test]
fn conf_record_is_unreadable_without_passphrase_but_present() {
    let dir = TempDir::new().unwrap();
    let pass = SecretString::from("pw");
    init(dir.path(), &pass, false);

    // The record is real JSON on disk but never listed in the plain view.
    assert!(dir.path().join(CONF_NAME).exists());
    let fs = mount(dir.path(), &pass).unwrap();
    assert!(fs
        .readdir(Path::new(""))
        .unwrap()
        .iter()
        .all(|e| e.name != CONF_NAME));
}

#[test]
fn reserved_name_per_mode() {
    // Plaintext names: the config name is reserved at the root.
    let plain_dir = TempDir::new().unwrap();
    let pass = SecretString::from("pw");
    init(plain_dir.path(), &pass, true);
    let plain = mount(plain_dir.path(), &pass).unwrap();
    assert!(matches!(
        plain.create(Path::new(CONF_NAME)),
        Err(FsError::NameReserved(_))
    ));
    assert!(matches!(
        plain.unlink(Path::new(CONF_NAME)),
        Err(FsError::NameReserved(_))
    ));

    // Encrypted names: any plaintext name works and the backing name
    // differs from it.
    let enc_dir = TempDir::new().unwrap();
    init(enc_dir.path(), &pass, false);
    let enc = mount(enc_dir.path(), &pass).unwrap();
    let f = enc.create(Path::new(CONF_NAME)).unwrap();
    f.write_at(0, b"not the real config").unwrap();

    let listed: Vec<_> = enc
        .readdir(Path::new(""))
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(listed, vec![CONF_NAME.to_string()]);
    // Exactly one backing file besides the real config and the IV.
    let backing: Vec<_> = std::fs::read_dir(enc_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| !veil_crypto::is_reserved_name(n))
        .collect();
    assert_eq!(backing.len(), 1);
    assert_ne!(backing[0], CONF_NAME);
}

#[test]
fn plaintext_names_mode_is_recorded_and_used() {
    let dir = TempDir::new().unwrap();
    let pass = SecretString::from("pw");
    init(dir.path(), &pass, true);

    let fs = mount(dir.path(), &pass).unwrap();
    let f = fs.create(Path::new("visible.txt")).unwrap();
    f.write_at(0, b"plain names, encrypted content").unwrap();

    // Name readable on the backing store, content not.
    let raw = std::fs::read(dir.path().join("visible.txt")).unwrap();
    assert!(!raw
        .windows(b"encrypted content".len())
        .any(|w| w == b"encrypted content"));
}

#[test]
fn flipping_any_stored_block_byte_fails_the_read() {
    let dir = TempDir::new().unwrap();
    let pass = SecretString::from("pw");
    init(dir.path(), &pass, true);

    {
        let fs = mount(dir.path(), &pass).unwrap();
        let f = fs.create(Path::new("victim")).unwrap();
        f.write_at(0, &[0x42u8; 100]).unwrap();
    }

    let backing = dir.path().join("victim");
    let pristine = std::fs::read(&backing).unwrap();
    // header (18) + nonce (12) + ct (100) + tag (16)
    assert_eq!(pristine.len(), 146);

    for victim in 18..pristine.len() {
        let mut tampered = pristine.clone();
        tampered[victim] ^= 0x01;
        std::fs::write(&backing, &tampered).unwrap();

        let fs = mount(dir.path(), &pass).unwrap();
        let f = fs.open(Path::new("victim")).unwrap();
        assert!(
            matches!(f.read_at(0, 100), Err(FsError::AuthenticationFailure)),
            "flipped byte {victim} went undetected"
        );
    }
}
