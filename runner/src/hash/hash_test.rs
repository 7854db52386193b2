use super::{hexdigest, update_file, update_value};
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::fs;

fn digest_of(yaml: &str) -> String {
    let value: Value = serde_yaml::from_str(yaml).unwrap();
    let mut hasher = Sha256::new();
    update_value(&mut hasher, &value);
    hexdigest(hasher)
}

#[test]
pub fn mapping_order_is_irrelevant() {
    let a = digest_of("components:\n  ocean: [a, b]\n  atm: [c]\nkdisk: 1\n");
    let b = digest_of("kdisk: 1\ncomponents:\n  atm: [c]\n  ocean: [a, b]\n");
    assert_eq!(a, b);
}

#[test]
pub fn sequence_order_is_significant() {
    assert_ne!(digest_of("mods: [a, b]"), digest_of("mods: [b, a]"));
}

#[test]
pub fn value_changes_change_the_digest() {
    assert_ne!(digest_of("kdisk: 1"), digest_of("kdisk: 2"));
}

#[test]
pub fn strings_and_numbers_differ() {
    assert_ne!(digest_of("x: 1"), digest_of("x: '1'"));
}

#[test]
pub fn file_hash_tracks_bytes_not_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mod.f90");
    fs::write(&path, b"subroutine step\n").unwrap();

    let mut h1 = Sha256::new();
    update_file(&mut h1, &path).unwrap();

    // rewrite identical bytes; mtime changes, digest must not
    fs::write(&path, b"subroutine step\n").unwrap();
    let mut h2 = Sha256::new();
    update_file(&mut h2, &path).unwrap();
    assert_eq!(hexdigest(h1), hexdigest(h2));

    // changing bytes changes the digest
    fs::write(&path, b"subroutine step2\n").unwrap();
    let mut h3 = Sha256::new();
    update_file(&mut h3, &path).unwrap();
    let mut h4 = Sha256::new();
    update_file(&mut h4, &path).unwrap();
    let (d3, d4) = (hexdigest(h3), hexdigest(h4));
    assert_eq!(d3, d4);

    let mut h5 = Sha256::new();
    update_file(&mut h5, &path).unwrap();
    let mut h6 = Sha256::new();
    fs::write(&path, b"subroutine step\n").unwrap();
    update_file(&mut h6, &path).unwrap();
    assert_ne!(hexdigest(h5), hexdigest(h6));
}
