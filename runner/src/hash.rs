use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::{fmt::Write as _, fs::File, io, io::Read, path::Path};

/// Folds a structured value into the hash, independent of mapping insertion
/// order.  Every node contributes a type tag first so that e.g. the string
/// "1" and the number 1 hash differently.
pub fn update_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"null"),
        Value::Bool(b) => {
            hasher.update(b"bool");
            hasher.update([u8::from(*b)]);
        }
        Value::Number(n) => {
            hasher.update(b"number");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"string");
            hasher.update(s.as_bytes());
        }
        Value::Sequence(seq) => {
            // Sequence order is significant
            hasher.update(b"seq");
            for item in seq {
                update_value(hasher, item);
            }
        }
        Value::Mapping(map) => {
            hasher.update(b"map");
            let mut entries: Vec<(String, &Value)> =
                map.iter().map(|(k, v)| (key_string(k), v)).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, item) in entries {
                hasher.update(b"key");
                hasher.update(key.as_bytes());
                update_value(hasher, item);
            }
        }
        Value::Tagged(tagged) => {
            hasher.update(b"tagged");
            hasher.update(tagged.tag.to_string().as_bytes());
            update_value(hasher, &tagged.value);
        }
    }
}

pub fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update(b"string");
    hasher.update(s.as_bytes());
}

/// Folds a file's byte content into the hash.  Timestamps never participate,
/// so touching a file without changing bytes leaves the digest alone.
pub fn update_file(hasher: &mut Sha256, path: &Path) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

pub fn hexdigest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // writing to a String cannot fail
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod hash_test;
