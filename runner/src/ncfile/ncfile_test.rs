use super::*;
use std::io::Write;

/// Builds a minimal CDF-1 file in memory: no dimensions, no global
/// attributes, the given scalar int variables, data appended after the
/// header with `begin` patched up.
struct CdfBuilder {
    scalars: Vec<(String, i32)>,
}

impl CdfBuilder {
    fn new() -> Self {
        Self {
            scalars: Vec::new(),
        }
    }

    fn scalar_int(mut self, name: &str, value: i32) -> Self {
        self.scalars.push((name.to_string(), value));
        self
    }

    fn build(self) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(b"CDF\x01");
        header.extend_from_slice(&0u32.to_be_bytes()); // numrecs
        header.extend_from_slice(&[0u8; 8]); // ABSENT dim_list
        header.extend_from_slice(&[0u8; 8]); // ABSENT gatt_list
        header.extend_from_slice(&0x0Bu32.to_be_bytes());
        header.extend_from_slice(&(self.scalars.len() as u32).to_be_bytes());

        let mut begin_slots = Vec::new();
        for (name, _) in &self.scalars {
            let bytes = name.as_bytes();
            header.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            header.extend_from_slice(bytes);
            while header.len() % 4 != 0 {
                header.push(0);
            }
            header.extend_from_slice(&0u32.to_be_bytes()); // ndims
            header.extend_from_slice(&[0u8; 8]); // ABSENT vatt_list
            header.extend_from_slice(&4u32.to_be_bytes()); // NC_INT
            header.extend_from_slice(&4u32.to_be_bytes()); // vsize
            begin_slots.push(header.len());
            header.extend_from_slice(&0u32.to_be_bytes()); // begin, patched below
        }

        let data_start = header.len();
        for (i, slot) in begin_slots.iter().enumerate() {
            let begin = (data_start + i * 4) as u32;
            header[*slot..*slot + 4].copy_from_slice(&begin.to_be_bytes());
        }
        for (_, value) in &self.scalars {
            header.extend_from_slice(&value.to_be_bytes());
        }
        header
    }
}

fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
    f
}

#[test]
pub fn reads_scalar_int() {
    let bytes = CdfBuilder::new()
        .scalar_int("itime", 4392000)
        .scalar_int("aij", 7)
        .build();
    let f = write_temp(&bytes);

    let mut nc = NcFile::open(f.path()).unwrap();
    assert!(nc.has_variable("itime"));
    assert!(nc.has_variable("aij"));
    assert!(!nc.has_variable("tij"));
    assert_eq!(nc.read_scalar_int("itime").unwrap(), 4392000);
    assert_eq!(nc.read_scalar_int("aij").unwrap(), 7);
}

#[test]
pub fn negative_values_survive() {
    let bytes = CdfBuilder::new().scalar_int("itime", -1).build();
    let f = write_temp(&bytes);
    let mut nc = NcFile::open(f.path()).unwrap();
    assert_eq!(nc.read_scalar_int("itime").unwrap(), -1);
}

#[test]
pub fn missing_variable_is_reported() {
    let bytes = CdfBuilder::new().scalar_int("itime", 1).build();
    let f = write_temp(&bytes);
    let mut nc = NcFile::open(f.path()).unwrap();
    assert!(matches!(
        nc.read_scalar_int("nope"),
        Err(NcError::NoSuchVariable { .. })
    ));
}

#[test]
pub fn rejects_bad_magic() {
    let f = write_temp(b"HDF\x01 definitely not netcdf");
    assert!(matches!(
        NcFile::open(f.path()),
        Err(NcError::BadMagic { .. })
    ));
}

#[test]
pub fn rejects_truncated_header() {
    let mut bytes = CdfBuilder::new().scalar_int("itime", 1).build();
    bytes.truncate(20);
    let f = write_temp(&bytes);
    assert!(matches!(NcFile::open(f.path()), Err(NcError::Io { .. })));
}

#[test]
pub fn rejects_garbage_list_tag() {
    let mut bytes = CdfBuilder::new().scalar_int("itime", 1).build();
    // corrupt the var_list tag
    bytes[24..28].copy_from_slice(&0xFFu32.to_be_bytes());
    let f = write_temp(&bytes);
    assert!(matches!(
        NcFile::open(f.path()),
        Err(NcError::Malformed { .. })
    ));
}
