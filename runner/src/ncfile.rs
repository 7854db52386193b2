//! Just-enough reader for the classic netCDF format (CDF-1 and CDF-2).
//!
//! Checkpoint and restart files are full scientific datasets, but this engine
//! only ever needs two things out of them: the scalar `itime` counter and
//! whether a marker variable is present.  Parsing the header by hand keeps
//! that probe dependency-free; everything past the header is opaque.

use std::{
    collections::BTreeMap,
    fs::File,
    io,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use thiserror::Error;

const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;

const NC_INT: u32 = 4;

#[derive(Error, Debug)]
pub enum NcError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a classic netCDF file")]
    BadMagic { path: PathBuf },
    #[error("malformed netCDF header in {path}: {what}")]
    Malformed { path: PathBuf, what: String },
    #[error("no variable {name} in {path}")]
    NoSuchVariable { path: PathBuf, name: String },
    #[error("variable {name} in {path} is not a scalar int")]
    NotScalarInt { path: PathBuf, name: String },
}

#[derive(Debug, Clone)]
struct Variable {
    ndims: u32,
    nc_type: u32,
    begin: u64,
}

/// Header of one open classic-netCDF file.
#[derive(Debug)]
pub struct NcFile {
    path: PathBuf,
    file: File,
    variables: BTreeMap<String, Variable>,
}

impl NcFile {
    pub fn open(path: &Path) -> Result<Self, NcError> {
        let file = File::open(path).map_err(|source| NcError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = HeaderReader {
            path,
            file,
            offset_64bit: false,
        };
        let variables = reader.parse()?;
        Ok(Self {
            path: path.to_path_buf(),
            file: reader.file,
            variables,
        })
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Reads the value of a scalar `int` variable (big-endian on disk).
    pub fn read_scalar_int(&mut self, name: &str) -> Result<i32, NcError> {
        let var = self
            .variables
            .get(name)
            .ok_or_else(|| NcError::NoSuchVariable {
                path: self.path.clone(),
                name: name.to_string(),
            })?;
        if var.ndims != 0 || var.nc_type != NC_INT {
            return Err(NcError::NotScalarInt {
                path: self.path.clone(),
                name: name.to_string(),
            });
        }
        let begin = var.begin;
        let mut buf = [0u8; 4];
        self.file
            .seek(SeekFrom::Start(begin))
            .and_then(|_| self.file.read_exact(&mut buf))
            .map_err(|source| NcError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(i32::from_be_bytes(buf))
    }
}

struct HeaderReader<'a> {
    path: &'a Path,
    file: File,
    offset_64bit: bool,
}

impl HeaderReader<'_> {
    fn parse(&mut self) -> Result<BTreeMap<String, Variable>, NcError> {
        let mut magic = [0u8; 4];
        self.read_exact(&mut magic)?;
        if &magic[0..3] != b"CDF" {
            return Err(NcError::BadMagic {
                path: self.path.to_path_buf(),
            });
        }
        self.offset_64bit = match magic[3] {
            1 => false,
            2 => true,
            _ => {
                return Err(NcError::BadMagic {
                    path: self.path.to_path_buf(),
                })
            }
        };

        // numrecs (or STREAMING); the value is irrelevant to the probe
        self.read_u32()?;

        self.skip_dim_list()?;
        self.skip_att_list()?;
        self.read_var_list()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), NcError> {
        self.file.read_exact(buf).map_err(|source| NcError::Io {
            path: self.path.to_path_buf(),
            source,
        })
    }

    fn read_u32(&mut self) -> Result<u32, NcError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64, NcError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn malformed(&self, what: &str) -> NcError {
        NcError::Malformed {
            path: self.path.to_path_buf(),
            what: what.to_string(),
        }
    }

    /// Reads a `(tag, nelems)` list header; ABSENT lists are `(0, 0)`.
    fn list_header(&mut self, expected_tag: u32, what: &str) -> Result<u32, NcError> {
        let tag = self.read_u32()?;
        let nelems = self.read_u32()?;
        match tag {
            0 if nelems == 0 => Ok(0),
            t if t == expected_tag => Ok(nelems),
            _ => Err(self.malformed(what)),
        }
    }

    /// Names are a length followed by bytes padded to a 4-byte boundary.
    fn read_name(&mut self) -> Result<String, NcError> {
        let len = self.read_u32()? as usize;
        if len > 64 * 1024 {
            return Err(self.malformed("unreasonable name length"));
        }
        let padded = (len + 3) & !3;
        let mut buf = vec![0u8; padded];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf[..len].to_vec()).map_err(|_| self.malformed("non-utf8 name"))
    }

    fn skip(&mut self, nbytes: u64) -> Result<(), NcError> {
        self.file
            .seek(SeekFrom::Current(nbytes as i64))
            .map_err(|source| NcError::Io {
                path: self.path.to_path_buf(),
                source,
            })?;
        Ok(())
    }

    fn skip_dim_list(&mut self) -> Result<(), NcError> {
        let ndims = self.list_header(NC_DIMENSION, "dimension list")?;
        for _ in 0..ndims {
            self.read_name()?;
            self.read_u32()?; // dimension length
        }
        Ok(())
    }

    fn skip_att_list(&mut self) -> Result<(), NcError> {
        let natts = self.list_header(NC_ATTRIBUTE, "attribute list")?;
        for _ in 0..natts {
            self.read_name()?;
            let nc_type = self.read_u32()?;
            let nelems = self.read_u32()? as u64;
            let size = type_size(nc_type).ok_or_else(|| self.malformed("attribute type"))?;
            let nbytes = (nelems * size + 3) & !3;
            self.skip(nbytes)?;
        }
        Ok(())
    }

    fn read_var_list(&mut self) -> Result<BTreeMap<String, Variable>, NcError> {
        let nvars = self.list_header(NC_VARIABLE, "variable list")?;
        let mut variables = BTreeMap::new();
        for _ in 0..nvars {
            let name = self.read_name()?;
            let ndims = self.read_u32()?;
            if ndims > 1024 {
                return Err(self.malformed("unreasonable rank"));
            }
            for _ in 0..ndims {
                self.read_u32()?; // dimension id
            }
            self.skip_att_list()?;
            let nc_type = self.read_u32()?;
            if type_size(nc_type).is_none() {
                return Err(self.malformed("variable type"));
            }
            self.read_u32()?; // vsize
            let begin = if self.offset_64bit {
                self.read_u64()?
            } else {
                u64::from(self.read_u32()?)
            };
            variables.insert(
                name,
                Variable {
                    ndims,
                    nc_type,
                    begin,
                },
            );
        }
        Ok(variables)
    }
}

fn type_size(nc_type: u32) -> Option<u64> {
    match nc_type {
        1 | 2 => Some(1), // byte, char
        3 => Some(2),     // short
        4 | 5 => Some(4), // int, float
        6 => Some(8),     // double
        _ => None,
    }
}

#[cfg(test)]
mod ncfile_test;
