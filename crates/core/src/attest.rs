//! Binary certify-info structure signed by the AK.
//!
//! Layout follows TPMS_ATTEST for `TPM_ST_ATTEST_CERTIFY`:
//! `magic:u32 | type:u16 | TPM2B qualifiedSigner | TPM2B extraData | clock:u64 | TPM2B name`,
//! all integers big-endian. `extraData` carries the qualifying data that
//! binds the certification to one application key and one nonce.

use crate::error::{Error, Result};

/// `TPM_GENERATED_VALUE`
pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;

/// `TPM_ST_ATTEST_CERTIFY`
pub const TPM_ST_ATTEST_CERTIFY: u16 = 0x8017;

/// `TPM_ALG_SHA256`, the name algorithm prefix
pub const TPM_ALG_SHA256: u16 = 0x000b;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifyInfo {
    /// Name of the signing AK
    pub qualified_signer: Vec<u8>,
    /// Qualifying data supplied by the caller
    pub extra_data: Vec<u8>,
    pub clock: u64,
    /// Name of the certified object
    pub certified_name: Vec<u8>,
}

impl CertifyInfo {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + 2 + 6 + self.qualified_signer.len() + self.extra_data.len()
                + self.certified_name.len()
                + 8,
        );
        out.extend_from_slice(&TPM_GENERATED_VALUE.to_be_bytes());
        out.extend_from_slice(&TPM_ST_ATTEST_CERTIFY.to_be_bytes());
        put_tpm2b(&mut out, &self.qualified_signer);
        put_tpm2b(&mut out, &self.extra_data);
        out.extend_from_slice(&self.clock.to_be_bytes());
        put_tpm2b(&mut out, &self.certified_name);
        out
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        let magic = u32::from_be_bytes(reader.array()?);
        if magic != TPM_GENERATED_VALUE {
            return Err(malformed(format!("bad magic {:#010x}", magic)));
        }
        let attest_type = u16::from_be_bytes(reader.array()?);
        if attest_type != TPM_ST_ATTEST_CERTIFY {
            return Err(malformed(format!("unexpected attest type {:#06x}", attest_type)));
        }
        let qualified_signer = reader.tpm2b()?;
        let extra_data = reader.tpm2b()?;
        let clock = u64::from_be_bytes(reader.array()?);
        let certified_name = reader.tpm2b()?;
        if reader.pos != bytes.len() {
            return Err(malformed("trailing bytes".to_string()));
        }
        Ok(Self {
            qualified_signer,
            extra_data,
            clock,
            certified_name,
        })
    }
}

fn put_tpm2b(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn malformed(detail: String) -> Error {
    Error::InvalidRequest(format!("malformed certify data: {}", detail))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| malformed("truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn tpm2b(&mut self) -> Result<Vec<u8>> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        Ok(self.take(len)?.to_vec())
    }
}
