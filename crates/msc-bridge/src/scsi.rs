//! SCSI opcodes and sense codes used by the bridge.
//! Add more codes as the command set grows.

pub const SCSI_CMD_PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;

pub const SCSI_SENSE_NONE: u8 = 0x00;
pub const SCSI_SENSE_NOT_READY: u8 = 0x02;
pub const SCSI_SENSE_MEDIUM_ERROR: u8 = 0x03;
pub const SCSI_SENSE_ILLEGAL_REQUEST: u8 = 0x05;

pub const SCSI_CODE_ASC_WRITE_ERROR: u8 = 0x0C;
pub const SCSI_CODE_ASC_INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
pub const SCSI_CODE_ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
pub const SCSI_CODE_ASCQ: u8 = 0x00;

pub const VENDOR_ID: &str = "TinyUSB";
pub const PRODUCT_ID: &str = "Flash Storage";
pub const PRODUCT_REV: &str = "0.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    pub const MEDIUM_NOT_PRESENT: Self =
        Self::new(SCSI_SENSE_NOT_READY, SCSI_CODE_ASC_MEDIUM_NOT_PRESENT, SCSI_CODE_ASCQ);
    pub const INVALID_COMMAND: Self =
        Self::new(SCSI_SENSE_ILLEGAL_REQUEST, SCSI_CODE_ASC_INVALID_COMMAND_OPERATION_CODE, SCSI_CODE_ASCQ);
    pub const WRITE_ERROR: Self =
        Self::new(SCSI_SENSE_MEDIUM_ERROR, SCSI_CODE_ASC_WRITE_ERROR, SCSI_CODE_ASCQ);
}

/// INQUIRY identification strings, space padded as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryData {
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_rev: [u8; 4],
}

impl InquiryData {
    pub fn new(vendor: &str, product: &str, rev: &str) -> Self {
        Self {
            vendor_id: padded(vendor),
            product_id: padded(product),
            product_rev: padded(rev),
        }
    }
}

impl Default for InquiryData {
    fn default() -> Self {
        Self::new(VENDOR_ID, PRODUCT_ID, PRODUCT_REV)
    }
}

fn padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let n = s.len().min(N);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}
