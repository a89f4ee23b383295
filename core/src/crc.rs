/// Initial register value for the frame check sequence
pub const CRC_INIT: u16 = 0xFFFF;

/// Feed one byte into a CRC-16-CCITT register (reflected, polynomial 0x8408).
///
/// This is the bit-serial HDLC variant: bytes are shifted in LSB first, the
/// same order the framer puts them on the air.
pub fn crc_ccitt_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ byte as u16;
    for _ in 0..8 {
        if crc & 0x0001 != 0 {
            crc = (crc >> 1) ^ 0x8408;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// CRC-16-CCITT of a byte slice, starting from [`CRC_INIT`], not complemented
pub fn crc_ccitt(data: &[u8]) -> u16 {
    data.iter().fold(CRC_INIT, |crc, &b| crc_ccitt_update(crc, b))
}

/// Frame check sequence bytes as transmitted: complemented, low byte first
pub fn fcs_bytes(crc: u16) -> [u8; 2] {
    [(crc as u8) ^ 0xFF, ((crc >> 8) as u8) ^ 0xFF]
}

/// Recover the register value a received FCS was generated from
pub fn fcs_value(lo: u8, hi: u8) -> u16 {
    ((lo ^ 0xFF) as u16) | (((hi ^ 0xFF) as u16) << 8)
}
