//! CRC16/XMODEM (poly 0x1021, no reflection, no final xor).
//!
//! The bootloader checks the filename packet and every 1024-byte firmware
//! block against this checksum, sent big-endian after the payload.

const CRC16_POLY: u16 = 0x1021;

const CRC16_TABLE: [u16; 256] = generate_crc16_table();

const fn generate_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Continue a CRC16/XMODEM computation from `crc` over `data`.
///
/// Pass `0` as the seed for a fresh checksum. Empty input returns the seed.
pub fn crc16_xmodem(data: &[u8], crc: u16) -> u16 {
    data.iter().fold(crc, |crc, &byte| {
        (crc << 8) ^ CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize]
    })
}
