//! Codec for the calibration NVRAM of the HP 3478A.
//!
//! The calibration memory is 256 bytes. Every byte holds one 4-bit nibble
//! in its low half, offset by 0x40 so the whole block consists of printable
//! ASCII characters (`@` to `O`). Nibble 0 mirrors the front panel CAL
//! ENABLE switch (0x0 when enabled, 0xF when disabled), nibbles 1..=247
//! form 19 records of 13 nibbles each and the last 8 bytes are unused
//! padding.
//!
//! Each record packs a 6-digit BCD offset, a 5-digit gain and a two-nibble
//! checksum. The gain digits are 4-bit two's complement, so a single digit
//! ranges from -8 to 7; the value is the deviation from a gain of 1.0 in
//! parts per million. The memory map is only partially documented, so the
//! layout constants below were validated against dumps from real hardware.

/// Errors raised when encoding calibration data. Decoding never fails for
/// data-validity reasons: a bad checksum only clears
/// [`CalramEntry::is_valid`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("calibration block has wrong length: expected {expected} bytes, got {actual}")]
    BlockLength { expected: usize, actual: usize },
    #[error("expected {expected} calibration entries, got {actual}")]
    EntryCount { expected: usize, actual: usize },
    #[error("gain {0} is outside the representable range")]
    GainOutOfRange(f64),
    #[error("offset {0} is outside the representable range")]
    OffsetOutOfRange(i32),
}

/// Size of the raw calibration memory in bytes.
pub const BLOCK_LENGTH: usize = 256;
/// Number of calibration records. Records 6, 17 and 19 are unused by the
/// firmware, so their checksums do not matter.
pub const ENTRY_COUNT: usize = 19;
/// Nibbles per record: 6 offset digits, 5 gain digits, 2 checksum nibbles.
const ENTRY_LENGTH: usize = 13;
/// Number of nibbles covered by the record checksum.
const DATA_NIBBLES: usize = 11;
/// Offset added to every nibble to make it a printable ASCII byte.
const ARMOR_OFFSET: u8 = 0x40;

const OFFSET_DIGITS: usize = 6;
const GAIN_DIGITS: usize = 5;

/// Gains are stored as a ppm deviation from 1.0 using five signed digits.
/// The carry encoding caps the first digit at 5, so the representable
/// deviation is -44444..=55555 ppm.
pub const GAIN_MIN: f64 = 0.955556;
pub const GAIN_MAX: f64 = 1.055555;

/// Raw offsets are six BCD digits with 900000..999999 mapping to the
/// negative values -100000..-1.
pub const OFFSET_MIN: i32 = -100_000;
pub const OFFSET_MAX: i32 = 899_999;

/// One of the 19 calibration records: per-range gain and offset correction
/// constants plus the stored checksum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalramEntry {
    /// Offset correction in raw counts.
    pub offset: i32,
    /// Gain correction, nominally close to 1.0.
    pub gain: f64,
    /// The checksum found in the record.
    pub checksum: u8,
    /// Whether the stored checksum matches the record data.
    pub is_valid: bool,
}

impl CalramEntry {
    /// Decodes one 13-nibble record. Never fails: a checksum mismatch is
    /// reported through `is_valid` and corrupted digits decode to whatever
    /// value their bit pattern represents.
    fn decode(nibbles: &[u8]) -> Self {
        debug_assert_eq!(nibbles.len(), ENTRY_LENGTH);
        let checksum = (nibbles[11] << 4) | (nibbles[12] & 0xF);
        CalramEntry {
            offset: decode_offset(&nibbles[..6]),
            gain: decode_gain(&nibbles[6..11]),
            checksum,
            is_valid: checksum == calculate_checksum(&nibbles[..DATA_NIBBLES]),
        }
    }

    /// Re-encodes the record to 13 nibbles. The checksum is recomputed
    /// from the current gain and offset, the stored one is ignored.
    fn encode(&self) -> Result<[u8; ENTRY_LENGTH], Error> {
        let mut nibbles = [0u8; ENTRY_LENGTH];
        nibbles[..6].copy_from_slice(&encode_offset(self.offset)?);
        nibbles[6..11].copy_from_slice(&encode_gain(self.gain)?);
        let checksum = calculate_checksum(&nibbles[..DATA_NIBBLES]);
        nibbles[11] = (checksum >> 4) & 0xF;
        nibbles[12] = checksum & 0xF;
        Ok(nibbles)
    }
}

/// The decoded calibration memory: the CAL ENABLE switch position at the
/// time of the dump and the 19 records in slot order.
#[derive(Debug, Clone, PartialEq)]
pub struct CalMemory {
    pub cal_enabled: bool,
    pub entries: Vec<CalramEntry>,
}

/// Decodes a raw 256-byte calibration memory dump as returned by the
/// instrument (or read back from a backup file).
pub fn decode_cal_data(raw: &[u8]) -> Result<CalMemory, Error> {
    if raw.len() != BLOCK_LENGTH {
        return Err(Error::BlockLength {
            expected: BLOCK_LENGTH,
            actual: raw.len(),
        });
    }
    // Corrupted bytes may dearmor to values above 0xF. They are carried
    // through unmasked so that a flipped high bit still breaks the
    // checksum instead of aliasing to a valid record.
    let nibbles: Vec<u8> = raw.iter().map(|b| b.wrapping_sub(ARMOR_OFFSET)).collect();
    let cal_enabled = nibbles[0] == 0x0;
    let entries = nibbles[1..1 + ENTRY_COUNT * ENTRY_LENGTH]
        .chunks_exact(ENTRY_LENGTH)
        .map(CalramEntry::decode)
        .collect();
    Ok(CalMemory {
        cal_enabled,
        entries,
    })
}

/// Encodes calibration records back to the raw 256-byte block, recomputing
/// all checksums. The result of decoding a well-formed block re-encodes to
/// the identical bytes.
pub fn encode_cal_data(memory: &CalMemory) -> Result<Vec<u8>, Error> {
    if memory.entries.len() != ENTRY_COUNT {
        return Err(Error::EntryCount {
            expected: ENTRY_COUNT,
            actual: memory.entries.len(),
        });
    }
    let mut raw = Vec::with_capacity(BLOCK_LENGTH);
    let switch_nibble: u8 = if memory.cal_enabled { 0x0 } else { 0xF };
    raw.push(switch_nibble + ARMOR_OFFSET);
    for entry in &memory.entries {
        raw.extend(entry.encode()?.iter().map(|n| n + ARMOR_OFFSET));
    }
    // Unused tail padding.
    raw.resize(BLOCK_LENGTH, ARMOR_OFFSET);
    Ok(raw)
}

/// Formats a raw calibration block as 16 lines of 16 characters for
/// display or backup files. Bytes outside the printable ASCII range are
/// replaced by `.` so the output is always safe to print.
pub fn format_cal_string(raw: &[u8]) -> String {
    raw.chunks(16)
        .map(|line| {
            line.iter()
                .map(|&b| {
                    if (0x20..0x7F).contains(&b) {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The record checksum is 0xFF minus the sum of the 11 data nibbles,
/// truncated to a byte.
fn calculate_checksum(nibbles: &[u8]) -> u8 {
    0xFFu8.wrapping_sub(nibbles.iter().fold(0u8, |sum, &n| sum.wrapping_add(n)))
}

fn decode_bcd(digits: &[i32]) -> i32 {
    digits.iter().fold(0, |value, &digit| value * 10 + digit)
}

/// Offsets are plain BCD with the top decade carrying the sign: raw
/// values >= 900000 represent -100000..-1.
fn decode_offset(nibbles: &[u8]) -> i32 {
    let digits: Vec<i32> = nibbles.iter().map(|&n| n as i32).collect();
    let value = decode_bcd(&digits);
    if value >= 900_000 {
        value - 1_000_000
    } else {
        value
    }
}

fn encode_offset(value: i32) -> Result<[u8; OFFSET_DIGITS], Error> {
    if !(OFFSET_MIN..=OFFSET_MAX).contains(&value) {
        return Err(Error::OffsetOutOfRange(value));
    }
    let mut raw = if value < 0 { value + 1_000_000 } else { value } as u32;
    let mut digits = [0u8; OFFSET_DIGITS];
    for digit in digits.iter_mut().rev() {
        *digit = (raw % 10) as u8;
        raw /= 10;
    }
    Ok(digits)
}

/// Gain digits are 4-bit two's complement: a nibble with bit 3 set is
/// negative. The decoded digit string is the ppm deviation from 1.0.
fn decode_gain(nibbles: &[u8]) -> f64 {
    let digits: Vec<i32> = nibbles
        .iter()
        .map(|&n| {
            if n & 0x08 != 0 {
                n as i32 - 0x10
            } else {
                n as i32
            }
        })
        .collect();
    1.0 + decode_bcd(&digits) as f64 / 1e6
}

/// Splits a digit sum into carry and a digit in -4..=5, the canonical form
/// used by the instrument firmware. The 8048 in the instrument has a
/// half-carry flag which makes this encoding natural there.
fn split_digit(value: i8) -> (i8, i8) {
    let (mut carry, mut digit) = (value / 10, value % 10);
    if digit > 5 {
        carry += 1;
        digit -= 10;
    }
    (carry, digit)
}

/// Encodes a gain into five signed BCD digits the same way the instrument
/// does. Not every representable value has a unique encoding; this
/// produces the canonical one observed in real calibration dumps.
fn encode_gain(value: f64) -> Result<[u8; GAIN_DIGITS], Error> {
    if !(GAIN_MIN..=GAIN_MAX).contains(&value) {
        return Err(Error::GainOutOfRange(value));
    }
    let ppm = ((value - 1.0) * 1e6).round() as i32;

    let mut digits = [0i8; GAIN_DIGITS];
    let mut rest = ppm.unsigned_abs();
    for digit in digits.iter_mut().rev() {
        *digit = (rest % 10) as i8;
        rest /= 10;
    }

    let mut result = [0i8; GAIN_DIGITS];
    for idx in (0..GAIN_DIGITS).rev() {
        let (carry, digit) = split_digit(result[idx] + digits[idx]);
        result[idx] = digit;
        if idx == 0 {
            if carry != 0 {
                return Err(Error::GainOutOfRange(value));
            }
        } else {
            result[idx - 1] += carry;
        }
    }

    let mut nibbles = [0u8; GAIN_DIGITS];
    for (nibble, &digit) in nibbles.iter_mut().zip(result.iter()) {
        let raw = if digit >= 0 { digit } else { digit + 16 } as u8;
        // A negative gain negates every digit, two's complement per nibble.
        *nibble = if ppm < 0 {
            (!raw).wrapping_add(1) & 0xF
        } else {
            raw
        };
    }
    Ok(nibbles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Gain values and their canonical encodings; most pairs were captured
    /// from a real HP 3478A.
    const GAIN_VECTORS: &[(f64, [u8; 5])] = &[
        (1.055555, [0x5, 0x5, 0x5, 0x5, 0x5]), // maximum
        (0.955556, [0xC, 0xC, 0xC, 0xC, 0xC]), // minimum
        (1.000983, [0x0, 0x1, 0x0, 0xE, 0x3]),
        (1.000694, [0x0, 0x1, 0xD, 0xF, 0x4]),
        (1.000807, [0x0, 0x1, 0xE, 0x1, 0xD]),
        (1.000467, [0x0, 0x0, 0x5, 0xD, 0xD]),
        (1.000581, [0x0, 0x1, 0xC, 0xE, 0x1]),
        (1.001621, [0x0, 0x2, 0xC, 0x2, 0x1]),
        (1.004753, [0x0, 0x5, 0xD, 0x5, 0x3]),
        (1.005234, [0x0, 0x5, 0x2, 0x3, 0x4]),
        (1.004592, [0x0, 0x5, 0xC, 0xF, 0x2]),
        (1.004031, [0x0, 0x4, 0x0, 0x3, 0x1]),
        (1.004270, [0x0, 0x4, 0x3, 0xD, 0x0]),
        (1.004295, [0x0, 0x4, 0x3, 0xF, 0x5]),
        (1.013028, [0x1, 0x3, 0x0, 0x3, 0xE]),
        (1.012524, [0x1, 0x2, 0x5, 0x2, 0x4]),
        (1.000000, [0x0, 0x0, 0x0, 0x0, 0x0]),
        (1.016995, [0x2, 0xD, 0x0, 0xF, 0x5]),
        (1.000006, [0x0, 0x0, 0x0, 0x1, 0xC]),
        (1.012906, [0x1, 0x3, 0xF, 0x1, 0xC]),
        (1.046777, [0x5, 0xD, 0xE, 0xE, 0xD]),
        (1.000770, [0x0, 0x1, 0xE, 0xD, 0x0]),
        (1.049000, [0x5, 0xF, 0x0, 0x0, 0x0]),
        (0.988906, [0xF, 0xF, 0xF, 0x1, 0xC]),
        (0.964445, [0xD, 0xB, 0xB, 0xB, 0xB]),
        (0.975996, [0xE, 0xC, 0x0, 0x0, 0xC]),
        (1.015996, [0x2, 0xC, 0x0, 0x0, 0xC]),
    ];

    /// Non-canonical encodings that must still decode correctly.
    const GAIN_DECODE_ONLY: &[(f64, [u8; 5])] = &[
        (1.000006, [0x0, 0x0, 0x0, 0x0, 0x6]),
        (1.012906, [0x1, 0x3, 0xF, 0x0, 0x6]),
        (1.015996, [0x1, 0x6, 0x0, 0xF, 0x6]),
    ];

    /// Builds one armored 13-byte record from offset and gain nibbles with
    /// a correct checksum.
    fn build_record(offset: [u8; 6], gain: [u8; 5]) -> [u8; 13] {
        let mut nibbles = [0u8; 13];
        nibbles[..6].copy_from_slice(&offset);
        nibbles[6..11].copy_from_slice(&gain);
        let checksum = calculate_checksum(&nibbles[..11]);
        nibbles[11] = (checksum >> 4) & 0xF;
        nibbles[12] = checksum & 0xF;
        nibbles.map(|n| n + ARMOR_OFFSET)
    }

    /// Builds a whole armored block out of a single repeated record.
    fn build_block(cal_enabled: bool, record: [u8; 13]) -> Vec<u8> {
        let mut raw = vec![if cal_enabled { 0x40 } else { 0x4F }];
        for _ in 0..ENTRY_COUNT {
            raw.extend_from_slice(&record);
        }
        raw.resize(BLOCK_LENGTH, ARMOR_OFFSET);
        raw
    }

    #[test]
    fn gain_encoder_matches_hardware_captures() {
        for &(gain, expected) in GAIN_VECTORS {
            assert_eq!(encode_gain(gain).unwrap(), expected, "gain {gain}");
        }
    }

    #[test]
    fn gain_decoder_matches_hardware_captures() {
        for &(gain, nibbles) in GAIN_VECTORS.iter().chain(GAIN_DECODE_ONLY) {
            assert_eq!(decode_gain(&nibbles), gain, "nibbles {nibbles:?}");
        }
    }

    #[test]
    fn gain_encoder_rejects_out_of_range() {
        for gain in [1.055556, 1.077777, 0.955555, 0.944445, 0.911112] {
            assert_matches!(encode_gain(gain), Err(Error::GainOutOfRange(_)), "{gain}");
        }
    }

    #[test]
    fn offset_roundtrip_and_sign_decade() {
        assert_eq!(encode_offset(0).unwrap(), [0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_offset(10).unwrap(), [0, 0, 0, 0, 1, 0]);
        assert_eq!(encode_offset(899_999).unwrap(), [8, 9, 9, 9, 9, 9]);
        // -1 encodes as 999999, -100000 as 900000
        assert_eq!(encode_offset(-1).unwrap(), [9, 9, 9, 9, 9, 9]);
        assert_eq!(encode_offset(-100_000).unwrap(), [9, 0, 0, 0, 0, 0]);
        assert_eq!(decode_offset(&[9, 9, 9, 9, 9, 9]), -1);
        assert_eq!(decode_offset(&[9, 0, 0, 0, 0, 0]), -100_000);
        assert_eq!(decode_offset(&[0, 0, 0, 0, 1, 0]), 10);
        assert_matches!(encode_offset(900_000), Err(Error::OffsetOutOfRange(_)));
        assert_matches!(encode_offset(-100_001), Err(Error::OffsetOutOfRange(_)));
    }

    #[test]
    fn decodes_valid_entry() {
        // gain = 1.000000, offset = 10 counts, correct checksum
        let raw = build_block(true, build_record([0, 0, 0, 0, 1, 0], [0, 0, 0, 0, 0]));
        let memory = decode_cal_data(&raw).unwrap();
        assert!(memory.cal_enabled);
        assert_eq!(memory.entries.len(), ENTRY_COUNT);
        let entry = &memory.entries[0];
        assert!(entry.is_valid);
        assert_eq!(entry.gain, 1.0);
        assert_eq!(entry.offset, 10);
    }

    #[test]
    fn single_bit_flip_invalidates_entry_without_failing() {
        let mut raw = build_block(true, build_record([0, 0, 0, 0, 1, 0], [0, 0, 0, 0, 0]));
        assert!(decode_cal_data(&raw).unwrap().entries[0].is_valid);

        // Flip a bit inside the first record's offset field.
        raw[5] ^= 0x80;
        let memory = decode_cal_data(&raw).unwrap();
        assert!(!memory.entries[0].is_valid);
        // The remaining records are untouched and still valid.
        assert!(memory.entries[1..].iter().all(|e| e.is_valid));
    }

    #[test]
    fn decode_rejects_wrong_block_length() {
        assert_matches!(
            decode_cal_data(&[0x40; 255]),
            Err(Error::BlockLength {
                expected: BLOCK_LENGTH,
                actual: 255
            })
        );
    }

    #[test]
    fn encode_rejects_wrong_entry_count() {
        let memory = CalMemory {
            cal_enabled: true,
            entries: vec![
                CalramEntry {
                    offset: 0,
                    gain: 1.0,
                    checksum: 0,
                    is_valid: true
                };
                18
            ],
        };
        assert_matches!(
            encode_cal_data(&memory),
            Err(Error::EntryCount {
                expected: ENTRY_COUNT,
                actual: 18
            })
        );
    }

    #[test]
    fn roundtrip_preserves_well_formed_blocks() {
        // A block mixing several distinct, canonically encoded records.
        let mut raw = vec![0x4F];
        let records = [
            build_record([0, 0, 0, 0, 1, 0], [0x0, 0x1, 0x0, 0xE, 0x3]),
            build_record([9, 9, 9, 9, 9, 9], [0x5, 0x5, 0x5, 0x5, 0x5]),
            build_record([0, 1, 2, 3, 4, 5], [0xC, 0xC, 0xC, 0xC, 0xC]),
        ];
        for i in 0..ENTRY_COUNT {
            raw.extend_from_slice(&records[i % records.len()]);
        }
        raw.resize(BLOCK_LENGTH, ARMOR_OFFSET);

        let memory = decode_cal_data(&raw).unwrap();
        assert!(!memory.cal_enabled);
        assert!(memory.entries.iter().all(|e| e.is_valid));
        assert_eq!(encode_cal_data(&memory).unwrap(), raw);
    }

    #[test]
    fn encode_recomputes_checksum_after_modification() {
        let raw = build_block(true, build_record([0, 0, 0, 0, 0, 0], [0, 0, 0, 0, 0]));
        let mut memory = decode_cal_data(&raw).unwrap();
        memory.entries[5].gain = 1.000983;
        let reencoded = encode_cal_data(&memory).unwrap();
        let reread = decode_cal_data(&reencoded).unwrap();
        assert_eq!(reread.entries[5].gain, 1.000983);
        assert!(reread.entries[5].is_valid);
    }

    #[test]
    fn armored_blocks_are_printable() {
        let raw = build_block(true, build_record([9, 0, 0, 0, 0, 0], [0xF, 0xF, 0xF, 0x1, 0xC]));
        assert!(raw.iter().all(|b| (0x20..0x7F).contains(b)));
        let encoded = encode_cal_data(&decode_cal_data(&raw).unwrap()).unwrap();
        assert!(encoded.iter().all(|b| (0x20..0x7F).contains(b)));
    }

    #[test]
    fn format_cal_string_is_printable_and_line_wrapped() {
        let mut raw = build_block(false, build_record([0, 0, 0, 0, 0, 0], [0, 0, 0, 0, 0]));
        raw[20] = 0x07; // simulate a corrupted, unprintable byte
        let formatted = format_cal_string(&raw);
        let lines: Vec<&str> = formatted.lines().collect();
        assert_eq!(lines.len(), 16);
        assert!(lines.iter().all(|l| l.len() == 16));
        assert!(formatted
            .chars()
            .all(|c| c == '\n' || (' '..='~').contains(&c)));
        assert!(lines[1].contains('.'));
    }
}
