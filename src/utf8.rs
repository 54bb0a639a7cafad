/// Streaming UTF-8 validator for text message payloads.
///
/// The engine hands payload bytes to the caller in arbitrary slices, so a
/// multi-byte sequence can be cut anywhere: across two reads of one frame, or
/// across two fragments of one message. The validator keeps the partially
/// decoded sequence between calls. It must not be reset between fragments of
/// the same message, only between messages.
#[derive(Debug, Default)]
pub(crate) struct Utf8Validator {
    sequence_in_progress: bool,
    additional_bytes: u8,
    bits: u32,
    min: u32,
}

impl Utf8Validator {
    /// Feed the next slice of the message. Returns false on the first byte
    /// that can't belong to well-formed UTF-8.
    pub fn advance(&mut self, data: &[u8]) -> bool {
        for &byte in data {
            if !self.sequence_in_progress {
                // Classify the leading byte. The data bits it contributes and
                // the smallest code point its length may legally encode are
                // recorded for the continuation bytes to build on.
                match byte {
                    0x00..=0x7F => {}
                    0xC0..=0xDF => self.begin(1, u32::from(byte & 0x1F), 0x80),
                    0xE0..=0xEF => self.begin(2, u32::from(byte & 0x0F), 0x800),
                    0xF0..=0xF7 => self.begin(3, u32::from(byte & 0x07), 0x1_0000),
                    // Stray continuation bytes and the forever-invalid
                    // 0xF8..=0xFF leaders
                    _ => return false,
                }
            } else {
                if byte & 0b1100_0000 != 0b1000_0000 {
                    return false;
                }
                self.bits = (self.bits << 6) | u32::from(byte & 0x3F);
                self.additional_bytes -= 1;

                if self.additional_bytes == 1 {
                    // One byte before the end the running value already pins
                    // the code point down to a 64-wide range: enough to
                    // reject surrogates and anything beyond U+10FFFF early
                    if self.min == 0x800 && (0xD800 >> 6..=0xDFFF >> 6).contains(&self.bits) {
                        return false;
                    }
                    if self.min == 0x1_0000 && self.bits >= 0x11_0000 >> 6 {
                        return false;
                    }
                } else if self.additional_bytes == 0 {
                    // Overlong encodings decode below the minimum their
                    // length implies
                    if self.bits < self.min {
                        return false;
                    }
                    self.sequence_in_progress = false;
                }
            }
        }
        true
    }

    /// The message ended. A sequence still in progress was truncated and
    /// makes the message invalid. Resets the state for the next message
    /// either way.
    pub fn finish(&mut self) -> bool {
        let complete = !self.sequence_in_progress;
        *self = Utf8Validator::default();
        complete
    }

    fn begin(&mut self, additional_bytes: u8, bits: u32, min: u32) {
        self.sequence_in_progress = true;
        self.additional_bytes = additional_bytes;
        self.bits = bits;
        self.min = min;
    }
}
