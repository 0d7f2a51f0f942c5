//! Netascii transcoding (RFC 764)
//!
//! On the wire every line ends in CR LF and a bare carriage return is sent
//! as CR NUL. Locally lines end in LF.
//!
//! | local | network  |
//! |-------|----------|
//! | LF    | CR LF    |
//! | CR    | CR NUL   |
//!
//! Both directions work on chunks so a transfer never has to hold the
//! whole file in memory.

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

/// Local to network translation, used when serving a read request
#[derive(Debug, Default, Clone, Copy)]
pub struct NetasciiEncoder;

impl NetasciiEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Append the network form of `input` to `out`
    pub fn encode_into(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len() + input.len() / 16);
        for &byte in input {
            match byte {
                LF => out.extend_from_slice(&[CR, LF]),
                CR => out.extend_from_slice(&[CR, NUL]),
                _ => out.push(byte),
            }
        }
    }

    /// Number of bytes `input` occupies once encoded
    pub fn encoded_len(input: &[u8]) -> usize {
        input.len() + input.iter().filter(|&&b| b == LF || b == CR).count()
    }
}

/// Network to local translation, used when receiving a write request
///
/// A CR at the end of one chunk is held back until the next byte shows
/// whether it starts a CR LF or CR NUL pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetasciiDecoder {
    pending_cr: bool,
}

impl NetasciiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the local form of `input` to `out`
    pub fn decode_into(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    LF => out.push(LF),
                    NUL => out.push(CR),
                    CR => {
                        // not valid netascii; keep the first CR literally
                        out.push(CR);
                        self.pending_cr = true;
                    }
                    _ => out.extend_from_slice(&[CR, byte]),
                }
            } else if byte == CR {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }
    }

    /// Flush a trailing CR that never got its second byte
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_cr) {
            out.push(CR);
        }
    }
}

/// Encode a complete buffer
///
/// # Examples
/// ```
/// use tftp::netascii;
///
/// assert_eq!(netascii::encode(b"a\nb\rc"), b"a\r\nb\r\0c");
/// ```
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NetasciiEncoder::encoded_len(input));
    NetasciiEncoder::new().encode_into(input, &mut out);
    out
}

/// Decode a complete buffer
///
/// # Examples
/// ```
/// use tftp::netascii;
///
/// assert_eq!(netascii::decode(b"a\r\nb\r\0c"), b"a\nb\rc");
/// ```
pub fn decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut decoder = NetasciiDecoder::new();
    decoder.decode_into(input, &mut out);
    decoder.finish(&mut out);
    out
}
