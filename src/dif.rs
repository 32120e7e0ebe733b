//! DIF wire codec.
//!
//! A DIF record is a length-delimited binary frame produced by the
//! front-end electronics: a global header carrying the chamber id and
//! trigger/bunch-crossing counters, a sequence of per-chip hit frames and
//! a CRC-16 trailer computed over every byte starting at the global header
//! marker. Two header variants exist on the wire: the classic 24-byte one
//! (marker `0xB0`) and an extended 33-byte one (marker `0xBB`) whose nine
//! trailing bytes carry auxiliary counters that consumers discard.

use std::io::{self, Read, Write};

use crate::crc::Crc16;
use crate::error::{ErrorKind, Result};

/// Global header marker, classic 24-byte header.
pub const GB_HEADER: u8 = 0xB0;
/// Global header marker, extended 33-byte header.
pub const GB_HEADER_EXT: u8 = 0xBB;
/// Global trailer marker, followed by the CRC-16.
pub const GB_TRAILER: u8 = 0xA0;
/// Hit-frame block marker.
pub const FR_HEADER: u8 = 0xB4;
/// Hit-frame block trailer.
pub const FR_TRAILER: u8 = 0xA3;
/// Analog-frame block marker (unsupported by this DAQ).
pub const AN_HEADER: u8 = 0xC4;
/// In-band marker for a frame the hardware could not complete.
pub const INC_FRAME: u8 = 0xC3;

/// Bytes of discriminator payload per frame.
pub const FRAME_DATA_LEN: usize = 16;

const HDR_LEN: usize = 23;
const HDR_EXT_LEN: usize = 32;

/// Global DIF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalHeader {
    /// Chamber identifier.
    pub id: u8,
    /// DIF trigger counter.
    pub dtc: u32,
    /// Acquisition trigger counter.
    pub atc: u32,
    /// Global trigger counter.
    pub gtc: u32,
    /// Absolute bunch-crossing counter (48 bits carried in a u64).
    pub abs_bcid: u64,
    /// DIF trigger time (24 bits carried in a u32).
    pub time_dif_tc: u32,
}

/// One hardroc hit frame: chip address, relative bunch crossing and the
/// raw discriminator payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Chip (hardroc) address.
    pub header: u8,
    /// Relative bunch-crossing counter (24 bits carried in a u32).
    pub bcid: u32,
    /// Discriminator payload, as produced by the chip.
    pub data: [u8; FRAME_DATA_LEN],
}

/// A complete DIF record. Frame order on the wire is preserved on decode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dif {
    pub header: GlobalHeader,
    pub frames: Vec<Frame>,
}

/// Encodes DIF records to an output stream, appending the CRC-16 trailer.
pub struct Encoder<W: Write> {
    w: W,
    crc: Crc16,
}

impl<W: Write> Encoder<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            crc: Crc16::new(),
        }
    }

    /// Encode one record. Write errors from the underlying sink are
    /// surfaced as-is.
    pub fn encode(&mut self, dif: &Dif) -> Result<()> {
        self.header(&dif.header)?;
        self.put(&[FR_HEADER])?;
        for frame in &dif.frames {
            self.frame(frame)?;
        }
        self.put(&[FR_TRAILER])?;
        self.trailer()
    }

    /// Encode one record the way the board readout ships it: each run of
    /// frames from the same chip is wrapped in its own frame-block
    /// markers. The output decodes identically to [`Encoder::encode`]'s.
    pub fn encode_grouped(&mut self, dif: &Dif) -> Result<()> {
        self.header(&dif.header)?;
        let mut last_chip = None;
        for frame in &dif.frames {
            if last_chip != Some(frame.header) {
                if last_chip.is_some() {
                    self.put(&[FR_TRAILER])?;
                }
                self.put(&[FR_HEADER])?;
                last_chip = Some(frame.header);
            }
            self.frame(frame)?;
        }
        if last_chip.is_none() {
            self.put(&[FR_HEADER])?;
        }
        self.put(&[FR_TRAILER])?;
        self.trailer()
    }

    pub fn into_inner(self) -> W {
        self.w
    }

    fn header(&mut self, hdr: &GlobalHeader) -> Result<()> {
        self.crc.reset();
        self.put(&[GB_HEADER, hdr.id])?;
        self.put(&hdr.dtc.to_be_bytes())?;
        self.put(&hdr.atc.to_be_bytes())?;
        self.put(&hdr.gtc.to_be_bytes())?;
        self.put(&hdr.abs_bcid.to_be_bytes()[2..])?;
        self.put(&hdr.time_dif_tc.to_be_bytes()[1..])?;
        // reserved "nlines" byte
        self.put(&[0x00])
    }

    fn frame(&mut self, frame: &Frame) -> Result<()> {
        self.put(&[frame.header])?;
        self.put(&frame.bcid.to_be_bytes()[1..])?;
        self.put(&frame.data)
    }

    fn trailer(&mut self) -> Result<()> {
        self.put(&[GB_TRAILER])?;
        let sum = self.crc.sum16();
        self.w.write_all(&sum.to_be_bytes())?;
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.w.write_all(bytes)?;
        self.crc.update(bytes);
        Ok(())
    }
}

/// Decodes DIF records from an input stream, validating markers, the
/// chamber id and the CRC-16 trailer on the fly.
///
/// The decoder is reusable: consecutive records may be decoded from the
/// same stream.
pub struct Decoder<R: Read> {
    r: R,
    dif_id: u8,
    eda: bool,
    crc: Crc16,
    /// Byte read past the end of the previous record in EDA mode that
    /// turned out to start the next one.
    peeked: Option<u8>,
}

impl<R: Read> Decoder<R> {
    /// Create a decoder expecting records for chamber `dif_id`.
    pub fn new(dif_id: u8, r: R) -> Self {
        Self {
            r,
            dif_id,
            eda: false,
            crc: Crc16::new(),
            peeked: None,
        }
    }

    /// Chamber id this decoder accepts.
    pub fn dif_id(&self) -> u8 {
        self.dif_id
    }

    /// EDA boards pad some records with a stray trailing byte; with EDA
    /// mode enabled the decoder consumes and discards it instead of
    /// tripping over it at the start of the next record.
    pub fn set_eda_mode(&mut self, on: bool) {
        self.eda = on;
    }

    pub fn into_inner(self) -> R {
        self.r
    }

    /// Decode the next record from the stream into `dif`.
    pub fn decode(&mut self, dif: &mut Dif) -> Result<()> {
        self.crc.reset();
        let marker = match self.next_byte()? {
            Some(v) => v,
            None => return Err(ErrorKind::InputExhausted.into()),
        };
        self.crc.update(&[marker]);
        let hdr_len = match marker {
            GB_HEADER => HDR_LEN,
            GB_HEADER_EXT => HDR_EXT_LEN,
            v => return Err(ErrorKind::BadMarker(v).into()),
        };

        let mut hdr = [0u8; HDR_EXT_LEN];
        self.fill(&mut hdr[..hdr_len])?;
        if hdr[0] != self.dif_id {
            return Err(ErrorKind::WrongChamberId {
                got: hdr[0],
                want: self.dif_id,
            }
            .into());
        }
        // hdr[22] is the reserved "nlines" byte; the extended variant's
        // extra bytes beyond it are checksummed but otherwise dropped.
        dif.header = GlobalHeader {
            id: hdr[0],
            dtc: u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]),
            atc: u32::from_be_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]),
            gtc: u32::from_be_bytes([hdr[9], hdr[10], hdr[11], hdr[12]]),
            abs_bcid: u64::from_be_bytes([
                0, 0, hdr[13], hdr[14], hdr[15], hdr[16], hdr[17], hdr[18],
            ]),
            time_dif_tc: u32::from_be_bytes([0, hdr[19], hdr[20], hdr[21]]),
        };
        dif.frames.clear();

        loop {
            let marker = self.read_byte()?;
            match marker {
                AN_HEADER => return Err(ErrorKind::AnalogUnsupported.into()),
                FR_HEADER => self.read_frames(&mut dif.frames)?,
                GB_TRAILER => {
                    let want = self.crc.sum16();
                    let mut raw = [0u8; 2];
                    self.fill_nocrc(&mut raw)?;
                    let got = u16::from_be_bytes(raw);
                    if got != want {
                        return Err(ErrorKind::CrcMismatch { got, want }.into());
                    }
                    if self.eda {
                        self.skip_pad()?;
                    }
                    return Ok(());
                }
                v => return Err(ErrorKind::BadMarker(v).into()),
            }
        }
    }

    /// Frame loop: runs from a `FR_HEADER` to the matching `FR_TRAILER`.
    fn read_frames(&mut self, frames: &mut Vec<Frame>) -> Result<()> {
        loop {
            let byte = self.read_byte()?;
            match byte {
                INC_FRAME => return Err(ErrorKind::IncompleteFrame.into()),
                FR_TRAILER => return Ok(()),
                header => {
                    let mut payload = [0u8; 3 + FRAME_DATA_LEN];
                    self.fill(&mut payload)?;
                    let mut data = [0u8; FRAME_DATA_LEN];
                    data.copy_from_slice(&payload[3..]);
                    frames.push(Frame {
                        header,
                        bcid: u32::from_be_bytes([0, payload[0], payload[1], payload[2]]),
                        data,
                    });
                }
            }
        }
    }

    /// Next raw byte, honoring the one-byte pushback; `None` on EOF.
    /// Does not touch the CRC.
    fn next_byte(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.peeked.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        loop {
            match self.r.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One in-record byte: EOF here means the record was cut short.
    fn read_byte(&mut self) -> Result<u8> {
        match self.next_byte()? {
            Some(b) => {
                self.crc.update(&[b]);
                Ok(b)
            }
            None => Err(ErrorKind::UnexpectedEof.into()),
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.fill_nocrc(buf)?;
        self.crc.update(buf);
        Ok(())
    }

    fn fill_nocrc(&mut self, buf: &mut [u8]) -> Result<()> {
        self.r.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ErrorKind::UnexpectedEof.into()
            } else {
                crate::error::Error::from(e)
            }
        })
    }

    /// Consume the hardware pad byte following a record, keeping the byte
    /// around when it actually starts the next record.
    fn skip_pad(&mut self) -> Result<()> {
        match self.next_byte()? {
            Some(b) if b == GB_HEADER || b == GB_HEADER_EXT => self.peeked = Some(b),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    /// Canonical two-frame record used across the codec tests.
    fn two_frame_dif() -> Dif {
        let data: [u8; 16] = [
            20, 21, 22, 23, 24, 25, 26, 27, 30, 31, 32, 33, 34, 35, 36, 37,
        ];
        Dif {
            header: GlobalHeader {
                id: 0x42,
                dtc: 10,
                atc: 11,
                gtc: 12,
                abs_bcid: 0x0000_1122_3344_5566,
                time_dif_tc: 0x0011_2233,
            },
            frames: vec![
                Frame {
                    header: 1,
                    bcid: 0x000a_0b0c,
                    data,
                },
                Frame {
                    header: 2,
                    bcid: 0x000a_0b0c,
                    data,
                },
            ],
        }
    }

    /// Wire image of `two_frame_dif()` under the classic 0xB0 header.
    const TWO_FRAME_WIRE: [u8; 69] = [
        0xB0, 0x42, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x0B, 0x00, 0x00, //
        0x00, 0x0C, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x11, 0x22, 0x33, 0x00, //
        0xB4, 0x01, 0x0A, 0x0B, 0x0C, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, //
        0x1B, 0x1E, 0x1F, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x02, 0x0A, 0x0B, //
        0x0C, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1E, 0x1F, 0x20, //
        0x21, 0x22, 0x23, 0x24, 0x25, 0xA3, 0xA0, 0x4C, 0x1A,
    ];

    /// Same record under the extended 0xBB header with auxiliary bytes
    /// 0..=8; the consumer drops them, the CRC does not.
    const TWO_FRAME_WIRE_EXT: [u8; 78] = [
        0xBB, 0x42, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x0B, 0x00, 0x00, //
        0x00, 0x0C, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x11, 0x22, 0x33, 0x00, //
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xB4, 0x01, 0x0A, //
        0x0B, 0x0C, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1E, 0x1F, //
        0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x02, 0x0A, 0x0B, 0x0C, 0x14, 0x15, //
        0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1E, 0x1F, 0x20, 0x21, 0x22, 0x23, //
        0x24, 0x25, 0xA3, 0xA0, 0x52, 0x3F,
    ];

    fn encode(dif: &Dif) -> Vec<u8> {
        let mut enc = Encoder::new(Vec::new());
        enc.encode(dif).expect("encoding to a Vec cannot fail");
        enc.into_inner()
    }

    fn decode_one(id: u8, bytes: &[u8]) -> crate::error::Result<Dif> {
        let mut dif = Dif::default();
        Decoder::new(id, bytes).decode(&mut dif)?;
        Ok(dif)
    }

    #[test]
    fn test_encode_two_frames() {
        assert_eq!(encode(&two_frame_dif())[..], TWO_FRAME_WIRE[..]);
    }

    #[test]
    fn test_round_trip() {
        let dif = two_frame_dif();
        let got = decode_one(0x42, &encode(&dif)).expect("decode failed");
        assert_eq!(got, dif);
    }

    #[test]
    fn test_round_trip_empty_frames() {
        let dif = Dif {
            header: two_frame_dif().header,
            frames: Vec::new(),
        };
        let wire = encode(&dif);
        assert_eq!(wire.len(), 29);
        let got = decode_one(0x42, &wire).expect("decode failed");
        assert_eq!(got, dif);
    }

    #[test]
    fn test_encode_grouped_reframes_on_chip_change() {
        let mut dif = two_frame_dif();
        let extra = Frame {
            header: 1,
            bcid: 0x000a_0b0d,
            ..dif.frames[0]
        };
        dif.frames.insert(1, extra);
        // chips 1,1,2: the second chip opens a fresh frame block
        let mut enc = Encoder::new(Vec::new());
        enc.encode_grouped(&dif).expect("encoding to a Vec cannot fail");
        let wire = enc.into_inner();
        let body = &wire[..wire.len() - 2];
        let blocks = body.iter().filter(|&&b| b == FR_HEADER).count();
        let trailers = body.iter().filter(|&&b| b == FR_TRAILER).count();
        assert_eq!((blocks, trailers), (2, 2));

        let got = decode_one(0x42, &wire).expect("grouped record does not decode");
        assert_eq!(got, dif);
    }

    #[test]
    fn test_encode_grouped_single_chip_matches_plain() {
        let mut dif = two_frame_dif();
        for frame in &mut dif.frames {
            frame.header = 1;
        }
        let mut enc = Encoder::new(Vec::new());
        enc.encode_grouped(&dif).unwrap();
        assert_eq!(enc.into_inner(), encode(&dif));
    }

    #[test]
    fn test_encode_grouped_empty_matches_plain() {
        let dif = Dif {
            header: two_frame_dif().header,
            frames: Vec::new(),
        };
        let mut enc = Encoder::new(Vec::new());
        enc.encode_grouped(&dif).unwrap();
        assert_eq!(enc.into_inner(), encode(&dif));
    }

    #[test]
    fn test_decode_extended_header() {
        let got = decode_one(0x42, &TWO_FRAME_WIRE_EXT).expect("decode failed");
        assert_eq!(got, two_frame_dif());
    }

    #[test]
    fn test_decoder_is_reusable() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TWO_FRAME_WIRE);
        stream.extend_from_slice(&TWO_FRAME_WIRE);
        let mut dec = Decoder::new(0x42, &stream[..]);
        let mut dif = Dif::default();
        dec.decode(&mut dif).expect("first record");
        assert_eq!(dif, two_frame_dif());
        dec.decode(&mut dif).expect("second record");
        assert_eq!(dif, two_frame_dif());
        assert_eq!(
            dec.decode(&mut dif).unwrap_err().kind(),
            ErrorKind::InputExhausted
        );
    }

    #[test]
    fn test_crc_mismatch() {
        let mut wire = TWO_FRAME_WIRE;
        wire[67] = 0xB5;
        wire[68] = 0xFF;
        assert_eq!(
            decode_one(0x42, &wire).unwrap_err().kind(),
            ErrorKind::CrcMismatch {
                got: 0xB5FF,
                want: 0x4C1A
            }
        );
    }

    #[test]
    fn test_wrong_chamber_id() {
        let mut wire = TWO_FRAME_WIRE;
        wire[1] = 0x43;
        assert_eq!(
            decode_one(0x42, &wire).unwrap_err().kind(),
            ErrorKind::WrongChamberId {
                got: 0x43,
                want: 0x42
            }
        );
    }

    #[test]
    fn test_truncated_header() {
        let wire = [GB_HEADER, 0x42, 0x01, 0x02];
        assert_eq!(
            decode_one(0x42, &wire).unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            decode_one(0x42, &[]).unwrap_err().kind(),
            ErrorKind::InputExhausted
        );
    }

    #[test]
    fn test_bad_global_marker() {
        assert_eq!(
            decode_one(0x42, &[0x55]).unwrap_err().kind(),
            ErrorKind::BadMarker(0x55)
        );
    }

    #[test]
    fn test_analog_frame_rejected() {
        let mut wire = TWO_FRAME_WIRE;
        wire[24] = AN_HEADER;
        assert_eq!(
            decode_one(0x42, &wire).unwrap_err().kind(),
            ErrorKind::AnalogUnsupported
        );
    }

    #[test]
    fn test_incomplete_frame_rejected() {
        let mut wire = TWO_FRAME_WIRE;
        wire[25] = INC_FRAME;
        assert_eq!(
            decode_one(0x42, &wire).unwrap_err().kind(),
            ErrorKind::IncompleteFrame
        );
    }

    /// Any truncation of a valid record must fail, never succeed.
    #[test]
    fn test_truncation_sweep() {
        for len in 0..TWO_FRAME_WIRE.len() {
            let err = decode_one(0x42, &TWO_FRAME_WIRE[..len])
                .expect_err("truncated record decoded successfully");
            match err.kind() {
                ErrorKind::InputExhausted | ErrorKind::UnexpectedEof => {}
                kind => panic!("truncation at {} gave {:?}", len, kind),
            }
        }
    }

    /// Any single-byte corruption outside the CRC field must fail.
    #[test]
    fn test_corruption_sweep() {
        for i in 0..TWO_FRAME_WIRE.len() - 2 {
            let mut wire = TWO_FRAME_WIRE;
            wire[i] ^= 0xFF;
            assert!(
                decode_one(0x42, &wire).is_err(),
                "corruption at {} decoded successfully",
                i
            );
        }
    }

    #[test]
    fn test_eda_mode_pad_byte() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TWO_FRAME_WIRE);
        stream.push(0x00);
        stream.extend_from_slice(&TWO_FRAME_WIRE);
        stream.push(0x00);

        let mut dec = Decoder::new(0x42, &stream[..]);
        dec.set_eda_mode(true);
        let mut dif = Dif::default();
        dec.decode(&mut dif).expect("first padded record");
        assert_eq!(dif, two_frame_dif());
        dec.decode(&mut dif).expect("second padded record");
        assert_eq!(dif, two_frame_dif());
        assert_eq!(
            dec.decode(&mut dif).unwrap_err().kind(),
            ErrorKind::InputExhausted
        );
    }

    #[test]
    fn test_pad_byte_rejected_without_eda_mode() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&TWO_FRAME_WIRE);
        stream.push(0x00);
        stream.extend_from_slice(&TWO_FRAME_WIRE);

        let mut dec = Decoder::new(0x42, &stream[..]);
        let mut dif = Dif::default();
        dec.decode(&mut dif).expect("first record");
        assert_eq!(
            dec.decode(&mut dif).unwrap_err().kind(),
            ErrorKind::BadMarker(0x00)
        );
    }
}
