//! The stream filter (codec) pipeline: FlateDecode + PNG predictor,
//! LZWDecode via `weezl`, and hand-rolled ASCII85/ASCIIHex codecs.
//! Decoding uses `libflate`, encoding uses `deflate` (the two zlib crates
//! actually declared as dependencies). LZW encoding supports
//! `EarlyChange=1` by running the same `with_tiff_size_switch` helper on
//! the encode side as on decode.

use crate::error::{bail, PdfError, Result};
use crate::primitive::{Dictionary, Primitive};
use itertools::Itertools;
use std::convert::TryInto;
use std::io::Read;

/// Decode parameters shared by FlateDecode and LZWDecode.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParams {
    pub predictor: i32,
    pub n_components: i32,
    pub bits_per_component: i32,
    pub columns: i32,
    pub early_change: i32,
}
impl Default for FilterParams {
    fn default() -> Self {
        FilterParams {
            predictor: 1,
            n_components: 1,
            bits_per_component: 8,
            columns: 1,
            early_change: 1,
        }
    }
}
impl FilterParams {
    fn from_dict(dict: &Dictionary) -> Result<Self> {
        let mut p = FilterParams::default();
        if let Some(v) = dict.get("Predictor") {
            p.predictor = v.as_integer()? as i32;
        }
        if let Some(v) = dict.get("Colors") {
            p.n_components = v.as_integer()? as i32;
        }
        if let Some(v) = dict.get("BitsPerComponent") {
            p.bits_per_component = v.as_integer()? as i32;
        }
        if let Some(v) = dict.get("Columns") {
            p.columns = v.as_integer()? as i32;
        }
        if let Some(v) = dict.get("EarlyChange") {
            p.early_change = v.as_integer()? as i32;
        }
        Ok(p)
    }
}

/// The filter chain entry for a single `/Filter` name. Filters not decodable
/// by the CORE (image codecs, RunLength, Crypt) are retained by name so the
/// writer can still round-trip a stream it never needed to decode, but any
/// `decode()` attempt on them fails with `UnsupportedFilter`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFilter {
    ASCIIHexDecode,
    ASCII85Decode,
    LZWDecode(FilterParams),
    FlateDecode(FilterParams),
    Unsupported(String),
}
impl StreamFilter {
    pub fn from_kind_and_params(kind: &str, params: &Dictionary) -> Result<StreamFilter> {
        Ok(match kind {
            "ASCIIHexDecode" => StreamFilter::ASCIIHexDecode,
            "ASCII85Decode" => StreamFilter::ASCII85Decode,
            "LZWDecode" => StreamFilter::LZWDecode(FilterParams::from_dict(params)?),
            "FlateDecode" => StreamFilter::FlateDecode(FilterParams::from_dict(params)?),
            other => StreamFilter::Unsupported(other.to_string()),
        })
    }
    pub fn name(&self) -> &str {
        match self {
            StreamFilter::ASCIIHexDecode => "ASCIIHexDecode",
            StreamFilter::ASCII85Decode => "ASCII85Decode",
            StreamFilter::LZWDecode(_) => "LZWDecode",
            StreamFilter::FlateDecode(_) => "FlateDecode",
            StreamFilter::Unsupported(s) => s.as_str(),
        }
    }
}

#[inline]
fn decode_nibble(c: u8) -> Option<u8> {
    match c {
        n @ b'0'..=b'9' => Some(n - b'0'),
        a @ b'a'..=b'f' => Some(a - b'a' + 0xa),
        a @ b'A'..=b'F' => Some(a - b'A' + 0xA),
        _ => None,
    }
}
#[inline]
fn encode_nibble(c: u8) -> u8 {
    match c {
        0..=9 => b'0' + c,
        10..=15 => b'a' - 10 + c,
        _ => unreachable!(),
    }
}

pub fn decode_hex(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let pairs = data
        .iter()
        .cloned()
        .take_while(|&b| b != b'>')
        .filter(|&b| !matches!(b, 0 | 9 | 10 | 12 | 13 | 32))
        .tuples();
    for (high, low) in pairs {
        match (decode_nibble(high), decode_nibble(low)) {
            (Some(h), Some(l)) => out.push(h << 4 | l),
            _ => bail!("invalid hex digit pair ({}, {})", high, low),
        }
    }
    Ok(out)
}
pub fn encode_hex(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() * 2 + 1);
    for &b in data {
        buf.push(encode_nibble(b >> 4));
        buf.push(encode_nibble(b & 0xf));
    }
    buf.push(b'>');
    buf
}

#[inline]
fn sym_85(byte: u8) -> Option<u8> {
    match byte {
        b @ 0x21..=0x75 => Some(b - 0x21),
        _ => None,
    }
}
fn word_85([a, b, c, d, e]: [u8; 5]) -> Option<[u8; 4]> {
    fn s(b: u8) -> Option<u32> {
        sym_85(b).map(|n| n as u32)
    }
    let (a, b, c, d, e) = (s(a)?, s(b)?, s(c)?, s(d)?, s(e)?);
    let q = (((a * 85 + b) * 85 + c) * 85 + d) * 85 + e;
    Some(q.to_be_bytes())
}

pub fn decode_85(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((data.len() + 4) / 5 * 4);
    let mut stream = data
        .iter()
        .cloned()
        .filter(|&b| !matches!(b, b' ' | b'\n' | b'\r' | b'\t'));
    let mut symbols = stream.by_ref().take_while(|&b| b != b'~');

    let (tail_len, tail) = loop {
        match symbols.next() {
            Some(b'z') => out.extend_from_slice(&[0; 4]),
            Some(a) => {
                let (b, c, d, e) = match (symbols.next(), symbols.next(), symbols.next(), symbols.next()) {
                    (Some(b), Some(c), Some(d), Some(e)) => (b, c, d, e),
                    (None, _, _, _) => break (1, [a, b'u', b'u', b'u', b'u']),
                    (Some(b), None, _, _) => break (2, [a, b, b'u', b'u', b'u']),
                    (Some(b), Some(c), None, _) => break (3, [a, b, c, b'u', b'u']),
                    (Some(b), Some(c), Some(d), None) => break (4, [a, b, c, d, b'u']),
                };
                out.extend_from_slice(&word_85([a, b, c, d, e]).ok_or_else(|| PdfError::corrupt("bad base85 word"))?);
            }
            None => break (0, [b'u'; 5]),
        }
    };
    if tail_len > 0 {
        let last = word_85(tail).ok_or_else(|| PdfError::corrupt("bad base85 tail"))?;
        out.extend_from_slice(&last[..tail_len - 1]);
    }
    match (stream.next(), stream.next()) {
        (Some(b'>'), None) => Ok(out),
        _ => Err(PdfError::corrupt("ASCII85Decode missing ~> terminator")),
    }
}

#[inline]
fn divmod(n: u32, m: u32) -> (u32, u32) {
    (n / m, n % m)
}
#[inline]
fn a85(n: u32) -> u8 {
    n as u8 + 0x21
}
#[inline]
fn base85_chunk(c: [u8; 4]) -> [u8; 5] {
    let n = u32::from_be_bytes(c);
    let (n, e) = divmod(n, 85);
    let (n, d) = divmod(n, 85);
    let (n, c) = divmod(n, 85);
    let (a, b) = divmod(n, 85);
    [a85(a), a85(b), a85(c), a85(d), a85(e)]
}
pub fn encode_85(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity((data.len() / 4) * 5 + 10);
    let mut chunks = data.chunks_exact(4);
    for chunk in chunks.by_ref() {
        let c: [u8; 4] = chunk.try_into().unwrap();
        if c == [0; 4] {
            buf.push(b'z');
        } else {
            buf.extend_from_slice(&base85_chunk(c));
        }
    }
    let r = chunks.remainder();
    if !r.is_empty() {
        let mut c = [0; 4];
        c[..r.len()].copy_from_slice(r);
        let out = base85_chunk(c);
        buf.extend_from_slice(&out[..r.len() + 1]);
    }
    buf.extend_from_slice(b"~>");
    buf
}

pub fn flate_decode(data: &[u8], params: &FilterParams) -> Result<Vec<u8>> {
    let predictor = params.predictor as usize;
    let n_components = params.n_components.max(1) as usize;
    let columns = params.columns.max(1) as usize;
    let stride = columns * n_components;

    let mut decoded = Vec::new();
    let mut decoder = libflate::zlib::Decoder::new(data)
        .map_err(|e| PdfError::corrupt(format!("zlib header: {}", e)))?;
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| PdfError::corrupt(format!("inflate failed: {}", e)))?;

    match predictor {
        1 | 10 => Ok(decoded),
        12 => {
            let inp = decoded;
            let rows = inp.len() / (stride + 1);
            let mut out = vec![0u8; rows * stride];
            let null_vec = vec![0u8; stride];

            let mut in_off = 0;
            let mut out_off = 0;
            let mut last_out_off = 0;
            while in_off + stride < inp.len() {
                let predictor = PredictorType::from_u8(inp[in_off])?;
                in_off += 1;
                let row_in = &inp[in_off..in_off + stride];
                let (prev_row, row_out) = if out_off == 0 {
                    (&null_vec[..], &mut out[out_off..out_off + stride])
                } else {
                    let (prev, curr) = out.split_at_mut(out_off);
                    (&prev[last_out_off..], &mut curr[..stride])
                };
                unfilter(predictor, n_components, prev_row, row_in, row_out);
                last_out_off = out_off;
                in_off += stride;
                out_off += stride;
            }
            Ok(out)
        }
        other => Err(PdfError::UnsupportedFilter {
            name: "FlateDecode".into(),
            detail: format!("predictor {} not supported", other),
        }),
    }
}

fn flate_encode(data: &[u8]) -> Vec<u8> {
    deflate::deflate_bytes_zlib(data)
}

pub fn lzw_decode(data: &[u8], params: &FilterParams) -> Result<Vec<u8>> {
    use weezl::{decode::Decoder, BitOrder};
    let mut out = vec![];
    let mut decoder = if params.early_change != 0 {
        Decoder::with_tiff_size_switch(BitOrder::Msb, 9)
    } else {
        Decoder::new(BitOrder::Msb, 9)
    };
    decoder
        .into_stream(&mut out)
        .decode_all(data)
        .status
        .map_err(|e| PdfError::corrupt(format!("LZW decode: {:?}", e)))?;
    Ok(out)
}

fn lzw_encode(data: &[u8], params: &FilterParams) -> Result<Vec<u8>> {
    use weezl::{encode::Encoder, BitOrder};
    let mut compressed = vec![];
    let mut encoder = if params.early_change != 0 {
        Encoder::with_tiff_size_switch(BitOrder::Msb, 9)
    } else {
        Encoder::new(BitOrder::Msb, 9)
    };
    encoder
        .into_stream(&mut compressed)
        .encode_all(data)
        .status
        .map_err(|e| PdfError::corrupt(format!("LZW encode: {:?}", e)))?;
    Ok(compressed)
}

pub fn run_length_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let d = data;
    let mut c = 0;
    while c < data.len() {
        let length = d[c];
        if length < 128 {
            let start = c + 1;
            let end = start + length as usize + 1;
            if end > d.len() {
                bail!("RunLengthDecode: literal run exceeds input");
            }
            buf.extend_from_slice(&d[start..end]);
            c = end;
        } else if length >= 129 {
            let copy = 257 - length as usize;
            let b = d[c + 1];
            buf.extend(std::iter::repeat(b).take(copy));
            c += 2;
        } else {
            break;
        }
    }
    Ok(buf)
}

pub fn decode(data: &[u8], filter: &StreamFilter) -> Result<Vec<u8>> {
    match filter {
        StreamFilter::ASCIIHexDecode => decode_hex(data),
        StreamFilter::ASCII85Decode => decode_85(data),
        StreamFilter::LZWDecode(params) => lzw_decode(data, params),
        StreamFilter::FlateDecode(params) => flate_decode(data, params),
        StreamFilter::Unsupported(name) => {
            warn!("unsupported filter {:?}, cannot decode", name);
            Err(PdfError::UnsupportedFilter { name: name.clone(), detail: "decoding this filter is not implemented by the CORE".into() })
        }
    }
}

pub fn encode(data: &[u8], filter: &StreamFilter) -> Result<Vec<u8>> {
    match filter {
        StreamFilter::ASCIIHexDecode => Ok(encode_hex(data)),
        StreamFilter::ASCII85Decode => Ok(encode_85(data)),
        StreamFilter::LZWDecode(params) => lzw_encode(data, params),
        StreamFilter::FlateDecode(_params) => Ok(flate_encode(data)),
        StreamFilter::Unsupported(name) => Err(PdfError::UnsupportedFilter {
            name: name.clone(),
            detail: "encoding this filter is not implemented by the CORE".into(),
        }),
    }
}

/// Build and run the full `/Filter` chain declared on a stream dict,
/// pairing each filter name with its matching `/DecodeParms` entry. A
/// stream's `/Filter` may be a single name or an array of names (applied in
/// order); `/DecodeParms` follows the same shape, one dict per filter.
pub fn decode_stream(dict: &Dictionary, data: &[u8]) -> Result<Vec<u8>> {
    let empty = Dictionary::new();
    let filters: Vec<(String, Dictionary)> = match dict.get("Filter") {
        None => return Ok(data.to_vec()),
        Some(Primitive::Name(n)) => {
            let parms = match dict.get("DecodeParms").or_else(|| dict.get("DP")) {
                Some(Primitive::Dictionary(d)) => d.clone(),
                _ => empty.clone(),
            };
            vec![(n.clone(), parms)]
        }
        Some(Primitive::Array(names)) => {
            let parms_arr = match dict.get("DecodeParms").or_else(|| dict.get("DP")) {
                Some(Primitive::Array(a)) => a.clone(),
                _ => Vec::new(),
            };
            names
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    let name = n.as_name()?.to_string();
                    let parms = match parms_arr.get(i) {
                        Some(Primitive::Dictionary(d)) => d.clone(),
                        _ => empty.clone(),
                    };
                    Ok((name, parms))
                })
                .collect::<Result<_>>()?
        }
        Some(_) => return Err(PdfError::corrupt("unsupported /Filter shape")),
    };
    let mut out = data.to_vec();
    for (name, parms) in &filters {
        let filter = StreamFilter::from_kind_and_params(name, parms)?;
        out = decode(&out, &filter)?;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PredictorType {
    NoFilter = 0,
    Sub = 1,
    Up = 2,
    Avg = 3,
    Paeth = 4,
}
impl PredictorType {
    pub fn from_u8(n: u8) -> Result<PredictorType> {
        match n {
            0 => Ok(PredictorType::NoFilter),
            1 => Ok(PredictorType::Sub),
            2 => Ok(PredictorType::Up),
            3 => Ok(PredictorType::Avg),
            4 => Ok(PredictorType::Paeth),
            n => Err(PdfError::UnsupportedFilter {
                name: "FlateDecode".into(),
                detail: format!("unknown PNG predictor tag {}", n),
            }),
        }
    }
}

fn filter_paeth(a: u8, b: u8, c: u8) -> u8 {
    let ia = a as i16;
    let ib = b as i16;
    let ic = c as i16;
    let p = ia + ib - ic;
    let pa = (p - ia).abs();
    let pb = (p - ib).abs();
    let pc = (p - ic).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

pub fn unfilter(filter: PredictorType, bpp: usize, prev: &[u8], inp: &[u8], out: &mut [u8]) {
    use PredictorType::*;
    let len = inp.len();
    assert_eq!(len, out.len());
    assert_eq!(len, prev.len());
    match filter {
        NoFilter => out[..len].copy_from_slice(&inp[..len]),
        Sub => {
            out[..bpp.min(len)].copy_from_slice(&inp[..bpp.min(len)]);
            for i in bpp..len {
                out[i] = inp[i].wrapping_add(out[i - bpp]);
            }
        }
        Up => {
            for i in 0..len {
                out[i] = inp[i].wrapping_add(prev[i]);
            }
        }
        Avg => {
            for i in 0..bpp.min(len) {
                out[i] = inp[i].wrapping_add(prev[i] / 2);
            }
            for i in bpp..len {
                out[i] = inp[i].wrapping_add(((out[i - bpp] as i16 + prev[i] as i16) / 2) as u8);
            }
        }
        Paeth => {
            for i in 0..bpp.min(len) {
                out[i] = inp[i].wrapping_add(filter_paeth(0, prev[i], 0));
            }
            for i in bpp..len {
                out[i] = inp[i].wrapping_add(filter_paeth(out[i - bpp], prev[i], prev[i - bpp]));
            }
        }
    }
}

/// Forward (encode-direction) predictor, the counterpart of `unfilter`; used
/// when the writer is asked to re-apply a predictor on output (not required
/// by the default write path, which always emits `Predictor=1`, but kept for
/// callers building predictor-encoded streams directly).
#[allow(dead_code)]
pub fn filter(method: PredictorType, bpp: usize, previous: &[u8], current: &mut [u8]) {
    use PredictorType::*;
    let len = current.len();
    match method {
        NoFilter => (),
        Sub => {
            for i in (bpp..len).rev() {
                current[i] = current[i].wrapping_sub(current[i - bpp]);
            }
        }
        Up => {
            for i in 0..len {
                current[i] = current[i].wrapping_sub(previous[i]);
            }
        }
        Avg => {
            for i in (bpp..len).rev() {
                current[i] = current[i].wrapping_sub(current[i - bpp].wrapping_add(previous[i]) / 2);
            }
            for i in 0..bpp.min(len) {
                current[i] = current[i].wrapping_sub(previous[i] / 2);
            }
        }
        Paeth => {
            for i in (bpp..len).rev() {
                current[i] = current[i].wrapping_sub(filter_paeth(current[i - bpp], previous[i], previous[i - bpp]));
            }
            for i in 0..bpp.min(len) {
                current[i] = current[i].wrapping_sub(filter_paeth(0, previous[i], 0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_85_roundtrip() {
        fn s(b: &[u8]) -> &str {
            std::str::from_utf8(b).unwrap()
        }
        let case = &b"hello world!"[..];
        let encoded = encode_85(case);
        assert_eq!(s(&encoded), "BOu!rD]j7BEbo80~>");
        let decoded = decode_85(&encoded).unwrap();
        assert_eq!(case, &*decoded);
    }

    #[test]
    fn run_length_decode_test() {
        let x = run_length_decode(&[254, b'a', 255, b'b', 2, b'c', b'b', b'c', 254, b'a', 128]).unwrap();
        assert_eq!(b"aaabbcbcaaa", x.as_slice());
    }

    #[test]
    fn hex_roundtrip() {
        let data = b"Hello, PDF!";
        let mut encoded = encode_hex(data);
        assert_eq!(encoded.pop(), Some(b'>'));
        let decoded = decode_hex(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn flate_involution_without_predictor() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let encoded = flate_encode(&data);
        let decoded = flate_decode(&encoded, &FilterParams::default()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn lzw_involution_early_change_1() {
        let data = b"aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbccccccccccccccccccccaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let params = FilterParams { early_change: 1, ..FilterParams::default() };
        let encoded = lzw_encode(&data, &params).unwrap();
        let decoded = lzw_decode(&encoded, &params).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn lzw_involution_early_change_0() {
        let data = b"0123456701234567012345670123456701234567".to_vec();
        let params = FilterParams { early_change: 0, ..FilterParams::default() };
        let encoded = lzw_encode(&data, &params).unwrap();
        let decoded = lzw_decode(&encoded, &params).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn lzw_early_change_variants_diverge_at_width_boundary() {
        // Enough distinct short runs to push the code table past the
        // early-change width-transition boundary (511/510 entries).
        let mut data = Vec::new();
        for i in 0..600u32 {
            data.push((i % 251) as u8);
            data.push((i / 251) as u8);
        }
        let params0 = FilterParams { early_change: 0, ..FilterParams::default() };
        let params1 = FilterParams { early_change: 1, ..FilterParams::default() };

        let encoded0 = lzw_encode(&data, &params0).unwrap();
        let encoded1 = lzw_encode(&data, &params1).unwrap();
        assert_ne!(encoded0, encoded1, "EarlyChange 0 and 1 must diverge once the table crosses a width boundary");

        assert_eq!(lzw_decode(&encoded0, &params0).unwrap(), data);
        assert_eq!(lzw_decode(&encoded1, &params1).unwrap(), data);
        // Decoding with the wrong EarlyChange setting must not silently
        // reproduce the original input.
        assert_ne!(lzw_decode(&encoded1, &params0).unwrap_or_default(), data);
    }

    #[test]
    fn png_up_predictor_scenario() {
        // Two rows of 4 bytes; row 0 tag=0 (NoFilter), row 1 tag=2 (Up).
        let row0: [u8; 4] = [1, 2, 3, 4];
        let row1_raw: [u8; 4] = [5, 6, 7, 8];
        let mut raw = Vec::new();
        raw.push(0u8);
        raw.extend_from_slice(&row0);
        raw.push(2u8);
        raw.extend_from_slice(&row1_raw);
        let compressed = deflate::deflate_bytes_zlib(&raw);
        let params = FilterParams { predictor: 12, columns: 4, n_components: 1, bits_per_component: 8, early_change: 1 };
        let decoded = flate_decode(&compressed, &params).unwrap();
        let expected: Vec<u8> = row0
            .iter()
            .chain(row1_raw.iter())
            .enumerate()
            .map(|(i, &b)| if i < 4 { b } else { b.wrapping_add(row0[i - 4]) })
            .collect();
        assert_eq!(decoded, expected);
    }
}
