use bytes::{Buf, BytesMut};
use serde::Deserialize;
use utils::bin_ser::LeSer;

#[derive(Debug, PartialEq, Eq, Deserialize)]
pub struct HeaderData {
    magic: u16,
    info: u16,
    tli: u32,
    pageaddr: u64,
    rem_len: u32,
}

// A manual implementation using BytesMut, just so we can
// verify that we decode the same way.
pub fn decode_header_data(buf: &mut BytesMut) -> HeaderData {
    HeaderData {
        magic: buf.get_u16_le(),
        info: buf.get_u16_le(),
        tli: buf.get_u32_le(),
        pageaddr: buf.get_u64_le(),
        rem_len: buf.get_u32_le(),
    }
}

#[test]
fn manual_and_serde_decoding_agree() {
    let raw = hex::decode("5ed00500010000000000000001000000f4000000").unwrap();
    let mut buf1 = BytesMut::from(&raw[..]);
    let mut buf2 = &raw[..];
    let dec1 = decode_header_data(&mut buf1);
    let dec2 = HeaderData::des_from(&mut buf2).unwrap();
    assert_eq!(dec1, dec2);
    assert_eq!(buf1, buf2);
    assert_eq!(dec1.magic, 0xD05E);
    assert_eq!(dec1.pageaddr, 0x1_0000_0000);
    assert_eq!(dec1.rem_len, 244);
}
