use bytes::{Buf, Bytes, BytesMut};
use octets::Octets;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::message::{ZapiHeader, HEADER_MARKER};

/// One decoded message: parsed header plus the raw body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: ZapiHeader,
    pub body: Bytes,
}

/// Framing codec for the protocol stream. The version is sniffed from the
/// first message's header and pinned for the rest of the connection.
#[derive(Debug, Default)]
pub struct ZapiCodec {
    version: Option<u8>,
    force_vrf: Option<u16>,
}

impl ZapiCodec {
    pub fn new(force_vrf: Option<u16>) -> ZapiCodec {
        ZapiCodec {
            version: None,
            force_vrf,
        }
    }

    pub fn version(&self) -> Option<u8> {
        self.version
    }
}

impl Decoder for ZapiCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // Marker and version sit in the first four octets regardless of
        // header size.
        if src.len() < 4 {
            return Ok(None);
        }
        if src[2] != HEADER_MARKER {
            return Err(Error::BadMarker(src[2]));
        }
        let version = match src[3] {
            v @ (2 | 3) => v,
            other => return Err(Error::BadVersion(other)),
        };
        let hlen = ZapiHeader::size(version);
        if src.len() < hlen {
            return Ok(None);
        }

        let mut header = {
            let mut buf = Octets::with_slice(&src[..hlen]);
            ZapiHeader::decode(&mut buf)?
        };
        let total = header.length as usize;
        if total < hlen {
            return Err(Error::BadLength(header.length));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        self.version.get_or_insert(version);
        if let Some(vrf_id) = self.force_vrf {
            header.vrf_id = vrf_id;
        }

        let mut msg = src.split_to(total);
        msg.advance(hlen);
        Ok(Some(Frame {
            header,
            body: msg.freeze(),
        }))
    }
}

impl Encoder<Bytes> for ZapiCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
