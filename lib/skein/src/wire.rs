use crate::idgen::IdGenerator;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use keel::crypto;
use keel::encoding::hex;
use keel::time;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::TryFrom;
use std::fmt;
use std::io::Read;
use std::net::SocketAddrV4;

pub use keel::UDP_DATA_MAX_LEN;

/// Length of the `mac` header field: the ascii sha256 hexdigest.
pub const MAC_LEN: usize = 64;

/// Cluster controlling subjects carried by CTRL packets.
pub mod subjects {
    /// A node asks to join the cluster.
    /// Content: `{identification, ip, listen_port}`.
    pub const JOIN_CLUSTER: u32 = 0x01;

    /// A node asks to detach from the cluster.
    /// Content: `{identification}`.
    pub const LEAVE_CLUSTER: u32 = 0x02;

    /// A node asks the controller for the shareable cluster configuration.
    /// Content: `{identification}`.
    pub const READ_CLUSTER_CONFIG: u32 = 0x11;

    /// The controller pushes a membership snapshot to a cluster node.
    /// Content: `{nodes}`. No response is expected.
    pub const CLUSTER_STATUS_PUSHING: u32 = 0xe1;

    /// The packet answers a previously received request.
    /// Content: `{identification, responding_sn, body}`.
    pub const RESPONSE: u32 = 0xff;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PktType {
    Data = 0x01,
    Ctrl = 0x02,
    ConnCtrl = 0x03,
}

#[derive(Debug, Eq, PartialEq)]
pub struct UnknownPktType(pub u8);

impl fmt::Display for UnknownPktType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown packet type byte 0x{:02x}", self.0)
    }
}

impl From<PktType> for u8 {
    #[inline]
    fn from(ptype: PktType) -> u8 {
        ptype as u8
    }
}

impl TryFrom<u8> for PktType {
    type Error = UnknownPktType;

    #[inline]
    fn try_from(byte: u8) -> Result<PktType, UnknownPktType> {
        match byte {
            0x01 => Ok(PktType::Data),
            0x02 => Ok(PktType::Ctrl),
            0x03 => Ok(PktType::ConnCtrl),
            other => Err(UnknownPktType(other)),
        }
    }
}

/// The typed body of a packet. The header `type` byte is derived from the
/// variant, so a packet can never carry a body contradicting its type flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Data(#[serde(with = "keel::encoding::base64")] Vec<u8>),
    Ctrl {
        subject: u32,
        content: Map<String, Value>,
    },
    ConnCtrl {
        iv_changed: u8,
        iv_duration: u64,
        #[serde(with = "keel::encoding::base64")]
        iv: Vec<u8>,
    },
}

impl Body {
    #[inline]
    pub fn ptype(&self) -> PktType {
        match self {
            Body::Data(_) => PktType::Data,
            Body::Ctrl { .. } => PktType::Ctrl,
            Body::ConnCtrl { .. } => PktType::ConnCtrl,
        }
    }
}

/// Parsed (or to-be-wrapped) packet fields. `sn` and `time` are filled by the
/// codec when unset; `salt` and `mac` exist only on the wire and are never
/// part of this structure, which is what makes the fields safe to persist in
/// shared state and re-wrap on retransmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fields {
    pub sn: Option<u64>,
    pub time: Option<u64>,
    pub diverged: Option<u8>,
    pub src: Option<SocketAddrV4>,
    pub dest: Option<SocketAddrV4>,
    pub body: Body,
}

impl Fields {
    #[inline]
    pub fn new(src: SocketAddrV4, dest: SocketAddrV4, body: Body) -> Fields {
        Fields {
            sn: None,
            time: None,
            diverged: None,
            src: Some(src),
            dest: Some(dest),
            body,
        }
    }

    #[inline]
    pub fn ptype(&self) -> PktType {
        self.body.ptype()
    }
}

/// A datagram travelling through the engine, in whichever direction.
///
/// Inbound packets start with `data` (the received bytes) and a
/// `previous_hop`; `unwrap` fills `fields` and `valid`. Outbound packets
/// start with `fields` and a `next_hop`; `wrap` fills `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub valid: Option<bool>,
    pub fields: Option<Fields>,
    pub data: Vec<u8>,
    pub previous_hop: Option<SocketAddrV4>,
    pub next_hop: Option<SocketAddrV4>,
}

impl Packet {
    #[inline]
    pub fn outbound(fields: Fields, next_hop: SocketAddrV4) -> Packet {
        Packet {
            valid: None,
            fields: Some(fields),
            data: Vec::new(),
            previous_hop: None,
            next_hop: Some(next_hop),
        }
    }

    #[inline]
    pub fn inbound(data: Vec<u8>, previous_hop: SocketAddrV4) -> Packet {
        Packet {
            valid: None,
            fields: None,
            data,
            previous_hop: Some(previous_hop),
            next_hop: None,
        }
    }

    /// Serial number of a wrapped or unwrapped packet.
    #[inline]
    pub fn sn(&self) -> Option<u64> {
        self.fields.as_ref().and_then(|fields| fields.sn)
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum WrapError {
    MissingFields,
    MissingField(&'static str),
    BadFieldLength(&'static str),
    Oversize(usize),
}

/// Why an inbound datagram was rejected. The core only logs the reason; the
/// packet itself is just marked invalid and dropped.
#[derive(Debug, Eq, PartialEq)]
pub enum InvalidPkt {
    Truncated,
    UnknownType(u8),
    BadContent,
    MacMismatch,
}

impl From<std::io::Error> for InvalidPkt {
    #[inline]
    fn from(_: std::io::Error) -> InvalidPkt {
        InvalidPkt::Truncated
    }
}

/// Packs packets onto the wire and validates received ones.
///
/// Emission order follows the field plan: the generated fields (salt, sn,
/// time) are settled first, the declared header fields follow in order, the
/// body is appended and the MAC is computed last over the recorded bytes, so
/// nothing is ever packed twice.
pub struct Codec {
    salt_len: usize,
    iv_len: usize,
}

impl Codec {
    pub fn new(salt_len: usize, iv_len: usize) -> Codec {
        if salt_len == 0 || salt_len > 64 {
            panic!("salt_len must be within 1..=64, got {}", salt_len);
        }

        Codec { salt_len, iv_len }
    }

    /// Composes the wire bytes for an outbound packet.
    ///
    /// `sn` and `time` are preserved when already set, which is how a
    /// retransmitted control packet keeps its identity; the salt (and with it
    /// the MAC) is regenerated on every wrap so each transmission is unique
    /// on the wire. When `sn` is unset a serial number is drawn from
    /// `sn_source`; passing `None` then fails.
    pub fn wrap(&self, pkt: &mut Packet, sn_source: Option<&mut IdGenerator>) -> Result<(), WrapError> {
        let fields = pkt.fields.as_mut().ok_or(WrapError::MissingFields)?;

        let src = fields.src.ok_or(WrapError::MissingField("src"))?;
        let dest = fields.dest.ok_or(WrapError::MissingField("dest"))?;
        let diverged = *fields.diverged.get_or_insert(0);

        let sn = match (fields.sn, sn_source) {
            (Some(sn), _) => sn,
            (None, Some(idgen)) => *fields.sn.get_or_insert(idgen.gen()),
            (None, None) => return Err(WrapError::MissingField("sn")),
        };
        let pkt_time = *fields.time.get_or_insert_with(time::timestamp_micros);

        let body = self.emit_body(&fields.body)?;

        let mut buf = Vec::with_capacity(self.salt_len + MAC_LEN + 24 + 2 + body.len());

        buf.resize(self.salt_len, 0);
        crypto::random_bytes(&mut buf[..]);

        // MAC placeholder, filled below once all covered bytes are in place.
        buf.resize(self.salt_len + MAC_LEN, 0);

        buf.write_u64::<LittleEndian>(sn).expect("Error writing sn");
        buf.write_u64::<LittleEndian>(pkt_time).expect("Error writing time");
        buf.write_u8(fields.body.ptype().into()).expect("Error writing type");
        buf.write_u8(diverged).expect("Error writing diverged flag");
        write_sockaddr(&mut buf, &src);
        write_sockaddr(&mut buf, &dest);
        buf.extend_from_slice(&body);

        if buf.len() > UDP_DATA_MAX_LEN {
            return Err(WrapError::Oversize(buf.len()));
        }

        let mac = self.compute_mac(&buf);
        buf[self.salt_len..self.salt_len + MAC_LEN].copy_from_slice(&mac);

        pkt.data = buf;
        Ok(())
    }

    /// Parses and validates a received datagram, marking the packet valid or
    /// invalid. The rejection reason is returned for logging only.
    pub fn unwrap(&self, pkt: &mut Packet) -> Result<(), InvalidPkt> {
        match self.parse(&pkt.data) {
            Ok(fields) => {
                pkt.fields = Some(fields);
                pkt.valid = Some(true);
                Ok(())
            }
            Err(reason) => {
                pkt.fields = None;
                pkt.valid = Some(false);
                Err(reason)
            }
        }
    }

    fn parse(&self, data: &[u8]) -> Result<Fields, InvalidPkt> {
        let fixed = self.salt_len + MAC_LEN;

        if data.len() <= fixed {
            return Err(InvalidPkt::Truncated);
        }

        let mut stream = &data[fixed..];

        let sn = stream.read_u64::<LittleEndian>()?;
        let pkt_time = stream.read_u64::<LittleEndian>()?;
        let type_byte = stream.read_u8()?;
        let ptype = PktType::try_from(type_byte).map_err(|_| InvalidPkt::UnknownType(type_byte))?;
        let diverged = stream.read_u8()?;
        let src = read_sockaddr(&mut stream)?;
        let dest = read_sockaddr(&mut stream)?;

        let body = self.parse_body(ptype, stream)?;

        let mac = self.compute_mac(data);
        if mac[..] != data[self.salt_len..fixed] {
            return Err(InvalidPkt::MacMismatch);
        }

        Ok(Fields {
            sn: Some(sn),
            time: Some(pkt_time),
            diverged: Some(diverged),
            src: Some(src),
            dest: Some(dest),
            body,
        })
    }

    fn emit_body(&self, body: &Body) -> Result<Vec<u8>, WrapError> {
        match body {
            Body::Data(data) => Ok(data.clone()),
            Body::Ctrl { subject, content } => {
                let mut buf = Vec::with_capacity(4 + 64);
                buf.write_u32::<LittleEndian>(*subject).expect("Error writing subject");
                serde_json::to_writer(&mut buf, content).expect("Error encoding content");
                Ok(buf)
            }
            Body::ConnCtrl {
                iv_changed,
                iv_duration,
                iv,
            } => {
                if iv.len() != self.iv_len {
                    return Err(WrapError::BadFieldLength("iv"));
                }

                let mut buf = Vec::with_capacity(9 + iv.len());
                buf.write_u8(*iv_changed).expect("Error writing iv_changed flag");
                buf.write_u64::<LittleEndian>(*iv_duration)
                    .expect("Error writing iv_duration");
                buf.extend_from_slice(iv);
                Ok(buf)
            }
        }
    }

    fn parse_body(&self, ptype: PktType, mut stream: &[u8]) -> Result<Body, InvalidPkt> {
        match ptype {
            PktType::Data => {
                if stream.is_empty() {
                    return Err(InvalidPkt::Truncated);
                }
                Ok(Body::Data(stream.to_vec()))
            }
            PktType::Ctrl => {
                let subject = stream.read_u32::<LittleEndian>()?;
                let content: Map<String, Value> =
                    serde_json::from_slice(stream).map_err(|_| InvalidPkt::BadContent)?;
                Ok(Body::Ctrl { subject, content })
            }
            PktType::ConnCtrl => {
                let iv_changed = stream.read_u8()?;
                let iv_duration = stream.read_u64::<LittleEndian>()?;

                if stream.len() < self.iv_len {
                    return Err(InvalidPkt::Truncated);
                }

                Ok(Body::ConnCtrl {
                    iv_changed,
                    iv_duration,
                    iv: stream[..self.iv_len].to_vec(),
                })
            }
        }
    }

    /// The MAC covers the salt, every header field after the mac region and
    /// the body, exactly as they were packed.
    fn compute_mac(&self, wire: &[u8]) -> [u8; MAC_LEN] {
        let mut state = crypto::Sha256::new();
        state.update(&wire[..self.salt_len]);
        state.update(&wire[self.salt_len + MAC_LEN..]);

        let digest = hex::encode(&state.finalize());

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(digest.as_bytes());
        mac
    }
}

#[inline]
fn write_sockaddr(buf: &mut Vec<u8>, sa: &SocketAddrV4) {
    buf.extend_from_slice(&sa.ip().octets());
    buf.write_u16::<BigEndian>(sa.port()).expect("Error writing port");
}

#[inline]
fn read_sockaddr(stream: &mut &[u8]) -> Result<SocketAddrV4, std::io::Error> {
    let mut octets = [0u8; 4];
    stream.read_exact(&mut octets)?;
    let port = stream.read_u16::<BigEndian>()?;

    Ok(SocketAddrV4::new(octets.into(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn codec() -> Codec {
        Codec::new(8, 10)
    }

    fn idgen() -> IdGenerator {
        IdGenerator::new(1, 1)
    }

    fn ctrl_content() -> Map<String, Value> {
        let mut content = Map::new();
        content.insert("identification".into(), json!("node-a"));
        content.insert("responding_sn".into(), json!(42));
        content
    }

    fn wrap_fresh(fields: Fields) -> Packet {
        let next_hop = fields.dest.unwrap();
        let mut pkt = Packet::outbound(fields, next_hop);
        codec().wrap(&mut pkt, Some(&mut idgen())).unwrap();
        pkt
    }

    #[test]
    fn test_conn_ctrl_roundtrip() {
        let fields = Fields::new(
            addr(65535),
            addr(65535),
            Body::ConnCtrl {
                iv_changed: 0x01,
                iv_duration: 10000,
                iv: b"iviviviviv".to_vec(),
            },
        );

        let sent = wrap_fresh(fields);

        let mut received = Packet::inbound(sent.data.clone(), addr(4000));
        codec().unwrap(&mut received).unwrap();

        assert_eq!(received.valid, Some(true));
        let fields = received.fields.unwrap();
        assert_eq!(fields.ptype(), PktType::ConnCtrl);
        assert_eq!(fields.src, Some(addr(65535)));
        assert_eq!(fields.dest, Some(addr(65535)));
        assert_eq!(
            fields.body,
            Body::ConnCtrl {
                iv_changed: 0x01,
                iv_duration: 10000,
                iv: b"iviviviviv".to_vec(),
            }
        );
    }

    #[test]
    fn test_data_roundtrip() {
        let payload: Vec<u8> = (0..999).map(|unit| unit as u8).collect();
        let sent = wrap_fresh(Fields::new(addr(1), addr(2), Body::Data(payload.clone())));

        let mut received = Packet::inbound(sent.data.clone(), addr(1));
        codec().unwrap(&mut received).unwrap();

        let fields = received.fields.unwrap();
        assert_eq!(fields.body, Body::Data(payload));
        assert_eq!(fields.sn, sent.sn());
        assert_eq!(fields.diverged, Some(0));
    }

    #[test]
    fn test_ctrl_roundtrip() {
        let sent = wrap_fresh(Fields::new(
            addr(1),
            addr(2),
            Body::Ctrl {
                subject: subjects::RESPONSE,
                content: ctrl_content(),
            },
        ));

        let mut received = Packet::inbound(sent.data.clone(), addr(1));
        codec().unwrap(&mut received).unwrap();

        match received.fields.unwrap().body {
            Body::Ctrl { subject, content } => {
                assert_eq!(subject, subjects::RESPONSE);
                assert_eq!(content, ctrl_content());
            }
            body => panic!("Unexpected body {:?}", body),
        }
    }

    #[test]
    fn test_rewrap_regenerates_salt_only() {
        let fields = Fields::new(addr(1), addr(2), Body::Data(vec![1, 2, 3]));
        let mut pkt = Packet::outbound(fields, addr(2));

        let codec = codec();
        codec.wrap(&mut pkt, Some(&mut idgen())).unwrap();
        let first = pkt.data.clone();
        let first_sn = pkt.sn().unwrap();

        codec.wrap(&mut pkt, None).unwrap();

        // Same identity, different wire bytes.
        assert_eq!(pkt.sn().unwrap(), first_sn);
        assert_ne!(pkt.data, first);
        assert_ne!(&pkt.data[..8], &first[..8]);
        assert_ne!(&pkt.data[8..72], &first[8..72]);
        assert_eq!(&pkt.data[72..], &first[72..]);
    }

    #[test]
    fn test_wrap_requires_sn_source_for_fresh_packets() {
        let fields = Fields::new(addr(1), addr(2), Body::Data(vec![1]));
        let mut pkt = Packet::outbound(fields, addr(2));

        let result = codec().wrap(&mut pkt, None);

        assert_eq!(result.unwrap_err(), WrapError::MissingField("sn"));
    }

    #[test]
    fn test_wrap_missing_dest() {
        let mut fields = Fields::new(addr(1), addr(2), Body::Data(vec![1]));
        fields.dest = None;
        let mut pkt = Packet::outbound(fields, addr(2));

        let result = codec().wrap(&mut pkt, Some(&mut idgen()));

        assert_eq!(result.unwrap_err(), WrapError::MissingField("dest"));
    }

    #[test]
    fn test_wrap_rejects_wrong_iv_length() {
        let fields = Fields::new(
            addr(1),
            addr(2),
            Body::ConnCtrl {
                iv_changed: 1,
                iv_duration: 100,
                iv: vec![0; 4],
            },
        );
        let mut pkt = Packet::outbound(fields, addr(2));

        let result = codec().wrap(&mut pkt, Some(&mut idgen()));

        assert_eq!(result.unwrap_err(), WrapError::BadFieldLength("iv"));
    }

    #[test]
    fn test_wrap_rejects_oversize_body() {
        let fields = Fields::new(addr(1), addr(2), Body::Data(vec![0; UDP_DATA_MAX_LEN]));
        let mut pkt = Packet::outbound(fields, addr(2));

        match codec().wrap(&mut pkt, Some(&mut idgen())) {
            Err(WrapError::Oversize(_)) => (),
            result => panic!("Unexpected result {:?}", result),
        }
    }

    #[test]
    fn test_unwrap_truncated() {
        let mut pkt = Packet::inbound(vec![0; 40], addr(1));

        let result = codec().unwrap(&mut pkt);

        assert_eq!(result.unwrap_err(), InvalidPkt::Truncated);
        assert_eq!(pkt.valid, Some(false));
        assert!(pkt.fields.is_none());
    }

    #[test]
    fn test_unwrap_unknown_type() {
        let mut pkt = wrap_fresh(Fields::new(addr(1), addr(2), Body::Data(vec![1, 2, 3])));

        // The type byte sits right after salt, mac, sn and time.
        pkt.data[8 + 64 + 16] = 0x7f;

        let mut received = Packet::inbound(pkt.data, addr(1));
        let result = codec().unwrap(&mut received);

        assert_eq!(result.unwrap_err(), InvalidPkt::UnknownType(0x7f));
        assert_eq!(received.valid, Some(false));
    }

    #[test]
    fn test_unwrap_mac_mismatch() {
        let mut pkt = wrap_fresh(Fields::new(addr(1), addr(2), Body::Data(vec![1, 2, 3])));

        let tampered = pkt.data.len() - 1;
        pkt.data[tampered] ^= 0x01;

        let mut received = Packet::inbound(pkt.data, addr(1));
        let result = codec().unwrap(&mut received);

        assert_eq!(result.unwrap_err(), InvalidPkt::MacMismatch);
    }

    #[test]
    fn test_unwrap_ctrl_content_must_be_json_object() {
        let mut pkt = wrap_fresh(Fields::new(
            addr(1),
            addr(2),
            Body::Ctrl {
                subject: subjects::JOIN_CLUSTER,
                content: Map::new(),
            },
        ));

        // Truncate away part of the JSON object, leaving the header intact.
        let cut = pkt.data.len() - 1;
        pkt.data.truncate(cut);

        let mut received = Packet::inbound(pkt.data, addr(1));
        let result = codec().unwrap(&mut received);

        assert_eq!(result.unwrap_err(), InvalidPkt::BadContent);
    }

    #[test]
    fn test_fields_survive_json_persistence() {
        let mut fields = Fields::new(
            addr(9000),
            addr(9001),
            Body::ConnCtrl {
                iv_changed: 1,
                iv_duration: 4242,
                iv: vec![0xab; 10],
            },
        );
        fields.sn = Some(77);
        fields.time = Some(123_456_789);

        let encoded = serde_json::to_string(&fields).unwrap();
        let decoded: Fields = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, fields);
    }

    #[test]
    #[should_panic(expected = "salt_len must be within 1..=64")]
    fn test_codec_rejects_zero_salt() {
        let _ = Codec::new(0, 12);
    }
}
