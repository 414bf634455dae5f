//! Incremental MQTT 3.1.1 wire codec.
//!
//! `decode` consumes exactly one packet from the front of the buffer and
//! returns `Ok(None)` when the buffer does not yet hold a complete packet;
//! callers fetch more bytes and retry. Malformed input is a
//! [`ProtocolError::Violation`] and is fatal for the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, Qos, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, Will,
};

/// Largest value the four-byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol violation: {0}")]
    Violation(String),
}

fn violation<T>(msg: impl Into<String>) -> Result<T, ProtocolError> {
    Err(ProtocolError::Violation(msg.into()))
}

/// Decode one packet from the front of `buf`, or report that more bytes
/// are needed. On success the packet's bytes (and only those) have been
/// consumed from `buf`.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[0];

    let mut remaining = 0usize;
    let mut header_len = 1usize;
    let mut shift = 0u32;
    loop {
        if header_len >= buf.len() {
            return Ok(None);
        }
        let byte = buf[header_len];
        remaining |= ((byte & 0x7F) as usize) << shift;
        header_len += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return violation("remaining length exceeds four bytes");
        }
    }
    if buf.len() < header_len + remaining {
        return Ok(None);
    }
    buf.advance(header_len);
    let body = buf.split_to(remaining).freeze();

    let packet_type = first >> 4;
    let flags = first & 0x0F;
    match packet_type {
        1 => decode_connect(flags, body).map(Some),
        2 => decode_connack(flags, body).map(Some),
        3 => decode_publish(flags, body).map(Some),
        4 => Ok(Some(Packet::PubAck(decode_ack(flags, 0x00, body)?))),
        5 => Ok(Some(Packet::PubRec(decode_ack(flags, 0x00, body)?))),
        6 => Ok(Some(Packet::PubRel(decode_ack(flags, 0x02, body)?))),
        7 => Ok(Some(Packet::PubComp(decode_ack(flags, 0x00, body)?))),
        8 => decode_subscribe(flags, body).map(Some),
        9 => decode_suback(flags, body).map(Some),
        10 => decode_unsubscribe(flags, body).map(Some),
        11 => Ok(Some(Packet::UnsubAck(decode_ack(flags, 0x00, body)?))),
        12 => decode_empty(flags, body, Packet::PingReq).map(Some),
        13 => decode_empty(flags, body, Packet::PingResp).map(Some),
        14 => decode_empty(flags, body, Packet::Disconnect).map(Some),
        other => violation(format!("unknown packet type {other}")),
    }
}

fn decode_connect(flags: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    if flags != 0 {
        return violation("non-zero CONNECT flags");
    }
    let protocol_name = take_string(&mut body)?;
    let protocol_level = take_u8(&mut body)?;
    let connect_flags = take_u8(&mut body)?;
    if connect_flags & 0x01 != 0 {
        return violation("reserved connect flag set");
    }
    let keep_alive = take_u16(&mut body)?;
    let client_id = take_string(&mut body)?;

    let will = if connect_flags & 0x04 != 0 {
        let qos = Qos::from_bits((connect_flags >> 3) & 0x03)
            .ok_or_else(|| ProtocolError::Violation("invalid will QoS".into()))?;
        let topic = take_string(&mut body)?;
        let payload = take_binary(&mut body)?;
        Some(Will {
            topic,
            payload,
            qos,
            retain: connect_flags & 0x20 != 0,
        })
    } else {
        if connect_flags & 0x38 != 0 {
            return violation("will QoS or retain set without will flag");
        }
        None
    };

    let username_flag = connect_flags & 0x80 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    if password_flag && !username_flag {
        return violation("password flag without username flag");
    }
    let username = username_flag.then(|| take_string(&mut body)).transpose()?;
    let password = password_flag
        .then(|| take_binary(&mut body))
        .transpose()?
        .map(|bytes| bytes.to_vec());
    if !body.is_empty() {
        return violation("trailing bytes after CONNECT payload");
    }

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_level,
        client_id,
        clean_session: connect_flags & 0x02 != 0,
        keep_alive,
        will,
        username,
        password,
    }))
}

fn decode_connack(flags: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    if flags != 0 {
        return violation("non-zero CONNACK flags");
    }
    let ack_flags = take_u8(&mut body)?;
    if ack_flags & 0xFE != 0 {
        return violation("reserved CONNACK flags set");
    }
    let code = take_u8(&mut body)?;
    let code = ConnectReturnCode::from_bits(code)
        .ok_or_else(|| ProtocolError::Violation(format!("unknown CONNACK code {code}")))?;
    if !body.is_empty() {
        return violation("oversized CONNACK");
    }
    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(flags: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    let qos = Qos::from_bits((flags >> 1) & 0x03)
        .ok_or_else(|| ProtocolError::Violation("invalid PUBLISH QoS".into()))?;
    if qos == Qos::AtMostOnce && dup {
        return violation("dup flag on QoS 0 publish");
    }
    let topic = take_string(&mut body)?;
    let packet_id = match qos {
        Qos::AtMostOnce => None,
        _ => {
            let id = take_u16(&mut body)?;
            if id == 0 {
                return violation("zero packet id");
            }
            Some(id)
        }
    };
    Ok(Packet::Publish(Publish {
        topic,
        payload: body,
        qos,
        packet_id,
        dup,
        retain,
    }))
}

fn decode_ack(flags: u8, expected_flags: u8, mut body: Bytes) -> Result<u16, ProtocolError> {
    if flags != expected_flags {
        return violation("unexpected fixed-header flags");
    }
    let id = take_u16(&mut body)?;
    if !body.is_empty() {
        return violation("oversized acknowledgement packet");
    }
    Ok(id)
}

fn decode_subscribe(flags: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    if flags != 0x02 {
        return violation("SUBSCRIBE flags must be 0b0010");
    }
    let packet_id = take_u16(&mut body)?;
    let mut filters = Vec::new();
    while !body.is_empty() {
        let filter = take_string(&mut body)?;
        let opts = take_u8(&mut body)?;
        if opts & 0xFC != 0 {
            return violation("reserved subscription option bits set");
        }
        let qos = Qos::from_bits(opts & 0x03)
            .ok_or_else(|| ProtocolError::Violation("invalid subscription QoS".into()))?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return violation("SUBSCRIBE with no filters");
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(flags: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    if flags != 0 {
        return violation("non-zero SUBACK flags");
    }
    let packet_id = take_u16(&mut body)?;
    let mut codes = Vec::new();
    while !body.is_empty() {
        let byte = take_u8(&mut body)?;
        let code = match byte {
            0x80 => SubscribeReturnCode::Failure,
            bits => SubscribeReturnCode::Granted(Qos::from_bits(bits).ok_or_else(|| {
                ProtocolError::Violation(format!("unknown SUBACK return code {bits:#04x}"))
            })?),
        };
        codes.push(code);
    }
    if codes.is_empty() {
        return violation("SUBACK with no return codes");
    }
    Ok(Packet::SubAck(SubAck { packet_id, codes }))
}

fn decode_unsubscribe(flags: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    if flags != 0x02 {
        return violation("UNSUBSCRIBE flags must be 0b0010");
    }
    let packet_id = take_u16(&mut body)?;
    let mut filters = Vec::new();
    while !body.is_empty() {
        filters.push(take_string(&mut body)?);
    }
    if filters.is_empty() {
        return violation("UNSUBSCRIBE with no filters");
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

fn decode_empty(flags: u8, body: Bytes, packet: Packet) -> Result<Packet, ProtocolError> {
    if flags != 0 {
        return violation("unexpected fixed-header flags");
    }
    if !body.is_empty() {
        return violation("unexpected payload");
    }
    Ok(packet)
}

/// Serialize a packet onto `out`. Fails only when a field exceeds its wire
/// bounds (string over 64 KiB, body over the remaining-length maximum).
pub fn encode(packet: &Packet, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut body = BytesMut::new();
    let first = match packet {
        Packet::Connect(connect) => {
            put_string(&mut body, &connect.protocol_name)?;
            body.put_u8(connect.protocol_level);
            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if let Some(will) = &connect.will {
                flags |= 0x04 | (will.qos.bits() << 3);
                if will.retain {
                    flags |= 0x20;
                }
            }
            if connect.username.is_some() {
                flags |= 0x80;
            }
            if connect.password.is_some() {
                flags |= 0x40;
            }
            body.put_u8(flags);
            body.put_u16(connect.keep_alive);
            put_string(&mut body, &connect.client_id)?;
            if let Some(will) = &connect.will {
                put_string(&mut body, &will.topic)?;
                put_binary(&mut body, &will.payload)?;
            }
            if let Some(username) = &connect.username {
                put_string(&mut body, username)?;
            }
            if let Some(password) = &connect.password {
                put_binary(&mut body, password)?;
            }
            0x10
        }
        Packet::ConnAck(connack) => {
            body.put_u8(u8::from(connack.session_present));
            body.put_u8(connack.code.bits());
            0x20
        }
        Packet::Publish(publish) => {
            put_string(&mut body, &publish.topic)?;
            if publish.qos != Qos::AtMostOnce {
                let id = publish.packet_id.ok_or_else(|| {
                    ProtocolError::Violation("packet id required above QoS 0".into())
                })?;
                body.put_u16(id);
            }
            body.extend_from_slice(&publish.payload);
            let mut first = 0x30 | (publish.qos.bits() << 1);
            if publish.dup {
                first |= 0x08;
            }
            if publish.retain {
                first |= 0x01;
            }
            first
        }
        Packet::PubAck(id) => {
            body.put_u16(*id);
            0x40
        }
        Packet::PubRec(id) => {
            body.put_u16(*id);
            0x50
        }
        Packet::PubRel(id) => {
            body.put_u16(*id);
            0x62
        }
        Packet::PubComp(id) => {
            body.put_u16(*id);
            0x70
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for (filter, qos) in &subscribe.filters {
                put_string(&mut body, filter)?;
                body.put_u8(qos.bits());
            }
            0x82
        }
        Packet::SubAck(suback) => {
            body.put_u16(suback.packet_id);
            for code in &suback.codes {
                body.put_u8(code.bits());
            }
            0x90
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter)?;
            }
            0xA2
        }
        Packet::UnsubAck(id) => {
            body.put_u16(*id);
            0xB0
        }
        Packet::PingReq => 0xC0,
        Packet::PingResp => 0xD0,
        Packet::Disconnect => 0xE0,
    };
    if body.len() > MAX_REMAINING_LENGTH {
        return violation("packet exceeds maximum remaining length");
    }
    out.put_u8(first);
    put_remaining_length(out, body.len());
    out.extend_from_slice(&body);
    Ok(())
}

fn put_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_string(out: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    if s.len() > usize::from(u16::MAX) {
        return violation("string exceeds 65535 bytes");
    }
    out.put_u16(s.len() as u16);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_binary(out: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > usize::from(u16::MAX) {
        return violation("binary field exceeds 65535 bytes");
    }
    out.put_u16(data.len() as u16);
    out.extend_from_slice(data);
    Ok(())
}

fn take_u8(body: &mut Bytes) -> Result<u8, ProtocolError> {
    if body.is_empty() {
        return violation("truncated packet");
    }
    Ok(body.get_u8())
}

fn take_u16(body: &mut Bytes) -> Result<u16, ProtocolError> {
    if body.len() < 2 {
        return violation("truncated packet");
    }
    Ok(body.get_u16())
}

fn take_string(body: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = take_binary(body)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::Violation("invalid utf-8 in string field".into()))
}

fn take_binary(body: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = usize::from(take_u16(body)?);
    if body.len() < len {
        return violation("truncated packet");
    }
    Ok(body.split_to(len))
}
