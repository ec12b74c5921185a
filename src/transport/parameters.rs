//! Transport parameter encoding and decoding (RFC 9000 Section 18).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{ConnectionId, VarIntCodec};

#[derive(Debug, Clone, PartialEq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    /// milliseconds
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// milliseconds
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

impl TransportParameters {
    pub fn encode(&self, buf: &mut BytesMut) {
        fn write_param(buf: &mut BytesMut, id: u64, val: &[u8]) {
            VarIntCodec::encode(id, buf);
            VarIntCodec::encode(val.len() as u64, buf);
            buf.put_slice(val);
        }

        fn write_varint_param(buf: &mut BytesMut, id: u64, val: u64) {
            // defaults are omitted on the wire
            match id {
                0x01 if val == 0 => return,
                0x03 if val == 65527 => return,
                0x04..=0x09 if val == 0 => return,
                0x0a if val == 3 => return,
                0x0b if val == 25 => return,
                0x0e if val == 2 => return,
                _ => {}
            }

            let mut tmp = BytesMut::with_capacity(8);
            VarIntCodec::encode(val, &mut tmp);
            write_param(buf, id, &tmp);
        }

        if let Some(cid) = &self.original_destination_connection_id {
            write_param(buf, 0x00, cid.as_bytes());
        }

        write_varint_param(buf, 0x01, self.max_idle_timeout);

        if let Some(token) = &self.stateless_reset_token {
            write_param(buf, 0x02, token);
        }

        write_varint_param(buf, 0x03, self.max_udp_payload_size);
        write_varint_param(buf, 0x04, self.initial_max_data);
        write_varint_param(buf, 0x05, self.initial_max_stream_data_bidi_local);
        write_varint_param(buf, 0x06, self.initial_max_stream_data_bidi_remote);
        write_varint_param(buf, 0x07, self.initial_max_stream_data_uni);
        write_varint_param(buf, 0x08, self.initial_max_streams_bidi);
        write_varint_param(buf, 0x09, self.initial_max_streams_uni);
        write_varint_param(buf, 0x0a, self.ack_delay_exponent);
        write_varint_param(buf, 0x0b, self.max_ack_delay);

        if self.disable_active_migration {
            write_param(buf, 0x0c, &[]);
        }

        write_varint_param(buf, 0x0e, self.active_connection_id_limit);

        if let Some(cid) = &self.initial_source_connection_id {
            write_param(buf, 0x0f, cid.as_bytes());
        }

        if let Some(cid) = &self.retry_source_connection_id {
            write_param(buf, 0x10, cid.as_bytes());
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let mut params = Self::default();

        while buf.has_remaining() {
            let id =
                VarIntCodec::decode(&mut buf).ok_or(Error::TransportParameterError)?;
            let len =
                VarIntCodec::decode(&mut buf).ok_or(Error::TransportParameterError)?;

            if buf.remaining() < len as usize {
                return Err(Error::TransportParameterError);
            }

            let mut val = buf.split_to(len as usize);

            fn varint(val: &mut Bytes) -> Result<u64> {
                VarIntCodec::decode(val).ok_or(Error::TransportParameterError)
            }

            match id {
                0x00 => {
                    params.original_destination_connection_id = Some(
                        ConnectionId::new(val).ok_or(Error::TransportParameterError)?,
                    )
                }
                0x01 => params.max_idle_timeout = varint(&mut val)?,
                0x02 => {
                    if val.len() != 16 {
                        return Err(Error::TransportParameterError);
                    }
                    let mut token = [0u8; 16];
                    val.copy_to_slice(&mut token);
                    params.stateless_reset_token = Some(token);
                }
                0x03 => params.max_udp_payload_size = varint(&mut val)?,
                0x04 => params.initial_max_data = varint(&mut val)?,
                0x05 => params.initial_max_stream_data_bidi_local = varint(&mut val)?,
                0x06 => params.initial_max_stream_data_bidi_remote = varint(&mut val)?,
                0x07 => params.initial_max_stream_data_uni = varint(&mut val)?,
                0x08 => params.initial_max_streams_bidi = varint(&mut val)?,
                0x09 => params.initial_max_streams_uni = varint(&mut val)?,
                0x0a => params.ack_delay_exponent = varint(&mut val)?,
                0x0b => params.max_ack_delay = varint(&mut val)?,
                0x0c => params.disable_active_migration = true,
                0x0e => params.active_connection_id_limit = varint(&mut val)?,
                0x0f => {
                    params.initial_source_connection_id = Some(
                        ConnectionId::new(val).ok_or(Error::TransportParameterError)?,
                    )
                }
                0x10 => {
                    params.retry_source_connection_id = Some(
                        ConnectionId::new(val).ok_or(Error::TransportParameterError)?,
                    )
                }
                _ => {
                    // unknown parameters are ignored (RFC 9000 7.4.2)
                }
            }
        }

        params.validate()?;

        Ok(params)
    }

    /// Range checks per RFC 9000 Section 18.2.
    pub fn validate(&self) -> Result<()> {
        if self.ack_delay_exponent > 20 {
            return Err(Error::TransportParameterError);
        }

        if self.max_ack_delay >= (1 << 14) {
            return Err(Error::TransportParameterError);
        }

        if self.active_connection_id_limit < 2 {
            return Err(Error::TransportParameterError);
        }

        if self.max_udp_payload_size < 1200 {
            return Err(Error::TransportParameterError);
        }

        Ok(())
    }
}
