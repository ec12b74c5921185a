//! The per-connection stream table and stream-id accounting
//! (RFC 9000 Section 2.1).

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::flow_control::ConnectionFlow;
use crate::transport::TransportParameters;
use crate::types::{
    stream_index, stream_is_server_initiated, stream_is_unidirectional, StreamId,
    STREAM_BUFSIZE, STREAM_SERVER_INITIATED, STREAM_UNIDIRECTIONAL,
};

use super::stream::Stream;

/// Result of admitting a peer-referenced stream id.
#[derive(Debug)]
pub enum OpenOutcome {
    /// The id belongs to a stream that was already closed and reaped.
    Gone,

    /// Streams created: implicitly-opened lower ids of the same type in
    /// order, the target id last.
    Opened(Vec<StreamId>),

    /// The stream already exists.
    Existing,
}

pub struct Streams {
    map: BTreeMap<StreamId, Stream>,

    /// Next expected index per type; ids below these were opened (and
    /// possibly reaped) before.
    pub client_streams_bidi: u64,
    pub client_streams_uni: u64,
    pub server_streams_bidi: u64,
    pub server_streams_uni: u64,

    /// Stream-count limits we advertise to the client; bumped as its
    /// streams are reaped.
    pub client_max_streams_bidi: u64,
    pub client_max_streams_uni: u64,

    /// Peer-granted limits for streams we open.
    pub server_max_streams_bidi: u64,
    pub server_max_streams_uni: u64,

    pub flow: ConnectionFlow,

    /// Our transport parameters: receive-buffer sizing.
    local_tp: TransportParameters,

    /// Peer transport parameters: initial send windows.
    peer_tp: TransportParameters,
}

impl Streams {
    pub fn new(local_tp: &TransportParameters) -> Self {
        Self {
            map: BTreeMap::new(),
            client_streams_bidi: 0,
            client_streams_uni: 0,
            server_streams_bidi: 0,
            server_streams_uni: 0,
            client_max_streams_bidi: local_tp.initial_max_streams_bidi,
            client_max_streams_uni: local_tp.initial_max_streams_uni,
            server_max_streams_bidi: 0,
            server_max_streams_uni: 0,
            flow: ConnectionFlow::new(local_tp.initial_max_data),
            local_tp: local_tp.clone(),
            peer_tp: TransportParameters::default(),
        }
    }

    /// Record the peer's transport parameters once the handshake has
    /// carried them.
    pub fn apply_peer_params(&mut self, peer_tp: &TransportParameters) {
        self.server_max_streams_bidi = peer_tp.initial_max_streams_bidi;
        self.server_max_streams_uni = peer_tp.initial_max_streams_uni;
        if self.flow.send_max_data == 0 {
            self.flow.send_max_data = peer_tp.initial_max_data;
        }
        self.peer_tp = peer_tp.clone();
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        self.map.remove(&id)
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.map.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.map.values_mut()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Admit a client-referenced stream id, creating it and any
    /// not-yet-opened lower streams of the same type
    /// (RFC 9000 Section 2.1: out-of-order use opens all lower ids).
    pub fn create_peer_stream(&mut self, id: StreamId) -> Result<OpenOutcome> {
        if self.map.contains_key(&id) {
            return Ok(OpenOutcome::Existing);
        }

        let uni = stream_is_unidirectional(id);
        let index = stream_index(id);

        if stream_is_server_initiated(id) {
            let next = if uni {
                self.server_streams_uni
            } else {
                self.server_streams_bidi
            };
            if index < next {
                return Ok(OpenOutcome::Gone);
            }
            return Err(Error::StreamStateError);
        }

        let (next, limit) = if uni {
            (self.client_streams_uni, self.client_max_streams_uni)
        } else {
            (self.client_streams_bidi, self.client_max_streams_bidi)
        };

        if index < next {
            return Ok(OpenOutcome::Gone);
        }
        if index >= limit {
            return Err(Error::StreamLimitError);
        }

        let rcvbuf = if uni {
            self.local_tp.initial_max_stream_data_uni
        } else {
            self.local_tp.initial_max_stream_data_bidi_remote
        };
        let rcvbuf = (rcvbuf as usize).max(STREAM_BUFSIZE);

        let type_bits = id & 0x03;
        let mut opened = Vec::with_capacity((index - next + 1) as usize);
        for idx in next..=index {
            let new_id = (idx << 2) | type_bits;
            let send_max = self.initial_send_window(new_id);
            self.map.insert(new_id, Stream::new(new_id, rcvbuf, send_max));
            opened.push(new_id);
        }

        if uni {
            self.client_streams_uni = index + 1;
        } else {
            self.client_streams_bidi = index + 1;
        }

        Ok(OpenOutcome::Opened(opened))
    }

    /// Open a server-initiated stream, or `None` at the peer's limit.
    pub fn open_stream(&mut self, bidi: bool) -> Option<StreamId> {
        if bidi {
            if self.server_streams_bidi >= self.server_max_streams_bidi {
                return None;
            }

            let id = (self.server_streams_bidi << 2) | STREAM_SERVER_INITIATED;
            self.server_streams_bidi += 1;

            let rcvbuf =
                (self.local_tp.initial_max_stream_data_bidi_local as usize).max(STREAM_BUFSIZE);
            let send_max = self.initial_send_window(id);
            self.map.insert(id, Stream::new(id, rcvbuf, send_max));
            Some(id)
        } else {
            if self.server_streams_uni >= self.server_max_streams_uni {
                return None;
            }

            let id = (self.server_streams_uni << 2)
                | STREAM_SERVER_INITIATED
                | STREAM_UNIDIRECTIONAL;
            self.server_streams_uni += 1;

            // nothing is received on a server unidirectional stream
            let send_max = self.initial_send_window(id);
            self.map.insert(id, Stream::new(id, 0, send_max));
            Some(id)
        }
    }

    /// Initial send window for a stream, from the peer's transport
    /// parameters (RFC 9000 Section 18.2 locality rules).
    fn initial_send_window(&self, id: StreamId) -> u64 {
        if stream_is_unidirectional(id) {
            if stream_is_server_initiated(id) {
                self.peer_tp.initial_max_stream_data_uni
            } else {
                // client uni streams have no server send direction
                0
            }
        } else if stream_is_server_initiated(id) {
            self.peer_tp.initial_max_stream_data_bidi_remote
        } else {
            self.peer_tp.initial_max_stream_data_bidi_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 65536,
            initial_max_stream_data_bidi_remote: 65536,
            initial_max_stream_data_uni: 65536,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 4,
            ..TransportParameters::default()
        }
    }

    #[test]
    fn test_gap_opens_lower_streams() {
        let mut streams = Streams::new(&tp());

        // opening bidi stream 8 (index 2) opens 0 and 4 first
        match streams.create_peer_stream(8).unwrap() {
            OpenOutcome::Opened(ids) => assert_eq!(ids, vec![0, 4, 8]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(streams.client_streams_bidi, 3);
        assert!(streams.get(0).is_some());
        assert!(streams.get(4).is_some());
    }

    #[test]
    fn test_reaped_stream_is_gone() {
        let mut streams = Streams::new(&tp());
        streams.create_peer_stream(4).unwrap();
        streams.remove(0);

        assert!(matches!(
            streams.create_peer_stream(0).unwrap(),
            OpenOutcome::Gone
        ));
    }

    #[test]
    fn test_server_initiated_id_from_peer_rejected() {
        let mut streams = Streams::new(&tp());
        assert!(matches!(
            streams.create_peer_stream(0x01),
            Err(Error::StreamStateError)
        ));
        assert!(matches!(
            streams.create_peer_stream(0x03),
            Err(Error::StreamStateError)
        ));
    }

    #[test]
    fn test_stream_limit_enforced() {
        let mut streams = Streams::new(&tp());
        // limit is 4 uni streams: index 4 (id 0x12) exceeds
        assert!(matches!(
            streams.create_peer_stream((4 << 2) | 0x02),
            Err(Error::StreamLimitError)
        ));
        assert!(streams.create_peer_stream((3 << 2) | 0x02).is_ok());
    }

    #[test]
    fn test_open_server_streams_until_limit() {
        let mut streams = Streams::new(&tp());
        let mut peer = TransportParameters::default();
        peer.initial_max_streams_bidi = 2;
        peer.initial_max_stream_data_bidi_remote = 1000;
        streams.apply_peer_params(&peer);

        let id0 = streams.open_stream(true).unwrap();
        let id1 = streams.open_stream(true).unwrap();
        assert_eq!(id0, 0x01);
        assert_eq!(id1, 0x05);
        assert!(streams.open_stream(true).is_none());

        // peer window applied to the new stream
        assert_eq!(streams.get(id0).unwrap().send_max_data, 1000);

        // no uni streams granted
        assert!(streams.open_stream(false).is_none());
    }

    #[test]
    fn test_existing_stream() {
        let mut streams = Streams::new(&tp());
        streams.create_peer_stream(0).unwrap();
        assert!(matches!(
            streams.create_peer_stream(0).unwrap(),
            OpenOutcome::Existing
        ));
    }
}
